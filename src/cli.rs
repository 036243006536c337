use clap::{Parser, Subcommand};

#[derive(Debug, Parser, Clone)]
#[clap(author, version, about, long_about = None)]
pub struct CLI {
    #[command(subcommand)]
    pub(crate) command: KnotCommand,
}

#[derive(Debug, Subcommand, Clone, PartialEq)]
pub enum KnotCommand {
    /// Download and install a Node.js runtime under an alias
    Install {
        /// Version spec: `20.12.2`, `20`, `lts`, `lts/iron`, `latest`
        spec: String,
        /// Alias to register the installation under; defaults to the spec
        #[clap(long)]
        alias: Option<String>,
        /// Overwrite an installation already registered under this alias
        #[clap(long)]
        force: bool,
        /// Make the new installation active right away
        #[clap(long = "use")]
        activate: bool,
        /// Seconds to wait for a lock held by another knot process
        #[clap(long, default_value_t = 30)]
        wait: u64,
    },
    /// Make an installed alias the active runtime
    Use {
        /// Alias to activate; defaults to the project's version pin
        alias: Option<String>,
        /// Seconds to wait for a lock held by another knot process
        #[clap(long, default_value_t = 30)]
        wait: u64,
    },
    /// Remove an installation: its directory, registry row and proxies
    Remove {
        alias: String,
        /// Seconds to wait for a lock held by another knot process
        #[clap(long, default_value_t = 30)]
        wait: u64,
    },
    /// List installed runtimes
    List,
    /// List versions available for download
    ListRemote {
        /// Only LTS releases
        #[clap(long)]
        lts: bool,
        /// Show at most this many entries
        #[clap(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show the active runtime, and any project pin for the current directory
    Current,
    /// Reconcile global packages with the globals.toml manifest
    Sync,
    /// Remove cached downloads
    Clean,
    /// Run a command from the active installation (used by the proxies)
    #[clap(hide = true)]
    Run {
        command: String,
        #[clap(last = true)]
        args: Vec<String>,
    },
}
