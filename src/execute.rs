use crate::cli::{KnotCommand, CLI};
use colored::Colorize;
use knotvm::cancel::CancelFlag;
use knotvm::catalog::CatalogClient;
use knotvm::download::DownloadProgress;
use knotvm::error::Result;
use knotvm::pipeline::{self, InstallOptions};
use knotvm::platform::Platform;
use knotvm::registry::Registry;
use knotvm::resolver::VersionSpec;
use knotvm::{cache, paths, project, proxy, sync, KnotPaths};
use std::io::Write;
use std::time::Duration;

/// Dispatch a parsed command line. Returns the process exit code; proxied
/// `run` invocations pass their child's code through verbatim.
pub fn execute(cli: CLI, cancel: &CancelFlag) -> Result<i32> {
    let paths = KnotPaths::resolve()?;
    match cli.command {
        KnotCommand::Install {
            spec,
            alias,
            force,
            activate,
            wait,
        } => execute_install(&paths, &spec, alias, force, activate, wait, cancel),
        KnotCommand::Use { alias, wait } => execute_use(&paths, alias, wait),
        KnotCommand::Remove { alias, wait } => execute_remove(&paths, &alias, wait),
        KnotCommand::List => execute_list(&paths),
        KnotCommand::ListRemote { lts, limit } => execute_list_remote(&paths, lts, limit),
        KnotCommand::Current => execute_current(&paths),
        KnotCommand::Sync => execute_sync(&paths),
        KnotCommand::Clean => execute_clean(&paths),
        KnotCommand::Run { command, args } => proxy::run_proxied(&paths, &command, &args),
    }
}

fn execute_install(
    paths: &KnotPaths,
    spec: &str,
    alias: Option<String>,
    force: bool,
    activate: bool,
    wait: u64,
    cancel: &CancelFlag,
) -> Result<i32> {
    let parsed = VersionSpec::parse(spec)?;
    let alias = alias.unwrap_or_else(|| default_alias(spec));

    let mut options = InstallOptions::new(alias, parsed);
    options.force = force;
    options.activate = activate;
    options.lock_timeout = Duration::from_secs(wait);

    let mut on_progress = |progress: DownloadProgress| print_progress(progress);
    let outcome = pipeline::install(paths, &options, cancel, &mut on_progress)?;
    eprintln!();

    let source = if outcome.from_cache { "cache" } else { "download" };
    println!(
        "{} Node.js {} as '{}' (from {source})",
        "installed".green().bold(),
        outcome.installation.version,
        outcome.installation.alias,
    );
    if outcome.activated {
        println!("'{}' is now active", outcome.installation.alias);
    }
    Ok(0)
}

fn execute_use(paths: &KnotPaths, alias: Option<String>, wait: u64) -> Result<i32> {
    let alias = match alias {
        Some(alias) => alias,
        None => project_alias(paths)?,
    };
    let installation = pipeline::activate(paths, &alias, Duration::from_secs(wait))?;
    println!(
        "{} '{}' (Node.js {})",
        "active".green().bold(),
        installation.alias,
        installation.version
    );
    Ok(0)
}

fn execute_remove(paths: &KnotPaths, alias: &str, wait: u64) -> Result<i32> {
    let removed = pipeline::remove(paths, alias, Duration::from_secs(wait))?;
    println!(
        "{} '{}' (Node.js {})",
        "removed".yellow().bold(),
        removed.alias,
        removed.version
    );
    Ok(0)
}

fn execute_list(paths: &KnotPaths) -> Result<i32> {
    let registry = Registry::load(paths)?;
    if registry.installations.is_empty() {
        println!("No runtimes installed. Try `knot install lts`.");
        return Ok(0);
    }
    for installation in &registry.installations {
        let marker = if registry.is_active(&installation.alias) {
            "*".green().bold().to_string()
        } else {
            " ".to_string()
        };
        println!(
            "{marker} {:<16} {}",
            installation.alias, installation.version
        );
    }
    Ok(0)
}

fn execute_list_remote(paths: &KnotPaths, lts_only: bool, limit: usize) -> Result<i32> {
    let platform = Platform::detect()?;
    let mirror = paths::mirror_url();
    let catalog = CatalogClient::new(&mirror, paths)?.fetch()?;
    let file_key = platform.index_file_key();

    let mut shown = 0;
    for descriptor in &catalog {
        if lts_only && descriptor.lts.is_none() {
            continue;
        }
        if shown >= limit {
            break;
        }
        let lts = descriptor
            .lts
            .as_deref()
            .map(|name| format!(" (LTS: {name})"))
            .unwrap_or_default();
        let availability = if descriptor.has_artifact(&file_key) {
            String::new()
        } else {
            format!(" [no {} artifact]", platform.artifact_target())
                .red()
                .to_string()
        };
        println!(
            "{:<12}{lts}{availability}  {}",
            descriptor.version.to_string(),
            descriptor.release_date
        );
        shown += 1;
    }
    Ok(0)
}

fn execute_current(paths: &KnotPaths) -> Result<i32> {
    let registry = Registry::load(paths)?;
    match registry.active() {
        Some(installation) => println!(
            "{} (Node.js {}) at {}",
            installation.alias.green().bold(),
            installation.version,
            installation.path.display()
        ),
        None => println!("no active runtime"),
    }

    let cwd = std::env::current_dir()?;
    if let Some(context) = project::discover(&cwd)? {
        let name = context
            .project_name
            .map(|n| format!(" ({n})"))
            .unwrap_or_default();
        println!(
            "project{name} pins {} via {}",
            context.spec,
            context.source.display()
        );
    }
    Ok(0)
}

fn execute_sync(paths: &KnotPaths) -> Result<i32> {
    let result = sync::sync(paths)?;
    println!(
        "{}: {} installed, {} removed, {} unchanged",
        "synced".green().bold(),
        result.installed.len(),
        result.removed.len(),
        result.unchanged
    );
    Ok(0)
}

fn execute_clean(paths: &KnotPaths) -> Result<i32> {
    let freed = cache::ArchiveCache::new(paths).clean()?;
    println!("freed {:.1} MiB", freed as f64 / (1024.0 * 1024.0));
    Ok(0)
}

/// Pick the installed alias that best satisfies the current project's
/// version pin: the highest matching version wins.
fn project_alias(paths: &KnotPaths) -> Result<String> {
    let cwd = std::env::current_dir()?;
    let context = project::discover(&cwd)?.ok_or_else(|| {
        knotvm::KnotError::Other(anyhow::anyhow!(
            "no alias given and no project pin (.nvmrc, .node-version, package.json engines) found"
        ))
    })?;

    let registry = Registry::load(paths)?;
    registry
        .installations
        .iter()
        .filter(|i| context.spec.matches(&i.version))
        .max_by(|a, b| a.version.cmp(&b.version))
        .map(|i| i.alias.clone())
        .ok_or_else(|| knotvm::KnotError::InstallationNotFound(context.spec.to_string()))
}

/// Derive a registry-safe alias from a raw spec string, so
/// `knot install lts/iron` registers as `lts-iron` by default.
fn default_alias(spec: &str) -> String {
    spec.trim()
        .trim_start_matches('v')
        .replace(['/', '^', '>', '<', '=', '~', ' ', ','], "-")
        .trim_matches('-')
        .to_string()
}

fn print_progress(progress: DownloadProgress) {
    if progress.percent >= 0.0 {
        eprint!("\rdownloading... {:>5.1}%", progress.percent);
    } else {
        eprint!(
            "\rdownloading... {:.1} MiB",
            progress.bytes_downloaded as f64 / (1024.0 * 1024.0)
        );
    }
    let _ = std::io::stderr().flush();
}
