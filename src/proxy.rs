//! Proxy (shim) generation and invocation.
//!
//! For every supported command a small executable is written into the
//! PATH-resident `proxies/` directory, named with the `knot-` prefix so
//! it never shadows a system-wide command of the same name. The scripts
//! delegate to `knot run <command>`, which looks up the active
//! installation in the registry at invocation time; switching the active
//! version therefore never requires regenerating anything.

use crate::error::{KnotError, Result};
use crate::paths::KnotPaths;
use crate::registry::Registry;
use std::path::PathBuf;
use std::process::Command;
use tracing::{debug, warn};

pub const PROXY_PREFIX: &str = "knot-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    /// The runtime binary itself.
    Generic,
    /// A bundled package manager; global mutations trigger a sync.
    PackageManager,
    /// Script shim for platforms without exec-bit/shebang support.
    Shim,
}

#[derive(Debug, Clone, Copy)]
pub struct ProxyCommand {
    pub name: &'static str,
    pub kind: ProxyKind,
}

/// The commands every installation is expected to expose.
pub fn supported_commands() -> [ProxyCommand; 3] {
    let (generic, pm) = if cfg!(windows) {
        (ProxyKind::Shim, ProxyKind::Shim)
    } else {
        (ProxyKind::Generic, ProxyKind::PackageManager)
    };
    [
        ProxyCommand { name: "node", kind: generic },
        ProxyCommand { name: "npm", kind: pm },
        ProxyCommand { name: "npx", kind: pm },
    ]
}

/// Whether global mutations through this command should trigger a sync.
pub fn is_package_manager(command: &str) -> bool {
    matches!(command, "npm" | "npx")
}

/// Aggregate outcome of proxy generation. Generation is best-effort per
/// command: one failed write does not void the proxies already written.
#[derive(Debug, Clone, Default)]
pub struct ProxyGenerationResult {
    pub expected: usize,
    pub generated: usize,
    /// (command, error) for every failed write.
    pub failures: Vec<(String, String)>,
}

impl ProxyGenerationResult {
    pub fn is_complete(&self) -> bool {
        self.generated == self.expected
    }

    /// Convert an incomplete generation into its error form.
    pub fn into_result(self) -> Result<Self> {
        if self.is_complete() {
            Ok(self)
        } else {
            Err(KnotError::ProxyGenerationFailed {
                generated: self.generated,
                expected: self.expected,
            })
        }
    }
}

/// Write one proxy per supported command into the proxies directory.
pub fn generate(paths: &KnotPaths) -> ProxyGenerationResult {
    let commands = supported_commands();
    let mut result = ProxyGenerationResult {
        expected: commands.len(),
        ..Default::default()
    };

    let knot_bin = match std::env::current_exe() {
        Ok(path) => path,
        Err(e) => {
            for command in &commands {
                result
                    .failures
                    .push((command.name.to_string(), e.to_string()));
            }
            return result;
        }
    };

    for command in &commands {
        match write_proxy(paths, &knot_bin, command.name) {
            Ok(path) => {
                debug!("wrote {:?} proxy at {}", command.kind, path.display());
                result.generated += 1;
            }
            Err(e) => {
                warn!("failed to write proxy for {}: {e}", command.name);
                result.failures.push((command.name.to_string(), e.to_string()));
            }
        }
    }
    result
}

/// Path of the generated proxy for a command.
pub fn proxy_path(paths: &KnotPaths, command: &str) -> PathBuf {
    let file_name = if cfg!(windows) {
        format!("{PROXY_PREFIX}{command}.cmd")
    } else {
        format!("{PROXY_PREFIX}{command}")
    };
    paths.proxies_dir().join(file_name)
}

fn write_proxy(paths: &KnotPaths, knot_bin: &std::path::Path, command: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(paths.proxies_dir())?;
    let path = proxy_path(paths, command);

    #[cfg(unix)]
    {
        let script = format!(
            "#!/bin/sh\n# Generated by knotvm; resolves the active runtime at invocation time.\nexec \"{}\" run {} -- \"$@\"\n",
            knot_bin.display(),
            command
        );
        std::fs::write(&path, script)?;
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    }
    #[cfg(windows)]
    {
        let script = format!(
            "@echo off\r\n\"{}\" run {} -- %*\r\nexit /b %ERRORLEVEL%\r\n",
            knot_bin.display(),
            command
        );
        std::fs::write(&path, script)?;
    }
    Ok(path)
}

/// Delete all generated proxies.
pub fn remove_all(paths: &KnotPaths) -> Result<usize> {
    let mut removed = 0;
    for command in supported_commands() {
        let path = proxy_path(paths, command.name);
        if path.exists() {
            std::fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Execute a proxied command against the active installation.
///
/// This is the late-bound registry read: the active alias is resolved
/// here, at invocation time. Stdio is inherited and the child's exit
/// code is returned verbatim. Package-manager invocations that mutate
/// global packages trigger a sync afterwards, best-effort.
pub fn run_proxied(paths: &KnotPaths, command: &str, args: &[String]) -> Result<i32> {
    let registry = Registry::load(paths)?;
    let active = registry
        .active()
        .ok_or_else(|| KnotError::InstallationNotFound("<active>".to_string()))?;

    let binary = active.binary_path(command);
    if !binary.exists() {
        return Err(KnotError::InstallationNotFound(format!(
            "{} (missing {})",
            active.alias,
            binary.display()
        )));
    }

    let status = Command::new(&binary).args(args).status()?;
    let exit_code = status.code().unwrap_or(1);

    if status.success() && is_package_manager(command) && mutates_globals(command, args) {
        if let Err(e) = crate::sync::sync(paths) {
            warn!("post-install sync failed: {e}");
        }
    }
    Ok(exit_code)
}

/// Whether a package-manager invocation touches the global package set.
pub fn mutates_globals(command: &str, args: &[String]) -> bool {
    if command != "npm" {
        return false;
    }
    let global = args.iter().any(|a| {
        matches!(a.as_str(), "-g" | "--global") || a == "--location=global"
    });
    if !global {
        return false;
    }
    args.iter()
        .find(|a| !a.starts_with('-'))
        .is_some_and(|subcommand| {
            matches!(
                subcommand.as_str(),
                "install" | "i" | "add" | "uninstall" | "remove" | "rm" | "un" | "update" | "up"
            )
        })
}
