//! Global package reconciliation.
//!
//! `globals.toml` declares the packages expected to be globally visible
//! under the active runtime. `sync` compares that manifest against what
//! the active installation actually carries and installs or removes the
//! difference through the bundled package manager. It runs automatically
//! after proxied package-manager calls that mutate globals, and manually
//! via `knot sync`.

use crate::error::{KnotError, Result};
use crate::paths::KnotPaths;
use crate::registry::{Installation, Registry};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;
use tracing::{debug, info};

/// Packages bundled with the runtime itself; never reconciled.
const BUNDLED: &[&str] = &["npm", "corepack"];

/// The declared global-package state.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct GlobalsManifest {
    /// Alias the globals are pinned to; must be installed when set.
    pub runtime: Option<String>,
    /// Package manager to reconcile with; defaults to npm.
    pub package_manager: Option<String>,
    /// Package name to version spec.
    pub packages: BTreeMap<String, String>,
}

impl GlobalsManifest {
    /// Load the manifest, treating a missing file as empty.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| KnotError::SyncFailed(format!("unreadable globals manifest: {e}")))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| KnotError::Other(anyhow::anyhow!(e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.runtime.is_none() && self.packages.is_empty()
    }
}

/// What a reconciliation did.
#[derive(Debug, Clone, Default)]
pub struct SyncResult {
    pub installed: Vec<String>,
    pub removed: Vec<String>,
    pub unchanged: usize,
}

/// The work a reconciliation would do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncPlan {
    /// `name@version` requirements missing from the runtime.
    pub to_install: Vec<String>,
    /// Globally present packages the manifest does not declare.
    pub to_remove: Vec<String>,
    pub unchanged: usize,
}

/// Reconcile the active runtime's globals with the manifest.
pub fn sync(paths: &KnotPaths) -> Result<SyncResult> {
    let manifest = GlobalsManifest::load(&paths.globals_manifest())?;
    if manifest.is_empty() {
        debug!("no globals manifest; nothing to sync");
        return Ok(SyncResult::default());
    }

    let registry = Registry::load(paths)?;
    let active = registry
        .active()
        .ok_or_else(|| KnotError::SyncFailed("no active installation".to_string()))?;

    if let Some(pinned) = &manifest.runtime {
        if !registry.contains(pinned) {
            return Err(KnotError::SyncFailed(format!(
                "manifest pins runtime '{pinned}', which is not installed"
            )));
        }
    }

    let pm = manifest.package_manager.as_deref().unwrap_or("npm");
    let pm_binary = active.binary_path(pm);
    if !pm_binary.exists() {
        return Err(KnotError::SyncFailed(format!(
            "manifest requires package manager '{pm}', which '{}' does not provide",
            active.alias
        )));
    }

    let present = list_globals(active)?;
    let plan = compute_plan(&manifest, &present);
    debug!(
        "sync plan: install {:?}, remove {:?}",
        plan.to_install, plan.to_remove
    );

    let mut result = SyncResult {
        unchanged: plan.unchanged,
        ..Default::default()
    };
    let mut failures = Vec::new();

    for spec in &plan.to_install {
        info!("installing global package {spec}");
        match run_package_manager(&pm_binary, &["install", "-g", spec]) {
            Ok(()) => result.installed.push(spec.clone()),
            Err(e) => failures.push(format!("{spec}: {e}")),
        }
    }
    for name in &plan.to_remove {
        info!("removing undeclared global package {name}");
        match run_package_manager(&pm_binary, &["uninstall", "-g", name]) {
            Ok(()) => result.removed.push(name.clone()),
            Err(e) => failures.push(format!("{name}: {e}")),
        }
    }

    if failures.is_empty() {
        Ok(result)
    } else {
        Err(KnotError::SyncFailed(failures.join("; ")))
    }
}

/// Diff the manifest against the currently present globals.
pub fn compute_plan(manifest: &GlobalsManifest, present: &[String]) -> SyncPlan {
    let mut plan = SyncPlan::default();
    for (name, version) in &manifest.packages {
        if present.iter().any(|p| p == name) {
            plan.unchanged += 1;
        } else if version == "*" {
            plan.to_install.push(name.clone());
        } else {
            plan.to_install.push(format!("{name}@{version}"));
        }
    }
    for name in present {
        if BUNDLED.contains(&name.as_str()) {
            continue;
        }
        if !manifest.packages.contains_key(name) {
            plan.to_remove.push(name.clone());
        }
    }
    plan
}

/// Enumerate globally installed package names under an installation,
/// scoped packages included.
pub fn list_globals(installation: &Installation) -> Result<Vec<String>> {
    let modules = installation.global_modules_dir();
    let mut names = Vec::new();
    if !modules.exists() {
        return Ok(names);
    }
    for entry in std::fs::read_dir(&modules)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == ".bin" {
            continue;
        }
        if let Some(scope) = name.strip_prefix('@') {
            for scoped in std::fs::read_dir(entry.path())? {
                let scoped = scoped?;
                if scoped.file_type()?.is_dir() {
                    names.push(format!("@{scope}/{}", scoped.file_name().to_string_lossy()));
                }
            }
        } else {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

fn run_package_manager(binary: &Path, args: &[&str]) -> Result<()> {
    let output = Command::new(binary).args(args).output()?;
    if output.status.success() {
        Ok(())
    } else {
        Err(KnotError::SyncFailed(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ))
    }
}
