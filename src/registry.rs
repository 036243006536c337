//! Durable installation registry.
//!
//! `settings.json` under the base directory records every installed
//! runtime and which one is active. The active pointer is a single
//! `Option<String>`, so at most one installation can be active by
//! construction, including right after crash recovery. Mutations must
//! happen under the appropriate lock scope; saving is a temp-file write
//! followed by a rename.

use crate::error::{KnotError, Result};
use crate::paths::KnotPaths;
use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

const SCHEMA_VERSION: u32 = 1;

/// One installed runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Installation {
    /// User-chosen name, unique within the registry.
    pub alias: String,
    /// The runtime version backing this alias.
    pub version: Version,
    /// Absolute installation directory.
    pub path: PathBuf,
    /// When this installation was registered.
    pub installed_at: DateTime<Utc>,
}

impl Installation {
    pub fn new(alias: impl Into<String>, version: Version, path: impl Into<PathBuf>) -> Self {
        Self {
            alias: alias.into(),
            version,
            path: path.into(),
            installed_at: Utc::now(),
        }
    }

    /// Path to the runtime binary inside this installation.
    pub fn binary_path(&self, command: &str) -> PathBuf {
        if cfg!(windows) {
            // Windows archives keep executables at the top level.
            let ext = match command {
                "node" => "exe",
                _ => "cmd",
            };
            self.path.join(format!("{command}.{ext}"))
        } else {
            self.path.join("bin").join(command)
        }
    }

    /// Directory holding globally installed packages for this runtime.
    pub fn global_modules_dir(&self) -> PathBuf {
        if cfg!(windows) {
            self.path.join("node_modules")
        } else {
            self.path.join("lib").join("node_modules")
        }
    }
}

/// The registry file: installation rows plus the active pointer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registry {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub installations: Vec<Installation>,
    /// Alias of the active installation, if any.
    pub active: Option<String>,
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            installations: Vec::new(),
            active: None,
        }
    }
}

impl Registry {
    /// Load the registry from the base directory.
    ///
    /// A missing file is an empty registry (first use); unparseable
    /// content is reported as `CorruptedSettingsFile`, never silently
    /// reset.
    pub fn load(paths: &KnotPaths) -> Result<Self> {
        let path = paths.settings_file();
        if !path.exists() {
            debug!("no registry at {}, starting empty", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)?;
        serde_json::from_str(&content).map_err(|e| KnotError::CorruptedSettingsFile {
            path,
            message: e.to_string(),
        })
    }

    /// Persist the registry atomically (temp file + rename).
    pub fn save(&self, paths: &KnotPaths) -> Result<()> {
        let path = paths.settings_file();
        let parent = path.parent().ok_or_else(|| KnotError::PathAccess {
            path: path.clone(),
            message: "settings file has no parent directory".into(),
        })?;
        std::fs::create_dir_all(parent)?;
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| KnotError::Other(anyhow::anyhow!(e)))?;
        let mut temp = tempfile::NamedTempFile::new_in(parent)?;
        std::io::Write::write_all(&mut temp, content.as_bytes())?;
        temp.persist(&path).map_err(|e| KnotError::PathAccess {
            path,
            message: format!("could not write registry: {e}"),
        })?;
        Ok(())
    }

    /// Register an installation, replacing any row with the same alias.
    pub fn add(&mut self, installation: Installation) {
        self.installations
            .retain(|i| i.alias != installation.alias);
        self.installations.push(installation);
        self.installations.sort_by(|a, b| a.alias.cmp(&b.alias));
    }

    /// Remove an installation row. Clears the active pointer if it
    /// referred to this alias.
    pub fn remove(&mut self, alias: &str) -> Option<Installation> {
        let pos = self.installations.iter().position(|i| i.alias == alias)?;
        let removed = self.installations.remove(pos);
        if self.active.as_deref() == Some(alias) {
            self.active = None;
        }
        Some(removed)
    }

    pub fn get(&self, alias: &str) -> Option<&Installation> {
        self.installations.iter().find(|i| i.alias == alias)
    }

    pub fn contains(&self, alias: &str) -> bool {
        self.get(alias).is_some()
    }

    /// The active installation, if one is set and still registered.
    pub fn active(&self) -> Option<&Installation> {
        self.active.as_deref().and_then(|alias| self.get(alias))
    }

    pub fn is_active(&self, alias: &str) -> bool {
        self.active.as_deref() == Some(alias)
    }

    /// Point the active pointer at an installed alias.
    pub fn set_active(&mut self, alias: &str) -> Result<()> {
        if !self.contains(alias) {
            return Err(KnotError::InstallationNotFound(alias.to_string()));
        }
        self.active = Some(alias.to_string());
        Ok(())
    }
}

/// Validate a user-chosen alias: nonempty, filesystem-safe, no path
/// separators or leading dots.
pub fn validate_alias(alias: &str) -> Result<()> {
    let valid = !alias.is_empty()
        && !alias.starts_with('.')
        && alias
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(KnotError::InvalidAlias {
            alias: alias.to_string(),
            message: "aliases may only contain alphanumerics, '-', '_' and '.', and may not start with '.'".into(),
        })
    }
}

/// A registered path must still contain a working runtime binary, or the
/// row is corrupt.
pub fn installation_is_intact(installation: &Installation) -> bool {
    installation.binary_path("node").exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample(alias: &str, version: &str) -> Installation {
        Installation::new(
            alias,
            Version::parse(version).unwrap(),
            format!("/tmp/knot/versions/{alias}"),
        )
    }

    #[test]
    fn test_empty_registry_on_first_use() {
        let dir = tempdir().unwrap();
        let paths = KnotPaths::at(dir.path());
        let registry = Registry::load(&paths).unwrap();
        assert!(registry.installations.is_empty());
        assert!(registry.active.is_none());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempdir().unwrap();
        let paths = KnotPaths::at(dir.path());
        paths.ensure().unwrap();

        let mut registry = Registry::default();
        registry.add(sample("work", "20.12.2"));
        registry.add(sample("play", "22.1.0"));
        registry.set_active("work").unwrap();
        registry.save(&paths).unwrap();

        let loaded = Registry::load(&paths).unwrap();
        assert_eq!(loaded.installations.len(), 2);
        assert_eq!(loaded.active.as_deref(), Some("work"));
        assert_eq!(
            loaded.get("play").unwrap().version,
            Version::new(22, 1, 0)
        );
    }

    #[test]
    fn test_corrupted_settings_reported_not_reset() {
        let dir = tempdir().unwrap();
        let paths = KnotPaths::at(dir.path());
        paths.ensure().unwrap();
        std::fs::write(paths.settings_file(), "{ not json").unwrap();

        let err = Registry::load(&paths).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::CorruptedSettingsFile);
        // File untouched.
        assert_eq!(
            std::fs::read_to_string(paths.settings_file()).unwrap(),
            "{ not json"
        );
    }

    #[test]
    fn test_at_most_one_active() {
        let mut registry = Registry::default();
        registry.add(sample("a", "20.0.0"));
        registry.add(sample("b", "22.0.0"));

        registry.set_active("a").unwrap();
        registry.set_active("b").unwrap();
        let active: Vec<_> = registry
            .installations
            .iter()
            .filter(|i| registry.is_active(&i.alias))
            .collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].alias, "b");
    }

    #[test]
    fn test_set_active_requires_installed() {
        let mut registry = Registry::default();
        let err = registry.set_active("ghost").unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::InstallationNotFound);
        assert!(registry.active.is_none());
    }

    #[test]
    fn test_remove_clears_active_pointer() {
        let mut registry = Registry::default();
        registry.add(sample("work", "20.12.2"));
        registry.set_active("work").unwrap();

        let removed = registry.remove("work");
        assert!(removed.is_some());
        assert!(registry.active.is_none());
        assert!(registry.active().is_none());
    }

    #[test]
    fn test_add_replaces_same_alias() {
        let mut registry = Registry::default();
        registry.add(sample("work", "20.12.2"));
        registry.add(sample("work", "22.1.0"));
        assert_eq!(registry.installations.len(), 1);
        assert_eq!(registry.get("work").unwrap().version, Version::new(22, 1, 0));
    }

    #[test]
    fn test_validate_alias() {
        assert!(validate_alias("work").is_ok());
        assert!(validate_alias("node-20.x_test").is_ok());
        assert!(validate_alias("").is_err());
        assert!(validate_alias(".hidden").is_err());
        assert!(validate_alias("a/b").is_err());
        assert!(validate_alias("a b").is_err());
    }
}
