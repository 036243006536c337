//! Base directory layout for knotvm state.
//!
//! Everything lives under a single per-user base directory:
//! `settings.json`, `versions/{alias}/`, `cache/`, `proxies/`, `locks/`
//! and the `globals.toml` sync manifest. The base can be overridden with
//! `KNOTVM_DIR`, which test code relies on for isolation.

use crate::error::{KnotError, Result};
use anyhow::anyhow;
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

pub const ENV_BASE_DIR: &str = "KNOTVM_DIR";
pub const ENV_MIRROR: &str = "KNOTVM_MIRROR";
pub const DEFAULT_MIRROR: &str = "https://nodejs.org/dist";

#[derive(Debug, Clone)]
pub struct KnotPaths {
    base: PathBuf,
}

impl KnotPaths {
    /// Resolve the base directory: `KNOTVM_DIR` if set, otherwise the
    /// per-user data directory.
    pub fn resolve() -> Result<Self> {
        if let Ok(dir) = std::env::var(ENV_BASE_DIR) {
            return Ok(Self { base: PathBuf::from(dir) });
        }
        let proj_dirs = ProjectDirs::from("org", "knotvm", "knotvm")
            .ok_or_else(|| KnotError::Other(anyhow!("could not determine a home directory")))?;
        Ok(Self {
            base: proj_dirs.data_dir().to_path_buf(),
        })
    }

    /// Use an explicit base directory.
    pub fn at(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Create the directory structure if it does not exist yet.
    pub fn ensure(&self) -> Result<()> {
        for dir in [
            self.base.clone(),
            self.versions_dir(),
            self.cache_dir(),
            self.proxies_dir(),
            self.locks_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| KnotError::PathAccess {
                path: dir.clone(),
                message: e.to_string(),
            })?;
        }
        Ok(())
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn versions_dir(&self) -> PathBuf {
        self.base.join("versions")
    }

    pub fn install_dir(&self, alias: &str) -> PathBuf {
        self.versions_dir().join(alias)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.base.join("cache")
    }

    pub fn proxies_dir(&self) -> PathBuf {
        self.base.join("proxies")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.base.join("locks")
    }

    pub fn settings_file(&self) -> PathBuf {
        self.base.join("settings.json")
    }

    pub fn globals_manifest(&self) -> PathBuf {
        self.base.join("globals.toml")
    }
}

/// The download mirror: `KNOTVM_MIRROR` if set, the official dist
/// server otherwise.
pub fn mirror_url() -> String {
    std::env::var(ENV_MIRROR).unwrap_or_else(|_| DEFAULT_MIRROR.to_string())
}
