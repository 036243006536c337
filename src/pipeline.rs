//! End-to-end installation pipeline.
//!
//! Orchestrates resolve, download, verify, extract, register and activate
//! as one operation per alias. The whole pipeline runs under the alias
//! lock; the registry mutation at the end additionally takes the registry
//! lock. Failure at any step leaves no partial registry row behind: the
//! row and the extracted tree are committed together or not at all.

use crate::cache::ArchiveCache;
use crate::cancel::CancelFlag;
use crate::catalog::CatalogClient;
use crate::download::{Downloader, ProgressFn};
use crate::error::{KnotError, Result};
use crate::extract;
use crate::lock::{LockManager, LockScope};
use crate::paths::{self, KnotPaths};
use crate::platform::Platform;
use crate::proxy;
use crate::registry::{self, Installation, Registry};
use crate::resolver::{self, ResolvedArtifact, VersionSpec};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct InstallOptions {
    /// Name the installation will be registered under.
    pub alias: String,
    pub spec: VersionSpec,
    /// Overwrite an installation already registered under this alias.
    pub force: bool,
    /// Make the new installation active once registered.
    pub activate: bool,
    pub lock_timeout: Duration,
}

impl InstallOptions {
    pub fn new(alias: impl Into<String>, spec: VersionSpec) -> Self {
        Self {
            alias: alias.into(),
            spec,
            force: false,
            activate: false,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

/// What an install produced.
#[derive(Debug, Clone)]
pub struct InstallOutcome {
    pub installation: Installation,
    pub artifact: ResolvedArtifact,
    /// The archive came from the verified cache, not the network.
    pub from_cache: bool,
    pub activated: bool,
}

/// Install a runtime under an alias.
pub fn install(
    paths: &KnotPaths,
    options: &InstallOptions,
    cancel: &CancelFlag,
    on_progress: ProgressFn,
) -> Result<InstallOutcome> {
    registry::validate_alias(&options.alias)?;
    paths.ensure()?;

    let locks = LockManager::new(paths);
    let _alias_guard = locks.acquire(
        LockScope::Alias(options.alias.clone()),
        options.lock_timeout,
    )?;
    clean_orphaned_staging(&paths.versions_dir())?;

    // Refuse to take over an existing alias without explicit intent.
    // Checked before any network traffic.
    let registry = Registry::load(paths)?;
    if registry.contains(&options.alias) && !options.force {
        return Err(KnotError::InvalidAlias {
            alias: options.alias.clone(),
            message: "already in use by another installation".into(),
        });
    }
    cancel.check()?;

    let platform = Platform::detect()?;
    let mirror = paths::mirror_url();
    let catalog = CatalogClient::new(&mirror, paths)?.fetch()?;
    let artifact = resolver::resolve(&options.spec, platform, &catalog, &mirror)?;
    info!(
        "resolved {} to Node.js {} for {}",
        options.spec,
        artifact.version,
        platform.artifact_target()
    );
    cancel.check()?;

    let (archive_path, from_cache) = obtain_archive(paths, &artifact, cancel, on_progress)?;
    cancel.check()?;

    // The new tree is staged in full first; any previous tree under this
    // alias is only replaced at promotion time, so a failed extraction
    // leaves it intact.
    let install_dir = paths.install_dir(&options.alias);
    extract::extract(&archive_path, &install_dir, true)?;
    cancel.check()?;

    let installation = Installation::new(
        options.alias.clone(),
        artifact.version.clone(),
        install_dir.clone(),
    );
    let activated = match commit(paths, &locks, options, installation.clone()) {
        Ok(activated) => activated,
        Err(err) => {
            // Roll the extracted tree back so no unregistered install
            // lingers under versions/.
            let _ = std::fs::remove_dir_all(&install_dir);
            return Err(err);
        }
    };

    if activated {
        proxy::generate(paths).into_result()?;
    }

    Ok(InstallOutcome {
        installation,
        artifact,
        from_cache,
        activated,
    })
}

/// Produce a verified archive on disk, from cache or network.
fn obtain_archive(
    paths: &KnotPaths,
    artifact: &ResolvedArtifact,
    cancel: &CancelFlag,
    on_progress: ProgressFn,
) -> Result<(std::path::PathBuf, bool)> {
    let cache = ArchiveCache::new(paths);
    let downloader = Downloader::new()?;
    let expected = downloader.fetch_checksum(&artifact.checksum_url, &artifact.file_name)?;

    if let Some(entry) = cache.lookup_verified(&artifact.file_name, &expected)? {
        info!("using cached archive {}", entry.file_name);
        return Ok((entry.file_path, true));
    }

    let destination = cache.entry_path(&artifact.file_name);
    let result = downloader.download(&artifact.url, &destination, &expected, on_progress, cancel)?;
    cache.record_verified(&artifact.file_name, &expected)?;
    Ok((result.path, false))
}

/// Write the registry row (and active pointer) under the registry lock.
fn commit(
    paths: &KnotPaths,
    locks: &LockManager,
    options: &InstallOptions,
    installation: Installation,
) -> Result<bool> {
    let _registry_guard = locks.acquire(LockScope::Registry, options.lock_timeout)?;
    let mut registry = Registry::load(paths)?;
    registry.add(installation);
    if options.activate {
        registry.set_active(&options.alias)?;
    }
    registry.save(paths)?;
    Ok(options.activate)
}

/// Make an installed alias the active one. The registry is untouched when
/// the alias does not exist.
pub fn activate(paths: &KnotPaths, alias: &str, lock_timeout: Duration) -> Result<Installation> {
    let locks = LockManager::new(paths);
    let _guard = locks.acquire(LockScope::Registry, lock_timeout)?;

    let mut registry = Registry::load(paths)?;
    let installation = registry
        .get(alias)
        .cloned()
        .ok_or_else(|| KnotError::InstallationNotFound(alias.to_string()))?;
    registry.set_active(alias)?;
    registry.save(paths)?;

    proxy::generate(paths).into_result()?;
    Ok(installation)
}

/// Remove an installation: directory, registry row, and proxies when it
/// was the active one.
pub fn remove(paths: &KnotPaths, alias: &str, lock_timeout: Duration) -> Result<Installation> {
    let locks = LockManager::new(paths);
    let _alias_guard = locks.acquire(LockScope::Alias(alias.to_string()), lock_timeout)?;
    let _registry_guard = locks.acquire(LockScope::Registry, lock_timeout)?;

    let mut registry = Registry::load(paths)?;
    let was_active = registry.is_active(alias);
    let removed = registry
        .remove(alias)
        .ok_or_else(|| KnotError::InstallationNotFound(alias.to_string()))?;

    // Row first, tree second. A failed save must not leave a registered
    // alias pointing at a deleted tree; the worst case here is an
    // orphaned directory.
    registry.save(paths)?;
    let install_dir = paths.install_dir(alias);
    if install_dir.exists() {
        std::fs::remove_dir_all(&install_dir)?;
    }

    if was_active {
        let count = proxy::remove_all(paths)?;
        debug!("removed {count} proxies for formerly active '{alias}'");
    }
    Ok(removed)
}

/// Delete staging directories left behind by crashed extractions.
pub fn clean_orphaned_staging(versions_dir: &Path) -> Result<usize> {
    let mut removed = 0;
    if !versions_dir.exists() {
        return Ok(0);
    }
    for entry in std::fs::read_dir(versions_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') && name.contains(".staging-") && entry.file_type()?.is_dir() {
            warn!("removing orphaned staging directory {name}");
            std::fs::remove_dir_all(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use semver::Version;
    use tempfile::tempdir;

    fn paths(dir: &std::path::Path) -> KnotPaths {
        let paths = KnotPaths::at(dir);
        paths.ensure().unwrap();
        paths
    }

    fn registered(paths: &KnotPaths, alias: &str) -> Registry {
        let mut registry = Registry::default();
        registry.add(Installation::new(
            alias,
            Version::new(20, 12, 2),
            paths.install_dir(alias),
        ));
        registry.save(paths).unwrap();
        registry
    }

    fn no_progress() -> impl FnMut(crate::download::DownloadProgress) {
        |_| {}
    }

    #[test]
    fn test_install_rejects_bad_alias() {
        let dir = tempdir().unwrap();
        let paths = paths(dir.path());
        let options = InstallOptions::new("../escape", VersionSpec::Latest);

        let err = install(&paths, &options, &CancelFlag::new(), &mut no_progress()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidAlias);
    }

    #[test]
    fn test_install_onto_taken_alias_requires_force() {
        let dir = tempdir().unwrap();
        let paths = paths(dir.path());
        registered(&paths, "work");

        let options = InstallOptions::new("work", VersionSpec::Latest);
        let err = install(&paths, &options, &CancelFlag::new(), &mut no_progress()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidAlias);

        // The registered row survives untouched.
        let registry = Registry::load(&paths).unwrap();
        assert!(registry.contains("work"));
    }

    #[test]
    fn test_install_observes_cancellation_before_network() {
        let dir = tempdir().unwrap();
        let paths = paths(dir.path());
        let cancel = CancelFlag::new();
        cancel.cancel();

        let options = InstallOptions::new("work", VersionSpec::Latest);
        let err = install(&paths, &options, &cancel, &mut no_progress()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Cancelled);
    }

    #[test]
    fn test_activate_unknown_alias_leaves_pointer_unchanged() {
        let dir = tempdir().unwrap();
        let paths = paths(dir.path());
        let mut registry = registered(&paths, "work");
        registry.set_active("work").unwrap();
        registry.save(&paths).unwrap();

        let err = activate(&paths, "ghost", DEFAULT_LOCK_TIMEOUT).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InstallationNotFound);
        assert_eq!(
            Registry::load(&paths).unwrap().active.as_deref(),
            Some("work")
        );
    }

    #[test]
    fn test_activate_switches_pointer() {
        let dir = tempdir().unwrap();
        let paths = paths(dir.path());
        let mut registry = registered(&paths, "work");
        registry.add(Installation::new(
            "play",
            Version::new(22, 1, 0),
            paths.install_dir("play"),
        ));
        registry.set_active("work").unwrap();
        registry.save(&paths).unwrap();

        let installation = activate(&paths, "play", DEFAULT_LOCK_TIMEOUT).unwrap();
        assert_eq!(installation.alias, "play");
        assert_eq!(
            Registry::load(&paths).unwrap().active.as_deref(),
            Some("play")
        );
    }

    #[test]
    fn test_remove_unknown_alias_fails() {
        let dir = tempdir().unwrap();
        let paths = paths(dir.path());
        let err = remove(&paths, "ghost", DEFAULT_LOCK_TIMEOUT).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InstallationNotFound);
    }

    #[test]
    fn test_remove_deletes_row_and_tree() {
        let dir = tempdir().unwrap();
        let paths = paths(dir.path());
        registered(&paths, "work");
        std::fs::create_dir_all(paths.install_dir("work").join("bin")).unwrap();

        let removed = remove(&paths, "work", DEFAULT_LOCK_TIMEOUT).unwrap();
        assert_eq!(removed.alias, "work");
        assert!(!paths.install_dir("work").exists());
        assert!(!Registry::load(&paths).unwrap().contains("work"));
    }

    #[cfg(unix)]
    #[test]
    fn test_remove_keeps_tree_when_row_removal_fails() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let paths = paths(dir.path());
        registered(&paths, "work");
        std::fs::create_dir_all(paths.install_dir("work").join("bin")).unwrap();

        // Locking down the base directory makes the settings rewrite fail
        // while the locks/ and versions/ subdirectories stay writable.
        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o555)).unwrap();
        if std::fs::write(dir.path().join(".writable"), b"x").is_ok() {
            // Privileged processes bypass directory permissions; the
            // failure cannot be provoked here.
            std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o755))
                .unwrap();
            std::fs::remove_file(dir.path().join(".writable")).unwrap();
            return;
        }

        let result = remove(&paths, "work", DEFAULT_LOCK_TIMEOUT);
        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o755)).unwrap();

        result.unwrap_err();
        // The row could not be rewritten, so the tree must still be there
        // and the registry must still point at it.
        assert!(paths.install_dir("work").join("bin").exists());
        assert!(Registry::load(&paths).unwrap().contains("work"));
    }

    #[test]
    fn test_remove_active_clears_proxies() {
        let dir = tempdir().unwrap();
        let paths = paths(dir.path());
        let mut registry = registered(&paths, "work");
        registry.set_active("work").unwrap();
        registry.save(&paths).unwrap();
        proxy::generate(&paths).into_result().unwrap();

        remove(&paths, "work", DEFAULT_LOCK_TIMEOUT).unwrap();
        assert!(!proxy::proxy_path(&paths, "node").exists());
        assert!(Registry::load(&paths).unwrap().active.is_none());
    }

    #[test]
    fn test_clean_orphaned_staging() {
        let dir = tempdir().unwrap();
        let paths = paths(dir.path());
        let versions = paths.versions_dir();
        std::fs::create_dir_all(versions.join(".work.staging-12345")).unwrap();
        std::fs::create_dir_all(versions.join("work")).unwrap();

        assert_eq!(clean_orphaned_staging(&versions).unwrap(), 1);
        assert!(versions.join("work").exists());
        assert!(!versions.join(".work.staging-12345").exists());
    }
}
