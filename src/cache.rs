//! Verified archive cache.
//!
//! Downloaded archives are kept under `cache/`, keyed by filename (which
//! already encodes version, OS and architecture). A `<file>.sha256`
//! sidecar records the digest that was verified at download time; a cache
//! entry only counts as verified when the file still matches its sidecar.

use crate::download::file_sha256;
use crate::error::Result;
use crate::paths::KnotPaths;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use tracing::debug;
use walkdir::WalkDir;

/// One cached archive.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub file_name: String,
    pub file_path: PathBuf,
    pub size_bytes: u64,
    pub downloaded_at: Option<DateTime<Utc>>,
    pub verified: bool,
}

pub struct ArchiveCache {
    cache_dir: PathBuf,
}

impl ArchiveCache {
    pub fn new(paths: &KnotPaths) -> Self {
        Self {
            cache_dir: paths.cache_dir(),
        }
    }

    /// The path an archive with this filename would occupy.
    pub fn entry_path(&self, file_name: &str) -> PathBuf {
        self.cache_dir.join(file_name)
    }

    /// Look up a cached archive and re-verify it against the expected
    /// digest. Only a matching, sidecar-confirmed entry is returned.
    pub fn lookup_verified(
        &self,
        file_name: &str,
        expected_checksum: &str,
    ) -> Result<Option<CacheEntry>> {
        let path = self.entry_path(file_name);
        if !path.exists() {
            return Ok(None);
        }
        let sidecar = self.sidecar_path(file_name);
        let recorded = match std::fs::read_to_string(&sidecar) {
            Ok(content) => content.trim().to_ascii_lowercase(),
            Err(_) => {
                debug!("cache entry {file_name} has no verification record");
                return Ok(None);
            }
        };
        if recorded != expected_checksum.trim().to_ascii_lowercase() {
            return Ok(None);
        }
        // The sidecar matches the expectation; confirm the bytes still do.
        let actual = file_sha256(&path)?;
        if actual != recorded {
            debug!("cache entry {file_name} no longer matches its recorded digest");
            return Ok(None);
        }
        Ok(Some(self.describe(file_name, &path, true)?))
    }

    /// Record a successful verification for an archive already in place.
    pub fn record_verified(&self, file_name: &str, checksum: &str) -> Result<()> {
        std::fs::create_dir_all(&self.cache_dir)?;
        std::fs::write(
            self.sidecar_path(file_name),
            format!("{}\n", checksum.trim().to_ascii_lowercase()),
        )?;
        Ok(())
    }

    /// Enumerate cached archives, sidecars excluded.
    pub fn entries(&self) -> Result<Vec<CacheEntry>> {
        let mut entries = Vec::new();
        if !self.cache_dir.exists() {
            return Ok(entries);
        }
        for entry in WalkDir::new(&self.cache_dir).min_depth(1).max_depth(1) {
            let entry = entry
                .map_err(|e| crate::error::KnotError::Other(anyhow::anyhow!(e)))?
                .into_path();
            let Some(name) = entry.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.ends_with(".sha256") || name == "index.json" {
                continue;
            }
            let verified = match std::fs::read_to_string(self.sidecar_path(name)) {
                Ok(recorded) => file_sha256(&entry)
                    .is_ok_and(|actual| actual == recorded.trim().to_ascii_lowercase()),
                Err(_) => false,
            };
            entries.push(self.describe(name, &entry, verified)?);
        }
        entries.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        Ok(entries)
    }

    /// Delete every cached archive and sidecar. The catalog copy goes too.
    pub fn clean(&self) -> Result<u64> {
        let mut freed = 0u64;
        if !self.cache_dir.exists() {
            return Ok(0);
        }
        for entry in std::fs::read_dir(&self.cache_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                freed += entry.metadata()?.len();
                std::fs::remove_file(entry.path())?;
            }
        }
        Ok(freed)
    }

    fn describe(&self, file_name: &str, path: &std::path::Path, verified: bool) -> Result<CacheEntry> {
        let metadata = std::fs::metadata(path)?;
        let downloaded_at = metadata
            .modified()
            .ok()
            .map(DateTime::<Utc>::from);
        Ok(CacheEntry {
            file_name: file_name.to_string(),
            file_path: path.to_path_buf(),
            size_bytes: metadata.len(),
            downloaded_at,
            verified,
        })
    }

    fn sidecar_path(&self, file_name: &str) -> PathBuf {
        self.cache_dir.join(format!("{file_name}.sha256"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    fn cache(dir: &std::path::Path) -> ArchiveCache {
        let paths = KnotPaths::at(dir);
        paths.ensure().unwrap();
        ArchiveCache::new(&paths)
    }

    #[test]
    fn test_lookup_misses_without_file() {
        let dir = tempdir().unwrap();
        let cache = cache(dir.path());
        assert!(
            cache
                .lookup_verified("node-v1.tar.gz", HELLO_SHA256)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_lookup_requires_verification_record() {
        let dir = tempdir().unwrap();
        let cache = cache(dir.path());
        std::fs::write(cache.entry_path("a.tar.gz"), b"hello").unwrap();
        // File present but never verified.
        assert!(
            cache
                .lookup_verified("a.tar.gz", HELLO_SHA256)
                .unwrap()
                .is_none()
        );

        cache.record_verified("a.tar.gz", HELLO_SHA256).unwrap();
        let entry = cache
            .lookup_verified("a.tar.gz", HELLO_SHA256)
            .unwrap()
            .unwrap();
        assert!(entry.verified);
        assert_eq!(entry.size_bytes, 5);
    }

    #[test]
    fn test_lookup_detects_mutated_file() {
        let dir = tempdir().unwrap();
        let cache = cache(dir.path());
        std::fs::write(cache.entry_path("a.tar.gz"), b"hello").unwrap();
        cache.record_verified("a.tar.gz", HELLO_SHA256).unwrap();

        // Flip the cached bytes after verification.
        std::fs::write(cache.entry_path("a.tar.gz"), b"hellO").unwrap();
        assert!(
            cache
                .lookup_verified("a.tar.gz", HELLO_SHA256)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_lookup_rejects_different_expectation() {
        let dir = tempdir().unwrap();
        let cache = cache(dir.path());
        std::fs::write(cache.entry_path("a.tar.gz"), b"hello").unwrap();
        cache.record_verified("a.tar.gz", HELLO_SHA256).unwrap();

        let other = "0".repeat(64);
        assert!(cache.lookup_verified("a.tar.gz", &other).unwrap().is_none());
    }

    #[test]
    fn test_entries_and_clean() {
        let dir = tempdir().unwrap();
        let cache = cache(dir.path());
        std::fs::write(cache.entry_path("a.tar.gz"), b"hello").unwrap();
        cache.record_verified("a.tar.gz", HELLO_SHA256).unwrap();
        std::fs::write(cache.entry_path("b.zip"), b"zipzip").unwrap();

        let entries = cache.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].verified);
        assert!(!entries[1].verified);

        let freed = cache.clean().unwrap();
        assert!(freed > 0);
        assert!(cache.entries().unwrap().is_empty());
    }
}
