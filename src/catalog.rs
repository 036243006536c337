//! Remote version catalog client.
//!
//! Fetches the release index (`index.json`) from the configured mirror and
//! keeps an on-disk copy in the cache directory so short-lived commands do
//! not refetch it, and so resolution still works offline.

use crate::error::{KnotError, Result};
use crate::paths::KnotPaths;
use chrono::NaiveDate;
use semver::Version;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

pub const USER_AGENT: &str = concat!("knotvm/", env!("CARGO_PKG_VERSION"));

/// How long a cached catalog is considered fresh.
const CACHE_TTL: Duration = Duration::from_secs(60 * 60);

/// One release as published in the catalog. Immutable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteVersionDescriptor {
    pub version: Version,
    /// LTS codename, if this release line is an LTS.
    pub lts: Option<String>,
    pub release_date: NaiveDate,
    /// Artifact target keys available for this release.
    pub files: Vec<String>,
}

impl RemoteVersionDescriptor {
    /// Whether an artifact exists for the given catalog file key.
    pub fn has_artifact(&self, file_key: &str) -> bool {
        self.files.iter().any(|f| f == file_key)
    }
}

/// Raw entry shape of the upstream index.
#[derive(Debug, Deserialize)]
struct RawIndexEntry {
    version: String,
    date: String,
    files: Vec<String>,
    #[serde(default)]
    lts: LtsField,
}

/// The `lts` field is either `false` or a codename string.
#[derive(Debug, Default, Deserialize)]
#[serde(untagged)]
enum LtsField {
    #[default]
    None,
    Flag(bool),
    Codename(String),
}

impl LtsField {
    fn into_option(self) -> Option<String> {
        match self {
            LtsField::Codename(name) => Some(name),
            _ => None,
        }
    }
}

pub struct CatalogClient {
    client: reqwest::blocking::Client,
    index_url: String,
    cache_file: PathBuf,
}

impl CatalogClient {
    pub fn new(mirror: &str, paths: &KnotPaths) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| KnotError::CatalogUnavailable(e.to_string()))?;
        Ok(Self {
            client,
            index_url: format!("{}/index.json", mirror.trim_end_matches('/')),
            cache_file: paths.cache_dir().join("index.json"),
        })
    }

    /// Fetch the catalog, preferring a fresh on-disk copy.
    ///
    /// A stale copy is refetched; if the network is down, the stale copy
    /// is still used rather than failing outright. With no copy at all, a
    /// failed fetch is `CatalogUnavailable`.
    pub fn fetch(&self) -> Result<Vec<RemoteVersionDescriptor>> {
        if self.cache_is_fresh() {
            debug!("using cached catalog at {}", self.cache_file.display());
            if let Ok(descriptors) = self.parse_cached() {
                return Ok(descriptors);
            }
            // Unreadable cache falls through to a refetch.
        }

        match self.fetch_remote() {
            Ok(body) => {
                let descriptors = parse_index(&body)?;
                if let Err(e) = std::fs::write(&self.cache_file, &body) {
                    warn!("could not cache catalog: {e}");
                }
                Ok(descriptors)
            }
            Err(err) => {
                if self.cache_file.exists() {
                    warn!("catalog fetch failed ({err}), falling back to cached copy");
                    self.parse_cached()
                } else {
                    Err(err)
                }
            }
        }
    }

    fn fetch_remote(&self) -> Result<String> {
        debug!("fetching catalog from {}", self.index_url);
        let response = self
            .client
            .get(&self.index_url)
            .send()
            .map_err(|e| KnotError::CatalogUnavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(KnotError::CatalogUnavailable(format!(
                "{} returned HTTP {}",
                self.index_url,
                response.status()
            )));
        }
        response
            .text()
            .map_err(|e| KnotError::CatalogUnavailable(e.to_string()))
    }

    fn cache_is_fresh(&self) -> bool {
        std::fs::metadata(&self.cache_file)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|mtime| mtime.elapsed().ok())
            .is_some_and(|age| age < CACHE_TTL)
    }

    fn parse_cached(&self) -> Result<Vec<RemoteVersionDescriptor>> {
        let body = std::fs::read_to_string(&self.cache_file)?;
        parse_index(&body)
    }
}

/// Parse the raw index body into descriptors, newest first.
///
/// Entries with malformed versions or dates are skipped; the upstream
/// index goes back to releases predating the current naming scheme.
pub fn parse_index(body: &str) -> Result<Vec<RemoteVersionDescriptor>> {
    let raw: Vec<RawIndexEntry> = serde_json::from_str(body)
        .map_err(|e| KnotError::CatalogUnavailable(format!("malformed index: {e}")))?;

    let mut descriptors: Vec<RemoteVersionDescriptor> = raw
        .into_iter()
        .filter_map(|entry| {
            let version = Version::parse(entry.version.trim_start_matches('v')).ok()?;
            let release_date = NaiveDate::parse_from_str(&entry.date, "%Y-%m-%d").ok()?;
            Some(RemoteVersionDescriptor {
                version,
                lts: entry.lts.into_option(),
                release_date,
                files: entry.files,
            })
        })
        .collect();

    descriptors.sort_by(|a, b| {
        b.version
            .cmp(&a.version)
            .then(b.release_date.cmp(&a.release_date))
    });
    Ok(descriptors)
}
