//! Version and artifact resolution.
//!
//! Turns a user-supplied version spec into a concrete, downloadable
//! artifact for the host platform. Version existence and platform-artifact
//! existence are separate checks: a version can resolve and still fail
//! with `ArtifactNotAvailable` when the catalog lists no archive for the
//! host target.

use crate::catalog::RemoteVersionDescriptor;
use crate::error::{KnotError, Result};
use crate::platform::{self, Platform};
use chrono::NaiveDate;
use semver::{Version, VersionReq};

/// A parsed version request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionSpec {
    /// The newest release, LTS or not.
    Latest,
    /// The newest LTS release, optionally pinned to a codename.
    Lts(Option<String>),
    /// An exact `major.minor.patch`.
    Exact(Version),
    /// A semver range such as `20`, `^20.10`, `>=18, <21`.
    Range(VersionReq),
}

impl VersionSpec {
    /// Parse a user-supplied spec string.
    ///
    /// Accepted forms: `latest`, `lts`, `lts/iron` (or a bare codename via
    /// `lts/<name>`), exact versions with or without a leading `v`, and
    /// anything `semver::VersionReq` accepts.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(KnotError::InvalidVersionSpec(input.to_string()));
        }
        let lower = trimmed.to_ascii_lowercase();
        if lower == "latest" || lower == "node" || lower == "current" {
            return Ok(Self::Latest);
        }
        if lower == "lts" || lower == "lts/*" {
            return Ok(Self::Lts(None));
        }
        if let Some(codename) = lower.strip_prefix("lts/") {
            if codename.is_empty() || !codename.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(KnotError::InvalidVersionSpec(input.to_string()));
            }
            return Ok(Self::Lts(Some(codename.to_string())));
        }
        let bare = trimmed.trim_start_matches('v');
        if let Ok(version) = Version::parse(bare) {
            return Ok(Self::Exact(version));
        }
        VersionReq::parse(bare)
            .map(Self::Range)
            .map_err(|_| KnotError::InvalidVersionSpec(input.to_string()))
    }

    /// Whether an already-installed version satisfies this spec.
    ///
    /// LTS specs cannot be checked against a bare version number and never
    /// match; they need the catalog.
    pub fn matches(&self, version: &Version) -> bool {
        match self {
            Self::Latest => true,
            Self::Lts(_) => false,
            Self::Exact(v) => v == version,
            Self::Range(req) => req.matches(version),
        }
    }
}

impl std::fmt::Display for VersionSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Latest => write!(f, "latest"),
            Self::Lts(None) => write!(f, "lts"),
            Self::Lts(Some(name)) => write!(f, "lts/{name}"),
            Self::Exact(v) => write!(f, "{v}"),
            Self::Range(req) => write!(f, "{req}"),
        }
    }
}

/// A fully resolved artifact, ready to be downloaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedArtifact {
    pub version: Version,
    pub lts: Option<String>,
    pub release_date: NaiveDate,
    /// Archive filename, also the cache key.
    pub file_name: String,
    pub url: String,
    pub checksum_url: String,
    pub platform: Platform,
}

/// Resolve a version spec against the catalog for the given platform.
///
/// Exact specs must match a listed release. Every other spec picks the
/// highest satisfying version, release date breaking ties. The chosen
/// version is then checked for a host artifact; absence is
/// `ArtifactNotAvailable`, never a silent substitution.
pub fn resolve(
    spec: &VersionSpec,
    platform: Platform,
    catalog: &[RemoteVersionDescriptor],
    mirror: &str,
) -> Result<ResolvedArtifact> {
    let chosen = select_version(spec, catalog)?;

    let file_key = platform.index_file_key();
    if !chosen.has_artifact(&file_key) {
        return Err(KnotError::ArtifactNotAvailable {
            version: chosen.version.to_string(),
            target: platform.artifact_target(),
        });
    }

    Ok(ResolvedArtifact {
        version: chosen.version.clone(),
        lts: chosen.lts.clone(),
        release_date: chosen.release_date,
        file_name: platform::archive_filename(&chosen.version, platform),
        url: platform::download_url(mirror, &chosen.version, platform),
        checksum_url: platform::checksum_url(mirror, &chosen.version),
        platform,
    })
}

/// Pick the release a spec refers to, independent of platform artifacts.
fn select_version<'a>(
    spec: &VersionSpec,
    catalog: &'a [RemoteVersionDescriptor],
) -> Result<&'a RemoteVersionDescriptor> {
    let mut candidates: Vec<&RemoteVersionDescriptor> = match spec {
        VersionSpec::Exact(version) => catalog.iter().filter(|d| d.version == *version).collect(),
        VersionSpec::Latest => catalog.iter().collect(),
        VersionSpec::Lts(None) => catalog.iter().filter(|d| d.lts.is_some()).collect(),
        VersionSpec::Lts(Some(codename)) => catalog
            .iter()
            .filter(|d| {
                d.lts
                    .as_deref()
                    .is_some_and(|name| name.eq_ignore_ascii_case(codename))
            })
            .collect(),
        VersionSpec::Range(req) => catalog.iter().filter(|d| req.matches(&d.version)).collect(),
    };

    candidates.sort_by(|a, b| {
        b.version
            .cmp(&a.version)
            .then(b.release_date.cmp(&a.release_date))
    });

    candidates.first().copied().ok_or_else(|| {
        KnotError::ArtifactNotAvailable {
            version: spec.to_string(),
            target: "any".to_string(),
        }
    })
}
