use std::path::PathBuf;

/// Result type alias used throughout the crate.
pub type Result<T, E = KnotError> = std::result::Result<T, E>;

/// Closed set of failure categories, grouped by subsystem.
///
/// Every code maps one-to-one to a fixed process exit code and a
/// `KNOT-XXX-NNN` identifier. The mapping lives here and nowhere else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // Platform
    UnsupportedOs,
    UnsupportedArch,
    // Paths / permissions
    PathAccess,
    CorruptedSettingsFile,
    Io,
    // Artifact / download
    ArtifactNotAvailable,
    DownloadFailed,
    ChecksumMismatch,
    CorruptedArchive,
    CatalogUnavailable,
    InvalidVersionSpec,
    // Installation / alias
    InvalidAlias,
    InstallationNotFound,
    // Proxy / sync
    ProxyGenerationFailed,
    SyncFailed,
    // Locking
    LockFailed,
    // Interrupt
    Cancelled,
    // Catch-all
    Unclassified,
}

impl ErrorCode {
    /// The fixed process exit code for this failure category.
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::UnsupportedOs => 10,
            Self::UnsupportedArch => 11,
            Self::PathAccess => 20,
            Self::CorruptedSettingsFile => 21,
            Self::Io => 22,
            Self::ArtifactNotAvailable => 30,
            Self::DownloadFailed => 31,
            Self::ChecksumMismatch => 32,
            Self::CorruptedArchive => 33,
            Self::CatalogUnavailable => 34,
            Self::InvalidVersionSpec => 35,
            Self::InvalidAlias => 40,
            Self::InstallationNotFound => 41,
            Self::ProxyGenerationFailed => 50,
            Self::SyncFailed => 51,
            Self::LockFailed => 60,
            Self::Cancelled => 130,
            Self::Unclassified => 1,
        }
    }

    /// The stable `KNOT-XXX-NNN` identifier for this failure category.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UnsupportedOs => "KNOT-PLT-001",
            Self::UnsupportedArch => "KNOT-PLT-002",
            Self::PathAccess => "KNOT-PTH-001",
            Self::CorruptedSettingsFile => "KNOT-PTH-002",
            Self::Io => "KNOT-PTH-003",
            Self::ArtifactNotAvailable => "KNOT-ART-001",
            Self::DownloadFailed => "KNOT-ART-002",
            Self::ChecksumMismatch => "KNOT-ART-003",
            Self::CorruptedArchive => "KNOT-ART-004",
            Self::CatalogUnavailable => "KNOT-ART-005",
            Self::InvalidVersionSpec => "KNOT-ART-006",
            Self::InvalidAlias => "KNOT-INS-001",
            Self::InstallationNotFound => "KNOT-INS-002",
            Self::ProxyGenerationFailed => "KNOT-PRX-001",
            Self::SyncFailed => "KNOT-PRX-002",
            Self::LockFailed => "KNOT-LCK-001",
            Self::Cancelled => "KNOT-INT-001",
            Self::Unclassified => "KNOT-UNK-001",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error type for knotvm.
#[derive(Debug, thiserror::Error)]
pub enum KnotError {
    #[error("unsupported operating system: {0}")]
    UnsupportedOs(String),

    #[error("unsupported CPU architecture: {0}")]
    UnsupportedArch(String),

    #[error("cannot access {}: {message}", path.display())]
    PathAccess { path: PathBuf, message: String },

    #[error("settings file at {} is corrupted: {message}", path.display())]
    CorruptedSettingsFile { path: PathBuf, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no artifact for Node.js {version} on {target}")]
    ArtifactNotAvailable { version: String, target: String },

    #[error("download failed: {message}")]
    DownloadFailed { url: String, message: String },

    #[error("checksum mismatch for {file_name}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        file_name: String,
        expected: String,
        actual: String,
    },

    #[error("corrupted archive {}: {message}", path.display())]
    CorruptedArchive { path: PathBuf, message: String },

    #[error("version catalog unavailable: {0}")]
    CatalogUnavailable(String),

    #[error("invalid version spec '{0}'")]
    InvalidVersionSpec(String),

    #[error("invalid alias '{alias}': {message}")]
    InvalidAlias { alias: String, message: String },

    #[error("no installation named '{0}'")]
    InstallationNotFound(String),

    #[error("proxy generation failed: wrote {generated} of {expected} proxies")]
    ProxyGenerationFailed { generated: usize, expected: usize },

    #[error("sync failed: {0}")]
    SyncFailed(String),

    #[error("could not acquire {scope} lock within {timeout_secs}s")]
    LockFailed { scope: String, timeout_secs: u64 },

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl KnotError {
    /// Get the error code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::UnsupportedOs(_) => ErrorCode::UnsupportedOs,
            Self::UnsupportedArch(_) => ErrorCode::UnsupportedArch,
            Self::PathAccess { .. } => ErrorCode::PathAccess,
            Self::CorruptedSettingsFile { .. } => ErrorCode::CorruptedSettingsFile,
            Self::Io(_) => ErrorCode::Io,
            Self::ArtifactNotAvailable { .. } => ErrorCode::ArtifactNotAvailable,
            Self::DownloadFailed { .. } => ErrorCode::DownloadFailed,
            Self::ChecksumMismatch { .. } => ErrorCode::ChecksumMismatch,
            Self::CorruptedArchive { .. } => ErrorCode::CorruptedArchive,
            Self::CatalogUnavailable(_) => ErrorCode::CatalogUnavailable,
            Self::InvalidVersionSpec(_) => ErrorCode::InvalidVersionSpec,
            Self::InvalidAlias { .. } => ErrorCode::InvalidAlias,
            Self::InstallationNotFound(_) => ErrorCode::InstallationNotFound,
            Self::ProxyGenerationFailed { .. } => ErrorCode::ProxyGenerationFailed,
            Self::SyncFailed(_) => ErrorCode::SyncFailed,
            Self::LockFailed { .. } => ErrorCode::LockFailed,
            Self::Cancelled => ErrorCode::Cancelled,
            Self::Other(_) => ErrorCode::Unclassified,
        }
    }

    /// An actionable remediation hint, for the error shapes that have one.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::LockFailed { .. } => Some(
                "another knot process may be holding the lock; retry, or remove the stale file under locks/ if no such process exists",
            ),
            Self::ChecksumMismatch { .. } => Some(
                "the download source may be corrupted; try again against a different mirror via KNOTVM_MIRROR",
            ),
            Self::CorruptedSettingsFile { .. } => Some(
                "inspect the file and fix or remove it; knotvm never resets it automatically",
            ),
            Self::InvalidAlias { .. } => {
                Some("aliases are free-form names; pass --force to overwrite one already in use")
            }
            Self::CatalogUnavailable(_) => {
                Some("check network connectivity, or point KNOTVM_MIRROR at a reachable mirror")
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_unique() {
        let codes = [
            ErrorCode::UnsupportedOs,
            ErrorCode::UnsupportedArch,
            ErrorCode::PathAccess,
            ErrorCode::CorruptedSettingsFile,
            ErrorCode::Io,
            ErrorCode::ArtifactNotAvailable,
            ErrorCode::DownloadFailed,
            ErrorCode::ChecksumMismatch,
            ErrorCode::CorruptedArchive,
            ErrorCode::CatalogUnavailable,
            ErrorCode::InvalidVersionSpec,
            ErrorCode::InvalidAlias,
            ErrorCode::InstallationNotFound,
            ErrorCode::ProxyGenerationFailed,
            ErrorCode::SyncFailed,
            ErrorCode::LockFailed,
            ErrorCode::Cancelled,
            ErrorCode::Unclassified,
        ];
        let mut exits: Vec<i32> = codes.iter().map(|c| c.exit_code()).collect();
        exits.sort_unstable();
        exits.dedup();
        assert_eq!(exits.len(), codes.len());

        let mut ids: Vec<&str> = codes.iter().map(|c| c.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), codes.len());
    }

    #[test]
    fn lock_failed_exit_code_is_sixty() {
        assert_eq!(ErrorCode::LockFailed.exit_code(), 60);
    }

    #[test]
    fn cancelled_is_distinct_from_unclassified() {
        assert_ne!(
            ErrorCode::Cancelled.exit_code(),
            ErrorCode::Unclassified.exit_code()
        );
    }

    #[test]
    fn hinted_errors_expose_hints() {
        let err = KnotError::LockFailed {
            scope: "registry".into(),
            timeout_secs: 30,
        };
        assert!(err.hint().is_some());
        assert_eq!(err.code().exit_code(), 60);
    }
}
