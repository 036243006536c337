//! Host platform detection for Node.js artifact downloads.

use crate::error::{KnotError, Result};
use serde::{Deserialize, Serialize};

/// Operating systems with official Node.js binary distributions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatingSystem {
    Linux,
    MacOs,
    Windows,
}

/// CPU architectures with official Node.js binary distributions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    X64,
    Arm64,
}

/// A detected (OS, architecture) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
    pub os: OperatingSystem,
    pub arch: Architecture,
}

impl Platform {
    /// Detect the current host platform.
    ///
    /// Fails with `UnsupportedOs`/`UnsupportedArch` before anything else
    /// gets a chance to hit the network.
    pub fn detect() -> Result<Self> {
        let os = match std::env::consts::OS {
            "linux" => OperatingSystem::Linux,
            "macos" => OperatingSystem::MacOs,
            "windows" => OperatingSystem::Windows,
            other => return Err(KnotError::UnsupportedOs(other.to_string())),
        };
        let arch = match std::env::consts::ARCH {
            "x86_64" => Architecture::X64,
            "aarch64" => Architecture::Arm64,
            other => return Err(KnotError::UnsupportedArch(other.to_string())),
        };
        Ok(Self { os, arch })
    }

    /// The `{os}-{arch}` target used in Node.js archive names,
    /// e.g. `linux-x64` or `darwin-arm64`.
    pub fn artifact_target(&self) -> String {
        format!("{}-{}", self.os_str(), self.arch_str())
    }

    /// The key this platform uses in the catalog's `files` list.
    ///
    /// The upstream index distinguishes archive flavors per OS:
    /// `linux-x64`, `osx-arm64-tar`, `win-x64-zip`.
    pub fn index_file_key(&self) -> String {
        match self.os {
            OperatingSystem::Linux => format!("linux-{}", self.arch_str()),
            OperatingSystem::MacOs => format!("osx-{}-tar", self.arch_str()),
            OperatingSystem::Windows => format!("win-{}-zip", self.arch_str()),
        }
    }

    /// Archive extension for this platform's native format.
    pub fn archive_extension(&self) -> &'static str {
        match self.os {
            OperatingSystem::Windows => "zip",
            _ => "tar.gz",
        }
    }

    fn os_str(&self) -> &'static str {
        match self.os {
            OperatingSystem::Linux => "linux",
            OperatingSystem::MacOs => "darwin",
            OperatingSystem::Windows => "win",
        }
    }

    fn arch_str(&self) -> &'static str {
        match self.arch {
            Architecture::X64 => "x64",
            Architecture::Arm64 => "arm64",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.artifact_target())
    }
}

/// Archive filename for a version and platform,
/// e.g. `node-v20.12.2-linux-x64.tar.gz`.
pub fn archive_filename(version: &semver::Version, platform: Platform) -> String {
    format!(
        "node-v{}-{}.{}",
        version,
        platform.artifact_target(),
        platform.archive_extension()
    )
}

/// Download URL for a version and platform under the given mirror.
pub fn download_url(mirror: &str, version: &semver::Version, platform: Platform) -> String {
    format!(
        "{}/v{}/{}",
        mirror.trim_end_matches('/'),
        version,
        archive_filename(version, platform)
    )
}

/// URL of the checksum manifest published next to a release's artifacts.
pub fn checksum_url(mirror: &str, version: &semver::Version) -> String {
    format!("{}/v{}/SHASUMS256.txt", mirror.trim_end_matches('/'), version)
}
