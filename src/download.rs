//! Streaming artifact downloads with verification.
//!
//! Downloads stream into a temporary file next to the destination and are
//! promoted by an atomic rename only after the SHA-256 digest matches, so
//! a partial or corrupted transfer can never land in the cache. Transient
//! failures are retried with backoff; checksum mismatches are not, since
//! the same source would fail the same way.

use crate::cancel::CancelFlag;
use crate::catalog::USER_AGENT;
use crate::error::{KnotError, Result};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

const CHUNK_SIZE: usize = 64 * 1024;

/// Ephemeral transfer progress, streamed to the caller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DownloadProgress {
    pub bytes_downloaded: u64,
    pub total_bytes: Option<u64>,
    /// Percent complete in `[0, 100]`, or `-1.0` when the total is unknown.
    pub percent: f64,
}

impl DownloadProgress {
    pub fn new(bytes_downloaded: u64, total_bytes: Option<u64>) -> Self {
        let percent = match total_bytes {
            Some(total) if total > 0 => {
                (bytes_downloaded as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
            }
            _ => -1.0,
        };
        Self {
            bytes_downloaded,
            total_bytes,
            percent,
        }
    }
}

/// Successful download outcome.
#[derive(Debug, Clone)]
pub struct DownloadResult {
    pub path: PathBuf,
    pub bytes: u64,
    /// Always true on success: the digest matched `expected_checksum`.
    pub verified: bool,
}

pub type ProgressFn<'a> = &'a mut dyn FnMut(DownloadProgress);

pub struct Downloader {
    client: reqwest::blocking::Client,
    max_attempts: u32,
    backoff: Duration,
}

impl Downloader {
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(30))
            // No overall deadline: large artifacts stream for minutes. A
            // stalled read still times out and is retried as transient.
            .timeout(None::<Duration>)
            .read_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| KnotError::DownloadFailed {
                url: String::new(),
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            max_attempts: 3,
            backoff: Duration::from_millis(500),
        })
    }

    #[cfg(test)]
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Download `url` into `destination`, verifying against
    /// `expected_checksum` (lowercase hex SHA-256).
    ///
    /// Retries transient failures (timeouts, connection errors, 5xx) up to
    /// the attempt bound. A checksum mismatch discards the temp file and
    /// fails immediately.
    pub fn download(
        &self,
        url: &str,
        destination: &Path,
        expected_checksum: &str,
        on_progress: ProgressFn,
        cancel: &CancelFlag,
    ) -> Result<DownloadResult> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            cancel.check()?;
            match self.try_download(url, destination, expected_checksum, on_progress, cancel) {
                Ok(result) => return Ok(result),
                Err(err) if is_transient(&err) && attempt < self.max_attempts => {
                    let delay = self.backoff * 2u32.pow(attempt - 1);
                    warn!("download attempt {attempt} failed ({err}), retrying in {delay:?}");
                    std::thread::sleep(delay);
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn try_download(
        &self,
        url: &str,
        destination: &Path,
        expected_checksum: &str,
        on_progress: ProgressFn,
        cancel: &CancelFlag,
    ) -> Result<DownloadResult> {
        debug!("downloading {url}");
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| classify_reqwest_error(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(KnotError::DownloadFailed {
                url: url.to_string(),
                message: format!("HTTP {status}"),
            });
        }

        let total_bytes = response.content_length();
        let parent = destination.parent().ok_or_else(|| KnotError::PathAccess {
            path: destination.to_path_buf(),
            message: "destination has no parent directory".into(),
        })?;
        std::fs::create_dir_all(parent)?;

        // Stream into a temp file in the same directory so the final
        // promotion is a rename, never a copy.
        let mut temp = tempfile::NamedTempFile::new_in(parent)?;
        let mut hasher = Sha256::new();
        let mut reader = response;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut downloaded: u64 = 0;

        loop {
            cancel.check()?;
            let n = reader.read(&mut buf).map_err(|e| KnotError::DownloadFailed {
                url: url.to_string(),
                message: format!("transfer interrupted: {e}"),
            })?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            temp.write_all(&buf[..n])?;
            downloaded += n as u64;
            on_progress(DownloadProgress::new(downloaded, total_bytes));
        }
        temp.flush()?;

        // Temp file is dropped (and deleted) on mismatch; the caller
        // decides whether to try an alternate source.
        let actual = hex::encode(hasher.finalize());
        verify_checksum(destination, &actual, expected_checksum)?;

        temp.persist(destination)
            .map_err(|e| KnotError::PathAccess {
                path: destination.to_path_buf(),
                message: format!("could not promote download: {e}"),
            })?;

        Ok(DownloadResult {
            path: destination.to_path_buf(),
            bytes: downloaded,
            verified: true,
        })
    }

    /// Fetch the release's checksum manifest and extract the entry for
    /// `file_name`.
    ///
    /// A missing entry is a non-retryable `DownloadFailed`: the release
    /// simply does not publish that artifact's digest.
    pub fn fetch_checksum(&self, checksum_url: &str, file_name: &str) -> Result<String> {
        let response = self
            .client
            .get(checksum_url)
            .send()
            .map_err(|e| classify_reqwest_error(checksum_url, e))?;
        if !response.status().is_success() {
            return Err(KnotError::DownloadFailed {
                url: checksum_url.to_string(),
                message: format!("HTTP {}", response.status()),
            });
        }
        let body = response.text().map_err(|e| KnotError::DownloadFailed {
            url: checksum_url.to_string(),
            message: e.to_string(),
        })?;
        parse_checksum_manifest(&body, file_name).ok_or_else(|| KnotError::DownloadFailed {
            url: checksum_url.to_string(),
            message: format!("no checksum entry for {file_name}"),
        })
    }
}

/// Compare an actual digest against the expected one for `destination`.
///
/// The expected digest is trimmed and lowercased before comparison, since
/// manifests are not consistent about case.
pub fn verify_checksum(destination: &Path, actual: &str, expected_checksum: &str) -> Result<()> {
    let expected = expected_checksum.trim().to_ascii_lowercase();
    if actual == expected {
        return Ok(());
    }
    let file_name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Err(KnotError::ChecksumMismatch {
        file_name,
        expected,
        actual: actual.to_string(),
    })
}

/// Parse a `SHASUMS256.txt` style manifest and return the digest recorded
/// for `file_name`, if any.
pub fn parse_checksum_manifest(body: &str, file_name: &str) -> Option<String> {
    // Lines look like: "<64 hex chars>  node-v20.12.2-linux-x64.tar.gz"
    let re = Regex::new(r"(?m)^([0-9a-fA-F]{64})\s+(\S+)$").ok()?;
    re.captures_iter(body)
        .find(|caps| &caps[2] == file_name)
        .map(|caps| caps[1].to_ascii_lowercase())
}

fn is_transient(err: &KnotError) -> bool {
    match err {
        KnotError::DownloadFailed { message, .. } => {
            message.starts_with("HTTP 5")
                || message.contains("timed out")
                || message.contains("connect")
                || message.contains("transfer interrupted")
        }
        _ => false,
    }
}

fn classify_reqwest_error(url: &str, e: reqwest::Error) -> KnotError {
    let message = if e.is_timeout() {
        format!("request timed out: {e}")
    } else if e.is_connect() {
        format!("connect error: {e}")
    } else {
        e.to_string()
    };
    KnotError::DownloadFailed {
        url: url.to_string(),
        message,
    }
}

/// Compute the SHA-256 digest of a file on disk as lowercase hex.
pub fn file_sha256(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
