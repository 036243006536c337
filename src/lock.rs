//! Cross-process advisory locking.
//!
//! Independent knot processes synchronize through exclusive lock files
//! under `locks/`, one per scope: the whole registry, or a single alias.
//! A lock file records the holder's PID and acquisition time as TOML so a
//! stuck lock can be inspected by hand. A lock whose recorded PID is no
//! longer running is stale and reclaimed by the next acquire.

use crate::error::{KnotError, Result};
use crate::paths::KnotPaths;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What a lock protects.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockScope {
    /// The registry file and the active pointer.
    Registry,
    /// One alias's installation directory and registry row.
    Alias(String),
}

impl LockScope {
    fn file_name(&self) -> String {
        match self {
            Self::Registry => "registry.lock".to_string(),
            Self::Alias(alias) => format!("alias-{alias}.lock"),
        }
    }
}

impl std::fmt::Display for LockScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Registry => write!(f, "registry"),
            Self::Alias(alias) => write!(f, "alias '{alias}'"),
        }
    }
}

/// On-disk contents of a lock file.
#[derive(Debug, Serialize, Deserialize)]
struct LockRecord {
    pid: u32,
    acquired_at: DateTime<Utc>,
    scope: String,
}

/// An acquired lock. Released on drop; `release` is idempotent.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    scope: LockScope,
    released: bool,
}

impl LockGuard {
    pub fn scope(&self) -> &LockScope {
        &self.scope
    }

    /// Release the lock. Safe to call more than once.
    pub fn release(&mut self) {
        if !self.released {
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed to remove lock file {}: {e}", self.path.display());
                }
            }
            self.released = true;
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release();
    }
}

pub struct LockManager {
    locks_dir: PathBuf,
}

impl LockManager {
    pub fn new(paths: &KnotPaths) -> Self {
        Self {
            locks_dir: paths.locks_dir(),
        }
    }

    /// Acquire an exclusive lock for `scope`, blocking up to `timeout`.
    ///
    /// Fails with `LockFailed` once the timeout elapses. Stale locks
    /// (holder PID not running, or an unreadable record from a crashed
    /// writer) are reclaimed.
    pub fn acquire(&self, scope: LockScope, timeout: Duration) -> Result<LockGuard> {
        std::fs::create_dir_all(&self.locks_dir)?;
        let path = self.locks_dir.join(scope.file_name());
        let deadline = Instant::now() + timeout;

        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(mut file) => {
                    let record = LockRecord {
                        pid: std::process::id(),
                        acquired_at: Utc::now(),
                        scope: scope.to_string(),
                    };
                    let content = toml::to_string(&record)
                        .map_err(|e| KnotError::Other(anyhow::anyhow!(e)))?;
                    file.write_all(content.as_bytes())?;
                    debug!("acquired {scope} lock at {}", path.display());
                    return Ok(LockGuard {
                        path,
                        scope,
                        released: false,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if self.reclaim_if_stale(&path) {
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(KnotError::LockFailed {
                            scope: scope.to_string(),
                            timeout_secs: timeout.as_secs(),
                        });
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Remove the lock file if its holder is gone. Returns true if the
    /// file was removed (or vanished concurrently).
    fn reclaim_if_stale(&self, path: &std::path::Path) -> bool {
        let record = match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str::<LockRecord>(&content) {
                Ok(record) => record,
                Err(_) => {
                    // A torn write from a crashed holder.
                    warn!("reclaiming unreadable lock file {}", path.display());
                    return remove_lock_file(path);
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return true,
            Err(_) => return false,
        };

        if record.pid == std::process::id() {
            // Our own scope is already held; never self-reclaim.
            return false;
        }
        if process_is_alive(record.pid) {
            return false;
        }
        warn!(
            "reclaiming stale lock {} held by dead pid {}",
            path.display(),
            record.pid
        );
        remove_lock_file(path)
    }
}

fn remove_lock_file(path: &std::path::Path) -> bool {
    match std::fs::remove_file(path) {
        Ok(()) => true,
        Err(e) => e.kind() == std::io::ErrorKind::NotFound,
    }
}

/// Check whether a PID belongs to a running process.
fn process_is_alive(pid: u32) -> bool {
    let system = sysinfo::System::new_all();
    system.process(sysinfo::Pid::from_u32(pid)).is_some()
}
