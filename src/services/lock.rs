//! Single-instance lock for the supervisor.
//!
//! The lock file holds a JSON record naming the owning PID. A record whose
//! PID is no longer alive is stale and reclaimed on the next start.
//!
//! The record is written to a private temp file and hard-linked into place,
//! so the lock path never exists without a complete record behind it.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{GuardianError, Result};
use crate::services::process_table::is_pid_alive;

/// 比这更新的不可读锁文件视为仍在写入中
const SETTLE_TIME: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub pid: u32,
    pub created_at: DateTime<Utc>,
}

/// Read the lock file. `Ok(None)` when it does not exist; a corrupt record is an error.
pub fn read_record(path: &Path) -> Result<Option<LockRecord>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(GuardianError::Lock {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// The record of a supervisor that is currently alive, if any.
pub fn running_instance(path: &Path) -> Option<LockRecord> {
    read_record(path)
        .ok()
        .flatten()
        .filter(|record| is_pid_alive(record.pid))
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(GuardianError::Lock {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Raw content of the lock file, `None` when it is gone.
fn read_raw(path: &Path) -> Option<Vec<u8>> {
    fs::read(path).ok()
}

fn recently_modified(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .map_or(true, |age| age < SETTLE_TIME)
}

/// Remove the lock file only if it still holds `expected`.
fn remove_if_unchanged(path: &Path, expected: &[u8]) -> Result<()> {
    match read_raw(path) {
        Some(current) if current == expected => remove_if_exists(path),
        Some(_) => {
            log::debug!("Lock {} changed while reclaiming it", path.display());
            Ok(())
        }
        None => Ok(()),
    }
}

/// Create `path` holding `content`, failing with `AlreadyExists` if it is present.
fn publish(path: &Path, content: &[u8], pid: u32) -> io::Result<()> {
    let file_name = path
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or("guardian.lock");
    let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, pid));

    {
        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        f.write_all(content)?;
        let _ = f.sync_all();
    }

    let linked = fs::hard_link(&tmp, path);
    let _ = fs::remove_file(&tmp);
    linked
}

/// An acquired lock. The file is removed on release or drop.
#[derive(Debug)]
pub struct SingletonLock {
    path: PathBuf,
    pid: u32,
    released: bool,
}

impl SingletonLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        Self::acquire_with(path, std::process::id(), is_pid_alive)
    }

    /// Acquire on behalf of `pid`, deciding staleness with `is_alive`.
    pub fn acquire_with<F>(path: &Path, pid: u32, is_alive: F) -> Result<Self>
    where
        F: Fn(u32) -> bool,
    {
        let lock_err = |source: io::Error| GuardianError::Lock {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(lock_err)?;
        }

        let record = LockRecord {
            pid,
            created_at: Utc::now(),
        };
        let json = serde_json::to_vec(&record)?;

        // A second attempt covers a stale file removed between checks
        for _ in 0..2 {
            match publish(path, &json, pid) {
                Ok(()) => {
                    log::debug!("Acquired lock {} (pid {})", path.display(), pid);
                    return Ok(Self {
                        path: path.to_path_buf(),
                        pid,
                        released: false,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    let Some(raw) = read_raw(path) else {
                        continue;
                    };
                    match serde_json::from_slice::<LockRecord>(&raw) {
                        Ok(existing) if existing.pid != pid && is_alive(existing.pid) => {
                            return Err(GuardianError::StartupBlocked {
                                pid: existing.pid,
                                since: existing
                                    .created_at
                                    .to_rfc3339_opts(SecondsFormat::Secs, true),
                            });
                        }
                        Ok(existing) => {
                            log::warn!(
                                "Removing stale lock {} left by pid {}",
                                path.display(),
                                existing.pid
                            );
                            remove_if_unchanged(path, &raw)?;
                        }
                        Err(_) if recently_modified(path) => {
                            return Err(lock_err(io::Error::new(
                                io::ErrorKind::WouldBlock,
                                "lock record is still being written by another instance",
                            )));
                        }
                        Err(e) => {
                            log::warn!("Removing unreadable lock {}: {}", path.display(), e);
                            remove_if_unchanged(path, &raw)?;
                        }
                    }
                }
                Err(e) => return Err(lock_err(e)),
            }
        }

        Err(lock_err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "lock file reappeared while reclaiming it",
        )))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        // Another instance may have reclaimed the file after we lost it
        match read_record(&self.path) {
            Ok(Some(record)) if record.pid == self.pid => {
                if let Err(e) = remove_if_exists(&self.path) {
                    log::warn!("Failed to remove lock: {}", e);
                } else {
                    log::debug!("Released lock {}", self.path.display());
                }
            }
            Ok(Some(record)) => {
                log::warn!(
                    "Lock {} now names pid {}, leaving it in place",
                    self.path.display(),
                    record.pid
                );
            }
            Ok(None) => {}
            Err(e) => log::warn!("Failed to read lock on release: {}", e),
        }
    }
}

impl Drop for SingletonLock {
    fn drop(&mut self) {
        self.release_inner();
    }
}
