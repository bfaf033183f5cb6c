use std::{
    fs::{self, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    process,
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Default age after which a lock left behind by a dead process is taken over.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(3600);

/// Errors from lock acquisition.
#[derive(Debug, Error)]
pub enum LockError {
    /// Filesystem failure while creating or inspecting the lock.
    #[error("lock io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Owner metadata written into the lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    /// Operation name the lock protects.
    pub operation: String,
    /// PID of the holder.
    pub pid: u32,
    /// Acquisition timestamp.
    pub acquired_at: DateTime<Utc>,
    /// Caller-provided context.
    #[serde(default)]
    pub extra: Value,
}

/// Advisory cross-process lock backed by exclusive file creation.
///
/// In-process contention is handled by the callers' own mutexes; this lock
/// only arbitrates between processes. A held lock whose file is older than
/// the stale threshold is considered abandoned and taken over.
#[derive(Debug, Clone)]
pub struct OperationLock {
    operation: String,
    path: PathBuf,
    stale_after: Duration,
}

impl OperationLock {
    /// Creates a lock handle for the given operation and path.
    #[must_use]
    pub fn new(operation: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            operation: operation.into(),
            path: path.into(),
            stale_after: DEFAULT_STALE_AFTER,
        }
    }

    /// Overrides the stale-takeover threshold.
    #[must_use]
    pub const fn stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Attempts to acquire the lock.
    ///
    /// Returns `Ok(Ok(guard))` on success and `Ok(Err(holder))` when another
    /// process holds it (holder metadata best-effort).
    pub fn acquire(&self, extra: Value) -> Result<Result<OperationGuard, Option<LockInfo>>, LockError> {
        if let Some(guard) = self.try_create(&extra)? {
            return Ok(Ok(guard));
        }
        // Existing lock: stale takeover when the file is old enough.
        if self.is_stale() {
            let _ = fs::remove_file(&self.path);
            if let Some(guard) = self.try_create(&extra)? {
                return Ok(Ok(guard));
            }
        }
        Ok(Err(self.holder()))
    }

    fn try_create(&self, extra: &Value) -> Result<Option<OperationGuard>, LockError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        match OpenOptions::new().write(true).create_new(true).open(&self.path) {
            Ok(mut file) => {
                let info = LockInfo {
                    operation: self.operation.clone(),
                    pid: process::id(),
                    acquired_at: Utc::now(),
                    extra: extra.clone(),
                };
                let _ = serde_json::to_writer(&mut file, &info);
                let _ = file.flush();
                Ok(Some(OperationGuard {
                    path: self.path.clone(),
                }))
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn is_stale(&self) -> bool {
        fs::metadata(&self.path)
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .is_some_and(|age| age > self.stale_after)
    }

    /// Best-effort read of the current holder's metadata.
    #[must_use]
    pub fn holder(&self) -> Option<LockInfo> {
        fs::read(&self.path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
    }
}

/// Held lock; releases (deletes the file) on drop.
#[derive(Debug)]
pub struct OperationGuard {
    path: PathBuf,
}

impl OperationGuard {
    /// Lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn second_acquire_is_refused_until_release() {
        let dir = tempdir().unwrap();
        let lock = OperationLock::new("knowledge_scan", dir.path().join("knowledge_scan.lock"));
        let guard = lock.acquire(json!({"iteration": 1})).unwrap().unwrap();
        let refused = lock.acquire(Value::Null).unwrap();
        let holder = refused.expect_err("lock should be held");
        assert_eq!(holder.unwrap().operation, "knowledge_scan");
        drop(guard);
        assert!(lock.acquire(Value::Null).unwrap().is_ok());
    }

    #[test]
    fn stale_lock_is_taken_over() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("daily.lock");
        fs::write(&path, b"{}").unwrap();
        let lock =
            OperationLock::new("daily", &path).stale_after(Duration::from_secs(0));
        std::thread::sleep(Duration::from_millis(20));
        assert!(lock.acquire(Value::Null).unwrap().is_ok());
    }
}
