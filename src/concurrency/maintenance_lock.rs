//! Cross-process maintenance lock using advisory file locking (fs2 flock).
//!
//! Serializes reconciliation and cache maintenance across processes
//! (server startup, CLI) so a purge never interleaves with a prune.

use anyhow::Result;
use fs2::FileExt;
use std::fs::{self, File};
use std::path::PathBuf;

use crate::paths::Paths;

/// Advisory file lock for maintenance sweeps.
#[derive(Clone)]
pub struct MaintenanceLock {
    path: PathBuf,
}

/// RAII guard that releases the lock on drop.
pub struct MaintenanceLockGuard {
    file: File,
}

impl Drop for MaintenanceLockGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

impl MaintenanceLock {
    /// The lock file is placed in the runtime directory (or state directory fallback).
    pub fn new(paths: &Paths) -> Result<Self> {
        let path = paths.maintenance_lock();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }

    /// Blocking acquire. Call from `spawn_blocking` inside async code.
    pub fn acquire(&self) -> Result<MaintenanceLockGuard> {
        let file = File::create(&self.path)?;
        file.lock_exclusive()?;
        Ok(MaintenanceLockGuard { file })
    }

    /// Acquire without blocking the async runtime.
    pub async fn acquire_async(&self) -> Result<MaintenanceLockGuard> {
        let lock = self.clone();
        tokio::task::spawn_blocking(move || lock.acquire()).await?
    }

    /// Non-blocking try-acquire. Returns `None` if another process holds it.
    pub fn try_acquire(&self) -> Result<Option<MaintenanceLockGuard>> {
        let file = File::create(&self.path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(MaintenanceLockGuard { file })),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            #[cfg(unix)]
            Err(ref e) if e.raw_os_error() == Some(35) || e.raw_os_error() == Some(11) => {
                // EAGAIN(11) / EWOULDBLOCK(35 on macOS): lock contention
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}
