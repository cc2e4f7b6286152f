//! Exclusive advisory lock preventing overlapping Driver runs (spec §5):
//! `C:\ProgramData\ManagedInstalls\.cimian.runlock`. A second Driver
//! invocation that observes the lock held exits cleanly with
//! `AlreadyRunning` rather than blocking. Same sidecar-lock technique as
//! the Fetcher's per-destination `.lock` file (`fetch.rs`): the lock is
//! scoped to a closure rather than returned as a guard, so it always
//! releases at the end of the run with no risk of an unbounded lifetime.

use std::path::{Path, PathBuf};

use thiserror::Error;

pub const RUNLOCK_NAME: &str = ".cimian.runlock";

#[derive(Debug, Error)]
pub enum RunLockError {
    #[error("could not open runlock file at {}", path.display())]
    Open { path: PathBuf, #[source] source: std::io::Error },
    #[error("another Cimian run already holds the lock")]
    AlreadyRunning,
}

/// Runs `f` while holding the exclusive runlock at `root/.cimian.runlock`.
/// Returns `RunLockError::AlreadyRunning` without calling `f` if another
/// process already holds it.
pub fn with_runlock<F, T>(root: &Path, f: F) -> Result<T, RunLockError>
where
    F: FnOnce() -> T,
{
    let path = root.join(RUNLOCK_NAME);
    let file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(&path)
        .map_err(|source| RunLockError::Open { path, source })?;

    let mut lock = fd_lock::RwLock::new(file);
    let _guard = lock.try_write().map_err(|_| RunLockError::AlreadyRunning)?;

    Ok(f())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_run_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let result = with_runlock(dir.path(), || 42).unwrap();
        assert_eq!(result, 42);
    }

    #[test]
    fn test_runlock_releases_after_closure_returns() {
        let dir = tempfile::tempdir().unwrap();
        with_runlock(dir.path(), || ()).unwrap();
        // A second acquisition after the first closure returned must
        // succeed since the lock was released.
        with_runlock(dir.path(), || ()).unwrap();
    }
}
