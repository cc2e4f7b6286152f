//! Trigger files (spec §4.K, §6 "Trigger files"): UTF-8 marker files whose
//! existence and modification time drive the Watcher Service's polling loop.
//! Content is ignored by readers; by convention the first line names the
//! triggering tool, matching the teacher's convention for its own marker
//! files (`ext.rs`'s `tag` helpers).

use std::path::{Path, PathBuf};

use thiserror::Error;

pub const BOOTSTRAP_TRIGGER_NAME: &str = ".cimian.bootstrap";
pub const HEADLESS_TRIGGER_NAME: &str = ".cimian.headless";

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("could not write trigger file at {}", path.display())]
    Write { path: PathBuf, #[source] source: std::io::Error },
    #[error("could not remove trigger file at {}", path.display())]
    Remove { path: PathBuf, #[source] source: std::io::Error },
}

fn write_trigger(path: &Path, tool_name: &str) -> Result<(), TriggerError> {
    std::fs::write(path, format!("{}\n", tool_name)).map_err(|source| TriggerError::Write {
        path: path.to_path_buf(),
        source,
    })
}

fn remove_trigger(path: &Path) -> Result<(), TriggerError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(TriggerError::Remove { path: path.to_path_buf(), source }),
    }
}

pub fn set_bootstrap_mode(root: &Path, tool_name: &str) -> Result<(), TriggerError> {
    write_trigger(&root.join(BOOTSTRAP_TRIGGER_NAME), tool_name)
}

pub fn clear_bootstrap_mode(root: &Path) -> Result<(), TriggerError> {
    remove_trigger(&root.join(BOOTSTRAP_TRIGGER_NAME))
}

pub fn set_headless_mode(root: &Path, tool_name: &str) -> Result<(), TriggerError> {
    write_trigger(&root.join(HEADLESS_TRIGGER_NAME), tool_name)
}

pub fn clear_headless_mode(root: &Path) -> Result<(), TriggerError> {
    remove_trigger(&root.join(HEADLESS_TRIGGER_NAME))
}

pub fn is_bootstrap_set(root: &Path) -> bool {
    root.join(BOOTSTRAP_TRIGGER_NAME).exists()
}

pub fn is_headless_set(root: &Path) -> bool {
    root.join(HEADLESS_TRIGGER_NAME).exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_then_clear_bootstrap_mode() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_bootstrap_set(dir.path()));
        set_bootstrap_mode(dir.path(), "managedsoftwareupdate").unwrap();
        assert!(is_bootstrap_set(dir.path()));
        clear_bootstrap_mode(dir.path()).unwrap();
        assert!(!is_bootstrap_set(dir.path()));
    }

    #[test]
    fn test_clear_is_idempotent_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        clear_bootstrap_mode(dir.path()).unwrap();
        clear_headless_mode(dir.path()).unwrap();
    }
}
