//! The Self-Update Scheduler (spec §4.H): `CheckAndDefer(plan) -> Plan'`.
//!
//! Identifies plan candidates that are Cimian itself (by name or by an
//! installer path segment) and diverts them to a deferred marker file
//! instead of letting the Dispatcher execute them in-process; the Watcher
//! Service consumes the marker on its next restart.

use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::Utc;
use cimian_types::InstallerType;
use thiserror::Error;

use crate::catalog::{ByNameResult, CatalogIndex};
use crate::plan::{PlanAction, PlanCandidate};

pub const SELFUPDATE_MARKER_NAME: &str = ".cimian.selfupdate";

/// Where Cimian itself is installed. Used only by [`apply_pending`] to back
/// up the current install before reinstalling over it.
const CIMIAN_INSTALL_DIR: &str = r"C:\Program Files\Cimian";
const SELFUPDATE_BACKUP_DIR_NAME: &str = "SelfUpdateBackup";

const SELF_NAMES: &[&str] = &["cimian", "cimiantools"];
const SELF_PATH_PREFIXES: &[&str] = &["/cimian-", "/cimiantools-"];
const EXCLUDED_TOOL_NAMES: &[&str] = &[
    "cimianpreflight",
    "cimianauth",
    "cimianbrowser",
    "cimianhelper",
    "cimianconfig",
    "cimianreport",
    "cimianlog",
];

#[derive(Debug, Error)]
pub enum SelfUpdateError {
    #[error("could not write self-update marker at {}", path.display())]
    Write { path: PathBuf, #[source] source: std::io::Error },
}

fn is_self_name(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    if EXCLUDED_TOOL_NAMES.contains(&lower.as_str()) {
        return false;
    }
    SELF_NAMES.contains(&lower.as_str())
}

fn installer_path_is_self(location: &str) -> bool {
    let lower = location.to_ascii_lowercase();
    SELF_PATH_PREFIXES.iter().any(|prefix| lower.contains(prefix))
}

fn is_self_candidate(candidate: &PlanCandidate, catalog: &CatalogIndex, arch: &str) -> bool {
    if is_self_name(&candidate.name) {
        return true;
    }
    if let ByNameResult::Found(item) = catalog.by_name(&candidate.name, arch) {
        if let Some(installer) = &item.installer {
            return installer_path_is_self(&installer.location);
        }
    }
    false
}

/// Splits `candidates` into (items the Dispatcher should still execute,
/// items diverted to a deferred self-update).
pub fn check_and_defer(
    candidates: Vec<PlanCandidate>,
    catalog: &CatalogIndex,
    arch: &str,
) -> (Vec<PlanCandidate>, Vec<PlanCandidate>) {
    let mut execute = Vec::new();
    let mut deferred = Vec::new();

    for candidate in candidates {
        if matches!(candidate.action, PlanAction::Install | PlanAction::Update)
            && is_self_candidate(&candidate, catalog, arch)
        {
            deferred.push(candidate);
        } else {
            execute.push(candidate);
        }
    }

    (execute, deferred)
}

/// Writes the deferred self-update marker (spec §6: `Key: Value` lines,
/// `ScheduledAt` in RFC 3339) for the first deferred candidate that has a
/// resolved installer artifact fetched to `local_file`.
pub fn write_marker(
    root: &Path,
    item_name: &str,
    version: &str,
    installer_type: InstallerType,
    local_file: &Path,
) -> Result<(), SelfUpdateError> {
    let path = root.join(SELFUPDATE_MARKER_NAME);
    let mut file = std::fs::File::create(&path).map_err(|source| SelfUpdateError::Write {
        path: path.clone(),
        source,
    })?;

    writeln!(file, "Item: {}", item_name)
        .and_then(|_| writeln!(file, "Version: {}", version))
        .and_then(|_| writeln!(file, "InstallerType: {:?}", installer_type))
        .and_then(|_| writeln!(file, "LocalFile: {}", local_file.display()))
        .and_then(|_| writeln!(file, "ScheduledAt: {}", Utc::now().to_rfc3339()))
        .map_err(|source| SelfUpdateError::Write { path, source })
}

/// Reads back the marker written by [`write_marker`] as a `Key: Value` map,
/// for the Watcher Service to consume on restart.
pub fn read_marker(
    root: &Path,
) -> Result<Option<std::collections::HashMap<String, String>>, SelfUpdateError> {
    let path = root.join(SELFUPDATE_MARKER_NAME);
    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(SelfUpdateError::Write { path, source }),
    };

    let mut map = std::collections::HashMap::new();
    for line in contents.lines() {
        if let Some((key, value)) = line.split_once(": ") {
            map.insert(key.to_string(), value.to_string());
        }
    }
    Ok(Some(map))
}

pub fn clear_marker(root: &Path) -> Result<(), SelfUpdateError> {
    let path = root.join(SELFUPDATE_MARKER_NAME);
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(SelfUpdateError::Write { path, source }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelfUpdateOutcome {
    NothingPending,
    Applied,
    Failed,
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

fn msi_reinstall_success(status: &std::process::ExitStatus) -> bool {
    matches!(status.code(), Some(0) | Some(3010))
}

/// Applies the deferred self-update marker written by [`write_marker`]
/// (spec §4.H): backs up the current install directory to
/// `…\SelfUpdateBackup\`, reinstalls with upgrade semantics (MSI:
/// `REINSTALLMODE=vamus REINSTALL=ALL`), and restores the backup on
/// failure. Called by the Watcher Service on restart, and directly by
/// `managedsoftwareupdate --perform-selfupdate` to trigger the same path
/// manually rather than waiting for the next service restart.
pub fn apply_pending(root: &Path) -> Result<SelfUpdateOutcome, SelfUpdateError> {
    let marker = match read_marker(root)? {
        Some(m) => m,
        None => return Ok(SelfUpdateOutcome::NothingPending),
    };

    let local_file = match marker.get("LocalFile") {
        Some(f) => PathBuf::from(f),
        None => return Ok(SelfUpdateOutcome::NothingPending),
    };
    let installer_type = marker
        .get("InstallerType")
        .map(String::as_str)
        .unwrap_or("Msi");

    let install_dir = Path::new(CIMIAN_INSTALL_DIR);
    let backup_dir = root.join(SELFUPDATE_BACKUP_DIR_NAME);

    if install_dir.exists() {
        let _ = std::fs::remove_dir_all(&backup_dir);
        if let Err(e) = copy_dir_recursive(install_dir, &backup_dir) {
            log::warn!(
                "could not back up {} before self-update: {}",
                install_dir.display(),
                e
            );
        }
    }

    let succeeded = if installer_type == "Msi" {
        std::process::Command::new("msiexec")
            .args(&[
                "/i",
                &local_file.to_string_lossy(),
                "REINSTALLMODE=vamus",
                "REINSTALL=ALL",
                "/qn",
                "/norestart",
            ])
            .status()
            .map(|s| msi_reinstall_success(&s))
            .unwrap_or(false)
    } else {
        std::process::Command::new(&local_file)
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    };

    if succeeded {
        clear_marker(root)?;
        Ok(SelfUpdateOutcome::Applied)
    } else {
        if backup_dir.exists() {
            let _ = std::fs::remove_dir_all(install_dir);
            if let Err(e) = copy_dir_recursive(&backup_dir, install_dir) {
                log::error!(
                    "self-update failed and restoring the backup also failed: {}",
                    e
                );
            }
        }
        Ok(SelfUpdateOutcome::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(name: &str, action: PlanAction) -> PlanCandidate {
        PlanCandidate {
            name: name.to_string(),
            action,
            source_chain: vec![],
        }
    }

    #[test]
    fn test_self_name_is_deferred() {
        let catalog = CatalogIndex::default();
        let (execute, deferred) = check_and_defer(
            vec![candidate("Cimian", PlanAction::Update)],
            &catalog,
            "x64",
        );
        assert!(execute.is_empty());
        assert_eq!(deferred.len(), 1);
    }

    #[test]
    fn test_supporting_tool_is_not_deferred() {
        let catalog = CatalogIndex::default();
        let (execute, deferred) = check_and_defer(
            vec![candidate("CimianHelper", PlanAction::Install)],
            &catalog,
            "x64",
        );
        assert_eq!(execute.len(), 1);
        assert!(deferred.is_empty());
    }

    #[test]
    fn test_marker_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        write_marker(
            dir.path(),
            "Cimian",
            "2025.08.31.2030",
            InstallerType::Msi,
            Path::new(r"C:\ProgramData\ManagedInstalls\Cache\cimian.msi"),
        )
        .unwrap();

        let marker = read_marker(dir.path()).unwrap().unwrap();
        assert_eq!(marker.get("Item").unwrap(), "Cimian");
        assert_eq!(marker.get("Version").unwrap(), "2025.08.31.2030");

        clear_marker(dir.path()).unwrap();
        assert!(read_marker(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_apply_pending_with_no_marker_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = apply_pending(dir.path()).unwrap();
        assert_eq!(outcome, SelfUpdateOutcome::NothingPending);
    }
}
