//! The Installer Dispatcher (spec §4.G): `Execute(plan, cfg, facts) -> stream of EventRecord`.
//!
//! Serial execution, one item at a time, in plan order. A failure of one
//! item does not abort the plan; a failed dependency skips its dependents
//! with `DependencyFailed`. Per-type command construction (`msiexec`,
//! `choco`, `Add-AppxPackage`, raw exe/ps1) is grounded on the teacher's
//! `package_store/windows.rs` installer/uninstaller invocation (command
//! splitting via `sys::args`, `Command::new(&prog).args(&args).output()`,
//! the `QuietUninstallString` registry read for native uninstall).

use std::path::{Path, PathBuf};
use std::process::Command;

use cimian_types::{CatalogItem, EventStatus, Installer, InstallerType, Uninstaller, UninstallOp};
use thiserror::Error;
use zip::ZipArchive;

use crate::config::Config;
use crate::evaluate::{self, Decision};
use crate::fetch::{CredentialProvider, FetchError, Fetcher};
use crate::plan::PlanAction;
use crate::script;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("architecture mismatch for {0}")]
    ArchitectureMismatch(String),
    #[error("download failed for {0}")]
    DownloadError(String, #[source] FetchError),
    #[error("installed artifact hash did not match for {0}")]
    HashMismatch(String),
    #[error("installer exited with an unexpected status for {0}: {1:?}")]
    InstallerFailure(String, Option<i32>),
    #[error("script failed for {0}")]
    ScriptError(String, #[source] script::ScriptError),
    #[error("skipped because a dependency failed")]
    DependencyFailed,
    #[error("blocked by policy: {0}")]
    PolicyBlocked(String),
}

#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub item_name: String,
    pub status: EventStatus,
    pub message: Option<String>,
}

fn normalize_switches(switches: &[String]) -> Vec<String> {
    switches
        .iter()
        .map(|s| {
            if s.starts_with('/') || s.starts_with('-') {
                s.clone()
            } else {
                format!("/{}", s)
            }
        })
        .collect()
}

fn normalize_flags(flags: &[String]) -> Vec<String> {
    flags
        .iter()
        .map(|f| {
            if f.starts_with("--") || f.starts_with('-') {
                f.clone()
            } else {
                format!("--{}", f)
            }
        })
        .collect()
}

fn msi_success(status: &std::process::ExitStatus) -> bool {
    matches!(status.code(), Some(0) | Some(3010))
}

fn cache_path_for(cache_root: &Path, item: &CatalogItem, installer: &Installer) -> PathBuf {
    let filename = installer
        .location
        .rsplit('/')
        .next()
        .unwrap_or(&installer.location);
    cache_root.join(format!("{}-{}-{}", item.name, item.version.as_str(), filename))
}

/// Extracts `tools/chocolateyBeforeInstall.ps1` from a `.nupkg` archive (a
/// zip container) into a temp file, if present.
fn extract_chocolatey_before_install(nupkg_path: &Path) -> Option<PathBuf> {
    let file = std::fs::File::open(nupkg_path).ok()?;
    let mut archive = ZipArchive::new(file).ok()?;
    let mut entry = archive.by_name("tools/chocolateyBeforeInstall.ps1").ok()?;

    let mut out = tempfile::Builder::new().suffix(".ps1").tempfile().ok()?;
    std::io::copy(&mut entry, &mut out).ok()?;
    let (_, path) = out.keep().ok()?;
    Some(path)
}

async fn fetch_installer(
    fetcher: &Fetcher<'_>,
    cache_root: &Path,
    item: &CatalogItem,
    installer: &Installer,
) -> Result<PathBuf, DispatchError> {
    let dest = cache_path_for(cache_root, item, installer);
    fetcher
        .fetch(&installer.location, Some(&installer.hash), &dest)
        .await
        .map_err(|e| DispatchError::DownloadError(item.name.clone(), e))?;
    Ok(dest)
}

fn run_preinstall_or_postinstall(
    script_text: Option<&str>,
    force_bypass: bool,
    item_name: &str,
) -> Result<(), DispatchError> {
    let Some(script_text) = script_text else {
        return Ok(());
    };
    let status = script::run_inline(script_text, &[], force_bypass)
        .map_err(|e| DispatchError::ScriptError(item_name.to_string(), e))?;
    if status != 0 {
        return Err(DispatchError::InstallerFailure(item_name.to_string(), Some(status)));
    }
    Ok(())
}

fn run_primary_install(
    item: &CatalogItem,
    installer: &Installer,
    artifact_path: &Path,
    cfg: &Config,
) -> Result<(), DispatchError> {
    match installer.installer_type {
        InstallerType::Msi => {
            let mut command = Command::new("msiexec");
            command
                .arg("/i")
                .arg(artifact_path)
                .arg("/qn")
                .arg("/norestart")
                .args(&installer.arguments);
            let output = command
                .output()
                .map_err(|_| DispatchError::InstallerFailure(item.name.clone(), None))?;
            if !msi_success(&output.status) {
                return Err(DispatchError::InstallerFailure(
                    item.name.clone(),
                    output.status.code(),
                ));
            }
        }
        InstallerType::Exe => {
            let output = Command::new(artifact_path)
                .args(&installer.arguments)
                .output()
                .map_err(|_| DispatchError::InstallerFailure(item.name.clone(), None))?;
            if output.status.code() != Some(0) {
                return Err(DispatchError::InstallerFailure(
                    item.name.clone(),
                    output.status.code(),
                ));
            }
        }
        InstallerType::Nupkg => {
            let package_id = item.name.clone();
            let mut command = Command::new("choco");
            command
                .arg("install")
                .arg(&package_id)
                .arg("--version")
                .arg(item.version.as_str())
                .arg("--source")
                .arg(artifact_path.parent().unwrap_or_else(|| Path::new(".")))
                .arg("-y")
                .arg("--force")
                .args(&installer.arguments);
            let output = command
                .output()
                .map_err(|_| DispatchError::InstallerFailure(item.name.clone(), None))?;
            if !msi_success(&output.status) {
                return Err(DispatchError::InstallerFailure(
                    item.name.clone(),
                    output.status.code(),
                ));
            }
        }
        InstallerType::Msix => {
            let script = format!("Add-AppxPackage -Path '{}'", artifact_path.display());
            let status = script::run_inline(&script, &[], cfg.force_execution_policy_bypass)
                .map_err(|e| DispatchError::ScriptError(item.name.clone(), e))?;
            if status != 0 {
                return Err(DispatchError::InstallerFailure(item.name.clone(), Some(status)));
            }
        }
        InstallerType::Ps1 => {
            let status = script::run_powershell_file(
                artifact_path,
                &installer.arguments,
                cfg.force_execution_policy_bypass,
            )
            .map_err(|e| DispatchError::ScriptError(item.name.clone(), e))?;
            if status != 0 {
                return Err(DispatchError::InstallerFailure(item.name.clone(), Some(status)));
            }
        }
        InstallerType::Bat | InstallerType::Nopkg => {
            // nopkg is purely state: considered installed once scripts run.
        }
    }
    Ok(())
}

/// Executes a single planned install/update candidate end to end: fetch,
/// NUPKG pre-hook, pre/post scripts, primary install, and a re-evaluate
/// verify step. Returns the outcome for the Reporter.
pub async fn execute_install(
    item: &CatalogItem,
    cfg: &Config,
    facts: &cimian_types::SystemFacts,
    cache_root: &Path,
    credentials: &dyn CredentialProvider,
) -> DispatchOutcome {
    if !item.supports_arch(&facts.arch) {
        return DispatchOutcome {
            item_name: item.name.clone(),
            status: EventStatus::Warning,
            message: Some(format!("architecture mismatch for {}", item.name)),
        };
    }

    let installer = match &item.installer {
        Some(i) => i,
        None => {
            return DispatchOutcome {
                item_name: item.name.clone(),
                status: EventStatus::Failed,
                message: Some("catalog item has no installer".to_string()),
            }
        }
    };

    let fetcher = Fetcher::new(cfg, credentials);
    let artifact_path = match fetch_installer(&fetcher, cache_root, item, installer).await {
        Ok(p) => p,
        Err(e) => {
            return DispatchOutcome {
                item_name: item.name.clone(),
                status: EventStatus::Warning,
                message: Some(e.to_string()),
            }
        }
    };

    if installer.installer_type == InstallerType::Nupkg {
        if let Some(hook) = extract_chocolatey_before_install(&artifact_path) {
            if let Err(e) =
                script::run_powershell_file(&hook, &[], cfg.force_execution_policy_bypass)
            {
                log::warn!(
                    "chocolateyBeforeInstall hook failed for {}: {}",
                    item.name,
                    e
                );
            }
        }
    }

    if let Err(e) = run_preinstall_or_postinstall(
        item.scripts.preinstall_script.as_deref(),
        cfg.force_execution_policy_bypass,
        &item.name,
    ) {
        return DispatchOutcome {
            item_name: item.name.clone(),
            status: EventStatus::Failed,
            message: Some(e.to_string()),
        };
    }

    if let Err(e) = run_primary_install(item, installer, &artifact_path, cfg) {
        return DispatchOutcome {
            item_name: item.name.clone(),
            status: EventStatus::Failed,
            message: Some(e.to_string()),
        };
    }

    if let Err(e) = run_preinstall_or_postinstall(
        item.scripts.postinstall_script.as_deref(),
        cfg.force_execution_policy_bypass,
        &item.name,
    ) {
        return DispatchOutcome {
            item_name: item.name.clone(),
            status: EventStatus::Failed,
            message: Some(e.to_string()),
        };
    }

    let evaluated = evaluate::evaluate(item, facts);
    let still_pending = evaluated.installed_version.is_none()
        || evaluated
            .installed_version
            .as_ref()
            .map(|v| *v < item.version)
            .unwrap_or(true);

    if still_pending {
        return DispatchOutcome {
            item_name: item.name.clone(),
            status: EventStatus::Warning,
            message: Some("installer reported success but item verify failed".to_string()),
        };
    }

    DispatchOutcome {
        item_name: item.name.clone(),
        status: EventStatus::Success,
        message: None,
    }
}

#[cfg(windows)]
fn delete_registry_key(path: &str) -> Result<(), DispatchError> {
    use winreg::enums::*;
    use winreg::RegKey;
    let hklm = RegKey::predef(HKEY_LOCAL_MACHINE);
    hklm.delete_subkey_all(path)
        .map_err(|_| DispatchError::InstallerFailure(path.to_string(), None))
}

#[cfg(not(windows))]
fn delete_registry_key(_path: &str) -> Result<(), DispatchError> {
    Ok(())
}

fn run_uninstall_op(op: &UninstallOp, cfg: &Config) -> Result<(), DispatchError> {
    match op {
        UninstallOp::File { path } => {
            std::fs::remove_file(path).map_err(|_| {
                DispatchError::InstallerFailure(path.clone(), None)
            })
        }
        UninstallOp::Directory { path } => std::fs::remove_dir_all(path)
            .map_err(|_| DispatchError::InstallerFailure(path.clone(), None)),
        UninstallOp::Registry { path } => delete_registry_key(path),
        UninstallOp::Application { path, switches, flags } => {
            let mut args = normalize_switches(switches);
            args.extend(normalize_flags(flags));
            let output = Command::new(path)
                .args(&args)
                .output()
                .map_err(|_| DispatchError::InstallerFailure(path.clone(), None))?;
            if output.status.code() != Some(0) {
                return Err(DispatchError::InstallerFailure(path.clone(), output.status.code()));
            }
            Ok(())
        }
        UninstallOp::Msi { product_code, switches, flags } => {
            let mut args = vec!["/x".to_string(), product_code.clone(), "/qn".to_string(), "/norestart".to_string()];
            args.extend(normalize_switches(switches));
            args.extend(normalize_flags(flags));
            let output = Command::new("msiexec")
                .args(&args)
                .output()
                .map_err(|_| DispatchError::InstallerFailure(product_code.clone(), None))?;
            if !msi_success(&output.status) {
                return Err(DispatchError::InstallerFailure(product_code.clone(), output.status.code()));
            }
            Ok(())
        }
        UninstallOp::Exe { path, switches, flags } => {
            let mut args = normalize_switches(switches);
            args.extend(normalize_flags(flags));
            let output = Command::new(path)
                .args(&args)
                .output()
                .map_err(|_| DispatchError::InstallerFailure(path.clone(), None))?;
            if output.status.code() != Some(0) {
                return Err(DispatchError::InstallerFailure(path.clone(), output.status.code()));
            }
            Ok(())
        }
        UninstallOp::Ps1 { path, switches, flags } => {
            let mut args = normalize_switches(switches);
            args.extend(normalize_flags(flags));
            let status = script::run_powershell_file(
                Path::new(path),
                &args,
                cfg.force_execution_policy_bypass,
            )
            .map_err(|e| DispatchError::ScriptError(path.clone(), e))?;
            if status != 0 {
                return Err(DispatchError::InstallerFailure(path.clone(), Some(status)));
            }
            Ok(())
        }
    }
}

fn run_native_uninstall(uninstaller: &Uninstaller, cfg: &Config) -> Result<(), DispatchError> {
    match uninstaller.installer_type {
        InstallerType::Msi => {
            let location = uninstaller
                .location
                .as_deref()
                .ok_or_else(|| DispatchError::InstallerFailure("uninstaller".to_string(), None))?;
            let mut command = Command::new("msiexec");
            command.arg("/x").arg(location).arg("/qn").arg("/norestart").args(&uninstaller.arguments);
            let output = command
                .output()
                .map_err(|_| DispatchError::InstallerFailure(location.to_string(), None))?;
            if !msi_success(&output.status) {
                return Err(DispatchError::InstallerFailure(location.to_string(), output.status.code()));
            }
            Ok(())
        }
        InstallerType::Nupkg => {
            let output = Command::new("choco")
                .arg("uninstall")
                .arg(&uninstaller.location.clone().unwrap_or_default())
                .arg("-y")
                .args(&uninstaller.arguments)
                .output()
                .map_err(|_| DispatchError::InstallerFailure("choco uninstall".to_string(), None))?;
            if !msi_success(&output.status) {
                return Err(DispatchError::InstallerFailure("choco uninstall".to_string(), output.status.code()));
            }
            Ok(())
        }
        InstallerType::Msix => {
            let script = format!(
                "Remove-AppxPackage -Package '{}'",
                uninstaller.location.clone().unwrap_or_default()
            );
            let status = script::run_inline(&script, &[], cfg.force_execution_policy_bypass)
                .map_err(|e| DispatchError::ScriptError("msix uninstall".to_string(), e))?;
            if status != 0 {
                return Err(DispatchError::InstallerFailure("msix uninstall".to_string(), Some(status)));
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Executes a planned uninstall: preuninstall script, then the explicit
/// `uninstaller` block if present, else the ordered `uninstalls[]`
/// primitives, else nothing; then postuninstall script.
pub fn execute_uninstall(item: &CatalogItem, cfg: &Config) -> DispatchOutcome {
    if !evaluate::effective_uninstallable(item) {
        return DispatchOutcome {
            item_name: item.name.clone(),
            status: EventStatus::Warning,
            message: Some("uninstall blocked: item is marked not uninstallable".to_string()),
        };
    }

    if let Err(e) = run_preinstall_or_postinstall(
        item.scripts.preuninstall_script.as_deref(),
        cfg.force_execution_policy_bypass,
        &item.name,
    ) {
        return DispatchOutcome {
            item_name: item.name.clone(),
            status: EventStatus::Failed,
            message: Some(e.to_string()),
        };
    }

    let removal_result = if let Some(uninstaller) = &item.uninstaller {
        run_native_uninstall(uninstaller, cfg)
    } else if !item.uninstalls.is_empty() {
        item.uninstalls
            .iter()
            .try_for_each(|op| run_uninstall_op(op, cfg))
    } else if let Some(installer) = &item.installer {
        run_native_uninstall(
            &Uninstaller {
                location: Some(installer.location.clone()),
                hash: None,
                installer_type: installer.installer_type,
                arguments: vec![],
            },
            cfg,
        )
    } else {
        Ok(())
    };

    if let Err(e) = removal_result {
        return DispatchOutcome {
            item_name: item.name.clone(),
            status: EventStatus::Failed,
            message: Some(e.to_string()),
        };
    }

    if let Err(e) = run_preinstall_or_postinstall(
        item.scripts.postuninstall_script.as_deref(),
        cfg.force_execution_policy_bypass,
        &item.name,
    ) {
        return DispatchOutcome {
            item_name: item.name.clone(),
            status: EventStatus::Failed,
            message: Some(e.to_string()),
        };
    }

    DispatchOutcome {
        item_name: item.name.clone(),
        status: EventStatus::Success,
        message: None,
    }
}

pub fn action_is_removal(action: PlanAction) -> bool {
    matches!(action, PlanAction::Uninstall)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_switches_adds_slash() {
        let result = normalize_switches(&["quiet".to_string(), "/S".to_string(), "-y".to_string()]);
        assert_eq!(result, vec!["/quiet".to_string(), "/S".to_string(), "-y".to_string()]);
    }

    #[test]
    fn test_normalize_flags_adds_double_dash() {
        let result = normalize_flags(&["force".to_string(), "-y".to_string(), "--already".to_string()]);
        assert_eq!(result, vec!["--force".to_string(), "-y".to_string(), "--already".to_string()]);
    }
}
