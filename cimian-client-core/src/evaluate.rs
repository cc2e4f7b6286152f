//! The Item State Evaluator (spec §4.F): `Evaluate(item, facts) -> InstalledVersion`
//! plus `decide` for the install/update/uninstall decision table.
//!
//! Probes run in order, first hit wins: `installs[]` file entries,
//! `installs[]` registry entries, MSI product code lookup, then
//! `installcheck_script`. A failed or absent probe falls through to the
//! next; if none apply the item is considered not installed.

use std::path::Path;
use std::str::FromStr;

use cimian_types::{CatalogItem, InstallerType, InstallsEntry, SystemFacts, Uninstallable, Version};
use sha2::{Digest, Sha256};

use crate::resolve::Action;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Install,
    Update,
    Uninstall,
    Skip(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Satisfied,
    NothingToUpdate,
    AlreadyAbsent,
    PolicyBlocked,
}

/// The outcome of probing a single item against the live host.
#[derive(Debug, Clone)]
pub struct EvaluatedItem {
    pub installed_version: Option<Version>,
    pub reason: &'static str,
}

fn sha256_file(path: &Path) -> Option<String> {
    let bytes = std::fs::read(path).ok()?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Some(format!("{:x}", hasher.finalize()))
}

fn probe_installs_files(item: &CatalogItem) -> Option<Option<Version>> {
    let file_entries: Vec<&InstallsEntry> = item
        .installs
        .iter()
        .filter(|e| matches!(e, InstallsEntry::File { .. }))
        .collect();

    if file_entries.is_empty() {
        return None;
    }

    for entry in file_entries {
        if let InstallsEntry::File {
            path,
            version,
            md5checksum,
        } = entry
        {
            let path = Path::new(path);
            if !path.exists() {
                return Some(None);
            }
            if let Some(expected) = md5checksum {
                match sha256_file(path) {
                    Some(actual) if actual.eq_ignore_ascii_case(expected) => {}
                    _ => return Some(None),
                }
            }
            if let Some(v) = version {
                return Some(Version::from_str(v).ok());
            }
        }
    }

    // File(s) present, no version recorded on the entries: treat presence
    // as "installed, version unknown" by reporting the catalog's own
    // version so decision logic sees it as satisfied.
    Some(Some(item.version.clone()))
}

#[cfg(windows)]
fn probe_installs_registry(item: &CatalogItem) -> Option<Option<Version>> {
    use winreg::enums::*;
    use winreg::RegKey;

    let registry_entries: Vec<&InstallsEntry> = item
        .installs
        .iter()
        .filter(|e| matches!(e, InstallsEntry::Registry { .. }))
        .collect();

    if registry_entries.is_empty() {
        return None;
    }

    for entry in registry_entries {
        if let InstallsEntry::Registry { path, name, value } = entry {
            let hklm = RegKey::predef(HKEY_LOCAL_MACHINE);
            let key = match hklm.open_subkey(path) {
                Ok(k) => k,
                Err(_) => return Some(None),
            };
            let value_name = name.as_deref().unwrap_or("");
            let actual: Result<String, _> = key.get_value(value_name);
            match (actual, value) {
                (Ok(actual), Some(expected)) if actual == *expected => {}
                (Ok(_), None) => {}
                _ => return Some(None),
            }
        }
    }

    Some(Some(item.version.clone()))
}

#[cfg(not(windows))]
fn probe_installs_registry(_item: &CatalogItem) -> Option<Option<Version>> {
    None
}

#[cfg(windows)]
fn probe_msi_product_code(item: &CatalogItem) -> Option<Option<Version>> {
    use winreg::enums::*;
    use winreg::RegKey;

    let installer = item.installer.as_ref()?;
    if installer.installer_type != InstallerType::Msi {
        return None;
    }
    let product_code = item.product_code.as_ref()?;

    let hklm = RegKey::predef(HKEY_LOCAL_MACHINE);
    let uninstall_path = format!(
        r"SOFTWARE\Microsoft\Windows\CurrentVersion\Uninstall\{}",
        product_code
    );
    match hklm.open_subkey(&uninstall_path) {
        Ok(key) => {
            let version: Option<String> = key.get_value("DisplayVersion").ok();
            Some(version.and_then(|v| Version::from_str(&v).ok()))
        }
        Err(_) => Some(None),
    }
}

#[cfg(not(windows))]
fn probe_msi_product_code(_item: &CatalogItem) -> Option<Option<Version>> {
    None
}

#[cfg(windows)]
fn probe_installcheck_script(item: &CatalogItem) -> Option<Option<Version>> {
    let script = item.scripts.installcheck_script.as_ref()?;
    match crate::script::run_inline(script, &[], true) {
        Ok(status) if status == 0 => Some(Some(item.version.clone())),
        Ok(_) => Some(None),
        Err(_) => Some(None),
    }
}

#[cfg(not(windows))]
fn probe_installcheck_script(_item: &CatalogItem) -> Option<Option<Version>> {
    None
}

/// Runs the probe chain for `item`; `facts` is accepted for parity with the
/// spec contract even though no current probe consults it directly.
pub fn evaluate(item: &CatalogItem, _facts: &SystemFacts) -> EvaluatedItem {
    if let Some(installed) = probe_installs_files(item) {
        return EvaluatedItem {
            installed_version: installed,
            reason: "installs[] file probe",
        };
    }
    if let Some(installed) = probe_installs_registry(item) {
        return EvaluatedItem {
            installed_version: installed,
            reason: "installs[] registry probe",
        };
    }
    if let Some(installed) = probe_msi_product_code(item) {
        return EvaluatedItem {
            installed_version: installed,
            reason: "msi product code probe",
        };
    }
    if let Some(installed) = probe_installcheck_script(item) {
        return EvaluatedItem {
            installed_version: installed,
            reason: "installcheck_script",
        };
    }
    EvaluatedItem {
        installed_version: None,
        reason: "no probe matched; assumed not installed",
    }
}

/// Resolves the effective uninstallable flag (spec §4.F): `Auto` defaults to
/// `false` for an EXE with no uninstaller block and for a PS1 item with no
/// `installs[]`, `true` otherwise.
pub fn effective_uninstallable(item: &CatalogItem) -> bool {
    match item.uninstallable {
        Uninstallable::Yes => true,
        Uninstallable::No => false,
        Uninstallable::Auto => {
            let is_bare_exe = item
                .installer
                .as_ref()
                .map(|i| i.installer_type == InstallerType::Exe)
                .unwrap_or(false)
                && item.uninstaller.is_none();
            let is_bare_ps1 = item
                .installer
                .as_ref()
                .map(|i| i.installer_type == InstallerType::Ps1)
                .unwrap_or(false)
                && item.installs.is_empty();
            !(is_bare_exe || is_bare_ps1)
        }
    }
}

/// The decision table from spec §4.F, given the desired action, the probed
/// installed version, the catalog's best offered version, and (for
/// `update`) the version the update targets.
pub fn decide(
    action: Action,
    installed: Option<&Version>,
    catalog_best: &Version,
    update_target_version: Option<&Version>,
    uninstallable: bool,
) -> Decision {
    match action {
        Action::Install => match installed {
            None => Decision::Install,
            Some(v) if v >= catalog_best => Decision::Skip(SkipReason::Satisfied),
            Some(_) => Decision::Update,
        },
        Action::Update => match installed {
            None => Decision::Skip(SkipReason::NothingToUpdate),
            Some(v) => {
                let target = update_target_version.unwrap_or(catalog_best);
                if v < target {
                    Decision::Update
                } else {
                    Decision::Skip(SkipReason::Satisfied)
                }
            }
        },
        Action::Uninstall => match installed {
            Some(_) if uninstallable => Decision::Uninstall,
            Some(_) => Decision::Skip(SkipReason::PolicyBlocked),
            None => Decision::Skip(SkipReason::AlreadyAbsent),
        },
        Action::Optional | Action::Profile | Action::App => match installed {
            None => Decision::Install,
            Some(v) if v >= catalog_best => Decision::Skip(SkipReason::Satisfied),
            Some(_) => Decision::Update,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item_with_version(version: &str) -> CatalogItem {
        CatalogItem::builder()
            .name("Thing".to_string())
            .display_name("Thing".to_string())
            .version(Version::from_str(version).unwrap())
            .build()
    }

    #[test]
    fn test_install_absent_decides_install() {
        let best = Version::from_str("2.0.0").unwrap();
        let decision = decide(Action::Install, None, &best, None, true);
        assert_eq!(decision, Decision::Install);
    }

    #[test]
    fn test_install_present_satisfied() {
        let best = Version::from_str("2.0.0").unwrap();
        let installed = Version::from_str("2.0.0").unwrap();
        let decision = decide(Action::Install, Some(&installed), &best, None, true);
        assert_eq!(decision, Decision::Skip(SkipReason::Satisfied));
    }

    #[test]
    fn test_install_present_outdated_updates() {
        let best = Version::from_str("2.0.0").unwrap();
        let installed = Version::from_str("1.0.0").unwrap();
        let decision = decide(Action::Install, Some(&installed), &best, None, true);
        assert_eq!(decision, Decision::Update);
    }

    #[test]
    fn test_update_absent_skips() {
        let best = Version::from_str("2.0.0").unwrap();
        let decision = decide(Action::Update, None, &best, None, true);
        assert_eq!(decision, Decision::Skip(SkipReason::NothingToUpdate));
    }

    #[test]
    fn test_uninstall_blocked_by_policy() {
        let best = Version::from_str("1.0.0").unwrap();
        let installed = Version::from_str("1.0.0").unwrap();
        let decision = decide(Action::Uninstall, Some(&installed), &best, None, false);
        assert_eq!(decision, Decision::Skip(SkipReason::PolicyBlocked));
    }

    #[test]
    fn test_uninstall_absent_skips() {
        let best = Version::from_str("1.0.0").unwrap();
        let decision = decide(Action::Uninstall, None, &best, None, true);
        assert_eq!(decision, Decision::Skip(SkipReason::AlreadyAbsent));
    }

    #[test]
    fn test_effective_uninstallable_bare_exe_defaults_false() {
        let mut item = item_with_version("1.0.0");
        item.installer = Some(cimian_types::Installer {
            location: "x.exe".into(),
            hash: "deadbeef".into(),
            installer_type: InstallerType::Exe,
            size: 1,
            arguments: vec![],
        });
        assert!(!effective_uninstallable(&item));
    }

    #[test]
    fn test_effective_uninstallable_msi_defaults_true() {
        let mut item = item_with_version("1.0.0");
        item.installer = Some(cimian_types::Installer {
            location: "x.msi".into(),
            hash: "deadbeef".into(),
            installer_type: InstallerType::Msi,
            size: 1,
            arguments: vec![],
        });
        assert!(effective_uninstallable(&item));
    }

    #[test]
    fn test_probe_installs_file_missing_reports_not_installed() {
        let mut item = item_with_version("1.0.0");
        item.installs.push(InstallsEntry::File {
            path: "this/path/does/not/exist.exe".into(),
            version: None,
            md5checksum: None,
        });
        let facts_placeholder = crate::facts::gather(&crate::config::Config {
            repo_url: url::Url::parse("https://example.org").unwrap(),
            cache_path: "/tmp".into(),
            catalogs_path: "/tmp".into(),
            manifests_path: "/tmp".into(),
            local_manifests: vec![],
            local_only_manifest: None,
            default_arch: "x64".into(),
            default_catalog: "Production".into(),
            catalogs: vec![],
            client_identifier: "host".into(),
            log_level: "info".into(),
            force_execution_policy_bypass: true,
            force_basic_auth: false,
            open_imported_yaml: false,
        });
        let result = evaluate(&item, &facts_placeholder);
        assert!(result.installed_version.is_none());
    }
}
