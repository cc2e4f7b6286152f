use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::version::Version;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    X86,
    X64,
    Arm64,
    #[serde(rename = "all")]
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallerType {
    Msi,
    Exe,
    Nupkg,
    Msix,
    Ps1,
    Bat,
    Nopkg,
}

/// Tri-state per spec §3: a `CatalogItem` may be always installable, never
/// (informational / bundle-only), or installable only when its `installs`
/// probes report absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Uninstallable {
    Yes,
    No,
    Auto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Installer {
    pub location: String,
    pub hash: String,
    #[serde(rename = "type")]
    pub installer_type: InstallerType,
    pub size: u64,
    #[serde(default)]
    pub arguments: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Uninstaller {
    pub location: Option<String>,
    pub hash: Option<String>,
    #[serde(rename = "type")]
    pub installer_type: InstallerType,
    #[serde(default)]
    pub arguments: Vec<String>,
}

/// One of the things `installs[]` checks for to decide whether a
/// `CatalogItem` is already present (spec §4.E, Item State Evaluator).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InstallsEntry {
    File {
        path: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        version: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        md5checksum: Option<String>,
    },
    Registry {
        path: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        value: Option<String>,
    },
}

/// An operation `uninstalls[]` runs in sequence to remove a `CatalogItem`
/// that has no single uninstaller payload (spec §3, §4.G uninstall mirror).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum UninstallOp {
    File {
        path: String,
    },
    Directory {
        path: String,
    },
    Registry {
        path: String,
    },
    Application {
        path: String,
        #[serde(default)]
        switches: Vec<String>,
        #[serde(default)]
        flags: Vec<String>,
    },
    Msi {
        product_code: String,
        #[serde(default)]
        switches: Vec<String>,
        #[serde(default)]
        flags: Vec<String>,
    },
    Exe {
        path: String,
        #[serde(default)]
        switches: Vec<String>,
        #[serde(default)]
        flags: Vec<String>,
    },
    Ps1 {
        path: String,
        #[serde(default)]
        switches: Vec<String>,
        #[serde(default)]
        flags: Vec<String>,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scripts {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preinstall_script: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub postinstall_script: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preuninstall_script: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub postuninstall_script: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub installcheck_script: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uninstallcheck_script: Option<String>,
}

/// A single package entry in a catalog (spec §3). Built with `TypedBuilder`
/// the way the teacher's `pahkat_types::repo`/`payload::windows` structs are,
/// since most fields are optional and construction sites read better
/// keyword-style.
#[derive(Debug, Clone, TypedBuilder, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogItem {
    pub name: String,
    pub display_name: String,
    pub version: Version,
    #[serde(default)]
    #[builder(default)]
    pub catalogs: Vec<String>,
    #[serde(default)]
    #[builder(default)]
    pub supported_architectures: Vec<Architecture>,
    #[builder(default)]
    pub installer: Option<Installer>,
    #[builder(default)]
    pub uninstaller: Option<Uninstaller>,
    #[serde(default = "default_uninstallable")]
    #[builder(default = Uninstallable::Auto)]
    pub uninstallable: Uninstallable,
    #[serde(default)]
    #[builder(default)]
    pub installs: Vec<InstallsEntry>,
    #[serde(default)]
    #[builder(default)]
    pub uninstalls: Vec<UninstallOp>,
    #[serde(default)]
    #[builder(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    #[builder(default)]
    pub update_for: Vec<String>,
    #[builder(default)]
    pub product_code: Option<String>,
    #[builder(default)]
    pub upgrade_code: Option<String>,
    #[serde(default)]
    #[builder(default)]
    pub scripts: Scripts,
}

fn default_uninstallable() -> Uninstallable {
    Uninstallable::Auto
}

impl CatalogItem {
    pub fn supports_arch(&self, arch: &str) -> bool {
        if self.supported_architectures.is_empty() {
            return true;
        }
        self.supported_architectures.iter().any(|a| {
            matches!(a, Architecture::Any)
                || format!("{:?}", a).eq_ignore_ascii_case(arch)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_builder_defaults() {
        let item = CatalogItem::builder()
            .name("GoogleChrome".to_string())
            .display_name("Google Chrome".to_string())
            .version(Version::from_str("120.0.1").unwrap())
            .build();
        assert_eq!(item.uninstallable, Uninstallable::Auto);
        assert!(item.installs.is_empty());
    }

    #[test]
    fn test_arch_gate_empty_supports_all() {
        let item = CatalogItem::builder()
            .name("x".to_string())
            .display_name("x".to_string())
            .version(Version::from_str("1.0").unwrap())
            .build();
        assert!(item.supports_arch("x64"));
    }

    #[test]
    fn test_arch_gate_explicit() {
        let mut item = CatalogItem::builder()
            .name("x".to_string())
            .display_name("x".to_string())
            .version(Version::from_str("1.0").unwrap())
            .build();
        item.supported_architectures = vec![Architecture::Arm64];
        assert!(item.supports_arch("arm64"));
        assert!(!item.supports_arch("x64"));
    }
}
