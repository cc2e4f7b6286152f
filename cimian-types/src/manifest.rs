use serde::{Deserialize, Serialize};

use crate::predicate::ConditionExpression;

/// A manifest document (spec §3). Manifests nest via `included_manifests`
/// and gate sub-sections of themselves via `conditional_items`; both are
/// resolved recursively by the manifest resolver, which is responsible for
/// cycle-breaking and first-wins provenance, not this type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestFile {
    #[serde(default)]
    pub catalogs: Vec<String>,
    #[serde(default)]
    pub included_manifests: Vec<String>,
    #[serde(default)]
    pub managed_installs: Vec<String>,
    #[serde(default)]
    pub managed_updates: Vec<String>,
    #[serde(default)]
    pub managed_uninstalls: Vec<String>,
    #[serde(default)]
    pub optional_installs: Vec<String>,
    #[serde(default)]
    pub managed_profiles: Vec<String>,
    #[serde(default)]
    pub managed_apps: Vec<String>,
    #[serde(default)]
    pub conditional_items: Vec<ConditionalItem>,
}

/// A condition-gated fragment of a manifest. Its fields are folded into the
/// owning `ManifestFile`'s lists when `condition` evaluates true against the
/// current `SystemFacts`; it may itself nest further `conditional_items`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionalItem {
    pub condition: ConditionExpression,
    #[serde(default)]
    pub included_manifests: Vec<String>,
    #[serde(default)]
    pub managed_installs: Vec<String>,
    #[serde(default)]
    pub managed_updates: Vec<String>,
    #[serde(default)]
    pub managed_uninstalls: Vec<String>,
    #[serde(default)]
    pub optional_installs: Vec<String>,
    #[serde(default)]
    pub managed_profiles: Vec<String>,
    #[serde(default)]
    pub managed_apps: Vec<String>,
    #[serde(default)]
    pub conditional_items: Vec<ConditionalItem>,
}

impl Default for ConditionExpression {
    fn default() -> Self {
        ConditionExpression::invalid()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_roundtrip_yaml() {
        let yaml = r#"
catalogs: [Production]
included_manifests: [site_default]
managed_installs: [GoogleChrome]
conditional_items:
  - condition: 'arch == "arm64"'
    managed_installs: [RosettaStub]
"#;
        let manifest: ManifestFile = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(manifest.catalogs, vec!["Production"]);
        assert_eq!(manifest.conditional_items.len(), 1);
        assert_eq!(
            manifest.conditional_items[0].managed_installs,
            vec!["RosettaStub"]
        );
    }

    #[test]
    fn test_empty_manifest_defaults() {
        let manifest: ManifestFile = serde_yaml::from_str("{}").unwrap();
        assert!(manifest.managed_installs.is_empty());
        assert!(manifest.conditional_items.is_empty());
    }
}
