//! The Manifest Resolver (spec §4.D): `ResolveDesiredState(cfg, facts) -> ResolvedDesiredState`.
//!
//! Seeds a work queue from `cfg.local_manifests` (read from local disk), the
//! per-host manifest named by `cfg.client_identifier` (fetched from the
//! repository), and `cfg.local_only_manifest`; walks `included_manifests`
//! recursively (also fetched from the repository) with a visited set to
//! break cycles; folds in `conditional_items` whose condition evaluates true
//! against the current facts (recursing into their own nested conditionals);
//! and deduplicates `(action, name)` pairs, first occurrence wins, preserving
//! the source chain that produced it.
//!
//! Failure semantics (spec §4.D, §7): a failed fetch of the top-level
//! per-host manifest is fatal; a failed fetch of an included manifest is a
//! warning, and the resolver continues with whatever partial state it has.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use cimian_types::{ConditionalItem, ManifestFile, SystemFacts};
use indexmap::IndexMap;
use log::{trace, warn};
use reqwest::StatusCode;
use thiserror::Error;

use crate::config::Config;
use crate::fetch::{CredentialProvider, FetchError, Fetcher};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Install,
    Update,
    Uninstall,
    Optional,
    Profile,
    App,
}

/// Provenance for a resolved item: which manifest and field produced it, and
/// the inclusion chain that led there (for diagnostics, spec §3).
#[derive(Debug, Clone)]
pub struct ItemSource {
    pub manifest_name: String,
    pub field: &'static str,
    pub chain: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DesiredItem {
    pub name: String,
    pub action: Action,
    pub source: ItemSource,
}

#[derive(Debug, Default)]
pub struct ResolvedDesiredState {
    entries: IndexMap<(Action, String), DesiredItem>,
}

impl ResolvedDesiredState {
    fn insert(&mut self, action: Action, name: String, source: ItemSource) {
        // First occurrence wins; a repeat keeps its original source chain.
        self.entries
            .entry((action, name.clone()))
            .or_insert_with(|| DesiredItem {
                name,
                action,
                source,
            });
    }

    pub fn items(&self) -> impl Iterator<Item = &DesiredItem> {
        self.entries.values()
    }

    pub fn by_action(&self, action: Action) -> impl Iterator<Item = &DesiredItem> {
        self.entries.values().filter(move |i| i.action == action)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum ManifestLoadError {
    #[error("could not read manifest file {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse manifest file {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("could not fetch manifest `{name}` from the repository")]
    Fetch {
        name: String,
        #[source]
        source: FetchError,
    },
    #[error("per-host manifest `{0}` was not found in the repository")]
    PerHostManifestMissing(String),
}

/// Where a queued manifest name came from, which governs both how it's
/// resolved (local disk vs. fetched from the repository) and whether a
/// failure to resolve it is fatal or a warning (spec §4.D).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ManifestSource {
    Local,
    PerHost,
    Included,
}

fn manifest_path(cfg: &Config, name: &str) -> PathBuf {
    let mut path = cfg.manifests_path.clone();
    for segment in name.split('/') {
        path = path.join(segment);
    }
    path.set_extension("yaml");
    path
}

fn load_manifest(cfg: &Config, name: &str) -> Result<Option<ManifestFile>, ManifestLoadError> {
    let path = manifest_path(cfg, name);
    match std::fs::read_to_string(&path) {
        Ok(contents) => {
            let manifest = serde_yaml::from_str(&contents)
                .map_err(|source| ManifestLoadError::Parse { path, source })?;
            Ok(Some(manifest))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(ManifestLoadError::Read { path, source }),
    }
}

/// Fetches a repository-sourced manifest (the per-host manifest, or one
/// reached via `included_manifests`) into its local cache path and parses
/// it. `Ok(None)` means the repository confirmed the manifest doesn't exist
/// (HTTP 404); any other failure to fetch is `Err`, left for the caller to
/// treat as fatal or a warning depending on `ManifestSource`.
async fn fetch_manifest(
    fetcher: &Fetcher<'_>,
    cfg: &Config,
    name: &str,
) -> Result<Option<ManifestFile>, ManifestLoadError> {
    let dest = manifest_path(cfg, name);
    let url = format!("manifests/{}.yaml", name);

    match fetcher.fetch(&url, None, &dest).await {
        Ok(_) => {}
        Err(FetchError::Status { status, .. }) if status == StatusCode::NOT_FOUND => return Ok(None),
        Err(source) => {
            return Err(ManifestLoadError::Fetch {
                name: name.to_string(),
                source,
            })
        }
    }

    load_manifest(cfg, name)
}

pub async fn resolve_desired_state(
    cfg: &Config,
    facts: &SystemFacts,
    credentials: &dyn CredentialProvider,
) -> Result<ResolvedDesiredState, ManifestLoadError> {
    let mut state = ResolvedDesiredState::default();
    let mut visited: HashSet<String> = HashSet::new();
    let fetcher = Fetcher::new(cfg, credentials);

    let mut queue: Vec<(String, Vec<String>, ManifestSource)> = Vec::new();
    for name in &cfg.local_manifests {
        queue.push((name.clone(), vec![], ManifestSource::Local));
    }
    queue.push((cfg.client_identifier.clone(), vec![], ManifestSource::PerHost));

    while let Some((name, chain, source)) = queue.pop() {
        if !visited.insert(name.clone()) {
            trace!("manifest `{}` already visited; skipping (cycle break)", name);
            continue;
        }

        let manifest = match source {
            ManifestSource::Local => match load_manifest(cfg, &name) {
                Ok(Some(m)) => m,
                Ok(None) => {
                    trace!("local manifest `{}` not found; skipping", name);
                    continue;
                }
                Err(e) => {
                    warn!("local manifest `{}` could not be loaded: {}; continuing without it", name, e);
                    continue;
                }
            },
            ManifestSource::PerHost => match fetch_manifest(&fetcher, cfg, &name).await {
                Ok(Some(m)) => m,
                Ok(None) => return Err(ManifestLoadError::PerHostManifestMissing(name)),
                Err(e) => return Err(e),
            },
            ManifestSource::Included => match fetch_manifest(&fetcher, cfg, &name).await {
                Ok(Some(m)) => m,
                Ok(None) => {
                    trace!("included manifest `{}` not found; skipping", name);
                    continue;
                }
                Err(e) => {
                    warn!(
                        "included manifest `{}` could not be fetched: {}; continuing with partial state",
                        name, e
                    );
                    continue;
                }
            },
        };

        let mut next_chain = chain.clone();
        next_chain.push(name.clone());

        fold_manifest(&mut state, &name, &next_chain, &manifest, facts);

        for included in &manifest.included_manifests {
            queue.push((included.clone(), next_chain.clone(), ManifestSource::Included));
        }
    }

    if let Some(local_only) = &cfg.local_only_manifest {
        if let Some(manifest) = load_manifest_at_path(local_only)? {
            let chain = vec!["(local-only)".to_string()];
            fold_manifest(&mut state, "(local-only)", &chain, &manifest, facts);
        }
    }

    Ok(state)
}

/// Synchronous wrapper around [`resolve_desired_state`] for callers (the
/// `--checkonly` CLI path) that have no async runtime of their own, the same
/// way `driver::run_locked_with_sink` owns its runtime internally rather
/// than pushing a `tokio` dependency onto its caller.
pub fn resolve_desired_state_blocking(
    cfg: &Config,
    facts: &SystemFacts,
    credentials: &dyn CredentialProvider,
) -> Result<ResolvedDesiredState, ManifestLoadError> {
    let mut rt = tokio::runtime::Runtime::new().expect("tokio runtime builds");
    rt.block_on(resolve_desired_state(cfg, facts, credentials))
}

fn load_manifest_at_path(path: &Path) -> Result<Option<ManifestFile>, ManifestLoadError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            let manifest = serde_yaml::from_str(&contents).map_err(|source| ManifestLoadError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
            Ok(Some(manifest))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(ManifestLoadError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn fold_manifest(
    state: &mut ResolvedDesiredState,
    manifest_name: &str,
    chain: &[String],
    manifest: &ManifestFile,
    facts: &SystemFacts,
) {
    fold_lists(
        state,
        manifest_name,
        chain,
        &manifest.managed_installs,
        &manifest.managed_updates,
        &manifest.managed_uninstalls,
        &manifest.optional_installs,
        &manifest.managed_profiles,
        &manifest.managed_apps,
    );

    for conditional in &manifest.conditional_items {
        fold_conditional(state, manifest_name, chain, conditional, facts);
    }
}

fn fold_conditional(
    state: &mut ResolvedDesiredState,
    manifest_name: &str,
    chain: &[String],
    conditional: &ConditionalItem,
    facts: &SystemFacts,
) {
    let fact_map = facts.as_fact_map();
    if !conditional.condition.evaluate(&fact_map) {
        return;
    }

    fold_lists(
        state,
        manifest_name,
        chain,
        &conditional.managed_installs,
        &conditional.managed_updates,
        &conditional.managed_uninstalls,
        &conditional.optional_installs,
        &conditional.managed_profiles,
        &conditional.managed_apps,
    );

    for nested in &conditional.conditional_items {
        fold_conditional(state, manifest_name, chain, nested, facts);
    }
}

#[allow(clippy::too_many_arguments)]
fn fold_lists(
    state: &mut ResolvedDesiredState,
    manifest_name: &str,
    chain: &[String],
    installs: &[String],
    updates: &[String],
    uninstalls: &[String],
    optional: &[String],
    profiles: &[String],
    apps: &[String],
) {
    let source = |field: &'static str| ItemSource {
        manifest_name: manifest_name.to_string(),
        field,
        chain: chain.to_vec(),
    };

    for name in installs {
        state.insert(Action::Install, name.clone(), source("managed_installs"));
    }
    for name in updates {
        state.insert(Action::Update, name.clone(), source("managed_updates"));
    }
    for name in uninstalls {
        state.insert(Action::Uninstall, name.clone(), source("managed_uninstalls"));
    }
    for name in optional {
        state.insert(Action::Optional, name.clone(), source("optional_installs"));
    }
    for name in profiles {
        state.insert(Action::Profile, name.clone(), source("managed_profiles"));
    }
    for name in apps {
        state.insert(Action::App, name.clone(), source("managed_apps"));
    }
}

/// Test-only construction helpers for other modules' unit tests that need a
/// `ResolvedDesiredState` without going through a manifest file on disk.
#[cfg(test)]
pub mod tests_support {
    use super::{Action, ItemSource, ResolvedDesiredState};

    pub fn single(action: Action, name: &str) -> ResolvedDesiredState {
        let mut state = ResolvedDesiredState::default();
        state.insert(
            action,
            name.to_string(),
            ItemSource {
                manifest_name: "test".to_string(),
                field: "managed_installs",
                chain: vec![],
            },
        );
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::AnonymousCredentialProvider;
    use chrono::Utc;
    use cimian_types::{BatteryState, JoinedType, MachineType};
    use std::io::Write;

    fn facts_with_arch(arch: &str) -> SystemFacts {
        SystemFacts {
            hostname: "host".into(),
            arch: arch.into(),
            os_vers_major: 10,
            os_vers_minor: 0,
            build_number: 19045,
            domain: String::new(),
            username: String::new(),
            machine_type: MachineType::Desktop,
            machine_model: String::new(),
            serial_number: String::new(),
            joined_type: JoinedType::Workgroup,
            catalogs: vec!["Production".into()],
            enrolled_usage: String::new(),
            enrolled_area: String::new(),
            device_id: String::new(),
            battery_state: BatteryState::Unknown,
            date: Utc::now(),
        }
    }

    fn write_manifest(dir: &Path, name: &str, contents: &str) {
        let path = dir.join(format!("{}.yaml", name));
        let mut f = std::fs::File::create(path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    /// `repo_url` points at a `mockito` server standing in for the
    /// repository; the per-host and included manifests are resolved through
    /// `Fetcher` against it, never read straight off `manifests_dir`.
    fn base_cfg(repo_url: &str, manifests_dir: &Path, client_identifier: &str) -> Config {
        Config {
            repo_url: url::Url::parse(repo_url).unwrap(),
            cache_path: PathBuf::from("/tmp/cache"),
            catalogs_path: PathBuf::from("/tmp/catalogs"),
            manifests_path: manifests_dir.to_path_buf(),
            local_manifests: vec![],
            local_only_manifest: None,
            default_arch: "x64".into(),
            default_catalog: "Production".into(),
            catalogs: vec![],
            client_identifier: client_identifier.into(),
            log_level: "info".into(),
            force_execution_policy_bypass: true,
            force_basic_auth: false,
            open_imported_yaml: false,
        }
    }

    fn mock_manifest(server: &mut mockito::Server, name: &str, status: usize, body: &str) -> mockito::Mock {
        server
            .mock("GET", format!("/manifests/{}.yaml", name).as_str())
            .with_status(status)
            .with_body(body)
            .create()
    }

    #[tokio::test]
    async fn test_includes_resolved_recursively() {
        let mut server = mockito::Server::new();
        let _site = mock_manifest(
            &mut server,
            "site_default",
            200,
            "includedManifests: [base]\nmanagedInstalls: [SiteTool]\n",
        );
        let _base = mock_manifest(&mut server, "base", 200, "managedInstalls: [GoogleChrome]\n");

        let dir = tempfile::tempdir().unwrap();
        let cfg = base_cfg(&server.url(), dir.path(), "site_default");
        let facts = facts_with_arch("x64");
        let state = resolve_desired_state(&cfg, &facts, &AnonymousCredentialProvider)
            .await
            .unwrap();

        let names: Vec<&str> = state
            .by_action(Action::Install)
            .map(|i| i.name.as_str())
            .collect();
        assert!(names.contains(&"SiteTool"));
        assert!(names.contains(&"GoogleChrome"));
    }

    #[tokio::test]
    async fn test_cycle_is_broken() {
        let mut server = mockito::Server::new();
        let _a = mock_manifest(
            &mut server,
            "a",
            200,
            "includedManifests: [b]\nmanagedInstalls: [FromA]\n",
        );
        let _b = mock_manifest(
            &mut server,
            "b",
            200,
            "includedManifests: [a]\nmanagedInstalls: [FromB]\n",
        );

        let dir = tempfile::tempdir().unwrap();
        let cfg = base_cfg(&server.url(), dir.path(), "a");
        let facts = facts_with_arch("x64");
        let state = resolve_desired_state(&cfg, &facts, &AnonymousCredentialProvider)
            .await
            .unwrap();

        let names: Vec<&str> = state
            .by_action(Action::Install)
            .map(|i| i.name.as_str())
            .collect();
        assert!(names.contains(&"FromA"));
        assert!(names.contains(&"FromB"));
    }

    #[tokio::test]
    async fn test_conditional_item_gated_by_facts() {
        let mut server = mockito::Server::new();
        let _site = mock_manifest(
            &mut server,
            "site_default",
            200,
            "managedInstalls: [Base]\n\
             conditionalItems:\n\
             \x20\x20- condition: 'arch == \"arm64\"'\n\
             \x20\x20\x20\x20managedInstalls: [RosettaStub]\n",
        );

        let dir = tempfile::tempdir().unwrap();
        let cfg = base_cfg(&server.url(), dir.path(), "site_default");

        let arm_state = resolve_desired_state(&cfg, &facts_with_arch("arm64"), &AnonymousCredentialProvider)
            .await
            .unwrap();
        let x64_state = resolve_desired_state(&cfg, &facts_with_arch("x64"), &AnonymousCredentialProvider)
            .await
            .unwrap();

        assert!(arm_state
            .by_action(Action::Install)
            .any(|i| i.name == "RosettaStub"));
        assert!(!x64_state
            .by_action(Action::Install)
            .any(|i| i.name == "RosettaStub"));
    }

    #[tokio::test]
    async fn test_first_occurrence_wins_on_duplicate() {
        let mut server = mockito::Server::new();
        let _site = mock_manifest(
            &mut server,
            "site_default",
            200,
            "includedManifests: [extra]\nmanagedInstalls: [Shared]\n",
        );
        let _extra = mock_manifest(&mut server, "extra", 200, "managedInstalls: [Shared]\n");

        let dir = tempfile::tempdir().unwrap();
        let cfg = base_cfg(&server.url(), dir.path(), "site_default");
        let state = resolve_desired_state(&cfg, &facts_with_arch("x64"), &AnonymousCredentialProvider)
            .await
            .unwrap();

        let count = state
            .by_action(Action::Install)
            .filter(|i| i.name == "Shared")
            .count();
        assert_eq!(count, 1);
        let entry = state.by_action(Action::Install).find(|i| i.name == "Shared").unwrap();
        assert_eq!(entry.source.manifest_name, "site_default");
    }

    #[tokio::test]
    async fn test_per_host_manifest_missing_is_fatal() {
        let mut server = mockito::Server::new();
        let _miss = mock_manifest(&mut server, "ghost_host", 404, "");

        let dir = tempfile::tempdir().unwrap();
        let cfg = base_cfg(&server.url(), dir.path(), "ghost_host");
        let err = resolve_desired_state(&cfg, &facts_with_arch("x64"), &AnonymousCredentialProvider)
            .await
            .unwrap_err();

        assert!(matches!(err, ManifestLoadError::PerHostManifestMissing(name) if name == "ghost_host"));
    }

    #[tokio::test]
    async fn test_included_manifest_fetch_failure_is_warning_not_fatal() {
        let mut server = mockito::Server::new();
        let _site = mock_manifest(
            &mut server,
            "site_default",
            200,
            "includedManifests: [broken]\nmanagedInstalls: [SiteTool]\n",
        );
        let _broken = mock_manifest(&mut server, "broken", 500, "boom");

        let dir = tempfile::tempdir().unwrap();
        let cfg = base_cfg(&server.url(), dir.path(), "site_default");
        let state = resolve_desired_state(&cfg, &facts_with_arch("x64"), &AnonymousCredentialProvider)
            .await
            .unwrap();

        assert!(state.by_action(Action::Install).any(|i| i.name == "SiteTool"));
    }

    #[tokio::test]
    async fn test_local_manifest_is_read_from_disk_not_fetched() {
        let mut server = mockito::Server::new();
        let _site = mock_manifest(&mut server, "site_default", 200, "{}\n");

        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), "offline_extras", "managedInstalls: [LocalTool]\n");

        let mut cfg = base_cfg(&server.url(), dir.path(), "site_default");
        cfg.local_manifests = vec!["offline_extras".to_string()];

        let state = resolve_desired_state(&cfg, &facts_with_arch("x64"), &AnonymousCredentialProvider)
            .await
            .unwrap();

        assert!(state.by_action(Action::Install).any(|i| i.name == "LocalTool"));
    }
}
