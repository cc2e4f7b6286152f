//! The Driver (spec §4.J): orchestrates one end-to-end run.
//!
//! `config+facts -> manifest resolve -> dependency/update plan ->
//! self-update check-and-defer -> per-item evaluate+decide -> dispatch`,
//! with every step's outcome streamed to the Reporter. Mirrors the
//! teacher's top-level `run`/`bootstrap` entry points in shape (gather
//! state, act, report) without carrying over its `Transaction` type, which
//! this system's plan/dispatch split replaces.

use std::path::{Path, PathBuf};

use chrono::Utc;
use cimian_types::{
    AttemptRecord, EventRecord, EventStatus, PackageCurrentStatus, PackageRecord, RunType,
    SessionRecord, SessionStatus, SystemFacts,
};
use thiserror::Error;
use uuid::Uuid;

use crate::catalog::{self, ByNameResult, CatalogIndex};
use crate::config::Config;
use crate::dispatch::{self, DispatchOutcome};
use crate::evaluate::{self, Decision, SkipReason};
use crate::fetch::CredentialProvider;
use crate::plan::{self, PlanAction, PlanCandidate};
use crate::reporter::{self, RunTranscript};
use crate::resolve::{self, Action};
use crate::runlock;
use crate::selfupdate;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("another Cimian run is already in progress")]
    AlreadyRunning,
    #[error("could not acquire the run lock")]
    RunLock(#[source] runlock::RunLockError),
    #[error("could not resolve desired state from manifests")]
    Manifest(#[source] resolve::ManifestLoadError),
    #[error("could not load catalogs")]
    Catalog(#[source] catalog::CatalogError),
    #[error("a dependency cycle was found while planning")]
    Plan(#[source] plan::PlanError),
    #[error("could not write run report")]
    Report(#[source] reporter::ReportError),
}

/// Counters accumulated over a run, folded into the `SessionRecord` at the
/// end (spec §4.I).
#[derive(Debug, Default)]
struct RunCounters {
    installed: u32,
    updated: u32,
    uninstalled: u32,
    failed: u32,
    warned: u32,
}

pub struct RunSummary {
    pub session_id: String,
    pub counters_installed: u32,
    pub counters_updated: u32,
    pub counters_uninstalled: u32,
    pub counters_failed: u32,
    pub counters_warned: u32,
}

/// A per-event callback the status channel (spec §6 "Status channel") hangs
/// off of. Mirrors the teacher's `ffi` callback idiom: a plain function
/// pointer invoked synchronously from the run loop, with no knowledge of
/// where (or whether) the events end up.
pub type EventSink<'a> = &'a dyn Fn(&EventRecord);

fn no_sink(_: &EventRecord) {}

/// Runs one full reconciliation pass while holding the exclusive runlock at
/// `root/.cimian.runlock`. Returns `DriverError::AlreadyRunning` immediately
/// if another run already holds it.
pub async fn run(
    root: &Path,
    cfg: &Config,
    run_type: RunType,
    credentials: &dyn CredentialProvider,
) -> Result<RunSummary, DriverError> {
    run_with_sink(root, cfg, run_type, credentials, &no_sink).await
}

/// Same as [`run`] but forwards every emitted event to `sink` as it happens,
/// for callers that want to drive a live status channel.
pub async fn run_with_sink(
    root: &Path,
    cfg: &Config,
    run_type: RunType,
    credentials: &dyn CredentialProvider,
    sink: EventSink<'_>,
) -> Result<RunSummary, DriverError> {
    let facts = crate::facts::gather(cfg);
    let session_id = Uuid::new_v4().to_string();
    let started_at = Utc::now();

    let transcript = RunTranscript::open(root, &session_id, started_at).map_err(DriverError::Report)?;
    log::info!("starting run {} ({:?})", session_id, run_type);

    let mut counters = RunCounters::default();

    let result = run_inner(
        root,
        cfg,
        &facts,
        &session_id,
        &transcript,
        credentials,
        &mut counters,
        sink,
    )
    .await;

    let ended_at = Utc::now();
    let status = if result.is_ok() {
        SessionStatus::Completed
    } else {
        SessionStatus::Failed
    };

    let session = SessionRecord {
        session_id: session_id.clone(),
        run_type,
        started_at,
        ended_at: Some(ended_at),
        status,
        items_installed: counters.installed,
        items_updated: counters.updated,
        items_uninstalled: counters.uninstalled,
        items_failed: counters.failed,
        items_warned: counters.warned,
    };

    transcript.write_session_json(&session).map_err(DriverError::Report)?;
    reporter::record_session(root, &session).map_err(DriverError::Report)?;
    reporter::prune_log_dirs(root).ok();

    result?;

    log::info!("run {} complete: {:?}", session_id, session.status);

    Ok(RunSummary {
        session_id,
        counters_installed: session.items_installed,
        counters_updated: session.items_updated,
        counters_uninstalled: session.items_uninstalled,
        counters_failed: session.items_failed,
        counters_warned: session.items_warned,
    })
}

async fn run_inner(
    root: &Path,
    cfg: &Config,
    facts: &SystemFacts,
    session_id: &str,
    transcript: &RunTranscript,
    credentials: &dyn CredentialProvider,
    counters: &mut RunCounters,
    sink: EventSink<'_>,
) -> Result<(), DriverError> {
    let desired = resolve::resolve_desired_state(cfg, facts, credentials)
        .await
        .map_err(DriverError::Manifest)?;
    let catalog = catalog::load_catalogs(cfg, facts).map_err(DriverError::Catalog)?;

    let candidates = plan::build_plan(&desired, &catalog, facts).map_err(DriverError::Plan)?;
    let (execute, deferred) = selfupdate::check_and_defer(candidates, &catalog, &facts.arch);

    for candidate in &deferred {
        schedule_self_update(root, &catalog, candidate, facts).await;
        emit(root, transcript, counters, session_id, &candidate.name, "self-update-deferred", EventStatus::Pending, None, sink);
    }

    let mut failed_names: std::collections::HashSet<String> = std::collections::HashSet::new();

    for candidate in &execute {
        if candidate
            .source_chain
            .iter()
            .any(|s| s.strip_prefix("requires:").map(|dep| failed_names.contains(dep)).unwrap_or(false))
        {
            emit(
                root,
                transcript,
                counters,
                session_id,
                &candidate.name,
                action_label(candidate.action),
                EventStatus::Skipped,
                Some("a dependency failed earlier in this run".to_string()),
                sink,
            );
            failed_names.insert(candidate.name.clone());
            continue;
        }

        let item = match catalog.by_name(&candidate.name, &facts.arch) {
            ByNameResult::Found(item) => item.clone(),
            _ => {
                emit(
                    root,
                    transcript,
                    counters,
                    session_id,
                    &candidate.name,
                    action_label(candidate.action),
                    EventStatus::Warning,
                    Some("item no longer present in the catalog".to_string()),
                    sink,
                );
                continue;
            }
        };

        let record = reporter::load_item(root, &item.name).map_err(DriverError::Report)?;
        let now = Utc::now();
        if let Some(rec) = &record {
            if rec.is_install_loop(now) && matches!(candidate.action, PlanAction::Install | PlanAction::Update) {
                let mut updated = rec.clone();
                updated.current_status = updated.derive_status(now, true, rec.current_status);
                reporter::update_item(root, &updated).map_err(DriverError::Report)?;
                emit(
                    root,
                    transcript,
                    counters,
                    session_id,
                    &item.name,
                    action_label(candidate.action),
                    EventStatus::Skipped,
                    Some("install loop detected; holding off until the catalog version changes".to_string()),
                    sink,
                );
                continue;
            }
        }

        let evaluated = evaluate::evaluate(&item, facts);
        let action = match candidate.action {
            PlanAction::Install => Action::Install,
            PlanAction::Update => Action::Update,
            PlanAction::Uninstall => Action::Uninstall,
        };
        let uninstallable = evaluate::effective_uninstallable(&item);
        let decision = evaluate::decide(
            action,
            evaluated.installed_version.as_ref(),
            &item.version,
            None,
            uninstallable,
        );

        let outcome = match decision {
            Decision::Skip(reason) => {
                emit(
                    root,
                    transcript,
                    counters,
                    session_id,
                    &item.name,
                    action_label(candidate.action),
                    EventStatus::Skipped,
                    Some(skip_reason_message(reason)),
                    sink,
                );
                None
            }
            Decision::Install | Decision::Update => {
                let cache_root = cfg.cache_path.clone();
                let result = dispatch::execute_install(&item, cfg, facts, &cache_root, credentials).await;
                Some(result)
            }
            Decision::Uninstall => {
                let result = dispatch::execute_uninstall(&item, cfg);
                Some(result)
            }
        };

        if let Some(outcome) = outcome {
            if outcome.status == EventStatus::Failed {
                failed_names.insert(item.name.clone());
            }
            record_outcome(root, &item.name, &outcome, matches!(candidate.action, PlanAction::Uninstall), now)
                .map_err(DriverError::Report)?;
            emit(
                root,
                transcript,
                counters,
                session_id,
                &item.name,
                action_label(candidate.action),
                outcome.status,
                outcome.message,
                sink,
            );
        }
    }

    Ok(())
}

fn action_label(action: PlanAction) -> &'static str {
    match action {
        PlanAction::Install => "install",
        PlanAction::Update => "update",
        PlanAction::Uninstall => "uninstall",
    }
}

fn skip_reason_message(reason: SkipReason) -> String {
    match reason {
        SkipReason::Satisfied => "already at the catalog's offered version".to_string(),
        SkipReason::NothingToUpdate => "not installed; nothing to update".to_string(),
        SkipReason::AlreadyAbsent => "already absent".to_string(),
        SkipReason::PolicyBlocked => "uninstall blocked by policy".to_string(),
    }
}

fn emit(
    root: &Path,
    transcript: &RunTranscript,
    counters: &mut RunCounters,
    session_id: &str,
    item_name: &str,
    action: &str,
    status: EventStatus,
    message: Option<String>,
    sink: EventSink<'_>,
) {
    match status {
        EventStatus::Success => match action {
            "install" => counters.installed += 1,
            "update" => counters.updated += 1,
            "uninstall" => counters.uninstalled += 1,
            _ => {}
        },
        EventStatus::Failed => counters.failed += 1,
        EventStatus::Warning => counters.warned += 1,
        _ => {}
    }

    let event = EventRecord {
        session_id: session_id.to_string(),
        timestamp: Utc::now(),
        item_name: Some(item_name.to_string()),
        action: action.to_string(),
        status,
        message: message.clone(),
    };

    sink(&event);
    transcript.append_event_line(&event).ok();
    reporter::record_event(root, &event).ok();

    let line = match &message {
        Some(m) => format!("{} {}: {}", action, item_name, m),
        None => format!("{} {}: {:?}", action, item_name, status),
    };
    transcript.append_human_log(&line).ok();
}

fn record_outcome(
    root: &Path,
    item_name: &str,
    outcome: &DispatchOutcome,
    was_uninstall: bool,
    now: chrono::DateTime<Utc>,
) -> Result<(), reporter::ReportError> {
    let mut record = reporter::load_item(root, item_name)?.unwrap_or(PackageRecord {
        name: item_name.to_string(),
        current_status: PackageCurrentStatus::NotInstalled,
        installed_version: None,
        last_attempt: None,
        last_success: None,
        recent_attempts: vec![],
    });

    let succeeded = outcome.status == EventStatus::Success;
    record.last_attempt = Some(now);
    if succeeded {
        record.last_success = Some(now);
    }
    record.recent_attempts.push(AttemptRecord {
        timestamp: now,
        succeeded,
    });
    record.recent_attempts.retain(|a| now.signed_duration_since(a.timestamp).num_days() < 7);

    let last_outcome = if was_uninstall {
        if succeeded {
            PackageCurrentStatus::NotInstalled
        } else {
            PackageCurrentStatus::Failed
        }
    } else if succeeded {
        PackageCurrentStatus::Installed
    } else if outcome.status == EventStatus::Warning {
        PackageCurrentStatus::Warning
    } else {
        PackageCurrentStatus::Failed
    };

    // Reaching dispatch at all means the item was found in this run's catalog.
    record.current_status = record.derive_status(now, true, last_outcome);

    reporter::update_item(root, &record)
}

async fn schedule_self_update(
    root: &Path,
    catalog: &CatalogIndex,
    candidate: &PlanCandidate,
    facts: &SystemFacts,
) {
    let item = match catalog.by_name(&candidate.name, &facts.arch) {
        ByNameResult::Found(item) => item,
        _ => return,
    };
    let Some(installer) = &item.installer else {
        return;
    };

    let cache_dest: PathBuf = PathBuf::from(&installer.location);
    let filename = cache_dest
        .file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_else(|| item.name.clone());
    let local_file = root.join("Cache").join(filename);

    if let Err(e) = selfupdate::write_marker(
        root,
        &item.name,
        item.version.as_str(),
        installer.installer_type,
        &local_file,
    ) {
        log::warn!("could not write self-update marker for {}: {}", item.name, e);
    }
}

/// Acquires the runlock and runs one reconciliation pass via a manually
/// constructed Tokio runtime, avoiding `#[tokio::main]` so the lock's
/// closure-scoped guard and the async driver compose without nesting one
/// runtime inside another.
pub fn run_locked(
    root: &Path,
    cfg: &Config,
    run_type: RunType,
    credentials: &dyn CredentialProvider,
) -> Result<RunSummary, DriverError> {
    run_locked_with_sink(root, cfg, run_type, credentials, &no_sink)
}

/// Same as [`run_locked`] but forwards every emitted event to `sink`, for
/// the CLI's `--show-status` local status channel.
pub fn run_locked_with_sink(
    root: &Path,
    cfg: &Config,
    run_type: RunType,
    credentials: &dyn CredentialProvider,
    sink: EventSink<'_>,
) -> Result<RunSummary, DriverError> {
    runlock::with_runlock(root, || {
        let mut rt = tokio::runtime::Runtime::new().expect("tokio runtime builds");
        rt.block_on(run_with_sink(root, cfg, run_type, credentials, sink))
    })
    .map_err(|e| match e {
        runlock::RunLockError::AlreadyRunning => DriverError::AlreadyRunning,
        other => DriverError::RunLock(other),
    })?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_label_matches_plan_action() {
        assert_eq!(action_label(PlanAction::Install), "install");
        assert_eq!(action_label(PlanAction::Update), "update");
        assert_eq!(action_label(PlanAction::Uninstall), "uninstall");
    }

    #[test]
    fn test_skip_reason_messages_are_distinct() {
        let messages: std::collections::HashSet<String> = [
            SkipReason::Satisfied,
            SkipReason::NothingToUpdate,
            SkipReason::AlreadyAbsent,
            SkipReason::PolicyBlocked,
        ]
        .iter()
        .map(|r| skip_reason_message(*r))
        .collect();
        assert_eq!(messages.len(), 4);
    }
}
