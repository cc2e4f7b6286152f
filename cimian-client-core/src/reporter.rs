//! The Reporter (spec §4.I): an append-only event stream plus rolling
//! aggregates under `C:\ProgramData\ManagedInstalls\reports\`.
//!
//! Aggregate files (`sessions.json`, `events.json`, `items.json`) are
//! mutated under an exclusive lock on `reports/.lock`, the same sidecar-lock
//! pattern the Fetcher uses for its destination files (`fetch.rs`), and
//! written via a temp-file-then-rename so readers always see a complete
//! snapshot, mirroring the teacher's `Repository::save_to_cache`.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use cimian_types::{EventRecord, PackageRecord, SessionRecord};
use thiserror::Error;

pub const DEFAULT_REPORTS_ROOT: &str = r"C:\ProgramData\ManagedInstalls\reports";

const EVENTS_RETENTION: Duration = Duration::hours(48);
const SESSIONS_RETENTION: Duration = Duration::days(30);
const LOG_DIR_RETENTION: Duration = Duration::days(10);

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("could not acquire report lock at {}", path.display())]
    Lock { path: PathBuf, #[source] source: std::io::Error },
    #[error("io error at {}", path.display())]
    Io { path: PathBuf, #[source] source: std::io::Error },
    #[error("could not parse report file {}", path.display())]
    Parse { path: PathBuf, #[source] source: serde_json::Error },
}

fn read_json_or_default<T: Default + serde::de::DeserializeOwned>(
    path: &Path,
) -> Result<T, ReportError> {
    match std::fs::read_to_string(path) {
        Ok(contents) if contents.trim().is_empty() => Ok(T::default()),
        Ok(contents) => serde_json::from_str(&contents).map_err(|source| ReportError::Parse {
            path: path.to_path_buf(),
            source,
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(source) => Err(ReportError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), ReportError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(|source| ReportError::Io {
        path: parent.to_path_buf(),
        source,
    })?;

    let tmp_path = path.with_extension("json.tmp");
    {
        let mut file = std::fs::File::create(&tmp_path).map_err(|source| ReportError::Io {
            path: tmp_path.clone(),
            source,
        })?;
        let bytes = serde_json::to_vec_pretty(value).expect("report value is always valid JSON");
        file.write_all(&bytes).map_err(|source| ReportError::Io {
            path: tmp_path.clone(),
            source,
        })?;
    }
    std::fs::rename(&tmp_path, path).map_err(|source| ReportError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn with_report_lock<F, T>(root: &Path, f: F) -> Result<T, ReportError>
where
    F: FnOnce() -> Result<T, ReportError>,
{
    std::fs::create_dir_all(root).map_err(|source| ReportError::Io {
        path: root.to_path_buf(),
        source,
    })?;
    let lock_path = root.join(".lock");
    let lock_file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(&lock_path)
        .map_err(|source| ReportError::Lock {
            path: lock_path.clone(),
            source,
        })?;
    let mut file_lock = fd_lock::RwLock::new(lock_file);
    let _guard = file_lock.write().map_err(|source| ReportError::Lock {
        path: lock_path,
        source,
    })?;

    f()
}

/// A single reconciliation run's on-disk transcript under `logs/<timestamp>/`.
pub struct RunTranscript {
    pub dir: PathBuf,
    pub session_id: String,
}

impl RunTranscript {
    pub fn open(root: &Path, session_id: &str, started_at: DateTime<Utc>) -> Result<Self, ReportError> {
        let dir = root
            .join("logs")
            .join(started_at.format("%Y-%m-%d-%H%M%S").to_string());
        std::fs::create_dir_all(&dir).map_err(|source| ReportError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(RunTranscript {
            dir,
            session_id: session_id.to_string(),
        })
    }

    pub fn append_event_line(&self, event: &EventRecord) -> Result<(), ReportError> {
        let path = self.dir.join("events.jsonl");
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| ReportError::Io { path: path.clone(), source })?;
        let line = serde_json::to_string(event).expect("event is always valid JSON");
        writeln!(file, "{}", line).map_err(|source| ReportError::Io { path, source })
    }

    pub fn append_human_log(&self, message: &str) -> Result<(), ReportError> {
        let path = self.dir.join("install.log");
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| ReportError::Io { path: path.clone(), source })?;
        writeln!(file, "[{}] {}", Utc::now().to_rfc3339(), message)
            .map_err(|source| ReportError::Io { path, source })
    }

    pub fn write_session_json(&self, session: &SessionRecord) -> Result<(), ReportError> {
        write_json_atomic(&self.dir.join("session.json"), session)
    }

    pub fn write_summary_json<T: serde::Serialize>(&self, summary: &T) -> Result<(), ReportError> {
        write_json_atomic(&self.dir.join("summary.json"), summary)
    }
}

/// Appends `event` to the rolling `events.json` aggregate, dropping entries
/// older than 48 hours.
pub fn record_event(root: &Path, event: &EventRecord) -> Result<(), ReportError> {
    with_report_lock(root, || {
        let path = root.join("events.json");
        let mut events: Vec<EventRecord> = read_json_or_default(&path)?;
        events.push(event.clone());
        let cutoff = Utc::now() - EVENTS_RETENTION;
        events.retain(|e| e.timestamp >= cutoff);
        write_json_atomic(&path, &events)
    })
}

/// Appends `session` to the rolling `sessions.json` aggregate, trimming
/// entries older than 30 days.
pub fn record_session(root: &Path, session: &SessionRecord) -> Result<(), ReportError> {
    with_report_lock(root, || {
        let path = root.join("sessions.json");
        let mut sessions: Vec<SessionRecord> = read_json_or_default(&path)?;
        sessions.push(session.clone());
        let cutoff = Utc::now() - SESSIONS_RETENTION;
        sessions.retain(|s| s.started_at >= cutoff);
        write_json_atomic(&path, &sessions)
    })
}

/// Merges `record` into the cumulative `items.json` aggregate, keyed by
/// package name.
pub fn update_item(root: &Path, record: &PackageRecord) -> Result<(), ReportError> {
    with_report_lock(root, || {
        let path = root.join("items.json");
        let mut items: HashMap<String, PackageRecord> = read_json_or_default(&path)?;
        items.insert(record.name.clone(), record.clone());
        write_json_atomic(&path, &items)
    })
}

pub fn load_item(root: &Path, name: &str) -> Result<Option<PackageRecord>, ReportError> {
    let path = root.join("items.json");
    let items: HashMap<String, PackageRecord> = read_json_or_default(&path)?;
    Ok(items.get(name).cloned())
}

/// Deletes per-run log directories under `logs/` older than 10 days.
pub fn prune_log_dirs(root: &Path) -> Result<(), ReportError> {
    let logs_dir = root.join("logs");
    let entries = match std::fs::read_dir(&logs_dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(source) => return Err(ReportError::Io { path: logs_dir, source }),
    };

    let cutoff = std::time::SystemTime::now()
        .checked_sub(LOG_DIR_RETENTION.to_std().expect("positive retention"))
        .unwrap_or(std::time::SystemTime::UNIX_EPOCH);

    for entry in entries.flatten() {
        let path = entry.path();
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(std::time::SystemTime::now());
        if modified < cutoff {
            let _ = std::fs::remove_dir_all(&path);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cimian_types::{EventStatus, PackageCurrentStatus};

    fn event(session_id: &str, timestamp: DateTime<Utc>) -> EventRecord {
        EventRecord {
            session_id: session_id.to_string(),
            timestamp,
            item_name: Some("GoogleChrome".to_string()),
            action: "install".to_string(),
            status: EventStatus::Success,
            message: None,
        }
    }

    #[test]
    fn test_record_event_appends_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        record_event(dir.path(), &event("s1", now)).unwrap();
        record_event(dir.path(), &event("s2", now)).unwrap();

        let events: Vec<EventRecord> = read_json_or_default(&dir.path().join("events.json")).unwrap();
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_record_event_drops_stale_entries() {
        let dir = tempfile::tempdir().unwrap();
        let old = Utc::now() - Duration::hours(72);
        record_event(dir.path(), &event("old", old)).unwrap();
        record_event(dir.path(), &event("new", Utc::now())).unwrap();

        let events: Vec<EventRecord> = read_json_or_default(&dir.path().join("events.json")).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].session_id, "new");
    }

    #[test]
    fn test_update_item_is_keyed_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let record = PackageRecord {
            name: "GoogleChrome".to_string(),
            current_status: PackageCurrentStatus::Installed,
            installed_version: None,
            last_attempt: None,
            last_success: None,
            recent_attempts: vec![],
        };
        update_item(dir.path(), &record).unwrap();
        let loaded = load_item(dir.path(), "GoogleChrome").unwrap();
        assert!(loaded.is_some());
        assert!(load_item(dir.path(), "Missing").unwrap().is_none());
    }

    #[test]
    fn test_run_transcript_writes_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let transcript = RunTranscript::open(dir.path(), "s1", Utc::now()).unwrap();
        transcript.append_event_line(&event("s1", Utc::now())).unwrap();
        transcript.append_event_line(&event("s1", Utc::now())).unwrap();

        let contents = std::fs::read_to_string(transcript.dir.join("events.jsonl")).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
