use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::version::Version;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventStatus {
    Success,
    Failed,
    Warning,
    Pending,
    Skipped,
    Unknown,
}

/// Package-current-status vocabulary (spec §4.I). Variants are spelled with
/// spaces in the serialized form (`"Install Loop"`, `"Not Installed"`,
/// `"Pending Install"`) to match the closed status set verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PackageCurrentStatus {
    Installed,
    Failed,
    Warning,
    #[serde(rename = "Install Loop")]
    InstallLoop,
    #[serde(rename = "Not Installed")]
    NotInstalled,
    #[serde(rename = "Pending Install")]
    PendingInstall,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Completed,
    Failed,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunType {
    Auto,
    Manual,
    Triggered,
    Bootstrap,
}

/// One line of a run's `events.jsonl` transcript, and the unit the Reporter
/// appends to the rolling `events.json` aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub item_name: Option<String>,
    pub action: String,
    pub status: EventStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Latest known state for one package, as kept in `items.json`. Cumulative:
/// never pruned by retention, only ever updated in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageRecord {
    pub name: String,
    pub current_status: PackageCurrentStatus,
    pub installed_version: Option<Version>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    /// Attempts in the trailing 7-day window, most recent last. Used by the
    /// Dispatcher's install-loop heuristic (>=3 attempts, success rate <50%).
    #[serde(default)]
    pub recent_attempts: Vec<AttemptRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    pub timestamp: DateTime<Utc>,
    pub succeeded: bool,
}

impl PackageRecord {
    /// Install-loop criterion from spec §4.F: among the last 7 days of
    /// attempts, >=3 attempts and a success rate below 50%.
    pub fn is_install_loop(&self, now: DateTime<Utc>) -> bool {
        let window = self
            .recent_attempts
            .iter()
            .filter(|a| now.signed_duration_since(a.timestamp).num_days() < 7)
            .collect::<Vec<_>>();

        if window.len() < 3 {
            return false;
        }

        let successes = window.iter().filter(|a| a.succeeded).count();
        (successes as f64) / (window.len() as f64) < 0.5
    }

    /// Status-derivation priority order from spec §4.I: Install Loop, then
    /// Error (no known version), then Pending Install, else last outcome.
    pub fn derive_status(
        &self,
        now: DateTime<Utc>,
        catalog_offers_version: bool,
        last_outcome: PackageCurrentStatus,
    ) -> PackageCurrentStatus {
        if self.is_install_loop(now) {
            return PackageCurrentStatus::InstallLoop;
        }
        if self.installed_version.is_none() && self.last_success.is_none() {
            return PackageCurrentStatus::Error;
        }
        if matches!(last_outcome, PackageCurrentStatus::NotInstalled) && catalog_offers_version {
            return PackageCurrentStatus::PendingInstall;
        }
        last_outcome
    }
}

/// One run's summary, as kept in `sessions.json` (30-day rolling window) and
/// written as `session.json`/`summary.json` in the per-run log directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: String,
    pub run_type: RunType,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub items_installed: u32,
    pub items_updated: u32,
    pub items_uninstalled: u32,
    pub items_failed: u32,
    pub items_warned: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn attempt(days_ago: i64, succeeded: bool) -> AttemptRecord {
        AttemptRecord {
            timestamp: Utc::now() - Duration::days(days_ago),
            succeeded,
        }
    }

    #[test]
    fn test_install_loop_detection() {
        let record = PackageRecord {
            name: "Flaky".into(),
            current_status: PackageCurrentStatus::Failed,
            installed_version: None,
            last_attempt: Some(Utc::now()),
            last_success: None,
            recent_attempts: vec![
                attempt(1, false),
                attempt(2, false),
                attempt(3, true),
            ],
        };
        assert!(record.is_install_loop(Utc::now()));
    }

    #[test]
    fn test_no_loop_below_three_attempts() {
        let record = PackageRecord {
            name: "Flaky".into(),
            current_status: PackageCurrentStatus::Failed,
            installed_version: None,
            last_attempt: Some(Utc::now()),
            last_success: None,
            recent_attempts: vec![attempt(1, false), attempt(2, false)],
        };
        assert!(!record.is_install_loop(Utc::now()));
    }

    #[test]
    fn test_stale_attempts_excluded_from_window() {
        let record = PackageRecord {
            name: "Flaky".into(),
            current_status: PackageCurrentStatus::Failed,
            installed_version: None,
            last_attempt: Some(Utc::now()),
            last_success: None,
            recent_attempts: vec![attempt(10, false), attempt(11, false), attempt(12, false)],
        };
        assert!(!record.is_install_loop(Utc::now()));
    }

    #[test]
    fn test_status_priority_error_when_no_version() {
        let record = PackageRecord {
            name: "Never".into(),
            current_status: PackageCurrentStatus::NotInstalled,
            installed_version: None,
            last_attempt: None,
            last_success: None,
            recent_attempts: vec![],
        };
        assert_eq!(
            record.derive_status(Utc::now(), true, PackageCurrentStatus::NotInstalled),
            PackageCurrentStatus::Error
        );
    }

    #[test]
    fn test_status_serializes_with_spaces() {
        let s = serde_json::to_string(&PackageCurrentStatus::InstallLoop).unwrap();
        assert_eq!(s, "\"Install Loop\"");
    }
}
