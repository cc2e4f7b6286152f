#![recursion_limit = "2048"]
#![deny(unused_must_use)]
#![deny(rust_2018_idioms)]

pub mod catalog;
pub mod config;
pub mod dispatch;
pub mod driver;
pub mod evaluate;
pub mod facts;
pub mod fetch;
pub mod plan;
pub mod reporter;
pub mod resolve;
pub mod runlock;
pub mod script;
pub mod selfupdate;
pub mod trigger;

pub use catalog::{ByNameResult, CatalogError, CatalogIndex};
pub use config::{Config, ConfigError};
pub use dispatch::{DispatchError, DispatchOutcome};
pub use driver::{run, run_locked, run_locked_with_sink, run_with_sink, DriverError, EventSink, RunSummary};
pub use evaluate::{Decision, EvaluatedItem, SkipReason};
pub use fetch::{AnonymousCredentialProvider, CredentialProvider, FetchError, FetchOutcome, Fetcher};
pub use plan::{PlanAction, PlanCandidate, PlanError};
pub use reporter::{ReportError, RunTranscript};
pub use resolve::{Action, DesiredItem, ManifestLoadError, ResolvedDesiredState};
pub use runlock::RunLockError;
pub use selfupdate::{SelfUpdateError, SelfUpdateOutcome};
pub use trigger::TriggerError;
