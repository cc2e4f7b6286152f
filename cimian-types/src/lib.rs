pub mod facts;
pub mod manifest;
pub mod package;
pub mod predicate;
pub mod report;
pub mod version;

pub use facts::SystemFacts;
pub use manifest::{ConditionalItem, ManifestFile};
pub use package::{
    Architecture, CatalogItem, Installer, InstallerType, InstallsEntry, Scripts, UninstallOp,
    Uninstallable, Uninstaller,
};
pub use predicate::{ConditionExpression, ConditionParseError, FactValue};
pub use report::{
    AttemptRecord, EventRecord, EventStatus, PackageCurrentStatus, PackageRecord, RunType,
    SessionRecord, SessionStatus,
};
pub use version::Version;
