pub mod comparator;
pub mod engine;
pub mod report;
pub mod transfer;

pub use comparator::{compare, is_stale, ObjectRelation};
pub use engine::{RunState, SyncConfig, SyncEngine, SyncEvent};
pub use report::{
    ContainerSummary, FailureKind, ItemFailure, ProvisionState, RunStatus, RunSummary, SyncOutcome,
};
pub use transfer::{copy_object, sync_object};
