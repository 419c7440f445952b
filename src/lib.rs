pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod scheduler;
pub mod storage;

pub use config::{AppConfig, StoreConfig, StoreType, SyncSettings};
pub use core::{RunStatus, RunSummary, SyncConfig, SyncEngine, SyncEvent, SyncOutcome};
pub use error::SyncError;
pub use storage::{create_store, Fingerprint, FingerprintSource, ObjectStore};
