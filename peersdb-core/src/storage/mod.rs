//! Storage modules for PeersDB
//!
//! Content-addressed payload storage, the replicated Contributions log and
//! the private validations store.

pub mod content_store;
pub mod event_log;
pub mod log_registry;
pub mod validation_store;

pub use content_store::{ContentStore, FsContentStore, compute_hash, verify_hash};
pub use event_log::{
    AccessPolicy, LogEntry, LogEvent, LogSync, OpenOptions, ReplicatedLog, StoreAddress,
};
pub use log_registry::{LogDb, LogRegistry};
pub use validation_store::ValidationStore;
