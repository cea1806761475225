//! PeersDB Core - Core library for a peer-to-peer contribution log
//!
//! Peers publish content references to a shared, replicated log and judge
//! content validity together:
//! - store discovery between newly connected peers (first advertisement wins)
//! - local self-validation with a 5 second quorum vote as fallback
//! - replication book-keeping (benchmark timings, full-replica pinning)
//! - a single-flight command dispatcher for GET/POST/CONNECT/QUERY/BENCHMARK
//! - SHA256 content-addressed payloads and SQLite for local persistence

pub mod benchmark;
pub mod command;
pub mod constants;
pub mod error;
pub mod node;
pub mod node_state;
pub mod operations;
pub mod service;
pub mod storage;
pub mod transport;
pub mod types;

pub use benchmark::{Benchmark, BenchmarkReport, ReplicationTiming, Sample, spawn_sampler};
pub use command::{
    CommandClient, CommandQueues, Method, PendingRequest, QueriedContribution, Request, Response,
    ResponseBody,
};
pub use constants::*;
pub use error::{PeersError, Result};
pub use node::{NodeBuilder, NodeContext, NodeOptions, StoreSlot};
pub use node_state::NodeState;
pub use operations::*;
pub use service::{BENCHMARK_DISABLED_NOTICE, Dispatcher, NodeService};
pub use storage::{
    AccessPolicy, ContentStore, FsContentStore, LogDb, LogEntry, LogEvent, LogRegistry, LogSync,
    OpenOptions, ReplicatedLog, StoreAddress, ValidationStore, compute_hash, verify_hash,
};
pub use transport::{
    Connectedness, ConnectednessEvent, MemoryEndpoint, MemoryNetwork, TopicHub,
    TopicSubscription, Transport,
};
pub use types::{
    ContentRef, Contribution, PeerId, StoreAdvertisement, ValidationRecord, ValidationRequest,
    ValidationVote, decode_message, encode_message, reply_topic,
};
