use crate::benchmark::Benchmark;
use crate::error::{PeersError, Result};
use crate::node_state::NodeState;
use crate::operations::{AcceptAll, ValidityPredicate};
use crate::storage::{
    ContentStore, LogDb, LogRegistry, LogSync, ReplicatedLog, StoreAddress, ValidationStore,
};
use crate::transport::Transport;
use crate::types::PeerId;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct NodeOptions {
    /// Name prefix of the persisted state files and the local database directory.
    pub repo: String,
    pub data_dir: PathBuf,
    /// Where GET writes fetched content. A leading `~/` is the home directory.
    pub download_dir: String,
    pub benchmark: bool,
    pub full_replica: bool,
    /// Create the Contributions log if no persisted one resolves.
    pub root: bool,
    pub region: String,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            repo: "peersdb".to_string(),
            data_dir: PathBuf::from("."),
            download_dir: "~/Downloads/".to_string(),
            benchmark: false,
            full_replica: false,
            root: false,
            region: String::new(),
        }
    }
}

impl NodeOptions {
    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}_config", self.repo))
    }

    pub fn benchmark_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}_benchmark", self.repo))
    }

    pub fn store_dir(&self) -> PathBuf {
        self.data_dir.join(&self.repo)
    }
}

/// The Contributions log reference. Bound at most once per node lifetime.
#[derive(Clone)]
pub struct StoreSlot {
    slot: Arc<watch::Sender<Option<Arc<ReplicatedLog>>>>,
}

impl Default for StoreSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreSlot {
    pub fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Self {
            slot: Arc::new(slot),
        }
    }

    pub fn get(&self) -> Option<Arc<ReplicatedLog>> {
        self.slot.borrow().clone()
    }

    pub fn is_bound(&self) -> bool {
        self.slot.borrow().is_some()
    }

    pub fn is_bound_to(&self, address: &StoreAddress) -> bool {
        self.slot
            .borrow()
            .as_ref()
            .is_some_and(|log| log.address() == address)
    }

    /// Bind the slot unless it already is. Returns whether this call bound it.
    pub fn bind_once(&self, log: Arc<ReplicatedLog>) -> bool {
        self.slot.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(log);
            true
        })
    }

    /// Wait until the slot is bound.
    pub async fn wait_bound(&self) -> Arc<ReplicatedLog> {
        let mut receiver = self.slot.subscribe();
        loop {
            if let Some(log) = receiver.borrow_and_update().clone() {
                return log;
            }
            // The sender lives in `self`, so the channel cannot close here.
            if receiver.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Everything the coordination components share.
pub struct NodeContext {
    pub options: NodeOptions,
    pub peer_id: PeerId,
    pub transport: Arc<dyn Transport>,
    pub content: Arc<dyn ContentStore>,
    pub logs: Arc<LogRegistry>,
    pub validations: Arc<ValidationStore>,
    pub contributions: StoreSlot,
    pub benchmark: Arc<Mutex<Benchmark>>,
    pub predicate: Arc<dyn ValidityPredicate>,
    pub shutdown: CancellationToken,
    state: Mutex<NodeState>,
}

impl NodeContext {
    /// Adopt `log` as the Contributions log if none is bound yet.
    pub fn bind_contributions(&self, log: Arc<ReplicatedLog>) -> Result<bool> {
        let address = log.address().to_string();
        if !self.contributions.bind_once(log) {
            return Ok(false);
        }

        self.lock_state()?.contributions_store_addr = address.clone();
        tracing::info!(address = %address, "Contributions store loaded");
        Ok(true)
    }

    /// The bound Contributions log, or the error telling the caller to find a peer.
    pub fn require_contributions(&self) -> Result<Arc<ReplicatedLog>> {
        self.contributions.get().ok_or(PeersError::NoDatastore)
    }

    pub fn state(&self) -> Result<NodeState> {
        Ok(self.lock_state()?.clone())
    }

    /// Write the node state document.
    pub fn save_state(&self) -> Result<()> {
        let state = self.state()?;
        state.save(&self.options.state_path())
    }

    /// Write the benchmark snapshot.
    pub fn save_benchmark(&self) -> Result<()> {
        let snapshot = self.benchmark()?.clone();
        snapshot.save(&self.options.benchmark_path())
    }

    pub fn benchmark(&self) -> Result<MutexGuard<'_, Benchmark>> {
        self.benchmark
            .lock()
            .map_err(|_| PeersError::Internal("benchmark lock poisoned".to_string()))
    }

    /// A failure the node cannot continue without: log it and shut down.
    pub fn fatal(&self, what: &str, error: PeersError) {
        tracing::error!("{}: {}", what, error);
        self.shutdown.cancel();
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, NodeState>> {
        self.state
            .lock()
            .map_err(|_| PeersError::Internal("node state lock poisoned".to_string()))
    }
}

pub struct NodeBuilder {
    options: NodeOptions,
    transport: Option<Arc<dyn Transport>>,
    content: Option<Arc<dyn ContentStore>>,
    log_sync: Option<Arc<dyn LogSync>>,
    predicate: Arc<dyn ValidityPredicate>,
    shutdown: CancellationToken,
}

impl Default for NodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeBuilder {
    pub fn new() -> Self {
        Self {
            options: NodeOptions::default(),
            transport: None,
            content: None,
            log_sync: None,
            predicate: Arc::new(AcceptAll),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn options(mut self, options: NodeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn content(mut self, content: Arc<dyn ContentStore>) -> Self {
        self.content = Some(content);
        self
    }

    pub fn log_sync(mut self, log_sync: Arc<dyn LogSync>) -> Self {
        self.log_sync = Some(log_sync);
        self
    }

    pub fn predicate(mut self, predicate: Arc<dyn ValidityPredicate>) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn build(self) -> Result<Arc<NodeContext>> {
        let transport = self
            .transport
            .ok_or_else(|| PeersError::Config("a transport is required".to_string()))?;
        let content = self
            .content
            .ok_or_else(|| PeersError::Config("a content store is required".to_string()))?;
        let log_sync = self
            .log_sync
            .ok_or_else(|| PeersError::Config("a log sync is required".to_string()))?;

        let options = self.options;
        if options.repo.trim().is_empty() {
            return Err(PeersError::Config("repo name cannot be empty".to_string()));
        }

        let peer_id = transport.local_peer_id().clone();
        let mut state = NodeState::load(&options.state_path())?;
        state.peer_id = peer_id.to_string();
        if !options.region.is_empty() {
            state.region = options.region.clone();
        }

        let store_dir = options.store_dir();
        let log_db = LogDb::new(store_dir.join("logs.sqlite"))?;
        let logs = Arc::new(LogRegistry::new(peer_id.clone(), log_sync, Some(log_db)));

        let validations_path = store_dir.join("validations.sqlite");
        let validations = Arc::new(ValidationStore::new(validations_path.clone())?);
        state.validations_store_addr = validations_path.display().to_string();

        let benchmark = Benchmark::new(Utc::now(), state.region.clone());

        tracing::info!(peer = %peer_id, repo = %options.repo, "Node context ready");

        Ok(Arc::new(NodeContext {
            options,
            peer_id,
            transport,
            content,
            logs,
            validations,
            contributions: StoreSlot::new(),
            benchmark: Arc::new(Mutex::new(benchmark)),
            predicate: self.predicate,
            shutdown: self.shutdown,
            state: Mutex::new(state),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::OpenOptions;
    use crate::transport::MemoryNetwork;

    fn context(data_dir: PathBuf) -> Arc<NodeContext> {
        let network = MemoryNetwork::new();
        let endpoint = Arc::new(network.endpoint(PeerId::new("local")).unwrap());
        NodeBuilder::new()
            .options(NodeOptions {
                data_dir,
                ..NodeOptions::default()
            })
            .transport(endpoint.clone())
            .content(endpoint.clone())
            .log_sync(endpoint)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_store_slot_binds_once() {
        let temp_dir = tempfile::tempdir().unwrap();
        let ctx = context(temp_dir.path().to_path_buf());
        assert!(matches!(
            ctx.require_contributions(),
            Err(PeersError::NoDatastore)
        ));

        let waiter = {
            let slot = ctx.contributions.clone();
            tokio::spawn(async move { slot.wait_bound().await.address().clone() })
        };

        let first = ctx
            .logs
            .open("contributions", &OpenOptions::open_write().create(true))
            .unwrap();
        let second = ctx
            .logs
            .open("other", &OpenOptions::open_write().create(true))
            .unwrap();

        assert!(ctx.bind_contributions(first.clone()).unwrap());
        assert!(!ctx.bind_contributions(second).unwrap());

        assert_eq!(&waiter.await.unwrap(), first.address());
        assert!(ctx.contributions.is_bound_to(first.address()));
        assert_eq!(
            ctx.state().unwrap().contributions_store_addr,
            first.address().to_string()
        );
    }

    #[test]
    fn test_builder_requires_collaborators() {
        let err = NodeBuilder::new().build().err().unwrap();
        assert!(matches!(err, PeersError::Config(_)));
    }
}
