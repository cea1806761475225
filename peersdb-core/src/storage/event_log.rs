//! Grow-only replicated event log.
//!
//! Entries are content-hashed and ordered by a Lamport clock. Local appends
//! surface as [`LogEvent::Write`]; entries merged in from peers surface as one
//! [`LogEvent::Replicated`] batch per merge. Events carry the log address and
//! go to the event bus the log was opened with. Moving entries between peers
//! is delegated to a [`LogSync`] implementation.

use super::log_registry::LogDb;
use crate::error::{PeersError, Result};
use crate::storage::content_store::compute_hash;
use crate::types::PeerId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;

const ADDRESS_ROOT: &str = "peersdb";

/// Globally unique log address: `/peersdb/<ulid>/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StoreAddress {
    id: String,
    name: String,
}

impl StoreAddress {
    /// Mint a new address for a log called `name`.
    pub fn generate(name: &str) -> Result<Self> {
        Self::validate_name(name)?;
        Ok(Self {
            id: ulid::Ulid::new().to_string(),
            name: name.to_string(),
        })
    }

    pub fn parse(value: &str) -> Result<Self> {
        let parts: Vec<&str> = value.trim().split('/').collect();
        match parts.as_slice() {
            ["", root, id, name] if *root == ADDRESS_ROOT => {
                ulid::Ulid::from_string(id).map_err(|error| {
                    PeersError::InvalidRequest(format!("invalid store address {}: {}", value, error))
                })?;
                Self::validate_name(name)?;
                Ok(Self {
                    id: id.to_string(),
                    name: name.to_string(),
                })
            }
            _ => Err(PeersError::InvalidRequest(format!(
                "invalid store address: {}",
                value
            ))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn validate_name(name: &str) -> Result<()> {
        if name.is_empty() || name.contains('/') {
            return Err(PeersError::InvalidRequest(format!(
                "invalid store name: '{}'",
                name
            )));
        }
        Ok(())
    }
}

impl fmt::Display for StoreAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}/{}", ADDRESS_ROOT, self.id, self.name)
    }
}

impl TryFrom<String> for StoreAddress {
    type Error = PeersError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<StoreAddress> for String {
    fn from(value: StoreAddress) -> Self {
        value.to_string()
    }
}

/// Who may append to a log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessPolicy {
    OpenWrite,
    Writers(Vec<PeerId>),
}

impl AccessPolicy {
    pub fn allows(&self, writer: &PeerId) -> bool {
        match self {
            Self::OpenWrite => true,
            Self::Writers(writers) => writers.contains(writer),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub create: bool,
    pub access: AccessPolicy,
}

impl OpenOptions {
    /// Open an existing log (or a replica of a remote one), anyone may write.
    pub fn open_write() -> Self {
        Self {
            create: false,
            access: AccessPolicy::OpenWrite,
        }
    }

    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub hash: String,
    pub writer: PeerId,
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl LogEntry {
    pub fn new(writer: PeerId, clock: u64, payload: Vec<u8>) -> Self {
        let hash = entry_hash(&writer, clock, &payload);
        Self {
            hash,
            writer,
            clock,
            payload,
        }
    }

    pub fn is_intact(&self) -> bool {
        entry_hash(&self.writer, self.clock, &self.payload) == self.hash
    }
}

fn entry_hash(writer: &PeerId, clock: u64, payload: &[u8]) -> String {
    let mut material = Vec::with_capacity(writer.as_str().len() + 9 + payload.len());
    material.extend_from_slice(writer.as_str().as_bytes());
    material.push(0);
    material.extend_from_slice(&clock.to_be_bytes());
    material.extend_from_slice(payload);
    compute_hash(&material)
}

#[derive(Debug, Clone)]
pub enum LogEvent {
    Write {
        address: StoreAddress,
        entry: LogEntry,
    },
    Replicated {
        address: StoreAddress,
        entries: Vec<LogEntry>,
    },
}

/// Moves log entries between peers.
#[async_trait]
pub trait LogSync: Send + Sync {
    /// Offer freshly written entries to connected peers.
    async fn push(&self, address: &StoreAddress, entries: &[LogEntry]) -> Result<()>;

    /// Collect every entry connected peers hold for `address`.
    async fn pull(&self, address: &StoreAddress) -> Result<Vec<LogEntry>>;
}

#[derive(Default)]
struct LogState {
    entries: BTreeMap<(u64, String), LogEntry>,
    seen: HashSet<String>,
    max_clock: u64,
}

impl LogState {
    fn insert(&mut self, entry: LogEntry) -> bool {
        if !self.seen.insert(entry.hash.clone()) {
            return false;
        }
        self.max_clock = self.max_clock.max(entry.clock);
        self.entries.insert((entry.clock, entry.hash.clone()), entry);
        true
    }
}

pub struct ReplicatedLog {
    address: StoreAddress,
    local_writer: PeerId,
    access: AccessPolicy,
    state: RwLock<LogState>,
    events: broadcast::Sender<LogEvent>,
    sync: Arc<dyn LogSync>,
    db: Option<Arc<LogDb>>,
}

impl ReplicatedLog {
    pub(crate) fn new(
        address: StoreAddress,
        local_writer: PeerId,
        access: AccessPolicy,
        sync: Arc<dyn LogSync>,
        db: Option<Arc<LogDb>>,
        persisted: Vec<LogEntry>,
        events: broadcast::Sender<LogEvent>,
    ) -> Self {
        let mut state = LogState::default();
        for entry in persisted {
            state.insert(entry);
        }

        Self {
            address,
            local_writer,
            access,
            state: RwLock::new(state),
            events,
            sync,
            db,
        }
    }

    pub fn address(&self) -> &StoreAddress {
        &self.address
    }

    pub fn access(&self) -> &AccessPolicy {
        &self.access
    }

    /// Subscribe to the event bus this log publishes to.
    pub fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.events.subscribe()
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.read_state()?.entries.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Append a local entry.
    pub async fn add(&self, payload: Vec<u8>) -> Result<LogEntry> {
        if !self.access.allows(&self.local_writer) {
            return Err(PeersError::WriteDenied {
                writer: self.local_writer.to_string(),
                address: self.address.to_string(),
            });
        }

        let entry = {
            let mut state = self.write_state()?;
            let entry = LogEntry::new(self.local_writer.clone(), state.max_clock + 1, payload);
            state.insert(entry.clone());
            entry
        };

        if let Some(db) = &self.db {
            db.insert_entries(&self.address, std::slice::from_ref(&entry))?;
        }

        let _ = self.events.send(LogEvent::Write {
            address: self.address.clone(),
            entry: entry.clone(),
        });

        if let Err(error) = self
            .sync
            .push(&self.address, std::slice::from_ref(&entry))
            .await
        {
            tracing::warn!(address = %self.address, "Failed to push entry to peers: {}", error);
        }

        Ok(entry)
    }

    /// Admit entries received from peers. Returns the ones that were new.
    pub fn merge(&self, entries: Vec<LogEntry>) -> Result<Vec<LogEntry>> {
        let mut admitted = Vec::new();
        {
            let mut state = self.write_state()?;
            for entry in entries {
                if !entry.is_intact() {
                    tracing::warn!(address = %self.address, hash = %entry.hash, "Dropping entry with mismatched hash");
                    continue;
                }
                if !self.access.allows(&entry.writer) {
                    tracing::warn!(address = %self.address, writer = %entry.writer, "Dropping entry from unauthorised writer");
                    continue;
                }
                if state.insert(entry.clone()) {
                    admitted.push(entry);
                }
            }
        }

        if admitted.is_empty() {
            return Ok(admitted);
        }

        admitted.sort_by(|a, b| (a.clock, &a.hash).cmp(&(b.clock, &b.hash)));
        if let Some(db) = &self.db {
            db.insert_entries(&self.address, &admitted)?;
        }

        let _ = self.events.send(LogEvent::Replicated {
            address: self.address.clone(),
            entries: admitted.clone(),
        });

        Ok(admitted)
    }

    /// Pull everything peers hold and merge it. Returns the number of new entries.
    pub async fn load(&self) -> Result<usize> {
        let remote = self.sync.pull(&self.address).await?;
        let admitted = self.merge(remote)?;
        tracing::debug!(address = %self.address, new_entries = admitted.len(), "Loaded log");
        Ok(admitted.len())
    }

    /// All entries in log order.
    pub fn list(&self) -> Result<Vec<LogEntry>> {
        Ok(self.read_state()?.entries.values().cloned().collect())
    }

    fn read_state(&self) -> Result<RwLockReadGuard<'_, LogState>> {
        self.state
            .read()
            .map_err(|_| PeersError::Internal("log state lock poisoned".to_string()))
    }

    fn write_state(&self) -> Result<RwLockWriteGuard<'_, LogState>> {
        self.state
            .write()
            .map_err(|_| PeersError::Internal("log state lock poisoned".to_string()))
    }
}
