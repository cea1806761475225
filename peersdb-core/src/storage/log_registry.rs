use super::event_log::{
    AccessPolicy, LogEntry, LogEvent, LogSync, OpenOptions, ReplicatedLog, StoreAddress,
};
use crate::constants::EVENT_BUFFER;
use crate::error::{PeersError, Result};
use crate::types::PeerId;
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

/// SQLite persistence for replicated logs, so a known address resolves
/// without any peer around.
pub struct LogDb {
    db_path: PathBuf,
}

impl LogDb {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Self { db_path };
        db.init_schema()?;
        Ok(db)
    }

    fn get_conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        Ok(conn)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.get_conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS logs (
                address TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                access TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS log_entries (
                address TEXT NOT NULL,
                hash TEXT NOT NULL,
                writer TEXT NOT NULL,
                clock INTEGER NOT NULL,
                payload BLOB NOT NULL,
                PRIMARY KEY (address, hash)
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_log_entries_order
             ON log_entries(address, clock, hash)",
            [],
        )?;

        Ok(())
    }

    pub fn register_log(&self, address: &StoreAddress, access: &AccessPolicy) -> Result<()> {
        let conn = self.get_conn()?;
        let access_json = serde_json::to_string(access)?;

        conn.execute(
            "INSERT OR IGNORE INTO logs (address, name, access, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                address.to_string(),
                address.name(),
                access_json,
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;

        Ok(())
    }

    pub fn find_log(&self, address: &StoreAddress) -> Result<Option<AccessPolicy>> {
        let conn = self.get_conn()?;

        let access_json: Option<String> = conn
            .query_row(
                "SELECT access FROM logs WHERE address = ?1",
                [address.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        match access_json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub fn insert_entries(&self, address: &StoreAddress, entries: &[LogEntry]) -> Result<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        let address = address.to_string();

        for entry in entries {
            tx.execute(
                "INSERT OR IGNORE INTO log_entries (address, hash, writer, clock, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    address,
                    entry.hash,
                    entry.writer.as_str(),
                    entry.clock as i64,
                    entry.payload,
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    pub fn load_entries(&self, address: &StoreAddress) -> Result<Vec<LogEntry>> {
        let conn = self.get_conn()?;

        let mut stmt = conn.prepare(
            "SELECT hash, writer, clock, payload FROM log_entries
             WHERE address = ?1 ORDER BY clock, hash",
        )?;

        let rows = stmt.query_map([address.to_string()], |row| {
            let hash: String = row.get(0)?;
            let writer: String = row.get(1)?;
            let clock: i64 = row.get(2)?;
            let payload: Vec<u8> = row.get(3)?;

            Ok(LogEntry {
                hash,
                writer: PeerId::new(writer),
                clock: clock as u64,
                payload,
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }

        Ok(entries)
    }
}

/// Opens, creates and tracks the replicated logs of this node.
///
/// Every log opened here publishes its events on one shared bus, so a
/// subscriber can exist before the log it cares about is known.
pub struct LogRegistry {
    local_peer: PeerId,
    sync: Arc<dyn LogSync>,
    db: Option<Arc<LogDb>>,
    open_logs: Mutex<HashMap<StoreAddress, Arc<ReplicatedLog>>>,
    events: broadcast::Sender<LogEvent>,
}

impl LogRegistry {
    pub fn new(local_peer: PeerId, sync: Arc<dyn LogSync>, db: Option<LogDb>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            local_peer,
            sync,
            db: db.map(Arc::new),
            open_logs: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.local_peer
    }

    /// Write and replication events of every log this registry opens.
    pub fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.events.subscribe()
    }

    /// Open a log by full address, or by bare name when `create` is set.
    ///
    /// A full address that is unknown locally opens an empty replica which
    /// fills up on `load`.
    pub fn open(&self, address_or_name: &str, options: &OpenOptions) -> Result<Arc<ReplicatedLog>> {
        let address = match StoreAddress::parse(address_or_name) {
            Ok(address) => address,
            Err(_) if options.create => {
                let address = StoreAddress::generate(address_or_name.trim())?;
                tracing::info!(address = %address, "Creating new log");
                address
            }
            Err(_) => return Err(PeersError::StoreNotFound(address_or_name.to_string())),
        };

        let mut open_logs = self.lock_open()?;
        if let Some(log) = open_logs.get(&address) {
            return Ok(log.clone());
        }

        let (access, persisted) = match &self.db {
            Some(db) => match db.find_log(&address)? {
                Some(access) => {
                    let entries = db.load_entries(&address)?;
                    (access, entries)
                }
                None => {
                    db.register_log(&address, &options.access)?;
                    (options.access.clone(), Vec::new())
                }
            },
            None => (options.access.clone(), Vec::new()),
        };

        tracing::debug!(address = %address, persisted = persisted.len(), "Opened log");

        let log = Arc::new(ReplicatedLog::new(
            address.clone(),
            self.local_peer.clone(),
            access,
            self.sync.clone(),
            self.db.clone(),
            persisted,
            self.events.clone(),
        ));
        open_logs.insert(address, log.clone());
        Ok(log)
    }

    /// An already open log, used to route inbound replication.
    pub fn get(&self, address: &StoreAddress) -> Option<Arc<ReplicatedLog>> {
        self.lock_open().ok()?.get(address).cloned()
    }

    /// Release every open log handle.
    pub fn close(&self) -> Result<usize> {
        let mut open_logs = self.lock_open()?;
        let closed = open_logs.len();
        open_logs.clear();
        tracing::info!("Closed {} log(s)", closed);
        Ok(closed)
    }

    fn lock_open(&self) -> Result<MutexGuard<'_, HashMap<StoreAddress, Arc<ReplicatedLog>>>> {
        self.open_logs
            .lock()
            .map_err(|_| PeersError::Internal("log registry lock poisoned".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NoPeers;

    #[async_trait]
    impl LogSync for NoPeers {
        async fn push(&self, _address: &StoreAddress, _entries: &[LogEntry]) -> Result<()> {
            Ok(())
        }

        async fn pull(&self, _address: &StoreAddress) -> Result<Vec<LogEntry>> {
            Ok(Vec::new())
        }
    }

    fn registry(path: PathBuf) -> LogRegistry {
        LogRegistry::new(
            PeerId::new("local"),
            Arc::new(NoPeers),
            Some(LogDb::new(path).unwrap()),
        )
    }

    #[tokio::test]
    async fn test_bare_name_requires_create() {
        let temp_dir = tempfile::tempdir().unwrap();
        let registry = registry(temp_dir.path().join("logs.sqlite"));

        let err = registry
            .open("contributions", &OpenOptions::open_write())
            .err().unwrap();
        assert!(matches!(err, PeersError::StoreNotFound(_)));

        let log = registry
            .open("contributions", &OpenOptions::open_write().create(true))
            .unwrap();
        assert_eq!(log.address().name(), "contributions");
    }

    #[tokio::test]
    async fn test_persisted_log_resolves_after_restart() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("logs.sqlite");

        let address = {
            let registry = registry(db_path.clone());
            let log = registry
                .open("contributions", &OpenOptions::open_write().create(true))
                .unwrap();
            log.add(b"first".to_vec()).await.unwrap();
            log.add(b"second".to_vec()).await.unwrap();
            registry.close().unwrap();
            log.address().to_string()
        };

        let registry = registry(db_path);
        let log = registry.open(&address, &OpenOptions::open_write()).unwrap();
        let payloads: Vec<Vec<u8>> = log.list().unwrap().into_iter().map(|e| e.payload).collect();
        assert_eq!(payloads, vec![b"first".to_vec(), b"second".to_vec()]);

        let parsed = StoreAddress::parse(&address).unwrap();
        assert!(registry.get(&parsed).is_some());
    }

    #[tokio::test]
    async fn test_unknown_address_opens_empty_replica() {
        let temp_dir = tempfile::tempdir().unwrap();
        let registry = registry(temp_dir.path().join("logs.sqlite"));

        let remote = StoreAddress::generate("contributions").unwrap();
        let log = registry
            .open(&remote.to_string(), &OpenOptions::open_write())
            .unwrap();
        assert!(log.is_empty().unwrap());
        assert_eq!(log.address(), &remote);
    }

    #[tokio::test]
    async fn test_registry_bus_carries_events_of_logs_opened_later() {
        let temp_dir = tempfile::tempdir().unwrap();
        let registry = registry(temp_dir.path().join("logs.sqlite"));
        let mut events = registry.subscribe();

        let log = registry
            .open("contributions", &OpenOptions::open_write().create(true))
            .unwrap();
        log.add(b"entry".to_vec()).await.unwrap();

        match events.recv().await.unwrap() {
            LogEvent::Write { address, entry } => {
                assert_eq!(&address, log.address());
                assert_eq!(entry.payload, b"entry".to_vec());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
