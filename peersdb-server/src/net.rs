//! HTTP transport between peersdb nodes.
//!
//! Every node serves the `/p2p/*` routes (see `server.rs`) and talks to its
//! peers through [`HttpNetwork`]. Topic messages, log entries and content all
//! travel as plain HTTP requests; a peer that stops answering is dropped.

use crate::config::normalize_url;
use async_trait::async_trait;
use bytes::Bytes;
use peersdb_core::{
    ConnectednessEvent, ContentRef, ContentStore, EVENT_BUFFER, FsContentStore, LogEntry,
    LogRegistry, LogSync, PeerId, PeersError, Result, StoreAddress, TopicHub, TopicSubscription,
    Transport,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::broadcast;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Hello {
    pub peer_id: PeerId,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PubsubMessage {
    pub from: PeerId,
    pub topic: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogPush {
    pub from: PeerId,
    pub address: StoreAddress,
    pub entries: Vec<LogEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogPull {
    pub address: StoreAddress,
}

pub struct HttpNetwork {
    peer_id: PeerId,
    advertise_url: String,
    client: reqwest::Client,
    hub: TopicHub,
    connectedness: broadcast::Sender<ConnectednessEvent>,
    peers: Mutex<HashMap<PeerId, String>>,
    registry: Mutex<Weak<LogRegistry>>,
}

impl HttpNetwork {
    pub fn new(peer_id: PeerId, advertise_url: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| PeersError::Transport(e.to_string()))?;
        let (connectedness, _) = broadcast::channel(EVENT_BUFFER);

        Ok(Self {
            peer_id,
            advertise_url: normalize_url(&advertise_url),
            client,
            hub: TopicHub::new(),
            connectedness,
            peers: Mutex::new(HashMap::new()),
            registry: Mutex::new(Weak::new()),
        })
    }

    pub fn advertise_url(&self) -> &str {
        &self.advertise_url
    }

    /// Route inbound replication into `registry`.
    pub fn attach_registry(&self, registry: &Arc<LogRegistry>) -> Result<()> {
        *self
            .registry
            .lock()
            .map_err(|_| PeersError::Internal("registry slot lock poisoned".to_string()))? =
            Arc::downgrade(registry);
        Ok(())
    }

    pub fn hello(&self) -> Hello {
        Hello {
            peer_id: self.peer_id.clone(),
            url: self.advertise_url.clone(),
        }
    }

    /// Record a peer that dialled us and answer with our own identity.
    pub fn accept_hello(&self, hello: Hello) -> Result<Hello> {
        if hello.peer_id == self.peer_id {
            return Err(PeersError::Transport("cannot connect a peer to itself".to_string()));
        }
        self.add_peer(hello.peer_id, normalize_url(&hello.url))?;
        Ok(self.hello())
    }

    /// Hand an inbound topic message to local subscribers.
    pub fn deliver(&self, message: PubsubMessage) -> usize {
        if message.from == self.peer_id {
            return 0;
        }
        self.hub.deliver(&message.topic, Bytes::from(message.data))
    }

    /// Merge entries a peer pushed for a log this node has open.
    pub fn accept_push(&self, push: LogPush) -> Result<usize> {
        let Some(log) = self.registry()?.and_then(|registry| registry.get(&push.address)) else {
            tracing::debug!("Ignoring push for unknown log {}", push.address);
            return Ok(0);
        };
        let admitted = log.merge(push.entries)?;
        Ok(admitted.len())
    }

    /// Entries of a log this node has open, `None` if it has not.
    pub fn local_entries(&self, address: &StoreAddress) -> Result<Option<Vec<LogEntry>>> {
        match self.registry()?.and_then(|registry| registry.get(address)) {
            Some(log) => Ok(Some(log.list()?)),
            None => Ok(None),
        }
    }

    /// Fetch content bytes from the first peer that has them.
    pub async fn fetch_content(&self, content_ref: &ContentRef) -> Result<Option<Bytes>> {
        for (peer, url) in self.peer_snapshot()? {
            let response = match self
                .client
                .get(format!("{}/p2p/content/{}", url, content_ref.digest()))
                .send()
                .await
            {
                Ok(response) => response,
                Err(error) => {
                    self.drop_peer(&peer, &error.to_string());
                    continue;
                }
            };

            if response.status() == reqwest::StatusCode::NOT_FOUND {
                continue;
            }
            if !response.status().is_success() {
                tracing::warn!(peer = %peer, "Content fetch failed: status={}", response.status());
                continue;
            }

            let data = response
                .bytes()
                .await
                .map_err(|e| PeersError::Transport(e.to_string()))?;
            tracing::debug!(peer = %peer, "Fetched {} from peer", content_ref);
            return Ok(Some(data));
        }
        Ok(None)
    }

    fn add_peer(&self, peer: PeerId, url: String) -> Result<bool> {
        let previous = self.lock_peers()?.insert(peer.clone(), url);
        if previous.is_some() {
            return Ok(false);
        }

        tracing::info!(peer = %peer, "Peer connected");
        let _ = self.connectedness.send(ConnectednessEvent::connected(peer));
        Ok(true)
    }

    fn drop_peer(&self, peer: &PeerId, reason: &str) {
        let removed = match self.peers.lock() {
            Ok(mut peers) => peers.remove(peer).is_some(),
            Err(_) => false,
        };
        if removed {
            tracing::warn!(peer = %peer, "Dropping unreachable peer: {}", reason);
            let _ = self
                .connectedness
                .send(ConnectednessEvent::disconnected(peer.clone()));
        }
    }

    fn peer_snapshot(&self) -> Result<Vec<(PeerId, String)>> {
        let mut peers: Vec<(PeerId, String)> = self
            .lock_peers()?
            .iter()
            .map(|(peer, url)| (peer.clone(), url.clone()))
            .collect();
        peers.sort();
        Ok(peers)
    }

    fn registry(&self) -> Result<Option<Arc<LogRegistry>>> {
        Ok(self
            .registry
            .lock()
            .map_err(|_| PeersError::Internal("registry slot lock poisoned".to_string()))?
            .upgrade())
    }

    fn lock_peers(&self) -> Result<MutexGuard<'_, HashMap<PeerId, String>>> {
        self.peers
            .lock()
            .map_err(|_| PeersError::Internal("peer table lock poisoned".to_string()))
    }

    async fn post_json<T: Serialize + ?Sized>(&self, url: &str, body: &T) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| PeersError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(PeersError::Transport(format!(
                "request to {} failed: status={}",
                url,
                response.status()
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl Transport for HttpNetwork {
    fn local_peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    async fn connect(&self, address: &str) -> Result<PeerId> {
        let url = normalize_url(address);
        if url == self.advertise_url {
            return Err(PeersError::Transport("cannot connect a peer to itself".to_string()));
        }

        let response = self
            .post_json(&format!("{}/p2p/hello", url), &self.hello())
            .await?;
        let remote: Hello = response
            .json()
            .await
            .map_err(|e| PeersError::Transport(e.to_string()))?;
        if remote.peer_id == self.peer_id {
            return Err(PeersError::Transport("cannot connect a peer to itself".to_string()));
        }

        self.add_peer(remote.peer_id.clone(), url)?;
        Ok(remote.peer_id)
    }

    async fn connected_peers(&self) -> Result<Vec<PeerId>> {
        Ok(self
            .peer_snapshot()?
            .into_iter()
            .map(|(peer, _)| peer)
            .collect())
    }

    async fn publish(&self, topic: &str, data: Bytes) -> Result<()> {
        let message = PubsubMessage {
            from: self.peer_id.clone(),
            topic: topic.to_string(),
            data: data.to_vec(),
        };

        for (peer, url) in self.peer_snapshot()? {
            if let Err(error) = self
                .post_json(&format!("{}/p2p/pubsub", url), &message)
                .await
            {
                self.drop_peer(&peer, &error.to_string());
            }
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<TopicSubscription> {
        self.hub.subscribe(topic)
    }

    fn connectedness_events(&self) -> Result<broadcast::Receiver<ConnectednessEvent>> {
        Ok(self.connectedness.subscribe())
    }
}

#[async_trait]
impl LogSync for HttpNetwork {
    async fn push(&self, address: &StoreAddress, entries: &[LogEntry]) -> Result<()> {
        let push = LogPush {
            from: self.peer_id.clone(),
            address: address.clone(),
            entries: entries.to_vec(),
        };

        for (peer, url) in self.peer_snapshot()? {
            if let Err(error) = self
                .post_json(&format!("{}/p2p/logs/push", url), &push)
                .await
            {
                self.drop_peer(&peer, &error.to_string());
            }
        }
        Ok(())
    }

    async fn pull(&self, address: &StoreAddress) -> Result<Vec<LogEntry>> {
        let pull = LogPull {
            address: address.clone(),
        };

        let mut entries = Vec::new();
        for (peer, url) in self.peer_snapshot()? {
            let response = match self
                .client
                .post(format!("{}/p2p/logs/entries", url))
                .json(&pull)
                .send()
                .await
            {
                Ok(response) => response,
                Err(error) => {
                    self.drop_peer(&peer, &error.to_string());
                    continue;
                }
            };

            if response.status() == reqwest::StatusCode::NOT_FOUND {
                continue;
            }
            if !response.status().is_success() {
                tracing::warn!(peer = %peer, "Log pull failed: status={}", response.status());
                continue;
            }

            let remote: Vec<LogEntry> = response
                .json()
                .await
                .map_err(|e| PeersError::Transport(e.to_string()))?;
            tracing::debug!(peer = %peer, "Pulled {} entries of {}", remote.len(), address);
            entries.extend(remote);
        }
        Ok(entries)
    }
}

/// Local content first, then whatever connected peers can serve.
pub struct NetworkContentStore {
    local: Arc<FsContentStore>,
    network: Arc<HttpNetwork>,
}

impl NetworkContentStore {
    pub fn new(local: Arc<FsContentStore>, network: Arc<HttpNetwork>) -> Self {
        Self { local, network }
    }
}

#[async_trait]
impl ContentStore for NetworkContentStore {
    async fn add(&self, data: Bytes) -> Result<ContentRef> {
        self.local.add(data).await
    }

    async fn get(&self, content_ref: &ContentRef) -> Result<Bytes> {
        if let Some(data) = self.local.get_local(content_ref).await? {
            return Ok(data);
        }

        let data = self
            .network
            .fetch_content(content_ref)
            .await?
            .ok_or_else(|| PeersError::ContentNotFound(content_ref.to_string()))?;
        self.local.put_verified(content_ref, data.clone()).await?;
        Ok(data)
    }

    async fn pin(&self, content_ref: &ContentRef) -> Result<()> {
        if !self.local.contains(content_ref) {
            self.get(content_ref).await?;
        }
        self.local.mark_pinned(content_ref).await
    }
}
