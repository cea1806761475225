//! In-process network for tests and single-process clusters.
//!
//! One [`MemoryNetwork`] hosts any number of [`MemoryEndpoint`]s. Endpoints
//! implement the transport, log replication and content boundaries, so a
//! whole node can run against it without sockets. Clones share state.

use super::{ConnectednessEvent, TopicHub, TopicSubscription, Transport};
use crate::constants::EVENT_BUFFER;
use crate::error::{PeersError, Result};
use crate::storage::{
    ContentStore, LogEntry, LogRegistry, LogSync, StoreAddress, compute_hash,
};
use crate::types::{ContentRef, PeerId};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::broadcast;

struct PeerSlot {
    hub: TopicHub,
    connectedness: broadcast::Sender<ConnectednessEvent>,
    registry: Weak<LogRegistry>,
}

#[derive(Default)]
struct NetworkInner {
    peers: HashMap<PeerId, PeerSlot>,
    links: HashSet<(PeerId, PeerId)>,
    content: HashMap<String, Bytes>,
    pins: HashSet<(PeerId, String)>,
}

impl NetworkInner {
    fn neighbours(&self, peer: &PeerId) -> Vec<PeerId> {
        let mut neighbours: Vec<PeerId> = self
            .links
            .iter()
            .filter_map(|(a, b)| {
                if a == peer {
                    Some(b.clone())
                } else if b == peer {
                    Some(a.clone())
                } else {
                    None
                }
            })
            .collect();
        neighbours.sort();
        neighbours
    }

    fn neighbour_registries(&self, peer: &PeerId) -> Vec<Arc<LogRegistry>> {
        self.neighbours(peer)
            .iter()
            .filter_map(|id| self.peers.get(id))
            .filter_map(|slot| slot.registry.upgrade())
            .collect()
    }
}

fn link_key(a: &PeerId, b: &PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer and hand out its endpoint.
    pub fn endpoint(&self, peer_id: PeerId) -> Result<MemoryEndpoint> {
        let mut inner = self.lock()?;
        if !inner.peers.contains_key(&peer_id) {
            let (connectedness, _) = broadcast::channel(EVENT_BUFFER);
            inner.peers.insert(
                peer_id.clone(),
                PeerSlot {
                    hub: TopicHub::new(),
                    connectedness,
                    registry: Weak::new(),
                },
            );
        }

        Ok(MemoryEndpoint {
            peer_id,
            network: self.clone(),
        })
    }

    /// Connect two peers, notifying both sides. Returns false if already linked.
    pub fn link(&self, a: &PeerId, b: &PeerId) -> Result<bool> {
        if a == b {
            return Err(PeersError::Transport("cannot connect a peer to itself".to_string()));
        }

        let inner = &mut *self.lock()?;
        for peer in [a, b] {
            if !inner.peers.contains_key(peer) {
                return Err(PeersError::Transport(format!("unknown peer {}", peer)));
            }
        }

        if !inner.links.insert(link_key(a, b)) {
            return Ok(false);
        }

        if let Some(slot) = inner.peers.get(a) {
            let _ = slot.connectedness.send(ConnectednessEvent::connected(b.clone()));
        }
        if let Some(slot) = inner.peers.get(b) {
            let _ = slot.connectedness.send(ConnectednessEvent::connected(a.clone()));
        }
        Ok(true)
    }

    pub fn unlink(&self, a: &PeerId, b: &PeerId) -> Result<bool> {
        let inner = &mut *self.lock()?;
        if !inner.links.remove(&link_key(a, b)) {
            return Ok(false);
        }

        if let Some(slot) = inner.peers.get(a) {
            let _ = slot.connectedness.send(ConnectednessEvent::disconnected(b.clone()));
        }
        if let Some(slot) = inner.peers.get(b) {
            let _ = slot.connectedness.send(ConnectednessEvent::disconnected(a.clone()));
        }
        Ok(true)
    }

    pub fn is_pinned(&self, peer: &PeerId, content_ref: &ContentRef) -> bool {
        self.lock()
            .map(|inner| {
                inner
                    .pins
                    .contains(&(peer.clone(), content_ref.digest().to_string()))
            })
            .unwrap_or(false)
    }

    fn lock(&self) -> Result<MutexGuard<'_, NetworkInner>> {
        self.inner
            .lock()
            .map_err(|_| PeersError::Internal("memory network lock poisoned".to_string()))
    }
}

#[derive(Clone)]
pub struct MemoryEndpoint {
    peer_id: PeerId,
    network: MemoryNetwork,
}

impl MemoryEndpoint {
    /// Route inbound replication for this peer into `registry`.
    pub fn attach_registry(&self, registry: &Arc<LogRegistry>) -> Result<()> {
        let mut inner = self.network.lock()?;
        let slot = inner
            .peers
            .get_mut(&self.peer_id)
            .ok_or_else(|| PeersError::Transport(format!("unknown peer {}", self.peer_id)))?;
        slot.registry = Arc::downgrade(registry);
        Ok(())
    }

    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

#[async_trait]
impl Transport for MemoryEndpoint {
    fn local_peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    async fn connect(&self, address: &str) -> Result<PeerId> {
        let target = PeerId::new(address.trim());
        self.network.link(&self.peer_id, &target)?;
        Ok(target)
    }

    async fn connected_peers(&self) -> Result<Vec<PeerId>> {
        Ok(self.network.lock()?.neighbours(&self.peer_id))
    }

    async fn publish(&self, topic: &str, data: Bytes) -> Result<()> {
        let hubs: Vec<TopicHub> = {
            let inner = self.network.lock()?;
            inner
                .neighbours(&self.peer_id)
                .iter()
                .filter_map(|id| inner.peers.get(id))
                .map(|slot| slot.hub.clone())
                .collect()
        };

        for hub in hubs {
            hub.deliver(topic, data.clone());
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<TopicSubscription> {
        let hub = {
            let inner = self.network.lock()?;
            inner
                .peers
                .get(&self.peer_id)
                .map(|slot| slot.hub.clone())
                .ok_or_else(|| PeersError::Transport(format!("unknown peer {}", self.peer_id)))?
        };
        hub.subscribe(topic)
    }

    fn connectedness_events(&self) -> Result<broadcast::Receiver<ConnectednessEvent>> {
        let inner = self.network.lock()?;
        inner
            .peers
            .get(&self.peer_id)
            .map(|slot| slot.connectedness.subscribe())
            .ok_or_else(|| PeersError::Transport(format!("unknown peer {}", self.peer_id)))
    }
}

#[async_trait]
impl LogSync for MemoryEndpoint {
    async fn push(&self, address: &StoreAddress, entries: &[LogEntry]) -> Result<()> {
        let registries = self.network.lock()?.neighbour_registries(&self.peer_id);
        for registry in registries {
            if let Some(log) = registry.get(address) {
                log.merge(entries.to_vec())?;
            }
        }
        Ok(())
    }

    async fn pull(&self, address: &StoreAddress) -> Result<Vec<LogEntry>> {
        let registries = self.network.lock()?.neighbour_registries(&self.peer_id);
        let mut entries = Vec::new();
        for registry in registries {
            if let Some(log) = registry.get(address) {
                entries.extend(log.list()?);
            }
        }
        Ok(entries)
    }
}

#[async_trait]
impl ContentStore for MemoryEndpoint {
    async fn add(&self, data: Bytes) -> Result<ContentRef> {
        let content_ref = ContentRef::from_digest(&compute_hash(&data))?;
        self.network
            .lock()?
            .content
            .insert(content_ref.digest().to_string(), data);
        Ok(content_ref)
    }

    async fn get(&self, content_ref: &ContentRef) -> Result<Bytes> {
        self.network
            .lock()?
            .content
            .get(content_ref.digest())
            .cloned()
            .ok_or_else(|| PeersError::ContentNotFound(content_ref.to_string()))
    }

    async fn pin(&self, content_ref: &ContentRef) -> Result<()> {
        let mut inner = self.network.lock()?;
        if !inner.content.contains_key(content_ref.digest()) {
            return Err(PeersError::ContentNotFound(content_ref.to_string()));
        }
        inner
            .pins
            .insert((self.peer_id.clone(), content_ref.digest().to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::OpenOptions;
    use crate::transport::Connectedness;

    #[tokio::test]
    async fn test_publish_reaches_neighbours_only() {
        let network = MemoryNetwork::new();
        let a = network.endpoint(PeerId::new("a")).unwrap();
        let b = network.endpoint(PeerId::new("b")).unwrap();
        let c = network.endpoint(PeerId::new("c")).unwrap();

        let mut events = b.connectedness_events().unwrap();
        assert_eq!(a.connect("b").await.unwrap(), PeerId::new("b"));
        let event = events.recv().await.unwrap();
        assert_eq!(event.peer, PeerId::new("a"));
        assert_eq!(event.connectedness, Connectedness::Connected);

        let mut on_a = a.subscribe("topic").await.unwrap();
        let mut on_b = b.subscribe("topic").await.unwrap();
        let mut on_c = c.subscribe("topic").await.unwrap();

        a.publish("topic", Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(on_b.next().await.unwrap(), Bytes::from_static(b"hello"));
        assert!(on_a.receiver.try_recv().is_err());
        assert!(on_c.receiver.try_recv().is_err());

        assert_eq!(a.connected_peers().await.unwrap(), vec![PeerId::new("b")]);
        assert!(a.connect("nobody").await.is_err());
    }

    #[tokio::test]
    async fn test_log_sync_between_endpoints() {
        let network = MemoryNetwork::new();
        let a = network.endpoint(PeerId::new("a")).unwrap();
        let b = network.endpoint(PeerId::new("b")).unwrap();

        let registry_a = Arc::new(LogRegistry::new(PeerId::new("a"), Arc::new(a.clone()), None));
        let registry_b = Arc::new(LogRegistry::new(PeerId::new("b"), Arc::new(b.clone()), None));
        a.attach_registry(&registry_a).unwrap();
        b.attach_registry(&registry_b).unwrap();
        network.link(&PeerId::new("a"), &PeerId::new("b")).unwrap();

        let log_a = registry_a
            .open("contributions", &OpenOptions::open_write().create(true))
            .unwrap();
        log_a.add(b"before".to_vec()).await.unwrap();

        let log_b = registry_b
            .open(&log_a.address().to_string(), &OpenOptions::open_write())
            .unwrap();
        assert_eq!(log_b.load().await.unwrap(), 1);

        log_a.add(b"after".to_vec()).await.unwrap();
        assert_eq!(log_b.len().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_shared_content_and_pins() {
        let network = MemoryNetwork::new();
        let a = network.endpoint(PeerId::new("a")).unwrap();
        let b = network.endpoint(PeerId::new("b")).unwrap();

        let content_ref = a.add(Bytes::from_static(b"payload")).await.unwrap();
        assert_eq!(b.get(&content_ref).await.unwrap(), Bytes::from_static(b"payload"));

        b.pin(&content_ref).await.unwrap();
        assert!(network.is_pinned(&PeerId::new("b"), &content_ref));
        assert!(!network.is_pinned(&PeerId::new("a"), &content_ref));
    }
}
