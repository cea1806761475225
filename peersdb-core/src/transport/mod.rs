//! Peer messaging boundary: topic publish/subscribe plus connectedness events.

pub mod memory;

pub use memory::{MemoryEndpoint, MemoryNetwork};

use crate::constants::TOPIC_BUFFER;
use crate::error::{PeersError, Result};
use crate::types::PeerId;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectedness {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectednessEvent {
    pub peer: PeerId,
    pub connectedness: Connectedness,
}

impl ConnectednessEvent {
    pub fn connected(peer: PeerId) -> Self {
        Self {
            peer,
            connectedness: Connectedness::Connected,
        }
    }

    pub fn disconnected(peer: PeerId) -> Self {
        Self {
            peer,
            connectedness: Connectedness::Disconnected,
        }
    }
}

/// Delivery is best effort: at least the currently connected peers, no
/// ordering, and never back to the publishing node itself.
#[async_trait]
pub trait Transport: Send + Sync {
    fn local_peer_id(&self) -> &PeerId;

    /// Dial a peer. Returns its id once the connection is established.
    async fn connect(&self, address: &str) -> Result<PeerId>;

    async fn connected_peers(&self) -> Result<Vec<PeerId>>;

    async fn publish(&self, topic: &str, data: Bytes) -> Result<()>;

    async fn subscribe(&self, topic: &str) -> Result<TopicSubscription>;

    fn connectedness_events(&self) -> Result<broadcast::Receiver<ConnectednessEvent>>;
}

pub struct TopicSubscription {
    topic: String,
    receiver: mpsc::Receiver<Bytes>,
}

impl TopicSubscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next message, or `None` once the transport side is gone.
    pub async fn next(&mut self) -> Option<Bytes> {
        self.receiver.recv().await
    }
}

/// Fans messages for a topic out to the local subscribers of that topic.
#[derive(Clone, Default)]
pub struct TopicHub {
    subscribers: Arc<Mutex<HashMap<String, Vec<mpsc::Sender<Bytes>>>>>,
}

impl TopicHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: &str) -> Result<TopicSubscription> {
        let (tx, rx) = mpsc::channel(TOPIC_BUFFER);
        let mut subscribers = self
            .subscribers
            .lock()
            .map_err(|_| PeersError::Internal("topic hub lock poisoned".to_string()))?;
        subscribers.entry(topic.to_string()).or_default().push(tx);

        Ok(TopicSubscription {
            topic: topic.to_string(),
            receiver: rx,
        })
    }

    /// Hand a message to every live subscriber. Returns how many received it.
    pub fn deliver(&self, topic: &str, data: Bytes) -> usize {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            return 0;
        };
        let Some(senders) = subscribers.get_mut(topic) else {
            return 0;
        };

        let mut delivered = 0;
        senders.retain(|sender| match sender.try_send(data.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(topic = %topic, "Subscriber buffer full, dropping message");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });

        if senders.is_empty() {
            subscribers.remove(topic);
        }
        delivered
    }

    pub fn has_subscribers(&self, topic: &str) -> bool {
        self.subscribers
            .lock()
            .map(|subscribers| subscribers.contains_key(topic))
            .unwrap_or(false)
    }
}
