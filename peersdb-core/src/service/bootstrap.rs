//! Store discovery between newly connected peers.
//!
//! A node without a Contributions log adopts the first one a peer advertises
//! to its inbox topic. A node with one advertises it to every peer that
//! connects.

use crate::error::{PeersError, Result};
use crate::node::NodeContext;
use crate::storage::OpenOptions;
use crate::transport::{Connectedness, ConnectednessEvent, TopicSubscription};
use crate::types::{StoreAdvertisement, decode_message, encode_message};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Resolve the Contributions log recorded in the node state. Root nodes
/// create it when it does not resolve.
pub async fn open_persisted(ctx: &Arc<NodeContext>) -> Result<bool> {
    let address = ctx.state()?.contributions_store_addr;
    let options = OpenOptions::open_write().create(ctx.options.root);

    let log = match ctx.logs.open(&address, &options) {
        Ok(log) => log,
        Err(PeersError::StoreNotFound(name)) => {
            tracing::info!(
                "No contributions store '{}' yet, try resolving it by connecting to a peer",
                name
            );
            return Ok(false);
        }
        Err(error) => return Err(error),
    };

    if !ctx.bind_contributions(log.clone())? {
        return Ok(false);
    }
    if let Err(error) = log.load().await {
        tracing::warn!(address = %log.address(), "Initial load failed: {}", error);
    }
    Ok(true)
}

/// Adopt the first store advertised to this node's inbox.
pub fn spawn_inbound(ctx: Arc<NodeContext>, mut inbox: TopicSubscription) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = ctx.shutdown.cancelled() => break,
                message = inbox.next() => match message {
                    Some(data) => {
                        if let Err(error) = adopt_advertised(&ctx, &data).await {
                            tracing::warn!("Store advertisement rejected: {}", error);
                        }
                    }
                    None => {
                        ctx.fatal(
                            "Inbox subscription closed",
                            PeersError::Transport(inbox.topic().to_string()),
                        );
                        break;
                    }
                },
            }
        }
        tracing::debug!("Bootstrap inbound task stopped");
    })
}

async fn adopt_advertised(ctx: &Arc<NodeContext>, data: &Bytes) -> Result<()> {
    let advertisement: StoreAdvertisement = decode_message(data)?;

    if ctx.contributions.is_bound() {
        tracing::debug!(
            peer = %advertisement.peer_id,
            address = %advertisement.log_address,
            "Store already loaded, ignoring advertisement"
        );
        return Ok(());
    }

    let log = ctx
        .logs
        .open(&advertisement.log_address, &OpenOptions::open_write())?;
    if !ctx.bind_contributions(log.clone())? {
        return Ok(());
    }

    let loaded = log.load().await?;
    tracing::info!(
        peer = %advertisement.peer_id,
        address = %log.address(),
        entries = loaded,
        "Replicated contributions store from peer"
    );

    ctx.save_state()
}

/// Advertise the local store to every newly connected peer.
pub fn spawn_outbound(
    ctx: Arc<NodeContext>,
    mut events: broadcast::Receiver<ConnectednessEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = ctx.shutdown.cancelled() => break,
                event = events.recv() => event,
            };

            match event {
                Ok(event) if event.connectedness == Connectedness::Connected => {
                    if let Err(error) = advertise_store(&ctx, &event).await {
                        tracing::warn!(peer = %event.peer, "Failed to advertise store: {}", error);
                    }
                }
                Ok(event) => {
                    tracing::debug!(peer = %event.peer, "Peer disconnected");
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Missed {} connectedness event(s)", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    ctx.fatal(
                        "Connectedness events closed",
                        PeersError::Transport("connectedness stream ended".to_string()),
                    );
                    break;
                }
            }
        }
        tracing::debug!("Bootstrap outbound task stopped");
    })
}

async fn advertise_store(ctx: &Arc<NodeContext>, event: &ConnectednessEvent) -> Result<()> {
    let Some(log) = ctx.contributions.get() else {
        return Ok(());
    };

    let advertisement = StoreAdvertisement {
        peer_id: ctx.peer_id.clone(),
        log_address: log.address().to_string(),
    };
    ctx.transport
        .publish(
            event.peer.inbox_topic(),
            Bytes::from(encode_message(&advertisement)?),
        )
        .await?;

    tracing::debug!(peer = %event.peer, address = %log.address(), "Advertised store");
    Ok(())
}
