use crate::node::NodeContext;
use crate::types::PeerId;
use crate::{PeersError, Result};
use std::sync::Arc;

#[derive(Clone)]
pub struct ConnectPeerOperation {
    ctx: Arc<NodeContext>,
}

#[derive(Debug, Clone)]
pub struct ConnectPeerOperationRequest {
    pub address: String,
}

#[derive(Debug, Clone)]
pub struct ConnectPeerOperationResult {
    pub peer: PeerId,
}

impl ConnectPeerOperation {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    /// Dial a peer. Store advertisement follows from the connectedness event.
    pub async fn run(
        &self,
        request: ConnectPeerOperationRequest,
    ) -> Result<ConnectPeerOperationResult> {
        let address = request.address.trim();
        if address.is_empty() {
            return Err(PeersError::InvalidRequest(
                "peer address cannot be empty".to_string(),
            ));
        }

        let peer = self.ctx.transport.connect(address).await?;
        tracing::info!(peer = %peer, address = %address, "Connected to peer");
        Ok(ConnectPeerOperationResult { peer })
    }
}
