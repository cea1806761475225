use crate::error::{PeersError, Result};
use crate::node::NodeContext;
use crate::transport::TopicSubscription;
use crate::types::{ValidationRequest, ValidationVote, decode_message, encode_message};
use bytes::Bytes;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Answer validation requests with this node's own opinion.
pub fn spawn(ctx: Arc<NodeContext>, mut requests: TopicSubscription) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = ctx.shutdown.cancelled() => break,
                message = requests.next() => match message {
                    Some(data) => {
                        if let Err(error) = respond(&ctx, &data).await {
                            tracing::warn!("Failed to answer validation request: {}", error);
                        }
                    }
                    None => {
                        ctx.fatal(
                            "Validation request subscription closed",
                            PeersError::Transport(requests.topic().to_string()),
                        );
                        break;
                    }
                },
            }
        }
        tracing::debug!("Validation responder stopped");
    })
}

/// Only self-determined records are voted with. Quorum-derived ones would
/// relay second-hand opinions as first-hand votes.
async fn respond(ctx: &NodeContext, data: &Bytes) -> Result<bool> {
    let request: ValidationRequest = decode_message(data)?;
    if request.requester == ctx.peer_id {
        return Ok(false);
    }

    let Some(record) = ctx.validations.get(&request.content_ref)? else {
        return Ok(false);
    };
    if !record.is_self_determined() {
        tracing::debug!(
            content_ref = %request.content_ref,
            votes = record.vote_count,
            "Not voting with a quorum-derived record"
        );
        return Ok(false);
    }

    let vote = ValidationVote {
        vote: record.is_valid,
    };
    ctx.transport
        .publish(&request.reply_topic(), Bytes::from(encode_message(&vote)?))
        .await?;

    tracing::debug!(
        content_ref = %request.content_ref,
        requester = %request.requester,
        vote = vote.vote,
        "Voted"
    );
    Ok(true)
}
