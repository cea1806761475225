use crate::benchmark::ReplicationTiming;
use crate::error::{PeersError, Result};
use crate::node::NodeContext;
use crate::storage::{LogEntry, LogEvent};
use crate::types::Contribution;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Book-keep replicated Contributions batches: benchmark timings and pinning.
pub fn spawn(ctx: Arc<NodeContext>, mut events: broadcast::Receiver<LogEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = ctx.shutdown.cancelled() => break,
                event = events.recv() => event,
            };

            match event {
                Ok(LogEvent::Replicated { address, entries })
                    if ctx.contributions.is_bound_to(&address) =>
                {
                    tracing::debug!(address = %address, entries = entries.len(), "Replicated batch");
                    for entry in &entries {
                        if let Err(error) = account(&ctx, entry).await {
                            tracing::warn!(entry = %entry.hash, "Failed to process replicated entry: {}", error);
                        }
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Replication monitor missed {} log event(s)", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    ctx.fatal(
                        "Log events closed",
                        PeersError::Internal("replication event stream ended".to_string()),
                    );
                    break;
                }
            }
        }
        tracing::debug!("Replication monitor stopped");
    })
}

async fn account(ctx: &NodeContext, entry: &LogEntry) -> Result<()> {
    let contribution = Contribution::decode(&entry.payload)?;

    let timing = ctx
        .benchmark()?
        .record_replicated(contribution.created_at, Utc::now());
    match timing {
        ReplicationTiming::Backlog => {
            tracing::debug!(content_ref = %contribution.content_ref, "Backlog entry replicated")
        }
        ReplicationTiming::NewContribution => {
            tracing::debug!(content_ref = %contribution.content_ref, "New contribution replicated")
        }
    }

    if ctx.options.full_replica {
        ctx.content.pin(&contribution.content_ref).await?;
        tracing::debug!(content_ref = %contribution.content_ref, "Pinned");
    }
    Ok(())
}
