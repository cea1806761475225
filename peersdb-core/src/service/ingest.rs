use crate::error::{PeersError, Result};
use crate::node::NodeContext;
use crate::operations::ValidateContentOperation;
use crate::storage::{LogEntry, LogEvent};
use crate::types::{Contribution, ValidationRecord};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Self-validate every contribution this node writes.
pub fn spawn(ctx: Arc<NodeContext>, mut events: broadcast::Receiver<LogEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let validate = ValidateContentOperation::new(ctx.clone());

        loop {
            let event = tokio::select! {
                _ = ctx.shutdown.cancelled() => break,
                event = events.recv() => event,
            };

            match event {
                Ok(LogEvent::Write { address, entry }) if ctx.contributions.is_bound_to(&address) => {
                    if let Err(error) = ingest(&ctx, &validate, &entry).await {
                        tracing::warn!(entry = %entry.hash, "Failed to validate new entry: {}", error);
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Ingest missed {} log event(s)", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    ctx.fatal(
                        "Log events closed",
                        PeersError::Internal("write event stream ended".to_string()),
                    );
                    break;
                }
            }
        }
        tracing::debug!("Ingest task stopped");
    })
}

async fn ingest(
    ctx: &NodeContext,
    validate: &ValidateContentOperation,
    entry: &LogEntry,
) -> Result<()> {
    let contribution = Contribution::decode(&entry.payload)?;
    let is_valid = validate.validate_locally(&contribution.content_ref).await?;

    let record = ValidationRecord::self_determined(contribution.content_ref, is_valid);
    ctx.validations.upsert(&record)?;
    tracing::info!("validated {} with result {}", record.content_ref, record.is_valid);
    Ok(())
}
