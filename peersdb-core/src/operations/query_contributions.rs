use super::ValidateContentOperation;
use crate::Result;
use crate::command::QueriedContribution;
use crate::constants::SETTLE_WINDOW;
use crate::node::NodeContext;
use crate::types::Contribution;
use std::sync::Arc;

#[derive(Clone)]
pub struct QueryContributionsOperation {
    ctx: Arc<NodeContext>,
    validate: ValidateContentOperation,
}

#[derive(Debug, Clone)]
pub struct QueryContributionsOperationResult {
    pub contributions: Vec<QueriedContribution>,
    pub skipped: usize,
}

impl QueryContributionsOperation {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        let validate = ValidateContentOperation::new(ctx.clone());
        Self { ctx, validate }
    }

    /// Reload the Contributions log, let replication settle, then list it.
    ///
    /// Entries that do not decode are skipped. Validity annotation is best
    /// effort: a failed lookup leaves `valid` empty.
    pub async fn run(&self) -> Result<QueryContributionsOperationResult> {
        let contributions = self.ctx.require_contributions()?;

        if let Err(error) = contributions.load().await {
            tracing::warn!(address = %contributions.address(), "Reload failed: {}", error);
        }
        tokio::time::sleep(SETTLE_WINDOW).await;

        let mut result = QueryContributionsOperationResult {
            contributions: Vec::new(),
            skipped: 0,
        };

        for entry in contributions.list()? {
            let contribution = match Contribution::decode(&entry.payload) {
                Ok(contribution) => contribution,
                Err(error) => {
                    tracing::warn!(entry = %entry.hash, "Skipping undecodable entry: {}", error);
                    result.skipped += 1;
                    continue;
                }
            };

            let valid = match self.validate.is_valid(&contribution.content_ref).await {
                Ok(valid) => Some(valid),
                Err(error) => {
                    tracing::warn!(
                        content_ref = %contribution.content_ref,
                        "Validity lookup failed: {}",
                        error
                    );
                    None
                }
            };

            result
                .contributions
                .push(QueriedContribution { contribution, valid });
        }

        Ok(result)
    }
}
