use crate::Result;
use crate::node::NodeContext;
use crate::storage::LogEntry;
use crate::types::Contribution;
use bytes::Bytes;
use std::sync::Arc;

#[derive(Clone)]
pub struct PostContributionOperation {
    ctx: Arc<NodeContext>,
}

#[derive(Debug, Clone)]
pub struct PostContributionOperationRequest {
    pub payload: Bytes,
}

#[derive(Debug, Clone)]
pub struct PostContributionOperationResult {
    pub contribution: Contribution,
    pub entry: LogEntry,
}

impl PostContributionOperation {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    /// Store the payload and append a contribution pointing at it.
    pub async fn run(
        &self,
        request: PostContributionOperationRequest,
    ) -> Result<PostContributionOperationResult> {
        let contributions = self.ctx.require_contributions()?;

        let content_ref = self.ctx.content.add(request.payload).await?;
        let contribution = Contribution::new(content_ref, self.ctx.peer_id.clone());
        let entry = contributions.add(contribution.encode()?).await?;

        tracing::info!(
            content_ref = %contribution.content_ref,
            entry = %entry.hash,
            "Contribution added"
        );

        Ok(PostContributionOperationResult {
            contribution,
            entry,
        })
    }
}
