use crate::node::NodeContext;
use crate::types::ContentRef;
use crate::{PeersError, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;

#[derive(Clone)]
pub struct GetContentOperation {
    ctx: Arc<NodeContext>,
}

#[derive(Debug, Clone)]
pub struct GetContentOperationRequest {
    pub locator: String,
}

#[derive(Debug, Clone)]
pub struct GetContentOperationResult {
    pub content_ref: ContentRef,
    pub destination: PathBuf,
    pub size_bytes: usize,
}

impl GetContentOperation {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    pub async fn run(&self, request: GetContentOperationRequest) -> Result<GetContentOperationResult> {
        let content_ref = ContentRef::parse(&request.locator)?;
        let data = self.ctx.content.get(&content_ref).await?;

        let download_dir = expand_home(&self.ctx.options.download_dir)?;
        fs::create_dir_all(&download_dir).await?;
        let destination = download_dir.join(content_ref.digest());
        fs::write(&destination, &data).await?;

        tracing::debug!(
            content_ref = %content_ref,
            destination = %destination.display(),
            "Content written"
        );

        Ok(GetContentOperationResult {
            content_ref,
            destination,
            size_bytes: data.len(),
        })
    }
}

/// Expand a leading `~/` to the home directory.
pub fn expand_home(path: &str) -> Result<PathBuf> {
    let Some(rest) = path.strip_prefix("~/") else {
        return Ok(PathBuf::from(path));
    };

    let home = std::env::var_os("HOME")
        .ok_or_else(|| PeersError::Config("HOME is not set, cannot expand ~/".to_string()))?;
    Ok(PathBuf::from(home).join(rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/tmp/downloads").unwrap(), PathBuf::from("/tmp/downloads"));
        assert_eq!(expand_home("relative/dir").unwrap(), PathBuf::from("relative/dir"));

        if let Some(home) = std::env::var_os("HOME") {
            assert_eq!(
                expand_home("~/Downloads").unwrap(),
                PathBuf::from(home).join("Downloads")
            );
        }
    }
}
