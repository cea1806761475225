use crate::error::{PeersError, Result};
use crate::types::ContentRef;
use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Content-addressed storage of immutable payloads.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Store bytes and return their locator.
    async fn add(&self, data: Bytes) -> Result<ContentRef>;

    /// Retrieve the bytes behind a locator.
    async fn get(&self, content_ref: &ContentRef) -> Result<Bytes>;

    /// Keep a local copy of the content for as long as the node runs.
    async fn pin(&self, content_ref: &ContentRef) -> Result<()>;
}

/// File-backed content store.
/// Blobs live in blobs/{prefix}/{sha256}, pins are marker files in pins/.
pub struct FsContentStore {
    base_path: PathBuf,
}

impl FsContentStore {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_path)?;
        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn contains(&self, content_ref: &ContentRef) -> bool {
        self.blob_path(content_ref.digest()).exists()
    }

    pub fn is_pinned(&self, content_ref: &ContentRef) -> bool {
        self.pin_path(content_ref.digest()).exists()
    }

    /// Read local bytes only, without consulting anything remote.
    pub async fn get_local(&self, content_ref: &ContentRef) -> Result<Option<Bytes>> {
        let blob_path = self.blob_path(content_ref.digest());
        if !blob_path.exists() {
            return Ok(None);
        }

        let data = Bytes::from(fs::read(&blob_path).await?);
        verify_hash(&data, content_ref.digest())?;
        Ok(Some(data))
    }

    /// Store bytes that arrived from elsewhere under an expected locator.
    pub async fn put_verified(&self, content_ref: &ContentRef, data: Bytes) -> Result<()> {
        verify_hash(&data, content_ref.digest())?;
        self.write_blob(content_ref.digest(), &data).await
    }

    pub async fn mark_pinned(&self, content_ref: &ContentRef) -> Result<()> {
        let pin_path = self.pin_path(content_ref.digest());
        if let Some(parent) = pin_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&pin_path, b"").await?;
        Ok(())
    }

    async fn write_blob(&self, digest: &str, data: &[u8]) -> Result<()> {
        let blob_path = self.blob_path(digest);
        if blob_path.exists() {
            return Ok(());
        }

        if let Some(parent) = blob_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = blob_path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &blob_path).await?;
        tracing::debug!("Stored blob {}", digest);
        Ok(())
    }

    fn blob_path(&self, digest: &str) -> PathBuf {
        let prefix = &digest[..2.min(digest.len())];
        self.base_path.join("blobs").join(prefix).join(digest)
    }

    fn pin_path(&self, digest: &str) -> PathBuf {
        self.base_path.join("pins").join(digest)
    }
}

#[async_trait]
impl ContentStore for FsContentStore {
    async fn add(&self, data: Bytes) -> Result<ContentRef> {
        let content_ref = ContentRef::from_digest(&compute_hash(&data))?;
        self.write_blob(content_ref.digest(), &data).await?;
        Ok(content_ref)
    }

    async fn get(&self, content_ref: &ContentRef) -> Result<Bytes> {
        self.get_local(content_ref)
            .await?
            .ok_or_else(|| PeersError::ContentNotFound(content_ref.to_string()))
    }

    async fn pin(&self, content_ref: &ContentRef) -> Result<()> {
        if !self.contains(content_ref) {
            return Err(PeersError::ContentNotFound(content_ref.to_string()));
        }
        self.mark_pinned(content_ref).await
    }
}

/// Compute SHA256 hash of data
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Verify that data matches the expected hash
pub fn verify_hash(data: &[u8], expected_hash: &str) -> Result<()> {
    let actual_hash = compute_hash(data);
    if actual_hash != expected_hash {
        return Err(PeersError::HashMismatch {
            expected: expected_hash.to_string(),
            actual: actual_hash,
        });
    }
    Ok(())
}
