//! The storage backend abstraction and backend selection.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use clip_format::{ClipNode, MetadataIndex};

use crate::client::{S3Location, S3StorageClient};
use crate::content_cache::ContentCache;
use crate::error::StorageError;
use crate::local::LocalBackend;
use crate::remote::RemoteBackend;

/// Uniform random-read interface over an archive's bytes.
///
/// Implementations are shared across kernel worker threads; every method
/// may be called concurrently with every other, including on the same node.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Read up to `dest.len()` bytes of the file `node`, starting at
    /// `offset` within the file.
    ///
    /// Reads past the end of the file return `Ok(0)`; reads crossing it are
    /// clamped. Only `File` nodes carry content; other nodes read as empty.
    async fn read_file(
        &self,
        node: &ClipNode,
        dest: &mut [u8],
        offset: u64,
    ) -> Result<usize, StorageError>;

    /// The archive's loaded node index.
    fn metadata(&self) -> &MetadataIndex;

    /// Whether the entire content region is already on local disk, making
    /// the block-level content cache redundant.
    fn cached_locally(&self) -> bool;
}

/// Select and open a backend for an archive path or URI.
///
/// `s3://bucket/key` selects the remote backend (which requires a content
/// cache); a plain filesystem path selects the local backend; any other
/// scheme is a `Backend` error.
pub async fn open_backend(
    archive: &str,
    cache: Option<Arc<ContentCache>>,
) -> Result<Arc<dyn StorageBackend>, StorageError> {
    if let Some(location) = S3Location::parse(archive) {
        let cache: Arc<ContentCache> = cache.ok_or_else(|| {
            StorageError::backend("remote archives require a content cache directory")
        })?;
        let client: Arc<S3StorageClient> = Arc::new(S3StorageClient::new(None).await?);
        let backend: RemoteBackend = RemoteBackend::open(client, location, cache).await?;
        return Ok(Arc::new(backend));
    }

    if archive.contains("://") {
        return Err(StorageError::backend(format!(
            "unrecognized archive scheme: {}",
            archive
        )));
    }

    Ok(Arc::new(LocalBackend::open(Path::new(archive))?))
}
