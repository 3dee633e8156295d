//! Backend streaming an archive from object storage.
//!
//! Reads are decomposed into fixed-size, block-aligned ranged GETs. Every
//! block goes through the content cache keyed by `(archive id, block
//! index)`, so concurrent readers of one uncached block share a single GET
//! and later readers are served from disk.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use clip_common::{DEFAULT_BLOCK_SIZE, DEFAULT_FETCH_TIMEOUT_SECS};
use clip_format::{ArchiveMeta, ClipHeader, ClipNode, MetadataIndex, HEADER_SIZE};

use crate::backend::StorageBackend;
use crate::client::{S3Location, StorageClient};
use crate::content_cache::ContentCache;
use crate::error::StorageError;

/// Tuning knobs for the remote backend.
#[derive(Debug, Clone)]
pub struct RemoteBackendOptions {
    /// Unit of fetching and caching. Power of two, fixed per mount.
    pub block_size: u64,
    /// Deadline for each ranged GET.
    pub fetch_timeout: Duration,
}

impl Default for RemoteBackendOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            fetch_timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
        }
    }
}

/// Serves reads from a remote archive object through the content cache.
pub struct RemoteBackend {
    client: Arc<dyn StorageClient>,
    location: S3Location,
    cache: Arc<ContentCache>,
    meta: ArchiveMeta,
    object_len: u64,
    options: RemoteBackendOptions,
}

impl RemoteBackend {
    /// Open a remote archive with default options.
    pub async fn open(
        client: Arc<dyn StorageClient>,
        location: S3Location,
        cache: Arc<ContentCache>,
    ) -> Result<Self, StorageError> {
        Self::open_with_options(client, location, cache, RemoteBackendOptions::default()).await
    }

    /// Open a remote archive: fetch and validate the header, then the
    /// metadata region, via ranged GETs.
    ///
    /// # Errors
    /// `NotFound` if the object does not exist, `Format` if the archive is
    /// corrupt, `Network`/`Timeout` for transport failures.
    pub async fn open_with_options(
        client: Arc<dyn StorageClient>,
        location: S3Location,
        cache: Arc<ContentCache>,
        options: RemoteBackendOptions,
    ) -> Result<Self, StorageError> {
        let object_len: u64 = client
            .head_object(&location.bucket, &location.key)
            .await?
            .ok_or_else(|| StorageError::NotFound {
                bucket: location.bucket.clone(),
                key: location.key.clone(),
            })?;

        let header_bytes: Vec<u8> = client
            .get_object_range(&location.bucket, &location.key, 0, HEADER_SIZE as u64)
            .await?;
        let header: ClipHeader = ClipHeader::decode(&header_bytes).map_err(StorageError::from)?;
        header.validate_bounds(object_len)?;

        let metadata: Vec<u8> = client
            .get_object_range(
                &location.bucket,
                &location.key,
                header.metadata_offset,
                header.metadata_len,
            )
            .await?;
        let meta: ArchiveMeta = ArchiveMeta::from_parts(header, &metadata)?;
        debug!(location = %location, nodes = meta.index().len(), "opened remote archive");

        Ok(Self {
            client,
            location,
            cache,
            meta,
            object_len,
            options,
        })
    }

    pub fn meta(&self) -> &ArchiveMeta {
        &self.meta
    }

    /// Cache key for one block of this archive.
    fn block_key(&self, index: u64) -> String {
        format!("{}-{:08x}", self.meta.archive_id(), index)
    }

    /// Fetch exactly one block from the object, clamped at the archive end.
    async fn fetch_block(&self, index: u64) -> Result<Vec<u8>, StorageError> {
        let start: u64 = index * self.options.block_size;
        let length: u64 = self.options.block_size.min(self.object_len - start);
        debug!(index, start, length, "fetching block");

        let fetch = self.client.get_object_range(
            &self.location.bucket,
            &self.location.key,
            start,
            length,
        );
        tokio::time::timeout(self.options.fetch_timeout, fetch)
            .await
            .map_err(|_| StorageError::Timeout {
                key: self.location.to_string(),
                seconds: self.options.fetch_timeout.as_secs(),
            })?
    }
}

#[async_trait]
impl StorageBackend for RemoteBackend {
    async fn read_file(
        &self,
        node: &ClipNode,
        dest: &mut [u8],
        offset: u64,
    ) -> Result<usize, StorageError> {
        if !node.is_file() || offset >= node.data_len {
            return Ok(0);
        }

        let want: usize = (node.data_len - offset).min(dest.len() as u64) as usize;
        let mut pos: u64 = self.meta.content_offset() + node.data_offset + offset;
        let mut filled: usize = 0;

        while filled < want {
            let block: u64 = pos / self.options.block_size;
            let within: u64 = pos % self.options.block_size;

            let bytes: Arc<Vec<u8>> = self
                .cache
                .fetch_or_insert(&self.block_key(block), || self.fetch_block(block))
                .await?;
            if (bytes.len() as u64) <= within {
                return Err(StorageError::Network {
                    key: self.location.to_string(),
                    message: format!("short block {} ({} bytes)", block, bytes.len()),
                });
            }

            let take: usize = (bytes.len() as u64 - within).min((want - filled) as u64) as usize;
            let within: usize = within as usize;
            dest[filled..filled + take].copy_from_slice(&bytes[within..within + take]);
            filled += take;
            pos += take as u64;
        }

        Ok(want)
    }

    fn metadata(&self) -> &MetadataIndex {
        self.meta.index()
    }

    fn cached_locally(&self) -> bool {
        false
    }
}
