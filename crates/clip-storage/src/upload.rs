//! Uploading archives to object storage.

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use clip_format::ClipArchiver;

use crate::client::StorageClient;
use crate::error::StorageError;

/// Stores existing local archives in object storage.
///
/// Upload only; the archive is validated but never repackaged.
pub struct RemoteArchiver {
    client: Arc<dyn StorageClient>,
    bucket: String,
}

impl RemoteArchiver {
    pub fn new(client: Arc<dyn StorageClient>, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Upload the archive at `local_archive` under `key`.
    ///
    /// The archive is parsed first so a corrupt file is rejected before any
    /// bytes leave the machine.
    ///
    /// # Errors
    /// `Format` for an invalid archive, `Network` for upload failures.
    pub async fn create(&self, local_archive: &Path, key: &str) -> Result<(), StorageError> {
        ClipArchiver::new().extract_metadata(local_archive)?;

        self.client
            .put_object_from_file(&self.bucket, key, local_archive)
            .await?;
        info!(bucket = %self.bucket, key, "archive uploaded");
        Ok(())
    }
}
