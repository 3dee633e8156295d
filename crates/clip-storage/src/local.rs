//! Backend serving an archive from the local filesystem.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;

use async_trait::async_trait;

use clip_format::{ArchiveMeta, ClipArchiver, ClipNode, MetadataIndex};

use crate::backend::StorageBackend;
use crate::error::StorageError;

/// Serves reads from a local archive file with positional reads, so one
/// descriptor handles concurrent requests without shared seek state.
pub struct LocalBackend {
    file: File,
    path: String,
    meta: ArchiveMeta,
}

impl LocalBackend {
    /// Open and validate the archive at `path`.
    ///
    /// # Errors
    /// `Format` for a corrupt archive, `Io` if the file cannot be opened.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let meta: ArchiveMeta = ClipArchiver::new().extract_metadata(path)?;
        let file: File =
            File::open(path).map_err(|e| StorageError::io(path.display().to_string(), e))?;
        Ok(Self {
            file,
            path: path.display().to_string(),
            meta,
        })
    }

    pub fn meta(&self) -> &ArchiveMeta {
        &self.meta
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
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
        let pos: u64 = self.meta.content_offset() + node.data_offset + offset;
        self.file
            .read_exact_at(&mut dest[..want], pos)
            .map_err(|e| StorageError::io(self.path.clone(), e))?;
        Ok(want)
    }

    fn metadata(&self) -> &MetadataIndex {
        self.meta.index()
    }

    fn cached_locally(&self) -> bool {
        true
    }
}
