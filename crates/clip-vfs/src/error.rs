//! Error types for the mounted filesystem.

use thiserror::Error;

use clip_storage::StorageError;

/// Errors surfaced while setting up or running a mount.
#[derive(Debug, Error)]
pub enum VfsError {
    /// The FUSE session could not be established.
    #[error("mount failed: {0}")]
    MountFailed(String),

    /// The backend refused the archive.
    #[error(transparent)]
    Storage(#[from] StorageError),
}
