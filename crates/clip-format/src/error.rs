//! Error types for the archive format.

use thiserror::Error;

use clip_common::ArchivePathError;

/// Errors produced while creating, loading, or extracting archives.
#[derive(Debug, Error)]
pub enum FormatError {
    /// The archive bytes violate the format: bad magic, unsupported version,
    /// digest mismatch, offsets out of range, or an invalid node index.
    #[error("corrupt archive: {reason}")]
    CorruptArchive { reason: String },

    /// The archiver met a source entry that is not a file, directory, or
    /// symlink (socket, device, FIFO).
    #[error("unsupported node type: {path}")]
    UnsupportedNodeType { path: String },

    /// Filesystem I/O failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A source path could not be mapped into the archive namespace.
    #[error(transparent)]
    Path(#[from] ArchivePathError),
}

impl FormatError {
    /// Build a `CorruptArchive` error.
    pub fn corrupt(reason: impl Into<String>) -> Self {
        Self::CorruptArchive {
            reason: reason.into(),
        }
    }

    /// Wrap an I/O error with the path it occurred at.
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
