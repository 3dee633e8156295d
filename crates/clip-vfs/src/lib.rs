//! Read-only FUSE filesystem for clip archives.
//!
//! Mounts an archive — local or streamed from object storage — as a POSIX
//! tree. Files appear as local files; content is pulled on demand through
//! the storage backend and a block-granular content cache.
//!
//! # Architecture
//!
//! ```text
//! kernel op -> ClipVfs (fuser::Filesystem) -> StorageBackend.read_file
//!                                          -> (content cache | local file | ranged GET)
//! ```

pub mod error;
pub mod filesystem;
pub mod options;

pub use error::VfsError;
pub use filesystem::{mount, spawn_mount, ClipVfs};
pub use options::MountOptions;
