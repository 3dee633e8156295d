//! Storage backends for clip archives.
//!
//! Everything between the mounted filesystem and the archive bytes lives
//! here: the `StorageClient` object-store abstraction and its AWS SDK
//! implementation, the bounded on-disk content cache with single-flight
//! fetch coordination, the `StorageBackend` random-read interface with
//! local-file and remote-object implementations, and the uploader that
//! pushes finished archives to S3.

mod backend;
mod client;
mod content_cache;
mod error;
mod local;
mod remote;
mod upload;

pub use backend::{open_backend, StorageBackend};
pub use client::{S3Credentials, S3Location, S3StorageClient, StorageClient};
pub use content_cache::{ContentCache, ContentCacheConfig};
pub use error::StorageError;
pub use local::LocalBackend;
pub use remote::{RemoteBackend, RemoteBackendOptions};
pub use upload::RemoteArchiver;
