//! The clip archive format.
//!
//! A clip archive packages a directory tree into a single immutable file:
//! a fixed header, the concatenated content of every regular file, a
//! serialized node index, and a fixed trailer. The layout permits random
//! access to any file's bytes without unpacking the archive.
//!
//! This crate owns the on-disk format — framing, node model, and metadata
//! index — plus the archiver that creates, inspects, and extracts archives.

pub mod archiver;
pub mod error;
pub mod header;
pub mod index;
pub mod node;

pub use archiver::{ArchiveMeta, ClipArchiver};
pub use error::FormatError;
pub use header::{ClipHeader, ClipTrailer, FORMAT_VERSION, HEADER_SIZE, MAGIC, TRAILER_SIZE};
pub use index::MetadataIndex;
pub use node::{ClipNode, NodeAttr, NodeType};
