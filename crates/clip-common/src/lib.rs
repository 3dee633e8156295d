//! Shared primitives for the clip crates.
//!
//! This crate provides functionality used across the whole workspace:
//! - Content digest computation (streaming XXH3-128)
//! - Archive-path helpers (join, parent, normalization from OS paths)
//! - Shared constants

pub mod constants;
pub mod hash;
pub mod path;

pub use constants::*;
pub use hash::{hash_bytes, hash_file, ContentHasher};
pub use path::{file_name, join_child, parent_path, to_archive_path, ArchivePathError};
