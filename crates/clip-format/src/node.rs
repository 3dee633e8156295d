//! The node model: one record per filesystem entry in an archive.

use serde::{Deserialize, Serialize};

use clip_common::path::file_name;

/// Kind of a filesystem entry stored in an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    File,
    Directory,
    SymLink,
}

/// POSIX-style attributes captured at archive time and served verbatim by
/// the mounted filesystem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAttr {
    /// Inode number, unique within the archive, assigned in index order.
    pub ino: u64,
    /// Mode bits including the file type bits.
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    /// Size in bytes. Equals `data_len` for files.
    pub size: u64,
    /// 512-byte block count.
    pub blocks: u64,
    pub atime: i64,
    pub atime_nsec: u32,
    pub mtime: i64,
    pub mtime_nsec: u32,
    pub ctime: i64,
    pub ctime_nsec: u32,
}

/// A single entry in the archive's node index.
///
/// Nodes are built by the archiver, frozen at archive creation, and never
/// mutated afterwards. On mount they are materialized into the metadata
/// index and shared read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClipNode {
    /// Absolute path within the archive. Starts with `/`; the root is
    /// exactly `/`.
    pub path: String,
    pub node_type: NodeType,
    pub attr: NodeAttr,
    /// Byte offset of the file's content within the content region.
    /// Zero for directories and symlinks.
    #[serde(default)]
    pub data_offset: u64,
    /// Length of the file's content. Zero for directories and symlinks.
    #[serde(default)]
    pub data_len: u64,
    /// Raw symlink target, stored uninterpreted. Empty for non-symlinks.
    #[serde(default)]
    pub target: String,
    /// XXH3-128 hex digest of the file's bytes. Empty for non-files.
    #[serde(default)]
    pub content_hash: String,
}

impl ClipNode {
    pub fn is_file(&self) -> bool {
        self.node_type == NodeType::File
    }

    pub fn is_dir(&self) -> bool {
        self.node_type == NodeType::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.node_type == NodeType::SymLink
    }

    /// Final path component. The root's name is the empty string.
    pub fn name(&self) -> &str {
        file_name(&self.path)
    }
}
