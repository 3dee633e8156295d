//! The metadata index: path-keyed, loaded once per mount.
//!
//! Nodes are kept in a path-sorted array looked up by binary search. For
//! directory listing the index keeps a flattened child table plus a
//! per-directory `(start, count)` window into it, computed once at load, so
//! both lookups and listings run without scanning.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::FormatError;
use crate::node::{ClipNode, NodeType};

use clip_common::path::parent_path;

/// Read-only index over an archive's nodes.
///
/// Immutable after construction and freely shareable across threads.
#[derive(Debug)]
pub struct MetadataIndex {
    /// All nodes, sorted by path.
    nodes: Vec<Arc<ClipNode>>,
    /// Node positions grouped by parent directory, in sorted order.
    child_slots: Vec<u32>,
    /// Directory path to its `(start, count)` window in `child_slots`.
    dir_children: HashMap<String, (u32, u32)>,
}

impl MetadataIndex {
    /// Build and validate an index from decoded node records.
    ///
    /// `content_len` is the length of the archive's content region; file
    /// data ranges are checked against it.
    ///
    /// # Errors
    /// `CorruptArchive` for any structural violation: missing or misplaced
    /// root, unsorted or duplicate paths, dangling parents, non-directory
    /// parents, invalid inodes, out-of-range data, or empty symlink targets.
    pub fn from_nodes(nodes: Vec<ClipNode>, content_len: u64) -> Result<Self, FormatError> {
        let root: &ClipNode = nodes
            .first()
            .ok_or_else(|| FormatError::corrupt("empty node index"))?;
        if root.path != "/" || root.node_type != NodeType::Directory {
            return Err(FormatError::corrupt("first node is not the root directory"));
        }

        let mut seen_inos: HashSet<u64> = HashSet::with_capacity(nodes.len());
        let mut positions: HashMap<&str, usize> = HashMap::with_capacity(nodes.len());
        let mut grouped: Vec<(usize, Vec<u32>)> = Vec::new();
        let mut group_of: HashMap<&str, usize> = HashMap::new();

        for (idx, node) in nodes.iter().enumerate() {
            if idx > 0 {
                let prev: &ClipNode = &nodes[idx - 1];
                if node.path.as_str() <= prev.path.as_str() {
                    return Err(FormatError::corrupt(format!(
                        "node index not sorted at {}",
                        node.path
                    )));
                }
                if !node.path.starts_with('/') || node.path.ends_with('/') {
                    return Err(FormatError::corrupt(format!(
                        "malformed node path {}",
                        node.path
                    )));
                }
            }

            if node.attr.ino == 0 || !seen_inos.insert(node.attr.ino) {
                return Err(FormatError::corrupt(format!(
                    "invalid or duplicate inode {} at {}",
                    node.attr.ino, node.path
                )));
            }

            match node.node_type {
                NodeType::File => {
                    let end: u64 = node
                        .data_offset
                        .checked_add(node.data_len)
                        .ok_or_else(|| {
                            FormatError::corrupt(format!("data range overflow at {}", node.path))
                        })?;
                    if end > content_len {
                        return Err(FormatError::corrupt(format!(
                            "data range out of bounds at {}",
                            node.path
                        )));
                    }
                    if node.attr.size != node.data_len {
                        return Err(FormatError::corrupt(format!(
                            "size does not match data length at {}",
                            node.path
                        )));
                    }
                }
                NodeType::SymLink => {
                    if node.target.is_empty() {
                        return Err(FormatError::corrupt(format!(
                            "symlink with empty target at {}",
                            node.path
                        )));
                    }
                }
                NodeType::Directory => {}
            }

            if idx > 0 {
                let parent: &str = parent_path(&node.path).ok_or_else(|| {
                    FormatError::corrupt(format!("node without parent: {}", node.path))
                })?;
                let parent_idx: usize = *positions.get(parent).ok_or_else(|| {
                    FormatError::corrupt(format!("dangling parent {} for {}", parent, node.path))
                })?;
                if nodes[parent_idx].node_type != NodeType::Directory {
                    return Err(FormatError::corrupt(format!(
                        "parent of {} is not a directory",
                        node.path
                    )));
                }

                let group: usize = match group_of.get(parent) {
                    Some(g) => *g,
                    None => {
                        grouped.push((parent_idx, Vec::new()));
                        group_of.insert(parent, grouped.len() - 1);
                        grouped.len() - 1
                    }
                };
                grouped[group].1.push(idx as u32);
            }

            positions.insert(node.path.as_str(), idx);
        }

        // Flatten the per-directory groups into one table with windows.
        let mut child_slots: Vec<u32> = Vec::with_capacity(nodes.len().saturating_sub(1));
        let mut dir_children: HashMap<String, (u32, u32)> = HashMap::with_capacity(grouped.len());
        for (parent_idx, children) in grouped {
            let start: u32 = child_slots.len() as u32;
            let count: u32 = children.len() as u32;
            child_slots.extend(children);
            dir_children.insert(nodes[parent_idx].path.clone(), (start, count));
        }

        Ok(Self {
            nodes: nodes.into_iter().map(Arc::new).collect(),
            child_slots,
            dir_children,
        })
    }

    /// Exact-path lookup.
    pub fn get(&self, path: &str) -> Option<Arc<ClipNode>> {
        let idx: usize = self
            .nodes
            .binary_search_by(|node: &Arc<ClipNode>| node.path.as_str().cmp(path))
            .ok()?;
        Some(self.nodes[idx].clone())
    }

    /// Direct children of the directory at `path`, in stored order.
    ///
    /// Empty for non-directories, unknown paths, and empty directories.
    pub fn list_directory(&self, path: &str) -> Vec<Arc<ClipNode>> {
        match self.dir_children.get(path) {
            Some(&(start, count)) => self.child_slots[start as usize..(start + count) as usize]
                .iter()
                .map(|&idx| self.nodes[idx as usize].clone())
                .collect(),
            None => Vec::new(),
        }
    }

    /// The root directory node.
    pub fn root(&self) -> Arc<ClipNode> {
        self.nodes[0].clone()
    }

    /// All nodes in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ClipNode>> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeAttr;

    fn node(path: &str, ino: u64, node_type: NodeType) -> ClipNode {
        ClipNode {
            path: path.to_string(),
            node_type,
            attr: NodeAttr {
                ino,
                mode: match node_type {
                    NodeType::Directory => 0o40755,
                    NodeType::SymLink => 0o120777,
                    NodeType::File => 0o100644,
                },
                nlink: 1,
                ..Default::default()
            },
            data_offset: 0,
            data_len: 0,
            target: if node_type == NodeType::SymLink {
                "target".to_string()
            } else {
                String::new()
            },
            content_hash: String::new(),
        }
    }

    fn sample_nodes() -> Vec<ClipNode> {
        vec![
            node("/", 1, NodeType::Directory),
            node("/a", 2, NodeType::Directory),
            node("/a/b", 3, NodeType::Directory),
            node("/a/b/c.txt", 4, NodeType::File),
            node("/a/link", 5, NodeType::SymLink),
            node("/z.txt", 6, NodeType::File),
        ]
    }

    #[test]
    fn test_get_and_miss() {
        let index: MetadataIndex = MetadataIndex::from_nodes(sample_nodes(), 0).unwrap();
        assert_eq!(index.get("/a/b/c.txt").unwrap().attr.ino, 4);
        assert_eq!(index.get("/").unwrap().attr.ino, 1);
        assert!(index.get("/a/x").is_none());
        assert!(index.get("/a/b/c").is_none());
    }

    #[test]
    fn test_list_directory() {
        let index: MetadataIndex = MetadataIndex::from_nodes(sample_nodes(), 0).unwrap();

        let root_children: Vec<String> = index
            .list_directory("/")
            .iter()
            .map(|n| n.path.clone())
            .collect();
        assert_eq!(root_children, vec!["/a", "/z.txt"]);

        let a_children: Vec<String> = index
            .list_directory("/a")
            .iter()
            .map(|n| n.path.clone())
            .collect();
        assert_eq!(a_children, vec!["/a/b", "/a/link"]);

        // Non-directories and unknown paths list empty.
        assert!(index.list_directory("/z.txt").is_empty());
        assert!(index.list_directory("/missing").is_empty());
        assert!(index.list_directory("/a/b").len() == 1);
    }

    #[test]
    fn test_rejects_missing_root() {
        let nodes: Vec<ClipNode> = sample_nodes()[1..].to_vec();
        assert!(MetadataIndex::from_nodes(nodes, 0).is_err());
    }

    #[test]
    fn test_rejects_unsorted() {
        let mut nodes: Vec<ClipNode> = sample_nodes();
        nodes.swap(1, 5);
        assert!(MetadataIndex::from_nodes(nodes, 0).is_err());
    }

    #[test]
    fn test_rejects_duplicate_path() {
        let mut nodes: Vec<ClipNode> = sample_nodes();
        nodes[5].path = "/a/link".to_string();
        assert!(MetadataIndex::from_nodes(nodes, 0).is_err());
    }

    #[test]
    fn test_rejects_dangling_parent() {
        let nodes: Vec<ClipNode> = vec![
            node("/", 1, NodeType::Directory),
            node("/a/b", 2, NodeType::File),
        ];
        assert!(MetadataIndex::from_nodes(nodes, 0).is_err());
    }

    #[test]
    fn test_rejects_file_parent() {
        let nodes: Vec<ClipNode> = vec![
            node("/", 1, NodeType::Directory),
            node("/f", 2, NodeType::File),
            node("/f/child", 3, NodeType::File),
        ];
        assert!(MetadataIndex::from_nodes(nodes, 0).is_err());
    }

    #[test]
    fn test_rejects_duplicate_inode() {
        let mut nodes: Vec<ClipNode> = sample_nodes();
        nodes[3].attr.ino = 2;
        assert!(MetadataIndex::from_nodes(nodes, 0).is_err());
    }

    #[test]
    fn test_rejects_zero_inode() {
        let mut nodes: Vec<ClipNode> = sample_nodes();
        nodes[0].attr.ino = 0;
        assert!(MetadataIndex::from_nodes(nodes, 0).is_err());
    }

    #[test]
    fn test_rejects_out_of_range_data() {
        let mut nodes: Vec<ClipNode> = sample_nodes();
        nodes[3].data_offset = 100;
        nodes[3].data_len = 50;
        nodes[3].attr.size = 50;
        assert!(MetadataIndex::from_nodes(nodes.clone(), 100).is_err());
        assert!(MetadataIndex::from_nodes(nodes, 150).is_ok());
    }

    #[test]
    fn test_rejects_size_mismatch() {
        let mut nodes: Vec<ClipNode> = sample_nodes();
        nodes[3].data_len = 10;
        nodes[3].attr.size = 20;
        assert!(MetadataIndex::from_nodes(nodes, 100).is_err());
    }

    #[test]
    fn test_rejects_empty_symlink_target() {
        let mut nodes: Vec<ClipNode> = sample_nodes();
        nodes[4].target = String::new();
        assert!(MetadataIndex::from_nodes(nodes, 0).is_err());
    }
}
