//! The FUSE adapter: kernel operations over an archive backend.

use std::collections::{HashMap, HashSet};
use std::ffi::OsStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
    FUSE_ROOT_ID,
};
use libc::c_int;
use tokio::runtime::Handle;
use tracing::{debug, error, warn};

use clip_common::path::{join_child, parent_path};
use clip_format::{ClipNode, NodeType};
use clip_storage::{ContentCache, StorageBackend};

use crate::error::VfsError;
use crate::options::MountOptions;

/// Read-only filesystem over a clip archive.
///
/// One FS node exists per archive node; the inode table is materialized
/// from the metadata index at mount and never changes. Lookups go through a
/// process-local path cache behind a reader-writer lock — safe to share
/// because the archive is immutable.
pub struct ClipVfs {
    backend: Arc<dyn StorageBackend>,
    /// Content cache for opportunistic whole-file population. Absent for
    /// mounts without a cache directory.
    cache: Option<Arc<ContentCache>>,
    /// Inode number to archive node.
    inodes: HashMap<u64, Arc<ClipNode>>,
    /// Inode of the archive root, translated from `FUSE_ROOT_ID`.
    root_ino: u64,
    /// Absolute path to `(ino, attr)`, populated on successful lookups.
    lookup_cache: RwLock<HashMap<String, (u64, FileAttr)>>,
    /// Files with an in-flight cache population task.
    caching: Arc<Mutex<HashSet<u64>>>,
    options: MountOptions,
    runtime: Handle,
    next_handle: AtomicU64,
}

impl ClipVfs {
    /// Build a filesystem over an opened backend.
    ///
    /// # Errors
    /// `MountFailed` when called outside a tokio runtime; the FUSE
    /// callbacks are synchronous and bridge into async storage through the
    /// captured handle.
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        cache: Option<Arc<ContentCache>>,
        options: MountOptions,
    ) -> Result<Self, VfsError> {
        let runtime: Handle = Handle::try_current()
            .map_err(|e| VfsError::MountFailed(format!("no tokio runtime: {}", e)))?;

        let mut inodes: HashMap<u64, Arc<ClipNode>> = HashMap::new();
        for node in backend.metadata().iter() {
            inodes.insert(node.attr.ino, node.clone());
        }
        let root_ino: u64 = backend.metadata().root().attr.ino;

        Ok(Self {
            backend,
            cache,
            inodes,
            root_ino,
            lookup_cache: RwLock::new(HashMap::new()),
            caching: Arc::new(Mutex::new(HashSet::new())),
            options,
            runtime,
            next_handle: AtomicU64::new(1),
        })
    }

    fn log_op(&self, path: &str, op: &str) {
        if self.options.verbose {
            debug!(path, op, "fs operation");
        }
    }

    fn attr_ttl(&self) -> Duration {
        Duration::from_secs(self.options.attr_ttl_secs)
    }

    fn entry_ttl(&self) -> Duration {
        Duration::from_secs(self.options.entry_ttl_secs)
    }

    /// Resolve a kernel inode to its archive node.
    fn node_for(&self, ino: u64) -> Option<Arc<ClipNode>> {
        let ino: u64 = if ino == FUSE_ROOT_ID {
            self.root_ino
        } else {
            ino
        };
        self.inodes.get(&ino).cloned()
    }

    /// Convert stored attributes into the kernel representation.
    fn to_file_attr(node: &ClipNode) -> FileAttr {
        let kind: FileType = match node.node_type {
            NodeType::File => FileType::RegularFile,
            NodeType::Directory => FileType::Directory,
            NodeType::SymLink => FileType::Symlink,
        };

        FileAttr {
            ino: node.attr.ino,
            size: node.attr.size,
            blocks: node.attr.blocks,
            atime: unix_time(node.attr.atime, node.attr.atime_nsec),
            mtime: unix_time(node.attr.mtime, node.attr.mtime_nsec),
            ctime: unix_time(node.attr.ctime, node.attr.ctime_nsec),
            crtime: UNIX_EPOCH,
            kind,
            perm: (node.attr.mode & 0o7777) as u16,
            nlink: node.attr.nlink,
            uid: node.attr.uid,
            gid: node.attr.gid,
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }

    /// Look up `name` under the directory `parent`: lookup cache first,
    /// then the metadata index.
    fn resolve_child(&self, parent: u64, name: &str) -> Option<(u64, FileAttr)> {
        let parent_node: Arc<ClipNode> = self.node_for(parent)?;
        let child_path: String = join_child(&parent_node.path, name);

        {
            let cached = self.lookup_cache.read().unwrap();
            if let Some(entry) = cached.get(&child_path) {
                self.log_op(&child_path, "lookup cache hit");
                return Some(*entry);
            }
        }

        let child: Arc<ClipNode> = self.backend.metadata().get(&child_path)?;
        let attr: FileAttr = Self::to_file_attr(&child);
        self.lookup_cache
            .write()
            .unwrap()
            .insert(child_path, (child.attr.ino, attr));
        Some((child.attr.ino, attr))
    }

    /// Serve a read: zero-fill past the end of the file, otherwise pull
    /// bytes from the content cache or the backend.
    fn read_at(&self, ino: u64, offset: u64, size: u32) -> Result<Vec<u8>, c_int> {
        let node: Arc<ClipNode> = self.node_for(ino).ok_or(libc::ENOENT)?;
        self.log_op(&node.path, "read");

        // Reads past the end observe a defined, zeroed tail.
        if offset >= node.data_len {
            return Ok(vec![0u8; size as usize]);
        }

        let want: u64 = (size as u64).min(node.data_len - offset);

        // Prefer the content cache when the backend is not already local.
        if let Some(cache) = self.content_cache_for(&node) {
            match cache.get_content(&node.content_hash, offset, want) {
                Some(bytes) if bytes.len() as u64 == want => return Ok(bytes),
                _ => {
                    // Miss: read through and populate the cache off the
                    // read path.
                    self.spawn_cache_file(&node);
                }
            }
        }

        let mut buf: Vec<u8> = vec![0u8; want as usize];
        let backend: Arc<dyn StorageBackend> = self.backend.clone();
        let result: Result<usize, _> = self
            .runtime
            .block_on(async { backend.read_file(&node, &mut buf, offset).await });

        match result {
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(err) => {
                error!(path = %node.path, error = %err, "read failed");
                Err(libc::EIO)
            }
        }
    }

    /// The cache to consult for this node's content, if any applies.
    fn content_cache_for(&self, node: &ClipNode) -> Option<&Arc<ContentCache>> {
        if node.content_hash.is_empty() || self.backend.cached_locally() {
            return None;
        }
        self.cache.as_ref()
    }

    /// Store the whole file in the content cache on a background task, so
    /// the read that missed is not delayed.
    fn spawn_cache_file(&self, node: &Arc<ClipNode>) {
        let Some(cache) = self.cache.clone() else {
            return;
        };
        {
            let mut caching = self.caching.lock().unwrap();
            if !caching.insert(node.attr.ino) {
                return;
            }
        }

        let backend: Arc<dyn StorageBackend> = self.backend.clone();
        let node: Arc<ClipNode> = node.clone();
        let caching: Arc<Mutex<HashSet<u64>>> = self.caching.clone();

        self.runtime.spawn(async move {
            let mut content: Vec<u8> = vec![0u8; node.data_len as usize];
            match backend.read_file(&node, &mut content, 0).await {
                Ok(n) if n as u64 == node.data_len => {
                    if let Err(err) = cache.put(&node.content_hash, &content) {
                        warn!(path = %node.path, error = %err, "cache population failed");
                    }
                }
                Ok(n) => {
                    warn!(path = %node.path, read = n, "short read during cache population");
                }
                Err(err) => {
                    warn!(path = %node.path, error = %err, "cache population read failed");
                }
            }
            caching.lock().unwrap().remove(&node.attr.ino);
        });
    }
}

/// Convert stored seconds/nanos into `SystemTime`.
fn unix_time(secs: i64, nsec: u32) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsec)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

impl Filesystem for ClipVfs {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name: &str = match name.to_str() {
            Some(n) => n,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };

        match self.resolve_child(parent, name) {
            Some((_, attr)) => reply.entry(&self.entry_ttl(), &attr, 0),
            None => reply.error(libc::ENOENT),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        match self.node_for(ino) {
            Some(node) => {
                self.log_op(&node.path, "getattr");
                reply.attr(&self.attr_ttl(), &Self::to_file_attr(&node));
            }
            None => reply.error(libc::ENOENT),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let node: Arc<ClipNode> = match self.node_for(ino) {
            Some(n) => n,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        if !node.is_dir() {
            reply.error(libc::ENOTDIR);
            return;
        }
        self.log_op(&node.path, "readdir");

        let parent_ino: u64 = parent_path(&node.path)
            .and_then(|p| self.backend.metadata().get(p))
            .map(|p| p.attr.ino)
            .unwrap_or(node.attr.ino);

        let mut entries: Vec<(u64, FileType, String)> = vec![
            (node.attr.ino, FileType::Directory, ".".to_string()),
            (parent_ino, FileType::Directory, "..".to_string()),
        ];
        for child in self.backend.metadata().list_directory(&node.path) {
            let kind: FileType = match child.node_type {
                NodeType::File => FileType::RegularFile,
                NodeType::Directory => FileType::Directory,
                NodeType::SymLink => FileType::Symlink,
            };
            entries.push((child.attr.ino, kind, child.name().to_string()));
        }

        for (i, (ino, kind, name)) in entries.iter().enumerate().skip(offset as usize) {
            if reply.add(*ino, (i + 1) as i64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        if self.node_for(ino).is_none() {
            reply.error(libc::ENOENT);
            return;
        }

        // Memory-mapping opens get direct I/O so the kernel never tries to
        // write back pages it cannot flush to a read-only archive.
        let mut fuse_flags: u32 = 0;
        if flags & (libc::MAP_PRIVATE | libc::MAP_SHARED) != 0 {
            fuse_flags |= fuser::consts::FOPEN_DIRECT_IO;
        }

        let fh: u64 = self.next_handle.fetch_add(1, Ordering::SeqCst);
        reply.opened(fh, fuse_flags);
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock: Option<u64>,
        reply: ReplyData,
    ) {
        match self.read_at(ino, offset.max(0) as u64, size) {
            Ok(data) => reply.data(&data),
            Err(errno) => reply.error(errno),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        match self.node_for(ino) {
            Some(node) if node.is_symlink() => {
                self.log_op(&node.path, "readlink");
                reply.data(node.target.as_bytes());
            }
            Some(_) => reply.error(libc::EINVAL),
            None => reply.error(libc::ENOENT),
        }
    }

    fn opendir(&mut self, _req: &Request, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn releasedir(&mut self, _req: &Request, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    // The tree is immutable: every mutation is rejected with EROFS.

    fn create(
        &mut self,
        _req: &Request,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        reply.error(libc::EROFS);
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        reply.error(libc::EROFS);
    }

    fn rmdir(&mut self, _req: &Request, _parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(libc::EROFS);
    }

    fn unlink(&mut self, _req: &Request, _parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(libc::EROFS);
    }

    fn rename(
        &mut self,
        _req: &Request,
        _parent: u64,
        _name: &OsStr,
        _newparent: u64,
        _newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        reply.error(libc::EROFS);
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request,
        _ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        _size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        reply.error(libc::EROFS);
    }

    fn write(
        &mut self,
        _req: &Request,
        _ino: u64,
        _fh: u64,
        _offset: i64,
        _data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock: Option<u64>,
        reply: ReplyWrite,
    ) {
        reply.error(libc::EROFS);
    }

    fn symlink(
        &mut self,
        _req: &Request,
        _parent: u64,
        _name: &OsStr,
        _link: &std::path::Path,
        reply: ReplyEntry,
    ) {
        reply.error(libc::EROFS);
    }

    fn link(
        &mut self,
        _req: &Request,
        _ino: u64,
        _newparent: u64,
        _newname: &OsStr,
        reply: ReplyEntry,
    ) {
        reply.error(libc::EROFS);
    }
}

/// Mount the filesystem and block until it is unmounted.
pub fn mount(vfs: ClipVfs, mountpoint: &std::path::Path) -> Result<(), VfsError> {
    prepare_mountpoint(mountpoint)?;
    fuser::mount2(vfs, mountpoint, &session_options())
        .map_err(|e| VfsError::MountFailed(e.to_string()))
}

/// Mount the filesystem in the background.
///
/// The returned session unmounts when dropped.
pub fn spawn_mount(
    vfs: ClipVfs,
    mountpoint: &std::path::Path,
) -> Result<fuser::BackgroundSession, VfsError> {
    prepare_mountpoint(mountpoint)?;
    fuser::spawn_mount2(vfs, mountpoint, &session_options())
        .map_err(|e| VfsError::MountFailed(e.to_string()))
}

fn session_options() -> Vec<MountOption> {
    vec![
        MountOption::FSName("clipfs".to_string()),
        MountOption::RO,
        MountOption::AutoUnmount,
    ]
}

fn prepare_mountpoint(mountpoint: &std::path::Path) -> Result<(), VfsError> {
    if !mountpoint.exists() {
        std::fs::create_dir_all(mountpoint).map_err(|e| {
            VfsError::MountFailed(format!(
                "could not create mount point {}: {}",
                mountpoint.display(),
                e
            ))
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::AtomicBool;

    use async_trait::async_trait;
    use tempfile::TempDir;

    use clip_format::{ClipArchiver, MetadataIndex};
    use clip_storage::{ContentCacheConfig, LocalBackend, StorageError};

    fn build_archive(dir: &Path) -> PathBuf {
        let src: PathBuf = dir.join("src");
        fs::create_dir_all(src.join("a/b")).unwrap();
        fs::write(src.join("a.txt"), b"hello\n").unwrap();
        fs::write(src.join("a/b/c.bin"), vec![0x5Au8; 4000]).unwrap();
        std::os::unix::fs::symlink("../elsewhere", src.join("a/link")).unwrap();

        let archive: PathBuf = dir.join("tree.clip");
        ClipArchiver::new().create(&src, &archive).unwrap();
        archive
    }

    fn local_vfs(archive: &Path) -> Arc<ClipVfs> {
        let backend: Arc<LocalBackend> = Arc::new(LocalBackend::open(archive).unwrap());
        Arc::new(ClipVfs::new(backend, None, MountOptions::default()).unwrap())
    }

    /// Backend that serves local bytes but claims to be remote, and can be
    /// taken offline to prove reads come from the cache.
    struct FlakyRemote {
        inner: LocalBackend,
        offline: AtomicBool,
    }

    #[async_trait]
    impl StorageBackend for FlakyRemote {
        async fn read_file(
            &self,
            node: &ClipNode,
            dest: &mut [u8],
            offset: u64,
        ) -> Result<usize, StorageError> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(StorageError::Network {
                    key: node.path.clone(),
                    message: "offline".to_string(),
                });
            }
            self.inner.read_file(node, dest, offset).await
        }

        fn metadata(&self) -> &MetadataIndex {
            self.inner.metadata()
        }

        fn cached_locally(&self) -> bool {
            false
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_lookup_resolves_and_caches() {
        let dir: TempDir = TempDir::new().unwrap();
        let archive: PathBuf = build_archive(dir.path());
        let vfs: Arc<ClipVfs> = local_vfs(&archive);

        let root: u64 = FUSE_ROOT_ID;
        let (a_ino, a_attr) = vfs.resolve_child(root, "a").unwrap();
        assert_eq!(a_attr.kind, FileType::Directory);

        let (_, file_attr) = vfs.resolve_child(a_ino, "b").unwrap();
        assert_eq!(file_attr.kind, FileType::Directory);

        assert!(vfs.resolve_child(root, "missing").is_none());
        assert!(vfs.resolve_child(a_ino, "x").is_none());

        // Successful lookups were cached by absolute path.
        let cached = vfs.lookup_cache.read().unwrap();
        assert!(cached.contains_key("/a"));
        assert!(cached.contains_key("/a/b"));
        assert!(!cached.contains_key("/missing"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_attr_mapping() {
        let dir: TempDir = TempDir::new().unwrap();
        let archive: PathBuf = build_archive(dir.path());
        let vfs: Arc<ClipVfs> = local_vfs(&archive);

        let (ino, attr) = vfs.resolve_child(FUSE_ROOT_ID, "a.txt").unwrap();
        assert_eq!(attr.ino, ino);
        assert_eq!(attr.size, 6);
        assert_eq!(attr.kind, FileType::RegularFile);

        let node: Arc<ClipNode> = vfs.node_for(ino).unwrap();
        assert_eq!(attr.perm as u32, node.attr.mode & 0o7777);
        assert_eq!(attr.uid, node.attr.uid);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_read_at_ranges() {
        let dir: TempDir = TempDir::new().unwrap();
        let archive: PathBuf = build_archive(dir.path());
        let vfs: Arc<ClipVfs> = local_vfs(&archive);
        let (ino, _) = vfs.resolve_child(FUSE_ROOT_ID, "a.txt").unwrap();

        let read = |vfs: Arc<ClipVfs>, offset: u64, size: u32| {
            tokio::task::spawn_blocking(move || vfs.read_at(ino, offset, size))
        };

        // Full read and offset read.
        assert_eq!(read(vfs.clone(), 0, 6).await.unwrap().unwrap(), b"hello\n");
        assert_eq!(read(vfs.clone(), 2, 3).await.unwrap().unwrap(), b"llo");

        // Crossing the end clamps to what exists.
        assert_eq!(read(vfs.clone(), 4, 100).await.unwrap().unwrap(), b"o\n");

        // At or past the end the kernel sees a defined zeroed buffer.
        let tail: Vec<u8> = read(vfs.clone(), 6, 10).await.unwrap().unwrap();
        assert_eq!(tail, vec![0u8; 10]);
        let tail: Vec<u8> = read(vfs.clone(), 500, 4).await.unwrap().unwrap();
        assert_eq!(tail, vec![0u8; 4]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_read_unknown_inode_is_enoent() {
        let dir: TempDir = TempDir::new().unwrap();
        let archive: PathBuf = build_archive(dir.path());
        let vfs: Arc<ClipVfs> = local_vfs(&archive);

        let result = tokio::task::spawn_blocking(move || vfs.read_at(9999, 0, 4))
            .await
            .unwrap();
        assert_eq!(result.unwrap_err(), libc::ENOENT);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_symlink_target_preserved() {
        let dir: TempDir = TempDir::new().unwrap();
        let archive: PathBuf = build_archive(dir.path());
        let vfs: Arc<ClipVfs> = local_vfs(&archive);

        let (a_ino, _) = vfs.resolve_child(FUSE_ROOT_ID, "a").unwrap();
        let (link_ino, attr) = vfs.resolve_child(a_ino, "link").unwrap();
        assert_eq!(attr.kind, FileType::Symlink);

        let node: Arc<ClipNode> = vfs.node_for(link_ino).unwrap();
        assert!(node.is_symlink());
        assert_eq!(node.target, "../elsewhere");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_read_populates_cache_in_background() {
        let dir: TempDir = TempDir::new().unwrap();
        let archive: PathBuf = build_archive(dir.path());

        let backend: Arc<FlakyRemote> = Arc::new(FlakyRemote {
            inner: LocalBackend::open(&archive).unwrap(),
            offline: AtomicBool::new(false),
        });
        let cache: Arc<ContentCache> = Arc::new(
            ContentCache::open(ContentCacheConfig::new(dir.path().join("cache"))).unwrap(),
        );
        let vfs: Arc<ClipVfs> = Arc::new(
            ClipVfs::new(backend.clone(), Some(cache.clone()), MountOptions::default()).unwrap(),
        );

        let (ino, _) = vfs.resolve_child(FUSE_ROOT_ID, "a.txt").unwrap();
        let hash: String = vfs.node_for(ino).unwrap().content_hash.clone();

        // First read misses the cache and kicks off async population.
        let first = vfs.clone();
        let bytes: Vec<u8> = tokio::task::spawn_blocking(move || first.read_at(ino, 0, 6))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bytes, b"hello\n");

        // Wait for the fire-and-forget population task.
        let mut populated: bool = false;
        for _ in 0..200 {
            if cache.get_content(&hash, 0, 6).is_some() {
                populated = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(populated, "cache was never populated");

        // With the backend offline, reads are served from the cache.
        backend.offline.store(true, Ordering::SeqCst);
        let second = vfs.clone();
        let bytes: Vec<u8> = tokio::task::spawn_blocking(move || second.read_at(ino, 0, 6))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bytes, b"hello\n");
    }
}
