//! Bounded on-disk content cache.
//!
//! Entries are content-addressed files under a caller-provided directory:
//! remote block bytes keyed by `(archive id, block index)` and whole-file
//! content keyed by `content_hash`. Writes go to a temp file and are renamed
//! into place, so a crash mid-write leaves only a temp file that the next
//! open discards. Concurrent mounts may share one directory; rename races
//! resolve to identical bytes.
//!
//! # Thread safety
//!
//! - Entry bookkeeping (sizes, recency) sits behind a `Mutex`, held only for
//!   map operations, never across I/O.
//! - Concurrent fetches of one key are coordinated through a shared future,
//!   so at most one fetch per key is in flight; waiters share its result.
//! - Eviction unlinks files; readers that already opened the entry keep a
//!   valid descriptor, so an entry being served is never invalidated.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use clip_common::DEFAULT_CACHE_CEILING;

use crate::error::StorageError;

/// Suffix for in-progress writes, discarded on open.
const TMP_SUFFIX: &str = ".tmp";

/// Result broadcast to fetch waiters. The error is stringly typed because
/// `StorageError` is not `Clone`.
type FetchResult = Result<Arc<Vec<u8>>, String>;

type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;

/// Configuration for the on-disk cache.
#[derive(Debug, Clone)]
pub struct ContentCacheConfig {
    /// Directory holding the cached entries. Created if absent.
    pub root: PathBuf,
    /// Ceiling on total cached bytes; least-recently-used entries are
    /// evicted beyond it.
    pub ceiling_bytes: u64,
}

impl ContentCacheConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ceiling_bytes: DEFAULT_CACHE_CEILING,
        }
    }

    pub fn with_ceiling(mut self, ceiling_bytes: u64) -> Self {
        self.ceiling_bytes = ceiling_bytes;
        self
    }
}

/// Bookkeeping for one cached entry.
struct EntryInfo {
    size: u64,
    last_used: Instant,
}

struct CacheInner {
    entries: HashMap<String, EntryInfo>,
    total_bytes: u64,
}

/// Bounded, durable, content-addressed cache.
pub struct ContentCache {
    root: PathBuf,
    ceiling: u64,
    inner: Mutex<CacheInner>,
    pending_fetches: Mutex<HashMap<String, SharedFetch>>,
    pending_puts: Mutex<HashSet<String>>,
    tmp_seq: AtomicU64,
}

impl ContentCache {
    /// Open (or create) a cache directory.
    ///
    /// Sweeps leftover temp files from interrupted writes and indexes the
    /// surviving entries.
    ///
    /// # Errors
    /// `Io` if the directory cannot be created or scanned.
    pub fn open(config: ContentCacheConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(&config.root)
            .map_err(|e| StorageError::io(config.root.display().to_string(), e))?;

        let mut entries: HashMap<String, EntryInfo> = HashMap::new();
        let mut total_bytes: u64 = 0;
        let now: Instant = Instant::now();

        let dir = fs::read_dir(&config.root)
            .map_err(|e| StorageError::io(config.root.display().to_string(), e))?;
        for entry in dir {
            let entry: fs::DirEntry =
                entry.map_err(|e| StorageError::io(config.root.display().to_string(), e))?;
            let name: String = entry.file_name().to_string_lossy().into_owned();

            if name.ends_with(TMP_SUFFIX) {
                // Interrupted write; the entry was never committed.
                debug!(file = %name, "discarding partial cache entry");
                let _ = fs::remove_file(entry.path());
                continue;
            }

            let meta: fs::Metadata = match entry.metadata() {
                Ok(m) if m.is_file() => m,
                _ => continue,
            };
            total_bytes += meta.len();
            entries.insert(
                name,
                EntryInfo {
                    size: meta.len(),
                    last_used: now,
                },
            );
        }

        Ok(Self {
            root: config.root,
            ceiling: config.ceiling_bytes,
            inner: Mutex::new(CacheInner {
                entries,
                total_bytes,
            }),
            pending_fetches: Mutex::new(HashMap::new()),
            pending_puts: Mutex::new(HashSet::new()),
            tmp_seq: AtomicU64::new(0),
        })
    }

    /// Read `[offset, offset + length)` of the entry for `key`.
    ///
    /// Returns `None` on a miss. On a hit the slice is clamped to the
    /// entry's size but never short of what is available.
    pub fn get_content(&self, key: &str, offset: u64, length: u64) -> Option<Vec<u8>> {
        {
            let mut inner = self.inner.lock().unwrap();
            let info: &mut EntryInfo = inner.entries.get_mut(key)?;
            info.last_used = Instant::now();
        }

        // The file stays readable through the descriptor even if eviction
        // unlinks it concurrently.
        let mut file: File = File::open(self.entry_path(key)).ok()?;
        let size: u64 = file.metadata().ok()?.len();
        if offset >= size {
            return Some(Vec::new());
        }

        let want: usize = length.min(size - offset) as usize;
        let mut buf: Vec<u8> = vec![0u8; want];
        file.seek(SeekFrom::Start(offset)).ok()?;
        file.read_exact(&mut buf).ok()?;
        Some(buf)
    }

    /// Store the full content for `key`. Idempotent; concurrent puts of the
    /// same key deduplicate to a single write.
    pub fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        {
            let inner = self.inner.lock().unwrap();
            if inner.entries.contains_key(key) {
                return Ok(());
            }
        }
        {
            let mut puts = self.pending_puts.lock().unwrap();
            if !puts.insert(key.to_string()) {
                // Another thread is writing this key.
                return Ok(());
            }
        }

        let result: Result<(), StorageError> = self.write_entry(key, bytes);
        self.pending_puts.lock().unwrap().remove(key);
        result
    }

    /// Serve `key` from the cache, or run `fetch` to populate it.
    ///
    /// At most one fetch per key is in flight; concurrent callers await the
    /// same result. A failed or cancelled fetch clears its slot so the next
    /// caller retries.
    pub async fn fetch_or_insert<F, Fut>(
        &self,
        key: &str,
        fetch: F,
    ) -> Result<Arc<Vec<u8>>, StorageError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Vec<u8>, StorageError>>,
    {
        // Fast path: on disk already.
        if let Some(bytes) = self.get_content(key, 0, u64::MAX) {
            return Ok(Arc::new(bytes));
        }

        // Join an in-flight fetch if one exists, else claim the slot.
        let (tx, rx) = oneshot::channel::<FetchResult>();
        let shared: SharedFetch = async move {
            rx.await
                .unwrap_or_else(|_| Err("fetch cancelled".to_string()))
        }
        .boxed()
        .shared();

        let existing: Option<SharedFetch> = {
            let mut pending = self.pending_fetches.lock().unwrap();
            match pending.get(key) {
                Some(fetching) => Some(fetching.clone()),
                None => {
                    pending.insert(key.to_string(), shared.clone());
                    None
                }
            }
        };

        if let Some(fetching) = existing {
            return fetching
                .await
                .map_err(|message| StorageError::Backend { message });
        }

        // We own the slot: fetch, commit, broadcast. The guard clears the
        // slot even if this future is dropped mid-fetch, so a cancelled
        // fetch never wedges later requests.
        let _guard = PendingGuard {
            cache: self,
            key: key.to_string(),
        };

        // Another fetch may have committed between the fast path and the
        // slot claim; re-check the disk before going to the source.
        if let Some(bytes) = self.get_content(key, 0, u64::MAX) {
            let bytes: Arc<Vec<u8>> = Arc::new(bytes);
            let _ = tx.send(Ok(bytes.clone()));
            return Ok(bytes);
        }

        let fetched: Result<Vec<u8>, StorageError> = fetch().await;
        match fetched {
            Ok(bytes) => {
                if let Err(err) = self.put(key, &bytes) {
                    warn!(key, error = %err, "failed to persist cache entry");
                }
                let bytes: Arc<Vec<u8>> = Arc::new(bytes);
                let _ = tx.send(Ok(bytes.clone()));
                Ok(bytes)
            }
            Err(err) => {
                let _ = tx.send(Err(err.to_string()));
                Err(err)
            }
        }
    }

    /// Total bytes currently accounted on disk.
    pub fn total_bytes(&self) -> u64 {
        self.inner.lock().unwrap().total_bytes
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    /// Write bytes to a temp file and rename it into place, then account
    /// the entry and evict past the ceiling.
    fn write_entry(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let tmp: PathBuf = self.root.join(format!(
            "{}.{}.{}{}",
            key,
            std::process::id(),
            self.tmp_seq.fetch_add(1, Ordering::Relaxed),
            TMP_SUFFIX
        ));
        let dest: PathBuf = self.entry_path(key);
        let display = || tmp.display().to_string();

        let mut file: File = File::create(&tmp).map_err(|e| StorageError::io(display(), e))?;
        file.write_all(bytes)
            .and_then(|_| file.sync_all())
            .map_err(|e| StorageError::io(display(), e))?;
        drop(file);
        fs::rename(&tmp, &dest).map_err(|e| StorageError::io(display(), e))?;

        let evict: Vec<(String, u64)> = {
            let mut inner = self.inner.lock().unwrap();
            inner.entries.insert(
                key.to_string(),
                EntryInfo {
                    size: bytes.len() as u64,
                    last_used: Instant::now(),
                },
            );
            inner.total_bytes += bytes.len() as u64;
            self.plan_eviction(&mut inner)
        };

        for (victim, _) in evict {
            let _ = fs::remove_file(self.entry_path(&victim));
            debug!(key = %victim, "evicted cache entry");
        }
        Ok(())
    }

    /// Pick least-recently-used victims until the total fits the ceiling.
    /// Bookkeeping is updated here; unlinking happens outside the lock.
    fn plan_eviction(&self, inner: &mut CacheInner) -> Vec<(String, u64)> {
        if inner.total_bytes <= self.ceiling {
            return Vec::new();
        }

        let mut by_age: Vec<(String, u64, Instant)> = inner
            .entries
            .iter()
            .map(|(k, info)| (k.clone(), info.size, info.last_used))
            .collect();
        by_age.sort_by_key(|(_, _, used)| *used);

        let mut victims: Vec<(String, u64)> = Vec::new();
        for (key, size, _) in by_age {
            if inner.total_bytes <= self.ceiling {
                break;
            }
            inner.entries.remove(&key);
            inner.total_bytes -= size;
            victims.push((key, size));
        }
        victims
    }
}

/// Clears the single-flight slot for a key when its fetch completes or is
/// dropped.
struct PendingGuard<'a> {
    cache: &'a ContentCache,
    key: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.cache
            .pending_fetches
            .lock()
            .unwrap()
            .remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    fn open_cache(dir: &Path) -> ContentCache {
        ContentCache::open(ContentCacheConfig::new(dir)).unwrap()
    }

    #[test]
    fn test_put_and_get_ranges() {
        let dir: TempDir = TempDir::new().unwrap();
        let cache: ContentCache = open_cache(dir.path());

        cache.put("abc", b"hello world").unwrap();

        assert_eq!(cache.get_content("abc", 0, 11).unwrap(), b"hello world");
        assert_eq!(cache.get_content("abc", 6, 5).unwrap(), b"world");
        // Clamped past the end, empty at/after the end.
        assert_eq!(cache.get_content("abc", 6, 100).unwrap(), b"world");
        assert_eq!(cache.get_content("abc", 11, 4).unwrap(), b"");
        // Miss.
        assert!(cache.get_content("missing", 0, 4).is_none());
    }

    #[test]
    fn test_put_is_idempotent() {
        let dir: TempDir = TempDir::new().unwrap();
        let cache: ContentCache = open_cache(dir.path());

        cache.put("k", b"data").unwrap();
        cache.put("k", b"data").unwrap();
        assert_eq!(cache.total_bytes(), 4);
    }

    #[test]
    fn test_entries_survive_reopen() {
        let dir: TempDir = TempDir::new().unwrap();
        {
            let cache: ContentCache = open_cache(dir.path());
            cache.put("persisted", b"payload").unwrap();
        }
        let cache: ContentCache = open_cache(dir.path());
        assert_eq!(cache.get_content("persisted", 0, 7).unwrap(), b"payload");
        assert_eq!(cache.total_bytes(), 7);
    }

    #[test]
    fn test_partial_writes_discarded_on_open() {
        let dir: TempDir = TempDir::new().unwrap();
        fs::write(dir.path().join("half-written.123.0.tmp"), b"junk").unwrap();

        let cache: ContentCache = open_cache(dir.path());
        assert_eq!(cache.total_bytes(), 0);
        assert!(cache.get_content("half-written", 0, 4).is_none());
        assert!(!dir.path().join("half-written.123.0.tmp").exists());
    }

    #[test]
    fn test_lru_eviction() {
        let dir: TempDir = TempDir::new().unwrap();
        let cache: ContentCache =
            ContentCache::open(ContentCacheConfig::new(dir.path()).with_ceiling(10)).unwrap();

        cache.put("a", b"xxxx").unwrap();
        cache.put("b", b"yyyy").unwrap();
        // Touch "a" so "b" becomes the eviction candidate.
        cache.get_content("a", 0, 1).unwrap();
        cache.put("c", b"zzzz").unwrap();

        assert!(cache.get_content("a", 0, 4).is_some());
        assert!(cache.get_content("b", 0, 4).is_none());
        assert!(cache.get_content("c", 0, 4).is_some());
        assert!(cache.total_bytes() <= 10);
    }

    #[tokio::test]
    async fn test_fetch_or_insert_populates() {
        let dir: TempDir = TempDir::new().unwrap();
        let cache: ContentCache = open_cache(dir.path());

        let bytes = cache
            .fetch_or_insert("k", || async { Ok(b"fetched".to_vec()) })
            .await
            .unwrap();
        assert_eq!(bytes.as_slice(), b"fetched");
        assert_eq!(cache.get_content("k", 0, 7).unwrap(), b"fetched");
    }

    #[tokio::test]
    async fn test_single_flight_dedupes_fetches() {
        let dir: TempDir = TempDir::new().unwrap();
        let cache: Arc<ContentCache> = Arc::new(open_cache(dir.path()));
        let calls: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .fetch_or_insert("shared", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        Ok(b"block".to_vec())
                    })
                    .await
                    .unwrap()
            }));
        }

        for task in tasks {
            assert_eq!(task.await.unwrap().as_slice(), b"block");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_fetch_does_not_poison() {
        let dir: TempDir = TempDir::new().unwrap();
        let cache: ContentCache = open_cache(dir.path());

        let first = cache
            .fetch_or_insert("k", || async {
                Err::<Vec<u8>, StorageError>(StorageError::backend("boom"))
            })
            .await;
        assert!(first.is_err());

        let second = cache
            .fetch_or_insert("k", || async { Ok(b"ok".to_vec()) })
            .await
            .unwrap();
        assert_eq!(second.as_slice(), b"ok");
    }
}
