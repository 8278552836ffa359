//! Bounded on-disk media cache with least-recently-used eviction
//!
//! One cache directory exists per process. [`shared`] creates it on first use
//! and hands the same instance to every later caller; sessions never need to
//! coordinate with each other, the cache keeps its own index consistent.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::CacheError;
use crate::transport::ByteRange;

/// Default capacity: 200 MB
pub const DEFAULT_CAPACITY: u64 = 200 * 1024 * 1024;

const INDEX_FILE: &str = "index.json";

/// Index changes (writes and access bumps) batched before the index is saved
const PERSIST_EVERY: u32 = 32;

/// Cache entry identity: resolved source URI plus byte range
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub uri: String,
    pub range: ByteRange,
}

impl CacheKey {
    pub fn new(uri: &str, range: ByteRange) -> Self {
        Self { uri: uri.to_string(), range }
    }

    /// Stable identifier, also used as the entry's file name
    pub fn id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.uri.as_bytes());
        hasher.update(b"#");
        hasher.update(self.range.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Storage for cached media bytes. Implementations must be safe to read from
/// several sessions at once.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, CacheError>;
    fn put(&self, key: &CacheKey, data: &[u8]) -> Result<(), CacheError>;
    fn remove(&self, key: &CacheKey) -> Result<(), CacheError>;
    fn used_bytes(&self) -> u64;
    fn capacity(&self) -> u64;
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexEntry {
    size: u64,
    last_access: AtomicU64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheIndex {
    clock: AtomicU64,
    entries: HashMap<String, IndexEntry>,
}

impl CacheIndex {
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn used(&self) -> u64 {
        self.entries.values().map(|e| e.size).sum()
    }

    fn least_recently_used(&self, keep: &str) -> Option<String> {
        self.entries
            .iter()
            .filter(|(id, _)| id.as_str() != keep)
            .min_by_key(|(_, e)| e.last_access.load(Ordering::Relaxed))
            .map(|(id, _)| id.clone())
    }
}

/// Disk cache: one file per entry plus a JSON index of sizes and access order.
///
/// Writes and reads update the in-memory index right away but the index file
/// is rewritten only every few changes, on removals, on [`LruDiskCache::flush`]
/// and on drop. Entry files the saved index does not know about are adopted
/// as least recently used when the cache is opened again.
pub struct LruDiskCache {
    dir: PathBuf,
    capacity: u64,
    index: RwLock<CacheIndex>,
    unsaved: AtomicU32,
}

impl LruDiskCache {
    /// Open (or create) a cache directory. An unreadable index starts the
    /// cache empty instead of failing.
    pub fn open(dir: &Path, capacity: u64) -> Result<Self, CacheError> {
        fs::create_dir_all(dir)?;

        let index_path = dir.join(INDEX_FILE);
        let mut index = match fs::read_to_string(&index_path) {
            Ok(content) => serde_json::from_str::<CacheIndex>(&content).unwrap_or_else(|e| {
                warn!("Media cache index at {} is unreadable, starting empty: {}", index_path.display(), e);
                CacheIndex::default()
            }),
            Err(_) => CacheIndex::default(),
        };

        // Drop entries whose files went missing
        index.entries.retain(|id, entry| {
            fs::metadata(dir.join(id)).map(|m| m.len() == entry.size).unwrap_or(false)
        });
        adopt_unindexed(dir, &mut index)?;

        let cache = Self {
            dir: dir.to_path_buf(),
            capacity,
            index: RwLock::new(index),
            unsaved: AtomicU32::new(0),
        };
        {
            let mut index = cache.index.write().unwrap_or_else(PoisonError::into_inner);
            cache.evict(&mut index, "");
            cache.persist(&index)?;
            info!(
                "Media cache ready at {} ({} entries, {} of {} bytes)",
                cache.dir.display(),
                index.entries.len(),
                index.used(),
                capacity
            );
        }
        Ok(cache)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> usize {
        self.index.read().unwrap_or_else(PoisonError::into_inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry_path(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }

    /// Write the index file now
    pub fn flush(&self) -> Result<(), CacheError> {
        let index = self.index.write().unwrap_or_else(PoisonError::into_inner);
        self.persist(&index)
    }

    /// Callers hold the write lock, so only one index write runs at a time
    fn persist(&self, index: &CacheIndex) -> Result<(), CacheError> {
        let content = serde_json::to_string(index)?;
        let tmp = self.dir.join(format!("{}.tmp", INDEX_FILE));
        fs::write(&tmp, content)?;
        fs::rename(&tmp, self.dir.join(INDEX_FILE))?;
        self.unsaved.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Count one index change; true once a save is due
    fn note_change(&self) -> bool {
        self.unsaved.fetch_add(1, Ordering::Relaxed) + 1 >= PERSIST_EVERY
    }

    fn evict(&self, index: &mut CacheIndex, keep: &str) {
        while index.used() > self.capacity {
            let Some(victim) = index.least_recently_used(keep) else { break };
            index.entries.remove(&victim);
            if let Err(e) = fs::remove_file(self.entry_path(&victim)) {
                debug!("Evicted cache entry {} had no file: {}", victim, e);
            }
        }
    }

    fn discard(&self, id: &str) {
        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
        if index.entries.remove(id).is_some() {
            let _ = fs::remove_file(self.entry_path(id));
            if let Err(e) = self.persist(&index) {
                warn!("Could not update media cache index: {}", e);
            }
        }
    }
}

impl CacheStore for LruDiskCache {
    fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, CacheError> {
        let id = key.id();
        let read = {
            let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
            let Some(entry) = index.entries.get(&id) else {
                return Ok(None);
            };
            entry.last_access.store(index.tick(), Ordering::Relaxed);
            fs::read(self.entry_path(&id)).map(|data| (data, entry.size))
        };

        match read {
            Ok((data, size)) if data.len() as u64 == size => {
                if self.note_change() {
                    if let Err(e) = self.flush() {
                        warn!("Could not update media cache index: {}", e);
                    }
                }
                Ok(Some(data))
            }
            Ok((data, size)) => {
                self.discard(&id);
                Err(CacheError::Corrupt(format!("{} ({} bytes, expected {})", id, data.len(), size)))
            }
            Err(e) => {
                self.discard(&id);
                Err(CacheError::Corrupt(format!("{} ({})", id, e)))
            }
        }
    }

    fn put(&self, key: &CacheKey, data: &[u8]) -> Result<(), CacheError> {
        let size = data.len() as u64;
        if size > self.capacity {
            debug!("Not caching {} bytes for {}: larger than the cache", size, key.uri);
            return Ok(());
        }

        let id = key.id();
        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);

        let tmp = self.dir.join(format!("{}.part", id));
        fs::write(&tmp, data)?;
        fs::rename(&tmp, self.entry_path(&id))?;

        let access = index.tick();
        index.entries.insert(id.clone(), IndexEntry { size, last_access: AtomicU64::new(access) });
        self.evict(&mut index, &id);
        if self.note_change() {
            self.persist(&index)?;
        }
        Ok(())
    }

    fn remove(&self, key: &CacheKey) -> Result<(), CacheError> {
        let id = key.id();
        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
        if index.entries.remove(&id).is_some() {
            let _ = fs::remove_file(self.entry_path(&id));
            self.persist(&index)?;
        }
        Ok(())
    }

    fn used_bytes(&self) -> u64 {
        self.index.read().unwrap_or_else(PoisonError::into_inner).used()
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }
}

impl Drop for LruDiskCache {
    fn drop(&mut self) {
        if self.unsaved.load(Ordering::Relaxed) > 0 {
            if let Err(e) = self.flush() {
                warn!("Could not save media cache index: {}", e);
            }
        }
    }
}

/// Entry files are named by the hex SHA-256 of their key
fn is_entry_name(name: &str) -> bool {
    name.len() == 64 && name.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Take in entry files written after the index was last saved, and clear out
/// half-written `.part` files.
fn adopt_unindexed(dir: &Path, index: &mut CacheIndex) -> Result<(), CacheError> {
    for dir_entry in fs::read_dir(dir)? {
        let dir_entry = dir_entry?;
        let name = dir_entry.file_name();
        let Some(name) = name.to_str() else { continue };

        if let Some(stem) = name.strip_suffix(".part") {
            if is_entry_name(stem) {
                let _ = fs::remove_file(dir_entry.path());
            }
            continue;
        }
        if !is_entry_name(name) || index.entries.contains_key(name) {
            continue;
        }
        let size = dir_entry.metadata()?.len();
        debug!("Adopting unindexed cache entry {} ({} bytes)", name, size);
        index.entries.insert(name.to_string(), IndexEntry { size, last_access: AtomicU64::new(0) });
    }
    Ok(())
}

/// In-memory store with the same LRU policy, for tests and cache-less setups
pub struct MemoryCache {
    capacity: u64,
    state: Mutex<(u64, HashMap<CacheKey, (Vec<u8>, u64)>)>,
}

impl MemoryCache {
    pub fn new(capacity: u64) -> Self {
        Self { capacity, state: Mutex::new((0, HashMap::new())) }
    }
}

impl CacheStore for MemoryCache {
    fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, CacheError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.0 += 1;
        let clock = state.0;
        Ok(state.1.get_mut(key).map(|(data, access)| {
            *access = clock;
            data.clone()
        }))
    }

    fn put(&self, key: &CacheKey, data: &[u8]) -> Result<(), CacheError> {
        if data.len() as u64 > self.capacity {
            return Ok(());
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.0 += 1;
        let clock = state.0;
        state.1.insert(key.clone(), (data.to_vec(), clock));
        loop {
            let used: u64 = state.1.values().map(|(d, _)| d.len() as u64).sum();
            if used <= self.capacity {
                break;
            }
            let victim = state
                .1
                .iter()
                .filter(|(k, _)| *k != key)
                .min_by_key(|(_, (_, access))| *access)
                .map(|(k, _)| k.clone());
            match victim {
                Some(victim) => {
                    state.1.remove(&victim);
                }
                None => break,
            }
        }
        Ok(())
    }

    fn remove(&self, key: &CacheKey) -> Result<(), CacheError> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).1.remove(key);
        Ok(())
    }

    fn used_bytes(&self) -> u64 {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.1.values().map(|(d, _)| d.len() as u64).sum()
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }
}

static SHARED: Mutex<Option<Arc<LruDiskCache>>> = Mutex::new(None);

/// The process-wide disk cache, created on first call. Later calls return the
/// same instance regardless of the arguments they pass.
pub fn shared(dir: &Path, capacity: u64) -> Result<Arc<LruDiskCache>, CacheError> {
    let mut slot = SHARED.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(cache) = slot.as_ref() {
        return Ok(Arc::clone(cache));
    }
    let cache = Arc::new(LruDiskCache::open(dir, capacity)?);
    *slot = Some(Arc::clone(&cache));
    Ok(cache)
}

/// Default cache location: `<cache dir>/xtreme_playback/media`
pub fn default_dir() -> PathBuf {
    let mut path = dirs::cache_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push("xtreme_playback");
    path.push("media");
    path
}

/// Where sessions get their cache from. Lets tests swap the process-wide
/// disk cache for something else.
pub trait CacheProvider: Send + Sync {
    fn cache(&self) -> Result<Arc<dyn CacheStore>, CacheError>;
}

/// Provider backed by [`shared`]
pub struct SharedDiskCache {
    pub dir: PathBuf,
    pub capacity: u64,
}

impl CacheProvider for SharedDiskCache {
    fn cache(&self) -> Result<Arc<dyn CacheStore>, CacheError> {
        let cache: Arc<dyn CacheStore> = shared(&self.dir, self.capacity)?;
        Ok(cache)
    }
}

/// Provider that always hands out one given store
pub struct FixedCache(pub Arc<dyn CacheStore>);

impl CacheProvider for FixedCache {
    fn cache(&self) -> Result<Arc<dyn CacheStore>, CacheError> {
        Ok(Arc::clone(&self.0))
    }
}
