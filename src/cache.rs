//! Persistent, content-addressed store for transform outputs.
//!
//! Keys are derived from the transform identity, its configuration version
//! and a content hash of the input, never from paths or timestamps. A lookup
//! therefore can't return a stale value for changed input: changed input
//! means a different key.
//!
//! The on-disk layout follows the same scheme the image pipeline always used:
//!
//! ```text
//! .cache/tsumugi/<key>            transformed bytes
//! .cache/tsumugi/<key>.meta.cbor  size and creation time
//! ```

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::core::Hash32;
use crate::error::CacheError;
use crate::transform::Transform;

/// Default cache directory, relative to the project root.
pub const DIR_CACHE: &str = ".cache/tsumugi";

const META_SUFFIX: &str = ".meta.cbor";
const WRITE_STRIPES: usize = 64;

/// Content-addressed cache key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(Hash32);

impl CacheKey {
    /// Derives a key from a transform identity, the version tag of its
    /// configuration, and the content hash of its input.
    pub fn derive(identity: &str, version: &str, input: Hash32) -> Self {
        let mut hasher = blake3::Hasher::new();

        // Length prefixes keep ("ab", "c") and ("a", "bc") apart.
        for part in [identity.as_bytes(), version.as_bytes()] {
            hasher.update(&(part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        hasher.update(input.as_bytes());

        CacheKey(hasher.finalize().into())
    }

    pub fn for_transform(transform: &dyn Transform, fingerprint: Hash32) -> Self {
        Self::derive(transform.identity(), &transform.version(), fingerprint)
    }

    pub fn to_hex(self) -> String {
        self.0.to_hex()
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        Hash32::from_hex(hex).map(CacheKey)
    }
}

impl std::fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CacheKey({})", self.0.to_hex())
    }
}

/// Metadata stored next to every entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMeta {
    pub size: u64,
    /// Creation time in seconds since the Unix epoch.
    pub created: u64,
}

/// A cached value together with its metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub data: Vec<u8>,
    pub meta: EntryMeta,
}

impl CacheEntry {
    pub fn new(data: Vec<u8>) -> Self {
        let created = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        Self {
            meta: EntryMeta {
                size: data.len() as u64,
                created,
            },
            data,
        }
    }
}

/// Physical storage behind a [`CacheStore`].
pub trait CacheBackend: Send + Sync {
    fn read(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError>;

    fn write(&self, key: &CacheKey, entry: &CacheEntry) -> Result<(), CacheError>;

    fn remove(&self, key: &CacheKey) -> Result<(), CacheError>;

    /// Every stored key with its metadata, used to rebuild the LRU index.
    fn list(&self) -> Result<Vec<(CacheKey, EntryMeta)>, CacheError>;
}

/// Stores entries as files in a directory.
#[derive(Debug, Clone)]
pub struct DiskBackend {
    dir: Utf8PathBuf,
}

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

impl DiskBackend {
    pub fn new(dir: impl Into<Utf8PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    fn path_data(&self, key: &CacheKey) -> Utf8PathBuf {
        self.dir.join(key.to_hex())
    }

    fn path_meta(&self, key: &CacheKey) -> Utf8PathBuf {
        self.dir.join(format!("{}{META_SUFFIX}", key.to_hex()))
    }

    /// Writes through a temporary file and renames it into place, so a
    /// reader never observes a partially written file.
    fn write_atomic(
        &self,
        path: &Utf8Path,
        write: impl FnOnce(&mut BufWriter<File>) -> std::io::Result<()>,
    ) -> std::io::Result<()> {
        let temp = self.dir.join(format!(
            ".tmp-{}-{}",
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));

        let result = (|| {
            let mut writer = BufWriter::new(File::create(&temp)?);
            write(&mut writer)?;
            writer.flush()?;
            drop(writer);
            fs::rename(&temp, path)
        })();

        if result.is_err() {
            fs::remove_file(&temp).ok();
        }

        result
    }
}

impl CacheBackend for DiskBackend {
    fn read(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let data = match fs::read(self.path_data(key)) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let file = match File::open(self.path_meta(key)) {
            Ok(file) => file,
            // Data without metadata is an interrupted write.
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let meta: EntryMeta = ciborium::from_reader(BufReader::new(file))
            .map_err(|_| CacheError::Metadata(key.to_hex()))?;

        if meta.size != data.len() as u64 {
            return Err(CacheError::Metadata(key.to_hex()));
        }

        Ok(Some(CacheEntry { data, meta }))
    }

    fn write(&self, key: &CacheKey, entry: &CacheEntry) -> Result<(), CacheError> {
        fs::create_dir_all(&self.dir)?;

        self.write_atomic(&self.path_data(key), |w| w.write_all(&entry.data))?;
        self.write_atomic(&self.path_meta(key), |w| {
            ciborium::into_writer(&entry.meta, w).map_err(std::io::Error::other)
        })?;

        Ok(())
    }

    fn remove(&self, key: &CacheKey) -> Result<(), CacheError> {
        for path in [self.path_meta(key), self.path_data(key)] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }

    fn list(&self) -> Result<Vec<(CacheKey, EntryMeta)>, CacheError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };

        let mut found = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(hex) = name.to_str().and_then(|n| n.strip_suffix(META_SUFFIX)) else {
                continue;
            };
            let Some(key) = CacheKey::from_hex(hex) else {
                continue;
            };

            let file = BufReader::new(File::open(entry.path())?);
            match ciborium::from_reader::<EntryMeta, _>(file) {
                Ok(meta) => found.push((key, meta)),
                Err(_) => tracing::warn!("skipping corrupt cache metadata {hex}"),
            }
        }

        Ok(found)
    }
}

/// Keeps entries in process memory. Useful for tests and throwaway builds.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    map: Mutex<HashMap<CacheKey, CacheEntry>>,
}

impl MemoryBackend {
    fn map(&self) -> Result<MutexGuard<'_, HashMap<CacheKey, CacheEntry>>, CacheError> {
        self.map
            .lock()
            .map_err(|_| CacheError::Unavailable("memory backend poisoned".into()))
    }
}

impl CacheBackend for MemoryBackend {
    fn read(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.map()?.get(key).cloned())
    }

    fn write(&self, key: &CacheKey, entry: &CacheEntry) -> Result<(), CacheError> {
        self.map()?.insert(*key, entry.clone());
        Ok(())
    }

    fn remove(&self, key: &CacheKey) -> Result<(), CacheError> {
        self.map()?.remove(key);
        Ok(())
    }

    fn list(&self) -> Result<Vec<(CacheKey, EntryMeta)>, CacheError> {
        Ok(self.map()?.iter().map(|(k, v)| (*k, v.meta)).collect())
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    size: u64,
    used: u64,
}

#[derive(Debug, Default)]
struct Index {
    slots: HashMap<CacheKey, Slot>,
    pins: HashMap<CacheKey, usize>,
    total: u64,
    tick: u64,
}

impl Index {
    fn touch(&mut self, key: CacheKey, size: u64) {
        self.tick += 1;
        let tick = self.tick;

        match self.slots.get_mut(&key) {
            Some(slot) => {
                self.total = self.total - slot.size + size;
                slot.size = size;
                slot.used = tick;
            }
            None => {
                self.total += size;
                self.slots.insert(key, Slot { size, used: tick });
            }
        }
    }

    fn forget(&mut self, key: &CacheKey) {
        if let Some(slot) = self.slots.remove(key) {
            self.total -= slot.size;
        }
    }

    /// Least recently used key that nobody holds a lease on.
    fn victim(&self) -> Option<CacheKey> {
        self.slots
            .iter()
            .filter(|(key, _)| !self.pins.contains_key(key))
            .min_by_key(|(_, slot)| slot.used)
            .map(|(key, _)| *key)
    }
}

/// Cache hit and miss counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
}

/// The content-addressed transform cache.
///
/// Safe for concurrent use from parallel tasks. Physical writes of the same
/// key are serialised, and entries pinned through [`acquire`](Self::acquire)
/// are never evicted while the lease is alive.
pub struct CacheStore {
    backend: Box<dyn CacheBackend>,
    capacity: Option<u64>,
    index: Mutex<Index>,
    stripes: Vec<Mutex<()>>,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
}

impl CacheStore {
    /// Opens a disk-backed store in `dir`, indexing whatever it already holds.
    pub fn open(dir: impl Into<Utf8PathBuf>) -> Result<Self, CacheError> {
        Self::with_backend(DiskBackend::new(dir))
    }

    /// Creates a store that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryBackend::default()))
    }

    pub fn with_backend(backend: impl CacheBackend + 'static) -> Result<Self, CacheError> {
        let store = Self::new(Box::new(backend));

        let mut entries = store.backend.list()?;
        entries.sort_by_key(|(_, meta)| meta.created);

        let mut index = store.lock_index();
        for (key, meta) in entries {
            index.touch(key, meta.size);
        }
        drop(index);

        Ok(store)
    }

    fn new(backend: Box<dyn CacheBackend>) -> Self {
        Self {
            backend,
            capacity: None,
            index: Mutex::default(),
            stripes: (0..WRITE_STRIPES).map(|_| Mutex::new(())).collect(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Caps the total size of stored values, evicting least recently used
    /// entries once the cap is exceeded.
    pub fn with_capacity(mut self, bytes: u64) -> Self {
        self.capacity = Some(bytes);
        self
    }

    fn lock_index(&self) -> MutexGuard<'_, Index> {
        // The index is bookkeeping only; a panic elsewhere can't leave it in
        // a state worse than slightly inaccurate sizes.
        self.index.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Pins `key` for the lifetime of the returned lease.
    pub fn acquire(&self, key: CacheKey) -> CacheLease<'_> {
        *self.lock_index().pins.entry(key).or_default() += 1;
        CacheLease { store: self, key }
    }

    fn release(&self, key: &CacheKey) {
        let mut index = self.lock_index();
        if let Some(count) = index.pins.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                index.pins.remove(key);
            }
        }
    }

    /// Looks up a key. Backend failures are logged and treated as a miss.
    pub fn get(&self, key: &CacheKey) -> Option<Vec<u8>> {
        match self.try_get(key) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("cache read failed, treating as miss: {e}");
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn try_get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, CacheError> {
        match self.backend.read(key)? {
            Some(entry) => {
                self.lock_index().touch(*key, entry.meta.size);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(entry.data))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    /// Stores a value. Backend failures are logged and otherwise ignored.
    pub fn put(&self, key: &CacheKey, data: Vec<u8>) {
        if let Err(e) = self.try_put(key, data) {
            tracing::warn!("cache write failed: {e}");
        }
    }

    pub fn try_put(&self, key: &CacheKey, data: Vec<u8>) -> Result<(), CacheError> {
        let entry = CacheEntry::new(data);

        {
            let stripe = key.0.as_bytes()[0] as usize % self.stripes.len();
            let _guard = self.stripes[stripe].lock().unwrap_or_else(|e| e.into_inner());
            self.backend.write(key, &entry)?;
        }

        self.writes.fetch_add(1, Ordering::Relaxed);
        self.lock_index().touch(*key, entry.meta.size);
        self.evict();

        Ok(())
    }

    fn evict(&self) {
        let Some(capacity) = self.capacity else {
            return;
        };

        let mut index = self.lock_index();
        while index.total > capacity {
            let Some(victim) = index.victim() else {
                break;
            };

            if let Err(e) = self.backend.remove(&victim) {
                tracing::warn!("couldn't evict cache entry {victim:?}: {e}");
            }
            index.forget(&victim);
        }
    }

    pub fn len(&self) -> usize {
        self.lock_index().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total size in bytes of all indexed values.
    pub fn size(&self) -> u64 {
        self.lock_index().total
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("capacity", &self.capacity)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// Keeps a cache entry safe from eviction while a build depends on it.
#[must_use]
pub struct CacheLease<'a> {
    store: &'a CacheStore,
    key: CacheKey,
}

impl CacheLease<'_> {
    pub fn key(&self) -> CacheKey {
        self.key
    }

    pub fn get(&self) -> Option<Vec<u8>> {
        self.store.get(&self.key)
    }

    pub fn put(&self, data: Vec<u8>) {
        self.store.put(&self.key, data)
    }
}

impl Drop for CacheLease<'_> {
    fn drop(&mut self) {
        self.store.release(&self.key);
    }
}
