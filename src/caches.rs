//! Process-local caches interposed on the read path.
//!
//! Five bounded LRUs, each behind its own lock so multi-threaded readers
//! contend only on the cache they touch:
//!
//! - `bases`: reconstructed pack payloads keyed by `(pack, offset)`,
//!   shared between top-level reads and delta-base reuse.
//! - `values`: fully decoded objects keyed by OID.
//! - `packs`: open pack readers (mmap handles) keyed by pack digest.
//! - `indexes`: open pack indexes keyed by pack digest.
//! - `revindexes`: per-pack offset-to-OID maps keyed by pack digest.
//!
//! Entries weigh 1 regardless of byte size; capacity is an entry count.
//! Every cache may be dropped at any time without affecting correctness —
//! reads repopulate them.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use ahash::AHashMap;
use lru::LruCache;

use crate::object::{Object, ObjectKind};
use crate::object_id::ObjectId;
use crate::pack_idx::PackIndex;
use crate::pack_reader::PackReader;

/// Default capacity for each cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 5;

/// Reconstructed object bytes as cached by the pack layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectBytes {
    /// Resolved object kind.
    pub kind: ObjectKind,
    /// Inflated payload.
    pub data: Vec<u8>,
}

/// Per-cache capacities.
#[derive(Clone, Copy, Debug)]
pub struct CacheConfig {
    /// Intermediate delta bases, keyed by `(pack, offset)`.
    pub bases: usize,
    /// Decoded top-level objects.
    pub values: usize,
    /// Open pack readers.
    pub packs: usize,
    /// Open pack indexes.
    pub indexes: usize,
    /// Per-pack reverse indexes.
    pub revindexes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            bases: DEFAULT_CACHE_CAPACITY,
            values: DEFAULT_CACHE_CAPACITY,
            packs: DEFAULT_CACHE_CAPACITY,
            indexes: DEFAULT_CACHE_CAPACITY,
            revindexes: DEFAULT_CACHE_CAPACITY,
        }
    }
}

/// The store's cache set.
pub struct StoreCaches {
    bases: Mutex<LruCache<(ObjectId, u64), Arc<ObjectBytes>>>,
    values: Mutex<LruCache<ObjectId, Arc<Object>>>,
    packs: Mutex<LruCache<ObjectId, Arc<PackReader>>>,
    indexes: Mutex<LruCache<ObjectId, Arc<PackIndex>>>,
    revindexes: Mutex<LruCache<ObjectId, Arc<AHashMap<u64, ObjectId>>>>,
}

impl std::fmt::Debug for StoreCaches {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StoreCaches(bases, values, packs, indexes, revindexes)")
    }
}

fn bounded(capacity: usize) -> NonZeroUsize {
    NonZeroUsize::new(capacity.max(1)).expect("clamped to at least 1")
}

impl StoreCaches {
    /// Creates the cache set with the given capacities.
    ///
    /// Zero capacities are clamped to one entry.
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self {
            bases: Mutex::new(LruCache::new(bounded(config.bases))),
            values: Mutex::new(LruCache::new(bounded(config.values))),
            packs: Mutex::new(LruCache::new(bounded(config.packs))),
            indexes: Mutex::new(LruCache::new(bounded(config.indexes))),
            revindexes: Mutex::new(LruCache::new(bounded(config.revindexes))),
        }
    }

    /// Looks up a reconstructed payload by pack and offset.
    pub fn base_get(&self, pack: &ObjectId, offset: u64) -> Option<Arc<ObjectBytes>> {
        self.bases
            .lock()
            .expect("bases cache poisoned")
            .get(&(*pack, offset))
            .cloned()
    }

    /// Caches a reconstructed payload.
    pub fn base_put(&self, pack: &ObjectId, offset: u64, bytes: Arc<ObjectBytes>) {
        self.bases
            .lock()
            .expect("bases cache poisoned")
            .put((*pack, offset), bytes);
    }

    /// Looks up a decoded object by OID.
    pub fn value_get(&self, oid: &ObjectId) -> Option<Arc<Object>> {
        self.values
            .lock()
            .expect("values cache poisoned")
            .get(oid)
            .cloned()
    }

    /// Caches a decoded object.
    pub fn value_put(&self, oid: &ObjectId, object: Arc<Object>) {
        self.values
            .lock()
            .expect("values cache poisoned")
            .put(*oid, object);
    }

    /// Drops a decoded object, e.g. after `reset`.
    pub fn value_drop(&self, oid: &ObjectId) {
        self.values.lock().expect("values cache poisoned").pop(oid);
    }

    /// Looks up an open pack reader.
    pub fn pack_get(&self, pack: &ObjectId) -> Option<Arc<PackReader>> {
        self.packs
            .lock()
            .expect("packs cache poisoned")
            .get(pack)
            .cloned()
    }

    /// Caches an open pack reader.
    pub fn pack_put(&self, pack: &ObjectId, reader: Arc<PackReader>) {
        self.packs
            .lock()
            .expect("packs cache poisoned")
            .put(*pack, reader);
    }

    /// Looks up an open index.
    pub fn index_get(&self, pack: &ObjectId) -> Option<Arc<PackIndex>> {
        self.indexes
            .lock()
            .expect("indexes cache poisoned")
            .get(pack)
            .cloned()
    }

    /// Caches an open index.
    pub fn index_put(&self, pack: &ObjectId, index: Arc<PackIndex>) {
        self.indexes
            .lock()
            .expect("indexes cache poisoned")
            .put(*pack, index);
    }

    /// Looks up a pack's reverse index.
    pub fn revindex_get(&self, pack: &ObjectId) -> Option<Arc<AHashMap<u64, ObjectId>>> {
        self.revindexes
            .lock()
            .expect("revindexes cache poisoned")
            .get(pack)
            .cloned()
    }

    /// Caches a pack's reverse index.
    pub fn revindex_put(&self, pack: &ObjectId, rev: Arc<AHashMap<u64, ObjectId>>) {
        self.revindexes
            .lock()
            .expect("revindexes cache poisoned")
            .put(*pack, rev);
    }

    /// Drops every cached entry in all five caches.
    pub fn clear(&self) {
        self.bases.lock().expect("bases cache poisoned").clear();
        self.values.lock().expect("values cache poisoned").clear();
        self.packs.lock().expect("packs cache poisoned").clear();
        self.indexes.lock().expect("indexes cache poisoned").clear();
        self.revindexes
            .lock()
            .expect("revindexes cache poisoned")
            .clear();
    }

    /// Drops entries tied to one pack, e.g. after a repack retires it.
    pub fn evict_pack(&self, pack: &ObjectId) {
        self.packs.lock().expect("packs cache poisoned").pop(pack);
        self.indexes
            .lock()
            .expect("indexes cache poisoned")
            .pop(pack);
        self.revindexes
            .lock()
            .expect("revindexes cache poisoned")
            .pop(pack);

        let mut bases = self.bases.lock().expect("bases cache poisoned");
        let stale: Vec<(ObjectId, u64)> = bases
            .iter()
            .filter(|((p, _), _)| p == pack)
            .map(|(key, _)| *key)
            .collect();
        for key in stale {
            bases.pop(&key);
        }
    }
}
