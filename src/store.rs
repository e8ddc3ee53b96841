//! The store façade.
//!
//! Composes the loose backend, the pack engine, the reference store, the
//! cache set, and the buffer pools over one repository directory, and
//! routes every operation:
//!
//! - `read`/`size`/`contains` consult packs first, then loose files; a
//!   decoded object lands in the `values` cache.
//! - `write` serializes to a loose file (idempotent by digest).
//! - `ingest` runs the full pack ingestion pipeline.
//! - `repack` rewrites every live object into one fresh pack and retires
//!   the packs it supersedes.
//!
//! Opening a store creates the on-disk layout if absent and initializes
//! `HEAD` to `ref: refs/heads/master`.

use std::collections::HashSet;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::buffer_pool::{BufferPools, DEFAULT_POOL_BUFFERS};
use crate::caches::{CacheConfig, StoreCaches};
use crate::errors::StoreError;
use crate::fsys;
use crate::ingest::{self, IngestOptions, IngestOutcome};
use crate::loose::LooseStore;
use crate::object::{Object, ObjectKind};
use crate::object_id::{ObjectFormat, ObjectId};
use crate::pack_engine::PackEngine;
use crate::pack_reader::PackReadLimits;
use crate::pack_writer::{self, PackInput, PackOutcome, PackPlanOptions};
use crate::refs::RefStore;
use crate::tree_entry::EntryKind;

/// Options for opening a store.
#[derive(Clone, Copy, Debug)]
pub struct StoreOptions {
    /// Object ID format.
    pub format: ObjectFormat,
    /// Cache capacities.
    pub cache: CacheConfig,
    /// Pack read limits.
    pub read: PackReadLimits,
    /// Ingestion options.
    pub ingest: IngestOptions,
    /// Retained buffers per pack pool.
    pub pool_buffers: usize,
    /// Deflate level for loose files and pack bodies.
    pub compression_level: u32,
    /// Delta planner window for `make_pack` and `repack`.
    pub pack_window: usize,
    /// Delta planner depth cap.
    pub pack_depth: u32,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            format: ObjectFormat::Sha1,
            cache: CacheConfig::default(),
            read: PackReadLimits::default(),
            ingest: IngestOptions::default(),
            pool_buffers: DEFAULT_POOL_BUFFERS,
            compression_level: 6,
            pack_window: 10,
            pack_depth: 50,
        }
    }
}

/// A content-addressed object store over one repository directory.
#[derive(Debug)]
pub struct Store {
    root: PathBuf,
    opts: StoreOptions,
    loose: LooseStore,
    refs: RefStore,
    engine: PackEngine,
    caches: StoreCaches,
    pools: BufferPools,
}

impl Store {
    /// Opens (creating if needed) a store with default options.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Self::open_with(root, StoreOptions::default())
    }

    /// Opens (creating if needed) a store with explicit options.
    pub fn open_with(root: impl Into<PathBuf>, opts: StoreOptions) -> Result<Self, StoreError> {
        let root = root.into();
        create_layout(&root)?;

        let loose = LooseStore::new(
            root.join("objects"),
            root.join("tmp"),
            opts.format,
            opts.compression_level,
        );
        let refs = RefStore::new(root.clone(), root.join("tmp"));
        refs.init_head()?;
        let engine = PackEngine::open(root.join("objects/pack"), opts.format, opts.read)?;

        Ok(Self {
            loose,
            refs,
            engine,
            caches: StoreCaches::new(opts.cache),
            pools: BufferPools::new(opts.pool_buffers),
            root,
            opts,
        })
    }

    /// Returns the repository root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the object ID format.
    #[must_use]
    pub const fn format(&self) -> ObjectFormat {
        self.opts.format
    }

    /// Returns the reference store.
    #[must_use]
    pub fn refs(&self) -> &RefStore {
        &self.refs
    }

    /// Returns true if the object exists in any backend.
    pub fn contains(&self, oid: &ObjectId) -> Result<bool, StoreError> {
        if self.engine.contains(oid, &self.caches)? {
            return Ok(true);
        }
        Ok(self.loose.contains(oid))
    }

    /// Lists every object in the store, packed and loose, deduplicated.
    pub fn list(&self) -> Result<Vec<ObjectId>, StoreError> {
        let mut out = self.engine.list(&self.caches)?;
        out.extend(self.loose.list()?);
        out.sort();
        out.dedup();
        Ok(out)
    }

    /// Reads and decodes an object, pack first, then loose.
    pub fn read(&self, oid: &ObjectId) -> Result<Arc<Object>, StoreError> {
        if let Some(object) = self.caches.value_get(oid) {
            return Ok(object);
        }

        if let Some(bytes) = self
            .engine
            .read(oid, &self.caches, &self.pools, &self.loose)?
        {
            let object = Arc::new(Object::decode(bytes.kind, &bytes.data, self.opts.format)?);
            self.caches.value_put(oid, Arc::clone(&object));
            return Ok(object);
        }

        match self.loose.read(oid) {
            Ok(object) => {
                let object = Arc::new(object);
                self.caches.value_put(oid, Arc::clone(&object));
                Ok(object)
            }
            Err(crate::errors::LooseError::NotFound { .. }) => {
                Err(StoreError::NotFound { oid: *oid })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Reads an object's kind and inflated payload without decoding.
    ///
    /// Returns `Ok(None)` when the object is absent.
    pub fn read_inflated(
        &self,
        oid: &ObjectId,
    ) -> Result<Option<(ObjectKind, Vec<u8>)>, StoreError> {
        if let Some(bytes) = self
            .engine
            .read(oid, &self.caches, &self.pools, &self.loose)?
        {
            return Ok(Some((bytes.kind, bytes.data.clone())));
        }
        Ok(self.loose.read_inflated(oid)?)
    }

    /// Returns an object's inflated size, pack first, then loose.
    pub fn size(&self, oid: &ObjectId) -> Result<u64, StoreError> {
        if let Some(size) = self.engine.size(oid, &self.caches)? {
            return Ok(size);
        }
        match self.loose.size(oid) {
            Ok(size) => Ok(size),
            Err(crate::errors::LooseError::NotFound { .. }) => {
                Err(StoreError::NotFound { oid: *oid })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Returns an object's kind.
    pub fn kind(&self, oid: &ObjectId) -> Result<ObjectKind, StoreError> {
        if let Some(kind) = self
            .engine
            .kind(oid, &self.caches, &self.pools, &self.loose)?
        {
            return Ok(kind);
        }
        match self.loose.kind(oid) {
            Ok(kind) => Ok(kind),
            Err(crate::errors::LooseError::NotFound { .. }) => {
                Err(StoreError::NotFound { oid: *oid })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Writes an object loose; idempotent for equal objects.
    ///
    /// Returns the digest and the bytes written (zero when the object
    /// already existed).
    pub fn write(&self, object: &Object) -> Result<(ObjectId, u32), StoreError> {
        let (oid, written) = self.loose.write(object)?;
        self.caches.value_put(&oid, Arc::new(object.clone()));
        Ok((oid, written))
    }

    /// Writes an object from its kind and inflated payload.
    pub fn write_inflated(
        &self,
        kind: ObjectKind,
        payload: &[u8],
    ) -> Result<ObjectId, StoreError> {
        Ok(self.loose.write_inflated(kind, payload)?)
    }

    /// Reads every object in the store.
    pub fn contents(&self) -> Result<Vec<(ObjectId, Arc<Object>)>, StoreError> {
        let mut out = Vec::new();
        for oid in self.list()? {
            out.push((oid, self.read(&oid)?));
        }
        Ok(out)
    }

    /// Folds over the object graph reachable from `root`.
    ///
    /// Each object is visited exactly once, parents/entries after their
    /// referencing object. Gitlink tree entries reference other
    /// repositories and are skipped.
    pub fn fold<S>(
        &self,
        mut f: impl FnMut(S, &ObjectId, &Arc<Object>) -> S,
        start: S,
        root: &ObjectId,
    ) -> Result<S, StoreError> {
        let mut state = start;
        let mut visited: HashSet<ObjectId> = HashSet::new();
        let mut stack = vec![*root];

        while let Some(oid) = stack.pop() {
            if !visited.insert(oid) {
                continue;
            }
            let object = self.read(&oid)?;
            state = f(state, &oid, &object);

            match &*object {
                Object::Tree(tree) => {
                    for entry in &tree.entries {
                        if entry.kind() != EntryKind::Gitlink {
                            stack.push(entry.oid);
                        }
                    }
                }
                other => stack.extend(other.references()),
            }
        }
        Ok(state)
    }

    /// Visits the object graph reachable from `root`.
    pub fn iter(
        &self,
        mut f: impl FnMut(&ObjectId, &Arc<Object>),
        root: &ObjectId,
    ) -> Result<(), StoreError> {
        self.fold(
            |(), oid, object| {
                f(oid, object);
            },
            (),
            root,
        )
    }

    /// Ingests a pack stream and registers the resulting pack.
    pub fn ingest(&self, source: &mut dyn Read) -> Result<IngestOutcome, StoreError> {
        Ok(ingest::ingest_pack(
            source,
            &self.root.join("tmp"),
            &self.root.join("objects/pack"),
            self.opts.format,
            &self.opts.ingest,
            &self.engine,
            &self.caches,
            &self.pools,
            &self.loose,
        )?)
    }

    /// Encodes the given objects into a pack stream written to `sink`.
    ///
    /// Returns the pack digest and per-object index records once the
    /// stream is fully written.
    pub fn make_pack(
        &self,
        oids: &[ObjectId],
        sink: &mut dyn Write,
    ) -> Result<PackOutcome, StoreError> {
        self.make_pack_with(oids, self.opts.pack_window, self.opts.pack_depth, sink)
    }

    /// `make_pack` with explicit planner window and depth bounds.
    pub fn make_pack_with(
        &self,
        oids: &[ObjectId],
        window: usize,
        depth: u32,
        sink: &mut dyn Write,
    ) -> Result<PackOutcome, StoreError> {
        let mut inputs = Vec::with_capacity(oids.len());
        for oid in oids {
            let (kind, payload) = self
                .read_inflated(oid)?
                .ok_or(StoreError::NotFound { oid: *oid })?;
            inputs.push(PackInput::new(kind, payload));
        }
        let opts = PackPlanOptions {
            window,
            max_depth: depth,
            ..self.plan_options()
        };
        Ok(pack_writer::write_pack(inputs, &opts, sink)?)
    }

    /// Rewrites every live object into one pack and retires the old ones.
    ///
    /// Loose files stay in place (packs are read-preferred); superseded
    /// packs and their indexes are deleted. Returns the new pack digest,
    /// or `None` when the store is empty.
    pub fn repack(&self) -> Result<Option<ObjectId>, StoreError> {
        let oids = self.list()?;
        if oids.is_empty() {
            return Ok(None);
        }
        let before = self.engine.pack_digests();

        let mut pack_bytes = Vec::new();
        self.make_pack(&oids, &mut pack_bytes)?;
        let outcome = self.ingest(&mut Cursor::new(pack_bytes))?;

        let superseded: Vec<ObjectId> = before
            .into_iter()
            .filter(|digest| *digest != outcome.pack_digest)
            .collect();
        self.engine.retire_packs(&superseded, &self.caches)?;

        debug!(pack = %outcome.pack_digest, objects = outcome.object_count, "repacked");
        Ok(Some(outcome.pack_digest))
    }

    /// Verifies a pack's index fidelity: every indexed entry must
    /// reconstruct to bytes hashing to its OID.
    pub fn verify_pack(&self, pack: &ObjectId) -> Result<(), StoreError> {
        Ok(self
            .engine
            .verify_pack(pack, &self.caches, &self.pools, &self.loose)?)
    }

    /// Returns the digests of the registered packs.
    #[must_use]
    pub fn pack_digests(&self) -> Vec<ObjectId> {
        self.engine.pack_digests()
    }

    /// Drops every cache entry and pooled buffer.
    pub fn clear_caches(&self) {
        self.caches.clear();
        self.pools.clear();
    }

    /// Truncates `objects/` and `refs/` and re-initializes the layout.
    ///
    /// All objects, packs, and references are gone afterwards; `HEAD` is
    /// restored to its default.
    pub fn reset(&self) -> Result<(), StoreError> {
        for dir in ["objects", "refs", "tmp"] {
            let path = self.root.join(dir);
            if path.is_dir() {
                std::fs::remove_dir_all(&path).map_err(|e| {
                    StoreError::Fs(crate::fsys::FsError::new("rmdir", &path, e))
                })?;
            }
        }
        fsys::remove_file_idempotent(&self.root.join("packed-refs"))?;
        fsys::remove_file_idempotent(&self.root.join("HEAD"))?;

        create_layout(&self.root)?;
        self.refs.invalidate_shadow();
        self.refs.init_head()?;
        self.engine.reload()?;
        self.clear_caches();
        Ok(())
    }

    fn plan_options(&self) -> PackPlanOptions {
        PackPlanOptions {
            window: self.opts.pack_window,
            max_depth: self.opts.pack_depth,
            level: self.opts.compression_level,
            format: self.opts.format,
        }
    }
}

/// Creates the persisted directory layout.
fn create_layout(root: &Path) -> Result<(), StoreError> {
    for dir in ["objects", "objects/pack", "objects/info", "refs", "tmp"] {
        fsys::create_dir_all(&root.join(dir))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    struct TempStore {
        root: PathBuf,
        store: Store,
    }

    impl TempStore {
        fn new(tag: &str) -> Self {
            let root = std::env::temp_dir().join(format!(
                "odb-store-{tag}-{}-{:?}",
                std::process::id(),
                std::thread::current().id()
            ));
            let _ = fs::remove_dir_all(&root);
            let store = Store::open(&root).unwrap();
            Self { root, store }
        }
    }

    impl Drop for TempStore {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.root);
        }
    }

    #[test]
    fn open_creates_layout_and_head() {
        let t = TempStore::new("layout");
        for dir in ["objects", "objects/pack", "objects/info", "refs", "tmp"] {
            assert!(t.root.join(dir).is_dir(), "{dir} missing");
        }
        assert_eq!(
            fs::read(t.root.join("HEAD")).unwrap(),
            b"ref: refs/heads/master\n"
        );
    }

    #[test]
    fn write_then_read_round_trips() {
        let t = TempStore::new("rw");
        let blob = Object::Blob(b"hello\n".to_vec());
        let (oid, _) = t.store.write(&blob).unwrap();
        assert_eq!(oid.to_hex(), "ce013625030ba8dba906f756967f9e9ca394464a");
        assert_eq!(&*t.store.read(&oid).unwrap(), &blob);
        assert_eq!(t.store.size(&oid).unwrap(), 6);
        assert_eq!(t.store.kind(&oid).unwrap(), ObjectKind::Blob);
    }

    #[test]
    fn missing_object_is_not_found() {
        let t = TempStore::new("missing");
        let oid = ObjectId::sha1([0xab; 20]);
        assert!(!t.store.contains(&oid).unwrap());
        assert!(matches!(
            t.store.read(&oid),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn reset_truncates_everything() {
        let t = TempStore::new("reset");
        let (oid, _) = t.store.write(&Object::Blob(b"doomed".to_vec())).unwrap();
        t.store
            .refs()
            .write_oid("refs/heads/main", &oid)
            .unwrap();

        t.store.reset().unwrap();
        assert!(t.store.list().unwrap().is_empty());
        assert!(!t.store.contains(&oid).unwrap());
        assert!(!t.store.refs().contains("refs/heads/main"));
        assert_eq!(
            fs::read(t.root.join("HEAD")).unwrap(),
            b"ref: refs/heads/master\n"
        );
    }

    #[test]
    fn clear_caches_preserves_reads() {
        let t = TempStore::new("caches");
        let (oid, _) = t.store.write(&Object::Blob(b"cached".to_vec())).unwrap();
        let warm = t.store.read(&oid).unwrap();
        t.store.clear_caches();
        let cold = t.store.read(&oid).unwrap();
        assert_eq!(warm, cold);
    }

    #[test]
    fn fold_walks_commit_graph() {
        use crate::object::{Commit, Tree};
        use crate::tree_entry::TreeEntry;

        let t = TempStore::new("fold");
        let (blob_oid, _) = t.store.write(&Object::Blob(b"file".to_vec())).unwrap();
        let (tree_oid, _) = t
            .store
            .write(&Object::Tree(Tree {
                entries: vec![TreeEntry {
                    mode: 0o100644,
                    name: b"f".to_vec(),
                    oid: blob_oid,
                }],
            }))
            .unwrap();
        let (commit_oid, _) = t
            .store
            .write(&Object::Commit(Commit {
                tree: tree_oid,
                parents: vec![],
                author: b"A <a@b> 1700000000 +0000".to_vec(),
                committer: b"A <a@b> 1700000000 +0000".to_vec(),
                trailer: b"\nroot\n".to_vec(),
            }))
            .unwrap();

        let count = t
            .store
            .fold(|acc, _, _| acc + 1, 0usize, &commit_oid)
            .unwrap();
        assert_eq!(count, 3);

        let mut seen = Vec::new();
        t.store
            .iter(|oid, _| seen.push(*oid), &commit_oid)
            .unwrap();
        assert!(seen.contains(&blob_oid));
        assert!(seen.contains(&tree_oid));
        assert!(seen.contains(&commit_oid));
    }
}
