//! The multi-pack aggregate.
//!
//! Holds the registry of `(pack, index)` pairs for a repository and routes
//! lookups, reads, and sizes to the pack containing the OID. Index and
//! reader handles are opened lazily through the `indexes`/`packs` LRUs, so
//! a repository with many packs keeps only the hot ones mapped.
//!
//! Registration is transactional: a pack becomes visible only after its
//! index parses and its trailer matches; on any failure nothing observable
//! changes. A pack with no valid index is skipped at startup and never
//! consulted.
//!
//! Cross-pack REF-delta bases resolve through `EngineResolver`, which
//! probes the loose store first and then the other registered packs,
//! bounded by a hop cap. A loose-probe failure is logged and treated as
//! "base missing" rather than propagated, so a corrupt loose file cannot
//! poison pack reads.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use ahash::AHashMap;
use tracing::{debug, warn};

use crate::caches::{ObjectBytes, StoreCaches};
use crate::buffer_pool::BufferPools;
use crate::errors::LooseError;
use crate::fsys;
use crate::loose::LooseStore;
use crate::object::ObjectKind;
use crate::object_id::{ObjectFormat, ObjectId};
use crate::pack_idx::{IdxHit, PackIndex};
use crate::pack_reader::{
    BaseResolver, PackReadError, PackReadLimits, PackReader, ReadCtx,
};

/// Maximum cross-pack hops while resolving REF-delta bases.
const MAX_BASE_HOPS: u32 = 4;

/// One registered pack: digest plus file locations.
#[derive(Clone, Debug)]
struct RegisteredPack {
    digest: ObjectId,
    pack_path: PathBuf,
    idx_path: PathBuf,
}

/// The open set of packs for one repository.
#[derive(Debug)]
pub struct PackEngine {
    pack_dir: PathBuf,
    format: ObjectFormat,
    limits: PackReadLimits,
    packs: RwLock<Vec<RegisteredPack>>,
}

impl PackEngine {
    /// Opens the engine over an `objects/pack/` directory.
    ///
    /// Every `pack-*.idx` with a sibling `.pack` is validated and
    /// registered; files that fail validation are skipped with a warning
    /// so one corrupt pack cannot take the repository down.
    pub fn open(
        pack_dir: PathBuf,
        format: ObjectFormat,
        limits: PackReadLimits,
    ) -> Result<Self, PackReadError> {
        let mut registered = Vec::new();

        for entry in fsys::dir_entries(&pack_dir)? {
            let Some(name) = entry.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.starts_with("pack-") || !name.ends_with(".idx") {
                continue;
            }
            let pack_path = entry.with_extension("pack");
            if !pack_path.is_file() {
                warn!(idx = %entry.display(), "index without pack file, skipping");
                continue;
            }
            match PackIndex::open(&entry, format) {
                Ok(index) => registered.push(RegisteredPack {
                    digest: index.pack_digest(),
                    pack_path,
                    idx_path: entry,
                }),
                Err(err) => {
                    warn!(idx = %entry.display(), error = %err, "invalid pack index, skipping");
                }
            }
        }

        Ok(Self {
            pack_dir,
            format,
            limits,
            packs: RwLock::new(registered),
        })
    }

    /// Returns the directory packs live in.
    #[must_use]
    pub fn pack_dir(&self) -> &Path {
        &self.pack_dir
    }

    /// Rescans the pack directory and replaces the registry.
    ///
    /// Used by `reset`, which empties `objects/` out from under the
    /// engine.
    pub fn reload(&self) -> Result<(), PackReadError> {
        let fresh = Self::open(self.pack_dir.clone(), self.format, self.limits)?;
        let mut packs = self.packs.write().expect("pack registry poisoned");
        *packs = fresh.packs.into_inner().expect("fresh registry poisoned");
        Ok(())
    }

    /// Returns the digests of every registered pack.
    #[must_use]
    pub fn pack_digests(&self) -> Vec<ObjectId> {
        self.registry().iter().map(|reg| reg.digest).collect()
    }

    /// Looks up which pack holds an OID.
    pub fn lookup(
        &self,
        oid: &ObjectId,
        caches: &StoreCaches,
    ) -> Result<Option<(ObjectId, IdxHit)>, PackReadError> {
        for reg in self.registry() {
            let index = self.index_for(&reg, caches)?;
            if let Some(hit) = index.lookup(oid)? {
                return Ok(Some((reg.digest, hit)));
            }
        }
        Ok(None)
    }

    /// Returns true if any pack holds the OID.
    pub fn contains(&self, oid: &ObjectId, caches: &StoreCaches) -> Result<bool, PackReadError> {
        Ok(self.lookup(oid, caches)?.is_some())
    }

    /// Reads an object from whichever pack holds it.
    ///
    /// `loose` participates only as a REF-delta base fallback.
    pub fn read(
        &self,
        oid: &ObjectId,
        caches: &StoreCaches,
        pools: &BufferPools,
        loose: &LooseStore,
    ) -> Result<Option<Arc<ObjectBytes>>, PackReadError> {
        self.read_hopped(oid, caches, pools, loose, 0)
    }

    fn read_hopped(
        &self,
        oid: &ObjectId,
        caches: &StoreCaches,
        pools: &BufferPools,
        loose: &LooseStore,
        hops: u32,
    ) -> Result<Option<Arc<ObjectBytes>>, PackReadError> {
        for reg in self.registry() {
            let reader = self.reader_for(&reg, caches)?;
            if !reader.contains(oid) {
                continue;
            }
            let resolver = EngineResolver {
                engine: self,
                caches,
                pools,
                loose,
                exclude: reg.digest,
                hops,
            };
            let ctx = ReadCtx {
                caches,
                pools,
                resolver: &resolver,
            };
            return reader.read(oid, &ctx);
        }
        Ok(None)
    }

    /// Returns an object's inflated size from whichever pack holds it.
    pub fn size(
        &self,
        oid: &ObjectId,
        caches: &StoreCaches,
    ) -> Result<Option<u64>, PackReadError> {
        for reg in self.registry() {
            let reader = self.reader_for(&reg, caches)?;
            if let Some(size) = reader.size(oid)? {
                return Ok(Some(size));
            }
        }
        Ok(None)
    }

    /// Returns an object's kind from whichever pack holds it.
    pub fn kind(
        &self,
        oid: &ObjectId,
        caches: &StoreCaches,
        pools: &BufferPools,
        loose: &LooseStore,
    ) -> Result<Option<ObjectKind>, PackReadError> {
        for reg in self.registry() {
            let reader = self.reader_for(&reg, caches)?;
            if !reader.contains(oid) {
                continue;
            }
            let resolver = EngineResolver {
                engine: self,
                caches,
                pools,
                loose,
                exclude: reg.digest,
                hops: 0,
            };
            let ctx = ReadCtx {
                caches,
                pools,
                resolver: &resolver,
            };
            return reader.kind(oid, &ctx);
        }
        Ok(None)
    }

    /// Lists every packed OID, deduplicated across packs.
    pub fn list(&self, caches: &StoreCaches) -> Result<Vec<ObjectId>, PackReadError> {
        let mut out = Vec::new();
        for reg in self.registry() {
            let index = self.index_for(&reg, caches)?;
            for record in index.iter() {
                out.push(record?.oid);
            }
        }
        out.sort();
        out.dedup();
        Ok(out)
    }

    /// Returns the offset-to-OID reverse index for a pack.
    pub fn revindex(
        &self,
        pack: &ObjectId,
        caches: &StoreCaches,
    ) -> Result<Option<Arc<AHashMap<u64, ObjectId>>>, PackReadError> {
        if let Some(rev) = caches.revindex_get(pack) {
            return Ok(Some(rev));
        }
        let Some(reg) = self.registry().into_iter().find(|r| r.digest == *pack) else {
            return Ok(None);
        };
        let index = self.index_for(&reg, caches)?;
        let mut rev = AHashMap::with_capacity(index.len() as usize);
        for record in index.iter() {
            let record = record?;
            rev.insert(record.offset, record.oid);
        }
        let rev = Arc::new(rev);
        caches.revindex_put(pack, Arc::clone(&rev));
        Ok(Some(rev))
    }

    /// Verifies a pack against its index through the reverse index.
    ///
    /// Every `(offset, oid)` pair is reconstructed and re-hashed; a
    /// mismatch means the index or the pack is corrupt.
    pub fn verify_pack(
        &self,
        pack: &ObjectId,
        caches: &StoreCaches,
        pools: &BufferPools,
        loose: &LooseStore,
    ) -> Result<(), PackReadError> {
        let Some(rev) = self.revindex(pack, caches)? else {
            return Ok(());
        };
        let Some(reg) = self.registry().into_iter().find(|r| r.digest == *pack) else {
            return Ok(());
        };
        let reader = self.reader_for(&reg, caches)?;
        let resolver = EngineResolver {
            engine: self,
            caches,
            pools,
            loose,
            exclude: reg.digest,
            hops: 0,
        };
        let ctx = ReadCtx {
            caches,
            pools,
            resolver: &resolver,
        };

        for (&offset, expected) in rev.iter() {
            let bytes = reader.read_at(offset, &ctx)?;
            let actual = crate::digest::object_id(self.format, bytes.kind, &bytes.data);
            if actual != *expected {
                return Err(PackReadError::DigestMismatch {
                    expected: *expected,
                    actual,
                });
            }
        }
        Ok(())
    }

    /// Registers a new pack after validating it.
    ///
    /// The index is parsed and the reader opened (verifying the digest
    /// tail) before the registry changes; on failure nothing is
    /// registered.
    pub fn add_pack(
        &self,
        pack_path: PathBuf,
        idx_path: PathBuf,
        caches: &StoreCaches,
    ) -> Result<ObjectId, PackReadError> {
        let index = Arc::new(PackIndex::open(&idx_path, self.format)?);
        let reader = Arc::new(PackReader::open(&pack_path, Arc::clone(&index), self.limits)?);
        let digest = reader.pack_digest();

        {
            let mut packs = self.packs.write().expect("pack registry poisoned");
            if !packs.iter().any(|reg| reg.digest == digest) {
                packs.push(RegisteredPack {
                    digest,
                    pack_path,
                    idx_path,
                });
            }
        }

        caches.index_put(&digest, index);
        caches.pack_put(&digest, reader);
        debug!(pack = %digest, "registered pack");
        Ok(digest)
    }

    /// Unregisters packs and deletes their files.
    ///
    /// Used by repack once a superseding pack containing every live
    /// object is registered.
    pub fn retire_packs(
        &self,
        digests: &[ObjectId],
        caches: &StoreCaches,
    ) -> Result<(), PackReadError> {
        let retired: Vec<RegisteredPack> = {
            let mut packs = self.packs.write().expect("pack registry poisoned");
            let (gone, kept): (Vec<_>, Vec<_>) = packs
                .drain(..)
                .partition(|reg| digests.contains(&reg.digest));
            *packs = kept;
            gone
        };

        for reg in retired {
            caches.evict_pack(&reg.digest);
            fsys::remove_file_idempotent(&reg.idx_path)?;
            fsys::remove_file_idempotent(&reg.pack_path)?;
            debug!(pack = %reg.digest, "retired pack");
        }
        Ok(())
    }

    fn registry(&self) -> Vec<RegisteredPack> {
        self.packs.read().expect("pack registry poisoned").clone()
    }

    fn index_for(
        &self,
        reg: &RegisteredPack,
        caches: &StoreCaches,
    ) -> Result<Arc<PackIndex>, PackReadError> {
        if let Some(index) = caches.index_get(&reg.digest) {
            return Ok(index);
        }
        let index = Arc::new(PackIndex::open(&reg.idx_path, self.format)?);
        caches.index_put(&reg.digest, Arc::clone(&index));
        Ok(index)
    }

    fn reader_for(
        &self,
        reg: &RegisteredPack,
        caches: &StoreCaches,
    ) -> Result<Arc<PackReader>, PackReadError> {
        if let Some(reader) = caches.pack_get(&reg.digest) {
            return Ok(reader);
        }
        let index = self.index_for(reg, caches)?;
        let reader = Arc::new(PackReader::open(&reg.pack_path, index, self.limits)?);
        caches.pack_put(&reg.digest, Arc::clone(&reader));
        Ok(reader)
    }
}

/// REF-delta base resolver: loose first, then the other packs.
struct EngineResolver<'a> {
    engine: &'a PackEngine,
    caches: &'a StoreCaches,
    pools: &'a BufferPools,
    loose: &'a LooseStore,
    exclude: ObjectId,
    hops: u32,
}

impl BaseResolver for EngineResolver<'_> {
    fn resolve_base(&self, oid: &ObjectId) -> Result<Option<ObjectBytes>, PackReadError> {
        // A corrupt loose candidate must not fail the pack read; the base
        // is simply treated as missing here.
        match self.loose.read_inflated(oid) {
            Ok(Some((kind, data))) => return Ok(Some(ObjectBytes { kind, data })),
            Ok(None) => {}
            Err(LooseError::NotFound { .. }) => {}
            Err(err) => {
                debug!(oid = %oid, error = %err, "loose base probe failed");
            }
        }

        if self.hops >= MAX_BASE_HOPS {
            return Ok(None);
        }

        for reg in self.engine.registry() {
            if reg.digest == self.exclude {
                continue;
            }
            let reader = self.engine.reader_for(&reg, self.caches)?;
            if !reader.contains(oid) {
                continue;
            }
            let resolver = EngineResolver {
                engine: self.engine,
                caches: self.caches,
                pools: self.pools,
                loose: self.loose,
                exclude: reg.digest,
                hops: self.hops + 1,
            };
            let ctx = ReadCtx {
                caches: self.caches,
                pools: self.pools,
                resolver: &resolver,
            };
            if let Some(bytes) = reader.read(oid, &ctx)? {
                return Ok(Some(ObjectBytes {
                    kind: bytes.kind,
                    data: bytes.data.clone(),
                }));
            }
        }
        Ok(None)
    }
}
