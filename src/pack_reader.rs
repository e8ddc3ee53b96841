//! Indexed pack reading and delta-chain reconstruction.
//!
//! A `PackReader` pairs one memory-mapped pack with its validated index.
//! Reads look the OID up through the index fan-out, then reconstruct the
//! entry: non-delta bodies inflate straight into the result, delta
//! entries walk their base chain downward (OFS by offset, REF via the
//! index, then the caller's resolver for loose or cross-pack bases) and
//! apply delta streams back up.
//!
//! Intermediate reconstructions land in the shared `bases` cache keyed by
//! `(pack, offset)`, so overlapping chains and repeated reads reuse work.
//! Delta scratch comes from the per-pack buffer pool.
//!
//! # Invariants
//! - The index's pack-digest tail matches the pack's trailer before any
//!   read is served.
//! - Chain depth never exceeds the configured cap.
//! - A missing REF base is not fatal to the pack; it surfaces as
//!   `MissingBase` for the caller to try other backends.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap;

use crate::caches::{ObjectBytes, StoreCaches};
use crate::buffer_pool::BufferPools;
use crate::codec::{self, InflateError};
use crate::fsys::{self, FsError};
use crate::object::ObjectKind;
use crate::object_id::{ObjectFormat, ObjectId};
use crate::pack_delta::{self, DeltaError};
use crate::pack_entry::{EntryHeader, EntryKind, PackBytes, PackParseError};
use crate::pack_idx::{IdxError, IdxHit, PackIndex};

/// Limits for pack reads.
#[derive(Clone, Copy, Debug)]
pub struct PackReadLimits {
    /// Maximum entry header bytes.
    pub max_header_bytes: usize,
    /// Maximum inflated size for any stream or object.
    pub max_object_bytes: usize,
    /// Maximum delta chain depth.
    pub max_delta_depth: u32,
}

impl Default for PackReadLimits {
    fn default() -> Self {
        Self {
            max_header_bytes: 64,
            max_object_bytes: 512 * 1024 * 1024,
            max_delta_depth: 64,
        }
    }
}

/// Errors from pack reads.
#[derive(Debug)]
#[non_exhaustive]
pub enum PackReadError {
    /// Pack framing is malformed.
    Parse(PackParseError),
    /// Index access failed.
    Idx(IdxError),
    /// An entry body failed to inflate.
    Inflate(InflateError),
    /// A delta failed to apply.
    Delta(DeltaError),
    /// Filesystem failure.
    Fs(FsError),
    /// Delta chain exceeded the depth cap.
    DepthExceeded { max_depth: u32 },
    /// A REF base exists in no reachable backend.
    MissingBase { oid: ObjectId },
    /// An entry exceeds the size cap.
    ObjectTooLarge { size: u64, max: usize },
    /// The index does not describe this pack.
    IndexMismatch { pack: ObjectId, index: ObjectId },
    /// A reconstructed entry does not hash to the OID the index claims.
    DigestMismatch { expected: ObjectId, actual: ObjectId },
}

impl fmt::Display for PackReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(err) => write!(f, "{err}"),
            Self::Idx(err) => write!(f, "{err}"),
            Self::Inflate(err) => write!(f, "{err}"),
            Self::Delta(err) => write!(f, "{err}"),
            Self::Fs(err) => write!(f, "{err}"),
            Self::DepthExceeded { max_depth } => {
                write!(f, "delta chain exceeded depth {max_depth}")
            }
            Self::MissingBase { oid } => write!(f, "missing delta base {oid}"),
            Self::ObjectTooLarge { size, max } => {
                write!(f, "object size {size} exceeds cap {max}")
            }
            Self::IndexMismatch { pack, index } => {
                write!(f, "index is for pack {index}, not {pack}")
            }
            Self::DigestMismatch { expected, actual } => {
                write!(f, "entry hashes to {actual}, index says {expected}")
            }
        }
    }
}

impl std::error::Error for PackReadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Parse(err) => Some(err),
            Self::Idx(err) => Some(err),
            Self::Inflate(err) => Some(err),
            Self::Delta(err) => Some(err),
            Self::Fs(err) => Some(err),
            _ => None,
        }
    }
}

impl From<PackParseError> for PackReadError {
    fn from(err: PackParseError) -> Self {
        Self::Parse(err)
    }
}

impl From<IdxError> for PackReadError {
    fn from(err: IdxError) -> Self {
        Self::Idx(err)
    }
}

impl From<InflateError> for PackReadError {
    fn from(err: InflateError) -> Self {
        Self::Inflate(err)
    }
}

impl From<DeltaError> for PackReadError {
    fn from(err: DeltaError) -> Self {
        Self::Delta(err)
    }
}

impl From<FsError> for PackReadError {
    fn from(err: FsError) -> Self {
        Self::Fs(err)
    }
}

/// Resolves delta bases that live outside the pack being read.
///
/// Implementations probe the loose store and the other packs of the
/// repository. Returning `Ok(None)` means the base is absent; the reader
/// turns that into `MissingBase`.
pub trait BaseResolver {
    /// Loads a base object's kind and inflated payload by OID.
    fn resolve_base(&self, oid: &ObjectId) -> Result<Option<ObjectBytes>, PackReadError>;
}

/// Resolver that knows no external bases.
#[derive(Debug, Default)]
pub struct NoExternalBases;

impl BaseResolver for NoExternalBases {
    fn resolve_base(&self, _oid: &ObjectId) -> Result<Option<ObjectBytes>, PackReadError> {
        Ok(None)
    }
}

/// Shared context for a read: caches, buffer pools, and the external
/// base resolver.
pub struct ReadCtx<'a> {
    /// The store's cache set.
    pub caches: &'a StoreCaches,
    /// Per-pack buffer pools.
    pub pools: &'a BufferPools,
    /// Resolver for bases outside this pack.
    pub resolver: &'a dyn BaseResolver,
}

/// One open pack plus its index.
#[derive(Debug)]
pub struct PackReader {
    pack_digest: ObjectId,
    format: ObjectFormat,
    map: Mmap,
    index: Arc<PackIndex>,
    limits: PackReadLimits,
}

impl PackReader {
    /// Opens a pack against its validated index.
    ///
    /// The index's stored pack digest must equal the pack's trailer; a
    /// pack without a matching index is never consulted.
    pub fn open(
        pack_path: &Path,
        index: Arc<PackIndex>,
        limits: PackReadLimits,
    ) -> Result<Self, PackReadError> {
        let map = fsys::mmap_path(pack_path)?;
        let format = index.format();
        let pack = PackBytes::parse(&map, format.oid_len() as usize)?;

        let trailer = ObjectId::try_from_slice(pack.trailer())
            .ok_or(PackReadError::Parse(PackParseError::Truncated))?;
        let index_digest = index.pack_digest();
        if trailer != index_digest {
            return Err(PackReadError::IndexMismatch {
                pack: trailer,
                index: index_digest,
            });
        }

        Ok(Self {
            pack_digest: trailer,
            format,
            map,
            index,
            limits,
        })
    }

    /// Returns the pack's digest.
    #[inline]
    #[must_use]
    pub const fn pack_digest(&self) -> ObjectId {
        self.pack_digest
    }

    /// Returns the index this reader serves from.
    #[must_use]
    pub fn index(&self) -> &Arc<PackIndex> {
        &self.index
    }

    /// Returns the number of objects in the pack.
    #[inline]
    #[must_use]
    pub fn len(&self) -> u32 {
        self.index.len()
    }

    /// Returns true if the pack holds no objects.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Returns true if the OID is present in this pack.
    #[must_use]
    pub fn contains(&self, oid: &ObjectId) -> bool {
        self.index.contains(oid)
    }

    /// Looks up an OID's CRC and offset.
    pub fn lookup(&self, oid: &ObjectId) -> Result<Option<IdxHit>, PackReadError> {
        Ok(self.index.lookup(oid)?)
    }

    /// Reads an object by OID.
    ///
    /// Returns `Ok(None)` when the OID is not in this pack.
    pub fn read(
        &self,
        oid: &ObjectId,
        ctx: &ReadCtx<'_>,
    ) -> Result<Option<Arc<ObjectBytes>>, PackReadError> {
        match self.index.lookup(oid)? {
            Some(hit) => self.read_at(hit.offset, ctx).map(Some),
            None => Ok(None),
        }
    }

    /// Reads an object's payload into a caller-supplied buffer.
    ///
    /// The buffer is cleared first. Returns the kind, or `Ok(None)` when
    /// the OID is not in this pack.
    pub fn read_into(
        &self,
        out: &mut Vec<u8>,
        oid: &ObjectId,
        ctx: &ReadCtx<'_>,
    ) -> Result<Option<ObjectKind>, PackReadError> {
        match self.read(oid, ctx)? {
            Some(bytes) => {
                out.clear();
                out.extend_from_slice(&bytes.data);
                Ok(Some(bytes.kind))
            }
            None => Ok(None),
        }
    }

    /// Returns the inflated object size without reconstructing it.
    ///
    /// For delta entries only the delta header varints are inflated.
    pub fn size(&self, oid: &ObjectId) -> Result<Option<u64>, PackReadError> {
        let Some(hit) = self.index.lookup(oid)? else {
            return Ok(None);
        };
        let pack = self.bytes()?;
        let header = pack.entry_header_at(hit.offset, self.limits.max_header_bytes)?;
        match header.kind {
            EntryKind::NonDelta { .. } => Ok(Some(header.size)),
            EntryKind::OfsDelta { .. } | EntryKind::RefDelta { .. } => {
                let mut prefix = Vec::with_capacity(32);
                codec::inflate_prefix(pack.slice_from(header.data_start), &mut prefix, 32)?;
                let (_, result_size) = pack_delta::delta_sizes(&prefix)?;
                Ok(Some(result_size as u64))
            }
        }
    }

    /// Returns the object kind, following delta chains to their base.
    pub fn kind(
        &self,
        oid: &ObjectId,
        ctx: &ReadCtx<'_>,
    ) -> Result<Option<ObjectKind>, PackReadError> {
        let Some(hit) = self.index.lookup(oid)? else {
            return Ok(None);
        };
        let pack = self.bytes()?;

        let mut cur = hit.offset;
        for _ in 0..=self.limits.max_delta_depth {
            if let Some(cached) = ctx.caches.base_get(&self.pack_digest, cur) {
                return Ok(Some(cached.kind));
            }
            let header = pack.entry_header_at(cur, self.limits.max_header_bytes)?;
            match header.kind {
                EntryKind::NonDelta { kind } => return Ok(Some(kind)),
                EntryKind::OfsDelta { base_offset } => cur = base_offset,
                EntryKind::RefDelta { base_oid } => match self.index.lookup(&base_oid)? {
                    Some(base_hit) => cur = base_hit.offset,
                    None => {
                        return match ctx.resolver.resolve_base(&base_oid)? {
                            Some(base) => Ok(Some(base.kind)),
                            None => Err(PackReadError::MissingBase { oid: base_oid }),
                        };
                    }
                },
            }
        }
        Err(PackReadError::DepthExceeded {
            max_depth: self.limits.max_delta_depth,
        })
    }

    /// Reconstructs the entry at a pack offset.
    pub fn read_at(
        &self,
        offset: u64,
        ctx: &ReadCtx<'_>,
    ) -> Result<Arc<ObjectBytes>, PackReadError> {
        let pack = self.bytes()?;

        // Walk the chain down to a materializable base, collecting the
        // delta entries to replay on the way back up.
        let mut chain: Vec<(u64, EntryHeader)> = Vec::new();
        let mut cur = offset;

        let mut current: Arc<ObjectBytes> = loop {
            if let Some(cached) = ctx.caches.base_get(&self.pack_digest, cur) {
                break cached;
            }

            let header = pack.entry_header_at(cur, self.limits.max_header_bytes)?;
            if header.size > self.limits.max_object_bytes as u64 {
                return Err(PackReadError::ObjectTooLarge {
                    size: header.size,
                    max: self.limits.max_object_bytes,
                });
            }

            match header.kind {
                EntryKind::NonDelta { kind } => {
                    let mut data = Vec::with_capacity(header.size as usize);
                    codec::inflate_exact(
                        pack.slice_from(header.data_start),
                        &mut data,
                        header.size as usize,
                    )?;
                    let base = Arc::new(ObjectBytes { kind, data });
                    ctx.caches.base_put(&self.pack_digest, cur, Arc::clone(&base));
                    break base;
                }
                EntryKind::OfsDelta { base_offset } => {
                    chain.push((cur, header));
                    if chain.len() as u32 > self.limits.max_delta_depth {
                        return Err(PackReadError::DepthExceeded {
                            max_depth: self.limits.max_delta_depth,
                        });
                    }
                    cur = base_offset;
                }
                EntryKind::RefDelta { base_oid } => {
                    chain.push((cur, header));
                    if chain.len() as u32 > self.limits.max_delta_depth {
                        return Err(PackReadError::DepthExceeded {
                            max_depth: self.limits.max_delta_depth,
                        });
                    }
                    match self.index.lookup(&base_oid)? {
                        Some(base_hit) => cur = base_hit.offset,
                        None => match ctx.resolver.resolve_base(&base_oid)? {
                            Some(base) => break Arc::new(base),
                            None => {
                                return Err(PackReadError::MissingBase { oid: base_oid })
                            }
                        },
                    }
                }
            }
        };

        // Replay deltas top-down, caching every intermediate.
        for (entry_offset, header) in chain.iter().rev() {
            let mut scratch = ctx.pools.acquire(&self.pack_digest, header.size as usize);
            codec::inflate_exact(
                pack.slice_from(header.data_start),
                &mut scratch,
                header.size as usize,
            )?;

            let mut data = Vec::new();
            pack_delta::apply_delta(
                &current.data,
                &scratch,
                &mut data,
                self.limits.max_object_bytes,
            )?;

            current = Arc::new(ObjectBytes {
                kind: current.kind,
                data,
            });
            ctx.caches
                .base_put(&self.pack_digest, *entry_offset, Arc::clone(&current));
        }

        Ok(current)
    }

    fn bytes(&self) -> Result<PackBytes<'_>, PackReadError> {
        Ok(PackBytes::parse(
            &self.map,
            self.format.oid_len() as usize,
        )?)
    }
}
