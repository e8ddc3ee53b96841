//! First-pass pack scanning and entry resolution.
//!
//! `scan_pack` walks an in-memory pack exactly once, recording for every
//! entry its offset, kind, sizes, delta parent, and CRC, and verifying the
//! trailing digest. Bodies are inflated into a caller-supplied scratch
//! buffer only to find each entry's compressed extent; nothing is
//! materialized or retained.
//!
//! `resolve_pack` is the second stage used by ingestion: it reconstructs
//! every object (iterating until REF bases resolve), computes OIDs, and
//! yields the records an index is encoded from. Delta chains are bounded
//! by a depth cap, which doubles as the cycle guard; a REF base that never
//! resolves in-pack or through the external lookup is a missing base.
//!
//! # Invariants
//! - Entries are contiguous: each begins where the previous body ended.
//! - The trailer digest equals the digest of all preceding bytes.
//! - Every OFS base lands exactly on an earlier entry header.

use std::fmt;

use ahash::AHashMap;

use crate::codec::{self, InflateError};
use crate::digest::{self, StreamDigest};
use crate::object::ObjectKind;
use crate::object_id::{ObjectFormat, ObjectId};
use crate::pack_delta::{self, DeltaError};
use crate::pack_entry::{EntryKind, PackBytes, PackParseError, PACK_HEADER_SIZE};
use crate::pack_idx::IdxRecord;

/// Limits for pack scanning and resolution.
#[derive(Clone, Copy, Debug)]
pub struct PackScanLimits {
    /// Maximum entry header bytes before parsing is aborted.
    pub max_header_bytes: usize,
    /// Maximum inflated size for any entry stream or object.
    pub max_object_bytes: usize,
    /// Maximum delta chain depth; doubles as the cycle guard.
    pub max_delta_depth: u32,
}

impl Default for PackScanLimits {
    fn default() -> Self {
        Self {
            max_header_bytes: 64,
            max_object_bytes: 512 * 1024 * 1024,
            max_delta_depth: 64,
        }
    }
}

/// Errors from pack scanning and resolution.
#[derive(Debug)]
#[non_exhaustive]
pub enum PackInfoError {
    /// Structural problem in the pack framing.
    PackParse(PackParseError),
    /// An entry body failed to inflate.
    Inflate(InflateError),
    /// A delta stream failed to apply.
    Delta(DeltaError),
    /// An entry exceeds the configured size cap.
    ObjectTooLarge { size: u64, max: usize },
    /// Scanning consumed more or fewer bytes than the data region holds.
    Misaligned { at: u64 },
    /// The trailing digest does not match the pack content.
    TrailerMismatch { expected: ObjectId, actual: ObjectId },
    /// An OFS base offset does not land on an entry header.
    BadBaseOffset { offset: u64 },
    /// Delta chain exceeded the depth cap (or cycles).
    DeltaCycle { max_depth: u32 },
    /// A REF base could not be found in the pack or outside it.
    MissingBase { oid: ObjectId },
}

impl fmt::Display for PackInfoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PackParse(err) => write!(f, "{err}"),
            Self::Inflate(err) => write!(f, "{err}"),
            Self::Delta(err) => write!(f, "{err}"),
            Self::ObjectTooLarge { size, max } => {
                write!(f, "pack entry size {size} exceeds cap {max}")
            }
            Self::Misaligned { at } => {
                write!(f, "pack entries misaligned at offset {at}")
            }
            Self::TrailerMismatch { expected, actual } => {
                write!(f, "pack trailer mismatch: stored {expected}, computed {actual}")
            }
            Self::BadBaseOffset { offset } => {
                write!(f, "OFS base offset {offset} is not an entry")
            }
            Self::DeltaCycle { max_depth } => {
                write!(f, "delta chain exceeded depth {max_depth}")
            }
            Self::MissingBase { oid } => write!(f, "missing delta base {oid}"),
        }
    }
}

impl std::error::Error for PackInfoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::PackParse(err) => Some(err),
            Self::Inflate(err) => Some(err),
            Self::Delta(err) => Some(err),
            _ => None,
        }
    }
}

impl From<PackParseError> for PackInfoError {
    fn from(err: PackParseError) -> Self {
        Self::PackParse(err)
    }
}

impl From<InflateError> for PackInfoError {
    fn from(err: InflateError) -> Self {
        Self::Inflate(err)
    }
}

impl From<DeltaError> for PackInfoError {
    fn from(err: DeltaError) -> Self {
        Self::Delta(err)
    }
}

/// One entry recorded by the first pass.
#[derive(Clone, Copy, Debug)]
pub struct PackRecord {
    /// Offset of the entry header.
    pub offset: u64,
    /// Offset one past the compressed body.
    pub end_offset: u64,
    /// Entry kind, including the delta parent reference.
    pub kind: EntryKind,
    /// Inflated size of this entry's own stream (delta stream for deltas).
    pub stream_size: u64,
    /// Size of the object after delta resolution.
    pub object_size: u64,
    /// CRC-32 of the on-disk entry bytes (header + compressed body).
    pub crc32: u32,
}

/// Result of the first pass over a pack.
#[derive(Clone, Debug)]
pub struct PackInfo {
    /// Declared and verified object count.
    pub object_count: u32,
    /// Entries in file order.
    pub records: Vec<PackRecord>,
    /// The pack's trailing digest.
    pub pack_digest: ObjectId,
    /// Largest object size observed after delta resolution.
    pub max_object_size: u64,
}

/// A fully resolved entry: what the index stores, plus kind and size.
#[derive(Clone, Copy, Debug)]
pub struct ResolvedRecord {
    /// Index record (OID, CRC, offset).
    pub idx: IdxRecord,
    /// Resolved object kind.
    pub kind: ObjectKind,
    /// Inflated object size.
    pub size: u64,
}

/// Streams over a pack once, recording entry metadata.
///
/// `scratch` is reused for every body inflation; its capacity grows to the
/// largest entry stream and is never shrunk.
///
/// # Errors
/// Returns `PackInfoError` on structural damage, size-cap violations, or
/// a trailer digest mismatch.
pub fn scan_pack(
    bytes: &[u8],
    format: ObjectFormat,
    limits: &PackScanLimits,
    scratch: &mut Vec<u8>,
) -> Result<PackInfo, PackInfoError> {
    let pack = PackBytes::parse(bytes, format.oid_len() as usize)?;
    let count = pack.object_count();

    let mut records = Vec::with_capacity(count as usize);
    let mut max_object_size = 0u64;
    let mut pos = PACK_HEADER_SIZE as u64;

    for _ in 0..count {
        let header = pack.entry_header_at(pos, limits.max_header_bytes)?;
        if header.size > limits.max_object_bytes as u64 {
            return Err(PackInfoError::ObjectTooLarge {
                size: header.size,
                max: limits.max_object_bytes,
            });
        }

        scratch.reserve((header.size as usize).saturating_sub(scratch.len()));
        let consumed =
            codec::inflate_exact(pack.slice_from(header.data_start), scratch, header.size as usize)?;
        let end_offset = (header.data_start + consumed) as u64;

        let object_size = match header.kind {
            EntryKind::NonDelta { .. } => header.size,
            EntryKind::OfsDelta { .. } | EntryKind::RefDelta { .. } => {
                let (_, result_size) = pack_delta::delta_sizes(scratch)?;
                if result_size > limits.max_object_bytes {
                    return Err(PackInfoError::ObjectTooLarge {
                        size: result_size as u64,
                        max: limits.max_object_bytes,
                    });
                }
                result_size as u64
            }
        };
        max_object_size = max_object_size.max(object_size);

        let mut crc = crc32fast::Hasher::new();
        crc.update(pack.slice(pos as usize, end_offset as usize));

        records.push(PackRecord {
            offset: pos,
            end_offset,
            kind: header.kind,
            stream_size: header.size,
            object_size,
            crc32: crc.finalize(),
        });
        pos = end_offset;
    }

    if pos != pack.data_end() as u64 {
        return Err(PackInfoError::Misaligned { at: pos });
    }

    let mut hasher = StreamDigest::new(format);
    hasher.update(pack.slice(0, pack.data_end()));
    let actual = hasher.finalize();
    let expected = ObjectId::try_from_slice(pack.trailer())
        .ok_or(PackInfoError::PackParse(PackParseError::Truncated))?;
    if actual != expected {
        return Err(PackInfoError::TrailerMismatch { expected, actual });
    }

    Ok(PackInfo {
        object_count: count,
        records,
        pack_digest: expected,
        max_object_size,
    })
}

/// Reconstructs every entry of a scanned pack and computes its OID.
///
/// REF bases are looked up in-pack first (as OIDs become known), then via
/// `external`, which typically probes the loose store and other packs for
/// thin packs. Resolution iterates to a fixpoint; anything still
/// unresolved afterwards reports its base as missing.
///
/// # Errors
/// Returns `PackInfoError` on inflate or delta failures, depth-cap
/// violations, or missing bases.
pub fn resolve_pack(
    bytes: &[u8],
    info: &PackInfo,
    format: ObjectFormat,
    limits: &PackScanLimits,
    mut external: impl FnMut(&ObjectId) -> Option<(ObjectKind, Vec<u8>)>,
) -> Result<Vec<ResolvedRecord>, PackInfoError> {
    let pack = PackBytes::parse(bytes, format.oid_len() as usize)?;
    let n = info.records.len();

    let by_offset: AHashMap<u64, usize> = info
        .records
        .iter()
        .enumerate()
        .map(|(idx, rec)| (rec.offset, idx))
        .collect();

    // Payload, kind, and chain depth per entry once resolved.
    let mut payloads: Vec<Option<(ObjectKind, Vec<u8>, u32)>> = vec![None; n];
    let mut oid_to_idx: AHashMap<ObjectId, usize> = AHashMap::with_capacity(n);
    let mut oids: Vec<Option<ObjectId>> = vec![None; n];
    let mut resolved = 0usize;
    let mut scratch = Vec::new();

    while resolved < n {
        let mut progressed = false;

        for idx in 0..n {
            if payloads[idx].is_some() {
                continue;
            }
            let rec = &info.records[idx];

            let base: Option<(ObjectKind, Vec<u8>, u32)> = match rec.kind {
                EntryKind::NonDelta { kind } => {
                    inflate_entry(&pack, rec, &mut scratch)?;
                    Some((kind, scratch.clone(), 0))
                }
                EntryKind::OfsDelta { base_offset } => {
                    let base_idx = *by_offset
                        .get(&base_offset)
                        .ok_or(PackInfoError::BadBaseOffset {
                            offset: base_offset,
                        })?;
                    match &payloads[base_idx] {
                        Some((kind, payload, depth)) => {
                            let next = apply_over(&pack, rec, payload, *depth, limits, &mut scratch)?;
                            Some((*kind, next.0, next.1))
                        }
                        None => None,
                    }
                }
                EntryKind::RefDelta { base_oid } => {
                    let in_pack = oid_to_idx.get(&base_oid).copied();
                    match in_pack {
                        Some(base_idx) => {
                            let (kind, payload, depth) = payloads[base_idx]
                                .as_ref()
                                .expect("OID map only holds resolved entries");
                            let next =
                                apply_over(&pack, rec, payload, *depth, limits, &mut scratch)?;
                            Some((*kind, next.0, next.1))
                        }
                        None => match external(&base_oid) {
                            Some((kind, payload)) => {
                                let next =
                                    apply_over(&pack, rec, &payload, 0, limits, &mut scratch)?;
                                Some((kind, next.0, next.1))
                            }
                            None => None,
                        },
                    }
                }
            };

            if let Some((kind, payload, depth)) = base {
                let oid = digest::object_id(format, kind, &payload);
                oid_to_idx.insert(oid, idx);
                oids[idx] = Some(oid);
                payloads[idx] = Some((kind, payload, depth));
                resolved += 1;
                progressed = true;
            }
        }

        if !progressed {
            // Stuck entries are REF deltas whose base never appeared
            // (including REF cycles); report the first one. An OFS entry
            // can only be stuck behind such a REF delta.
            for (idx, rec) in info.records.iter().enumerate() {
                if payloads[idx].is_none() {
                    if let EntryKind::RefDelta { base_oid } = rec.kind {
                        return Err(PackInfoError::MissingBase { oid: base_oid });
                    }
                }
            }
            return Err(PackInfoError::Misaligned { at: 0 });
        }
    }

    let mut out = Vec::with_capacity(n);
    for (idx, rec) in info.records.iter().enumerate() {
        let (kind, payload, _) = payloads[idx].as_ref().expect("all entries resolved");
        out.push(ResolvedRecord {
            idx: IdxRecord {
                oid: oids[idx].expect("all entries resolved"),
                crc32: rec.crc32,
                offset: rec.offset,
            },
            kind: *kind,
            size: payload.len() as u64,
        });
    }
    Ok(out)
}

/// Inflates an entry's own stream into `scratch`.
fn inflate_entry(
    pack: &PackBytes<'_>,
    rec: &PackRecord,
    scratch: &mut Vec<u8>,
) -> Result<(), PackInfoError> {
    let header = pack.entry_header_at(rec.offset, 64)?;
    scratch.reserve((rec.stream_size as usize).saturating_sub(scratch.len()));
    codec::inflate_exact(
        pack.slice_from(header.data_start),
        scratch,
        rec.stream_size as usize,
    )?;
    Ok(())
}

/// Inflates a delta entry's stream and applies it over `base_payload`.
///
/// Returns the reconstructed payload and the new chain depth.
fn apply_over(
    pack: &PackBytes<'_>,
    rec: &PackRecord,
    base_payload: &[u8],
    base_depth: u32,
    limits: &PackScanLimits,
    scratch: &mut Vec<u8>,
) -> Result<(Vec<u8>, u32), PackInfoError> {
    let depth = base_depth + 1;
    if depth > limits.max_delta_depth {
        return Err(PackInfoError::DeltaCycle {
            max_depth: limits.max_delta_depth,
        });
    }

    inflate_entry(pack, rec, scratch)?;
    let mut out = Vec::new();
    pack_delta::apply_delta(base_payload, scratch, &mut out, limits.max_object_bytes)?;
    Ok((out, depth))
}
