//! Pack index (`.idx`) v2: lookup, iteration, and encoding.
//!
//! The index is the digest-to-offset sidecar of a pack. Layout (v2):
//!
//! ```text
//! +----------------+
//! | Magic (4B)     |  0xff 't' 'O' 'c'
//! | Version (4B)   |  Big-endian 2
//! +----------------+
//! | Fanout (1024B) |  256 * u32 BE cumulative counts by first byte
//! +----------------+
//! | OID Table      |  N * oid_len bytes (sorted)
//! +----------------+
//! | CRC Table      |  N * 4 bytes (crc32 of on-disk entry bytes)
//! +----------------+
//! | Offset Table   |  N * 4 bytes (MSB=1 -> large offset index)
//! +----------------+
//! | Large Offsets  |  M * 8 bytes (optional)
//! +----------------+
//! | Pack Digest    |  oid_len bytes
//! | Index Digest   |  oid_len bytes
//! +----------------+
//! ```
//!
//! `PackIndex` opens the file lazily on first use, keeps it memory-mapped,
//! and validates header, fanout monotonicity, and table sizes up front.
//! Lookups binary-search the fanout bucket.
//!
//! The encoder produces the same layout from first-pass records and is the
//! write half used by ingestion.

use std::fmt;
use std::path::Path;

use memmap2::Mmap;

use crate::digest::StreamDigest;
use crate::fsys::{self, FsError};
use crate::object_id::{ObjectFormat, ObjectId};

/// Pack index magic bytes for v2.
const IDX_MAGIC: [u8; 4] = [0xff, b't', b'O', b'c'];
/// Pack index version 2 (only supported version).
const IDX_VERSION: u32 = 2;
/// Header size (4 magic + 4 version).
const IDX_HEADER_SIZE: usize = 8;
/// Fanout table entries.
const FANOUT_ENTRIES: usize = 256;
/// Fanout table size in bytes.
const FANOUT_SIZE: usize = FANOUT_ENTRIES * 4;
/// MSB mask for large offset indirection.
const LARGE_OFFSET_FLAG: u32 = 0x8000_0000;
/// Maximum index file size (2 GB, conservative).
const MAX_IDX_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// Errors from pack index decoding.
#[derive(Debug)]
#[non_exhaustive]
pub enum IdxError {
    /// Index file is corrupt or malformed.
    Corrupt { detail: &'static str },
    /// Index version is not supported.
    UnsupportedVersion { version: u32 },
    /// Index file exceeds the size limit.
    TooLarge { size: u64, max: u64 },
    /// Table sizes disagree with the configured OID length.
    FormatMismatch { expected_oid_len: u8 },
    /// Large offset indirection out of bounds.
    LargeOffsetOutOfBounds { index: u32, count: u32 },
    /// Filesystem failure opening or mapping the index.
    Fs(FsError),
}

impl IdxError {
    /// Constructs a corruption error with a static detail string.
    #[inline]
    pub const fn corrupt(detail: &'static str) -> Self {
        Self::Corrupt { detail }
    }
}

impl fmt::Display for IdxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Corrupt { detail } => write!(f, "corrupt pack index: {detail}"),
            Self::UnsupportedVersion { version } => {
                write!(f, "unsupported pack index version: {version} (expected 2)")
            }
            Self::TooLarge { size, max } => {
                write!(f, "pack index too large: {size} bytes (max: {max})")
            }
            Self::FormatMismatch { expected_oid_len } => {
                write!(f, "pack index tables don't fit OID length {expected_oid_len}")
            }
            Self::LargeOffsetOutOfBounds { index, count } => {
                write!(f, "large offset index out of bounds: {index} >= {count}")
            }
            Self::Fs(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for IdxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Fs(err) => Some(err),
            _ => None,
        }
    }
}

impl From<FsError> for IdxError {
    fn from(err: FsError) -> Self {
        Self::Fs(err)
    }
}

/// Errors from pack index encoding.
#[derive(Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum IdxEncodeError {
    /// Two records carry the same OID; a pack never stores duplicates.
    DuplicateOid { oid: ObjectId },
    /// More records than a u32 object count can express.
    TooManyObjects { count: usize },
}

impl fmt::Display for IdxEncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateOid { oid } => write!(f, "duplicate OID in index: {oid}"),
            Self::TooManyObjects { count } => {
                write!(f, "too many objects for index: {count}")
            }
        }
    }
}

impl std::error::Error for IdxEncodeError {}

/// One record of the index: digest, entry CRC, pack file offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdxRecord {
    /// Object digest.
    pub oid: ObjectId,
    /// CRC-32 of the on-disk entry bytes (header + compressed body).
    pub crc32: u32,
    /// Byte offset of the entry header in the pack.
    pub offset: u64,
}

/// A successful index lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdxHit {
    /// CRC-32 of the on-disk entry bytes.
    pub crc32: u32,
    /// Byte offset of the entry header in the pack.
    pub offset: u64,
}

/// An opened, validated pack index.
///
/// The backing file stays memory-mapped; all accessors slice into the map.
///
/// # Invariants
/// - All table ranges lie within the mapped file.
/// - `object_count` equals `fanout[255]` and fanout is non-decreasing.
#[derive(Debug)]
pub struct PackIndex {
    map: Mmap,
    format: ObjectFormat,
    object_count: u32,
    oid_table: usize,
    crc_table: usize,
    offset_table: usize,
    large_offsets: Option<(usize, usize)>,
}

impl PackIndex {
    /// Opens and validates an index file.
    ///
    /// # Errors
    /// Returns `IdxError` on filesystem failures or malformed content.
    pub fn open(path: &Path, format: ObjectFormat) -> Result<Self, IdxError> {
        let map = fsys::mmap_path(path)?;
        Self::from_map(map, format)
    }

    /// Validates an already-mapped index.
    pub fn from_map(map: Mmap, format: ObjectFormat) -> Result<Self, IdxError> {
        let data: &[u8] = &map;
        if data.len() as u64 > MAX_IDX_SIZE {
            return Err(IdxError::TooLarge {
                size: data.len() as u64,
                max: MAX_IDX_SIZE,
            });
        }

        let oid_len = format.oid_len() as usize;
        let min_size = IDX_HEADER_SIZE + FANOUT_SIZE + 2 * oid_len;
        if data.len() < min_size {
            return Err(IdxError::corrupt("file too small"));
        }
        if data[0..4] != IDX_MAGIC {
            return Err(IdxError::corrupt("invalid magic"));
        }
        let version = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        if version != IDX_VERSION {
            return Err(IdxError::UnsupportedVersion { version });
        }

        let fanout = &data[IDX_HEADER_SIZE..IDX_HEADER_SIZE + FANOUT_SIZE];
        let object_count = validate_fanout(fanout)?;

        let oid_table = IDX_HEADER_SIZE + FANOUT_SIZE;
        let oid_table_size = object_count as usize * oid_len;
        let crc_table = oid_table + oid_table_size;
        let crc_table_size = object_count as usize * 4;
        let offset_table = crc_table + crc_table_size;
        let offset_table_size = object_count as usize * 4;
        let checksums_size = 2 * oid_len;

        let min_with_tables =
            offset_table + offset_table_size + checksums_size;
        if data.len() < min_with_tables {
            return Err(IdxError::FormatMismatch {
                expected_oid_len: format.oid_len(),
            });
        }

        let large_start = offset_table + offset_table_size;
        let large_end = data.len() - checksums_size;
        let large_offsets = if large_end > large_start {
            let len = large_end - large_start;
            if len % 8 != 0 {
                return Err(IdxError::corrupt(
                    "large offset table not a multiple of 8 bytes",
                ));
            }
            Some((large_start, len))
        } else {
            None
        };

        Ok(Self {
            map,
            format,
            object_count,
            oid_table,
            crc_table,
            offset_table,
            large_offsets,
        })
    }

    /// Returns the number of objects indexed.
    #[inline]
    #[must_use]
    pub fn len(&self) -> u32 {
        self.object_count
    }

    /// Returns true if the index holds no objects.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.object_count == 0
    }

    /// Returns the object format.
    #[inline]
    #[must_use]
    pub const fn format(&self) -> ObjectFormat {
        self.format
    }

    /// Returns the digest of the pack this index describes.
    #[must_use]
    pub fn pack_digest(&self) -> ObjectId {
        let oid_len = self.format.oid_len() as usize;
        let start = self.map.len() - 2 * oid_len;
        ObjectId::from_slice(&self.map[start..start + oid_len])
    }

    /// Returns the digest stored for the index file itself.
    #[must_use]
    pub fn index_digest(&self) -> ObjectId {
        let oid_len = self.format.oid_len() as usize;
        let start = self.map.len() - oid_len;
        ObjectId::from_slice(&self.map[start..])
    }

    /// Returns the cumulative fanout count for a first byte.
    #[inline]
    fn fanout(&self, first_byte: u8) -> u32 {
        let off = IDX_HEADER_SIZE + first_byte as usize * 4;
        u32::from_be_bytes([
            self.map[off],
            self.map[off + 1],
            self.map[off + 2],
            self.map[off + 3],
        ])
    }

    /// Returns the OID at a sorted position.
    #[inline]
    fn oid_bytes_at(&self, idx: u32) -> &[u8] {
        debug_assert!(idx < self.object_count);
        let oid_len = self.format.oid_len() as usize;
        let start = self.oid_table + idx as usize * oid_len;
        &self.map[start..start + oid_len]
    }

    /// Returns the CRC-32 at a sorted position.
    #[inline]
    fn crc_at(&self, idx: u32) -> u32 {
        let start = self.crc_table + idx as usize * 4;
        u32::from_be_bytes([
            self.map[start],
            self.map[start + 1],
            self.map[start + 2],
            self.map[start + 3],
        ])
    }

    /// Returns the pack offset at a sorted position.
    ///
    /// Follows large-offset indirection for packs beyond 2 GiB.
    fn offset_at(&self, idx: u32) -> Result<u64, IdxError> {
        let start = self.offset_table + idx as usize * 4;
        let raw = u32::from_be_bytes([
            self.map[start],
            self.map[start + 1],
            self.map[start + 2],
            self.map[start + 3],
        ]);

        if raw & LARGE_OFFSET_FLAG == 0 {
            return Ok(u64::from(raw));
        }

        let loff_idx = raw & !LARGE_OFFSET_FLAG;
        let (loff_start, loff_len) = self
            .large_offsets
            .ok_or(IdxError::corrupt("large offset flag but no spill table"))?;
        let count = (loff_len / 8) as u32;
        if loff_idx >= count {
            return Err(IdxError::LargeOffsetOutOfBounds {
                index: loff_idx,
                count,
            });
        }
        let at = loff_start + loff_idx as usize * 8;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.map[at..at + 8]);
        Ok(u64::from_be_bytes(buf))
    }

    /// Looks up an OID, returning its CRC and pack offset.
    ///
    /// Binary-searches the fanout bucket of the OID's first byte.
    pub fn lookup(&self, oid: &ObjectId) -> Result<Option<IdxHit>, IdxError> {
        if oid.len() != self.format.oid_len() {
            return Ok(None);
        }

        let first = oid.first_byte();
        let hi = self.fanout(first);
        let lo = if first == 0 { 0 } else { self.fanout(first - 1) };

        let mut lo = lo;
        let mut hi = hi;
        let want = oid.as_slice();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.oid_bytes_at(mid).cmp(want) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => {
                    return Ok(Some(IdxHit {
                        crc32: self.crc_at(mid),
                        offset: self.offset_at(mid)?,
                    }));
                }
            }
        }
        Ok(None)
    }

    /// Returns true if the OID is present.
    pub fn contains(&self, oid: &ObjectId) -> bool {
        matches!(self.lookup(oid), Ok(Some(_)))
    }

    /// Iterates `(oid, offset, crc32)` records in sorted OID order.
    pub fn iter(&self) -> impl Iterator<Item = Result<IdxRecord, IdxError>> + '_ {
        (0..self.object_count).map(move |idx| {
            Ok(IdxRecord {
                oid: ObjectId::from_slice(self.oid_bytes_at(idx)),
                crc32: self.crc_at(idx),
                offset: self.offset_at(idx)?,
            })
        })
    }
}

/// Validates that the fanout table is non-decreasing; returns the total.
fn validate_fanout(fanout: &[u8]) -> Result<u32, IdxError> {
    debug_assert!(fanout.len() == FANOUT_SIZE);

    let mut prev = 0u32;
    for i in 0..FANOUT_ENTRIES {
        let off = i * 4;
        let val = u32::from_be_bytes([
            fanout[off],
            fanout[off + 1],
            fanout[off + 2],
            fanout[off + 3],
        ]);
        if val < prev {
            return Err(IdxError::corrupt("fanout not monotonic"));
        }
        prev = val;
    }
    Ok(prev)
}

/// Encodes an index v2 file from first-pass records.
///
/// Records are sorted by OID internally; offsets at or beyond 2 GiB go
/// through the large-offset spill table. The trailing digests are the
/// given pack digest and the digest of the encoded index bytes.
///
/// # Errors
/// Returns `IdxEncodeError` on duplicate OIDs or a record count beyond
/// the format's u32 capacity.
pub fn encode_idx(
    records: &[IdxRecord],
    pack_digest: &ObjectId,
    format: ObjectFormat,
) -> Result<Vec<u8>, IdxEncodeError> {
    if records.len() > u32::MAX as usize {
        return Err(IdxEncodeError::TooManyObjects {
            count: records.len(),
        });
    }

    let mut sorted: Vec<&IdxRecord> = records.iter().collect();
    sorted.sort_by(|a, b| a.oid.cmp(&b.oid));
    for pair in sorted.windows(2) {
        if pair[0].oid == pair[1].oid {
            return Err(IdxEncodeError::DuplicateOid { oid: pair[0].oid });
        }
    }

    let oid_len = format.oid_len() as usize;
    let n = sorted.len();
    let mut out = Vec::with_capacity(IDX_HEADER_SIZE + FANOUT_SIZE + n * (oid_len + 8) + 2 * oid_len);

    out.extend_from_slice(&IDX_MAGIC);
    out.extend_from_slice(&IDX_VERSION.to_be_bytes());

    // Fanout.
    let mut counts = [0u32; FANOUT_ENTRIES];
    for rec in &sorted {
        counts[rec.oid.first_byte() as usize] += 1;
    }
    let mut running = 0u32;
    for count in counts {
        running += count;
        out.extend_from_slice(&running.to_be_bytes());
    }

    // OID table.
    for rec in &sorted {
        out.extend_from_slice(rec.oid.as_slice());
    }

    // CRC table.
    for rec in &sorted {
        out.extend_from_slice(&rec.crc32.to_be_bytes());
    }

    // Offset table with large-offset spill.
    let mut large = Vec::new();
    for rec in &sorted {
        if rec.offset >= u64::from(LARGE_OFFSET_FLAG) {
            let spill_idx = (large.len() / 8) as u32;
            out.extend_from_slice(&(LARGE_OFFSET_FLAG | spill_idx).to_be_bytes());
            large.extend_from_slice(&rec.offset.to_be_bytes());
        } else {
            out.extend_from_slice(&(rec.offset as u32).to_be_bytes());
        }
    }
    out.extend_from_slice(&large);

    out.extend_from_slice(pack_digest.as_slice());

    let mut hasher = StreamDigest::new(format);
    hasher.update(&out);
    let idx_digest = hasher.finalize();
    out.extend_from_slice(idx_digest.as_slice());

    Ok(out)
}
