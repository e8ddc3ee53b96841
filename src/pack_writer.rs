//! Pack encoding and delta planning.
//!
//! Turns a set of in-memory objects into a pack byte stream. The planner
//! considers up to `window` recently emitted same-kind objects as delta
//! bases, bounded by `max_depth` on chain length, and keeps a delta only
//! when it is smaller than the raw payload. Bases inside the pack are
//! referenced by backward offset; thin packs may reference caller-supplied
//! external bases by OID.
//!
//! Emission order is commits, tags, trees, blobs; trees and blobs are
//! ordered larger-to-smaller within their kind so big bases appear before
//! the objects that delta against them. The trailing digest is computed
//! over every emitted byte, and the digest-to-(crc, offset) records are
//! available once the stream has been fully written.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Write};

use ahash::AHashMap;

use crate::codec::{self, DeflateError};
use crate::digest::{self, StreamDigest};
use crate::object::ObjectKind;
use crate::object_id::{ObjectFormat, ObjectId};
use crate::pack_delta;
use crate::pack_entry::{self, OFS_DELTA_CODE, REF_DELTA_CODE};
use crate::pack_idx::IdxRecord;

/// One object handed to the pack writer.
#[derive(Clone, Debug)]
pub struct PackInput {
    /// Object kind.
    pub kind: ObjectKind,
    /// Inflated canonical payload.
    pub payload: Vec<u8>,
    /// Optional path hint for trees and blobs; objects sharing a hint are
    /// preferred delta partners.
    pub path_hint: Option<Vec<u8>>,
}

impl PackInput {
    /// Creates an input without a path hint.
    #[must_use]
    pub fn new(kind: ObjectKind, payload: Vec<u8>) -> Self {
        Self {
            kind,
            payload,
            path_hint: None,
        }
    }

    /// Creates an input carrying a path hint.
    #[must_use]
    pub fn with_path(kind: ObjectKind, payload: Vec<u8>, path: Vec<u8>) -> Self {
        Self {
            kind,
            payload,
            path_hint: Some(path),
        }
    }
}

/// Planner and encoder options.
#[derive(Clone, Copy, Debug)]
pub struct PackPlanOptions {
    /// How many recent same-kind objects to consider as delta bases.
    pub window: usize,
    /// Maximum delta chain depth the planner will create.
    pub max_depth: u32,
    /// Deflate level for entry bodies.
    pub level: u32,
    /// Object ID format.
    pub format: ObjectFormat,
}

impl Default for PackPlanOptions {
    fn default() -> Self {
        Self {
            window: 10,
            max_depth: 50,
            level: 6,
            format: ObjectFormat::Sha1,
        }
    }
}

/// Errors from pack planning and encoding.
#[derive(Debug)]
#[non_exhaustive]
pub enum PlanError {
    /// More objects than a pack header can count.
    TooManyObjects { count: usize },
    /// Deflate failed while encoding an entry body.
    Deflate(DeflateError),
    /// The sink failed.
    Io(io::Error),
}

impl fmt::Display for PlanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooManyObjects { count } => {
                write!(f, "too many objects for one pack: {count}")
            }
            Self::Deflate(err) => write!(f, "{err}"),
            Self::Io(err) => write!(f, "pack sink error: {err}"),
        }
    }
}

impl std::error::Error for PlanError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Deflate(err) => Some(err),
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DeflateError> for PlanError {
    fn from(err: DeflateError) -> Self {
        Self::Deflate(err)
    }
}

impl From<io::Error> for PlanError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

/// Result of writing a pack: digest, count, and index records.
#[derive(Clone, Debug)]
pub struct PackOutcome {
    /// Digest of the emitted pack (its trailer).
    pub pack_digest: ObjectId,
    /// Number of objects written.
    pub object_count: u32,
    /// One record per object, in emission order.
    pub records: Vec<IdxRecord>,
}

/// Writes a pack containing only in-pack delta bases.
pub fn write_pack(
    inputs: Vec<PackInput>,
    opts: &PackPlanOptions,
    sink: &mut dyn Write,
) -> Result<PackOutcome, PlanError> {
    write_pack_thin(inputs, &[], opts, sink)
}

/// Writes a pack, allowing deltas against caller-supplied external bases.
///
/// External bases are `(oid, kind, payload)` of objects the receiving side
/// already has; entries delta-ing against them are emitted as REF deltas,
/// producing a thin pack.
pub fn write_pack_thin(
    inputs: Vec<PackInput>,
    external_bases: &[(ObjectId, ObjectKind, Vec<u8>)],
    opts: &PackPlanOptions,
    sink: &mut dyn Write,
) -> Result<PackOutcome, PlanError> {
    let ordered = plan_order(inputs, opts.format);
    if ordered.len() > u32::MAX as usize {
        return Err(PlanError::TooManyObjects {
            count: ordered.len(),
        });
    }
    let count = ordered.len() as u32;

    let mut hasher = StreamDigest::new(opts.format);
    let mut offset: u64 = 0;

    let mut header = Vec::with_capacity(12);
    header.extend_from_slice(b"PACK");
    header.extend_from_slice(&2u32.to_be_bytes());
    header.extend_from_slice(&count.to_be_bytes());
    hasher.update(&header);
    sink.write_all(&header)?;
    offset += header.len() as u64;

    // Sliding window of recent entries per kind. Payloads are retained
    // only while inside the window.
    let mut emitted: Vec<EmittedEntry> = Vec::with_capacity(ordered.len());
    let mut windows: AHashMap<ObjectKind, VecDeque<usize>> = AHashMap::new();

    let mut records = Vec::with_capacity(ordered.len());
    let mut entry_buf = Vec::new();
    let mut body_buf = Vec::new();

    for input in ordered {
        let oid = digest::object_id(opts.format, input.kind, &input.payload);

        let window = windows.entry(input.kind).or_default();
        let choice = choose_base(&input, window, &emitted, external_bases, opts);

        entry_buf.clear();
        let (depth, stored): (u32, &[u8]) = match &choice {
            BaseChoice::Raw => {
                pack_entry::encode_entry_header(
                    &mut entry_buf,
                    input.kind.pack_code(),
                    input.payload.len() as u64,
                );
                (0, &input.payload)
            }
            BaseChoice::InPack { entry, delta } => {
                let base = &emitted[*entry];
                pack_entry::encode_entry_header(
                    &mut entry_buf,
                    OFS_DELTA_CODE,
                    delta.len() as u64,
                );
                pack_entry::encode_ofs_base(&mut entry_buf, offset - base.offset);
                (base.depth + 1, delta.as_slice())
            }
            BaseChoice::External { oid: base_oid, delta } => {
                pack_entry::encode_entry_header(
                    &mut entry_buf,
                    REF_DELTA_CODE,
                    delta.len() as u64,
                );
                entry_buf.extend_from_slice(base_oid.as_slice());
                (1, delta.as_slice())
            }
        };

        codec::deflate_all(stored, &mut body_buf, opts.level)?;
        entry_buf.extend_from_slice(&body_buf);

        let mut crc = crc32fast::Hasher::new();
        crc.update(&entry_buf);

        hasher.update(&entry_buf);
        sink.write_all(&entry_buf)?;

        records.push(IdxRecord {
            oid,
            crc32: crc.finalize(),
            offset,
        });

        let entry_idx = emitted.len();
        emitted.push(EmittedEntry {
            offset,
            depth,
            size: input.payload.len(),
            payload: Some(input.payload),
        });
        window.push_back(entry_idx);
        if window.len() > opts.window {
            if let Some(evicted) = window.pop_front() {
                emitted[evicted].payload = None;
            }
        }

        offset += entry_buf.len() as u64;
    }

    let pack_digest = hasher.finalize();
    sink.write_all(pack_digest.as_slice())?;
    sink.flush()?;

    Ok(PackOutcome {
        pack_digest,
        object_count: count,
        records,
    })
}

#[derive(Debug)]
struct EmittedEntry {
    offset: u64,
    depth: u32,
    size: usize,
    /// Retained only while the entry is inside the planner window.
    payload: Option<Vec<u8>>,
}

enum BaseChoice {
    Raw,
    InPack { entry: usize, delta: Vec<u8> },
    External { oid: ObjectId, delta: Vec<u8> },
}

/// Picks the best delta base for `input` from the window and the external
/// set.
///
/// The candidate minimizing delta size wins, subject to the base depth
/// staying under the cap; ties break to the smaller base, then the lower
/// insertion index. `Raw` is returned when no delta beats the plain
/// payload.
fn choose_base(
    input: &PackInput,
    window: &VecDeque<usize>,
    emitted: &[EmittedEntry],
    external_bases: &[(ObjectId, ObjectKind, Vec<u8>)],
    opts: &PackPlanOptions,
) -> BaseChoice {
    let mut best: Option<(usize, usize, usize, BaseChoice)> = None; // (len, base_size, index)

    let mut consider = |delta_len: usize, base_size: usize, index: usize, choice: BaseChoice| {
        let better = match &best {
            None => delta_len < input.payload.len(),
            Some((len, size, idx, _)) => {
                delta_len < *len
                    || (delta_len == *len
                        && (base_size < *size || (base_size == *size && index < *idx)))
            }
        };
        if better && delta_len < input.payload.len() {
            best = Some((delta_len, base_size, index, choice));
        }
    };

    for (index, &entry_idx) in window.iter().enumerate() {
        let entry = &emitted[entry_idx];
        if entry.depth + 1 > opts.max_depth {
            continue;
        }
        let Some(payload) = entry.payload.as_deref() else {
            continue;
        };
        let delta = pack_delta::encode_delta(payload, &input.payload);
        consider(
            delta.len(),
            entry.size,
            index,
            BaseChoice::InPack {
                entry: entry_idx,
                delta,
            },
        );
    }

    for (index, (oid, kind, payload)) in external_bases.iter().enumerate() {
        if *kind != input.kind {
            continue;
        }
        let delta = pack_delta::encode_delta(payload, &input.payload);
        consider(
            delta.len(),
            payload.len(),
            // External candidates rank after window candidates on ties.
            usize::MAX - external_bases.len() + index,
            BaseChoice::External { oid: *oid, delta },
        );
    }

    match best {
        Some((_, _, _, choice)) => choice,
        None => BaseChoice::Raw,
    }
}

/// Orders inputs for emission and drops duplicate OIDs.
///
/// Commits, then tags, then trees, then blobs; trees and blobs are sorted
/// larger-to-smaller so natural bases come first. Objects sharing a path
/// hint stay adjacent within equal sizes.
fn plan_order(inputs: Vec<PackInput>, format: ObjectFormat) -> Vec<PackInput> {
    let mut seen: AHashMap<ObjectId, ()> = AHashMap::with_capacity(inputs.len());
    let mut unique = Vec::with_capacity(inputs.len());
    for input in inputs {
        let oid = digest::object_id(format, input.kind, &input.payload);
        if seen.insert(oid, ()).is_none() {
            unique.push(input);
        }
    }

    let rank = |kind: ObjectKind| -> u8 {
        match kind {
            ObjectKind::Commit => 0,
            ObjectKind::Tag => 1,
            ObjectKind::Tree => 2,
            ObjectKind::Blob => 3,
        }
    };

    unique.sort_by(|a, b| {
        rank(a.kind).cmp(&rank(b.kind)).then_with(|| {
            if matches!(a.kind, ObjectKind::Tree | ObjectKind::Blob) {
                b.payload
                    .len()
                    .cmp(&a.payload.len())
                    .then_with(|| a.path_hint.cmp(&b.path_hint))
            } else {
                std::cmp::Ordering::Equal
            }
        })
    });
    unique
}
