//! Content-addressed object store with Git's on-disk format.
//!
//! Four immutable object kinds (commit, tree, tag, blob) addressed by the
//! digest of their canonical bytes, stored either as deflated loose files
//! or inside delta-compressed packs, plus a reference directory mapping
//! symbolic names to digests.
//!
//! The hybrid read engine is the heart of the crate:
//! - The loose backend stores one deflated object per file.
//! - The pack backend stores many objects per file, reconstructed through
//!   OFS/REF delta chains against other entries, the loose store, or
//!   other packs.
//! - The reference backend resolves names through per-file refs shadowing
//!   a packed-refs side table.
//!
//! Read flow: `read(h)` tries the pack set (index fan-out lookup, delta
//! reconstruction with memoized bases), falls back to the loose file, and
//! caches the decoded object. Ingest flow: stream to a scratch file,
//! single-pass scan, entry resolution, index build, atomic publish,
//! registration. The write path plans deltas over a sliding window and
//! streams a digest-trailed pack.
//!
//! Bounded LRU caches sit at every expensive seam (decoded objects,
//! reconstructed bases, open packs/indexes, reverse indexes), and
//! per-pack buffer pools keep inflation scratch off the allocator's hot
//! path.

pub mod buffer_pool;
pub mod caches;
pub mod codec;
pub mod digest;
pub mod errors;
pub mod fsys;
pub mod ingest;
pub mod loose;
pub mod object;
pub mod object_id;
pub mod pack_delta;
pub mod pack_engine;
pub mod pack_entry;
pub mod pack_idx;
pub mod pack_info;
pub mod pack_reader;
pub mod pack_writer;
pub mod refs;
pub mod store;
pub mod tree_entry;

pub use buffer_pool::{BufferPools, PoolBuffer, DEFAULT_POOL_BUFFERS};
pub use caches::{CacheConfig, ObjectBytes, StoreCaches, DEFAULT_CACHE_CAPACITY};
pub use codec::{DeflateError, InflateError};
pub use errors::{IngestError, LooseError, RefError, StoreError};
pub use fsys::{FsError, Mapper};
pub use ingest::{IngestOptions, IngestOutcome, DEFAULT_STALL_LIMIT};
pub use loose::LooseStore;
pub use object::{Commit, Object, ObjectDecodeError, ObjectKind, Tag, Tree};
pub use object_id::{HexError, ObjectFormat, ObjectId};
pub use pack_delta::{apply_delta, delta_sizes, encode_delta, DeltaError};
pub use pack_engine::PackEngine;
pub use pack_entry::{EntryHeader, EntryKind, PackBytes, PackParseError};
pub use pack_idx::{encode_idx, IdxError, IdxHit, IdxRecord, PackIndex};
pub use pack_info::{resolve_pack, scan_pack, PackInfo, PackInfoError, PackScanLimits};
pub use pack_reader::{
    BaseResolver, NoExternalBases, PackReadError, PackReadLimits, PackReader, ReadCtx,
};
pub use pack_writer::{
    write_pack, write_pack_thin, PackInput, PackOutcome, PackPlanOptions, PlanError,
};
pub use refs::{normalize, RefStore, RefValue, HEAD_DEFAULT};
pub use store::{Store, StoreOptions};
