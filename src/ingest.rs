//! Pack ingestion: stream in, validate, index, publish.
//!
//! An incoming pack byte stream is saved to a scratch file, scanned once
//! for structure and trailer digest, resolved to per-object index records
//! (completing thin packs against the loose store and existing packs),
//! indexed, and only then renamed into `objects/pack/` — index first,
//! then pack — and registered with the engine.
//!
//! Failure at any step unlinks the scratch files; no `.pack` or `.idx`
//! becomes visible unless every step succeeded.
//!
//! A stall guard bounds retries on a source that keeps reporting
//! `Interrupted`/`WouldBlock` without delivering bytes; past the limit
//! ingestion fails with `Stalled` instead of spinning.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::buffer_pool::BufferPools;
use crate::caches::StoreCaches;
use crate::errors::IngestError;
use crate::fsys;
use crate::loose::LooseStore;
use crate::object_id::{ObjectFormat, ObjectId};
use crate::pack_engine::PackEngine;
use crate::pack_idx::{encode_idx, IdxRecord};
use crate::pack_info::{resolve_pack, scan_pack, PackScanLimits};

/// Default zero-progress read limit.
pub const DEFAULT_STALL_LIMIT: u32 = 50;

/// Ingestion options.
#[derive(Clone, Copy, Debug)]
pub struct IngestOptions {
    /// Consecutive zero-progress reads tolerated before `Stalled`.
    pub stall_limit: u32,
    /// Read chunk size for the save phase.
    pub chunk_bytes: usize,
    /// Limits for scanning and resolution.
    pub scan: PackScanLimits,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            stall_limit: DEFAULT_STALL_LIMIT,
            chunk_bytes: 64 * 1024,
            scan: PackScanLimits::default(),
        }
    }
}

/// Result of a successful ingestion.
#[derive(Clone, Copy, Debug)]
pub struct IngestOutcome {
    /// The ingested pack's digest.
    pub pack_digest: ObjectId,
    /// Number of objects the pack holds.
    pub object_count: u32,
}

/// Unlinks a scratch file unless disarmed.
struct ScratchGuard {
    path: PathBuf,
    armed: bool,
}

impl ScratchGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ScratchGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Ingests a pack stream into the repository.
///
/// On success the pack and its index live in `pack_dir` and the pack is
/// registered with `engine`. `loose` and `engine` also serve as base
/// providers for thin packs.
pub fn ingest_pack(
    source: &mut dyn Read,
    tmp_dir: &Path,
    pack_dir: &Path,
    format: ObjectFormat,
    opts: &IngestOptions,
    engine: &PackEngine,
    caches: &StoreCaches,
    pools: &BufferPools,
    loose: &LooseStore,
) -> Result<IngestOutcome, IngestError> {
    fsys::create_dir_all(tmp_dir)?;
    fsys::create_dir_all(pack_dir)?;

    // Save phase: stream to a scratch pack file.
    let scratch_pack = fsys::scratch_path(tmp_dir, "pack-in");
    let mut pack_guard = ScratchGuard::new(scratch_pack.clone());
    save_stream(source, &scratch_pack, opts)?;

    // First pass over the saved bytes.
    let map = fsys::mmap_path(&scratch_pack)?;
    let mut scan_buf = pools.acquire_unrecorded(0);
    let info = scan_pack(&map, format, &opts.scan, &mut scan_buf)?;
    drop(scan_buf);

    // Resolve every entry, probing loose and existing packs for thin
    // bases.
    let resolved = resolve_pack(&map, &info, format, &opts.scan, |oid| {
        if let Ok(Some((kind, data))) = loose.read_inflated(oid) {
            return Some((kind, data));
        }
        match engine.read(oid, caches, pools, loose) {
            Ok(Some(bytes)) => Some((bytes.kind, bytes.data.clone())),
            _ => None,
        }
    })?;
    let records: Vec<IdxRecord> = resolved.iter().map(|r| r.idx).collect();
    let idx_bytes = encode_idx(&records, &info.pack_digest, format)?;
    drop(map);

    // Publish: index first, then pack, then registration.
    let scratch_idx = fsys::scratch_path(tmp_dir, "idx-in");
    let mut idx_guard = ScratchGuard::new(scratch_idx.clone());
    fsys::write_all_synced(&scratch_idx, &idx_bytes)?;

    let hex = info.pack_digest.to_hex();
    let final_idx = pack_dir.join(format!("pack-{hex}.idx"));
    let final_pack = pack_dir.join(format!("pack-{hex}.pack"));

    fsys::rename(&scratch_idx, &final_idx)?;
    idx_guard.disarm();
    if let Err(err) = fsys::rename(&scratch_pack, &final_pack) {
        // Roll the index back out so no orphan idx is published.
        let _ = std::fs::remove_file(&final_idx);
        return Err(err.into());
    }
    pack_guard.disarm();

    engine
        .add_pack(final_pack, final_idx, caches)
        .map_err(IngestError::Register)?;

    debug!(
        pack = %info.pack_digest,
        objects = info.object_count,
        "ingested pack"
    );

    Ok(IngestOutcome {
        pack_digest: info.pack_digest,
        object_count: info.object_count,
    })
}

/// Streams `source` into `dest`, tolerating a bounded number of
/// zero-progress reads.
fn save_stream(
    source: &mut dyn Read,
    dest: &Path,
    opts: &IngestOptions,
) -> Result<(), IngestError> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(dest)
        .map_err(|e| IngestError::Fs(crate::fsys::FsError::new("create", dest, e)))?;

    let mut chunk = vec![0u8; opts.chunk_bytes.max(512)];
    let mut idle_reads = 0u32;

    loop {
        match source.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                idle_reads = 0;
                file.write_all(&chunk[..n])
                    .map_err(|e| IngestError::Fs(crate::fsys::FsError::new("write", dest, e)))?;
            }
            Err(e) if matches!(e.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock) => {
                idle_reads += 1;
                if idle_reads >= opts.stall_limit {
                    return Err(IngestError::Stalled { reads: idle_reads });
                }
            }
            Err(e) => return Err(IngestError::Io(e)),
        }
    }

    sync(&mut file, dest)?;
    Ok(())
}

fn sync(file: &mut File, path: &Path) -> Result<(), IngestError> {
    file.sync_all()
        .map_err(|e| IngestError::Fs(crate::fsys::FsError::new("fsync", path, e)))
}
