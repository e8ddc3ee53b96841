//! Filesystem plumbing for the store.
//!
//! Everything that touches disk funnels through this module: bounded file
//! reads, write-to-temp plus atomic rename, directory listing, and
//! read-only memory mapping of file regions. Errors carry the attempted
//! operation and path so failures are actionable without backtraces.
//!
//! # Invariants
//! - Mutations of published files always go through `write_atomic`:
//!   readers observe either the old or the new content, never a torn file.
//! - Temp files are fsynced before rename so a crash cannot publish a
//!   half-written pack or index.
//! - Mapped regions are read-only and remain valid as long as the handle
//!   lives; published store files are never rewritten in place.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::{Mmap, MmapOptions};

/// Filesystem error carrying the attempted operation and path.
#[derive(Debug)]
pub struct FsError {
    /// Short operation name (`"open"`, `"rename"`, ...).
    pub op: &'static str,
    /// Path the operation was attempted on.
    pub path: PathBuf,
    /// Underlying I/O error.
    pub source: io::Error,
}

impl FsError {
    pub(crate) fn new(op: &'static str, path: &Path, source: io::Error) -> Self {
        Self {
            op,
            path: path.to_path_buf(),
            source,
        }
    }
}

impl std::fmt::Display for FsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "fs {} failed on {}: {}",
            self.op,
            self.path.display(),
            self.source
        )
    }
}

impl std::error::Error for FsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Reads a whole file, failing if it exceeds `max` bytes.
///
/// Small metadata files (refs, packed-refs) are read through this; the
/// bound prevents a mislabeled huge file from being slurped into memory.
pub fn read_file_bounded(path: &Path, max: u64) -> Result<Vec<u8>, FsError> {
    let mut file = File::open(path).map_err(|e| FsError::new("open", path, e))?;
    let meta = file.metadata().map_err(|e| FsError::new("stat", path, e))?;
    if meta.len() > max {
        return Err(FsError::new(
            "read",
            path,
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("file is {} bytes (limit {max})", meta.len()),
            ),
        ));
    }
    let mut out = Vec::with_capacity(meta.len() as usize);
    file.read_to_end(&mut out)
        .map_err(|e| FsError::new("read", path, e))?;
    Ok(out)
}

/// Writes `bytes` to a temp file in `tmp_dir`, fsyncs, then renames to
/// `dest`.
///
/// The rename is atomic on POSIX filesystems; concurrent readers of `dest`
/// see either the previous content or the new content. The temp file is
/// removed on failure.
pub fn write_atomic(dest: &Path, tmp_dir: &Path, bytes: &[u8]) -> Result<(), FsError> {
    let tmp = scratch_path(tmp_dir, "obj");
    write_all_synced(&tmp, bytes)?;
    match fs::rename(&tmp, dest) {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = fs::remove_file(&tmp);
            Err(FsError::new("rename", dest, e))
        }
    }
}

/// Writes `bytes` to `path` and fsyncs the file.
pub fn write_all_synced(path: &Path, bytes: &[u8]) -> Result<(), FsError> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| FsError::new("create", path, e))?;
    if let Err(e) = file.write_all(bytes).and_then(|()| file.sync_all()) {
        drop(file);
        let _ = fs::remove_file(path);
        return Err(FsError::new("write", path, e));
    }
    Ok(())
}

/// Renames `from` to `to`, surfacing the destination path on failure.
pub fn rename(from: &Path, to: &Path) -> Result<(), FsError> {
    fs::rename(from, to).map_err(|e| FsError::new("rename", to, e))
}

/// Removes a file, treating "not found" as success.
pub fn remove_file_idempotent(path: &Path) -> Result<(), FsError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(FsError::new("unlink", path, e)),
    }
}

/// Creates a directory and any missing parents.
pub fn create_dir_all(path: &Path) -> Result<(), FsError> {
    fs::create_dir_all(path).map_err(|e| FsError::new("mkdir", path, e))
}

/// Lists the entries of a directory; a missing directory yields an empty
/// list.
pub fn dir_entries(path: &Path) -> Result<Vec<PathBuf>, FsError> {
    let iter = match fs::read_dir(path) {
        Ok(iter) => iter,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(FsError::new("readdir", path, e)),
    };
    let mut out = Vec::new();
    for entry in iter {
        let entry = entry.map_err(|e| FsError::new("readdir", path, e))?;
        out.push(entry.path());
    }
    Ok(out)
}

/// Returns a fresh scratch path in `dir` with the given prefix.
///
/// Uniqueness comes from the process id and a process-wide counter; scratch
/// directories are private to the store so cross-process collisions reduce
/// to pid reuse with leftover files, which `create_new` surfaces as an
/// error rather than silent truncation.
pub fn scratch_path(dir: &Path, prefix: &str) -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    dir.join(format!("{prefix}-{}-{n}", std::process::id()))
}

/// Produces read-only memory regions of one file.
///
/// Published packs and indexes are immutable, so regions stay coherent for
/// the life of the handle.
#[derive(Debug)]
pub struct Mapper {
    file: File,
    len: u64,
    path: PathBuf,
}

impl Mapper {
    /// Opens a file for region mapping.
    pub fn open(path: &Path) -> Result<Self, FsError> {
        let file = File::open(path).map_err(|e| FsError::new("open", path, e))?;
        let len = file
            .metadata()
            .map_err(|e| FsError::new("stat", path, e))?
            .len();
        Ok(Self {
            file,
            len,
            path: path.to_path_buf(),
        })
    }

    /// Returns the file length in bytes.
    #[inline]
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns true if the file is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Maps `len` bytes starting at `offset` read-only.
    ///
    /// # Errors
    /// Fails if the range exceeds the file or the mapping syscall fails.
    pub fn map(&self, offset: u64, len: usize) -> Result<Mmap, FsError> {
        let end = offset
            .checked_add(len as u64)
            .filter(|&end| end <= self.len)
            .ok_or_else(|| {
                FsError::new(
                    "mmap",
                    &self.path,
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("range {offset}+{len} exceeds file of {} bytes", self.len),
                    ),
                )
            })?;
        debug_assert!(end <= self.len);

        // SAFETY: the mapping is read-only and store files are never
        // modified in place once published.
        unsafe {
            MmapOptions::new()
                .offset(offset)
                .len(len)
                .map(&self.file)
                .map_err(|e| FsError::new("mmap", &self.path, e))
        }
    }

    /// Maps the whole file read-only.
    pub fn map_all(&self) -> Result<Mmap, FsError> {
        self.map(0, self.len as usize)
    }
}

/// Maps a whole file read-only in one call.
pub fn mmap_path(path: &Path) -> Result<Mmap, FsError> {
    Mapper::open(path)?.map_all()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TempDir {
        path: PathBuf,
    }

    impl TempDir {
        fn new(tag: &str) -> Self {
            let path = std::env::temp_dir().join(format!(
                "odb-fsys-{tag}-{}-{:?}",
                std::process::id(),
                std::thread::current().id()
            ));
            fs::create_dir_all(&path).unwrap();
            Self { path }
        }
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.path);
        }
    }

    #[test]
    fn write_atomic_publishes_content() {
        let dir = TempDir::new("atomic");
        let dest = dir.path.join("target");
        write_atomic(&dest, &dir.path, b"payload").unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"payload");
        // The temp file is gone.
        let leftovers: Vec<_> = dir_entries(&dir.path).unwrap();
        assert_eq!(leftovers, vec![dest]);
    }

    #[test]
    fn write_atomic_replaces_existing() {
        let dir = TempDir::new("replace");
        let dest = dir.path.join("target");
        write_atomic(&dest, &dir.path, b"old").unwrap();
        write_atomic(&dest, &dir.path, b"new").unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"new");
    }

    #[test]
    fn read_file_bounded_enforces_limit() {
        let dir = TempDir::new("bounded");
        let path = dir.path.join("big");
        fs::write(&path, vec![0u8; 128]).unwrap();
        assert!(read_file_bounded(&path, 64).is_err());
        assert_eq!(read_file_bounded(&path, 128).unwrap().len(), 128);
    }

    #[test]
    fn mapper_maps_regions() {
        let dir = TempDir::new("mapper");
        let path = dir.path.join("data");
        fs::write(&path, b"0123456789").unwrap();

        let mapper = Mapper::open(&path).unwrap();
        assert_eq!(mapper.len(), 10);
        let region = mapper.map(2, 4).unwrap();
        assert_eq!(&region[..], b"2345");
        assert!(mapper.map(8, 4).is_err());
    }

    #[test]
    fn dir_entries_missing_dir_is_empty() {
        let dir = TempDir::new("missing");
        let entries = dir_entries(&dir.path.join("nope")).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn remove_file_idempotent_tolerates_absent() {
        let dir = TempDir::new("unlink");
        let path = dir.path.join("ghost");
        remove_file_idempotent(&path).unwrap();
        fs::write(&path, b"x").unwrap();
        remove_file_idempotent(&path).unwrap();
        assert!(!path.exists());
    }
}
