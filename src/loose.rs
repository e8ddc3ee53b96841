//! Loose object backend.
//!
//! One object per file at `objects/<hh>/<38hex>`, holding the deflated
//! canonical bytes (`"<kind> <len>\0" || payload`). Writes go to the
//! scratch directory first and are renamed into place, so a loose file is
//! either complete or absent. Writing an object that already exists is a
//! no-op with the same digest.
//!
//! `size` parses only the header out of the compressed stream; bodies are
//! never inflated for size queries.

use std::path::{Path, PathBuf};

use crate::codec;
use crate::digest;
use crate::errors::LooseError;
use crate::fsys;
use crate::object::{self, Object, ObjectKind};
use crate::object_id::{ObjectFormat, ObjectId};

/// Bytes of compressed input that always cover a loose header.
const HEADER_PREFIX_BYTES: usize = 32;

/// Upper bound for a loose file read (1 GiB).
const MAX_LOOSE_FILE: u64 = 1024 * 1024 * 1024;

/// The loose backend rooted at an `objects/` directory.
#[derive(Debug)]
pub struct LooseStore {
    objects_dir: PathBuf,
    tmp_dir: PathBuf,
    format: ObjectFormat,
    level: u32,
}

impl LooseStore {
    /// Creates a backend over `objects/` with a scratch directory.
    ///
    /// Directories are created on first write, not here.
    #[must_use]
    pub fn new(objects_dir: PathBuf, tmp_dir: PathBuf, format: ObjectFormat, level: u32) -> Self {
        Self {
            objects_dir,
            tmp_dir,
            format,
            level,
        }
    }

    /// Returns the path a digest maps to.
    #[must_use]
    pub fn path_for(&self, oid: &ObjectId) -> PathBuf {
        let hex = oid.to_hex();
        self.objects_dir.join(&hex[..2]).join(&hex[2..])
    }

    /// Returns true if a loose file exists for the digest.
    #[must_use]
    pub fn contains(&self, oid: &ObjectId) -> bool {
        self.path_for(oid).is_file()
    }

    /// Lists every digest stored loose.
    ///
    /// Walks the two-hex-digit fan directories; files with non-hex names
    /// are ignored.
    pub fn list(&self) -> Result<Vec<ObjectId>, LooseError> {
        let mut out = Vec::new();
        for shard in fsys::dir_entries(&self.objects_dir)? {
            let Some(prefix) = hex_component(&shard, 2) else {
                continue;
            };
            for file in fsys::dir_entries(&shard)? {
                let Some(rest) = hex_component(&file, self.format.hex_len() as usize - 2) else {
                    continue;
                };
                let mut hex = prefix.clone();
                hex.push_str(&rest);
                if let Ok(oid) = ObjectId::from_hex(hex.as_bytes()) {
                    out.push(oid);
                }
            }
        }
        Ok(out)
    }

    /// Reads and decodes an object.
    pub fn read(&self, oid: &ObjectId) -> Result<Object, LooseError> {
        let (kind, payload) = self.read_raw(oid)?;
        Ok(Object::decode(kind, &payload, self.format)?)
    }

    /// Reads an object's kind and inflated payload without decoding.
    ///
    /// Returns `Ok(None)` when no loose file exists, matching the probe
    /// semantics pack readers rely on for delta bases.
    pub fn read_inflated(
        &self,
        oid: &ObjectId,
    ) -> Result<Option<(ObjectKind, Vec<u8>)>, LooseError> {
        let mut payload = Vec::new();
        match self.read_inflated_into(&mut payload, oid) {
            Ok(kind) => Ok(Some((kind, payload))),
            Err(LooseError::NotFound { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Reads an object's inflated payload into a caller-provided buffer.
    ///
    /// The buffer is cleared first; its capacity is reused, which matters
    /// when the caller is reconstructing delta chains and already knows
    /// the payload size.
    pub fn read_inflated_into(
        &self,
        payload: &mut Vec<u8>,
        oid: &ObjectId,
    ) -> Result<ObjectKind, LooseError> {
        let (kind, body) = self.read_raw(oid)?;
        payload.clear();
        payload.extend_from_slice(&body);
        Ok(kind)
    }

    /// Returns the inflated payload size from the header alone.
    ///
    /// Only a small prefix of the compressed stream is inflated; the body
    /// is never touched.
    pub fn size(&self, oid: &ObjectId) -> Result<u64, LooseError> {
        let compressed = self.open(oid)?;
        let mut prefix = Vec::with_capacity(HEADER_PREFIX_BYTES);
        codec::inflate_prefix(&compressed, &mut prefix, HEADER_PREFIX_BYTES)?;
        let (_, size, _) = object::parse_header(&prefix)?;
        Ok(size)
    }

    /// Returns the kind from the header alone.
    pub fn kind(&self, oid: &ObjectId) -> Result<ObjectKind, LooseError> {
        let compressed = self.open(oid)?;
        let mut prefix = Vec::with_capacity(HEADER_PREFIX_BYTES);
        codec::inflate_prefix(&compressed, &mut prefix, HEADER_PREFIX_BYTES)?;
        let (kind, _, _) = object::parse_header(&prefix)?;
        Ok(kind)
    }

    /// Serializes and writes an object; idempotent for equal objects.
    ///
    /// Returns the digest and the number of bytes written to disk.
    pub fn write(&self, object: &Object) -> Result<(ObjectId, u32), LooseError> {
        let payload = object.payload();
        self.write_inflated_sized(object.kind(), &payload)
    }

    /// Writes an object given its kind and inflated payload.
    pub fn write_inflated(
        &self,
        kind: ObjectKind,
        payload: &[u8],
    ) -> Result<ObjectId, LooseError> {
        self.write_inflated_sized(kind, payload).map(|(oid, _)| oid)
    }

    fn write_inflated_sized(
        &self,
        kind: ObjectKind,
        payload: &[u8],
    ) -> Result<(ObjectId, u32), LooseError> {
        let oid = digest::object_id(self.format, kind, payload);
        let dest = self.path_for(&oid);

        // Same digest, same canonical bytes; the write is a no-op.
        if dest.is_file() {
            return Ok((oid, 0));
        }

        let mut canonical = object::encode_header(kind, payload.len() as u64);
        canonical.extend_from_slice(payload);

        let mut compressed = Vec::with_capacity(canonical.len() / 2 + 64);
        codec::deflate_all(&canonical, &mut compressed, self.level)?;

        if let Some(parent) = dest.parent() {
            fsys::create_dir_all(parent)?;
        }
        fsys::create_dir_all(&self.tmp_dir)?;
        fsys::write_atomic(&dest, &self.tmp_dir, &compressed)?;

        Ok((oid, compressed.len() as u32))
    }

    /// Reads the compressed file for a digest.
    fn open(&self, oid: &ObjectId) -> Result<Vec<u8>, LooseError> {
        let path = self.path_for(oid);
        if !path.is_file() {
            return Err(LooseError::NotFound { oid: *oid });
        }
        Ok(fsys::read_file_bounded(&path, MAX_LOOSE_FILE)?)
    }

    /// Reads, inflates, and splits a loose file into kind and payload.
    fn read_raw(&self, oid: &ObjectId) -> Result<(ObjectKind, Vec<u8>), LooseError> {
        let compressed = self.open(oid)?;

        // Header first, so the body allocation is exact.
        let mut prefix = Vec::with_capacity(HEADER_PREFIX_BYTES);
        codec::inflate_prefix(&compressed, &mut prefix, HEADER_PREFIX_BYTES)?;
        let (kind, size, header_len) = object::parse_header(&prefix)?;

        let total = header_len as u64 + size;
        let mut inflated = Vec::with_capacity(total as usize);
        codec::inflate_exact(&compressed, &mut inflated, total as usize)?;

        Ok((kind, inflated.split_off(header_len)))
    }
}

/// Extracts a lowercase-hex path component of the expected length.
fn hex_component(path: &Path, len: usize) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    if name.len() == len && name.bytes().all(|b| b.is_ascii_hexdigit()) {
        Some(name.to_ascii_lowercase())
    } else {
        None
    }
}
