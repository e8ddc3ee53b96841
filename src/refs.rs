//! The reference store: symbolic names to digests.
//!
//! References live as one file per name under the repository root
//! (`refs/heads/main`, `HEAD`, ...), each holding either a hex digest or
//! a `ref: <name>` pointer, shadowing the optional `packed-refs` side
//! file that stores many references in one text table.
//!
//! # Read Algorithm
//! Per-file first; if absent, the packed-refs shadow; otherwise
//! `NotFound`. After a successful write or remove, the per-file state and
//! packed-refs are consistent: a written name is dropped from packed-refs
//! (the file now shadows it), a removed name is gone from both.
//!
//! # packed-refs Format
//! ```text
//! # pack-refs with: peeled fully-peeled sorted
//! <hex-digest> <name>
//! ^<hex-digest>        (peeled target of the preceding tag ref)
//! ```
//!
//! Rewrites are temp + atomic rename; readers observe the old or new
//! table, never a torn one. The in-memory shadow is invalidated on every
//! rewrite.
//!
//! Symbolic chains are bounded to 10 hops; longer chains (cycles) fail
//! with `ChainTooDeep`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use memchr::memchr;

use crate::errors::RefError;
use crate::fsys;
use crate::object_id::ObjectId;

/// Hop bound for symbolic reference chains.
const MAX_SYMBOLIC_HOPS: usize = 10;

/// Size bound for any single ref file.
const MAX_REF_FILE: u64 = 64 * 1024;

/// Size bound for packed-refs.
const MAX_PACKED_REFS: u64 = 64 * 1024 * 1024;

/// Content HEAD is initialized with.
pub const HEAD_DEFAULT: &str = "ref: refs/heads/master";

/// A reference's stored value: a digest or another reference name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefValue {
    /// Direct reference to an object.
    Direct(ObjectId),
    /// Symbolic reference to another name.
    Symbolic(String),
}

impl RefValue {
    /// Parses one ref file line (without trailing newline).
    fn parse(line: &[u8]) -> Result<Self, RefError> {
        if let Some(target) = line.strip_prefix(b"ref: ") {
            let name = std::str::from_utf8(target)
                .map_err(|_| RefError::Decode {
                    detail: "symbolic target is not UTF-8",
                })?
                .trim()
                .to_owned();
            return Ok(Self::Symbolic(name));
        }
        let oid = ObjectId::from_hex(trim_ascii(line))?;
        Ok(Self::Direct(oid))
    }

    /// Encodes the on-disk file content, newline-terminated.
    #[must_use]
    fn encode(&self) -> Vec<u8> {
        match self {
            Self::Direct(oid) => {
                let mut out = oid.to_hex().into_bytes();
                out.push(b'\n');
                out
            }
            Self::Symbolic(name) => format!("ref: {name}\n").into_bytes(),
        }
    }
}

/// One packed-refs entry: the digest plus an optional peeled tag target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct PackedEntry {
    oid: ObjectId,
    peeled: Option<ObjectId>,
}

/// Parsed packed-refs table.
#[derive(Clone, Debug, Default)]
struct PackedRefs {
    entries: BTreeMap<String, PackedEntry>,
}

impl PackedRefs {
    fn parse(bytes: &[u8]) -> Result<Self, RefError> {
        let mut entries: BTreeMap<String, PackedEntry> = BTreeMap::new();
        let mut last: Option<String> = None;

        for line in split_lines(bytes) {
            if line.is_empty() || line[0] == b'#' {
                continue;
            }
            if line[0] == b'^' {
                let peeled = ObjectId::from_hex(trim_ascii(&line[1..]))?;
                let name = last.as_ref().ok_or(RefError::Decode {
                    detail: "peeled line without a preceding ref",
                })?;
                if let Some(entry) = entries.get_mut(name) {
                    entry.peeled = Some(peeled);
                }
                continue;
            }

            let space = memchr(b' ', line).ok_or(RefError::Decode {
                detail: "packed-refs line missing space",
            })?;
            let oid = ObjectId::from_hex(&line[..space])?;
            let name = std::str::from_utf8(trim_ascii(&line[space + 1..]))
                .map_err(|_| RefError::Decode {
                    detail: "packed-refs name is not UTF-8",
                })?
                .to_owned();
            entries.insert(name.clone(), PackedEntry { oid, peeled: None });
            last = Some(name);
        }

        Ok(Self { entries })
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.entries.len() * 64);
        out.extend_from_slice(b"# pack-refs with: peeled fully-peeled sorted \n");
        for (name, entry) in &self.entries {
            out.extend_from_slice(entry.oid.to_hex().as_bytes());
            out.push(b' ');
            out.extend_from_slice(name.as_bytes());
            out.push(b'\n');
            if let Some(peeled) = entry.peeled {
                out.push(b'^');
                out.extend_from_slice(peeled.to_hex().as_bytes());
                out.push(b'\n');
            }
        }
        out
    }
}

/// The reference store rooted at a repository directory.
#[derive(Debug)]
pub struct RefStore {
    root: PathBuf,
    tmp_dir: PathBuf,
    /// Shadow of packed-refs; `None` means not yet loaded.
    packed: RwLock<Option<Arc<PackedRefs>>>,
}

impl RefStore {
    /// Creates a store over a repository root.
    #[must_use]
    pub fn new(root: PathBuf, tmp_dir: PathBuf) -> Self {
        Self {
            root,
            tmp_dir,
            packed: RwLock::new(None),
        }
    }

    /// Writes the default `HEAD` if none exists.
    pub fn init_head(&self) -> Result<(), RefError> {
        let head = self.root.join("HEAD");
        if head.is_file() {
            return Ok(());
        }
        fsys::create_dir_all(&self.root)?;
        fsys::create_dir_all(&self.tmp_dir)?;
        fsys::write_atomic(&head, &self.tmp_dir, format!("{HEAD_DEFAULT}\n").as_bytes())?;
        Ok(())
    }

    /// Returns true if the name resolves to a stored value.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.read(name).is_ok()
    }

    /// Reads a reference's stored value (one level, no chain following).
    pub fn read(&self, name: &str) -> Result<RefValue, RefError> {
        validate_name(name)?;

        let path = self.root.join(name);
        if path.is_file() {
            let bytes = fsys::read_file_bounded(&path, MAX_REF_FILE)?;
            return RefValue::parse(first_line(&bytes));
        }

        let packed = self.packed_shadow()?;
        match packed.entries.get(name) {
            Some(entry) => Ok(RefValue::Direct(entry.oid)),
            None => Err(RefError::NotFound {
                name: name.to_owned(),
            }),
        }
    }

    /// Resolves a name through symbolic links to a digest.
    pub fn resolve(&self, name: &str) -> Result<ObjectId, RefError> {
        let mut current = name.to_owned();
        for _ in 0..MAX_SYMBOLIC_HOPS {
            match self.read(&current)? {
                RefValue::Direct(oid) => return Ok(oid),
                RefValue::Symbolic(next) => current = next,
            }
        }
        Err(RefError::ChainTooDeep {
            name: name.to_owned(),
        })
    }

    /// Writes a reference.
    ///
    /// The per-file form is written atomically; any packed-refs entry of
    /// the same name is dropped since the file now shadows it.
    pub fn write(&self, name: &str, value: &RefValue) -> Result<(), RefError> {
        validate_name(name)?;

        let path = self.root.join(name);
        if let Some(parent) = path.parent() {
            fsys::create_dir_all(parent)?;
        }
        fsys::create_dir_all(&self.tmp_dir)?;
        fsys::write_atomic(&path, &self.tmp_dir, &value.encode())?;

        let packed = self.packed_shadow()?;
        if packed.entries.contains_key(name) {
            let mut next = (*packed).clone();
            next.entries.remove(name);
            self.rewrite_packed(next)?;
        }
        Ok(())
    }

    /// Writes a direct reference to a digest.
    pub fn write_oid(&self, name: &str, oid: &ObjectId) -> Result<(), RefError> {
        self.write(name, &RefValue::Direct(*oid))
    }

    /// Removes a reference from both the per-file and packed forms.
    ///
    /// Removing an absent reference is an error; removing one that exists
    /// in either form succeeds and leaves it in neither.
    pub fn remove(&self, name: &str) -> Result<(), RefError> {
        validate_name(name)?;

        let path = self.root.join(name);
        let file_existed = path.is_file();
        if file_existed {
            fsys::remove_file_idempotent(&path)?;
        }

        let packed = self.packed_shadow()?;
        let packed_existed = packed.entries.contains_key(name);
        if packed_existed {
            let mut next = (*packed).clone();
            next.entries.remove(name);
            self.rewrite_packed(next)?;
        }

        if file_existed || packed_existed {
            Ok(())
        } else {
            Err(RefError::NotFound {
                name: name.to_owned(),
            })
        }
    }

    /// Lists reference names under `refs/`, including packed-only ones.
    pub fn list(&self) -> Result<Vec<String>, RefError> {
        let mut names = Vec::new();
        walk_ref_files(&self.root, &self.root.join("refs"), &mut names)?;
        for name in self.packed_shadow()?.entries.keys() {
            names.push(name.clone());
        }
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Builds the full reference graph.
    ///
    /// Walks `refs/` plus `HEAD`, layers packed-refs underneath, then
    /// resolves symbolic chains up to the hop bound. Chains that do not
    /// terminate in a digest stay symbolic in the output.
    pub fn graph(&self) -> Result<BTreeMap<String, RefValue>, RefError> {
        let mut graph: BTreeMap<String, RefValue> = BTreeMap::new();

        let mut file_names = Vec::new();
        walk_ref_files(&self.root, &self.root.join("refs"), &mut file_names)?;
        if self.root.join("HEAD").is_file() {
            file_names.push("HEAD".to_owned());
        }
        for name in file_names {
            let bytes = fsys::read_file_bounded(&self.root.join(&name), MAX_REF_FILE)?;
            graph.insert(name, RefValue::parse(first_line(&bytes))?);
        }

        for (name, entry) in &self.packed_shadow()?.entries {
            graph
                .entry(name.clone())
                .or_insert(RefValue::Direct(entry.oid));
        }

        // Resolve symbolic chains in place; unresolved ones stay as they
        // are.
        let names: Vec<String> = graph.keys().cloned().collect();
        for name in names {
            if let Some(oid) = normalize(&graph, &name) {
                graph.insert(name, RefValue::Direct(oid));
            }
        }
        Ok(graph)
    }

    /// Re-reads packed-refs from disk on next access.
    pub fn invalidate_shadow(&self) {
        *self.packed.write().expect("packed shadow poisoned") = None;
    }

    fn packed_path(&self) -> PathBuf {
        self.root.join("packed-refs")
    }

    /// Returns the packed-refs shadow, loading it on first use.
    fn packed_shadow(&self) -> Result<Arc<PackedRefs>, RefError> {
        if let Some(shadow) = self.packed.read().expect("packed shadow poisoned").clone() {
            return Ok(shadow);
        }

        let path = self.packed_path();
        let parsed = if path.is_file() {
            PackedRefs::parse(&fsys::read_file_bounded(&path, MAX_PACKED_REFS)?)?
        } else {
            PackedRefs::default()
        };
        let shadow = Arc::new(parsed);
        *self.packed.write().expect("packed shadow poisoned") = Some(Arc::clone(&shadow));
        Ok(shadow)
    }

    /// Atomically replaces packed-refs and the shadow.
    fn rewrite_packed(&self, next: PackedRefs) -> Result<(), RefError> {
        let mut guard = self.packed.write().expect("packed shadow poisoned");
        fsys::create_dir_all(&self.tmp_dir)?;
        fsys::write_atomic(&self.packed_path(), &self.tmp_dir, &next.encode())?;
        *guard = Some(Arc::new(next));
        Ok(())
    }

    /// Replaces the whole packed-refs table.
    ///
    /// For callers that maintain the packed form directly, e.g. after
    /// bulk-importing references.
    pub fn write_packed_table(
        &self,
        entries: impl IntoIterator<Item = (String, ObjectId)>,
    ) -> Result<(), RefError> {
        let mut table = PackedRefs::default();
        for (name, oid) in entries {
            validate_name(&name)?;
            table
                .entries
                .insert(name, PackedEntry { oid, peeled: None });
        }
        self.rewrite_packed(table)
    }
}

/// Follows a chain through a graph snapshot to a digest.
///
/// Returns `None` when the chain leaves the graph, exceeds the hop
/// bound, or cycles.
#[must_use]
pub fn normalize(graph: &BTreeMap<String, RefValue>, name: &str) -> Option<ObjectId> {
    let mut current = name;
    for _ in 0..MAX_SYMBOLIC_HOPS {
        match graph.get(current)? {
            RefValue::Direct(oid) => return Some(*oid),
            RefValue::Symbolic(next) => current = next,
        }
    }
    None
}

/// Validates a reference name.
///
/// Accepts `HEAD` and slash-separated names with non-empty components;
/// rejects traversal, control bytes, and the characters the ref format
/// reserves.
fn validate_name(name: &str) -> Result<(), RefError> {
    let invalid = || RefError::InvalidReference {
        name: name.to_owned(),
    };

    if name == "HEAD" {
        return Ok(());
    }
    if name.is_empty() || name.starts_with('/') || name.ends_with('/') {
        return Err(invalid());
    }
    if name.ends_with(".lock") || name.contains("..") || name.contains("//") {
        return Err(invalid());
    }
    for byte in name.bytes() {
        match byte {
            0x00..=0x1f | 0x7f | b' ' | b'~' | b'^' | b':' | b'?' | b'*' | b'[' | b'\\' => {
                return Err(invalid())
            }
            _ => {}
        }
    }
    Ok(())
}

/// Collects relative ref file names under `dir`, recursively.
fn walk_ref_files(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<(), RefError> {
    for entry in fsys::dir_entries(dir)? {
        if entry.is_dir() {
            walk_ref_files(root, &entry, out)?;
        } else if entry.is_file() {
            let Ok(rel) = entry.strip_prefix(root) else {
                continue;
            };
            if let Some(name) = rel.to_str() {
                out.push(name.replace(std::path::MAIN_SEPARATOR, "/"));
            }
        }
    }
    Ok(())
}

fn first_line(bytes: &[u8]) -> &[u8] {
    match memchr(b'\n', bytes) {
        Some(at) => &bytes[..at],
        None => bytes,
    }
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |p| p + 1);
    &bytes[start..end]
}

fn split_lines(bytes: &[u8]) -> impl Iterator<Item = &[u8]> {
    bytes.split(|&b| b == b'\n').map(|line| {
        line.strip_suffix(b"\r").unwrap_or(line)
    })
}
