//! The object model: commits, trees, tags, and blobs.
//!
//! Each kind has a canonical payload encoding; the store addresses an
//! object by the digest of `"<kind> <len>\0" || payload`. Decoding parses
//! the headers a store needs to walk the object graph (tree pointer,
//! parents, tag target) and carries everything after the known headers
//! verbatim, so `decode` then `encode` reproduces the input bytes exactly
//! and the digest is preserved.
//!
//! # Commit Format
//! ```text
//! tree <hex-oid>\n
//! parent <hex-oid>\n   (zero or more)
//! author <ident>\n
//! committer <ident>\n
//! [extra headers]\n
//! \n
//! <message>
//! ```
//!
//! # Tag Format
//! ```text
//! object <hex-oid>\n
//! type <kind>\n
//! tag <name>\n
//! [tagger <ident>\n]
//! \n
//! <message>
//! ```

use std::fmt;

use memchr::memchr;

use crate::digest;
use crate::object_id::{HexError, ObjectFormat, ObjectId};
use crate::tree_entry::{TreeEntry, TreeEntryIter};

/// The four stored object kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Commit,
    Tree,
    Blob,
    Tag,
}

impl ObjectKind {
    /// Returns the canonical kind name as bytes.
    #[inline]
    #[must_use]
    pub const fn as_bytes(self) -> &'static [u8] {
        match self {
            Self::Commit => b"commit",
            Self::Tree => b"tree",
            Self::Blob => b"blob",
            Self::Tag => b"tag",
        }
    }

    /// Returns the canonical kind name.
    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Commit => "commit",
            Self::Tree => "tree",
            Self::Blob => "blob",
            Self::Tag => "tag",
        }
    }

    /// Parses a kind name.
    #[must_use]
    pub fn from_name(name: &[u8]) -> Option<Self> {
        match name {
            b"commit" => Some(Self::Commit),
            b"tree" => Some(Self::Tree),
            b"blob" => Some(Self::Blob),
            b"tag" => Some(Self::Tag),
            _ => None,
        }
    }

    /// Returns the pack entry type code for this kind.
    #[inline]
    #[must_use]
    pub const fn pack_code(self) -> u8 {
        match self {
            Self::Commit => 1,
            Self::Tree => 2,
            Self::Blob => 3,
            Self::Tag => 4,
        }
    }

    /// Parses a pack entry type code for a non-delta kind.
    #[must_use]
    pub const fn from_pack_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Commit),
            2 => Some(Self::Tree),
            3 => Some(Self::Blob),
            4 => Some(Self::Tag),
            _ => None,
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from object decoding.
#[derive(Debug)]
#[non_exhaustive]
pub enum ObjectDecodeError {
    /// Payload bytes are malformed.
    Corrupt { detail: &'static str },
    /// A hex OID field failed to decode.
    Hex(HexError),
    /// The `"<kind> <len>\0"` header is malformed.
    BadHeader { detail: &'static str },
    /// The header length disagrees with the payload length.
    SizeMismatch { header: u64, actual: u64 },
}

impl fmt::Display for ObjectDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Corrupt { detail } => write!(f, "corrupt object: {detail}"),
            Self::Hex(err) => write!(f, "{err}"),
            Self::BadHeader { detail } => write!(f, "bad object header: {detail}"),
            Self::SizeMismatch { header, actual } => {
                write!(f, "object size mismatch: header says {header}, got {actual}")
            }
        }
    }
}

impl std::error::Error for ObjectDecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Hex(err) => Some(err),
            _ => None,
        }
    }
}

impl From<HexError> for ObjectDecodeError {
    fn from(err: HexError) -> Self {
        Self::Hex(err)
    }
}

/// A commit object.
///
/// `author`, `committer`, and `trailer` hold raw bytes: identity lines are
/// carried without the `"author "`/`"committer "` prefix or newline, and
/// `trailer` is everything after the committer line (extra headers, the
/// blank separator, and the message), preserved verbatim.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Commit {
    /// Root tree of this commit.
    pub tree: ObjectId,
    /// Parent commits (empty for root commits).
    pub parents: Vec<ObjectId>,
    /// Author identity line.
    pub author: Vec<u8>,
    /// Committer identity line.
    pub committer: Vec<u8>,
    /// Remaining payload after the committer line.
    pub trailer: Vec<u8>,
}

impl Commit {
    /// Returns the commit message, skipping extra headers.
    #[must_use]
    pub fn message(&self) -> &[u8] {
        match find_blank_line(&self.trailer) {
            Some(at) => &self.trailer[at..],
            None => &[],
        }
    }
}

/// A tree object: an ordered list of entries.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tree {
    /// Entries in stored order.
    pub entries: Vec<TreeEntry>,
}

/// A tag object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tag {
    /// The tagged object.
    pub target: ObjectId,
    /// Kind of the tagged object.
    pub target_kind: ObjectKind,
    /// Tag name line.
    pub name: Vec<u8>,
    /// Remaining payload after the tag line (tagger, message), verbatim.
    pub trailer: Vec<u8>,
}

/// A stored object of any kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Object {
    Commit(Commit),
    Tree(Tree),
    Tag(Tag),
    Blob(Vec<u8>),
}

impl Object {
    /// Returns the kind tag of this object.
    #[inline]
    #[must_use]
    pub const fn kind(&self) -> ObjectKind {
        match self {
            Self::Commit(_) => ObjectKind::Commit,
            Self::Tree(_) => ObjectKind::Tree,
            Self::Tag(_) => ObjectKind::Tag,
            Self::Blob(_) => ObjectKind::Blob,
        }
    }

    /// Appends the canonical payload (no header) to `out`.
    pub fn encode_payload(&self, out: &mut Vec<u8>) {
        match self {
            Self::Blob(bytes) => out.extend_from_slice(bytes),
            Self::Tree(tree) => {
                for entry in &tree.entries {
                    entry.encode(out);
                }
            }
            Self::Commit(commit) => {
                out.extend_from_slice(b"tree ");
                out.extend_from_slice(commit.tree.to_hex().as_bytes());
                out.push(b'\n');
                for parent in &commit.parents {
                    out.extend_from_slice(b"parent ");
                    out.extend_from_slice(parent.to_hex().as_bytes());
                    out.push(b'\n');
                }
                out.extend_from_slice(b"author ");
                out.extend_from_slice(&commit.author);
                out.push(b'\n');
                out.extend_from_slice(b"committer ");
                out.extend_from_slice(&commit.committer);
                out.push(b'\n');
                out.extend_from_slice(&commit.trailer);
            }
            Self::Tag(tag) => {
                out.extend_from_slice(b"object ");
                out.extend_from_slice(tag.target.to_hex().as_bytes());
                out.push(b'\n');
                out.extend_from_slice(b"type ");
                out.extend_from_slice(tag.target_kind.as_bytes());
                out.push(b'\n');
                out.extend_from_slice(b"tag ");
                out.extend_from_slice(&tag.name);
                out.push(b'\n');
                out.extend_from_slice(&tag.trailer);
            }
        }
    }

    /// Returns the canonical payload as a fresh vector.
    #[must_use]
    pub fn payload(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_payload(&mut out);
        out
    }

    /// Returns the canonical bytes including the `"<kind> <len>\0"` header.
    #[must_use]
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let payload = self.payload();
        let mut out = encode_header(self.kind(), payload.len() as u64);
        out.extend_from_slice(&payload);
        out
    }

    /// Computes this object's digest.
    #[must_use]
    pub fn id(&self, format: ObjectFormat) -> ObjectId {
        digest::object_id(format, self.kind(), &self.payload())
    }

    /// Decodes an object from its kind and canonical payload.
    ///
    /// # Errors
    /// Returns `ObjectDecodeError` on malformed payloads. Blob payloads
    /// never fail.
    pub fn decode(
        kind: ObjectKind,
        payload: &[u8],
        format: ObjectFormat,
    ) -> Result<Self, ObjectDecodeError> {
        match kind {
            ObjectKind::Blob => Ok(Self::Blob(payload.to_vec())),
            ObjectKind::Tree => {
                let mut entries = Vec::new();
                let mut iter = TreeEntryIter::new(payload, format.oid_len() as usize);
                while let Some(entry) = iter.next_entry()? {
                    entries.push(entry.to_owned()?);
                }
                Ok(Self::Tree(Tree { entries }))
            }
            ObjectKind::Commit => decode_commit(payload, format).map(Self::Commit),
            ObjectKind::Tag => decode_tag(payload, format).map(Self::Tag),
        }
    }

    /// Returns the objects this object references, for graph walks.
    #[must_use]
    pub fn references(&self) -> Vec<ObjectId> {
        match self {
            Self::Blob(_) => Vec::new(),
            Self::Tree(tree) => tree.entries.iter().map(|e| e.oid).collect(),
            Self::Commit(commit) => {
                let mut out = Vec::with_capacity(1 + commit.parents.len());
                out.push(commit.tree);
                out.extend_from_slice(&commit.parents);
                out
            }
            Self::Tag(tag) => vec![tag.target],
        }
    }
}

/// Encodes the canonical `"<kind> <len>\0"` header.
#[must_use]
pub fn encode_header(kind: ObjectKind, len: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    out.extend_from_slice(kind.as_bytes());
    out.push(b' ');
    out.extend_from_slice(&digest::itoa_u64(len));
    out.push(0);
    out
}

/// Parses a `"<kind> <len>\0"` header from the front of `bytes`.
///
/// Returns the kind, the declared payload length, and the header length in
/// bytes.
///
/// # Errors
/// Returns `BadHeader` on unknown kinds, non-decimal lengths, or a missing
/// NUL terminator within the first 32 bytes.
pub fn parse_header(bytes: &[u8]) -> Result<(ObjectKind, u64, usize), ObjectDecodeError> {
    const MAX_HEADER: usize = 32;

    let window = &bytes[..bytes.len().min(MAX_HEADER)];
    let nul = memchr(0, window).ok_or(ObjectDecodeError::BadHeader {
        detail: "missing NUL terminator",
    })?;
    let header = &window[..nul];

    let space = memchr(b' ', header).ok_or(ObjectDecodeError::BadHeader {
        detail: "missing space",
    })?;
    let kind = ObjectKind::from_name(&header[..space]).ok_or(ObjectDecodeError::BadHeader {
        detail: "unknown object kind",
    })?;

    let digits = &header[space + 1..];
    if digits.is_empty() || digits.len() > 20 {
        return Err(ObjectDecodeError::BadHeader {
            detail: "bad length field",
        });
    }
    let mut len: u64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(ObjectDecodeError::BadHeader {
                detail: "non-decimal length",
            });
        }
        len = len
            .checked_mul(10)
            .and_then(|v| v.checked_add(u64::from(b - b'0')))
            .ok_or(ObjectDecodeError::BadHeader {
                detail: "length overflow",
            })?;
    }

    Ok((kind, len, nul + 1))
}

fn decode_commit(payload: &[u8], format: ObjectFormat) -> Result<Commit, ObjectDecodeError> {
    let hex_len = format.hex_len() as usize;
    let mut pos = 0usize;

    let tree = parse_oid_line(payload, &mut pos, b"tree ", hex_len)?;

    let mut parents = Vec::new();
    while payload[pos..].starts_with(b"parent ") {
        parents.push(parse_oid_line(payload, &mut pos, b"parent ", hex_len)?);
    }

    let author = take_header_line(payload, &mut pos, b"author ")?;
    let committer = take_header_line(payload, &mut pos, b"committer ")?;
    let trailer = payload[pos..].to_vec();

    Ok(Commit {
        tree,
        parents,
        author,
        committer,
        trailer,
    })
}

fn decode_tag(payload: &[u8], format: ObjectFormat) -> Result<Tag, ObjectDecodeError> {
    let hex_len = format.hex_len() as usize;
    let mut pos = 0usize;

    let target = parse_oid_line(payload, &mut pos, b"object ", hex_len)?;
    let kind_line = take_header_line(payload, &mut pos, b"type ")?;
    let target_kind =
        ObjectKind::from_name(&kind_line).ok_or(ObjectDecodeError::Corrupt {
            detail: "tag has unknown target type",
        })?;
    let name = take_header_line(payload, &mut pos, b"tag ")?;
    let trailer = payload[pos..].to_vec();

    Ok(Tag {
        target,
        target_kind,
        name,
        trailer,
    })
}

/// Parses `"<prefix><hex-oid>\n"` at `pos`, advancing past it.
fn parse_oid_line(
    data: &[u8],
    pos: &mut usize,
    prefix: &'static [u8],
    hex_len: usize,
) -> Result<ObjectId, ObjectDecodeError> {
    if !data[*pos..].starts_with(prefix) {
        return Err(ObjectDecodeError::Corrupt {
            detail: "missing expected OID header line",
        });
    }
    *pos += prefix.len();

    if data.len() < *pos + hex_len + 1 {
        return Err(ObjectDecodeError::Corrupt {
            detail: "OID header line too short",
        });
    }
    let oid = ObjectId::from_hex(&data[*pos..*pos + hex_len])?;
    *pos += hex_len;

    if data[*pos] != b'\n' {
        return Err(ObjectDecodeError::Corrupt {
            detail: "OID header line missing newline",
        });
    }
    *pos += 1;
    Ok(oid)
}

/// Consumes `"<prefix><rest>\n"` at `pos` and returns `<rest>`.
fn take_header_line(
    data: &[u8],
    pos: &mut usize,
    prefix: &'static [u8],
) -> Result<Vec<u8>, ObjectDecodeError> {
    if !data[*pos..].starts_with(prefix) {
        return Err(ObjectDecodeError::Corrupt {
            detail: "missing expected header line",
        });
    }
    *pos += prefix.len();

    let rest = &data[*pos..];
    let newline = memchr(b'\n', rest).ok_or(ObjectDecodeError::Corrupt {
        detail: "header line missing newline",
    })?;
    let line = rest[..newline].to_vec();
    *pos += newline + 1;
    Ok(line)
}

/// Returns the offset just past the first blank line, if any.
fn find_blank_line(data: &[u8]) -> Option<usize> {
    if data.starts_with(b"\n") {
        return Some(1);
    }
    let mut at = 0;
    while let Some(nl) = memchr(b'\n', &data[at..]) {
        let next = at + nl + 1;
        if data[next..].starts_with(b"\n") {
            return Some(next + 1);
        }
        at = next;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDENT: &str = "A U Thor <au@example.com> 1700000000 +0000";

    fn sample_commit() -> Commit {
        Commit {
            tree: ObjectId::from_hex(b"4b825dc642cb6eb9a060e54bf8d69288fbee4904").unwrap(),
            parents: vec![ObjectId::sha1([0x11; 20])],
            author: IDENT.as_bytes().to_vec(),
            committer: IDENT.as_bytes().to_vec(),
            trailer: b"\ninitial import\n".to_vec(),
        }
    }

    #[test]
    fn commit_round_trip_is_byte_exact() {
        let commit = Object::Commit(sample_commit());
        let payload = commit.payload();
        let decoded = Object::decode(ObjectKind::Commit, &payload, ObjectFormat::Sha1).unwrap();
        assert_eq!(decoded, commit);
        assert_eq!(decoded.payload(), payload);
    }

    #[test]
    fn commit_with_extra_headers_round_trips() {
        let mut commit = sample_commit();
        commit.trailer = b"gpgsig -----BEGIN-----\n abc\n -----END-----\n\nsigned\n".to_vec();
        let object = Object::Commit(commit);
        let payload = object.payload();
        let decoded = Object::decode(ObjectKind::Commit, &payload, ObjectFormat::Sha1).unwrap();
        assert_eq!(decoded.payload(), payload);
    }

    #[test]
    fn commit_message_skips_headers() {
        let commit = sample_commit();
        assert_eq!(commit.message(), b"initial import\n");
    }

    #[test]
    fn root_commit_has_no_parents() {
        let mut commit = sample_commit();
        commit.parents.clear();
        let payload = Object::Commit(commit).payload();
        match Object::decode(ObjectKind::Commit, &payload, ObjectFormat::Sha1).unwrap() {
            Object::Commit(c) => assert!(c.parents.is_empty()),
            other => panic!("expected commit, got {:?}", other.kind()),
        }
    }

    #[test]
    fn tag_round_trip() {
        let tag = Object::Tag(Tag {
            target: ObjectId::sha1([0x42; 20]),
            target_kind: ObjectKind::Commit,
            name: b"v1.0".to_vec(),
            trailer: format!("tagger {IDENT}\n\nrelease\n").into_bytes(),
        });
        let payload = tag.payload();
        let decoded = Object::decode(ObjectKind::Tag, &payload, ObjectFormat::Sha1).unwrap();
        assert_eq!(decoded, tag);
    }

    #[test]
    fn tree_round_trip_preserves_order() {
        let tree = Object::Tree(Tree {
            entries: vec![
                TreeEntry {
                    mode: 0o100644,
                    name: b"a.txt".to_vec(),
                    oid: ObjectId::sha1([0x01; 20]),
                },
                TreeEntry {
                    mode: 0o040000,
                    name: b"dir".to_vec(),
                    oid: ObjectId::sha1([0x02; 20]),
                },
            ],
        });
        let payload = tree.payload();
        let decoded = Object::decode(ObjectKind::Tree, &payload, ObjectFormat::Sha1).unwrap();
        assert_eq!(decoded, tree);
    }

    #[test]
    fn blob_digest_matches_git() {
        let blob = Object::Blob(b"hello\n".to_vec());
        assert_eq!(
            blob.id(ObjectFormat::Sha1).to_hex(),
            "ce013625030ba8dba906f756967f9e9ca394464a"
        );
        assert_eq!(blob.canonical_bytes(), b"blob 6\0hello\n");
    }

    #[test]
    fn empty_tree_digest_matches_git() {
        let tree = Object::Tree(Tree::default());
        assert_eq!(
            tree.id(ObjectFormat::Sha1).to_hex(),
            "4b825dc642cb6eb9a060e54bf8d69288fbee4904"
        );
    }

    #[test]
    fn header_parse_round_trip() {
        let header = encode_header(ObjectKind::Blob, 6);
        assert_eq!(header, b"blob 6\0");
        let (kind, len, consumed) = parse_header(&header).unwrap();
        assert_eq!(kind, ObjectKind::Blob);
        assert_eq!(len, 6);
        assert_eq!(consumed, header.len());
    }

    #[test]
    fn header_rejects_garbage() {
        assert!(parse_header(b"blob6\0").is_err());
        assert!(parse_header(b"blobby 6\0").is_err());
        assert!(parse_header(b"blob x\0").is_err());
        assert!(parse_header(b"blob 6").is_err());
    }

    #[test]
    fn commit_rejects_missing_tree() {
        let err = Object::decode(ObjectKind::Commit, b"parent abc\n", ObjectFormat::Sha1);
        assert!(err.is_err());
    }

    #[test]
    fn references_cover_graph_edges() {
        let commit = sample_commit();
        let refs = Object::Commit(commit.clone()).references();
        assert_eq!(refs[0], commit.tree);
        assert_eq!(refs[1], commit.parents[0]);
        assert!(Object::Blob(Vec::new()).references().is_empty());
    }
}
