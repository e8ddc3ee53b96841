//! Object and stream digesting.
//!
//! Objects are addressed by the digest of `"<kind> <len>\0" || payload`.
//! Pack files carry a trailing digest over every preceding byte. Both are
//! computed here so callers never assemble header bytes by hand.
//!
//! The hasher is SHA-1 for `ObjectFormat::Sha1` repositories; SHA-256
//! support is reserved and rejected at construction until the rest of the
//! on-disk format catches up.

use sha1::{Digest, Sha1};

use crate::object::ObjectKind;
use crate::object_id::{ObjectFormat, ObjectId};

/// Streaming digest over arbitrary bytes.
///
/// Used for pack trailers and for digesting object payloads that are
/// produced in chunks (e.g. during delta reconstruction).
#[derive(Clone)]
pub struct StreamDigest {
    inner: Sha1,
}

impl StreamDigest {
    /// Creates a streaming digest for the given format.
    ///
    /// # Panics
    /// Panics for `ObjectFormat::Sha256`, which has no on-disk support yet.
    #[must_use]
    pub fn new(format: ObjectFormat) -> Self {
        assert!(
            matches!(format, ObjectFormat::Sha1),
            "SHA-256 repositories are not supported yet"
        );
        Self { inner: Sha1::new() }
    }

    /// Absorbs more input bytes.
    #[inline]
    pub fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    /// Finalizes and returns the digest.
    #[must_use]
    pub fn finalize(self) -> ObjectId {
        let digest = self.inner.finalize();
        ObjectId::from_slice(&digest)
    }
}

impl std::fmt::Debug for StreamDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StreamDigest(sha1)")
    }
}

/// Computes the digest of an object from its kind and inflated payload.
///
/// The canonical preimage is `"<kind> <len>\0"` followed by the payload;
/// equal payloads of the same kind always produce equal digests.
#[must_use]
pub fn object_id(format: ObjectFormat, kind: ObjectKind, payload: &[u8]) -> ObjectId {
    let mut hasher = StreamDigest::new(format);
    hasher.update(kind.as_bytes());
    hasher.update(b" ");
    let mut len_buf = itoa_u64(payload.len() as u64);
    len_buf.push(0);
    hasher.update(&len_buf);
    hasher.update(payload);
    hasher.finalize()
}

/// Formats a u64 as ASCII decimal without going through `fmt`.
pub(crate) fn itoa_u64(mut value: u64) -> Vec<u8> {
    if value == 0 {
        return vec![b'0'];
    }
    let mut digits = [0u8; 20];
    let mut at = digits.len();
    while value > 0 {
        at -= 1;
        digits[at] = b'0' + (value % 10) as u8;
        value /= 10;
    }
    digits[at..].to_vec()
}
