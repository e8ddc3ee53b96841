//! Error types for the store's stages.
//!
//! Errors are stage-specific to keep diagnostics precise; the top-level
//! `StoreError` union is what the façade returns, widening whichever stage
//! failed. All enums are `#[non_exhaustive]` so variants can be added
//! without breaking callers; consumers should include a fallback arm.
//!
//! Variants with `detail` carry human-readable context and are not stable
//! for machine parsing. I/O errors preserve their source.

use std::fmt;
use std::io;

use crate::codec::{DeflateError, InflateError};
use crate::fsys::FsError;
use crate::object::ObjectDecodeError;
use crate::object_id::{HexError, ObjectId};
use crate::pack_idx::{IdxEncodeError, IdxError};
use crate::pack_info::PackInfoError;
use crate::pack_reader::PackReadError;
use crate::pack_writer::PlanError;

/// Errors from the loose object backend.
#[derive(Debug)]
#[non_exhaustive]
pub enum LooseError {
    /// No loose file exists for the OID.
    NotFound { oid: ObjectId },
    /// The object header or payload is malformed.
    Decode(ObjectDecodeError),
    /// The loose file failed to inflate.
    Inflate(InflateError),
    /// Compressing an object for writing failed.
    Deflate(DeflateError),
    /// Filesystem failure.
    Fs(FsError),
}

impl fmt::Display for LooseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { oid } => write!(f, "loose object not found: {oid}"),
            Self::Decode(err) => write!(f, "{err}"),
            Self::Inflate(err) => write!(f, "{err}"),
            Self::Deflate(err) => write!(f, "{err}"),
            Self::Fs(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for LooseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Decode(err) => Some(err),
            Self::Inflate(err) => Some(err),
            Self::Deflate(err) => Some(err),
            Self::Fs(err) => Some(err),
            Self::NotFound { .. } => None,
        }
    }
}

impl From<ObjectDecodeError> for LooseError {
    fn from(err: ObjectDecodeError) -> Self {
        Self::Decode(err)
    }
}

impl From<InflateError> for LooseError {
    fn from(err: InflateError) -> Self {
        Self::Inflate(err)
    }
}

impl From<DeflateError> for LooseError {
    fn from(err: DeflateError) -> Self {
        Self::Deflate(err)
    }
}

impl From<FsError> for LooseError {
    fn from(err: FsError) -> Self {
        Self::Fs(err)
    }
}

/// Errors from the reference store.
#[derive(Debug)]
#[non_exhaustive]
pub enum RefError {
    /// The reference does not exist.
    NotFound { name: String },
    /// The reference name is not acceptable.
    InvalidReference { name: String },
    /// A ref or packed-refs file is malformed.
    Decode { detail: &'static str },
    /// A stored digest failed to parse.
    Hex(HexError),
    /// Symbolic chain exceeded the hop limit.
    ChainTooDeep { name: String },
    /// Filesystem failure.
    Fs(FsError),
}

impl fmt::Display for RefError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { name } => write!(f, "reference not found: {name}"),
            Self::InvalidReference { name } => write!(f, "invalid reference name: {name}"),
            Self::Decode { detail } => write!(f, "malformed reference data: {detail}"),
            Self::Hex(err) => write!(f, "{err}"),
            Self::ChainTooDeep { name } => {
                write!(f, "symbolic reference chain too deep at {name}")
            }
            Self::Fs(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for RefError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Hex(err) => Some(err),
            Self::Fs(err) => Some(err),
            _ => None,
        }
    }
}

impl From<HexError> for RefError {
    fn from(err: HexError) -> Self {
        Self::Hex(err)
    }
}

impl From<FsError> for RefError {
    fn from(err: FsError) -> Self {
        Self::Fs(err)
    }
}

/// Errors from pack ingestion.
#[derive(Debug)]
#[non_exhaustive]
pub enum IngestError {
    /// The upstream stream made no progress for too many reads.
    Stalled { reads: u32 },
    /// First-pass scanning or entry resolution failed.
    Info(PackInfoError),
    /// Index encoding failed.
    IdxEncode(IdxEncodeError),
    /// Index validation failed after writing.
    Idx(IdxError),
    /// The freshly published pack failed registration.
    Register(PackReadError),
    /// Filesystem failure.
    Fs(FsError),
    /// Reading the incoming stream failed.
    Io(io::Error),
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stalled { reads } => {
                write!(f, "incoming pack stream stalled after {reads} empty reads")
            }
            Self::Info(err) => write!(f, "{err}"),
            Self::IdxEncode(err) => write!(f, "{err}"),
            Self::Idx(err) => write!(f, "{err}"),
            Self::Register(err) => write!(f, "{err}"),
            Self::Fs(err) => write!(f, "{err}"),
            Self::Io(err) => write!(f, "pack stream error: {err}"),
        }
    }
}

impl std::error::Error for IngestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Info(err) => Some(err),
            Self::IdxEncode(err) => Some(err),
            Self::Idx(err) => Some(err),
            Self::Register(err) => Some(err),
            Self::Fs(err) => Some(err),
            Self::Io(err) => Some(err),
            Self::Stalled { .. } => None,
        }
    }
}

impl From<PackInfoError> for IngestError {
    fn from(err: PackInfoError) -> Self {
        Self::Info(err)
    }
}

impl From<IdxEncodeError> for IngestError {
    fn from(err: IdxEncodeError) -> Self {
        Self::IdxEncode(err)
    }
}

impl From<IdxError> for IngestError {
    fn from(err: IdxError) -> Self {
        Self::Idx(err)
    }
}

impl From<FsError> for IngestError {
    fn from(err: FsError) -> Self {
        Self::Fs(err)
    }
}

impl From<io::Error> for IngestError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

/// The store-wide error union returned by the façade.
#[derive(Debug)]
#[non_exhaustive]
pub enum StoreError {
    /// The object exists in no backend.
    NotFound { oid: ObjectId },
    /// Loose backend failure.
    Loose(LooseError),
    /// Packed backend failure.
    Pack(PackReadError),
    /// Reference store failure.
    Ref(RefError),
    /// Ingestion failure.
    Ingest(IngestError),
    /// Pack planning or encoding failure.
    Plan(PlanError),
    /// Object decoding failure outside a specific backend.
    Decode(ObjectDecodeError),
    /// Filesystem failure.
    Fs(FsError),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { oid } => write!(f, "object not found: {oid}"),
            Self::Loose(err) => write!(f, "{err}"),
            Self::Pack(err) => write!(f, "{err}"),
            Self::Ref(err) => write!(f, "{err}"),
            Self::Ingest(err) => write!(f, "{err}"),
            Self::Plan(err) => write!(f, "{err}"),
            Self::Decode(err) => write!(f, "{err}"),
            Self::Fs(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Loose(err) => Some(err),
            Self::Pack(err) => Some(err),
            Self::Ref(err) => Some(err),
            Self::Ingest(err) => Some(err),
            Self::Plan(err) => Some(err),
            Self::Decode(err) => Some(err),
            Self::Fs(err) => Some(err),
            Self::NotFound { .. } => None,
        }
    }
}

impl StoreError {
    /// Returns true for any flavor of "the thing is absent".
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. }
                | Self::Loose(LooseError::NotFound { .. })
                | Self::Ref(RefError::NotFound { .. })
        )
    }
}

impl From<LooseError> for StoreError {
    fn from(err: LooseError) -> Self {
        Self::Loose(err)
    }
}

impl From<PackReadError> for StoreError {
    fn from(err: PackReadError) -> Self {
        Self::Pack(err)
    }
}

impl From<RefError> for StoreError {
    fn from(err: RefError) -> Self {
        Self::Ref(err)
    }
}

impl From<IngestError> for StoreError {
    fn from(err: IngestError) -> Self {
        Self::Ingest(err)
    }
}

impl From<PlanError> for StoreError {
    fn from(err: PlanError) -> Self {
        Self::Plan(err)
    }
}

impl From<ObjectDecodeError> for StoreError {
    fn from(err: ObjectDecodeError) -> Self {
        Self::Decode(err)
    }
}

impl From<FsError> for StoreError {
    fn from(err: FsError) -> Self {
        Self::Fs(err)
    }
}
