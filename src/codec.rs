//! Bounded zlib inflate and deflate.
//!
//! Every compressed byte in the store (loose files, pack entry bodies)
//! passes through these helpers. Inflation runs against hard output caps so
//! corrupt input can never balloon memory; deflation takes an explicit
//! compression level.
//!
//! # Scope
//! - Inflates zlib streams with strict size caps and precise error states.
//! - Deflates whole buffers into caller-provided output vectors.
//! - Does **not** interpret the decompressed bytes; framing is the
//!   caller's concern.
//!
//! Per-thread `Decompress`/`Compress` state and a fixed staging buffer are
//! reused across calls to avoid per-call allocations. The scratch state is
//! not re-entrant: callers must not invoke codec helpers recursively from
//! within an `inflate_stream` callback.

use std::cell::RefCell;
use std::fmt;

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

/// Staging buffer size for both directions.
const CODEC_BUF_SIZE: usize = 64 * 1024;

thread_local! {
    static INFLATE_STATE: RefCell<Decompress> = RefCell::new(Decompress::new(true));
    static DEFLATE_STATE: RefCell<Compress> =
        RefCell::new(Compress::new(Compression::default(), true));
    static CODEC_BUF: RefCell<[u8; CODEC_BUF_SIZE]> =
        const { RefCell::new([0u8; CODEC_BUF_SIZE]) };
}

fn with_inflate_scratch<F, R>(f: F) -> R
where
    F: FnOnce(&mut Decompress, &mut [u8]) -> R,
{
    INFLATE_STATE.with(|de| {
        CODEC_BUF.with(|buf| {
            let mut de = de.borrow_mut();
            de.reset(true);
            let mut buf = buf.borrow_mut();
            f(&mut de, &mut *buf)
        })
    })
}

/// Inflate error taxonomy.
#[derive(Debug, PartialEq, Eq)]
pub enum InflateError {
    /// Output would exceed the caller's cap.
    LimitExceeded,
    /// Input ended before the stream completed.
    TruncatedInput,
    /// The decoder made no progress on non-empty input.
    Stalled,
    /// zlib reported a stream error.
    Backend,
}

impl fmt::Display for InflateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LimitExceeded => write!(f, "inflate limit exceeded"),
            Self::TruncatedInput => write!(f, "truncated input"),
            Self::Stalled => write!(f, "inflate stalled"),
            Self::Backend => write!(f, "inflate backend error"),
        }
    }
}

impl std::error::Error for InflateError {}

/// Deflate error taxonomy.
#[derive(Debug, PartialEq, Eq)]
pub enum DeflateError {
    /// zlib reported a stream error.
    Backend,
    /// The encoder made no progress.
    Stalled,
}

impl fmt::Display for DeflateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backend => write!(f, "deflate backend error"),
            Self::Stalled => write!(f, "deflate stalled"),
        }
    }
}

impl std::error::Error for DeflateError {}

/// Inflate a zlib stream with a hard output cap.
///
/// Returns the number of input bytes consumed from `input`.
///
/// The output buffer is cleared before writing. On error, `out` may contain
/// a partial prefix; callers should discard it. The stream need not end at
/// the end of `input`; callers use the returned count to advance within a
/// pack.
pub fn inflate_limited(
    input: &[u8],
    out: &mut Vec<u8>,
    max_out: usize,
) -> Result<usize, InflateError> {
    out.clear();

    with_inflate_scratch(|de, buf| {
        let mut in_pos: usize = 0;

        loop {
            let before_in = de.total_in() as usize;
            let before_out = de.total_out() as usize;

            let status = de
                .decompress(&input[in_pos..], buf, FlushDecompress::None)
                .map_err(|_| InflateError::Backend)?;

            let consumed = de.total_in() as usize - before_in;
            let produced = de.total_out() as usize - before_out;
            in_pos += consumed;

            if produced != 0 {
                if out.len() + produced > max_out {
                    return Err(InflateError::LimitExceeded);
                }
                out.extend_from_slice(&buf[..produced]);
            }

            match status {
                Status::StreamEnd => return Ok(in_pos),
                Status::Ok => {
                    if consumed == 0 && produced == 0 {
                        if in_pos >= input.len() {
                            return Err(InflateError::TruncatedInput);
                        }
                        return Err(InflateError::Stalled);
                    }
                }
                Status::BufError => {
                    if in_pos >= input.len() {
                        return Err(InflateError::TruncatedInput);
                    }
                }
            }
        }
    })
}

/// Inflate a zlib stream expecting exactly `expected` output bytes.
///
/// Returns the number of input bytes consumed from `input`. If the stream
/// ends early or produces fewer bytes, returns `TruncatedInput`.
pub fn inflate_exact(
    input: &[u8],
    out: &mut Vec<u8>,
    expected: usize,
) -> Result<usize, InflateError> {
    let consumed = inflate_limited(input, out, expected)?;
    if out.len() != expected {
        return Err(InflateError::TruncatedInput);
    }
    Ok(consumed)
}

/// Inflate only the first `want` output bytes of a zlib stream.
///
/// Stops as soon as `want` bytes are available or the stream ends, whichever
/// comes first, and never touches the remainder of the input. Used to read
/// loose object headers without inflating multi-megabyte bodies.
///
/// Returns the number of output bytes produced (may be less than `want` for
/// short streams).
pub fn inflate_prefix(input: &[u8], out: &mut Vec<u8>, want: usize) -> Result<usize, InflateError> {
    out.clear();

    with_inflate_scratch(|de, buf| {
        let mut in_pos: usize = 0;

        while out.len() < want {
            let before_in = de.total_in() as usize;
            let before_out = de.total_out() as usize;

            let window = (want - out.len()).min(buf.len());
            let status = de
                .decompress(&input[in_pos..], &mut buf[..window], FlushDecompress::None)
                .map_err(|_| InflateError::Backend)?;

            let consumed = de.total_in() as usize - before_in;
            let produced = de.total_out() as usize - before_out;
            in_pos += consumed;
            out.extend_from_slice(&buf[..produced]);

            match status {
                Status::StreamEnd => break,
                Status::Ok | Status::BufError => {
                    if consumed == 0 && produced == 0 {
                        if in_pos >= input.len() {
                            return Err(InflateError::TruncatedInput);
                        }
                        return Err(InflateError::Stalled);
                    }
                }
            }
        }

        Ok(out.len())
    })
}

/// Inflate a zlib stream into a caller-provided sink with an exact size.
///
/// The sink is invoked with contiguous output chunks; total output must
/// equal `expected` or `TruncatedInput` is returned. Returns the number of
/// input bytes consumed.
pub fn inflate_stream(
    input: &[u8],
    expected: usize,
    mut on_chunk: impl FnMut(&[u8]) -> Result<(), InflateError>,
) -> Result<usize, InflateError> {
    with_inflate_scratch(|de, buf| {
        let mut in_pos: usize = 0;
        let mut out_total: usize = 0;

        loop {
            let before_in = de.total_in() as usize;
            let before_out = de.total_out() as usize;

            let status = de
                .decompress(&input[in_pos..], buf, FlushDecompress::None)
                .map_err(|_| InflateError::Backend)?;

            let consumed = de.total_in() as usize - before_in;
            let produced = de.total_out() as usize - before_out;
            in_pos += consumed;

            if produced != 0 {
                let end = out_total
                    .checked_add(produced)
                    .ok_or(InflateError::LimitExceeded)?;
                if end > expected {
                    return Err(InflateError::LimitExceeded);
                }
                on_chunk(&buf[..produced])?;
                out_total = end;
            }

            match status {
                Status::StreamEnd => {
                    if out_total != expected {
                        return Err(InflateError::TruncatedInput);
                    }
                    return Ok(in_pos);
                }
                Status::Ok => {
                    if consumed == 0 && produced == 0 {
                        if in_pos >= input.len() {
                            return Err(InflateError::TruncatedInput);
                        }
                        return Err(InflateError::Stalled);
                    }
                }
                Status::BufError => {
                    if in_pos >= input.len() {
                        return Err(InflateError::TruncatedInput);
                    }
                }
            }
        }
    })
}

/// Deflate a whole buffer into `out` at the given level.
///
/// The output buffer is cleared before writing. `level` follows zlib's
/// `0..=9` range; out-of-range values are clamped.
pub fn deflate_all(input: &[u8], out: &mut Vec<u8>, level: u32) -> Result<(), DeflateError> {
    out.clear();

    DEFLATE_STATE.with(|state| {
        CODEC_BUF.with(|buf| {
            let mut co = state.borrow_mut();
            co.reset();
            let mut buf = buf.borrow_mut();

            let level = Compression::new(level.min(9));
            // `Compress::reset` keeps the construction-time level, so a
            // fresh encoder is needed when the caller picks another one.
            let mut local;
            let co: &mut Compress = if level == Compression::default() {
                &mut *co
            } else {
                local = Compress::new(level, true);
                &mut local
            };

            let mut in_pos = 0usize;
            let mut idle_rounds = 0u8;
            loop {
                let before_in = co.total_in() as usize;
                let before_out = co.total_out() as usize;

                let flush = if in_pos >= input.len() {
                    FlushCompress::Finish
                } else {
                    FlushCompress::None
                };
                let status = co
                    .compress(&input[in_pos..], &mut buf[..], flush)
                    .map_err(|_| DeflateError::Backend)?;

                let consumed = co.total_in() as usize - before_in;
                let produced = co.total_out() as usize - before_out;
                in_pos += consumed;
                out.extend_from_slice(&buf[..produced]);

                match status {
                    Status::StreamEnd => return Ok(()),
                    Status::Ok | Status::BufError => {
                        if consumed == 0 && produced == 0 {
                            // Finish may need one extra round to flush;
                            // repeated zero-progress rounds are a stall.
                            idle_rounds += 1;
                            if idle_rounds > 2 {
                                return Err(DeflateError::Stalled);
                            }
                        } else {
                            idle_rounds = 0;
                        }
                    }
                }
            }
        })
    })
}
