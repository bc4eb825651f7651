//! Record codec — payload encoding and length-prefixed framing.
//!
//! A record is the tuple `(bucket, value, timestamp, props)`. Its payload
//! is the fixed-int [`bincode`] encoding of [`Record`]; the engine never
//! interprets `value` or `props`.
//!
//! # On-disk framing
//!
//! ```text
//! [size: u32 big-endian][payload: size bytes]
//! ```
//!
//! `size` does **not** include its own 4 bytes. Frames with `size == 0`
//! or `size` above the configured maximum are rejected.
//!
//! # End-of-file semantics
//!
//! A frame cut short by end-of-file means different things on different
//! paths, so [`FrameReader`] has two modes:
//!
//! - **tolerant** — a truncated trailing frame ends the stream. Used when
//!   sorting rawfiles, where a crash mid-flush legitimately leaves a
//!   partial tail.
//! - **strict** — a truncated frame is [`CodecError::TruncatedFrame`].
//!   Used on the reader path, where the bucket directory claimed the
//!   bytes and truncation means corruption.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::io::{self, Read, Write};

use bincode::{config::standard, decode_from_slice, encode_to_vec};
use thiserror::Error;

/// Byte width of the frame length prefix.
pub const FRAME_PREFIX_SIZE: usize = std::mem::size_of::<u32>();

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by codec operations.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Payload serialization error.
    #[error("Serialization (encode) error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    /// Payload deserialization error.
    #[error("Deserialization (decode) error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    /// A frame declared a zero-length payload.
    #[error("Frame with empty payload")]
    EmptyFrame,

    /// A frame declared a payload larger than the configured maximum.
    #[error("Frame payload of {size} bytes exceeds limit ({max} bytes)")]
    FrameTooLarge {
        /// Declared payload size.
        size: u32,
        /// Configured maximum payload size.
        max: u32,
    },

    /// The stream ended inside a frame on a path where the full frame
    /// was claimed to exist.
    #[error("Truncated frame")]
    TruncatedFrame,
}

// ------------------------------------------------------------------------------------------------
// Record
// ------------------------------------------------------------------------------------------------

/// A single insertion: an opaque `value` with `props`, grouped under a
/// `bucket`.
///
/// The derived ordering — `(bucket, value, timestamp, props)` — is the
/// total order used by the external sort. Records of one bucket are
/// contiguous under it, buckets appear in byte-lexicographic order, and
/// identical `(bucket, value)` pairs are adjacent, which is what the
/// merge's duplicate collapse relies on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, bincode::Encode, bincode::Decode)]
pub struct Record {
    /// Opaque grouping key, typically an `(index, field, term)` triple.
    pub bucket: Vec<u8>,

    /// Opaque posting value, typically a document reference.
    pub value: Vec<u8>,

    /// Nanoseconds since UNIX epoch, captured at `put` time. Tie-breaker
    /// in the sort order; does not preserve duplicate multiplicity.
    pub timestamp: u64,

    /// Opaque per-posting properties.
    pub props: Vec<u8>,
}

impl Record {
    /// Serializes this record into its opaque payload bytes.
    pub fn encode_payload(&self) -> Result<Vec<u8>, CodecError> {
        let config = standard().with_fixed_int_encoding();
        Ok(encode_to_vec(self, config)?)
    }

    /// Deserializes a record from payload bytes.
    pub fn decode_payload(payload: &[u8]) -> Result<Self, CodecError> {
        let config = standard().with_fixed_int_encoding();
        let (record, _) = decode_from_slice::<Self, _>(payload, config)?;
        Ok(record)
    }
}

// ------------------------------------------------------------------------------------------------
// Framing
// ------------------------------------------------------------------------------------------------

/// Writes one framed payload: `[u32 BE size][payload]`.
///
/// Returns the number of bytes written (`4 + payload.len()`), which is
/// what the merge builder adds to its running offset.
pub fn write_frame(
    writer: &mut impl Write,
    payload: &[u8],
    max_payload: u32,
) -> Result<u64, CodecError> {
    if payload.is_empty() {
        return Err(CodecError::EmptyFrame);
    }
    let size = u32::try_from(payload.len()).map_err(|_| CodecError::FrameTooLarge {
        size: u32::MAX,
        max: max_payload,
    })?;
    if size > max_payload {
        return Err(CodecError::FrameTooLarge {
            size,
            max: max_payload,
        });
    }

    writer.write_all(&size.to_be_bytes())?;
    writer.write_all(payload)?;
    Ok((FRAME_PREFIX_SIZE + payload.len()) as u64)
}

/// Streaming reader of framed payloads.
///
/// Yields `Result<Vec<u8>, CodecError>` per frame. Construction picks the
/// end-of-file mode — see the [module docs](self) for when each applies.
pub struct FrameReader<R: Read> {
    inner: R,

    /// Maximum accepted payload size.
    max_payload: u32,

    /// When true, a frame cut short by EOF ends the stream instead of
    /// being an error.
    tolerant: bool,

    /// Set after the first error or end-of-stream; all later calls
    /// return `None`.
    done: bool,
}

impl<R: Read> FrameReader<R> {
    /// Reader that treats a truncated trailing frame as corruption.
    pub fn strict(inner: R, max_payload: u32) -> Self {
        Self {
            inner,
            max_payload,
            tolerant: false,
            done: false,
        }
    }

    /// Reader that treats a truncated trailing frame as end-of-stream.
    pub fn tolerant(inner: R, max_payload: u32) -> Self {
        Self {
            inner,
            max_payload,
            tolerant: true,
            done: false,
        }
    }

    /// Reads exactly `buf.len()` bytes.
    ///
    /// Distinguishes a clean boundary (zero bytes read) from a mid-frame
    /// cut, so the iterator can tell end-of-stream from truncation.
    fn read_full(&mut self, buf: &mut [u8]) -> Result<ReadOutcome, io::Error> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(ReadOutcome::CleanEof),
                Ok(0) => return Ok(ReadOutcome::Truncated),
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(ReadOutcome::Complete)
    }
}

enum ReadOutcome {
    Complete,
    CleanEof,
    Truncated,
}

impl<R: Read> Iterator for FrameReader<R> {
    type Item = Result<Vec<u8>, CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut prefix = [0u8; FRAME_PREFIX_SIZE];
        match self.read_full(&mut prefix) {
            Ok(ReadOutcome::Complete) => {}
            Ok(ReadOutcome::CleanEof) => {
                self.done = true;
                return None;
            }
            Ok(ReadOutcome::Truncated) => {
                self.done = true;
                return if self.tolerant {
                    None
                } else {
                    Some(Err(CodecError::TruncatedFrame))
                };
            }
            Err(e) => {
                self.done = true;
                return Some(Err(CodecError::Io(e)));
            }
        }

        let size = u32::from_be_bytes(prefix);
        if size == 0 {
            self.done = true;
            return Some(Err(CodecError::EmptyFrame));
        }
        if size > self.max_payload {
            self.done = true;
            return Some(Err(CodecError::FrameTooLarge {
                size,
                max: self.max_payload,
            }));
        }

        let mut payload = vec![0u8; size as usize];
        match self.read_full(&mut payload) {
            Ok(ReadOutcome::Complete) => Some(Ok(payload)),
            Ok(ReadOutcome::CleanEof | ReadOutcome::Truncated) => {
                self.done = true;
                if self.tolerant {
                    None
                } else {
                    Some(Err(CodecError::TruncatedFrame))
                }
            }
            Err(e) => {
                self.done = true;
                Some(Err(CodecError::Io(e)))
            }
        }
    }
}
