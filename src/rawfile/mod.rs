//! Rawfile writer — persists the in-memory write buffer on flush.
//!
//! A rawfile is a flat, append-once sequence of framed records in
//! insertion order. It is unsorted: ordering is the merge's job. Each
//! flush produces a freshly named `R.raw.<rand>` file; rawfiles are never
//! reopened for writing and are deleted by the merge that consumes them.
//!
//! The writer is codec-oblivious beyond framing — it encodes each record
//! payload and wraps it in the length prefix, nothing more.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use thiserror::Error;
use tracing::debug;

use crate::codec::{self, CodecError, Record};
use crate::layout::RootLayout;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by rawfile flush.
#[derive(Debug, Error)]
pub enum RawfileError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Record framing or encoding error.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

// ------------------------------------------------------------------------------------------------
// Flush
// ------------------------------------------------------------------------------------------------

/// Writes the buffered records to a fresh rawfile and returns its path.
///
/// An empty buffer produces no file and returns `Ok(None)`. The file is
/// synced before the path is returned, so a subsequent sort can read
/// every record even across a crash.
pub fn flush(
    layout: &RootLayout,
    records: &[Record],
    buffer_bytes: usize,
    max_payload: u32,
) -> Result<Option<PathBuf>, RawfileError> {
    if records.is_empty() {
        return Ok(None);
    }

    let path = layout.fresh_rawfile();
    let file = OpenOptions::new()
        .create_new(true)
        .append(true)
        .open(&path)?;
    let mut writer = BufWriter::with_capacity(buffer_bytes, file);

    for record in records {
        let payload = record.encode_payload()?;
        codec::write_frame(&mut writer, &payload, max_payload)?;
    }

    writer.flush()?;
    writer.get_ref().sync_all()?;

    debug!(
        records = records.len(),
        path = %path.display(),
        "flushed write buffer to rawfile"
    );
    Ok(Some(path))
}
