//! Merge / index builder — rewrites the merged record stream into a new
//! data file and builds its bucket directory.
//!
//! [`MergeBuilder`] is a streaming fold: the merge driver feeds it records
//! in the sort's total order via [`MergeBuilder::accept`], and
//! [`MergeBuilder::finish`] commits the trailing bucket, persists the
//! directory blob, and hands the directory back for in-memory install.
//!
//! Fold state per incoming `(bucket, value)`:
//!
//! - identical to the previous pair → adjacent duplicate, dropped;
//! - same bucket → frame appended, open descriptor grows;
//! - new bucket → previous descriptor committed, fresh one opened at the
//!   current output offset.
//!
//! The duplicate collapse is *adjacent-only*: the input order makes equal
//! pairs neighbors, so no global set is needed, and equal `value`s in
//! different buckets are never confused for duplicates.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::codec::{self, CodecError, Record};
use crate::directory::{self, BucketDescriptor, BucketDirectory, DirectoryError};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned while building the merged data file.
#[derive(Debug, Error)]
pub enum MergeError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Record framing or encoding error.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Directory persistence error.
    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),
}

// ------------------------------------------------------------------------------------------------
// MergeBuilder
// ------------------------------------------------------------------------------------------------

/// The bucket whose region is currently being written.
struct OpenBucket {
    bucket: Vec<u8>,
    descriptor: BucketDescriptor,
}

/// Streaming fold that writes a bucket-contiguous data file and its
/// directory.
///
/// Records must arrive in the external sort's total order; everything
/// else — offsets, sizes, counts, duplicate collapse — follows from that.
pub struct MergeBuilder {
    writer: BufWriter<std::fs::File>,
    directory_path: PathBuf,
    max_payload: u32,

    /// Next write offset in the output file.
    pos: u64,

    /// `(bucket, value)` of the last record written, for adjacent
    /// duplicate detection.
    last: Option<(Vec<u8>, Vec<u8>)>,

    /// Descriptor being accumulated for the current bucket.
    current: Option<OpenBucket>,

    directory: BucketDirectory,
    accepted: u64,
    dropped: u64,
}

impl MergeBuilder {
    /// Creates the output data file (truncating any stale leftover from a
    /// failed merge) and an empty directory.
    pub fn create(
        data_path: &Path,
        directory_path: &Path,
        max_payload: u32,
        buffer_bytes: usize,
    ) -> Result<Self, MergeError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(data_path)?;

        Ok(Self {
            writer: BufWriter::with_capacity(buffer_bytes, file),
            directory_path: directory_path.to_path_buf(),
            max_payload,
            pos: 0,
            last: None,
            current: None,
            directory: BucketDirectory::new(),
            accepted: 0,
            dropped: 0,
        })
    }

    /// Folds one record of the merged sorted stream into the output.
    ///
    /// `payload` must be the encoded form of `record`; it is written
    /// verbatim so the merge never re-encodes what it read.
    pub fn accept(&mut self, record: &Record, payload: &[u8]) -> Result<(), MergeError> {
        if let Some((last_bucket, last_value)) = &self.last
            && *last_bucket == record.bucket
            && *last_value == record.value
        {
            self.dropped += 1;
            return Ok(());
        }

        let framed = codec::write_frame(&mut self.writer, payload, self.max_payload)?;

        match &mut self.current {
            Some(open) if open.bucket == record.bucket => {
                open.descriptor.size += framed;
                open.descriptor.count += 1;
            }
            _ => {
                if let Some(open) = self.current.take() {
                    self.directory.insert(open.bucket, open.descriptor);
                }
                self.current = Some(OpenBucket {
                    bucket: record.bucket.clone(),
                    descriptor: BucketDescriptor {
                        offset: self.pos,
                        size: framed,
                        count: 1,
                    },
                });
            }
        }

        self.pos += framed;
        self.last = Some((record.bucket.clone(), record.value.clone()));
        self.accepted += 1;
        Ok(())
    }

    /// Commits the trailing bucket, syncs the data file, persists the
    /// directory blob, and returns the directory.
    pub fn finish(mut self) -> Result<BucketDirectory, MergeError> {
        if let Some(open) = self.current.take() {
            self.directory.insert(open.bucket, open.descriptor);
        }

        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;

        directory::save(&self.directory_path, &self.directory)?;

        debug!(
            accepted = self.accepted,
            dropped = self.dropped,
            buckets = self.directory.len(),
            bytes = self.pos,
            "merge build finished"
        );
        Ok(self.directory)
    }
}
