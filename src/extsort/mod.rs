//! External sort/merge adapter.
//!
//! Two operations back the merge pipeline:
//!
//! - [`sort`] — turns a set of unsorted rawfiles into one file whose
//!   records are in the engine's total order `≤` (the derived
//!   `(bucket, value, timestamp, props)` ordering on [`Record`]).
//! - [`MergeStream`] — reads several already-sorted record files as a
//!   single stream under `≤`, via a heap-based k-way merge that holds one
//!   record per input in memory.
//!
//! Rawfile volumes are bounded by the flush cadence, so [`sort`] sorts in
//! memory; the contract it honors — every input record, framed
//! identically, in a fixed total order — is what the rest of the engine
//! depends on, not the sorting strategy.
//!
//! A frame cut short at the end of an input ends that input's stream
//! (a crashed flush may leave a partial tail); a payload that fails to
//! decode is an error, since the directory-backed files never contain
//! undecodable frames.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::codec::{self, CodecError, FrameReader, Record};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by sort and merge-stream operations.
#[derive(Debug, Error)]
pub enum ExtsortError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Record framing or decoding error.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

// ------------------------------------------------------------------------------------------------
// Sort
// ------------------------------------------------------------------------------------------------

/// Sorts every record from `inputs` into one framed file at `output`.
///
/// Returns the number of records written. Stability is not required —
/// equal records are interchangeable by definition of the total order.
pub fn sort(
    inputs: &[PathBuf],
    output: &Path,
    max_payload: u32,
    buffer_bytes: usize,
) -> Result<usize, ExtsortError> {
    let mut records: Vec<(Record, Vec<u8>)> = Vec::new();

    for input in inputs {
        let file = File::open(input)?;
        for payload in FrameReader::tolerant(BufReader::new(file), max_payload) {
            let payload = payload?;
            let record = Record::decode_payload(&payload)?;
            records.push((record, payload));
        }
    }

    records.sort_unstable_by(|a, b| a.0.cmp(&b.0));

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(output)?;
    let mut writer = BufWriter::with_capacity(buffer_bytes, file);
    for (_, payload) in &records {
        codec::write_frame(&mut writer, payload, max_payload)?;
    }
    writer.flush()?;
    writer.get_ref().sync_all()?;

    debug!(
        inputs = inputs.len(),
        records = records.len(),
        output = %output.display(),
        "sorted rawfiles"
    );
    Ok(records.len())
}

// ------------------------------------------------------------------------------------------------
// MergeStream — k-way merge of sorted record files
// ------------------------------------------------------------------------------------------------

/// One pending record from a source file, ordered for the merge heap.
struct HeapItem {
    record: Record,
    payload: Vec<u8>,
    /// Index into the source list.
    source: usize,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.record == other.record && self.source == other.source
    }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the smallest record pops
        // first. Ties break on source index for determinism.
        other
            .record
            .cmp(&self.record)
            .then_with(|| other.source.cmp(&self.source))
    }
}

/// Reads several sorted record files as one sorted stream.
///
/// Yields `(record, payload)` pairs in the total order `≤`. One record
/// per input is buffered; everything else stays on disk until popped.
pub struct MergeStream {
    sources: Vec<FrameReader<BufReader<File>>>,
    heap: BinaryHeap<HeapItem>,
    /// Set after the first error; the stream then ends.
    failed: bool,
}

impl MergeStream {
    /// Opens all inputs and primes the heap with each one's first record.
    pub fn open(inputs: &[PathBuf], max_payload: u32) -> Result<Self, ExtsortError> {
        let mut sources = Vec::with_capacity(inputs.len());
        for input in inputs {
            let file = File::open(input)?;
            sources.push(FrameReader::tolerant(BufReader::new(file), max_payload));
        }

        let mut stream = Self {
            sources,
            heap: BinaryHeap::new(),
            failed: false,
        };
        for source in 0..stream.sources.len() {
            if let Some(item) = stream.pull(source)? {
                stream.heap.push(item);
            }
        }
        Ok(stream)
    }

    /// Reads the next record from one source, or `None` when exhausted.
    fn pull(&mut self, source: usize) -> Result<Option<HeapItem>, ExtsortError> {
        match self.sources[source].next() {
            None => Ok(None),
            Some(Err(e)) => Err(e.into()),
            Some(Ok(payload)) => {
                let record = Record::decode_payload(&payload)?;
                Ok(Some(HeapItem {
                    record,
                    payload,
                    source,
                }))
            }
        }
    }
}

impl Iterator for MergeStream {
    type Item = Result<(Record, Vec<u8>), ExtsortError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        let top = self.heap.pop()?;
        match self.pull(top.source) {
            Ok(Some(next)) => self.heap.push(next),
            Ok(None) => {}
            Err(e) => {
                self.failed = true;
                return Some(Err(e));
            }
        }
        Some(Ok((top.record, top.payload)))
    }
}
