//! Reader / streamer — serves one bucket's records to a sink.
//!
//! The owner thread resolves the bucket descriptor and opens the data
//! file, so both belong to the same installed generation even while a
//! merge swaps files underneath. The byte range itself is read on a
//! short-lived thread: the file is memory-mapped with a sequential-read
//! hint and exactly `descriptor.size` bytes starting at
//! `descriptor.offset` are framed, decoded, and emitted with adjacent
//! `value` duplicates skipped.
//!
//! Framing or decode failures inside the claimed range are corruption and
//! are reported to the sink as [`StreamEvent::Failed`]; the data file is
//! never truncated or repaired from the read path.

use std::fs::File;
use std::sync::mpsc::Sender;
use std::thread;

use memmap2::Mmap;
use tracing::{debug, warn};

use crate::codec::{FrameReader, Record};

use super::OwnerState;

// ------------------------------------------------------------------------------------------------
// Stream events
// ------------------------------------------------------------------------------------------------

/// One message delivered to a stream sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    /// Token passed to [`Store::stream`](super::Store::stream), echoed on
    /// every message of that stream.
    pub correlation: u64,

    /// The event itself.
    pub event: StreamEvent,
}

/// Events emitted while streaming a bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// One deduplicated record.
    Value {
        /// The posting value.
        value: Vec<u8>,
        /// Its opaque properties.
        props: Vec<u8>,
    },

    /// End of stream: every record in the bucket's region was emitted.
    Done,

    /// The bucket's claimed byte range could not be read back.
    Failed {
        /// Human-readable cause.
        reason: String,
    },
}

// ------------------------------------------------------------------------------------------------
// Dispatch
// ------------------------------------------------------------------------------------------------

/// Resolves the bucket and hands the read off to a stream thread.
///
/// Runs on the owner thread; only the lookup and the `open` happen here.
pub(super) fn dispatch(
    state: &OwnerState,
    bucket: &[u8],
    sink: Sender<StreamMessage>,
    correlation: u64,
) {
    let Some(descriptor) = state.directory.get(bucket).cloned() else {
        // Unknown bucket is not an error: the stream is simply empty.
        let _ = sink.send(StreamMessage {
            correlation,
            event: StreamEvent::Done,
        });
        return;
    };

    let file = match File::open(state.layout.data()) {
        Ok(f) => f,
        Err(e) => {
            warn!(correlation, "failed to open data file for stream: {e}");
            let _ = sink.send(StreamMessage {
                correlation,
                event: StreamEvent::Failed {
                    reason: format!("failed to open data file: {e}"),
                },
            });
            return;
        }
    };

    debug!(
        correlation,
        offset = descriptor.offset,
        size = descriptor.size,
        count = descriptor.count,
        "dispatching stream"
    );

    let max_payload = state.config.max_payload_bytes;
    thread::spawn(move || {
        serve(
            file,
            descriptor.offset,
            descriptor.size,
            max_payload,
            sink,
            correlation,
        );
    });
}

/// Reads the byte range, frames and decodes records, and emits events.
///
/// Sink-send failures mean the receiver went away; the stream just stops.
fn serve(
    file: File,
    offset: u64,
    size: u64,
    max_payload: u32,
    sink: Sender<StreamMessage>,
    correlation: u64,
) {
    let fail = |reason: String| {
        let _ = sink.send(StreamMessage {
            correlation,
            event: StreamEvent::Failed { reason },
        });
    };

    let mmap = match unsafe { Mmap::map(&file) } {
        Ok(m) => m,
        Err(e) => {
            fail(format!("failed to map data file: {e}"));
            return;
        }
    };
    #[cfg(unix)]
    let _ = mmap.advise(memmap2::Advice::Sequential);

    let end = offset.saturating_add(size);
    if end > mmap.len() as u64 {
        fail(format!(
            "directory claims bytes [{offset}, {end}) beyond data file of {} bytes",
            mmap.len()
        ));
        return;
    }
    let region = &mmap[offset as usize..end as usize];

    let mut last_value: Option<Vec<u8>> = None;
    for payload in FrameReader::strict(region, max_payload) {
        let payload = match payload {
            Ok(p) => p,
            Err(e) => {
                fail(format!("corrupt frame in bucket region: {e}"));
                return;
            }
        };
        let record = match Record::decode_payload(&payload) {
            Ok(r) => r,
            Err(e) => {
                fail(format!("corrupt record payload in bucket region: {e}"));
                return;
            }
        };

        if last_value.as_ref() == Some(&record.value) {
            continue;
        }
        last_value = Some(record.value.clone());

        if sink
            .send(StreamMessage {
                correlation,
                event: StreamEvent::Value {
                    value: record.value,
                    props: record.props,
                },
            })
            .is_err()
        {
            return; // receiver cancelled
        }
    }

    let _ = sink.send(StreamMessage {
        correlation,
        event: StreamEvent::Done,
    });
}
