//! # Engine / state machine
//!
//! The engine is a message-serialized actor: one owner thread drains a
//! command channel and is the only code that touches mutable state (the
//! write buffer, the pending rawfile list, the live directory, the merge
//! flags). [`Store`] is the cloneable handle that turns API calls into
//! commands.
//!
//! ## Data flow
//!
//! ```text
//! put → buffer → (checkpoint, ~100 ms) → rawfile
//!                      │
//!                      └─ merge interval elapsed? → background worker:
//!                         sort rawfiles → R.rawmerged
//!                         merge with R.data → R.merged + R.buckets_merged
//!                         → MergeComplete → rename install → new directory
//!
//! stream(bucket) → directory lookup → positional read → dedup → sink
//! ```
//!
//! ## Concurrency model
//!
//! - Commands (`Put`, `Stream`, `Checkpoint`, `MergeComplete`, `Stats`,
//!   `Shutdown`) execute one at a time on the owner thread; checkpoints
//!   arrive as ordinary messages from a ticker thread, so they interleave
//!   between API calls but never mid-call.
//! - At most one background merge worker exists, guarded by `is_merging`.
//!   It reads the current data file and a snapshot of rawfiles, writes
//!   only its own output paths, and communicates by posting exactly one
//!   `MergeComplete`.
//! - Streams are served off the owner thread. The descriptor and the data
//!   file handle are captured *on* the owner, so they are consistent with
//!   respect to a concurrent install; the directory is only ever replaced
//!   wholesale.
//!
//! ## Visibility
//!
//! A `stream` observes exactly the bucket contents installed by the most
//! recent completed merge. Records still in the buffer or in pending
//! rawfiles are not visible until a merge installs them.
//!
//! ## Crash consistency
//!
//! The merged pair is installed by renaming the data file first (the
//! commit point) and the directory second, so a reader can never observe
//! a newer directory over an older data file. A merge that fails leaves
//! its rawfiles on disk; [`Store::start`] scans for `R.raw.*` and
//! restores them to the pending list.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::codec::Record;
use crate::directory::{self, BucketDirectory, DirectoryError};
use crate::extsort::{self, ExtsortError, MergeStream};
use crate::layout::RootLayout;
use crate::merge::{MergeBuilder, MergeError};
use crate::rawfile::{self, RawfileError};

mod reader;

pub use reader::{StreamEvent, StreamMessage};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors surfaced through the [`Store`] API.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Rawfile flush error.
    #[error("Rawfile error: {0}")]
    Rawfile(#[from] RawfileError),

    /// External sort or merge-stream error.
    #[error("Sort/merge error: {0}")]
    Extsort(#[from] ExtsortError),

    /// Merge build error.
    #[error("Merge error: {0}")]
    Merge(#[from] MergeError),

    /// Bucket directory load/save error.
    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),

    /// A configuration value failed validation.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The store has been closed; no further operations are served.
    #[error("Store is closed")]
    Closed,
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for a [`Store`] instance.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Minimum time between background merges.
    pub merge_interval: Duration,

    /// Cadence of the internal checkpoint (buffer → rawfile flush and
    /// merge trigger check).
    pub checkpoint_interval: Duration,

    /// Write-buffer capacity used when appending a rawfile.
    pub rawfile_buffer_bytes: usize,

    /// Write-buffer capacity used when building the merged data file.
    pub data_file_buffer_bytes: usize,

    /// Maximum accepted record payload size; larger frames are rejected
    /// as invalid input.
    pub max_payload_bytes: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            merge_interval: Duration::from_secs(10),
            checkpoint_interval: Duration::from_millis(100),
            rawfile_buffer_bytes: 500 * 1024,
            data_file_buffer_bytes: 2 * 1024 * 1024,
            max_payload_bytes: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Validates all configuration parameters.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.merge_interval.is_zero() {
            return Err(StoreError::InvalidConfig(
                "merge_interval must be > 0".into(),
            ));
        }
        if self.checkpoint_interval.is_zero() {
            return Err(StoreError::InvalidConfig(
                "checkpoint_interval must be > 0".into(),
            ));
        }
        if self.rawfile_buffer_bytes == 0 {
            return Err(StoreError::InvalidConfig(
                "rawfile_buffer_bytes must be > 0".into(),
            ));
        }
        if self.data_file_buffer_bytes == 0 {
            return Err(StoreError::InvalidConfig(
                "data_file_buffer_bytes must be > 0".into(),
            ));
        }
        if self.max_payload_bytes == 0 {
            return Err(StoreError::InvalidConfig(
                "max_payload_bytes must be > 0".into(),
            ));
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Stats
// ------------------------------------------------------------------------------------------------

/// Snapshot of engine state returned by [`Store::stats`].
#[derive(Debug, Clone)]
pub struct StoreStats {
    /// Records sitting in the write buffer, not yet flushed.
    pub buffered_records: usize,
    /// Rawfiles flushed but not yet consumed by a merge.
    pub pending_rawfiles: usize,
    /// True while a background merge is running.
    pub is_merging: bool,
    /// Number of merges installed since start.
    pub merge_count: u64,
    /// Buckets present in the live directory.
    pub bucket_count: usize,
}

// ------------------------------------------------------------------------------------------------
// Commands
// ------------------------------------------------------------------------------------------------

enum Command {
    Put {
        record: Record,
        ack: Sender<Result<(), StoreError>>,
    },
    Stream {
        bucket: Vec<u8>,
        sink: Sender<StreamMessage>,
        correlation: u64,
    },
    Checkpoint,
    MergeComplete {
        directory: BucketDirectory,
    },
    Stats {
        ack: Sender<StoreStats>,
    },
    Shutdown {
        ack: Sender<Result<(), StoreError>>,
    },
}

// ------------------------------------------------------------------------------------------------
// Store handle
// ------------------------------------------------------------------------------------------------

/// Handle to a running storage engine.
///
/// Cloneable and thread-safe: all clones feed the same owner thread.
/// `put` is synchronous; `stream` is asynchronous, delivering
/// [`StreamMessage`]s to the supplied sink.
pub struct Store {
    tx: Sender<Command>,
    owner: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Clone for Store {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            owner: Arc::clone(&self.owner),
        }
    }
}

impl Store {
    /// Starts an engine rooted at `root` (files live at `root.data`,
    /// `root.buckets`, …).
    ///
    /// Loads the live directory (creating an empty one on first start),
    /// restores any rawfiles orphaned by an interrupted merge, and spawns
    /// the owner and checkpoint-ticker threads.
    pub fn start(root: impl AsRef<Path>, config: StoreConfig) -> Result<Self, StoreError> {
        config.validate()?;

        let layout = RootLayout::new(root)?;
        let directory = directory::load(&layout.buckets())?;
        let rawfiles = layout.scan_rawfiles()?;

        info!(
            data = %layout.data().display(),
            buckets = directory.len(),
            recovered_rawfiles = rawfiles.len(),
            "starting store"
        );

        let (tx, rx) = mpsc::channel();

        let state = OwnerState {
            layout,
            config: config.clone(),
            directory: Arc::new(directory),
            buffer: Vec::new(),
            rawfiles,
            last_merge: Instant::now(),
            is_merging: false,
            merge_count: 0,
            merge_worker: None,
            tx: tx.clone(),
        };
        let owner = thread::spawn(move || owner_loop(state, rx));

        let ticker_tx = tx.clone();
        let interval = config.checkpoint_interval;
        thread::spawn(move || {
            loop {
                thread::sleep(interval);
                if ticker_tx.send(Command::Checkpoint).is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            tx,
            owner: Arc::new(Mutex::new(Some(owner))),
        })
    }

    /// Inserts a value with properties under a bucket.
    ///
    /// The timestamp is captured here, at call time. Returns once the
    /// record sits in the write buffer; durability follows at the next
    /// checkpoint flush.
    pub fn put(&self, bucket: &[u8], value: &[u8], props: &[u8]) -> Result<(), StoreError> {
        let record = Record {
            bucket: bucket.to_vec(),
            value: value.to_vec(),
            timestamp: now_timestamp(),
            props: props.to_vec(),
        };

        let (ack, ack_rx) = mpsc::channel();
        self.tx
            .send(Command::Put { record, ack })
            .map_err(|_| StoreError::Closed)?;
        ack_rx.recv().map_err(|_| StoreError::Closed)?
    }

    /// Streams every value ever merged into `bucket`.
    ///
    /// Results arrive on `sink` as `StreamEvent::Value` messages tagged
    /// with `correlation`, terminated by one `StreamEvent::Done` (or
    /// `StreamEvent::Failed` on corruption). An unknown bucket yields
    /// `Done` immediately. Records not yet merged are not visible.
    pub fn stream(
        &self,
        bucket: &[u8],
        sink: Sender<StreamMessage>,
        correlation: u64,
    ) -> Result<(), StoreError> {
        self.tx
            .send(Command::Stream {
                bucket: bucket.to_vec(),
                sink,
                correlation,
            })
            .map_err(|_| StoreError::Closed)
    }

    /// Returns a snapshot of engine state.
    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let (ack, ack_rx) = mpsc::channel();
        self.tx
            .send(Command::Stats { ack })
            .map_err(|_| StoreError::Closed)?;
        ack_rx.recv().map_err(|_| StoreError::Closed)
    }

    /// Shuts the engine down.
    ///
    /// Flushes the write buffer to a rawfile, waits for an in-flight
    /// merge to install, then stops the owner thread. Idempotent: a
    /// second close returns `Ok(())`.
    pub fn close(&self) -> Result<(), StoreError> {
        let (ack, ack_rx) = mpsc::channel();
        if self.tx.send(Command::Shutdown { ack }).is_err() {
            return Ok(()); // already closed
        }
        let result = match ack_rx.recv() {
            Ok(r) => r,
            Err(_) => Ok(()), // owner already gone
        };

        if let Ok(mut guard) = self.owner.lock()
            && let Some(handle) = guard.take()
        {
            let _ = handle.join();
        }
        result
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        // Last handle out closes the store so buffered records reach a
        // rawfile. Errors are already logged on the owner side.
        if Arc::strong_count(&self.owner) == 1
            && let Err(e) = self.close()
        {
            error!("failed to close store on drop: {e}");
        }
    }
}

fn now_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before UNIX epoch")
        .as_nanos() as u64
}

// ------------------------------------------------------------------------------------------------
// Owner loop
// ------------------------------------------------------------------------------------------------

struct OwnerState {
    layout: RootLayout,
    config: StoreConfig,

    /// Live directory, replaced wholesale on each install. Streams hold
    /// descriptors cloned out of it at dispatch time.
    directory: Arc<BucketDirectory>,

    /// Write buffer in insertion order.
    buffer: Vec<Record>,

    /// Rawfiles flushed but not yet snapshotted by a merge.
    rawfiles: Vec<PathBuf>,

    last_merge: Instant,
    is_merging: bool,
    merge_count: u64,

    /// Join handle of the in-flight merge worker, used at shutdown to
    /// detect a worker that died without posting completion.
    merge_worker: Option<JoinHandle<()>>,

    /// Command sender handed to merge workers for posting completion.
    tx: Sender<Command>,
}

fn owner_loop(mut state: OwnerState, rx: Receiver<Command>) {
    let mut shutdown_acks: Vec<Sender<Result<(), StoreError>>> = Vec::new();

    loop {
        let command = if shutdown_acks.is_empty() {
            match rx.recv() {
                Ok(c) => Some(c),
                Err(_) => break, // all handles gone
            }
        } else {
            // Draining towards shutdown: wait briefly so a worker that
            // died without posting completion does not hang close().
            match rx.recv_timeout(Duration::from_millis(50)) {
                Ok(c) => Some(c),
                Err(mpsc::RecvTimeoutError::Timeout) => None,
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        };

        if let Some(command) = command {
            match command {
                Command::Put { record, ack } => {
                    trace!(
                        bucket_len = record.bucket.len(),
                        value_len = record.value.len(),
                        "buffering record"
                    );
                    state.buffer.push(record);
                    let _ = ack.send(Ok(()));
                }

                Command::Stream {
                    bucket,
                    sink,
                    correlation,
                } => {
                    reader::dispatch(&state, &bucket, sink, correlation);
                }

                Command::Checkpoint => {
                    // No new merges once a shutdown is pending; the final
                    // flush below covers the buffer.
                    if shutdown_acks.is_empty() {
                        checkpoint(&mut state);
                    }
                }

                Command::MergeComplete { directory } => {
                    merge_complete(&mut state, directory);
                }

                Command::Stats { ack } => {
                    let _ = ack.send(StoreStats {
                        buffered_records: state.buffer.len(),
                        pending_rawfiles: state.rawfiles.len(),
                        is_merging: state.is_merging,
                        merge_count: state.merge_count,
                        bucket_count: state.directory.len(),
                    });
                }

                Command::Shutdown { ack } => {
                    shutdown_acks.push(ack);
                }
            }
        }

        if !shutdown_acks.is_empty() {
            // A worker that exited without posting completion failed; its
            // rawfiles stay on disk for the startup scan.
            if state.is_merging
                && let Some(worker) = &state.merge_worker
                && worker.is_finished()
            {
                warn!("merge worker exited without completing; shutting down anyway");
                state.is_merging = false;
                state.merge_worker = None;
            }

            if !state.is_merging {
                let mut result: Result<(), StoreError> =
                    flush_buffer(&mut state).map_err(StoreError::from);
                if let Err(e) = &result {
                    error!("final buffer flush failed during shutdown: {e}");
                }
                info!(merges = state.merge_count, "store shut down");
                // The first caller gets the flush outcome; later callers
                // of an idempotent close just get Ok.
                for ack in shutdown_acks.drain(..) {
                    let _ = ack.send(std::mem::replace(&mut result, Ok(())));
                }
                break;
            }
        }
    }
}

/// Flushes the write buffer to a fresh rawfile, appending its path to the
/// pending list. Keeps the buffer intact on failure so the next
/// checkpoint retries.
fn flush_buffer(state: &mut OwnerState) -> Result<(), RawfileError> {
    if state.buffer.is_empty() {
        return Ok(());
    }
    let path = rawfile::flush(
        &state.layout,
        &state.buffer,
        state.config.rawfile_buffer_bytes,
        state.config.max_payload_bytes,
    )?;
    state.buffer.clear();
    if let Some(path) = path {
        state.rawfiles.push(path);
    }
    Ok(())
}

/// Periodic checkpoint: flush the buffer, then launch a merge when the
/// interval has elapsed and none is running.
fn checkpoint(state: &mut OwnerState) {
    if let Err(e) = flush_buffer(state) {
        error!("checkpoint flush failed, keeping buffer for retry: {e}");
        return;
    }

    if state.is_merging || state.last_merge.elapsed() < state.config.merge_interval {
        return;
    }

    // Snapshot and clear: rawfiles flushed after this point belong to
    // the *next* merge, not this one.
    let snapshot = std::mem::take(&mut state.rawfiles);
    state.is_merging = true;

    debug!(rawfiles = snapshot.len(), "launching background merge");

    let layout = state.layout.clone();
    let config = state.config.clone();
    let tx = state.tx.clone();
    state.merge_worker = Some(thread::spawn(move || {
        run_merge_worker(layout, config, snapshot, tx);
    }));
}

/// Installs a freshly built merge: the data file rename is the commit
/// point, the directory rename follows, then the in-memory directory is
/// replaced wholesale.
fn merge_complete(state: &mut OwnerState, directory: BucketDirectory) {
    if let Err(e) = fs::rename(state.layout.merged(), state.layout.data()) {
        error!("failed to install merged data file: {e}");
        return;
    }
    if let Err(e) = fs::rename(state.layout.buckets_merged(), state.layout.buckets()) {
        // The data file is already live; the on-disk directory is one
        // merge stale but the in-memory one below is current.
        error!("failed to install merged directory blob: {e}");
    }

    state.directory = Arc::new(directory);
    state.last_merge = Instant::now();
    state.is_merging = false;
    state.merge_count += 1;
    if let Some(worker) = state.merge_worker.take() {
        let _ = worker.join();
    }

    info!(
        merge = state.merge_count,
        buckets = state.directory.len(),
        "installed merged data file and directory"
    );
}

// ------------------------------------------------------------------------------------------------
// Background merge worker
// ------------------------------------------------------------------------------------------------

/// Sorts the rawfile snapshot, merges it with the current data file into
/// fresh output files, deletes consumed inputs, and posts completion.
///
/// On failure the worker logs and exits without posting; the engine stays
/// marked as merging and the rawfiles stay on disk for startup recovery.
fn run_merge_worker(
    layout: RootLayout,
    config: StoreConfig,
    snapshot: Vec<PathBuf>,
    tx: Sender<Command>,
) {
    match build_merged(&layout, &config, &snapshot) {
        Ok(directory) => {
            for path in &snapshot {
                if let Err(e) = fs::remove_file(path) {
                    warn!(path = %path.display(), "failed to delete consumed rawfile: {e}");
                }
            }
            if !snapshot.is_empty()
                && let Err(e) = fs::remove_file(layout.rawmerged())
            {
                warn!("failed to delete transient sorted file: {e}");
            }
            let _ = tx.send(Command::MergeComplete { directory });
        }
        Err(e) => {
            error!("background merge failed, rawfiles left on disk for recovery: {e}");
        }
    }
}

fn build_merged(
    layout: &RootLayout,
    config: &StoreConfig,
    snapshot: &[PathBuf],
) -> Result<BucketDirectory, StoreError> {
    let mut inputs = Vec::new();

    if layout.data().exists() {
        inputs.push(layout.data());
    }
    if !snapshot.is_empty() {
        extsort::sort(
            snapshot,
            &layout.rawmerged(),
            config.max_payload_bytes,
            config.rawfile_buffer_bytes,
        )?;
        inputs.push(layout.rawmerged());
    }

    let mut builder = MergeBuilder::create(
        &layout.merged(),
        &layout.buckets_merged(),
        config.max_payload_bytes,
        config.data_file_buffer_bytes,
    )?;
    for item in MergeStream::open(&inputs, config.max_payload_bytes)? {
        let (record, payload) = item?;
        builder.accept(&record, &payload)?;
    }
    Ok(builder.finish()?)
}

// ------------------------------------------------------------------------------------------------
// Atomic swap primitive
// ------------------------------------------------------------------------------------------------

/// Exchanges two paths via three renames through `<a>.tmp`.
///
/// Not crash-atomic: between the renames, `a` is absent and the old file
/// sits at `<a>.tmp`. The engine's own install path therefore uses plain
/// write-new-then-rename; this primitive exists for callers that need
/// both names preserved.
pub fn swap_files(a: &Path, b: &Path) -> io::Result<()> {
    let mut tmp_name = OsString::from(a.as_os_str());
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    fs::rename(a, &tmp)?;
    fs::rename(b, a)?;
    fs::rename(&tmp, b)?;
    Ok(())
}
