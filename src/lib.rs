//! # TermStore
//!
//! A single-node, append-optimized **inverted-index storage engine**:
//! a continuous stream of `(bucket, value, props)` insertions is
//! persisted grouped by bucket, and every value ever inserted for a
//! bucket streams back in a stable, deduplicated order. Built for
//! search indexing, where writes dominate reads and each bucket
//! (typically an `index/field/term` triple) accumulates a posting list
//! of document references.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        Store                             │
//! │  ┌──────────┐   flush    ┌───────────┐                   │
//! │  │  Write   │ ─────────► │ Rawfiles  │  (unsorted)       │
//! │  │  buffer  │  ~100 ms   │ R.raw.*   │                   │
//! │  └──────────┘            └─────┬─────┘                   │
//! │                                │  background merge       │
//! │                 sort ──► R.rawmerged                     │
//! │                                │  k-way merge + dedup    │
//! │  ┌──────────┐  rename  ┌──────┴──────────────┐           │
//! │  │  R.data  │ ◄─────── │ R.merged            │           │
//! │  │ R.buckets│  install │ R.buckets_merged    │           │
//! │  └────┬─────┘          └─────────────────────┘           │
//! │       │  directory lookup + positional read              │
//! │       └──► stream(bucket) → sink                         │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`engine`] | Owner actor — put, stream, checkpoint, background merge, install |
//! | [`codec`] | Record payload encoding and big-endian length-prefixed framing |
//! | [`rawfile`] | Flush of the write buffer to fresh unsorted rawfiles |
//! | [`extsort`] | External sort of rawfiles and k-way merge of sorted files |
//! | [`merge`] | Streaming rebuild of the data file and its bucket directory |
//! | [`directory`] | Persistent map `bucket → (offset, size, count)` |
//! | [`layout`] | On-disk naming under the caller-chosen root |
//!
//! ## Key properties
//!
//! - **Append-optimized** — `put` touches memory only; durability comes
//!   from the periodic checkpoint flush, ordering from the merge.
//! - **Bucket-contiguous data file** — each merge rewrites `R.data` with
//!   every bucket's records adjacent and sorted, so a stream is one
//!   positional read.
//! - **Adjacent deduplication** — identical `(bucket, value)` pairs
//!   collapse during merge and again on the read path.
//! - **Crash-consistent install** — the data file rename is the commit
//!   point; the directory follows; interrupted merges leave rawfiles
//!   that startup recovery rescans.
//! - **Read-committed-after-merge** — streams see exactly the state
//!   installed by the most recent merge.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::mpsc;
//! use termstore::{Store, StoreConfig, StreamEvent};
//!
//! let store = Store::start("/tmp/search/idx", StoreConfig::default()).unwrap();
//!
//! // Write postings.
//! store.put(b"body/rust", b"doc-17", b"").unwrap();
//! store.put(b"body/rust", b"doc-42", b"").unwrap();
//!
//! // ... after the next merge installs, stream them back.
//! let (sink, results) = mpsc::channel();
//! store.stream(b"body/rust", sink, 1).unwrap();
//! for message in results {
//!     match message.event {
//!         StreamEvent::Value { value, .. } => println!("{}", String::from_utf8_lossy(&value)),
//!         StreamEvent::Done => break,
//!         StreamEvent::Failed { reason } => panic!("stream failed: {reason}"),
//!     }
//! }
//!
//! store.close().unwrap();
//! ```

pub mod codec;
pub mod directory;
pub mod engine;
pub mod extsort;
pub mod layout;
pub mod merge;
pub mod rawfile;

pub use codec::Record;
pub use directory::{BucketDescriptor, BucketDirectory};
pub use engine::{
    Store, StoreConfig, StoreError, StoreStats, StreamEvent, StreamMessage, swap_files,
};
