//! Bucket directory — the persistent map `bucket → (offset, size, count)`.
//!
//! The directory locates each bucket's contiguous byte region inside the
//! data file. It is held fully in memory and persisted as a single blob,
//! rewritten whole by every merge.
//!
//! # On-disk blob layout
//!
//! ```text
//! [len: u32 LE][bincode(BucketDirectory): len bytes][crc32: u32 LE]
//! ```
//!
//! The CRC is computed over the encoded bytes only. A mismatch on load is
//! reported as corruption — the blob is never silently reset, because a
//! directory that cannot be trusted means the data file cannot be read.
//!
//! # Atomicity
//!
//! [`save`] writes to `<path>.tmp`, syncs, then renames over the final
//! path, so a crashed save leaves either the previous blob or the new one.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use bincode::{config::standard, decode_from_slice, encode_to_vec};
use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, info};

const U32_SIZE: usize = std::mem::size_of::<u32>();

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by directory load/save operations.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Blob serialization error.
    #[error("Serialization (encode) error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    /// Blob deserialization error.
    #[error("Deserialization (decode) error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    /// The blob's length field disagrees with the file size.
    #[error("Directory blob truncated: {0}")]
    Truncated(String),

    /// Blob checksum did not match its contents.
    #[error("Directory blob checksum mismatch")]
    ChecksumMismatch,
}

// ------------------------------------------------------------------------------------------------
// Descriptor / directory
// ------------------------------------------------------------------------------------------------

/// Location of one bucket's contiguous region in the data file.
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct BucketDescriptor {
    /// Byte offset of the region's first frame.
    pub offset: u64,

    /// Byte length of the region, frame prefixes included.
    pub size: u64,

    /// Number of records in the region after duplicate collapse.
    pub count: u64,
}

/// Ordered map of every bucket present in the data file.
///
/// Lookup is the only operation the engine requires; the ordered
/// representation keeps blob serialization deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct BucketDirectory {
    entries: BTreeMap<Vec<u8>, BucketDescriptor>,
}

impl BucketDirectory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up the descriptor for a bucket.
    pub fn get(&self, bucket: &[u8]) -> Option<&BucketDescriptor> {
        self.entries.get(bucket)
    }

    /// Inserts or replaces a bucket's descriptor.
    pub fn insert(&mut self, bucket: Vec<u8>, descriptor: BucketDescriptor) {
        self.entries.insert(bucket, descriptor);
    }

    /// Number of buckets.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no bucket is present.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates buckets in ascending byte order.
    pub fn iter(&self) -> impl Iterator<Item = (&Vec<u8>, &BucketDescriptor)> {
        self.entries.iter()
    }
}

// ------------------------------------------------------------------------------------------------
// Persistence
// ------------------------------------------------------------------------------------------------

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

/// Persists the directory blob atomically at `path`.
pub fn save(path: &Path, directory: &BucketDirectory) -> Result<(), DirectoryError> {
    let config = standard().with_fixed_int_encoding();
    let blob = encode_to_vec(directory, config)?;

    let mut hasher = Crc32::new();
    hasher.update(&blob);
    let checksum = hasher.finalize();

    let staging = tmp_path(path);
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&staging)?;
    file.write_all(&(blob.len() as u32).to_le_bytes())?;
    file.write_all(&blob)?;
    file.write_all(&checksum.to_le_bytes())?;
    file.sync_all()?;
    drop(file);

    fs::rename(&staging, path)?;

    debug!(
        buckets = directory.len(),
        blob_bytes = blob.len(),
        path = %path.display(),
        "saved bucket directory"
    );
    Ok(())
}

/// Loads the directory blob at `path`.
///
/// A missing file yields an empty directory, which is persisted
/// immediately so the on-disk pair exists from first start.
pub fn load(path: &Path) -> Result<BucketDirectory, DirectoryError> {
    if !path.exists() {
        let empty = BucketDirectory::new();
        save(path, &empty)?;
        info!(path = %path.display(), "created empty bucket directory");
        return Ok(empty);
    }

    let mut file = File::open(path)?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;

    if bytes.len() < U32_SIZE {
        return Err(DirectoryError::Truncated(format!(
            "{} bytes is shorter than the length field",
            bytes.len()
        )));
    }
    let declared = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let expected_total = U32_SIZE + declared + U32_SIZE;
    if bytes.len() != expected_total {
        return Err(DirectoryError::Truncated(format!(
            "expected {expected_total} bytes, found {}",
            bytes.len()
        )));
    }

    let blob = &bytes[U32_SIZE..U32_SIZE + declared];
    let stored_checksum = u32::from_le_bytes([
        bytes[expected_total - 4],
        bytes[expected_total - 3],
        bytes[expected_total - 2],
        bytes[expected_total - 1],
    ]);

    let mut hasher = Crc32::new();
    hasher.update(blob);
    if hasher.finalize() != stored_checksum {
        return Err(DirectoryError::ChecksumMismatch);
    }

    let config = standard().with_fixed_int_encoding();
    let (directory, _) = decode_from_slice::<BucketDirectory, _>(blob, config)?;

    debug!(
        buckets = directory.len(),
        path = %path.display(),
        "loaded bucket directory"
    );
    Ok(directory)
}
