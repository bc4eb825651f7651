//! On-disk layout under a caller-chosen root path.
//!
//! Every file the engine owns is named by appending a suffix to the root
//! path `R`:
//!
//! | Path | Role |
//! |---|---|
//! | `R.data` | live data file |
//! | `R.buckets` | live bucket directory blob |
//! | `R.raw.<rand>` | pending rawfile |
//! | `R.rawmerged` | sorted union of rawfiles, transient per merge |
//! | `R.merged` | new data file being built, transient per merge |
//! | `R.buckets_merged` | new directory being built, transient per merge |
//!
//! [`RootLayout`] owns path derivation and the startup scan that finds
//! rawfiles orphaned by a merge that never completed.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use rand::Rng;
use tracing::info;

/// Path derivation for all engine-owned files under one root.
#[derive(Debug, Clone)]
pub struct RootLayout {
    root: PathBuf,
    /// UTF-8 file-name stem of the root, kept for prefix matching
    /// during the rawfile scan.
    stem: String,
}

impl RootLayout {
    /// Builds a layout for the given root path, creating its parent
    /// directory if needed.
    ///
    /// The root's file name must be valid UTF-8 so that rawfile names
    /// can be matched by prefix.
    pub fn new(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        let stem = root
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("root path {} has no UTF-8 file name", root.display()),
                )
            })?
            .to_string();

        if let Some(parent) = root.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        Ok(Self { root, stem })
    }

    fn with_suffix(&self, suffix: &str) -> PathBuf {
        let mut name = OsString::from(self.root.as_os_str());
        name.push(".");
        name.push(suffix);
        PathBuf::from(name)
    }

    /// Live data file: `R.data`.
    pub fn data(&self) -> PathBuf {
        self.with_suffix("data")
    }

    /// Live directory blob: `R.buckets`.
    pub fn buckets(&self) -> PathBuf {
        self.with_suffix("buckets")
    }

    /// Sorted union of rawfiles: `R.rawmerged`.
    pub fn rawmerged(&self) -> PathBuf {
        self.with_suffix("rawmerged")
    }

    /// New data file being built by a merge: `R.merged`.
    pub fn merged(&self) -> PathBuf {
        self.with_suffix("merged")
    }

    /// New directory being built by a merge: `R.buckets_merged`.
    pub fn buckets_merged(&self) -> PathBuf {
        self.with_suffix("buckets_merged")
    }

    /// A fresh `R.raw.<rand>` path that does not currently exist.
    pub fn fresh_rawfile(&self) -> PathBuf {
        loop {
            let suffix: u64 = rand::rng().random();
            let path = self.with_suffix(&format!("raw.{suffix:016x}"));
            if !path.exists() {
                return path;
            }
        }
    }

    /// Scans the root's directory for `R.raw.*` files.
    ///
    /// Used at startup to restore rawfiles left behind by a merge that
    /// never posted completion. Order is not significant — rawfiles are
    /// unsorted and the next merge re-sorts everything.
    pub fn scan_rawfiles(&self) -> io::Result<Vec<PathBuf>> {
        let dir = match self.root.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let prefix = format!("{}.raw.", self.stem);

        let mut found = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_file()
                && let Some(name) = path.file_name().and_then(|n| n.to_str())
                && name.starts_with(&prefix)
            {
                found.push(path);
            }
        }

        if !found.is_empty() {
            info!(count = found.len(), "recovered pending rawfiles from disk");
        }
        Ok(found)
    }
}
