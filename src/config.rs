// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::cmp::Ordering;
use std::sync::Arc;

/// User-key ordering of the column family
///
/// The merge iterator emits records in this order; the LSM must use
/// the same ordering, otherwise rewritten indexes will interleave badly
/// with foreground writes.
pub type KeyComparator = Arc<dyn Fn(&[u8], &[u8]) -> Ordering + Send + Sync>;

/// Compression applied to blob records written by GC
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CompressionType {
    /// No compression
    None,

    /// LZ4 compression
    Lz4,
}

impl std::fmt::Display for CompressionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Lz4 => write!(f, "lz4"),
        }
    }
}

/// Blob behaviour of a column family
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum BlobRunMode {
    /// Live records are rewritten into new blob files
    #[default]
    Normal,

    /// Live values are written back into the LSM inline
    ///
    /// No new blob files are created; the engine is converging back to a
    /// non-separated state.
    Fallback,
}

/// GC job settings of a column family
#[derive(Clone)]
pub struct GcOptions {
    /// Target size of output blob files in bytes
    ///
    /// If an output file reaches the target size, a new one is started,
    /// resulting in a run of roughly evenly sized files.
    pub blob_file_target_size: u64,

    /// Compression of rewritten blob records
    pub blob_file_compression: CompressionType,

    /// Whether live records are relocated or folded back into the LSM
    pub blob_run_mode: BlobRunMode,

    /// Emit per-level shadow tables instead of rewriting through the
    /// LSM write path
    ///
    /// Shadow mode trades the overwrite safety of the write callback for
    /// throughput; races with foreground writes must be resolved by the
    /// shadow-ingest consumer. Mutually exclusive with
    /// [`BlobRunMode::Fallback`].
    pub rewrite_shadow: bool,

    /// Target size of shadow tables in bytes
    pub shadow_target_size: u64,

    /// User-key ordering of the column family
    pub comparator: KeyComparator,

    /// Database identifier, stamped into shadow table metadata
    pub db_id: String,

    /// Database session identifier, stamped into shadow table metadata
    pub db_session_id: String,
}

impl Default for GcOptions {
    fn default() -> Self {
        Self {
            blob_file_target_size: /* 256 MiB */ 256 * 1_024 * 1_024,
            blob_file_compression: CompressionType::Lz4,
            blob_run_mode: BlobRunMode::Normal,
            rewrite_shadow: false,
            shadow_target_size: /* 64 MiB */ 64 * 1_024 * 1_024,
            comparator: Arc::new(|a: &[u8], b: &[u8]| a.cmp(b)),
            db_id: String::new(),
            db_session_id: String::new(),
        }
    }
}

impl GcOptions {
    /// Sets the target size of output blob files
    #[must_use]
    pub fn blob_file_target_size(mut self, bytes: u64) -> Self {
        self.blob_file_target_size = bytes;
        self
    }

    /// Sets the compression of rewritten blob records
    #[must_use]
    pub fn blob_file_compression(mut self, compression: CompressionType) -> Self {
        self.blob_file_compression = compression;
        self
    }

    /// Sets the blob run mode
    #[must_use]
    pub fn blob_run_mode(mut self, mode: BlobRunMode) -> Self {
        self.blob_run_mode = mode;
        self
    }

    /// Enables or disables shadow output
    #[must_use]
    pub fn rewrite_shadow(mut self, enabled: bool) -> Self {
        self.rewrite_shadow = enabled;
        self
    }

    /// Sets the target size of shadow tables
    #[must_use]
    pub fn shadow_target_size(mut self, bytes: u64) -> Self {
        self.shadow_target_size = bytes;
        self
    }

    /// Sets the user-key comparator
    #[must_use]
    pub fn comparator(mut self, comparator: KeyComparator) -> Self {
        self.comparator = comparator;
        self
    }

    /// Sets the database identifiers stamped into shadow table metadata
    #[must_use]
    pub fn db_identifiers(mut self, db_id: String, db_session_id: String) -> Self {
        self.db_id = db_id;
        self.db_session_id = db_session_id;
        self
    }
}
