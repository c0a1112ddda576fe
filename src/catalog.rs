// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::blob::meta::BlobFileMeta;
use crate::value::SeqNo;
use std::{path::PathBuf, sync::Arc};

/// I/O priority hint for new files
///
/// GC output files are written at low priority so they do not starve
/// foreground flushes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IoPriority {
    /// Background work
    Low,

    /// Foreground work
    High,
}

/// Handle to a newly created, not yet installed blob file
#[derive(Clone, Debug)]
pub struct BlobFileHandle {
    /// Assigned file number
    pub number: u64,

    /// Path the file is written at
    pub path: PathBuf,
}

/// Creates and installs blob files
///
/// Implementations are internally synchronized. A file created through
/// [`Self::new_file`] is invisible to readers until it is installed via
/// [`Self::batch_finish_files`]; uninstalled files are reclaimed through
/// [`Self::batch_delete_files`].
pub trait BlobFileManager: Send + Sync {
    /// Creates a new blob file, returning its handle
    fn new_file(&self, priority: IoPriority) -> crate::Result<BlobFileHandle>;

    /// Path of an existing blob file
    fn blob_file_path(&self, file_number: u64) -> PathBuf;

    /// Installs finished files into the blob catalog, all or nothing
    fn batch_finish_files(
        &self,
        cf_id: u32,
        files: &[(Arc<BlobFileMeta>, BlobFileHandle)],
    ) -> crate::Result<()>;

    /// Deletes files that will never be installed
    fn batch_delete_files(&self, handles: &[BlobFileHandle]) -> crate::Result<()>;
}

/// A durable catalog edit retiring blob files
#[derive(Clone, Debug)]
pub struct VersionEdit {
    /// Column family the edit belongs to
    pub cf_id: u32,

    /// Files to retire, each at the sequence number current when the
    /// decision was made
    pub deleted_files: Vec<(u64, SeqNo)>,
}

impl VersionEdit {
    /// Creates an empty edit for a column family
    #[must_use]
    pub fn new(cf_id: u32) -> Self {
        Self {
            cf_id,
            deleted_files: Vec::new(),
        }
    }

    /// Records the retirement of a blob file
    pub fn delete_blob_file(&mut self, file_number: u64, sequence: SeqNo) {
        self.deleted_files.push((file_number, sequence));
    }
}

/// The persistent blob file catalog
///
/// Owns the canonical [`BlobFileMeta`] instances and the manifest that
/// records file lifecycles. Implementations serialize all mutations.
pub trait BlobFileCatalog: Send + Sync {
    /// Looks up the metadata of a registered blob file
    fn find_file(&self, cf_id: u32, file_number: u64) -> Option<Arc<BlobFileMeta>>;

    /// Logs the edit durably and applies it
    ///
    /// Applying an edit transitions every named file to obsolete at its
    /// recorded sequence number.
    fn log_and_apply(&self, edit: VersionEdit) -> crate::Result<()>;

    /// Refreshes the GC score of a column family after liveness changed
    fn compute_gc_score(&self, _cf_id: u32) {}
}
