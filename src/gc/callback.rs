// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::blob::index::BlobIndex;
use crate::error::Error;
use crate::lsm::{LsmEngine, LsmEntry};
use crate::value::UserKey;

/// Re-checks a key immediately before the LSM sequences a GC rewrite
///
/// Works like optimistic transaction validation: the engine invokes
/// [`Self::check`] with serial access to the key's current value; any
/// concurrent overwrite since the scan read the key fails the check with
/// [`Error::Busy`], and the rewrite is dropped instead of clobbering the
/// newer version.
pub struct GcWriteCallback {
    cf_id: u32,
    key: UserKey,
    blob_index: BlobIndex,

    /// Empty when the record is rewritten inline (fallback mode)
    new_blob_index: BlobIndex,

    read_bytes: u64,
}

impl GcWriteCallback {
    /// Creates a callback guarding one rewrite
    ///
    /// # Panics
    ///
    /// Panics if the key is empty.
    #[must_use]
    pub fn new(
        cf_id: u32,
        key: UserKey,
        blob_index: BlobIndex,
        new_blob_index: BlobIndex,
    ) -> Self {
        assert!(!key.is_empty());

        Self {
            cf_id,
            key,
            blob_index,
            new_blob_index,
            read_bytes: 0,
        }
    }

    /// The authoritative re-check
    ///
    /// Must be called by the engine's write path right before the write is
    /// sequenced, while no other write to the key can interleave.
    pub fn check(&mut self, db: &dyn LsmEngine) -> crate::Result<()> {
        let got = db.get_for_gc(self.cf_id, &self.key)?;

        match got.entry {
            None => {
                self.read_bytes = self.key.len() as u64;

                // Either the key is deleted or updated with a newer version
                // which is inlined in the LSM
                Err(Error::Busy("key deleted"))
            }
            Some(LsmEntry::Value(value)) => {
                self.read_bytes = (self.key.len() + value.len()) as u64;
                Err(Error::Busy("key overwritten with other value"))
            }
            Some(LsmEntry::BlobIndex(index_entry)) => {
                self.read_bytes = (self.key.len() + index_entry.len()) as u64;

                let other_blob_index = BlobIndex::decode(&index_entry).map_err(|e| {
                    log::error!("Corrupt blob index entry for key {:?}", self.key);
                    Error::from(e)
                })?;

                if other_blob_index == self.blob_index {
                    Ok(())
                } else {
                    Err(Error::Busy("key overwritten with other blob"))
                }
            }
        }
    }

    /// Key being rewritten
    #[must_use]
    pub fn key(&self) -> &UserKey {
        &self.key
    }

    /// Bytes the re-check read from the LSM
    #[must_use]
    pub fn read_bytes(&self) -> u64 {
        self.read_bytes
    }

    /// On-disk size of the blob record being replaced
    #[must_use]
    pub fn blob_record_size(&self) -> u64 {
        self.blob_index.blob_handle.size
    }

    /// Index the rewrite points at, empty for inline rewrites
    #[must_use]
    pub fn new_blob_index(&self) -> &BlobIndex {
        &self.new_blob_index
    }

    /// Callback writes must not be grouped with other writes
    #[must_use]
    pub fn allow_write_batching(&self) -> bool {
        false
    }
}
