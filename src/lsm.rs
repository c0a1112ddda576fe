// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::gc::callback::GcWriteCallback;
use crate::value::{SeqNo, UserData, UserKey, ValueType};

/// Entry returned by a blob-index-passthrough point get
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LsmEntry {
    /// Plain value, stored inline in the LSM
    Value(UserData),

    /// Encoded blob index, returned verbatim instead of being dereferenced
    BlobIndex(UserData),
}

/// Result of a point get issued by the GC job
#[derive(Clone, Debug)]
pub struct PointGet {
    /// Current entry for the key, `None` if the key does not exist
    pub entry: Option<LsmEntry>,

    /// LSM level that serviced the read, `-1` when unknown
    pub level: i32,
}

/// A batch carrying exactly one put
///
/// GC rewrites are one key each because every one needs its own callback
/// decision; the engine must not group them with other writes.
#[derive(Clone, Debug)]
pub struct WriteBatch {
    /// Key being rewritten
    pub key: UserKey,

    /// New entry payload: an encoded blob index, or the inline value in
    /// fallback mode
    pub value: UserData,

    /// Kind of the new entry
    pub value_type: ValueType,
}

impl WriteBatch {
    /// Payload size of the batch in bytes
    #[must_use]
    pub fn data_size(&self) -> u64 {
        (self.key.len() + self.value.len()) as u64
    }
}

/// The LSM engine, as seen by the GC job
///
/// Everything behind this trait is internally synchronized; the job may
/// be preempted by foreground writes between any two calls.
pub trait LsmEngine: Send + Sync {
    /// Point get with blob index passthrough and level report
    ///
    /// A missing key is `Ok` with an empty entry, not an error.
    fn get_for_gc(&self, cf_id: u32, key: &[u8]) -> crate::Result<PointGet>;

    /// Applies `batch` if the callback's re-check passes
    ///
    /// Implementations must invoke [`GcWriteCallback::check`] with serial
    /// access to the key's current value immediately before sequencing the
    /// write, and must sequence the write atomically with that check.
    /// A failed check surfaces as [`Error::Busy`](crate::Error::Busy) and
    /// leaves the LSM untouched.
    fn write_with_callback(
        &self,
        cf_id: u32,
        batch: &WriteBatch,
        callback: &mut GcWriteCallback,
    ) -> crate::Result<()>;

    /// Flushes the write-ahead log, syncing it when asked to
    fn flush_wal(&self, sync: bool) -> crate::Result<()>;

    /// Latest sequence number assigned by the LSM
    fn latest_sequence_number(&self) -> SeqNo;

    /// Whether the column family has been dropped
    fn is_column_family_dropped(&self, cf_id: u32) -> bool;
}
