// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::value::{SeqNo, UserKey};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex,
};

/// Lifecycle state of a blob file
///
/// Transitions are serialized by the blob catalog; a file can never go
/// from `Normal` to `Obsolete` directly, it has to be picked for GC first.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FileState {
    /// Regular live file
    Normal,

    /// Picked as GC input; hidden from further picking
    PendingGc,

    /// Created as the output of a GC job
    GcOutput,

    /// Retired; readers pinned to an older sequence may still resolve it
    Obsolete,
}

/// Events that drive blob file state transitions
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FileEvent {
    /// The picker selected the file as GC input
    PickedForGc,

    /// The file was produced by a GC job
    GcOutput,
}

/// One bit per record; 0 means "known dead"
///
/// The bitset may under-report garbage (a set bit for a dead record) but
/// must never claim a live record dead. An uninitialized bitset therefore
/// reads as all-live.
#[derive(Debug, Default)]
struct LivenessBitset {
    bytes: Vec<u8>,
    len: u64,
}

impl LivenessBitset {
    fn all_set(len: u64) -> Self {
        let byte_count = usize::try_from(len.div_ceil(8)).expect("bitset should fit in memory");
        Self {
            bytes: vec![0xFF; byte_count],
            len,
        }
    }

    fn get(&self, idx: u64) -> bool {
        if self.len == 0 || idx >= self.len {
            // No liveness information, must assume live
            return true;
        }
        let idx = idx as usize;
        (self.bytes[idx / 8] >> (idx % 8)) & 1 == 1
    }

    fn set(&mut self, idx: u64, live: bool) {
        if idx >= self.len {
            return;
        }
        let idx = idx as usize;
        if live {
            self.bytes[idx / 8] |= 1 << (idx % 8);
        } else {
            self.bytes[idx / 8] &= !(1 << (idx % 8));
        }
    }
}

#[derive(Debug)]
struct MetaInner {
    state: FileState,
    obsolete_sequence: Option<SeqNo>,
    live_bitset: LivenessBitset,
}

/// Metadata of one blob file
///
/// The catalog owns the canonical instance; jobs hold shared handles.
/// Liveness and state mutations happen under the catalog's serialization,
/// the fields here only provide the interior mutability for that.
#[derive(Debug)]
pub struct BlobFileMeta {
    file_number: u64,
    file_size: u64,
    entry_count: u64,
    smallest_key: UserKey,
    largest_key: UserKey,
    live_data_size: AtomicU64,
    inner: Mutex<MetaInner>,
}

impl BlobFileMeta {
    /// Creates metadata for a freshly written blob file
    #[must_use]
    pub fn new(
        file_number: u64,
        file_size: u64,
        entry_count: u64,
        smallest_key: UserKey,
        largest_key: UserKey,
    ) -> Self {
        Self {
            file_number,
            file_size,
            entry_count,
            smallest_key,
            largest_key,
            live_data_size: AtomicU64::new(0),
            inner: Mutex::new(MetaInner {
                state: FileState::Normal,
                obsolete_sequence: None,
                live_bitset: LivenessBitset::default(),
            }),
        }
    }

    /// File number
    #[must_use]
    pub fn file_number(&self) -> u64 {
        self.file_number
    }

    /// File size in bytes
    #[must_use]
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Number of records in the file
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// Smallest user key in the file
    #[must_use]
    pub fn smallest_key(&self) -> &UserKey {
        &self.smallest_key
    }

    /// Largest user key in the file
    #[must_use]
    pub fn largest_key(&self) -> &UserKey {
        &self.largest_key
    }

    /// Bytes still referenced by the LSM, as far as the engine knows
    #[must_use]
    pub fn live_data_size(&self) -> u64 {
        self.live_data_size.load(Ordering::Acquire)
    }

    /// Overwrites the live data size
    pub fn set_live_data_size(&self, bytes: u64) {
        self.live_data_size.store(bytes, Ordering::Release);
    }

    /// Adjusts the live data size by a (possibly negative) delta
    pub fn update_live_data_size(&self, delta: i64) {
        if delta >= 0 {
            self.live_data_size
                .fetch_add(delta.unsigned_abs(), Ordering::AcqRel);
        } else {
            // Saturate instead of wrapping if accounting ever drifts
            let mut current = self.live_data_size.load(Ordering::Acquire);
            loop {
                let next = current.saturating_sub(delta.unsigned_abs());
                match self.live_data_size.compare_exchange_weak(
                    current,
                    next,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break,
                    Err(now) => current = now,
                }
            }
        }
    }

    /// Initializes the liveness bitset with all records live
    pub fn init_live_bitset(&self, entry_count: u64) {
        let mut inner = self.inner.lock().expect("lock is poisoned");
        inner.live_bitset = LivenessBitset::all_set(entry_count);
    }

    /// Whether the record at `order` may still be live
    ///
    /// `false` is definitive ("known dead"); `true` may be a false
    /// negative and needs the authoritative LSM check.
    #[must_use]
    pub fn is_live(&self, order: u64) -> bool {
        let inner = self.inner.lock().expect("lock is poisoned");
        inner.live_bitset.get(order)
    }

    /// Marks the record at `order` live or dead
    pub fn set_live(&self, order: u64, live: bool) {
        let mut inner = self.inner.lock().expect("lock is poisoned");
        inner.live_bitset.set(order, live);
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> FileState {
        self.inner.lock().expect("lock is poisoned").state
    }

    /// Whether the file has been retired
    #[must_use]
    pub fn is_obsolete(&self) -> bool {
        self.state() == FileState::Obsolete
    }

    /// Sequence number the file was retired at, if any
    #[must_use]
    pub fn obsolete_sequence(&self) -> Option<SeqNo> {
        self.inner
            .lock()
            .expect("lock is poisoned")
            .obsolete_sequence
    }

    /// Applies a lifecycle event
    ///
    /// # Panics
    ///
    /// Panics if the transition is not allowed by the state machine.
    pub fn transit(&self, event: FileEvent) {
        let mut inner = self.inner.lock().expect("lock is poisoned");

        inner.state = match (inner.state, event) {
            (FileState::Normal, FileEvent::PickedForGc) => FileState::PendingGc,
            (FileState::Normal | FileState::PendingGc, FileEvent::GcOutput) => FileState::GcOutput,
            (state, event) => {
                panic!("invalid blob file state transition: {state:?} on {event:?}")
            }
        };
    }

    /// Retires the file at the given sequence number
    ///
    /// # Panics
    ///
    /// Panics if the file was never picked for GC; `Normal` files must not
    /// be retired directly.
    pub fn mark_obsolete(&self, sequence: SeqNo) {
        let mut inner = self.inner.lock().expect("lock is poisoned");

        assert!(
            matches!(inner.state, FileState::PendingGc | FileState::GcOutput),
            "only files picked for GC or produced by GC can be retired"
        );

        inner.state = FileState::Obsolete;
        inner.obsolete_sequence = Some(sequence);
    }
}
