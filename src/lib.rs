// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Garbage collection core for key-value separated LSM-tree storage.
//!
//! Large values are externalised into append-only blob files; the LSM-tree
//! itself stores compact [`BlobIndex`] entries pointing into those files.
//! As keys get overwritten or deleted, blob files accumulate garbage, and
//! a background [`BlobGcJob`] reclaims the space: it scans a picked set of
//! input blob files, rewrites records that are still live into fresh blob
//! files, repoints the LSM at the new locations and retires the inputs.
//!
//! Liveness is decided by a per-file bitset fast path backed by an
//! authoritative LSM point get; races with foreground writes are resolved
//! by a write callback that re-checks the key right before the rewrite is
//! sequenced, so a racing overwrite makes the GC drop its rewrite rather
//! than clobber the newer value.
//!
//! The blob file catalog and the LSM manifest are separate, so the finish
//! phase installs output blob files *before* any LSM index is rewritten
//! and retires input files last; a crash at any point leaves redundant
//! copies, never a blob index that resolves to nothing.
//!
//! The LSM engine, the blob file manager, the blob catalog and the
//! statistics sink are consumed through traits; see [`LsmEngine`],
//! [`BlobFileManager`], [`BlobFileCatalog`] and [`StatsSink`].

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic, clippy::nursery)]
#![forbid(unsafe_code)]

mod blob;
mod catalog;
mod config;
mod error;
mod gc;
mod lsm;
mod serde;
mod stats;
mod value;

pub use blob::builder::{BlobFileBuilder, OutContext};
pub use blob::index::{BlobHandle, BlobIndex};
pub use blob::meta::{BlobFileMeta, FileEvent, FileState};
pub use blob::reader::BlobFileIterator;
pub use blob::record::BlobRecord;
pub use catalog::{BlobFileCatalog, BlobFileHandle, BlobFileManager, IoPriority, VersionEdit};
pub use config::{BlobRunMode, CompressionType, GcOptions, KeyComparator};
pub use error::{Error, Result};
pub use gc::callback::GcWriteCallback;
pub use gc::job::BlobGcJob;
pub use gc::merge::{BlobFileMergeIterator, BlobTuple};
pub use gc::shadow::{ShadowSet, ShadowTableBuilder, ShadowTableMeta, SHADOW_LEVELS};
pub use gc::BlobGc;
pub use lsm::{LsmEngine, LsmEntry, PointGet, WriteBatch};
pub use stats::{Histogram, StatsSink, Ticker};
pub use value::{InternalKey, SeqNo, UserData, UserKey, ValueType};
