// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::blob::index::{BlobHandle, BlobIndex};
use crate::blob::record::BlobRecord;
use crate::catalog::BlobFileHandle;
use crate::config::CompressionType;
use crate::value::{InternalKey, UserKey, ValueType};
use std::{
    fs::File,
    io::{BufWriter, Write},
};

/// Bookkeeping for one record rewritten by GC
///
/// Produced by the blob file builder, consumed by the index writer.
#[derive(Clone, Debug)]
pub struct OutContext {
    /// Internal-key encoding of the rewritten user key
    pub internal_key: InternalKey,

    /// Index the LSM pointed at before the rewrite
    pub original_blob_index: BlobIndex,

    /// Index into the new blob file
    ///
    /// The file number is stamped when the record is handed to the
    /// builder; the handle is filled once the record hits the file.
    pub new_blob_index: BlobIndex,
}

/// Writes records into one new blob file
///
/// Assigns `order` monotonically and returns an [`OutContext`] per record
/// once its handle is known. Contexts not yet surfaced by [`Self::add`]
/// are drained by [`Self::finish`].
pub struct BlobFileBuilder {
    file_number: u64,
    writer: BufWriter<File>,
    compression: CompressionType,

    file_pos: u64,
    entry_count: u64,
    live_data_size: u64,

    smallest_key: Option<UserKey>,
    largest_key: Option<UserKey>,
}

impl BlobFileBuilder {
    /// Opens a builder over a fresh file handle
    pub fn new(handle: &BlobFileHandle, compression: CompressionType) -> crate::Result<Self> {
        let file = File::create(&handle.path)?;

        Ok(Self {
            file_number: handle.number,
            writer: BufWriter::with_capacity(512_000, file),
            compression,
            file_pos: 0,
            entry_count: 0,
            live_data_size: 0,
            smallest_key: None,
            largest_key: None,
        })
    }

    /// Appends a record, returning the contexts that became complete
    pub fn add(
        &mut self,
        record: &BlobRecord,
        original_blob_index: BlobIndex,
    ) -> crate::Result<Vec<OutContext>> {
        let written = record.encode_into(&mut self.writer, self.compression)?;

        let handle = BlobHandle {
            offset: self.file_pos,
            size: written,
            order: self.entry_count,
        };

        self.file_pos += written;
        self.entry_count += 1;
        self.live_data_size += written;

        if self.smallest_key.is_none() {
            self.smallest_key = Some(record.key.clone());
        }
        self.largest_key = Some(record.key.clone());

        Ok(vec![OutContext {
            internal_key: InternalKey::new(record.key.clone(), 1, ValueType::Value),
            original_blob_index,
            new_blob_index: BlobIndex {
                file_number: self.file_number,
                blob_handle: handle,
            },
        }])
    }

    /// Flushes and syncs the file, draining any remaining contexts
    pub fn finish(&mut self) -> crate::Result<Vec<OutContext>> {
        self.writer.flush()?;
        self.writer.get_mut().sync_all()?;

        log::debug!(
            "Written {} records into new blob file {}, {} bytes",
            self.entry_count,
            self.file_number,
            self.file_pos
        );

        // Without dictionary compression no context is held back,
        // every record surfaced its context at add time already
        Ok(Vec::new())
    }

    /// Number of the file being written
    #[must_use]
    pub fn file_number(&self) -> u64 {
        self.file_number
    }

    /// Bytes handed to the file so far
    #[must_use]
    pub fn file_size(&self) -> u64 {
        self.file_pos
    }

    /// Number of records written
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// Bytes that are live at creation time (all of them)
    #[must_use]
    pub fn live_data_size(&self) -> u64 {
        self.live_data_size
    }

    /// Smallest user key written
    #[must_use]
    pub fn smallest_key(&self) -> Option<&UserKey> {
        self.smallest_key.as_ref()
    }

    /// Largest user key written
    #[must_use]
    pub fn largest_key(&self) -> Option<&UserKey> {
        self.largest_key.as_ref()
    }
}
