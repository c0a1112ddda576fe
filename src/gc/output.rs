// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::blob::builder::{BlobFileBuilder, OutContext};
use crate::blob::index::BlobIndex;
use crate::blob::record::BlobRecord;
use crate::catalog::{BlobFileHandle, BlobFileManager, IoPriority};
use crate::config::CompressionType;

/// Packs surviving records into new blob files
///
/// Keeps at most one output open; once the current file reaches the
/// target size it is sealed and a new one is requested from the blob file
/// manager at low I/O priority. This results in a run of roughly evenly
/// sized output files.
pub struct OutputBuilder<'a> {
    manager: &'a dyn BlobFileManager,
    target_size: u64,
    compression: CompressionType,

    current: Option<(BlobFileHandle, BlobFileBuilder)>,
    sealed: Vec<(BlobFileHandle, BlobFileBuilder)>,
}

impl<'a> OutputBuilder<'a> {
    /// Sets up an output builder; no file is created until the first record
    #[must_use]
    pub fn new(
        manager: &'a dyn BlobFileManager,
        target_size: u64,
        compression: CompressionType,
    ) -> Self {
        Self {
            manager,
            target_size,
            compression,
            current: None,
            sealed: Vec::new(),
        }
    }

    /// Seals the current file (if any) and opens the next one
    fn rotate(&mut self) -> crate::Result<()> {
        if let Some(sealed) = self.current.take() {
            self.sealed.push(sealed);
        }

        let handle = self.manager.new_file(IoPriority::Low)?;
        log::info!("New GC output blob file {}", handle.number);

        let builder = BlobFileBuilder::new(&handle, self.compression)?;
        self.current = Some((handle, builder));

        Ok(())
    }

    /// Appends a surviving record to the current output
    ///
    /// Returns the contexts that became complete; handles inside them
    /// point at the output file the record landed in.
    pub fn add(
        &mut self,
        record: &BlobRecord,
        original_blob_index: BlobIndex,
    ) -> crate::Result<Vec<OutContext>> {
        let needs_rotate = match &self.current {
            None => true,
            Some((_, builder)) => builder.file_size() >= self.target_size,
        };

        if needs_rotate {
            self.rotate()?;
        }

        let (_, builder) = self.current.as_mut().expect("output should be open");
        builder.add(record, original_blob_index)
    }

    /// Whether any output file has been opened
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.current.is_none() && self.sealed.is_empty()
    }

    /// Hands out every builder, sealed and current, in creation order
    #[must_use]
    pub fn into_builders(mut self) -> Vec<(BlobFileHandle, BlobFileBuilder)> {
        if let Some(current) = self.current.take() {
            self.sealed.push(current);
        }
        self.sealed
    }
}
