// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::blob::index::{BlobHandle, BlobIndex};
use crate::blob::record::BlobRecord;
use crate::value::{UserData, UserKey};
use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
};

/// Forward-only scan over one blob file
///
/// Yields `(user_key, blob_index, value)` in file order, reconstructing
/// each record's [`BlobIndex`] from its position. Not restartable; the
/// first error ends the iteration.
pub struct BlobFileIterator {
    path: PathBuf,
    reader: BufReader<File>,
    file_number: u64,
    file_pos: u64,
    order: u64,
    done: bool,
}

impl BlobFileIterator {
    /// Opens a blob file for scanning
    pub fn open<P: AsRef<Path>>(path: P, file_number: u64) -> crate::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;

        Ok(Self {
            path,
            reader: BufReader::with_capacity(512_000, file),
            file_number,
            file_pos: 0,
            order: 0,
            done: false,
        })
    }

    /// Path of the file being scanned
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of the file being scanned
    #[must_use]
    pub fn file_number(&self) -> u64 {
        self.file_number
    }
}

impl Iterator for BlobFileIterator {
    type Item = crate::Result<(UserKey, BlobIndex, UserData)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match BlobRecord::decode_from(&mut self.reader) {
            Ok(Some((record, consumed))) => {
                let blob_index = BlobIndex {
                    file_number: self.file_number,
                    blob_handle: BlobHandle {
                        offset: self.file_pos,
                        size: consumed,
                        order: self.order,
                    },
                };

                self.file_pos += consumed;
                self.order += 1;

                Some(Ok((record.key, blob_index, record.value)))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e.into()))
            }
        }
    }
}
