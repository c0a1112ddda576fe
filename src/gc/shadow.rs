// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::blob::builder::OutContext;
use crate::serde::Serializable;
use crate::value::{InternalKey, UserKey, ValueType};
use byteorder::{BigEndian, WriteBytesExt};
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

/// Number of LSM levels shadow output distinguishes
pub const SHADOW_LEVELS: usize = 7;

/// Metadata of one finished shadow table
#[derive(Clone, Debug)]
pub struct ShadowTableMeta {
    /// Assigned shadow file number
    pub file_number: u64,

    /// LSM level the table's keys currently live at
    pub level: usize,

    /// Path of the table file
    pub path: PathBuf,

    /// File size in bytes
    pub file_size: u64,

    /// Number of index entries in the table
    pub item_count: u64,

    /// Smallest user key in the table
    pub smallest_key: Option<UserKey>,

    /// Largest user key in the table
    pub largest_key: Option<UserKey>,

    /// Database identifier of the producer
    pub db_id: String,

    /// Database session identifier of the producer
    pub db_session_id: String,
}

/// Side catalog of shadow tables awaiting ingest
///
/// GC jobs append finished tables here; the shadow-ingest consumer drains
/// the set and folds the index entries into the LSM, resolving races with
/// foreground writes as it goes.
pub struct ShadowSet {
    dir: PathBuf,
    next_file_number: AtomicU64,
    shadows: Mutex<Vec<ShadowTableMeta>>,
}

impl ShadowSet {
    /// Creates a shadow set writing into `dir`
    #[must_use]
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            next_file_number: AtomicU64::new(1),
            shadows: Mutex::new(Vec::new()),
        }
    }

    /// Allocates the next shadow file number
    #[must_use]
    pub fn new_file_number(&self) -> u64 {
        self.next_file_number.fetch_add(1, Ordering::SeqCst)
    }

    /// Path of a shadow table file
    #[must_use]
    pub fn new_file_name(&self, file_number: u64, level: usize) -> PathBuf {
        self.dir.join(format!("{file_number:06}_{level}.shadow"))
    }

    /// Appends finished tables to the set
    pub fn install(&self, metas: Vec<ShadowTableMeta>) {
        self.shadows
            .lock()
            .expect("lock is poisoned")
            .extend(metas);
    }

    /// Snapshot of the currently installed tables
    #[must_use]
    pub fn shadows(&self) -> Vec<ShadowTableMeta> {
        self.shadows.lock().expect("lock is poisoned").clone()
    }

    /// Number of installed tables
    #[must_use]
    pub fn len(&self) -> usize {
        self.shadows.lock().expect("lock is poisoned").len()
    }

    /// Whether no tables are installed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Writes one shadow table: a sorted run of internal key → blob index
///
/// Records are shaped like LSM entries, keyed `(user_key, seq=1,
/// kind=BlobIndex)`, so the ingest consumer can treat the table like an
/// ordinary flushed table.
///
/// # Disk representation
///
/// N × (\[internal key] \[index length; 4 bytes] \[encoded index]),
/// then \[item count; 8 bytes] \[crc; 4 bytes]
pub struct ShadowTableBuilder {
    file_number: u64,
    level: usize,
    path: PathBuf,
    writer: BufWriter<File>,
    hasher: crc32fast::Hasher,

    file_pos: u64,
    item_count: u64,

    smallest_key: Option<UserKey>,
    largest_key: Option<UserKey>,

    db_id: String,
    db_session_id: String,
}

impl ShadowTableBuilder {
    /// Opens a builder for one level's next shadow table
    pub fn new(
        shadow_set: &ShadowSet,
        level: usize,
        db_id: String,
        db_session_id: String,
    ) -> crate::Result<Self> {
        assert!(level < SHADOW_LEVELS);

        let file_number = shadow_set.new_file_number();
        let path = shadow_set.new_file_name(file_number, level);

        log::info!("New GC shadow table {file_number} for level {level}");

        let file = File::create(&path)?;

        Ok(Self {
            file_number,
            level,
            path,
            writer: BufWriter::with_capacity(512_000, file),
            hasher: crc32fast::Hasher::new(),
            file_pos: 0,
            item_count: 0,
            smallest_key: None,
            largest_key: None,
            db_id,
            db_session_id,
        })
    }

    /// Appends one rewritten index entry
    pub fn add(&mut self, ctx: &OutContext) -> crate::Result<()> {
        let shadow_key = InternalKey::new(
            ctx.internal_key.user_key.clone(),
            1,
            ValueType::BlobIndex,
        );
        let index_entry = ctx.new_blob_index.encoded();

        let mut frame = Vec::with_capacity(shadow_key.user_key.len() + index_entry.len() + 16);
        shadow_key.serialize(&mut frame)?;

        // NOTE: Truncation is okay and actually needed
        #[allow(clippy::cast_possible_truncation)]
        frame.write_u32::<BigEndian>(index_entry.len() as u32)?;
        frame.write_all(&index_entry)?;

        self.hasher.update(&frame);
        self.writer.write_all(&frame)?;
        self.file_pos += frame.len() as u64;
        self.item_count += 1;

        if self.smallest_key.is_none() {
            self.smallest_key = Some(shadow_key.user_key.clone());
        }
        self.largest_key = Some(shadow_key.user_key);

        Ok(())
    }

    /// Bytes handed to the file so far
    #[must_use]
    pub fn estimated_size(&self) -> u64 {
        self.file_pos
    }

    /// Level this builder writes for
    #[must_use]
    pub fn level(&self) -> usize {
        self.level
    }

    /// Path of the table file being written
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the footer, syncs the file and returns the table metadata
    pub fn finish(mut self) -> crate::Result<ShadowTableMeta> {
        let file_size = self.file_pos + 12;

        self.writer.write_u64::<BigEndian>(self.item_count)?;
        self.writer
            .write_u32::<BigEndian>(self.hasher.finalize())?;
        self.writer.flush()?;
        self.writer.get_mut().sync_all()?;

        log::debug!(
            "Written {} index entries into shadow table {} (level {})",
            self.item_count,
            self.file_number,
            self.level
        );

        Ok(ShadowTableMeta {
            file_number: self.file_number,
            level: self.level,
            path: self.path,
            file_size,
            item_count: self.item_count,
            smallest_key: self.smallest_key,
            largest_key: self.largest_key,
            db_id: self.db_id,
            db_session_id: self.db_session_id,
        })
    }
}
