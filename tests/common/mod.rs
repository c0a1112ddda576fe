// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

#![allow(dead_code)]

use blob_gc::{
    BlobFileBuilder, BlobFileCatalog, BlobFileHandle, BlobFileManager, BlobFileMeta, BlobIndex,
    BlobRecord, CompressionType, Error, GcWriteCallback, Histogram, IoPriority, LsmEngine,
    LsmEntry, PointGet, SeqNo, StatsSink, Ticker, ValueType, VersionEdit, WriteBatch,
};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};

pub const CF_ID: u32 = 1;
pub const CF_NAME: &str = "default";

/// In-memory LSM with a callback-validated write path
///
/// The write path re-checks the key through the callback before applying
/// the put, the way the real engine sequences callback writes.
#[derive(Default)]
pub struct MemLsm {
    map: Mutex<BTreeMap<Vec<u8>, (ValueType, Vec<u8>)>>,
    levels: Mutex<HashMap<Vec<u8>, i32>>,
    seqno: AtomicU64,
    cf_dropped: AtomicBool,
    wal_flushes: AtomicU64,
    gets: AtomicU64,

    /// Raises the shutdown flag once this many point gets have been served
    stop_after_gets: Mutex<Option<(u64, Arc<AtomicBool>)>>,
}

impl MemLsm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_blob_index(&self, key: &[u8], index: BlobIndex) {
        self.map.lock().unwrap().insert(
            key.to_vec(),
            (ValueType::BlobIndex, index.encoded()),
        );
        self.seqno.fetch_add(1, Ordering::SeqCst);
    }

    pub fn put_value(&self, key: &[u8], value: &[u8]) {
        self.map
            .lock()
            .unwrap()
            .insert(key.to_vec(), (ValueType::Value, value.to_vec()));
        self.seqno.fetch_add(1, Ordering::SeqCst);
    }

    pub fn delete(&self, key: &[u8]) {
        self.map.lock().unwrap().remove(key);
        self.seqno.fetch_add(1, Ordering::SeqCst);
    }

    pub fn get_raw(&self, key: &[u8]) -> Option<(ValueType, Vec<u8>)> {
        self.map.lock().unwrap().get(key).cloned()
    }

    pub fn get_blob_index(&self, key: &[u8]) -> Option<BlobIndex> {
        match self.get_raw(key)? {
            (ValueType::BlobIndex, bytes) => Some(BlobIndex::decode(&bytes).unwrap()),
            _ => None,
        }
    }

    pub fn set_level(&self, key: &[u8], level: i32) {
        self.levels.lock().unwrap().insert(key.to_vec(), level);
    }

    pub fn drop_column_family(&self) {
        self.cf_dropped.store(true, Ordering::SeqCst);
    }

    pub fn wal_flushes(&self) -> u64 {
        self.wal_flushes.load(Ordering::SeqCst)
    }

    pub fn gets(&self) -> u64 {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }

    pub fn stop_after_gets(&self, count: u64, shutting_down: Arc<AtomicBool>) {
        *self.stop_after_gets.lock().unwrap() = Some((count, shutting_down));
    }

    pub fn snapshot(&self) -> BTreeMap<Vec<u8>, (ValueType, Vec<u8>)> {
        self.map.lock().unwrap().clone()
    }
}

impl LsmEngine for MemLsm {
    fn get_for_gc(&self, _cf_id: u32, key: &[u8]) -> blob_gc::Result<PointGet> {
        let served = self.gets.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some((limit, shutting_down)) = &*self.stop_after_gets.lock().unwrap() {
            if served >= *limit {
                shutting_down.store(true, Ordering::Release);
            }
        }

        let entry = self.map.lock().unwrap().get(key).map(|(vt, bytes)| {
            let data: Arc<[u8]> = bytes.clone().into();
            match vt {
                ValueType::BlobIndex => LsmEntry::BlobIndex(data),
                _ => LsmEntry::Value(data),
            }
        });

        let level = if entry.is_some() {
            self.levels.lock().unwrap().get(key).copied().unwrap_or(1)
        } else {
            -1
        };

        Ok(PointGet { entry, level })
    }

    fn write_with_callback(
        &self,
        cf_id: u32,
        batch: &WriteBatch,
        callback: &mut GcWriteCallback,
    ) -> blob_gc::Result<()> {
        // Single-writer test engine: nothing can interleave between the
        // check and the insert below
        callback.check(self)?;
        let _ = cf_id;

        self.map.lock().unwrap().insert(
            batch.key.to_vec(),
            (batch.value_type, batch.value.to_vec()),
        );
        self.seqno.fetch_add(1, Ordering::SeqCst);

        Ok(())
    }

    fn flush_wal(&self, _sync: bool) -> blob_gc::Result<()> {
        self.wal_flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn latest_sequence_number(&self) -> SeqNo {
        self.seqno.load(Ordering::SeqCst)
    }

    fn is_column_family_dropped(&self, _cf_id: u32) -> bool {
        self.cf_dropped.load(Ordering::SeqCst)
    }
}

/// Blob file manager and catalog over a scratch directory
///
/// Registers installed files, applies retirement edits and can be told
/// to fail the install step.
pub struct TestBlobStore {
    dir: PathBuf,
    next_file_number: AtomicU64,
    files: Mutex<HashMap<u64, Arc<BlobFileMeta>>>,
    fail_batch_finish: AtomicBool,
    deleted: Mutex<Vec<u64>>,
    edits: Mutex<Vec<VersionEdit>>,
}

impl TestBlobStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            next_file_number: AtomicU64::new(1),
            files: Mutex::new(HashMap::new()),
            fail_batch_finish: AtomicBool::new(false),
            deleted: Mutex::new(Vec::new()),
            edits: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_next_batch_finish(&self) {
        self.fail_batch_finish.store(true, Ordering::SeqCst);
    }

    pub fn register(&self, meta: Arc<BlobFileMeta>) {
        self.files.lock().unwrap().insert(meta.file_number(), meta);
    }

    pub fn registered_files(&self) -> Vec<u64> {
        let mut numbers: Vec<u64> = self.files.lock().unwrap().keys().copied().collect();
        numbers.sort_unstable();
        numbers
    }

    pub fn deleted_files(&self) -> Vec<u64> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn edits(&self) -> Vec<VersionEdit> {
        self.edits.lock().unwrap().clone()
    }
}

impl BlobFileManager for TestBlobStore {
    fn new_file(&self, _priority: IoPriority) -> blob_gc::Result<BlobFileHandle> {
        let number = self.next_file_number.fetch_add(1, Ordering::SeqCst);
        Ok(BlobFileHandle {
            number,
            path: self.blob_file_path(number),
        })
    }

    fn blob_file_path(&self, file_number: u64) -> PathBuf {
        self.dir.join(format!("{file_number:06}.blob"))
    }

    fn batch_finish_files(
        &self,
        _cf_id: u32,
        files: &[(Arc<BlobFileMeta>, BlobFileHandle)],
    ) -> blob_gc::Result<()> {
        if self.fail_batch_finish.swap(false, Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::other("injected install failure")));
        }

        let mut registry = self.files.lock().unwrap();
        for (meta, _) in files {
            registry.insert(meta.file_number(), meta.clone());
        }

        Ok(())
    }

    fn batch_delete_files(&self, handles: &[BlobFileHandle]) -> blob_gc::Result<()> {
        let mut deleted = self.deleted.lock().unwrap();
        for handle in handles {
            let _ = std::fs::remove_file(&handle.path);
            deleted.push(handle.number);
        }
        Ok(())
    }
}

impl BlobFileCatalog for TestBlobStore {
    fn find_file(&self, _cf_id: u32, file_number: u64) -> Option<Arc<BlobFileMeta>> {
        self.files.lock().unwrap().get(&file_number).cloned()
    }

    fn log_and_apply(&self, edit: VersionEdit) -> blob_gc::Result<()> {
        let registry = self.files.lock().unwrap();
        for (file_number, sequence) in &edit.deleted_files {
            if let Some(meta) = registry.get(file_number) {
                meta.mark_obsolete(*sequence);
            }
        }
        drop(registry);

        self.edits.lock().unwrap().push(edit);
        Ok(())
    }
}

/// Builds a blob file through the regular builder and registers it
///
/// Returns the shared metadata and the blob index of every record, in
/// input order, for seeding the LSM.
pub fn build_input_file(
    store: &TestBlobStore,
    records: &[(&[u8], &[u8])],
) -> (Arc<BlobFileMeta>, Vec<BlobIndex>) {
    let handle = store.new_file(IoPriority::High).unwrap();
    let mut builder = BlobFileBuilder::new(&handle, CompressionType::None).unwrap();

    let mut indexes = Vec::new();
    for (key, value) in records {
        let record = BlobRecord {
            key: (*key).into(),
            value: (*value).into(),
        };
        let contexts = builder.add(&record, BlobIndex::default()).unwrap();
        indexes.extend(contexts.into_iter().map(|ctx| ctx.new_blob_index));
    }
    let leftover = builder.finish().unwrap();
    indexes.extend(leftover.into_iter().map(|ctx| ctx.new_blob_index));

    let meta = Arc::new(BlobFileMeta::new(
        handle.number,
        builder.file_size(),
        builder.entry_count(),
        builder.smallest_key().cloned().unwrap(),
        builder.largest_key().cloned().unwrap(),
    ));
    meta.set_live_data_size(builder.live_data_size());
    meta.init_live_bitset(builder.entry_count());

    store.register(meta.clone());

    (meta, indexes)
}

/// Stats sink collecting everything it is handed
#[derive(Default)]
pub struct CollectingStats {
    ticks: Mutex<HashMap<Ticker, u64>>,
    histograms: Mutex<Vec<(Histogram, u64)>>,
}

impl CollectingStats {
    pub fn tick(&self, ticker: Ticker) -> u64 {
        self.ticks.lock().unwrap().get(&ticker).copied().unwrap_or(0)
    }

    pub fn histogram_samples(&self, histogram: Histogram) -> Vec<u64> {
        self.histograms
            .lock()
            .unwrap()
            .iter()
            .filter(|(h, _)| *h == histogram)
            .map(|(_, v)| *v)
            .collect()
    }
}

impl StatsSink for CollectingStats {
    fn record_tick(&self, ticker: Ticker, value: u64) {
        *self.ticks.lock().unwrap().entry(ticker).or_default() += value;
    }

    fn record_histogram(&self, histogram: Histogram, value: u64) {
        self.histograms.lock().unwrap().push((histogram, value));
    }
}
