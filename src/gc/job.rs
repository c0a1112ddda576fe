// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::blob::builder::{BlobFileBuilder, OutContext};
use crate::blob::index::BlobIndex;
use crate::blob::meta::{BlobFileMeta, FileEvent};
use crate::blob::reader::BlobFileIterator;
use crate::blob::record::BlobRecord;
use crate::catalog::{BlobFileCatalog, BlobFileHandle, BlobFileManager, VersionEdit};
use crate::config::{BlobRunMode, GcOptions};
use crate::error::Error;
use crate::gc::callback::GcWriteCallback;
use crate::gc::merge::{BlobFileMergeIterator, BlobTuple};
use crate::gc::output::OutputBuilder;
use crate::gc::shadow::{ShadowSet, ShadowTableBuilder, SHADOW_LEVELS};
use crate::gc::BlobGc;
use crate::lsm::{LsmEngine, LsmEntry, WriteBatch};
use crate::stats::{GcMetrics, Histogram, IoCounters, StatsSink};
use crate::value::{UserKey, ValueType};
use std::collections::{BTreeSet, HashMap};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Instant;

/// A single-shot blob GC job
///
/// Scans the picked input blob files, rewrites the records that are still
/// live into fresh blob files (or back into the LSM in fallback mode),
/// repoints the LSM at the new locations and retires the inputs.
///
/// The phases must run in order: [`Self::prepare`], [`Self::run`],
/// [`Self::finish`]. The blob catalog and the LSM manifest are separate,
/// so `finish` installs output blob files *before* any LSM index is
/// rewritten; a crash in between leaves redundant copies, never a blob
/// index that resolves to nothing. Input files are retired last.
pub struct BlobGcJob<'a> {
    blob_gc: BlobGc,
    db: &'a dyn LsmEngine,
    blob_file_manager: &'a dyn BlobFileManager,
    blob_file_set: &'a dyn BlobFileCatalog,
    shadow_set: Option<&'a ShadowSet>,

    /// Engine-wide shutdown flag; the scan reads it once per record and
    /// the index rewrite once per batch
    shutting_down: Arc<AtomicBool>,

    stats: Option<Arc<dyn StatsSink>>,

    metrics: GcMetrics,
    io: IoCounters,
    prev_io: (u64, u64),

    rewrite_batches: Vec<(WriteBatch, GcWriteCallback)>,
    blob_file_builders: Vec<(BlobFileHandle, BlobFileBuilder)>,
    shadow_builders: [Option<ShadowTableBuilder>; SHADOW_LEVELS],
}

impl<'a> BlobGcJob<'a> {
    /// Sets up a job over its collaborators
    ///
    /// # Panics
    ///
    /// Panics if shadow output is requested without a shadow set.
    #[must_use]
    pub fn new(
        blob_gc: BlobGc,
        db: &'a dyn LsmEngine,
        blob_file_manager: &'a dyn BlobFileManager,
        blob_file_set: &'a dyn BlobFileCatalog,
        shadow_set: Option<&'a ShadowSet>,
        shutting_down: Arc<AtomicBool>,
        stats: Option<Arc<dyn StatsSink>>,
    ) -> Self {
        assert!(
            !blob_gc.options().rewrite_shadow || shadow_set.is_some(),
            "shadow output requires a shadow set"
        );

        Self {
            blob_gc,
            db,
            blob_file_manager,
            blob_file_set,
            shadow_set,
            shutting_down,
            stats,
            metrics: GcMetrics::default(),
            io: IoCounters::default(),
            prev_io: (0, 0),
            rewrite_batches: Vec::new(),
            blob_file_builders: Vec::new(),
            shadow_builders: Default::default(),
        }
    }

    /// The job's input bundle, including accumulated outputs
    #[must_use]
    pub fn blob_gc(&self) -> &BlobGc {
        &self.blob_gc
    }

    /// Records the baseline I/O counters
    pub fn prepare(&mut self) -> crate::Result<()> {
        self.prev_io = self.io.snapshot();
        Ok(())
    }

    /// Scans the inputs and produces outputs
    pub fn run(&mut self) -> crate::Result<()> {
        let inputs = self.blob_gc.inputs();

        let mut total_size = 0;
        let mut total_live_size = 0;
        let mut candidates = String::new();

        for file in inputs {
            if !candidates.is_empty() {
                candidates.push(' ');
            }
            candidates.push_str(&file.file_number().to_string());
            total_size += file.file_size();
            total_live_size += file.live_data_size();
        }

        log::info!(
            "[{}] GC job start with {} files, {} bytes, {} live bytes, {} garbage bytes",
            self.blob_gc.cf_name(),
            inputs.len(),
            total_size,
            total_live_size,
            total_size - total_live_size
        );
        log::debug!("[{}] GC candidates [{candidates}]", self.blob_gc.cf_name());

        let result = self.do_run_gc();
        if let Err(e) = &result {
            log::error!("[{}] GC job scan failed: {e:?}", self.blob_gc.cf_name());
        }
        result
    }

    fn build_iterator(&self) -> crate::Result<BlobFileMergeIterator> {
        let mut list: Vec<Box<dyn Iterator<Item = crate::Result<BlobTuple>>>> = Vec::new();

        for file in self.blob_gc.inputs() {
            let path = self.blob_file_manager.blob_file_path(file.file_number());
            let iter = BlobFileIterator::open(path, file.file_number())?;
            list.push(Box::new(iter));
        }

        Ok(BlobFileMergeIterator::new(
            list,
            self.blob_gc.options().comparator.clone(),
        ))
    }

    fn do_run_gc(&mut self) -> crate::Result<()> {
        let mut gc_iter = self.build_iterator()?;

        let opts = self.blob_gc.options().clone();

        let mut output = OutputBuilder::new(
            self.blob_file_manager,
            opts.blob_file_target_size,
            opts.blob_file_compression,
        );

        match self.scan_inputs(&mut gc_iter, &mut output, &opts) {
            Ok(()) => {
                self.blob_file_builders = output.into_builders();

                if opts.rewrite_shadow {
                    // Finalise builders that never reached the target size
                    for slot in 0..SHADOW_LEVELS {
                        if let Some(builder) = self.shadow_builders[slot].take() {
                            let meta = builder.finish()?;
                            self.blob_gc.add_output_shadow(meta);
                        }
                    }
                }

                Ok(())
            }
            Err(e) => {
                self.discard_partial_outputs(output);
                Err(e)
            }
        }
    }

    /// The scan loop: one forward pass over the merged inputs
    #[allow(clippy::too_many_lines)]
    fn scan_inputs(
        &mut self,
        gc_iter: &mut BlobFileMergeIterator,
        output: &mut OutputBuilder<'_>,
        opts: &GcOptions,
    ) -> crate::Result<()> {
        let cf_id = self.blob_gc.cf_id();

        let mut last_key: Option<UserKey> = None;
        let mut last_key_is_fresh = false;

        let mut total_count = 0u64;
        let mut discardable_count = 0u64;
        let mut valid_count = 0u64;

        while let Some(item) = gc_iter.next() {
            let (key, blob_index, value) = item?;
            total_count += 1;

            if self.is_shutting_down() {
                return Err(Error::ShutdownInProgress);
            }

            // Count read bytes for blob records of the GC candidate files
            self.metrics.gc_bytes_read_blob += blob_index.blob_handle.size;
            self.io.add_read(blob_index.blob_handle.size);

            match &last_key {
                Some(last) if **last == *key => {
                    if last_key_is_fresh {
                        // We only need to rewrite the newest version. Blob
                        // files containing the older versions will not be
                        // purged if there's a snapshot referencing them.
                        continue;
                    }
                }
                _ => {
                    last_key = Some(key.clone());
                    last_key_is_fresh = false;
                }
            }

            // The bitset is local and cheap; only records it cannot rule
            // out pay for the authoritative LSM probe
            let mut discardable = self.discard_entry_with_bitset(&blob_index)?;
            let mut level = -1;
            if !discardable {
                (discardable, level) = self.discard_entry(&key, &blob_index)?;
            }

            if discardable {
                self.metrics.gc_num_keys_overwritten_check += 1;
                self.metrics.gc_bytes_overwritten_check += blob_index.blob_handle.size;
                discardable_count += 1;
                continue;
            }

            valid_count += 1;
            last_key_is_fresh = true;

            if opts.blob_run_mode == BlobRunMode::Fallback {
                // Fold the value back into the LSM; the empty new index
                // still drives the overwrite check in the callback
                let callback =
                    GcWriteCallback::new(cf_id, key.clone(), blob_index, BlobIndex::default());
                self.rewrite_batches.push((
                    WriteBatch {
                        key,
                        value,
                        value_type: ValueType::Value,
                    },
                    callback,
                ));
                continue;
            }

            // Rewrite the record into a new blob file
            let record = BlobRecord { key, value };
            self.metrics.gc_bytes_written_blob += record.size() as u64;

            let contexts = output.add(&record, blob_index)?;
            self.route_contexts(contexts, level, opts)?;
        }

        log::info!(
            "[{}] GC total key count: {total_count}, valid key count: {valid_count}, discardable key count: {discardable_count}",
            self.blob_gc.cf_name(),
        );

        Ok(())
    }

    /// Discards the half-built outputs of a failed scan; nothing was
    /// installed, so the blob file manager just reclaims the files
    fn discard_partial_outputs(&mut self, output: OutputBuilder<'_>) {
        let handles: Vec<BlobFileHandle> = output
            .into_builders()
            .into_iter()
            .map(|(handle, _)| handle)
            .collect();

        if !handles.is_empty() {
            log::warn!(
                "[{}] GC scan failed, deleting {} partial output files",
                self.blob_gc.cf_name(),
                handles.len()
            );

            if let Err(e) = self.blob_file_manager.batch_delete_files(&handles) {
                log::warn!("Delete partial GC output files failed: {e:?}");
            }
        }

        for slot in 0..SHADOW_LEVELS {
            if let Some(builder) = self.shadow_builders[slot].take() {
                let _ = std::fs::remove_file(builder.path());
            }
        }
    }

    /// Routes freshly completed out contexts to the configured index path
    fn route_contexts(
        &mut self,
        contexts: Vec<OutContext>,
        level: i32,
        opts: &GcOptions,
    ) -> crate::Result<()> {
        if contexts.is_empty() {
            return Ok(());
        }

        if opts.rewrite_shadow {
            // Levels reported by the LSM are bounded by its level count
            debug_assert!((0..SHADOW_LEVELS as i32).contains(&level));
            let slot = level.clamp(0, SHADOW_LEVELS as i32 - 1) as usize;

            if self.shadow_builders[slot].is_none() {
                let shadow_set = self.shadow_set.expect("shadow set is required in shadow mode");
                self.shadow_builders[slot] = Some(ShadowTableBuilder::new(
                    shadow_set,
                    slot,
                    opts.db_id.clone(),
                    opts.db_session_id.clone(),
                )?);
            }

            let builder = self.shadow_builders[slot]
                .as_mut()
                .expect("builder was just opened");

            for ctx in &contexts {
                builder.add(ctx)?;
            }

            if builder.estimated_size() >= opts.shadow_target_size {
                let builder = self.shadow_builders[slot]
                    .take()
                    .expect("builder was just used");
                let meta = builder.finish()?;
                self.blob_gc.add_output_shadow(meta);
            }
        } else {
            self.batch_write_new_indices(contexts);
        }

        Ok(())
    }

    /// Turns out contexts into write batches guarded by callbacks
    fn batch_write_new_indices(&mut self, contexts: Vec<OutContext>) {
        let cf_id = self.blob_gc.cf_id();

        for ctx in contexts {
            let index_entry: Arc<[u8]> = ctx.new_blob_index.encoded().into();
            let callback = GcWriteCallback::new(
                cf_id,
                ctx.internal_key.user_key.clone(),
                ctx.original_blob_index,
                ctx.new_blob_index,
            );

            self.rewrite_batches.push((
                WriteBatch {
                    key: ctx.internal_key.user_key,
                    value: index_entry,
                    value_type: ValueType::BlobIndex,
                },
                callback,
            ));
        }
    }

    /// Liveness fast path: the input file's own bitset
    ///
    /// A clear bit is definitive; a set bit may be stale and needs the
    /// authoritative check.
    fn discard_entry_with_bitset(&mut self, blob_index: &BlobIndex) -> crate::Result<bool> {
        let start = Instant::now();

        let file = self
            .blob_gc
            .find_input(blob_index.file_number)
            .cloned()
            .ok_or(Error::NotFound("blob file meta not found"))?;

        let discardable = !file.is_live(blob_index.blob_handle.order);

        self.metrics.gc_read_lsm_micros += start.elapsed().as_micros() as u64;
        Ok(discardable)
    }

    /// Liveness slow path: authoritative LSM point get
    ///
    /// Returns whether the entry is discardable and the level holding the
    /// key's current version.
    fn discard_entry(
        &mut self,
        key: &UserKey,
        blob_index: &BlobIndex,
    ) -> crate::Result<(bool, i32)> {
        let start = Instant::now();
        let result = self.discard_entry_inner(key, blob_index);
        self.metrics.gc_read_lsm_micros += start.elapsed().as_micros() as u64;
        result
    }

    fn discard_entry_inner(
        &mut self,
        key: &UserKey,
        blob_index: &BlobIndex,
    ) -> crate::Result<(bool, i32)> {
        let got = self.db.get_for_gc(self.blob_gc.cf_id(), key)?;
        let level = got.level;

        if level == 0 {
            log::debug!("GC saw a level-0 key");
        }

        let entry_len = match &got.entry {
            Some(LsmEntry::Value(v) | LsmEntry::BlobIndex(v)) => v.len(),
            None => 0,
        };

        // Count read bytes for checking the LSM entry
        self.metrics.gc_bytes_read_check += (key.len() + entry_len) as u64;

        match got.entry {
            // Either the key is deleted or updated with a newer version
            // which is inlined in the LSM
            None | Some(LsmEntry::Value(_)) => Ok((true, level)),

            Some(LsmEntry::BlobIndex(index_entry)) => {
                let other_blob_index = BlobIndex::decode(&index_entry).map_err(|e| {
                    log::error!("Corrupt blob index entry for key {key:?}");
                    Error::from(e)
                })?;
                Ok((other_blob_index != *blob_index, level))
            }
        }
    }

    /// Installs outputs and retires inputs
    ///
    /// Output blob files go into the blob catalog first; only then are
    /// LSM indexes rewritten (or shadows installed), and only after that
    /// are the input files retired. Crash consistency hinges on this
    /// order because the blob manifest and the LSM manifest are separate.
    pub fn finish(&mut self) -> crate::Result<()> {
        let mut result = self.install_output_blob_files();

        if result.is_ok() {
            if self.blob_gc.options().rewrite_shadow {
                result = self.install_output_shadows();
                if let Err(e) = &result {
                    log::error!(
                        "[{}] GC job failed to install output shadows: {e:?}",
                        self.blob_gc.cf_name()
                    );
                }
            } else {
                result = self.rewrite_valid_keys_to_lsm();
                if let Err(e) = &result {
                    log::error!(
                        "[{}] GC job failed to rewrite keys to LSM: {e:?}",
                        self.blob_gc.cf_name()
                    );
                }
            }
        } else if let Err(e) = &result {
            log::error!(
                "[{}] GC job failed to install output blob files: {e:?}",
                self.blob_gc.cf_name()
            );
        }

        if result.is_ok() && !self.db.is_column_family_dropped(self.blob_gc.cf_id()) {
            result = self.delete_input_blob_files();
        }

        if result.is_ok() {
            self.update_internal_op_stats();
        }

        result
    }

    /// Finishes every output builder and registers the files in the blob
    /// catalog; on any failure all outputs are deleted and the LSM is
    /// left untouched
    fn install_output_blob_files(&mut self) -> crate::Result<()> {
        let builders = std::mem::take(&mut self.blob_file_builders);
        if builders.is_empty() {
            return Ok(());
        }

        let cf_id = self.blob_gc.cf_id();

        let mut finished: Vec<(Arc<BlobFileMeta>, BlobFileHandle)> = Vec::new();
        let mut leftover_handles: Vec<BlobFileHandle> = Vec::new();
        let mut failure: Option<Error> = None;
        let mut output_names = String::new();

        for (handle, mut builder) in builders {
            if failure.is_some() {
                leftover_handles.push(handle);
                continue;
            }

            match builder.finish() {
                Ok(contexts) => {
                    // Contexts held back until the flush surface here
                    self.batch_write_new_indices(contexts);

                    self.metrics.gc_num_new_files += 1;
                    self.io.add_written(builder.file_size());

                    let meta = Arc::new(BlobFileMeta::new(
                        handle.number,
                        builder.file_size(),
                        builder.entry_count(),
                        builder
                            .smallest_key()
                            .cloned()
                            .expect("output file should contain at least one record"),
                        builder
                            .largest_key()
                            .cloned()
                            .expect("output file should contain at least one record"),
                    ));
                    meta.set_live_data_size(builder.live_data_size());
                    meta.init_live_bitset(builder.entry_count());
                    meta.transit(FileEvent::GcOutput);

                    self.record_histogram(Histogram::GcOutputFileSize, builder.file_size());

                    if !output_names.is_empty() {
                        output_names.push(' ');
                    }
                    output_names.push_str(&handle.number.to_string());

                    finished.push((meta, handle));
                }
                Err(e) => {
                    failure = Some(e);
                    leftover_handles.push(handle);
                }
            }
        }

        if failure.is_none() {
            log::debug!("[{}] GC output [{output_names}]", self.blob_gc.cf_name());

            if let Err(e) = self.blob_file_manager.batch_finish_files(cf_id, &finished) {
                failure = Some(e);
            } else {
                for (meta, _) in finished {
                    self.blob_gc.add_output_file(meta);
                }
                return Ok(());
            }
        }

        // Do not let cleanup problems mask the original error, otherwise
        // the caller would rewrite blob indexes to the LSM by mistake
        let mut handles: Vec<BlobFileHandle> =
            finished.into_iter().map(|(_, handle)| handle).collect();
        handles.append(&mut leftover_handles);

        let numbers = handles
            .iter()
            .map(|h| h.number.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        log::warn!(
            "[{}] Installing GC outputs failed. Delete GC output files: [{numbers}]",
            self.blob_gc.cf_name()
        );

        if let Err(e) = self.blob_file_manager.batch_delete_files(&handles) {
            log::warn!("Delete GC output files [{numbers}] failed: {e:?}");
        }

        Err(failure.expect("failure should be set"))
    }

    /// Appends the finished shadow tables to the shadow set
    fn install_output_shadows(&mut self) -> crate::Result<()> {
        let shadow_set = self.shadow_set.expect("shadow set is required in shadow mode");
        let metas = self.blob_gc.output_shadows().to_vec();

        log::debug!(
            "[{}] Installing {} GC shadow tables",
            self.blob_gc.cf_name(),
            metas.len()
        );

        shadow_set.install(metas);
        Ok(())
    }

    /// Replays the accumulated write batches through the LSM write path
    ///
    /// Busy outcomes are recovered locally: the rewrite is dropped and
    /// the new blob bytes are accounted dead on the output file, so the
    /// file can itself be picked by a later job.
    fn rewrite_valid_keys_to_lsm(&mut self) -> crate::Result<()> {
        let start = Instant::now();
        let cf_id = self.blob_gc.cf_id();

        let batches = std::mem::take(&mut self.rewrite_batches);
        log::debug!(
            "[{}] Rewriting {} blob indexes to the LSM",
            self.blob_gc.cf_name(),
            batches.len()
        );

        let mut result: crate::Result<()> = Ok(());

        // Output file number -> (dropped bytes, dropped orders)
        let mut dropped: HashMap<u64, (u64, BTreeSet<u64>)> = HashMap::new();

        for (batch, mut callback) in batches {
            if self.db.is_column_family_dropped(cf_id) {
                result = Err(Error::ColumnFamilyDropped);
                break;
            }
            if self.is_shutting_down() {
                result = Err(Error::ShutdownInProgress);
                break;
            }

            let write_result = self.db.write_with_callback(cf_id, &batch, &mut callback);
            let new_blob_index = *callback.new_blob_index();

            match write_result {
                Ok(()) => {
                    if new_blob_index.is_empty() {
                        // Rewritten as inline value due to fallback mode
                        self.metrics.gc_num_keys_fallback += 1;
                        self.metrics.gc_bytes_fallback += callback.blob_record_size();
                    } else {
                        // Rewritten as blob record; count written bytes
                        // for the new blob index
                        self.metrics.gc_bytes_written_lsm += batch.data_size();
                        self.metrics.gc_num_keys_relocated += 1;
                        self.metrics.gc_bytes_relocated += callback.blob_record_size();
                    }
                }
                Err(Error::Busy(_)) => {
                    self.metrics.gc_num_keys_overwritten_callback += 1;
                    self.metrics.gc_bytes_overwritten_callback += callback.blob_record_size();

                    // The key was overwritten in the meanwhile; the new
                    // blob bytes are dead on the output file and must be
                    // subtracted from its live data size
                    if !new_blob_index.is_empty() {
                        let entry = dropped.entry(new_blob_index.file_number).or_default();
                        entry.0 += new_blob_index.blob_handle.size;
                        entry.1.insert(new_blob_index.blob_handle.order);
                    }
                }
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }

            // Count read bytes of the callback's re-check
            self.metrics.gc_bytes_read_callback += callback.read_bytes();
        }

        for (file_number, (bytes, orders)) in dropped {
            if let Some(file) = self.blob_file_set.find_file(cf_id, file_number) {
                for order in orders {
                    file.set_live(order, false);
                }
                file.update_live_data_size(-i64::try_from(bytes).unwrap_or(i64::MAX));
                self.blob_file_set.compute_gc_score(cf_id);
            } else {
                log::error!("Blob file {file_number} not found during GC");
            }
        }

        if result.is_ok() {
            // Make the rewrites durable before the inputs go away
            result = self.db.flush_wal(true);
        }

        self.metrics.gc_update_lsm_micros += start.elapsed().as_micros() as u64;
        result
    }

    /// Retires every input file at the current latest sequence number
    fn delete_input_blob_files(&mut self) -> crate::Result<()> {
        let obsolete_sequence = self.db.latest_sequence_number();

        let mut edit = VersionEdit::new(self.blob_gc.cf_id());
        let inputs = self.blob_gc.inputs().to_vec();

        for file in inputs {
            log::info!(
                "[{}] GC adds obsolete blob file [{}], retiring at sequence {obsolete_sequence}",
                self.blob_gc.cf_name(),
                file.file_number()
            );

            self.metrics.gc_num_files += 1;
            self.record_histogram(Histogram::GcInputFileSize, file.file_size());

            if file.is_obsolete() {
                // A concurrent range deletion or GC already retired it
                continue;
            }

            edit.delete_blob_file(file.file_number(), obsolete_sequence);
        }

        self.blob_file_set.log_and_apply(edit)
    }

    /// Reports the per-op numbers of a successfully finished job
    ///
    /// The op timing histograms are emitted here and nowhere else, so a
    /// failed or abandoned job never contributes samples.
    fn update_internal_op_stats(&mut self) {
        let (prev_read, prev_written) = self.prev_io;
        let (read, written) = self.io.snapshot();

        log::debug!(
            "[{}] GC job I/O: {} bytes read, {} bytes written",
            self.blob_gc.cf_name(),
            read - prev_read,
            written - prev_written
        );

        self.record_histogram(Histogram::GcReadLsmMicros, self.metrics.gc_read_lsm_micros);
        self.record_histogram(
            Histogram::GcUpdateLsmMicros,
            self.metrics.gc_update_lsm_micros,
        );
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    fn record_histogram(&self, histogram: Histogram, value: u64) {
        if let Some(stats) = &self.stats {
            stats.record_histogram(histogram, value);
        }
    }
}

impl Drop for BlobGcJob<'_> {
    fn drop(&mut self) {
        // Counters are flushed exactly once, whether the job succeeded,
        // failed or was abandoned mid-way
        if let Some(stats) = &self.stats {
            self.metrics.flush_to(&**stats);
        }
    }
}
