// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters emitted by the GC job
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[allow(missing_docs)]
pub enum Ticker {
    GcBytesReadCheck,
    GcBytesReadBlob,
    GcBytesReadCallback,
    GcBytesWrittenLsm,
    GcBytesWrittenBlob,
    GcNumKeysOverwrittenCheck,
    GcNumKeysOverwrittenCallback,
    GcBytesOverwrittenCheck,
    GcBytesOverwrittenCallback,
    GcNumKeysRelocated,
    GcBytesRelocated,
    GcNumKeysFallback,
    GcBytesFallback,
    GcNumNewFiles,
    GcNumFiles,
}

/// Histograms emitted by the GC job
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[allow(missing_docs)]
pub enum Histogram {
    GcInputFileSize,
    GcOutputFileSize,
    GcReadLsmMicros,
    GcUpdateLsmMicros,
}

/// Statistics sink of the host engine
///
/// The sink is a capability handed to the job, not global state; a job
/// without a sink simply does not report.
pub trait StatsSink: Send + Sync {
    /// Adds `value` to a counter
    fn record_tick(&self, ticker: Ticker, value: u64);

    /// Records a single histogram sample
    fn record_histogram(&self, histogram: Histogram, value: u64);
}

/// Per-job counters, flushed to the sink once when the job is dropped
#[derive(Clone, Debug, Default)]
pub(crate) struct GcMetrics {
    pub gc_bytes_read_check: u64,
    pub gc_bytes_read_blob: u64,
    pub gc_bytes_read_callback: u64,
    pub gc_bytes_written_lsm: u64,
    pub gc_bytes_written_blob: u64,
    pub gc_num_keys_overwritten_check: u64,
    pub gc_num_keys_overwritten_callback: u64,
    pub gc_bytes_overwritten_check: u64,
    pub gc_bytes_overwritten_callback: u64,
    pub gc_num_keys_relocated: u64,
    pub gc_bytes_relocated: u64,
    pub gc_num_keys_fallback: u64,
    pub gc_bytes_fallback: u64,
    pub gc_num_new_files: u64,
    pub gc_num_files: u64,

    /// Time spent probing liveness (in µs)
    pub gc_read_lsm_micros: u64,

    /// Time spent rewriting indexes (in µs)
    pub gc_update_lsm_micros: u64,
}

impl GcMetrics {
    pub(crate) fn flush_to(&self, sink: &dyn StatsSink) {
        sink.record_tick(Ticker::GcBytesReadCheck, self.gc_bytes_read_check);
        sink.record_tick(Ticker::GcBytesReadBlob, self.gc_bytes_read_blob);
        sink.record_tick(Ticker::GcBytesReadCallback, self.gc_bytes_read_callback);
        sink.record_tick(Ticker::GcBytesWrittenLsm, self.gc_bytes_written_lsm);
        sink.record_tick(Ticker::GcBytesWrittenBlob, self.gc_bytes_written_blob);
        sink.record_tick(
            Ticker::GcNumKeysOverwrittenCheck,
            self.gc_num_keys_overwritten_check,
        );
        sink.record_tick(
            Ticker::GcNumKeysOverwrittenCallback,
            self.gc_num_keys_overwritten_callback,
        );
        sink.record_tick(
            Ticker::GcBytesOverwrittenCheck,
            self.gc_bytes_overwritten_check,
        );
        sink.record_tick(
            Ticker::GcBytesOverwrittenCallback,
            self.gc_bytes_overwritten_callback,
        );
        sink.record_tick(Ticker::GcNumKeysRelocated, self.gc_num_keys_relocated);
        sink.record_tick(Ticker::GcBytesRelocated, self.gc_bytes_relocated);
        sink.record_tick(Ticker::GcNumKeysFallback, self.gc_num_keys_fallback);
        sink.record_tick(Ticker::GcBytesFallback, self.gc_bytes_fallback);
        sink.record_tick(Ticker::GcNumNewFiles, self.gc_num_new_files);
        sink.record_tick(Ticker::GcNumFiles, self.gc_num_files);

        // The op timing histograms are NOT flushed here; they are only
        // reported for jobs that finish successfully
    }
}

/// Job-level physical I/O accounting
///
/// The Prepare phase snapshots these counters so the job can report its
/// own I/O delta independently of the logical byte counters.
#[derive(Debug, Default)]
pub(crate) struct IoCounters {
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

impl IoCounters {
    pub fn add_read(&self, n: u64) {
        self.bytes_read.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_written(&self, n: u64) {
        self.bytes_written.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.bytes_read.load(Ordering::Relaxed),
            self.bytes_written.load(Ordering::Relaxed),
        )
    }
}
