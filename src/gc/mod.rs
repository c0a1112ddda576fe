// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

pub mod callback;
pub mod job;
pub mod merge;
pub mod output;
pub mod shadow;

use crate::blob::meta::BlobFileMeta;
use crate::config::{BlobRunMode, GcOptions};
use crate::gc::shadow::ShadowTableMeta;
use std::sync::Arc;

/// One unit of GC work
///
/// Carries the input blob files selected by the picker, the column family
/// they belong to and the options in effect. The input set is immutable;
/// outputs accumulate while the job runs.
pub struct BlobGc {
    inputs: Vec<Arc<BlobFileMeta>>,
    cf_id: u32,
    cf_name: String,
    options: GcOptions,

    output_files: Vec<Arc<BlobFileMeta>>,
    output_shadows: Vec<ShadowTableMeta>,
}

impl BlobGc {
    /// Bundles picked input files into a job input
    ///
    /// # Panics
    ///
    /// Panics if the input set is empty, or if shadow output is combined
    /// with fallback mode; the two rewrite paths are mutually exclusive.
    #[must_use]
    pub fn new(
        inputs: Vec<Arc<BlobFileMeta>>,
        cf_id: u32,
        cf_name: String,
        options: GcOptions,
    ) -> Self {
        assert!(!inputs.is_empty(), "GC job needs at least one input file");
        assert!(
            !(options.rewrite_shadow && options.blob_run_mode == BlobRunMode::Fallback),
            "shadow output cannot be combined with fallback mode"
        );

        Self {
            inputs,
            cf_id,
            cf_name,
            options,
            output_files: Vec::new(),
            output_shadows: Vec::new(),
        }
    }

    /// Input blob files
    #[must_use]
    pub fn inputs(&self) -> &[Arc<BlobFileMeta>] {
        &self.inputs
    }

    /// Finds an input file by number
    #[must_use]
    pub fn find_input(&self, file_number: u64) -> Option<&Arc<BlobFileMeta>> {
        self.inputs.iter().find(|f| f.file_number() == file_number)
    }

    /// Column family ID
    #[must_use]
    pub fn cf_id(&self) -> u32 {
        self.cf_id
    }

    /// Column family name, used for logging
    #[must_use]
    pub fn cf_name(&self) -> &str {
        &self.cf_name
    }

    /// Options in effect for this job
    #[must_use]
    pub fn options(&self) -> &GcOptions {
        &self.options
    }

    /// Output blob files installed so far
    #[must_use]
    pub fn output_files(&self) -> &[Arc<BlobFileMeta>] {
        &self.output_files
    }

    /// Shadow tables produced so far
    #[must_use]
    pub fn output_shadows(&self) -> &[ShadowTableMeta] {
        &self.output_shadows
    }

    pub(crate) fn add_output_file(&mut self, meta: Arc<BlobFileMeta>) {
        self.output_files.push(meta);
    }

    pub(crate) fn add_output_shadow(&mut self, meta: ShadowTableMeta) {
        self.output_shadows.push(meta);
    }
}
