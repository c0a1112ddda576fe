// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::serde::{DeserializeError, SerializeError};

/// Errors that may occur in the GC core
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// Serialization failed
    Serialize(SerializeError),

    /// Deserialization failed
    ///
    /// Covers corrupt blob records and corrupt blob index entries.
    Deserialize(DeserializeError),

    /// Cooperative shutdown was signalled, the job aborted
    ShutdownInProgress,

    /// A concurrent writer got to the key first
    ///
    /// Returned by the write callback; recovered per batch by dropping
    /// the rewrite, never surfaced as the job status.
    Busy(&'static str),

    /// Requested entity was not found
    NotFound(&'static str),

    /// The column family was dropped while the job was running
    ///
    /// Aborts the index rewrite; outputs stay installed, inputs are kept.
    ColumnFamilyDropped,

    /// Job was aborted
    Aborted(&'static str),
}

impl Error {
    /// Whether this error is the per-batch race outcome of the write callback
    #[must_use]
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy(_))
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GcError: {self:?}")
    }
}

impl From<std::io::Error> for Error {
    fn from(inner: std::io::Error) -> Self {
        Self::Io(inner)
    }
}

impl From<SerializeError> for Error {
    fn from(value: SerializeError) -> Self {
        Self::Serialize(value)
    }
}

impl From<DeserializeError> for Error {
    fn from(value: DeserializeError) -> Self {
        Self::Deserialize(value)
    }
}

impl std::error::Error for Error {}

/// Result helper type
pub type Result<T> = std::result::Result<T, Error>;
