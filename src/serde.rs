// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::io::{Read, Write};

/// Error during serialization
#[derive(Debug)]
pub enum SerializeError {
    /// I/O error
    Io(std::io::Error),
}

impl std::fmt::Display for SerializeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SerializeError({})",
            match self {
                Self::Io(e) => e.to_string(),
            }
        )
    }
}

/// Error during deserialization
#[derive(Debug)]
pub enum DeserializeError {
    /// I/O error
    Io(std::io::Error),

    /// Checksum check failed
    Crc {
        /// Checksum that was stored alongside the data
        expected: u32,

        /// Checksum of the data that was actually read
        got: u32,
    },

    /// Unknown enum tag
    InvalidTag(u8),

    /// Compressed payload could not be unpacked
    Decompress,
}

impl std::fmt::Display for DeserializeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "DeserializeError({})",
            match self {
                Self::Io(e) => e.to_string(),
                Self::Crc { expected, got } => {
                    format!("crc mismatch, expected={expected}, got={got}")
                }
                Self::InvalidTag(tag) => format!("invalid tag {tag}"),
                Self::Decompress => "decompression failed".to_string(),
            }
        )
    }
}

impl From<std::io::Error> for SerializeError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<std::io::Error> for DeserializeError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// Trait to serialize stuff
pub trait Serializable {
    /// Serialize to bytes
    fn serialize<W: Write>(&self, writer: &mut W) -> Result<(), SerializeError>;
}

/// Trait to deserialize stuff
pub trait Deserializable {
    /// Deserialize from bytes
    fn deserialize<R: Read>(reader: &mut R) -> Result<Self, DeserializeError>
    where
        Self: Sized;
}
