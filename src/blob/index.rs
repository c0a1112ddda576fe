// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::serde::{Deserializable, DeserializeError, Serializable, SerializeError};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Position of one record inside a blob file
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct BlobHandle {
    /// Byte offset of the record frame
    pub offset: u64,

    /// On-disk size of the record frame in bytes
    pub size: u64,

    /// Per-file record index
    ///
    /// Assigned monotonically while the file is written; addresses the
    /// liveness bitset of the file.
    pub order: u64,
}

/// Compact reference stored in the LSM in place of a large value
///
/// Equality is pointwise over all fields: any change in file number or
/// handle means the LSM no longer points at the same physical record.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct BlobIndex {
    /// Number of the blob file holding the record
    pub file_number: u64,

    /// Position of the record inside the file
    pub blob_handle: BlobHandle,
}

impl BlobIndex {
    /// Whether this index references no blob record
    ///
    /// An empty index on a GC rewrite means the value was written back
    /// inline (fallback mode).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blob_handle.size == 0
    }

    /// Serializes into a fresh buffer
    #[must_use]
    pub fn encoded(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(32);
        self.serialize(&mut bytes)
            .expect("should serialize into vec");
        bytes
    }

    /// Deserializes from a buffer
    pub fn decode(mut bytes: &[u8]) -> Result<Self, DeserializeError> {
        Self::deserialize(&mut bytes)
    }
}

impl Serializable for BlobIndex {
    fn serialize<W: Write>(&self, writer: &mut W) -> Result<(), SerializeError> {
        writer.write_u64::<BigEndian>(self.file_number)?;
        writer.write_u64::<BigEndian>(self.blob_handle.offset)?;
        writer.write_u64::<BigEndian>(self.blob_handle.size)?;
        writer.write_u64::<BigEndian>(self.blob_handle.order)?;
        Ok(())
    }
}

impl Deserializable for BlobIndex {
    fn deserialize<R: Read>(reader: &mut R) -> Result<Self, DeserializeError> {
        let file_number = reader.read_u64::<BigEndian>()?;
        let offset = reader.read_u64::<BigEndian>()?;
        let size = reader.read_u64::<BigEndian>()?;
        let order = reader.read_u64::<BigEndian>()?;

        Ok(Self {
            file_number,
            blob_handle: BlobHandle {
                offset,
                size,
                order,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn fixture_index() -> BlobIndex {
        BlobIndex {
            file_number: 7,
            blob_handle: BlobHandle {
                offset: 128,
                size: 64,
                order: 3,
            },
        }
    }

    #[test]
    fn test_roundtrip() -> crate::Result<()> {
        let index = fixture_index();
        let decoded = BlobIndex::decode(&index.encoded())?;
        assert_eq!(index, decoded);
        Ok(())
    }

    #[test]
    fn test_pointwise_equality() {
        let index = fixture_index();

        let mut other = index;
        other.file_number = 8;
        assert_ne!(index, other);

        let mut other = index;
        other.blob_handle.offset = 0;
        assert_ne!(index, other);

        let mut other = index;
        other.blob_handle.order = 4;
        assert_ne!(index, other);

        assert_eq!(index, fixture_index());
    }

    #[test]
    fn test_empty_index() {
        assert!(BlobIndex::default().is_empty());
        assert!(!fixture_index().is_empty());
    }
}
