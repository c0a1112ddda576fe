// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::config::CompressionType;
use crate::serde::{DeserializeError, SerializeError};
use crate::value::{UserData, UserKey};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use lz4_flex::{compress_prepend_size, decompress_size_prepended};
use std::io::{Read, Write};

const TAG_UNCOMPRESSED: u8 = 0;
const TAG_LZ4: u8 = 1;

/// A key-value pair stored in a blob file
///
/// # Disk representation
///
/// \[compression; 1 byte] \[key length; 2 bytes] \[value length; 4 bytes] \[key; N bytes] \[value; N bytes] \[crc; 4 bytes]
///
/// The CRC covers everything before it; the value is stored compressed
/// when the compression tag says so.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlobRecord {
    /// User defined key
    pub key: UserKey,

    /// User defined value
    pub value: UserData,
}

impl BlobRecord {
    /// Uncompressed size of the record payload
    #[must_use]
    pub fn size(&self) -> usize {
        self.key.len() + self.value.len()
    }

    /// Writes the record frame, returning the number of bytes written
    ///
    /// # Panics
    ///
    /// Panics if the key length is empty or greater than 2^16, or the value
    /// length is greater than 2^32
    pub fn encode_into<W: Write>(
        &self,
        writer: &mut W,
        compression: CompressionType,
    ) -> Result<u64, SerializeError> {
        assert!(!self.key.is_empty());
        assert!(self.key.len() <= u16::MAX.into());
        assert!(u32::try_from(self.value.len()).is_ok());

        let (tag, stored_value) = match compression {
            CompressionType::None => (TAG_UNCOMPRESSED, self.value.to_vec()),
            CompressionType::Lz4 => (TAG_LZ4, compress_prepend_size(&self.value)),
        };

        let mut frame = Vec::with_capacity(self.size() + 16);
        frame.write_u8(tag)?;

        // NOTE: Truncation is okay and actually needed
        #[allow(clippy::cast_possible_truncation)]
        frame.write_u16::<BigEndian>(self.key.len() as u16)?;

        // NOTE: Truncation is okay and actually needed
        #[allow(clippy::cast_possible_truncation)]
        frame.write_u32::<BigEndian>(stored_value.len() as u32)?;

        frame.write_all(&self.key)?;
        frame.write_all(&stored_value)?;

        let crc = crc32fast::hash(&frame);
        frame.write_u32::<BigEndian>(crc)?;

        writer.write_all(&frame)?;

        Ok(frame.len() as u64)
    }

    /// Reads the next record frame
    ///
    /// Returns the record and the number of bytes consumed, or `None` on a
    /// clean end of file.
    pub fn decode_from<R: Read>(
        reader: &mut R,
    ) -> Result<Option<(Self, u64)>, DeserializeError> {
        let tag = match reader.read_u8() {
            Ok(tag) => tag,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let key_len = reader.read_u16::<BigEndian>()?;
        let value_len = reader.read_u32::<BigEndian>()?;

        let mut key = vec![0; key_len.into()];
        reader.read_exact(&mut key)?;

        let mut stored_value = vec![0; value_len as usize];
        reader.read_exact(&mut stored_value)?;

        let expected_crc = reader.read_u32::<BigEndian>()?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&[tag]);
        hasher.update(&key_len.to_be_bytes());
        hasher.update(&value_len.to_be_bytes());
        hasher.update(&key);
        hasher.update(&stored_value);
        let crc = hasher.finalize();

        if crc != expected_crc {
            return Err(DeserializeError::Crc {
                expected: expected_crc,
                got: crc,
            });
        }

        let value = match tag {
            TAG_UNCOMPRESSED => stored_value,
            TAG_LZ4 => {
                decompress_size_prepended(&stored_value).map_err(|_| DeserializeError::Decompress)?
            }
            tag => return Err(DeserializeError::InvalidTag(tag)),
        };

        let consumed = 1 + 2 + 4 + u64::from(key_len) + u64::from(value_len) + 4;

        Ok(Some((
            Self {
                key: key.into(),
                value: value.into(),
            },
            consumed,
        )))
    }
}
