// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::serde::{Deserializable, DeserializeError, Serializable, SerializeError};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::{
    cmp::Reverse,
    io::{Read, Write},
    sync::Arc,
};

/// User defined key
pub type UserKey = Arc<[u8]>;

/// User defined data (blob of bytes)
pub type UserData = Arc<[u8]>;

/// Sequence number
pub type SeqNo = u64;

/// Kind of an LSM entry
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ValueType {
    /// Plain value, stored inline in the LSM
    Value = 0,

    /// Deletion marker
    Tombstone = 1,

    /// Encoded [`BlobIndex`](crate::BlobIndex) pointing into a blob file
    BlobIndex = 2,
}

impl TryFrom<u8> for ValueType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Value),
            1 => Ok(Self::Tombstone),
            2 => Ok(Self::BlobIndex),
            tag => Err(tag),
        }
    }
}

/// Internal representation of a key inside the LSM
///
/// Carries the sequence number and entry kind next to the user key.
#[derive(Clone, Eq, PartialEq)]
pub struct InternalKey {
    /// User defined key
    pub user_key: UserKey,

    /// Sequence number
    pub seqno: SeqNo,

    /// Kind of the entry this key belongs to
    pub value_type: ValueType,
}

impl std::fmt::Debug for InternalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?}:{}:{}",
            self.user_key, self.seqno, self.value_type as u8
        )
    }
}

impl InternalKey {
    /// Creates a new [`InternalKey`].
    ///
    /// # Panics
    ///
    /// Panics if the user key is empty or longer than 2^16 bytes.
    pub fn new<K: Into<UserKey>>(user_key: K, seqno: SeqNo, value_type: ValueType) -> Self {
        let user_key = user_key.into();

        assert!(!user_key.is_empty());
        assert!(user_key.len() <= u16::MAX.into());

        Self {
            user_key,
            seqno,
            value_type,
        }
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

// User key first, newest version (highest seqno) before older ones,
// so a sorted run of rewritten index entries reads front to back
impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (&self.user_key, Reverse(self.seqno)).cmp(&(&other.user_key, Reverse(other.seqno)))
    }
}

impl Serializable for InternalKey {
    fn serialize<W: Write>(&self, writer: &mut W) -> Result<(), SerializeError> {
        // NOTE: Truncation is okay and actually needed
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u16::<BigEndian>(self.user_key.len() as u16)?;
        writer.write_all(&self.user_key)?;

        writer.write_u64::<BigEndian>(self.seqno)?;
        writer.write_u8(self.value_type as u8)?;

        Ok(())
    }
}

impl Deserializable for InternalKey {
    fn deserialize<R: Read>(reader: &mut R) -> Result<Self, DeserializeError> {
        let key_len = reader.read_u16::<BigEndian>()?;
        let mut user_key = vec![0; key_len.into()];
        reader.read_exact(&mut user_key)?;

        let seqno = reader.read_u64::<BigEndian>()?;
        let value_type = ValueType::try_from(reader.read_u8()?).map_err(DeserializeError::InvalidTag)?;

        Ok(Self::new(user_key, seqno, value_type))
    }
}
