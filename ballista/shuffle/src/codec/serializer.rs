// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Record framing.

use std::fmt::Debug;
use std::io::Read;

use crate::error::{Result, ShuffleError};

/// A key/value pair flowing through the shuffle.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShuffleRecord {
    /// Bytes the partitioner routes on.
    pub key: Vec<u8>,
    /// Opaque payload.
    pub value: Vec<u8>,
}

impl ShuffleRecord {
    /// A record from anything convertible to bytes.
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl From<(Vec<u8>, Vec<u8>)> for ShuffleRecord {
    fn from((key, value): (Vec<u8>, Vec<u8>)) -> Self {
        Self { key, value }
    }
}

/// Turns records into self-delimiting byte sequences and back.
pub trait ShuffleSerializer: Debug + Send + Sync {
    /// True when serialized records can be reordered and concatenated
    /// without changing how they deserialize. The sort-based writer only
    /// works with such serializers.
    fn supports_relocation(&self) -> bool;

    /// Appends the serialized form of `record` to `out`.
    fn serialize(&self, record: &ShuffleRecord, out: &mut Vec<u8>) -> Result<()>;

    /// Reads the next record, or `None` at a clean end of input.
    fn deserialize_next(&self, input: &mut dyn Read) -> Result<Option<ShuffleRecord>>;

    /// Reads every record of `bytes`.
    fn deserialize_all(&self, mut bytes: &[u8]) -> Result<Vec<ShuffleRecord>> {
        let mut records = Vec::new();
        while let Some(record) = self.deserialize_next(&mut bytes)? {
            records.push(record);
        }
        Ok(records)
    }
}

/// `[u32 key length][key][u32 value length][value]`, little endian.
#[derive(Debug, Clone, Copy, Default)]
pub struct LengthPrefixedSerializer;

impl LengthPrefixedSerializer {
    fn write_field(field: &[u8], out: &mut Vec<u8>) -> Result<()> {
        let len = u32::try_from(field.len()).map_err(|_| {
            ShuffleError::General(format!(
                "Field of {} bytes is too large to serialize",
                field.len()
            ))
        })?;
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(field);
        Ok(())
    }

    /// Reads a length header. `None` when the input ended before it.
    fn read_len(input: &mut dyn Read) -> Result<Option<usize>> {
        let mut header = [0u8; 4];
        let mut filled = 0;
        while filled < header.len() {
            let n = input.read(&mut header[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        match filled {
            0 => Ok(None),
            4 => Ok(Some(u32::from_le_bytes(header) as usize)),
            _ => Err(ShuffleError::General(
                "Truncated record length header".to_string(),
            )),
        }
    }

    fn read_field(input: &mut dyn Read) -> Result<Vec<u8>> {
        let len = Self::read_len(input)?.ok_or_else(|| {
            ShuffleError::General("Record ended before its value".to_string())
        })?;
        let mut field = vec![0u8; len];
        input.read_exact(&mut field)?;
        Ok(field)
    }
}

impl ShuffleSerializer for LengthPrefixedSerializer {
    fn supports_relocation(&self) -> bool {
        true
    }

    fn serialize(&self, record: &ShuffleRecord, out: &mut Vec<u8>) -> Result<()> {
        Self::write_field(&record.key, out)?;
        Self::write_field(&record.value, out)
    }

    fn deserialize_next(&self, input: &mut dyn Read) -> Result<Option<ShuffleRecord>> {
        let Some(key_len) = Self::read_len(input)? else {
            return Ok(None);
        };
        let mut key = vec![0u8; key_len];
        input.read_exact(&mut key)?;
        let value = Self::read_field(input)?;
        Ok(Some(ShuffleRecord { key, value }))
    }
}
