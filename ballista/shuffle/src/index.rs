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

//! Index file of a committed map output.
//!
//! The index stores the cumulative byte offsets of the partitions in the
//! data file:
//!
//! ```text
//! [i64: offset_0][i64: offset_1]...[i64: offset_n-1][i64: total_length]
//! ```
//!
//! - All values are little-endian i64
//! - `offset_0` is always 0
//! - Partition `i` spans `[offset_i, offset_{i+1})`

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::error::{Result, ShuffleError};

const ENTRY_SIZE: usize = 8;

/// Maps partition ids to byte ranges of a shuffle data file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShuffleIndex {
    /// Cumulative offsets. Length is partition_count + 1, the last entry
    /// is the data file length.
    offsets: Vec<i64>,
}

impl ShuffleIndex {
    /// Builds the index of a data file whose partitions have the given
    /// lengths.
    pub fn from_partition_lengths(lengths: &[u64]) -> Result<Self> {
        let mut offsets = Vec::with_capacity(lengths.len() + 1);
        let mut offset = 0i64;
        offsets.push(offset);
        for &len in lengths {
            let len = i64::try_from(len).map_err(|_| {
                ShuffleError::Internal(format!("Partition length {len} overflows the index"))
            })?;
            offset = offset.checked_add(len).ok_or_else(|| {
                ShuffleError::Internal("Shuffle output overflows the index".to_string())
            })?;
            offsets.push(offset);
        }
        Ok(Self { offsets })
    }

    /// Returns the number of partitions in this index.
    pub fn partition_count(&self) -> usize {
        self.offsets.len().saturating_sub(1)
    }

    /// Returns the byte range `(start, end)` of a partition, or `None` when
    /// the partition id is out of range.
    pub fn get_partition_range(&self, partition_id: usize) -> Option<(u64, u64)> {
        if partition_id >= self.partition_count() {
            return None;
        }
        Some((
            self.offsets[partition_id] as u64,
            self.offsets[partition_id + 1] as u64,
        ))
    }

    /// Length of a partition, 0 when out of range.
    pub fn get_partition_size(&self, partition_id: usize) -> u64 {
        self.get_partition_range(partition_id)
            .map(|(start, end)| end - start)
            .unwrap_or(0)
    }

    /// Returns true if the partition has data (size > 0).
    pub fn partition_has_data(&self, partition_id: usize) -> bool {
        self.get_partition_size(partition_id) > 0
    }

    /// Length of the data file described by this index.
    pub fn total_length(&self) -> u64 {
        self.offsets.last().copied().unwrap_or(0) as u64
    }

    /// Recovers the per-partition lengths.
    pub fn partition_lengths(&self) -> Vec<u64> {
        self.offsets
            .windows(2)
            .map(|w| (w[1] - w[0]) as u64)
            .collect()
    }

    /// Writes the index to a file.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let file = File::create(path).map_err(ShuffleError::IoError)?;
        let mut writer = BufWriter::new(file);

        for &offset in &self.offsets {
            writer
                .write_all(&offset.to_le_bytes())
                .map_err(ShuffleError::IoError)?;
        }

        writer.flush().map_err(ShuffleError::IoError)?;
        Ok(())
    }

    /// Reads an index from a file, checking that offsets never decrease.
    pub fn read_from_file(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(ShuffleError::IoError)?;
        let file_size = file.metadata().map_err(ShuffleError::IoError)?.len() as usize;

        if !file_size.is_multiple_of(ENTRY_SIZE) {
            return Err(ShuffleError::General(format!(
                "Invalid index file size: {file_size} (must be multiple of {ENTRY_SIZE})"
            )));
        }

        let entry_count = file_size / ENTRY_SIZE;
        if entry_count < 2 {
            return Err(ShuffleError::General(format!(
                "Index file too small: {entry_count} entries (need at least 2)"
            )));
        }

        let mut reader = BufReader::new(file);
        let mut offsets = Vec::with_capacity(entry_count);
        let mut buf = [0u8; ENTRY_SIZE];
        for _ in 0..entry_count {
            reader
                .read_exact(&mut buf)
                .map_err(ShuffleError::IoError)?;
            offsets.push(i64::from_le_bytes(buf));
        }

        if offsets[0] != 0 || offsets.windows(2).any(|w| w[1] < w[0]) {
            return Err(ShuffleError::General(format!(
                "Index file {path:?} holds inconsistent offsets"
            )));
        }
        Ok(Self { offsets })
    }
}
