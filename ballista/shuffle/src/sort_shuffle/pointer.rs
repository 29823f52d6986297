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

//! Record pointers kept by the in-memory sorter.

use crate::error::{Result, ShuffleError};
use crate::memory::{MAX_PAGES, MAX_PAGE_SIZE};

/// Number of bits available for a partition id.
pub const PARTITION_ID_BITS: u32 = 24;
/// Largest number of output partitions the sort-based writer supports.
pub const MAX_SHUFFLE_OUTPUT_PARTITIONS: usize = 1 << PARTITION_ID_BITS;

/// Location of a buffered record plus its destination partition.
///
/// Ordering compares the partition id first, so sorting pointers groups
/// records by partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordPointer {
    partition_id: u32,
    page_number: u16,
    offset: u32,
}

impl RecordPointer {
    /// Fails when a component exceeds its bit width.
    pub fn try_new(partition_id: usize, page_number: usize, offset: usize) -> Result<Self> {
        if partition_id >= MAX_SHUFFLE_OUTPUT_PARTITIONS {
            return Err(ShuffleError::Internal(format!(
                "Partition id {partition_id} must be less than {MAX_SHUFFLE_OUTPUT_PARTITIONS}"
            )));
        }
        if page_number >= MAX_PAGES {
            return Err(ShuffleError::Internal(format!(
                "Page number {page_number} must be less than {MAX_PAGES}"
            )));
        }
        if offset >= MAX_PAGE_SIZE {
            return Err(ShuffleError::Internal(format!(
                "Offset {offset} must be less than {MAX_PAGE_SIZE}"
            )));
        }
        Ok(Self {
            partition_id: partition_id as u32,
            page_number: page_number as u16,
            offset: offset as u32,
        })
    }

    /// Destination partition.
    pub fn partition_id(&self) -> usize {
        self.partition_id as usize
    }

    /// Page table slot holding the record.
    pub fn page_number(&self) -> usize {
        self.page_number as usize
    }

    /// Offset of the record header in its page.
    pub fn offset(&self) -> usize {
        self.offset as usize
    }

    /// Byte `index` (0 = least significant) of the partition id.
    pub(crate) fn partition_digit(&self, index: usize) -> usize {
        ((self.partition_id >> (8 * index)) & 0xff) as usize
    }
}
