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

//! In-memory sorter of record pointers.
//!
//! The pointer array is charged to the task memory manager by slot count.
//! Part of every array is reserved as sort scratch space: half of it for the
//! radix sort, a third for the comparison sort. Both sorts are stable and
//! only look at the partition id, so they produce the same order.

use std::mem;

use super::pointer::{RecordPointer, PARTITION_ID_BITS};
use crate::error::{Result, ShuffleError};

/// Bytes charged for one pointer array slot.
pub const POINTER_SLOT_SIZE: usize = 8;

const RADIX_DIGITS: usize = (PARTITION_ID_BITS / 8) as usize;

/// Record pointers of the buffered records, sorted by partition on demand.
#[derive(Debug)]
pub struct ShuffleInMemorySorter {
    pointers: Vec<RecordPointer>,
    scratch: Vec<RecordPointer>,
    /// Slots paid for, including the sort scratch space
    capacity: usize,
    initial_capacity: usize,
    use_radix_sort: bool,
}

impl ShuffleInMemorySorter {
    /// A sorter paid for `initial_capacity` slots.
    pub fn new(initial_capacity: usize, use_radix_sort: bool) -> Self {
        let mut sorter = Self {
            pointers: Vec::new(),
            scratch: Vec::new(),
            capacity: initial_capacity,
            initial_capacity,
            use_radix_sort,
        };
        sorter.pointers.reserve_exact(sorter.usable_capacity());
        sorter
    }

    /// Slots that may hold pointers.
    pub fn usable_capacity(&self) -> usize {
        if self.use_radix_sort {
            self.capacity / 2
        } else {
            self.capacity * 2 / 3
        }
    }

    /// Slots paid for.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Capacity restored by `reset`.
    pub fn initial_capacity(&self) -> usize {
        self.initial_capacity
    }

    /// Pointers inserted since the last reset.
    pub fn num_records(&self) -> usize {
        self.pointers.len()
    }

    /// True when the next insert fits without growing.
    pub fn has_space_for_another_record(&self) -> bool {
        self.pointers.len() < self.usable_capacity()
    }

    /// Bytes charged for the pointer array.
    pub fn memory_usage(&self) -> usize {
        self.capacity * POINTER_SLOT_SIZE
    }

    /// Grows the array to `new_capacity` slots. The caller has already
    /// reserved the memory.
    pub fn expand_pointer_array(&mut self, new_capacity: usize) -> Result<()> {
        if new_capacity < self.capacity {
            return Err(ShuffleError::Internal(format!(
                "Cannot shrink the pointer array from {} to {new_capacity} slots",
                self.capacity
            )));
        }
        self.capacity = new_capacity;
        let usable = self.usable_capacity();
        self.pointers.reserve_exact(usable - self.pointers.len());
        Ok(())
    }

    /// Fails when the array is full; grow it first.
    pub fn insert_record(&mut self, pointer: RecordPointer) -> Result<()> {
        if !self.has_space_for_another_record() {
            return Err(ShuffleError::Internal(
                "There is no space for a new record in the pointer array".to_string(),
            ));
        }
        self.pointers.push(pointer);
        Ok(())
    }

    /// Drops all pointers and goes back to the initial capacity.
    pub fn reset(&mut self) {
        self.pointers.clear();
        self.scratch.clear();
        self.capacity = self.initial_capacity;
        self.pointers.shrink_to(self.usable_capacity());
        self.scratch.shrink_to(0);
    }

    /// Sorts the buffered pointers by partition id and returns a
    /// single-pass iterator over them.
    pub fn get_sorted_iterator(&mut self) -> ShuffleSorterIterator<'_> {
        if self.use_radix_sort {
            radix_sort_by_partition(&mut self.pointers, &mut self.scratch);
        } else {
            self.pointers.sort_by_key(|p| p.partition_id());
        }
        ShuffleSorterIterator {
            pointers: &self.pointers,
            position: 0,
        }
    }
}

/// Iterates sorted pointers once.
#[derive(Debug)]
pub struct ShuffleSorterIterator<'a> {
    pointers: &'a [RecordPointer],
    position: usize,
}

impl ShuffleSorterIterator<'_> {
    /// True while pointers remain.
    pub fn has_next(&self) -> bool {
        self.position < self.pointers.len()
    }
}

impl Iterator for ShuffleSorterIterator<'_> {
    type Item = RecordPointer;

    fn next(&mut self) -> Option<RecordPointer> {
        let pointer = self.pointers.get(self.position).copied()?;
        self.position += 1;
        Some(pointer)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.pointers.len() - self.position;
        (remaining, Some(remaining))
    }
}

/// Stable LSD radix sort on the partition id bytes. Digits that are equal
/// across all pointers are skipped.
fn radix_sort_by_partition(
    pointers: &mut Vec<RecordPointer>,
    scratch: &mut Vec<RecordPointer>,
) {
    let n = pointers.len();
    if n < 2 {
        return;
    }

    let mut counts = [[0usize; 256]; RADIX_DIGITS];
    for pointer in pointers.iter() {
        for (digit, count) in counts.iter_mut().enumerate() {
            count[pointer.partition_digit(digit)] += 1;
        }
    }

    scratch.clear();
    scratch.resize(n, RecordPointer::default());
    for (digit, count) in counts.iter().enumerate() {
        if count.iter().any(|c| *c == n) {
            continue;
        }
        let mut offsets = [0usize; 256];
        let mut next = 0;
        for (offset, c) in offsets.iter_mut().zip(count.iter()) {
            *offset = next;
            next += c;
        }
        for pointer in pointers.iter() {
            let bucket = pointer.partition_digit(digit);
            scratch[offsets[bucket]] = *pointer;
            offsets[bucket] += 1;
        }
        mem::swap(pointers, scratch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn pointers(partitions: &[usize]) -> Vec<RecordPointer> {
        partitions
            .iter()
            .enumerate()
            .map(|(i, p)| RecordPointer::try_new(*p, i % 7, i).unwrap())
            .collect()
    }

    fn sorted(use_radix_sort: bool, input: &[RecordPointer]) -> Vec<RecordPointer> {
        let mut sorter = ShuffleInMemorySorter::new(input.len() * 3 + 4, use_radix_sort);
        for pointer in input {
            sorter.insert_record(*pointer).unwrap();
        }
        sorter.get_sorted_iterator().collect()
    }

    #[test]
    fn sorts_by_partition() {
        let input = pointers(&[3, 1, 2, 1, 0, 3, 70000, 256, 255]);
        for use_radix_sort in [true, false] {
            let output = sorted(use_radix_sort, &input);
            let partitions = output.iter().map(|p| p.partition_id()).collect::<Vec<_>>();
            assert_eq!(partitions, vec![0, 1, 1, 2, 3, 3, 255, 256, 70000]);
        }
    }

    #[test]
    fn radix_and_comparison_sort_agree() {
        let mut rng = rand::rng();
        let partitions = (0..5000)
            .map(|_| rng.random_range(0..100_000))
            .collect::<Vec<usize>>();
        let input = pointers(&partitions);
        assert_eq!(sorted(true, &input), sorted(false, &input));
    }

    #[test]
    fn usable_capacity_leaves_scratch_space() {
        let radix = ShuffleInMemorySorter::new(12, true);
        assert_eq!(radix.usable_capacity(), 6);
        assert_eq!(radix.memory_usage(), 12 * POINTER_SLOT_SIZE);
        let comparison = ShuffleInMemorySorter::new(12, false);
        assert_eq!(comparison.usable_capacity(), 8);
    }

    #[test]
    fn expand_and_reset() -> Result<()> {
        let mut sorter = ShuffleInMemorySorter::new(4, true);
        sorter.insert_record(RecordPointer::try_new(1, 0, 0)?)?;
        sorter.insert_record(RecordPointer::try_new(0, 0, 8)?)?;
        assert!(!sorter.has_space_for_another_record());
        assert!(sorter.insert_record(RecordPointer::try_new(0, 0, 16)?).is_err());

        sorter.expand_pointer_array(8)?;
        assert!(sorter.has_space_for_another_record());
        sorter.insert_record(RecordPointer::try_new(0, 0, 16)?)?;
        assert!(sorter.expand_pointer_array(2).is_err());

        let mut iter = sorter.get_sorted_iterator();
        assert!(iter.has_next());
        assert_eq!(iter.by_ref().count(), 3);
        assert!(!iter.has_next());

        sorter.reset();
        assert_eq!(sorter.num_records(), 0);
        assert_eq!(sorter.capacity(), 4);
        Ok(())
    }

    #[test]
    fn equal_partitions_keep_insertion_order() {
        let input = pointers(&[2, 1, 2, 1, 2]);
        for use_radix_sort in [true, false] {
            let offsets = sorted(use_radix_sort, &input)
                .iter()
                .map(|p| p.offset())
                .collect::<Vec<_>>();
            assert_eq!(offsets, vec![1, 3, 0, 2, 4]);
        }
    }
}
