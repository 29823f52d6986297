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

//! External sorter for the sort-based shuffle.
//!
//! Serialized records are appended to arena pages and a pointer to each is
//! kept by the [`ShuffleInMemorySorter`]. When the record count threshold is
//! reached, or when memory cannot be granted, the buffered records are
//! sorted by partition and written to a spill file. Closing the sorter
//! writes the remaining records as a final run and hands all runs to the
//! merger.

use std::path::Path;
use std::sync::Arc;

use log::{debug, info};

use super::pointer::RecordPointer;
use super::sorter::{ShuffleInMemorySorter, POINTER_SLOT_SIZE};
use super::spill::{write_sorted_run, SpillInfo, SpillManager};
use crate::codec::CodecPipeline;
use crate::config::ShuffleWriterConfig;
use crate::error::{Result, ShuffleError};
use crate::memory::{
    align_size, ConsumerId, PageArena, PageHandle, Spillable, TaskMemoryManager,
    MAX_PAGES, MAX_PAGE_SIZE, RECORD_HEADER_SIZE,
};
use crate::metrics::ShuffleWriteMetrics;

/// Buffers records in memory pages and spills them as runs sorted by
/// partition when memory or the record threshold runs out.
pub struct ShuffleExternalSorter {
    consumer_id: ConsumerId,
    memory: Arc<TaskMemoryManager>,
    num_partitions: usize,
    config: ShuffleWriterConfig,
    codecs: CodecPipeline,
    metrics: ShuffleWriteMetrics,
    arena: PageArena,
    /// Pages holding the records of the current run
    allocated_pages: Vec<PageHandle>,
    current_page: Option<PageHandle>,
    in_memory_sorter: ShuffleInMemorySorter,
    spill_manager: SpillManager,
    spill_count: usize,
    peak_memory_used: usize,
    closed: bool,
}

impl std::fmt::Debug for ShuffleExternalSorter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShuffleExternalSorter")
            .field("consumer_id", &self.consumer_id)
            .field("num_partitions", &self.num_partitions)
            .field("num_records", &self.in_memory_sorter.num_records())
            .field("allocated_pages", &self.allocated_pages.len())
            .field("spill_count", &self.spill_count)
            .field("closed", &self.closed)
            .finish()
    }
}

impl ShuffleExternalSorter {
    /// Creates a sorter whose spill files live under `spill_base_dir`.
    ///
    /// The initial pointer array is reserved right away.
    pub fn try_new(
        memory: Arc<TaskMemoryManager>,
        num_partitions: usize,
        config: ShuffleWriterConfig,
        codecs: CodecPipeline,
        metrics: ShuffleWriteMetrics,
        spill_base_dir: &Path,
    ) -> Result<Self> {
        config.validate()?;
        let consumer_id = memory.register_consumer("ShuffleExternalSorter");
        let in_memory_sorter =
            ShuffleInMemorySorter::new(config.initial_sort_buffer_size, config.use_radix_sort);
        let array_bytes = in_memory_sorter.memory_usage();
        if !memory.try_acquire(consumer_id, array_bytes)? {
            memory.unregister_consumer(consumer_id);
            return Err(ShuffleError::ResourceExhausted(format!(
                "Unable to acquire {array_bytes} bytes for the shuffle pointer array"
            )));
        }
        let spill_manager = match SpillManager::new(spill_base_dir) {
            Ok(manager) => manager,
            Err(e) => {
                memory.unregister_consumer(consumer_id);
                return Err(e);
            }
        };

        let mut sorter = Self {
            consumer_id,
            memory,
            num_partitions,
            arena: PageArena::new((&config).into()),
            config,
            codecs,
            metrics,
            allocated_pages: Vec::new(),
            current_page: None,
            in_memory_sorter,
            spill_manager,
            spill_count: 0,
            peak_memory_used: 0,
            closed: false,
        };
        sorter.update_peak_memory();
        Ok(sorter)
    }

    /// Id of this sorter with the task memory manager.
    pub fn consumer_id(&self) -> ConsumerId {
        self.consumer_id
    }

    /// Records buffered in memory.
    pub fn num_records(&self) -> usize {
        self.in_memory_sorter.num_records()
    }

    /// Number of runs written because of memory pressure or the record
    /// count threshold.
    pub fn spill_count(&self) -> usize {
        self.spill_count
    }

    /// Bytes currently reserved for pages and the pointer array.
    pub fn memory_used(&self) -> usize {
        self.memory.memory_used(self.consumer_id)
    }

    /// Highest memory reservation seen so far.
    pub fn peak_memory_used(&self) -> usize {
        self.peak_memory_used
    }

    /// Pages holding the buffered records.
    pub fn arena(&self) -> &PageArena {
        &self.arena
    }

    /// Buffers one serialized record for `partition_id`.
    pub fn insert_record(&mut self, record: &[u8], partition_id: usize) -> Result<()> {
        if self.closed {
            return Err(ShuffleError::Internal(
                "Cannot insert a record into a closed sorter".to_string(),
            ));
        }
        if partition_id >= self.num_partitions {
            return Err(ShuffleError::Internal(format!(
                "Partition id {partition_id} out of range for {} partitions",
                self.num_partitions
            )));
        }

        let threshold = self.config.spill_num_elements_threshold;
        if self.in_memory_sorter.num_records() >= threshold {
            info!(
                "Spilling data because number of buffered records crossed the threshold {threshold}"
            );
            self.spill_internal()?;
        }

        self.grow_pointer_array_if_necessary()?;
        let required = record.len() + RECORD_HEADER_SIZE;
        let page = self.acquire_new_page_if_necessary(required)?;
        let offset = self.arena.page_mut(&page)?.append_record(record)?;
        let pointer = RecordPointer::try_new(partition_id, page.page_number(), offset)?;
        self.in_memory_sorter.insert_record(pointer)
    }

    fn grow_pointer_array_if_necessary(&mut self) -> Result<()> {
        if self.in_memory_sorter.has_space_for_another_record() {
            return Ok(());
        }
        let used = self.in_memory_sorter.memory_usage();
        let new_capacity = self.in_memory_sorter.capacity() * 2;
        let new_bytes = new_capacity * POINTER_SLOT_SIZE;

        if new_bytes > MAX_PAGE_SIZE {
            // the array would outgrow what a single page can address
            debug!("Pointer array reached {used} bytes, spilling instead of growing");
            self.spill_internal()?;
        } else if self.memory.try_acquire(self.consumer_id, new_bytes)? {
            // old and new array coexist while the pointers are copied
            self.update_peak_memory();
            self.in_memory_sorter.expand_pointer_array(new_capacity)?;
            self.memory.release(self.consumer_id, used);
        } else {
            self.spill_internal()?;
            if !self.in_memory_sorter.has_space_for_another_record() {
                return Err(ShuffleError::ResourceExhausted(format!(
                    "Unable to grow the pointer array to {new_bytes} bytes"
                )));
            }
        }
        Ok(())
    }

    /// Returns a page with room for `required` bytes, allocating a new one
    /// when the current page is full.
    fn acquire_new_page_if_necessary(&mut self, required: usize) -> Result<PageHandle> {
        if let Some(handle) = self.current_page {
            if self.arena.page(&handle)?.remaining() >= required {
                return Ok(handle);
            }
        }
        if required > MAX_PAGE_SIZE {
            return Err(ShuffleError::OversizedRecord {
                required,
                max: MAX_PAGE_SIZE,
            });
        }

        if self.allocated_pages.len() >= MAX_PAGES {
            debug!("Page table is full, spilling to release {MAX_PAGES} pages");
            self.spill_internal()?;
        }

        let dedicated = required > self.config.page_size;
        let size = align_size(required.max(self.config.page_size));
        self.acquire_memory(size)?;
        let allocated = if dedicated {
            self.arena.allocate_dedicated(size)
        } else {
            self.arena.allocate(size)
        };
        let handle = match allocated {
            Ok(handle) => handle,
            Err(e) => {
                self.memory.release(self.consumer_id, size);
                return Err(e);
            }
        };
        self.allocated_pages.push(handle);
        if dedicated {
            debug!("Allocated a dedicated page of {size} bytes for a single record");
        }
        self.current_page = Some(handle);
        Ok(handle)
    }

    /// Reserves `bytes`, spilling this sorter once if the memory manager
    /// cannot free enough elsewhere.
    fn acquire_memory(&mut self, bytes: usize) -> Result<()> {
        if !self.memory.try_acquire(self.consumer_id, bytes)? {
            self.spill_internal()?;
            if !self.memory.try_acquire(self.consumer_id, bytes)? {
                return Err(ShuffleError::ResourceExhausted(format!(
                    "Unable to acquire {bytes} bytes of memory for shuffle records"
                )));
            }
        }
        self.update_peak_memory();
        Ok(())
    }

    fn update_peak_memory(&mut self) {
        let used = self.memory_used();
        if used > self.peak_memory_used {
            self.peak_memory_used = used;
        }
        self.metrics.peak_mem_used.set_max(used);
    }

    /// Spills on request of the caller. Spilling a closed sorter is a misuse.
    pub fn force_spill(&mut self) -> Result<usize> {
        if self.closed {
            return Err(ShuffleError::Internal(
                "Cannot spill a sorter that has been closed".to_string(),
            ));
        }
        self.spill_internal()
    }

    /// Writes the buffered records to a spill file and frees their memory.
    fn spill_internal(&mut self) -> Result<usize> {
        let num_records = self.in_memory_sorter.num_records();
        if num_records == 0 {
            return Ok(0);
        }
        info!(
            "Spilling {num_records} shuffle records ({} bytes) to disk ({} times so far)",
            self.memory_used(),
            self.spill_count
        );

        self.write_sorted_file(false)?;
        let freed = self.free_memory()? + self.reset_pointer_array();
        self.spill_count += 1;
        self.metrics.spill_count.add(1);
        self.metrics.spilled_bytes.add(freed);
        Ok(freed)
    }

    /// Sorts the buffered records and writes them as one run. Only the
    /// final run counts towards the shuffle bytes written.
    fn write_sorted_file(&mut self, is_final: bool) -> Result<()> {
        let path = self.spill_manager.next_spill_path();
        let timer = self.metrics.write_time.timer();
        let run = write_sorted_run(
            &path,
            self.in_memory_sorter.get_sorted_iterator(),
            &self.arena,
            &self.codecs,
            self.num_partitions,
            self.config.disk_write_buffer_size,
        )?;
        timer.done();

        let bytes = run.spill.total_length();
        self.metrics.records_written.add(run.records);
        if is_final {
            self.metrics.bytes_written.add(bytes as usize);
        } else {
            self.metrics.spilled_disk_bytes.add(bytes as usize);
        }
        self.spill_manager.push(run.spill);
        Ok(())
    }

    /// Frees every page of the current run, returning the bytes released.
    fn free_memory(&mut self) -> Result<usize> {
        let mut freed = 0;
        for handle in self.allocated_pages.drain(..) {
            freed += self.arena.free(handle)?;
        }
        self.current_page = None;
        self.memory.release(self.consumer_id, freed);
        Ok(freed)
    }

    fn reset_pointer_array(&mut self) -> usize {
        let before = self.in_memory_sorter.memory_usage();
        self.in_memory_sorter.reset();
        let released = before - self.in_memory_sorter.memory_usage();
        self.memory.release(self.consumer_id, released);
        released
    }

    /// Writes the remaining records and returns every run in creation
    /// order. The caller takes over the spill files.
    pub fn close_and_get_spills(&mut self) -> Result<Vec<SpillInfo>> {
        if self.closed {
            return Err(ShuffleError::Internal(
                "The sorter has already been closed".to_string(),
            ));
        }
        if self.in_memory_sorter.num_records() > 0 {
            self.write_sorted_file(true)?;
        }
        self.free_memory()?;
        self.in_memory_sorter.reset();
        self.arena.release_all();
        self.memory.release_all(self.consumer_id);
        self.closed = true;
        Ok(self.spill_manager.take_spills())
    }

    /// Frees all memory and deletes all spill files. Failures are logged.
    pub fn cleanup_resources(&mut self) {
        self.allocated_pages.clear();
        self.current_page = None;
        self.in_memory_sorter.reset();
        self.arena.release_all();
        self.memory.release_all(self.consumer_id);
        if let Err(e) = self.spill_manager.cleanup() {
            log::warn!("Failed to delete shuffle spill files: {e}");
        }
        self.closed = true;
    }

    /// Directory holding this sorter's spill files.
    pub fn spill_dir(&self) -> &Path {
        self.spill_manager.spill_dir()
    }
}

impl Spillable for ShuffleExternalSorter {
    /// Only spills when the sorter itself asked for memory. Requests
    /// triggered by other consumers are ignored.
    fn spill(&mut self, _size: usize, trigger: ConsumerId) -> Result<usize> {
        if trigger != self.consumer_id
            || self.closed
            || self.in_memory_sorter.num_records() == 0
        {
            return Ok(0);
        }
        self.spill_internal()
    }
}

impl Drop for ShuffleExternalSorter {
    fn drop(&mut self) {
        self.memory.unregister_consumer(self.consumer_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datafusion::execution::memory_pool::{GreedyMemoryPool, UnboundedMemoryPool};
    use datafusion::physical_plan::metrics::ExecutionPlanMetricsSet;
    use std::fs;
    use tempfile::TempDir;

    fn config() -> ShuffleWriterConfig {
        ShuffleWriterConfig {
            page_size: 1024,
            initial_sort_buffer_size: 8,
            compression: crate::config::CompressionKind::None,
            ..Default::default()
        }
    }

    fn sorter(
        memory: Arc<TaskMemoryManager>,
        config: ShuffleWriterConfig,
        dir: &TempDir,
    ) -> Result<ShuffleExternalSorter> {
        let metrics = ShuffleWriteMetrics::new(0, &ExecutionPlanMetricsSet::new());
        ShuffleExternalSorter::try_new(
            memory,
            4,
            config,
            CodecPipeline::default(),
            metrics,
            dir.path(),
        )
    }

    fn unbounded() -> Arc<TaskMemoryManager> {
        Arc::new(TaskMemoryManager::new(Arc::new(UnboundedMemoryPool::default())))
    }

    #[test]
    fn empty_sorter_has_no_spills() -> Result<()> {
        let dir = TempDir::new()?;
        let mut sorter = sorter(unbounded(), config(), &dir)?;
        assert!(sorter.close_and_get_spills()?.is_empty());
        assert_eq!(sorter.memory_used(), 0);
        Ok(())
    }

    #[test]
    fn threshold_forces_spills() -> Result<()> {
        let dir = TempDir::new()?;
        let config = ShuffleWriterConfig {
            spill_num_elements_threshold: 3,
            ..config()
        };
        let mut sorter = sorter(unbounded(), config, &dir)?;
        for i in 0..10usize {
            sorter.insert_record(&[i as u8; 10], i % 4)?;
        }
        assert_eq!(sorter.spill_count(), 3);
        let spills = sorter.close_and_get_spills()?;
        assert_eq!(spills.len(), 4);
        let total: u64 = spills.iter().map(|s| s.total_length()).sum();
        assert_eq!(total, 100);
        for spill in &spills {
            assert_eq!(fs::metadata(&spill.path)?.len(), spill.total_length());
        }
        Ok(())
    }

    #[test]
    fn pointer_array_grows() -> Result<()> {
        let dir = TempDir::new()?;
        let memory = unbounded();
        let mut sorter = sorter(memory, config(), &dir)?;
        for i in 0..100usize {
            sorter.insert_record(b"record", i % 4)?;
        }
        assert_eq!(sorter.spill_count(), 0);
        assert_eq!(sorter.num_records(), 100);
        // 128 slots for the array plus one page
        assert_eq!(sorter.memory_used(), 256 * POINTER_SLOT_SIZE + 1024);
        Ok(())
    }

    #[test]
    fn full_page_table_spills() -> Result<()> {
        let dir = TempDir::new()?;
        let config = ShuffleWriterConfig {
            page_size: 64,
            ..config()
        };
        let mut sorter = sorter(unbounded(), config, &dir)?;
        // one record per page
        let records = MAX_PAGES + 808;
        for i in 0..records {
            sorter.insert_record(&[3u8; 50], i % 4)?;
        }
        assert_eq!(sorter.spill_count(), 1);
        assert_eq!(sorter.num_records(), 808);
        assert_eq!(sorter.arena().live_pages(), 808);
        let spills = sorter.close_and_get_spills()?;
        let total: u64 = spills.iter().map(|s| s.total_length()).sum();
        assert_eq!(total, records as u64 * 50);
        Ok(())
    }

    #[test]
    fn memory_pressure_spills() -> Result<()> {
        let dir = TempDir::new()?;
        let memory = Arc::new(TaskMemoryManager::new(Arc::new(GreedyMemoryPool::new(
            8 * POINTER_SLOT_SIZE + 2 * 1024,
        ))));
        let mut sorter = sorter(memory, config(), &dir)?;
        for i in 0..40usize {
            sorter.insert_record(&[7u8; 100], i % 4)?;
        }
        assert!(sorter.spill_count() > 0);
        assert!(sorter.peak_memory_used() <= 8 * POINTER_SLOT_SIZE + 2 * 1024);
        let spills = sorter.close_and_get_spills()?;
        let total: u64 = spills.iter().map(|s| s.total_length()).sum();
        assert_eq!(total, 4000);
        Ok(())
    }

    #[test]
    fn no_memory_for_a_page_is_fatal() -> Result<()> {
        let dir = TempDir::new()?;
        let memory = Arc::new(TaskMemoryManager::new(Arc::new(GreedyMemoryPool::new(
            8 * POINTER_SLOT_SIZE + 100,
        ))));
        let mut sorter = sorter(memory, config(), &dir)?;
        assert!(matches!(
            sorter.insert_record(b"record", 0),
            Err(ShuffleError::ResourceExhausted(_))
        ));
        Ok(())
    }

    #[test]
    fn oversized_records_get_a_dedicated_page() -> Result<()> {
        let dir = TempDir::new()?;
        let mut sorter = sorter(unbounded(), config(), &dir)?;
        sorter.insert_record(b"small", 1)?;
        sorter.insert_record(&[1u8; 5000], 2)?;
        sorter.insert_record(b"small again", 1)?;
        assert_eq!(sorter.arena().live_pages(), 3);
        let spills = sorter.close_and_get_spills()?;
        assert_eq!(spills[0].partition_lengths, vec![0, 16, 5000, 0]);
        Ok(())
    }

    #[test]
    fn record_larger_than_any_page_is_rejected() -> Result<()> {
        let dir = TempDir::new()?;
        let mut sorter = sorter(unbounded(), config(), &dir)?;
        let huge = vec![0u8; MAX_PAGE_SIZE];
        assert!(matches!(
            sorter.insert_record(&huge, 0),
            Err(ShuffleError::OversizedRecord { .. })
        ));
        Ok(())
    }

    #[test]
    fn spill_requests_from_other_consumers_are_ignored() -> Result<()> {
        let dir = TempDir::new()?;
        let mut sorter = sorter(unbounded(), config(), &dir)?;
        let trigger = sorter.consumer_id();
        assert_eq!(Spillable::spill(&mut sorter, 100, trigger)?, 0);

        sorter.insert_record(b"record", 0)?;
        let used = sorter.memory_used();
        assert_eq!(Spillable::spill(&mut sorter, 100, trigger + 1)?, 0);
        assert_eq!(sorter.num_records(), 1);
        assert_eq!(sorter.memory_used(), used);

        assert_eq!(Spillable::spill(&mut sorter, 100, trigger)?, 1024);
        assert_eq!(sorter.num_records(), 0);
        assert_eq!(sorter.spill_count(), 1);
        Ok(())
    }

    #[test]
    fn spill_after_close_is_a_misuse() -> Result<()> {
        let dir = TempDir::new()?;
        let mut sorter = sorter(unbounded(), config(), &dir)?;
        sorter.insert_record(b"record", 0)?;
        sorter.close_and_get_spills()?;
        assert!(matches!(sorter.force_spill(), Err(ShuffleError::Internal(_))));
        assert!(matches!(
            sorter.insert_record(b"record", 0),
            Err(ShuffleError::Internal(_))
        ));
        let trigger = sorter.consumer_id();
        assert_eq!(Spillable::spill(&mut sorter, 1, trigger)?, 0);
        Ok(())
    }

    #[test]
    fn cleanup_deletes_spill_files() -> Result<()> {
        let dir = TempDir::new()?;
        let config = ShuffleWriterConfig {
            spill_num_elements_threshold: 1,
            ..config()
        };
        let mut sorter = sorter(unbounded(), config, &dir)?;
        sorter.insert_record(b"a", 0)?;
        sorter.insert_record(b"b", 1)?;
        sorter.insert_record(b"c", 2)?;
        assert_eq!(sorter.spill_count(), 2);
        let spill_dir = sorter.spill_dir().to_path_buf();
        assert_eq!(fs::read_dir(&spill_dir)?.count(), 2);

        sorter.cleanup_resources();
        assert!(!spill_dir.exists());
        assert_eq!(sorter.memory_used(), 0);
        Ok(())
    }
}
