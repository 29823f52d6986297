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

//! Sort-based shuffle writer.
//!
//! Records are serialized into the external sorter, which spills sorted
//! runs when memory runs short. Closing the sorter writes the last run and
//! the runs are merged into a single data file that is handed to the
//! committer together with its partition lengths.

use std::sync::Arc;
use std::time::Instant;

use log::info;
use parking_lot::Mutex;

use super::external_sorter::ShuffleExternalSorter;
use super::merge::SpillMerger;
use super::pointer::MAX_SHUFFLE_OUTPUT_PARTITIONS;
use crate::codec::{CodecPipeline, ShuffleRecord, ShuffleSerializer};
use crate::commit::{MapStatus, ShuffleOutputCommitter};
use crate::config::ShuffleWriterConfig;
use crate::error::{Result, ShuffleError};
use crate::metrics::ShuffleWriteMetrics;
use crate::partitioner::Partitioner;
use crate::shuffle_writer_trait::{
    ShuffleDependency, ShuffleWriteContext, ShuffleWriter, WriterState,
};

/// Shuffle writer that sorts serialized records by partition.
#[derive(Debug)]
pub struct SortShuffleWriter {
    map_id: usize,
    partitioner: Arc<dyn Partitioner>,
    serializer: Arc<dyn ShuffleSerializer>,
    committer: Arc<dyn ShuffleOutputCommitter>,
    codecs: CodecPipeline,
    config: ShuffleWriterConfig,
    metrics: ShuffleWriteMetrics,
    /// Shared with the task memory manager, which may ask it to spill
    sorter: Arc<Mutex<ShuffleExternalSorter>>,
    state: WriterState,
    partition_lengths: Vec<u64>,
}

impl SortShuffleWriter {
    /// Creates a writer over a fresh external sorter. Fails when the shuffle
    /// has too many partitions or the serializer cannot relocate records.
    pub fn try_new(dependency: &ShuffleDependency, context: ShuffleWriteContext) -> Result<Self> {
        let num_partitions = dependency.num_partitions();
        if num_partitions == 0 || num_partitions > MAX_SHUFFLE_OUTPUT_PARTITIONS {
            return Err(ShuffleError::Configuration(format!(
                "The sort-based shuffle supports 1 to {MAX_SHUFFLE_OUTPUT_PARTITIONS} \
                partitions, got {num_partitions}"
            )));
        }
        if !dependency.serializer.supports_relocation() {
            return Err(ShuffleError::Configuration(
                "The sort-based shuffle needs a serializer that supports relocation"
                    .to_string(),
            ));
        }

        let ShuffleWriteContext {
            map_id,
            memory,
            committer,
            codecs,
            config,
            metrics,
            work_dir,
        } = context;
        let sorter = ShuffleExternalSorter::try_new(
            memory.clone(),
            num_partitions,
            config.clone(),
            codecs.clone(),
            metrics.clone(),
            &work_dir,
        )?;
        let consumer_id = sorter.consumer_id();
        let sorter = Arc::new(Mutex::new(sorter));
        memory.attach_spillable(consumer_id, &sorter)?;

        Ok(Self {
            map_id,
            partitioner: dependency.partitioner.clone(),
            serializer: dependency.serializer.clone(),
            committer,
            codecs,
            config,
            metrics,
            sorter,
            state: WriterState::Open,
            partition_lengths: Vec::new(),
        })
    }

    /// Spills the buffered records now. Fails once the sorter is closed.
    pub fn force_spill(&self) -> Result<usize> {
        self.sorter.lock().force_spill()
    }

    /// Runs spilled so far.
    pub fn spill_count(&self) -> usize {
        self.sorter.lock().spill_count()
    }

    /// Highest memory reservation of the sorter.
    pub fn peak_memory_used(&self) -> usize {
        self.sorter.lock().peak_memory_used()
    }

    fn insert_records(
        &mut self,
        records: &mut dyn Iterator<Item = ShuffleRecord>,
    ) -> Result<usize> {
        let num_partitions = self.partitioner.num_partitions();
        let mut buffer = Vec::new();
        let mut count = 0;
        for record in records {
            buffer.clear();
            self.serializer.serialize(&record, &mut buffer)?;
            let partition_id = self.partitioner.partition(&record.key);
            if partition_id >= num_partitions {
                return Err(ShuffleError::Internal(format!(
                    "Partitioner returned partition {partition_id} for {num_partitions} partitions"
                )));
            }
            self.sorter.lock().insert_record(&buffer, partition_id)?;
            count += 1;
        }
        Ok(count)
    }

    fn close_and_write_output(&mut self) -> Result<MapStatus> {
        let spills = self.sorter.lock().close_and_get_spills()?;
        let num_spills = spills.len();
        let output = self.committer.temp_data_path(self.map_id)?;

        let merger = SpillMerger::new(
            &self.codecs,
            self.partitioner.num_partitions(),
            &self.config,
        );
        let strategy = merger.strategy(num_spills);
        let timer = self.metrics.write_time.timer();
        let partition_lengths = merger.merge(spills, &output)?;
        timer.done();

        // the merged file replaces the estimate made while writing the last run
        let total: u64 = partition_lengths.iter().sum();
        self.metrics.bytes_written.set(total as usize);
        info!(
            "Merged {num_spills} sorted runs of map {} into {total} bytes using {strategy}",
            self.map_id
        );

        self.committer
            .commit(self.map_id, &partition_lengths, &output)
    }

    fn cleanup(&self) {
        self.sorter.lock().cleanup_resources();
    }
}

impl ShuffleWriter for SortShuffleWriter {
    fn write(&mut self, records: &mut dyn Iterator<Item = ShuffleRecord>) -> Result<()> {
        self.state.check_writable()?;
        let now = Instant::now();

        let result = self
            .insert_records(records)
            .and_then(|count| Ok((count, self.close_and_write_output()?)));
        match result {
            Ok((count, status)) => {
                info!(
                    "Sort shuffle write for map {} completed in {} ms: {count} records, \
                    {} bytes, {} spills, peak memory {} bytes",
                    self.map_id,
                    now.elapsed().as_millis(),
                    status.total_bytes(),
                    self.spill_count(),
                    self.peak_memory_used()
                );
                self.partition_lengths = status.partition_lengths.clone();
                self.state = WriterState::Committed(status);
                Ok(())
            }
            Err(e) => {
                self.cleanup();
                self.state = WriterState::Failed;
                Err(e)
            }
        }
    }

    fn stop(&mut self, success: bool) -> Result<Option<MapStatus>> {
        let sorter = &self.sorter;
        self.state
            .stop(success, || sorter.lock().cleanup_resources())
    }

    fn partition_lengths(&self) -> &[u64] {
        &self.partition_lengths
    }
}
