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

//! Shuffle writer for small partition counts.
//!
//! Each output partition gets its own encoded file. Records are routed to
//! their partition's file as they arrive, and the files are concatenated
//! in partition order once the input is exhausted. No records are buffered
//! in memory beyond the file buffers, so the task memory manager is not
//! involved.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info};

use crate::codec::{CodecPipeline, EncodeStream, ShuffleRecord, ShuffleSerializer};
use crate::commit::{MapStatus, ShuffleOutputCommitter};
use crate::config::ShuffleWriterConfig;
use crate::error::{Result, ShuffleError};
use crate::metrics::ShuffleWriteMetrics;
use crate::partitioner::Partitioner;
use crate::shuffle_writer_trait::{
    ShuffleDependency, ShuffleWriteContext, ShuffleWriter, WriterState,
};
use crate::sort_shuffle::SpillManager;
use crate::utils::{copy_file_range, remove_file_best_effort, verify_position};

/// The file of one output partition.
struct PartitionFile {
    path: PathBuf,
    /// Opened file, until the first record wraps it in an encoder
    file: Option<File>,
    encoder: Option<EncodeStream<'static>>,
}

impl PartitionFile {
    fn create(path: PathBuf) -> Result<Self> {
        let file = File::create(&path)?;
        Ok(Self {
            path,
            file: Some(file),
            encoder: None,
        })
    }

    fn write(&mut self, bytes: &[u8], codecs: &CodecPipeline, buffer_size: usize) -> Result<()> {
        if self.encoder.is_none() {
            let file = self.file.take().ok_or_else(|| {
                ShuffleError::Internal(format!("Partition file {:?} is closed", self.path))
            })?;
            self.encoder = Some(codecs.encode(BufWriter::with_capacity(buffer_size, file))?);
        }
        if let Some(encoder) = &mut self.encoder {
            encoder.write_all(bytes)?;
        }
        Ok(())
    }

    /// Completes the file and returns its length. Files that never saw a
    /// record stay empty.
    fn close(&mut self) -> Result<u64> {
        if let Some(encoder) = self.encoder.take() {
            encoder.finish()?;
        }
        self.file = None;
        Ok(fs::metadata(&self.path)?.len())
    }
}

/// Shuffle writer keeping one file per output partition.
pub struct BypassShuffleWriter {
    map_id: usize,
    partitioner: Arc<dyn Partitioner>,
    serializer: Arc<dyn ShuffleSerializer>,
    committer: Arc<dyn ShuffleOutputCommitter>,
    codecs: CodecPipeline,
    config: ShuffleWriterConfig,
    metrics: ShuffleWriteMetrics,
    work_dir: PathBuf,
    /// Directory of the partition files, created with them
    file_dir: Option<SpillManager>,
    partition_files: Vec<PartitionFile>,
    state: WriterState,
    partition_lengths: Vec<u64>,
}

impl std::fmt::Debug for BypassShuffleWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BypassShuffleWriter")
            .field("map_id", &self.map_id)
            .field("num_partitions", &self.partitioner.num_partitions())
            .field("open_files", &self.partition_files.len())
            .field("state", &self.state)
            .finish()
    }
}

impl BypassShuffleWriter {
    /// Creates a writer for one map task. No file is opened before the first record.
    pub fn try_new(dependency: &ShuffleDependency, context: ShuffleWriteContext) -> Result<Self> {
        if dependency.num_partitions() == 0 {
            return Err(ShuffleError::Configuration(
                "A shuffle needs at least one output partition".to_string(),
            ));
        }
        Ok(Self {
            map_id: context.map_id,
            partitioner: dependency.partitioner.clone(),
            serializer: dependency.serializer.clone(),
            committer: context.committer,
            codecs: context.codecs,
            config: context.config,
            metrics: context.metrics,
            work_dir: context.work_dir,
            file_dir: None,
            partition_files: Vec::new(),
            state: WriterState::Open,
            partition_lengths: Vec::new(),
        })
    }

    /// Opens a file for every partition.
    fn open_partition_files(&mut self) -> Result<()> {
        let file_dir = SpillManager::new(&self.work_dir)?;
        let num_partitions = self.partitioner.num_partitions();
        let mut files = Vec::with_capacity(num_partitions);
        for _ in 0..num_partitions {
            files.push(PartitionFile::create(file_dir.next_spill_path())?);
        }
        debug!(
            "Opened {num_partitions} partition files for map {} in {:?}",
            self.map_id,
            file_dir.spill_dir()
        );
        self.partition_files = files;
        self.file_dir = Some(file_dir);
        Ok(())
    }

    fn write_records(&mut self, records: &mut dyn Iterator<Item = ShuffleRecord>) -> Result<usize> {
        let num_partitions = self.partitioner.num_partitions();
        let mut buffer = Vec::new();
        let mut count = 0;
        for record in records {
            if self.partition_files.is_empty() {
                self.open_partition_files()?;
            }
            let partition_id = self.partitioner.partition(&record.key);
            let file = self.partition_files.get_mut(partition_id).ok_or_else(|| {
                ShuffleError::Internal(format!(
                    "Partitioner returned partition {partition_id} for {num_partitions} partitions"
                ))
            })?;
            buffer.clear();
            self.serializer.serialize(&record, &mut buffer)?;
            file.write(&buffer, &self.codecs, self.config.file_buffer_size)?;
            count += 1;
        }
        self.metrics.records_written.add(count);
        Ok(count)
    }

    /// Concatenates the partition files into `output`, deleting each one
    /// once it is copied.
    fn write_partitioned_file(&mut self, output: &Path) -> Result<Vec<u64>> {
        let num_partitions = self.partitioner.num_partitions();
        let mut out = File::create(output)?;
        if self.partition_files.is_empty() {
            return Ok(vec![0; num_partitions]);
        }

        let transfer_to = self.config.transfer_to_enabled;
        let mut lengths = Vec::with_capacity(num_partitions);
        for partition in self.partition_files.iter_mut() {
            let len = partition.close()?;
            if len > 0 {
                let mut input = File::open(&partition.path)?;
                copy_file_range(
                    &mut input,
                    &mut out,
                    len,
                    transfer_to,
                    self.config.file_buffer_size,
                )?;
            }
            remove_file_best_effort(&partition.path);
            lengths.push(len);
        }
        self.partition_files.clear();

        if transfer_to {
            verify_position(&mut out, lengths.iter().sum())?;
        }
        out.flush()?;
        Ok(lengths)
    }

    fn write_output(&mut self) -> Result<MapStatus> {
        let output = self.committer.temp_data_path(self.map_id)?;
        let write_time = self.metrics.write_time.clone();
        let timer = write_time.timer();
        let lengths = self.write_partitioned_file(&output);
        timer.done();
        let lengths = match lengths {
            Ok(lengths) => lengths,
            Err(e) => {
                remove_file_best_effort(&output);
                return Err(e);
            }
        };
        self.metrics
            .bytes_written
            .set(lengths.iter().sum::<u64>() as usize);
        self.committer.commit(self.map_id, &lengths, &output)
    }

    /// Drops the partition files without completing them.
    fn abort(&mut self) {
        for partition in self.partition_files.drain(..) {
            drop(partition.encoder);
            drop(partition.file);
            remove_file_best_effort(&partition.path);
        }
        if let Some(mut file_dir) = self.file_dir.take() {
            if let Err(e) = file_dir.cleanup() {
                log::warn!("Failed to delete bypass shuffle files: {e}");
            }
        }
    }
}

impl ShuffleWriter for BypassShuffleWriter {
    fn write(&mut self, records: &mut dyn Iterator<Item = ShuffleRecord>) -> Result<()> {
        self.state.check_writable()?;
        let now = Instant::now();

        let result = self
            .write_records(records)
            .and_then(|count| Ok((count, self.write_output()?)));
        match result {
            Ok((count, status)) => {
                info!(
                    "Bypass shuffle write for map {} completed in {} ms: {count} records, \
                    {} bytes in {} partitions",
                    self.map_id,
                    now.elapsed().as_millis(),
                    status.total_bytes(),
                    status.partition_lengths.len()
                );
                self.file_dir = None;
                self.partition_lengths = status.partition_lengths.clone();
                self.state = WriterState::Committed(status);
                Ok(())
            }
            Err(e) => {
                self.abort();
                self.state = WriterState::Failed;
                Err(e)
            }
        }
    }

    fn stop(&mut self, success: bool) -> Result<Option<MapStatus>> {
        let mut state = std::mem::take(&mut self.state);
        let result = state.stop(success, || self.abort());
        self.state = state;
        result
    }

    fn partition_lengths(&self) -> &[u64] {
        &self.partition_lengths
    }
}
