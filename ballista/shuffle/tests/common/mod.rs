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

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use ballista_shuffle::codec::{
    CodecPipeline, LengthPrefixedSerializer, ShuffleRecord, ShuffleSerializer,
};
use ballista_shuffle::config::{CompressionKind, ShuffleWriterConfig};
use ballista_shuffle::error::Result;
use ballista_shuffle::memory::TaskMemoryManager;
use ballista_shuffle::metrics::ShuffleWriteMetrics;
use ballista_shuffle::partitioner::{HashPartitioner, Partitioner};
use ballista_shuffle::reader::read_all_partitions;
use ballista_shuffle::{
    IndexShuffleCommitter, MapStatus, ShuffleDependency, ShuffleWriteContext,
};
use datafusion::execution::memory_pool::{GreedyMemoryPool, MemoryPool, UnboundedMemoryPool};
use datafusion::physical_plan::metrics::ExecutionPlanMetricsSet;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Settings that make small inputs spill and merge.
pub fn small_config(compression: CompressionKind) -> ShuffleWriterConfig {
    ShuffleWriterConfig {
        page_size: 4096,
        initial_sort_buffer_size: 64,
        disk_write_buffer_size: 4096,
        file_buffer_size: 1024,
        compression,
        ..Default::default()
    }
}

/// Random records with keys drawn from a small key space, so that keys
/// repeat.
pub fn random_records(count: usize, seed: u64) -> Vec<ShuffleRecord> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|i| {
            let key = rng.random_range(0..500u32).to_le_bytes();
            let value_len = rng.random_range(0..64usize);
            let value = (0..value_len).map(|j| (i + j) as u8).collect::<Vec<_>>();
            ShuffleRecord::new(key, value)
        })
        .collect()
}

/// Groups records by partition with records sorted, so that partition
/// contents can be compared as multisets.
pub fn expected_partitions(
    records: &[ShuffleRecord],
    partitioner: &dyn Partitioner,
) -> Vec<Vec<ShuffleRecord>> {
    let mut partitions = vec![Vec::new(); partitioner.num_partitions()];
    for record in records {
        partitions[partitioner.partition(&record.key)].push(record.clone());
    }
    for partition in &mut partitions {
        partition.sort();
    }
    partitions
}

pub fn read_sorted_partitions(
    status: &MapStatus,
    codecs: &CodecPipeline,
) -> Result<Vec<Vec<ShuffleRecord>>> {
    let mut partitions = read_all_partitions(
        &status.data_path,
        &status.index_path,
        codecs,
        &LengthPrefixedSerializer,
    )?;
    for partition in &mut partitions {
        partition.sort();
    }
    Ok(partitions)
}

/// Serialized size of every partition, which is what the output holds
/// when neither compression nor encryption is used.
pub fn serialized_lengths(
    records: &[ShuffleRecord],
    partitioner: &dyn Partitioner,
) -> Result<Vec<u64>> {
    let mut lengths = vec![0u64; partitioner.num_partitions()];
    let mut buffer = Vec::new();
    for record in records {
        buffer.clear();
        LengthPrefixedSerializer.serialize(record, &mut buffer)?;
        lengths[partitioner.partition(&record.key)] += buffer.len() as u64;
    }
    Ok(lengths)
}

/// Number of entries left in a directory, zero when it does not exist.
pub fn count_entries(dir: &Path) -> usize {
    fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
}

/// A map task environment in a temporary directory.
pub struct ShuffleEnv {
    pub dir: TempDir,
    pub memory: Arc<TaskMemoryManager>,
    pub committer: Arc<IndexShuffleCommitter>,
    pub metrics: ExecutionPlanMetricsSet,
}

impl ShuffleEnv {
    pub fn new() -> Result<Self> {
        Self::with_pool(Arc::new(UnboundedMemoryPool::default()))
    }

    pub fn with_memory_limit(limit: usize) -> Result<Self> {
        Self::with_pool(Arc::new(GreedyMemoryPool::new(limit)))
    }

    fn with_pool(pool: Arc<dyn MemoryPool>) -> Result<Self> {
        init_logging();
        let dir = TempDir::new()?;
        let committer = Arc::new(IndexShuffleCommitter::new(dir.path().join("output")));
        Ok(Self {
            dir,
            memory: Arc::new(TaskMemoryManager::new(pool)),
            committer,
            metrics: ExecutionPlanMetricsSet::new(),
        })
    }

    pub fn work_dir(&self) -> std::path::PathBuf {
        self.dir.path().join("work")
    }

    pub fn dependency(&self, num_partitions: usize) -> Result<ShuffleDependency> {
        Ok(ShuffleDependency::new(
            0,
            Arc::new(HashPartitioner::try_new(num_partitions)?),
            Arc::new(LengthPrefixedSerializer),
        ))
    }

    pub fn context(
        &self,
        map_id: usize,
        config: ShuffleWriterConfig,
        codecs: CodecPipeline,
    ) -> Result<ShuffleWriteContext> {
        let work_dir = self.work_dir();
        fs::create_dir_all(&work_dir)?;
        Ok(ShuffleWriteContext {
            map_id,
            memory: self.memory.clone(),
            committer: self.committer.clone(),
            codecs,
            config,
            metrics: ShuffleWriteMetrics::new(map_id, &self.metrics),
            work_dir,
        })
    }

    /// Metric values of all map tasks, keyed by metric name.
    pub fn metric_values(&self) -> BTreeMap<String, usize> {
        let mut values = BTreeMap::new();
        for metric in self.metrics.clone_inner().iter() {
            *values.entry(metric.value().name().to_string()).or_insert(0) +=
                metric.value().as_usize();
        }
        values
    }
}
