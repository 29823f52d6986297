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

//! Criterion benchmarks for the shuffle writers.

use std::path::Path;
use std::sync::Arc;

use ballista_shuffle::codec::{CodecPipeline, LengthPrefixedSerializer, ShuffleRecord};
use ballista_shuffle::config::ShuffleWriterConfig;
use ballista_shuffle::memory::TaskMemoryManager;
use ballista_shuffle::metrics::ShuffleWriteMetrics;
use ballista_shuffle::partitioner::HashPartitioner;
use ballista_shuffle::{
    BypassShuffleWriter, IndexShuffleCommitter, ShuffleDependency, ShuffleWriteContext,
    ShuffleWriter, SortShuffleWriter,
};
use criterion::{criterion_group, criterion_main, Criterion};
use datafusion::execution::memory_pool::GreedyMemoryPool;
use datafusion::physical_plan::metrics::ExecutionPlanMetricsSet;
use rand::Rng;
use tempfile::TempDir;

const NUM_RECORDS: usize = 200_000;
const NUM_OUTPUT_PARTITIONS: usize = 400;

fn build_records(count: usize) -> Vec<ShuffleRecord> {
    let mut rng = rand::rng();
    (0..count)
        .map(|_| {
            let key: u64 = rng.random();
            let value: Vec<u8> = (0..rng.random_range(16..128)).map(|_| rng.random()).collect();
            ShuffleRecord::new(key.to_le_bytes(), value)
        })
        .collect()
}

fn context(
    map_id: usize,
    work_dir: &Path,
    config: ShuffleWriterConfig,
    memory_limit: usize,
) -> ShuffleWriteContext {
    ShuffleWriteContext {
        map_id,
        memory: Arc::new(TaskMemoryManager::new(Arc::new(GreedyMemoryPool::new(
            memory_limit,
        )))),
        committer: Arc::new(IndexShuffleCommitter::new(work_dir.join("output"))),
        codecs: CodecPipeline::from_config(&config),
        config,
        metrics: ShuffleWriteMetrics::new(map_id, &ExecutionPlanMetricsSet::new()),
        work_dir: work_dir.to_path_buf(),
    }
}

fn run_sort_shuffle(
    records: &[ShuffleRecord],
    map_id: usize,
    work_dir: &Path,
    config: ShuffleWriterConfig,
    memory_limit: usize,
) {
    let dependency = ShuffleDependency::new(
        0,
        Arc::new(HashPartitioner::try_new(NUM_OUTPUT_PARTITIONS).unwrap()),
        Arc::new(LengthPrefixedSerializer),
    );
    let context = context(map_id, work_dir, config, memory_limit);
    let mut writer = SortShuffleWriter::try_new(&dependency, context).unwrap();
    writer.write(&mut records.iter().cloned()).unwrap();
    writer.stop(true).unwrap();
}

fn bench_no_spill(c: &mut Criterion) {
    let mut group = c.benchmark_group("sort_shuffle_no_spill");
    group.sample_size(10);

    let records = build_records(NUM_RECORDS);
    let work_dir = TempDir::new().unwrap();
    let mut map_id = 0;

    for radix in [true, false] {
        let config = ShuffleWriterConfig {
            use_radix_sort: radix,
            ..Default::default()
        };
        let name = if radix { "radix_sort" } else { "comparison_sort" };
        group.bench_function(name, |b| {
            b.iter(|| {
                map_id += 1;
                run_sort_shuffle(
                    &records,
                    map_id,
                    work_dir.path(),
                    config.clone(),
                    256 * 1024 * 1024,
                );
            });
        });
    }

    group.finish();
}

fn bench_with_spill(c: &mut Criterion) {
    let mut group = c.benchmark_group("sort_shuffle_with_spill");
    group.sample_size(10);

    let records = build_records(NUM_RECORDS);
    let work_dir = TempDir::new().unwrap();
    let mut map_id = 0;

    for (name, fast_merge_enabled) in [("fast_merge", true), ("reencode_merge", false)] {
        let config = ShuffleWriterConfig {
            page_size: 1024 * 1024,
            fast_merge_enabled,
            ..Default::default()
        };
        // 8MB limit to force spilling
        group.bench_function(name, |b| {
            b.iter(|| {
                map_id += 1;
                run_sort_shuffle(&records, map_id, work_dir.path(), config.clone(), 8 * 1024 * 1024);
            });
        });
    }

    group.finish();
}

fn bench_bypass(c: &mut Criterion) {
    let mut group = c.benchmark_group("bypass_shuffle");
    group.sample_size(10);

    let records = build_records(NUM_RECORDS);
    let work_dir = TempDir::new().unwrap();
    let mut map_id = 0;
    let dependency = ShuffleDependency::new(
        0,
        Arc::new(HashPartitioner::try_new(100).unwrap()),
        Arc::new(LengthPrefixedSerializer),
    );

    group.bench_function("100_partitions", |b| {
        b.iter(|| {
            map_id += 1;
            let context = context(
                map_id,
                work_dir.path(),
                ShuffleWriterConfig::default(),
                256 * 1024 * 1024,
            );
            let mut writer = BypassShuffleWriter::try_new(&dependency, context).unwrap();
            writer.write(&mut records.iter().cloned()).unwrap();
            writer.stop(true).unwrap();
        });
    });

    group.finish();
}

criterion_group!(benches, bench_no_spill, bench_with_spill, bench_bypass);
criterion_main!(benches);
