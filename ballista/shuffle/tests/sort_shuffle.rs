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

//! End-to-end tests of the sort-based shuffle writer.
//!
//! These tests write map outputs through the public writer interface and
//! read them back through the index.

mod common;

#[cfg(test)]
mod sort_shuffle_tests {
    use std::fs;
    use std::sync::Arc;

    use ballista_shuffle::codec::{
        CodecPipeline, EncryptionCodec, Lz4Codec, Salsa20Encryption, ShuffleRecord, ZlibCodec,
    };
    use ballista_shuffle::config::{CompressionKind, ShuffleWriterConfig};
    use ballista_shuffle::error::{Result, ShuffleError};
    use ballista_shuffle::partitioner::Partitioner;
    use ballista_shuffle::{MapStatus, ShuffleWriter, SortShuffleWriter};

    use crate::common::{
        count_entries, expected_partitions, random_records, read_sorted_partitions,
        serialized_lengths, small_config, ShuffleEnv,
    };

    const NUM_PARTITIONS: usize = 7;

    fn write_sorted(
        env: &ShuffleEnv,
        map_id: usize,
        records: &[ShuffleRecord],
        config: ShuffleWriterConfig,
        codecs: CodecPipeline,
    ) -> Result<(MapStatus, usize)> {
        let dependency = env.dependency(NUM_PARTITIONS)?;
        let context = env.context(map_id, config, codecs)?;
        let mut writer = SortShuffleWriter::try_new(&dependency, context)?;
        writer.write(&mut records.iter().cloned())?;
        let spills = writer.spill_count();
        let status = writer
            .stop(true)?
            .ok_or_else(|| ShuffleError::General("missing map status".to_string()))?;
        assert_eq!(writer.partition_lengths(), status.partition_lengths.as_slice());
        Ok((status, spills))
    }

    fn check_round_trip(
        config: ShuffleWriterConfig,
        codecs: CodecPipeline,
        expect_spills: bool,
    ) -> Result<()> {
        let env = ShuffleEnv::new()?;
        let records = random_records(2000, 42);
        let (status, spills) = write_sorted(&env, 0, &records, config, codecs.clone())?;
        assert_eq!(spills > 0, expect_spills);

        assert_eq!(status.partition_lengths.len(), NUM_PARTITIONS);
        assert_eq!(status.total_bytes(), fs::metadata(&status.data_path)?.len());
        let partitioner = env.dependency(NUM_PARTITIONS)?.partitioner;
        assert_eq!(
            read_sorted_partitions(&status, &codecs)?,
            expected_partitions(&records, partitioner.as_ref())
        );
        // spill files and their directory are gone
        assert_eq!(count_entries(&env.work_dir()), 0);
        Ok(())
    }

    fn spilling(compression: CompressionKind) -> ShuffleWriterConfig {
        ShuffleWriterConfig {
            spill_num_elements_threshold: 300,
            ..small_config(compression)
        }
    }

    fn lz4() -> CodecPipeline {
        CodecPipeline::new(Some(Arc::new(Lz4Codec)), None)
    }

    fn encrypted() -> CodecPipeline {
        let encryption: Arc<dyn EncryptionCodec> =
            Arc::new(Salsa20Encryption::with_random_key());
        CodecPipeline::new(Some(Arc::new(Lz4Codec)), Some(encryption))
    }

    #[test]
    fn round_trip_without_spills() -> Result<()> {
        check_round_trip(small_config(CompressionKind::Lz4), lz4(), false)
    }

    #[test]
    fn round_trip_with_transfer_merge() -> Result<()> {
        check_round_trip(spilling(CompressionKind::Lz4), lz4(), true)
    }

    #[test]
    fn round_trip_with_buffered_copy_merge() -> Result<()> {
        let config = ShuffleWriterConfig {
            transfer_to_enabled: false,
            ..spilling(CompressionKind::None)
        };
        check_round_trip(config, CodecPipeline::default(), true)
    }

    #[test]
    fn round_trip_with_zlib_reencode() -> Result<()> {
        let codecs = CodecPipeline::new(Some(Arc::new(ZlibCodec::default())), None);
        check_round_trip(spilling(CompressionKind::Zlib), codecs, true)
    }

    #[test]
    fn round_trip_with_encryption() -> Result<()> {
        check_round_trip(spilling(CompressionKind::Lz4), encrypted(), true)
    }

    #[test]
    fn round_trip_with_comparison_sort() -> Result<()> {
        let config = ShuffleWriterConfig {
            use_radix_sort: false,
            ..spilling(CompressionKind::Lz4)
        };
        check_round_trip(config, lz4(), true)
    }

    #[test]
    fn lengths_do_not_depend_on_spilling() -> Result<()> {
        let env = ShuffleEnv::new()?;
        let records = random_records(500, 7);
        let partitioner = env.dependency(NUM_PARTITIONS)?.partitioner;
        let expected = serialized_lengths(&records, partitioner.as_ref())?;

        // one run, then 2, 3, 4 and 5 runs, then a run per record
        for (map_id, threshold) in [usize::MAX, 300, 200, 125, 100, 1]
            .into_iter()
            .enumerate()
        {
            let config = ShuffleWriterConfig {
                spill_num_elements_threshold: threshold,
                ..small_config(CompressionKind::None)
            };
            let (status, spills) =
                write_sorted(&env, map_id, &records, config, CodecPipeline::default())?;
            let expected_spills = if threshold == usize::MAX {
                0
            } else {
                (records.len() - 1) / threshold
            };
            assert_eq!(spills, expected_spills, "threshold {threshold}");
            assert_eq!(status.partition_lengths, expected, "threshold {threshold}");
        }
        Ok(())
    }

    #[test]
    fn fast_and_slow_merges_decode_identically() -> Result<()> {
        let env = ShuffleEnv::new()?;
        let records = random_records(1500, 99);
        let fast = ShuffleWriterConfig {
            fast_merge_enabled: true,
            ..spilling(CompressionKind::Lz4)
        };
        let slow = ShuffleWriterConfig {
            fast_merge_enabled: false,
            ..spilling(CompressionKind::Lz4)
        };
        let (fast_status, _) = write_sorted(&env, 0, &records, fast, lz4())?;
        let (slow_status, _) = write_sorted(&env, 1, &records, slow, lz4())?;
        assert_eq!(
            read_sorted_partitions(&fast_status, &lz4())?,
            read_sorted_partitions(&slow_status, &lz4())?
        );
        Ok(())
    }

    #[test]
    fn empty_input_writes_empty_output() -> Result<()> {
        let env = ShuffleEnv::new()?;
        let (status, spills) = write_sorted(
            &env,
            0,
            &[],
            small_config(CompressionKind::Lz4),
            lz4(),
        )?;
        assert_eq!(spills, 0);
        assert_eq!(status.partition_lengths, vec![0; NUM_PARTITIONS]);
        assert_eq!(fs::metadata(&status.data_path)?.len(), 0);
        assert_eq!(fs::metadata(&status.index_path)?.len(), 8 * (NUM_PARTITIONS as u64 + 1));
        Ok(())
    }

    #[test]
    fn records_larger_than_a_page_round_trip() -> Result<()> {
        let env = ShuffleEnv::new()?;
        let mut records = random_records(50, 3);
        records.push(ShuffleRecord::new("big", vec![42u8; 100 * 1024]));
        records.push(ShuffleRecord::new("bigger", vec![7u8; 300 * 1024]));
        records.extend(random_records(50, 4));

        let (status, _) = write_sorted(
            &env,
            0,
            &records,
            small_config(CompressionKind::Lz4),
            lz4(),
        )?;
        let partitioner = env.dependency(NUM_PARTITIONS)?.partitioner;
        assert_eq!(
            read_sorted_partitions(&status, &lz4())?,
            expected_partitions(&records, partitioner.as_ref())
        );
        Ok(())
    }

    #[test]
    fn memory_pressure_triggers_spills() -> Result<()> {
        // room for the pointer array and two pages
        let env = ShuffleEnv::with_memory_limit(64 * 8 * 4 + 2 * 4096)?;
        let records = random_records(2000, 5);
        let (status, spills) = write_sorted(
            &env,
            0,
            &records,
            small_config(CompressionKind::Lz4),
            lz4(),
        )?;
        assert!(spills > 0);
        assert!(env.memory.peak_memory_used() <= 64 * 8 * 4 + 2 * 4096);
        assert_eq!(env.memory.total_memory_used(), 0);

        let partitioner = env.dependency(NUM_PARTITIONS)?.partitioner;
        assert_eq!(
            read_sorted_partitions(&status, &lz4())?,
            expected_partitions(&records, partitioner.as_ref())
        );
        let metrics = env.metric_values();
        assert_eq!(metrics["spill_count"], spills);
        assert_eq!(metrics["output_rows"], records.len());
        assert_eq!(metrics["bytes_written"] as u64, status.total_bytes());
        Ok(())
    }

    #[test]
    fn stop_protocol() -> Result<()> {
        let env = ShuffleEnv::new()?;
        let dependency = env.dependency(NUM_PARTITIONS)?;
        let context = env.context(0, small_config(CompressionKind::Lz4), lz4())?;
        let mut writer = SortShuffleWriter::try_new(&dependency, context)?;

        assert!(matches!(writer.stop(true), Err(ShuffleError::Internal(_))));
        writer.write(&mut random_records(100, 1).into_iter())?;
        assert!(matches!(
            writer.write(&mut std::iter::empty::<ShuffleRecord>()),
            Err(ShuffleError::Internal(_))
        ));

        let first = writer.stop(true)?;
        assert!(first.is_some());
        assert_eq!(writer.stop(true)?, first);
        assert_eq!(writer.stop(false)?, None);
        assert!(first.is_some_and(|status| status.data_path.exists()));
        Ok(())
    }

    #[test]
    fn abort_deletes_spill_files() -> Result<()> {
        let env = ShuffleEnv::new()?;
        let dependency = env.dependency(NUM_PARTITIONS)?;
        let context = env.context(0, spilling(CompressionKind::Lz4), lz4())?;
        let mut writer = SortShuffleWriter::try_new(&dependency, context)?;
        writer.force_spill()?;
        assert!(count_entries(&env.work_dir()) > 0);

        assert_eq!(writer.stop(false)?, None);
        assert_eq!(writer.stop(false)?, None);
        assert_eq!(writer.stop(true)?, None);
        assert_eq!(count_entries(&env.work_dir()), 0);
        assert_eq!(env.memory.total_memory_used(), 0);
        Ok(())
    }

    /// Routes every record to a partition that does not exist.
    #[derive(Debug)]
    struct BrokenPartitioner;

    impl Partitioner for BrokenPartitioner {
        fn num_partitions(&self) -> usize {
            NUM_PARTITIONS
        }

        fn partition(&self, _key: &[u8]) -> usize {
            NUM_PARTITIONS
        }
    }

    #[test]
    fn failed_write_cleans_up() -> Result<()> {
        let env = ShuffleEnv::new()?;
        let mut dependency = env.dependency(NUM_PARTITIONS)?;
        dependency.partitioner = Arc::new(BrokenPartitioner);
        let context = env.context(0, small_config(CompressionKind::Lz4), lz4())?;
        let mut writer = SortShuffleWriter::try_new(&dependency, context)?;

        assert!(writer.write(&mut random_records(10, 1).into_iter()).is_err());
        assert!(matches!(writer.stop(true), Err(ShuffleError::Internal(_))));
        assert_eq!(writer.stop(false)?, None);
        assert_eq!(count_entries(&env.work_dir()), 0);
        assert_eq!(count_entries(&env.committer.output_dir().join("0")), 0);
        Ok(())
    }
}
