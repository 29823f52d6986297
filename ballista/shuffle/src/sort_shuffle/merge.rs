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

//! Merging of sorted runs into the final map output.
//!
//! Every run holds the segments of the partitions it saw, in partition
//! order. The merged file holds, for each partition in turn, the segments
//! of that partition from every run. Codecs whose segments concatenate
//! cleanly are merged by copying byte ranges. Otherwise each partition is
//! decoded and encoded again as a single segment.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use log::debug;

use super::spill::SpillInfo;
use crate::codec::{CodecPipeline, CountingWriter};
use crate::config::ShuffleWriterConfig;
use crate::error::{Result, ShuffleError};
use crate::utils::{copy_file_range, remove_file_best_effort, verify_position};

/// How a set of runs is turned into the map output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// No runs, an empty output is created
    Empty,
    /// A single run becomes the output as is
    Rename,
    /// Segments are copied by the kernel
    Transfer,
    /// Segments are copied through a user space buffer
    BufferedCopy,
    /// Segments are decoded and encoded again per partition
    Reencode,
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MergeStrategy::Empty => "empty",
            MergeStrategy::Rename => "rename",
            MergeStrategy::Transfer => "transfer",
            MergeStrategy::BufferedCopy => "buffered copy",
            MergeStrategy::Reencode => "re-encode",
        };
        write!(f, "{name}")
    }
}

/// Merges the runs of one map task.
#[derive(Debug)]
pub struct SpillMerger<'a> {
    codecs: &'a CodecPipeline,
    num_partitions: usize,
    fast_merge_enabled: bool,
    transfer_to_enabled: bool,
    file_buffer_size: usize,
}

impl<'a> SpillMerger<'a> {
    /// A merger for runs of `num_partitions` partitions.
    pub fn new(
        codecs: &'a CodecPipeline,
        num_partitions: usize,
        config: &ShuffleWriterConfig,
    ) -> Self {
        Self {
            codecs,
            num_partitions,
            fast_merge_enabled: config.fast_merge_enabled,
            transfer_to_enabled: config.transfer_to_enabled,
            file_buffer_size: config.file_buffer_size,
        }
    }

    /// Picks the merge strategy for `num_spills` runs.
    pub fn strategy(&self, num_spills: usize) -> MergeStrategy {
        match num_spills {
            0 => MergeStrategy::Empty,
            1 => MergeStrategy::Rename,
            _ if self.fast_merge_enabled && self.codecs.supports_concatenation() => {
                // encrypted segments never take the fast path
                if self.transfer_to_enabled {
                    MergeStrategy::Transfer
                } else {
                    MergeStrategy::BufferedCopy
                }
            }
            _ => MergeStrategy::Reencode,
        }
    }

    /// Merges `spills` into `output` and returns the length of every
    /// partition in the output.
    ///
    /// The run files are consumed. On failure the partial output is
    /// deleted.
    pub fn merge(&self, spills: Vec<SpillInfo>, output: &Path) -> Result<Vec<u64>> {
        let result = self
            .check_partition_counts(&spills)
            .and_then(|_| self.merge_runs(&spills, output));
        if result.is_err() {
            remove_file_best_effort(output);
        }
        for spill in &spills {
            remove_file_best_effort(&spill.path);
        }
        result
    }

    fn check_partition_counts(&self, spills: &[SpillInfo]) -> Result<()> {
        for spill in spills {
            if spill.partition_lengths.len() != self.num_partitions {
                return Err(ShuffleError::Internal(format!(
                    "Spill file {:?} has {} partitions, expected {}",
                    spill.path,
                    spill.partition_lengths.len(),
                    self.num_partitions
                )));
            }
        }
        Ok(())
    }

    fn merge_runs(&self, spills: &[SpillInfo], output: &Path) -> Result<Vec<u64>> {
        let strategy = self.strategy(spills.len());
        debug!(
            "Merging {} spill files into {output:?} using {strategy}",
            spills.len()
        );
        match strategy {
            MergeStrategy::Empty => self.write_empty(output),
            MergeStrategy::Rename => self.rename(&spills[0], output),
            MergeStrategy::Transfer => self.merge_with_copy(spills, output, true),
            MergeStrategy::BufferedCopy => self.merge_with_copy(spills, output, false),
            MergeStrategy::Reencode => self.merge_with_reencode(spills, output),
        }
    }

    fn write_empty(&self, output: &Path) -> Result<Vec<u64>> {
        File::create(output)?;
        Ok(vec![0; self.num_partitions])
    }

    fn rename(&self, spill: &SpillInfo, output: &Path) -> Result<Vec<u64>> {
        fs::rename(&spill.path, output)?;
        Ok(spill.partition_lengths.clone())
    }

    /// Appends the segments of every run byte for byte.
    fn merge_with_copy(
        &self,
        spills: &[SpillInfo],
        output: &Path,
        transfer_to: bool,
    ) -> Result<Vec<u64>> {
        let mut inputs = spills
            .iter()
            .map(|spill| File::open(&spill.path))
            .collect::<io::Result<Vec<_>>>()?;
        let mut out = File::create(output)?;
        let mut partition_lengths = vec![0u64; self.num_partitions];

        for (partition_id, partition_length) in partition_lengths.iter_mut().enumerate() {
            for (spill, input) in spills.iter().zip(inputs.iter_mut()) {
                let len = spill.partition_lengths[partition_id];
                if len == 0 {
                    continue;
                }
                *partition_length +=
                    copy_file_range(input, &mut out, len, transfer_to, self.file_buffer_size)?;
            }
        }

        if transfer_to {
            verify_position(&mut out, partition_lengths.iter().sum())?;
        }
        out.flush()?;
        Ok(partition_lengths)
    }

    /// Decodes the segments of each partition from every run and encodes
    /// them again as one segment.
    fn merge_with_reencode(&self, spills: &[SpillInfo], output: &Path) -> Result<Vec<u64>> {
        let mut inputs = spills
            .iter()
            .map(|spill| {
                File::open(&spill.path)
                    .map(|file| BufReader::with_capacity(self.file_buffer_size, file))
            })
            .collect::<io::Result<Vec<_>>>()?;
        let mut out = CountingWriter::new(BufWriter::with_capacity(
            self.file_buffer_size,
            File::create(output)?,
        ));
        let mut partition_lengths = vec![0u64; self.num_partitions];

        for (partition_id, partition_length) in partition_lengths.iter_mut().enumerate() {
            let has_data = spills
                .iter()
                .any(|spill| spill.partition_lengths[partition_id] > 0);
            if !has_data {
                continue;
            }

            let start = out.bytes_written();
            let mut segment = self.codecs.encode(&mut out)?;
            for (spill, input) in spills.iter().zip(inputs.iter_mut()) {
                let len = spill.partition_lengths[partition_id];
                if len == 0 {
                    continue;
                }
                let mut region = input.take(len);
                {
                    let mut decoder = self.codecs.decode(&mut region)?;
                    io::copy(&mut decoder, &mut segment)?;
                }
                // skip whatever trailer the decoder left unread
                io::copy(&mut region, &mut io::sink())?;
            }
            segment.finish()?;
            *partition_length = out.bytes_written() - start;
        }

        out.flush()?;
        Ok(partition_lengths)
    }
}
