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

//! Spill files of the sort-based shuffle.
//!
//! A spill file holds one sorted run: the records of every partition that
//! had data, in ascending partition order. Each partition segment is
//! encoded on its own, so segments can later be copied or re-encoded
//! independently. Partitions without records take no bytes.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::iter::Peekable;
use std::path::{Path, PathBuf};

use log::debug;
use uuid::Uuid;

use super::pointer::RecordPointer;
use crate::codec::{CodecPipeline, CountingWriter};
use crate::error::{Result, ShuffleError};
use crate::memory::PageArena;
use crate::utils::{remove_file_best_effort, temp_shuffle_path};

/// One sorted run on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpillInfo {
    /// Spill file
    pub path: PathBuf,
    /// Encoded bytes of every partition, indexed by partition id
    pub partition_lengths: Vec<u64>,
}

impl SpillInfo {
    /// Bytes of all partition segments.
    pub fn total_length(&self) -> u64 {
        self.partition_lengths.iter().sum()
    }
}

/// A run written by [`write_sorted_run`].
#[derive(Debug)]
pub struct WrittenRun {
    /// The file and its partition lengths
    pub spill: SpillInfo,
    /// Records in the run
    pub records: usize,
}

/// Writes the records behind `pointers`, which must be ordered by
/// partition, into a new spill file at `path`.
///
/// The file is removed if writing fails.
pub fn write_sorted_run(
    path: &Path,
    pointers: impl Iterator<Item = RecordPointer>,
    arena: &PageArena,
    codecs: &CodecPipeline,
    num_partitions: usize,
    buffer_size: usize,
) -> Result<WrittenRun> {
    let result = File::create(path)
        .map_err(ShuffleError::IoError)
        .and_then(|file| {
            let out = CountingWriter::new(BufWriter::with_capacity(buffer_size, file));
            write_segments(out, pointers.peekable(), arena, codecs, num_partitions)
        });
    match result {
        Ok((partition_lengths, records)) => {
            debug!(
                "Wrote {records} records ({} bytes) to spill file {path:?}",
                partition_lengths.iter().sum::<u64>()
            );
            Ok(WrittenRun {
                spill: SpillInfo {
                    path: path.to_path_buf(),
                    partition_lengths,
                },
                records,
            })
        }
        Err(e) => {
            remove_file_best_effort(path);
            Err(e)
        }
    }
}

fn write_segments<W: Write + Send>(
    mut out: CountingWriter<W>,
    mut pointers: Peekable<impl Iterator<Item = RecordPointer>>,
    arena: &PageArena,
    codecs: &CodecPipeline,
    num_partitions: usize,
) -> Result<(Vec<u64>, usize)> {
    let mut partition_lengths = vec![0u64; num_partitions];
    let mut records = 0;

    while let Some(partition_id) = pointers.peek().map(|p| p.partition_id()) {
        if partition_id >= num_partitions {
            return Err(ShuffleError::Internal(format!(
                "Partition id {partition_id} out of range for {num_partitions} partitions"
            )));
        }
        let start = out.bytes_written();
        let mut segment = codecs.encode(&mut out)?;
        while let Some(pointer) = pointers.next_if(|p| p.partition_id() == partition_id) {
            segment.write_all(arena.record(pointer.page_number(), pointer.offset())?)?;
            records += 1;
        }
        segment.finish()?;
        partition_lengths[partition_id] = out.bytes_written() - start;
    }

    out.flush()?;
    Ok((partition_lengths, records))
}

/// Owns the spill directory of one map task.
///
/// Spill files are tracked in creation order. The directory is removed on
/// cleanup or drop.
#[derive(Debug)]
pub struct SpillManager {
    /// Directory holding spill files
    spill_dir: PathBuf,
    /// Runs written so far
    spills: Vec<SpillInfo>,
}

impl SpillManager {
    /// Creates a uniquely named spill directory under `base_dir`.
    pub fn new(base_dir: &Path) -> Result<Self> {
        let spill_dir = base_dir.join(format!("spill-{}", Uuid::new_v4()));
        fs::create_dir_all(&spill_dir).map_err(ShuffleError::IoError)?;

        Ok(Self {
            spill_dir,
            spills: Vec::new(),
        })
    }

    /// Directory spill files are created in.
    pub fn spill_dir(&self) -> &Path {
        &self.spill_dir
    }

    /// Path for the next spill file.
    pub fn next_spill_path(&self) -> PathBuf {
        temp_shuffle_path(&self.spill_dir)
    }

    /// Tracks a completed run.
    pub fn push(&mut self, spill: SpillInfo) {
        self.spills.push(spill);
    }

    /// Hands the tracked runs to the caller, which becomes responsible for
    /// their files.
    pub fn take_spills(&mut self) -> Vec<SpillInfo> {
        std::mem::take(&mut self.spills)
    }

    /// Deletes the tracked spill files and the spill directory.
    pub fn cleanup(&mut self) -> Result<()> {
        for spill in self.spills.drain(..) {
            remove_file_best_effort(&spill.path);
        }
        if self.spill_dir.exists() {
            fs::remove_dir_all(&self.spill_dir).map_err(ShuffleError::IoError)?;
        }
        Ok(())
    }
}

impl Drop for SpillManager {
    fn drop(&mut self) {
        // Best-effort cleanup on drop
        if let Err(e) = self.cleanup() {
            debug!("Failed to cleanup spill files: {e:?}");
        }
    }
}
