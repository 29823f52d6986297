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

//! Common trait for the shuffle writers.
//!
//! A map task hands its records to a [`ShuffleWriter`] and then stops it.
//! Two implementations exist: the sort-based [`SortShuffleWriter`] and the
//! [`BypassShuffleWriter`], which keeps one file per output partition and
//! is used when the partition count is small.

use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::Arc;

use crate::bypass_writer::BypassShuffleWriter;
use crate::codec::{CodecPipeline, ShuffleRecord, ShuffleSerializer};
use crate::commit::{MapStatus, ShuffleOutputCommitter};
use crate::config::ShuffleWriterConfig;
use crate::error::{Result, ShuffleError};
use crate::memory::TaskMemoryManager;
use crate::metrics::ShuffleWriteMetrics;
use crate::partitioner::Partitioner;
use crate::sort_shuffle::{SortShuffleWriter, MAX_SHUFFLE_OUTPUT_PARTITIONS};

/// Writes the output of one map task.
pub trait ShuffleWriter: Debug + Send {
    /// Consumes all records of the map task and commits the output.
    ///
    /// On failure every intermediate file is deleted before the error is
    /// returned.
    fn write(&mut self, records: &mut dyn Iterator<Item = ShuffleRecord>) -> Result<()>;

    /// Ends the writer.
    ///
    /// `stop(true)` returns the status of the committed output and may be
    /// repeated. It is a misuse without a successful `write`. `stop(false)`
    /// releases everything the writer still holds and returns `None`.
    fn stop(&mut self, success: bool) -> Result<Option<MapStatus>>;

    /// Bytes of every output partition. Empty until the write completes.
    fn partition_lengths(&self) -> &[u64];
}

/// Describes the shuffle a map task writes to.
#[derive(Debug, Clone)]
pub struct ShuffleDependency {
    /// Shuffle the writer produces output for
    pub shuffle_id: usize,
    /// Routes records to output partitions
    pub partitioner: Arc<dyn Partitioner>,
    /// Frames records as bytes
    pub serializer: Arc<dyn ShuffleSerializer>,
    /// Whether records are combined by key before they are written.
    /// Neither writer supports it.
    pub map_side_combine: bool,
}

impl ShuffleDependency {
    /// A dependency without map-side combine.
    pub fn new(
        shuffle_id: usize,
        partitioner: Arc<dyn Partitioner>,
        serializer: Arc<dyn ShuffleSerializer>,
    ) -> Self {
        Self {
            shuffle_id,
            partitioner,
            serializer,
            map_side_combine: false,
        }
    }

    /// Output partitions of the shuffle.
    pub fn num_partitions(&self) -> usize {
        self.partitioner.num_partitions()
    }
}

/// Everything a writer needs from the task running it.
#[derive(Debug, Clone)]
pub struct ShuffleWriteContext {
    /// Map task being written
    pub map_id: usize,
    /// Memory of the task running the writer
    pub memory: Arc<TaskMemoryManager>,
    /// Publishes the final output
    pub committer: Arc<dyn ShuffleOutputCommitter>,
    /// Compression and encryption of every segment
    pub codecs: CodecPipeline,
    /// Writer settings
    pub config: ShuffleWriterConfig,
    /// Metrics of the map task
    pub metrics: ShuffleWriteMetrics,
    /// Directory for intermediate files
    pub work_dir: PathBuf,
}

/// Progress of a writer through write and stop.
#[derive(Debug, Clone, Default)]
pub(crate) enum WriterState {
    #[default]
    Open,
    /// The output is committed
    Committed(MapStatus),
    /// The write failed and was cleaned up
    Failed,
    /// `stop` was called
    Stopped(Option<MapStatus>),
}

impl WriterState {
    pub(crate) fn check_writable(&self) -> Result<()> {
        match self {
            WriterState::Open => Ok(()),
            _ => Err(ShuffleError::Internal(
                "A shuffle writer accepts a single write call".to_string(),
            )),
        }
    }

    /// Applies `stop(success)`. `abort` runs when the writer is stopped
    /// before its output was committed.
    pub(crate) fn stop(
        &mut self,
        success: bool,
        abort: impl FnOnce(),
    ) -> Result<Option<MapStatus>> {
        match (std::mem::take(self), success) {
            (state @ (WriterState::Open | WriterState::Failed), true) => {
                *self = state;
                Err(ShuffleError::Internal(
                    "Cannot call stop(true) without a successful write".to_string(),
                ))
            }
            (WriterState::Open, false) => {
                abort();
                *self = WriterState::Stopped(None);
                Ok(None)
            }
            (WriterState::Failed, false) => {
                *self = WriterState::Stopped(None);
                Ok(None)
            }
            (WriterState::Committed(status), true) => {
                *self = WriterState::Stopped(Some(status.clone()));
                Ok(Some(status))
            }
            (WriterState::Committed(_), false) => {
                *self = WriterState::Stopped(None);
                Ok(None)
            }
            (WriterState::Stopped(status), success) => {
                let result = if success { status.clone() } else { None };
                *self = WriterState::Stopped(status);
                Ok(result)
            }
        }
    }
}

/// The writer implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShuffleWriterKind {
    /// One file per partition, concatenated at the end
    Bypass,
    /// Records sorted by partition in memory and spilled when needed
    Sort,
}

impl ShuffleWriterKind {
    /// Picks the writer for a shuffle, or `None` when no writer supports
    /// it.
    pub fn select(
        num_partitions: usize,
        map_side_combine: bool,
        serializer_relocatable: bool,
        config: &ShuffleWriterConfig,
    ) -> Option<Self> {
        if map_side_combine {
            None
        } else if num_partitions <= config.bypass_merge_threshold {
            Some(ShuffleWriterKind::Bypass)
        } else if serializer_relocatable && num_partitions <= MAX_SHUFFLE_OUTPUT_PARTITIONS {
            Some(ShuffleWriterKind::Sort)
        } else {
            None
        }
    }
}

/// Creates the writer [`ShuffleWriterKind::select`] picks for `dependency`.
pub fn create_shuffle_writer(
    dependency: &ShuffleDependency,
    context: ShuffleWriteContext,
) -> Result<Box<dyn ShuffleWriter>> {
    let num_partitions = dependency.num_partitions();
    let kind = ShuffleWriterKind::select(
        num_partitions,
        dependency.map_side_combine,
        dependency.serializer.supports_relocation(),
        &context.config,
    )
    .ok_or_else(|| {
        ShuffleError::General(format!(
            "No shuffle writer supports shuffle {} with {num_partitions} partitions \
            (map side combine: {})",
            dependency.shuffle_id, dependency.map_side_combine
        ))
    })?;

    log::debug!(
        "Using {kind:?} shuffle writer for map {} of shuffle {}",
        context.map_id,
        dependency.shuffle_id
    );
    Ok(match kind {
        ShuffleWriterKind::Bypass => Box::new(BypassShuffleWriter::try_new(dependency, context)?),
        ShuffleWriterKind::Sort => Box::new(SortShuffleWriter::try_new(dependency, context)?),
    })
}
