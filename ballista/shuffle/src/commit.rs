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

//! Committing map outputs.
//!
//! A writer produces its data file at a temporary location handed out by
//! the committer. The committer then writes the index and moves both files
//! into place, or keeps an output that an earlier attempt of the same map
//! task already committed.

use std::fmt::Debug;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use parking_lot::Mutex;

use crate::error::{Result, ShuffleError};
use crate::index::ShuffleIndex;
use crate::utils::{remove_file_best_effort, temp_shuffle_path};

/// Name of a committed data file.
pub const DATA_FILE_NAME: &str = "data.shuffle";
/// Name of a committed index file.
pub const INDEX_FILE_NAME: &str = "data.shuffle.index";

/// Result of a successful map task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapStatus {
    /// Map task that wrote the output
    pub map_id: usize,
    /// Committed data file
    pub data_path: PathBuf,
    /// Committed index file
    pub index_path: PathBuf,
    /// Bytes of every output partition in the data file
    pub partition_lengths: Vec<u64>,
}

impl MapStatus {
    /// Sum of the partition lengths.
    pub fn total_bytes(&self) -> u64 {
        self.partition_lengths.iter().sum()
    }
}

/// Places the output of a map task where readers expect it.
pub trait ShuffleOutputCommitter: Debug + Send + Sync {
    /// A fresh path the writer may create its data file at.
    fn temp_data_path(&self, map_id: usize) -> Result<PathBuf>;

    /// Publishes the data file at `temp_data` together with an index built
    /// from `partition_lengths`. Called exactly once per successful write.
    ///
    /// The returned lengths are authoritative: when another attempt of the
    /// same map task committed first, its lengths are returned instead.
    fn commit(
        &self,
        map_id: usize,
        partition_lengths: &[u64],
        temp_data: &Path,
    ) -> Result<MapStatus>;
}

/// Commits `data.shuffle` and `data.shuffle.index` under
/// `{output_dir}/{map_id}/`.
#[derive(Debug)]
pub struct IndexShuffleCommitter {
    output_dir: PathBuf,
    /// Serializes commits so that concurrent attempts see each other
    commit_lock: Mutex<()>,
}

impl IndexShuffleCommitter {
    /// Commits into `output_dir`, which is created on demand.
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            commit_lock: Mutex::new(()),
        }
    }

    /// Root of all committed outputs.
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn map_dir(&self, map_id: usize) -> PathBuf {
        self.output_dir.join(map_id.to_string())
    }

    /// Committed data file of `map_id`.
    pub fn data_path(&self, map_id: usize) -> PathBuf {
        self.map_dir(map_id).join(DATA_FILE_NAME)
    }

    /// Committed index file of `map_id`.
    pub fn index_path(&self, map_id: usize) -> PathBuf {
        self.map_dir(map_id).join(INDEX_FILE_NAME)
    }

    /// Lengths of an already committed output, if the index and data file
    /// exist and agree with each other.
    fn committed_lengths(&self, map_id: usize, num_partitions: usize) -> Option<Vec<u64>> {
        let index_path = self.index_path(map_id);
        if !index_path.exists() {
            return None;
        }
        let index = match ShuffleIndex::read_from_file(&index_path) {
            Ok(index) => index,
            Err(e) => {
                debug!("Ignoring unreadable shuffle index {index_path:?}: {e}");
                return None;
            }
        };
        let data_len = fs::metadata(self.data_path(map_id)).ok()?.len();
        (index.partition_count() == num_partitions && index.total_length() == data_len)
            .then(|| index.partition_lengths())
    }

    fn status(&self, map_id: usize, partition_lengths: Vec<u64>) -> MapStatus {
        MapStatus {
            map_id,
            data_path: self.data_path(map_id),
            index_path: self.index_path(map_id),
            partition_lengths,
        }
    }
}

impl ShuffleOutputCommitter for IndexShuffleCommitter {
    fn temp_data_path(&self, map_id: usize) -> Result<PathBuf> {
        let dir = self.map_dir(map_id);
        fs::create_dir_all(&dir).map_err(ShuffleError::IoError)?;
        Ok(temp_shuffle_path(&dir))
    }

    fn commit(
        &self,
        map_id: usize,
        partition_lengths: &[u64],
        temp_data: &Path,
    ) -> Result<MapStatus> {
        let data_len = fs::metadata(temp_data)?.len();
        let expected: u64 = partition_lengths.iter().sum();
        if data_len != expected {
            remove_file_best_effort(temp_data);
            return Err(ShuffleError::Internal(format!(
                "Data file {temp_data:?} holds {data_len} bytes but the partitions add up to {expected}"
            )));
        }

        let dir = self.map_dir(map_id);
        fs::create_dir_all(&dir)?;
        let temp_index = temp_shuffle_path(&dir);
        let index = ShuffleIndex::from_partition_lengths(partition_lengths)?;
        if let Err(e) = index.write_to_file(&temp_index) {
            remove_file_best_effort(&temp_index);
            remove_file_best_effort(temp_data);
            return Err(e);
        }

        let _guard = self.commit_lock.lock();
        if let Some(existing) = self.committed_lengths(map_id, partition_lengths.len()) {
            info!("Map output {map_id} was already committed, discarding this attempt");
            remove_file_best_effort(&temp_index);
            remove_file_best_effort(temp_data);
            return Ok(self.status(map_id, existing));
        }

        let data_path = self.data_path(map_id);
        let index_path = self.index_path(map_id);
        // readers look for the index, so it goes in last
        let result = fs::rename(temp_data, &data_path)
            .and_then(|_| fs::rename(&temp_index, &index_path));
        if let Err(e) = result {
            remove_file_best_effort(&temp_index);
            remove_file_best_effort(temp_data);
            return Err(ShuffleError::IoError(e));
        }
        debug!("Committed map output {map_id} to {data_path:?} and {index_path:?}");
        Ok(self.status(map_id, partition_lengths.to_vec()))
    }
}
