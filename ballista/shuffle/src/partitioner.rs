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

//! Partition functions.

use std::fmt::Debug;
use std::hash::{DefaultHasher, Hash, Hasher};

use crate::error::{Result, ShuffleError};

/// Maps a record key to an output partition in `[0, num_partitions)`.
pub trait Partitioner: Debug + Send + Sync {
    /// Number of output partitions.
    fn num_partitions(&self) -> usize;

    /// Partition of `key`.
    fn partition(&self, key: &[u8]) -> usize;
}

/// Assigns partitions by hashing the key.
#[derive(Debug, Clone)]
pub struct HashPartitioner {
    num_partitions: usize,
}

impl HashPartitioner {
    /// Fails for zero partitions.
    pub fn try_new(num_partitions: usize) -> Result<Self> {
        if num_partitions == 0 {
            return Err(ShuffleError::Configuration(
                "A shuffle needs at least one output partition".to_string(),
            ));
        }
        Ok(Self { num_partitions })
    }
}

impl Partitioner for HashPartitioner {
    fn num_partitions(&self) -> usize {
        self.num_partitions
    }

    fn partition(&self, key: &[u8]) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.num_partitions as u64) as usize
    }
}
