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

#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

/// Writer that keeps one file per output partition.
pub mod bypass_writer;
/// Compression, encryption and record framing of shuffle segments.
pub mod codec;
/// Committing map outputs next to their index.
pub mod commit;
/// Configuration options and settings for the shuffle writers.
pub mod config;
/// Error types and result definitions for shuffle operations.
pub mod error;
/// Index files mapping partitions to byte ranges.
pub mod index;
/// Page arena and task memory accounting.
pub mod memory;
/// Metrics reported by the shuffle writers.
pub mod metrics;
/// Partition functions.
pub mod partitioner;
/// Reading committed map outputs.
pub mod reader;
/// Common interface of the shuffle writers and writer selection.
pub mod shuffle_writer_trait;
/// Sort-based shuffle.
pub mod sort_shuffle;
/// File utilities shared by the writers.
pub mod utils;

pub use bypass_writer::BypassShuffleWriter;
pub use commit::{IndexShuffleCommitter, MapStatus, ShuffleOutputCommitter};
pub use error::{Result, ShuffleError};
pub use shuffle_writer_trait::{
    create_shuffle_writer, ShuffleDependency, ShuffleWriteContext, ShuffleWriter,
    ShuffleWriterKind,
};
pub use sort_shuffle::SortShuffleWriter;
