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

//! Sort-based shuffle.
//!
//! Serialized records are appended to arena pages while a compact pointer
//! per record is collected in memory. Whenever memory runs short the
//! pointers are sorted by partition id and the records are written out as
//! a sorted run. At the end of the task all runs are merged into one file
//! where every partition occupies a contiguous byte range.
//!
//! This follows the approach used by Apache Spark: a map task produces a
//! single data file plus an index, regardless of the number of output
//! partitions.

mod external_sorter;
mod merge;
mod pointer;
mod sorter;
mod spill;
mod writer;

pub use external_sorter::ShuffleExternalSorter;
pub use merge::{MergeStrategy, SpillMerger};
pub use pointer::{RecordPointer, MAX_SHUFFLE_OUTPUT_PARTITIONS, PARTITION_ID_BITS};
pub use sorter::{ShuffleInMemorySorter, ShuffleSorterIterator, POINTER_SLOT_SIZE};
pub use spill::{write_sorted_run, SpillInfo, SpillManager, WrittenRun};
pub use writer::SortShuffleWriter;
