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

//! Reading committed map outputs.
//!
//! The index locates a partition's byte range in the data file. The range
//! holds one or more encoded segments that decode to serialized records.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::codec::{CodecPipeline, ShuffleRecord, ShuffleSerializer};
use crate::error::{Result, ShuffleError};
use crate::index::ShuffleIndex;

/// Gets the index file path for a data file.
pub fn get_index_path(data_path: &Path) -> PathBuf {
    data_path.with_extension("shuffle.index")
}

/// Checks if a data file has been committed together with its index.
pub fn is_committed_output(data_path: &Path) -> bool {
    data_path.exists() && get_index_path(data_path).exists()
}

/// Reads the encoded bytes of one partition.
pub fn read_partition_bytes(
    data_path: &Path,
    index_path: &Path,
    partition_id: usize,
) -> Result<Vec<u8>> {
    let index = ShuffleIndex::read_from_file(index_path)?;
    let (start, end) = index.get_partition_range(partition_id).ok_or_else(|| {
        ShuffleError::General(format!(
            "Partition {partition_id} not found in index (max: {})",
            index.partition_count()
        ))
    })?;
    if start == end {
        return Ok(Vec::new());
    }

    let mut file = File::open(data_path)?;
    let data_len = file.metadata()?.len();
    if data_len != index.total_length() {
        return Err(ShuffleError::General(format!(
            "Data file {data_path:?} holds {data_len} bytes but its index expects {}",
            index.total_length()
        )));
    }
    file.seek(SeekFrom::Start(start))?;
    let mut bytes = vec![0u8; (end - start) as usize];
    file.read_exact(&mut bytes)?;
    Ok(bytes)
}

/// Reads and decodes the records of one partition.
pub fn read_partition_records(
    data_path: &Path,
    index_path: &Path,
    partition_id: usize,
    codecs: &CodecPipeline,
    serializer: &dyn ShuffleSerializer,
) -> Result<Vec<ShuffleRecord>> {
    let bytes = read_partition_bytes(data_path, index_path, partition_id)?;
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    let decoded = codecs.decode_all(&bytes)?;
    serializer.deserialize_all(&decoded)
}

/// Reads every partition of a map output, indexed by partition id.
pub fn read_all_partitions(
    data_path: &Path,
    index_path: &Path,
    codecs: &CodecPipeline,
    serializer: &dyn ShuffleSerializer,
) -> Result<Vec<Vec<ShuffleRecord>>> {
    let partition_count = ShuffleIndex::read_from_file(index_path)?.partition_count();
    (0..partition_count)
        .map(|partition_id| {
            read_partition_records(data_path, index_path, partition_id, codecs, serializer)
        })
        .collect()
}
