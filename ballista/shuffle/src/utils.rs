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

//! File helpers shared by the shuffle writers.

use std::fs::{self, File};
use std::io::{self, Read, Seek, Write};
use std::path::{Path, PathBuf};

use log::warn;
use uuid::Uuid;

use crate::error::{Result, ShuffleError};

/// A unique path for a temporary shuffle file inside `dir`.
pub fn temp_shuffle_path(dir: &Path) -> PathBuf {
    dir.join(format!("temp_shuffle_{}", Uuid::new_v4()))
}

/// Deletes `path`, logging instead of failing. Missing files are ignored.
pub fn remove_file_best_effort(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to delete shuffle file {path:?}: {e}"),
    }
}

/// Appends the first `len` bytes read from `input` to `output`.
///
/// With `transfer_to` both sides are plain files so the kernel can copy
/// without going through user space. Otherwise the bytes pass through a
/// `buffer_size` buffer.
pub fn copy_file_range(
    input: &mut File,
    output: &mut File,
    len: u64,
    transfer_to: bool,
    buffer_size: usize,
) -> Result<u64> {
    let copied = if transfer_to {
        io::copy(&mut input.take(len), output)?
    } else {
        let mut reader = io::BufReader::with_capacity(buffer_size, input.take(len));
        let mut writer = io::BufWriter::with_capacity(buffer_size, &mut *output);
        let copied = io::copy(&mut reader, &mut writer)?;
        writer.flush()?;
        copied
    };
    if copied != len {
        return Err(ShuffleError::Internal(format!(
            "Copied {copied} bytes instead of {len}"
        )));
    }
    Ok(copied)
}

/// Fails when the write position of `file` is not `expected`.
pub fn verify_position(file: &mut File, expected: u64) -> Result<()> {
    let position = file.stream_position()?;
    if position != expected {
        return Err(ShuffleError::Internal(format!(
            "Current position {position} does not equal expected position {expected} \
            after a kernel file copy. Set ballista.shuffle.transfer_to_enabled to false \
            to copy through user space instead."
        )));
    }
    Ok(())
}
