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

//! Shuffle write error types

use std::{
    error::Error,
    fmt::{Display, Formatter},
    io, result,
};

use datafusion::error::DataFusionError;

/// Result type alias for shuffle write operations.
pub type Result<T> = result::Result<T, ShuffleError>;

/// Errors raised by the shuffle write engine.
#[derive(Debug)]
pub enum ShuffleError {
    /// General error with a descriptive message.
    General(String),
    /// Internal error indicating misuse, a broken invariant or a consistency failure.
    Internal(String),
    /// Configuration error with invalid settings.
    Configuration(String),
    /// Memory could not be granted even after spilling.
    ResourceExhausted(String),
    /// A single record needs more space than the largest page the arena can address.
    OversizedRecord {
        /// Bytes needed to store the record, including its length header.
        required: usize,
        /// Largest page size the arena can hand out.
        max: usize,
    },
    /// I/O operation error.
    IoError(io::Error),
    /// Error from DataFusion operations.
    DataFusionError(Box<DataFusionError>),
}

#[allow(clippy::from_over_into)]
impl<T> Into<Result<T>> for ShuffleError {
    fn into(self) -> Result<T> {
        Err(self)
    }
}

impl From<String> for ShuffleError {
    fn from(e: String) -> Self {
        ShuffleError::General(e)
    }
}

impl From<DataFusionError> for ShuffleError {
    fn from(e: DataFusionError) -> Self {
        match e {
            DataFusionError::ResourcesExhausted(desc) => {
                ShuffleError::ResourceExhausted(desc)
            }
            DataFusionError::IoError(e) => ShuffleError::IoError(e),
            _ => ShuffleError::DataFusionError(Box::new(e)),
        }
    }
}

impl From<io::Error> for ShuffleError {
    fn from(e: io::Error) -> Self {
        ShuffleError::IoError(e)
    }
}

impl From<ShuffleError> for DataFusionError {
    fn from(e: ShuffleError) -> Self {
        match e {
            ShuffleError::DataFusionError(e) => *e,
            ShuffleError::IoError(e) => DataFusionError::IoError(e),
            ShuffleError::ResourceExhausted(desc) => {
                DataFusionError::ResourcesExhausted(desc)
            }
            other => DataFusionError::External(Box::new(other)),
        }
    }
}

impl Display for ShuffleError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            ShuffleError::General(desc) => write!(f, "General error: {desc}"),
            ShuffleError::Internal(desc) => {
                write!(f, "Internal shuffle error: {desc}")
            }
            ShuffleError::Configuration(desc) => {
                write!(f, "Configuration error: {desc}")
            }
            ShuffleError::ResourceExhausted(desc) => {
                write!(f, "Resources exhausted: {desc}")
            }
            ShuffleError::OversizedRecord { required, max } => {
                write!(
                    f,
                    "Cannot allocate a page of {required} bytes for a single record, \
                    the maximum page size is {max} bytes"
                )
            }
            ShuffleError::IoError(desc) => write!(f, "IO error: {desc}"),
            ShuffleError::DataFusionError(desc) => {
                write!(f, "DataFusion error: {desc}")
            }
        }
    }
}

impl Error for ShuffleError {}
