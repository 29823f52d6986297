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

//! Shuffle write configuration
//!
//! Settings are kept as validated key/value pairs in [`ShuffleConfig`] so
//! they can travel with a DataFusion session, and are resolved into a typed
//! [`ShuffleWriterConfig`] before a writer is created.

use std::collections::HashMap;
use std::result;
use std::sync::LazyLock;

use crate::error::{Result, ShuffleError};

use datafusion::{
    arrow::datatypes::DataType, common::config_err, config::ConfigExtension,
};

/// Size of a regular record page in bytes
pub const SHUFFLE_PAGE_SIZE: &str = "ballista.shuffle.page_size";
/// Number of buffered records that forces a spill regardless of memory
pub const SHUFFLE_SPILL_NUM_ELEMENTS_THRESHOLD: &str =
    "ballista.shuffle.spill_num_elements_threshold";
/// Initial number of slots in the pointer array
pub const SHUFFLE_INITIAL_SORT_BUFFER_SIZE: &str =
    "ballista.shuffle.initial_sort_buffer_size";
/// Buffer used while writing sorted runs to disk
pub const SHUFFLE_DISK_WRITE_BUFFER_SIZE: &str =
    "ballista.shuffle.disk_write_buffer_size";
/// Buffer used by merge and concatenation streams
pub const SHUFFLE_FILE_BUFFER_SIZE: &str = "ballista.shuffle.file_buffer_size";
/// Sort pointers with a radix sort
pub const SHUFFLE_USE_RADIX_SORT: &str = "ballista.shuffle.use_radix_sort";
/// Allow merging runs by concatenation
pub const SHUFFLE_FAST_MERGE_ENABLED: &str = "ballista.shuffle.fast_merge_enabled";
/// Allow kernel file-to-file copies
pub const SHUFFLE_TRANSFER_TO_ENABLED: &str = "ballista.shuffle.transfer_to_enabled";
/// One of `none`, `lz4` or `zlib`
pub const SHUFFLE_COMPRESSION_CODEC: &str = "ballista.shuffle.compression_codec";
/// Encrypt output and spill files
pub const SHUFFLE_ENCRYPTION_ENABLED: &str = "ballista.shuffle.encryption_enabled";
/// Largest partition count for which the bypass writer is chosen
pub const SHUFFLE_BYPASS_MERGE_THRESHOLD: &str =
    "ballista.shuffle.bypass_merge_threshold";
/// Page requests at or above this size are served from the page pool first
pub const SHUFFLE_MEMORY_POOL_THRESHOLD: &str = "ballista.shuffle.memory_pool_threshold";
/// Upper bound on bytes held by the page pool
pub const SHUFFLE_MEMORY_POOL_CAPACITY: &str = "ballista.shuffle.memory_pool_capacity";
/// Zero pages when they are freed
pub const SHUFFLE_ZERO_FREED_PAGES: &str = "ballista.shuffle.zero_freed_pages";

/// Result of parsing a configuration value.
pub type ParseResult<T> = result::Result<T, String>;

static CONFIG_ENTRIES: LazyLock<HashMap<String, ConfigEntry>> = LazyLock::new(|| {
    let entries = vec![
        ConfigEntry::new(SHUFFLE_PAGE_SIZE.to_string(),
                         "Size in bytes of the memory pages that buffer serialized records".to_string(),
                         DataType::UInt64, Some((4 * 1024 * 1024).to_string())),
        ConfigEntry::new(SHUFFLE_SPILL_NUM_ELEMENTS_THRESHOLD.to_string(),
                         "Number of buffered records after which the sorter spills to disk".to_string(),
                         DataType::UInt64, Some(i32::MAX.to_string())),
        ConfigEntry::new(SHUFFLE_INITIAL_SORT_BUFFER_SIZE.to_string(),
                         "Initial number of record pointer slots held by the in-memory sorter".to_string(),
                         DataType::UInt64, Some(4096.to_string())),
        ConfigEntry::new(SHUFFLE_DISK_WRITE_BUFFER_SIZE.to_string(),
                         "Buffer size in bytes used when writing sorted records to disk".to_string(),
                         DataType::UInt64, Some((1024 * 1024).to_string())),
        ConfigEntry::new(SHUFFLE_FILE_BUFFER_SIZE.to_string(),
                         "Buffer size in bytes used when copying shuffle files".to_string(),
                         DataType::UInt64, Some((32 * 1024).to_string())),
        ConfigEntry::new(SHUFFLE_USE_RADIX_SORT.to_string(),
                         "Sort record pointers with a radix sort instead of a comparison sort".to_string(),
                         DataType::Boolean, Some(true.to_string())),
        ConfigEntry::new(SHUFFLE_FAST_MERGE_ENABLED.to_string(),
                         "Merge spill files by raw concatenation when the codecs allow it".to_string(),
                         DataType::Boolean, Some(true.to_string())),
        ConfigEntry::new(SHUFFLE_TRANSFER_TO_ENABLED.to_string(),
                         "Use kernel file-to-file copies when concatenating shuffle files".to_string(),
                         DataType::Boolean, Some(true.to_string())),
        ConfigEntry::new(SHUFFLE_COMPRESSION_CODEC.to_string(),
                         "Compression codec for shuffle output: none, lz4 or zlib".to_string(),
                         DataType::Utf8, Some("lz4".to_string())),
        ConfigEntry::new(SHUFFLE_ENCRYPTION_ENABLED.to_string(),
                         "Encrypt shuffle output and spill files".to_string(),
                         DataType::Boolean, Some(false.to_string())),
        ConfigEntry::new(SHUFFLE_BYPASS_MERGE_THRESHOLD.to_string(),
                         "Use the bypass writer when there are at most this many output partitions".to_string(),
                         DataType::UInt64, Some(200.to_string())),
        ConfigEntry::new(SHUFFLE_MEMORY_POOL_THRESHOLD.to_string(),
                         "Page requests of at least this many bytes are served from the page pool".to_string(),
                         DataType::UInt64, Some((1024 * 1024).to_string())),
        ConfigEntry::new(SHUFFLE_MEMORY_POOL_CAPACITY.to_string(),
                         "Maximum number of bytes retained by the page pool".to_string(),
                         DataType::UInt64, Some((64 * 1024 * 1024).to_string())),
        ConfigEntry::new(SHUFFLE_ZERO_FREED_PAGES.to_string(),
                         "Zero the contents of pages when they are freed".to_string(),
                         DataType::Boolean, Some(false.to_string())),
    ];
    entries
        .into_iter()
        .map(|e| (e.name.clone(), e))
        .collect::<HashMap<_, _>>()
});

/// Configuration option meta-data
#[derive(Debug, Clone)]
pub struct ConfigEntry {
    name: String,
    description: String,
    data_type: DataType,
    default_value: Option<String>,
}

impl ConfigEntry {
    fn new(
        name: String,
        description: String,
        data_type: DataType,
        default_value: Option<String>,
    ) -> Self {
        Self {
            name,
            description,
            data_type,
            default_value,
        }
    }
}

/// Shuffle configuration as validated key/value settings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShuffleConfig {
    /// Settings stored in map for easy serde
    settings: HashMap<String, String>,
}

impl ShuffleConfig {
    /// Create a new configuration based on key-value pairs
    pub fn with_settings(settings: HashMap<String, String>) -> Result<Self> {
        for name in settings.keys() {
            if !Self::valid_entries().contains_key(name) {
                return Err(ShuffleError::Configuration(format!(
                    "Unknown shuffle configuration setting '{name}'"
                )));
            }
        }
        for (name, entry) in Self::valid_entries() {
            if let Some(v) = settings.get(name) {
                // validate that we can parse the user-supplied value
                Self::parse_value(v.as_str(), entry.data_type.clone()).map_err(|e| ShuffleError::Configuration(format!("Failed to parse user-supplied value '{v}' for configuration setting '{name}': {e}")))?;
            } else if let Some(v) = entry.default_value.clone() {
                Self::parse_value(v.as_str(), entry.data_type.clone()).map_err(|e| ShuffleError::Configuration(format!("Failed to parse default value '{v}' for configuration setting '{name}': {e}")))?;
            }
        }

        Ok(Self { settings })
    }

    /// Checks that `val` parses as `data_type`.
    pub fn parse_value(val: &str, data_type: DataType) -> ParseResult<()> {
        match data_type {
            DataType::UInt64 => {
                val.parse::<usize>().map_err(|e| format!("{e:?}"))?;
            }
            DataType::Boolean => {
                val.parse::<bool>().map_err(|e| format!("{e:?}"))?;
            }
            DataType::Utf8 => {}
            _ => {
                return Err(format!("not support data type: {data_type}"));
            }
        }

        Ok(())
    }

    /// All available configuration options
    pub fn valid_entries() -> &'static HashMap<String, ConfigEntry> {
        &CONFIG_ENTRIES
    }

    /// Settings supplied by the user.
    pub fn settings(&self) -> &HashMap<String, String> {
        &self.settings
    }

    fn raw_setting(&self, key: &str) -> Result<&str> {
        self.settings
            .get(key)
            .or_else(|| {
                Self::valid_entries()
                    .get(key)
                    .and_then(|e| e.default_value.as_ref())
            })
            .map(|v| v.as_str())
            .ok_or_else(|| {
                ShuffleError::Configuration(format!(
                    "No value specified for configuration setting '{key}'"
                ))
            })
    }

    fn get_usize_setting(&self, key: &str) -> Result<usize> {
        let v = self.raw_setting(key)?;
        v.parse().map_err(|e| {
            ShuffleError::Configuration(format!("Invalid value '{v}' for '{key}': {e}"))
        })
    }

    fn get_bool_setting(&self, key: &str) -> Result<bool> {
        let v = self.raw_setting(key)?;
        v.parse().map_err(|e| {
            ShuffleError::Configuration(format!("Invalid value '{v}' for '{key}': {e}"))
        })
    }

    fn get_string_setting(&self, key: &str) -> Result<String> {
        self.raw_setting(key).map(|v| v.to_string())
    }
}

impl datafusion::config::ExtensionOptions for ShuffleConfig {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }

    fn cloned(&self) -> Box<dyn datafusion::config::ExtensionOptions> {
        Box::new(self.clone())
    }

    fn set(&mut self, key: &str, value: &str) -> datafusion::error::Result<()> {
        let entries = Self::valid_entries();
        let k = format!("{}.{key}", ShuffleConfig::PREFIX);

        match entries.get(&k) {
            Some(entry) => {
                if let Err(e) = Self::parse_value(value, entry.data_type.clone()) {
                    return config_err!("invalid value `{}` for `{}`: {}", value, key, e);
                }
                self.settings.insert(k, value.to_string());
                Ok(())
            }
            None => config_err!("configuration key `{}` does not exist", key),
        }
    }

    fn entries(&self) -> Vec<datafusion::config::ConfigEntry> {
        Self::valid_entries()
            .iter()
            .map(|(key, value)| datafusion::config::ConfigEntry {
                key: key.clone(),
                value: self
                    .settings
                    .get(key)
                    .cloned()
                    .or(value.default_value.clone()),
                description: &value.description,
            })
            .collect()
    }
}

impl ConfigExtension for ShuffleConfig {
    const PREFIX: &'static str = "ballista";
}

/// Compression applied to every partition segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionKind {
    /// Segments are stored as written
    None,
    /// LZ4 frames, which concatenate cleanly
    #[default]
    Lz4,
    /// Zlib streams
    Zlib,
}

impl std::str::FromStr for CompressionKind {
    type Err = ShuffleError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(CompressionKind::None),
            "lz4" => Ok(CompressionKind::Lz4),
            "zlib" => Ok(CompressionKind::Zlib),
            other => Err(ShuffleError::Configuration(format!(
                "Unsupported shuffle compression codec '{other}'"
            ))),
        }
    }
}

/// Typed settings consumed by the shuffle writers.
#[derive(Debug, Clone)]
pub struct ShuffleWriterConfig {
    /// Size of a regular record page (default: 4MB)
    pub page_size: usize,
    /// Buffered record count that forces a spill (default: i32::MAX)
    pub spill_num_elements_threshold: usize,
    /// Initial pointer array slots (default: 4096)
    pub initial_sort_buffer_size: usize,
    /// Buffer used while writing sorted runs (default: 1MB)
    pub disk_write_buffer_size: usize,
    /// Buffer used when copying files (default: 32KB)
    pub file_buffer_size: usize,
    pub use_radix_sort: bool,
    /// Concatenate runs without decoding when the codecs allow it
    pub fast_merge_enabled: bool,
    /// Copy files with kernel copies
    pub transfer_to_enabled: bool,
    /// Codec for every partition segment
    pub compression: CompressionKind,
    /// Encrypt output and spill files
    pub encryption_enabled: bool,
    /// Largest partition count that selects the bypass writer (default: 200)
    pub bypass_merge_threshold: usize,
    /// Page requests at or above this size are pooled (default: 1MB)
    pub memory_pool_threshold: usize,
    /// Bytes the page pool may retain (default: 64MB)
    pub memory_pool_capacity: usize,
    /// Zero page contents when pages are freed
    pub zero_freed_pages: bool,
}

impl Default for ShuffleWriterConfig {
    fn default() -> Self {
        Self {
            page_size: 4 * 1024 * 1024,           // 4 MB
            spill_num_elements_threshold: i32::MAX as usize,
            initial_sort_buffer_size: 4096,
            disk_write_buffer_size: 1024 * 1024,  // 1 MB
            file_buffer_size: 32 * 1024,          // 32 KB
            use_radix_sort: true,
            fast_merge_enabled: true,
            transfer_to_enabled: true,
            compression: CompressionKind::Lz4,
            encryption_enabled: false,
            bypass_merge_threshold: 200,
            memory_pool_threshold: 1024 * 1024,   // 1 MB
            memory_pool_capacity: 64 * 1024 * 1024, // 64 MB
            zero_freed_pages: false,
        }
    }
}

impl ShuffleWriterConfig {
    /// Resolves typed settings from a key/value configuration.
    pub fn from_config(config: &ShuffleConfig) -> Result<Self> {
        let resolved = Self {
            page_size: config.get_usize_setting(SHUFFLE_PAGE_SIZE)?,
            spill_num_elements_threshold: config
                .get_usize_setting(SHUFFLE_SPILL_NUM_ELEMENTS_THRESHOLD)?,
            initial_sort_buffer_size: config
                .get_usize_setting(SHUFFLE_INITIAL_SORT_BUFFER_SIZE)?,
            disk_write_buffer_size: config
                .get_usize_setting(SHUFFLE_DISK_WRITE_BUFFER_SIZE)?,
            file_buffer_size: config.get_usize_setting(SHUFFLE_FILE_BUFFER_SIZE)?,
            use_radix_sort: config.get_bool_setting(SHUFFLE_USE_RADIX_SORT)?,
            fast_merge_enabled: config.get_bool_setting(SHUFFLE_FAST_MERGE_ENABLED)?,
            transfer_to_enabled: config.get_bool_setting(SHUFFLE_TRANSFER_TO_ENABLED)?,
            compression: config
                .get_string_setting(SHUFFLE_COMPRESSION_CODEC)?
                .parse()?,
            encryption_enabled: config.get_bool_setting(SHUFFLE_ENCRYPTION_ENABLED)?,
            bypass_merge_threshold: config
                .get_usize_setting(SHUFFLE_BYPASS_MERGE_THRESHOLD)?,
            memory_pool_threshold: config
                .get_usize_setting(SHUFFLE_MEMORY_POOL_THRESHOLD)?,
            memory_pool_capacity: config
                .get_usize_setting(SHUFFLE_MEMORY_POOL_CAPACITY)?,
            zero_freed_pages: config.get_bool_setting(SHUFFLE_ZERO_FREED_PAGES)?,
        };
        resolved.validate()?;
        Ok(resolved)
    }

    /// Checks the settings the engine cannot work without.
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 || self.page_size > crate::memory::MAX_PAGE_SIZE {
            return Err(ShuffleError::Configuration(format!(
                "page_size must be between 1 and {} bytes, got {}",
                crate::memory::MAX_PAGE_SIZE,
                self.page_size
            )));
        }
        if self.initial_sort_buffer_size < 4 {
            return Err(ShuffleError::Configuration(format!(
                "initial_sort_buffer_size must be at least 4, got {}",
                self.initial_sort_buffer_size
            )));
        }
        if self.spill_num_elements_threshold == 0 {
            return Err(ShuffleError::Configuration(
                "spill_num_elements_threshold must be positive".to_string(),
            ));
        }
        if self.disk_write_buffer_size == 0 || self.file_buffer_size == 0 {
            return Err(ShuffleError::Configuration(
                "buffer sizes must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
