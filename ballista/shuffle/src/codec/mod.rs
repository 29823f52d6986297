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

//! Byte-level codecs applied to shuffle segments.
//!
//! Every partition segment is written through a fresh encode pipeline:
//! records are compressed first and the compressed bytes are then
//! encrypted. Reading reverses the order.

mod compression;
mod encryption;
mod serializer;

use std::io::{self, Read, Write};
use std::sync::Arc;

use crate::config::ShuffleWriterConfig;
use crate::error::{Result, ShuffleError};

pub use compression::{compression_codec, CompressionCodec, Lz4Codec, ZlibCodec};
pub use encryption::{EncryptionCodec, Salsa20Encryption};
pub use serializer::{LengthPrefixedSerializer, ShuffleRecord, ShuffleSerializer};

/// A writer that has to emit trailing bytes before its output is complete.
pub trait StreamEncoder: Write + Send {
    /// Writes any pending trailer and flushes into the underlying writer.
    fn finish(self: Box<Self>) -> io::Result<()>;
}

/// Head of an encode pipeline.
pub type EncodeStream<'a> = Box<dyn StreamEncoder + 'a>;
/// Head of a decode pipeline.
pub type DecodeStream<'a> = Box<dyn Read + Send + 'a>;

/// End of every encode pipeline.
struct RawSink<W>(W);

impl<W: Write + Send> Write for RawSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl<W: Write + Send> StreamEncoder for RawSink<W> {
    fn finish(mut self: Box<Self>) -> io::Result<()> {
        self.0.flush()
    }
}

/// Counts the bytes that pass through to the inner writer.
#[derive(Debug)]
pub struct CountingWriter<W> {
    inner: W,
    bytes_written: u64,
}

impl<W: Write> CountingWriter<W> {
    /// Wraps `inner`.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            bytes_written: 0,
        }
    }

    /// Bytes passed to the inner writer so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// The inner writer.
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    /// Unwraps the inner writer.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.bytes_written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// The optional compression and encryption layers of a shuffle.
#[derive(Debug, Clone, Default)]
pub struct CodecPipeline {
    compression: Option<Arc<dyn CompressionCodec>>,
    encryption: Option<Arc<dyn EncryptionCodec>>,
}

impl CodecPipeline {
    /// A pipeline of the given layers. `None` disables a layer.
    pub fn new(
        compression: Option<Arc<dyn CompressionCodec>>,
        encryption: Option<Arc<dyn EncryptionCodec>>,
    ) -> Self {
        Self {
            compression,
            encryption,
        }
    }

    /// Builds the pipeline described by the writer configuration. A fresh
    /// random key is generated when encryption is enabled, so readers must
    /// share this pipeline instance.
    pub fn from_config(config: &ShuffleWriterConfig) -> Self {
        let encryption: Option<Arc<dyn EncryptionCodec>> = if config.encryption_enabled {
            Some(Arc::new(Salsa20Encryption::with_random_key()))
        } else {
            None
        };
        Self::new(compression_codec(config.compression), encryption)
    }

    /// Compression layer, if any.
    pub fn compression(&self) -> Option<&Arc<dyn CompressionCodec>> {
        self.compression.as_ref()
    }

    /// Encryption layer, if any.
    pub fn encryption(&self) -> Option<&Arc<dyn EncryptionCodec>> {
        self.encryption.as_ref()
    }

    /// True when encoded segments can be concatenated byte for byte and
    /// still decode to the concatenation of their contents.
    pub fn supports_concatenation(&self) -> bool {
        self.encryption.is_none()
            && self
                .compression
                .as_ref()
                .is_none_or(|codec| codec.supports_concatenation())
    }

    /// Wraps `out` in encryption and then compression.
    pub fn encode<'a, W: Write + Send + 'a>(&self, out: W) -> Result<EncodeStream<'a>> {
        let mut stream: EncodeStream<'a> = Box::new(RawSink(out));
        if let Some(encryption) = &self.encryption {
            stream = encryption.encryptor(stream)?;
        }
        if let Some(compression) = &self.compression {
            stream = compression.compress(stream)?;
        }
        Ok(stream)
    }

    /// Wraps `input` in decryption and then decompression.
    pub fn decode<'a, R: Read + Send + 'a>(&self, input: R) -> Result<DecodeStream<'a>> {
        let mut stream: DecodeStream<'a> = Box::new(input);
        if let Some(encryption) = &self.encryption {
            stream = encryption.decryptor(stream)?;
        }
        if let Some(compression) = &self.compression {
            stream = compression.decompress(stream)?;
        }
        Ok(stream)
    }

    /// Decodes a region holding one or more concatenated encoded segments.
    pub fn decode_all(&self, region: &[u8]) -> Result<Vec<u8>> {
        let mut remaining = region;
        let mut decoded = Vec::new();
        while !remaining.is_empty() {
            let before = remaining.len();
            let mut decoder = self.decode(&mut remaining)?;
            decoder.read_to_end(&mut decoded)?;
            drop(decoder);
            if remaining.len() == before {
                return Err(ShuffleError::Internal(format!(
                    "Decoder made no progress with {before} bytes left"
                )));
            }
        }
        Ok(decoded)
    }
}
