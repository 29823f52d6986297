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

//! Compression codecs for shuffle segments.

use std::fmt::Debug;
use std::io::{self, Write};
use std::sync::Arc;

use flate2::Compression;
use lz4_flex::frame::{FrameDecoder, FrameEncoder};

use super::{DecodeStream, EncodeStream, StreamEncoder};
use crate::config::CompressionKind;
use crate::error::Result;

/// A compression codec applied independently to every partition segment.
pub trait CompressionCodec: Debug + Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// True when independently compressed segments, concatenated byte for
    /// byte, decompress to the concatenation of their inputs.
    fn supports_concatenation(&self) -> bool;

    /// Compresses everything written into `out`.
    fn compress<'a>(&self, out: EncodeStream<'a>) -> Result<EncodeStream<'a>>;

    /// Decompresses `input`.
    fn decompress<'a>(&self, input: DecodeStream<'a>) -> Result<DecodeStream<'a>>;
}

/// Returns the codec for `kind`, or `None` when compression is disabled.
pub fn compression_codec(kind: CompressionKind) -> Option<Arc<dyn CompressionCodec>> {
    match kind {
        CompressionKind::None => None,
        CompressionKind::Lz4 => Some(Arc::new(Lz4Codec)),
        CompressionKind::Zlib => Some(Arc::new(ZlibCodec::default())),
    }
}

/// LZ4 frame format. Frames can be concatenated.
#[derive(Debug, Clone, Copy, Default)]
pub struct Lz4Codec;

struct Lz4Encoder<'a>(FrameEncoder<EncodeStream<'a>>);

impl Write for Lz4Encoder<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl StreamEncoder for Lz4Encoder<'_> {
    fn finish(self: Box<Self>) -> io::Result<()> {
        let inner = self.0.finish().map_err(io::Error::other)?;
        inner.finish()
    }
}

impl CompressionCodec for Lz4Codec {
    fn name(&self) -> &'static str {
        "lz4"
    }

    fn supports_concatenation(&self) -> bool {
        true
    }

    fn compress<'a>(&self, out: EncodeStream<'a>) -> Result<EncodeStream<'a>> {
        Ok(Box::new(Lz4Encoder(FrameEncoder::new(out))))
    }

    fn decompress<'a>(&self, input: DecodeStream<'a>) -> Result<DecodeStream<'a>> {
        Ok(Box::new(FrameDecoder::new(input)))
    }
}

/// zlib streams. A decoder stops at the end of the first stream, so
/// segments cannot be concatenated.
#[derive(Debug, Clone, Copy)]
pub struct ZlibCodec {
    level: Compression,
}

impl Default for ZlibCodec {
    fn default() -> Self {
        Self {
            level: Compression::fast(),
        }
    }
}

impl ZlibCodec {
    /// Zlib at compression `level` (0 to 9).
    pub fn new(level: u32) -> Self {
        Self {
            level: Compression::new(level),
        }
    }
}

struct ZlibEncoder<'a>(flate2::write::ZlibEncoder<EncodeStream<'a>>);

impl Write for ZlibEncoder<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl StreamEncoder for ZlibEncoder<'_> {
    fn finish(self: Box<Self>) -> io::Result<()> {
        self.0.finish()?.finish()
    }
}

impl CompressionCodec for ZlibCodec {
    fn name(&self) -> &'static str {
        "zlib"
    }

    fn supports_concatenation(&self) -> bool {
        false
    }

    fn compress<'a>(&self, out: EncodeStream<'a>) -> Result<EncodeStream<'a>> {
        Ok(Box::new(ZlibEncoder(flate2::write::ZlibEncoder::new(
            out, self.level,
        ))))
    }

    fn decompress<'a>(&self, input: DecodeStream<'a>) -> Result<DecodeStream<'a>> {
        Ok(Box::new(flate2::read::ZlibDecoder::new(input)))
    }
}
