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

//! Stream encryption for shuffle segments.
//!
//! Each encrypted segment starts with a random 8 byte nonce followed by the
//! Salsa20 keystream applied to the payload. An empty segment stays empty.

use std::fmt::{Debug, Formatter};
use std::io::{self, Read, Write};

use cipher::{KeyIvInit, StreamCipher};
use salsa20::Salsa20;

use super::{DecodeStream, EncodeStream, StreamEncoder};
use crate::error::Result;

const NONCE_SIZE: usize = 8;

/// Encrypts and decrypts segment streams.
pub trait EncryptionCodec: Debug + Send + Sync {
    /// Encrypts everything written into `out`.
    fn encryptor<'a>(&self, out: EncodeStream<'a>) -> Result<EncodeStream<'a>>;

    /// Decrypts `input`.
    fn decryptor<'a>(&self, input: DecodeStream<'a>) -> Result<DecodeStream<'a>>;
}

/// Salsa20 with a 256-bit key and a fresh nonce per segment.
#[derive(Clone)]
pub struct Salsa20Encryption {
    key: [u8; 32],
}

impl Debug for Salsa20Encryption {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Salsa20Encryption").finish_non_exhaustive()
    }
}

impl Salsa20Encryption {
    /// Uses `key` for every segment.
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Uses a key from the operating system's random source.
    pub fn with_random_key() -> Self {
        Self::new(rand::random())
    }
}

impl EncryptionCodec for Salsa20Encryption {
    fn encryptor<'a>(&self, out: EncodeStream<'a>) -> Result<EncodeStream<'a>> {
        Ok(Box::new(EncryptWriter {
            inner: out,
            key: self.key,
            cipher: None,
            buffer: Vec::new(),
        }))
    }

    fn decryptor<'a>(&self, input: DecodeStream<'a>) -> Result<DecodeStream<'a>> {
        Ok(Box::new(DecryptReader {
            inner: input,
            key: self.key,
            cipher: None,
        }))
    }
}

struct EncryptWriter<'a> {
    inner: EncodeStream<'a>,
    key: [u8; 32],
    /// Created with the nonce on the first non-empty write
    cipher: Option<Salsa20>,
    buffer: Vec<u8>,
}

impl Write for EncryptWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.cipher.is_none() {
            let nonce: [u8; NONCE_SIZE] = rand::random();
            self.inner.write_all(&nonce)?;
            self.cipher = Some(Salsa20::new(&self.key.into(), &nonce.into()));
        }
        self.buffer.clear();
        self.buffer.extend_from_slice(buf);
        if let Some(cipher) = &mut self.cipher {
            cipher.apply_keystream(&mut self.buffer);
        }
        self.inner.write_all(&self.buffer)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl StreamEncoder for EncryptWriter<'_> {
    fn finish(self: Box<Self>) -> io::Result<()> {
        self.inner.finish()
    }
}

struct DecryptReader<'a> {
    inner: DecodeStream<'a>,
    key: [u8; 32],
    cipher: Option<Salsa20>,
}

impl DecryptReader<'_> {
    /// Reads the nonce. Returns false on an empty segment.
    fn init(&mut self) -> io::Result<bool> {
        let mut nonce = [0u8; NONCE_SIZE];
        let mut filled = 0;
        while filled < NONCE_SIZE {
            let n = self.inner.read(&mut nonce[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        match filled {
            0 => Ok(false),
            NONCE_SIZE => {
                self.cipher = Some(Salsa20::new(&self.key.into(), &nonce.into()));
                Ok(true)
            }
            _ => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "truncated encryption nonce",
            )),
        }
    }
}

impl Read for DecryptReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cipher.is_none() && !self.init()? {
            return Ok(0);
        }
        let n = self.inner.read(buf)?;
        if let Some(cipher) = &mut self.cipher {
            cipher.apply_keystream(&mut buf[..n]);
        }
        Ok(n)
    }
}
