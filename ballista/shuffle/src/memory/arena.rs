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

//! Page arena for buffered shuffle records.
//!
//! Records are appended into fixed-capacity pages that live in a page table
//! owned by one [`PageArena`] per task. Records are addressed by
//! `(page_number, offset)` pairs, never by raw addresses.
//!
//! Large pages are recycled through a bounded pool keyed by page size. The
//! pool evicts its least recently freed page when it would exceed its byte
//! capacity, so reuse is deterministic.

use std::collections::{BTreeMap, HashMap, VecDeque};

use log::debug;
use uuid::Uuid;

use crate::config::ShuffleWriterConfig;
use crate::error::{Result, ShuffleError};

/// Number of bits available to address a page in the page table.
pub const PAGE_NUMBER_BITS: u32 = 13;
/// Maximum number of live pages per arena.
pub const MAX_PAGES: usize = 1 << PAGE_NUMBER_BITS;
/// Number of bits available for an in-page offset.
pub const OFFSET_BITS: u32 = 27;
/// Largest page an arena hands out (128MB).
pub const MAX_PAGE_SIZE: usize = 1 << OFFSET_BITS;
/// Page sizes are rounded up to this alignment.
pub const PAGE_ALIGNMENT: usize = 8;
/// Every buffered record is prefixed by its length as a little-endian u32.
pub const RECORD_HEADER_SIZE: usize = 4;

/// Page number written into a page when it leaves the page table.
const FREED_PAGE_NUMBER: usize = usize::MAX;

/// Rounds `size` up to [`PAGE_ALIGNMENT`].
pub fn align_size(size: usize) -> usize {
    size.div_ceil(PAGE_ALIGNMENT) * PAGE_ALIGNMENT
}

/// Identifies a live page of a specific arena.
///
/// The generation tells apart successive pages stored in the same page table
/// slot, so a handle kept past `free` is rejected instead of aliasing a
/// newer page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageHandle {
    arena_id: Uuid,
    page_number: usize,
    generation: u64,
}

impl PageHandle {
    /// Slot of the page in its arena's page table.
    pub fn page_number(&self) -> usize {
        self.page_number
    }
}

/// A contiguous byte region with a write cursor.
#[derive(Debug)]
pub struct MemoryPage {
    data: Vec<u8>,
    cursor: usize,
    page_number: usize,
    generation: u64,
    dedicated: bool,
}

impl MemoryPage {
    /// Size of the page in bytes.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Offset of the next append.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Bytes still free after the cursor.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.cursor
    }

    /// True for pages sized to a single oversized record.
    pub fn is_dedicated(&self) -> bool {
        self.dedicated
    }

    /// True once the page left the page table.
    pub fn is_freed(&self) -> bool {
        self.page_number == FREED_PAGE_NUMBER
    }

    /// Appends a length header and `payload` at the cursor, returning the
    /// offset of the header.
    pub fn append_record(&mut self, payload: &[u8]) -> Result<usize> {
        let required = RECORD_HEADER_SIZE + payload.len();
        if required > self.remaining() {
            return Err(ShuffleError::Internal(format!(
                "Record of {required} bytes does not fit page {} with {} bytes remaining",
                self.page_number,
                self.remaining()
            )));
        }
        let len = u32::try_from(payload.len()).map_err(|_| {
            ShuffleError::Internal(format!(
                "Record length {} does not fit the length header",
                payload.len()
            ))
        })?;
        let offset = self.cursor;
        self.data[offset..offset + RECORD_HEADER_SIZE].copy_from_slice(&len.to_le_bytes());
        self.data[offset + RECORD_HEADER_SIZE..offset + required].copy_from_slice(payload);
        self.cursor += required;
        Ok(offset)
    }

    /// Returns the payload of the record whose header starts at `offset`.
    pub fn record_at(&self, offset: usize) -> Result<&[u8]> {
        let header = self
            .data
            .get(offset..offset + RECORD_HEADER_SIZE)
            .and_then(|h| <[u8; RECORD_HEADER_SIZE]>::try_from(h).ok())
            .ok_or_else(|| {
                ShuffleError::Internal(format!(
                    "Offset {offset} is outside page {}",
                    self.page_number
                ))
            })?;
        let start = offset + RECORD_HEADER_SIZE;
        let end = start + u32::from_le_bytes(header) as usize;
        if end > self.cursor {
            return Err(ShuffleError::Internal(format!(
                "Record at offset {offset} runs past the written end of page {}",
                self.page_number
            )));
        }
        Ok(&self.data[start..end])
    }
}

/// Arena settings.
#[derive(Debug, Clone)]
pub struct ArenaConfig {
    /// Pages at least this large are recycled through the pool
    pub pooling_threshold: usize,
    /// Bytes the pool may retain before evicting
    pub pool_capacity: usize,
    /// Zero page contents when they are freed
    pub zero_freed_pages: bool,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            pooling_threshold: 1024 * 1024,
            pool_capacity: 64 * 1024 * 1024,
            zero_freed_pages: false,
        }
    }
}

impl From<&ShuffleWriterConfig> for ArenaConfig {
    fn from(config: &ShuffleWriterConfig) -> Self {
        Self {
            pooling_threshold: config.memory_pool_threshold,
            pool_capacity: config.memory_pool_capacity,
            zero_freed_pages: config.zero_freed_pages,
        }
    }
}

/// Size-bucketed free list with LRU eviction under a byte cap.
#[derive(Debug, Default)]
struct PagePool {
    /// size -> buffers, oldest first
    buckets: HashMap<usize, VecDeque<(u64, Vec<u8>)>>,
    /// stamp -> size, oldest first
    recency: BTreeMap<u64, usize>,
    pooled_bytes: usize,
    capacity: usize,
    clock: u64,
}

impl PagePool {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ..Default::default()
        }
    }

    fn take(&mut self, size: usize) -> Option<Vec<u8>> {
        let bucket = self.buckets.get_mut(&size)?;
        let (stamp, buffer) = bucket.pop_back()?;
        if bucket.is_empty() {
            self.buckets.remove(&size);
        }
        self.recency.remove(&stamp);
        self.pooled_bytes -= size;
        Some(buffer)
    }

    /// Returns false when the buffer is larger than the whole pool.
    fn put(&mut self, buffer: Vec<u8>) -> bool {
        let size = buffer.len();
        if size > self.capacity {
            return false;
        }
        while self.pooled_bytes + size > self.capacity {
            if !self.evict_oldest() {
                break;
            }
        }
        self.clock += 1;
        self.buckets
            .entry(size)
            .or_default()
            .push_back((self.clock, buffer));
        self.recency.insert(self.clock, size);
        self.pooled_bytes += size;
        true
    }

    fn evict_oldest(&mut self) -> bool {
        let Some((_, size)) = self.recency.pop_first() else {
            return false;
        };
        if let Some(bucket) = self.buckets.get_mut(&size) {
            // stamps grow monotonically, so the oldest entry of the bucket
            // is the globally oldest one
            if bucket.pop_front().is_some() {
                self.pooled_bytes -= size;
            }
            if bucket.is_empty() {
                self.buckets.remove(&size);
            }
        }
        true
    }

    fn clear(&mut self) {
        self.buckets.clear();
        self.recency.clear();
        self.pooled_bytes = 0;
    }
}

/// Allocates, pools and frees the memory pages of one task.
#[derive(Debug)]
pub struct PageArena {
    id: Uuid,
    config: ArenaConfig,
    /// Page table, indexed by page number
    pages: Vec<Option<MemoryPage>>,
    free_slots: Vec<usize>,
    next_generation: u64,
    pool: PagePool,
    allocated_bytes: usize,
    pool_hits: usize,
}

impl PageArena {
    /// An empty arena with a fresh id.
    pub fn new(config: ArenaConfig) -> Self {
        let pool = PagePool::new(config.pool_capacity);
        Self {
            id: Uuid::new_v4(),
            config,
            pages: Vec::new(),
            free_slots: Vec::new(),
            next_generation: 0,
            pool,
            allocated_bytes: 0,
            pool_hits: 0,
        }
    }

    /// Allocates a page of at least `size` bytes.
    pub fn allocate(&mut self, size: usize) -> Result<PageHandle> {
        self.allocate_page(size, false)
    }

    /// Allocates a page for a single record that does not fit a regular
    /// page. Dedicated pages never go through the pool.
    pub fn allocate_dedicated(&mut self, size: usize) -> Result<PageHandle> {
        self.allocate_page(size, true)
    }

    fn allocate_page(&mut self, size: usize, dedicated: bool) -> Result<PageHandle> {
        let size = align_size(size);
        if size == 0 || size > MAX_PAGE_SIZE {
            return Err(ShuffleError::Internal(format!(
                "Cannot allocate a page of {size} bytes, pages must hold 1 to {MAX_PAGE_SIZE} bytes"
            )));
        }
        let page_number = self.next_page_slot()?;

        let pooled = if !dedicated && size >= self.config.pooling_threshold {
            self.pool.take(size)
        } else {
            None
        };
        let data = match pooled {
            Some(buffer) => {
                self.pool_hits += 1;
                buffer
            }
            None => vec![0u8; size],
        };

        self.next_generation += 1;
        let generation = self.next_generation;
        self.pages[page_number] = Some(MemoryPage {
            data,
            cursor: 0,
            page_number,
            generation,
            dedicated,
        });
        self.allocated_bytes += size;

        Ok(PageHandle {
            arena_id: self.id,
            page_number,
            generation,
        })
    }

    fn next_page_slot(&mut self) -> Result<usize> {
        if let Some(slot) = self.free_slots.pop() {
            return Ok(slot);
        }
        if self.pages.len() >= MAX_PAGES {
            return Err(ShuffleError::ResourceExhausted(format!(
                "Have already allocated a maximum of {MAX_PAGES} pages"
            )));
        }
        self.pages.push(None);
        Ok(self.pages.len() - 1)
    }

    /// Frees a page, returning its capacity in bytes.
    ///
    /// Freeing a page of another arena, or a page that was already freed,
    /// is an [`ShuffleError::Internal`] error.
    pub fn free(&mut self, handle: PageHandle) -> Result<usize> {
        if handle.arena_id != self.id {
            return Err(ShuffleError::Internal(format!(
                "Page {} was not allocated by arena {}",
                handle.page_number, self.id
            )));
        }
        let slot = self.pages.get_mut(handle.page_number).ok_or_else(|| {
            ShuffleError::Internal(format!(
                "Page number {} is outside the page table",
                handle.page_number
            ))
        })?;
        let live = matches!(slot, Some(page) if page.generation == handle.generation);
        let Some(mut page) = (if live { slot.take() } else { None }) else {
            return Err(ShuffleError::Internal(format!(
                "Page {} has already been freed",
                handle.page_number
            )));
        };

        page.page_number = FREED_PAGE_NUMBER;
        self.free_slots.push(handle.page_number);
        let capacity = page.capacity();
        self.allocated_bytes -= capacity;

        if self.config.zero_freed_pages {
            page.data.fill(0);
        }
        if !page.dedicated
            && capacity >= self.config.pooling_threshold
            && !self.pool.put(page.data)
        {
            debug!("Page of {capacity} bytes exceeds the page pool capacity, dropping it");
        }
        Ok(capacity)
    }

    /// Looks up a live page.
    pub fn page(&self, handle: &PageHandle) -> Result<&MemoryPage> {
        self.live_page(handle)?;
        self.lookup(handle.page_number)
    }

    /// Looks up a live page for appending.
    pub fn page_mut(&mut self, handle: &PageHandle) -> Result<&mut MemoryPage> {
        self.live_page(handle)?;
        self.pages
            .get_mut(handle.page_number)
            .and_then(|p| p.as_mut())
            .ok_or_else(|| {
                ShuffleError::Internal(format!("Page {} is not live", handle.page_number))
            })
    }

    fn live_page(&self, handle: &PageHandle) -> Result<()> {
        let page = self.lookup(handle.page_number)?;
        if handle.arena_id != self.id || page.generation != handle.generation {
            return Err(ShuffleError::Internal(format!(
                "Stale handle for page {}",
                handle.page_number
            )));
        }
        Ok(())
    }

    fn lookup(&self, page_number: usize) -> Result<&MemoryPage> {
        self.pages
            .get(page_number)
            .and_then(|p| p.as_ref())
            .ok_or_else(|| {
                ShuffleError::Internal(format!("Page {page_number} is not live"))
            })
    }

    /// Reads the record stored at `(page_number, offset)`.
    pub fn record(&self, page_number: usize, offset: usize) -> Result<&[u8]> {
        self.lookup(page_number)?.record_at(offset)
    }

    /// Drops every live page and empties the pool. Returns the bytes that
    /// were still allocated.
    pub fn release_all(&mut self) -> usize {
        let released = self.allocated_bytes;
        self.pages.clear();
        self.free_slots.clear();
        self.pool.clear();
        self.allocated_bytes = 0;
        released
    }

    /// Identity checked against every handle.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Bytes held by live pages.
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes
    }

    /// Number of pages in the page table.
    pub fn live_pages(&self) -> usize {
        self.pages.iter().filter(|p| p.is_some()).count()
    }

    /// Bytes held by the page pool.
    pub fn pooled_bytes(&self) -> usize {
        self.pool.pooled_bytes
    }

    /// Number of allocations served from the pool.
    pub fn pool_hits(&self) -> usize {
        self.pool_hits
    }
}
