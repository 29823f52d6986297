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

//! Task-level memory accounting.
//!
//! Every consumer of a task holds a DataFusion [`MemoryReservation`]. When a
//! reservation cannot grow, the manager asks the other registered consumers
//! to spill before giving up. The requesting consumer is never called back:
//! it is busy on the task thread and spills itself when a request is denied.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use datafusion::execution::memory_pool::{MemoryConsumer, MemoryPool, MemoryReservation};
use log::debug;
use parking_lot::Mutex;

use crate::error::{Result, ShuffleError};

/// Identifies a consumer registered with a [`TaskMemoryManager`].
pub type ConsumerId = usize;

/// A memory consumer that can release memory by writing its state to disk.
pub trait Spillable: Send {
    /// Spills buffered data to release at least `size` bytes, returning the
    /// bytes actually released.
    ///
    /// `trigger` is the consumer whose allocation caused the request. Must
    /// be a no-op returning 0 when there is nothing to release.
    fn spill(&mut self, size: usize, trigger: ConsumerId) -> Result<usize>;
}

struct ConsumerEntry {
    name: String,
    reservation: MemoryReservation,
    spillable: Option<Weak<Mutex<dyn Spillable>>>,
}

/// Grants and releases memory for the consumers of one task.
pub struct TaskMemoryManager {
    pool: Arc<dyn MemoryPool>,
    consumers: Mutex<HashMap<ConsumerId, ConsumerEntry>>,
    next_consumer_id: AtomicUsize,
    peak_memory_used: AtomicUsize,
}

impl std::fmt::Debug for TaskMemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskMemoryManager")
            .field("pool", &self.pool)
            .field("memory_used", &self.total_memory_used())
            .field("peak_memory_used", &self.peak_memory_used())
            .finish()
    }
}

impl TaskMemoryManager {
    /// Creates a manager drawing from `pool`.
    pub fn new(pool: Arc<dyn MemoryPool>) -> Self {
        Self {
            pool,
            consumers: Mutex::new(HashMap::new()),
            next_consumer_id: AtomicUsize::new(0),
            peak_memory_used: AtomicUsize::new(0),
        }
    }

    /// Pool every reservation draws from.
    pub fn pool(&self) -> &Arc<dyn MemoryPool> {
        &self.pool
    }

    /// Registers a consumer with an empty reservation.
    pub fn register_consumer(&self, name: &str) -> ConsumerId {
        let id = self.next_consumer_id.fetch_add(1, Ordering::Relaxed);
        let reservation = MemoryConsumer::new(format!("{name}[{id}]"))
            .with_can_spill(true)
            .register(&self.pool);
        self.consumers.lock().insert(
            id,
            ConsumerEntry {
                name: name.to_string(),
                reservation,
                spillable: None,
            },
        );
        id
    }

    /// Makes a registered consumer eligible for spill requests from the
    /// other consumers of the task.
    pub fn attach_spillable<S: Spillable + 'static>(
        &self,
        id: ConsumerId,
        consumer: &Arc<Mutex<S>>,
    ) -> Result<()> {
        let consumer: Arc<Mutex<dyn Spillable>> = consumer.clone();
        let mut consumers = self.consumers.lock();
        let entry = consumers.get_mut(&id).ok_or_else(|| unknown_consumer(id))?;
        entry.spillable = Some(Arc::downgrade(&consumer));
        Ok(())
    }

    /// Drops the consumer's reservation, returning what it still held.
    pub fn unregister_consumer(&self, id: ConsumerId) -> usize {
        match self.consumers.lock().remove(&id) {
            Some(mut entry) => entry.reservation.free(),
            None => 0,
        }
    }

    /// Tries to reserve `bytes` for `requester`.
    ///
    /// When the pool refuses, the other spillable consumers are asked to
    /// spill, largest first, until the request fits. Returns false if the
    /// request still cannot be granted; the caller is expected to spill
    /// itself and retry.
    pub fn try_acquire(&self, requester: ConsumerId, bytes: usize) -> Result<bool> {
        if bytes == 0 || self.try_grow(requester, bytes)? {
            return Ok(true);
        }

        for (id, name, consumer) in self.spill_candidates(requester) {
            // a consumer that is locked is running on the task thread right now
            let Some(mut guard) = consumer.try_lock() else {
                continue;
            };
            let released = guard.spill(bytes, requester)?;
            drop(guard);
            if released > 0 {
                debug!(
                    "Consumer {name}[{id}] released {released} bytes for consumer {requester}"
                );
                if self.try_grow(requester, bytes)? {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    fn try_grow(&self, requester: ConsumerId, bytes: usize) -> Result<bool> {
        let mut consumers = self.consumers.lock();
        let entry = consumers
            .get_mut(&requester)
            .ok_or_else(|| unknown_consumer(requester))?;
        if entry.reservation.try_grow(bytes).is_err() {
            return Ok(false);
        }
        let used = consumers.values().map(|c| c.reservation.size()).sum();
        self.peak_memory_used.fetch_max(used, Ordering::Relaxed);
        Ok(true)
    }

    fn spill_candidates(
        &self,
        requester: ConsumerId,
    ) -> Vec<(ConsumerId, String, Arc<Mutex<dyn Spillable>>)> {
        let consumers = self.consumers.lock();
        let mut candidates = consumers
            .iter()
            .filter(|(id, _)| **id != requester)
            .filter_map(|(id, entry)| {
                let consumer = entry.spillable.as_ref()?.upgrade()?;
                Some((entry.reservation.size(), *id, entry.name.clone(), consumer))
            })
            .collect::<Vec<_>>();
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        candidates
            .into_iter()
            .map(|(_, id, name, consumer)| (id, name, consumer))
            .collect()
    }

    /// Returns up to `bytes` of the consumer's reservation to the pool.
    pub fn release(&self, id: ConsumerId, bytes: usize) {
        if let Some(entry) = self.consumers.lock().get_mut(&id) {
            let bytes = bytes.min(entry.reservation.size());
            entry.reservation.shrink(bytes);
        }
    }

    /// Returns the consumer's whole reservation to the pool.
    pub fn release_all(&self, id: ConsumerId) -> usize {
        self.consumers
            .lock()
            .get_mut(&id)
            .map(|entry| entry.reservation.free())
            .unwrap_or(0)
    }

    /// Bytes currently reserved by consumer `id`.
    pub fn memory_used(&self, id: ConsumerId) -> usize {
        self.consumers
            .lock()
            .get(&id)
            .map(|entry| entry.reservation.size())
            .unwrap_or(0)
    }

    /// Bytes reserved by all consumers of the task.
    pub fn total_memory_used(&self) -> usize {
        self.consumers
            .lock()
            .values()
            .map(|entry| entry.reservation.size())
            .sum()
    }

    /// Highest combined reservation of the task's consumers.
    pub fn peak_memory_used(&self) -> usize {
        self.peak_memory_used.load(Ordering::Relaxed)
    }
}

fn unknown_consumer(id: ConsumerId) -> ShuffleError {
    ShuffleError::Internal(format!("Memory consumer {id} is not registered"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use datafusion::execution::memory_pool::GreedyMemoryPool;

    /// Holds memory and gives all of it back when another consumer asks.
    struct Hoarder {
        id: ConsumerId,
        manager: Arc<TaskMemoryManager>,
        spills: usize,
    }

    impl Spillable for Hoarder {
        fn spill(&mut self, _size: usize, trigger: ConsumerId) -> Result<usize> {
            if trigger == self.id {
                return Ok(0);
            }
            self.spills += 1;
            Ok(self.manager.release_all(self.id))
        }
    }

    fn manager(limit: usize) -> Arc<TaskMemoryManager> {
        Arc::new(TaskMemoryManager::new(Arc::new(GreedyMemoryPool::new(limit))))
    }

    fn hoarder(manager: &Arc<TaskMemoryManager>) -> Result<Arc<Mutex<Hoarder>>> {
        let id = manager.register_consumer("hoarder");
        let hoarder = Arc::new(Mutex::new(Hoarder {
            id,
            manager: manager.clone(),
            spills: 0,
        }));
        manager.attach_spillable(id, &hoarder)?;
        Ok(hoarder)
    }

    #[test]
    fn grants_within_limit() -> Result<()> {
        let manager = manager(100);
        let id = manager.register_consumer("sorter");
        assert!(manager.try_acquire(id, 60)?);
        assert!(manager.try_acquire(id, 40)?);
        assert!(!manager.try_acquire(id, 1)?);
        assert_eq!(manager.memory_used(id), 100);

        manager.release(id, 30);
        assert_eq!(manager.memory_used(id), 70);
        // releasing more than held is clamped
        manager.release(id, 1000);
        assert_eq!(manager.memory_used(id), 0);
        assert_eq!(manager.peak_memory_used(), 100);
        Ok(())
    }

    #[test]
    fn other_consumers_spill_on_pressure() -> Result<()> {
        let manager = manager(100);
        let hoarder = hoarder(&manager)?;
        let hoarder_id = hoarder.lock().id;
        assert!(manager.try_acquire(hoarder_id, 80)?);

        let id = manager.register_consumer("sorter");
        assert!(manager.try_acquire(id, 50)?);
        assert_eq!(hoarder.lock().spills, 1);
        assert_eq!(manager.memory_used(hoarder_id), 0);
        assert_eq!(manager.memory_used(id), 50);
        Ok(())
    }

    #[test]
    fn busy_or_dropped_consumers_are_skipped() -> Result<()> {
        let manager = manager(100);
        let hoarder = hoarder(&manager)?;
        let hoarder_id = hoarder.lock().id;
        assert!(manager.try_acquire(hoarder_id, 80)?);
        let id = manager.register_consumer("sorter");

        {
            let _busy = hoarder.lock();
            assert!(!manager.try_acquire(id, 50)?);
        }

        drop(hoarder);
        assert!(!manager.try_acquire(id, 50)?);
        assert_eq!(manager.unregister_consumer(hoarder_id), 80);
        assert!(manager.try_acquire(id, 50)?);
        Ok(())
    }

    #[test]
    fn unknown_consumer_is_an_error() {
        let manager = manager(100);
        assert!(matches!(
            manager.try_acquire(42, 1),
            Err(ShuffleError::Internal(_))
        ));
    }
}
