// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Buf, Bytes};
use crossbeam::utils::Backoff;
use parking_lot::Mutex;

use super::SmartPool;

/// Fixed-capacity append buffer of outbound byte ranges for one session.
///
/// A queue goes through four phases: it is filled while active, made read-only
/// when swapped out, written to the socket, then cleared and returned to the
/// pool. Clearing bumps the epoch, so an enqueue that still carries the epoch
/// read before the swap is rejected instead of landing in the next generation.
#[derive(Debug)]
pub struct SendingQueue {
    capacity: usize,
    slots: Box<[Mutex<Option<Bytes>>]>,
    current_count: AtomicUsize,
    updating_count: AtomicUsize,
    read_only: AtomicBool,
    epoch: AtomicU16,
    // first entry that has not been fully written yet
    inner_offset: AtomicUsize,
}

#[derive(Debug, PartialEq, Eq)]
enum EnqueueError {
    /// lost the slot race to another producer, try again
    Conflict,
    Rejected,
}

impl SendingQueue {
    /// New queues start read-only; [`SendingQueue::start_enqueue`] activates them.
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Mutex::new(None))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        SendingQueue {
            capacity,
            slots,
            current_count: AtomicUsize::new(0),
            updating_count: AtomicUsize::new(0),
            read_only: AtomicBool::new(true),
            epoch: AtomicU16::new(1),
            inner_offset: AtomicUsize::new(0),
        }
    }

    pub fn epoch(&self) -> u16 {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries not yet fully written.
    pub fn len(&self) -> usize {
        self.current_count.load(Ordering::Acquire) - self.inner_offset.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    pub fn start_enqueue(&self) {
        self.read_only.store(false, Ordering::SeqCst);
    }

    /// Makes the queue read-only and waits until every enqueue that raced with
    /// the switch has finished writing its slot.
    pub fn stop_enqueue(&self) {
        if self.read_only.swap(true, Ordering::SeqCst) {
            return;
        }
        let backoff = Backoff::new();
        while self.updating_count.load(Ordering::SeqCst) > 0 {
            backoff.snooze();
        }
    }

    pub fn enqueue(&self, item: Bytes, epoch: u16) -> bool {
        self.enqueue_with(epoch, |queue| queue.try_enqueue(&item, epoch))
    }

    /// Enqueues all items into consecutive slots or none of them.
    pub fn enqueue_many(&self, items: &[Bytes], epoch: u16) -> bool {
        self.enqueue_with(epoch, |queue| queue.try_enqueue_many(items, epoch))
    }

    fn enqueue_with<F>(&self, epoch: u16, mut attempt: F) -> bool
    where
        F: FnMut(&SendingQueue) -> Result<(), EnqueueError>,
    {
        if self.is_read_only() || epoch != self.epoch() {
            return false;
        }

        self.updating_count.fetch_add(1, Ordering::SeqCst);
        let mut enqueued = false;
        while !self.is_read_only() {
            match attempt(self) {
                Ok(()) => {
                    enqueued = true;
                    break;
                }
                Err(EnqueueError::Conflict) => continue,
                Err(EnqueueError::Rejected) => break,
            }
        }
        self.updating_count.fetch_sub(1, Ordering::SeqCst);
        enqueued
    }

    fn try_enqueue(&self, item: &Bytes, epoch: u16) -> Result<(), EnqueueError> {
        let old_count = self.reserve(1, epoch)?;
        *self.slots[old_count].lock() = Some(item.clone());
        Ok(())
    }

    fn try_enqueue_many(&self, items: &[Bytes], epoch: u16) -> Result<(), EnqueueError> {
        let old_count = self.reserve(items.len(), epoch)?;
        for (i, item) in items.iter().enumerate() {
            *self.slots[old_count + i].lock() = Some(item.clone());
        }
        Ok(())
    }

    /// Claims `n` slots, returning the index of the first one.
    fn reserve(&self, n: usize, epoch: u16) -> Result<usize, EnqueueError> {
        let old_count = self.current_count.load(Ordering::Acquire);
        if old_count + n > self.capacity || self.is_read_only() || epoch != self.epoch() {
            return Err(EnqueueError::Rejected);
        }
        self.current_count
            .compare_exchange(old_count, old_count + n, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| EnqueueError::Conflict)
    }

    /// Clones the unsent entries into `out`. `Bytes` clones share storage, so
    /// nothing is copied.
    pub fn collect_pending(&self, out: &mut Vec<Bytes>) {
        let count = self.current_count.load(Ordering::Acquire);
        let start = self.inner_offset.load(Ordering::Acquire);
        for slot in &self.slots[start..count] {
            if let Some(item) = slot.lock().as_ref() {
                out.push(item.clone());
            }
        }
    }

    pub fn pending_bytes(&self) -> usize {
        let count = self.current_count.load(Ordering::Acquire);
        let start = self.inner_offset.load(Ordering::Acquire);
        self.slots[start..count]
            .iter()
            .map(|slot| slot.lock().as_ref().map_or(0, Bytes::len))
            .sum()
    }

    /// Drops `consumed` bytes from the front of the unsent data after a short
    /// write. Fully written entries are skipped; only the entry that was cut
    /// mid-way is shrunk, in place and without copying.
    pub fn trim(&self, consumed: usize) {
        let count = self.current_count.load(Ordering::Acquire);
        let start = self.inner_offset.load(Ordering::Acquire);
        let mut sub_total = 0;
        for index in start..count {
            let mut slot = self.slots[index].lock();
            let Some(segment) = slot.as_mut() else {
                continue;
            };
            sub_total += segment.len();
            if sub_total <= consumed {
                continue;
            }
            let rest = sub_total - consumed;
            segment.advance(segment.len() - rest);
            self.inner_offset.store(index, Ordering::Release);
            return;
        }
        self.inner_offset.store(count, Ordering::Release);
    }

    /// Starts a new generation: bumps the epoch and drops every entry. The
    /// queue is left read-only.
    pub fn clear(&self) {
        self.stop_enqueue();

        let epoch = self.epoch();
        let next = if epoch == u16::MAX { 1 } else { epoch + 1 };
        self.epoch.store(next, Ordering::Release);

        let count = self.current_count.load(Ordering::Acquire);
        for slot in &self.slots[..count] {
            slot.lock().take();
        }
        self.current_count.store(0, Ordering::Release);
        self.inner_offset.store(0, Ordering::Release);
    }
}

/// Sending queues shared by every session of one server.
pub type SendingQueuePool = Arc<SmartPool<Arc<SendingQueue>>>;

pub fn sending_queue_pool(
    min_pool_size: usize,
    max_pool_size: usize,
    sending_queue_size: usize,
) -> SendingQueuePool {
    Arc::new(SmartPool::new(min_pool_size, max_pool_size, move |size: usize| {
        (0..size)
            .map(|_| Arc::new(SendingQueue::new(sending_queue_size)))
            .collect::<Vec<_>>()
    }))
}
