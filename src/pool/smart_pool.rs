use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam::queue::SegQueue;
use crossbeam::utils::Backoff;
use parking_lot::Mutex;
use tracing::debug;

/// Size counters of an object pool.
pub trait PoolInfo {
    fn min_pool_size(&self) -> usize;

    fn max_pool_size(&self) -> usize;

    fn available_items_count(&self) -> usize;

    fn total_items_count(&self) -> usize;
}

/// Builds one allocation batch of pool items.
pub trait PoolSourceCreator<T>: Send + Sync {
    fn create(&self, size: usize) -> Vec<T>;
}

impl<T, F> PoolSourceCreator<T> for F
where
    F: Fn(usize) -> Vec<T> + Send + Sync,
{
    fn create(&self, size: usize) -> Vec<T> {
        self(size)
    }
}

/// An object pool that starts with `min_pool_size` items and grows by
/// doubling, up to `max_pool_size`, when it runs dry.
///
/// Items are never freed once allocated: the pool trades bounded
/// over-allocation for zero allocation under steady load. Callers must reset
/// an item before pushing it back.
pub struct SmartPool<T> {
    global_stack: SegQueue<T>,
    source_creator: Box<dyn PoolSourceCreator<T>>,
    min_pool_size: usize,
    max_pool_size: usize,
    total_items_count: AtomicUsize,
    // sizes of the allocation batches, in creation order
    batches: Mutex<Vec<usize>>,
    is_increasing: AtomicBool,
}

impl<T: Send> SmartPool<T> {
    pub fn new<C>(min_pool_size: usize, max_pool_size: usize, source_creator: C) -> Self
    where
        C: PoolSourceCreator<T> + 'static,
    {
        let max_pool_size = max_pool_size.max(min_pool_size);
        let global_stack = SegQueue::new();
        for item in source_creator.create(min_pool_size) {
            global_stack.push(item);
        }
        SmartPool {
            global_stack,
            source_creator: Box::new(source_creator),
            min_pool_size,
            max_pool_size,
            total_items_count: AtomicUsize::new(min_pool_size),
            batches: Mutex::new(vec![min_pool_size]),
            is_increasing: AtomicBool::new(false),
        }
    }

    pub fn push(&self, item: T) {
        self.global_stack.push(item);
    }

    /// Pops an item, growing the pool if it is empty and still below its
    /// maximum. Only one caller performs the growth; the others wait briefly
    /// for its items. Returns `None` when nothing became available in time.
    pub fn try_get(&self) -> Option<T> {
        if let Some(item) = self.global_stack.pop() {
            return Some(item);
        }

        if self.total_items_count.load(Ordering::Acquire) >= self.max_pool_size {
            return self.pop_with_wait();
        }

        if self
            .is_increasing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return self.pop_with_wait();
        }

        self.increase_capacity();
        self.is_increasing.store(false, Ordering::Release);

        self.global_stack.pop().or_else(|| self.pop_with_wait())
    }

    pub fn batch_count(&self) -> usize {
        self.batches.lock().len()
    }

    fn pop_with_wait(&self) -> Option<T> {
        let backoff = Backoff::new();
        loop {
            backoff.snooze();
            if let Some(item) = self.global_stack.pop() {
                return Some(item);
            }
            if backoff.is_completed() {
                return None;
            }
        }
    }

    fn increase_capacity(&self) {
        let total = self.total_items_count.load(Ordering::Acquire);
        let new_items_count = total.min(self.max_pool_size.saturating_sub(total));
        if new_items_count == 0 {
            return;
        }

        let items = self.source_creator.create(new_items_count);
        let created = items.len();
        for item in items {
            self.global_stack.push(item);
        }
        self.batches.lock().push(created);
        self.total_items_count.fetch_add(created, Ordering::AcqRel);
        debug!(
            "pool grew by {} items to {} of {}",
            created,
            total + created,
            self.max_pool_size
        );
    }
}

impl<T> fmt::Debug for SmartPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmartPool")
            .field("min_pool_size", &self.min_pool_size)
            .field("max_pool_size", &self.max_pool_size)
            .field("available_items_count", &self.available_items_count())
            .field("total_items_count", &self.total_items_count())
            .finish()
    }
}

impl<T> PoolInfo for SmartPool<T> {
    fn min_pool_size(&self) -> usize {
        self.min_pool_size
    }

    fn max_pool_size(&self) -> usize {
        self.max_pool_size
    }

    fn available_items_count(&self) -> usize {
        self.global_stack.len()
    }

    fn total_items_count(&self) -> usize {
        self.total_items_count.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn counting_pool(min: usize, max: usize) -> SmartPool<usize> {
        let next = Arc::new(AtomicUsize::new(0));
        SmartPool::new(min, max, move |size: usize| {
            (0..size)
                .map(|_| next.fetch_add(1, Ordering::Relaxed))
                .collect::<Vec<_>>()
        })
    }

    #[test]
    fn test_initial_size() {
        let pool = counting_pool(4, 16);
        assert_eq!(pool.total_items_count(), 4);
        assert_eq!(pool.available_items_count(), 4);
        assert_eq!(pool.batch_count(), 1);
    }

    #[test]
    fn test_growth_by_doubling_up_to_max() {
        let pool = counting_pool(2, 8);
        let mut taken = Vec::new();
        for _ in 0..8 {
            taken.push(pool.try_get().expect("pool should grow"));
        }
        assert_eq!(pool.total_items_count(), 8);
        // 2, then +2, then +4
        assert_eq!(pool.batch_count(), 3);

        // exhausted at the maximum: waits briefly and gives up
        assert!(pool.try_get().is_none());

        taken.sort_unstable();
        taken.dedup();
        assert_eq!(taken.len(), 8);
    }

    #[test]
    fn test_push_makes_item_available() {
        let pool = counting_pool(1, 1);
        let item = pool.try_get().unwrap();
        assert!(pool.try_get().is_none());
        pool.push(item);
        assert_eq!(pool.try_get(), Some(item));
    }

    #[test]
    fn test_concurrent_growth_never_exceeds_max() {
        let pool = counting_pool(4, 64);
        let got = AtomicUsize::new(0);
        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..8 {
                        // a loser of the growth race may time out, retry
                        while pool.try_get().is_none() {}
                        got.fetch_add(1, Ordering::Relaxed);
                    }
                });
            }
        });
        assert_eq!(pool.total_items_count(), 64);
        assert_eq!(got.load(Ordering::Relaxed), 64);
    }
}
