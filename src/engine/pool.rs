//! Work-stealing task pool.
//!
//! Labels are expensive (one full simulation each) and their cost varies a
//! lot between samples: an early failure stops after a few steps, a success
//! may run until the last event fires. A fixed chunking would leave workers
//! idle behind a straggler, so tasks are distributed through a global
//! injector with per-worker FIFO queues and round-robin stealing.
//!
//! Results are always returned in input order.

use crossbeam_deque::{Injector, Steal, Stealer, Worker};

use crate::error::ChainResult;

/// Work-stealing pool bounded by a fixed number of workers.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    /// Number of worker threads.
    num_workers: usize,
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerPool {
    /// Create with default number of workers (number of CPUs).
    #[must_use]
    pub fn new() -> Self {
        Self {
            num_workers: std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(4),
        }
    }

    /// Create with specified number of workers (at least one).
    #[must_use]
    pub const fn with_workers(num_workers: usize) -> Self {
        Self {
            num_workers: if num_workers == 0 { 1 } else { num_workers },
        }
    }

    /// Get number of workers.
    #[must_use]
    pub const fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Apply `task` to every item, returning results in input order.
    ///
    /// The closure receives the item index alongside the item so that tasks
    /// can derive per-item state (e.g. a partitioned RNG) deterministically.
    pub fn map<T, R, F>(&self, items: &[T], task: F) -> Vec<R>
    where
        T: Sync,
        R: Send,
        F: Fn(usize, &T) -> R + Sync,
    {
        let num_workers = self.num_workers.min(items.len());
        if num_workers <= 1 {
            return items.iter().enumerate().map(|(i, item)| task(i, item)).collect();
        }

        // Global work queue
        let injector: Injector<usize> = Injector::new();
        for index in 0..items.len() {
            injector.push(index);
        }

        // Per-worker local queues
        let workers: Vec<Worker<usize>> = (0..num_workers).map(|_| Worker::new_fifo()).collect();
        let stealers: Vec<Stealer<usize>> = workers.iter().map(Worker::stealer).collect();

        let results: std::sync::Mutex<Vec<(usize, R)>> =
            std::sync::Mutex::new(Vec::with_capacity(items.len()));

        std::thread::scope(|s| {
            for (worker_id, worker) in workers.into_iter().enumerate() {
                let injector = &injector;
                let stealers = &stealers;
                let results = &results;
                let task = &task;

                s.spawn(move || {
                    while let Some(index) = next_task(worker_id, &worker, injector, stealers) {
                        let result = task(index, &items[index]);
                        if let Ok(mut guard) = results.lock() {
                            guard.push((index, result));
                        }
                    }
                });
            }
        });

        let mut indexed_results = results.into_inner().unwrap_or_default();
        indexed_results.sort_by_key(|(idx, _)| *idx);
        indexed_results.into_iter().map(|(_, r)| r).collect()
    }

    /// Fallible variant of [`WorkerPool::map`].
    ///
    /// Every task runs to completion; the error of the lowest-indexed failing
    /// item is returned.
    ///
    /// # Errors
    ///
    /// Returns the first error in input order.
    pub fn try_map<T, R, F>(&self, items: &[T], task: F) -> ChainResult<Vec<R>>
    where
        T: Sync,
        R: Send,
        F: Fn(usize, &T) -> ChainResult<R> + Sync,
    {
        self.map(items, task).into_iter().collect()
    }
}

/// Pop local work, then the global queue, then steal round-robin.
fn next_task(
    worker_id: usize,
    worker: &Worker<usize>,
    injector: &Injector<usize>,
    stealers: &[Stealer<usize>],
) -> Option<usize> {
    if let Some(index) = worker.pop() {
        return Some(index);
    }

    loop {
        match injector.steal_batch_and_pop(worker) {
            Steal::Success(index) => return Some(index),
            Steal::Empty => break,
            Steal::Retry => {}
        }
    }

    for i in 0..stealers.len() {
        let stealer_idx = (worker_id + i + 1) % stealers.len();
        loop {
            match stealers[stealer_idx].steal() {
                Steal::Success(index) => return Some(index),
                Steal::Empty => break,
                Steal::Retry => {}
            }
        }
    }
    None
}
