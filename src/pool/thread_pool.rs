//! Fixed worker pool over the bounded MPMC queue.
//!
//! Workers own nothing persistent; each loops pulling one type-erased task
//! and invoking it until the stop flag is observed. Dropping the pool sets
//! the flag, breaks all queue waits and joins every worker.

use crate::queue::{BoundedQueue, WaitStrategy};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

const TASK_QUEUE_CAPACITY: usize = 1000;

type Task = Box<dyn FnOnce() + Send + 'static>;

pub struct ThreadPool {
    queue: Arc<BoundedQueue<Task>>,
    stop: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    pub fn new(thread_num: usize) -> Self {
        let queue = Arc::new(BoundedQueue::<Task>::new(TASK_QUEUE_CAPACITY, WaitStrategy::Block));
        let stop = Arc::new(AtomicBool::new(false));

        let workers = (0..thread_num.max(1))
            .map(|i| {
                let queue = Arc::clone(&queue);
                std::thread::Builder::new()
                    .name(format!("worker-{i}"))
                    .spawn(move || {
                        // `wait_dequeue` keeps draining after `break_all_wait`
                        // and returns None only once the queue is empty, so
                        // accepted work always runs before the pool exits.
                        while let Some(task) = queue.wait_dequeue() {
                            task();
                        }
                    })
                    .expect("spawning a pool worker")
            })
            .collect();

        Self {
            queue,
            stop,
            workers,
        }
    }

    /// Hands a task to the workers, blocking while the queue is full.
    /// Returns `false` once the pool is shutting down.
    pub fn spawn<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.stop.load(Ordering::Acquire) {
            return false;
        }
        self.queue.wait_enqueue(Box::new(task)).is_ok()
    }

    /// Like [`spawn`](Self::spawn), but delivers the task's return value on
    /// a channel so the caller can await it.
    pub fn submit<F, R>(&self, task: F) -> crossbeam::channel::Receiver<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = crossbeam::channel::bounded(1);
        self.spawn(move || {
            let _ = tx.send(task());
        });
        rx
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        if self.stop.swap(true, Ordering::AcqRel) {
            return;
        }
        self.queue.break_all_wait();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn executes_every_task() {
        let pool = ThreadPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            assert!(pool.spawn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        drop(pool);
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn submit_returns_the_result() {
        let pool = ThreadPool::new(2);
        let rx = pool.submit(|| 6 * 7);
        assert_eq!(rx.recv().unwrap(), 42);
    }

    #[test]
    fn rejects_after_shutdown_begins() {
        let pool = ThreadPool::new(1);
        pool.stop.store(true, Ordering::Release);
        assert!(!pool.spawn(|| {}));
    }
}
