//! Lock-free bounded MPMC queue feeding the worker pool.
//!
//! A ring of `capacity + 2` slots and three monotonically increasing 64-bit
//! counters:
//!
//! - `head`: next position a consumer will take,
//! - `tail`: next position reserved by a producer,
//! - `commit`: boundary up to which producer writes are visible.
//!
//! A producer reserves by CAS on `tail`, writes its slot, then CAS-advances
//! `commit` from its old `tail` — so commits land in reservation order and a
//! consumer may read slot `i` only once `commit > i`. The two spare slots let
//! `index(tail) == index(head)` distinguish full from empty without extra
//! state. The counters live on separate cache lines.

use crossbeam::utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem::{ManuallyDrop, MaybeUninit};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// How a consumer behaves when the queue is empty.
///
/// A tagged enum with inline dispatch; the condition variable for the
/// blocking variants lives in the queue itself.
#[derive(Debug, Clone, Copy)]
pub enum WaitStrategy {
    /// Park on a condition variable signalled on each successful enqueue.
    Block,
    /// Sleep a fixed interval and retry.
    Sleep(Duration),
    /// Yield the thread and retry.
    Yield,
    /// Park with an upper bound; wakes up on signal or timeout.
    TimedBlock(Duration),
}

pub struct BoundedQueue<T> {
    head: CachePadded<AtomicU64>,
    tail: CachePadded<AtomicU64>,
    commit: CachePadded<AtomicU64>,

    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,

    strategy: WaitStrategy,
    lock: Mutex<()>,
    available: Condvar,
    break_all: AtomicBool,
}

// SAFETY: slots are handed between threads only through the head/tail/commit
// protocol; a value is written exactly once per reservation and moved out
// exactly once per consumption.
unsafe impl<T: Send> Send for BoundedQueue<T> {}
unsafe impl<T: Send> Sync for BoundedQueue<T> {}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize, strategy: WaitStrategy) -> Self {
        assert!(capacity > 0);
        let ring = capacity + 2;
        let mut slots = Vec::with_capacity(ring);
        slots.resize_with(ring, || UnsafeCell::new(MaybeUninit::uninit()));

        Self {
            head: CachePadded::new(AtomicU64::new(0)),
            tail: CachePadded::new(AtomicU64::new(1)),
            commit: CachePadded::new(AtomicU64::new(1)),
            slots: slots.into_boxed_slice(),
            strategy,
            lock: Mutex::new(()),
            available: Condvar::new(),
            break_all: AtomicBool::new(false),
        }
    }

    #[inline]
    fn index(&self, n: u64) -> usize {
        (n % self.slots.len() as u64) as usize
    }

    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        tail.saturating_sub(head + 1) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.commit.load(Ordering::Acquire) == self.head.load(Ordering::Acquire) + 1
    }

    /// Non-blocking enqueue; `Err(value)` when the ring is full.
    pub fn enqueue(&self, value: T) -> Result<(), T> {
        let mut old_tail = self.tail.load(Ordering::Acquire);
        loop {
            let new_tail = old_tail + 1;
            if self.index(new_tail) == self.index(self.head.load(Ordering::Acquire)) {
                return Err(value);
            }
            match self.tail.compare_exchange_weak(
                old_tail,
                new_tail,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    // SAFETY: the slot at index(old_tail) is reserved for this
                    // producer alone; consumers cannot see it until `commit`
                    // passes old_tail below.
                    unsafe {
                        (*self.slots[self.index(old_tail)].get()).write(value);
                    }
                    // Publish in reservation order: wait for earlier producers.
                    while self
                        .commit
                        .compare_exchange_weak(
                            old_tail,
                            new_tail,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_err()
                    {
                        std::hint::spin_loop();
                    }
                    self.notify_one();
                    return Ok(());
                }
                Err(current) => old_tail = current,
            }
        }
    }

    /// Non-blocking dequeue; `None` when nothing is committed.
    pub fn dequeue(&self) -> Option<T> {
        let mut old_head = self.head.load(Ordering::Acquire);
        loop {
            let new_head = old_head + 1;
            if new_head == self.commit.load(Ordering::Acquire) {
                return None;
            }
            // SAFETY: commit > new_head, so the slot holds an initialized
            // value. The bitwise copy is only kept by the CAS winner; losers
            // forget theirs without dropping.
            let value =
                ManuallyDrop::new(unsafe { (*self.slots[self.index(new_head)].get()).assume_init_read() });
            match self.head.compare_exchange_weak(
                old_head,
                new_head,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(ManuallyDrop::into_inner(value)),
                Err(current) => old_head = current,
            }
        }
    }

    /// Blocking enqueue honoring the wait strategy; `Err(value)` only after
    /// `break_all_wait`.
    pub fn wait_enqueue(&self, value: T) -> Result<(), T> {
        let mut value = value;
        loop {
            if self.break_all.load(Ordering::Acquire) {
                return Err(value);
            }
            match self.enqueue(value) {
                Ok(()) => return Ok(()),
                Err(v) => value = v,
            }
            std::thread::yield_now();
        }
    }

    /// Blocking dequeue honoring the wait strategy; `None` only after
    /// `break_all_wait` with an empty queue.
    pub fn wait_dequeue(&self) -> Option<T> {
        loop {
            if let Some(value) = self.dequeue() {
                return Some(value);
            }
            if self.break_all.load(Ordering::Acquire) {
                return None;
            }
            self.empty_wait();
        }
    }

    /// Wakes every parked consumer and makes future waits return immediately.
    pub fn break_all_wait(&self) {
        self.break_all.store(true, Ordering::Release);
        let _guard = self.lock.lock().unwrap();
        self.available.notify_all();
    }

    /// Taking the lock orders the commit before any consumer's emptiness
    /// re-check, so a signal cannot fall between that check and the park.
    fn notify_one(&self) {
        if matches!(
            self.strategy,
            WaitStrategy::Block | WaitStrategy::TimedBlock(_)
        ) {
            let _guard = self.lock.lock().unwrap();
            self.available.notify_one();
        }
    }

    fn empty_wait(&self) {
        match self.strategy {
            WaitStrategy::Sleep(dur) => std::thread::sleep(dur),
            WaitStrategy::Yield => std::thread::yield_now(),
            WaitStrategy::Block => {
                let guard = self.lock.lock().unwrap();
                if self.is_empty() && !self.break_all.load(Ordering::Acquire) {
                    let _guard = self.available.wait(guard).unwrap();
                }
            }
            WaitStrategy::TimedBlock(timeout) => {
                let guard = self.lock.lock().unwrap();
                if self.is_empty() && !self.break_all.load(Ordering::Acquire) {
                    let _res = self.available.wait_timeout(guard, timeout).unwrap();
                }
            }
        }
    }
}

impl<T> Drop for BoundedQueue<T> {
    fn drop(&mut self) {
        let head = self.head.load(Ordering::Acquire);
        let commit = self.commit.load(Ordering::Acquire);
        for n in head + 1..commit {
            let idx = self.index(n);
            // SAFETY: positions in (head, commit) were committed and never
            // consumed.
            unsafe { (*self.slots[idx].get()).assume_init_drop() };
        }
    }
}
