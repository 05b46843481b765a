//! Indexed binary min-heap of per-connection deadlines.
//!
//! Nodes are keyed by an id (the connection fd); a side map from id to heap
//! position is maintained on every swap so `adjust` and `cancel` stay
//! O(log n). The reactor computes its poll timeout from `next_tick`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

pub type TimeoutCallback = Box<dyn FnOnce() + Send>;

struct TimerNode {
    id: u64,
    expires: Instant,
    cb: Option<TimeoutCallback>,
}

#[derive(Default)]
pub struct HeapTimer {
    heap: Vec<TimerNode>,
    refs: HashMap<u64, usize>,
}

impl HeapTimer {
    pub fn new() -> Self {
        Self {
            heap: Vec::with_capacity(64),
            refs: HashMap::with_capacity(64),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Adds a deadline `timeout_ms` from now. An existing id is updated in
    /// place (new deadline and callback) and re-sifted.
    pub fn add<F>(&mut self, id: u64, timeout_ms: u64, cb: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let expires = Instant::now() + Duration::from_millis(timeout_ms);
        match self.refs.get(&id).copied() {
            None => {
                let i = self.heap.len();
                self.refs.insert(id, i);
                self.heap.push(TimerNode {
                    id,
                    expires,
                    cb: Some(Box::new(cb)),
                });
                self.sift_up(i);
            }
            Some(i) => {
                self.heap[i].expires = expires;
                self.heap[i].cb = Some(Box::new(cb));
                if !self.sift_down(i, self.heap.len()) {
                    self.sift_up(i);
                }
            }
        }
    }

    /// Pushes an existing deadline out to `timeout_ms` from now.
    pub fn adjust(&mut self, id: u64, timeout_ms: u64) {
        let Some(&i) = self.refs.get(&id) else {
            return;
        };
        self.heap[i].expires = Instant::now() + Duration::from_millis(timeout_ms);
        if !self.sift_down(i, self.heap.len()) {
            self.sift_up(i);
        }
    }

    /// Removes an id without firing its callback.
    pub fn cancel(&mut self, id: u64) {
        if let Some(&i) = self.refs.get(&id) {
            self.del(i);
        }
    }

    /// Fires and removes every expired node, smallest deadline first.
    pub fn tick(&mut self) {
        let now = Instant::now();
        loop {
            match self.heap.first() {
                Some(root) if root.expires <= now => {}
                _ => break,
            }
            let cb = self.heap[0].cb.take();
            self.del(0);
            if let Some(cb) = cb {
                cb();
            }
        }
    }

    /// Milliseconds until the earliest deadline after ticking, clamped at
    /// zero; `-1` when no deadline bounds the wait.
    pub fn next_tick(&mut self) -> i32 {
        self.tick();
        match self.heap.first() {
            None => -1,
            Some(node) => {
                let now = Instant::now();
                if node.expires <= now {
                    0
                } else {
                    (node.expires - now).as_millis().min(i32::MAX as u128) as i32
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.refs.clear();
    }

    fn del(&mut self, index: usize) {
        debug_assert!(index < self.heap.len());
        let last = self.heap.len() - 1;
        if index < last {
            self.swap(index, last);
            let node = self.heap.pop().unwrap();
            self.refs.remove(&node.id);
            if !self.sift_down(index, self.heap.len()) {
                self.sift_up(index);
            }
        } else {
            let node = self.heap.pop().unwrap();
            self.refs.remove(&node.id);
        }
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[parent].expires <= self.heap[i].expires {
                break;
            }
            self.swap(i, parent);
            i = parent;
        }
    }

    /// Returns whether the node moved down.
    fn sift_down(&mut self, index: usize, n: usize) -> bool {
        let mut i = index;
        let mut child = i * 2 + 1;
        while child < n {
            if child + 1 < n && self.heap[child + 1].expires < self.heap[child].expires {
                child += 1;
            }
            if self.heap[i].expires <= self.heap[child].expires {
                break;
            }
            self.swap(i, child);
            i = child;
            child = i * 2 + 1;
        }
        i > index
    }

    fn swap(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        self.refs.insert(self.heap[i].id, i);
        self.refs.insert(self.heap[j].id, j);
    }

    #[cfg(test)]
    fn assert_index_consistent(&self) {
        assert_eq!(self.refs.len(), self.heap.len());
        for (i, node) in self.heap.iter().enumerate() {
            assert_eq!(self.refs[&node.id], i, "stale index for id {}", node.id);
        }
        for i in 1..self.heap.len() {
            let parent = (i - 1) / 2;
            assert!(self.heap[parent].expires <= self.heap[i].expires);
        }
    }
}
