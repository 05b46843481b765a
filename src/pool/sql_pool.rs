//! Fixed-size pool of synchronous MySQL connections.
//!
//! Handles live in a mutex-guarded FIFO; a condition variable provides the
//! counting-semaphore wait so `get` blocks while every handle is out.
//! Callers only ever see [`SqlConnGuard`], which returns the handle on every
//! exit path.

use mysql::{Conn, Opts, OptsBuilder};
use std::collections::VecDeque;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex};

struct Inner {
    conns: VecDeque<Conn>,
    closed: bool,
}

pub struct SqlConnPool {
    inner: Mutex<Inner>,
    available: Condvar,
    size: usize,
}

impl SqlConnPool {
    /// Connects `size` handles up front. Fails on the first connection error
    /// so a misconfigured database is caught at startup, not mid-request.
    pub fn init(
        host: &str,
        port: u16,
        user: &str,
        pwd: &str,
        db_name: &str,
        size: usize,
    ) -> Result<Arc<Self>, mysql::Error> {
        debug_assert!(size > 0);
        let opts: Opts = OptsBuilder::new()
            .ip_or_hostname(Some(host))
            .tcp_port(port)
            .user(Some(user))
            .pass(Some(pwd))
            .db_name(Some(db_name))
            .into();

        let mut conns = VecDeque::with_capacity(size);
        for _ in 0..size {
            conns.push_back(Conn::new(opts.clone())?);
        }

        Ok(Arc::new(Self {
            inner: Mutex::new(Inner {
                conns,
                closed: false,
            }),
            available: Condvar::new(),
            size,
        }))
    }

    /// Takes a handle, waiting while none is free. `None` once the pool is
    /// closed.
    pub fn get(self: &Arc<Self>) -> Option<SqlConnGuard> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.closed {
                return None;
            }
            if let Some(conn) = inner.conns.pop_front() {
                return Some(SqlConnGuard {
                    pool: Arc::clone(self),
                    conn: ManuallyDrop::new(conn),
                });
            }
            inner = self.available.wait(inner).unwrap();
        }
    }

    pub fn free_conn_count(&self) -> usize {
        self.inner.lock().unwrap().conns.len()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Drops every pooled handle and wakes blocked getters.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        inner.conns.clear();
        self.available.notify_all();
    }

    fn check_in(&self, conn: Conn) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.closed {
            inner.conns.push_back(conn);
            self.available.notify_one();
        }
    }
}

/// Scoped acquisition of one handle; hands it back on drop.
pub struct SqlConnGuard {
    pool: Arc<SqlConnPool>,
    conn: ManuallyDrop<Conn>,
}

impl Deref for SqlConnGuard {
    type Target = Conn;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl DerefMut for SqlConnGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

impl Drop for SqlConnGuard {
    fn drop(&mut self) {
        // SAFETY: conn is never touched again after being taken.
        let conn = unsafe { ManuallyDrop::take(&mut self.conn) };
        self.pool.check_in(conn);
    }
}
