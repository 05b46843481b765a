//! Thin wrapper over the epoll readiness mechanism.
//!
//! `Epoller` owns the epoll fd and a pre-sized event array; only the reactor
//! thread calls `wait`. Registration changes are safe from any thread
//! (`epoll_ctl` is a syscall on a shared fd), so a cloneable [`EpollHandle`]
//! carries `add_fd`/`mod_fd`/`del_fd` to workers and timer callbacks.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

pub const EV_IN: u32 = libc::EPOLLIN as u32;
pub const EV_OUT: u32 = libc::EPOLLOUT as u32;
pub const EV_RDHUP: u32 = libc::EPOLLRDHUP as u32;
pub const EV_HUP: u32 = libc::EPOLLHUP as u32;
pub const EV_ERR: u32 = libc::EPOLLERR as u32;
pub const EV_ET: u32 = libc::EPOLLET as u32;
pub const EV_ONESHOT: u32 = libc::EPOLLONESHOT as u32;

pub struct Epoller {
    epfd: Arc<OwnedFd>,
    events: Vec<libc::epoll_event>,
}

#[derive(Clone)]
pub struct EpollHandle {
    epfd: Arc<OwnedFd>,
}

impl Epoller {
    pub fn new(max_events: usize) -> io::Result<Self> {
        // SAFETY: epoll_create1 returns a fresh fd or -1.
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            // SAFETY: fd is valid and owned by nobody else.
            epfd: Arc::new(unsafe { OwnedFd::from_raw_fd(fd) }),
            events: vec![libc::epoll_event { events: 0, u64: 0 }; max_events.max(1)],
        })
    }

    pub fn handle(&self) -> EpollHandle {
        EpollHandle {
            epfd: Arc::clone(&self.epfd),
        }
    }

    /// Blocks up to `timeout_ms` (`-1` = unbounded) and returns how many
    /// entries of the event array are filled.
    pub fn wait(&mut self, timeout_ms: i32) -> io::Result<usize> {
        // SAFETY: the event array outlives the call and its len is passed.
        let n = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }
        Ok(n as usize)
    }

    pub fn event_fd(&self, i: usize) -> RawFd {
        self.events[i].u64 as RawFd
    }

    pub fn events(&self, i: usize) -> u32 {
        self.events[i].events
    }
}

impl EpollHandle {
    pub fn add_fd(&self, fd: RawFd, events: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, events)
    }

    pub fn mod_fd(&self, fd: RawFd, events: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, events)
    }

    pub fn del_fd(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        // SAFETY: ev is a stack value valid for the call; fd ownership is the
        // caller's concern.
        let ret = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    #[test]
    fn readiness_roundtrip() {
        let mut epoller = Epoller::new(8).unwrap();
        let handle = epoller.handle();
        let (mut tx, rx) = UnixStream::pair().unwrap();

        handle.add_fd(rx.as_raw_fd(), EV_IN).unwrap();
        assert_eq!(epoller.wait(0).unwrap(), 0, "nothing readable yet");

        tx.write_all(b"x").unwrap();
        let n = epoller.wait(100).unwrap();
        assert_eq!(n, 1);
        assert_eq!(epoller.event_fd(0), rx.as_raw_fd());
        assert_ne!(epoller.events(0) & EV_IN, 0);

        handle.del_fd(rx.as_raw_fd()).unwrap();
        tx.write_all(b"y").unwrap();
        assert_eq!(epoller.wait(0).unwrap(), 0, "deregistered fd is silent");
    }

    #[test]
    fn oneshot_requires_rearm() {
        let mut epoller = Epoller::new(8).unwrap();
        let handle = epoller.handle();
        let (mut tx, rx) = UnixStream::pair().unwrap();

        handle.add_fd(rx.as_raw_fd(), EV_IN | EV_ONESHOT).unwrap();
        tx.write_all(b"x").unwrap();
        assert_eq!(epoller.wait(100).unwrap(), 1);
        // Disarmed after the first notification.
        tx.write_all(b"y").unwrap();
        assert_eq!(epoller.wait(0).unwrap(), 0);
        // Explicit re-arm brings it back.
        handle.mod_fd(rx.as_raw_fd(), EV_IN | EV_ONESHOT).unwrap();
        assert_eq!(epoller.wait(100).unwrap(), 1);
    }
}
