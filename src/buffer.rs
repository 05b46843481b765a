//! Growable byte buffer shared by connections and the responder.
//!
//! The buffer is a contiguous region with two cursors,
//! `read_pos <= write_pos <= capacity`:
//!
//! ```text
//! [ prependable | readable | writable ]
//! 0          read_pos   write_pos   capacity
//! ```
//!
//! `read_fd` is the interesting part: it exposes the writable tail as the
//! first iovec and a 64 KiB stack region as the second, so one `readv`
//! absorbs input of unknown size. Steady-state reads land directly in the
//! buffer; only a burst that overflows into the stack region pays a copy.

use std::io;
use std::os::unix::io::RawFd;

const STACK_EXTRA: usize = 65535;

#[derive(Debug, Default)]
pub struct Buffer {
    data: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl Buffer {
    pub fn new(init_size: usize) -> Self {
        Self {
            data: vec![0; init_size],
            read_pos: 0,
            write_pos: 0,
        }
    }

    #[inline]
    pub fn readable_bytes(&self) -> usize {
        self.write_pos - self.read_pos
    }

    #[inline]
    pub fn writable_bytes(&self) -> usize {
        self.data.len() - self.write_pos
    }

    #[inline]
    pub fn prependable_bytes(&self) -> usize {
        self.read_pos
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// The readable span, without consuming it.
    #[inline]
    pub fn peek(&self) -> &[u8] {
        &self.data[self.read_pos..self.write_pos]
    }

    /// Consumes `len` readable bytes.
    pub fn retrieve(&mut self, len: usize) {
        debug_assert!(len <= self.readable_bytes());
        self.read_pos += len.min(self.readable_bytes());
    }

    /// Resets both cursors and zeroes the backing store.
    pub fn retrieve_all(&mut self) {
        self.data.fill(0);
        self.read_pos = 0;
        self.write_pos = 0;
    }

    /// Consumes everything readable and returns it as a `String`
    /// (lossy on invalid UTF-8).
    pub fn retrieve_all_to_string(&mut self) -> String {
        let s = String::from_utf8_lossy(self.peek()).into_owned();
        self.retrieve_all();
        s
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.ensure_writable(bytes.len());
        self.data[self.write_pos..self.write_pos + bytes.len()].copy_from_slice(bytes);
        self.has_written(bytes.len());
    }

    /// Marks `len` bytes past `write_pos` as written by an external producer.
    #[inline]
    pub fn has_written(&mut self, len: usize) {
        debug_assert!(len <= self.writable_bytes());
        self.write_pos += len;
    }

    /// Guarantees at least `len` writable bytes, compacting or growing.
    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
        debug_assert!(self.writable_bytes() >= len);
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len {
            self.data.resize(self.write_pos + len + 1, 0);
        } else {
            // Enough total slack: slide the readable span down to offset 0.
            let readable = self.readable_bytes();
            self.data.copy_within(self.read_pos..self.write_pos, 0);
            self.read_pos = 0;
            self.write_pos = readable;
        }
    }

    /// Scatter-read from `fd`: fills the writable tail first, then up to
    /// 64 KiB more on the stack which is appended (growing the buffer) only
    /// when the read overflows.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra = [0u8; STACK_EXTRA];
        let writable = self.writable_bytes();

        let iov = [
            libc::iovec {
                iov_base: self.data[self.write_pos..].as_mut_ptr().cast(),
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra.as_mut_ptr().cast(),
                iov_len: extra.len(),
            },
        ];
        // SAFETY: both iovecs point into live, correctly sized buffers.
        let n = unsafe { libc::readv(fd, iov.as_ptr(), 2) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        let n = n as usize;
        if n <= writable {
            self.write_pos += n;
        } else {
            self.write_pos = self.data.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }

    /// Writes the readable span to `fd`, consuming what the kernel took.
    pub fn write_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let readable = self.readable_bytes();
        // SAFETY: the pointer/len pair denotes the readable span.
        let n = unsafe {
            libc::write(
                fd,
                self.data[self.read_pos..].as_ptr().cast(),
                readable,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        self.read_pos += n as usize;
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn accounting_invariant() {
        let mut buf = Buffer::new(64);
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), 64);

        buf.append(b"hello");
        buf.retrieve(2);
        assert_eq!(buf.peek(), b"llo");
        assert_eq!(
            buf.readable_bytes() + buf.prependable_bytes() + buf.writable_bytes(),
            buf.capacity()
        );
    }

    #[test]
    fn retrieve_all_to_string() {
        let mut buf = Buffer::new(16);
        buf.append(b"abc");
        buf.append(b"def");
        assert_eq!(buf.retrieve_all_to_string(), "abcdef");
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), buf.capacity());
    }

    #[test]
    fn compaction_reclaims_prependable() {
        let mut buf = Buffer::new(8);
        buf.append(b"abcdef");
        buf.retrieve(4);
        // 2 readable, 2 writable, 4 prependable: 5 bytes fit after compaction.
        buf.append(b"12345");
        assert_eq!(buf.peek(), b"ef12345");
        assert_eq!(buf.capacity(), 8);
        assert_eq!(buf.prependable_bytes(), 0);
    }

    #[test]
    fn growth_when_slack_insufficient() {
        let mut buf = Buffer::new(4);
        buf.append(b"abcd");
        buf.append(b"efgh");
        assert_eq!(buf.peek(), b"abcdefgh");
        assert!(buf.capacity() > 8);
    }

    #[test]
    fn scatter_read_overflow() {
        let (mut tx, rx) = UnixStream::pair().unwrap();
        let payload = vec![0x5au8; 5000];
        tx.write_all(&payload).unwrap();

        let mut buf = Buffer::new(1024);
        let n = buf.read_fd(rx.as_raw_fd()).unwrap();
        assert_eq!(n, 5000);
        assert_eq!(buf.readable_bytes(), 5000);
        assert_eq!(buf.peek(), &payload[..]);
    }

    #[test]
    fn scatter_read_fits_in_place() {
        let (mut tx, rx) = UnixStream::pair().unwrap();
        tx.write_all(b"tiny").unwrap();

        let mut buf = Buffer::new(1024);
        let n = buf.read_fd(rx.as_raw_fd()).unwrap();
        assert_eq!(n, 4);
        assert_eq!(buf.peek(), b"tiny");
        assert_eq!(buf.capacity(), 1024);
    }

    #[test]
    fn write_fd_drains() {
        let (tx, mut rx) = UnixStream::pair().unwrap();
        let mut buf = Buffer::new(16);
        buf.append(b"payload");

        let n = buf.write_fd(tx.as_raw_fd()).unwrap();
        assert_eq!(n, 7);
        assert_eq!(buf.readable_bytes(), 0);

        let mut got = [0u8; 7];
        use std::io::Read;
        rx.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"payload");
    }
}
