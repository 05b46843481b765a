//! Per-socket connection state.
//!
//! Owns the read/write buffers, one parser and one responder, plus the
//! cursor over the two-part `[header bytes][mapped file]` write vector.
//! A process-wide counter tracks active connections and a process-wide
//! flag selects edge- vs level-triggered draining.

use crate::buffer::Buffer;
use crate::http::request::HttpRequest;
use crate::http::response::HttpResponse;
use crate::pool::sql_pool::SqlConnPool;
use socket2::Socket;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

/// Active connections across the process.
pub static USER_COUNT: AtomicI32 = AtomicI32::new(0);

/// Whether connection sockets are edge-triggered; written once at startup.
pub static IS_ET: AtomicBool = AtomicBool::new(false);

/// Level-triggered writes keep looping while more than this many bytes
/// remain staged.
const WRITE_CONTINUE_THRESHOLD: usize = 10240;

const READ_BUFFER_SIZE: usize = 2048;
const WRITE_BUFFER_SIZE: usize = 2048;

pub struct HttpConn {
    fd: RawFd,
    sock: Option<Socket>,
    peer: String,
    is_close: bool,

    read_buf: Buffer,
    write_buf: Buffer,
    /// Bytes of the mapped file already pushed to the socket.
    file_written: usize,

    request: HttpRequest,
    response: HttpResponse,

    src_dir: Arc<PathBuf>,
    sql: Option<Arc<SqlConnPool>>,
}

fn is_et() -> bool {
    IS_ET.load(Ordering::Relaxed)
}

impl HttpConn {
    pub fn new(src_dir: Arc<PathBuf>, sql: Option<Arc<SqlConnPool>>) -> Self {
        Self {
            fd: -1,
            sock: None,
            peer: String::new(),
            is_close: true,
            read_buf: Buffer::new(READ_BUFFER_SIZE),
            write_buf: Buffer::new(WRITE_BUFFER_SIZE),
            file_written: 0,
            request: HttpRequest::new(),
            response: HttpResponse::new(),
            src_dir,
            sql,
        }
    }

    /// Adopts a freshly accepted socket and resets all per-request state.
    pub fn init(&mut self, sock: Socket, peer: String) {
        USER_COUNT.fetch_add(1, Ordering::Relaxed);
        self.fd = sock.as_raw_fd();
        self.sock = Some(sock);
        self.peer = peer;
        self.read_buf.retrieve_all();
        self.write_buf.retrieve_all();
        self.file_written = 0;
        self.is_close = false;
        log::info!("client[{}]({}) in", self.fd, self.peer);
    }

    /// Idempotent: the first call releases the mapping, the fd and the
    /// counter slot.
    pub fn close(&mut self) {
        self.response.unmap_file();
        if !self.is_close {
            self.is_close = true;
            USER_COUNT.fetch_add(-1, Ordering::Relaxed);
            self.sock = None;
            log::info!("client[{}]({}) quit", self.fd, self.peer);
            // The kernel may hand this fd number to the next accept; a stale
            // task must never reach it.
            self.fd = -1;
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_closed(&self) -> bool {
        self.is_close
    }

    pub fn is_keep_alive(&self) -> bool {
        self.request.is_keep_alive()
    }

    pub fn to_write_bytes(&self) -> usize {
        self.write_buf.readable_bytes() + (self.response.file_len() - self.file_written)
    }

    /// Drains the socket through the scatter-read: until `WouldBlock` when
    /// edge-triggered, one pass otherwise.
    pub fn read(&mut self) -> io::Result<usize> {
        loop {
            match self.read_buf.read_fd(self.fd) {
                Ok(0) => return Ok(0),
                Ok(n) => {
                    if !is_et() {
                        return Ok(n);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Pushes `[staged headers][mapped file]` with vectored writes, header
    /// region first. Loops while edge-triggered or while more than 10 KiB
    /// remain.
    pub fn write(&mut self) -> io::Result<usize> {
        let mut last = 0;
        loop {
            let header_len = self.write_buf.readable_bytes();
            let (file_ptr, file_len) = match self.response.file() {
                Some(file) if self.file_written < file.len() => {
                    let rest = &file[self.file_written..];
                    (rest.as_ptr(), rest.len())
                }
                _ => (std::ptr::null(), 0),
            };
            let iov = [
                libc::iovec {
                    iov_base: self.write_buf.peek().as_ptr() as *mut _,
                    iov_len: header_len,
                },
                libc::iovec {
                    iov_base: file_ptr as *mut _,
                    iov_len: file_len,
                },
            ];
            // SAFETY: both regions stay alive and unmoved for the call; the
            // kernel only reads them.
            let n = unsafe { libc::writev(self.fd, iov.as_ptr(), 2) };
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            last = n as usize;

            if last > header_len {
                self.file_written += last - header_len;
                if header_len > 0 {
                    self.write_buf.retrieve_all();
                }
            } else {
                self.write_buf.retrieve(last);
            }

            if self.to_write_bytes() == 0 {
                break;
            }
            if !is_et() && self.to_write_bytes() <= WRITE_CONTINUE_THRESHOLD {
                break;
            }
        }
        Ok(last)
    }

    /// Parses whatever the read buffer holds and stages the response.
    /// `false` asks the reactor to re-arm for input (nothing to do yet),
    /// `true` to re-arm for output.
    pub fn process(&mut self) -> bool {
        self.request.init();
        if self.read_buf.readable_bytes() == 0 {
            return false;
        }

        match self.request.parse(&mut self.read_buf) {
            Ok(()) => {
                self.request.apply_auth(self.sql.as_ref());
                let keep_alive = self.request.is_keep_alive();
                let path = self.request.path().to_string();
                self.response.init(&self.src_dir, &path, keep_alive, None);
            }
            Err(err) => {
                log::debug!("client[{}] bad request: {err}", self.fd);
                let path = self.request.path().to_string();
                self.response.init(&self.src_dir, &path, false, Some(400));
            }
        }

        self.response.make_response(&mut self.write_buf);
        self.file_written = 0;
        log::debug!(
            "client[{}] staged {} bytes (file {})",
            self.fd,
            self.to_write_bytes(),
            self.response.file_len()
        );
        true
    }
}

impl Drop for HttpConn {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    fn fixture_root(content: &str) -> (tempfile::TempDir, Arc<PathBuf>) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.html"), content).unwrap();
        let root = Arc::new(dir.path().to_path_buf());
        (dir, root)
    }

    fn connected(root: Arc<PathBuf>) -> (HttpConn, UnixStream) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        let mut conn = HttpConn::new(root, None);
        conn.init(
            Socket::from(std::os::fd::OwnedFd::from(ours)),
            "test-peer".into(),
        );
        (conn, theirs)
    }

    #[test]
    fn full_request_response_cycle() {
        let (_dir, root) = fixture_root("hello world\n");
        let (mut conn, mut client) = connected(root);

        client
            .write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
            .unwrap();

        match conn.read() {
            Ok(n) if n > 0 => {}
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            other => panic!("unexpected read result: {other:?}"),
        }
        assert!(conn.process());
        assert!(conn.to_write_bytes() > 0);

        while conn.to_write_bytes() > 0 {
            conn.write().unwrap();
        }
        conn.close();

        let mut reply = String::new();
        client.read_to_string(&mut reply).unwrap();
        assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"), "{reply}");
        assert!(reply.contains("Content-length: 12\r\n\r\n"));
        assert!(reply.ends_with("hello world\n"));
    }

    #[test]
    fn empty_read_buffer_asks_for_more_input() {
        let (_dir, root) = fixture_root("x");
        let (mut conn, _client) = connected(root);
        assert!(!conn.process());
        conn.close();
    }

    #[test]
    fn close_is_idempotent() {
        let (_dir, root) = fixture_root("x");
        let (mut conn, _client) = connected(root);

        let before = USER_COUNT.load(Ordering::Relaxed);
        conn.close();
        conn.close();
        assert!(conn.is_closed());
        assert!(USER_COUNT.load(Ordering::Relaxed) <= before);
    }

    #[test]
    fn malformed_request_stages_400() {
        let (_dir, root) = fixture_root("x");
        let (mut conn, mut client) = connected(root);

        client.write_all(b"HELLO\r\n\r\n").unwrap();
        match conn.read() {
            Ok(_) => {}
            Err(err) => assert_eq!(err.kind(), io::ErrorKind::WouldBlock),
        }
        assert!(conn.process());
        while conn.to_write_bytes() > 0 {
            conn.write().unwrap();
        }
        conn.close();

        let mut reply = String::new();
        client.read_to_string(&mut reply).unwrap();
        assert!(reply.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{reply}");
        assert!(!conn.is_keep_alive());
    }
}
