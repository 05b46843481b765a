//! The reactor: one thread owns the multiplexer, the timer heap and the
//! connections table.
//!
//! The loop waits bounded by the next timer deadline, accepts on the
//! listening socket, and offloads per-connection parse/write work to the
//! worker pool. One-shot arming guarantees a connection is handled by at
//! most one worker between explicit re-arms; the per-connection mutex turns
//! that protocol into something the compiler can hold us to.

use crate::config::ServerConfig;
use crate::errors::InitError;
use crate::logger::AsyncLog;
use crate::pool::sql_pool::SqlConnPool;
use crate::pool::thread_pool::ThreadPool;
use crate::server::connection::{HttpConn, IS_ET, USER_COUNT};
use crate::server::epoll::{
    EpollHandle, Epoller, EV_ERR, EV_ET, EV_HUP, EV_IN, EV_ONESHOT, EV_OUT, EV_RDHUP,
};
use crate::timer::HeapTimer;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Hard cap on concurrently served connections.
const MAX_FD: i32 = 65535;
const MAX_EVENTS: usize = 1024;
const LISTEN_BACKLOG: i32 = 6;
const BUSY_REPLY: &[u8] = b"Server busy!";

pub struct WebServer {
    port: u16,
    timeout_ms: u64,

    listener: Option<Socket>,
    listen_fd: RawFd,
    listen_event: u32,
    conn_event: u32,

    epoller: Epoller,
    handle: EpollHandle,
    timer: HeapTimer,
    pool: ThreadPool,
    sql: Option<Arc<SqlConnPool>>,
    users: HashMap<RawFd, Arc<Mutex<HttpConn>>>,
    src_dir: Arc<PathBuf>,

    stop: Arc<AtomicBool>,
    waker: Arc<OwnedFd>,
}

/// Cloneable switch that makes the reactor leave its loop and release
/// everything it owns.
#[derive(Clone)]
pub struct ShutdownHandle {
    stop: Arc<AtomicBool>,
    waker: Arc<OwnedFd>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        let one: u64 = 1;
        // SAFETY: writing 8 bytes to an eventfd we own.
        unsafe {
            libc::write(self.waker.as_raw_fd(), (&one as *const u64).cast(), 8);
        }
    }
}

impl WebServer {
    pub fn new(cfg: ServerConfig) -> Result<Self, InitError> {
        if cfg.open_log {
            // A second server in the same process keeps the existing logger.
            let _ = AsyncLog::init(
                cfg.log_level,
                std::path::Path::new("./log"),
                ".log",
                cfg.log_queue_size,
            );
        }

        let src_dir = Arc::new(match &cfg.src_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()?.join("resources"),
        });

        let (listen_event, conn_event) = event_mode(cfg.trig_mode);
        IS_ET.store(conn_event & EV_ET != 0, Ordering::Relaxed);

        let sql = match cfg.conn_pool_size {
            0 => None,
            size => Some(SqlConnPool::init(
                &cfg.sql_host,
                cfg.sql_port,
                &cfg.sql_user,
                &cfg.sql_pwd,
                &cfg.db_name,
                size,
            )?),
        };

        let epoller = Epoller::new(MAX_EVENTS)?;
        let handle = epoller.handle();

        let (listener, port) = init_socket(cfg.port, cfg.opt_linger, listen_event, &handle)?;
        let listen_fd = listener.as_raw_fd();

        let waker = Arc::new(make_eventfd()?);
        handle.add_fd(waker.as_raw_fd(), EV_IN)?;

        let server = Self {
            port,
            timeout_ms: cfg.timeout_ms,
            listener: Some(listener),
            listen_fd,
            listen_event,
            conn_event,
            epoller,
            handle,
            timer: HeapTimer::new(),
            pool: ThreadPool::new(cfg.worker_count),
            sql,
            users: HashMap::new(),
            src_dir,
            stop: Arc::new(AtomicBool::new(false)),
            waker,
        };

        log::info!("=========== server init ===========");
        log::info!("port: {}, linger: {}", server.port, cfg.opt_linger);
        log::info!(
            "listen mode: {}, conn mode: {}",
            if listen_event & EV_ET != 0 { "ET" } else { "LT" },
            if conn_event & EV_ET != 0 { "ET" } else { "LT" },
        );
        log::info!("log level: {}", cfg.log_level);
        log::info!("src dir: {}", server.src_dir.display());
        log::info!(
            "sql pool: {}, worker threads: {}",
            cfg.conn_pool_size,
            cfg.worker_count
        );

        Ok(server)
    }

    /// The actual listening port; differs from the configured one when the
    /// kernel picked an ephemeral port.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            stop: Arc::clone(&self.stop),
            waker: Arc::clone(&self.waker),
        }
    }

    /// Runs the event loop until a [`ShutdownHandle`] fires.
    pub fn start(&mut self) {
        log::info!("========== server start ==========");

        while !self.stop.load(Ordering::Acquire) {
            let timeout = if self.timeout_ms > 0 {
                self.timer.next_tick()
            } else {
                -1
            };
            let count = match self.epoller.wait(timeout) {
                Ok(count) => count,
                Err(err) => {
                    log::error!("epoll wait failed: {err}");
                    break;
                }
            };

            for i in 0..count {
                let fd = self.epoller.event_fd(i);
                let events = self.epoller.events(i);

                if fd == self.listen_fd {
                    self.deal_listen();
                } else if fd == self.waker.as_raw_fd() {
                    drain_eventfd(fd);
                } else if events & (EV_RDHUP | EV_HUP | EV_ERR) != 0 {
                    self.deal_close(fd);
                } else if events & EV_IN != 0 {
                    self.deal_read(fd);
                } else if events & EV_OUT != 0 {
                    self.deal_write(fd);
                } else {
                    log::error!("unexpected event {events:#x} on fd {fd}");
                }
            }
        }

        self.shutdown();
    }

    fn deal_listen(&mut self) {
        loop {
            let accepted = match &self.listener {
                Some(listener) => listener.accept(),
                None => return,
            };
            let (sock, addr) = match accepted {
                Ok(pair) => pair,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    log::warn!("accept failed: {err}");
                    return;
                }
            };
            if USER_COUNT.load(Ordering::Relaxed) >= MAX_FD {
                send_busy(&sock);
                log::warn!("clients are full");
                return;
            }
            self.add_client(sock, addr);

            if self.listen_event & EV_ET == 0 {
                return;
            }
        }
    }

    fn add_client(&mut self, sock: Socket, addr: SockAddr) {
        if let Err(err) = sock.set_nonblocking(true) {
            log::warn!("set nonblocking failed: {err}");
            return;
        }
        let fd = sock.as_raw_fd();
        let peer = addr
            .as_socket()
            .map(|a| a.to_string())
            .unwrap_or_else(|| "?".into());

        let conn = Arc::new(Mutex::new(HttpConn::new(
            Arc::clone(&self.src_dir),
            self.sql.clone(),
        )));
        conn.lock().unwrap().init(sock, peer);
        self.users.insert(fd, Arc::clone(&conn));

        if self.timeout_ms > 0 {
            let handle = self.handle.clone();
            let conn = Arc::clone(&conn);
            self.timer.add(fd as u64, self.timeout_ms, move || {
                close_conn(&handle, &conn);
            });
        }
        if let Err(err) = self.handle.add_fd(fd, EV_IN | self.conn_event) {
            log::error!("registering client[{fd}] failed: {err}");
            close_conn(&self.handle, &self.users[&fd]);
        }
    }

    fn deal_close(&mut self, fd: RawFd) {
        if let Some(conn) = self.users.get(&fd) {
            close_conn(&self.handle, conn);
        }
        self.users.remove(&fd);
        if self.timeout_ms > 0 {
            self.timer.cancel(fd as u64);
        }
    }

    fn deal_read(&mut self, fd: RawFd) {
        let Some(conn) = self.users.get(&fd) else {
            return;
        };
        let conn = Arc::clone(conn);
        self.extend_time(fd);
        let handle = self.handle.clone();
        let conn_event = self.conn_event;
        self.pool.spawn(move || on_read(&handle, &conn, conn_event));
    }

    fn deal_write(&mut self, fd: RawFd) {
        let Some(conn) = self.users.get(&fd) else {
            return;
        };
        let conn = Arc::clone(conn);
        self.extend_time(fd);
        let handle = self.handle.clone();
        let conn_event = self.conn_event;
        self.pool.spawn(move || on_write(&handle, &conn, conn_event));
    }

    fn extend_time(&mut self, fd: RawFd) {
        if self.timeout_ms > 0 {
            self.timer.adjust(fd as u64, self.timeout_ms);
        }
    }

    fn shutdown(&mut self) {
        log::info!("========== server quit ==========");
        self.listener = None;
        for (_, conn) in self.users.drain() {
            close_conn(&self.handle, &conn);
        }
        self.timer.clear();
        if let Some(sql) = &self.sql {
            sql.close();
        }
        log::logger().flush();
    }
}

fn event_mode(trig_mode: u8) -> (u32, u32) {
    let mut listen_event = EV_RDHUP;
    let mut conn_event = EV_ONESHOT | EV_RDHUP;
    match trig_mode {
        0 => {}
        1 => conn_event |= EV_ET,
        2 => listen_event |= EV_ET,
        _ => {
            listen_event |= EV_ET;
            conn_event |= EV_ET;
        }
    }
    (listen_event, conn_event)
}

fn init_socket(
    port: u16,
    opt_linger: bool,
    listen_event: u32,
    handle: &EpollHandle,
) -> Result<(Socket, u16), InitError> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    if opt_linger {
        // Graceful close: block until pending data drains, at most 1s.
        socket.set_linger(Some(Duration::from_secs(1)))?;
    }
    socket.set_reuse_address(true)?;

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    handle.add_fd(socket.as_raw_fd(), listen_event | EV_IN)?;
    socket.set_nonblocking(true)?;

    let bound = socket
        .local_addr()?
        .as_socket()
        .map(|a| a.port())
        .unwrap_or(port);
    log::info!("server port: {bound}");
    Ok((socket, bound))
}

fn make_eventfd() -> io::Result<OwnedFd> {
    // SAFETY: eventfd returns a fresh fd or -1.
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fd is valid and unowned.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn drain_eventfd(fd: RawFd) {
    let mut counter: u64 = 0;
    // SAFETY: reading 8 bytes into a stack value.
    unsafe {
        libc::read(fd, (&mut counter as *mut u64).cast(), 8);
    }
}

fn send_busy(sock: &Socket) {
    if sock.send(BUSY_REPLY).is_err() {
        log::warn!("sending busy reply failed");
    }
}

fn close_conn(handle: &EpollHandle, conn: &Arc<Mutex<HttpConn>>) {
    let mut conn = conn.lock().unwrap();
    if conn.is_closed() {
        return;
    }
    let _ = handle.del_fd(conn.fd());
    conn.close();
}

fn on_read(handle: &EpollHandle, conn: &Arc<Mutex<HttpConn>>, conn_event: u32) {
    let mut guard = conn.lock().unwrap();
    if guard.is_closed() {
        return;
    }
    match guard.read() {
        Ok(0) => {
            drop(guard);
            close_conn(handle, conn);
        }
        Ok(_) => on_process(handle, &mut guard, conn_event),
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
            on_process(handle, &mut guard, conn_event)
        }
        Err(err) => {
            log::debug!("client[{}] read error: {err}", guard.fd());
            drop(guard);
            close_conn(handle, conn);
        }
    }
}

fn on_process(handle: &EpollHandle, conn: &mut HttpConn, conn_event: u32) {
    let interest = if conn.process() { EV_OUT } else { EV_IN };
    let _ = handle.mod_fd(conn.fd(), conn_event | interest);
}

fn on_write(handle: &EpollHandle, conn: &Arc<Mutex<HttpConn>>, conn_event: u32) {
    let mut guard = conn.lock().unwrap();
    if guard.is_closed() {
        return;
    }
    match guard.write() {
        Ok(_) => {
            if guard.to_write_bytes() == 0 {
                if guard.is_keep_alive() {
                    // Response flushed; handle a pipelined request in place.
                    on_process(handle, &mut guard, conn_event);
                    return;
                }
                drop(guard);
                close_conn(handle, conn);
            } else {
                // Socket buffer full before the staged bytes ran out.
                let _ = handle.mod_fd(guard.fd(), conn_event | EV_OUT);
            }
        }
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
            let _ = handle.mod_fd(guard.fd(), conn_event | EV_OUT);
        }
        Err(err) => {
            log::debug!("client[{}] write error: {err}", guard.fd());
            drop(guard);
            close_conn(handle, conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpStream;
    use std::thread::JoinHandle;

    struct TestServer {
        port: u16,
        handle: ShutdownHandle,
        thread: Option<JoinHandle<()>>,
        _root: tempfile::TempDir,
    }

    impl Drop for TestServer {
        fn drop(&mut self) {
            self.handle.shutdown();
            if let Some(t) = self.thread.take() {
                let _ = t.join();
            }
        }
    }

    fn spawn_server(trig_mode: u8, timeout_ms: u64) -> TestServer {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("index.html"), "hello world\n").unwrap();

        let cfg = ServerConfig {
            port: 0,
            trig_mode,
            timeout_ms,
            conn_pool_size: 0,
            worker_count: 4,
            open_log: false,
            src_dir: Some(root.path().to_path_buf()),
            ..ServerConfig::default()
        };
        let mut server = WebServer::new(cfg).unwrap();
        let port = server.port();
        let handle = server.shutdown_handle();
        let thread = std::thread::spawn(move || server.start());

        TestServer {
            port,
            handle,
            thread: Some(thread),
            _root: root,
        }
    }

    fn connect(port: u16) -> TcpStream {
        TcpStream::connect(("127.0.0.1", port)).unwrap()
    }

    /// Reads one response off a keep-alive stream: header block, then
    /// exactly `Content-length` body bytes.
    fn read_response(reader: &mut BufReader<TcpStream>) -> (String, Vec<u8>) {
        let mut head = String::new();
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            if line == "\r\n" || line.is_empty() {
                break;
            }
            head.push_str(&line);
        }
        let len = head
            .lines()
            .find_map(|l| l.strip_prefix("Content-length: "))
            .map_or(0, |v| v.trim().parse().unwrap());
        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).unwrap();
        (head, body)
    }

    #[test]
    fn serves_index_and_closes() {
        let server = spawn_server(3, 60_000);
        let mut stream = connect(server.port);
        stream
            .write_all(b"GET /index.html HTTP/1.1\r\nConnection: close\r\n\r\n")
            .unwrap();

        let mut reply = String::new();
        stream.read_to_string(&mut reply).unwrap();
        assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"), "{reply}");
        assert!(reply.contains("Connection: close\r\n"));
        assert!(reply.contains("Content-length: 12\r\n"));
        assert!(reply.ends_with("hello world\n"));
    }

    #[test]
    fn missing_file_gets_404() {
        let server = spawn_server(3, 60_000);
        let mut stream = connect(server.port);
        stream.write_all(b"GET /missing HTTP/1.1\r\n\r\n").unwrap();

        let mut reply = String::new();
        stream.read_to_string(&mut reply).unwrap();
        assert!(reply.starts_with("HTTP/1.1 404 Not Found\r\n"), "{reply}");
        assert!(reply.contains("404"));
    }

    #[test]
    fn malformed_first_line_gets_400_and_close() {
        let server = spawn_server(3, 60_000);
        let mut stream = connect(server.port);
        stream.write_all(b"HELLO\r\n\r\n").unwrap();

        let mut reply = String::new();
        stream.read_to_string(&mut reply).unwrap();
        assert!(reply.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{reply}");
    }

    #[test]
    fn keep_alive_serves_consecutive_requests() {
        let server = spawn_server(3, 60_000);
        let stream = connect(server.port);
        let mut writer = stream.try_clone().unwrap();
        let mut reader = BufReader::new(stream);

        for _ in 0..2 {
            writer
                .write_all(b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
                .unwrap();
            let (head, body) = read_response(&mut reader);
            assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
            assert!(head.contains("keep-alive: max=6, timeout=120"));
            assert_eq!(body, b"hello world\n");
        }
    }

    #[test]
    fn level_triggered_mode_also_serves() {
        let server = spawn_server(0, 60_000);
        let mut stream = connect(server.port);
        stream
            .write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
            .unwrap();

        let mut reply = String::new();
        stream.read_to_string(&mut reply).unwrap();
        assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"), "{reply}");
        assert!(reply.ends_with("hello world\n"));
    }

    #[test]
    fn idle_connection_is_evicted() {
        let server = spawn_server(3, 500);
        let mut stream = connect(server.port);

        let start = std::time::Instant::now();
        let mut byte = [0u8; 1];
        let n = stream.read(&mut byte).unwrap();
        assert_eq!(n, 0, "server should close the idle connection");
        assert!(
            start.elapsed() <= Duration::from_millis(1500),
            "eviction took {:?}",
            start.elapsed()
        );
    }

    #[test]
    fn concurrent_clients_all_complete() {
        let server = spawn_server(3, 60_000);
        let port = server.port;

        let clients: Vec<_> = (0..50)
            .map(|_| {
                std::thread::spawn(move || {
                    let mut stream = connect(port);
                    stream
                        .write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
                        .unwrap();
                    let mut reply = String::new();
                    stream.read_to_string(&mut reply).unwrap();
                    reply.starts_with("HTTP/1.1 200 OK\r\n") && reply.ends_with("hello world\n")
                })
            })
            .collect();

        for client in clients {
            assert!(client.join().unwrap());
        }

        // Eventually every connection slot is handed back.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            let active = USER_COUNT.load(Ordering::Relaxed);
            if active <= 0 || std::time::Instant::now() > deadline {
                assert!(active >= 0, "counter went negative: {active}");
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }
}
