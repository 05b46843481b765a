//! reactor_web - epoll-driven HTTP/1.1 static file server
//!
//! A single-host serving core built directly on the readiness multiplexer:
//! one reactor thread drives per-connection state machines, a fixed worker
//! pool consumes parse/respond tasks from a lock-free bounded queue, and
//! file bodies go out as memory-mapped vectored writes.
//!
//! # Architecture
//!
//! - **Reactor** ([`WebServer`]): owns the epoll instance, the connections
//!   table and the deadline heap; accepts, dispatches readiness events and
//!   offloads per-connection work.
//! - **Connections** are armed one-shot: after a readiness notification the
//!   socket stays silent until the handling worker explicitly re-arms it,
//!   so at most one worker touches a connection at a time.
//! - **Workers** ([`ThreadPool`]) pull type-erased tasks from a
//!   [`BoundedQueue`] with a pluggable [`WaitStrategy`].
//! - **Timers** ([`HeapTimer`]) evict idle connections; the reactor bounds
//!   its poll timeout by the earliest deadline.
//! - **Auth** runs login/register POSTs against MySQL through a fixed
//!   [`SqlConnPool`] whose handles are only reachable via a scoped guard.
//!
//! # Quick Start
//!
//! ```no_run
//! use reactor_web::{ServerConfig, WebServer};
//!
//! fn main() {
//!     let mut server = WebServer::new(ServerConfig {
//!         port: 8080,
//!         ..ServerConfig::default()
//!     })
//!     .expect("server init");
//!     server.start();
//! }
//! ```
//!
//! Static files are served from `cwd/resources/` unless
//! [`ServerConfig::src_dir`] points elsewhere.

pub(crate) mod http {
    pub(crate) mod request;
    pub(crate) mod response;
}
pub(crate) mod pool {
    pub(crate) mod sql_pool;
    pub(crate) mod thread_pool;
}
pub(crate) mod server {
    pub(crate) mod connection;
    pub(crate) mod epoll;
    pub(crate) mod server_impl;
}
pub(crate) mod buffer;
pub(crate) mod config;
pub(crate) mod errors;
pub(crate) mod logger;
pub(crate) mod queue;
pub(crate) mod timer;

pub use crate::{
    buffer::Buffer,
    config::ServerConfig,
    errors::{InitError, ParseError},
    http::{
        request::{HttpRequest, ParseState},
        response::HttpResponse,
    },
    logger::AsyncLog,
    pool::{
        sql_pool::{SqlConnGuard, SqlConnPool},
        thread_pool::ThreadPool,
    },
    queue::{BoundedQueue, WaitStrategy},
    server::{
        connection::HttpConn,
        server_impl::{ShutdownHandle, WebServer},
    },
    timer::HeapTimer,
};
