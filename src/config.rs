//! Server construction parameters.
//!
//! A plain struct with public fields; override what you need and keep
//! `..ServerConfig::default()` for the rest:
//!
//! ```
//! use reactor_web::ServerConfig;
//!
//! let cfg = ServerConfig {
//!     port: 8080,
//!     worker_count: 8,
//!     ..ServerConfig::default()
//! };
//! assert_eq!(cfg.trig_mode, 3);
//! ```

use log::LevelFilter;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP listen port. Port 0 asks the kernel for an ephemeral port.
    pub port: u16,

    /// Edge/level trigger selection:
    /// `0` all level-triggered, `1` edge-triggered connections,
    /// `2` edge-triggered listener, `3` (or anything else) both.
    pub trig_mode: u8,

    /// Idle-connection eviction deadline in milliseconds; `0` disables the
    /// timer wheel entirely.
    pub timeout_ms: u64,

    /// Sets `SO_LINGER {onoff=1, linger=1}` on the listener.
    pub opt_linger: bool,

    pub sql_host: String,
    pub sql_port: u16,
    pub sql_user: String,
    pub sql_pwd: String,
    pub db_name: String,

    /// Database handles created up front. `0` runs without a database:
    /// login/register then always resolve to the error page.
    pub conn_pool_size: usize,

    /// Worker threads consuming parse/respond tasks.
    pub worker_count: usize,

    pub open_log: bool,
    pub log_level: LevelFilter,
    pub log_queue_size: usize,

    /// Document root; `None` resolves to `cwd/resources/`.
    pub src_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 10000,
            trig_mode: 3,
            timeout_ms: 60_000,
            opt_linger: false,
            sql_host: "localhost".into(),
            sql_port: 3306,
            sql_user: "root".into(),
            sql_pwd: "12345678".into(),
            db_name: "webserver".into(),
            conn_pool_size: 12,
            worker_count: 4,
            open_log: true,
            log_level: LevelFilter::Info,
            log_queue_size: 1024,
            src_dir: None,
        }
    }
}
