use std::io;
use thiserror::Error;

/// Failures while bringing the server up. Any of these marks the server
/// closed; `start` then returns without entering the event loop.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("socket setup failed: {0}")]
    Io(#[from] io::Error),

    #[error("database pool setup failed: {0}")]
    Db(#[from] mysql::Error),
}

/// The only way a request fails to parse; everything else degrades into
/// header/body boundary handling.
#[derive(Debug, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("malformed request line")]
    RequestLine,
}
