//! Incremental HTTP/1.1 request parser.
//!
//! A state machine over the connection's read buffer, driven one
//! CRLF-delimited line at a time: request line, headers, then (for POST)
//! the urlencoded body. Login/register targets additionally run the
//! database-backed verification which rewrites the path to the welcome or
//! error page.

use crate::buffer::Buffer;
use crate::errors::ParseError;
use crate::pool::sql_pool::SqlConnPool;
use memchr::memchr;
use memchr::memmem;
use std::collections::HashMap;
use std::sync::Arc;

/// Pages that may be addressed without their `.html` suffix.
const DEFAULT_HTML: [&str; 6] = [
    "/index",
    "/register",
    "/login",
    "/welcome",
    "/video",
    "/picture",
];

const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    RequestLine,
    Headers,
    Body,
    Finish,
}

pub struct HttpRequest {
    state: ParseState,
    method: String,
    path: String,
    version: String,
    body: String,
    headers: HashMap<String, String>,
    form: HashMap<String, String>,
}

impl Default for HttpRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpRequest {
    pub fn new() -> Self {
        Self {
            state: ParseState::RequestLine,
            method: String::new(),
            path: String::new(),
            version: String::new(),
            body: String::new(),
            headers: HashMap::new(),
            form: HashMap::new(),
        }
    }

    /// Resets the machine so the instance can parse the next request.
    pub fn init(&mut self) {
        self.state = ParseState::RequestLine;
        self.method.clear();
        self.path.clear();
        self.version.clear();
        self.body.clear();
        self.headers.clear();
        self.form.clear();
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn set_path(&mut self, path: &str) {
        self.path = path.to_string();
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn get_post(&self, key: &str) -> Option<&str> {
        self.form.get(key).map(String::as_str)
    }

    pub fn is_keep_alive(&self) -> bool {
        self.header("Connection") == Some("keep-alive") && self.version == "1.1"
    }

    /// Consumes readable bytes from `buf`, line by line. Fails only on a
    /// malformed request line; anything unexpected later merely ends the
    /// header section.
    pub fn parse(&mut self, buf: &mut Buffer) -> Result<(), ParseError> {
        while buf.readable_bytes() > 0 && self.state != ParseState::Finish {
            let readable = buf.peek();
            let line_end = memmem::find(readable, b"\r\n");
            let line = match line_end {
                Some(pos) => readable[..pos].to_vec(),
                None => readable.to_vec(),
            };

            match self.state {
                ParseState::RequestLine => {
                    self.parse_request_line(&line)?;
                    self.normalize_path();
                }
                ParseState::Headers => self.parse_header(&line),
                ParseState::Body => self.parse_body(&line),
                ParseState::Finish => {}
            }

            match line_end {
                // Incomplete trailing line: leave it for the next read.
                None => break,
                Some(pos) => buf.retrieve(pos + 2),
            }
        }
        log::debug!(
            "request [{}] [{}] [HTTP/{}]",
            self.method,
            self.path,
            self.version
        );
        Ok(())
    }

    fn parse_request_line(&mut self, line: &[u8]) -> Result<(), ParseError> {
        let line = simdutf8::basic::from_utf8(line).map_err(|_| ParseError::RequestLine)?;
        let mut parts = line.split(' ');
        let (method, target, proto) =
            match (parts.next(), parts.next(), parts.next(), parts.next()) {
                (Some(m), Some(t), Some(p), None) if !m.is_empty() && !t.is_empty() => (m, t, p),
                _ => return Err(ParseError::RequestLine),
            };
        let version = proto.strip_prefix("HTTP/").ok_or(ParseError::RequestLine)?;

        self.method = method.to_string();
        self.path = target.to_string();
        self.version = version.to_string();
        self.state = ParseState::Headers;
        Ok(())
    }

    fn normalize_path(&mut self) {
        if self.path == "/" {
            self.path = "/index.html".to_string();
        } else if DEFAULT_HTML.contains(&self.path.as_str()) {
            self.path.push_str(".html");
        }
    }

    fn parse_header(&mut self, line: &[u8]) {
        if line.is_empty() {
            // End of the header section; a body follows only for POST.
            self.state = if self.method == "POST" {
                ParseState::Body
            } else {
                ParseState::Finish
            };
            return;
        }
        let Ok(line) = simdutf8::basic::from_utf8(line) else {
            self.state = ParseState::Body;
            return;
        };
        match memchr(b':', line.as_bytes()) {
            Some(colon) => {
                let name = &line[..colon];
                let rest = &line[colon + 1..];
                let value = rest.strip_prefix(' ').unwrap_or(rest);
                self.headers.insert(name.to_string(), value.to_string());
            }
            // A line that is not a header is the silent boundary into the body.
            None => self.state = ParseState::Body,
        }
    }

    fn parse_body(&mut self, line: &[u8]) {
        self.body = String::from_utf8_lossy(line).into_owned();
        self.parse_post();
        self.state = ParseState::Finish;
        log::debug!("body: {} bytes", self.body.len());
    }

    fn parse_post(&mut self) {
        if self.method == "POST" && self.header("Content-Type") == Some(FORM_URLENCODED) {
            self.parse_from_urlencoded();
        }
    }

    fn parse_from_urlencoded(&mut self) {
        if self.body.is_empty() {
            return;
        }
        let body = std::mem::take(&mut self.body);
        for pair in body.split('&') {
            let (key, value) = match pair.split_once('=') {
                Some((k, v)) => (k, v),
                None => (pair, ""),
            };
            self.form.insert(url_decode(key), url_decode(value));
        }
        self.body = body;
    }

    /// Rewrites login/register POSTs to the welcome or error page depending
    /// on the database verdict. Without a pool every attempt fails.
    pub fn apply_auth(&mut self, pool: Option<&Arc<SqlConnPool>>) {
        if self.method != "POST" {
            return;
        }
        let is_login = match self.path.as_str() {
            "/login.html" => true,
            "/register.html" => false,
            _ => return,
        };
        let name = self.get_post("username").unwrap_or("");
        let pwd = self.get_post("password").unwrap_or("");
        let verified = match pool {
            Some(pool) => user_verify(pool, name, pwd, is_login),
            None => false,
        };
        self.path = if verified {
            "/welcome.html".to_string()
        } else {
            "/error.html".to_string()
        };
    }
}

fn user_verify(pool: &Arc<SqlConnPool>, name: &str, pwd: &str, is_login: bool) -> bool {
    if name.is_empty() || pwd.is_empty() {
        return false;
    }
    log::info!("verify user [{name}]");

    let Some(mut conn) = pool.get() else {
        log::warn!("sql pool is closed, rejecting [{name}]");
        return false;
    };
    match verify_with_conn(&mut conn, name, pwd, is_login) {
        Ok(verified) => verified,
        Err(err) => {
            log::error!("user verify failed: {err}");
            false
        }
    }
}

fn verify_with_conn(
    conn: &mut mysql::Conn,
    name: &str,
    pwd: &str,
    is_login: bool,
) -> Result<bool, mysql::Error> {
    use mysql::prelude::Queryable;

    let row: Option<(String, String)> = conn.exec_first(
        "SELECT username, password FROM user WHERE username = ? LIMIT 1",
        (name,),
    )?;

    match row {
        Some((_, stored)) => {
            if is_login && stored == pwd {
                Ok(true)
            } else {
                log::debug!(
                    "{} for [{name}]",
                    if is_login {
                        "password mismatch"
                    } else {
                        "username taken"
                    }
                );
                Ok(false)
            }
        }
        None if is_login => Ok(false),
        None => {
            conn.exec_drop(
                "INSERT INTO user(username, password) VALUES(?, ?)",
                (name, pwd),
            )?;
            Ok(conn.affected_rows() == 1)
        }
    }
}

fn url_decode(encoded: &str) -> String {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                match (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi * 16 + lo);
                        i += 2;
                    }
                    _ => out.push(b'%'),
                }
            }
            other => out.push(other),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(ch: u8) -> Option<u8> {
    match ch {
        b'0'..=b'9' => Some(ch - b'0'),
        b'a'..=b'f' => Some(ch - b'a' + 10),
        b'A'..=b'F' => Some(ch - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse_ok(raw: &[u8]) -> HttpRequest {
        let mut buf = Buffer::new(1024);
        buf.append(raw);
        let mut req = HttpRequest::new();
        req.parse(&mut buf).unwrap();
        req
    }

    #[test]
    fn canonical_get_roundtrip() {
        let req = parse_ok(b"GET / HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n");
        assert_eq!(req.method(), "GET");
        assert_eq!(req.path(), "/index.html");
        assert_eq!(req.version(), "1.1");
        assert!(req.is_keep_alive());
        assert_eq!(req.state(), ParseState::Finish);
    }

    #[test]
    fn known_pages_gain_html_suffix() {
        let req = parse_ok(b"GET /login HTTP/1.1\r\n\r\n");
        assert_eq!(req.path(), "/login.html");

        let req = parse_ok(b"GET /other HTTP/1.1\r\n\r\n");
        assert_eq!(req.path(), "/other");
    }

    #[test]
    fn malformed_request_line_is_rejected() {
        let mut buf = Buffer::new(64);
        buf.append(b"HELLO\r\n\r\n");
        let mut req = HttpRequest::new();
        assert_eq!(req.parse(&mut buf), Err(ParseError::RequestLine));
    }

    #[test]
    fn keep_alive_needs_version_and_header() {
        let req = parse_ok(b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n");
        assert!(!req.is_keep_alive());

        let req = parse_ok(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n");
        assert!(!req.is_keep_alive());
    }

    #[test]
    fn headers_stored_under_literal_key() {
        let req = parse_ok(b"GET / HTTP/1.1\r\nHost: a\r\nX-Thing:bare\r\n\r\n");
        assert_eq!(req.header("Host"), Some("a"));
        assert_eq!(req.header("X-Thing"), Some("bare"));
        assert_eq!(req.header("host"), None);
    }

    #[test]
    fn post_form_body_is_decoded() {
        let req = parse_ok(
            b"POST /login HTTP/1.1\r\n\
              Content-Type: application/x-www-form-urlencoded\r\n\
              \r\n\
              name=a%20b&x=%2B",
        );
        assert_eq!(req.get_post("name"), Some("a b"));
        assert_eq!(req.get_post("x"), Some("+"));
        assert_eq!(req.state(), ParseState::Finish);
    }

    #[test]
    fn url_decode_handles_plus_percent_and_junk() {
        assert_eq!(url_decode("a+b"), "a b");
        assert_eq!(url_decode("%41%6cpha"), "Alpha");
        assert_eq!(url_decode("100%"), "100%");
        assert_eq!(url_decode("%zz"), "%zz");
    }

    #[test]
    fn auth_without_pool_lands_on_error_page() {
        let mut req = parse_ok(
            b"POST /login HTTP/1.1\r\n\
              Content-Type: application/x-www-form-urlencoded\r\n\
              \r\n\
              username=alice&password=secret",
        );
        assert_eq!(req.path(), "/login.html");
        req.apply_auth(None);
        assert_eq!(req.path(), "/error.html");
    }

    #[test]
    fn restartable_after_init() {
        let mut req = parse_ok(b"GET /video HTTP/1.1\r\nHost: h\r\n\r\n");
        req.init();
        assert_eq!(req.state(), ParseState::RequestLine);
        assert_eq!(req.header("Host"), None);

        let mut buf = Buffer::new(128);
        buf.append(b"GET / HTTP/1.1\r\n\r\n");
        req.parse(&mut buf).unwrap();
        assert_eq!(req.path(), "/index.html");
    }

    #[test]
    fn incomplete_line_waits_for_more_input() {
        let mut buf = Buffer::new(128);
        buf.append(b"GET / HTTP/1.1\r\nHos");
        let mut req = HttpRequest::new();
        req.parse(&mut buf).unwrap();
        assert_eq!(req.state(), ParseState::Headers);
        assert_eq!(buf.peek(), b"Hos");
    }
}
