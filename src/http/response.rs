//! HTTP response assembly.
//!
//! Headers are staged into the connection's write buffer; a regular file
//! body is memory-mapped read-only so the connection can push
//! `[headers][mapped file]` out with one vectored write. The mapping
//! outlives the file descriptor and is released exactly once, on re-init
//! or drop.

use crate::buffer::Buffer;
use memmap2::Mmap;
use std::fs::{self, File};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Suffix-to-MIME table, carried over verbatim from the deployment it
/// serves; `text/plain` is the fallback.
const SUFFIX_TYPE: [(&str, &str); 19] = [
    (".html", "text/html"),
    (".xml", "text/xml"),
    (".txt", "text/plain"),
    ("css", "text/css"),
    (".js", "text/js"),
    (".xhtml", "application/xhtml+xml"),
    (".rtf", "application/rtf"),
    (".pdf", "applocation/pdf"),
    (".word", "application/word"),
    (".gz", "application/x-gzip"),
    (".tar", "application/x-tar"),
    (".png", "image/png"),
    (".gif", "image/gif"),
    (".jpg", "image/jpg"),
    ("jpeg", "image/jpeg"),
    (".au", "audio/basic"),
    (".mpeg", "videp/mpeg"),
    (".mpg", "vide/mpg"),
    (".avi", "video/x-msvideo"),
];

fn code_status(code: u16) -> Option<&'static str> {
    match code {
        200 => Some("OK"),
        400 => Some("Bad Request"),
        403 => Some("Forbidden"),
        404 => Some("Not Found"),
        _ => None,
    }
}

fn code_path(code: u16) -> Option<&'static str> {
    match code {
        400 => Some("/400.html"),
        403 => Some("/403.html"),
        404 => Some("/404.html"),
        _ => None,
    }
}

#[derive(Default)]
pub struct HttpResponse {
    code: Option<u16>,
    keep_alive: bool,
    path: String,
    src_dir: PathBuf,
    mm_file: Option<Mmap>,
}

impl HttpResponse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepares the builder for one response; any previous mapping is
    /// released first. `code: None` means "derive from stat".
    pub fn init(&mut self, src_dir: &Path, path: &str, keep_alive: bool, code: Option<u16>) {
        debug_assert!(!src_dir.as_os_str().is_empty());
        self.unmap_file();
        self.code = code;
        self.keep_alive = keep_alive;
        self.path = path.to_string();
        self.src_dir = src_dir.to_path_buf();
    }

    pub fn code(&self) -> Option<u16> {
        self.code
    }

    /// The mapped body, when a file backs this response.
    pub fn file(&self) -> Option<&[u8]> {
        self.mm_file.as_deref()
    }

    pub fn file_len(&self) -> usize {
        self.mm_file.as_ref().map_or(0, |m| m.len())
    }

    /// Releases the mapping; safe to call any number of times.
    pub fn unmap_file(&mut self) {
        self.mm_file = None;
    }

    /// Stages status line and headers into `buf` and maps the resolved file.
    /// An explicit code (e.g. 400 for a malformed request) is kept as-is;
    /// only the derive case consults the filesystem.
    pub fn make_response(&mut self, buf: &mut Buffer) {
        if self.code.is_none() {
            self.code = Some(match fs::metadata(self.full_path()) {
                Err(_) => 404,
                Ok(md) if md.is_dir() => 404,
                Ok(md) if md.permissions().mode() & 0o004 == 0 => 403,
                Ok(_) => 200,
            });
        }
        self.error_html();
        self.add_state_line(buf);
        self.add_header(buf);
        self.add_content(buf);
    }

    fn full_path(&self) -> PathBuf {
        self.src_dir.join(self.path.trim_start_matches('/'))
    }

    /// 400/403/404 swap in their dedicated page, when it exists.
    fn error_html(&mut self) {
        if let Some(page) = self.code.and_then(code_path) {
            self.path = page.to_string();
        }
    }

    fn add_state_line(&mut self, buf: &mut Buffer) {
        let status = match self.code.and_then(code_status) {
            Some(status) => status,
            None => {
                self.code = Some(400);
                "Bad Request"
            }
        };
        let code = self.code.unwrap_or(400);
        buf.append(format!("HTTP/1.1 {code} {status}\r\n").as_bytes());
    }

    fn add_header(&mut self, buf: &mut Buffer) {
        buf.append(b"Connection: ");
        if self.keep_alive {
            buf.append(b"keep-alive\r\n");
            buf.append(b"keep-alive: max=6, timeout=120\r\n");
        } else {
            buf.append(b"close\r\n");
        }
        buf.append(format!("Content-type: {}\r\n", self.file_type()).as_bytes());
    }

    fn add_content(&mut self, buf: &mut Buffer) {
        let file = match File::open(self.full_path()) {
            Ok(file) => file,
            Err(_) => {
                self.error_content(buf, "File NotFound!");
                return;
            }
        };
        // SAFETY: mapped read-only and private; the underlying file is
        // served as-is and concurrent truncation is outside our contract.
        let mmap = match unsafe { Mmap::map(&file) } {
            Ok(mmap) => mmap,
            Err(_) => {
                self.error_content(buf, "File NotFound!");
                return;
            }
        };
        // The fd closes here; the mapping persists.
        buf.append(format!("Content-length: {}\r\n\r\n", mmap.len()).as_bytes());
        self.mm_file = Some(mmap);
    }

    fn file_type(&self) -> &'static str {
        let Some(dot) = self.path.rfind('.') else {
            return "text/plain";
        };
        let suffix = &self.path[dot..];
        SUFFIX_TYPE
            .iter()
            .find(|(s, _)| *s == suffix)
            .map_or("text/plain", |(_, mime)| mime)
    }

    /// Inline HTML body for codes whose error page is missing.
    fn error_content(&mut self, buf: &mut Buffer, message: &str) {
        let code = self.code.unwrap_or(400);
        let status = code_status(code).unwrap_or("Bad Request");

        let body = format!(
            "<html><title>Error</title><body bgcolor=\"ffffff\">\
             {code} : {status}\n<p>{message}</p>\
             <hr><em>ReactorWebServer</em></body></html>"
        );
        buf.append(format!("Content-length: {}\r\n\r\n", body.len()).as_bytes());
        buf.append(body.as_bytes());
    }
}

impl Drop for HttpResponse {
    fn drop(&mut self) {
        self.unmap_file();
    }
}
