//! Reference-counted response objects.
//!
//! A response is built once by the application and may be queued on many
//! connections at the same time, so everything mutable sits behind its own
//! small mutex and the body is read positionally.  The pull callback is
//! invoked without any lock held except its own.

use std::fs::File;
use std::net::TcpStream as StdTcpStream;
use std::os::unix::fs::FileExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex};

/// Outcome of one pull from a response body source.
pub enum ReaderResult {
    /// This many bytes were produced.
    Data(usize),
    /// Nothing available yet; the connection blocks until resumed.
    NotReady,
    /// End of stream.
    End,
    /// Unrecoverable source failure; the connection is torn down.
    Error,
}

/// Socket handed to the application after a successful `101` upgrade,
/// switched back to blocking mode, together with any bytes that were read
/// past the request headers.
pub struct UpgradedStream {
    pub stream: StdTcpStream,
    pub read_ahead: Vec<u8>,
}

type ContentReader = Box<dyn FnMut(u64, &mut [u8]) -> ReaderResult + Send>;
type UpgradeHandler = Box<dyn FnOnce(UpgradedStream) + Send>;

enum Body {
    Empty,
    Buffer(Arc<[u8]>),
    File { file: File, start: u64 },
    Reader(Mutex<ContentReader>),
    Upgrade(Mutex<Option<UpgradeHandler>>),
}

#[derive(Default)]
struct HeaderBlock {
    headers: Vec<(String, String)>,
    trailers: Vec<(String, String)>,
}

struct Inner {
    body: Body,
    /// `None` means the total size is unknown: chunked on HTTP/1.1,
    /// close-delimited on HTTP/1.0.
    size: Option<u64>,
    block: Mutex<HeaderBlock>,
}

/// Cloning is reference counting; the body and headers are shared.
#[derive(Clone)]
pub struct Response {
    inner: Arc<Inner>,
}

impl Response {
    fn build(body: Body, size: Option<u64>) -> Response {
        Response {
            inner: Arc::new(Inner {
                body,
                size,
                block: Mutex::new(HeaderBlock::default()),
            }),
        }
    }

    pub fn empty() -> Response {
        Response::build(Body::Empty, Some(0))
    }

    pub fn from_buffer(data: Vec<u8>) -> Response {
        let size = data.len() as u64;
        Response::build(Body::Buffer(Arc::from(data.into_boxed_slice())), Some(size))
    }

    pub fn from_static(data: &'static [u8]) -> Response {
        Response::build(Body::Buffer(Arc::from(data)), Some(data.len() as u64))
    }

    /// Serve `size` bytes starting at the beginning of `file`.
    pub fn from_file(file: File, size: u64) -> Response {
        Response::from_file_at(file, 0, size)
    }

    /// Serve `size` bytes of `file` starting at byte `start`.
    pub fn from_file_at(file: File, start: u64, size: u64) -> Response {
        Response::build(Body::File { file, start }, Some(size))
    }

    /// Body produced on demand.  `size: None` streams until the callback
    /// reports [`ReaderResult::End`].
    pub fn from_callback<F>(size: Option<u64>, reader: F) -> Response
    where
        F: FnMut(u64, &mut [u8]) -> ReaderResult + Send + 'static,
    {
        Response::build(Body::Reader(Mutex::new(Box::new(reader))), size)
    }

    /// Protocol-switch response.  Once the status line and headers are on
    /// the wire the socket is pulled out of the event loop and passed to
    /// `handler`; the daemon keeps tracking the connection only for
    /// cleanup accounting.
    pub fn for_upgrade<F>(handler: F) -> Response
    where
        F: FnOnce(UpgradedStream) + Send + 'static,
    {
        Response::build(Body::Upgrade(Mutex::new(Some(Box::new(handler)))), Some(0))
    }

    pub fn add_header(&self, name: &str, value: &str) -> &Response {
        let mut block = self.lock_block();
        block.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Trailer emitted after the terminating chunk of a chunked response.
    pub fn add_trailer(&self, name: &str, value: &str) -> &Response {
        let mut block = self.lock_block();
        block.trailers.push((name.to_string(), value.to_string()));
        self
    }

    fn lock_block(&self) -> std::sync::MutexGuard<'_, HeaderBlock> {
        self.inner.block.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn size(&self) -> Option<u64> {
        self.inner.size
    }

    pub(crate) fn is_upgrade(&self) -> bool {
        matches!(self.inner.body, Body::Upgrade(_))
    }

    pub(crate) fn header_snapshot(&self) -> Vec<(String, String)> {
        self.lock_block().headers.clone()
    }

    pub(crate) fn trailer_snapshot(&self) -> Vec<(String, String)> {
        self.lock_block().trailers.clone()
    }

    pub(crate) fn has_header(&self, name: &str) -> bool {
        self.lock_block()
            .headers
            .iter()
            .any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    pub(crate) fn header_has_token(&self, name: &str, token: &str) -> bool {
        self.lock_block()
            .headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .any(|(_, v)| super::headers::has_token(v, token))
    }

    /// Pull body bytes at absolute position `pos`.
    pub(crate) fn read_body(&self, pos: u64, buf: &mut [u8]) -> ReaderResult {
        match &self.inner.body {
            Body::Empty | Body::Upgrade(_) => ReaderResult::End,
            Body::Buffer(data) => {
                if pos >= data.len() as u64 {
                    return ReaderResult::End;
                }
                let at = pos as usize;
                let n = buf.len().min(data.len() - at);
                buf[..n].copy_from_slice(&data[at..at + n]);
                ReaderResult::Data(n)
            }
            Body::File { file, start } => match file.read_at(buf, start + pos) {
                Ok(0) => ReaderResult::End,
                Ok(n) => ReaderResult::Data(n),
                Err(_) => ReaderResult::Error,
            },
            Body::Reader(reader) => {
                let mut reader = reader.lock().unwrap_or_else(|p| p.into_inner());
                reader(pos, buf)
            }
        }
    }

    /// Raw fd and base offset for the sendfile fast path; `None` when the
    /// body cannot be spliced (not file-backed).
    pub(crate) fn file_raw(&self) -> Option<(RawFd, u64)> {
        match &self.inner.body {
            Body::File { file, start } => Some((file.as_raw_fd(), *start)),
            _ => None,
        }
    }

    pub(crate) fn take_upgrade_handler(&self) -> Option<UpgradeHandler> {
        match &self.inner.body {
            Body::Upgrade(slot) => slot.lock().unwrap_or_else(|p| p.into_inner()).take(),
            _ => None,
        }
    }
}

pub(crate) fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        411 => "Length Required",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        416 => "Range Not Satisfiable",
        417 => "Expectation Failed",
        426 => "Upgrade Required",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_body_reads_positionally() {
        let resp = Response::from_buffer(b"hello world".to_vec());
        let mut buf = [0u8; 5];
        match resp.read_body(6, &mut buf) {
            ReaderResult::Data(n) => {
                assert_eq!(&buf[..n], b"world");
            }
            _ => panic!("expected data"),
        }
        assert!(matches!(resp.read_body(11, &mut buf), ReaderResult::End));
    }

    #[test]
    fn clones_share_headers() {
        let resp = Response::from_static(b"x");
        let other = resp.clone();
        other.add_header("X-Test", "1");
        assert!(resp.has_header("x-test"));
        assert_eq!(resp.header_snapshot().len(), 1);
    }

    #[test]
    fn connection_close_token_detected() {
        let resp = Response::empty();
        resp.add_header("Connection", "Upgrade, close");
        assert!(resp.header_has_token("connection", "close"));
        assert!(!resp.header_has_token("connection", "keep-alive"));
    }

    #[test]
    fn callback_body_reports_position() {
        let resp = Response::from_callback(Some(4), |pos, buf| {
            if pos >= 4 {
                return ReaderResult::End;
            }
            buf[0] = b'a' + pos as u8;
            ReaderResult::Data(1)
        });
        let mut buf = [0u8; 8];
        assert!(matches!(resp.read_body(2, &mut buf), ReaderResult::Data(1)));
        assert_eq!(buf[0], b'c');
        assert!(matches!(resp.read_body(4, &mut buf), ReaderResult::End));
    }
}
