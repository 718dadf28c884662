//! Request state and line-level parsing.
//!
//! The request owns every cursor the state machine works with.  All parsed
//! strings (method, url, header names and values, the partial header line)
//! are pool regions: one pool reset plus an in-place `Request::new()` and
//! the connection is ready for the next request on the same socket.

use std::any::Any;

use crate::pool::{MemPool, Region};

use super::fsm::{EventLoopInfo, State};
use super::headers::{HeaderKind, HeaderList};
use super::response::Response;

/// Sentinel for "framed by connection close" uploads.
pub(crate) const UNKNOWN_SIZE: u64 = u64::MAX;

/// Longest accepted chunk-size line (hex digits before any extension).
const MAX_CHUNK_SIZE_DIGITS: usize = 16;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HttpVersion {
    Http10,
    Http11,
}

impl HttpVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpVersion::Http10 => "HTTP/1.0",
            HttpVersion::Http11 => "HTTP/1.1",
        }
    }
}

/// Keep-alive disposition.  Moves monotonically toward `MustClose`; use
/// [`Request::set_must_close`] and never assign backwards.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Keepalive {
    Unknown,
    KeepAlive,
    MustClose,
}

/// Protocol-level failures, confined to the connection that caused them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProtoError {
    BadRequest,
    HeadersTooLarge,
    PayloadTooLarge,
    BadVersion,
    BadExpectation,
}

impl ProtoError {
    pub fn status(&self) -> u16 {
        use crate::prelude::{
            HTTP_BAD_REQUEST, HTTP_EXPECTATION_FAILED, HTTP_HEADER_FIELDS_TOO_LARGE,
            HTTP_PAYLOAD_TOO_LARGE, HTTP_VERSION_NOT_SUPPORTED,
        };
        match self {
            ProtoError::BadRequest => HTTP_BAD_REQUEST,
            ProtoError::HeadersTooLarge => HTTP_HEADER_FIELDS_TOO_LARGE,
            ProtoError::PayloadTooLarge => HTTP_PAYLOAD_TOO_LARGE,
            ProtoError::BadVersion => HTTP_VERSION_NOT_SUPPORTED,
            ProtoError::BadExpectation => HTTP_EXPECTATION_FAILED,
        }
    }
}

pub(crate) struct QueuedResponse {
    pub status: u16,
    pub response: Response,
}

/// How the queued response body goes on the wire.  Fixed once the response
/// headers are serialized.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum RespBodyMode {
    None,
    Sized(u64),
    Chunked,
    /// Unknown size on HTTP/1.0: stream and let the close delimit it.
    UntilClose,
}

pub(crate) struct Request {
    pub state: State,
    pub method: Region,
    pub url: Region,
    pub http_version: HttpVersion,
    pub headers: HeaderList,

    pub read_buffer: Region,
    pub read_buffer_offset: usize,
    /// Set by the reader when the buffer is full and the pool cannot grow
    /// it; turned into 431/413 depending on the parse phase.
    pub read_overflow: bool,

    pub write_buffer: Region,
    pub write_buffer_append_offset: usize,
    pub write_buffer_send_offset: usize,

    /// Complete-but-uncommitted header line; folding appends here.
    pub last: Option<Region>,
    /// Byte index of the colon within `last`.
    pub colon: usize,

    pub remaining_upload_size: u64,
    pub current_chunk_size: usize,
    pub current_chunk_offset: usize,
    pub have_chunked_upload: bool,

    pub response: Option<QueuedResponse>,
    pub response_write_position: u64,
    pub resp_body_mode: RespBodyMode,
    pub resp_sendfile: bool,
    pub continue_message_write_offset: usize,

    pub event_loop_info: EventLoopInfo,
    pub keepalive: Keepalive,
    pub in_idle: bool,
    pub is_head: bool,
    pub suspend_requested: bool,
    pub headers_dispatched: bool,
    pub completion_notified: bool,
    /// Handler-requested per-connection timeout; applied by the event loop
    /// after the dispatch returns.
    pub timeout_override: Option<std::time::Duration>,

    /// Per-request application state, carried across handler invocations.
    pub app_state: Option<Box<dyn Any + Send>>,
}

impl Request {
    pub fn new() -> Request {
        Request {
            state: State::Init,
            method: Region::empty(),
            url: Region::empty(),
            http_version: HttpVersion::Http11,
            headers: HeaderList::default(),
            read_buffer: Region::empty(),
            read_buffer_offset: 0,
            read_overflow: false,
            write_buffer: Region::empty(),
            write_buffer_append_offset: 0,
            write_buffer_send_offset: 0,
            last: None,
            colon: 0,
            remaining_upload_size: 0,
            current_chunk_size: 0,
            current_chunk_offset: 0,
            have_chunked_upload: false,
            response: None,
            response_write_position: 0,
            resp_body_mode: RespBodyMode::None,
            resp_sendfile: false,
            continue_message_write_offset: 0,
            event_loop_info: EventLoopInfo::Read,
            keepalive: Keepalive::Unknown,
            in_idle: false,
            is_head: false,
            suspend_requested: false,
            headers_dispatched: false,
            completion_notified: false,
            timeout_override: None,
            app_state: None,
        }
    }

    pub fn set_must_close(&mut self) {
        self.keepalive = Keepalive::MustClose;
    }

    /// First read on a connection: carve the read buffer out of half the
    /// pool's free space, one byte over-allocated so a terminator always
    /// fits.
    pub fn ensure_read_buffer(&mut self, pool: &mut MemPool) {
        if !self.read_buffer.is_empty() {
            return;
        }
        let want = pool.free() / 2 + 1;
        if let Some(r) = pool.alloc(want) {
            self.read_buffer = r;
        }
    }

    pub fn read_space(&self) -> usize {
        self.read_buffer.len - self.read_buffer_offset
    }

    /// Grow the read buffer additively; false when the pool is out.  A few
    /// hundred bytes are always held back so an error response can still
    /// be serialized after the buffer maxes out.
    pub fn grow_read_buffer(&mut self, pool: &mut MemPool, increment: usize) -> bool {
        let step = increment.min(pool.free().saturating_sub(512));
        if step == 0 {
            return false;
        }
        match pool.reallocate(self.read_buffer, self.read_buffer.len + step) {
            Some(r) => {
                self.read_buffer = r;
                true
            }
            None => false,
        }
    }

    /// Locate the next line in the read buffer.  Returns
    /// `(line_length, bytes_to_consume)`; the line excludes its CR/LF.
    pub fn find_line(&self, pool: &MemPool) -> Option<(usize, usize)> {
        let data = &pool.slice(self.read_buffer)[..self.read_buffer_offset];
        let nl = data.iter().position(|&b| b == b'\n')?;
        let line_len = if nl > 0 && data[nl - 1] == b'\r' { nl - 1 } else { nl };
        Some((line_len, nl + 1))
    }

    /// Drop `n` parsed bytes from the head of the read buffer.
    pub fn consume(&mut self, pool: &mut MemPool, n: usize) {
        debug_assert!(n <= self.read_buffer_offset);
        let buf = pool.slice_mut(self.read_buffer);
        buf.copy_within(n..self.read_buffer_offset, 0);
        self.read_buffer_offset -= n;
    }

    /// Copy the next line out of the buffer and consume it.  `None` means
    /// the terminator has not arrived yet.
    pub fn take_line(&mut self, pool: &mut MemPool) -> Option<Vec<u8>> {
        let (len, consumed) = self.find_line(pool)?;
        let line = pool.slice(self.read_buffer)[..len].to_vec();
        self.consume(pool, consumed);
        Some(line)
    }

    /// Parse `METHOD SP URI SP HTTP/x.y`, store the pieces, and explode the
    /// query string into `GetArgument` entries.
    pub fn parse_request_line(
        &mut self,
        line: &[u8],
        pool: &mut MemPool,
        uri_logger: Option<&(dyn Fn(&str) + Send + Sync)>,
    ) -> Result<(), ProtoError> {
        let line = core::str::from_utf8(line).map_err(|_| ProtoError::BadRequest)?;

        // Tokens are separated by exactly one SP; a URI cannot contain one.
        let mut parts = line.split(' ');
        let method = parts.next().unwrap_or("");
        let uri = parts.next().unwrap_or("");
        let version = parts.next().unwrap_or("");
        if method.is_empty() || uri.is_empty() || version.is_empty() || parts.next().is_some() {
            return Err(ProtoError::BadRequest);
        }

        self.http_version = match version {
            "HTTP/1.1" => HttpVersion::Http11,
            "HTTP/1.0" => HttpVersion::Http10,
            v if v.starts_with("HTTP/") => return Err(ProtoError::BadVersion),
            _ => return Err(ProtoError::BadRequest),
        };

        if let Some(logger) = uri_logger {
            logger(uri);
        }

        self.is_head = method == "HEAD";
        self.method = pool.store(method.as_bytes()).ok_or(ProtoError::HeadersTooLarge)?;

        let (path, query) = match uri.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (uri, None),
        };
        let decoded = percent_decode(path.as_bytes());
        self.url = pool.store(&decoded).ok_or(ProtoError::HeadersTooLarge)?;

        if let Some(query) = query {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                let (name, value) = match pair.split_once('=') {
                    Some((n, v)) => (n, v),
                    None => (pair, ""),
                };
                let name = pool
                    .store(&percent_decode(name.as_bytes()))
                    .ok_or(ProtoError::HeadersTooLarge)?;
                let value = pool
                    .store(&percent_decode(value.as_bytes()))
                    .ok_or(ProtoError::HeadersTooLarge)?;
                self.headers.push(HeaderKind::GetArgument, name, value);
            }
        }

        Ok(())
    }

    /// Stash a complete header line as `last` until the next line tells us
    /// whether it is folded.
    pub fn begin_header_line(&mut self, line: &[u8], pool: &mut MemPool) -> Result<(), ProtoError> {
        if core::str::from_utf8(line).is_err() {
            return Err(ProtoError::BadRequest);
        }
        let colon = line
            .iter()
            .position(|&b| b == b':')
            .ok_or(ProtoError::BadRequest)?;
        if colon == 0 || line[..colon].iter().any(|b| b.is_ascii_whitespace()) {
            return Err(ProtoError::BadRequest);
        }
        self.last = Some(pool.store(line).ok_or(ProtoError::HeadersTooLarge)?);
        self.colon = colon;
        Ok(())
    }

    /// Append a folded continuation to `last` as a single space plus the
    /// trimmed remainder.
    pub fn fold_header_line(&mut self, line: &[u8], pool: &mut MemPool) -> Result<(), ProtoError> {
        if core::str::from_utf8(line).is_err() {
            return Err(ProtoError::BadRequest);
        }
        let cont = trim_bytes(line);
        let last = match self.last {
            Some(r) => r,
            None => return Err(ProtoError::BadRequest),
        };
        let grown = pool
            .reallocate(last, last.len + 1 + cont.len())
            .ok_or(ProtoError::HeadersTooLarge)?;
        let tail = grown.sub(last.len, grown.len);
        let dst = pool.slice_mut(tail);
        dst[0] = b' ';
        dst[1..].copy_from_slice(cont);
        self.last = Some(grown);
        Ok(())
    }

    /// Commit `last` as a header (or footer) entry.  Name and value are
    /// trimmed sub-regions; nothing new is allocated.
    pub fn commit_last_header(&mut self, pool: &MemPool, kind: HeaderKind) {
        let last = match self.last.take() {
            Some(r) => r,
            None => return,
        };
        let bytes = pool.slice(last);
        let name = trim_span(bytes, 0, self.colon);
        let value = trim_span(bytes, self.colon + 1, bytes.len());
        self.headers.push(kind, last.sub(name.0, name.1), last.sub(value.0, value.1));
        self.colon = 0;
    }

    /// Split every `Cookie:` header into individual `Cookie` entries.
    pub fn parse_cookies(&mut self, pool: &MemPool) {
        let mut found = Vec::new();
        for entry in self.headers.iter() {
            if entry.kind != HeaderKind::Header
                || !pool.str_of(entry.name).eq_ignore_ascii_case("cookie")
            {
                continue;
            }
            let value = pool.slice(entry.value);
            let mut start = 0;
            for end in value
                .iter()
                .enumerate()
                .filter_map(|(i, &b)| (b == b';').then_some(i))
                .chain(core::iter::once(value.len()))
            {
                let piece = trim_span(value, start, end);
                if piece.0 < piece.1 {
                    let eq = value[piece.0..piece.1]
                        .iter()
                        .position(|&b| b == b'=')
                        .map(|i| piece.0 + i);
                    let (name, val) = match eq {
                        Some(eq) => {
                            let n = trim_span(value, piece.0, eq);
                            let v = trim_span(value, eq + 1, piece.1);
                            (n, v)
                        }
                        None => (piece, (piece.1, piece.1)),
                    };
                    found.push((
                        entry.value.sub(name.0, name.1),
                        entry.value.sub(val.0, val.1),
                    ));
                }
                start = end + 1;
            }
        }
        for (name, value) in found {
            self.headers.push(HeaderKind::Cookie, name, value);
        }
    }
}

/// Parse a `<hex-size>[;extensions]` chunk header line.
pub(crate) fn parse_chunk_size(line: &[u8]) -> Result<usize, ProtoError> {
    let line = core::str::from_utf8(line).map_err(|_| ProtoError::BadRequest)?;
    let digits = line.split(';').next().unwrap_or("").trim();
    if digits.is_empty() {
        return Err(ProtoError::BadRequest);
    }
    if digits.len() > MAX_CHUNK_SIZE_DIGITS {
        return Err(ProtoError::PayloadTooLarge);
    }
    usize::from_str_radix(digits, 16).map_err(|_| ProtoError::BadRequest)
}

/// Decode `%xx` escapes; malformed escapes pass through untouched.
pub(crate) fn percent_decode(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        if input[i] == b'%' && i + 2 < input.len() {
            let hi = (input[i + 1] as char).to_digit(16);
            let lo = (input[i + 2] as char).to_digit(16);
            if let (Some(hi), Some(lo)) = (hi, lo) {
                out.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(input[i]);
        i += 1;
    }
    out
}

fn trim_bytes(b: &[u8]) -> &[u8] {
    let (start, end) = trim_span(b, 0, b.len());
    &b[start..end]
}

/// Whitespace-trimmed sub-range of `bytes[start..end]`.
fn trim_span(bytes: &[u8], mut start: usize, mut end: usize) -> (usize, usize) {
    while start < end && bytes[start].is_ascii_whitespace() {
        start += 1;
    }
    while end > start && bytes[end - 1].is_ascii_whitespace() {
        end -= 1;
    }
    (start, end)
}
