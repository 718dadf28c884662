//! The per-request state machine.
//!
//! `idle` advances a request as far as the buffered bytes and the queued
//! response allow, then reports what the connection is waiting for.  Actual
//! socket I/O happens elsewhere (`Connection::handle_read` /
//! `handle_write`); this module only consumes the read buffer and fills the
//! write buffer.

use std::net::SocketAddr;

use log::{debug, trace, warn};

use crate::daemon::{ConnectionId, DaemonShared, Dispatch, RequestEndReason};
use crate::pool::MemPool;

use super::headers::HeaderKind;
use super::request::{
    parse_chunk_size, Keepalive, ProtoError, QueuedResponse, Request, RespBodyMode, UNKNOWN_SIZE,
};
use super::response::{reason_phrase, ReaderResult, Response};
use super::RequestCtx;

/// Sent verbatim when the client asked for `Expect: 100-continue`.
pub(crate) const CONTINUE_MSG: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Largest chunk emitted for a chunked response; bounded by the fixed-width
/// size line below.
const MAX_CHUNK_DATA: usize = 0xffff;

/// Target size the write buffer is grown to before body staging.
const WRITE_BUFFER_TARGET: usize = 8 * 1024;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum State {
    Init,
    UrlReceived,
    HeaderPartReceived,
    HeadersReceived,
    HeadersProcessed,
    ContinueSending,
    ContinueSent,
    BodyReceived,
    FooterPartReceived,
    FootersReceived,
    HeadersSending,
    HeadersSent,
    NormalBodyReady,
    NormalBodyUnready,
    ChunkedBodyReady,
    ChunkedBodyUnready,
    BodySent,
    FootersSending,
    FootersSent,
    Upgrade,
    Closed,
    InCleanup,
}

/// What the connection should wait for next, published by `idle`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum EventLoopInfo {
    Read,
    Write,
    Block,
    Cleanup,
    Upgrade,
}

pub(crate) fn response_begun(req: &Request) -> bool {
    matches!(
        req.state,
        State::HeadersSending
            | State::HeadersSent
            | State::NormalBodyReady
            | State::NormalBodyUnready
            | State::ChunkedBodyReady
            | State::ChunkedBodyUnready
            | State::BodySent
            | State::FootersSending
            | State::FootersSent
            | State::Upgrade
    )
}

fn body_pending(req: &Request) -> bool {
    req.have_chunked_upload || req.remaining_upload_size > 0
}

/// Drive the state machine to fixpoint.  Not re-entrant per request; the
/// guard catches accidental recursion through application callbacks.
pub(crate) fn idle(
    req: &mut Request,
    pool: &mut MemPool,
    shared: &DaemonShared,
    cid: ConnectionId,
    peer: SocketAddr,
    read_closed: bool,
    is_tls: bool,
) {
    if req.in_idle {
        return;
    }
    req.in_idle = true;

    let info = loop {
        match req.state {
            State::Init => match req.take_line(pool) {
                Some(line) if line.is_empty() => continue,
                Some(line) => {
                    let logger = shared.uri_logger.as_deref();
                    match req.parse_request_line(&line, pool, logger) {
                        Ok(()) => {
                            trace!(
                                "request line: {} {}",
                                pool.str_of(req.method),
                                pool.str_of(req.url)
                            );
                            req.state = State::UrlReceived;
                        }
                        Err(e) => {
                            if protocol_error(req, pool, shared, is_tls, e).is_err() {
                                req.state = State::Closed;
                            }
                        }
                    }
                }
                None => {
                    if req.read_overflow {
                        if protocol_error(req, pool, shared, is_tls, ProtoError::HeadersTooLarge)
                            .is_err()
                        {
                            req.state = State::Closed;
                        }
                        continue;
                    }
                    if read_closed {
                        req.state = State::Closed;
                        continue;
                    }
                    break EventLoopInfo::Read;
                }
            },

            State::UrlReceived => match req.take_line(pool) {
                Some(line) if line.is_empty() => req.state = State::HeadersReceived,
                Some(line) => match req.begin_header_line(&line, pool) {
                    Ok(()) => req.state = State::HeaderPartReceived,
                    Err(e) => {
                        if protocol_error(req, pool, shared, is_tls, e).is_err() {
                            req.state = State::Closed;
                        }
                    }
                },
                None => match stall(req, read_closed, ProtoError::HeadersTooLarge) {
                    Stall::Wait => break EventLoopInfo::Read,
                    Stall::PeerGone => req.state = State::Closed,
                    Stall::Overflow(e) => {
                        if protocol_error(req, pool, shared, is_tls, e).is_err() {
                            req.state = State::Closed;
                        }
                    }
                },
            },

            State::HeaderPartReceived => {
                match header_continuation(req, pool, read_closed, HeaderKind::Header) {
                    ContOutcome::Committed => req.state = State::UrlReceived,
                    ContOutcome::Folded => {}
                    ContOutcome::NeedData => break EventLoopInfo::Read,
                    ContOutcome::Failed(e) => {
                        if protocol_error(req, pool, shared, is_tls, e).is_err() {
                            req.state = State::Closed;
                        }
                    }
                }
            }

            State::HeadersReceived => {
                req.parse_cookies(pool);
                match decide_framing(req, pool) {
                    Ok(()) => {}
                    Err(e) => {
                        if protocol_error(req, pool, shared, is_tls, e).is_err() {
                            req.state = State::Closed;
                        }
                        continue;
                    }
                }
                decide_keepalive(req, pool);
                if body_pending(req) {
                    if let Some(expect) = req.headers.lookup(pool, HeaderKind::Header, "expect") {
                        if !expect.eq_ignore_ascii_case("100-continue") {
                            if protocol_error(
                                req,
                                pool,
                                shared,
                                is_tls,
                                ProtoError::BadExpectation,
                            )
                            .is_err()
                            {
                                req.state = State::Closed;
                            }
                            continue;
                        }
                    }
                }
                req.state = State::HeadersProcessed;
            }

            State::HeadersProcessed => {
                if !req.headers_dispatched {
                    req.headers_dispatched = true;
                    match dispatch(req, pool, shared, cid, peer, None) {
                        Dispatch::Continue => {}
                        Dispatch::Abort => {
                            req.state = State::Closed;
                            continue;
                        }
                    }
                    if req.suspend_requested {
                        break EventLoopInfo::Block;
                    }
                }
                if req.response.is_some() {
                    if body_pending(req) {
                        // The upload will never be read; the framing is lost.
                        req.set_must_close();
                    }
                    if build_response(req, pool, shared, is_tls).is_err() {
                        req.state = State::Closed;
                    }
                    continue;
                }
                if !body_pending(req) {
                    req.state = State::BodyReceived;
                    continue;
                }
                let wants_continue = req
                    .headers
                    .lookup(pool, HeaderKind::Header, "expect")
                    .is_some()
                    && req.http_version == super::request::HttpVersion::Http11;
                req.state = if wants_continue {
                    req.continue_message_write_offset = 0;
                    State::ContinueSending
                } else {
                    State::ContinueSent
                };
            }

            State::ContinueSending => {
                if req.continue_message_write_offset == CONTINUE_MSG.len() {
                    req.state = State::ContinueSent;
                    continue;
                }
                break EventLoopInfo::Write;
            }

            State::ContinueSent => {
                let outcome = if req.have_chunked_upload {
                    chunked_upload_step(req, pool, shared, cid, peer, read_closed)
                } else {
                    identity_upload_step(req, pool, shared, cid, peer, read_closed)
                };
                match outcome {
                    UploadStep::Progress => {
                        if req.suspend_requested {
                            break EventLoopInfo::Block;
                        }
                    }
                    UploadStep::NeedData => break EventLoopInfo::Read,
                    UploadStep::Aborted => req.state = State::Closed,
                    UploadStep::Failed(e) => {
                        if protocol_error(req, pool, shared, is_tls, e).is_err() {
                            req.state = State::Closed;
                        }
                    }
                }
            }

            State::BodyReceived => {
                if !req.have_chunked_upload {
                    req.state = State::FootersReceived;
                    continue;
                }
                match req.take_line(pool) {
                    Some(line) if line.is_empty() => req.state = State::FootersReceived,
                    Some(line) => match req.begin_header_line(&line, pool) {
                        Ok(()) => req.state = State::FooterPartReceived,
                        Err(e) => {
                            if protocol_error(req, pool, shared, is_tls, e).is_err() {
                                req.state = State::Closed;
                            }
                        }
                    },
                    None => match stall(req, read_closed, ProtoError::HeadersTooLarge) {
                        Stall::Wait => break EventLoopInfo::Read,
                        Stall::PeerGone => req.state = State::Closed,
                        Stall::Overflow(e) => {
                            if protocol_error(req, pool, shared, is_tls, e).is_err() {
                                req.state = State::Closed;
                            }
                        }
                    },
                }
            }

            State::FooterPartReceived => {
                match header_continuation(req, pool, read_closed, HeaderKind::Footer) {
                    ContOutcome::Committed => req.state = State::BodyReceived,
                    ContOutcome::Folded => {}
                    ContOutcome::NeedData => break EventLoopInfo::Read,
                    ContOutcome::Failed(e) => {
                        if protocol_error(req, pool, shared, is_tls, e).is_err() {
                            req.state = State::Closed;
                        }
                    }
                }
            }

            State::FootersReceived => {
                if req.response.is_none() {
                    match dispatch(req, pool, shared, cid, peer, None) {
                        Dispatch::Continue => {}
                        Dispatch::Abort => {
                            req.state = State::Closed;
                            continue;
                        }
                    }
                    if req.suspend_requested {
                        break EventLoopInfo::Block;
                    }
                    if req.response.is_none() {
                        warn!("handler completed without queuing a response; closing");
                        req.state = State::Closed;
                        continue;
                    }
                }
                if build_response(req, pool, shared, is_tls).is_err() {
                    req.state = State::Closed;
                }
            }

            State::HeadersSending => {
                if req.write_buffer_send_offset < req.write_buffer_append_offset {
                    break EventLoopInfo::Write;
                }
                req.state = State::HeadersSent;
            }

            State::HeadersSent => {
                let is_upgrade = req
                    .response
                    .as_ref()
                    .map(|q| q.response.is_upgrade())
                    .unwrap_or(false);
                if is_upgrade {
                    req.state = State::Upgrade;
                    break EventLoopInfo::Upgrade;
                }
                req.write_buffer_send_offset = 0;
                req.write_buffer_append_offset = 0;
                req.state = match req.resp_body_mode {
                    RespBodyMode::None => {
                        // Nothing left to stage; give the tail back.
                        req.write_buffer = pool.shrink_last(req.write_buffer, 0);
                        State::BodySent
                    }
                    RespBodyMode::Chunked => {
                        grow_write_buffer_for_body(req, pool);
                        State::ChunkedBodyReady
                    }
                    RespBodyMode::Sized(_) | RespBodyMode::UntilClose => {
                        grow_write_buffer_for_body(req, pool);
                        State::NormalBodyReady
                    }
                };
            }

            State::NormalBodyReady => match normal_body_step(req, pool) {
                BodyStep::Staged => break EventLoopInfo::Write,
                BodyStep::Finished => req.state = State::BodySent,
                BodyStep::NotReady => {
                    req.state = State::NormalBodyUnready;
                    break EventLoopInfo::Block;
                }
                BodyStep::Failed => req.state = State::Closed,
            },

            State::NormalBodyUnready => {
                // Sendfile stalls wait for the socket; callback stalls wait
                // for the application to resume us.
                break if req.resp_sendfile {
                    EventLoopInfo::Write
                } else {
                    EventLoopInfo::Block
                };
            }

            State::ChunkedBodyReady => match chunked_body_step(req, pool) {
                BodyStep::Staged => break EventLoopInfo::Write,
                BodyStep::Finished => req.state = State::BodySent,
                BodyStep::NotReady => {
                    req.state = State::ChunkedBodyUnready;
                    break EventLoopInfo::Block;
                }
                BodyStep::Failed => req.state = State::Closed,
            },

            State::ChunkedBodyUnready => break EventLoopInfo::Block,

            State::BodySent => {
                if req.resp_body_mode == RespBodyMode::Chunked {
                    if stage_chunked_terminator(req, pool).is_err() {
                        req.state = State::Closed;
                        continue;
                    }
                    req.state = State::FootersSending;
                } else {
                    req.state = State::FootersSent;
                }
            }

            State::FootersSending => {
                if req.write_buffer_send_offset < req.write_buffer_append_offset {
                    break EventLoopInfo::Write;
                }
                req.state = State::FootersSent;
            }

            State::FootersSent => {
                req.completion_notified = true;
                if let Some(cb) = &shared.notify_completed {
                    cb(cid, RequestEndReason::Completed);
                }
                if req.keepalive == Keepalive::MustClose {
                    req.state = State::Closed;
                    continue;
                }
                keep_alive_reset(req, pool);
                trace!("keep-alive: recycled for next request");
            }

            State::Upgrade => break EventLoopInfo::Upgrade,

            State::Closed | State::InCleanup => break EventLoopInfo::Cleanup,
        }
    };

    req.event_loop_info = info;
    req.in_idle = false;
}

enum Stall {
    Wait,
    PeerGone,
    Overflow(ProtoError),
}

fn stall(req: &Request, read_closed: bool, overflow: ProtoError) -> Stall {
    if req.read_overflow {
        Stall::Overflow(overflow)
    } else if read_closed {
        Stall::PeerGone
    } else {
        Stall::Wait
    }
}

enum ContOutcome {
    Committed,
    Folded,
    NeedData,
    Failed(ProtoError),
}

/// One step of the folded-header protocol: the stashed line is committed
/// once the first byte of the next line proves it is not a continuation.
fn header_continuation(
    req: &mut Request,
    pool: &mut MemPool,
    read_closed: bool,
    kind: HeaderKind,
) -> ContOutcome {
    if req.read_buffer_offset == 0 {
        return match stall(req, read_closed, ProtoError::HeadersTooLarge) {
            Stall::Wait => ContOutcome::NeedData,
            Stall::PeerGone => ContOutcome::Failed(ProtoError::BadRequest),
            Stall::Overflow(e) => ContOutcome::Failed(e),
        };
    }
    let first = pool.slice(req.read_buffer)[0];
    if first == b' ' || first == b'\t' {
        match req.take_line(pool) {
            Some(line) => match req.fold_header_line(&line, pool) {
                Ok(()) => ContOutcome::Folded,
                Err(e) => ContOutcome::Failed(e),
            },
            None => match stall(req, read_closed, ProtoError::HeadersTooLarge) {
                Stall::Wait => ContOutcome::NeedData,
                Stall::PeerGone => ContOutcome::Failed(ProtoError::BadRequest),
                Stall::Overflow(e) => ContOutcome::Failed(e),
            },
        }
    } else {
        req.commit_last_header(pool, kind);
        ContOutcome::Committed
    }
}

/// Body framing priority: chunked transfer-encoding, then content-length,
/// then no body.  Conflicting framing is fatal for the request.
pub(crate) fn decide_framing(req: &mut Request, pool: &MemPool) -> Result<(), ProtoError> {
    let chunked = req
        .headers
        .any_token(pool, HeaderKind::Header, "transfer-encoding", "chunked");
    let te_present = req
        .headers
        .lookup(pool, HeaderKind::Header, "transfer-encoding")
        .is_some();
    let cl = req.headers.lookup(pool, HeaderKind::Header, "content-length");

    if chunked {
        if cl.is_some() {
            return Err(ProtoError::BadRequest);
        }
        req.have_chunked_upload = true;
        req.remaining_upload_size = UNKNOWN_SIZE;
        return Ok(());
    }
    if te_present {
        return Err(ProtoError::BadRequest);
    }
    match cl {
        Some(v) => {
            req.remaining_upload_size = v.trim().parse().map_err(|_| ProtoError::BadRequest)?;
        }
        None => req.remaining_upload_size = 0,
    }
    Ok(())
}

/// Request-side keep-alive default.  The response side can still force a
/// close later; the other direction never happens.
pub(crate) fn decide_keepalive(req: &mut Request, pool: &MemPool) {
    use super::request::HttpVersion;
    let close = req
        .headers
        .any_token(pool, HeaderKind::Header, "connection", "close");
    let keep = req
        .headers
        .any_token(pool, HeaderKind::Header, "connection", "keep-alive");
    let ka = match req.http_version {
        HttpVersion::Http11 => !close,
        HttpVersion::Http10 => keep && !close,
    };
    if !ka {
        req.set_must_close();
    } else if req.keepalive == Keepalive::Unknown {
        req.keepalive = Keepalive::KeepAlive;
    }
}

enum UploadStep {
    Progress,
    NeedData,
    Aborted,
    Failed(ProtoError),
}

fn identity_upload_step(
    req: &mut Request,
    pool: &mut MemPool,
    shared: &DaemonShared,
    cid: ConnectionId,
    peer: SocketAddr,
    read_closed: bool,
) -> UploadStep {
    if req.remaining_upload_size == 0 {
        req.state = State::BodyReceived;
        return UploadStep::Progress;
    }
    let avail = (req.read_buffer_offset as u64).min(req.remaining_upload_size) as usize;
    if avail == 0 {
        if read_closed {
            return UploadStep::Aborted;
        }
        return UploadStep::NeedData;
    }
    match dispatch(req, pool, shared, cid, peer, Some(avail)) {
        Dispatch::Continue => {}
        Dispatch::Abort => return UploadStep::Aborted,
    }
    req.consume(pool, avail);
    req.remaining_upload_size -= avail as u64;
    UploadStep::Progress
}

fn chunked_upload_step(
    req: &mut Request,
    pool: &mut MemPool,
    shared: &DaemonShared,
    cid: ConnectionId,
    peer: SocketAddr,
    read_closed: bool,
) -> UploadStep {
    // Mid-chunk: hand data to the application as it arrives.
    if req.current_chunk_offset < req.current_chunk_size {
        let want = req.current_chunk_size - req.current_chunk_offset;
        let avail = req.read_buffer_offset.min(want);
        if avail == 0 {
            if read_closed {
                return UploadStep::Aborted;
            }
            return UploadStep::NeedData;
        }
        match dispatch(req, pool, shared, cid, peer, Some(avail)) {
            Dispatch::Continue => {}
            Dispatch::Abort => return UploadStep::Aborted,
        }
        req.consume(pool, avail);
        req.current_chunk_offset += avail;
        return UploadStep::Progress;
    }

    // Chunk data complete: its trailing CRLF is an empty "line".
    if req.current_chunk_size > 0 {
        return match req.take_line(pool) {
            Some(line) if line.is_empty() => {
                req.current_chunk_size = 0;
                req.current_chunk_offset = 0;
                UploadStep::Progress
            }
            Some(_) => UploadStep::Failed(ProtoError::BadRequest),
            None => {
                if req.read_overflow {
                    UploadStep::Failed(ProtoError::PayloadTooLarge)
                } else if read_closed {
                    UploadStep::Aborted
                } else {
                    UploadStep::NeedData
                }
            }
        };
    }

    // Expect a chunk-size line.
    match req.take_line(pool) {
        Some(line) => match parse_chunk_size(&line) {
            Ok(0) => {
                req.remaining_upload_size = 0;
                req.state = State::BodyReceived;
                UploadStep::Progress
            }
            Ok(n) => {
                req.current_chunk_size = n;
                req.current_chunk_offset = 0;
                UploadStep::Progress
            }
            Err(e) => UploadStep::Failed(e),
        },
        None => {
            if req.read_overflow {
                UploadStep::Failed(ProtoError::PayloadTooLarge)
            } else if read_closed {
                UploadStep::Aborted
            } else {
                UploadStep::NeedData
            }
        }
    }
}

fn dispatch(
    req: &mut Request,
    pool: &MemPool,
    shared: &DaemonShared,
    cid: ConnectionId,
    peer: SocketAddr,
    upload_len: Option<usize>,
) -> Dispatch {
    let rb = req.read_buffer;
    let upload = upload_len.map(|n| &pool.slice(rb)[..n]);
    let mut ctx = RequestCtx {
        pool,
        req,
        upload,
        cid,
        peer,
    };
    shared.handler.handle(&mut ctx)
}

/// Build a minimal error response unless bytes already went out, in which
/// case the caller tears the connection down.
fn protocol_error(
    req: &mut Request,
    pool: &mut MemPool,
    shared: &DaemonShared,
    is_tls: bool,
    err: ProtoError,
) -> Result<(), ()> {
    if response_begun(req) {
        return Err(());
    }
    let status = err.status();
    debug!("protocol error {status}: {err:?}");
    let resp = Response::from_static(error_body(status));
    resp.add_header("Content-Type", "text/plain");
    req.response = Some(QueuedResponse {
        status,
        response: resp,
    });
    req.set_must_close();
    build_response(req, pool, shared, is_tls)
}

fn error_body(status: u16) -> &'static [u8] {
    match status {
        400 => b"400 Bad Request",
        413 => b"413 Payload Too Large",
        417 => b"417 Expectation Failed",
        431 => b"431 Request Header Fields Too Large",
        505 => b"505 HTTP Version Not Supported",
        _ => b"500 Internal Server Error",
    }
}

/// Serialize the status line and headers into the write buffer and fix the
/// response body transmission mode.
fn build_response(
    req: &mut Request,
    pool: &mut MemPool,
    shared: &DaemonShared,
    is_tls: bool,
) -> Result<(), ()> {
    use super::request::HttpVersion;

    let (status, resp) = match &req.response {
        Some(q) => (q.status, q.response.clone()),
        None => return Err(()),
    };

    if resp.header_has_token("connection", "close") {
        req.set_must_close();
    }

    let size = resp.size();
    let upgrade = resp.is_upgrade();
    let bodyless_status = status < 200 || status == 204 || status == 304;

    // Wire framing, independent of whether we actually transmit (HEAD).
    let framing = if upgrade || bodyless_status {
        RespBodyMode::None
    } else {
        match size {
            Some(sz) => RespBodyMode::Sized(sz),
            None => {
                if req.http_version == HttpVersion::Http11 {
                    RespBodyMode::Chunked
                } else {
                    req.set_must_close();
                    RespBodyMode::UntilClose
                }
            }
        }
    };
    req.resp_body_mode = if req.is_head { RespBodyMode::None } else { framing };
    req.resp_sendfile = cfg!(target_os = "linux")
        && !is_tls
        && !req.is_head
        && matches!(framing, RespBodyMode::Sized(_))
        && resp.file_raw().is_some();

    let mut head = String::with_capacity(256);
    head.push_str("HTTP/1.1 ");
    head.push_str(&status.to_string());
    head.push(' ');
    head.push_str(reason_phrase(status));
    head.push_str("\r\n");

    let mut have_date = false;
    let mut have_length = false;
    let mut have_te = false;
    let mut have_connection_close = false;
    for (name, value) in resp.header_snapshot() {
        if name.eq_ignore_ascii_case("date") {
            have_date = true;
        } else if name.eq_ignore_ascii_case("content-length") {
            have_length = true;
        } else if name.eq_ignore_ascii_case("transfer-encoding") {
            have_te = true;
        } else if name.eq_ignore_ascii_case("connection") {
            have_connection_close = true;
        }
        head.push_str(&name);
        head.push_str(": ");
        head.push_str(&value);
        head.push_str("\r\n");
    }

    if !have_date && !shared.suppress_date {
        head.push_str("Date: ");
        head.push_str(&httpdate::fmt_http_date(std::time::SystemTime::now()));
        head.push_str("\r\n");
    }
    match framing {
        RespBodyMode::Sized(sz) if !have_length => {
            head.push_str("Content-Length: ");
            head.push_str(&sz.to_string());
            head.push_str("\r\n");
        }
        RespBodyMode::Chunked if !have_te => {
            head.push_str("Transfer-Encoding: chunked\r\n");
        }
        _ => {}
    }
    if !upgrade && !have_connection_close {
        if req.keepalive == Keepalive::MustClose {
            head.push_str("Connection: close\r\n");
        } else if req.http_version == HttpVersion::Http10 {
            // Only reached when the client asked to keep the socket open.
            head.push_str("Connection: Keep-Alive\r\n");
        }
    }
    head.push_str("\r\n");

    match pool.store(head.as_bytes()) {
        Some(region) => {
            req.write_buffer = region;
            req.write_buffer_append_offset = region.len;
            req.write_buffer_send_offset = 0;
            req.response_write_position = 0;
            req.state = State::HeadersSending;
            Ok(())
        }
        None => {
            warn!("pool exhausted while serializing response headers");
            Err(())
        }
    }
}

/// After the headers drain the same region becomes the body staging area;
/// make it comfortable if the pool still has room.
fn grow_write_buffer_for_body(req: &mut Request, pool: &mut MemPool) {
    if req.write_buffer.len >= WRITE_BUFFER_TARGET {
        return;
    }
    let target = (req.write_buffer.len + pool.free()).min(WRITE_BUFFER_TARGET);
    if target > req.write_buffer.len {
        if let Some(r) = pool.reallocate(req.write_buffer, target) {
            req.write_buffer = r;
        }
    }
}

enum BodyStep {
    Staged,
    Finished,
    NotReady,
    Failed,
}

fn normal_body_step(req: &mut Request, pool: &mut MemPool) -> BodyStep {
    let resp = match &req.response {
        Some(q) => q.response.clone(),
        None => return BodyStep::Failed,
    };
    if let RespBodyMode::Sized(sz) = req.resp_body_mode {
        if req.response_write_position >= sz {
            return BodyStep::Finished;
        }
    }
    if req.write_buffer_send_offset < req.write_buffer_append_offset {
        return BodyStep::Staged;
    }
    if req.resp_sendfile {
        // handle_write splices straight from the file descriptor.
        return BodyStep::Staged;
    }

    req.write_buffer_send_offset = 0;
    req.write_buffer_append_offset = 0;
    let mut space = req.write_buffer.len;
    if let RespBodyMode::Sized(sz) = req.resp_body_mode {
        space = space.min((sz - req.response_write_position) as usize);
    }
    if space == 0 {
        return BodyStep::Failed;
    }
    let region = req.write_buffer;
    let pos = req.response_write_position;
    let outcome = {
        let buf = &mut pool.slice_mut(region)[..space];
        resp.read_body(pos, buf)
    };
    match outcome {
        ReaderResult::Data(0) | ReaderResult::NotReady => BodyStep::NotReady,
        ReaderResult::Data(n) => {
            req.write_buffer_append_offset = n;
            req.response_write_position += n as u64;
            BodyStep::Staged
        }
        ReaderResult::End => match req.resp_body_mode {
            RespBodyMode::UntilClose => BodyStep::Finished,
            RespBodyMode::Sized(_) => {
                warn!("response body ended before its declared size");
                BodyStep::Failed
            }
            _ => BodyStep::Finished,
        },
        ReaderResult::Error => BodyStep::Failed,
    }
}

fn chunked_body_step(req: &mut Request, pool: &mut MemPool) -> BodyStep {
    let resp = match &req.response {
        Some(q) => q.response.clone(),
        None => return BodyStep::Failed,
    };
    if req.write_buffer_send_offset < req.write_buffer_append_offset {
        return BodyStep::Staged;
    }
    req.write_buffer_send_offset = 0;
    req.write_buffer_append_offset = 0;

    let region = req.write_buffer;
    if region.len < 16 {
        return BodyStep::Failed;
    }
    let max_data = (region.len - 8).min(MAX_CHUNK_DATA);
    let pos = req.response_write_position;
    let outcome = {
        let buf = pool.slice_mut(region);
        resp.read_body(pos, &mut buf[6..6 + max_data])
    };
    match outcome {
        ReaderResult::Data(0) | ReaderResult::NotReady => BodyStep::NotReady,
        ReaderResult::Data(n) => {
            let buf = pool.slice_mut(region);
            let header = format!("{n:04x}\r\n");
            buf[..6].copy_from_slice(header.as_bytes());
            buf[6 + n] = b'\r';
            buf[6 + n + 1] = b'\n';
            req.write_buffer_append_offset = 6 + n + 2;
            req.response_write_position += n as u64;
            BodyStep::Staged
        }
        ReaderResult::End => BodyStep::Finished,
        ReaderResult::Error => BodyStep::Failed,
    }
}

/// Terminating zero chunk plus any response trailers.
fn stage_chunked_terminator(req: &mut Request, pool: &mut MemPool) -> Result<(), ()> {
    let resp = match &req.response {
        Some(q) => q.response.clone(),
        None => return Err(()),
    };
    let mut tail = String::from("0\r\n");
    for (name, value) in resp.trailer_snapshot() {
        tail.push_str(&name);
        tail.push_str(": ");
        tail.push_str(&value);
        tail.push_str("\r\n");
    }
    tail.push_str("\r\n");

    req.write_buffer_send_offset = 0;
    req.write_buffer_append_offset = 0;
    if req.write_buffer.len < tail.len() {
        match pool.reallocate(req.write_buffer, tail.len()) {
            Some(r) => req.write_buffer = r,
            None => return Err(()),
        }
    }
    let region = req.write_buffer;
    pool.slice_mut(region)[..tail.len()].copy_from_slice(tail.as_bytes());
    req.write_buffer_append_offset = tail.len();
    Ok(())
}

/// End of a kept-alive request: recycle the pool and rebuild the request in
/// place.  Bytes of a pipelined follow-up request survive the reset.
fn keep_alive_reset(req: &mut Request, pool: &mut MemPool) {
    let leftover = pool.slice(req.read_buffer)[..req.read_buffer_offset].to_vec();
    pool.reset();
    *req = Request::new();
    req.ensure_read_buffer(pool);
    if req.read_buffer.len < leftover.len() {
        if let Some(r) = pool.reallocate(req.read_buffer, leftover.len()) {
            req.read_buffer = r;
        }
    }
    let n = leftover.len().min(req.read_buffer.len);
    pool.slice_mut(req.read_buffer)[..n].copy_from_slice(&leftover[..n]);
    req.read_buffer_offset = n;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::HttpVersion;

    fn req_with_headers(pool: &mut MemPool, lines: &[(&str, &str)]) -> Request {
        let mut req = Request::new();
        for (name, value) in lines {
            let line = format!("{name}: {value}");
            req.begin_header_line(line.as_bytes(), pool).unwrap();
            req.commit_last_header(pool, HeaderKind::Header);
        }
        req
    }

    #[test]
    fn framing_prefers_chunked_and_rejects_conflicts() {
        let mut pool = MemPool::new(2048);
        let mut req = req_with_headers(&mut pool, &[("Transfer-Encoding", "chunked")]);
        decide_framing(&mut req, &pool).unwrap();
        assert!(req.have_chunked_upload);
        assert_eq!(req.remaining_upload_size, UNKNOWN_SIZE);

        let mut req = req_with_headers(
            &mut pool,
            &[("Transfer-Encoding", "chunked"), ("Content-Length", "5")],
        );
        assert_eq!(decide_framing(&mut req, &pool), Err(ProtoError::BadRequest));
    }

    #[test]
    fn framing_parses_content_length() {
        let mut pool = MemPool::new(2048);
        let mut req = req_with_headers(&mut pool, &[("Content-Length", "42")]);
        decide_framing(&mut req, &pool).unwrap();
        assert_eq!(req.remaining_upload_size, 42);

        let mut req = req_with_headers(&mut pool, &[("Content-Length", "nope")]);
        assert_eq!(decide_framing(&mut req, &pool), Err(ProtoError::BadRequest));
    }

    #[test]
    fn keepalive_defaults_per_version() {
        let mut pool = MemPool::new(2048);

        let mut req = req_with_headers(&mut pool, &[]);
        req.http_version = HttpVersion::Http11;
        decide_keepalive(&mut req, &pool);
        assert_eq!(req.keepalive, Keepalive::KeepAlive);

        let mut req = req_with_headers(&mut pool, &[]);
        req.http_version = HttpVersion::Http10;
        decide_keepalive(&mut req, &pool);
        assert_eq!(req.keepalive, Keepalive::MustClose);

        let mut req = req_with_headers(&mut pool, &[("Connection", "keep-alive")]);
        req.http_version = HttpVersion::Http10;
        decide_keepalive(&mut req, &pool);
        assert_eq!(req.keepalive, Keepalive::KeepAlive);
    }

    #[test]
    fn close_token_wins_over_keep_alive() {
        let mut pool = MemPool::new(2048);
        let mut req = req_with_headers(
            &mut pool,
            &[("Connection", "close"), ("Connection", "keep-alive")],
        );
        req.http_version = HttpVersion::Http11;
        decide_keepalive(&mut req, &pool);
        assert_eq!(req.keepalive, Keepalive::MustClose);
    }

    #[test]
    fn keepalive_never_reverts() {
        let mut pool = MemPool::new(2048);
        let mut req = req_with_headers(&mut pool, &[]);
        req.http_version = HttpVersion::Http11;
        req.set_must_close();
        decide_keepalive(&mut req, &pool);
        assert_eq!(req.keepalive, Keepalive::MustClose);
    }

    #[test]
    fn keep_alive_reset_preserves_pipelined_bytes() {
        let mut pool = MemPool::new(4096);
        let mut req = Request::new();
        req.ensure_read_buffer(&mut pool);
        let tail = b"GET /second HTTP/1.1\r\n\r\n";
        pool.slice_mut(req.read_buffer)[..tail.len()].copy_from_slice(tail);
        req.read_buffer_offset = tail.len();
        req.keepalive = Keepalive::KeepAlive;

        keep_alive_reset(&mut req, &mut pool);
        assert_eq!(req.state, State::Init);
        assert_eq!(req.keepalive, Keepalive::Unknown);
        assert_eq!(
            &pool.slice(req.read_buffer)[..req.read_buffer_offset],
            tail
        );
    }
}
