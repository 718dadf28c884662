//! Chunked transfer-encoding in both directions, including trailers.

mod common;

use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use common::Client;
use httpd_core::{
    Daemon, DaemonOptions, Dispatch, ReaderResult, RequestCtx, RequestHandler, Response,
};

/// Accumulates the upload across dispatches and answers with
/// `<received bytes>|<trailer value>` once the body is complete.
struct UploadCollector;

struct UploadState {
    data: Vec<u8>,
    header_call_seen: bool,
}

impl RequestHandler for UploadCollector {
    fn handle(&self, req: &mut RequestCtx<'_>) -> Dispatch {
        if req.state_mut::<UploadState>().is_none() {
            req.set_state(UploadState {
                data: Vec::new(),
                header_call_seen: false,
            });
        }
        match req.upload_data() {
            Some(chunk) => {
                req.state_mut::<UploadState>().unwrap().data.extend_from_slice(chunk);
                Dispatch::Continue
            }
            None => {
                let state = req.state_mut::<UploadState>().unwrap();
                if !state.header_call_seen {
                    state.header_call_seen = true;
                    return Dispatch::Continue;
                }
                let mut body = state.data.clone();
                body.push(b'|');
                let trailer = req.footer("x-checksum").unwrap_or("-").to_string();
                body.extend_from_slice(trailer.as_bytes());
                req.queue_response(200, Response::from_buffer(body));
                Dispatch::Continue
            }
        }
    }
}

#[test]
fn chunked_upload_with_trailer_reaches_handler() {
    let daemon = Daemon::start(DaemonOptions::default(), UploadCollector).unwrap();
    let mut client = Client::connect(daemon.local_addr());

    client.send(
        b"POST /upload HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n",
    );
    client.send(b"5\r\nHello\r\n");
    thread::sleep(Duration::from_millis(50));
    client.send(b"0\r\nX-Checksum: abc123\r\n\r\n");

    let reply = client.read_reply();
    assert_eq!(reply.status(), 200);
    assert_eq!(reply.body, b"Hello|abc123");
    daemon.stop();
}

#[test]
fn chunked_upload_split_mid_chunk_is_reassembled() {
    let daemon = Daemon::start(DaemonOptions::default(), UploadCollector).unwrap();
    let mut client = Client::connect(daemon.local_addr());

    client.send(
        b"POST /upload HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n",
    );
    // Size line alone, then the data in two pieces, with pauses so the
    // server observes every partial state.
    client.send(b"B\r\n");
    thread::sleep(Duration::from_millis(50));
    client.send(b"Rust ");
    thread::sleep(Duration::from_millis(50));
    client.send(b"Stream\r\n");
    thread::sleep(Duration::from_millis(50));
    client.send(b"0\r\n\r\n");

    let reply = client.read_reply();
    assert_eq!(reply.status(), 200);
    assert_eq!(reply.body, b"Rust Stream|-");
    daemon.stop();
}

#[test]
fn chunk_extensions_are_ignored() {
    let daemon = Daemon::start(DaemonOptions::default(), UploadCollector).unwrap();
    let mut client = Client::connect(daemon.local_addr());

    client.send(
        b"POST /upload HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n\
          5;name=value\r\nHello\r\n0\r\n\r\n",
    );
    let reply = client.read_reply();
    assert_eq!(reply.status(), 200);
    assert_eq!(reply.body, b"Hello|-");
    daemon.stop();
}

#[test]
fn conflicting_framing_is_rejected() {
    let daemon = Daemon::start(DaemonOptions::default(), UploadCollector).unwrap();
    let mut client = Client::connect(daemon.local_addr());

    client.send(
        b"POST /upload HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\
          Content-Length: 5\r\n\r\n",
    );
    let reply = client.read_reply();
    assert_eq!(reply.status(), 400);
    client.expect_eof();
    daemon.stop();
}

/// Streams a generated payload through the pull callback with no declared
/// size, which on HTTP/1.1 must go out chunked.
struct StreamingHandler {
    payload: Mutex<Vec<u8>>,
}

impl StreamingHandler {
    fn new(payload: Vec<u8>) -> StreamingHandler {
        StreamingHandler {
            payload: Mutex::new(payload),
        }
    }
}

impl RequestHandler for StreamingHandler {
    fn handle(&self, req: &mut RequestCtx<'_>) -> Dispatch {
        let payload = self.payload.lock().unwrap().clone();
        let resp = Response::from_callback(None, move |pos, buf| {
            let pos = pos as usize;
            if pos >= payload.len() {
                return ReaderResult::End;
            }
            // Deliberately odd-sized reads to exercise chunk framing.
            let n = buf.len().min(7001).min(payload.len() - pos);
            buf[..n].copy_from_slice(&payload[pos..pos + n]);
            ReaderResult::Data(n)
        });
        resp.add_trailer("X-Stream-End", "yes");
        req.queue_response(200, resp);
        Dispatch::Continue
    }
}

#[test]
fn unknown_size_response_is_chunked_and_round_trips() {
    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    let daemon = Daemon::start(
        DaemonOptions::default(),
        StreamingHandler::new(payload.clone()),
    )
    .unwrap();
    let mut client = Client::connect(daemon.local_addr());

    client.send(b"GET /stream HTTP/1.1\r\nHost: x\r\n\r\n");
    let reply = client.read_reply();
    assert_eq!(reply.status(), 200);
    assert!(reply.is_chunked());
    assert_eq!(reply.body.len(), payload.len());
    assert_eq!(reply.body, payload);
    assert!(reply.trailers.contains("X-Stream-End: yes"));
    daemon.stop();
}

#[test]
fn empty_streamed_response_sends_lone_terminator() {
    let daemon = Daemon::start(DaemonOptions::default(), StreamingHandler::new(Vec::new()))
        .unwrap();
    let mut client = Client::connect(daemon.local_addr());

    client.send(b"GET /empty HTTP/1.1\r\nHost: x\r\n\r\n");
    let reply = client.read_reply();
    assert_eq!(reply.status(), 200);
    assert!(reply.is_chunked());
    assert!(reply.body.is_empty());
    daemon.stop();
}

#[test]
fn http10_streams_until_close_instead_of_chunking() {
    let daemon = Daemon::start(
        DaemonOptions::default(),
        StreamingHandler::new(b"close-delimited".to_vec()),
    )
    .unwrap();
    let mut client = Client::connect(daemon.local_addr());

    client.send(b"GET /stream HTTP/1.0\r\n\r\n");
    let reply = client.read_reply();
    assert_eq!(reply.status(), 200);
    assert!(!reply.is_chunked());
    assert_eq!(reply.body, b"close-delimited");
    daemon.stop();
}
