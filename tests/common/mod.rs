#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

/// Minimal raw HTTP client for exercising the daemon over a real socket.
pub struct Client {
    stream: TcpStream,
    buf: Vec<u8>,
}

pub struct Reply {
    pub head: String,
    pub body: Vec<u8>,
    pub trailers: String,
}

impl Reply {
    pub fn status(&self) -> u16 {
        self.head
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }

    pub fn header(&self, name: &str) -> Option<String> {
        for line in self.head.lines().skip(1) {
            if let Some((n, v)) = line.split_once(':') {
                if n.trim().eq_ignore_ascii_case(name) {
                    return Some(v.trim().to_string());
                }
            }
        }
        None
    }

    pub fn connection_has(&self, token: &str) -> bool {
        self.header("connection")
            .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
            .unwrap_or(false)
    }

    pub fn is_chunked(&self) -> bool {
        self.header("transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
    }

    pub fn content_length(&self) -> Option<usize> {
        self.header("content-length").and_then(|v| v.parse().ok())
    }
}

pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|w| w == needle)
}

impl Client {
    pub fn connect(addr: SocketAddr) -> Client {
        let stream = TcpStream::connect(addr).expect("connect to daemon");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream.set_nodelay(true).unwrap();
        Client {
            stream,
            buf: Vec::new(),
        }
    }

    pub fn send(&mut self, data: &[u8]) {
        self.stream.write_all(data).expect("write to daemon");
        self.stream.flush().unwrap();
    }

    /// One read from the socket into the buffer; 0 means EOF.
    fn fill(&mut self) -> usize {
        let mut tmp = [0u8; 8192];
        match self.stream.read(&mut tmp) {
            Ok(n) => {
                self.buf.extend_from_slice(&tmp[..n]);
                n
            }
            Err(e) => panic!("read from daemon failed: {e}"),
        }
    }

    /// Index just past `needle`, filling from the socket as needed.
    fn read_until(&mut self, needle: &[u8]) -> usize {
        loop {
            if let Some(pos) = find(&self.buf, needle) {
                return pos + needle.len();
            }
            assert!(self.fill() > 0, "eof while waiting for {needle:?}");
        }
    }

    fn take(&mut self, n: usize) -> Vec<u8> {
        while self.buf.len() < n {
            assert!(self.fill() > 0, "eof while reading {n} bytes");
        }
        let rest = self.buf.split_off(n);
        core::mem::replace(&mut self.buf, rest)
    }

    /// Read one full response, decoding content-length and chunked framing.
    /// A response with neither is read to EOF (close-delimited).
    pub fn read_reply(&mut self) -> Reply {
        let mut reply = self.read_head();
        if reply.is_chunked() {
            let (body, trailers) = self.read_chunked_body();
            reply.body = body;
            reply.trailers = trailers;
        } else if let Some(cl) = reply.content_length() {
            reply.body = self.take(cl);
        } else {
            reply.body = self.read_to_eof();
        }
        reply
    }

    /// Headers only; for HEAD responses and upgrades.
    pub fn read_head(&mut self) -> Reply {
        let head_end = self.read_until(b"\r\n\r\n");
        let head_bytes = self.take(head_end);
        Reply {
            head: String::from_utf8_lossy(&head_bytes).to_string(),
            body: Vec::new(),
            trailers: String::new(),
        }
    }

    fn read_chunked_body(&mut self) -> (Vec<u8>, String) {
        let mut body = Vec::new();
        loop {
            let line_end = self.read_until(b"\r\n");
            let line = self.take(line_end);
            let size_str = String::from_utf8_lossy(&line[..line.len() - 2]).to_string();
            let size =
                usize::from_str_radix(size_str.split(';').next().unwrap().trim(), 16).unwrap();
            if size == 0 {
                // Trailer lines up to the blank terminator.
                let mut trailers = String::new();
                loop {
                    let line_end = self.read_until(b"\r\n");
                    let line = self.take(line_end);
                    if line == b"\r\n" {
                        break;
                    }
                    trailers.push_str(&String::from_utf8_lossy(&line));
                }
                return (body, trailers);
            }
            let mut data = self.take(size + 2);
            assert_eq!(&data[size..], b"\r\n", "chunk not CRLF-terminated");
            data.truncate(size);
            body.extend_from_slice(&data);
        }
    }

    pub fn read_to_eof(&mut self) -> Vec<u8> {
        loop {
            if self.fill() == 0 {
                return core::mem::take(&mut self.buf);
            }
        }
    }

    /// The server must close without sending anything further.
    pub fn expect_eof(&mut self) {
        assert_eq!(self.fill(), 0, "expected eof, server sent more data");
    }
}
