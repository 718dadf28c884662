//! Wire adapter: the narrow seam between the connection state machine and
//! the transport.  Plaintext talks to the socket directly; TLS delegates to
//! a pluggable record layer.  Either way the state machine only ever sees
//! the four outcomes below.

use std::io::{self, ErrorKind, Read, Write};
use std::net::Shutdown;

use mio::net::TcpStream;

pub enum RecvOutcome {
    /// Bytes landed in the destination buffer.
    Data(usize),
    /// Orderly close from the peer.
    Closed,
    /// No progress now; retry on the next readiness event.
    WouldBlock,
    Err(io::Error),
}

pub enum SendOutcome {
    Data(usize),
    WouldBlock,
    Err(io::Error),
}

/// Record layer supplied by a TLS backend.  The backend may need to write
/// in order to read (renegotiation, session tickets); it signals that as
/// `WouldBlock` and the state machine treats it like any other stall.
pub trait TlsSession: Send {
    fn recv(&mut self, stream: &mut TcpStream, dst: &mut [u8]) -> RecvOutcome;
    fn send(&mut self, stream: &mut TcpStream, src: &[u8]) -> SendOutcome;
    /// Best-effort close_notify.  Called before the TCP shutdown.
    fn shutdown(&mut self, stream: &mut TcpStream);
}

pub enum WireAdapter {
    Plain,
    Tls(Box<dyn TlsSession>),
}

impl WireAdapter {
    pub fn is_tls(&self) -> bool {
        matches!(self, WireAdapter::Tls(_))
    }

    pub fn recv(&mut self, stream: &mut TcpStream, dst: &mut [u8]) -> RecvOutcome {
        match self {
            WireAdapter::Plain => loop {
                match stream.read(dst) {
                    Ok(0) => return RecvOutcome::Closed,
                    Ok(n) => return RecvOutcome::Data(n),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {
                        return RecvOutcome::WouldBlock;
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => return RecvOutcome::Err(e),
                }
            },
            WireAdapter::Tls(session) => session.recv(stream, dst),
        }
    }

    pub fn send(&mut self, stream: &mut TcpStream, src: &[u8]) -> SendOutcome {
        match self {
            WireAdapter::Plain => loop {
                match stream.write(src) {
                    Ok(n) => return SendOutcome::Data(n),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {
                        return SendOutcome::WouldBlock;
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => return SendOutcome::Err(e),
                }
            },
            WireAdapter::Tls(session) => session.send(stream, src),
        }
    }

    /// Orderly shutdown of the write side.  Skipped entirely in turbo mode;
    /// the peer learns about the close from the FIN the kernel emits when
    /// the socket drops.
    pub fn shutdown(&mut self, stream: &mut TcpStream) {
        if let WireAdapter::Tls(session) = self {
            session.shutdown(stream);
        }
        let _ = stream.shutdown(Shutdown::Both);
    }
}
