//! One accepted socket and everything that hangs off it: the wire adapter,
//! the per-connection pool, the in-flight request, and the intrusive list
//! links the daemon threads it through.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use log::debug;
use mio::net::TcpStream;
use mio::Interest;

use crate::daemon::{ConnectionId, DaemonShared};
use crate::http::fsm::{self, EventLoopInfo, State, CONTINUE_MSG};
use crate::http::request::{Request, RespBodyMode};
use crate::lists::{Domain, HasLinks, Links};
use crate::pool::MemPool;
use crate::wire::{RecvOutcome, SendOutcome, WireAdapter};

/// IO-state list membership: always exactly one of these.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum IoList {
    Normal,
    Suspended,
    Cleanup,
}

/// Timeout list membership: daemon-default timeout or per-connection one.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum ToList {
    Default,
    Custom,
}

pub(crate) struct Connection {
    // The stream is declared before the pool on purpose: fields drop in
    // order, and the peer must see the close before the buffers that may
    // still back in-flight kernel pages (sendfile) are released.
    pub stream: TcpStream,
    pub wire: WireAdapter,
    pub pool: Option<MemPool>,
    pub request: Request,
    pub addr: SocketAddr,

    pub last_activity: Instant,
    /// Zero means "no timeout".
    pub connection_timeout: Duration,
    pub worker: usize,
    pub key: usize,
    pub generation: u64,

    pub suspended: bool,
    pub resuming: bool,
    pub read_closed: bool,
    pub wire_error: bool,
    pub timed_out: bool,
    /// Snapshot taken when the connection enters the cleanup list: was a
    /// request actually in flight (for the termination callback)?
    pub had_request_in_flight: bool,

    // Edge-triggered readiness latches; cleared only on would-block.
    pub read_ready: bool,
    pub write_ready: bool,
    pub in_ready_list: bool,

    pub io_list: IoList,
    pub to_list: Option<ToList>,
    pub registered: Option<Interest>,

    io_links: Links,
    to_links: Links,
    rd_links: Links,
}

impl HasLinks for Connection {
    fn links(&self, domain: Domain) -> &Links {
        match domain {
            Domain::Io => &self.io_links,
            Domain::Timeout => &self.to_links,
            Domain::Ready => &self.rd_links,
        }
    }
    fn links_mut(&mut self, domain: Domain) -> &mut Links {
        match domain {
            Domain::Io => &mut self.io_links,
            Domain::Timeout => &mut self.to_links,
            Domain::Ready => &mut self.rd_links,
        }
    }
}

impl Connection {
    pub fn new(
        stream: TcpStream,
        addr: SocketAddr,
        wire: WireAdapter,
        connection_timeout: Duration,
        worker: usize,
        generation: u64,
    ) -> Connection {
        Connection {
            stream,
            wire,
            pool: None,
            request: Request::new(),
            addr,
            last_activity: Instant::now(),
            connection_timeout,
            worker,
            key: 0,
            generation,
            suspended: false,
            resuming: false,
            read_closed: false,
            wire_error: false,
            timed_out: false,
            had_request_in_flight: false,
            read_ready: false,
            write_ready: false,
            in_ready_list: false,
            io_list: IoList::Normal,
            to_list: None,
            registered: None,
            io_links: Links::default(),
            to_links: Links::default(),
            rd_links: Links::default(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        ConnectionId {
            worker: self.worker,
            key: self.key,
            generation: self.generation,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn wants_read(&self) -> bool {
        self.request.event_loop_info == EventLoopInfo::Read
    }

    pub fn wants_write(&self) -> bool {
        self.request.event_loop_info == EventLoopInfo::Write
    }

    pub fn desired_interest(&self) -> Option<Interest> {
        if self.suspended {
            return None;
        }
        match self.request.event_loop_info {
            EventLoopInfo::Read => Some(Interest::READABLE),
            EventLoopInfo::Write => Some(Interest::WRITABLE),
            _ => None,
        }
    }

    /// Drain the socket into the read buffer until would-block, peer close,
    /// or the buffer (and pool) run out of room.
    pub fn handle_read(&mut self, pool_size: usize, increment: usize) {
        if self.read_closed || self.wire_error {
            self.read_ready = false;
            return;
        }
        let pool = self.pool.get_or_insert_with(|| MemPool::new(pool_size));
        let req = &mut self.request;
        req.ensure_read_buffer(pool);

        let mut progressed = false;
        loop {
            if req.read_space() == 0 {
                if !req.grow_read_buffer(pool, increment) {
                    // Buffer full and pool exhausted; readiness stays
                    // latched so we come back once the parser made room.
                    req.read_overflow = true;
                    break;
                }
            }
            let region = req.read_buffer;
            let off = req.read_buffer_offset;
            let dst = &mut pool.slice_mut(region)[off..];
            match self.wire.recv(&mut self.stream, dst) {
                RecvOutcome::Data(n) => {
                    req.read_buffer_offset += n;
                    progressed = true;
                }
                RecvOutcome::WouldBlock => {
                    self.read_ready = false;
                    break;
                }
                RecvOutcome::Closed => {
                    self.read_closed = true;
                    self.read_ready = false;
                    break;
                }
                RecvOutcome::Err(e) => {
                    debug!("recv failed on {}: {e}", self.addr);
                    self.read_closed = true;
                    self.wire_error = true;
                    self.read_ready = false;
                    break;
                }
            }
        }
        if progressed {
            self.touch();
        }
    }

    /// Push staged bytes (or the continue line, or spliced file data) out.
    pub fn handle_write(&mut self) {
        if self.wire_error {
            self.write_ready = false;
            return;
        }
        let mut progressed = false;

        if self.request.state == State::ContinueSending {
            let off = self.request.continue_message_write_offset;
            if off < CONTINUE_MSG.len() {
                match self.wire.send(&mut self.stream, &CONTINUE_MSG[off..]) {
                    SendOutcome::Data(n) => {
                        self.request.continue_message_write_offset += n;
                        progressed = true;
                    }
                    SendOutcome::WouldBlock => self.write_ready = false,
                    SendOutcome::Err(e) => {
                        debug!("send failed on {}: {e}", self.addr);
                        self.wire_error = true;
                    }
                }
            }
            if progressed {
                self.touch();
            }
            return;
        }

        if self.request.write_buffer_send_offset < self.request.write_buffer_append_offset {
            let req = &mut self.request;
            let pool = match &self.pool {
                Some(p) => p,
                None => return,
            };
            let data = &pool.slice(req.write_buffer)
                [req.write_buffer_send_offset..req.write_buffer_append_offset];
            match self.wire.send(&mut self.stream, data) {
                SendOutcome::Data(n) => {
                    req.write_buffer_send_offset += n;
                    progressed = true;
                }
                SendOutcome::WouldBlock => self.write_ready = false,
                SendOutcome::Err(e) => {
                    debug!("send failed on {}: {e}", self.addr);
                    self.wire_error = true;
                }
            }
            if progressed {
                self.touch();
            }
            return;
        }

        if self.request.resp_sendfile
            && matches!(
                self.request.state,
                State::NormalBodyReady | State::NormalBodyUnready
            )
        {
            self.sendfile_step();
        }
    }

    /// Advance the state machine on whatever is buffered.
    pub fn handle_idle(&mut self, shared: &DaemonShared) {
        let pool = self
            .pool
            .get_or_insert_with(|| MemPool::new(shared.pool_size));
        let cid = ConnectionId {
            worker: self.worker,
            key: self.key,
            generation: self.generation,
        };
        let eof = self.read_closed || self.wire_error;
        fsm::idle(
            &mut self.request,
            pool,
            shared,
            cid,
            self.addr,
            eof,
            self.wire.is_tls(),
        );
        if self.wire_error {
            self.request.state = State::Closed;
            self.request.event_loop_info = EventLoopInfo::Cleanup;
        }
    }

    #[cfg(target_os = "linux")]
    fn sendfile_step(&mut self) {
        use std::os::unix::io::AsRawFd;

        let (fd, base, size) = {
            let req = &self.request;
            let resp = match &req.response {
                Some(q) => &q.response,
                None => return,
            };
            let (fd, base) = match resp.file_raw() {
                Some(parts) => parts,
                None => return,
            };
            let size = match req.resp_body_mode {
                RespBodyMode::Sized(sz) => sz,
                _ => return,
            };
            (fd, base, size)
        };
        let pos = self.request.response_write_position;
        let remaining = size.saturating_sub(pos);
        if remaining == 0 {
            return;
        }
        let count = remaining.min(0x20_0000) as usize;
        let mut off = (base + pos) as libc::off_t;
        let sent = unsafe { libc::sendfile(self.stream.as_raw_fd(), fd, &mut off, count) };
        if sent > 0 {
            self.request.response_write_position += sent as u64;
            self.request.state = State::NormalBodyReady;
            self.touch();
        } else if sent == 0 {
            // File shorter than declared; the buffered path reports it.
            self.request.resp_sendfile = false;
            self.request.state = State::NormalBodyReady;
        } else {
            let errno = std::io::Error::last_os_error();
            match errno.raw_os_error() {
                Some(code) if code == libc::EAGAIN || code == libc::EWOULDBLOCK => {
                    // Short write: keep the file offset, wait for the socket.
                    self.write_ready = false;
                    self.request.state = State::NormalBodyUnready;
                }
                _ => {
                    debug!("sendfile failed on {}: {errno}; falling back", self.addr);
                    self.request.resp_sendfile = false;
                    self.request.state = State::NormalBodyReady;
                }
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn sendfile_step(&mut self) {
        self.request.resp_sendfile = false;
    }
}
