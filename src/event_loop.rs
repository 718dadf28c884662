//! The poll loop that drives every connection.
//!
//! One `EventLoop` instance exists per polling thread: exactly one for the
//! external and internal models, one per worker for the thread pool, and a
//! single-connection one per thread in the thread-per-connection model.
//! Readiness is edge-triggered, so per-connection latches remember events
//! until a would-block actually drains them; connections with latched,
//! wanted readiness wait in a FIFO ready list and the poll timeout drops to
//! zero until that list is empty.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use slab::Slab;

use crate::connection::{Connection, IoList, ToList};
use crate::daemon::{ConnectionEvent, DaemonShared, RequestEndReason};
use crate::error::Result;
use crate::http::fsm::{EventLoopInfo, State};
use crate::http::response::UpgradedStream;
use crate::itc::{Command, Itc, ItcHandle};
use crate::lists::{DList, Domain};
use crate::wire::WireAdapter;

// Slab keys count up from zero and never get near these.
const WAKER_TOKEN: Token = Token(usize::MAX - 1);
const LISTENER_TOKEN: Token = Token(usize::MAX - 2);

/// What to do with a freshly accepted socket.
pub(crate) enum AcceptMode {
    /// Insert into this loop's own slab.
    Local,
    /// Hand off round-robin to the pool workers through their mailboxes.
    Distribute { peers: Vec<ItcHandle>, next: usize },
    /// Spawn a dedicated thread running a single-connection loop.
    SpawnThread,
}

pub(crate) struct EventLoop {
    worker: usize,
    poll: Poll,
    events: Events,
    conns: Slab<Connection>,

    normal: DList,
    suspended: DList,
    cleanup: DList,
    to_default: DList,
    to_custom: DList,
    ready: DList,

    itc: ItcHandle,
    listener: Option<TcpListener>,
    accept_mode: AcceptMode,
    shared: Arc<DaemonShared>,
}

impl EventLoop {
    pub fn new(
        shared: Arc<DaemonShared>,
        mut listener: Option<TcpListener>,
        accept_mode: AcceptMode,
        worker: usize,
    ) -> Result<EventLoop> {
        let poll = Poll::new()?;
        let itc = Itc::new(poll.registry(), WAKER_TOKEN)?;
        if let Some(l) = &mut listener {
            poll.registry().register(l, LISTENER_TOKEN, Interest::READABLE)?;
        }
        shared.register_resumer(worker, itc.clone());
        Ok(EventLoop {
            worker,
            poll,
            events: Events::with_capacity(256),
            conns: Slab::new(),
            normal: DList::new(Domain::Io),
            suspended: DList::new(Domain::Io),
            cleanup: DList::new(Domain::Io),
            to_default: DList::new(Domain::Timeout),
            to_custom: DList::new(Domain::Timeout),
            ready: DList::new(Domain::Ready),
            itc,
            listener,
            accept_mode,
            shared,
        })
    }

    pub fn itc_handle(&self) -> ItcHandle {
        self.itc.clone()
    }

    pub fn set_accept_mode(&mut self, mode: AcceptMode) {
        self.accept_mode = mode;
    }

    /// Earliest idle-timeout deadline across both timeout lists.
    pub fn get_timeout(&self) -> Option<Duration> {
        let now = Instant::now();
        let mut min: Option<Duration> = None;
        let mut consider = |conn: &Connection| {
            if conn.connection_timeout.is_zero() {
                return;
            }
            let deadline = conn.last_activity + conn.connection_timeout;
            let left = deadline.saturating_duration_since(now);
            min = Some(match min {
                Some(m) => m.min(left),
                None => left,
            });
        };
        // The default list is ordered by activity; its head is the oldest.
        if let Some(key) = self.to_default.head() {
            consider(&self.conns[key]);
        }
        for key in self.to_custom.keys(&self.conns) {
            consider(&self.conns[key]);
        }
        min
    }

    /// One turn of the loop: poll, dispatch events, run the ready list,
    /// expire idlers, bury the dead.
    pub fn run_once(&mut self, max_wait: Option<Duration>) -> Result<()> {
        let mut timeout = self.get_timeout();
        if let Some(mw) = max_wait {
            timeout = Some(timeout.map_or(mw, |t| t.min(mw)));
        }
        if !self.ready.is_empty() {
            timeout = Some(Duration::ZERO);
        }

        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            if e.kind() != std::io::ErrorKind::Interrupted {
                return Err(e.into());
            }
        }

        let mut accept_ready = false;
        let mut notes: Vec<(usize, bool, bool, bool)> = Vec::new();
        for event in self.events.iter() {
            match event.token() {
                WAKER_TOKEN => {}
                LISTENER_TOKEN => accept_ready = true,
                tok => notes.push((
                    tok.0,
                    event.is_readable() || event.is_read_closed() || event.is_error(),
                    event.is_writable(),
                    event.is_error(),
                )),
            }
        }
        for (key, readable, writable, errored) in notes {
            let Some(conn) = self.conns.get_mut(key) else {
                continue;
            };
            if readable || errored {
                conn.read_ready = true;
            }
            if writable || errored {
                conn.write_ready = true;
            }
            if !conn.in_ready_list && !conn.suspended {
                conn.in_ready_list = true;
                self.ready.push_tail(&mut self.conns, key);
            }
        }

        self.drain_commands();
        if accept_ready {
            self.accept_loop();
        }
        self.process_ready();
        self.expire_timeouts();
        self.process_cleanup();
        Ok(())
    }

    /// Loop for the internal-thread and thread-pool models.
    pub fn run(&mut self) {
        while !self.shared.quiescing() {
            if let Err(e) = self.run_once(None) {
                warn!("event loop failed: {e}");
                break;
            }
        }
        self.shutdown_now();
    }

    /// Loop for a thread-per-connection thread: exits once its connection
    /// is gone.
    pub fn run_conn(&mut self) {
        while !self.shared.quiescing() && !self.conns.is_empty() {
            if let Err(e) = self.run_once(None) {
                warn!("connection thread loop failed: {e}");
                break;
            }
        }
        self.shutdown_now();
    }

    /// Close the listener, force every connection through cleanup, drain.
    pub fn shutdown_now(&mut self) {
        self.listener = None;
        let keys: Vec<usize> = self.conns.iter().map(|(k, _)| k).collect();
        for key in keys {
            self.move_to_cleanup(key);
        }
        self.process_cleanup();
    }

    fn drain_commands(&mut self) {
        for cmd in self.itc.drain() {
            match cmd {
                Command::NewConnection(stream, addr) => self.insert_connection(stream, addr),
                Command::Resume { key, generation } => self.resume_connection(key, generation),
                Command::Shutdown => {}
            }
        }
    }

    /// Adopt an accepted socket.  Accept-side accounting (active counter,
    /// per-IP counter) already happened; failure paths here must undo it.
    pub fn insert_connection(&mut self, stream: TcpStream, addr: std::net::SocketAddr) {
        if self.shared.quiescing() {
            self.shared.connection_gone(addr.ip());
            return;
        }
        let generation = self.shared.next_generation();
        let key = self.conns.vacant_key();
        let wire = match &self.shared.tls_factory {
            Some(factory) => WireAdapter::Tls(factory()),
            None => WireAdapter::Plain,
        };
        let mut conn = Connection::new(
            stream,
            addr,
            wire,
            self.shared.connection_timeout,
            self.worker,
            generation,
        );
        conn.key = key;
        if let Err(e) =
            self.poll
                .registry()
                .register(&mut conn.stream, Token(key), Interest::READABLE)
        {
            warn!("failed to register accepted socket: {e}");
            self.shared.connection_gone(addr.ip());
            return;
        }
        conn.registered = Some(Interest::READABLE);
        if self.shared.turbo {
            // Optimistic read before the poller ever reports readiness.
            conn.read_ready = true;
        }
        let turbo = self.shared.turbo;
        let inserted = self.conns.insert(conn);
        debug_assert_eq!(inserted, key);

        self.normal.push_tail(&mut self.conns, key);
        self.conns[key].io_list = IoList::Normal;
        self.to_default.push_tail(&mut self.conns, key);
        self.conns[key].to_list = Some(ToList::Default);
        if turbo {
            self.conns[key].in_ready_list = true;
            self.ready.push_tail(&mut self.conns, key);
        }

        trace!("connection from {addr} adopted by worker {}", self.worker);
        if let Some(cb) = &self.shared.notify_connection {
            cb(self.conns[key].id(), ConnectionEvent::Started);
        }
    }

    fn resume_connection(&mut self, key: usize, generation: u64) {
        let Some(conn) = self.conns.get_mut(key) else {
            return;
        };
        if conn.generation != generation || !conn.suspended {
            return;
        }
        conn.suspended = false;
        conn.resuming = true;
        conn.touch();
        match conn.request.state {
            State::NormalBodyUnready => conn.request.state = State::NormalBodyReady,
            State::ChunkedBodyUnready => conn.request.state = State::ChunkedBodyReady,
            _ => {}
        }
        self.suspended.unlink(&mut self.conns, key);
        self.normal.push_tail(&mut self.conns, key);
        self.conns[key].io_list = IoList::Normal;
        let to_list = if self.conns[key].connection_timeout == self.shared.connection_timeout {
            self.to_default.push_tail(&mut self.conns, key);
            ToList::Default
        } else {
            self.to_custom.push_tail(&mut self.conns, key);
            ToList::Custom
        };
        self.conns[key].to_list = Some(to_list);
        if !self.conns[key].in_ready_list {
            self.conns[key].in_ready_list = true;
            self.ready.push_tail(&mut self.conns, key);
        }
        trace!("connection {key} resumed");
    }

    fn process_ready(&mut self) {
        for key in self.ready.keys(&self.conns) {
            if !self.conns.contains(key) {
                continue;
            }
            self.ready.unlink(&mut self.conns, key);
            self.conns[key].in_ready_list = false;
            self.process_connection(key);
        }
    }

    fn process_connection(&mut self, key: usize) {
        let shared = self.shared.clone();
        let before_activity;
        {
            let conn = &mut self.conns[key];
            if conn.suspended {
                return;
            }
            before_activity = conn.last_activity;
            if conn.resuming {
                trace!("resumed connection {key} re-entering the loop");
                conn.resuming = false;
            }
            if conn.read_ready && conn.wants_read() {
                conn.handle_read(shared.pool_size, shared.mem_increment);
            }
            loop {
                conn.handle_idle(&shared);
                if conn.wants_write() && conn.write_ready {
                    let before = (
                        conn.request.write_buffer_send_offset,
                        conn.request.continue_message_write_offset,
                        conn.request.response_write_position,
                    );
                    conn.handle_write();
                    let after = (
                        conn.request.write_buffer_send_offset,
                        conn.request.continue_message_write_offset,
                        conn.request.response_write_position,
                    );
                    if before == after {
                        break;
                    }
                    continue;
                }
                break;
            }
        }

        if let Some(d) = self.conns[key].request.timeout_override.take() {
            self.apply_timeout_override(key, d);
        }

        if self.conns[key].request.suspend_requested {
            self.suspend_connection(key);
            return;
        }
        match self.conns[key].request.event_loop_info {
            EventLoopInfo::Cleanup => {
                self.move_to_cleanup(key);
                return;
            }
            EventLoopInfo::Upgrade => {
                self.perform_upgrade(key);
                return;
            }
            _ => {}
        }

        if self.conns[key].last_activity != before_activity {
            match self.conns[key].to_list {
                Some(ToList::Default) => self.to_default.move_to_tail(&mut self.conns, key),
                Some(ToList::Custom) => self.to_custom.move_to_tail(&mut self.conns, key),
                None => {}
            }
        }

        self.sync_interest(key);

        let conn = &self.conns[key];
        let again =
            (conn.read_ready && conn.wants_read()) || (conn.write_ready && conn.wants_write());
        if again && !conn.in_ready_list {
            self.conns[key].in_ready_list = true;
            self.ready.push_tail(&mut self.conns, key);
        }
    }

    fn apply_timeout_override(&mut self, key: usize, timeout: Duration) {
        let current = self.conns[key].to_list;
        self.conns[key].connection_timeout = timeout;
        if current != Some(ToList::Custom) {
            if current == Some(ToList::Default) {
                self.to_default.unlink(&mut self.conns, key);
            }
            self.to_custom.push_tail(&mut self.conns, key);
            self.conns[key].to_list = Some(ToList::Custom);
        }
    }

    fn suspend_connection(&mut self, key: usize) {
        {
            let conn = &mut self.conns[key];
            conn.request.suspend_requested = false;
            conn.suspended = true;
        }
        self.normal.unlink(&mut self.conns, key);
        self.suspended.push_tail(&mut self.conns, key);
        self.conns[key].io_list = IoList::Suspended;
        match self.conns[key].to_list.take() {
            Some(ToList::Default) => self.to_default.unlink(&mut self.conns, key),
            Some(ToList::Custom) => self.to_custom.unlink(&mut self.conns, key),
            None => {}
        }
        if self.conns[key].in_ready_list {
            self.ready.unlink(&mut self.conns, key);
            self.conns[key].in_ready_list = false;
        }
        let conn = &mut self.conns[key];
        if conn.registered.is_some() {
            let _ = self.poll.registry().deregister(&mut conn.stream);
            conn.registered = None;
        }
        trace!("connection {key} suspended");
    }

    fn sync_interest(&mut self, key: usize) {
        let desired = self.conns[key].desired_interest();
        let conn = &mut self.conns[key];
        if desired == conn.registered {
            return;
        }
        match desired {
            Some(interest) => {
                let res = if conn.registered.is_some() {
                    self.poll
                        .registry()
                        .reregister(&mut conn.stream, Token(key), interest)
                } else {
                    self.poll
                        .registry()
                        .register(&mut conn.stream, Token(key), interest)
                };
                match res {
                    Ok(()) => conn.registered = Some(interest),
                    Err(e) => {
                        debug!("interest update failed: {e}");
                        conn.wire_error = true;
                    }
                }
            }
            None => {
                if conn.registered.is_some() {
                    let _ = self.poll.registry().deregister(&mut conn.stream);
                    conn.registered = None;
                }
            }
        }
    }

    fn move_to_cleanup(&mut self, key: usize) {
        if self.conns[key].io_list == IoList::Cleanup {
            return;
        }
        match self.conns[key].io_list {
            IoList::Normal => self.normal.unlink(&mut self.conns, key),
            IoList::Suspended => self.suspended.unlink(&mut self.conns, key),
            IoList::Cleanup => unreachable!(),
        }
        match self.conns[key].to_list.take() {
            Some(ToList::Default) => self.to_default.unlink(&mut self.conns, key),
            Some(ToList::Custom) => self.to_custom.unlink(&mut self.conns, key),
            None => {}
        }
        if self.conns[key].in_ready_list {
            self.ready.unlink(&mut self.conns, key);
            self.conns[key].in_ready_list = false;
        }
        self.cleanup.push_tail(&mut self.conns, key);
        let conn = &mut self.conns[key];
        conn.io_list = IoList::Cleanup;
        conn.had_request_in_flight = conn.request.state != State::Init
            || conn.request.read_buffer_offset > 0
            || conn.request.response.is_some();
        conn.request.state = State::InCleanup;
    }

    fn process_cleanup(&mut self) {
        while let Some(key) = self.cleanup.pop_head(&mut self.conns) {
            self.destroy_connection(key);
        }
    }

    /// Final teardown.  Callbacks fire first, then the socket goes, then
    /// the pool (by field order in `Connection`).
    fn destroy_connection(&mut self, key: usize) {
        let mut conn = self.conns.remove(key);
        let _ = self.poll.registry().deregister(&mut conn.stream);

        let req = &conn.request;
        if conn.had_request_in_flight && !req.completion_notified {
            if let Some(cb) = &self.shared.notify_completed {
                let reason = if self.shared.quiescing() {
                    RequestEndReason::DaemonShutdown
                } else if conn.timed_out {
                    RequestEndReason::TimedOut
                } else if conn.wire_error || conn.read_closed {
                    RequestEndReason::ClientAbort
                } else {
                    RequestEndReason::Error
                };
                cb(conn.id(), reason);
            }
        }
        if let Some(cb) = &self.shared.notify_connection {
            cb(conn.id(), ConnectionEvent::Closed);
        }
        self.shared.connection_gone(conn.addr.ip());
        if !self.shared.turbo {
            let Connection {
                ref mut wire,
                ref mut stream,
                ..
            } = conn;
            wire.shutdown(stream);
        }
        trace!("connection {key} destroyed");
        // `conn` drops here: queued response refcount, socket, then pool.
    }

    /// Hand the socket to the application after the `101` headers flushed.
    fn perform_upgrade(&mut self, key: usize) {
        match self.conns[key].io_list {
            IoList::Normal => self.normal.unlink(&mut self.conns, key),
            IoList::Suspended => self.suspended.unlink(&mut self.conns, key),
            IoList::Cleanup => return,
        }
        match self.conns[key].to_list.take() {
            Some(ToList::Default) => self.to_default.unlink(&mut self.conns, key),
            Some(ToList::Custom) => self.to_custom.unlink(&mut self.conns, key),
            None => {}
        }
        if self.conns[key].in_ready_list {
            self.ready.unlink(&mut self.conns, key);
            self.conns[key].in_ready_list = false;
        }

        let mut conn = self.conns.remove(key);
        let _ = self.poll.registry().deregister(&mut conn.stream);
        let cid = conn.id();
        let read_ahead = match (&conn.pool, conn.request.read_buffer_offset) {
            (Some(pool), n) if n > 0 => pool.slice(conn.request.read_buffer)[..n].to_vec(),
            _ => Vec::new(),
        };
        let handler = conn
            .request
            .response
            .as_ref()
            .and_then(|q| q.response.take_upgrade_handler());

        if let Some(cb) = &self.shared.notify_completed {
            cb(cid, RequestEndReason::Completed);
        }
        if let Some(cb) = &self.shared.notify_connection {
            cb(cid, ConnectionEvent::Closed);
        }
        self.shared.connection_gone(conn.addr.ip());

        match handler {
            Some(handler) => {
                use std::os::unix::io::{FromRawFd, IntoRawFd};
                let Connection { stream, .. } = conn;
                let raw = stream.into_raw_fd();
                let stream = unsafe { std::net::TcpStream::from_raw_fd(raw) };
                let _ = stream.set_nonblocking(false);
                debug!("socket upgraded, leaving the event loop");
                handler(UpgradedStream { stream, read_ahead });
            }
            None => {
                debug!("upgrade response without handler; closing socket");
            }
        }
    }

    fn expire_timeouts(&mut self) {
        let now = Instant::now();
        loop {
            let Some(key) = self.to_default.head() else {
                break;
            };
            let conn = &self.conns[key];
            if conn.connection_timeout.is_zero()
                || now.duration_since(conn.last_activity) < conn.connection_timeout
            {
                break;
            }
            debug!("connection {key} timed out");
            self.conns[key].timed_out = true;
            self.move_to_cleanup(key);
        }
        for key in self.to_custom.keys(&self.conns) {
            let conn = &self.conns[key];
            if conn.connection_timeout.is_zero()
                || now.duration_since(conn.last_activity) < conn.connection_timeout
            {
                continue;
            }
            debug!("connection {key} timed out");
            self.conns[key].timed_out = true;
            self.move_to_cleanup(key);
        }
    }

    fn accept_loop(&mut self) {
        let mut accepted = Vec::new();
        while let Some(listener) = &self.listener {
            match listener.accept() {
                Ok((stream, addr)) => {
                    if self.shared.quiescing() {
                        continue;
                    }
                    if let Some(policy) = &self.shared.accept_policy {
                        if !policy(&addr) {
                            trace!("accept policy refused {addr}");
                            continue;
                        }
                    }
                    if !self.shared.admit(addr.ip()) {
                        continue;
                    }
                    let _ = stream.set_nodelay(true);
                    accepted.push((stream, addr));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // EMFILE and friends: log, give the loop a turn, retry
                    // on the next readiness report.
                    warn!("accept failed: {e}");
                    break;
                }
            }
        }
        if accepted.is_empty() {
            return;
        }
        let mut mode = core::mem::replace(&mut self.accept_mode, AcceptMode::Local);
        for (stream, addr) in accepted {
            match &mut mode {
                AcceptMode::Local => self.insert_connection(stream, addr),
                AcceptMode::Distribute { peers, next } => {
                    let target = &peers[*next % peers.len()];
                    *next = next.wrapping_add(1);
                    target.send(Command::NewConnection(stream, addr));
                }
                AcceptMode::SpawnThread => spawn_connection_thread(&self.shared, stream, addr),
            }
        }
        self.accept_mode = mode;
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.shared.unregister_resumer(self.worker);
    }
}

/// Thread-per-connection: a dedicated thread drives a one-connection loop
/// to completion.
fn spawn_connection_thread(
    shared: &Arc<DaemonShared>,
    stream: TcpStream,
    addr: std::net::SocketAddr,
) {
    let shared = shared.clone();
    let worker = shared.next_worker_index();
    let builder = std::thread::Builder::new().name(format!("httpd-conn-{worker}"));
    let thread_shared = shared.clone();
    let error_shared = shared.clone();
    let spawned = builder.spawn(move || {
        match EventLoop::new(thread_shared, None, AcceptMode::Local, worker) {
            Ok(mut el) => {
                el.insert_connection(stream, addr);
                el.run_conn();
            }
            Err(e) => {
                warn!("could not start connection thread loop: {e}");
                error_shared.connection_gone(addr.ip());
            }
        }
    });
    match spawned {
        Ok(handle) => shared.track_join(handle),
        Err(e) => {
            warn!("could not spawn connection thread: {e}");
            shared.connection_gone(addr.ip());
        }
    }
}
