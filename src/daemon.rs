//! Daemon construction, the four threading models, and shutdown.
//!
//! The daemon owns the listening socket and one or more event loops.  All
//! state visible from more than one thread lives in `DaemonShared`; the
//! mutex there is only ever taken on accept, suspend/resume and cleanup
//! transitions, never on the per-byte read/write path.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, TcpListener as StdTcpListener};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{info, warn};

use crate::error::{Result, ServeError};
use crate::event_loop::{AcceptMode, EventLoop};
use crate::http::RequestCtx;
use crate::itc::{Command, ItcHandle};
use crate::wire::TlsSession;

/// Verdict returned by the request handler.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Dispatch {
    /// Keep going; the handler either queued a response or wants the next
    /// upload chunk.
    Continue,
    /// Drop the connection without a response.
    Abort,
}

/// The application's request callback.
///
/// Implemented for plain closures, so
/// `Daemon::start(opts, |req: &mut RequestCtx| ...)` works directly.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, req: &mut RequestCtx<'_>) -> Dispatch;
}

impl<F> RequestHandler for F
where
    F: Fn(&mut RequestCtx<'_>) -> Dispatch + Send + Sync + 'static,
{
    fn handle(&self, req: &mut RequestCtx<'_>) -> Dispatch {
        self(req)
    }
}

/// Stable identifier for one accepted connection.  Safe to hold across
/// threads; a stale id (connection already gone) is simply ignored by
/// [`Daemon::resume`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ConnectionId {
    pub(crate) worker: usize,
    pub(crate) key: usize,
    pub(crate) generation: u64,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ConnectionEvent {
    Started,
    Closed,
}

/// Why a request stopped being processed.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RequestEndReason {
    Completed,
    Error,
    ClientAbort,
    TimedOut,
    DaemonShutdown,
}

/// How connections are scheduled onto threads.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ThreadingModel {
    /// No internal threads; the host pumps [`Daemon::run_once`].
    External,
    /// One internal event-loop thread.
    Internal,
    /// N workers, each with its own poller; the listener lives on worker 0
    /// which hands accepted sockets off through the workers' mailboxes.
    ThreadPool(usize),
    /// The daemon thread only accepts; every connection gets a thread.
    ThreadPerConnection,
}

pub type AcceptPolicy = dyn Fn(&SocketAddr) -> bool + Send + Sync;
pub type NotifyConnection = dyn Fn(ConnectionId, ConnectionEvent) + Send + Sync;
pub type UriLogger = dyn Fn(&str) + Send + Sync;
pub type NotifyCompleted = dyn Fn(ConnectionId, RequestEndReason) + Send + Sync;
/// Produces one TLS record-layer session per accepted connection.
pub type TlsSessionFactory = dyn Fn() -> Box<dyn TlsSession> + Send + Sync;

/// Plain-struct daemon configuration; start from `Default` and override.
pub struct DaemonOptions {
    pub bind_addr: SocketAddr,
    pub threading: ThreadingModel,
    /// Idle eviction deadline; zero disables the timeout.
    pub connection_timeout: Duration,
    /// Per-connection pool backing all request-scoped allocations.
    pub memory_pool_size: usize,
    /// Additive read-buffer growth step.
    pub memory_increment: usize,
    /// Zero means unlimited.
    pub global_connection_limit: usize,
    /// Zero means unlimited.
    pub per_ip_connection_limit: usize,
    /// Skip optional `shutdown()` calls and read optimistically before the
    /// first readiness report.
    pub turbo: bool,
    pub suppress_date_header: bool,
    pub accept_policy: Option<Box<AcceptPolicy>>,
    pub notify_connection: Option<Box<NotifyConnection>>,
    /// Called with the raw request URI before any unescaping.
    pub uri_logger: Option<Box<UriLogger>>,
    pub notify_completed: Option<Box<NotifyCompleted>>,
    /// When set, every accepted socket is wrapped in a TLS session from
    /// this factory; the state machine drives both transports identically.
    pub tls_session_factory: Option<Box<TlsSessionFactory>>,
}

impl Default for DaemonOptions {
    fn default() -> DaemonOptions {
        DaemonOptions {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            threading: ThreadingModel::Internal,
            connection_timeout: Duration::ZERO,
            memory_pool_size: 32 * 1024,
            memory_increment: 1024,
            global_connection_limit: 0,
            per_ip_connection_limit: 0,
            turbo: false,
            suppress_date_header: false,
            accept_policy: None,
            notify_connection: None,
            uri_logger: None,
            notify_completed: None,
            tls_session_factory: None,
        }
    }
}

pub(crate) struct DaemonShared {
    pub handler: Box<dyn RequestHandler>,
    pub accept_policy: Option<Box<AcceptPolicy>>,
    pub notify_connection: Option<Box<NotifyConnection>>,
    pub uri_logger: Option<Box<UriLogger>>,
    pub notify_completed: Option<Box<NotifyCompleted>>,
    pub tls_factory: Option<Box<TlsSessionFactory>>,

    pub pool_size: usize,
    pub mem_increment: usize,
    pub connection_timeout: Duration,
    pub global_limit: usize,
    pub per_ip_limit: usize,
    pub turbo: bool,
    pub suppress_date: bool,

    quiesce: AtomicBool,
    active: AtomicUsize,
    generations: AtomicU64,
    worker_indices: AtomicUsize,
    per_ip: Mutex<HashMap<IpAddr, u32>>,
    resumers: Mutex<HashMap<usize, ItcHandle>>,
    conn_joins: Mutex<Vec<JoinHandle<()>>>,
}

impl DaemonShared {
    pub fn quiescing(&self) -> bool {
        self.quiesce.load(Ordering::Acquire)
    }

    pub fn begin_quiesce(&self) {
        self.quiesce.store(true, Ordering::Release);
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_worker_index(&self) -> usize {
        self.worker_indices.fetch_add(1, Ordering::Relaxed)
    }

    /// Accept-side admission: limits checked and counters bumped together
    /// so concurrent acceptors cannot oversubscribe.
    pub fn admit(&self, ip: IpAddr) -> bool {
        if self.global_limit > 0 && self.active.load(Ordering::Relaxed) >= self.global_limit {
            warn!("global connection limit reached; refusing {ip}");
            return false;
        }
        let mut per_ip = self.lock_per_ip();
        let count = per_ip.entry(ip).or_insert(0);
        if self.per_ip_limit > 0 && *count as usize >= self.per_ip_limit {
            warn!("per-IP connection limit reached for {ip}");
            return false;
        }
        *count += 1;
        drop(per_ip);
        self.active.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Undo of `admit`, on destroy or on any post-accept failure.
    pub fn connection_gone(&self, ip: IpAddr) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        let mut per_ip = self.lock_per_ip();
        if let Some(count) = per_ip.get_mut(&ip) {
            *count -= 1;
            if *count == 0 {
                per_ip.remove(&ip);
            }
        }
    }

    fn lock_per_ip(&self) -> std::sync::MutexGuard<'_, HashMap<IpAddr, u32>> {
        self.per_ip.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn register_resumer(&self, worker: usize, itc: ItcHandle) {
        self.resumers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(worker, itc);
    }

    pub fn unregister_resumer(&self, worker: usize) {
        self.resumers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&worker);
    }

    fn resumer_for(&self, worker: usize) -> Option<ItcHandle> {
        self.resumers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&worker)
            .cloned()
    }

    fn all_resumers(&self) -> Vec<ItcHandle> {
        self.resumers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn track_join(&self, handle: JoinHandle<()>) {
        self.conn_joins
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(handle);
    }

    fn take_joins(&self) -> Vec<JoinHandle<()>> {
        core::mem::take(&mut *self.conn_joins.lock().unwrap_or_else(|p| p.into_inner()))
    }
}

enum ModeState {
    External(Box<EventLoop>),
    Internal { join: Option<JoinHandle<()>> },
    Pool { joins: Vec<JoinHandle<()>> },
    PerConnection { join: Option<JoinHandle<()>> },
}

/// A running HTTP daemon.  Dropping it performs a graceful stop.
pub struct Daemon {
    shared: Arc<DaemonShared>,
    local_addr: SocketAddr,
    mode: ModeState,
    stopped: bool,
}

impl Daemon {
    /// Bind, spin up the configured threading model, and start serving.
    pub fn start<H: RequestHandler>(options: DaemonOptions, handler: H) -> Result<Daemon> {
        if options.memory_pool_size < 4096 {
            return Err(ServeError::BadOption("memory_pool_size below 4 KiB"));
        }
        if options.memory_increment == 0 {
            return Err(ServeError::BadOption("memory_increment must be nonzero"));
        }
        if let ThreadingModel::ThreadPool(0) = options.threading {
            return Err(ServeError::BadOption("thread pool needs at least one worker"));
        }

        let std_listener = StdTcpListener::bind(options.bind_addr)?;
        std_listener.set_nonblocking(true)?;
        let local_addr = std_listener.local_addr()?;
        let listener = mio::net::TcpListener::from_std(std_listener);

        let threading = options.threading;
        let shared = Arc::new(DaemonShared {
            handler: Box::new(handler),
            accept_policy: options.accept_policy,
            notify_connection: options.notify_connection,
            uri_logger: options.uri_logger,
            notify_completed: options.notify_completed,
            tls_factory: options.tls_session_factory,
            pool_size: options.memory_pool_size,
            mem_increment: options.memory_increment,
            connection_timeout: options.connection_timeout,
            global_limit: options.global_connection_limit,
            per_ip_limit: options.per_ip_connection_limit,
            turbo: options.turbo,
            suppress_date: options.suppress_date_header,
            quiesce: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            generations: AtomicU64::new(1),
            // Pool workers take 0..n up front; per-connection threads and
            // everything else start handing out indices above that.
            worker_indices: AtomicUsize::new(1024),
            per_ip: Mutex::new(HashMap::new()),
            resumers: Mutex::new(HashMap::new()),
            conn_joins: Mutex::new(Vec::new()),
        });

        let mode = match threading {
            ThreadingModel::External => {
                let el = EventLoop::new(shared.clone(), Some(listener), AcceptMode::Local, 0)?;
                ModeState::External(Box::new(el))
            }
            ThreadingModel::Internal => {
                let mut el = EventLoop::new(shared.clone(), Some(listener), AcceptMode::Local, 0)?;
                let join = std::thread::Builder::new()
                    .name("httpd-loop".into())
                    .spawn(move || el.run())?;
                ModeState::Internal { join: Some(join) }
            }
            ThreadingModel::ThreadPool(n) => {
                let mut listener = Some(listener);
                let mut loops = Vec::with_capacity(n);
                for worker in 0..n {
                    loops.push(EventLoop::new(
                        shared.clone(),
                        if worker == 0 { listener.take() } else { None },
                        AcceptMode::Local,
                        worker,
                    )?);
                }
                let itcs: Vec<ItcHandle> = loops.iter().map(|el| el.itc_handle()).collect();
                loops[0].set_accept_mode(AcceptMode::Distribute {
                    peers: itcs.clone(),
                    next: 0,
                });
                let mut joins = Vec::with_capacity(n);
                for (worker, mut el) in loops.into_iter().enumerate() {
                    joins.push(
                        std::thread::Builder::new()
                            .name(format!("httpd-worker-{worker}"))
                            .spawn(move || el.run())?,
                    );
                }
                ModeState::Pool { joins }
            }
            ThreadingModel::ThreadPerConnection => {
                let mut el =
                    EventLoop::new(shared.clone(), Some(listener), AcceptMode::SpawnThread, 0)?;
                let join = std::thread::Builder::new()
                    .name("httpd-accept".into())
                    .spawn(move || el.run())?;
                ModeState::PerConnection { join: Some(join) }
            }
        };

        info!("daemon listening on {local_addr} ({threading:?})");
        Ok(Daemon {
            shared,
            local_addr,
            mode,
            stopped: false,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Connections currently tracked.  Observational only: in any model
    /// with internal threads the value may be stale the moment it returns.
    pub fn active_connections(&self) -> usize {
        self.shared.active_connections()
    }

    /// Resume a connection previously suspended from its handler.  Safe to
    /// call from any thread and with stale ids.
    pub fn resume(&self, id: ConnectionId) -> Result<()> {
        if self.shared.quiescing() {
            return Err(ServeError::ShuttingDown);
        }
        match self.shared.resumer_for(id.worker) {
            Some(itc) => {
                itc.send(Command::Resume {
                    key: id.key,
                    generation: id.generation,
                });
                Ok(())
            }
            None => Err(ServeError::ConnectionGone),
        }
    }

    /// External model: run one poll turn.  `max_wait` bounds the blocking
    /// time; pass `Some(ZERO)` to merely drain pending work.
    pub fn run_once(&mut self, max_wait: Option<Duration>) -> Result<()> {
        match &mut self.mode {
            ModeState::External(el) => el.run_once(max_wait),
            _ => Err(ServeError::WrongThreadingModel),
        }
    }

    /// External model: how long `run_once` may sleep before an idle
    /// timeout needs attention.
    pub fn get_timeout(&self) -> Result<Option<Duration>> {
        match &self.mode {
            ModeState::External(el) => Ok(el.get_timeout()),
            _ => Err(ServeError::WrongThreadingModel),
        }
    }

    /// Graceful stop: quiesce, wake every loop, force remaining
    /// connections closed, join workers in reverse creation order.
    pub fn stop(mut self) {
        self.stop_inner();
    }

    fn stop_inner(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.shared.begin_quiesce();
        for itc in self.shared.all_resumers() {
            itc.send(Command::Shutdown);
        }
        match &mut self.mode {
            ModeState::External(el) => el.shutdown_now(),
            ModeState::Internal { join, .. } => {
                if let Some(join) = join.take() {
                    let _ = join.join();
                }
            }
            ModeState::Pool { joins, .. } => {
                for join in joins.drain(..).rev() {
                    let _ = join.join();
                }
            }
            ModeState::PerConnection { join, .. } => {
                if let Some(join) = join.take() {
                    let _ = join.join();
                }
                for join in self.shared.take_joins().into_iter().rev() {
                    let _ = join.join();
                }
            }
        }
        info!("daemon stopped");
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.stop_inner();
    }
}
