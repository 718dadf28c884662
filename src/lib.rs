//! Embeddable HTTP/1.0 / HTTP/1.1 server library.
//!
//! The host application supplies a request handler (and optional policy
//! callbacks); this crate owns the listening socket, the connection
//! lifecycle, request parsing, and response transmission.  There is no
//! routing, no templating and no middleware: only the byte-level
//! mechanics of serving HTTP/1.x over TCP (or TLS through a pluggable
//! record layer) to many concurrent clients in one process.
//!
//! ```no_run
//! use httpd_core::{Daemon, DaemonOptions, Dispatch, RequestCtx, Response};
//!
//! fn hello(req: &mut RequestCtx<'_>) -> Dispatch {
//!     let body = format!("you asked for {}", req.url());
//!     req.queue_response(200, Response::from_buffer(body.into_bytes()));
//!     Dispatch::Continue
//! }
//!
//! let daemon = Daemon::start(DaemonOptions::default(), hello).unwrap();
//! println!("listening on {}", daemon.local_addr());
//! // ... the internal thread serves until:
//! daemon.stop();
//! ```
//!
//! Four threading models are available through
//! [`DaemonOptions::threading`]: an external loop pumped by the host
//! (`run_once`/`get_timeout`), one internal event-loop thread, a worker
//! pool with per-worker pollers, and thread-per-connection.

mod connection;
mod daemon;
mod error;
mod event_loop;
mod http;
mod itc;
mod lists;
mod pool;
pub mod prelude;
mod wire;

pub use daemon::{
    AcceptPolicy, ConnectionEvent, ConnectionId, Daemon, DaemonOptions, Dispatch, NotifyCompleted,
    NotifyConnection, RequestEndReason, RequestHandler, ThreadingModel, TlsSessionFactory,
    UriLogger,
};
pub use error::{Result, ServeError};
pub use http::headers::HeaderKind;
pub use http::request::HttpVersion;
pub use http::response::{ReaderResult, Response, UpgradedStream};
pub use http::RequestCtx;
pub use wire::{RecvOutcome, SendOutcome, TlsSession};
