pub(crate) mod fsm;
pub mod headers;
pub(crate) mod request;
pub mod response;

use std::any::Any;
use std::net::SocketAddr;

use crate::daemon::ConnectionId;
use crate::pool::MemPool;

use headers::HeaderKind;
use request::{HttpVersion, QueuedResponse, Request};
use response::Response;

/// The application's view of one request, handed to the request handler.
///
/// The same request is dispatched up to three times: once when the headers
/// are complete, once per decoded chunk of upload data, and once more when
/// the upload (including trailers) has been fully consumed.  State that has
/// to survive between those calls goes through [`set_state`](Self::set_state).
pub struct RequestCtx<'r> {
    pub(crate) pool: &'r MemPool,
    pub(crate) req: &'r mut Request,
    pub(crate) upload: Option<&'r [u8]>,
    pub(crate) cid: ConnectionId,
    pub(crate) peer: SocketAddr,
}

impl<'r> RequestCtx<'r> {
    /// Percent-decoded request path, query string removed.
    ///
    /// Returned strings borrow the connection pool, not the context, so
    /// they stay usable while the context is mutated.
    pub fn url(&self) -> &'r str {
        self.pool.str_of(self.req.url)
    }

    pub fn method(&self) -> &'r str {
        self.pool.str_of(self.req.method)
    }

    pub fn version(&self) -> HttpVersion {
        self.req.http_version
    }

    /// First value of a request header, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&'r str> {
        self.req.headers.lookup(self.pool, HeaderKind::Header, name)
    }

    /// Decoded query-string argument.
    pub fn arg(&self, name: &str) -> Option<&'r str> {
        self.req
            .headers
            .lookup(self.pool, HeaderKind::GetArgument, name)
    }

    pub fn cookie(&self, name: &str) -> Option<&'r str> {
        self.req.headers.lookup(self.pool, HeaderKind::Cookie, name)
    }

    /// Trailer received after a chunked upload.
    pub fn footer(&self, name: &str) -> Option<&'r str> {
        self.req.headers.lookup(self.pool, HeaderKind::Footer, name)
    }

    /// Number of received entries of `kind`.
    pub fn num_entries(&self, kind: HeaderKind) -> usize {
        self.req.headers.count(kind)
    }

    /// Every received header of `kind`, in arrival order.
    pub fn entries(&self, kind: HeaderKind) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.req
            .headers
            .iter()
            .filter(move |e| e.kind == kind)
            .map(move |e| (self.pool.str_of(e.name), self.pool.str_of(e.value)))
    }

    /// Upload bytes for this dispatch; `None` on the header and completion
    /// calls.  The slice is consumed when the handler returns.
    pub fn upload_data(&self) -> Option<&'r [u8]> {
        self.upload
    }

    /// Queue the response.  Allowed from any dispatch; the first call wins.
    /// Queuing before the upload is consumed forces the connection closed
    /// after the response, since the remaining upload bytes are unframed.
    pub fn queue_response(&mut self, status: u16, response: Response) {
        if self.req.response.is_none() {
            self.req.response = Some(QueuedResponse { status, response });
        }
    }

    /// Stop dispatching events for this connection until
    /// [`Daemon::resume`](crate::Daemon::resume) is called with its id.
    pub fn suspend(&mut self) {
        self.req.suspend_requested = true;
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.cid
    }

    /// Override the daemon-wide idle timeout for this connection only.
    /// Zero disables the timeout.
    pub fn set_connection_timeout(&mut self, timeout: std::time::Duration) {
        self.req.timeout_override = Some(timeout);
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Attach per-request application state, kept across the dispatches of
    /// this request and dropped when it finishes.
    pub fn set_state<T: Any + Send>(&mut self, value: T) {
        self.req.app_state = Some(Box::new(value));
    }

    pub fn state_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.req.app_state.as_mut()?.downcast_mut::<T>()
    }

    pub fn take_state<T: Any + Send>(&mut self) -> Option<Box<T>> {
        let boxed = self.req.app_state.take()?;
        match boxed.downcast::<T>() {
            Ok(v) => Some(v),
            Err(other) => {
                self.req.app_state = Some(other);
                None
            }
        }
    }
}
