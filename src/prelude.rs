//! Everything an embedding host usually needs, plus the status-code
//! constants used throughout the crate.

pub use crate::daemon::{
    ConnectionEvent, ConnectionId, Daemon, DaemonOptions, Dispatch, RequestEndReason,
    RequestHandler, ThreadingModel,
};
pub use crate::error::{Result, ServeError};
pub use crate::http::headers::HeaderKind;
pub use crate::http::response::{ReaderResult, Response, UpgradedStream};
pub use crate::http::RequestCtx;
pub use crate::HttpVersion;

pub const HTTP_SWITCHING_PROTOCOLS: u16 = 101;

pub const HTTP_OK: u16 = 200;
pub const HTTP_CREATED: u16 = 201;
pub const HTTP_NO_CONTENT: u16 = 204;

pub const HTTP_FOUND: u16 = 302;

// 4xx client errors
pub const HTTP_BAD_REQUEST: u16 = 400;
pub const HTTP_FORBIDDEN: u16 = 403;
pub const HTTP_NOT_FOUND: u16 = 404;
pub const HTTP_METHOD_NOT_ALLOWED: u16 = 405;
pub const HTTP_PAYLOAD_TOO_LARGE: u16 = 413;
pub const HTTP_URI_TOO_LONG: u16 = 414;
pub const HTTP_EXPECTATION_FAILED: u16 = 417;
pub const HTTP_HEADER_FIELDS_TOO_LARGE: u16 = 431;

// 5xx server errors
pub const HTTP_INTERNAL_SERVER_ERROR: u16 = 500;
pub const HTTP_NOT_IMPLEMENTED: u16 = 501;
pub const HTTP_VERSION_NOT_SUPPORTED: u16 = 505;
