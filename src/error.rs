use std::io;

use thiserror::Error;

/// Errors surfaced to the embedding application.
///
/// Protocol violations on individual connections never show up here; those
/// are answered on the wire (`400`, `413`, ...) and stay confined to the
/// connection that produced them.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid daemon option: {0}")]
    BadOption(&'static str),

    #[error("daemon is shutting down")]
    ShuttingDown,

    #[error("no such connection (already closed?)")]
    ConnectionGone,

    #[error("operation is only available with the external threading model")]
    WrongThreadingModel,
}

pub type Result<T> = core::result::Result<T, ServeError>;
