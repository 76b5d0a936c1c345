use std::fmt;
use std::io;
use std::sync::Arc;
use thiserror::Error;

use crate::status::Status;
use crate::url::Url;

/// Errors produced by the Gopher client and server.
///
/// I/O sources are shared behind an `Arc` so the error is `Clone`: a closed
/// response hands back the same error on every subsequent `close()`.
#[derive(Error, Debug, Clone)]
pub enum GopherError {
    #[error("invalid URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("cannot fetch {0}: item type is not fetchable")]
    Unfetchable(Url),

    #[error("dial {addr} failed: {source}")]
    Dial {
        addr: String,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("write failed: {0}")]
    Write(#[source] Arc<io::Error>),

    #[error("read failed: {0}")]
    Read(#[source] Arc<io::Error>),

    #[error(transparent)]
    Protocol(Box<ProtocolError>),

    #[error("malformed entry at line {line}: {reason}")]
    MalformedEntry { line: usize, reason: String },

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("server closed")]
    ServerClosed,

    #[error("listener failed: {0}")]
    Listener(#[source] Arc<io::Error>),
}

impl GopherError {
    pub(crate) fn dial(addr: impl Into<String>, err: io::Error) -> Self {
        GopherError::Dial {
            addr: addr.into(),
            source: Arc::new(err),
        }
    }

    pub(crate) fn read(err: io::Error) -> Self {
        GopherError::Read(Arc::new(err))
    }

    pub(crate) fn write(err: io::Error) -> Self {
        GopherError::Write(Arc::new(err))
    }

    pub(crate) fn invalid_url(url: &str, reason: impl fmt::Display) -> Self {
        GopherError::InvalidUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }

    /// The detected server status, if this is a protocol error.
    pub fn status(&self) -> Option<Status> {
        match self {
            GopherError::Protocol(pe) => Some(pe.status),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            GopherError::Dial { source, .. } => source.kind() == io::ErrorKind::TimedOut,
            GopherError::Read(e) | GopherError::Write(e) => e.kind() == io::ErrorKind::TimedOut,
            _ => false,
        }
    }
}

impl From<ProtocolError> for GopherError {
    fn from(pe: ProtocolError) -> Self {
        GopherError::Protocol(Box::new(pe))
    }
}

/// A server-side error inferred from response content.
///
/// Gopher has no status line, so this is always a guess; `confidence` is in
/// `(0, 1]`. `raw` holds the sniffed bytes the guess was made from.
#[derive(Debug, Clone)]
pub struct ProtocolError {
    pub url: Url,
    pub status: Status,
    pub message: String,
    pub confidence: f64,
    pub raw: Vec<u8>,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "gopher: {} returned {} ({:.0}% confidence): {}",
            self.url,
            self.status,
            self.confidence * 100.0,
            self.message
        )
    }
}

impl std::error::Error for ProtocolError {}
