use anyhow::Error;
use thiserror::Error;

use crate::proxy::cache::IndexError;
use crate::proxy::http::BodyTooLarge;
use crate::util::TimedOut;

/// Malformed or unsupported HTTP framing. Always local to the connection that produced it.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed request line '{0}'")]
    MalformedRequestLine(String),
    #[error("malformed status line '{0}'")]
    MalformedStatusLine(String),
    #[error("malformed header line '{0}'")]
    MalformedHeader(String),
    #[error("invalid header name '{0}'")]
    InvalidHeaderName(String),
    #[error("invalid Content-Length '{0}'")]
    InvalidContentLength(String),
    #[error("chunked transfer encoding is not supported")]
    ChunkedUnsupported,
    #[error("connection closed in the middle of a line")]
    UnexpectedEof,
    #[error("message head exceeds {limit} bytes")]
    HeadTooLarge { limit: usize },
    #[error("message head contained invalid bytes")]
    InvalidEncoding,
    #[error("invalid loopback path '{0}'")]
    InvalidLoopbackPath(String),
}

/// Coarse failure classes used to pick a response status and a metrics label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Protocol,
    Timeout,
    Index,
    Io,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Protocol => "protocol",
            FailureKind::Timeout => "timeout",
            FailureKind::Index => "index",
            FailureKind::Io => "io",
        }
    }
}

pub fn classify_error(err: &Error) -> FailureKind {
    for cause in err.chain() {
        if cause.downcast_ref::<ProtocolError>().is_some()
            || cause.downcast_ref::<BodyTooLarge>().is_some()
        {
            return FailureKind::Protocol;
        }
        if cause.downcast_ref::<TimedOut>().is_some() {
            return FailureKind::Timeout;
        }
        if cause.downcast_ref::<IndexError>().is_some() {
            return FailureKind::Index;
        }
    }
    FailureKind::Io
}
