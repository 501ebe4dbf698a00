use std::io;
use thiserror::Error;

/// Central error type for the engine.
///
/// Every failure that can surface from parsing, routing, pipeline
/// processing or I/O maps onto one of these variants. Variants that
/// correspond to a protocol failure carry the message that ends up in
/// the error document (when the route allows showing it).
#[derive(Debug, Error)]
pub enum HttpError {
    /// Malformed request line, headers or chunk framing.
    #[error("bad request: {0}")]
    Parse(String),

    /// A configured size or resource limit was exceeded.
    #[error("limit exceeded: {0}")]
    Limit(String),

    /// Missing or invalid credentials.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Authenticated but not allowed.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// No route or no file matched the request.
    #[error("not found: {0}")]
    NotFound(String),

    /// Socket read or write failure; the in-flight request is aborted.
    #[error("communication error: {0}")]
    Comms(String),

    /// A connection or request timer expired.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Unexpected internal state.
    #[error("internal error: {0}")]
    Internal(String),

    /// A protocol failure with an explicit response status (414 for an
    /// oversize URI, 416 for a bad range, ...).
    #[error("{1}")]
    Protocol(u16, String),

    /// Underlying I/O error from the OS.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl HttpError {
    /// The HTTP status this error maps to when it terminates a request.
    pub fn status(&self) -> u16 {
        match self {
            HttpError::Parse(_) => 400,
            HttpError::Limit(_) => 413,
            HttpError::Unauthorized(_) => 401,
            HttpError::Forbidden(_) => 403,
            HttpError::NotFound(_) => 404,
            HttpError::Comms(_) => 499,
            HttpError::Timeout(_) => 408,
            HttpError::Internal(_) => 500,
            HttpError::Protocol(status, _) => *status,
            HttpError::Io(_) => 500,
        }
    }

    /// True when the connection must be dropped rather than answered.
    pub fn is_abort(&self) -> bool {
        matches!(self, HttpError::Comms(_))
    }
}

pub type HttpResult<T> = Result<T, HttpError>;
