// Error handling module
// Defines the per-request failure taxonomy and the pre-flight errors

use std::error::Error as StdError;
use std::io;

use thiserror::Error;

/// Failure of a single load-test request.
///
/// The `Display` output is the exact string stored in
/// [`RequestOutcome::error`](crate::outcome::RequestOutcome::error), so the
/// variants double as the report's error vocabulary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// Response received with a non-success status code
    #[error("HTTP {0}")]
    Http(u16),

    /// Transport-level connection failure before or during the call
    #[error("connection_reset")]
    ConnectionReset,

    /// Transport failure while reading the body after a successful status
    #[error("stream_interrupted")]
    StreamInterrupted,

    /// No response, or no further data, within the per-request time bound
    #[error("timeout")]
    Timeout,

    /// Any other failure, captured verbatim
    #[error("{0}")]
    Other(String),
}

impl RequestError {
    /// Classify an error raised while sending the request, before any
    /// status line was received.
    pub fn from_send(err: &reqwest::Error) -> Self {
        // Connect-phase timeouts count as connection failures.
        if err.is_connect() {
            return RequestError::ConnectionReset;
        }
        if err.is_timeout() {
            return RequestError::Timeout;
        }
        if is_connection_io_error(err) {
            return RequestError::ConnectionReset;
        }
        RequestError::Other(err.to_string())
    }

    /// Classify an error raised while reading body chunks after a
    /// successful status.
    pub fn from_body(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            return RequestError::Timeout;
        }
        if err.is_body() || err.is_decode() || err.is_request() || is_connection_io_error(err) {
            return RequestError::StreamInterrupted;
        }
        RequestError::Other(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for RequestError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        RequestError::Timeout
    }
}

/// Walk the source chain looking for a socket-level reset/abort.
fn is_connection_io_error(err: &reqwest::Error) -> bool {
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            if matches!(
                io_err.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ) {
                return true;
            }
        }
        source = cause.source();
    }
    false
}

/// Pre-flight health check failures. Any of these aborts the run before
/// load is generated.
#[derive(Error, Debug)]
pub enum HealthCheckError {
    /// Endpoint could not be reached at all
    #[error("cannot reach {url}: {source}")]
    Unreachable {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Endpoint did not answer within the health-check timeout
    #[error("health check against {url} timed out")]
    Timeout { url: String },

    /// Endpoint answered with something other than 200
    #[error("health check against {url} returned {status}")]
    BadStatus { url: String, status: u16 },
}
