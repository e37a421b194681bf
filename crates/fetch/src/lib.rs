mod client;
mod limit;
mod response;
mod retry;
mod telemetry;

pub use client::{Client, ClientBuilder};
pub use limit::RateLimiter;
pub use response::{ByteStream, BytesResponse, JsonResponse, Response, TextResponse};
pub use retry::{parse_retry_after, RetryPolicy};
pub use telemetry::{TelemetryEvent, TelemetryHandler};

use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of a request failure, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connection, DNS, or TLS failure.
    Transport,
    /// The request or response exceeded a configured timeout.
    Timeout,
    /// The server answered with a non-2xx status.
    HttpStatus,
    /// The response body could not be decoded as the expected type.
    Decode,
    /// An explicit 429, carrying any Retry-After the server offered.
    RateLimited,
}

/// Error type returned by all client operations. Every variant knows the URL
/// it addressed, how long the attempt ran, and whether a retry is worthwhile.
/// Retryability is decided once, when the error is built, by consulting the
/// client's RetryPolicy.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        elapsed: Duration,
        timed_out: bool,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned HTTP {status}")]
    HttpStatus {
        url: String,
        status: u16,
        elapsed: Duration,
        retryable: bool,
        retry_after: Option<Duration>,
    },

    #[error("failed to decode response from {url}: {source}")]
    Decode {
        url: String,
        elapsed: Duration,
        #[source]
        source: serde_json::Error,
    },

    #[error("{url} rate limited the request")]
    RateLimited {
        url: String,
        elapsed: Duration,
        retry_after: Option<Duration>,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transport { timed_out: true, .. } => ErrorKind::Timeout,
            Error::Transport { .. } => ErrorKind::Transport,
            Error::HttpStatus { .. } => ErrorKind::HttpStatus,
            Error::Decode { .. } => ErrorKind::Decode,
            Error::RateLimited { .. } => ErrorKind::RateLimited,
        }
    }

    /// Whether a retry of the same request could reasonably succeed.
    /// Transport failures and timeouts are always retryable; HTTP statuses
    /// consult the policy's retryable set at construction; decode failures
    /// never are.
    pub fn retryable(&self) -> bool {
        match self {
            Error::Transport { .. } => true,
            Error::HttpStatus { retryable, .. } => *retryable,
            Error::Decode { .. } => false,
            Error::RateLimited { .. } => true,
        }
    }

    pub fn http_status(&self) -> Option<u16> {
        match self {
            Error::HttpStatus { status, .. } => Some(*status),
            Error::RateLimited { .. } => Some(429),
            _ => None,
        }
    }

    pub fn url(&self) -> &str {
        match self {
            Error::Transport { url, .. }
            | Error::HttpStatus { url, .. }
            | Error::Decode { url, .. }
            | Error::RateLimited { url, .. } => url,
        }
    }

    pub fn elapsed(&self) -> Duration {
        match self {
            Error::Transport { elapsed, .. }
            | Error::HttpStatus { elapsed, .. }
            | Error::Decode { elapsed, .. }
            | Error::RateLimited { elapsed, .. } => *elapsed,
        }
    }

    /// The wait the server asked for, when it offered one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::HttpStatus { retry_after, .. } | Error::RateLimited { retry_after, .. } => {
                *retry_after
            }
            _ => None,
        }
    }
}
