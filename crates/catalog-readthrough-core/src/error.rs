//! Error taxonomy for the read path.
//!
//! Errors come in two tiers:
//!
//! - [`UpstreamError`] describes why one attempt against one endpoint failed.
//!   These never leave the read-through layer; they are turned into "try the
//!   next strategy" decisions by the retry executor and the fallback chain.
//! - [`ReadError`] is what a request handler receives, and only when no cached
//!   data at all can be served.
//!
//! # Retryability
//!
//! | error | retried on same endpoint | moves to next candidate |
//! |---|---|---|
//! | `Transport` | yes | after retries |
//! | `Timeout` | yes | after retries |
//! | `Http` 5xx / 429 | yes | after retries |
//! | `Http` other 4xx | no | immediately |
//! | `Shape` | no | immediately |
//!
//! ```
//! use catalog_readthrough_core::{ReadError, UpstreamError};
//!
//! assert!(UpstreamError::Http { status: 503 }.is_retryable());
//! assert!(!UpstreamError::Http { status: 404 }.is_retryable());
//! assert_eq!(ReadError::UpstreamTimeout.status_code(), 504);
//! ```

use std::time::Duration;

/// Failure of a single upstream attempt.
///
/// `Clone` so that one coalesced failure can be handed to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    /// Network-level failure: DNS, refused connection, reset stream.
    #[error("transport error: {0}")]
    Transport(String),

    /// The attempt did not complete within its timeout.
    #[error("upstream timed out after {0:?}")]
    Timeout(Duration),

    /// The upstream answered with a non-success status.
    #[error("upstream returned HTTP {status}")]
    Http {
        /// HTTP status code.
        status: u16,
    },

    /// The body parsed but did not match the expected structure.
    #[error("unexpected response shape: {0}")]
    Shape(String),
}

impl UpstreamError {
    /// Returns `true` if repeating the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            UpstreamError::Transport(_) | UpstreamError::Timeout(_) => true,
            UpstreamError::Http { status } => *status >= 500 || *status == 429,
            UpstreamError::Shape(_) => false,
        }
    }

    /// Returns `true` if this is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, UpstreamError::Timeout(_))
    }

    /// Short, stable label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            UpstreamError::Transport(_) => "transport",
            UpstreamError::Timeout(_) => "timeout",
            UpstreamError::Http { status } if *status >= 500 => "http_5xx",
            UpstreamError::Http { .. } => "http_4xx",
            UpstreamError::Shape(_) => "shape",
        }
    }
}

/// Caller-visible failure of a read.
///
/// Produced only when there is no cached entry to fall back on, so callers
/// can treat every `Ok` as "something plausible to render".
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReadError {
    /// The circuit is open and nothing is cached for this query.
    #[error("upstream unavailable: circuit open and nothing cached")]
    UpstreamUnavailable,

    /// The end-to-end deadline expired (or every attempt timed out) and
    /// nothing is cached for this query.
    #[error("upstream timed out and nothing cached")]
    UpstreamTimeout,

    /// Every endpoint candidate failed and nothing is cached for this query.
    #[error("all endpoint candidates failed (last error: {last})")]
    UpstreamExhausted {
        /// The last per-attempt error observed.
        last: UpstreamError,
    },

    /// The query names a resource with no configured endpoint candidates.
    #[error("no endpoint candidates configured for resource '{0}'")]
    UnknownResource(String),
}

impl ReadError {
    /// HTTP status a handler should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            ReadError::UpstreamUnavailable => 503,
            ReadError::UpstreamTimeout => 504,
            ReadError::UpstreamExhausted { .. } => 500,
            ReadError::UnknownResource(_) => 404,
        }
    }

    /// Returns `true` for the timeout flavour, which callers may retry sooner.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ReadError::UpstreamTimeout)
    }

    /// Short, stable label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ReadError::UpstreamUnavailable => "upstream_unavailable",
            ReadError::UpstreamTimeout => "upstream_timeout",
            ReadError::UpstreamExhausted { .. } => "upstream_exhausted",
            ReadError::UnknownResource(_) => "unknown_resource",
        }
    }
}
