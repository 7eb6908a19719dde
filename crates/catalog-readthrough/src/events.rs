use crate::store::Freshness;
use catalog_readthrough_core::{Event, UpstreamError};
use std::time::Duration;

/// Events emitted by the read-through cache.
#[derive(Debug, Clone)]
pub enum ReadThroughEvent {
    /// A request was answered from the cache. `freshness` is never
    /// [`Freshness::Expired`].
    CacheHit {
        name: String,
        query: String,
        freshness: Freshness,
    },
    /// Nothing servable was cached and the request went to the upstream.
    /// `expired` is set when an entry existed but was past its max-serve
    /// window.
    CacheMiss {
        name: String,
        query: String,
        expired: bool,
    },
    /// The circuit was open; the upstream was not contacted.
    UpstreamBypassed { name: String, query: String },
    /// A request joined a fetch already in flight for the same query.
    Coalesced { name: String, query: String },
    /// A fetch through the fallback chain began.
    FetchStarted {
        name: String,
        query: String,
        background: bool,
    },
    /// A candidate produced a valid result and the cache was updated.
    FetchSucceeded {
        name: String,
        query: String,
        candidate: String,
        records: usize,
    },
    /// A candidate was abandoned; the chain moves on to the next one.
    CandidateFailed {
        name: String,
        candidate: String,
        error: UpstreamError,
    },
    /// An attempt failed and will be repeated after `delay`.
    RetryScheduled {
        name: String,
        candidate: String,
        attempt: usize,
        delay: Duration,
    },
    /// Consecutive failures opened (or re-opened) the circuit.
    CircuitOpened {
        name: String,
        consecutive_failures: u32,
        cooldown: Duration,
    },
    /// A successful fetch closed the circuit.
    CircuitClosed { name: String },
    /// A background refresh failed; the caller was not affected.
    RefreshFailed {
        name: String,
        query: String,
        error_kind: &'static str,
    },
}

impl Event for ReadThroughEvent {
    fn kind(&self) -> &'static str {
        match self {
            ReadThroughEvent::CacheHit { .. } => "cache_hit",
            ReadThroughEvent::CacheMiss { .. } => "cache_miss",
            ReadThroughEvent::UpstreamBypassed { .. } => "upstream_bypassed",
            ReadThroughEvent::Coalesced { .. } => "coalesced",
            ReadThroughEvent::FetchStarted { .. } => "fetch_started",
            ReadThroughEvent::FetchSucceeded { .. } => "fetch_succeeded",
            ReadThroughEvent::CandidateFailed { .. } => "candidate_failed",
            ReadThroughEvent::RetryScheduled { .. } => "retry_scheduled",
            ReadThroughEvent::CircuitOpened { .. } => "circuit_opened",
            ReadThroughEvent::CircuitClosed { .. } => "circuit_closed",
            ReadThroughEvent::RefreshFailed { .. } => "refresh_failed",
        }
    }

    fn source(&self) -> &str {
        match self {
            ReadThroughEvent::CacheHit { name, .. }
            | ReadThroughEvent::CacheMiss { name, .. }
            | ReadThroughEvent::UpstreamBypassed { name, .. }
            | ReadThroughEvent::Coalesced { name, .. }
            | ReadThroughEvent::FetchStarted { name, .. }
            | ReadThroughEvent::FetchSucceeded { name, .. }
            | ReadThroughEvent::CandidateFailed { name, .. }
            | ReadThroughEvent::RetryScheduled { name, .. }
            | ReadThroughEvent::CircuitOpened { name, .. }
            | ReadThroughEvent::CircuitClosed { name }
            | ReadThroughEvent::RefreshFailed { name, .. } => name,
        }
    }
}
