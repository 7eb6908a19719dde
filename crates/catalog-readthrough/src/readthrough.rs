//! The read-through orchestrator.

use crate::circuit::{Admission, CircuitBreaker, CircuitState, Transition};
use crate::config::{ConfigError, ReadThroughConfig, ResourceConfig};
use crate::events::ReadThroughEvent;
use crate::fallback::FallbackChain;
use crate::inflight::{Completion, InFlight, Role};
use crate::query::QueryShape;
use crate::retry::RetryExecutor;
use crate::shaper::{NormalizedRecord, ResponseShaper};
use crate::store::{CacheEntry, CacheStore, Freshness, FreshnessPolicy};
use crate::upstream::{HttpUpstream, Upstream, UpstreamConfig};
use catalog_readthrough_core::{EventListeners, ReadError, UpstreamError};
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[cfg(feature = "metrics")]
use metrics::{counter, describe_counter};

/// Times a request re-joins after the fetch it waited on ended without a
/// result.
const MAX_REJOINS: usize = 2;

/// What [`ReadThrough::fetch_normalized`] hands back.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadResponse {
    /// Shaped records, at most `limit` of them.
    pub records: Vec<NormalizedRecord>,
    /// The records come from the cache rather than from a fetch made for
    /// this request.
    pub cached: bool,
    /// The circuit breaker kept this request away from the upstream.
    pub breaker_engaged: bool,
}

impl ReadResponse {
    fn from_entry(entry: &CacheEntry, limit: usize, cached: bool, breaker_engaged: bool) -> Self {
        Self {
            records: entry.payload().iter().take(limit).cloned().collect(),
            cached,
            breaker_engaged,
        }
    }
}

/// Result of one fetch, shared with every request coalesced onto it.
#[derive(Debug, Clone)]
enum FetchOutcome {
    /// The cache was updated. `kept_previous` is set when an empty result
    /// was discarded in favour of the existing non-empty payload.
    Stored {
        entry: Arc<CacheEntry>,
        kept_previous: bool,
    },
    /// The breaker refused the upstream call.
    Rejected,
    /// The fallback chain failed.
    Failed(ReadError),
}

struct Resource {
    chain: FallbackChain,
    shaper: ResponseShaper,
}

struct Inner<U> {
    name: String,
    upstream: U,
    resources: HashMap<String, Resource>,
    freshness: FreshnessPolicy,
    sync_deadline: Duration,
    refresh_deadline: Duration,
    store: CacheStore,
    breaker: CircuitBreaker,
    in_flight: Arc<InFlight<QueryShape, FetchOutcome>>,
    tasks: Mutex<JoinSet<()>>,
    event_listeners: EventListeners<ReadThroughEvent>,
}

/// Resilient read-through cache in front of a catalog upstream.
///
/// Cheap to clone; every clone shares the cache, the breaker and the set of
/// running fetches. Build one at startup and hand clones to request
/// handlers.
///
/// Every upstream fetch runs as a spawned task. A request that is dropped
/// while waiting does not cancel the fetch other requests may be sharing;
/// call [`shutdown`](Self::shutdown) to wait for outstanding work.
pub struct ReadThrough<U = HttpUpstream> {
    inner: Arc<Inner<U>>,
}

impl<U> Clone for ReadThrough<U> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl ReadThrough<HttpUpstream> {
    /// Builds a read-through cache over an HTTP upstream.
    pub fn connect(
        upstream: UpstreamConfig,
        config: ReadThroughConfig,
        resources: Vec<ResourceConfig>,
    ) -> Result<Self, ConfigError> {
        Self::new(HttpUpstream::new(upstream)?, config, resources)
    }
}

impl<U: Upstream> ReadThrough<U> {
    /// Builds a read-through cache over any [`Upstream`].
    ///
    /// Fails if a resource has no endpoint candidates or two resources share
    /// a name.
    pub fn new(
        upstream: U,
        config: ReadThroughConfig,
        resources: Vec<ResourceConfig>,
    ) -> Result<Self, ConfigError> {
        #[cfg(feature = "metrics")]
        {
            describe_counter!(
                "readthrough_requests_total",
                "Requests answered by the read-through cache, by outcome"
            );
            describe_counter!(
                "readthrough_upstream_fetches_total",
                "Fallback chain runs against the upstream, by outcome"
            );
            describe_counter!(
                "readthrough_circuit_transitions_total",
                "Circuit breaker state transitions"
            );
            describe_counter!(
                "readthrough_retries_total",
                "Backoff retries against a single endpoint candidate"
            );
        }

        let ReadThroughConfig {
            name,
            freshness,
            failure_threshold,
            cooldown,
            retry,
            sync_deadline,
            refresh_deadline,
            event_listeners,
        } = config;

        let mut by_name = HashMap::with_capacity(resources.len());
        for resource in resources {
            if resource.candidates.is_empty() {
                return Err(ConfigError::Invalid {
                    key: "candidates",
                    reason: format!("resource '{}' has no endpoint candidates", resource.name),
                });
            }
            if by_name.contains_key(&resource.name) {
                return Err(ConfigError::Invalid {
                    key: "resources",
                    reason: format!("resource '{}' is configured twice", resource.name),
                });
            }
            let executor =
                RetryExecutor::new(retry.clone()).observed(name.clone(), event_listeners.clone());
            let chain = FallbackChain::new(resource.candidates, executor)
                .with_early_stop(resource.early_stop)
                .observed(name.clone(), event_listeners.clone());
            by_name.insert(
                resource.name,
                Resource {
                    chain,
                    shaper: resource.shaper,
                },
            );
        }

        info!(
            readthrough = %name,
            resources = by_name.len(),
            fresh_ms = freshness.fresh_window.as_millis() as u64,
            max_serve_ms = freshness.max_serve_window.as_millis() as u64,
            "read-through cache ready"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                name,
                upstream,
                resources: by_name,
                freshness,
                sync_deadline,
                refresh_deadline,
                store: CacheStore::new(),
                breaker: CircuitBreaker::new(failure_threshold, cooldown),
                in_flight: InFlight::new(),
                tasks: Mutex::new(JoinSet::new()),
                event_listeners,
            }),
        })
    }

    /// Returns up to `limit` shaped records for `shape`.
    ///
    /// Answers from the cache whenever the breaker is open or the entry is
    /// fresh or stale-but-serveable; a stale answer also starts a background
    /// refresh. Otherwise fetches synchronously, falling back to whatever is
    /// cached if the fetch fails. An error is returned only when nothing is
    /// cached for `shape`.
    pub async fn fetch_normalized(
        &self,
        shape: &QueryShape,
        limit: usize,
    ) -> Result<ReadResponse, ReadError> {
        let inner = &self.inner;
        if !inner.resources.contains_key(shape.resource()) {
            return Err(ReadError::UnknownResource(shape.resource().to_string()));
        }

        let now = Instant::now();
        let cached = inner.store.get(shape);

        if inner.breaker.should_bypass_upstream(now) {
            debug!(readthrough = %inner.name, query = %shape, cached = cached.is_some(), "circuit open, bypassing upstream");
            self.emit(|| ReadThroughEvent::UpstreamBypassed {
                name: inner.name.clone(),
                query: shape.to_string(),
            });
            self.count_request("bypassed");
            return match cached {
                Some(entry) => Ok(ReadResponse::from_entry(&entry, limit, true, true)),
                None => Err(ReadError::UpstreamUnavailable),
            };
        }

        let freshness = cached
            .as_ref()
            .map(|entry| inner.freshness.classify(entry.age(now)));
        match (&cached, freshness) {
            (Some(entry), Some(freshness @ (Freshness::Fresh | Freshness::StaleButServeable))) => {
                self.emit(|| ReadThroughEvent::CacheHit {
                    name: inner.name.clone(),
                    query: shape.to_string(),
                    freshness,
                });
                if freshness == Freshness::Fresh {
                    self.count_request("fresh");
                } else {
                    self.count_request("stale");
                    self.refresh_in_background(shape);
                }
                return Ok(ReadResponse::from_entry(entry, limit, true, false));
            }
            _ => {
                if freshness == Some(Freshness::Expired) {
                    debug!(readthrough = %inner.name, query = %shape, "cache entry expired, fetching");
                }
                self.emit(|| ReadThroughEvent::CacheMiss {
                    name: inner.name.clone(),
                    query: shape.to_string(),
                    expired: freshness.is_some(),
                });
            }
        }

        match self.fetch_shared(shape).await {
            FetchOutcome::Stored {
                entry,
                kept_previous,
            } => {
                self.count_request("fetched");
                Ok(ReadResponse::from_entry(&entry, limit, kept_previous, false))
            }
            FetchOutcome::Rejected => {
                self.count_request("bypassed");
                match inner.store.get(shape).or(cached) {
                    Some(entry) => Ok(ReadResponse::from_entry(&entry, limit, true, true)),
                    None => Err(ReadError::UpstreamUnavailable),
                }
            }
            FetchOutcome::Failed(error) => match inner.store.get(shape).or(cached) {
                Some(entry) => {
                    debug!(readthrough = %inner.name, query = %shape, error_kind = error.kind(), "fetch failed, serving cached entry");
                    self.count_request("degraded");
                    Ok(ReadResponse::from_entry(&entry, limit, true, false))
                }
                None => {
                    self.count_request("error");
                    Err(error)
                }
            },
        }
    }

    /// Waits for the fetch of `shape`, starting one if none is running.
    async fn fetch_shared(&self, shape: &QueryShape) -> FetchOutcome {
        let deadline = Instant::now() + self.inner.sync_deadline;

        for _ in 0..=MAX_REJOINS {
            let mut rx = match self.inner.in_flight.join(shape) {
                Role::Leader(rx, completion) => {
                    self.spawn_fetch(shape.clone(), completion, false);
                    rx
                }
                Role::Waiter(rx) => {
                    debug!(readthrough = %self.inner.name, query = %shape, "joining fetch in flight");
                    self.emit(|| ReadThroughEvent::Coalesced {
                        name: self.inner.name.clone(),
                        query: shape.to_string(),
                    });
                    rx
                }
            };

            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Ok(outcome)) => return outcome,
                Ok(Err(RecvError::Closed | RecvError::Lagged(_))) => {
                    debug!(readthrough = %self.inner.name, query = %shape, "fetch ended without a result, rejoining");
                }
                Err(_elapsed) => {
                    warn!(readthrough = %self.inner.name, query = %shape, "deadline exceeded waiting for fetch");
                    return FetchOutcome::Failed(ReadError::UpstreamTimeout);
                }
            }
        }

        FetchOutcome::Failed(ReadError::UpstreamExhausted {
            last: UpstreamError::Transport("fetch task ended without a result".into()),
        })
    }

    /// Starts a refresh of `shape` unless one is already running.
    fn refresh_in_background(&self, shape: &QueryShape) {
        match self.inner.in_flight.join(shape) {
            Role::Leader(_rx, completion) => {
                debug!(readthrough = %self.inner.name, query = %shape, "starting background refresh");
                self.spawn_fetch(shape.clone(), completion, true);
            }
            Role::Waiter(_) => {
                debug!(readthrough = %self.inner.name, query = %shape, "refresh already in flight");
            }
        }
    }

    fn spawn_fetch(&self, shape: QueryShape, completion: Completion<FetchOutcome>, background: bool) {
        let this = self.clone();
        let mut tasks = self.inner.tasks.lock();
        while let Some(finished) = tasks.try_join_next() {
            if let Err(error) = finished {
                warn!(readthrough = %self.inner.name, %error, "fetch task did not complete");
            }
        }
        tasks.spawn(async move {
            let outcome = this.run_fetch(&shape, background).await;
            completion.complete(outcome);
        });
    }

    /// One pass through the breaker, the fallback chain and the cache.
    async fn run_fetch(&self, shape: &QueryShape, background: bool) -> FetchOutcome {
        let inner = &self.inner;
        let Some(resource) = inner.resources.get(shape.resource()) else {
            return FetchOutcome::Failed(ReadError::UnknownResource(shape.resource().to_string()));
        };

        match inner.breaker.try_acquire(Instant::now()) {
            Admission::Permitted => {}
            Admission::Probe => {
                info!(readthrough = %inner.name, query = %shape, "circuit half-open, probing upstream");
            }
            Admission::Rejected => {
                debug!(readthrough = %inner.name, query = %shape, background, "circuit rejected fetch");
                return FetchOutcome::Rejected;
            }
        }

        self.emit(|| ReadThroughEvent::FetchStarted {
            name: inner.name.clone(),
            query: shape.to_string(),
            background,
        });
        let deadline = if background {
            inner.refresh_deadline
        } else {
            inner.sync_deadline
        };
        let result = resource
            .chain
            .fetch_within(&inner.upstream, shape, deadline)
            .await;
        let now = Instant::now();

        match result {
            Ok(success) => {
                let records = resource.shaper.shape(&success.records, None);
                let count = records.len();
                let (entry, kept_previous) = self.commit(shape, records, &success.candidate, now);
                self.record_outcome(true, now);
                self.count_fetch("success");

                debug!(readthrough = %inner.name, query = %shape, candidate = %success.candidate, records = count, kept_previous, background, "fetch succeeded");
                self.emit(|| ReadThroughEvent::FetchSucceeded {
                    name: inner.name.clone(),
                    query: shape.to_string(),
                    candidate: success.candidate.clone(),
                    records: count,
                });
                FetchOutcome::Stored {
                    entry,
                    kept_previous,
                }
            }
            Err(error) => {
                self.record_outcome(false, now);
                self.count_fetch("failure");

                let read_error = if error.is_timeout() {
                    ReadError::UpstreamTimeout
                } else {
                    ReadError::UpstreamExhausted {
                        last: error.last_error().cloned().unwrap_or_else(|| {
                            UpstreamError::Transport("no endpoint candidate ran".into())
                        }),
                    }
                };

                if background {
                    warn!(readthrough = %inner.name, query = %shape, error_kind = read_error.kind(), %error, "background refresh failed");
                    self.emit(|| ReadThroughEvent::RefreshFailed {
                        name: inner.name.clone(),
                        query: shape.to_string(),
                        error_kind: read_error.kind(),
                    });
                } else {
                    warn!(readthrough = %inner.name, query = %shape, error_kind = read_error.kind(), %error, "upstream fetch failed");
                }
                FetchOutcome::Failed(read_error)
            }
        }
    }

    /// Stores `records`, unless they are empty and a non-empty entry exists,
    /// in which case that entry is re-stamped and kept.
    fn commit(
        &self,
        shape: &QueryShape,
        records: Vec<NormalizedRecord>,
        candidate: &str,
        now: Instant,
    ) -> (Arc<CacheEntry>, bool) {
        let store = &self.inner.store;
        if records.is_empty() {
            let has_payload = store.get(shape).is_some_and(|entry| !entry.is_empty());
            if has_payload {
                if let Some(entry) = store.touch(shape, now) {
                    info!(readthrough = %self.inner.name, query = %shape, candidate, "empty result, keeping previous payload");
                    return (entry, true);
                }
            }
        }
        (store.put(shape.clone(), records, candidate, now), false)
    }

    fn record_outcome(&self, success: bool, now: Instant) {
        let inner = &self.inner;
        match inner.breaker.record_outcome(success, now) {
            Some(Transition::Opened { .. } | Transition::Reopened { .. }) => {
                let failures = inner.breaker.consecutive_failures();
                let cooldown = inner.breaker.cooldown();
                warn!(
                    readthrough = %inner.name,
                    consecutive_failures = failures,
                    cooldown_ms = cooldown.as_millis() as u64,
                    "circuit opened"
                );
                self.emit(|| ReadThroughEvent::CircuitOpened {
                    name: inner.name.clone(),
                    consecutive_failures: failures,
                    cooldown,
                });

                #[cfg(feature = "metrics")]
                counter!("readthrough_circuit_transitions_total", "readthrough" => inner.name.clone(), "to" => "open").increment(1);
            }
            Some(Transition::Closed) => {
                info!(readthrough = %inner.name, "circuit closed");
                self.emit(|| ReadThroughEvent::CircuitClosed {
                    name: inner.name.clone(),
                });

                #[cfg(feature = "metrics")]
                counter!("readthrough_circuit_transitions_total", "readthrough" => inner.name.clone(), "to" => "closed").increment(1);
            }
            None => {}
        }
    }
}

impl<U> ReadThrough<U> {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.inner.breaker.state(Instant::now())
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.breaker.consecutive_failures()
    }

    /// The current cache entry for `shape`, whatever its age.
    pub fn cached_entry(&self, shape: &QueryShape) -> Option<Arc<CacheEntry>> {
        self.inner.store.get(shape)
    }

    /// Number of queries with a fetch running.
    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.len()
    }

    /// Waits until every spawned fetch, including ones started while
    /// waiting, has finished.
    pub async fn join_background(&self) {
        loop {
            let mut tasks = std::mem::take(&mut *self.inner.tasks.lock());
            if tasks.is_empty() {
                return;
            }
            while let Some(finished) = tasks.join_next().await {
                if let Err(error) = finished {
                    warn!(readthrough = %self.inner.name, %error, "fetch task did not complete");
                }
            }
        }
    }

    /// Consumes this handle after waiting for outstanding fetches.
    pub async fn shutdown(self) {
        self.join_background().await;
        debug!(readthrough = %self.inner.name, "read-through cache shut down");
    }

    fn emit<F>(&self, event: F)
    where
        F: FnOnce() -> ReadThroughEvent,
    {
        if !self.inner.event_listeners.is_empty() {
            self.inner.event_listeners.emit(&event());
        }
    }

    #[cfg_attr(not(feature = "metrics"), allow(unused_variables))]
    fn count_request(&self, outcome: &'static str) {
        #[cfg(feature = "metrics")]
        counter!("readthrough_requests_total", "readthrough" => self.inner.name.clone(), "outcome" => outcome).increment(1);
    }

    #[cfg_attr(not(feature = "metrics"), allow(unused_variables))]
    fn count_fetch(&self, outcome: &'static str) {
        #[cfg(feature = "metrics")]
        counter!("readthrough_upstream_fetches_total", "readthrough" => self.inner.name.clone(), "outcome" => outcome).increment(1);
    }
}

impl<U> fmt::Debug for ReadThrough<U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadThrough")
            .field("name", &self.inner.name)
            .field("resources", &self.inner.resources.len())
            .field("freshness", &self.inner.freshness)
            .field("cached_queries", &self.inner.store.len())
            .field("in_flight", &self.inner.in_flight.len())
            .finish()
    }
}
