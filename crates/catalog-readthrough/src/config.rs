//! Configuration for the read-through cache.

use crate::events::ReadThroughEvent;
use crate::fallback::{EarlyStop, EndpointCandidate};
use crate::retry::RetryPlan;
use crate::shaper::ResponseShaper;
use crate::store::FreshnessPolicy;
use catalog_readthrough_core::EventListeners;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Errors raised while assembling a read-through cache.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required setting is absent.
    #[error("missing required setting {0}")]
    Missing(&'static str),

    /// A setting is present but unusable.
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    /// The resource list could not be parsed.
    #[error("invalid resource list: {0}")]
    Resources(#[from] serde_json::Error),

    /// The HTTP client could not be constructed.
    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

/// Configuration for [`ReadThrough`](crate::ReadThrough).
pub struct ReadThroughConfig {
    pub(crate) name: String,
    pub(crate) freshness: FreshnessPolicy,
    pub(crate) failure_threshold: u32,
    pub(crate) cooldown: Duration,
    pub(crate) retry: RetryPlan,
    pub(crate) sync_deadline: Duration,
    pub(crate) refresh_deadline: Duration,
    pub(crate) event_listeners: EventListeners<ReadThroughEvent>,
}

impl ReadThroughConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> ReadThroughConfigBuilder {
        ReadThroughConfigBuilder::new()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn freshness(&self) -> FreshnessPolicy {
        self.freshness
    }

    pub fn retry_plan(&self) -> &RetryPlan {
        &self.retry
    }
}

impl fmt::Debug for ReadThroughConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadThroughConfig")
            .field("name", &self.name)
            .field("freshness", &self.freshness)
            .field("failure_threshold", &self.failure_threshold)
            .field("cooldown", &self.cooldown)
            .field("retry", &self.retry)
            .field("sync_deadline", &self.sync_deadline)
            .field("refresh_deadline", &self.refresh_deadline)
            .field("event_listeners", &self.event_listeners.len())
            .finish()
    }
}

/// Builder for [`ReadThroughConfig`].
pub struct ReadThroughConfigBuilder {
    name: String,
    fresh_window: Duration,
    max_serve_window: Duration,
    failure_threshold: u32,
    cooldown: Duration,
    retry: RetryPlan,
    sync_deadline: Duration,
    refresh_deadline: Duration,
    event_listeners: EventListeners<ReadThroughEvent>,
}

impl Default for ReadThroughConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadThroughConfigBuilder {
    /// Creates a new builder with defaults.
    ///
    /// Defaults:
    /// - fresh window: 60s, max-serve window: 10 minutes
    /// - failure threshold: 3, cooldown: 30s
    /// - retry: see [`RetryPlan::default`]
    /// - sync deadline: 10s, refresh deadline: 30s
    pub fn new() -> Self {
        Self {
            name: String::from("<unnamed>"),
            fresh_window: Duration::from_secs(60),
            max_serve_window: Duration::from_secs(600),
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
            retry: RetryPlan::default(),
            sync_deadline: Duration::from_secs(10),
            refresh_deadline: Duration::from_secs(30),
            event_listeners: EventListeners::new(),
        }
    }

    /// Starts from the defaults and applies `CATALOG_*` environment overrides.
    ///
    /// Durations are whole milliseconds:
    /// `CATALOG_FRESH_WINDOW_MS`, `CATALOG_MAX_SERVE_WINDOW_MS`,
    /// `CATALOG_COOLDOWN_MS`, `CATALOG_RETRY_INITIAL_DELAY_MS`,
    /// `CATALOG_ATTEMPT_TIMEOUT_MS`, `CATALOG_SYNC_DEADLINE_MS`,
    /// `CATALOG_REFRESH_DEADLINE_MS`. Counts: `CATALOG_FAILURE_THRESHOLD`,
    /// `CATALOG_RETRY_MAX_ATTEMPTS`. Float: `CATALOG_RETRY_MULTIPLIER`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::new().apply_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn apply_lookup<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let millis = |key: &'static str| -> Result<Option<Duration>, ConfigError> {
            lookup(key)
                .map(|raw| {
                    raw.trim()
                        .parse::<u64>()
                        .map(Duration::from_millis)
                        .map_err(|e| ConfigError::Invalid {
                            key,
                            reason: e.to_string(),
                        })
                })
                .transpose()
        };

        if let Some(d) = millis("CATALOG_FRESH_WINDOW_MS")? {
            self.fresh_window = d;
        }
        if let Some(d) = millis("CATALOG_MAX_SERVE_WINDOW_MS")? {
            self.max_serve_window = d;
        }
        if let Some(d) = millis("CATALOG_COOLDOWN_MS")? {
            self.cooldown = d;
        }
        if let Some(d) = millis("CATALOG_RETRY_INITIAL_DELAY_MS")? {
            self.retry.initial_delay = d;
        }
        if let Some(d) = millis("CATALOG_ATTEMPT_TIMEOUT_MS")? {
            self.retry.per_attempt_timeout = d;
        }
        if let Some(d) = millis("CATALOG_SYNC_DEADLINE_MS")? {
            self.sync_deadline = d;
        }
        if let Some(d) = millis("CATALOG_REFRESH_DEADLINE_MS")? {
            self.refresh_deadline = d;
        }
        if let Some(raw) = lookup("CATALOG_FAILURE_THRESHOLD") {
            self.failure_threshold = parse(&raw, "CATALOG_FAILURE_THRESHOLD")?;
        }
        if let Some(raw) = lookup("CATALOG_RETRY_MAX_ATTEMPTS") {
            self.retry.max_attempts = parse(&raw, "CATALOG_RETRY_MAX_ATTEMPTS")?;
        }
        if let Some(raw) = lookup("CATALOG_RETRY_MULTIPLIER") {
            self.retry.backoff_multiplier = parse(&raw, "CATALOG_RETRY_MULTIPLIER")?;
        }
        Ok(self)
    }

    /// Sets the name used in logs, events and metrics.
    ///
    /// Default: `"<unnamed>"`
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Entries younger than this are served without touching the upstream.
    ///
    /// Default: 60 seconds
    pub fn fresh_window(mut self, window: Duration) -> Self {
        self.fresh_window = window;
        self
    }

    /// Entries younger than this (but past the fresh window) are served
    /// immediately while a background refresh runs.
    ///
    /// Default: 10 minutes
    pub fn max_serve_window(mut self, window: Duration) -> Self {
        self.max_serve_window = window;
        self
    }

    /// Consecutive failed fetches that open the circuit.
    ///
    /// Default: 3
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// How long an open circuit bypasses the upstream.
    ///
    /// Default: 30 seconds
    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Replaces the whole retry plan.
    pub fn retry_plan(mut self, plan: RetryPlan) -> Self {
        self.retry = plan;
        self
    }

    /// Total attempts per endpoint candidate, including the first.
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.retry.max_attempts = attempts;
        self
    }

    /// Delay before the first retry; later delays grow by the multiplier.
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.retry.initial_delay = delay;
        self
    }

    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.retry.backoff_multiplier = multiplier;
        self
    }

    /// Timeout for one HTTP call.
    pub fn per_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.retry.per_attempt_timeout = timeout;
        self
    }

    /// End-to-end budget of a request-path fetch, across every retry and
    /// every candidate.
    ///
    /// Default: 10 seconds
    pub fn sync_deadline(mut self, deadline: Duration) -> Self {
        self.sync_deadline = deadline;
        self
    }

    /// End-to-end budget of a background refresh.
    ///
    /// Default: 30 seconds
    pub fn refresh_deadline(mut self, deadline: Duration) -> Self {
        self.refresh_deadline = deadline;
        self
    }

    /// Registers a callback for every [`ReadThroughEvent`].
    pub fn on_event<F>(mut self, f: F) -> Self
    where
        F: Fn(&ReadThroughEvent) + Send + Sync + 'static,
    {
        self.event_listeners.add(f);
        self
    }

    /// Registers a callback invoked when the circuit opens or re-opens.
    ///
    /// # Callback Signature
    /// `Fn(Duration)` - called with the cooldown the circuit will stay open.
    pub fn on_circuit_open<F>(mut self, f: F) -> Self
    where
        F: Fn(Duration) + Send + Sync + 'static,
    {
        self.event_listeners.add(move |event| {
            if let ReadThroughEvent::CircuitOpened { cooldown, .. } = event {
                f(*cooldown);
            }
        });
        self
    }

    /// Registers a callback invoked when a successful fetch closes the circuit.
    pub fn on_circuit_close<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.event_listeners.add_for("circuit_closed", move |_| f());
        self
    }

    /// Registers a callback invoked when a background refresh fails.
    ///
    /// # Callback Signature
    /// `Fn(&str)` - called with the stable error kind, e.g. `"timeout"`.
    pub fn on_refresh_failed<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.event_listeners.add(move |event| {
            if let ReadThroughEvent::RefreshFailed { error_kind, .. } = event {
                f(error_kind);
            }
        });
        self
    }

    /// Validates the settings and builds the configuration.
    pub fn build(self) -> Result<ReadThroughConfig, ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::Invalid {
                key: "failure_threshold",
                reason: "must be at least 1".into(),
            });
        }
        if self.max_serve_window < self.fresh_window {
            return Err(ConfigError::Invalid {
                key: "max_serve_window",
                reason: format!(
                    "{:?} is shorter than the fresh window {:?}",
                    self.max_serve_window, self.fresh_window
                ),
            });
        }
        self.retry.validate()?;

        Ok(ReadThroughConfig {
            name: self.name,
            freshness: FreshnessPolicy::new(self.fresh_window, self.max_serve_window),
            failure_threshold: self.failure_threshold,
            cooldown: self.cooldown,
            retry: self.retry,
            sync_deadline: self.sync_deadline,
            refresh_deadline: self.refresh_deadline,
            event_listeners: self.event_listeners,
        })
    }
}

fn parse<T>(raw: &str, key: &'static str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        reason: e.to_string(),
    })
}

/// One logical resource: its endpoint candidates in priority order and the
/// shaping applied to whatever they return.
///
/// Deserializable so deployments can ship the candidate list as JSON:
///
/// ```
/// use catalog_readthrough::ResourceConfig;
///
/// let resources = ResourceConfig::list_from_json(r#"[
///   { "name": "bookable",
///     "candidates": [
///       { "label": "booking-type", "path": "products", "query": { "type": "booking" } },
///       { "label": "all-published", "path": "products", "query": { "status": "publish" },
///         "pagination": { "per_page": 50, "max_pages": 4 } }
///     ],
///     "shaper": { "kinds": ["booking"], "sort": "name" } }
/// ]"#).unwrap();
/// assert_eq!(resources[0].candidates().len(), 2);
/// ```
#[derive(Clone, Deserialize)]
pub struct ResourceConfig {
    pub(crate) name: String,
    pub(crate) candidates: Vec<EndpointCandidate>,
    #[serde(default)]
    pub(crate) shaper: ResponseShaper,
    #[serde(skip)]
    pub(crate) early_stop: Option<EarlyStop>,
}

impl ResourceConfig {
    pub fn new(name: impl Into<String>, candidates: Vec<EndpointCandidate>) -> Self {
        Self {
            name: name.into(),
            candidates,
            shaper: ResponseShaper::default(),
            early_stop: None,
        }
    }

    pub fn shaper(mut self, shaper: ResponseShaper) -> Self {
        self.shaper = shaper;
        self
    }

    /// Stops paging through a candidate once `predicate` holds for the raw
    /// records gathered so far.
    ///
    /// Trades completeness for latency: records on later pages are never
    /// seen, so a filter applied afterwards can miss matches.
    pub fn early_stop<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&[serde_json::Value]) -> bool + Send + Sync + 'static,
    {
        self.early_stop = Some(Arc::new(predicate));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn candidates(&self) -> &[EndpointCandidate] {
        &self.candidates
    }

    /// Parses a JSON array of resources.
    pub fn list_from_json(json: &str) -> Result<Vec<ResourceConfig>, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }
}

impl fmt::Debug for ResourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceConfig")
            .field("name", &self.name)
            .field("candidates", &self.candidates)
            .field("shaper", &self.shaper)
            .field("early_stop", &self.early_stop.is_some())
            .finish()
    }
}
