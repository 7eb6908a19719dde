//! Ordered fallback over semantically equivalent endpoints.
//!
//! The upstream's resource model differs between deployments: a listing of
//! bookable items may live behind `type=booking`, `type=bookable`, or only
//! show up in the full published catalog. A [`FallbackChain`] probes those
//! variants in priority order and takes the first structurally valid answer.
//!
//! Per candidate, transient failures are retried by the [`RetryExecutor`];
//! permanent ones (4xx, shape errors) move straight to the next candidate.

use crate::events::ReadThroughEvent;
use crate::query::QueryShape;
use crate::retry::RetryExecutor;
use crate::upstream::{Upstream, UpstreamRequest};
use catalog_readthrough_core::{EventListeners, UpstreamError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Checks that a response body has the structure the shaper expects.
pub type Validator = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// Decides, from the raw records gathered so far, that further pages of the
/// current candidate are not needed.
pub type EarlyStop = Arc<dyn Fn(&[Value]) -> bool + Send + Sync>;

/// Default validator: a JSON array, possibly empty, of objects whose `id` is
/// a non-negative integer, the only id the shaper can key records by.
pub fn record_list(body: &Value) -> Result<(), String> {
    let items = body
        .as_array()
        .ok_or_else(|| format!("expected a JSON array, got {}", json_type(body)))?;
    for (index, item) in items.iter().enumerate() {
        let Some(record) = item.as_object() else {
            return Err(format!("record {index} is {}, not an object", json_type(item)));
        };
        match record.get("id") {
            Some(id) if id.as_u64().is_some() => {}
            Some(id) => return Err(format!("record {index} has a non-integer id: {id}")),
            None => return Err(format!("record {index} has no id")),
        }
    }
    Ok(())
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Page-by-page fetching for a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Sent as `per_page`; a shorter page ends the walk.
    pub per_page: usize,
    /// Upper bound on pages requested from this candidate.
    pub max_pages: usize,
}

/// One way to ask the upstream for a logical resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointCandidate {
    /// Name used in logs and events.
    pub label: String,
    /// Path relative to the upstream base URL.
    pub path: String,
    /// Filters identifying this variant.
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default)]
    pub pagination: Option<Pagination>,
}

impl EndpointCandidate {
    pub fn new(label: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            path: path.into(),
            query: BTreeMap::new(),
            pagination: None,
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    pub fn paginated(mut self, per_page: usize, max_pages: usize) -> Self {
        self.pagination = Some(Pagination {
            per_page: per_page.max(1),
            max_pages: max_pages.max(1),
        });
        self
    }

    /// Builds the request for `page` (1-based) of `shape`.
    ///
    /// Shape parameters override candidate parameters of the same name.
    pub(crate) fn request(&self, shape: &QueryShape, page: usize, timeout: Duration) -> UpstreamRequest {
        let mut request = UpstreamRequest::new(self.path.clone(), timeout);
        request.query = self.query.clone();
        request
            .query
            .extend(shape.params().iter().map(|(k, v)| (k.clone(), v.clone())));
        if let Some(pagination) = self.pagination {
            request = request
                .param("per_page", pagination.per_page.to_string())
                .param("page", page.to_string());
        }
        request
    }
}

/// The winning candidate and its raw records.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainSuccess {
    pub candidate: String,
    pub records: Vec<Value>,
}

/// Why a candidate was given up on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateFailure {
    pub candidate: String,
    pub error: UpstreamError,
}

/// Failure of the whole chain.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    /// Every candidate failed.
    #[error("all {} endpoint candidates failed", failures.len())]
    Exhausted { failures: Vec<CandidateFailure> },

    /// The end-to-end deadline expired before any candidate succeeded.
    #[error("fallback chain exceeded its {0:?} deadline")]
    DeadlineExceeded(Duration),
}

impl ChainError {
    /// True if the deadline expired, or if every candidate failed by timing out.
    pub fn is_timeout(&self) -> bool {
        match self {
            ChainError::DeadlineExceeded(_) => true,
            ChainError::Exhausted { failures } => {
                !failures.is_empty() && failures.iter().all(|f| f.error.is_timeout())
            }
        }
    }

    /// The last per-candidate error, if any candidate ran.
    pub fn last_error(&self) -> Option<&UpstreamError> {
        match self {
            ChainError::Exhausted { failures } => failures.last().map(|f| &f.error),
            ChainError::DeadlineExceeded(_) => None,
        }
    }
}

/// Tries [`EndpointCandidate`]s in order until one yields a valid result.
#[derive(Clone)]
pub struct FallbackChain {
    candidates: Arc<[EndpointCandidate]>,
    retry: RetryExecutor,
    validator: Validator,
    early_stop: Option<EarlyStop>,
    name: String,
    event_listeners: EventListeners<ReadThroughEvent>,
}

impl FallbackChain {
    pub fn new(candidates: Vec<EndpointCandidate>, retry: RetryExecutor) -> Self {
        Self {
            candidates: candidates.into(),
            retry,
            validator: Arc::new(record_list),
            early_stop: None,
            name: String::from("<unnamed>"),
            event_listeners: EventListeners::new(),
        }
    }

    /// Replaces the default [`record_list`] validator.
    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    {
        self.validator = Arc::new(validator);
        self
    }

    pub fn with_early_stop(mut self, early_stop: Option<EarlyStop>) -> Self {
        self.early_stop = early_stop;
        self
    }

    pub(crate) fn observed(
        mut self,
        name: impl Into<String>,
        event_listeners: EventListeners<ReadThroughEvent>,
    ) -> Self {
        self.name = name.into();
        self.event_listeners = event_listeners;
        self
    }

    pub fn candidates(&self) -> &[EndpointCandidate] {
        &self.candidates
    }

    /// Like [`fetch`](Self::fetch), abandoning whatever candidate or retry is
    /// in progress once `deadline` elapses.
    pub async fn fetch_within<U: Upstream>(
        &self,
        upstream: &U,
        shape: &QueryShape,
        deadline: Duration,
    ) -> Result<ChainSuccess, ChainError> {
        match tokio::time::timeout(deadline, self.fetch(upstream, shape)).await {
            Ok(result) => result,
            Err(_elapsed) => {
                warn!(readthrough = %self.name, query = %shape, deadline_ms = deadline.as_millis() as u64, "fallback chain deadline exceeded");
                Err(ChainError::DeadlineExceeded(deadline))
            }
        }
    }

    /// Walks the candidates in order and returns the first valid result.
    pub async fn fetch<U: Upstream>(
        &self,
        upstream: &U,
        shape: &QueryShape,
    ) -> Result<ChainSuccess, ChainError> {
        let mut failures = Vec::new();

        for candidate in self.candidates.iter() {
            match self.fetch_candidate(upstream, candidate, shape).await {
                Ok(records) => {
                    debug!(
                        readthrough = %self.name,
                        query = %shape,
                        candidate = %candidate.label,
                        records = records.len(),
                        skipped = failures.len(),
                        "candidate succeeded"
                    );
                    return Ok(ChainSuccess {
                        candidate: candidate.label.clone(),
                        records,
                    });
                }
                Err(error) => {
                    debug!(readthrough = %self.name, query = %shape, candidate = %candidate.label, error_kind = error.kind(), %error, "candidate failed");
                    if !self.event_listeners.is_empty() {
                        self.event_listeners.emit(&ReadThroughEvent::CandidateFailed {
                            name: self.name.clone(),
                            candidate: candidate.label.clone(),
                            error: error.clone(),
                        });
                    }
                    failures.push(CandidateFailure {
                        candidate: candidate.label.clone(),
                        error,
                    });
                }
            }
        }

        Err(ChainError::Exhausted { failures })
    }

    async fn fetch_candidate<U: Upstream>(
        &self,
        upstream: &U,
        candidate: &EndpointCandidate,
        shape: &QueryShape,
    ) -> Result<Vec<Value>, UpstreamError> {
        let max_pages = candidate.pagination.map_or(1, |p| p.max_pages.max(1));
        let timeout = self.retry.plan().per_attempt_timeout;
        let mut records = Vec::new();

        for page in 1..=max_pages {
            let request = candidate.request(shape, page, timeout);
            let body = self
                .retry
                .execute(&candidate.label, || upstream.fetch(request.clone()))
                .await?;

            (self.validator)(&body).map_err(UpstreamError::Shape)?;
            let items = match body {
                Value::Array(items) => items,
                other => {
                    return Err(UpstreamError::Shape(format!(
                        "expected a JSON array, got {}",
                        json_type(&other)
                    )));
                }
            };

            let short_page = candidate
                .pagination
                .map_or(true, |p| items.len() < p.per_page);
            records.extend(items);

            if short_page {
                break;
            }
            if let Some(stop) = &self.early_stop {
                if stop(&records) {
                    debug!(readthrough = %self.name, candidate = %candidate.label, page, records = records.len(), "early stop");
                    break;
                }
            }
        }

        Ok(records)
    }
}

impl fmt::Debug for FallbackChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackChain")
            .field("name", &self.name)
            .field("candidates", &self.candidates)
            .field("retry", self.retry.plan())
            .field("early_stop", &self.early_stop.is_some())
            .finish()
    }
}
