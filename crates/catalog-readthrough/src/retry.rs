//! Retry with exponential backoff over a single endpoint.

use crate::config::ConfigError;
use crate::events::ReadThroughEvent;
use catalog_readthrough_core::{EventListeners, UpstreamError};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

#[cfg(feature = "metrics")]
use metrics::counter;

/// How one endpoint is retried.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPlan {
    /// Total attempts, including the first.
    pub max_attempts: usize,
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Growth factor applied to the delay after every further failure.
    pub backoff_multiplier: f64,
    /// Upper bound of a single attempt.
    pub per_attempt_timeout: Duration,
    /// Cap on any single delay, if set.
    pub max_delay: Option<Duration>,
}

impl Default for RetryPlan {
    /// 3 attempts, 200ms initial delay doubling each time (capped at 5s),
    /// 5s per attempt.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            backoff_multiplier: 2.0,
            per_attempt_timeout: Duration::from_secs(5),
            max_delay: Some(Duration::from_secs(5)),
        }
    }
}

impl RetryPlan {
    /// Delay to wait after failed attempt number `attempt` (1-based):
    /// `initial_delay * backoff_multiplier^(attempt - 1)`.
    pub fn delay_after(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as usize) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let delay = Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);
        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "max_attempts",
                reason: "must be at least 1".into(),
            });
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid {
                key: "backoff_multiplier",
                reason: format!("{} is not a finite value >= 1.0", self.backoff_multiplier),
            });
        }
        if self.per_attempt_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                key: "per_attempt_timeout",
                reason: "must be non-zero".into(),
            });
        }
        Ok(())
    }
}

/// Runs an operation under a [`RetryPlan`].
///
/// Errors that [`UpstreamError::is_retryable`] rejects are returned after the
/// first attempt. The backoff sleep is an ordinary future: dropping the
/// `execute` future abandons the remaining attempts.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    plan: RetryPlan,
    name: String,
    event_listeners: EventListeners<ReadThroughEvent>,
}

impl RetryExecutor {
    pub fn new(plan: RetryPlan) -> Self {
        Self {
            plan,
            name: String::from("<unnamed>"),
            event_listeners: EventListeners::new(),
        }
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

    pub fn plan(&self) -> &RetryPlan {
        &self.plan
    }

    /// Invokes `operation` until it succeeds, fails permanently, or the plan
    /// runs out of attempts. `label` identifies the endpoint in logs.
    pub async fn execute<F, Fut, T>(&self, label: &str, mut operation: F) -> Result<T, UpstreamError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        let max_attempts = self.plan.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let limit = self.plan.per_attempt_timeout;
            let result = match tokio::time::timeout(limit, operation()).await {
                Ok(result) => result,
                Err(_elapsed) => Err(UpstreamError::Timeout(limit)),
            };

            let error = match result {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(readthrough = %self.name, candidate = label, attempts = attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if !error.is_retryable() {
                debug!(readthrough = %self.name, candidate = label, error_kind = error.kind(), "not retrying permanent error");
                return Err(error);
            }
            if attempt >= max_attempts {
                debug!(readthrough = %self.name, candidate = label, attempts = attempt, error_kind = error.kind(), "retries exhausted");
                return Err(error);
            }

            let delay = self.plan.delay_after(attempt);
            debug!(
                readthrough = %self.name,
                candidate = label,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error_kind = error.kind(),
                "retrying after backoff"
            );
            if !self.event_listeners.is_empty() {
                self.event_listeners.emit(&ReadThroughEvent::RetryScheduled {
                    name: self.name.clone(),
                    candidate: label.to_string(),
                    attempt,
                    delay,
                });
            }

            #[cfg(feature = "metrics")]
            counter!("readthrough_retries_total", "readthrough" => self.name.clone()).increment(1);

            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
