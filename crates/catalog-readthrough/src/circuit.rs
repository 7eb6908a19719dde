use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Represents the state of the circuit breaker at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// The upstream is contacted normally.
    Closed,
    /// The cooldown has not elapsed; the upstream is bypassed.
    Open,
    /// The cooldown has elapsed and the circuit is waiting on a probe.
    HalfOpen,
}

/// Whether a fetch may contact the upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The circuit is closed.
    Permitted,
    /// The caller holds the single half-open trial.
    Probe,
    /// The circuit is open, or another probe is running.
    Rejected,
}

/// A state change caused by [`CircuitBreaker::record_outcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The failure threshold was reached.
    Opened { until: Instant },
    /// A failure was recorded while open or half-open; the cooldown restarts.
    Reopened { until: Instant },
    /// A success closed a previously open circuit.
    Closed,
}

#[derive(Debug, Default)]
struct Circuit {
    consecutive_failures: u32,
    open_until: Option<Instant>,
    probe_started: Option<Instant>,
}

impl Circuit {
    fn state(&self, now: Instant) -> CircuitState {
        match self.open_until {
            None => CircuitState::Closed,
            Some(until) if now < until => CircuitState::Open,
            Some(_) => CircuitState::HalfOpen,
        }
    }
}

/// Consecutive-failure circuit breaker shared by every query of one
/// read-through instance.
///
/// Time is always passed in by the caller so transitions are deterministic
/// under test. A half-open circuit admits one probe at a time; a probe that
/// never reports back releases its slot after another `cooldown`.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    inner: Mutex<Circuit>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown,
            inner: Mutex::new(Circuit::default()),
        }
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    pub fn state(&self, now: Instant) -> CircuitState {
        self.inner.lock().state(now)
    }

    /// True iff the circuit is open and `now` is before the end of the cooldown.
    pub fn should_bypass_upstream(&self, now: Instant) -> bool {
        self.inner.lock().state(now) == CircuitState::Open
    }

    /// Asks to contact the upstream.
    pub fn try_acquire(&self, now: Instant) -> Admission {
        let mut circuit = self.inner.lock();
        match circuit.state(now) {
            CircuitState::Closed => Admission::Permitted,
            CircuitState::Open => Admission::Rejected,
            CircuitState::HalfOpen => match circuit.probe_started {
                Some(started) if now < started + self.cooldown => Admission::Rejected,
                _ => {
                    circuit.probe_started = Some(now);
                    Admission::Probe
                }
            },
        }
    }

    /// Records the outcome of a whole fallback chain run.
    ///
    /// A success resets the failure count and closes the circuit. A failure
    /// increments the count, opening the circuit once it reaches the
    /// threshold; while the circuit is already open or half-open every
    /// failure pushes `open_until` to `now + cooldown`.
    pub fn record_outcome(&self, success: bool, now: Instant) -> Option<Transition> {
        let mut circuit = self.inner.lock();
        circuit.probe_started = None;

        if success {
            circuit.consecutive_failures = 0;
            return circuit.open_until.take().map(|_| Transition::Closed);
        }

        circuit.consecutive_failures = circuit.consecutive_failures.saturating_add(1);
        let until = now + self.cooldown;
        if circuit.open_until.is_some() {
            circuit.open_until = Some(until);
            Some(Transition::Reopened { until })
        } else if circuit.consecutive_failures >= self.failure_threshold {
            circuit.open_until = Some(until);
            Some(Transition::Opened { until })
        } else {
            None
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    pub fn open_until(&self) -> Option<Instant> {
        self.inner.lock().open_until
    }
}
