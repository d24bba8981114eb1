//! Circuit breaker
//!
//! Failure-isolation state machine guarding calls to a flaky dependency:
//!
//! ```text
//! CLOSED --(failure_threshold consecutive failures)--> OPEN
//! OPEN --(timeout elapsed)--> HALF_OPEN (half_open_max_calls probes allowed)
//! HALF_OPEN --(success_threshold successes)--> CLOSED
//! HALF_OPEN --(any failure)--> OPEN
//! ```
//!
//! The breaker does not time individual calls; it stops issuing them once
//! failures cluster.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
const DEFAULT_SUCCESS_THRESHOLD: u32 = 1;
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_HALF_OPEN_MAX_CALLS: u32 = 1;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Requests flow normally
    Closed,
    /// Requests are rejected
    Open,
    /// A limited number of probes test whether the dependency recovered
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        })
    }
}

/// Circuit breaker tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Successful probes needed to close from half-open
    pub success_threshold: u32,
    /// How long the circuit stays open before probing
    pub timeout: Duration,
    /// Concurrent probes allowed while half-open
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            success_threshold: DEFAULT_SUCCESS_THRESHOLD,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            half_open_max_calls: DEFAULT_HALF_OPEN_MAX_CALLS,
        }
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub opened_at: Option<Instant>,
    /// Calls rejected without being attempted
    pub rejected: u64,
}

/// Error returned by [`CircuitBreaker::call`]
#[derive(Error, Debug)]
pub enum CircuitBreakerError<E> {
    /// The call was not attempted
    #[error("circuit breaker '{0}' is open")]
    Open(String),
    /// The call was attempted and failed
    #[error(transparent)]
    Inner(E),
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
    rejected: u64,
    /// Bumped on every state change; outcomes of calls admitted under an
    /// older generation are discarded
    generation: u64,
}

impl BreakerState {
    fn enter(&mut self, state: CircuitState) {
        self.state = state;
        self.generation = self.generation.wrapping_add(1);
    }
}

/// Ticket for one call admitted by [`CircuitBreaker::call`]
#[derive(Debug, Clone, Copy)]
struct Admission {
    generation: u64,
    /// Holds one of the HALF_OPEN probe slots
    probe: bool,
}

/// Thread-safe circuit breaker
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config: CircuitBreakerConfig {
                failure_threshold: config.failure_threshold.max(1),
                success_threshold: config.success_threshold.max(1),
                half_open_max_calls: config.half_open_max_calls.max(1),
                ..config
            },
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
                half_open_in_flight: 0,
                rejected: 0,
                generation: 0,
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, applying the time-based OPEN -> HALF_OPEN transition
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        inner.state
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        CircuitBreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            opened_at: inner.opened_at,
            rejected: inner.rejected,
        }
    }

    /// Decide whether a call may proceed
    ///
    /// In HALF_OPEN every `true` hands out one probe permit; the caller must
    /// follow up with `record_success`, `record_failure` or `release_probe`.
    pub fn allow_request(&self) -> bool {
        self.admit().is_some()
    }

    fn admit(&self) -> Option<Admission> {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);

        let probe = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                inner.rejected += 1;
                return None;
            }
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight >= self.config.half_open_max_calls {
                    inner.rejected += 1;
                    return None;
                }
                inner.half_open_in_flight += 1;
                true
            }
        };
        Some(Admission {
            generation: inner.generation,
            probe,
        })
    }

    /// Record a successful call; in HALF_OPEN this settles one probe permit
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        let probe = inner.state == CircuitState::HalfOpen;
        self.on_success(&mut inner, probe);
    }

    /// Record a failed call
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        self.on_failure(&mut inner);
    }

    /// Apply the outcome of an admitted call unless the breaker moved on since
    fn settle(&self, admission: Admission, success: bool) {
        let mut inner = self.inner.lock();
        if inner.generation != admission.generation {
            debug!(
                breaker = %self.name,
                success,
                "Discarding outcome of a call admitted in an earlier state"
            );
            return;
        }
        if success {
            self.on_success(&mut inner, admission.probe);
        } else {
            self.on_failure(&mut inner);
        }
    }

    fn on_success(&self, inner: &mut BreakerState, probe: bool) {
        inner.consecutive_failures = 0;

        if inner.state == CircuitState::HalfOpen && probe {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
            inner.consecutive_successes += 1;
            if inner.consecutive_successes >= self.config.success_threshold {
                inner.enter(CircuitState::Closed);
                inner.consecutive_successes = 0;
                inner.opened_at = None;
                inner.half_open_in_flight = 0;
                info!(breaker = %self.name, "Circuit breaker closed");
            }
        }
    }

    fn on_failure(&self, inner: &mut BreakerState) {
        inner.consecutive_successes = 0;
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        let trip = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.consecutive_failures >= self.config.failure_threshold,
            CircuitState::Open => false,
        };

        if trip {
            inner.enter(CircuitState::Open);
            inner.opened_at = Some(Instant::now());
            inner.half_open_in_flight = 0;
            warn!(
                breaker = %self.name,
                failures = inner.consecutive_failures,
                timeout_ms = self.config.timeout.as_millis(),
                "Circuit breaker opened"
            );
        }
    }

    /// Return a probe permit whose call ended without an outcome
    pub fn release_probe(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }

    fn release(&self, admission: Admission) {
        let mut inner = self.inner.lock();
        if admission.probe && inner.generation == admission.generation {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }

    /// Force the breaker back to CLOSED with cleared counters
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.enter(CircuitState::Closed);
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.opened_at = None;
        inner.half_open_in_flight = 0;
    }

    /// Run a fallible future under the breaker
    ///
    /// # Errors
    ///
    /// `CircuitBreakerError::Open` when the call was short-circuited,
    /// `CircuitBreakerError::Inner` with the call's own error otherwise.
    pub async fn call<T, E, F>(&self, fut: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        let Some(admission) = self.admit() else {
            return Err(CircuitBreakerError::Open(self.name.clone()));
        };

        let mut permit = ProbePermit {
            breaker: self,
            admission,
            settled: false,
        };
        let result = fut.await;
        permit.settled = true;

        match result {
            Ok(value) => {
                self.settle(admission, true);
                Ok(value)
            }
            Err(e) => {
                self.settle(admission, false);
                Err(CircuitBreakerError::Inner(e))
            }
        }
    }

    fn refresh(&self, inner: &mut BreakerState) {
        if inner.state != CircuitState::Open {
            return;
        }
        let elapsed = inner
            .opened_at
            .is_none_or(|opened_at| opened_at.elapsed() >= self.config.timeout);
        if elapsed {
            inner.enter(CircuitState::HalfOpen);
            inner.consecutive_successes = 0;
            inner.half_open_in_flight = 0;
            info!(breaker = %self.name, "Circuit breaker half-open, probing");
        }
    }
}

/// Gives a probe permit back if the call future is dropped mid-flight
struct ProbePermit<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    settled: bool,
}

impl Drop for ProbePermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release(self.admission);
        }
    }
}

/// Breakers keyed by backend identity
///
/// Handles to the same remote store share one breaker, so failures observed
/// by one handle protect the others.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the breaker for `name`, creating it with `config` on first use
    pub fn get_or_create(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config)))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Snapshots of every registered breaker
    pub fn snapshots(&self) -> Vec<(String, CircuitBreakerSnapshot)> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect()
    }
}
