//! Circuit breaker with a trailing failure window.
//!
//! - `Closed`: calls pass through; failures inside `failure_window` are
//!   counted, and reaching `failure_threshold` opens the circuit.
//! - `Open`: calls short-circuit with [`Error::CircuitOpen`] until
//!   `reset_timeout` elapses; the transition to half-open happens lazily on
//!   the next call, not on a timer.
//! - `HalfOpen`: calls pass through as probes; `success_threshold`
//!   consecutive successes close the circuit, any failure re-opens it.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::{Error, Result};
use crate::waiter::lock_state;

/// Breaker state machine positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures within `failure_window` that open the circuit.
    pub failure_threshold: u32,
    /// Trailing window for counting failures.
    pub failure_window: Duration,
    /// How long the circuit stays open before probing.
    pub reset_timeout: Duration,
    /// Consecutive half-open successes required to close.
    pub success_threshold: u32,
    /// Optional timeout around each wrapped call.
    pub call_timeout: Option<Duration>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            reset_timeout: Duration::from_secs(30),
            success_threshold: 2,
            call_timeout: None,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_failure_window(mut self, window: Duration) -> Self {
        self.failure_window = window;
        self
    }

    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold.max(1);
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }
}

/// Point-in-time breaker counters. Ages are reported in milliseconds
/// relative to the snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub state: CircuitState,
    /// Failures currently inside the trailing window.
    pub failures: usize,
    /// Consecutive successes while half-open.
    pub successes: u32,
    pub total_calls: u64,
    pub total_failures: u64,
    pub total_successes: u64,
    pub last_failure_age_ms: Option<u64>,
    pub last_success_age_ms: Option<u64>,
    /// How long the circuit has been open, if open.
    pub open_for_ms: Option<u64>,
}

type StateObserver = Arc<dyn Fn(CircuitState, CircuitState) + Send + Sync>;
type OutcomeObserver = Arc<dyn Fn() + Send + Sync>;

struct BreakerState {
    state: CircuitState,
    failures: VecDeque<Instant>,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    total_calls: u64,
    total_failures: u64,
    total_successes: u64,
    last_failure: Option<Instant>,
    last_success: Option<Instant>,
}

/// Circuit breaker around calls to an unreliable dependency.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: StdMutex<BreakerState>,
    on_state_change: StdMutex<Vec<StateObserver>>,
    on_failure: StdMutex<Vec<OutcomeObserver>>,
    on_success: StdMutex<Vec<OutcomeObserver>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: StdMutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                consecutive_successes: 0,
                opened_at: None,
                total_calls: 0,
                total_failures: 0,
                total_successes: 0,
                last_failure: None,
                last_success: None,
            }),
            on_state_change: StdMutex::new(Vec::new()),
            on_failure: StdMutex::new(Vec::new()),
            on_success: StdMutex::new(Vec::new()),
        }
    }

    /// Register a best-effort state-change observer. Panics in observers
    /// are swallowed; they can never corrupt breaker state.
    pub fn on_state_change<F>(&self, observer: F)
    where
        F: Fn(CircuitState, CircuitState) + Send + Sync + 'static,
    {
        lock_state(&self.on_state_change).push(Arc::new(observer));
    }

    /// Register a best-effort failure observer.
    pub fn on_failure<F>(&self, observer: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        lock_state(&self.on_failure).push(Arc::new(observer));
    }

    /// Register a best-effort success observer.
    pub fn on_success<F>(&self, observer: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        lock_state(&self.on_success).push(Arc::new(observer));
    }

    /// Run a call through the breaker.
    ///
    /// When open and not yet due for a probe, returns
    /// [`Error::CircuitOpen`] without invoking the call at all.
    pub async fn execute<T, Fut>(&self, fut: Fut) -> Result<T>
    where
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.before_call()?;
        let outcome = match self.config.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(res) => res,
                Err(_) => Err(Error::OperationTimeout(limit)),
            },
            None => fut.await,
        };
        match outcome {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(err)
            }
        }
    }

    /// Like [`CircuitBreaker::execute`], but an open circuit yields the
    /// fallback value instead of an error.
    pub async fn execute_with_fallback<T, Fut, FB>(&self, fut: Fut, fallback: FB) -> Result<T>
    where
        Fut: std::future::Future<Output = Result<T>>,
        FB: FnOnce() -> T,
    {
        match self.execute(fut).await {
            Err(Error::CircuitOpen) => Ok(fallback()),
            other => other,
        }
    }

    /// Operational override: force the circuit open now.
    pub fn open(&self) {
        let change = {
            let mut st = lock_state(&self.state);
            Self::transition(&mut st, CircuitState::Open)
        };
        self.fire_state_change(change);
    }

    /// Operational override: close the circuit and forget its history.
    pub fn reset(&self) {
        let change = {
            let mut st = lock_state(&self.state);
            st.failures.clear();
            st.consecutive_successes = 0;
            Self::transition(&mut st, CircuitState::Closed)
        };
        self.fire_state_change(change);
    }

    /// Current state, without the lazy open-to-half-open evaluation.
    pub fn state(&self) -> CircuitState {
        lock_state(&self.state).state
    }

    /// Point-in-time counters. The failure list is pruned to the trailing
    /// window before it is counted.
    pub fn stats(&self) -> BreakerStats {
        let mut st = lock_state(&self.state);
        Self::prune(&mut st, self.config.failure_window);
        BreakerStats {
            state: st.state,
            failures: st.failures.len(),
            successes: st.consecutive_successes,
            total_calls: st.total_calls,
            total_failures: st.total_failures,
            total_successes: st.total_successes,
            last_failure_age_ms: st.last_failure.map(|t| t.elapsed().as_millis() as u64),
            last_success_age_ms: st.last_success.map(|t| t.elapsed().as_millis() as u64),
            open_for_ms: match st.state {
                CircuitState::Open => st.opened_at.map(|t| t.elapsed().as_millis() as u64),
                _ => None,
            },
        }
    }

    /// Admission check, with the lazy open-to-half-open transition.
    fn before_call(&self) -> Result<()> {
        let change = {
            let mut st = lock_state(&self.state);
            st.total_calls += 1;
            match st.state {
                CircuitState::Open => {
                    let due = st
                        .opened_at
                        .map(|t| t.elapsed() >= self.config.reset_timeout)
                        .unwrap_or(true);
                    if !due {
                        return Err(Error::CircuitOpen);
                    }
                    st.consecutive_successes = 0;
                    Self::transition(&mut st, CircuitState::HalfOpen)
                }
                _ => None,
            }
        };
        self.fire_state_change(change);
        Ok(())
    }

    fn record_success(&self) {
        let change = {
            let mut st = lock_state(&self.state);
            st.total_successes += 1;
            st.last_success = Some(Instant::now());
            match st.state {
                CircuitState::HalfOpen => {
                    st.consecutive_successes += 1;
                    if st.consecutive_successes >= self.config.success_threshold {
                        st.failures.clear();
                        Self::transition(&mut st, CircuitState::Closed)
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };
        self.fire_state_change(change);
        self.fire_outcome(&self.on_success);
    }

    fn record_failure(&self) {
        let change = {
            let mut st = lock_state(&self.state);
            st.total_failures += 1;
            st.last_failure = Some(Instant::now());
            match st.state {
                CircuitState::Closed => {
                    st.failures.push_back(Instant::now());
                    Self::prune(&mut st, self.config.failure_window);
                    if st.failures.len() >= self.config.failure_threshold as usize {
                        Self::transition(&mut st, CircuitState::Open)
                    } else {
                        None
                    }
                }
                // Any half-open failure re-opens immediately.
                CircuitState::HalfOpen => Self::transition(&mut st, CircuitState::Open),
                CircuitState::Open => None,
            }
        };
        self.fire_state_change(change);
        self.fire_outcome(&self.on_failure);
    }

    fn prune(st: &mut BreakerState, window: Duration) {
        while let Some(front) = st.failures.front() {
            if front.elapsed() > window {
                st.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn transition(
        st: &mut BreakerState,
        to: CircuitState,
    ) -> Option<(CircuitState, CircuitState)> {
        let from = st.state;
        if from == to {
            return None;
        }
        st.state = to;
        if to == CircuitState::Open {
            st.opened_at = Some(Instant::now());
        }
        Some((from, to))
    }

    fn fire_state_change(&self, change: Option<(CircuitState, CircuitState)>) {
        let Some((from, to)) = change else { return };
        match to {
            CircuitState::Open => tracing::warn!(?from, ?to, "circuit opened"),
            _ => tracing::info!(?from, ?to, "circuit state changed"),
        }
        let observers: Vec<StateObserver> = lock_state(&self.on_state_change).clone();
        for cb in observers {
            let _ = catch_unwind(AssertUnwindSafe(|| cb(from, to)));
        }
    }

    fn fire_outcome(&self, slot: &StdMutex<Vec<OutcomeObserver>>) {
        let observers: Vec<OutcomeObserver> = lock_state(slot).clone();
        for cb in observers {
            let _ = catch_unwind(AssertUnwindSafe(|| cb()));
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("CircuitBreaker")
            .field("state", &stats.state)
            .field("failures", &stats.failures)
            .field("total_calls", &stats.total_calls)
            .finish()
    }
}
