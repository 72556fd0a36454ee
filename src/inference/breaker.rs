//! Three-state circuit breaker guarding upstream model calls.
//!
//! Closed counts failures inside a sliding window; once the threshold is
//! hit the breaker opens and fails calls immediately for the cooldown
//! period. After the cooldown a single probe is admitted: success closes
//! the breaker, failure re-opens it with a fresh cooldown.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::warn;

/// Breaker tuning.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failures within the window that trip the breaker.
    pub failure_threshold: usize,
    /// Sliding window over which failures are counted.
    pub window: Duration,
    /// How long the breaker stays open before admitting a probe.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(10),
            cooldown: Duration::from_secs(60),
        }
    }
}

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Calls pass; failures are counted.
    Closed,
    /// Calls fail immediately.
    Open,
    /// One probe call is in flight.
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// A circuit breaker for one upstream model.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Breaker in the closed state.
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Ask to place a call.
    ///
    /// # Errors
    ///
    /// Returns the remaining cooldown when the breaker refuses the call.
    pub fn try_admit(&self) -> Result<(), Duration> {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let opened_at = inner.opened_at.unwrap_or_else(Instant::now);
                let elapsed = opened_at.elapsed();
                if elapsed >= self.config.cooldown {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    Ok(())
                } else {
                    Err(self.config.cooldown - elapsed)
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(self.config.cooldown)
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Closed;
                inner.failures.clear();
                inner.probe_in_flight = false;
                inner.opened_at = None;
            }
            BreakerState::Closed => inner.failures.clear(),
            BreakerState::Open => {}
        }
    }

    /// Record a breaker-relevant failure.
    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut inner = self.lock();
        match inner.state {
            BreakerState::HalfOpen => {
                // Failed probe: re-open with a fresh cooldown.
                inner.state = BreakerState::Open;
                inner.opened_at = Some(now);
                inner.probe_in_flight = false;
                warn!("circuit breaker probe failed; re-opening");
            }
            BreakerState::Closed => {
                inner.failures.push_back(now);
                while let Some(front) = inner.failures.front() {
                    if now.duration_since(*front) > self.config.window {
                        inner.failures.pop_front();
                    } else {
                        break;
                    }
                }
                if inner.failures.len() >= self.config.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(now);
                    inner.failures.clear();
                    warn!(
                        threshold = self.config.failure_threshold,
                        "circuit breaker tripped"
                    );
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Current state (transitions Open→HalfOpen only on `try_admit`).
    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned mutex means a panic mid-update; the state is a plain
        // enum and counters, safe to keep using.
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
