use std::sync::{Arc, Mutex};

use quill_core::current_unix_timestamp_ms;

type ClockFn = Arc<dyn Fn() -> u64 + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Public struct `CircuitBreakerConfig` used across Quill components.
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    pub failure_threshold: usize,
    pub cooldown_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            cooldown_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::enum_variant_names)]
/// Enumerates supported `CircuitState` values.
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Outcome of asking the breaker whether a collaborator call may proceed.
pub enum BreakerDecision {
    Allow,
    FailFast { open_until_unix_ms: u64 },
}

#[derive(Debug, Clone, Copy)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: usize,
    open_until_unix_ms: u64,
    probe_in_flight: bool,
}

impl Default for BreakerInner {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            open_until_unix_ms: 0,
            probe_in_flight: false,
        }
    }
}

/// Three-state guard that stops calling a failing collaborator.
///
/// Closed counts consecutive transient failures; at the threshold the
/// breaker opens and every call fails fast until the cooldown elapses.
/// The first call after the cooldown runs as a half-open probe: success
/// closes the breaker, failure reopens it for another cooldown.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    clock: ClockFn,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::new_with_clock(config, Arc::new(current_unix_timestamp_ms))
    }

    pub fn new_with_clock(config: CircuitBreakerConfig, clock: ClockFn) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner::default()),
            clock,
        }
    }

    pub fn state(&self) -> CircuitState {
        lock_or_recover_mutex(&self.inner).state
    }

    /// Asks whether a call may proceed; half-open admits a single probe.
    pub fn try_acquire(&self) -> BreakerDecision {
        if !self.config.enabled {
            return BreakerDecision::Allow;
        }
        let now_unix_ms = (self.clock)();
        let mut inner = lock_or_recover_mutex(&self.inner);
        match inner.state {
            CircuitState::Closed => BreakerDecision::Allow,
            CircuitState::Open => {
                if now_unix_ms < inner.open_until_unix_ms {
                    return BreakerDecision::FailFast {
                        open_until_unix_ms: inner.open_until_unix_ms,
                    };
                }
                inner.state = CircuitState::HalfOpen;
                inner.probe_in_flight = true;
                BreakerDecision::Allow
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    return BreakerDecision::FailFast {
                        open_until_unix_ms: inner.open_until_unix_ms,
                    };
                }
                inner.probe_in_flight = true;
                BreakerDecision::Allow
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = lock_or_recover_mutex(&self.inner);
        *inner = BreakerInner::default();
    }

    /// Records a transient failure; non-retryable faults must not be reported.
    pub fn record_failure(&self) {
        if !self.config.enabled {
            return;
        }
        let now_unix_ms = (self.clock)();
        let mut inner = lock_or_recover_mutex(&self.inner);
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.open_until_unix_ms =
                    now_unix_ms.saturating_add(self.config.cooldown_ms);
                inner.probe_in_flight = false;
                inner.consecutive_failures = 0;
            }
            CircuitState::Closed => {
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                let threshold = self.config.failure_threshold.max(1);
                if inner.consecutive_failures >= threshold {
                    inner.state = CircuitState::Open;
                    inner.open_until_unix_ms =
                        now_unix_ms.saturating_add(self.config.cooldown_ms);
                    inner.consecutive_failures = 0;
                }
            }
            CircuitState::Open => {}
        }
    }
}

fn lock_or_recover_mutex<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
