use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::breaker::{BreakerDecision, CircuitBreaker, CircuitBreakerConfig};
use crate::retry::{backoff_delay_ms, BASE_BACKOFF_MS};
use crate::traits::CollaboratorError;

type ClockFn = Arc<dyn Fn() -> u64 + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Public struct `GuardPolicy` used across Quill components.
pub struct GuardPolicy {
    /// Total attempts including the first call.
    pub max_attempts: usize,
    pub base_backoff_ms: u64,
    pub jitter_enabled: bool,
    pub breaker: CircuitBreakerConfig,
}

impl Default for GuardPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: BASE_BACKOFF_MS,
            jitter_enabled: true,
            breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Guard applied at every collaborator-call boundary inside an agent.
///
/// Retries transient faults with bounded exponential backoff and jitter,
/// and routes every outcome through the circuit breaker so a failing
/// collaborator cannot cause unbounded retries to cascade through a goal.
pub struct CollaboratorGuard {
    policy: GuardPolicy,
    breaker: CircuitBreaker,
}

impl CollaboratorGuard {
    pub fn new(policy: GuardPolicy) -> Self {
        Self {
            breaker: CircuitBreaker::new(policy.breaker),
            policy,
        }
    }

    pub fn new_with_clock(policy: GuardPolicy, clock: ClockFn) -> Self {
        Self {
            breaker: CircuitBreaker::new_with_clock(policy.breaker, clock),
            policy,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Runs `operation` under the retry and circuit-breaker policy.
    ///
    /// Non-retryable faults return immediately and never trip the breaker.
    pub async fn run<T, F, Fut>(
        &self,
        operation_name: &str,
        operation: F,
    ) -> Result<T, CollaboratorError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, CollaboratorError>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0usize;
        loop {
            if let BreakerDecision::FailFast { open_until_unix_ms } = self.breaker.try_acquire() {
                return Err(CollaboratorError::Unavailable(format!(
                    "circuit breaker open for '{operation_name}' until unix_ms {open_until_unix_ms}"
                )));
            }

            match operation().await {
                Ok(value) => {
                    self.breaker.record_success();
                    return Ok(value);
                }
                Err(error) if error.is_retryable() => {
                    self.breaker.record_failure();
                    attempt = attempt.saturating_add(1);
                    if attempt >= max_attempts {
                        return Err(error);
                    }
                    let delay_ms = self.retry_delay_ms(&error, attempt.saturating_sub(1));
                    debug!(
                        operation = operation_name,
                        attempt,
                        delay_ms,
                        error = %error,
                        "retrying collaborator call after transient fault"
                    );
                    if delay_ms > 0 {
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    }
                }
                Err(error) => return Err(error),
            }
        }
    }

    fn retry_delay_ms(&self, error: &CollaboratorError, attempt: usize) -> u64 {
        let backoff_ms = backoff_delay_ms(
            self.policy.base_backoff_ms,
            attempt,
            self.policy.jitter_enabled,
        );
        match error {
            // Rate-limit hints act as a floor under the computed backoff.
            CollaboratorError::RateLimited {
                retry_after_ms: Some(retry_after_ms),
            } => backoff_ms.max(*retry_after_ms),
            _ => backoff_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};

    use super::{ClockFn, CollaboratorGuard, GuardPolicy};
    use crate::breaker::{CircuitBreakerConfig, CircuitState};
    use crate::traits::CollaboratorError;

    struct ScriptedCollaborator {
        responses: Mutex<VecDeque<Result<String, CollaboratorError>>>,
        calls: AtomicU64,
    }

    impl ScriptedCollaborator {
        fn new(responses: Vec<Result<String, CollaboratorError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                calls: AtomicU64::new(0),
            }
        }

        async fn call(&self) -> Result<String, CollaboratorError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            self.responses
                .lock()
                .expect("responses lock")
                .pop_front()
                .unwrap_or_else(|| {
                    Err(CollaboratorError::InvalidResponse(
                        "no scripted response configured".to_string(),
                    ))
                })
        }

        fn calls(&self) -> u64 {
            self.calls.load(Ordering::Relaxed)
        }
    }

    fn fast_policy(max_attempts: usize, failure_threshold: usize) -> GuardPolicy {
        GuardPolicy {
            max_attempts,
            base_backoff_ms: 0,
            jitter_enabled: false,
            breaker: CircuitBreakerConfig {
                enabled: true,
                failure_threshold,
                cooldown_ms: 10_000,
            },
        }
    }

    #[tokio::test]
    async fn functional_guard_retries_transient_faults_until_success() {
        let collaborator = ScriptedCollaborator::new(vec![
            Err(CollaboratorError::Unavailable("down".to_string())),
            Err(CollaboratorError::Timeout { elapsed_ms: 50 }),
            Ok("recovered".to_string()),
        ]);
        let guard = CollaboratorGuard::new(fast_policy(3, 10));

        let result = guard
            .run("vault.read_note", || collaborator.call())
            .await
            .expect("third attempt should succeed");

        assert_eq!(result, "recovered");
        assert_eq!(collaborator.calls(), 3);
        assert_eq!(guard.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn functional_guard_returns_last_error_when_attempts_exhausted() {
        let collaborator = ScriptedCollaborator::new(vec![
            Err(CollaboratorError::Unavailable("down".to_string())),
            Err(CollaboratorError::Unavailable("still down".to_string())),
        ]);
        let guard = CollaboratorGuard::new(fast_policy(2, 10));

        let error = guard
            .run("retrieval.search", || collaborator.call())
            .await
            .expect_err("attempts exhausted");
        assert!(matches!(error, CollaboratorError::Unavailable(_)));
        assert_eq!(collaborator.calls(), 2);
    }

    #[tokio::test]
    async fn regression_non_retryable_fault_returns_immediately_without_breaker_trip() {
        let collaborator = ScriptedCollaborator::new(vec![Err(CollaboratorError::NotFound(
            "missing.md".to_string(),
        ))]);
        let guard = CollaboratorGuard::new(fast_policy(3, 1));

        let error = guard
            .run("vault.read_note", || collaborator.call())
            .await
            .expect_err("non-retryable fault");
        assert!(matches!(error, CollaboratorError::NotFound(_)));
        assert_eq!(collaborator.calls(), 1);
        assert_eq!(guard.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn functional_open_breaker_fails_fast_without_calling_the_collaborator() {
        let collaborator = ScriptedCollaborator::new(vec![
            Err(CollaboratorError::Unavailable("down".to_string())),
            Err(CollaboratorError::Unavailable("down".to_string())),
        ]);
        let guard = CollaboratorGuard::new(fast_policy(2, 2));

        let _ = guard
            .run("generate", || collaborator.call())
            .await
            .expect_err("initial attempts fail");
        assert_eq!(guard.breaker().state(), CircuitState::Open);
        assert_eq!(collaborator.calls(), 2);

        let error = guard
            .run("generate", || collaborator.call())
            .await
            .expect_err("breaker open");
        match error {
            CollaboratorError::Unavailable(message) => {
                assert!(message.contains("circuit breaker open"));
            }
            other => panic!("expected Unavailable, got {other:?}"),
        }
        assert_eq!(collaborator.calls(), 2);
    }

    #[tokio::test]
    async fn integration_half_open_probe_success_closes_breaker_after_cooldown() {
        let now_ms = Arc::new(AtomicU64::new(50_000));
        let clock: ClockFn = {
            let now_ms = now_ms.clone();
            Arc::new(move || now_ms.load(Ordering::Relaxed))
        };
        let guard = CollaboratorGuard::new_with_clock(fast_policy(1, 1), clock);
        let collaborator = ScriptedCollaborator::new(vec![
            Err(CollaboratorError::Unavailable("down".to_string())),
            Ok("probe ok".to_string()),
        ]);

        let _ = guard
            .run("generate", || collaborator.call())
            .await
            .expect_err("first call opens breaker");
        assert_eq!(guard.breaker().state(), CircuitState::Open);

        now_ms.store(61_000, Ordering::Relaxed);
        let result = guard
            .run("generate", || collaborator.call())
            .await
            .expect("half-open probe should run and succeed");
        assert_eq!(result, "probe ok");
        assert_eq!(guard.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn regression_rate_limit_hint_floors_the_retry_delay() {
        let guard = CollaboratorGuard::new(GuardPolicy {
            max_attempts: 3,
            base_backoff_ms: 100,
            jitter_enabled: false,
            breaker: CircuitBreakerConfig::default(),
        });
        let hinted = guard.retry_delay_ms(
            &CollaboratorError::RateLimited {
                retry_after_ms: Some(5_000),
            },
            0,
        );
        assert_eq!(hinted, 5_000);

        let unhinted = guard.retry_delay_ms(&CollaboratorError::Timeout { elapsed_ms: 10 }, 1);
        assert_eq!(unhinted, 200);
    }
}
