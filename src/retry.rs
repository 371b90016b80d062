use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            backoff_delay: Duration::from_secs(300),
            multiplier: 1.0,
            max_delay: Duration::from_secs(3600),
        }
    }
}

impl RetryPolicy {
    /// Constant-delay policy. `max_attempts` is clamped to at least one.
    pub fn new(max_attempts: u32, backoff_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_delay,
            ..Self::default()
        }
    }

    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub fn with_multiplier(mut self, multiplier: f64, max_delay: Duration) -> Self {
        self.multiplier = multiplier;
        self.max_delay = max_delay;
        self
    }

    /// Delay to wait after the failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let multiplier = if self.multiplier.is_finite() && self.multiplier >= 1.0 {
            self.multiplier
        } else {
            1.0
        };
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.backoff_delay.as_secs_f64() * multiplier.powi(exp);
        let capped = scaled.min(self.max_delay.max(self.backoff_delay).as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }
}

/// How a retried operation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome<T, E> {
    Succeeded { value: T, attempts: u32 },
    Exhausted { error: E, attempts: u32 },
    /// Cancellation was observed before the next attempt could start.
    Cancelled { last_error: Option<E>, attempts: u32 },
}

impl<T, E> RetryOutcome<T, E> {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Succeeded { attempts, .. }
            | Self::Exhausted { attempts, .. }
            | Self::Cancelled { attempts, .. } => *attempts,
        }
    }
}

pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        let mut policy = policy;
        if policy.max_attempts == 0 {
            policy.max_attempts = 1;
        }
        Self { policy }
    }

    /// Runs `operation` until it succeeds, the attempt budget is spent, or
    /// `ctx` is cancelled. An attempt that has started always runs to
    /// completion; cancellation only stops further attempts and backoff waits.
    pub async fn execute_with_retry<F, Fut, T, E>(
        &self,
        ctx: &CancellationToken,
        task_id: &str,
        mut operation: F,
    ) -> RetryOutcome<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut last_error = None;

        for attempt in 1..=self.policy.max_attempts {
            if ctx.is_cancelled() {
                return RetryOutcome::Cancelled {
                    last_error,
                    attempts: attempt - 1,
                };
            }

            debug!(task = %task_id, attempt, "starting attempt");
            let error = match operation(attempt).await {
                Ok(value) => {
                    return RetryOutcome::Succeeded {
                        value,
                        attempts: attempt,
                    };
                }
                Err(error) => error,
            };

            if attempt == self.policy.max_attempts {
                return RetryOutcome::Exhausted {
                    error,
                    attempts: attempt,
                };
            }

            let wait_time = self.policy.delay_after(attempt);
            warn!(
                task = %task_id,
                attempt,
                max_attempts = self.policy.max_attempts,
                delay_ms = wait_time.as_millis() as u64,
                error = %error,
                "attempt failed, retrying"
            );
            last_error = Some(error);

            tokio::select! {
                _ = ctx.cancelled() => {
                    return RetryOutcome::Cancelled {
                        last_error,
                        attempts: attempt,
                    };
                }
                _ = sleep(wait_time) => {}
            }
        }

        // max_attempts >= 1 guarantees the loop returns.
        RetryOutcome::Cancelled {
            last_error,
            attempts: self.policy.max_attempts,
        }
    }
}
