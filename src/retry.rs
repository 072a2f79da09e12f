//! Transient-fault retry policy.
//!
//! A single [`RetryPolicy`] value describes how external calls are retried;
//! [`RetryingInvoker`] applies it to discovery and invoke calls. Connecting
//! is a single attempt (see [`crate::connection::ConnectionManager`]).
//!
//! The delay before attempt `n + 1` is
//! `min(base_delay × multiplier^(n-1), max_delay)`, so with the defaults
//! (3 attempts, 5s base, 2×, 30s cap) the waits are 5s then 10s.
//!
//! Only faults the classifier marks transient are retried. Everything else
//! is returned after the first attempt.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::SourceFault;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            backoff_multiplier: cfg.backoff_multiplier,
            max_delay: Duration::from_millis(cfg.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Wait after the failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.base_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }
}

/// Result of a retried call: the final outcome plus how many attempts it took.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, SourceFault>,
    pub attempts: u32,
}

/// Applies a [`RetryPolicy`] with a transient-fault classifier.
#[derive(Debug, Clone, Copy)]
pub struct RetryingInvoker {
    policy: RetryPolicy,
    is_transient: fn(&SourceFault) -> bool,
}

impl RetryingInvoker {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            is_transient: SourceFault::is_transient,
        }
    }

    /// Replace the transient-fault classifier.
    pub fn with_classifier(mut self, is_transient: fn(&SourceFault) -> bool) -> Self {
        self.is_transient = is_transient;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `call` until it succeeds, fails permanently, or attempts run out.
    ///
    /// `label` names the call in logs. Exhausted retries are reported in the
    /// returned outcome, never raised.
    pub async fn invoke_with_retry<T, F, Fut>(&self, label: &str, mut call: F) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SourceFault>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match call().await {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                    }
                }
                Err(fault) => {
                    if !(self.is_transient)(&fault) {
                        debug!(call = label, attempt, error = %fault, "permanent fault, not retrying");
                        return RetryOutcome {
                            result: Err(fault),
                            attempts: attempt,
                        };
                    }
                    if attempt >= self.policy.max_attempts {
                        warn!(call = label, attempts = attempt, error = %fault, "retries exhausted");
                        return RetryOutcome {
                            result: Err(fault),
                            attempts: attempt,
                        };
                    }
                    let delay = self.policy.delay_after(attempt);
                    warn!(
                        call = label,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %fault,
                        "transient fault, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
