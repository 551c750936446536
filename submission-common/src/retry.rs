//! # Retry
//!
//! Module providing a `RetryPolicy` to run a fallible async operation with
//! exponential backoff between attempts.
use std::fmt;
use std::future::Future;
use std::time;

use metrics::counter;
use thiserror::Error;
use tracing::warn;

/// How a single attempt failed. The caller decides: a malformed request
/// will never succeed and must not burn the retry budget.
#[derive(Debug)]
pub enum AttemptError<E> {
    Retryable(E),
    NonRetryable(E),
}

/// The error returned once an operation is given up on.
#[derive(Error, Debug)]
pub enum RetryError<E> {
    #[error("{operation} failed after {attempts} attempts: {error}")]
    Exhausted {
        operation: String,
        attempts: u32,
        error: E,
    },
    #[error("{operation} failed and cannot be retried: {error}")]
    NonRetryable { operation: String, error: E },
}

impl<E> RetryError<E> {
    /// The failure of the last attempt.
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { error, .. } | RetryError::NonRetryable { error, .. } => error,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } => *attempts,
            RetryError::NonRetryable { .. } => 1,
        }
    }
}

#[derive(Clone, Debug)]
/// A retry policy: how many times to try, and how long to wait in between.
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    pub backoff_coefficient: f64,
    /// The backoff interval for the first retry.
    pub initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    pub maximum_interval: Option<time::Duration>,
    /// Total number of attempts, the first one included.
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Initialize a `RetryPolicyBuilder`.
    pub fn build(backoff_coefficient: f64, initial_interval: time::Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(backoff_coefficient, initial_interval)
    }

    /// Determine the interval to wait after a failed attempt (1-based).
    pub fn retry_interval(&self, attempt: u32) -> time::Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let candidate_interval = self
            .initial_interval
            .mul_f64(self.backoff_coefficient.powi(exponent).min(u32::MAX.into()));

        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate_interval, max_interval),
            None => candidate_interval,
        }
    }

    /// Run `attempt_fn` until it succeeds, fails with a non retryable error, or
    /// the attempt budget is spent. Every retry is logged with its attempt
    /// number and the delay before the next try.
    pub async fn retry<T, E, F, Fut>(
        &self,
        operation: &str,
        mut attempt_fn: F,
    ) -> Result<T, RetryError<E>>
    where
        E: fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AttemptError<E>>>,
    {
        let mut attempt: u32 = 1;
        loop {
            match attempt_fn().await {
                Ok(value) => return Ok(value),
                Err(AttemptError::NonRetryable(error)) => {
                    return Err(RetryError::NonRetryable {
                        operation: operation.to_owned(),
                        error,
                    })
                }
                Err(AttemptError::Retryable(error)) => {
                    if attempt >= self.max_attempts {
                        return Err(RetryError::Exhausted {
                            operation: operation.to_owned(),
                            attempts: attempt,
                            error,
                        });
                    }

                    let delay = self.retry_interval(attempt);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "attempt failed, retrying: {}",
                        error
                    );
                    counter!("retry_attempts_total", "operation" => operation.to_owned())
                        .increment(1);

                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

/// Builder pattern struct to provide a `RetryPolicy`.
pub struct RetryPolicyBuilder {
    pub backoff_coefficient: f64,
    pub initial_interval: time::Duration,
    pub maximum_interval: Option<time::Duration>,
    pub max_attempts: u32,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2.0,
            initial_interval: time::Duration::from_millis(100),
            maximum_interval: Some(time::Duration::from_secs(1)),
            max_attempts: 3,
        }
    }
}

impl RetryPolicyBuilder {
    pub fn new(backoff_coefficient: f64, initial_interval: time::Duration) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            ..RetryPolicyBuilder::default()
        }
    }

    pub fn maximum_interval(mut self, interval: time::Duration) -> RetryPolicyBuilder {
        self.maximum_interval = Some(interval);
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> RetryPolicyBuilder {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Provide a `RetryPolicy` according to build parameters provided thus far.
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            backoff_coefficient: self.backoff_coefficient,
            initial_interval: self.initial_interval,
            maximum_interval: self.maximum_interval,
            max_attempts: self.max_attempts,
        }
    }
}
