use crate::error::AppError;
use std::future::Future;
use std::time::Duration;

pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(100);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Exponential backoff for operations that can fail transiently.
///
/// `max_attempts` counts every try, the first one included. After the
/// failed attempt `k` (0-based) the policy sleeps `base_delay * 2^k`; it
/// never sleeps after the last attempt.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
    is_retryable: fn(&AppError) -> bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_BASE_DELAY, DEFAULT_MAX_ATTEMPTS, AppError::is_contention)
    }
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration, max_attempts: u32, is_retryable: fn(&AppError) -> bool) -> Self {
        Self {
            base_delay,
            max_attempts: max_attempts.max(1),
            is_retryable,
        }
    }

    pub fn with_base_delay(self, base_delay: Duration) -> Self {
        Self { base_delay, ..self }
    }

    pub fn with_max_attempts(self, max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..self
        }
    }

    pub fn is_retryable(&self, error: &AppError) -> bool {
        (self.is_retryable)(error)
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1_u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable error,
    /// or exhausts the attempt budget. On exhaustion the last retryable
    /// error is handed back unchanged; callers decide how to surface it.
    pub async fn run<T, F, Fut>(&self, mut operation: F) -> Result<T, RetryExhausted>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let mut attempt = 0_u32;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) if !self.is_retryable(&error) => {
                    return Err(RetryExhausted::Fatal(error));
                }
                Err(error) => {
                    let attempts = attempt + 1;
                    if attempts >= self.max_attempts {
                        tracing::error!(attempts, error = %error, "retry budget exhausted");
                        return Err(RetryExhausted::Exhausted { attempts, error });
                    }

                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        attempt = attempts,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt = attempts;
                }
            }
        }
    }
}

#[derive(Debug)]
pub enum RetryExhausted {
    /// The error was not retryable and surfaced on its first occurrence.
    Fatal(AppError),
    Exhausted { attempts: u32, error: AppError },
}
