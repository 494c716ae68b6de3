//! Retry policy for provider calls.
//!
//! Exponential backoff with optional jitter. The `llm` executor applies
//! its own three-attempt loop; this policy backs standalone uses of the
//! chat clients (warmup probes, one-shot completions).

use rand::Rng;
use std::future::Future;
use std::time::Duration;

use skein_core::llm::LlmError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: usize,
    /// Initial interval between retries in seconds.
    pub initial_interval: f64,
    /// Multiplier applied after each retry.
    pub backoff_factor: f64,
    /// Cap on the interval between retries in seconds.
    pub max_interval: f64,
    /// Randomize each delay within [0.5x, 1.5x].
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            initial_interval: 0.5,
            backoff_factor: 2.0,
            max_interval: 60.0,
            jitter: true,
        }
    }

    pub fn with_initial_interval(mut self, seconds: f64) -> Self {
        self.initial_interval = seconds;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before the retry following the given 0-indexed attempt.
    pub fn delay(&self, attempt: usize) -> Duration {
        if attempt >= self.max_attempts {
            return Duration::ZERO;
        }
        let base = self.initial_interval * self.backoff_factor.powi(attempt as i32);
        let capped = base.min(self.max_interval);
        let final_delay = if self.jitter {
            let factor = rand::thread_rng().gen_range(0.5..=1.5);
            capped * factor
        } else {
            capped
        };
        Duration::from_secs_f64(final_delay)
    }

    pub fn should_retry(&self, attempt: usize) -> bool {
        attempt < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Run an operation with retries on retriable [`LlmError`]s.
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, operation: F) -> Result<T, LlmError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    let mut last_error: Option<LlmError> = None;
    for attempt in 0..policy.max_attempts {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                let retriable = error.is_retriable();
                tracing::debug!(attempt = attempt + 1, %error, retriable, "llm attempt failed");
                last_error = Some(error);
                if !retriable || !policy.should_retry(attempt + 1) {
                    break;
                }
                tokio::time::sleep(policy.delay(attempt)).await;
            }
        }
    }
    Err(last_error.unwrap_or_else(|| LlmError::Configuration("retry loop ran zero attempts".into())))
}
