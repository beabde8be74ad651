use std::time::Duration;

use crate::StoreError;

/// Bounded retry with exponential backoff for transient store failures.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(retries: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self { retries, initial_backoff, max_backoff }
    }

    /// Single attempt, no sleeping.
    #[must_use]
    pub const fn none() -> Self {
        Self::new(0, Duration::ZERO, Duration::ZERO)
    }

    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }

    /// Run `op` until it succeeds, fails permanently, or retries run out.
    ///
    /// # Errors
    /// Returns the last error from `op`.
    pub fn run<T>(
        &self,
        op: &'static str,
        endpoint: &str,
        mut call: impl FnMut() -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut attempt = 0;
        loop {
            match call() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.retries => {
                    let delay = self.backoff(attempt);
                    tracing::warn!(
                        op,
                        endpoint,
                        attempt = attempt + 1,
                        retries = self.retries,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "transient store error; retrying"
                    );
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(10), Duration::from_millis(200))
    }
}
