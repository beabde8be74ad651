use crate::{KeyFilter, RetryPolicy};

pub const DEFAULT_PAGE_SIZE: usize = 100;
pub const DEFAULT_TOLERANCE_MS: u64 = 100;
pub const DEFAULT_SLICE_SIZE: usize = 10;
pub const DEFAULT_WORKERS: usize = 4;

const MAX_PAGE_SIZE: usize = 10_000;
const MAX_WORKERS: usize = 100;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("invalid option `{field}`: {reason}")]
pub struct ConfigError {
    pub field: &'static str,
    pub reason: String,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ReconcileOptions {
    pub dry_run: bool,
    /// SCAN `COUNT` hint and upper bound of one TTL pipeline.
    pub page_size: usize,
    pub tolerance_ms: u64,
    /// Keys per `MGET`/`MSET` round in the string repair.
    pub slice_size: usize,
    pub workers: usize,
    pub retry: RetryPolicy,
    pub key_filter: KeyFilter,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            page_size: DEFAULT_PAGE_SIZE,
            tolerance_ms: DEFAULT_TOLERANCE_MS,
            slice_size: DEFAULT_SLICE_SIZE,
            workers: DEFAULT_WORKERS,
            retry: RetryPolicy::default(),
            key_filter: KeyFilter::default(),
        }
    }
}

impl ReconcileOptions {
    /// # Errors
    /// Returns an error naming the first out-of-range field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_PAGE_SIZE).contains(&self.page_size) {
            return Err(ConfigError {
                field: "page_size",
                reason: format!("expected 1..={MAX_PAGE_SIZE}, got {}", self.page_size),
            });
        }
        if self.slice_size == 0 {
            return Err(ConfigError {
                field: "slice_size",
                reason: "expected at least 1".to_string(),
            });
        }
        if !(1..=MAX_WORKERS).contains(&self.workers) {
            return Err(ConfigError {
                field: "workers",
                reason: format!("expected 1..={MAX_WORKERS}, got {}", self.workers),
            });
        }
        if self.retry.initial_backoff > self.retry.max_backoff {
            return Err(ConfigError {
                field: "retry",
                reason: "initial backoff exceeds max backoff".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(ReconcileOptions::default().validate(), Ok(()));
    }

    #[test]
    fn page_size_bounds_are_enforced() {
        let options = ReconcileOptions { page_size: 0, ..ReconcileOptions::default() };
        assert_eq!(options.validate().map_err(|err| err.field), Err("page_size"));

        let options = ReconcileOptions { page_size: 10_001, ..ReconcileOptions::default() };
        assert_eq!(options.validate().map_err(|err| err.field), Err("page_size"));
    }

    #[test]
    fn worker_bounds_are_enforced() {
        let options = ReconcileOptions { workers: 0, ..ReconcileOptions::default() };
        assert_eq!(options.validate().map_err(|err| err.field), Err("workers"));
    }

    #[test]
    fn inverted_backoff_is_rejected() {
        let options = ReconcileOptions {
            retry: RetryPolicy::new(3, Duration::from_secs(1), Duration::from_millis(1)),
            ..ReconcileOptions::default()
        };
        assert_eq!(options.validate().map_err(|err| err.field), Err("retry"));
    }
}
