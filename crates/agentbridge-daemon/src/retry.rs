//! Per-artifact retry counting with exponential backoff.
//!
//! Counters live for the process lifetime only and are never reset
//! automatically: once an id exceeds `max_retries` it stays exhausted until
//! `reset` is called.

use std::time::Duration;

use agentbridge_core::Error;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// `base * 2^(attempt-1)` for attempt >= 1. Saturates instead of overflowing.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.saturating_mul(1u32 << exponent)
}

pub struct ErrorHandler {
    max_retries: u32,
    base_delay: Duration,
    counters: DashMap<String, u32>,
    cancel: CancellationToken,
}

impl ErrorHandler {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self::with_cancellation(max_retries, base_delay, CancellationToken::new())
    }

    /// Backoff sleeps end early (and the handler answers "don't retry") once
    /// `cancel` fires.
    pub fn with_cancellation(max_retries: u32, base_delay: Duration, cancel: CancellationToken) -> Self {
        Self {
            max_retries,
            base_delay,
            counters: DashMap::new(),
            cancel,
        }
    }

    /// Returns true when the caller should retry, after sleeping the backoff.
    pub async fn handle_error(&self, error: &Error, response_id: &str) -> bool {
        if !error.is_retryable() {
            debug!(response_id, kind = error.kind(), "Not retrying non-transient error");
            return false;
        }

        let count = {
            let mut entry = self.counters.entry(response_id.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };

        if count > self.max_retries {
            warn!(response_id, attempts = count, error = %error, "Retries exhausted");
            return false;
        }

        let delay = backoff_delay(self.base_delay, count);
        warn!(
            response_id,
            attempt = count,
            max_retries = self.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Retrying after backoff"
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.cancel.cancelled() => {
                debug!(response_id, "Backoff interrupted by shutdown");
                false
            }
        }
    }

    pub fn attempts(&self, response_id: &str) -> u32 {
        self.counters.get(response_id).map(|c| *c).unwrap_or(0)
    }

    pub fn reset(&self, response_id: &str) {
        self.counters.remove(response_id);
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn backoff_doubles_from_base() {
        let base = Duration::from_millis(10);
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(10));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(20));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(40));
        assert_eq!(backoff_delay(base, 4), Duration::from_millis(80));
    }

    #[test]
    fn backoff_is_monotone_and_saturates() {
        let base = Duration::from_secs(1);
        let mut prev = Duration::ZERO;
        for attempt in 1..200 {
            let d = backoff_delay(base, attempt);
            assert!(d >= prev);
            prev = d;
        }
    }

    #[tokio::test]
    async fn retries_until_exhausted_then_false_forever() {
        let handler = ErrorHandler::new(2, Duration::from_millis(1));
        let err = Error::processing("flaky");
        assert!(handler.handle_error(&err, "r1").await);
        assert!(handler.handle_error(&err, "r1").await);
        assert!(!handler.handle_error(&err, "r1").await);
        assert!(!handler.handle_error(&err, "r1").await);
        assert_eq!(handler.attempts("r1"), 4);
        // Other ids are independent.
        assert!(handler.handle_error(&err, "r2").await);
    }

    #[tokio::test]
    async fn reset_allows_fresh_attempts() {
        let handler = ErrorHandler::new(0, Duration::from_millis(1));
        let err = Error::processing("flaky");
        assert!(!handler.handle_error(&err, "r1").await);
        handler.reset("r1");
        assert_eq!(handler.attempts("r1"), 0);
    }

    #[tokio::test]
    async fn validation_errors_are_never_retried() {
        let handler = ErrorHandler::new(5, Duration::from_millis(1));
        let err = Error::validation(vec!["missing field".into()]);
        assert!(!handler.handle_error(&err, "r1").await);
        assert_eq!(handler.attempts("r1"), 0);
    }

    #[tokio::test]
    async fn backoff_actually_waits() {
        let handler = ErrorHandler::new(3, Duration::from_millis(30));
        let err = Error::processing("flaky");
        let start = Instant::now();
        assert!(handler.handle_error(&err, "r1").await);
        assert!(handler.handle_error(&err, "r1").await);
        // 30ms + 60ms
        assert!(start.elapsed() >= Duration::from_millis(90));
    }

    #[tokio::test]
    async fn cancellation_cuts_backoff_short() {
        let cancel = CancellationToken::new();
        let handler = ErrorHandler::with_cancellation(3, Duration::from_secs(30), cancel.clone());
        cancel.cancel();
        let start = Instant::now();
        assert!(!handler.handle_error(&Error::processing("flaky"), "r1").await);
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
