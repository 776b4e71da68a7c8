//! Failures of the local generation engine and the backoff used to ride them out.
//!
//! A local engine fails in few ways: it is not listening yet, it is busy
//! loading a model, it does not know the model, or it answers with something
//! that is not a generate response. Only the first two clear up on their own.

use std::time::Duration;

use thiserror::Error;

/// What went wrong talking to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EngineFailure {
    /// Nothing listening at the base URL, or the connection dropped
    #[error("engine unreachable")]
    Unreachable,
    /// 5xx or an in-body `error`, typically while a model is being loaded
    #[error("engine busy")]
    Busy,
    /// 4xx: unknown model or a request the engine will never accept
    #[error("request rejected")]
    Rejected,
    /// 2xx whose body is not a generate response
    #[error("malformed reply")]
    Malformed,
}

impl EngineFailure {
    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16) -> Self {
        match status {
            // Timeouts and throttling from a proxy in front of the engine
            408 | 429 => EngineFailure::Busy,
            400..=499 => EngineFailure::Rejected,
            _ => EngineFailure::Busy,
        }
    }

    fn recovers(self) -> bool {
        matches!(self, EngineFailure::Unreachable | EngineFailure::Busy)
    }
}

/// One failed generate call.
#[derive(Debug, Error)]
#[error("{failure}: {detail}")]
pub struct EngineError {
    pub failure: EngineFailure,
    pub detail: String,
}

impl EngineError {
    pub fn new(failure: EngineFailure, detail: impl Into<String>) -> Self {
        Self {
            failure,
            detail: detail.into(),
        }
    }

    pub fn from_status(status: u16, body: &str) -> Self {
        Self::new(
            EngineFailure::from_status(status),
            format!("HTTP {}: {}", status, body.trim()),
        )
    }
}

/// Exponential backoff for recoverable engine failures.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Backoff {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            base: Duration::from_millis(500),
            cap: Duration::from_secs(10),
        }
    }

    /// Delay before retry number `attempt` (0-based), or `None` when the
    /// error will not clear up or the retries are spent.
    pub fn next_delay(&self, error: &EngineError, attempt: u32) -> Option<Duration> {
        if !error.failure.recovers() || attempt >= self.max_retries {
            return None;
        }
        let delay = self.base.saturating_mul(2u32.saturating_pow(attempt));
        Some(delay.min(self.cap))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(EngineFailure::from_status(404), EngineFailure::Rejected);
        assert_eq!(EngineFailure::from_status(400), EngineFailure::Rejected);
        assert_eq!(EngineFailure::from_status(503), EngineFailure::Busy);
        assert_eq!(EngineFailure::from_status(429), EngineFailure::Busy);
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let backoff = Backoff::new(10);
        let busy = EngineError::from_status(503, "loading model");
        assert_eq!(backoff.next_delay(&busy, 0), Some(Duration::from_millis(500)));
        assert_eq!(backoff.next_delay(&busy, 2), Some(Duration::from_secs(2)));
        assert_eq!(backoff.next_delay(&busy, 9), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_no_retry_for_rejected_or_spent() {
        let backoff = Backoff::new(2);
        let missing = EngineError::from_status(404, "model 'x' not found");
        assert_eq!(backoff.next_delay(&missing, 0), None);

        let down = EngineError::new(EngineFailure::Unreachable, "connection refused");
        assert!(backoff.next_delay(&down, 1).is_some());
        assert_eq!(backoff.next_delay(&down, 2), None);
    }

    #[test]
    fn test_display_names_failure() {
        let err = EngineError::from_status(404, "model 'x' not found\n");
        assert_eq!(err.to_string(), "request rejected: HTTP 404: model 'x' not found");
    }
}
