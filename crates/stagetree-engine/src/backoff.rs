//! Bounded exponential backoff for lock conflicts.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use stagetree_core::error::{EngineError, StagetreeError};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self { max_attempts: 5, initial_delay_ms: 10, max_delay_ms: 500 }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (1-based), with up to 50% jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self
            .initial_delay_ms
            .saturating_mul(1u64 << attempt.saturating_sub(1).min(20))
            .min(self.max_delay_ms);
        let jitter = if base > 1 { rand::thread_rng().gen_range(0..=base / 2) } else { 0 };
        Duration::from_millis(base.saturating_sub(jitter))
    }
}

/// Run `op`, retrying only [`EngineError::ConcurrencyConflict`].
///
/// Other errors return immediately. Exhausting the attempts yields
/// [`EngineError::RetriesExhausted`].
pub fn with_backoff<T, F>(policy: &BackoffPolicy, mut op: F) -> Result<T, StagetreeError>
where
    F: FnMut() -> Result<T, StagetreeError>,
{
    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        match op() {
            Err(e) if e.is_retryable() => {
                if attempt == attempts {
                    tracing::warn!(attempts, error = %e, "giving up after lock conflicts");
                    break;
                }
                let delay = policy.delay(attempt);
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying");
                std::thread::sleep(delay);
            }
            other => return other,
        }
    }
    Err(EngineError::RetriesExhausted { attempts }.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn fast() -> BackoffPolicy {
        BackoffPolicy { max_attempts: 4, initial_delay_ms: 1, max_delay_ms: 2 }
    }

    #[test]
    fn success_returns_immediately() {
        let calls = Cell::new(0);
        let out = with_backoff(&fast(), || {
            calls.set(calls.get() + 1);
            Ok(9)
        });
        assert_eq!(out.unwrap(), 9);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn conflict_retried_until_success() {
        let calls = Cell::new(0);
        let out = with_backoff(&fast(), || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(EngineError::ConcurrencyConflict("owner#1".into()).into())
            } else {
                Ok(())
            }
        });
        assert!(out.is_ok());
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn non_retryable_error_not_retried() {
        let calls = Cell::new(0);
        let out: Result<(), _> = with_backoff(&fast(), || {
            calls.set(calls.get() + 1);
            Err(EngineError::StageOutOfRange(99).into())
        });
        assert!(matches!(out, Err(StagetreeError::Engine(EngineError::StageOutOfRange(99)))));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn exhaustion_reported() {
        let calls = Cell::new(0);
        let out: Result<(), _> = with_backoff(&fast(), || {
            calls.set(calls.get() + 1);
            Err(EngineError::ConcurrencyConflict("tree pos#1".into()).into())
        });
        assert!(matches!(out, Err(StagetreeError::Engine(EngineError::RetriesExhausted { attempts: 4 }))));
        assert_eq!(calls.get(), 4);
    }

    #[test]
    fn delay_is_capped() {
        let policy = BackoffPolicy { max_attempts: 10, initial_delay_ms: 100, max_delay_ms: 300 };
        for attempt in 1..10 {
            assert!(policy.delay(attempt) <= Duration::from_millis(300));
        }
    }
}
