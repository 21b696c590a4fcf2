//! Retry policy and persistence configuration.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tavern_protocol::RoomId;

use crate::{PersistError, StorageError};

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Exponential backoff for transient storage failures.
///
/// The wait before attempt `n + 1` is `initial_backoff * 2^(n-1)`, capped at
/// `max_backoff`. With `jitter` on, each wait is drawn uniformly from
/// `[wait / 2, wait]` so rooms that failed together don't retry together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. At least 1.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(5),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that tries once and never waits.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Fixes out-of-range values so the policy is safe to use.
    ///
    /// - `max_attempts` raised to 1.
    /// - `initial_backoff` lowered to `max_backoff`.
    pub fn validated(mut self) -> Self {
        if self.max_attempts == 0 {
            tracing::warn!("retry max_attempts is 0, using 1");
            self.max_attempts = 1;
        }
        if self.initial_backoff > self.max_backoff {
            tracing::warn!(
                initial = ?self.initial_backoff,
                max = ?self.max_backoff,
                "initial_backoff exceeds max_backoff, clamping"
            );
            self.initial_backoff = self.max_backoff;
        }
        self
    }

    /// The wait after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let base = self
            .initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff);
        if self.jitter && !base.is_zero() {
            let half = base / 2;
            let spread = (base - half).as_micros() as u64;
            half + Duration::from_micros(rand::rng().random_range(0..=spread))
        } else {
            base
        }
    }

    /// Runs `op` until it succeeds, fails fatally, or the budget runs out.
    pub(crate) async fn run<T, F, Fut>(
        &self,
        operation: &'static str,
        room_id: &RoomId,
        mut op: F,
    ) -> Result<T, PersistError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(source @ StorageError::Fatal(_)) => {
                    return Err(PersistError::Fatal { operation, source });
                }
                Err(last) if attempt >= self.max_attempts => {
                    return Err(PersistError::Exhausted {
                        operation,
                        attempts: attempt,
                        last,
                    });
                }
                Err(e) => {
                    let wait = self.backoff(attempt);
                    tracing::debug!(%room_id, operation, attempt, ?wait, error = %e, "retrying");
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// PersistConfig
// ---------------------------------------------------------------------------

/// Settings for the [`PersistenceBridge`](crate::PersistenceBridge).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistConfig {
    /// Applied to every store call: loads, appends, snapshot writes.
    pub retry: RetryPolicy,
}

impl PersistConfig {
    /// Fixes out-of-range values.
    pub fn validated(mut self) -> Self {
        self.retry = self.retry.validated();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(initial_ms: u64, max_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(initial_ms),
            max_backoff: Duration::from_millis(max_ms),
            jitter: false,
        }
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let p = fixed(50, 300);
        assert_eq!(p.backoff(1), Duration::from_millis(50));
        assert_eq!(p.backoff(2), Duration::from_millis(100));
        assert_eq!(p.backoff(3), Duration::from_millis(200));
        assert_eq!(p.backoff(4), Duration::from_millis(300));
        assert_eq!(p.backoff(40), Duration::from_millis(300));
    }

    #[test]
    fn test_backoff_jitter_stays_in_upper_half() {
        let p = RetryPolicy {
            jitter: true,
            ..fixed(100, 1_000)
        };
        for _ in 0..100 {
            let d = p.backoff(2);
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(200), "{d:?}");
        }
    }

    #[test]
    fn test_validated_fixes_zero_attempts_and_inverted_bounds() {
        let p = RetryPolicy {
            max_attempts: 0,
            ..fixed(500, 100)
        }
        .validated();
        assert_eq!(p.max_attempts, 1);
        assert_eq!(p.initial_backoff, Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_fatal() {
        let room = RoomId::parse("t").unwrap();
        let mut calls = 0;
        let result: Result<(), _> = fixed(10, 10)
            .run("append", &room, || {
                calls += 1;
                async { Err(StorageError::Fatal("bad".into())) }
            })
            .await;
        assert_eq!(calls, 1);
        assert!(matches!(result, Err(PersistError::Fatal { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_exhausts_budget() {
        let room = RoomId::parse("t").unwrap();
        let mut calls = 0;
        let result: Result<(), _> = fixed(10, 10)
            .run("append", &room, || {
                calls += 1;
                async { Err(StorageError::Transient("down".into())) }
            })
            .await;
        assert_eq!(calls, 5);
        assert!(matches!(result, Err(PersistError::Exhausted { attempts: 5, .. })));
    }
}
