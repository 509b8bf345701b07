use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

use crate::ReservationResult;

/// Exponential backoff with jitter for transport failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// 0.0 = no jitter, 1.0 = +/- half the delay.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter_factor(mut self, jitter: f64) -> Self {
        self.jitter_factor = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_millis() as f64;
        let mut delay = base * self.backoff_multiplier.powi(attempt.min(32) as i32);

        if self.jitter_factor > 0.0 {
            let jitter = delay * self.jitter_factor * (rand::thread_rng().gen::<f64>() - 0.5);
            delay += jitter;
        }

        let delay = delay.max(base).min(self.max_delay.as_millis() as f64);
        Duration::from_millis(delay as u64)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts run out.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> ReservationResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ReservationResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt + 1 < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!("{} failed ({}), retrying in {:?}", what, err, delay);
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ReservationError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_grows_and_is_capped() {
        let policy = RetryPolicy::default()
            .with_jitter_factor(0.0)
            .with_base_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(500));

        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for(40), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = RetryPolicy::default().with_jitter_factor(1.0);
        for attempt in 0..6 {
            let delay = policy.delay_for(attempt);
            assert!(delay >= policy.base_delay);
            assert!(delay <= policy.max_delay);
        }
    }

    #[tokio::test]
    async fn test_run_retries_transport_only() {
        let policy = RetryPolicy::default()
            .with_base_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(2));

        let calls = AtomicU32::new(0);
        let result = policy
            .run("flaky", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ReservationError::Transport("connection reset".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let calls = AtomicU32::new(0);
        let result: ReservationResult<()> = policy
            .run("conflict", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ReservationError::Conflict("KOL000001".into())) }
            })
            .await;
        assert!(matches!(result, Err(ReservationError::Conflict(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_gives_up_after_max_attempts() {
        let policy = RetryPolicy::default()
            .with_max_attempts(3)
            .with_base_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(1));
        let calls = AtomicU32::new(0);
        let result: ReservationResult<()> = policy
            .run("down", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ReservationError::Transport("refused".into())) }
            })
            .await;
        assert!(matches!(result, Err(ReservationError::Transport(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
