//! Bounded exponential backoff.
//!
//! Time comes from `tokio::time`, so a paused test clock drives the loop.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::{Instant, sleep};

/// Exponential backoff policy with jitter and a total time budget.
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialBackoff {
    pub initial_interval: Duration,
    pub multiplier: f64,
    /// Each delay is picked uniformly from `interval * (1 +/- factor)`.
    pub randomization_factor: f64,
    pub max_interval: Duration,
    /// Give up once the next delay would take us past this much elapsed time.
    pub max_elapsed: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            multiplier: 1.5,
            randomization_factor: 0.5,
            max_interval: Duration::from_secs(60),
            max_elapsed: Duration::from_secs(15 * 60),
        }
    }
}

impl ExponentialBackoff {
    pub fn with_max_elapsed(mut self, max_elapsed: Duration) -> Self {
        self.max_elapsed = max_elapsed;
        self
    }

    fn randomized(&self, interval: Duration) -> Duration {
        let factor = self.randomization_factor.clamp(0.0, 1.0);
        if factor == 0.0 {
            return interval;
        }

        let secs = interval.as_secs_f64();
        let delta = factor * secs;
        Duration::from_secs_f64(rand::rng().random_range((secs - delta)..=(secs + delta)))
    }

    pub(crate) fn grow(&self, interval: Duration) -> Duration {
        interval
            .mul_f64(self.multiplier.max(1.0))
            .min(self.max_interval)
    }
}

/// Run `operation` until it succeeds or the policy's time budget runs out.
///
/// `on_retry` sees every failure that will be retried together with the
/// delay before the next attempt. When the budget is exhausted the last
/// error is returned.
pub async fn retry<T, E, F, Fut, N>(
    policy: &ExponentialBackoff,
    mut operation: F,
    mut on_retry: N,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    N: FnMut(&E, Duration),
{
    let start = Instant::now();
    let mut interval = policy.initial_interval;

    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        let next = policy.randomized(interval);
        interval = policy.grow(interval);
        if start.elapsed() + next > policy.max_elapsed {
            return Err(err);
        }

        on_retry(&err, next);
        sleep(next).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fixed() -> ExponentialBackoff {
        ExponentialBackoff {
            randomization_factor: 0.0,
            ..Default::default()
        }
        .with_max_elapsed(Duration::from_secs(10))
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_after_budget() {
        let attempts = &AtomicU32::new(0);
        let mut delays = Vec::new();
        let start = Instant::now();

        let result: Result<(), &str> = retry(
            &fixed(),
            || async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err("nope")
            },
            |_, delay| delays.push(delay),
        )
        .await;

        assert_eq!(result, Err("nope"));
        // 0.5 + 0.75 + 1.125 + 1.6875 + 2.53125 = 6.59375s; the next 3.797s would overshoot.
        assert_eq!(attempts.load(Ordering::SeqCst), 6);
        assert_eq!(delays.len(), 5);
        assert_eq!(delays[0], Duration::from_millis(500));
        assert_eq!(delays[1], Duration::from_millis(750));
        assert!(start.elapsed() <= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_returns_first_success() {
        let attempts = &AtomicU32::new(0);
        let result: Result<u32, &str> = retry(
            &fixed(),
            || async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n < 2 { Err("not yet") } else { Ok(n) }
            },
            |_, _| {},
        )
        .await;

        assert_eq!(result, Ok(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_jitter_stays_in_bounds() {
        let policy = ExponentialBackoff::default().with_max_elapsed(Duration::from_secs(10));
        let mut delays = Vec::new();
        let _: Result<(), ()> = retry(&policy, || async { Err(()) }, |_, d| delays.push(d)).await;

        assert!(!delays.is_empty());
        // First delay is 500ms +/- 50%.
        assert!(delays[0] >= Duration::from_millis(250));
        assert!(delays[0] <= Duration::from_millis(750));
    }

    #[test]
    fn test_interval_capped() {
        let policy = ExponentialBackoff::default();
        assert_eq!(policy.grow(Duration::from_secs(50)), Duration::from_secs(60));
    }
}
