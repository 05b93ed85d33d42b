use std::future::Future;
use std::time::Duration;

use beskar7_config::RetrySettings;
use beskar7_domain::ErrorKind;
use rand::Rng;
use tokio::time::Instant;
use tracing::warn;

/// Retry envelope: exponential backoff with jitter, bounded by both an
/// attempt count and an elapsed-time ceiling. Non-retryable kinds short out
/// on the first failure.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    settings: RetrySettings,
}

impl RetryPolicy {
    pub fn new(settings: RetrySettings) -> Self {
        RetryPolicy { settings }
    }

    /// Delay before retry number `attempt` (1-based), with up to 10% jitter.
    fn delay(&self, attempt: u32) -> Duration {
        let base = self.settings.initial_interval.as_secs_f64()
            * self.settings.multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = base.min(self.settings.max_interval.as_secs_f64());
        let jitter = rand::thread_rng().gen_range(0.0..=0.1) * capped;
        Duration::from_secs_f64(capped + jitter)
    }

    /// Run `op` until it succeeds, fails non-retryably, or the envelope
    /// (`max_attempts`, `max_elapsed_time`) is exhausted. Returns the last
    /// error in the failure cases.
    pub async fn execute<T, E, F, Fut>(&self, what: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display + HasErrorKind,
    {
        let started = Instant::now();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let kind: ErrorKind = err.kind();
                    if !kind.is_retryable() {
                        return Err(err);
                    }
                    if attempt >= self.settings.max_attempts {
                        warn!(op = what, attempts = attempt, error = %err, "retry budget exhausted");
                        return Err(err);
                    }
                    let delay = self.delay(attempt);
                    if started.elapsed() + delay > self.settings.max_elapsed_time {
                        warn!(op = what, elapsed = ?started.elapsed(), error = %err, "retry time budget exhausted");
                        return Err(err);
                    }
                    warn!(op = what, attempt, delay = ?delay, error = %err, "retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Lets [`RetryPolicy::execute`] classify any error type that knows its own
/// [`ErrorKind`], without running afoul of the orphan rule for a blanket
/// `From`/`Into` impl across crate boundaries.
pub trait HasErrorKind {
    fn kind(&self) -> ErrorKind;
}

impl HasErrorKind for beskar7_redfish::RedfishError {
    fn kind(&self) -> ErrorKind {
        beskar7_redfish::RedfishError::kind(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beskar7_redfish::RedfishError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> RedfishError {
        RedfishError::Http { status: 500, path: "/".into(), message: "boom".into() }
    }

    #[tokio::test(start_paused = true)]
    async fn stops_after_max_attempts() {
        let policy = RetryPolicy::new(RetrySettings::default());
        let calls = AtomicU32::new(0);

        let result: Result<(), RedfishError> = policy
            .execute("op", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(transient()) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_mid_envelope() {
        let policy = RetryPolicy::new(RetrySettings::default());
        let calls = AtomicU32::new(0);

        let result: Result<u32, RedfishError> = policy
            .execute("op", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(transient())
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_fails_immediately() {
        let policy = RetryPolicy::new(RetrySettings::default());
        let calls = AtomicU32::new(0);

        let result: Result<(), RedfishError> = policy
            .execute("op", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(RedfishError::Http {
                        status: 403,
                        path: "/".into(),
                        message: "denied".into(),
                    })
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn elapsed_time_bounds_the_envelope() {
        let mut settings = RetrySettings::default();
        settings.max_attempts = 100;
        settings.max_elapsed_time = Duration::from_secs(5);
        let policy = RetryPolicy::new(settings);
        let calls = AtomicU32::new(0);

        let result: Result<(), RedfishError> = policy
            .execute("op", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(transient()) }
            })
            .await;

        assert!(result.is_err());
        // 1s + 2s backoff fits; the 4s step would cross 5s elapsed.
        assert!(calls.load(Ordering::SeqCst) < 10);
    }
}
