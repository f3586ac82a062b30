use std::future::Future;
use std::time::Duration;

/// Exponential backoff settings for transient dispatch failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Total tries, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
        }
    }
}

impl Backoff {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// Run `f` until it succeeds or the attempts are used up; the last error is
/// returned.
pub async fn with_backoff<F, Fut, T, E>(backoff: Backoff, operation: &str, mut f: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= backoff.max_attempts.max(1) => {
                tracing::error!(operation, attempts = attempt, error = %e, "giving up");
                return Err(e);
            }
            Err(e) => {
                let delay = backoff.delay_for(attempt);
                tracing::warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retrying after failure"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delays_double() {
        let b = Backoff {
            max_attempts: 4,
            base_delay: Duration::from_millis(10),
        };
        assert_eq!(b.delay_for(1), Duration::from_millis(10));
        assert_eq!(b.delay_for(3), Duration::from_millis(40));
    }

    #[tokio::test]
    async fn stops_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let b = Backoff {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
        };
        let result: Result<(), String> = with_backoff(b, "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("nope".to_string())
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn returns_first_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = with_backoff(Backoff::default(), "test", || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Err("flaky".to_string())
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 1);
    }
}
