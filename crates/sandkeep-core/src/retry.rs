use std::thread;
use std::time::Duration;

use anyhow::Result;
use tracing::warn;

/// Retry a fallible operation with exponential backoff.
///
/// - `max_attempts`: Total attempts (including the first).
/// - `base_delay`: Delay after first failure, doubled on each subsequent failure.
/// - `label`: Description for log messages.
/// - `f`: The closure to retry.
pub fn retry<F, T>(max_attempts: u32, base_delay: Duration, label: &str, f: F) -> Result<T>
where
    F: Fn() -> Result<T>,
{
    let mut last_err = None;
    let mut delay = base_delay;

    for attempt in 1..=max_attempts {
        match f() {
            Ok(val) => return Ok(val),
            Err(e) => {
                if attempt < max_attempts {
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "{} failed, retrying",
                        label,
                    );
                    thread::sleep(delay);
                    delay *= 2;
                }
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap())
}

/// Retry an async fallible operation with exponential backoff, capped at
/// `max_delay`. Used by loops that must not block a thread while waiting
/// (queue drain, scheduler retry, heartbeat) — bounded exponential
/// backoff, capped at 30s.
pub async fn retry_async<F, Fut, T>(
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    label: &str,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut last_err = None;
    let mut delay = base_delay;

    for attempt in 1..=max_attempts {
        match f().await {
            Ok(val) => return Ok(val),
            Err(e) => {
                if attempt < max_attempts {
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "{} failed, retrying",
                        label,
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(max_delay);
                }
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap())
}

/// Bounded exponential backoff schedule used by the Scheduler when no
/// node fits an admitted request: retries on the next tick, doubling the
/// wait up to a 30s cap.
pub fn scheduler_backoff(attempt: u32) -> Duration {
    let capped_attempt = attempt.min(10);
    let millis = 500u64.saturating_mul(1u64 << capped_attempt.min(6));
    Duration::from_millis(millis).min(Duration::from_secs(30))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_retry_succeeds_first_try() {
        let result = retry(3, Duration::from_millis(1), "test", || Ok(42));
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn test_retry_succeeds_after_failures() {
        let count = Cell::new(0);
        let result = retry(3, Duration::from_millis(1), "test", || {
            let c = count.get() + 1;
            count.set(c);
            if c < 3 {
                anyhow::bail!("not yet");
            }
            Ok(c)
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn test_retry_exhausts_all_attempts() {
        let count = Cell::new(0);
        let result: Result<i32> = retry(3, Duration::from_millis(1), "test", || {
            count.set(count.get() + 1);
            anyhow::bail!("always fails");
        });
        assert!(result.is_err());
        assert_eq!(count.get(), 3);
    }

    #[test]
    fn test_retry_single_attempt() {
        let result: Result<i32> = retry(1, Duration::from_millis(1), "test", || {
            anyhow::bail!("fail");
        });
        assert!(result.is_err());
    }

    #[test]
    fn backoff_is_capped_at_thirty_seconds() {
        assert_eq!(scheduler_backoff(0), Duration::from_millis(500));
        assert_eq!(scheduler_backoff(20), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn retry_async_succeeds_after_transient_failures() {
        let count = Cell::new(0);
        let result = retry_async(
            5,
            Duration::from_millis(1),
            Duration::from_millis(10),
            "test",
            || {
                let c = count.get() + 1;
                count.set(c);
                async move {
                    if c < 3 {
                        anyhow::bail!("not yet");
                    }
                    Ok(c)
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn retry_async_exhausts_attempts() {
        let result: Result<i32> = retry_async(
            2,
            Duration::from_millis(1),
            Duration::from_millis(5),
            "test",
            || async { anyhow::bail!("always fails") },
        )
        .await;
        assert!(result.is_err());
    }
}
