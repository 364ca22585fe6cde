use crate::utils::time::sleep_with_jitter;
use std::future::Future;
use tracing::warn;

/// Runs `operation` until it succeeds, retrying up to `retries` more times
/// with exponential backoff. The last error is returned once retries run out;
/// errors that are not retryable are returned right away.
pub async fn retry_with_backoff<T, F, Fut>(
    mut retries: u32,
    base_delay_ms: u64,
    operation: F,
) -> common::Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = common::Result<T>>,
{
    let mut delay = base_delay_ms;
    let mut attempt = 1u32;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if retries == 0 || !e.is_retryable() {
                    return Err(e);
                }

                warn!(attempt, retries_left = retries, delay_ms = delay, error = %e, "Attempt failed, retrying");
                retries -= 1;
                attempt += 1;
                sleep_with_jitter(delay, delay / 2).await;
                delay = delay.saturating_mul(2);
            }
        }
    }
}
