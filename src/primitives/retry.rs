use std::time::Duration;

use tracing::{error, warn};

use crate::types::Result;

/// Runs `op` until it succeeds, at most `attempts` times, sleeping `backoff`
/// between attempts. Returns the last error when the budget is exhausted.
pub async fn retry_until_success<F>(attempts: u32, backoff: Duration, mut op: F) -> Result<()>
where
    F: FnMut() -> Result<()>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op() {
            Ok(()) => return Ok(()),
            Err(err) if attempt >= attempts => return Err(err),
            Err(err) => {
                warn!(attempt, error = %err, "primitives.retry.failed_attempt");
                attempt += 1;
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

/// Like [`retry_until_success`], but aborts the process when the budget is
/// exhausted. Used where continuing would leave in-memory state inconsistent
/// with durable state.
pub async fn retry_or_abort<F>(what: &str, attempts: u32, backoff: Duration, op: F)
where
    F: FnMut() -> Result<()>,
{
    if let Err(err) = retry_until_success(attempts, backoff, op).await {
        error!(what, attempts, error = %err, "primitives.retry.exhausted");
        std::process::abort();
    }
}
