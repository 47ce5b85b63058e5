use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::warn;

use crate::config::RetryPolicy;
use crate::error::AssistError;

/// Bounds a single collaborator call; an elapsed deadline counts as unavailability.
pub async fn bounded<T, F>(limit: Duration, what: &str, fut: F) -> Result<T, AssistError>
where
    F: Future<Output = Result<T, AssistError>>,
{
    match timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(AssistError::CollaboratorUnavailable(format!("{} timed out after {:?}", what, limit))),
    }
}

/// Retries transient failures with exponential backoff. Non-transient errors return at once.
pub async fn with_backoff<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T, AssistError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AssistError>>,
{
    let mut retry = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && retry < policy.max_retries => {
                let delay = policy.delay_for(retry);
                warn!(
                    call = what,
                    retry = retry + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retrying collaborator call"
                );
                sleep(delay).await;
                retry += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
