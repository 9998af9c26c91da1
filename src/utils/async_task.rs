use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio::time::timeout;
use tracing::error;
use tracing::warn;

use crate::BackoffPolicy;
use crate::Error;
use crate::NetworkError;
use crate::Result;

/// Runs `task` until it succeeds, bounding every attempt by `policy.timeout()` and
/// sleeping `policy.delay_for(attempt)` between attempts.
///
/// `max_retries == 0` retries forever.
pub async fn task_with_timeout_and_exponential_backoff<F, T, P>(
    task: F,
    policy: BackoffPolicy,
) -> Result<P>
where
    F: Fn() -> T,
    T: std::future::Future<Output = Result<P>>,
{
    let mut attempts = 0;
    loop {
        let reason = match timeout(policy.timeout(), task()).await {
            Ok(Ok(r)) => return Ok(r),
            Ok(Err(e)) => {
                warn!("attempt {} failed: {}", attempts + 1, e);
                e.to_string()
            }
            Err(_) => {
                warn!("attempt {} timed out after {:?}", attempts + 1, policy.timeout());
                NetworkError::Timeout(policy.timeout()).to_string()
            }
        };

        attempts += 1;
        if policy.max_retries != 0 && attempts >= policy.max_retries {
            warn!("task failed after {} attempts", attempts);
            return Err(Error::RetryExhausted { attempts, reason });
        }
        sleep(policy.delay_for(attempts - 1)).await;
    }
}

/// Spawns a named task whose error is logged instead of propagated
pub fn spawn_task<F, Fut>(
    name: &'static str,
    task_fn: F,
    handles: Option<&mut Vec<JoinHandle<()>>>,
) where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    let handle = tokio::spawn(async move {
        if let Err(e) = task_fn().await {
            error!("spawned task: {name} stopped or encountered an error: {:?}", e);
        }
    });

    if let Some(h) = handles {
        h.push(handle);
    }
}
