use std::future::Future;

use crate::{backoff::Strategy, config::StoreRetryPolicy, store::StoreError};

/// Runs `operation`, retrying transient store failures according to `policy`.
///
/// Non-transient errors, and the last transient one, are returned to the caller.
pub(crate) async fn retry_transient<T, F, Fut>(
    policy: &StoreRetryPolicy,
    operation: &'static str,
    mut f: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt: u16 = 1;
    loop {
        match f().await {
            Err(error) if error.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.backoff.backoff(attempt);
                tracing::warn!(
                    ?error,
                    attempt,
                    operation,
                    "Store unavailable during {operation}, retrying in {delay}"
                );
                tokio::time::sleep(delay.to_std().unwrap_or_default()).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}
