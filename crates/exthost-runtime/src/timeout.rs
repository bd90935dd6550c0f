//! Timeouts for ready hooks.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use exthost_core::{BoxFuture, HostError, HostResult};
use tracing::info;

/// Asked with the extension name when its hook timed out; resolving to
/// `true` extends the wait once.
pub type QueryContinue = Arc<dyn Fn(&str) -> BoxFuture<'static, bool> + Send + Sync>;

/// Wrap an async closure as a [`QueryContinue`].
pub fn query_continue<F, Fut>(f: F) -> QueryContinue
where
    F: Fn(&str) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    Arc::new(move |name: &str| Box::pin(f(name)))
}

/// Await `fut` for at most `timeout`.
///
/// When it does not settle in time and `query` agrees, wait once more for
/// twice as long. A future that still has not settled is dropped.
pub async fn with_timeout<F, T>(
    fut: F,
    timeout: Duration,
    extension: &str,
    query: Option<&QueryContinue>,
) -> HostResult<T>
where
    F: Future<Output = HostResult<T>>,
{
    tokio::pin!(fut);
    if let Ok(result) = tokio::time::timeout(timeout, &mut fut).await {
        return result;
    }

    let mut waited = timeout;
    if let Some(query) = query {
        if query(extension).await {
            let extended = timeout * 2;
            info!(extension, timeout_ms = extended.as_millis() as u64, "Waiting longer for extension");
            if let Ok(result) = tokio::time::timeout(extended, &mut fut).await {
                return result;
            }
            waited += extended;
        }
    }

    Err(HostError::Timeout {
        name: extension.to_string(),
        timeout_ms: waited.as_millis() as u64,
    })
}
