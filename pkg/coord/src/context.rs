use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{CoordError, Result, codes};

/// Run `fut` until it completes or `cancel` fires.
pub async fn cancellable<F, T>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CoordError::canceled()),
        result = fut => result,
    }
}

/// Like [`cancellable`], but also gives up after `limit`.
pub async fn bounded<F, T>(cancel: &CancellationToken, limit: Duration, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    cancellable(cancel, async {
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(CoordError::new(
                codes::TIMEOUT,
                format!("{} timed out after {}ms", what, limit.as_millis()),
            )),
        }
    })
    .await
}
