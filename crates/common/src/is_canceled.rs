use std::{
    future::Future,
    time::Duration,
};

use errors::ErrorMetadata;
use tokio_util::sync::CancellationToken;

/// Runs `fut` until it completes or `token` fires. Cancellation surfaces as an
/// error tagged [`errors::ErrorCode::Canceled`], which callers treat as a
/// silent no-op.
pub async fn cancelable<T>(
    token: &CancellationToken,
    fut: impl Future<Output = anyhow::Result<T>>,
) -> anyhow::Result<T> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(ErrorMetadata::canceled().into()),
        result = fut => result,
    }
}

pub async fn sleep_cancelable(token: &CancellationToken, duration: Duration) -> anyhow::Result<()> {
    cancelable(token, async {
        tokio::time::sleep(duration).await;
        Ok(())
    })
    .await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use errors::ErrorMetadataAnyhowExt;
    use tokio_util::sync::CancellationToken;

    use super::{
        cancelable,
        sleep_cancelable,
    };

    #[tokio::test]
    async fn test_cancel_wins_over_pending_future() {
        let token = CancellationToken::new();
        token.cancel();
        let err = sleep_cancelable(&token, Duration::from_secs(3600))
            .await
            .unwrap_err();
        assert!(err.is_canceled());
        assert!(!err.should_surface());
    }

    #[tokio::test]
    async fn test_completes_without_cancel() -> anyhow::Result<()> {
        let token = CancellationToken::new();
        assert_eq!(cancelable(&token, async { Ok(7) }).await?, 7);
        Ok(())
    }
}
