//! Cancellation-aware awaiting for request steps.

use crate::error::RequestError;
use async_trait::async_trait;
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// The request's cancellation token fired before the awaited step finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl From<Cancelled> for RequestError {
    fn from(_: Cancelled) -> Self {
        RequestError::Aborted
    }
}

#[async_trait]
pub trait OrCancelExt: Sized {
    type Output;

    /// Race this future against `token`. An already-cancelled token wins even when the
    /// future is immediately ready.
    async fn or_cancel(self, token: &CancellationToken) -> Result<Self::Output, Cancelled>;
}

#[async_trait]
impl<F> OrCancelExt for F
where
    F: Future + Send,
    F::Output: Send,
{
    type Output = F::Output;

    async fn or_cancel(self, token: &CancellationToken) -> Result<Self::Output, Cancelled> {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(Cancelled),
            res = self => Ok(res),
        }
    }
}

/// Step boundary check.
pub fn checkpoint(token: &CancellationToken) -> Result<(), Cancelled> {
    if token.is_cancelled() {
        Err(Cancelled)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::time::sleep;

    #[tokio::test]
    async fn returns_output_when_future_finishes_first() {
        let token = CancellationToken::new();
        assert_eq!(async { 42 }.or_cancel(&token).await, Ok(42));
    }

    #[tokio::test]
    async fn returns_cancelled_when_token_fires_mid_flight() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        let canceller = tokio::spawn(async move {
            sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let result = async {
            sleep(Duration::from_secs(5)).await;
            7
        }
        .or_cancel(&token)
        .await;

        canceller.await.unwrap();
        assert_eq!(result, Err(Cancelled));
    }

    #[tokio::test]
    async fn cancelled_token_beats_ready_future() {
        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(async { 5 }.or_cancel(&token).await, Err(Cancelled));
        assert_eq!(checkpoint(&token), Err(Cancelled));
    }
}
