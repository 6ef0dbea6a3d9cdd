mod openai;

pub use openai::OpenAiClient;

use crate::protocol::ChatMessage;
use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

/// Lazy sequence of assistant text deltas.
pub type DeltaStream = BoxStream<'static, Result<String, CompletionError>>;

#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("completion request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error: {status} - {body}")]
    Api { status: u16, body: String },
    #[error("malformed completion payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("completion aborted")]
    Aborted,
}

/// Streaming chat-completion backend.
#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Starts a streamed completion. Cancelling `cancel` aborts the underlying request and
    /// makes the stream yield [`CompletionError::Aborted`].
    async fn create_chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        cancel: &CancellationToken,
    ) -> Result<DeltaStream, CompletionError>;

    async fn list_models(&self) -> Result<Vec<String>, CompletionError>;
}
