use super::{CompletionError, CompletionService, DeltaStream};
use crate::config::ClientOptions;
use crate::protocol::ChatMessage;
use crate::sse::SseDecoder;
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Client for OpenAI-compatible `/chat/completions` and `/models` endpoints
/// (Ollama, llama.cpp server, OpenAI, ...).
pub struct OpenAiClient {
    client: Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

impl OpenAiClient {
    pub fn new(options: &ClientOptions) -> Self {
        Self {
            client: Client::new(),
            base_url: options.base_url.trim_end_matches('/').to_string(),
            api_key: options.api_key.clone(),
        }
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        if self.api_key.is_empty() {
            builder
        } else {
            builder.bearer_auth(&self.api_key)
        }
    }
}

#[async_trait]
impl CompletionService for OpenAiClient {
    async fn create_chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        cancel: &CancellationToken,
    ) -> Result<DeltaStream, CompletionError> {
        debug!(model, messages = messages.len(), base_url = %self.base_url, "Starting chat completion");

        let request = ChatCompletionRequest {
            model,
            messages,
            stream: true,
        };
        let send = self
            .authorized(self.client.post(format!("{}/chat/completions", self.base_url)))
            .json(&request)
            .send();

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CompletionError::Aborted),
            response = send => response?,
        };

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(CompletionError::Api { status, body });
        }

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .boxed();
        Ok(delta_stream(body, cancel.clone()))
    }

    async fn list_models(&self) -> Result<Vec<String>, CompletionError> {
        let response = self
            .authorized(self.client.get(format!("{}/models", self.base_url)))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(CompletionError::Api { status, body });
        }

        let models: ModelList = response.json().await?;
        Ok(models.data.into_iter().map(|model| model.id).collect())
    }
}

struct DeltaState {
    body: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    decoder: SseDecoder,
    pending: VecDeque<Result<String, CompletionError>>,
    cancel: CancellationToken,
    done: bool,
}

impl DeltaState {
    fn absorb(&mut self, bytes: &[u8]) {
        for data in self.decoder.push(bytes) {
            if data == "[DONE]" {
                self.done = true;
                return;
            }
            match parse_delta(&data) {
                Ok(Some(delta)) => self.pending.push_back(Ok(delta)),
                Ok(None) => {}
                Err(err) => {
                    self.done = true;
                    self.pending.push_back(Err(err));
                    return;
                }
            }
        }
    }
}

fn delta_stream(
    body: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    cancel: CancellationToken,
) -> DeltaStream {
    let state = DeltaState {
        body,
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        cancel,
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.done {
                return None;
            }

            let next = tokio::select! {
                biased;
                _ = state.cancel.cancelled() => None,
                next = state.body.next() => Some(next),
            };

            match next {
                None => {
                    state.done = true;
                    return Some((Err(CompletionError::Aborted), state));
                }
                Some(Some(Ok(bytes))) => state.absorb(&bytes),
                Some(Some(Err(err))) => {
                    state.done = true;
                    state.pending.push_back(Err(err.into()));
                }
                Some(None) => state.done = true,
            }
        }
    })
    .boxed()
}

/// Extracts the first choice's content delta; empty deltas count as none.
fn parse_delta(data: &str) -> Result<Option<String>, CompletionError> {
    let chunk: ChatCompletionChunk = serde_json::from_str(data)?;
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .filter(|content| !content.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn body(frames: &[&str]) -> BoxStream<'static, reqwest::Result<Vec<u8>>> {
        let frames: Vec<reqwest::Result<Vec<u8>>> = frames
            .iter()
            .map(|frame| Ok(frame.as_bytes().to_vec()))
            .collect();
        stream::iter(frames).boxed()
    }

    #[test]
    fn parse_delta_reads_first_choice_content() {
        let delta = parse_delta(r#"{"choices":[{"delta":{"content":"Hel"}}]}"#).unwrap();
        assert_eq!(delta.as_deref(), Some("Hel"));
    }

    #[test]
    fn parse_delta_treats_empty_and_role_only_deltas_as_none() {
        assert_eq!(
            parse_delta(r#"{"choices":[{"delta":{"content":""}}]}"#).unwrap(),
            None
        );
        assert_eq!(
            parse_delta(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#).unwrap(),
            None
        );
        assert_eq!(parse_delta(r#"{"choices":[]}"#).unwrap(), None);
    }

    #[tokio::test]
    async fn delta_stream_stops_at_done_marker() {
        let frames = body(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"\"}}]}\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n\n",
            "data: [DONE]\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n\n",
        ]);

        let deltas: Vec<String> = delta_stream(frames, CancellationToken::new())
            .map(|item| item.unwrap())
            .collect()
            .await;

        assert_eq!(deltas, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn delta_stream_yields_aborted_once_cancelled() {
        let cancel = CancellationToken::new();
        let frames = stream::pending::<reqwest::Result<Vec<u8>>>().boxed();
        let mut deltas = delta_stream(frames, cancel.clone());

        cancel.cancel();

        assert!(matches!(deltas.next().await, Some(Err(CompletionError::Aborted))));
        assert!(deltas.next().await.is_none());
    }

    #[tokio::test]
    async fn delta_stream_surfaces_malformed_payloads() {
        let frames = body(&["data: not json\n\n"]);
        let mut deltas = delta_stream(frames, CancellationToken::new());

        assert!(matches!(deltas.next().await, Some(Err(CompletionError::Decode(_)))));
        assert!(deltas.next().await.is_none());
    }
}
