//! Scripted collaborators for coordinator tests.

use crate::ai_sdk::{CompletionError, CompletionService, DeltaStream};
use crate::error::RequestError;
use crate::protocol::{ChatEvent, ChatEventKind, ChatMessage, ServerMessage};
use crate::repo_source::RepoSource;
use async_trait::async_trait;
use futures::stream;
use futures::StreamExt;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneCall {
    pub url: String,
    pub git_ref: Option<String>,
    pub dir: PathBuf,
}

/// Writes a fixed set of files on clone and answers ref listings from a fixed list.
#[derive(Default)]
pub struct FakeRepoSource {
    refs: Vec<String>,
    files: Vec<(String, String)>,
    clone_error: Option<String>,
    clones: Mutex<Vec<CloneCall>>,
}

impl FakeRepoSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_refs(mut self, refs: &[&str]) -> Self {
        self.refs = refs.iter().map(|name| name.to_string()).collect();
        self
    }

    pub fn with_files(mut self, files: &[(&str, &str)]) -> Self {
        self.files = files
            .iter()
            .map(|(path, content)| (path.to_string(), content.to_string()))
            .collect();
        self
    }

    pub fn failing_clone(mut self, message: &str) -> Self {
        self.clone_error = Some(message.to_string());
        self
    }

    pub fn clones(&self) -> Vec<CloneCall> {
        self.clones.lock().unwrap().clone()
    }
}

#[async_trait]
impl RepoSource for FakeRepoSource {
    async fn clone_repo(
        &self,
        url: &str,
        git_ref: Option<&str>,
        dir: &Path,
    ) -> Result<(), RequestError> {
        self.clones.lock().unwrap().push(CloneCall {
            url: url.to_string(),
            git_ref: git_ref.map(str::to_string),
            dir: dir.to_path_buf(),
        });

        if let Some(message) = &self.clone_error {
            return Err(RequestError::CloneFailure {
                url: url.to_string(),
                message: message.clone(),
            });
        }

        for (path, content) in &self.files {
            let full = dir.join(path);
            if let Some(parent) = full.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&full, content).await?;
        }
        Ok(())
    }

    async fn list_server_refs(
        &self,
        _url: &str,
        prefix: &str,
    ) -> Result<Vec<String>, RequestError> {
        Ok(self
            .refs
            .iter()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect())
    }
}

pub enum Script {
    Reply(Vec<String>),
    /// Never yields; only cancellation ends it.
    Pending,
    Channel(mpsc::UnboundedReceiver<String>),
    Fail { status: u16, body: String },
}

/// Plays back one [`Script`] per completion call, in order.
#[derive(Default)]
pub struct FakeCompletion {
    scripts: Mutex<VecDeque<Script>>,
    calls: Mutex<Vec<Vec<ChatMessage>>>,
    models: Option<Vec<String>>,
}

impl FakeCompletion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, chunks: &[&str]) -> Self {
        self.push(Script::Reply(
            chunks.iter().map(|chunk| chunk.to_string()).collect(),
        ))
    }

    pub fn pending(self) -> Self {
        self.push(Script::Pending)
    }

    pub fn channel(self, rx: mpsc::UnboundedReceiver<String>) -> Self {
        self.push(Script::Channel(rx))
    }

    pub fn fail(self, status: u16, body: &str) -> Self {
        self.push(Script::Fail {
            status,
            body: body.to_string(),
        })
    }

    pub fn with_models(mut self, models: &[&str]) -> Self {
        self.models = Some(models.iter().map(|model| model.to_string()).collect());
        self
    }

    pub fn calls(&self) -> Vec<Vec<ChatMessage>> {
        self.calls.lock().unwrap().clone()
    }

    fn push(self, script: Script) -> Self {
        self.scripts.lock().unwrap().push_back(script);
        self
    }
}

#[async_trait]
impl CompletionService for FakeCompletion {
    async fn create_chat_completion(
        &self,
        _model: &str,
        messages: &[ChatMessage],
        _cancel: &CancellationToken,
    ) -> Result<DeltaStream, CompletionError> {
        self.calls.lock().unwrap().push(messages.to_vec());
        let script = self.scripts.lock().unwrap().pop_front();

        let deltas: DeltaStream = match script {
            Some(Script::Reply(chunks)) => stream::iter(chunks.into_iter().map(Ok)).boxed(),
            Some(Script::Pending) => stream::pending().boxed(),
            Some(Script::Channel(rx)) => UnboundedReceiverStream::new(rx).map(Ok).boxed(),
            Some(Script::Fail { status, body }) => {
                return Err(CompletionError::Api { status, body });
            }
            None => stream::empty().boxed(),
        };
        Ok(deltas)
    }

    async fn list_models(&self) -> Result<Vec<String>, CompletionError> {
        self.models.clone().ok_or(CompletionError::Api {
            status: 503,
            body: "no models".to_string(),
        })
    }
}

/// Everything currently queued on a panel connection, chat events only.
pub fn drain_events(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<ChatEventKind> {
    let mut kinds = Vec::new();
    while let Ok(message) = rx.try_recv() {
        if let ServerMessage::Chat(ChatEvent { kind, .. }) = message {
            kinds.push(kind);
        }
    }
    kinds
}
