//! The request coordinator.
//!
//! A chat request moves through `cloning → retrieving → prompt_processing → streaming` on
//! the first turn of a conversation and straight to `prompt_processing → streaming` on
//! later turns. Every step races the request's cancellation token, and every request ends
//! in exactly one terminal event: `streaming{null}`, `aborted` or `error`.

use crate::ai_sdk::{CompletionService, OpenAiClient};
use crate::cancel::{checkpoint, OrCancelExt};
use crate::config::Settings;
use crate::context;
use crate::error::RequestError;
use crate::events::{EventSink, RequestEvents};
use crate::file_selector::select_files;
use crate::protocol::{
    ChatEventKind, ChatMessage, Command, FirstMessageItem, Reply, SendMessageRequest,
};
use crate::repo_locator;
use crate::repo_source::{file_tree, RepoSource};
use crate::streamer::stream_reply;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct Coordinator {
    completion: watch::Receiver<Arc<dyn CompletionService>>,
    source: Arc<dyn RepoSource>,
    clone_root: PathBuf,
    in_flight: Mutex<HashMap<String, CancellationToken>>,
}

impl Coordinator {
    pub fn new(
        completion: watch::Receiver<Arc<dyn CompletionService>>,
        source: Arc<dyn RepoSource>,
        clone_root: PathBuf,
    ) -> Self {
        Self {
            completion,
            source,
            clone_root,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Dispatches one panel command. Sends and model listings run on their own task;
    /// the send's cancellation token is registered before this returns.
    pub async fn handle(self: &Arc<Self>, command: Command, sink: EventSink) {
        match command {
            Command::SendMessage {
                request,
                completion_params,
            } => {
                let Some(cancel) = self.register(&request.request_id).await else {
                    warn!(
                        request_id = %request.request_id,
                        "Ignoring send while a request for this session is in flight"
                    );
                    return;
                };
                let coordinator = Arc::clone(self);
                tokio::spawn(async move {
                    coordinator
                        .run_registered(request, completion_params.model, cancel, sink)
                        .await;
                });
            }
            Command::Abort { request_id } => {
                self.abort(&request_id).await;
            }
            Command::ListModels => {
                let coordinator = Arc::clone(self);
                tokio::spawn(async move { coordinator.list_models(&sink).await });
            }
        }
    }

    pub async fn abort(&self, request_id: &str) -> bool {
        match self.in_flight.lock().await.get(request_id) {
            Some(cancel) => {
                info!(request_id, "Aborting request");
                cancel.cancel();
                true
            }
            None => {
                debug!(request_id, "Abort for a request that is not in flight");
                false
            }
        }
    }

    /// Cancels everything in flight; used when the panel goes away.
    pub async fn abort_all(&self) {
        let in_flight = self.in_flight.lock().await;
        for (request_id, cancel) in in_flight.iter() {
            debug!(request_id = %request_id, "Cancelling request of closed connection");
            cancel.cancel();
        }
    }

    pub async fn list_models(&self, sink: &EventSink) {
        let completion = self.completion.borrow().clone();
        let reply = match completion.list_models().await {
            Ok(models) => {
                info!(count = models.len(), "Listed models");
                Reply::AvailableModels { models }
            }
            Err(err) => {
                warn!(error = %err, "Failed to list models");
                Reply::Error {
                    error_message: err.to_string(),
                }
            }
        };
        sink.send(reply);
    }

    async fn register(&self, request_id: &str) -> Option<CancellationToken> {
        let mut in_flight = self.in_flight.lock().await;
        if in_flight.contains_key(request_id) {
            return None;
        }
        let cancel = CancellationToken::new();
        in_flight.insert(request_id.to_string(), cancel.clone());
        Some(cancel)
    }

    async fn run_registered(
        &self,
        request: SendMessageRequest,
        model: String,
        cancel: CancellationToken,
        sink: EventSink,
    ) {
        // Later settings changes only affect later requests.
        let completion = self.completion.borrow().clone();
        let request_id = request.request_id.as_str();
        let events = RequestEvents::new(request_id, &sink, &cancel);

        info!(request_id, %model, turn = request.chat_history.len() / 2 + 1, "Request started");
        let result = self
            .run_request(completion.as_ref(), &request, &model, &events)
            .await;

        // Releasing the id and emitting the terminal event happen under one lock, so a
        // follow-up send or abort for the same session sees a consistent state.
        let mut in_flight = self.in_flight.lock().await;
        in_flight.remove(request_id);
        let terminal = match result {
            Ok(reply) if !cancel.is_cancelled() => {
                info!(request_id, reply_len = reply.len(), "Request completed");
                ChatEventKind::Streaming { chunk: None }
            }
            Err(err) if !err.is_aborted() && !cancel.is_cancelled() => {
                warn!(request_id, error = %err, "Request failed");
                ChatEventKind::Error {
                    name: err.name().to_string(),
                    message: err.to_string(),
                }
            }
            _ => {
                info!(request_id, "Request aborted");
                ChatEventKind::Aborted
            }
        };
        events.terminal(terminal);
    }

    async fn run_request(
        &self,
        completion: &dyn CompletionService,
        request: &SendMessageRequest,
        model: &str,
        events: &RequestEvents<'_>,
    ) -> Result<String, RequestError> {
        let cancel = events.cancel();

        let content = if request.chat_history.is_empty() {
            let items = self.ground_first_turn(completion, request, model, events).await?;
            let formatted = context::format_first_message(&items);
            events.emit(ChatEventKind::InitialMessage {
                content: items,
                formatted: formatted.clone(),
            });
            formatted
        } else {
            request.message_to_be_sent.clone()
        };

        let message = ChatMessage::user(content);
        let mut messages = request.chat_history.clone();
        messages.push(message.clone());
        events.emit(ChatEventKind::AppendMessage { message });
        events.emit(ChatEventKind::PromptProcessing { in_progress: true });

        checkpoint(cancel)?;
        let stream = completion
            .create_chat_completion(model, &messages, cancel)
            .or_cancel(cancel)
            .await??;
        events.emit(ChatEventKind::PromptProcessing { in_progress: false });

        stream_reply(stream, events).await
    }

    /// Clones the repository, lets the model pick files and builds the grounding message.
    async fn ground_first_turn(
        &self,
        completion: &dyn CompletionService,
        request: &SendMessageRequest,
        model: &str,
        events: &RequestEvents<'_>,
    ) -> Result<Vec<FirstMessageItem>, RequestError> {
        let cancel = events.cancel();
        let mut info = repo_locator::locate(&request.message_to_be_sent, &request.repo_url)?;
        let (Some(repo_url), Some(repo_name)) = (info.repo_url.clone(), info.repo_name.clone())
        else {
            return Err(RequestError::MissingRepoUrl);
        };

        checkpoint(cancel)?;
        events.emit(ChatEventKind::Cloning { in_progress: true });
        repo_locator::resolve_ref(self.source.as_ref(), &mut info)
            .or_cancel(cancel)
            .await??;
        let repo_dir = self.clone_root.join(&repo_name);
        self.source
            .clone_repo(&repo_url, info.git_ref.as_deref(), &repo_dir)
            .or_cancel(cancel)
            .await??;
        events.emit(ChatEventKind::Cloning { in_progress: false });

        checkpoint(cancel)?;
        events.emit(ChatEventKind::Retrieving { in_progress: true });
        let tree_root = if info.folder_path.is_empty() {
            repo_dir.clone()
        } else {
            repo_dir.join(&info.folder_path)
        };
        let tree = file_tree(self.source.as_ref(), &tree_root)
            .or_cancel(cancel)
            .await?
            .join("\n");
        let selected = select_files(completion, model, &tree, &info.query, cancel).await?;
        let files = context::load_files(
            self.source.as_ref(),
            &repo_dir,
            &info.folder_path,
            &selected,
            cancel,
        )
        .await?;
        events.emit(ChatEventKind::Retrieving { in_progress: false });

        info!(
            request_id = events.request_id(),
            repo = %repo_name,
            folder = %info.folder_path,
            selected = selected.len(),
            loaded = files.len(),
            "Grounding files ready"
        );
        Ok(context::assemble(&repo_name, files, &info.query))
    }
}

/// Rebuilds the completion client whenever the stored client options change.
pub async fn follow_settings(
    mut settings: watch::Receiver<Settings>,
    completion: watch::Sender<Arc<dyn CompletionService>>,
) {
    let mut current = settings.borrow_and_update().client_options.clone();
    while settings.changed().await.is_ok() {
        let options = settings.borrow_and_update().client_options.clone();
        if options == current {
            continue;
        }
        info!(base_url = %options.base_url, "Client options changed; rebuilding completion client");
        completion.send_replace(Arc::new(OpenAiClient::new(&options)));
        current = options;
    }
}
