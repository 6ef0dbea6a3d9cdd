//! Panel-side conversation state, one [`Session`] per session key (the repository URL the
//! user has open). Only the active session is rendered; the others keep folding their own
//! events in the background.

use crate::protocol::{
    ChatEvent, ChatEventKind, ChatMessage, Command, CompletionParams, FirstMessageItem,
    SendMessageRequest,
};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Phase {
    #[default]
    Idle,
    /// Sent, no progress event yet.
    Submitted,
    Cloning,
    Retrieving,
    PromptProcessing,
    Streaming,
}

impl Phase {
    pub fn is_busy(self) -> bool {
        self != Phase::Idle
    }

    pub fn label(self) -> Option<&'static str> {
        match self {
            Phase::Idle | Phase::Streaming => None,
            Phase::Submitted => Some("Sending..."),
            Phase::Cloning => Some("Cloning..."),
            Phase::Retrieving => Some("Retrieving files, this may take some time..."),
            Phase::PromptProcessing => Some("Processing prompt..."),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub history: Vec<ChatMessage>,
    pub streaming: String,
    pub phase: Phase,
    /// Grounding message of the first turn, empty until `initial_message` arrives.
    pub first_message: Vec<FirstMessageItem>,
    pub last_error: Option<String>,
    pending_input: Option<String>,
    restored_input: Option<String>,
    /// The live request's user turn was already seeded by `initial_message`.
    turn_seeded: bool,
}

impl Session {
    fn finish(&mut self) {
        self.phase = Phase::Idle;
        self.pending_input = None;
        self.turn_seeded = false;
    }

    fn fail(&mut self, message: String) {
        self.last_error = Some(message);
        self.restored_input = self.pending_input.take();
        self.streaming.clear();
        self.phase = Phase::Idle;
        self.turn_seeded = false;
    }
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, Session>,
    active: Option<String>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Switches the rendered session. Other sessions, including their requests, are untouched.
    pub fn set_active(&mut self, key: impl Into<String>) {
        let key = key.into();
        debug!(session = %key, "Switching active session");
        self.active = Some(key);
    }

    pub fn active_key(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn active(&self) -> Option<&Session> {
        self.active.as_ref().and_then(|key| self.sessions.get(key))
    }

    pub fn session(&self, key: &str) -> Option<&Session> {
        self.sessions.get(key)
    }

    pub fn is_active_busy(&self) -> bool {
        self.active().is_some_and(|session| session.phase.is_busy())
    }

    /// Builds the `sendMessage` command for the active session, creating the session on
    /// first use. Returns `None` without an active session or while a request is live.
    pub fn begin_send(&mut self, text: &str, model: &str) -> Option<Command> {
        let key = self.active.clone()?;
        let session = self.sessions.entry(key.clone()).or_default();
        if session.phase.is_busy() {
            debug!(session = %key, phase = ?session.phase, "Refusing send while busy");
            return None;
        }

        session.pending_input = Some(text.to_string());
        session.restored_input = None;
        session.last_error = None;
        session.turn_seeded = false;
        session.phase = Phase::Submitted;

        Some(Command::SendMessage {
            request: SendMessageRequest {
                request_id: key.clone(),
                repo_url: key,
                chat_history: session.history.clone(),
                message_to_be_sent: text.to_string(),
            },
            completion_params: CompletionParams {
                model: model.to_string(),
            },
        })
    }

    pub fn abort_active(&self) -> Option<Command> {
        let key = self.active.as_ref()?;
        let session = self.sessions.get(key)?;
        session.phase.is_busy().then(|| Command::Abort {
            request_id: key.clone(),
        })
    }

    /// Starts the active session over. Refused while its request is live; abort it first.
    pub fn new_chat(&mut self) -> bool {
        let Some(key) = &self.active else {
            return false;
        };
        match self.sessions.get_mut(key) {
            Some(session) if session.phase.is_busy() => false,
            Some(session) => {
                *session = Session::default();
                true
            }
            None => true,
        }
    }

    /// Folds one coordinator event into its session. Returns whether anything changed;
    /// events for unknown sessions, or for sessions without a live request, are dropped.
    pub fn apply(&mut self, event: ChatEvent) -> bool {
        let Some(session) = self.sessions.get_mut(&event.request_id) else {
            debug!(request_id = %event.request_id, "Dropping event for unknown session");
            return false;
        };
        if !session.phase.is_busy() {
            debug!(request_id = %event.request_id, kind = ?event.kind, "Dropping stale event");
            return false;
        }

        match event.kind {
            ChatEventKind::Cloning { in_progress } => {
                if in_progress {
                    session.phase = Phase::Cloning;
                }
            }
            ChatEventKind::Retrieving { in_progress } => {
                if in_progress {
                    session.phase = Phase::Retrieving;
                }
            }
            ChatEventKind::PromptProcessing { in_progress } => {
                if in_progress {
                    session.phase = Phase::PromptProcessing;
                }
            }
            ChatEventKind::Streaming { chunk: Some(chunk) } => {
                session.streaming.push_str(&chunk);
                session.phase = Phase::Streaming;
            }
            ChatEventKind::Streaming { chunk: None } => {
                let content = std::mem::take(&mut session.streaming);
                session.history.push(ChatMessage::assistant(content));
                session.finish();
            }
            ChatEventKind::InitialMessage { content, formatted } => {
                session.first_message = content;
                session.history = vec![ChatMessage::user(formatted)];
                session.turn_seeded = true;
            }
            ChatEventKind::AppendMessage { message } => {
                if !std::mem::take(&mut session.turn_seeded) {
                    session.history.push(message);
                }
            }
            ChatEventKind::Aborted => {
                if !session.streaming.is_empty() {
                    let partial = std::mem::take(&mut session.streaming);
                    session.history.push(ChatMessage::assistant(partial));
                }
                session.finish();
            }
            ChatEventKind::Error { name, message } => {
                debug!(request_id = %event.request_id, %name, "Request failed");
                session.fail(message);
            }
        }
        true
    }

    /// Input of the active session's last failed send, handed back once.
    pub fn take_restored_input(&mut self) -> Option<String> {
        let key = self.active.as_ref()?;
        self.sessions.get_mut(key)?.restored_input.take()
    }

    /// The coordinator went away: every live request is failed with `message`.
    pub fn fail_all_in_flight(&mut self, message: &str) {
        for session in self.sessions.values_mut() {
            if session.phase.is_busy() {
                session.fail(message.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const TAB: &str = "https://github.com/acme/widgets";

    fn event(kind: ChatEventKind) -> ChatEvent {
        ChatEvent::new(TAB, kind)
    }

    fn chunk(text: &str) -> ChatEvent {
        event(ChatEventKind::Streaming {
            chunk: Some(text.to_string()),
        })
    }

    fn registry_with_live_request() -> SessionRegistry {
        let mut registry = SessionRegistry::new();
        registry.set_active(TAB);
        registry
            .begin_send("explain the retry logic", "llama3")
            .unwrap();
        registry
    }

    #[test]
    fn begin_send_builds_command_from_history_snapshot() {
        let mut registry = SessionRegistry::new();
        registry.set_active(TAB);

        let command = registry.begin_send("explain", "llama3").unwrap();

        assert_eq!(
            command,
            Command::SendMessage {
                request: SendMessageRequest {
                    request_id: TAB.to_string(),
                    repo_url: TAB.to_string(),
                    chat_history: Vec::new(),
                    message_to_be_sent: "explain".to_string(),
                },
                completion_params: CompletionParams {
                    model: "llama3".to_string(),
                },
            }
        );
        assert_eq!(registry.active().unwrap().phase, Phase::Submitted);
    }

    #[test]
    fn second_send_is_refused_while_busy() {
        let mut registry = registry_with_live_request();
        assert_eq!(registry.begin_send("again", "llama3"), None);
        assert!(registry.is_active_busy());
    }

    #[test]
    fn send_without_active_session_is_refused() {
        let mut registry = SessionRegistry::new();
        assert_eq!(registry.begin_send("explain", "llama3"), None);
    }

    #[test]
    fn progress_events_drive_phase() {
        let mut registry = registry_with_live_request();

        registry.apply(event(ChatEventKind::Cloning { in_progress: true }));
        assert_eq!(registry.active().unwrap().phase, Phase::Cloning);
        registry.apply(event(ChatEventKind::Cloning { in_progress: false }));
        assert_eq!(registry.active().unwrap().phase, Phase::Cloning);
        registry.apply(event(ChatEventKind::Retrieving { in_progress: true }));
        assert_eq!(registry.active().unwrap().phase, Phase::Retrieving);
        registry.apply(event(ChatEventKind::PromptProcessing { in_progress: true }));
        assert_eq!(
            registry.active().unwrap().phase.label(),
            Some("Processing prompt...")
        );
        registry.apply(chunk("It"));
        assert_eq!(registry.active().unwrap().phase, Phase::Streaming);
        assert_eq!(registry.active().unwrap().phase.label(), None);
    }

    #[test]
    fn end_of_stream_commits_concatenated_chunks_once() {
        let mut registry = registry_with_live_request();
        registry.apply(event(ChatEventKind::AppendMessage {
            message: ChatMessage::user("explain the retry logic"),
        }));

        for part in ["It ", "retries ", "three times."] {
            registry.apply(chunk(part));
        }
        registry.apply(event(ChatEventKind::Streaming { chunk: None }));

        let session = registry.active().unwrap();
        assert_eq!(
            session.history,
            vec![
                ChatMessage::user("explain the retry logic"),
                ChatMessage::assistant("It retries three times."),
            ]
        );
        assert_eq!(session.streaming, "");
        assert_eq!(session.phase, Phase::Idle);
    }

    #[test]
    fn initial_message_seeds_history_and_append_does_not_duplicate() {
        let mut registry = registry_with_live_request();
        let items = vec![
            FirstMessageItem::text("intro"),
            FirstMessageItem::File {
                file_path: "src/retry.rs".to_string(),
                file_content: "fn retry() {}".to_string(),
            },
        ];

        registry.apply(event(ChatEventKind::InitialMessage {
            content: items.clone(),
            formatted: "grounded".to_string(),
        }));
        registry.apply(event(ChatEventKind::AppendMessage {
            message: ChatMessage::user("grounded"),
        }));

        let session = registry.active().unwrap();
        assert_eq!(session.first_message, items);
        assert_eq!(session.history, vec![ChatMessage::user("grounded")]);
    }

    #[test]
    fn resending_the_same_text_after_abort_keeps_both_turns() {
        let mut registry = SessionRegistry::new();
        registry.set_active(TAB);
        for _ in 0..2 {
            registry.begin_send("and the backoff?", "llama3").unwrap();
            registry.apply(event(ChatEventKind::AppendMessage {
                message: ChatMessage::user("and the backoff?"),
            }));
            registry.apply(event(ChatEventKind::Aborted));
        }

        let session = registry.active().unwrap();
        assert_eq!(
            session.history,
            vec![
                ChatMessage::user("and the backoff?"),
                ChatMessage::user("and the backoff?"),
            ]
        );
    }

    #[test]
    fn abort_after_partial_stream_keeps_partial_text() {
        let mut registry = registry_with_live_request();
        registry.apply(chunk("It retr"));
        registry.apply(event(ChatEventKind::Aborted));

        let session = registry.active().unwrap();
        assert_eq!(session.history, vec![ChatMessage::assistant("It retr")]);
        assert_eq!(session.phase, Phase::Idle);
    }

    #[test]
    fn abort_without_chunks_leaves_history_unchanged() {
        let mut registry = registry_with_live_request();
        registry.apply(event(ChatEventKind::PromptProcessing { in_progress: true }));
        registry.apply(event(ChatEventKind::Aborted));

        let session = registry.active().unwrap();
        assert!(session.history.is_empty());
        assert_eq!(session.phase, Phase::Idle);
        assert_eq!(session.last_error, None);
    }

    #[test]
    fn error_restores_pending_input_and_keeps_history() {
        let mut registry = registry_with_live_request();
        registry.apply(chunk("partial"));
        registry.apply(event(ChatEventKind::Error {
            name: "CompletionServiceError".to_string(),
            message: "API error: 500 - model not loaded".to_string(),
        }));

        let session = registry.active().unwrap();
        assert!(session.history.is_empty());
        assert_eq!(session.streaming, "");
        assert_eq!(
            session.last_error.as_deref(),
            Some("API error: 500 - model not loaded")
        );
        assert_eq!(
            registry.take_restored_input().as_deref(),
            Some("explain the retry logic")
        );
        assert_eq!(registry.take_restored_input(), None);
    }

    #[test]
    fn events_for_unknown_sessions_are_no_ops() {
        let mut registry = registry_with_live_request();
        let before = registry.active().cloned();

        assert!(!registry.apply(ChatEvent::new(
            "https://github.com/acme/other",
            ChatEventKind::Streaming {
                chunk: Some("x".to_string())
            }
        )));
        assert_eq!(registry.active().cloned(), before);
        assert_eq!(registry.session("https://github.com/acme/other"), None);
    }

    #[test]
    fn events_after_terminal_are_stale() {
        let mut registry = registry_with_live_request();
        registry.apply(event(ChatEventKind::Aborted));

        assert!(!registry.apply(chunk("late")));
        assert_eq!(registry.active().unwrap().streaming, "");
    }

    #[test]
    fn switching_sessions_keeps_background_requests_folding() {
        let mut registry = registry_with_live_request();
        registry.set_active("https://github.com/acme/other");
        assert_eq!(registry.active(), None);

        registry.apply(chunk("background"));
        registry.apply(event(ChatEventKind::Streaming { chunk: None }));

        assert_eq!(
            registry.session(TAB).unwrap().history,
            vec![ChatMessage::assistant("background")]
        );
        assert!(registry.begin_send("hi", "llama3").is_some());
    }

    #[test]
    fn abort_active_only_while_busy() {
        let mut registry = registry_with_live_request();
        assert_eq!(
            registry.abort_active(),
            Some(Command::Abort {
                request_id: TAB.to_string()
            })
        );

        registry.apply(event(ChatEventKind::Aborted));
        assert_eq!(registry.abort_active(), None);
    }

    #[test]
    fn new_chat_resets_idle_session_only() {
        let mut registry = registry_with_live_request();
        assert!(!registry.new_chat());

        registry.apply(chunk("done"));
        registry.apply(event(ChatEventKind::Streaming { chunk: None }));
        assert!(registry.new_chat());
        assert_eq!(registry.active(), Some(&Session::default()));
    }

    #[test]
    fn lost_connection_fails_live_requests() {
        let mut registry = registry_with_live_request();
        registry.fail_all_in_flight("connection lost");

        let session = registry.active().unwrap();
        assert_eq!(session.phase, Phase::Idle);
        assert_eq!(session.last_error.as_deref(), Some("connection lost"));
        assert_eq!(
            registry.take_restored_input().as_deref(),
            Some("explain the retry logic")
        );
    }
}
