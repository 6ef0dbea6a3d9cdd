use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionCreateResponse {
    pub connection_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// One piece of the grounding message shown on the first turn of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum FirstMessageItem {
    Text { text: String },
    File {
        file_path: String,
        file_content: String,
    },
}

impl FirstMessageItem {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub request_id: String,
    pub repo_url: String,
    pub chat_history: Vec<ChatMessage>,
    pub message_to_be_sent: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionParams {
    pub model: String,
}

/// Panel to coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Command {
    SendMessage {
        request: SendMessageRequest,
        completion_params: CompletionParams,
    },
    Abort {
        request_id: String,
    },
    ListModels,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEvent {
    pub request_id: String,
    #[serde(flatten)]
    pub kind: ChatEventKind,
}

impl ChatEvent {
    pub fn new(request_id: impl Into<String>, kind: ChatEventKind) -> Self {
        Self {
            request_id: request_id.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ChatEventKind {
    Cloning { in_progress: bool },
    Retrieving { in_progress: bool },
    PromptProcessing { in_progress: bool },
    /// `None` marks the end of the stream.
    Streaming { chunk: Option<String> },
    InitialMessage {
        content: Vec<FirstMessageItem>,
        formatted: String,
    },
    AppendMessage { message: ChatMessage },
    Aborted,
    Error { name: String, message: String },
}

/// Replies to `listModels`, which carry no request id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Reply {
    AvailableModels { models: Vec<String> },
    Error { error_message: String },
}

/// Coordinator to panel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Chat(ChatEvent),
    Reply(Reply),
}

impl From<ChatEvent> for ServerMessage {
    fn from(event: ChatEvent) -> Self {
        Self::Chat(event)
    }
}

impl From<Reply> for ServerMessage {
    fn from(reply: Reply) -> Self {
        Self::Reply(reply)
    }
}
