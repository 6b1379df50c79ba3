//! Chat context model shared by the pipeline and the LLM providers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role of a chat entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// A single role-tagged entry in the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    /// Speaker name for multi-party rooms.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Ordered, append-only conversation history for one room session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatContext {
    messages: Vec<ChatMessage>,
}

impl ChatContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style append, used to seed the initial context.
    pub fn append(mut self, role: ChatRole, text: impl Into<String>) -> Self {
        self.push(ChatMessage::new(role, text));
        self
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Whether the context carries something a model can answer: at least one
    /// system or user entry.
    pub fn has_prompt(&self) -> bool {
        self.messages
            .iter()
            .any(|m| matches!(m.role, ChatRole::System | ChatRole::User))
    }
}

/// A callable function the model may choose to invoke.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
}

/// Set of functions offered to the model on a completion call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionContext {
    pub functions: Vec<FunctionDefinition>,
}

impl FunctionContext {
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}
