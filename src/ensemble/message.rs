//! Conversation data model shared by every orchestration topology.
//!
//! A [`ChatMessage`] is immutable once created and carries its sender identity,
//! textual content, and a list of structured [`ContentItem`]s (function calls,
//! function results, annotations). An ordered sequence of messages forms a
//! [`ChatHistory`], which is the shared context handed to members of the
//! Sequential, Group Chat, Handoff and Magentic topologies.
//!
//! # Example
//!
//! ```
//! use ensemble::message::{ChatHistory, ChatMessage, ContentItem, Role};
//!
//! let mut history = ChatHistory::new();
//! history.push(ChatMessage::user("Summarise the release notes"));
//! history.push(
//!     ChatMessage::assistant("Writer", "Here is a summary...")
//!         .with_item(ContentItem::annotation("source", "notes.md")),
//! );
//!
//! assert_eq!(history.len(), 2);
//! assert_eq!(history.last().unwrap().name.as_deref(), Some("Writer"));
//! assert!(matches!(history.messages()[0].role, Role::User));
//! ```

use chrono::{DateTime, Utc};
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

/// Represents the possible roles for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Set by the developer to steer the model's responses.
    System,
    /// A message sent by a human user (or the task that started the run).
    User,
    /// Content generated by an agent.
    Assistant,
    /// The outcome of a function/tool call.
    Tool,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        f.write_str(label)
    }
}

/// A structured item attached to a [`ChatMessage`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentItem {
    /// Plain text, in addition to the message's primary content.
    Text { text: String },
    /// A request by the agent to invoke a function.
    FunctionCall {
        /// Correlates the call with its [`ContentItem::FunctionResult`].
        id: String,
        name: String,
        arguments: serde_json::Value,
    },
    /// The outcome of a previously issued function call.
    FunctionResult {
        call_id: String,
        name: String,
        result: String,
    },
    /// Free-form annotation such as a citation.
    Annotation { label: String, value: String },
}

impl ContentItem {
    /// Build a function call item with a freshly generated call id.
    pub fn function_call(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        ContentItem::FunctionCall {
            id: uuid::Uuid::new_v4().simple().to_string(),
            name: name.into(),
            arguments,
        }
    }

    pub fn function_result(
        call_id: impl Into<String>,
        name: impl Into<String>,
        result: impl Into<String>,
    ) -> Self {
        ContentItem::FunctionResult {
            call_id: call_id.into(),
            name: name.into(),
            result: result.into(),
        }
    }

    pub fn annotation(label: impl Into<String>, value: impl Into<String>) -> Self {
        ContentItem::Annotation {
            label: label.into(),
            value: value.into(),
        }
    }
}

/// A single message flowing through an orchestration.
///
/// Content is stored as `Arc<str>` so cloning a history for each dispatched
/// turn stays cheap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Conversation role of the message.
    pub role: Role,

    /// Name of the participant that produced the message, or `None` for task
    /// and system messages.
    pub name: Option<String>,

    /// The message body.
    pub content: Arc<str>,

    /// Structured items (function calls, results, annotations).
    pub items: Vec<ContentItem>,

    /// UTC timestamp recorded when the message was created.
    pub timestamp: DateTime<Utc>,

    /// Free-form key-value metadata attached to the message.
    pub metadata: HashMap<String, String>,
}

impl ChatMessage {
    /// Create a message with the given role and content but no sender identity.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            name: None,
            content: Arc::from(content.into().as_str()),
            items: Vec::new(),
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Create an assistant-role message attributed to a named participant.
    ///
    /// ```
    /// use ensemble::message::{ChatMessage, Role};
    ///
    /// let msg = ChatMessage::assistant("Reviewer", "Looks good.");
    /// assert_eq!(msg.role, Role::Assistant);
    /// assert_eq!(msg.name.as_deref(), Some("Reviewer"));
    /// ```
    pub fn assistant(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content).with_name(name)
    }

    /// Attach a sender name (builder pattern).
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Attach a structured item (builder pattern).
    pub fn with_item(mut self, item: ContentItem) -> Self {
        self.items.push(item);
        self
    }

    /// Attach a key-value metadata pair (builder pattern).
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Iterate over the function calls carried by this message as
    /// `(id, name, arguments)` triples.
    pub fn function_calls(&self) -> impl Iterator<Item = (&str, &str, &serde_json::Value)> {
        self.items.iter().filter_map(|item| match item {
            ContentItem::FunctionCall {
                id,
                name,
                arguments,
            } => Some((id.as_str(), name.as_str(), arguments)),
            _ => None,
        })
    }

    /// `true` when the message has neither text nor structured items.
    pub fn is_empty(&self) -> bool {
        self.content.trim().is_empty() && self.items.is_empty()
    }
}

impl fmt::Display for ChatMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.content)
    }
}

/// Ordered conversation history. Insertion order is significant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatHistory {
    messages: Vec<ChatMessage>,
}

impl ChatHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn extend(&mut self, messages: impl IntoIterator<Item = ChatMessage>) {
        self.messages.extend(messages);
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn last(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn into_messages(self) -> Vec<ChatMessage> {
        self.messages
    }

    /// Render the history as `[name]: content` lines, used when a history has
    /// to be folded into a single prompt.
    pub fn transcript(&self) -> String {
        self.messages
            .iter()
            .map(|m| {
                let who = m.name.clone().unwrap_or_else(|| m.role.to_string());
                format!("[{}]: {}", who, m.content)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl From<Vec<ChatMessage>> for ChatHistory {
    fn from(messages: Vec<ChatMessage>) -> Self {
        Self { messages }
    }
}

impl<'a> IntoIterator for &'a ChatHistory {
    type Item = &'a ChatMessage;
    type IntoIter = std::slice::Iter<'a, ChatMessage>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.iter()
    }
}

/// Represents a chunk of a streaming agent reply.
#[derive(Debug, Clone, Default)]
pub struct MessageChunk {
    /// Name of the participant producing the stream.
    pub name: Option<String>,
    /// The incremental content in this chunk.
    pub content: String,
    /// Structured items that arrived with this chunk.
    pub items: Vec<ContentItem>,
    /// Metadata known once the reply is complete, such as token usage.
    pub metadata: HashMap<String, String>,
}

impl MessageChunk {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            name: None,
            content: content.into(),
            items: Vec::new(),
            metadata: HashMap::new(),
        }
    }
}

/// A boxed stream of reply chunks.
pub type MessageChunkStream =
    Pin<Box<dyn Stream<Item = Result<MessageChunk, Box<dyn Error + Send + Sync>>> + Send>>;

/// Fold streamed chunks into a complete assistant message.
pub fn merge_chunks(name: &str, chunks: &[MessageChunk]) -> ChatMessage {
    let mut content = String::new();
    let mut items = Vec::new();
    let mut metadata = HashMap::new();
    for chunk in chunks {
        content.push_str(&chunk.content);
        items.extend(chunk.items.iter().cloned());
        metadata.extend(chunk.metadata.clone());
    }
    let mut message = ChatMessage::assistant(name, content);
    message.items = items;
    message.metadata = metadata;
    message
}
