//! Agents: the opaque participants of an orchestration.
//!
//! The engine depends only on the [`Agent`] trait: given a conversation
//! history, produce a reply (optionally as a stream of chunks). It never looks
//! at how the reply is produced. Two agent kinds ship with the crate:
//!
//! - [`ClientAgent`] talks to a model through a [`ClientWrapper`]. It renders
//!   its instructions and any offered functions into a system prompt and
//!   recognises function calls in the model's reply.
//! - [`FnAgent`] is backed by a closure. It is handy for scripted participants,
//!   deterministic policies and tests.
//!
//! # Function calls
//!
//! Orchestrations that need structured directives (handoff transfers, task
//! completion) pass [`FunctionDefinition`]s in [`InvokeOptions`]. A reply
//! carrying a [`ContentItem::FunctionCall`] is treated as a directive.
//! `ClientAgent` asks the model to answer with
//!
//! ```text
//! {"function_call": {"name": "function_name", "arguments": {...}}}
//! ```
//!
//! and extracts the first such object from the reply text.
//!
//! # Example
//!
//! ```rust
//! use ensemble::agent::{Agent, FnAgent, InvokeOptions};
//! use ensemble::message::ChatMessage;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let echo = FnAgent::text("Echo", |history| {
//!     history.last().map(|m| m.content.to_string()).unwrap_or_default()
//! });
//!
//! let reply = echo
//!     .invoke(&[ChatMessage::user("ping")], &InvokeOptions::default())
//!     .await
//!     .unwrap();
//! assert_eq!(&*reply.content, "ping");
//! assert_eq!(reply.name.as_deref(), Some("Echo"));
//! # }
//! ```

use crate::ensemble::client_wrapper::ClientWrapper;
use crate::ensemble::message::{ChatMessage, ContentItem, MessageChunk, MessageChunkStream, Role};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::{stream, FutureExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::error::Error;
use std::future::Future;
use std::sync::{Arc, Mutex};

/// Result type returned by agent calls.
pub type AgentResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

/// A function an agent may call in its reply.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object.
    pub parameters: serde_json::Value,
}

impl FunctionDefinition {
    /// A function that takes no arguments.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: serde_json::json!({"type": "object", "properties": {}}),
        }
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }
}

/// Per-call options handed to [`Agent::invoke`].
#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    /// Functions the agent may call in this turn.
    pub functions: Vec<FunctionDefinition>,
    /// Extra instructions for this turn only.
    pub additional_instructions: Option<String>,
}

impl InvokeOptions {
    pub fn with_function(mut self, function: FunctionDefinition) -> Self {
        self.functions.push(function);
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.additional_instructions = Some(instructions.into());
        self
    }
}

/// An opaque participant that replies to a conversation.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Stable identifier of the agent.
    fn id(&self) -> &str;

    /// Display name; unique within an orchestration.
    fn name(&self) -> &str;

    /// Capabilities, used by managers to pick a speaker.
    fn description(&self) -> &str {
        ""
    }

    /// Produce a reply to `history`.
    async fn invoke(
        &self,
        history: &[ChatMessage],
        options: &InvokeOptions,
    ) -> AgentResult<ChatMessage>;

    /// Produce a reply as a stream of chunks.
    ///
    /// The default implementation yields the complete [`invoke`](Agent::invoke)
    /// reply as a single chunk.
    async fn invoke_stream(
        &self,
        history: &[ChatMessage],
        options: &InvokeOptions,
    ) -> AgentResult<MessageChunkStream> {
        let reply = self.invoke(history, options).await?;
        let chunk = MessageChunk {
            name: reply.name.clone(),
            content: reply.content.to_string(),
            items: reply.items.clone(),
            metadata: reply.metadata.clone(),
        };
        let chunk: AgentResult<MessageChunk> = Ok(chunk);
        Ok(Box::pin(stream::once(async move { chunk })))
    }
}

type ReplyFn =
    dyn Fn(Vec<ChatMessage>, InvokeOptions) -> BoxFuture<'static, AgentResult<ChatMessage>>
        + Send
        + Sync;

/// An agent backed by a closure.
///
/// Replies are attributed to the agent: the role becomes `Assistant` and a
/// missing sender name is filled in.
#[derive(Clone)]
pub struct FnAgent {
    id: String,
    name: String,
    description: String,
    reply: Arc<ReplyFn>,
}

impl FnAgent {
    /// Create an agent from an async closure.
    pub fn new<F, Fut>(name: impl Into<String>, reply: F) -> Self
    where
        F: Fn(Vec<ChatMessage>, InvokeOptions) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AgentResult<ChatMessage>> + Send + 'static,
    {
        let name = name.into();
        Self {
            id: format!("{}-{}", name, uuid::Uuid::new_v4().simple()),
            name,
            description: String::new(),
            reply: Arc::new(move |history: Vec<ChatMessage>, options: InvokeOptions| {
                reply(history, options).boxed()
            }),
        }
    }

    /// Create an agent whose reply text is computed synchronously from the
    /// history.
    pub fn text<F>(name: impl Into<String>, reply: F) -> Self
    where
        F: Fn(&[ChatMessage]) -> String + Send + Sync + 'static,
    {
        Self::new(name, move |history: Vec<ChatMessage>, _options| {
            let text = reply(&history);
            let message: AgentResult<ChatMessage> = Ok(ChatMessage::new(Role::Assistant, text));
            async move { message }
        })
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

#[async_trait]
impl Agent for FnAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn invoke(
        &self,
        history: &[ChatMessage],
        options: &InvokeOptions,
    ) -> AgentResult<ChatMessage> {
        let mut reply = (self.reply)(history.to_vec(), options.clone()).await?;
        reply.role = Role::Assistant;
        if reply.name.is_none() {
            reply.name = Some(self.name.clone());
        }
        Ok(reply)
    }
}

/// An agent backed by a model service.
///
/// ```rust,no_run
/// use ensemble::agent::ClientAgent;
/// use ensemble::client_wrapper::ClientWrapper;
/// use std::sync::Arc;
///
/// # fn build(client: Arc<dyn ClientWrapper>) -> ClientAgent {
/// ClientAgent::new("Physics", client)
///     .with_description("Answers physics questions")
///     .with_instructions("Be precise. Use SI units.")
/// # }
/// ```
pub struct ClientAgent {
    id: String,
    name: String,
    description: String,
    instructions: String,
    client: Arc<dyn ClientWrapper>,
}

impl ClientAgent {
    pub fn new(name: impl Into<String>, client: Arc<dyn ClientWrapper>) -> Self {
        let name = name.into();
        Self {
            id: format!("{}-{}", name, uuid::Uuid::new_v4().simple()),
            name,
            description: String::new(),
            instructions: String::new(),
            client,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn client(&self) -> &Arc<dyn ClientWrapper> {
        &self.client
    }

    fn system_prompt(&self, options: &InvokeOptions) -> String {
        let mut prompt = format!("You are {}.\n", self.name);
        if !self.description.is_empty() {
            prompt.push_str(&format!("Your role: {}\n", self.description));
        }
        if !self.instructions.is_empty() {
            prompt.push('\n');
            prompt.push_str(&self.instructions);
            prompt.push('\n');
        }
        if let Some(extra) = &options.additional_instructions {
            prompt.push('\n');
            prompt.push_str(extra);
            prompt.push('\n');
        }
        if !options.functions.is_empty() {
            prompt.push_str("\nYou can call the following functions:\n");
            for function in &options.functions {
                prompt.push_str(&format!("- {}: {}\n", function.name, function.description));
                let has_params = function
                    .parameters
                    .get("properties")
                    .and_then(|p| p.as_object())
                    .map_or(false, |p| !p.is_empty());
                if has_params {
                    prompt.push_str(&format!("  Parameters: {}\n", function.parameters));
                }
            }
            prompt.push_str(
                "\nTo call a function, respond with a JSON object in the following format:\n\
                 {\"function_call\": {\"name\": \"function_name\", \"arguments\": {...}}}\n",
            );
        }
        prompt
    }

    /// Map the shared history into the message list sent to the model.
    ///
    /// Messages from other participants become user messages prefixed with the
    /// sender's name so the model can tell the speakers apart.
    fn build_messages(&self, history: &[ChatMessage], options: &InvokeOptions) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(ChatMessage::system(self.system_prompt(options)));
        for message in history {
            let mapped = match message.role {
                Role::Assistant if message.name.as_deref() == Some(self.name.as_str()) => {
                    ChatMessage::new(Role::Assistant, message.content.to_string())
                }
                Role::Assistant | Role::Tool => {
                    let who = message.name.clone().unwrap_or_else(|| message.role.to_string());
                    ChatMessage::user(format!("[{}]: {}", who, message.content))
                }
                Role::User | Role::System => {
                    ChatMessage::new(message.role, message.content.to_string())
                }
            };
            messages.push(mapped);
        }
        messages
    }
}

#[async_trait]
impl Agent for ClientAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn invoke(
        &self,
        history: &[ChatMessage],
        options: &InvokeOptions,
    ) -> AgentResult<ChatMessage> {
        let messages = self.build_messages(history, options);
        log::debug!(
            "Agent '{}' calling model '{}' with {} messages",
            self.name,
            self.client.model_name(),
            messages.len()
        );
        let response = self.client.send_message(&messages).await?;

        let mut reply = ChatMessage::assistant(&self.name, response.content.to_string());
        if !options.functions.is_empty() {
            if let Some(call) = parse_function_call(&response.content) {
                reply = reply.with_item(call);
            }
        }
        if let Some(usage) = self.client.get_last_usage() {
            reply = reply
                .with_metadata("input_tokens", usage.input_tokens.to_string())
                .with_metadata("output_tokens", usage.output_tokens.to_string());
        }
        Ok(reply)
    }

    async fn invoke_stream(
        &self,
        history: &[ChatMessage],
        options: &InvokeOptions,
    ) -> AgentResult<MessageChunkStream> {
        let messages = self.build_messages(history, options);
        if let Some(slot) = self.client.usage_slot() {
            if let Ok(mut usage) = slot.lock() {
                *usage = None;
            }
        }
        let chunks = self.client.send_message_stream(&messages).await?;

        let buffer = Arc::new(Mutex::new(String::new()));
        let sink = Arc::clone(&buffer);
        let name = self.name.clone();
        let chunks = chunks.map(move |chunk| {
            chunk.map(|mut chunk| {
                if let Ok(mut text) = sink.lock() {
                    text.push_str(&chunk.content);
                }
                chunk.name = Some(name.clone());
                chunk
            })
        });

        // Function calls and token usage are only known once the whole reply
        // has arrived, so they come as one trailing chunk with no text.
        let parse_calls = !options.functions.is_empty();
        let name = self.name.clone();
        let client = Arc::clone(&self.client);
        let tail = stream::once(async move {
            let text = buffer.lock().map(|t| t.clone()).unwrap_or_default();
            let mut tail = MessageChunk::new("");
            tail.name = Some(name);
            if parse_calls {
                tail.items.extend(parse_function_call(&text));
            }
            if let Some(usage) = client.get_last_usage() {
                tail.metadata
                    .insert("input_tokens".to_string(), usage.input_tokens.to_string());
                tail.metadata
                    .insert("output_tokens".to_string(), usage.output_tokens.to_string());
            }
            if tail.items.is_empty() && tail.metadata.is_empty() {
                None
            } else {
                Some(Ok(tail))
            }
        })
        .filter_map(futures_util::future::ready);

        Ok(Box::pin(chunks.chain(tail)))
    }
}

/// Return the balanced `{...}` object starting at byte offset `start`.
///
/// Braces inside JSON string literals are ignored.
fn balanced_object(text: &str, start: usize) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Extract the first `{"function_call": {"name": ..., "arguments": {...}}}`
/// object from `text`.
pub fn parse_function_call(text: &str) -> Option<ContentItem> {
    let key = text.find("\"function_call\"")?;
    // Walk outward from the closest brace to the object that holds the key.
    text[..key]
        .match_indices('{')
        .rev()
        .filter_map(|(start, _)| balanced_object(text, start).filter(|o| start + o.len() > key))
        .find_map(|object| {
            let parsed: serde_json::Value = serde_json::from_str(object).ok()?;
            let call = parsed.get("function_call")?;
            let name = call.get("name")?.as_str()?;
            let arguments = call
                .get("arguments")
                .cloned()
                .unwrap_or_else(|| serde_json::json!({}));
            Some(ContentItem::function_call(name, arguments))
        })
}

/// Deserialize the first JSON object in `text` that matches `T`.
///
/// Accepts a bare JSON document, a fenced ```` ```json ```` block, or an object
/// embedded in prose.
pub fn extract_json<T: DeserializeOwned>(text: &str) -> Result<T, String> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<T>(trimmed) {
        return Ok(value);
    }

    let mut last_error = String::from("no JSON object found");
    for (start, _) in trimmed.match_indices('{') {
        if let Some(object) = balanced_object(trimmed, start) {
            match serde_json::from_str::<T>(object) {
                Ok(value) => return Ok(value),
                Err(err) => last_error = err.to_string(),
            }
        }
    }
    Err(last_error)
}
