//! Boundary to a model service.
//!
//! A [`ClientWrapper`] is a thin wrapper around a specific LLM provider. It does
//! not keep track of the conversation; [`ClientAgent`](crate::agent::ClientAgent)
//! builds the full message list for every call and the orchestration owns the
//! history. The crate ships no concrete providers, only this trait.

use crate::ensemble::message::{ChatMessage, MessageChunkStream};
use async_trait::async_trait;
use std::error::Error;
use std::sync::Mutex;

/// How many tokens were spent on prompt vs. completion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub total_tokens: usize,
}

/// Trait defining the interface to interact with various LLM services.
#[async_trait]
pub trait ClientWrapper: Send + Sync {
    /// Send the messages to the model and return its reply.
    async fn send_message(
        &self,
        messages: &[ChatMessage],
    ) -> Result<ChatMessage, Box<dyn Error + Send + Sync>>;

    /// Send the messages and stream the reply as it is produced.
    ///
    /// The default implementation returns an error; clients that support
    /// streaming override it.
    async fn send_message_stream(
        &self,
        _messages: &[ChatMessage],
    ) -> Result<MessageChunkStream, Box<dyn Error + Send + Sync>> {
        Err("Streaming not supported by this client".into())
    }

    /// Identifier of the underlying model, for logs.
    fn model_name(&self) -> &str;

    /// Usage of the *last* `send_message` call, if the client tracks it.
    fn get_last_usage(&self) -> Option<TokenUsage> {
        self.usage_slot()
            .and_then(|slot| slot.lock().ok().and_then(|u| u.clone()))
    }

    /// Clients that track usage return their slot here.
    fn usage_slot(&self) -> Option<&Mutex<Option<TokenUsage>>> {
        None
    }
}
