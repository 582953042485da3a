//! # ensemble
//!
//! ensemble coordinates several conversational agents working on one task. Agents are
//! opaque: anything that can produce a reply to a conversation implements [`Agent`]. The
//! engine decides who speaks when, carries the shared history between them, and hands the
//! caller a single awaitable [`OrchestrationResult`].
//!
//! The crate provides:
//!
//! * **An actor runtime**: [`runtime::Runtime`] hosts one independent worker per registered
//!   actor. Actors talk only by message passing; handler errors and panics are caught at the
//!   actor boundary and never take down other actors.
//! * **Five topologies**, all implementing [`Orchestration`]:
//!   [`ConcurrentOrchestration`] (fan-out/fan-in), [`SequentialOrchestration`] (pipeline),
//!   [`GroupChatOrchestration`] (manager-steered discussion), [`HandoffOrchestration`]
//!   (control transfer over a directed graph) and [`MagenticOrchestration`]
//!   (plan/execute/reflect with a task ledger).
//! * **Run handles**: [`OrchestrationResult`] supports timed waits, cooperative cancellation
//!   and settles exactly once.
//! * **Callbacks and events**: per-turn and streaming response callbacks, a human response
//!   function for human-in-the-loop flows, and an [`EventHandler`] that observes every run.
//! * **Model boundary**: [`ClientWrapper`] for LLM services and [`ClientAgent`] which turns a
//!   client into a member agent. Concrete HTTP clients are out of scope.
//!
//! ## Getting Started
//!
//! ```rust
//! use ensemble::agent::{Agent, FnAgent};
//! use ensemble::concurrent::ConcurrentOrchestration;
//! use ensemble::orchestration::Orchestration;
//! use ensemble::runtime::Runtime;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let physics: Arc<dyn Agent> = Arc::new(FnAgent::text("Physics", |_| "Kinetic energy.".into()));
//! let chemistry: Arc<dyn Agent> = Arc::new(FnAgent::text("Chemistry", |_| "Bond energy.".into()));
//!
//! let runtime = Runtime::new();
//! runtime.start()?;
//!
//! let result = ConcurrentOrchestration::new(vec![physics, chemistry])
//!     .invoke("What is energy?", &runtime, None)
//!     .await?;
//! let replies = result.get(None).await?;
//! assert_eq!(replies.len(), 2);
//!
//! runtime.stop_when_idle().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Logging
//!
//! The crate logs through the [`log`] facade. Call [`init_logger`] to install `env_logger`
//! and control verbosity with `RUST_LOG=ensemble=debug`.

// Import the top-level `ensemble` module.
pub mod ensemble;

pub use ensemble::init_logger;

pub use ensemble::{
    agent, cancellation, client_wrapper, concurrent, config, error, event, group_chat, handoff,
    magentic, message, orchestration, result, runtime, sequential,
};

// Re-exporting key items for easier external access.
pub use ensemble::agent::{Agent, ClientAgent, FnAgent, FunctionDefinition, InvokeOptions};
pub use ensemble::cancellation::CancellationToken;
pub use ensemble::client_wrapper::ClientWrapper;
pub use ensemble::concurrent::ConcurrentOrchestration;
pub use ensemble::config::OrchestrationLimits;
pub use ensemble::error::OrchestrationError;
pub use ensemble::event::{EventHandler, OrchestrationEvent};
pub use ensemble::group_chat::{
    GroupChatManager, GroupChatOrchestration, ModelDrivenGroupChatManager,
    RoundRobinGroupChatManager,
};
pub use ensemble::handoff::{HandoffGraph, HandoffOrchestration};
pub use ensemble::magentic::{MagenticManager, MagenticOrchestration, StandardMagenticManager};
pub use ensemble::message::{ChatHistory, ChatMessage, ContentItem, MessageChunk, Role};
pub use ensemble::orchestration::{Orchestration, OrchestrationBuilder, Task};
pub use ensemble::result::{OrchestrationResult, ResultState};
pub use ensemble::runtime::Runtime;
