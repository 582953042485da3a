//! The contract shared by every topology, plus the plumbing they have in common.
//!
//! A topology is built from a list of member [`Agent`]s and optional
//! callbacks, then started with [`Orchestration::invoke`]. `invoke` validates
//! the configuration, registers one actor per member (plus any controller
//! actor) on the [`Runtime`], delivers the task and returns an
//! [`OrchestrationResult`] without waiting for the run.
//!
//! # Input and output types
//!
//! Every orchestration is generic over the type it accepts and the type it
//! produces. By default the input is a [`Task`] (anything convertible into a
//! list of messages) and the output is the topology's natural reply shape.
//! [`with_input_transform`](crate::sequential::SequentialOrchestration::with_input_transform)
//! and `with_output_transform` change either side:
//!
//! ```rust,no_run
//! use ensemble::agent::{Agent, FnAgent};
//! use ensemble::concurrent::ConcurrentOrchestration;
//! use ensemble::orchestration::{json_output_transform, Orchestration};
//! use ensemble::runtime::Runtime;
//! use serde::Deserialize;
//! use std::sync::Arc;
//!
//! #[derive(Debug, Clone, Deserialize)]
//! struct Score {
//!     value: u32,
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let judge: Arc<dyn Agent> = Arc::new(FnAgent::text("Judge", |_| r#"{"value": 7}"#.into()));
//! let orchestration = ConcurrentOrchestration::new(vec![judge])
//!     .with_output_transform(|replies| async move {
//!         let scores: Vec<Score> = replies
//!             .iter()
//!             .filter_map(|m| serde_json::from_str(&m.content).ok())
//!             .collect();
//!         Ok(scores.iter().map(|s| s.value).sum::<u32>())
//!     });
//!
//! let runtime = Runtime::new();
//! runtime.start()?;
//! let result = orchestration.invoke("Rate this essay", &runtime, None).await?;
//! assert_eq!(result.get(None).await?, 7);
//! # let _ = json_output_transform::<Score>();
//! # Ok(())
//! # }
//! ```

use crate::ensemble::agent::{extract_json, Agent, InvokeOptions};
use crate::ensemble::cancellation::CancellationToken;
use crate::ensemble::config::OrchestrationLimits;
use crate::ensemble::error::OrchestrationError;
use crate::ensemble::event::{EventHandler, OrchestrationEvent};
use crate::ensemble::message::{merge_chunks, ChatHistory, ChatMessage, MessageChunk};
use crate::ensemble::result::{OrchestrationResult, ResultResolver, ResultState};
use crate::ensemble::runtime::{Actor, ActorFailure, ActorId, Runtime, RuntimeError, RuntimeState};
use async_trait::async_trait;
use futures_util::future::{self, BoxFuture, Ready};
use futures_util::{FutureExt, StreamExt};
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// The initial input of a run: one or more messages.
#[derive(Debug, Clone)]
pub struct Task {
    messages: Vec<ChatMessage>,
}

impl Task {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self { messages }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<ChatMessage> {
        self.messages
    }
}

impl From<&str> for Task {
    fn from(text: &str) -> Self {
        Task::new(vec![ChatMessage::user(text)])
    }
}

impl From<String> for Task {
    fn from(text: String) -> Self {
        Task::new(vec![ChatMessage::user(text)])
    }
}

impl From<ChatMessage> for Task {
    fn from(message: ChatMessage) -> Self {
        Task::new(vec![message])
    }
}

impl From<Vec<ChatMessage>> for Task {
    fn from(messages: Vec<ChatMessage>) -> Self {
        Task::new(messages)
    }
}

/// Converts a caller-defined input into a [`Task`].
pub type InputTransform<TIn> =
    Arc<dyn Fn(TIn) -> Result<Task, OrchestrationError> + Send + Sync>;

/// Reduces the run's replies into the orchestration's output value.
pub type OutputTransform<TOut> = Arc<
    dyn Fn(Vec<ChatMessage>) -> BoxFuture<'static, Result<TOut, OrchestrationError>> + Send + Sync,
>;

/// Called once per completed member turn.
pub type AgentResponseCallback = Arc<dyn Fn(&ChatMessage) + Send + Sync>;

/// Called for every streamed chunk; the flag is `true` on the last chunk of a turn.
pub type StreamingCallback = Arc<dyn Fn(&MessageChunk, bool) + Send + Sync>;

/// Produces the human reply when a manager or handoff asks for user input.
pub type HumanResponseFunction =
    Arc<dyn Fn(ChatHistory) -> BoxFuture<'static, ChatMessage> + Send + Sync>;

/// The contract every topology implements.
#[async_trait]
pub trait Orchestration: Send + Sync {
    type Input: Send + 'static;
    type Output: Clone + Send + Sync + 'static;

    /// Start a run and return its result handle without waiting for it.
    ///
    /// Configuration problems (empty or duplicate member names, invalid
    /// handoff edges, a rejected input) are returned here; everything else
    /// surfaces through [`OrchestrationResult::get`].
    async fn invoke<I>(
        &self,
        task: I,
        runtime: &Runtime,
        cancellation: Option<CancellationToken>,
    ) -> Result<OrchestrationResult<Self::Output>, OrchestrationError>
    where
        I: Into<Self::Input> + Send;
}

/// Input and output conversion of an orchestration.
pub struct Transforms<TIn, TOut> {
    input: InputTransform<TIn>,
    output: OutputTransform<TOut>,
}

impl<TIn, TOut> Clone for Transforms<TIn, TOut> {
    fn clone(&self) -> Self {
        Self {
            input: Arc::clone(&self.input),
            output: Arc::clone(&self.output),
        }
    }
}

impl Transforms<Task, ChatMessage> {
    /// Pass the task through and return the last reply.
    pub fn last_reply() -> Self {
        Self {
            input: Arc::new(|task: Task| Ok::<Task, OrchestrationError>(task)),
            output: Arc::new(|replies: Vec<ChatMessage>| {
                future::ready(replies.into_iter().last().ok_or(OrchestrationError::EmptyHistory))
                    .boxed()
            }),
        }
    }
}

impl Transforms<Task, Vec<ChatMessage>> {
    /// Pass the task through and return every reply.
    pub fn all_replies() -> Self {
        Self {
            input: Arc::new(|task: Task| Ok::<Task, OrchestrationError>(task)),
            output: Arc::new(|replies: Vec<ChatMessage>| {
                future::ready(Ok::<_, OrchestrationError>(replies)).boxed()
            }),
        }
    }
}

impl<TIn, TOut> Transforms<TIn, TOut> {
    pub fn with_input<U, F>(self, transform: F) -> Transforms<U, TOut>
    where
        F: Fn(U) -> Result<Task, OrchestrationError> + Send + Sync + 'static,
    {
        Transforms {
            input: Arc::new(transform),
            output: self.output,
        }
    }

    pub fn with_output<V, F, Fut>(self, transform: F) -> Transforms<TIn, V>
    where
        F: Fn(Vec<ChatMessage>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, OrchestrationError>> + Send + 'static,
    {
        Transforms {
            input: self.input,
            output: Arc::new(move |replies: Vec<ChatMessage>| transform(replies).boxed()),
        }
    }
}

/// Configuration shared by every topology: members, callbacks and limits.
#[derive(Clone)]
pub struct OrchestrationBase {
    pub(crate) members: Vec<Arc<dyn Agent>>,
    pub(crate) name: String,
    pub(crate) description: String,
    pub(crate) agent_response_callback: Option<AgentResponseCallback>,
    pub(crate) streaming_callback: Option<StreamingCallback>,
    pub(crate) human_response_function: Option<HumanResponseFunction>,
    pub(crate) event_handler: Option<Arc<dyn EventHandler>>,
    pub(crate) limits: OrchestrationLimits,
}

impl OrchestrationBase {
    pub fn new(members: Vec<Arc<dyn Agent>>) -> Self {
        Self {
            members,
            name: String::new(),
            description: String::new(),
            agent_response_callback: None,
            streaming_callback: None,
            human_response_function: None,
            event_handler: None,
            limits: OrchestrationLimits::default(),
        }
    }

    pub fn members(&self) -> &[Arc<dyn Agent>] {
        &self.members
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn limits(&self) -> &OrchestrationLimits {
        &self.limits
    }

    /// `(name, description)` pairs in member order.
    pub fn participants(&self) -> Vec<(String, String)> {
        self.members
            .iter()
            .map(|m| (m.name().to_string(), m.description().to_string()))
            .collect()
    }

    pub(crate) fn member(&self, name: &str) -> Option<&Arc<dyn Agent>> {
        self.members.iter().find(|m| m.name() == name)
    }

    /// The member list must be non-empty and names must be unique.
    pub fn validate(&self) -> Result<(), OrchestrationError> {
        if self.members.is_empty() {
            return Err(OrchestrationError::Configuration(
                "an orchestration needs at least one member".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for member in &self.members {
            if member.name().trim().is_empty() {
                return Err(OrchestrationError::Configuration(
                    "member names must not be empty".to_string(),
                ));
            }
            if !seen.insert(member.name()) {
                return Err(OrchestrationError::Configuration(format!(
                    "duplicate member name '{}'",
                    member.name()
                )));
            }
        }
        Ok(())
    }

    /// Validate, convert the task and create the run's shared context and
    /// result handle.
    pub(crate) async fn start_run<TIn, TOut>(
        &self,
        transforms: &Transforms<TIn, TOut>,
        task: TIn,
        topology: &str,
        runtime: &Runtime,
        cancellation: Option<CancellationToken>,
    ) -> Result<StartedRun<TOut>, OrchestrationError>
    where
        TOut: Clone + Send + Sync + 'static,
    {
        self.validate()?;
        let task = (transforms.input)(task).map_err(|err| match err {
            OrchestrationError::InputTransform(_) => err,
            other => OrchestrationError::InputTransform(other.to_string()),
        })?;
        match runtime.state() {
            RuntimeState::Running => {}
            RuntimeState::Created => {
                return Err(RuntimeError::InvalidState(
                    "runtime has not been started".to_string(),
                )
                .into())
            }
            RuntimeState::Stopped => return Err(RuntimeError::Stopped.into()),
        }

        let token = cancellation.unwrap_or_default();
        let (result, resolver) = OrchestrationResult::pending(token);
        resolver.link_cancellation();

        let run_id = uuid::Uuid::new_v4().simple().to_string();
        let name = if self.name.is_empty() {
            topology.to_string()
        } else {
            self.name.clone()
        };
        let ctx = Arc::new(RunContext {
            run_id,
            name,
            resolver,
            output: Arc::clone(&transforms.output),
            agent_response_callback: self.agent_response_callback.clone(),
            streaming_callback: self.streaming_callback.clone(),
            human_response_function: self.human_response_function.clone(),
            event_handler: self.event_handler.clone(),
            turns: AtomicUsize::new(0),
        });

        log::info!(
            "Starting {} orchestration '{}' (run {}) with {} members",
            topology,
            ctx.name,
            ctx.run_id,
            self.members.len()
        );
        ctx.emit(OrchestrationEvent::RunStarted {
            run_id: ctx.run_id.clone(),
            orchestration_name: ctx.name.clone(),
            topology: topology.to_string(),
            member_count: self.members.len(),
        })
        .await;

        let watcher = Arc::clone(&ctx);
        let observed = result.clone();
        tokio::spawn(async move {
            let _ = observed.get(None).await;
            if observed.state() == ResultState::Cancelled {
                log::info!("Run {} cancelled", watcher.run_id);
                watcher
                    .emit(OrchestrationEvent::RunCancelled {
                        run_id: watcher.run_id.clone(),
                    })
                    .await;
            }
        });

        Ok(StartedRun {
            ctx,
            result,
            task,
            runtime: runtime.clone(),
            registered: Vec::new(),
        })
    }
}

/// Everything a topology needs to wire up a freshly started run.
pub(crate) struct StartedRun<TOut> {
    pub(crate) ctx: Arc<RunContext<TOut>>,
    pub(crate) result: OrchestrationResult<TOut>,
    pub(crate) task: Task,
    pub(crate) runtime: Runtime,
    registered: Vec<ActorId>,
}

impl<TOut: Clone + Send + Sync + 'static> StartedRun<TOut> {
    /// Actor id of the member `name` within this run.
    pub(crate) fn actor_id(&self, name: &str) -> ActorId {
        ActorId::scoped(name, &self.ctx.run_id)
    }

    /// Actor id of a topology controller, e.g. `"3f2a...::collector"`.
    ///
    /// Member ids end in the run id, so no member name can produce one of these.
    pub(crate) fn controller_id(&self, role: &str) -> ActorId {
        ActorId::from(format!("{}::{}", self.ctx.run_id, role))
    }

    /// Register an actor that belongs to this run.
    pub(crate) fn register<A, F>(&mut self, id: ActorId, factory: F) -> Result<(), RuntimeError>
    where
        A: Actor,
        F: FnOnce() -> A,
    {
        self.runtime.register_actor(id.clone(), factory)?;
        self.registered.push(id);
        Ok(())
    }

    /// Register the run's actors and deliver its first message through `wire`.
    ///
    /// If wiring fails, the actors registered so far are removed and the run
    /// is failed, so nothing keeps waiting on it.
    pub(crate) async fn launch<F>(
        mut self,
        wire: F,
    ) -> Result<OrchestrationResult<TOut>, OrchestrationError>
    where
        F: FnOnce(&mut Self) -> Result<(), OrchestrationError>,
    {
        if let Err(err) = wire(&mut self) {
            for id in &self.registered {
                self.runtime.unregister_actor(id);
            }
            self.ctx.fail(err.clone()).await;
            return Err(err);
        }
        Ok(self.result)
    }
}

/// Builder methods shared by every topology.
///
/// ```rust
/// use ensemble::agent::{Agent, FnAgent};
/// use ensemble::orchestration::OrchestrationBuilder;
/// use ensemble::sequential::SequentialOrchestration;
/// use std::sync::Arc;
///
/// let writer: Arc<dyn Agent> = Arc::new(FnAgent::text("Writer", |_| "draft".into()));
/// let pipeline = SequentialOrchestration::new(vec![writer])
///     .with_name("drafting")
///     .with_agent_response_callback(|msg| println!("{}", msg.content));
/// assert_eq!(pipeline.base().name(), "drafting");
/// ```
pub trait OrchestrationBuilder: Sized {
    fn base(&self) -> &OrchestrationBase;

    fn base_mut(&mut self) -> &mut OrchestrationBase;

    fn with_name(mut self, name: impl Into<String>) -> Self {
        self.base_mut().name = name.into();
        self
    }

    fn with_description(mut self, description: impl Into<String>) -> Self {
        self.base_mut().description = description.into();
        self
    }

    fn with_agent_response_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ChatMessage) + Send + Sync + 'static,
    {
        self.base_mut().agent_response_callback = Some(Arc::new(callback));
        self
    }

    /// Stream member replies, reporting every chunk to `callback`.
    fn with_streaming_agent_response_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&MessageChunk, bool) + Send + Sync + 'static,
    {
        self.base_mut().streaming_callback = Some(Arc::new(callback));
        self
    }

    fn with_human_response_function<F>(mut self, respond: F) -> Self
    where
        F: Fn(&ChatHistory) -> ChatMessage + Send + Sync + 'static,
    {
        self.base_mut().human_response_function = Some(Arc::new(move |history: ChatHistory| {
            future::ready(respond(&history)).boxed()
        }));
        self
    }

    fn with_async_human_response_function<F, Fut>(mut self, respond: F) -> Self
    where
        F: Fn(ChatHistory) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ChatMessage> + Send + 'static,
    {
        self.base_mut().human_response_function =
            Some(Arc::new(move |history: ChatHistory| respond(history).boxed()));
        self
    }

    fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.base_mut().event_handler = Some(handler);
        self
    }

    fn with_limits(mut self, limits: OrchestrationLimits) -> Self {
        self.base_mut().limits = limits;
        self
    }
}

/// State shared by all actors of one run.
pub(crate) struct RunContext<TOut> {
    pub(crate) run_id: String,
    pub(crate) name: String,
    resolver: ResultResolver<TOut>,
    output: OutputTransform<TOut>,
    agent_response_callback: Option<AgentResponseCallback>,
    streaming_callback: Option<StreamingCallback>,
    human_response_function: Option<HumanResponseFunction>,
    event_handler: Option<Arc<dyn EventHandler>>,
    turns: AtomicUsize,
}

impl<TOut: Clone + Send + Sync + 'static> RunContext<TOut> {
    pub(crate) async fn emit(&self, event: OrchestrationEvent) {
        if let Some(handler) = &self.event_handler {
            handler.on_orchestration_event(&event).await;
        }
    }

    /// `true` once the run resolved or was cancelled.
    pub(crate) fn is_finished(&self) -> bool {
        self.resolver.is_finished()
    }

    pub(crate) fn turns(&self) -> usize {
        self.turns.load(Ordering::SeqCst)
    }

    pub(crate) fn has_human_response_function(&self) -> bool {
        self.human_response_function.is_some()
    }

    /// Invoke one member for one turn.
    ///
    /// Streams the reply when a streaming callback is configured, fires the
    /// response callback once, and emits the turn's events.
    pub(crate) async fn invoke_member(
        &self,
        agent: &dyn Agent,
        history: &[ChatMessage],
        options: &InvokeOptions,
    ) -> Result<ChatMessage, OrchestrationError> {
        log::debug!(
            "Run {}: invoking '{}' with {} messages",
            self.run_id,
            agent.name(),
            history.len()
        );
        self.turns.fetch_add(1, Ordering::SeqCst);
        self.emit(OrchestrationEvent::AgentInvoked {
            run_id: self.run_id.clone(),
            agent_name: agent.name().to_string(),
            history_length: history.len(),
        })
        .await;

        let outcome = match &self.streaming_callback {
            Some(callback) => self.stream_member(agent, history, options, callback).await,
            None => agent
                .invoke(history, options)
                .await
                .map_err(|err| OrchestrationError::agent(agent.name(), err)),
        };

        let mut reply = match outcome {
            Ok(reply) => reply,
            Err(err) => {
                self.emit(OrchestrationEvent::AgentFailed {
                    run_id: self.run_id.clone(),
                    agent_name: agent.name().to_string(),
                    error: err.to_string(),
                })
                .await;
                return Err(err);
            }
        };
        if reply.name.is_none() {
            reply.name = Some(agent.name().to_string());
        }

        if let Some(callback) = &self.agent_response_callback {
            callback(&reply);
        }
        self.emit(OrchestrationEvent::AgentResponded {
            run_id: self.run_id.clone(),
            agent_name: agent.name().to_string(),
            response_length: reply.content.len(),
        })
        .await;
        Ok(reply)
    }

    async fn stream_member(
        &self,
        agent: &dyn Agent,
        history: &[ChatMessage],
        options: &InvokeOptions,
        callback: &StreamingCallback,
    ) -> Result<ChatMessage, OrchestrationError> {
        let stream = agent
            .invoke_stream(history, options)
            .await
            .map_err(|err| OrchestrationError::agent(agent.name(), err))?;
        let mut stream = stream.peekable();

        let mut chunks = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|err| OrchestrationError::agent(agent.name(), err))?;
            let is_final = Pin::new(&mut stream).peek().await.is_none();
            callback(&chunk, is_final);
            chunks.push(chunk);
        }
        Ok(merge_chunks(agent.name(), &chunks))
    }

    /// Call the human response function.
    pub(crate) async fn request_human_input(
        &self,
        history: &ChatHistory,
    ) -> Result<ChatMessage, OrchestrationError> {
        let respond = self
            .human_response_function
            .as_ref()
            .ok_or(OrchestrationError::MissingHumanInputHandler)?;
        self.emit(OrchestrationEvent::UserInputRequested {
            run_id: self.run_id.clone(),
        })
        .await;
        let mut reply = respond(history.clone()).await;
        if reply.name.is_none() {
            reply.name = Some("user".to_string());
        }
        Ok(reply)
    }

    /// Apply the output transform and resolve the run with its value.
    pub(crate) async fn complete(&self, replies: Vec<ChatMessage>) {
        if self.is_finished() {
            log::warn!("Run {} already finished, dropping its output", self.run_id);
            return;
        }
        let value = match (self.output)(replies).await {
            Ok(value) => value,
            Err(err) => {
                let err = match err {
                    OrchestrationError::OutputTransform(_)
                    | OrchestrationError::EmptyHistory => err,
                    other => OrchestrationError::OutputTransform(other.to_string()),
                };
                self.fail(err).await;
                return;
            }
        };

        if self.resolver.complete(value) {
            log::info!(
                "Run {} of '{}' completed after {} turns",
                self.run_id,
                self.name,
                self.turns()
            );
            self.emit(OrchestrationEvent::RunCompleted {
                run_id: self.run_id.clone(),
                orchestration_name: self.name.clone(),
                turns: self.turns(),
            })
            .await;
        } else {
            log::warn!("Run {} already resolved, ignoring completion", self.run_id);
        }
    }

    /// Resolve the run with a terminal failure.
    pub(crate) async fn fail(&self, error: OrchestrationError) {
        let cancelled = error.is_cancelled();
        if !self.resolver.fail(error.clone()) {
            log::warn!(
                "Run {} already resolved, ignoring failure: {}",
                self.run_id,
                error
            );
            return;
        }
        if !cancelled {
            log::error!("Run {} of '{}' failed: {}", self.run_id, self.name, error);
            self.emit(OrchestrationEvent::RunFailed {
                run_id: self.run_id.clone(),
                error: error.to_string(),
            })
            .await;
        }
    }

    /// Turn an actor boundary failure into a run failure.
    pub(crate) async fn fail_from(&self, failure: ActorFailure<OrchestrationError>) {
        let error = match failure {
            ActorFailure::Handler(err) => err,
            ActorFailure::Panicked(msg) => OrchestrationError::Runtime(RuntimeError::Panicked(msg)),
        };
        self.fail(error).await;
    }

    /// Record a reply that arrived after the run finished.
    pub(crate) async fn discard(&self, agent_name: &str) {
        log::warn!(
            "Run {} already finished, discarding reply from '{}'",
            self.run_id,
            agent_name
        );
        self.emit(OrchestrationEvent::ReplyDiscarded {
            run_id: self.run_id.clone(),
            agent_name: agent_name.to_string(),
        })
        .await;
    }
}

/// Resolve a participant name chosen by a manager.
///
/// An exact match wins. Otherwise the name is trimmed, stripped of
/// surrounding quotes and compared case-insensitively; it resolves only if
/// exactly one participant matches.
pub fn resolve_participant<'a, I>(selected: &str, names: I) -> Result<&'a str, OrchestrationError>
where
    I: IntoIterator<Item = &'a str>,
{
    let names: Vec<&'a str> = names.into_iter().collect();
    if let Some(exact) = names.iter().find(|n| **n == selected) {
        return Ok(*exact);
    }

    let normalized = selected
        .trim()
        .trim_matches(|c| c == '"' || c == '\'' || c == '`')
        .trim();
    let lowered = normalized.to_lowercase();
    let mut matches = names.iter().filter(|n| n.to_lowercase() == lowered);
    match (matches.next(), matches.next()) {
        (Some(only), None) => Ok(*only),
        _ => Err(OrchestrationError::UnknownParticipant(selected.to_string())),
    }
}

/// Output transform that deserializes the last reply as JSON.
pub fn json_output_transform<T>(
) -> impl Fn(Vec<ChatMessage>) -> Ready<Result<T, OrchestrationError>> + Send + Sync + 'static
where
    T: DeserializeOwned + Send + 'static,
{
    |replies: Vec<ChatMessage>| {
        let parsed = replies
            .last()
            .ok_or(OrchestrationError::EmptyHistory)
            .and_then(|reply| {
                extract_json::<T>(&reply.content).map_err(OrchestrationError::OutputTransform)
            });
        future::ready(parsed)
    }
}

/// Output transform that asks `agent` to merge every reply into one JSON
/// document of type `T`. `instructions` describes the expected shape.
pub fn structured_output_transform<T>(
    agent: Arc<dyn Agent>,
    instructions: impl Into<String>,
) -> impl Fn(Vec<ChatMessage>) -> BoxFuture<'static, Result<T, OrchestrationError>>
       + Send
       + Sync
       + 'static
where
    T: DeserializeOwned + Send + 'static,
{
    let instructions = instructions.into();
    move |replies: Vec<ChatMessage>| {
        let agent = Arc::clone(&agent);
        let prompt = format!(
            "Combine the following replies into a single JSON object.\n{}\n\
             Respond with the JSON object only.\n\n{}",
            instructions,
            ChatHistory::from(replies).transcript()
        );
        async move {
            let reply = agent
                .invoke(&[ChatMessage::user(prompt)], &InvokeOptions::default())
                .await
                .map_err(|err| OrchestrationError::OutputTransform(err.to_string()))?;
            extract_json::<T>(&reply.content).map_err(OrchestrationError::OutputTransform)
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensemble::agent::FnAgent;

    #[test]
    fn exact_participant_match_wins() {
        let names = ["Writer", "writer"];
        assert_eq!(resolve_participant("writer", names).unwrap(), "writer");
    }

    #[test]
    fn normalized_participant_match_requires_uniqueness() {
        assert_eq!(
            resolve_participant("  \"reviewer\" ", ["Writer", "Reviewer"]).unwrap(),
            "Reviewer"
        );
        assert_eq!(
            resolve_participant("WRITER", ["Writer", "writer"]),
            Err(OrchestrationError::UnknownParticipant("WRITER".into()))
        );
        assert!(resolve_participant("Editor", ["Writer", "Reviewer"]).is_err());
    }

    #[test]
    fn validation_rejects_empty_and_duplicate_members() {
        assert!(matches!(
            OrchestrationBase::new(Vec::new()).validate(),
            Err(OrchestrationError::Configuration(_))
        ));

        let a: Arc<dyn Agent> = Arc::new(FnAgent::text("A", |_| String::new()));
        let b: Arc<dyn Agent> = Arc::new(FnAgent::text("A", |_| String::new()));
        assert!(matches!(
            OrchestrationBase::new(vec![a.clone(), b]).validate(),
            Err(OrchestrationError::Configuration(_))
        ));
        assert!(OrchestrationBase::new(vec![a]).validate().is_ok());
    }

    #[tokio::test]
    async fn json_output_transform_reads_last_reply() {
        let transform = json_output_transform::<Vec<u32>>();
        let value = transform(vec![
            ChatMessage::assistant("A", "ignored"),
            ChatMessage::assistant("B", "[1, 2, 3]"),
        ])
        .await;
        assert_eq!(value.unwrap(), vec![1, 2, 3]);
        assert_eq!(transform(Vec::new()).await, Err(OrchestrationError::EmptyHistory));
    }

    #[test]
    fn task_conversions_produce_user_messages() {
        let task = Task::from("hello");
        assert_eq!(task.messages().len(), 1);
        assert_eq!(&*task.messages()[0].content, "hello");
        let pair = Task::from(vec![ChatMessage::user("a"), ChatMessage::user("b")]);
        assert_eq!(pair.messages().len(), 2);
    }
}
