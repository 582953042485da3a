//! Turn-based group discussion driven by a pluggable manager.
//!
//! A manager actor owns the shared [`ChatHistory`]. After every message
//! appended to it (the task included) the [`GroupChatManager`] is asked, in
//! order:
//!
//! 1. [`should_request_user_input`](GroupChatManager::should_request_user_input):
//!    if so, the human response function is called and its reply appended.
//!    A run without a human response function fails with
//!    [`MissingHumanInputHandler`](OrchestrationError::MissingHumanInputHandler).
//! 2. [`should_terminate`](GroupChatManager::should_terminate): if so,
//!    [`filter_results`](GroupChatManager::filter_results) produces the final
//!    message and the run completes.
//! 3. [`select_next_agent`](GroupChatManager::select_next_agent): the chosen
//!    member receives a snapshot of the history and its reply is appended.
//!
//! ```text
//! SelectNext ──(user input needed)──> RequestUserInput ──> SelectNext
//!     │
//!     └──(should_terminate)──> Terminated
//! ```
//!
//! Two managers ship with the crate: [`RoundRobinGroupChatManager`] and the
//! LLM-backed [`ModelDrivenGroupChatManager`].

use crate::ensemble::agent::{extract_json, Agent, InvokeOptions};
use crate::ensemble::cancellation::CancellationToken;
use crate::ensemble::error::OrchestrationError;
use crate::ensemble::event::OrchestrationEvent;
use crate::ensemble::message::{ChatHistory, ChatMessage};
use crate::ensemble::orchestration::{
    resolve_participant, Orchestration, OrchestrationBase, OrchestrationBuilder, RunContext, Task,
    Transforms,
};
use crate::ensemble::result::OrchestrationResult;
use crate::ensemble::runtime::{Actor, ActorContext, ActorFailure, ActorId, Runtime};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// A yes/no decision with the manager's reasoning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BooleanResult {
    pub result: bool,
    #[serde(default)]
    pub reason: String,
}

impl BooleanResult {
    pub fn new(result: bool, reason: impl Into<String>) -> Self {
        Self {
            result,
            reason: reason.into(),
        }
    }
}

/// A textual decision (e.g. a participant name) with the manager's reasoning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StringResult {
    pub result: String,
    #[serde(default)]
    pub reason: String,
}

impl StringResult {
    pub fn new(result: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            result: result.into(),
            reason: reason.into(),
        }
    }
}

/// The final message of a discussion with the manager's reasoning.
#[derive(Debug, Clone)]
pub struct MessageResult {
    pub result: ChatMessage,
    pub reason: String,
}

/// Phase of the group chat state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupChatPhase {
    SelectNext,
    RequestUserInput,
    Terminated,
}

/// What a manager sees when it makes a decision.
#[derive(Debug, Clone, Default)]
pub struct GroupChatState {
    pub history: ChatHistory,
    /// Number of member turns dispatched so far.
    pub round_count: usize,
    pub max_rounds: Option<usize>,
}

impl GroupChatState {
    /// Terminate once `round_count` reaches `max_rounds`.
    pub fn round_limit(&self) -> BooleanResult {
        match self.max_rounds {
            Some(max) if self.round_count >= max => {
                BooleanResult::new(true, format!("Maximum number of rounds ({}) reached.", max))
            }
            _ => BooleanResult::new(false, "The maximum number of rounds has not been reached."),
        }
    }
}

/// Policy that drives a group chat.
///
/// Managers are stateless with respect to a run: everything they need is in
/// the [`GroupChatState`], so one manager can serve many runs.
#[async_trait]
pub trait GroupChatManager: Send + Sync {
    /// Round ceiling, if any.
    fn max_rounds(&self) -> Option<usize> {
        None
    }

    async fn should_request_user_input(
        &self,
        _state: &GroupChatState,
    ) -> Result<BooleanResult, OrchestrationError> {
        Ok(BooleanResult::new(false, "No user input is required."))
    }

    /// Defaults to [`GroupChatState::round_limit`].
    async fn should_terminate(
        &self,
        state: &GroupChatState,
    ) -> Result<BooleanResult, OrchestrationError> {
        Ok(state.round_limit())
    }

    /// Pick the next speaker from `(name, description)` pairs.
    async fn select_next_agent(
        &self,
        state: &GroupChatState,
        participants: &[(String, String)],
    ) -> Result<StringResult, OrchestrationError>;

    /// Produce the run's final message. Defaults to the last message.
    async fn filter_results(
        &self,
        state: &GroupChatState,
    ) -> Result<MessageResult, OrchestrationError> {
        let last = state.history.last().ok_or(OrchestrationError::EmptyHistory)?;
        Ok(MessageResult {
            result: last.clone(),
            reason: "The last message in the chat history.".to_string(),
        })
    }
}

type UserInputPredicate = Arc<dyn Fn(&GroupChatState) -> bool + Send + Sync>;

/// Cycles through members in list order.
///
/// ```rust
/// use ensemble::group_chat::RoundRobinGroupChatManager;
///
/// // Ask the user for input whenever the reviewer has spoken.
/// let manager = RoundRobinGroupChatManager::new()
///     .with_max_rounds(5)
///     .with_user_input_when(|state| {
///         state.history.last().and_then(|m| m.name.as_deref()) == Some("Reviewer")
///     });
/// ```
#[derive(Clone, Default)]
pub struct RoundRobinGroupChatManager {
    max_rounds: Option<usize>,
    user_input_when: Option<UserInputPredicate>,
}

impl RoundRobinGroupChatManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = Some(max_rounds);
        self
    }

    /// Request user input whenever `predicate` holds.
    pub fn with_user_input_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&GroupChatState) -> bool + Send + Sync + 'static,
    {
        self.user_input_when = Some(Arc::new(predicate));
        self
    }
}

#[async_trait]
impl GroupChatManager for RoundRobinGroupChatManager {
    fn max_rounds(&self) -> Option<usize> {
        self.max_rounds
    }

    async fn should_request_user_input(
        &self,
        state: &GroupChatState,
    ) -> Result<BooleanResult, OrchestrationError> {
        Ok(match &self.user_input_when {
            Some(predicate) if predicate(state) => {
                BooleanResult::new(true, "User input requested by the configured predicate.")
            }
            _ => BooleanResult::new(false, "No user input is required."),
        })
    }

    async fn select_next_agent(
        &self,
        state: &GroupChatState,
        participants: &[(String, String)],
    ) -> Result<StringResult, OrchestrationError> {
        if participants.is_empty() {
            return Err(OrchestrationError::Configuration(
                "group chat has no participants".to_string(),
            ));
        }
        let (name, _) = &participants[state.round_count % participants.len()];
        Ok(StringResult::new(name.clone(), "Round-robin turn."))
    }
}

const TERMINATION_PROMPT: &str = "You are a mediator guiding a discussion on the topic '{topic}'. \
You need to determine whether the discussion has reached a conclusion. \
If you would like to end the discussion, answer true. Otherwise answer false.";

const SELECTION_PROMPT: &str = "You are a mediator guiding a discussion on the topic '{topic}'. \
You need to select the next participant to speak. \
Here are the names and descriptions of the participants:\n{participants}\n\
Answer with the name of the participant you would like to select, exactly as written.";

const USER_INPUT_PROMPT: &str = "You are a mediator guiding a discussion on the topic '{topic}'. \
You need to determine whether the discussion needs input from the user before it continues. \
Answer true if it does. Otherwise answer false.";

const RESULT_FILTER_PROMPT: &str = "You are a mediator guiding a discussion on the topic '{topic}'. \
You have just concluded the discussion. \
Please summarize the discussion and provide a closing statement.";

const STRUCTURED_OUTPUT_HINT: &str =
    "Respond only with a JSON object of the form {\"result\": <answer>, \"reason\": \"<why>\"}.";

/// Delegates every decision to a policy agent that answers in JSON.
///
/// If `max_rounds` is set it is checked before the policy agent is asked, so
/// whichever condition triggers first ends the discussion.
pub struct ModelDrivenGroupChatManager {
    agent: Arc<dyn Agent>,
    topic: String,
    max_rounds: Option<usize>,
    ask_for_user_input: bool,
}

impl ModelDrivenGroupChatManager {
    pub fn new(agent: Arc<dyn Agent>, topic: impl Into<String>) -> Self {
        Self {
            agent,
            topic: topic.into(),
            max_rounds: None,
            ask_for_user_input: false,
        }
    }

    pub fn with_max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = Some(max_rounds);
        self
    }

    /// Also let the policy agent decide when user input is needed.
    pub fn with_user_input(mut self, enabled: bool) -> Self {
        self.ask_for_user_input = enabled;
        self
    }

    fn render(&self, template: &str, participants: &[(String, String)]) -> String {
        let listing = participants
            .iter()
            .map(|(name, description)| format!("{}: {}", name, description))
            .collect::<Vec<_>>()
            .join("\n");
        template
            .replace("{topic}", &self.topic)
            .replace("{participants}", &listing)
    }

    async fn ask<T: serde::de::DeserializeOwned>(
        &self,
        state: &GroupChatState,
        prompt: String,
        question: &str,
    ) -> Result<T, OrchestrationError> {
        let mut messages = state.history.messages().to_vec();
        messages.push(ChatMessage::user(question));
        let options = InvokeOptions::default()
            .with_instructions(format!("{}\n{}", prompt, STRUCTURED_OUTPUT_HINT));
        let reply = self
            .agent
            .invoke(&messages, &options)
            .await
            .map_err(|err| OrchestrationError::agent(self.agent.name(), err))?;
        extract_json::<T>(&reply.content).map_err(OrchestrationError::StructuredOutput)
    }
}

#[async_trait]
impl GroupChatManager for ModelDrivenGroupChatManager {
    fn max_rounds(&self) -> Option<usize> {
        self.max_rounds
    }

    async fn should_request_user_input(
        &self,
        state: &GroupChatState,
    ) -> Result<BooleanResult, OrchestrationError> {
        if !self.ask_for_user_input {
            return Ok(BooleanResult::new(false, "This manager does not request user input."));
        }
        self.ask(
            state,
            self.render(USER_INPUT_PROMPT, &[]),
            "Determine if the user should be asked for input.",
        )
        .await
    }

    async fn should_terminate(
        &self,
        state: &GroupChatState,
    ) -> Result<BooleanResult, OrchestrationError> {
        let limit = state.round_limit();
        if limit.result {
            return Ok(limit);
        }
        self.ask(
            state,
            self.render(TERMINATION_PROMPT, &[]),
            "Determine if the discussion should end.",
        )
        .await
    }

    async fn select_next_agent(
        &self,
        state: &GroupChatState,
        participants: &[(String, String)],
    ) -> Result<StringResult, OrchestrationError> {
        self.ask(
            state,
            self.render(SELECTION_PROMPT, participants),
            "Now select the next participant to speak.",
        )
        .await
    }

    async fn filter_results(
        &self,
        state: &GroupChatState,
    ) -> Result<MessageResult, OrchestrationError> {
        if state.history.is_empty() {
            return Err(OrchestrationError::EmptyHistory);
        }
        let summary: StringResult = self
            .ask(
                state,
                self.render(RESULT_FILTER_PROMPT, &[]),
                "Please summarize the discussion.",
            )
            .await?;
        Ok(MessageResult {
            result: ChatMessage::assistant(self.agent.name(), summary.result),
            reason: summary.reason,
        })
    }
}

/// Turn-based discussion among members, steered by a [`GroupChatManager`].
pub struct GroupChatOrchestration<TIn = Task, TOut = ChatMessage> {
    base: OrchestrationBase,
    manager: Arc<dyn GroupChatManager>,
    transforms: Transforms<TIn, TOut>,
}

impl GroupChatOrchestration {
    pub fn new(members: Vec<Arc<dyn Agent>>, manager: Arc<dyn GroupChatManager>) -> Self {
        Self {
            base: OrchestrationBase::new(members),
            manager,
            transforms: Transforms::last_reply(),
        }
    }
}

impl<TIn, TOut> GroupChatOrchestration<TIn, TOut> {
    pub fn with_input_transform<U, F>(self, transform: F) -> GroupChatOrchestration<U, TOut>
    where
        F: Fn(U) -> Result<Task, OrchestrationError> + Send + Sync + 'static,
    {
        GroupChatOrchestration {
            base: self.base,
            manager: self.manager,
            transforms: self.transforms.with_input(transform),
        }
    }

    /// Convert the filtered result (passed as a one-element list) into `V`.
    pub fn with_output_transform<V, F, Fut>(self, transform: F) -> GroupChatOrchestration<TIn, V>
    where
        F: Fn(Vec<ChatMessage>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, OrchestrationError>> + Send + 'static,
    {
        GroupChatOrchestration {
            base: self.base,
            manager: self.manager,
            transforms: self.transforms.with_output(transform),
        }
    }
}

impl<TIn, TOut> OrchestrationBuilder for GroupChatOrchestration<TIn, TOut> {
    fn base(&self) -> &OrchestrationBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OrchestrationBase {
        &mut self.base
    }
}

enum ManagerMessage {
    Start(Vec<ChatMessage>),
    Reply(ChatMessage),
}

struct GroupChatTurn {
    history: Vec<ChatMessage>,
}

struct ManagerActor<TOut> {
    manager: Arc<dyn GroupChatManager>,
    participants: Vec<(String, String)>,
    agents: HashMap<String, ActorId>,
    state: GroupChatState,
    phase: GroupChatPhase,
    run: Arc<RunContext<TOut>>,
}

impl<TOut: Clone + Send + Sync + 'static> ManagerActor<TOut> {
    async fn enter(&mut self, phase: GroupChatPhase) {
        if self.phase != phase {
            self.phase = phase;
            self.run
                .emit(OrchestrationEvent::GroupChatPhaseChanged {
                    run_id: self.run.run_id.clone(),
                    phase,
                })
                .await;
        }
    }

    async fn decided(&self, decision: &str, result: String, reason: &str) {
        log::debug!(
            "Run {}: {} -> {} ({})",
            self.run.run_id,
            decision,
            result,
            reason
        );
        self.run
            .emit(OrchestrationEvent::ManagerDecision {
                run_id: self.run.run_id.clone(),
                decision: decision.to_string(),
                result,
                reason: reason.to_string(),
            })
            .await;
    }

    /// Evaluate the decision points after a new message and take the next action.
    async fn advance(&mut self, ctx: &ActorContext) -> Result<(), OrchestrationError> {
        if self.run.is_finished() {
            return Ok(());
        }

        let user_input = self.manager.should_request_user_input(&self.state).await?;
        self.decided(
            "should_request_user_input",
            user_input.result.to_string(),
            &user_input.reason,
        )
        .await;
        if user_input.result {
            self.enter(GroupChatPhase::RequestUserInput).await;
            let reply = self.run.request_human_input(&self.state.history).await?;
            if self.run.is_finished() {
                return Ok(());
            }
            self.state.history.push(reply);
        }

        let terminate = self.manager.should_terminate(&self.state).await?;
        self.decided(
            "should_terminate",
            terminate.result.to_string(),
            &terminate.reason,
        )
        .await;
        if terminate.result {
            self.enter(GroupChatPhase::Terminated).await;
            let filtered = self.manager.filter_results(&self.state).await?;
            self.decided("filter_results", filtered.result.content.to_string(), &filtered.reason)
                .await;
            self.run.complete(vec![filtered.result]).await;
            return Ok(());
        }

        self.enter(GroupChatPhase::SelectNext).await;
        let selection = self
            .manager
            .select_next_agent(&self.state, &self.participants)
            .await?;
        self.decided("select_next_agent", selection.result.clone(), &selection.reason)
            .await;
        let name = resolve_participant(
            &selection.result,
            self.participants.iter().map(|(name, _)| name.as_str()),
        )?;
        let target = self
            .agents
            .get(name)
            .ok_or_else(|| OrchestrationError::UnknownParticipant(selection.result.clone()))?;

        if self.run.is_finished() {
            return Ok(());
        }
        self.state.round_count += 1;
        ctx.send(
            target,
            GroupChatTurn {
                history: self.state.history.messages().to_vec(),
            },
        )?;
        Ok(())
    }
}

#[async_trait]
impl<TOut: Clone + Send + Sync + 'static> Actor for ManagerActor<TOut> {
    type Message = ManagerMessage;
    type Error = OrchestrationError;

    async fn handle(
        &mut self,
        message: ManagerMessage,
        ctx: &ActorContext,
    ) -> Result<(), OrchestrationError> {
        match message {
            ManagerMessage::Start(task) => {
                self.state.history.extend(task);
                self.run
                    .emit(OrchestrationEvent::GroupChatPhaseChanged {
                        run_id: self.run.run_id.clone(),
                        phase: self.phase,
                    })
                    .await;
            }
            ManagerMessage::Reply(reply) => {
                if self.run.is_finished() {
                    let sender = reply.name.clone().unwrap_or_default();
                    self.run.discard(&sender).await;
                    return Ok(());
                }
                self.state.history.push(reply);
            }
        }
        self.advance(ctx).await
    }

    async fn on_failure(&mut self, failure: ActorFailure<OrchestrationError>, _ctx: &ActorContext) {
        self.run.fail_from(failure).await;
    }
}

struct ParticipantActor<TOut> {
    agent: Arc<dyn Agent>,
    manager: ActorId,
    run: Arc<RunContext<TOut>>,
}

#[async_trait]
impl<TOut: Clone + Send + Sync + 'static> Actor for ParticipantActor<TOut> {
    type Message = GroupChatTurn;
    type Error = OrchestrationError;

    async fn handle(
        &mut self,
        turn: GroupChatTurn,
        ctx: &ActorContext,
    ) -> Result<(), OrchestrationError> {
        if self.run.is_finished() {
            return Ok(());
        }
        let reply = self
            .run
            .invoke_member(self.agent.as_ref(), &turn.history, &InvokeOptions::default())
            .await?;
        if self.run.is_finished() {
            self.run.discard(self.agent.name()).await;
            return Ok(());
        }
        ctx.send(&self.manager, ManagerMessage::Reply(reply))?;
        Ok(())
    }

    async fn on_failure(&mut self, failure: ActorFailure<OrchestrationError>, _ctx: &ActorContext) {
        self.run.fail_from(failure).await;
    }
}

#[async_trait]
impl<TIn, TOut> Orchestration for GroupChatOrchestration<TIn, TOut>
where
    TIn: Send + 'static,
    TOut: Clone + Send + Sync + 'static,
{
    type Input = TIn;
    type Output = TOut;

    async fn invoke<I>(
        &self,
        task: I,
        runtime: &Runtime,
        cancellation: Option<CancellationToken>,
    ) -> Result<OrchestrationResult<TOut>, OrchestrationError>
    where
        I: Into<TIn> + Send,
    {
        let started = self
            .base
            .start_run(&self.transforms, task.into(), "GroupChat", runtime, cancellation)
            .await?;

        started
            .launch(|started| {
                let manager_id = started.controller_id("group_chat_manager");
                let mut agents = HashMap::new();
                for agent in &self.base.members {
                    let id = started.actor_id(agent.name());
                    let agent = Arc::clone(agent);
                    let manager = manager_id.clone();
                    let run = Arc::clone(&started.ctx);
                    agents.insert(agent.name().to_string(), id.clone());
                    started.register(id, move || ParticipantActor { agent, manager, run })?;
                }

                let manager = Arc::clone(&self.manager);
                let participants = self.base.participants();
                let run = Arc::clone(&started.ctx);
                let state = GroupChatState {
                    history: ChatHistory::new(),
                    round_count: 0,
                    max_rounds: manager.max_rounds(),
                };
                started.register(manager_id.clone(), move || ManagerActor {
                    manager,
                    participants,
                    agents,
                    state,
                    phase: GroupChatPhase::SelectNext,
                    run,
                })?;

                let task = started.task.messages().to_vec();
                started.runtime.send(&manager_id, ManagerMessage::Start(task))?;
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_limit_triggers_at_max_rounds() {
        let mut state = GroupChatState {
            max_rounds: Some(2),
            ..GroupChatState::default()
        };
        state.round_count = 1;
        assert!(!state.round_limit().result);
        state.round_count = 2;
        assert!(state.round_limit().result);
        assert!(!GroupChatState::default().round_limit().result);
    }

    #[tokio::test]
    async fn round_robin_cycles_in_member_order() {
        let manager = RoundRobinGroupChatManager::new();
        let participants = vec![
            ("Writer".to_string(), String::new()),
            ("Reviewer".to_string(), String::new()),
        ];
        let mut state = GroupChatState::default();
        let mut picks = Vec::new();
        for round in 0..3 {
            state.round_count = round;
            picks.push(manager.select_next_agent(&state, &participants).await.unwrap().result);
        }
        assert_eq!(picks, vec!["Writer", "Reviewer", "Writer"]);
    }

    #[tokio::test]
    async fn default_filter_rejects_empty_history() {
        let manager = RoundRobinGroupChatManager::new();
        let err = manager.filter_results(&GroupChatState::default()).await.unwrap_err();
        assert_eq!(err, OrchestrationError::EmptyHistory);
    }

    #[test]
    fn structured_results_deserialize_without_reason() {
        let parsed: BooleanResult = serde_json::from_str(r#"{"result": true}"#).unwrap();
        assert!(parsed.result);
        assert!(parsed.reason.is_empty());
    }
}
