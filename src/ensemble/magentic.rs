//! Plan, execute and reflect over a team of members.
//!
//! A [`MagenticManager`] drives the run. It first builds a [`TaskLedger`]
//! (known facts plus an ordered plan), then repeats an inner loop:
//!
//! 1. ask the manager for a [`ProgressLedger`] judging the conversation so far,
//! 2. stop with the manager's final answer once the request is satisfied,
//! 3. otherwise hand the next instruction to the member it picked.
//!
//! Rounds in which the manager reports a loop, or no progress, raise a stall
//! counter; productive rounds lower it again. When the counter exceeds
//! [`max_stall_count`](crate::config::OrchestrationLimits::max_stall_count)
//! the manager re-plans from scratch and the member conversation is reset.
//! The run fails with
//! [`PlanningLimitExceeded`](crate::error::OrchestrationError::PlanningLimitExceeded)
//! once it runs out of re-plans or reaches the round ceiling.
//!
//! [`StandardMagenticManager`] implements the manager over any [`Agent`]
//! able to answer in JSON. The engine only owns the ledgers, dispatch and
//! loop control; the reasoning belongs to that agent.

use crate::ensemble::agent::{extract_json, Agent, InvokeOptions};
use crate::ensemble::cancellation::CancellationToken;
use crate::ensemble::config::OrchestrationLimits;
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
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Sender name used for the manager's own messages in the member conversation.
pub const MANAGER_NAME: &str = "MagenticManager";

/// One step of the plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub description: String,
    /// Member expected to carry out the step, if the planner named one.
    #[serde(default)]
    pub assignee: Option<String>,
}

impl PlanStep {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            assignee: None,
        }
    }

    pub fn assigned_to(mut self, assignee: impl Into<String>) -> Self {
        self.assignee = Some(assignee.into());
        self
    }
}

/// What a member contributed in one round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressNote {
    pub agent: String,
    pub summary: String,
}

/// The manager's record of facts and plan for the current planning cycle.
///
/// Progress notes are appended as members reply; a re-plan replaces the whole
/// ledger.
///
/// ```rust
/// use ensemble::magentic::{PlanStep, TaskLedger};
///
/// let mut ledger = TaskLedger::new(
///     vec!["The report is due Friday".into()],
///     vec![PlanStep::new("Collect the figures").assigned_to("Researcher")],
/// );
/// ledger.note("Researcher", "Found Q3 revenue");
///
/// let text = ledger.render();
/// assert!(text.contains("1. Collect the figures (Researcher)"));
/// assert!(text.contains("- Researcher: Found Q3 revenue"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskLedger {
    pub facts: Vec<String>,
    pub plan: Vec<PlanStep>,
    #[serde(default)]
    pub progress: Vec<ProgressNote>,
}

impl TaskLedger {
    pub fn new(facts: Vec<String>, plan: Vec<PlanStep>) -> Self {
        Self {
            facts,
            plan,
            progress: Vec::new(),
        }
    }

    /// Append a progress note.
    pub fn note(&mut self, agent: impl Into<String>, summary: impl Into<String>) {
        self.progress.push(ProgressNote {
            agent: agent.into(),
            summary: summary.into(),
        });
    }

    /// Human-readable form, handed to members and to the reasoning agent.
    pub fn render(&self) -> String {
        let mut out = String::from("Facts:\n");
        if self.facts.is_empty() {
            out.push_str("- (none)\n");
        }
        for fact in &self.facts {
            out.push_str(&format!("- {}\n", fact));
        }
        out.push_str("\nPlan:\n");
        for (i, step) in self.plan.iter().enumerate() {
            match &step.assignee {
                Some(who) => out.push_str(&format!("{}. {} ({})\n", i + 1, step.description, who)),
                None => out.push_str(&format!("{}. {}\n", i + 1, step.description)),
            }
        }
        if !self.progress.is_empty() {
            out.push_str("\nProgress:\n");
            for note in &self.progress {
                out.push_str(&format!("- {}: {}\n", note.agent, note.summary));
            }
        }
        out.trim_end().to_string()
    }
}

/// A single judgement of the progress ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry<T> {
    pub answer: T,
    #[serde(default)]
    pub reason: String,
}

impl<T> LedgerEntry<T> {
    pub fn new(answer: T, reason: impl Into<String>) -> Self {
        Self {
            answer,
            reason: reason.into(),
        }
    }
}

/// The manager's per-round assessment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressLedger {
    pub is_request_satisfied: LedgerEntry<bool>,
    pub is_in_loop: LedgerEntry<bool>,
    pub is_progress_being_made: LedgerEntry<bool>,
    pub next_speaker: LedgerEntry<String>,
    /// Instruction or question for the next speaker.
    #[serde(alias = "instruction_or_question")]
    pub instruction: LedgerEntry<String>,
}

impl ProgressLedger {
    /// `true` when this round counts towards the stall counter.
    pub fn is_stalled(&self) -> bool {
        self.is_in_loop.answer || !self.is_progress_being_made.answer
    }
}

/// What the manager sees when it reasons about the run.
#[derive(Debug, Clone, Default)]
pub struct MagenticContext {
    /// The task messages the run started with.
    pub task: Vec<ChatMessage>,
    /// Member conversation of the current planning cycle.
    pub chat_history: ChatHistory,
    /// `(name, description)` of every member.
    pub participants: Vec<(String, String)>,
    pub round_count: usize,
    pub stall_count: usize,
    pub reset_count: usize,
}

impl MagenticContext {
    /// The task as plain text.
    pub fn task_text(&self) -> String {
        self.task
            .iter()
            .map(|m| m.content.to_string())
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn team(&self) -> String {
        self.participants
            .iter()
            .map(|(name, description)| format!("- {}: {}", name, description))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// The reasoning side of a magentic run.
#[async_trait]
pub trait MagenticManager: Send + Sync {
    /// Build the initial ledger for the task.
    async fn plan(&self, context: &MagenticContext) -> Result<TaskLedger, OrchestrationError>;

    /// Build a fresh ledger after the run stalled under `previous`.
    async fn replan(
        &self,
        context: &MagenticContext,
        previous: &TaskLedger,
    ) -> Result<TaskLedger, OrchestrationError>;

    /// Judge the conversation so far and pick the next speaker.
    async fn create_progress_ledger(
        &self,
        context: &MagenticContext,
        ledger: &TaskLedger,
    ) -> Result<ProgressLedger, OrchestrationError>;

    /// Synthesize the answer returned to the caller.
    async fn prepare_final_answer(
        &self,
        context: &MagenticContext,
        ledger: &TaskLedger,
    ) -> Result<ChatMessage, OrchestrationError>;
}

const PLAN_PROMPT: &str = "You are the manager of a team working on the task below.\n\n\
Task:\n{task}\n\nTeam:\n{team}\n\n\
List the facts that are given or can be verified, then write a short, ordered plan. \
Assign each step to the team member best suited for it, using their descriptions.\n\
Respond with JSON: {\"facts\": [\"...\"], \"plan\": [{\"description\": \"...\", \"assignee\": \"...\"}]}";

const REPLAN_PROMPT: &str = "The team has stalled on the task below.\n\n\
Task:\n{task}\n\nTeam:\n{team}\n\nPrevious ledger:\n{ledger}\n\n\
Update the facts with anything learned so far and write a new plan that avoids the previous mistakes.\n\
Respond with JSON: {\"facts\": [\"...\"], \"plan\": [{\"description\": \"...\", \"assignee\": \"...\"}]}";

const PROGRESS_PROMPT: &str = "Review the conversation so far against the task and the ledger.\n\n\
Task:\n{task}\n\nTeam:\n{team}\n\nLedger:\n{ledger}\n\n\
Answer each question with a value and a short reason:\n\
- is_request_satisfied: has the task been fully addressed?\n\
- is_in_loop: is the team repeating itself?\n\
- is_progress_being_made: did the last rounds move the task forward?\n\
- next_speaker: which team member should act next? Use the exact name.\n\
- instruction: what should that member do next?\n\
Respond with JSON: {\"is_request_satisfied\": {\"answer\": false, \"reason\": \"...\"}, \
\"is_in_loop\": {\"answer\": false, \"reason\": \"...\"}, \
\"is_progress_being_made\": {\"answer\": true, \"reason\": \"...\"}, \
\"next_speaker\": {\"answer\": \"...\", \"reason\": \"...\"}, \
\"instruction\": {\"answer\": \"...\", \"reason\": \"...\"}}";

const FINAL_ANSWER_PROMPT: &str = "The task below is complete.\n\nTask:\n{task}\n\n\
Using the conversation so far, write the final answer for the user.";

#[derive(Deserialize)]
struct PlanDraft {
    #[serde(default)]
    facts: Vec<String>,
    plan: Vec<PlanStep>,
}

/// [`MagenticManager`] backed by a reasoning agent that answers in JSON.
pub struct StandardMagenticManager {
    agent: Arc<dyn Agent>,
}

impl StandardMagenticManager {
    pub fn new(agent: Arc<dyn Agent>) -> Self {
        Self { agent }
    }

    fn fill(template: &str, context: &MagenticContext, ledger: Option<&TaskLedger>) -> String {
        template
            .replace("{task}", &context.task_text())
            .replace("{team}", &context.team())
            .replace("{ledger}", &ledger.map(TaskLedger::render).unwrap_or_default())
    }

    async fn ask_text(
        &self,
        context: &MagenticContext,
        prompt: String,
    ) -> Result<String, OrchestrationError> {
        let mut messages = context.chat_history.messages().to_vec();
        messages.push(ChatMessage::user(prompt));
        let reply = self
            .agent
            .invoke(&messages, &InvokeOptions::default())
            .await
            .map_err(|err| OrchestrationError::agent(self.agent.name(), err))?;
        Ok(reply.content.to_string())
    }

    async fn ask_json<T: DeserializeOwned>(
        &self,
        context: &MagenticContext,
        prompt: String,
    ) -> Result<T, OrchestrationError> {
        let text = self.ask_text(context, prompt).await?;
        extract_json::<T>(&text).map_err(OrchestrationError::StructuredOutput)
    }
}

#[async_trait]
impl MagenticManager for StandardMagenticManager {
    async fn plan(&self, context: &MagenticContext) -> Result<TaskLedger, OrchestrationError> {
        let draft: PlanDraft = self
            .ask_json(context, Self::fill(PLAN_PROMPT, context, None))
            .await?;
        Ok(TaskLedger::new(draft.facts, draft.plan))
    }

    async fn replan(
        &self,
        context: &MagenticContext,
        previous: &TaskLedger,
    ) -> Result<TaskLedger, OrchestrationError> {
        let draft: PlanDraft = self
            .ask_json(context, Self::fill(REPLAN_PROMPT, context, Some(previous)))
            .await?;
        Ok(TaskLedger::new(draft.facts, draft.plan))
    }

    async fn create_progress_ledger(
        &self,
        context: &MagenticContext,
        ledger: &TaskLedger,
    ) -> Result<ProgressLedger, OrchestrationError> {
        self.ask_json(context, Self::fill(PROGRESS_PROMPT, context, Some(ledger)))
            .await
    }

    async fn prepare_final_answer(
        &self,
        context: &MagenticContext,
        _ledger: &TaskLedger,
    ) -> Result<ChatMessage, OrchestrationError> {
        let answer = self
            .ask_text(context, Self::fill(FINAL_ANSWER_PROMPT, context, None))
            .await?;
        Ok(ChatMessage::assistant(MANAGER_NAME, answer))
    }
}

/// Members coordinated by a [`MagenticManager`].
pub struct MagenticOrchestration<TIn = Task, TOut = ChatMessage> {
    base: OrchestrationBase,
    manager: Arc<dyn MagenticManager>,
    transforms: Transforms<TIn, TOut>,
}

impl MagenticOrchestration {
    pub fn new(members: Vec<Arc<dyn Agent>>, manager: Arc<dyn MagenticManager>) -> Self {
        Self {
            base: OrchestrationBase::new(members),
            manager,
            transforms: Transforms::last_reply(),
        }
    }
}

impl<TIn, TOut> MagenticOrchestration<TIn, TOut> {
    pub fn with_input_transform<U, F>(self, transform: F) -> MagenticOrchestration<U, TOut>
    where
        F: Fn(U) -> Result<Task, OrchestrationError> + Send + Sync + 'static,
    {
        MagenticOrchestration {
            base: self.base,
            manager: self.manager,
            transforms: self.transforms.with_input(transform),
        }
    }

    /// Convert the final answer (passed as a one-element list) into `V`.
    pub fn with_output_transform<V, F, Fut>(self, transform: F) -> MagenticOrchestration<TIn, V>
    where
        F: Fn(Vec<ChatMessage>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, OrchestrationError>> + Send + 'static,
    {
        MagenticOrchestration {
            base: self.base,
            manager: self.manager,
            transforms: self.transforms.with_output(transform),
        }
    }
}

impl<TIn, TOut> OrchestrationBuilder for MagenticOrchestration<TIn, TOut> {
    fn base(&self) -> &OrchestrationBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OrchestrationBase {
        &mut self.base
    }
}

enum MagenticMessage {
    Start(Vec<ChatMessage>),
    Reply(ChatMessage),
}

struct MagenticTurn {
    history: Vec<ChatMessage>,
}

struct MagenticManagerActor<TOut> {
    manager: Arc<dyn MagenticManager>,
    agents: HashMap<String, ActorId>,
    context: MagenticContext,
    ledger: TaskLedger,
    limits: OrchestrationLimits,
    run: Arc<RunContext<TOut>>,
}

impl<TOut: Clone + Send + Sync + 'static> MagenticManagerActor<TOut> {
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

    /// Install a ledger and restart the member conversation from the task.
    async fn adopt(&mut self, ledger: TaskLedger) {
        self.ledger = ledger;
        self.context.chat_history = ChatHistory::from(self.context.task.clone());
        self.context
            .chat_history
            .push(ChatMessage::assistant(MANAGER_NAME, self.ledger.render()));
        log::info!(
            "Run {}: ledger with {} plan steps (re-plans: {})",
            self.run.run_id,
            self.ledger.plan.len(),
            self.context.reset_count
        );
        self.run
            .emit(OrchestrationEvent::LedgerUpdated {
                run_id: self.run.run_id.clone(),
                plan_steps: self.ledger.plan.len(),
                reset_count: self.context.reset_count,
            })
            .await;
    }

    /// Run rounds until a member is dispatched or the run resolves.
    async fn next_round(&mut self, ctx: &ActorContext) -> Result<(), OrchestrationError> {
        loop {
            if self.run.is_finished() {
                return Ok(());
            }
            self.context.round_count += 1;
            if self.context.round_count > self.limits.max_magentic_rounds {
                return Err(OrchestrationError::PlanningLimitExceeded(
                    self.limits.max_magentic_rounds,
                ));
            }

            let progress = self
                .manager
                .create_progress_ledger(&self.context, &self.ledger)
                .await?;
            self.decided(
                "is_request_satisfied",
                progress.is_request_satisfied.answer.to_string(),
                &progress.is_request_satisfied.reason,
            )
            .await;

            if progress.is_request_satisfied.answer {
                let answer = self
                    .manager
                    .prepare_final_answer(&self.context, &self.ledger)
                    .await?;
                self.run.complete(vec![answer]).await;
                return Ok(());
            }

            if progress.is_stalled() {
                self.context.stall_count += 1;
            } else {
                self.context.stall_count = self.context.stall_count.saturating_sub(1);
            }

            if self.context.stall_count > self.limits.max_stall_count {
                if self.context.reset_count >= self.limits.max_reset_count {
                    return Err(OrchestrationError::PlanningLimitExceeded(
                        self.limits.max_reset_count,
                    ));
                }
                self.context.reset_count += 1;
                self.context.stall_count = 0;
                log::warn!(
                    "Run {}: stalled, re-planning ({}/{})",
                    self.run.run_id,
                    self.context.reset_count,
                    self.limits.max_reset_count
                );
                let ledger = self.manager.replan(&self.context, &self.ledger).await?;
                self.adopt(ledger).await;
                continue;
            }

            self.decided(
                "next_speaker",
                progress.next_speaker.answer.clone(),
                &progress.next_speaker.reason,
            )
            .await;
            let name = resolve_participant(
                &progress.next_speaker.answer,
                self.context.participants.iter().map(|(name, _)| name.as_str()),
            )?;
            let target = self.agents.get(name).ok_or_else(|| {
                OrchestrationError::UnknownParticipant(progress.next_speaker.answer.clone())
            })?;

            if self.run.is_finished() {
                return Ok(());
            }
            self.context.chat_history.push(ChatMessage::assistant(
                MANAGER_NAME,
                progress.instruction.answer.clone(),
            ));
            ctx.send(
                target,
                MagenticTurn {
                    history: self.context.chat_history.messages().to_vec(),
                },
            )?;
            return Ok(());
        }
    }
}

#[async_trait]
impl<TOut: Clone + Send + Sync + 'static> Actor for MagenticManagerActor<TOut> {
    type Message = MagenticMessage;
    type Error = OrchestrationError;

    async fn handle(
        &mut self,
        message: MagenticMessage,
        ctx: &ActorContext,
    ) -> Result<(), OrchestrationError> {
        match message {
            MagenticMessage::Start(task) => {
                self.context.task = task;
                self.context.chat_history = ChatHistory::from(self.context.task.clone());
                let ledger = self.manager.plan(&self.context).await?;
                self.adopt(ledger).await;
            }
            MagenticMessage::Reply(reply) => {
                let sender = reply.name.clone().unwrap_or_default();
                if self.run.is_finished() {
                    self.run.discard(&sender).await;
                    return Ok(());
                }
                self.ledger.note(sender, reply.content.to_string());
                self.context.chat_history.push(reply);
            }
        }
        self.next_round(ctx).await
    }

    async fn on_failure(&mut self, failure: ActorFailure<OrchestrationError>, _ctx: &ActorContext) {
        self.run.fail_from(failure).await;
    }
}

struct MagenticMemberActor<TOut> {
    agent: Arc<dyn Agent>,
    manager: ActorId,
    run: Arc<RunContext<TOut>>,
}

#[async_trait]
impl<TOut: Clone + Send + Sync + 'static> Actor for MagenticMemberActor<TOut> {
    type Message = MagenticTurn;
    type Error = OrchestrationError;

    async fn handle(
        &mut self,
        turn: MagenticTurn,
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
        ctx.send(&self.manager, MagenticMessage::Reply(reply))?;
        Ok(())
    }

    async fn on_failure(&mut self, failure: ActorFailure<OrchestrationError>, _ctx: &ActorContext) {
        self.run.fail_from(failure).await;
    }
}

#[async_trait]
impl<TIn, TOut> Orchestration for MagenticOrchestration<TIn, TOut>
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
            .start_run(&self.transforms, task.into(), "Magentic", runtime, cancellation)
            .await?;

        started
            .launch(|started| {
                let manager_id = started.controller_id("magentic_manager");
                let mut agents = HashMap::new();
                for agent in &self.base.members {
                    let id = started.actor_id(agent.name());
                    let agent = Arc::clone(agent);
                    let manager = manager_id.clone();
                    let run = Arc::clone(&started.ctx);
                    agents.insert(agent.name().to_string(), id.clone());
                    started.register(id, move || MagenticMemberActor { agent, manager, run })?;
                }

                let manager = Arc::clone(&self.manager);
                let context = MagenticContext {
                    participants: self.base.participants(),
                    ..MagenticContext::default()
                };
                let limits = self.base.limits;
                let run = Arc::clone(&started.ctx);
                started.register(manager_id.clone(), move || MagenticManagerActor {
                    manager,
                    agents,
                    context,
                    ledger: TaskLedger::default(),
                    limits,
                    run,
                })?;

                let task = started.task.messages().to_vec();
                started.runtime.send(&manager_id, MagenticMessage::Start(task))?;
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_ledger_accepts_instruction_or_question() {
        let json = r#"{
            "is_request_satisfied": {"answer": false, "reason": "not yet"},
            "is_in_loop": {"answer": false},
            "is_progress_being_made": {"answer": true, "reason": "new data"},
            "next_speaker": {"answer": "Coder", "reason": "needs code"},
            "instruction_or_question": {"answer": "Write the script", "reason": ""}
        }"#;
        let ledger: ProgressLedger = extract_json(json).unwrap();
        assert_eq!(ledger.next_speaker.answer, "Coder");
        assert_eq!(ledger.instruction.answer, "Write the script");
        assert!(!ledger.is_stalled());
    }

    #[test]
    fn looping_or_stuck_rounds_count_as_stalled() {
        let ledger = |in_loop: bool, progressing: bool| ProgressLedger {
            is_request_satisfied: LedgerEntry::new(false, ""),
            is_in_loop: LedgerEntry::new(in_loop, ""),
            is_progress_being_made: LedgerEntry::new(progressing, ""),
            next_speaker: LedgerEntry::new("A".to_string(), ""),
            instruction: LedgerEntry::new("go".to_string(), ""),
        };
        assert!(ledger(true, true).is_stalled());
        assert!(ledger(false, false).is_stalled());
        assert!(!ledger(false, true).is_stalled());
    }

    #[test]
    fn empty_ledger_renders_placeholder_facts() {
        let rendered = TaskLedger::new(Vec::new(), vec![PlanStep::new("Answer")]).render();
        assert_eq!(rendered, "Facts:\n- (none)\n\nPlan:\n1. Answer");
    }

    #[test]
    fn prompts_include_task_and_team() {
        let context = MagenticContext {
            task: vec![ChatMessage::user("Compare two databases")],
            participants: vec![("Researcher".into(), "Finds facts".into())],
            ..MagenticContext::default()
        };
        let prompt = StandardMagenticManager::fill(PLAN_PROMPT, &context, None);
        assert!(prompt.contains("Compare two databases"));
        assert!(prompt.contains("- Researcher: Finds facts"));
    }
}
