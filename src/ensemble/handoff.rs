//! Dynamic routing over a directed handoff graph.
//!
//! Exactly one member is active at a time, starting with the first member.
//! The active member sees the running history and is offered two kinds of
//! functions:
//!
//! - `transfer_to_<Target>` for each outgoing edge of the [`HandoffGraph`],
//!   described by the edge's condition,
//! - `complete_task(task_summary)`.
//!
//! Calling a transfer function makes the target active and hands it the next
//! turn; transferring along an edge that does not exist fails the run with
//! [`InvalidHandoff`](OrchestrationError::InvalidHandoff). Calling
//! `complete_task` ends the run with the summary. Any other reply keeps the
//! member active: the human response function (if configured) is asked for
//! the user's answer and the same member takes the next turn.
//!
//! Cycles are allowed. Runaway loops are cut off by
//! [`OrchestrationLimits::max_handoff_turns`](crate::config::OrchestrationLimits).
//!
//! ```rust
//! use ensemble::handoff::HandoffGraph;
//!
//! let graph = HandoffGraph::new()
//!     .add_many(
//!         "Triage",
//!         [
//!             ("Refund", "Transfer here for refund requests"),
//!             ("OrderStatus", "Transfer here for order status questions"),
//!         ],
//!     )
//!     .add("Refund", "Triage", "Transfer back for anything that is not a refund");
//!
//! assert!(graph.has_edge("Triage", "Refund"));
//! assert!(!graph.has_edge("Refund", "OrderStatus"));
//! assert_eq!(graph.targets("Triage").len(), 2);
//! ```

use crate::ensemble::agent::{Agent, FunctionDefinition, InvokeOptions};
use crate::ensemble::cancellation::CancellationToken;
use crate::ensemble::error::OrchestrationError;
use crate::ensemble::event::OrchestrationEvent;
use crate::ensemble::message::{ChatHistory, ChatMessage, ContentItem, Role};
use crate::ensemble::orchestration::{
    Orchestration, OrchestrationBase, OrchestrationBuilder, RunContext, Task, Transforms,
};
use crate::ensemble::result::OrchestrationResult;
use crate::ensemble::runtime::{Actor, ActorContext, ActorFailure, ActorId, Runtime};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

const TRANSFER_PREFIX: &str = "transfer_to_";
const COMPLETE_TASK: &str = "complete_task";

/// A permitted transfer of control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffEdge {
    source: usize,
    target: usize,
    /// When the source should transfer to the target.
    pub description: String,
}

/// Directed graph of permitted transfers, stored as an arena of agent names
/// plus an edge list.
#[derive(Debug, Clone, Default)]
pub struct HandoffGraph {
    nodes: Vec<String>,
    index: HashMap<String, usize>,
    edges: Vec<HandoffEdge>,
}

impl HandoffGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn node(&mut self, name: String) -> usize {
        if let Some(&idx) = self.index.get(&name) {
            return idx;
        }
        let idx = self.nodes.len();
        self.index.insert(name.clone(), idx);
        self.nodes.push(name);
        idx
    }

    /// Allow `source` to transfer to `target`. Adding an existing edge again
    /// replaces its description.
    pub fn add(
        mut self,
        source: impl Into<String>,
        target: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let source = self.node(source.into());
        let target = self.node(target.into());
        let description = description.into();
        match self
            .edges
            .iter_mut()
            .find(|e| e.source == source && e.target == target)
        {
            Some(edge) => edge.description = description,
            None => self.edges.push(HandoffEdge {
                source,
                target,
                description,
            }),
        }
        self
    }

    /// Allow `source` to transfer to each `(target, description)` pair.
    pub fn add_many<T, D>(
        mut self,
        source: impl Into<String>,
        targets: impl IntoIterator<Item = (T, D)>,
    ) -> Self
    where
        T: Into<String>,
        D: Into<String>,
    {
        let source = source.into();
        for (target, description) in targets {
            self = self.add(source.clone(), target, description);
        }
        self
    }

    /// `(target, description)` pairs reachable from `source`, in insertion order.
    pub fn targets(&self, source: &str) -> Vec<(&str, &str)> {
        let Some(&source) = self.index.get(source) else {
            return Vec::new();
        };
        self.edges
            .iter()
            .filter(|e| e.source == source)
            .map(|e| (self.nodes[e.target].as_str(), e.description.as_str()))
            .collect()
    }

    pub fn has_edge(&self, source: &str, target: &str) -> bool {
        match (self.index.get(source), self.index.get(target)) {
            (Some(&s), Some(&t)) => self.edges.iter().any(|e| e.source == s && e.target == t),
            _ => false,
        }
    }

    /// Every agent name mentioned by an edge.
    pub fn node_names(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Functions offered to `source` while it is active.
    fn functions_for(&self, source: &str) -> InvokeOptions {
        let mut options = InvokeOptions::default();
        for (target, description) in self.targets(source) {
            options = options.with_function(FunctionDefinition::new(
                format!("{}{}", TRANSFER_PREFIX, target),
                description,
            ));
        }
        options.with_function(
            FunctionDefinition::new(
                COMPLETE_TASK,
                "Complete the task with a summary when no further action is needed.",
            )
            .with_parameters(serde_json::json!({
                "type": "object",
                "properties": {
                    "task_summary": {"type": "string", "description": "Summary of the completed task"}
                },
                "required": ["task_summary"]
            })),
        )
    }
}

/// Members that pass control to each other along a [`HandoffGraph`].
pub struct HandoffOrchestration<TIn = Task, TOut = ChatMessage> {
    base: OrchestrationBase,
    handoffs: HandoffGraph,
    transforms: Transforms<TIn, TOut>,
}

impl HandoffOrchestration {
    pub fn new(members: Vec<Arc<dyn Agent>>, handoffs: HandoffGraph) -> Self {
        Self {
            base: OrchestrationBase::new(members),
            handoffs,
            transforms: Transforms::last_reply(),
        }
    }
}

impl<TIn, TOut> HandoffOrchestration<TIn, TOut> {
    pub fn with_input_transform<U, F>(self, transform: F) -> HandoffOrchestration<U, TOut>
    where
        F: Fn(U) -> Result<Task, OrchestrationError> + Send + Sync + 'static,
    {
        HandoffOrchestration {
            base: self.base,
            handoffs: self.handoffs,
            transforms: self.transforms.with_input(transform),
        }
    }

    /// Convert the completion summary (passed as a one-element list) into `V`.
    pub fn with_output_transform<V, F, Fut>(self, transform: F) -> HandoffOrchestration<TIn, V>
    where
        F: Fn(Vec<ChatMessage>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, OrchestrationError>> + Send + 'static,
    {
        HandoffOrchestration {
            base: self.base,
            handoffs: self.handoffs,
            transforms: self.transforms.with_output(transform),
        }
    }

    /// Shorthand for overriding only the handoff turn ceiling.
    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.base.limits.max_handoff_turns = max_turns;
        self
    }

    pub fn handoffs(&self) -> &HandoffGraph {
        &self.handoffs
    }

    fn validate_graph(&self) -> Result<(), OrchestrationError> {
        for name in self.handoffs.node_names() {
            if self.base.member(name).is_none() {
                return Err(OrchestrationError::Configuration(format!(
                    "handoff graph references '{}', which is not a member",
                    name
                )));
            }
        }
        Ok(())
    }
}

impl<TIn, TOut> OrchestrationBuilder for HandoffOrchestration<TIn, TOut> {
    fn base(&self) -> &OrchestrationBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OrchestrationBase {
        &mut self.base
    }
}

/// Hands the running history to the newly active member.
struct HandoffRequest {
    history: Vec<ChatMessage>,
    /// Member turns taken so far in this run.
    turn: usize,
}

enum Directive {
    Transfer { call_id: String, target: String },
    Complete { summary: String },
    None,
}

fn directive_of(reply: &ChatMessage) -> Directive {
    for (id, name, arguments) in reply.function_calls() {
        if name == COMPLETE_TASK {
            let summary = arguments
                .get("task_summary")
                .and_then(|s| s.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| reply.content.to_string());
            return Directive::Complete { summary };
        }
        if let Some(target) = name.strip_prefix(TRANSFER_PREFIX) {
            return Directive::Transfer {
                call_id: id.to_string(),
                target: target.to_string(),
            };
        }
    }
    Directive::None
}

struct HandoffActor<TOut> {
    agent: Arc<dyn Agent>,
    options: InvokeOptions,
    /// Actor ids of this member's outgoing edges, keyed by target name.
    targets: HashMap<String, ActorId>,
    max_turns: usize,
    run: Arc<RunContext<TOut>>,
}

#[async_trait]
impl<TOut: Clone + Send + Sync + 'static> Actor for HandoffActor<TOut> {
    type Message = HandoffRequest;
    type Error = OrchestrationError;

    async fn handle(
        &mut self,
        request: HandoffRequest,
        ctx: &ActorContext,
    ) -> Result<(), OrchestrationError> {
        if self.run.is_finished() {
            return Ok(());
        }
        if request.turn >= self.max_turns {
            return Err(OrchestrationError::TurnLimitExceeded(self.max_turns));
        }

        let mut history = request.history;
        let reply = self
            .run
            .invoke_member(self.agent.as_ref(), &history, &self.options)
            .await?;
        if self.run.is_finished() {
            self.run.discard(self.agent.name()).await;
            return Ok(());
        }

        let directive = directive_of(&reply);
        history.push(reply);
        let turn = request.turn + 1;

        match directive {
            Directive::Complete { summary } => {
                log::info!(
                    "Run {}: '{}' completed the task",
                    self.run.run_id,
                    self.agent.name()
                );
                self.run
                    .complete(vec![ChatMessage::assistant(self.agent.name(), summary)])
                    .await;
            }
            Directive::Transfer { call_id, target } => {
                let next = self.targets.get(&target).ok_or_else(|| {
                    OrchestrationError::InvalidHandoff {
                        from: self.agent.name().to_string(),
                        to: target.clone(),
                    }
                })?;
                let function_name = format!("{}{}", TRANSFER_PREFIX, target);
                history.push(
                    ChatMessage::new(Role::Tool, format!("Transferred to {}", target))
                        .with_name(self.agent.name())
                        .with_item(ContentItem::function_result(
                            call_id,
                            function_name,
                            format!("Transferred to {}", target),
                        )),
                );
                log::debug!(
                    "Run {}: handoff {} -> {}",
                    self.run.run_id,
                    self.agent.name(),
                    target
                );
                self.run
                    .emit(OrchestrationEvent::HandoffTransferred {
                        run_id: self.run.run_id.clone(),
                        from: self.agent.name().to_string(),
                        to: target.clone(),
                    })
                    .await;
                ctx.send(next, HandoffRequest { history, turn })?;
            }
            Directive::None => {
                if self.run.has_human_response_function() {
                    let snapshot = ChatHistory::from(history.clone());
                    let answer = self.run.request_human_input(&snapshot).await?;
                    history.push(answer);
                }
                if !self.run.is_finished() {
                    ctx.send(ctx.id(), HandoffRequest { history, turn })?;
                }
            }
        }
        Ok(())
    }

    async fn on_failure(&mut self, failure: ActorFailure<OrchestrationError>, _ctx: &ActorContext) {
        self.run.fail_from(failure).await;
    }
}

#[async_trait]
impl<TIn, TOut> Orchestration for HandoffOrchestration<TIn, TOut>
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
        self.base.validate()?;
        self.validate_graph()?;
        let started = self
            .base
            .start_run(&self.transforms, task.into(), "Handoff", runtime, cancellation)
            .await?;

        started
            .launch(|started| {
                let ids: HashMap<String, ActorId> = self
                    .base
                    .members
                    .iter()
                    .map(|agent| (agent.name().to_string(), started.actor_id(agent.name())))
                    .collect();

                for agent in &self.base.members {
                    let targets = self
                        .handoffs
                        .targets(agent.name())
                        .into_iter()
                        .filter_map(|(target, _)| {
                            ids.get(target).map(|id| (target.to_string(), id.clone()))
                        })
                        .collect();
                    let options = self.handoffs.functions_for(agent.name());
                    let max_turns = self.base.limits.max_handoff_turns;
                    let run = Arc::clone(&started.ctx);
                    let member = Arc::clone(agent);
                    if let Some(id) = ids.get(agent.name()) {
                        started.register(id.clone(), move || HandoffActor {
                            agent: member,
                            options,
                            targets,
                            max_turns,
                            run,
                        })?;
                    }
                }

                let first = self
                    .base
                    .members
                    .first()
                    .and_then(|agent| ids.get(agent.name()))
                    .ok_or_else(|| {
                        OrchestrationError::Configuration(
                            "handoff needs at least one member".to_string(),
                        )
                    })?;
                started.runtime.send(
                    first,
                    HandoffRequest {
                        history: started.task.messages().to_vec(),
                        turn: 0,
                    },
                )?;
                Ok(())
            })
            .await
    }
}
