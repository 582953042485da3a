//! Fan-out / fan-in topology.
//!
//! Every member receives its own copy of the task at the same time. Replies
//! are collected by a collector actor in arrival order; once every member has
//! replied the output transform reduces them to the run's value. The default
//! output is the list of replies itself.

use crate::ensemble::agent::{Agent, InvokeOptions};
use crate::ensemble::cancellation::CancellationToken;
use crate::ensemble::error::OrchestrationError;
use crate::ensemble::message::ChatMessage;
use crate::ensemble::orchestration::{
    Orchestration, OrchestrationBase, OrchestrationBuilder, RunContext, Task, Transforms,
};
use crate::ensemble::result::OrchestrationResult;
use crate::ensemble::runtime::{Actor, ActorContext, ActorFailure, ActorId, Runtime};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

/// Runs all members in parallel on the same task.
pub struct ConcurrentOrchestration<TIn = Task, TOut = Vec<ChatMessage>> {
    base: OrchestrationBase,
    transforms: Transforms<TIn, TOut>,
}

impl ConcurrentOrchestration {
    pub fn new(members: Vec<Arc<dyn Agent>>) -> Self {
        Self {
            base: OrchestrationBase::new(members),
            transforms: Transforms::all_replies(),
        }
    }
}

impl<TIn, TOut> ConcurrentOrchestration<TIn, TOut> {
    /// Accept a caller-defined input type.
    pub fn with_input_transform<U, F>(self, transform: F) -> ConcurrentOrchestration<U, TOut>
    where
        F: Fn(U) -> Result<Task, OrchestrationError> + Send + Sync + 'static,
    {
        ConcurrentOrchestration {
            base: self.base,
            transforms: self.transforms.with_input(transform),
        }
    }

    /// Reduce the collected replies into a value of type `V`.
    pub fn with_output_transform<V, F, Fut>(self, transform: F) -> ConcurrentOrchestration<TIn, V>
    where
        F: Fn(Vec<ChatMessage>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, OrchestrationError>> + Send + 'static,
    {
        ConcurrentOrchestration {
            base: self.base,
            transforms: self.transforms.with_output(transform),
        }
    }
}

impl<TIn, TOut> OrchestrationBuilder for ConcurrentOrchestration<TIn, TOut> {
    fn base(&self) -> &OrchestrationBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OrchestrationBase {
        &mut self.base
    }
}

/// The task, delivered to one member.
struct ConcurrentRequest {
    messages: Vec<ChatMessage>,
}

/// A member's reply, delivered to the collector.
struct ConcurrentReply {
    reply: ChatMessage,
}

struct MemberActor<TOut> {
    agent: Arc<dyn Agent>,
    collector: ActorId,
    run: Arc<RunContext<TOut>>,
}

#[async_trait]
impl<TOut: Clone + Send + Sync + 'static> Actor for MemberActor<TOut> {
    type Message = ConcurrentRequest;
    type Error = OrchestrationError;

    async fn handle(
        &mut self,
        request: ConcurrentRequest,
        ctx: &ActorContext,
    ) -> Result<(), OrchestrationError> {
        if self.run.is_finished() {
            log::debug!("Run {} finished, not invoking '{}'", self.run.run_id, self.agent.name());
            return Ok(());
        }

        let reply = self
            .run
            .invoke_member(self.agent.as_ref(), &request.messages, &InvokeOptions::default())
            .await?;
        if self.run.is_finished() {
            self.run.discard(self.agent.name()).await;
            return Ok(());
        }
        ctx.send(&self.collector, ConcurrentReply { reply })?;
        Ok(())
    }

    async fn on_failure(&mut self, failure: ActorFailure<OrchestrationError>, _ctx: &ActorContext) {
        self.run.fail_from(failure).await;
    }
}

struct CollectorActor<TOut> {
    expected: usize,
    replies: Vec<ChatMessage>,
    run: Arc<RunContext<TOut>>,
}

#[async_trait]
impl<TOut: Clone + Send + Sync + 'static> Actor for CollectorActor<TOut> {
    type Message = ConcurrentReply;
    type Error = OrchestrationError;

    async fn handle(
        &mut self,
        message: ConcurrentReply,
        _ctx: &ActorContext,
    ) -> Result<(), OrchestrationError> {
        if self.run.is_finished() {
            let sender = message.reply.name.clone().unwrap_or_default();
            self.run.discard(&sender).await;
            return Ok(());
        }

        self.replies.push(message.reply);
        log::debug!(
            "Run {}: collected {}/{} replies",
            self.run.run_id,
            self.replies.len(),
            self.expected
        );
        if self.replies.len() == self.expected {
            let replies = std::mem::take(&mut self.replies);
            self.run.complete(replies).await;
        }
        Ok(())
    }

    async fn on_failure(&mut self, failure: ActorFailure<OrchestrationError>, _ctx: &ActorContext) {
        self.run.fail_from(failure).await;
    }
}

#[async_trait]
impl<TIn, TOut> Orchestration for ConcurrentOrchestration<TIn, TOut>
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
            .start_run(&self.transforms, task.into(), "Concurrent", runtime, cancellation)
            .await?;

        started
            .launch(|started| {
                let collector = started.controller_id("collector");
                let run = Arc::clone(&started.ctx);
                let expected = self.base.members.len();
                started.register(collector.clone(), move || CollectorActor {
                    expected,
                    replies: Vec::with_capacity(expected),
                    run,
                })?;

                let mut member_ids = Vec::with_capacity(expected);
                for agent in &self.base.members {
                    let id = started.actor_id(agent.name());
                    let agent = Arc::clone(agent);
                    let run = Arc::clone(&started.ctx);
                    let collector = collector.clone();
                    started.register(id.clone(), move || MemberActor {
                        agent,
                        collector,
                        run,
                    })?;
                    member_ids.push(id);
                }

                let messages = started.task.messages().to_vec();
                for id in &member_ids {
                    started.runtime.send(
                        id,
                        ConcurrentRequest {
                            messages: messages.clone(),
                        },
                    )?;
                }
                Ok(())
            })
            .await
    }
}
