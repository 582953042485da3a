//! Pipeline topology.
//!
//! Members form a chain. The first member receives the task; every reply is
//! appended to the running history, which is handed to the next member. The
//! last member's reply is the run's value.
//!
//! Cancellation is observed between links: once the run is cancelled no
//! further member is invoked, and a reply from a member that was already
//! running is discarded.
//!
//! ```rust
//! use ensemble::agent::{Agent, FnAgent};
//! use ensemble::orchestration::Orchestration;
//! use ensemble::runtime::Runtime;
//! use ensemble::sequential::SequentialOrchestration;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let upper: Arc<dyn Agent> = Arc::new(FnAgent::text("Upper", |h| {
//!     h.last().map(|m| m.content.to_uppercase()).unwrap_or_default()
//! }));
//! let exclaim: Arc<dyn Agent> = Arc::new(FnAgent::text("Exclaim", |h| {
//!     format!("{}!", h.last().map(|m| m.content.to_string()).unwrap_or_default())
//! }));
//!
//! let runtime = Runtime::new();
//! runtime.start()?;
//! let result = SequentialOrchestration::new(vec![upper, exclaim])
//!     .invoke("hello", &runtime, None)
//!     .await?;
//! assert_eq!(&*result.get(None).await?.content, "HELLO!");
//! runtime.stop_when_idle().await?;
//! # Ok(())
//! # }
//! ```

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

/// Runs members one after another, each seeing the history so far.
pub struct SequentialOrchestration<TIn = Task, TOut = ChatMessage> {
    base: OrchestrationBase,
    transforms: Transforms<TIn, TOut>,
}

impl SequentialOrchestration {
    pub fn new(members: Vec<Arc<dyn Agent>>) -> Self {
        Self {
            base: OrchestrationBase::new(members),
            transforms: Transforms::last_reply(),
        }
    }
}

impl<TIn, TOut> SequentialOrchestration<TIn, TOut> {
    pub fn with_input_transform<U, F>(self, transform: F) -> SequentialOrchestration<U, TOut>
    where
        F: Fn(U) -> Result<Task, OrchestrationError> + Send + Sync + 'static,
    {
        SequentialOrchestration {
            base: self.base,
            transforms: self.transforms.with_input(transform),
        }
    }

    /// Convert the final reply (passed as a one-element list) into `V`.
    pub fn with_output_transform<V, F, Fut>(self, transform: F) -> SequentialOrchestration<TIn, V>
    where
        F: Fn(Vec<ChatMessage>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, OrchestrationError>> + Send + 'static,
    {
        SequentialOrchestration {
            base: self.base,
            transforms: self.transforms.with_output(transform),
        }
    }
}

impl<TIn, TOut> OrchestrationBuilder for SequentialOrchestration<TIn, TOut> {
    fn base(&self) -> &OrchestrationBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OrchestrationBase {
        &mut self.base
    }
}

/// The running history, handed from one link to the next.
struct SequentialStep {
    history: Vec<ChatMessage>,
}

struct LinkActor<TOut> {
    agent: Arc<dyn Agent>,
    next: Option<ActorId>,
    run: Arc<RunContext<TOut>>,
}

#[async_trait]
impl<TOut: Clone + Send + Sync + 'static> Actor for LinkActor<TOut> {
    type Message = SequentialStep;
    type Error = OrchestrationError;

    async fn handle(
        &mut self,
        step: SequentialStep,
        ctx: &ActorContext,
    ) -> Result<(), OrchestrationError> {
        if self.run.is_finished() {
            log::debug!(
                "Run {} finished, stopping before '{}'",
                self.run.run_id,
                self.agent.name()
            );
            return Ok(());
        }

        let mut history = step.history;
        let reply = self
            .run
            .invoke_member(self.agent.as_ref(), &history, &InvokeOptions::default())
            .await?;
        if self.run.is_finished() {
            self.run.discard(self.agent.name()).await;
            return Ok(());
        }

        match &self.next {
            Some(next) => {
                history.push(reply);
                ctx.send(next, SequentialStep { history })?;
            }
            None => self.run.complete(vec![reply]).await,
        }
        Ok(())
    }

    async fn on_failure(&mut self, failure: ActorFailure<OrchestrationError>, _ctx: &ActorContext) {
        self.run.fail_from(failure).await;
    }
}

#[async_trait]
impl<TIn, TOut> Orchestration for SequentialOrchestration<TIn, TOut>
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
            .start_run(&self.transforms, task.into(), "Sequential", runtime, cancellation)
            .await?;

        started
            .launch(|started| {
                let ids: Vec<ActorId> = self
                    .base
                    .members
                    .iter()
                    .map(|agent| started.actor_id(agent.name()))
                    .collect();

                for (index, agent) in self.base.members.iter().enumerate() {
                    let agent = Arc::clone(agent);
                    let next = ids.get(index + 1).cloned();
                    let run = Arc::clone(&started.ctx);
                    started.register(ids[index].clone(), move || LinkActor { agent, next, run })?;
                }

                started.runtime.send(
                    &ids[0],
                    SequentialStep {
                        history: started.task.messages().to_vec(),
                    },
                )?;
                Ok(())
            })
            .await
    }
}
