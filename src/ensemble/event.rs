//! Orchestration event system.
//!
//! Implement [`EventHandler`] to observe a run as it progresses:
//!
//! - **Run lifecycle**: start, completion, cancellation, failure
//! - **Member turns**: invocation, reply, failure
//! - **Manager decisions**: group chat and magentic decisions with their reasons
//! - **Topology specific**: handoff transfers, group chat phases, ledger updates
//!
//! The handler is registered with `with_event_handler` on any orchestration
//! and shared (as `Arc<dyn EventHandler>`) by every actor of the run. The trait
//! method has a default no-op implementation.
//!
//! # Event Flow (group chat example)
//!
//! ```text
//! RunStarted { topology: "GroupChat", member_count: 2 }
//!   └─ GroupChatPhaseChanged { phase: SelectNext }
//!   └─ ManagerDecision { decision: "select_next_agent", result: "Writer" }
//!       ├─ AgentInvoked { agent_name: "Writer" }
//!       └─ AgentResponded { agent_name: "Writer" }
//!   └─ ManagerDecision { decision: "should_terminate", result: "true" }
//!   └─ GroupChatPhaseChanged { phase: Terminated }
//! RunCompleted { turns: 1 }
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use ensemble::event::{EventHandler, OrchestrationEvent};
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl EventHandler for Printer {
//!     async fn on_orchestration_event(&self, event: &OrchestrationEvent) {
//!         if let OrchestrationEvent::AgentResponded { agent_name, response_length, .. } = event {
//!             println!("{} replied ({} chars)", agent_name, response_length);
//!         }
//!     }
//! }
//! ```

use crate::ensemble::group_chat::GroupChatPhase;
use async_trait::async_trait;

/// Events emitted by the orchestration engine during a run.
///
/// Every variant carries the `run_id` of the invocation that produced it.
#[derive(Debug, Clone)]
pub enum OrchestrationEvent {
    /// `invoke` accepted the task and registered the run's actors.
    RunStarted {
        run_id: String,
        orchestration_name: String,
        /// `"Concurrent"`, `"Sequential"`, `"GroupChat"`, `"Handoff"` or `"Magentic"`.
        topology: String,
        member_count: usize,
    },

    /// A member is about to be invoked.
    AgentInvoked {
        run_id: String,
        agent_name: String,
        /// Number of messages handed to the agent.
        history_length: usize,
    },

    AgentResponded {
        run_id: String,
        agent_name: String,
        response_length: usize,
    },

    /// A member's call returned an error. The run fails with it.
    AgentFailed {
        run_id: String,
        agent_name: String,
        error: String,
    },

    /// A manager answered one of its decision questions.
    ManagerDecision {
        run_id: String,
        /// Decision point, e.g. `"select_next_agent"` or `"progress_ledger"`.
        decision: String,
        result: String,
        reason: String,
    },

    /// The group chat state machine moved to a new phase.
    GroupChatPhaseChanged {
        run_id: String,
        phase: GroupChatPhase,
    },

    /// The human response function is about to be called.
    UserInputRequested { run_id: String },

    /// Control moved along a handoff edge.
    HandoffTransferred {
        run_id: String,
        from: String,
        to: String,
    },

    /// The magentic task ledger was created or replaced.
    LedgerUpdated {
        run_id: String,
        plan_steps: usize,
        /// Number of re-plans performed so far.
        reset_count: usize,
    },

    /// A reply arrived after the run finished and was dropped.
    ReplyDiscarded { run_id: String, agent_name: String },

    RunCompleted {
        run_id: String,
        orchestration_name: String,
        /// Number of member turns executed.
        turns: usize,
    },

    RunCancelled { run_id: String },

    RunFailed { run_id: String, error: String },
}

/// Trait for receiving orchestration events.
///
/// The `Send + Sync` bound allows a handler to be shared across actors via
/// `Arc<dyn EventHandler>`; internal state needs its own synchronization.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Called for every event of every run the handler is registered on.
    async fn on_orchestration_event(&self, _event: &OrchestrationEvent) {}
}
