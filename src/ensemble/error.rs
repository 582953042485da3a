//! Error taxonomy for orchestration configuration and execution.
//!
//! Every failure a caller can observe is an [`OrchestrationError`]. Configuration
//! problems are returned synchronously from
//! [`Orchestration::invoke`](crate::orchestration::Orchestration::invoke); all
//! other failures surface through
//! [`OrchestrationResult::get`](crate::result::OrchestrationResult::get).
//!
//! The enum is `Clone` because a single terminal failure is handed to every
//! waiter of a result.
//!
//! # Examples
//!
//! ```
//! use ensemble::error::OrchestrationError;
//!
//! let err = OrchestrationError::UnknownParticipant("Mallory".into());
//! assert_eq!(err.to_string(), "Unknown participant selected: Mallory");
//! ```

use crate::ensemble::runtime::RuntimeError;
use std::error::Error;
use std::fmt;
use std::time::Duration;

/// Errors that can occur during orchestration configuration or execution.
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestrationError {
    /// The member list, handoff graph or transform setup is invalid.
    Configuration(String),

    /// A manager requested user input but no human response function was
    /// configured on the orchestration.
    MissingHumanInputHandler,

    /// A manager selected a participant that is not a member.
    UnknownParticipant(String),

    /// An agent tried to transfer control along an edge that does not exist.
    InvalidHandoff { from: String, to: String },

    /// [`OrchestrationResult::get`](crate::result::OrchestrationResult::get)
    /// gave up waiting. The run itself is unaffected.
    Timeout(Duration),

    /// The run was cancelled before it resolved.
    Cancelled,

    /// A handoff run exceeded its maximum number of agent turns.
    TurnLimitExceeded(usize),

    /// A magentic run exceeded its round or re-plan ceiling.
    PlanningLimitExceeded(usize),

    /// Result filtering was asked to summarise an empty history.
    EmptyHistory,

    /// The caller-supplied input transform rejected the task.
    InputTransform(String),

    /// The output transform could not produce the final value.
    OutputTransform(String),

    /// A manager's reasoning agent produced output that could not be parsed.
    StructuredOutput(String),

    /// A member agent's call failed. Agents are never retried by the engine.
    AgentFailed { agent: String, message: String },

    /// The actor runtime rejected an operation.
    Runtime(RuntimeError),
}

impl OrchestrationError {
    /// Wrap an agent-level failure.
    pub fn agent(agent: impl Into<String>, error: impl fmt::Display) -> Self {
        OrchestrationError::AgentFailed {
            agent: agent.into(),
            message: error.to_string(),
        }
    }

    /// `true` for the terminal cancellation state.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, OrchestrationError::Cancelled)
    }
}

impl fmt::Display for OrchestrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestrationError::Configuration(msg) => write!(f, "Invalid configuration: {}", msg),
            OrchestrationError::MissingHumanInputHandler => write!(
                f,
                "User input was requested but no human response function is configured"
            ),
            OrchestrationError::UnknownParticipant(name) => {
                write!(f, "Unknown participant selected: {}", name)
            }
            OrchestrationError::InvalidHandoff { from, to } => {
                write!(f, "Invalid handoff from '{}' to '{}'", from, to)
            }
            OrchestrationError::Timeout(after) => {
                write!(f, "Timed out after {:?} waiting for the result", after)
            }
            OrchestrationError::Cancelled => {
                write!(f, "The invocation was canceled before it could complete")
            }
            OrchestrationError::TurnLimitExceeded(max) => {
                write!(f, "Turn limit of {} exceeded", max)
            }
            OrchestrationError::PlanningLimitExceeded(max) => {
                write!(f, "Planning limit of {} exceeded", max)
            }
            OrchestrationError::EmptyHistory => write!(f, "No messages in the chat history"),
            OrchestrationError::InputTransform(msg) => write!(f, "Input transform failed: {}", msg),
            OrchestrationError::OutputTransform(msg) => {
                write!(f, "Output transform failed: {}", msg)
            }
            OrchestrationError::StructuredOutput(msg) => {
                write!(f, "Could not parse structured output: {}", msg)
            }
            OrchestrationError::AgentFailed { agent, message } => {
                write!(f, "Agent '{}' failed: {}", agent, message)
            }
            OrchestrationError::Runtime(err) => write!(f, "Runtime error: {}", err),
        }
    }
}

impl Error for OrchestrationError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            OrchestrationError::Runtime(err) => Some(err),
            _ => None,
        }
    }
}

impl From<RuntimeError> for OrchestrationError {
    fn from(err: RuntimeError) -> Self {
        OrchestrationError::Runtime(err)
    }
}
