//! Loop ceilings shared by the orchestration topologies.
//!
//! Limits are plain structs constructed in code; there is no config-file
//! parsing.
//!
//! ```rust
//! use ensemble::config::OrchestrationLimits;
//!
//! let limits = OrchestrationLimits {
//!     max_handoff_turns: 8,
//!     ..OrchestrationLimits::default()
//! };
//! assert_eq!(limits.max_magentic_rounds, 20);
//! ```

/// Safety valves against runaway loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestrationLimits {
    /// Maximum number of agent turns in a handoff run before it fails with
    /// [`TurnLimitExceeded`](crate::error::OrchestrationError::TurnLimitExceeded).
    pub max_handoff_turns: usize,

    /// Maximum number of inner-loop rounds in a magentic run.
    pub max_magentic_rounds: usize,

    /// Number of consecutive stalled rounds tolerated before the magentic
    /// manager re-plans.
    pub max_stall_count: usize,

    /// Number of re-plans allowed before a magentic run fails with
    /// [`PlanningLimitExceeded`](crate::error::OrchestrationError::PlanningLimitExceeded).
    pub max_reset_count: usize,
}

impl Default for OrchestrationLimits {
    fn default() -> Self {
        Self {
            max_handoff_turns: 32,
            max_magentic_rounds: 20,
            max_stall_count: 3,
            max_reset_count: 2,
        }
    }
}
