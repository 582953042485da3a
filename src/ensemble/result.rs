//! Handle to an in-flight or completed orchestration run.
//!
//! An [`OrchestrationResult`] is returned immediately by
//! [`Orchestration::invoke`](crate::orchestration::Orchestration::invoke). It is
//! resolved exactly once, by whichever of these happens first:
//!
//! - the topology's completion path (value or failure),
//! - [`OrchestrationResult::cancel`],
//! - cancellation of the token passed to `invoke`.
//!
//! Later attempts to resolve are ignored, so a reply that arrives after
//! cancellation can never turn a cancelled run into a completed one.
//!
//! # Timeouts
//!
//! A timeout is a property of [`get`](OrchestrationResult::get), not of the run.
//! A timed-out `get` leaves the run untouched and a later `get` can still
//! observe the value.
//!
//! ```rust,no_run
//! # use ensemble::result::OrchestrationResult;
//! # use ensemble::error::OrchestrationError;
//! # use std::time::Duration;
//! # async fn example(result: OrchestrationResult<String>) {
//! match result.get(Some(Duration::from_secs(20))).await {
//!     Ok(value) => println!("{}", value),
//!     Err(OrchestrationError::Timeout(_)) => println!("still running"),
//!     Err(e) => println!("run failed: {}", e),
//! }
//! # }
//! ```

use crate::ensemble::cancellation::CancellationToken;
use crate::ensemble::error::OrchestrationError;
use crate::ensemble::runtime::RuntimeError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Observable lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultState {
    Pending,
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone)]
enum Outcome<T> {
    Pending,
    Completed(T),
    Cancelled,
    Failed(OrchestrationError),
}

impl<T> Outcome<T> {
    fn is_pending(&self) -> bool {
        matches!(self, Outcome::Pending)
    }

    fn state(&self) -> ResultState {
        match self {
            Outcome::Pending => ResultState::Pending,
            Outcome::Completed(_) => ResultState::Completed,
            Outcome::Cancelled => ResultState::Cancelled,
            Outcome::Failed(_) => ResultState::Failed,
        }
    }
}

/// Single-assignment cell shared by the result handle and its resolvers.
#[derive(Debug)]
struct ResultSlot<T> {
    sender: watch::Sender<Outcome<T>>,
}

impl<T> ResultSlot<T> {
    fn settle(&self, outcome: Outcome<T>) -> bool {
        let mut outcome = Some(outcome);
        self.sender.send_if_modified(|current| {
            if current.is_pending() {
                if let Some(next) = outcome.take() {
                    *current = next;
                }
                true
            } else {
                false
            }
        })
    }
}

/// Handle returned by `invoke`; await it with [`get`](Self::get).
#[derive(Debug)]
pub struct OrchestrationResult<T> {
    slot: Arc<ResultSlot<T>>,
    token: CancellationToken,
}

impl<T> Clone for OrchestrationResult<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
            token: self.token.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> OrchestrationResult<T> {
    /// Create a pending result bound to `token`, together with the resolver the
    /// orchestration's actors use to settle it.
    pub(crate) fn pending(token: CancellationToken) -> (Self, ResultResolver<T>) {
        let (sender, _) = watch::channel(Outcome::Pending);
        let slot = Arc::new(ResultSlot { sender });
        let result = Self {
            slot: Arc::clone(&slot),
            token: token.clone(),
        };
        (result, ResultResolver { slot, token })
    }

    /// Wait for the run to reach a terminal state.
    ///
    /// Returns the value, [`OrchestrationError::Cancelled`] if the run was
    /// cancelled, the run's terminal failure, or
    /// [`OrchestrationError::Timeout`] if `timeout` elapsed first. `None` waits
    /// indefinitely.
    pub async fn get(&self, timeout: Option<Duration>) -> Result<T, OrchestrationError> {
        let outcome = match timeout {
            Some(limit) => tokio::time::timeout(limit, self.wait_terminal())
                .await
                .map_err(|_| OrchestrationError::Timeout(limit))?,
            None => self.wait_terminal().await,
        };

        match outcome {
            Outcome::Completed(value) => Ok(value),
            Outcome::Cancelled => Err(OrchestrationError::Cancelled),
            Outcome::Failed(err) => Err(err),
            Outcome::Pending => Err(OrchestrationError::Runtime(RuntimeError::InvalidState(
                "result observed while still pending".to_string(),
            ))),
        }
    }

    /// Cancel the run. A no-op if the run has already reached a terminal state.
    ///
    /// Returns `true` if this call performed the cancellation.
    pub fn cancel(&self) -> bool {
        if self.slot.settle(Outcome::Cancelled) {
            self.token.cancel();
            log::info!("Orchestration result cancelled by caller");
            true
        } else {
            false
        }
    }

    pub fn state(&self) -> ResultState {
        self.slot.sender.borrow().state()
    }

    pub fn is_done(&self) -> bool {
        self.state() != ResultState::Pending
    }

    /// The run's cancellation token.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    async fn wait_terminal(&self) -> Outcome<T> {
        let mut receiver = self.slot.sender.subscribe();
        let outcome = match receiver.wait_for(|outcome| !outcome.is_pending()).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => Outcome::Failed(OrchestrationError::Runtime(RuntimeError::InvalidState(
                "result channel closed".to_string(),
            ))),
        };
        outcome
    }
}

/// Write side of an [`OrchestrationResult`], held by the actors of one run.
#[derive(Debug)]
pub(crate) struct ResultResolver<T> {
    slot: Arc<ResultSlot<T>>,
    token: CancellationToken,
}

impl<T> Clone for ResultResolver<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
            token: self.token.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> ResultResolver<T> {
    pub(crate) fn complete(&self, value: T) -> bool {
        self.slot.settle(Outcome::Completed(value))
    }

    pub(crate) fn fail(&self, error: OrchestrationError) -> bool {
        if error.is_cancelled() {
            return self.cancel();
        }
        self.slot.settle(Outcome::Failed(error))
    }

    pub(crate) fn cancel(&self) -> bool {
        let settled = self.slot.settle(Outcome::Cancelled);
        self.token.cancel();
        settled
    }

    /// `true` once the run is resolved or its token is cancelled; actors stop
    /// scheduling work at this point.
    pub(crate) fn is_finished(&self) -> bool {
        self.token.is_cancelled() || !self.slot.sender.borrow().is_pending()
    }

    /// Resolve the result as cancelled as soon as the token fires.
    pub(crate) fn link_cancellation(&self) {
        let resolver = self.clone();
        tokio::spawn(async move {
            let mut receiver = resolver.slot.sender.subscribe();
            tokio::select! {
                _ = resolver.token.cancelled() => {
                    if resolver.slot.settle(Outcome::Cancelled) {
                        log::info!("Orchestration cancelled through its cancellation token");
                    }
                }
                _ = receiver.wait_for(|outcome| !outcome.is_pending()) => {}
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_resolution_wins() {
        let (result, resolver) = OrchestrationResult::<u32>::pending(CancellationToken::new());
        assert!(resolver.complete(1));
        assert!(!resolver.complete(2));
        assert!(!resolver.fail(OrchestrationError::EmptyHistory));
        assert!(!result.cancel());
        assert_eq!(result.get(None).await.unwrap(), 1);
        assert_eq!(result.state(), ResultState::Completed);
    }

    #[tokio::test]
    async fn cancel_blocks_later_completion() {
        let (result, resolver) = OrchestrationResult::<u32>::pending(CancellationToken::new());
        assert!(result.cancel());
        assert!(result.cancellation_token().is_cancelled());
        assert!(!resolver.complete(7));
        assert_eq!(result.get(None).await, Err(OrchestrationError::Cancelled));
        assert!(resolver.is_finished());
    }

    #[tokio::test]
    async fn linked_token_cancels_result() {
        let token = CancellationToken::new();
        let (result, resolver) = OrchestrationResult::<u32>::pending(token.clone());
        resolver.link_cancellation();
        token.cancel();
        let outcome = result.get(Some(Duration::from_secs(1))).await;
        assert_eq!(outcome, Err(OrchestrationError::Cancelled));
    }
}
