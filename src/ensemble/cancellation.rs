//! Cooperative cancellation signal shared between a caller, an
//! [`OrchestrationResult`](crate::result::OrchestrationResult) and the actors
//! of a run.
//!
//! Actors observe the token between turns, never mid-turn: an agent call that
//! is already in flight completes, and its reply is discarded.
//!
//! ```
//! use ensemble::cancellation::CancellationToken;
//!
//! let token = CancellationToken::new();
//! let observer = token.clone();
//! assert!(!observer.is_cancelled());
//!
//! token.cancel();
//! token.cancel(); // idempotent
//! assert!(observer.is_cancelled());
//! ```

use std::sync::Arc;
use tokio::sync::watch;

/// A cloneable, idempotent cancellation flag.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    sender: Arc<watch::Sender<bool>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Signal cancellation. Returns `true` only for the call that flipped the flag.
    pub fn cancel(&self) -> bool {
        self.sender.send_if_modified(|cancelled| {
            if *cancelled {
                false
            } else {
                *cancelled = true;
                true
            }
        })
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    /// Wait until the token is cancelled.
    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        // The sender lives as long as `self`, so `wait_for` cannot fail here.
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}
