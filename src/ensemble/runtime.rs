//! In-process actor host.
//!
//! The [`Runtime`] is the only place where concurrency is introduced. Every
//! registered [`Actor`] owns an unbounded FIFO mailbox drained by its own tokio
//! task, so handlers of different actors run concurrently while handlers of the
//! same actor never overlap. Actors talk to each other exclusively through
//! [`Runtime::send`].
//!
//! Handler errors and panics are caught at the actor boundary, logged, and
//! handed to [`Actor::on_failure`]; they never take down the worker loop or any
//! other actor.
//!
//! # Lifecycle
//!
//! `Created --start()--> Running --stop_when_idle()--> Stopped`
//!
//! ```rust
//! use async_trait::async_trait;
//! use ensemble::runtime::{Actor, ActorContext, ActorId, Runtime, RuntimeError};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! struct Counter(Arc<AtomicUsize>);
//!
//! #[async_trait]
//! impl Actor for Counter {
//!     type Message = usize;
//!     type Error = RuntimeError;
//!
//!     async fn handle(&mut self, n: usize, _ctx: &ActorContext) -> Result<(), RuntimeError> {
//!         self.0.fetch_add(n, Ordering::SeqCst);
//!         Ok(())
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), RuntimeError> {
//! let total = Arc::new(AtomicUsize::new(0));
//! let runtime = Runtime::new();
//! runtime.start()?;
//!
//! let id = ActorId::from("counter");
//! let handle = total.clone();
//! runtime.register_actor(id.clone(), move || Counter(handle))?;
//! runtime.send(&id, 2usize)?;
//! runtime.send(&id, 3usize)?;
//!
//! runtime.stop_when_idle().await?;
//! assert_eq!(total.load(Ordering::SeqCst), 5);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use futures_util::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, Notify};

/// Errors raised by the actor runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeError {
    /// The operation is not allowed in the runtime's current state.
    InvalidState(String),
    /// The runtime has been stopped.
    Stopped,
    ActorNotFound(String),
    /// A message of the wrong type was sent to an actor.
    MessageTypeMismatch(String),
    HandlerFailed(String),
    Panicked(String),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::InvalidState(msg) => write!(f, "Invalid runtime state: {}", msg),
            RuntimeError::Stopped => write!(f, "The runtime has been stopped"),
            RuntimeError::ActorNotFound(id) => write!(f, "No actor registered with id '{}'", id),
            RuntimeError::MessageTypeMismatch(id) => {
                write!(f, "Actor '{}' does not accept this message type", id)
            }
            RuntimeError::HandlerFailed(msg) => write!(f, "Actor handler failed: {}", msg),
            RuntimeError::Panicked(msg) => write!(f, "Actor handler panicked: {}", msg),
        }
    }
}

impl Error for RuntimeError {}

/// Lifecycle state of a [`Runtime`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Created,
    Running,
    Stopped,
}

/// Key under which an actor is registered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActorId(String);

impl ActorId {
    /// Build an id unique to one orchestration run, e.g. `"Writer_3f2a..."`.
    pub fn scoped(name: &str, run_id: &str) -> Self {
        ActorId(format!("{}_{}", name, run_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ActorId {
    fn from(id: &str) -> Self {
        ActorId(id.to_string())
    }
}

impl From<String> for ActorId {
    fn from(id: String) -> Self {
        ActorId(id)
    }
}

/// Why a handler invocation did not complete normally.
#[derive(Debug)]
pub enum ActorFailure<E> {
    /// The handler returned an error.
    Handler(E),
    /// The handler panicked; the payload is rendered as text.
    Panicked(String),
}

/// A message handler hosted by the [`Runtime`].
#[async_trait]
pub trait Actor: Send + 'static {
    type Message: Send + 'static;
    type Error: fmt::Display + Send + 'static;

    /// Process one message. Never called concurrently for the same actor.
    async fn handle(&mut self, message: Self::Message, ctx: &ActorContext)
        -> Result<(), Self::Error>;

    /// Called after `handle` returned an error or panicked.
    async fn on_failure(&mut self, _failure: ActorFailure<Self::Error>, _ctx: &ActorContext) {}
}

/// Handle passed to every [`Actor::handle`] call.
#[derive(Clone)]
pub struct ActorContext {
    id: ActorId,
    runtime: Runtime,
}

impl ActorContext {
    pub fn id(&self) -> &ActorId {
        &self.id
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Enqueue a message for another actor (or this one).
    pub fn send<M: Send + 'static>(&self, to: &ActorId, message: M) -> Result<(), RuntimeError> {
        self.runtime.send(to, message)
    }
}

struct Mailbox {
    sender: Box<dyn Any + Send + Sync>,
}

struct RuntimeInner {
    state: Mutex<RuntimeState>,
    mailboxes: Mutex<HashMap<ActorId, Mailbox>>,
    pending: AtomicUsize,
    idle: Notify,
}

/// Process-wide actor host. Cheap to clone; clones share the same actors.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Runtime {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                state: Mutex::new(RuntimeState::Created),
                mailboxes: Mutex::new(HashMap::new()),
                pending: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    pub fn state(&self) -> RuntimeState {
        *lock(&self.inner.state)
    }

    /// Transition from `Created` to `Running`.
    pub fn start(&self) -> Result<(), RuntimeError> {
        let mut state = lock(&self.inner.state);
        match *state {
            RuntimeState::Created => {
                *state = RuntimeState::Running;
                log::debug!("Runtime started");
                Ok(())
            }
            RuntimeState::Running => Err(RuntimeError::InvalidState(
                "runtime is already running".to_string(),
            )),
            RuntimeState::Stopped => Err(RuntimeError::InvalidState(
                "runtime has been stopped and cannot be restarted".to_string(),
            )),
        }
    }

    /// Install an actor under `id`, spawning its worker task.
    ///
    /// Registering an id that already exists is a no-op and `factory` is not
    /// called.
    pub fn register_actor<A, F>(&self, id: ActorId, factory: F) -> Result<(), RuntimeError>
    where
        A: Actor,
        F: FnOnce() -> A,
    {
        if self.state() == RuntimeState::Stopped {
            return Err(RuntimeError::Stopped);
        }

        let mut mailboxes = lock(&self.inner.mailboxes);
        if mailboxes.contains_key(&id) {
            log::debug!("Actor '{}' already registered", id);
            return Ok(());
        }

        let (sender, receiver) = mpsc::unbounded_channel::<A::Message>();
        mailboxes.insert(
            id.clone(),
            Mailbox {
                sender: Box::new(sender),
            },
        );
        drop(mailboxes);

        let ctx = ActorContext {
            id: id.clone(),
            runtime: self.clone(),
        };
        tokio::spawn(run_actor(factory(), receiver, ctx));
        log::debug!("Registered actor '{}'", id);
        Ok(())
    }

    /// Remove the actor registered under `id`. Messages already queued for it
    /// are still handled before its worker exits.
    pub fn unregister_actor(&self, id: &ActorId) -> bool {
        let removed = lock(&self.inner.mailboxes).remove(id).is_some();
        if removed {
            log::debug!("Unregistered actor '{}'", id);
        }
        removed
    }

    pub fn is_registered(&self, id: &ActorId) -> bool {
        lock(&self.inner.mailboxes).contains_key(id)
    }

    /// Enqueue `message` for the actor registered under `to`.
    ///
    /// Messages to the same actor are handled in send order.
    pub fn send<M: Send + 'static>(&self, to: &ActorId, message: M) -> Result<(), RuntimeError> {
        match self.state() {
            RuntimeState::Created => {
                return Err(RuntimeError::InvalidState(
                    "runtime has not been started".to_string(),
                ))
            }
            RuntimeState::Stopped => return Err(RuntimeError::Stopped),
            RuntimeState::Running => {}
        }

        let mailboxes = lock(&self.inner.mailboxes);
        let mailbox = mailboxes
            .get(to)
            .ok_or_else(|| RuntimeError::ActorNotFound(to.to_string()))?;
        let sender = mailbox
            .sender
            .downcast_ref::<mpsc::UnboundedSender<M>>()
            .ok_or_else(|| RuntimeError::MessageTypeMismatch(to.to_string()))?;

        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        if sender.send(message).is_err() {
            self.message_done();
            return Err(RuntimeError::ActorNotFound(to.to_string()));
        }
        Ok(())
    }

    /// Wait until every mailbox is drained and no handler is running, then
    /// transition to `Stopped` and release all actors.
    pub async fn stop_when_idle(&self) -> Result<(), RuntimeError> {
        match self.state() {
            RuntimeState::Running => {}
            RuntimeState::Created => {
                return Err(RuntimeError::InvalidState(
                    "runtime has not been started".to_string(),
                ))
            }
            RuntimeState::Stopped => return Err(RuntimeError::Stopped),
        }

        loop {
            let idle = self.inner.idle.notified();
            if self.inner.pending.load(Ordering::SeqCst) == 0 {
                break;
            }
            idle.await;
        }

        *lock(&self.inner.state) = RuntimeState::Stopped;
        let released = {
            let mut mailboxes = lock(&self.inner.mailboxes);
            let count = mailboxes.len();
            mailboxes.clear();
            count
        };
        log::debug!("Runtime stopped, released {} actors", released);
        Ok(())
    }

    fn message_done(&self) {
        if self.inner.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("state", &self.state())
            .field("pending", &self.inner.pending.load(Ordering::SeqCst))
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

async fn run_actor<A: Actor>(
    mut actor: A,
    mut receiver: mpsc::UnboundedReceiver<A::Message>,
    ctx: ActorContext,
) {
    while let Some(message) = receiver.recv().await {
        let outcome = AssertUnwindSafe(actor.handle(message, &ctx))
            .catch_unwind()
            .await;

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => {
                log::error!("Actor '{}' handler failed: {}", ctx.id, err);
                Some(ActorFailure::Handler(err))
            }
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                log::error!("Actor '{}' handler panicked: {}", ctx.id, msg);
                Some(ActorFailure::Panicked(msg))
            }
        };

        if let Some(failure) = failure {
            let hook = AssertUnwindSafe(actor.on_failure(failure, &ctx))
                .catch_unwind()
                .await;
            if let Err(payload) = hook {
                log::error!(
                    "Actor '{}' failure hook panicked: {}",
                    ctx.id,
                    panic_message(payload.as_ref())
                );
            }
        }

        ctx.runtime.message_done();
    }
    log::debug!("Actor '{}' mailbox closed", ctx.id);
}
