//! JetStream context: asynchronous publish engine plus the request/reply API.
//!
//! # Architecture
//!
//! ```text
//!  caller threads                        transport dispatch thread
//!  ──────────────                        ─────────────────────────
//!  publish_async ──► register ──► gate   reply on _INBOX.<pfx>.<token>
//!                        │          │               │
//!                        ▼          ▼               ▼
//!                  ┌──────────────────────────────────────┐
//!                  │ Mutex<State>: registry, counters,     │
//!                  │ listener, destroyed   +   one Condvar │
//!                  └──────────────────────────────────────┘
//!                        ▲                          │
//!  flush_async ──────────┘        resolve ◄─────────┘ ─► error handler
//! ```
//!
//! Every waiter (stalled publisher or drain waiter) re-checks its own
//! predicate after each wake; the condvar is shared and broadcasts are not
//! addressed to a specific waiter.
//!
//! # Lifetime
//!
//! The engine lives in an `Arc`. The caller's [`Context`], every
//! [`ContextHandle`] and the reply subscription's completion hook each hold a
//! strong reference; the dispatch callback only holds a `Weak` and upgrades it
//! per reply. Closing the context marks it destroyed, unsubscribes the
//! listener and drops the pending messages; the memory is released once the
//! last reference goes away.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::config::{ContextConfig, Settings};
use crate::message::Message;
use crate::transport::Transport;
use crate::{Error, Result};

mod admin;
mod flush;
mod listener;
mod publish;
mod registry;

use listener::ReplyListener;
use registry::PendingRegistry;

/// Failed asynchronous publish, handed to the configured error handler.
#[derive(Debug)]
pub struct PubAckError {
    /// The message that was published. Its reply subject has been cleared so it
    /// can be resubmitted as is.
    pub message: Message,
    /// `Error::NoResponders`, `Error::Api` or `Error::Json`.
    pub error: Error,
    /// JetStream error code, `0` when the server reported none.
    pub err_code: u16,
    pub text: String,
}

/// Error returned by message-taking publish calls.
///
/// `message` is `Some` whenever the context did not keep the message, so the
/// caller can retry or inspect it.
#[derive(Debug)]
pub struct PublishError {
    pub error: Error,
    pub message: Option<Message>,
}

impl PublishError {
    pub fn new(error: Error, message: Message) -> Self {
        Self {
            error,
            message: Some(message),
        }
    }

    pub fn into_error(self) -> Error {
        self.error
    }
}

impl From<Error> for PublishError {
    fn from(error: Error) -> Self {
        Self {
            error,
            message: None,
        }
    }
}

impl From<PublishError> for Error {
    fn from(value: PublishError) -> Self {
        value.error
    }
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.error, f)
    }
}

impl std::error::Error for PublishError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Point-in-time counters of a context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextStats {
    /// Async publishes not yet resolved (including replies being dispatched).
    pub pending: usize,
    pub acks: u64,
    /// Async publishes resolved with an error (handler configured or not).
    pub errors: u64,
    /// Publishers that had to wait in the backpressure gate.
    pub stalls: u64,
    /// Pending publishes dropped by `close`.
    pub orphaned: u64,
}

#[derive(Default)]
struct Counters {
    acks: AtomicU64,
    errors: AtomicU64,
    stalls: AtomicU64,
    orphaned: AtomicU64,
}

pub(crate) struct Inner {
    transport: Arc<dyn Transport>,
    settings: Settings,
    state: Mutex<State>,
    cond: Condvar,
    counters: Counters,
}

pub(crate) struct State {
    destroyed: bool,
    listener: Option<ReplyListener>,
    registry: PendingRegistry,
    /// Replies removed from the registry whose dispatch has not finished.
    dispatching: usize,
    drain_waiters: usize,
    stalled: usize,
}

impl State {
    /// Publishes whose fate is not settled yet.
    fn outstanding(&self) -> usize {
        self.registry.len() + self.dispatching
    }
}

impl Inner {
    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| Error::LockPoisoned("context state"))
    }

    /// Waits on the shared condvar; `None` waits until notified.
    ///
    /// The guard comes back even when the lock was poisoned, flagged by the
    /// `bool`, so the caller can undo its bookkeeping before bailing out.
    fn wait<'a>(
        &self,
        state: MutexGuard<'a, State>,
        timeout: Option<Duration>,
    ) -> (MutexGuard<'a, State>, bool) {
        match timeout {
            None => match self.cond.wait(state) {
                Ok(guard) => (guard, false),
                Err(poisoned) => (poisoned.into_inner(), true),
            },
            Some(timeout) => match self.cond.wait_timeout(state, timeout) {
                Ok((guard, _)) => (guard, false),
                Err(poisoned) => (poisoned.into_inner().0, true),
            },
        }
    }

    /// Broadcasts when a drain waiter or a stalled publisher can make progress.
    fn wake_waiters(&self, state: &State) {
        let outstanding = state.outstanding();
        if (state.drain_waiters > 0 && outstanding == 0)
            || (state.stalled > 0 && outstanding <= self.settings.max_pending)
        {
            self.cond.notify_all();
        }
    }

    /// Poisons the state lock by panicking while holding it.
    #[cfg(test)]
    fn poison(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        let poisoner = std::thread::spawn(move || {
            let _state = inner.state.lock();
            panic!("poisoning context state");
        });
        assert!(poisoner.join().is_err());
    }

    fn shutdown(&self) {
        let (listener, orphans) = {
            let mut state = match self.state.lock() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            let listener = state.listener.take();
            let orphans = state.registry.drain();
            self.cond.notify_all();
            (listener, orphans)
        };

        if let Some(listener) = listener {
            listener.close();
        }
        if !orphans.is_empty() {
            log::debug!(
                "closing context with {} pending async publishes",
                orphans.len()
            );
            self.counters
                .orphaned
                .fetch_add(orphans.len() as u64, Ordering::Relaxed);
        }
        drop(orphans);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        log::trace!("context released (prefix {})", self.settings.api_prefix);
    }
}

/// Shared handle to a context's operations.
///
/// Handed to the error handler so it can resubmit messages. All operations
/// fail with `Error::ContextClosed` once the owning [`Context`] is closed.
#[derive(Clone)]
pub struct ContextHandle {
    inner: Arc<Inner>,
}

impl ContextHandle {
    pub(crate) fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    pub fn is_closed(&self) -> bool {
        match self.inner.state.lock() {
            Ok(state) => state.destroyed,
            Err(_) => true,
        }
    }

    /// Number of async publishes not resolved yet.
    pub fn pending_count(&self) -> usize {
        match self.inner.state.lock() {
            Ok(state) => state.outstanding(),
            Err(poisoned) => poisoned.into_inner().outstanding(),
        }
    }

    pub fn stats(&self) -> ContextStats {
        let counters = &self.inner.counters;
        ContextStats {
            pending: self.pending_count(),
            acks: counters.acks.load(Ordering::Relaxed),
            errors: counters.errors.load(Ordering::Relaxed),
            stalls: counters.stalls.load(Ordering::Relaxed),
            orphaned: counters.orphaned.load(Ordering::Relaxed),
        }
    }

    /// API subject prefix in use, e.g. `$JS.API`.
    pub fn api_prefix(&self) -> &str {
        &self.inner.settings.api_prefix
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ContextClosed);
        }
        Ok(())
    }
}

/// The caller's reference to a JetStream context.
///
/// Dropping it is the same as calling [`Context::close`].
pub struct Context {
    handle: ContextHandle,
}

impl Context {
    /// Creates a context on `transport`. No network traffic happens here; the
    /// reply subscription is created by the first async publish.
    pub fn open(transport: Arc<dyn Transport>, config: ContextConfig) -> Result<Self> {
        let settings = config.resolve()?;
        log::debug!(
            "opening context (api prefix {}, max pending {}, stall wait {:?})",
            settings.api_prefix,
            settings.max_pending,
            settings.stall_wait
        );
        let inner = Arc::new(Inner {
            transport,
            settings,
            state: Mutex::new(State {
                destroyed: false,
                listener: None,
                registry: PendingRegistry::new(),
                dispatching: 0,
                drain_waiters: 0,
                stalled: 0,
            }),
            cond: Condvar::new(),
            counters: Counters::default(),
        });
        Ok(Self {
            handle: ContextHandle::from_inner(inner),
        })
    }

    pub fn handle(&self) -> ContextHandle {
        self.handle.clone()
    }

    /// Closes the context.
    ///
    /// Pending async publishes are dropped without invoking the error handler,
    /// waiters are woken and fail with `Error::ContextClosed`, and the reply
    /// subscription is removed. Safe while replies are still being dispatched.
    pub fn close(self) {
        drop(self);
    }
}

impl Deref for Context {
    type Target = ContextHandle;

    fn deref(&self) -> &ContextHandle {
        &self.handle
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.handle.inner.shutdown();
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("api_prefix", &self.handle.inner.settings.api_prefix)
            .field("pending", &self.handle.pending_count())
            .finish()
    }
}
