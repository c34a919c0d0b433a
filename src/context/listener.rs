//! Reply listener: one subscription on `<prefix>*` receiving every async ack.

use std::sync::{Arc, Weak};

use super::{ContextHandle, Inner, PubAckError};
use crate::api;
use crate::error::JS_NOT_ENABLED_ERR;
use crate::message::Message;
use crate::token::ReplyPrefix;
use crate::transport::Subscription;
use crate::{Error, Result};

pub(crate) struct ReplyListener {
    prefix: ReplyPrefix,
    sub: Box<dyn Subscription>,
}

impl ReplyListener {
    /// Subscribes the context's reply namespace.
    ///
    /// Called with the context lock held. On error nothing is left behind, so
    /// the next publish simply tries again.
    pub(crate) fn start(inner: &Arc<Inner>) -> Result<Self> {
        let prefix = ReplyPrefix::from_inbox(&inner.transport.new_inbox());

        let weak: Weak<Inner> = Arc::downgrade(inner);
        let dispatch_prefix = prefix.clone();
        let mut sub = inner.transport.subscribe(
            &prefix.wildcard(),
            Box::new(move |reply| {
                if let Some(inner) = weak.upgrade() {
                    dispatch(&inner, &dispatch_prefix, reply);
                }
            }),
        )?;

        // Bounding is done by the backpressure gate, not by the transport.
        if let Err(err) = sub.set_pending_limits(None, None) {
            if let Err(unsub_err) = sub.unsubscribe() {
                log::warn!("rollback of reply subscription failed: {unsub_err}");
            }
            return Err(err);
        }

        let keep_alive = Arc::clone(inner);
        let hook_prefix = prefix.as_str().to_string();
        sub.set_on_complete(Box::new(move || {
            log::debug!("reply listener on {hook_prefix}* stopped");
            drop(keep_alive);
        }));

        log::debug!("reply listener subscribed on {}", sub.subject());
        Ok(Self { prefix, sub })
    }

    pub(crate) fn prefix(&self) -> &ReplyPrefix {
        &self.prefix
    }

    pub(crate) fn close(self) {
        let dropped = self.sub.dropped();
        if dropped > 0 {
            log::warn!(
                "reply listener on {} dropped {dropped} replies as a slow consumer",
                self.sub.subject()
            );
        }
        if let Err(err) = self.sub.unsubscribe() {
            log::warn!("reply listener unsubscribe failed: {err}");
        }
    }
}

/// Outcome of an ack reply that did not succeed.
struct Failure {
    error: Error,
    err_code: u16,
    text: String,
}

fn classify(reply: &Message) -> Option<Failure> {
    if reply.is_no_responders() {
        let error = Error::NoResponders;
        return Some(Failure {
            text: error.to_string(),
            error,
            err_code: JS_NOT_ENABLED_ERR,
        });
    }
    match api::response_error(&reply.data) {
        Ok(None) => None,
        Ok(Some(api)) => Some(Failure {
            err_code: api.err_code,
            text: api.description.clone(),
            error: Error::Api(api),
        }),
        Err(err) => Some(Failure {
            text: err.to_string(),
            error: err,
            err_code: 0,
        }),
    }
}

/// Handles one reply on a transport thread.
pub(crate) fn dispatch(inner: &Arc<Inner>, prefix: &ReplyPrefix, reply: Message) {
    let Some(token) = prefix.token_of(&reply.subject) else {
        log::trace!("discarding reply on unexpected subject '{}'", reply.subject);
        return;
    };

    let Ok(mut state) = inner.lock() else {
        return;
    };
    if state.destroyed {
        return;
    }
    let Some(mut pending) = state.registry.resolve(token) else {
        log::trace!("no pending publish for token {token}");
        return;
    };

    match classify(&reply) {
        None => {
            inner.counters.acks.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        Some(failure) => {
            inner.counters.errors.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            match inner.settings.error_handler.clone() {
                Some(handler) => {
                    pending.reply = None;
                    let err = PubAckError {
                        message: pending,
                        error: failure.error,
                        err_code: failure.err_code,
                        text: failure.text,
                    };
                    // The handler may publish again; it must run unlocked.
                    state.dispatching += 1;
                    drop(state);
                    let guard = Dispatching {
                        inner: inner.as_ref(),
                    };
                    let handle = ContextHandle::from_inner(Arc::clone(inner));
                    let returned = handler(&handle, err);
                    drop(handle);
                    drop(guard);
                    // A message handed back by the handler is dropped outside the lock.
                    drop(returned);
                    return;
                }
                None => {
                    log::debug!(
                        "async publish to '{}' failed: {} (err_code {})",
                        pending.subject,
                        failure.text,
                        failure.err_code
                    );
                }
            }
        }
    }

    if !state.destroyed {
        inner.wake_waiters(&state);
    }
}

/// Holds a dispatch slot while the error handler runs. Released on drop, so
/// a panicking handler does not leave the slot counted forever.
struct Dispatching<'a> {
    inner: &'a Inner,
}

impl Drop for Dispatching<'_> {
    fn drop(&mut self) {
        let mut state = match self.inner.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.dispatching -= 1;
        if !state.destroyed {
            self.inner.wake_waiters(&state);
        }
    }
}
