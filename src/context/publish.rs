//! Async publish with backpressure, plus the blocking request/ack publish.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;

use super::{ContextHandle, Inner, PublishError, ReplyListener, State};
use crate::api::{self, PubAck};
use crate::config::PubOptions;
use crate::message::Message;
use crate::subject::validate_subject;
use crate::token::new_token;
use crate::{Error, Result};

enum Gate {
    Open,
    Expired,
    Closed,
    Poisoned,
}

impl ContextHandle {
    /// Publishes `data` on `subject` without waiting for the ack.
    ///
    /// Returns once the message is sent. The outcome is reported to the error
    /// handler if it fails; [`ContextHandle::flush_async`] waits for all of them.
    pub fn publish_async(&self, subject: &str, data: impl Into<Bytes>) -> Result<()> {
        self.publish_async_message(Message::new(subject, data))
            .map_err(PublishError::into_error)
    }

    pub fn publish_async_with_options(
        &self,
        subject: &str,
        data: impl Into<Bytes>,
        opts: &PubOptions,
    ) -> Result<()> {
        self.publish_async_message_with_options(Message::new(subject, data), Some(opts))
            .map_err(PublishError::into_error)
    }

    /// Publishes a pre-built message. The reply subject must not be set.
    ///
    /// On error the message is handed back when the context did not keep it.
    pub fn publish_async_message(&self, msg: Message) -> std::result::Result<(), PublishError> {
        self.publish_async_message_with_options(msg, None)
    }

    pub fn publish_async_message_with_options(
        &self,
        mut msg: Message,
        opts: Option<&PubOptions>,
    ) -> std::result::Result<(), PublishError> {
        if msg.reply.is_some() {
            return Err(PublishError::new(
                Error::InvalidArgument("reply subject should not be set".to_string()),
                msg,
            ));
        }
        if let Err(err) = validate_subject(&msg.subject) {
            return Err(PublishError::new(err, msg));
        }
        if let Some(opts) = opts {
            opts.apply_headers(&mut msg);
        }

        let inner = &self.inner;
        let mut state = match inner.lock() {
            Ok(state) => state,
            Err(err) => return Err(PublishError::new(err, msg)),
        };
        if state.destroyed {
            return Err(PublishError::new(Error::ContextClosed, msg));
        }
        let (reply, token) = match reply_subject(inner, &mut state) {
            Ok(minted) => minted,
            Err(err) => return Err(PublishError::new(err, msg)),
        };
        msg.reply = Some(reply);
        let wire = msg.clone();
        if let Err(mut err) = state.registry.register(token.clone(), msg) {
            if let Some(msg) = err.message.as_mut() {
                msg.reply = None;
            }
            return Err(err);
        }

        let max_pending = inner.settings.max_pending;
        if max_pending > 0 && state.outstanding() > max_pending {
            state.stalled += 1;
            inner.counters.stalls.fetch_add(1, Ordering::Relaxed);
            // `None` when the deadline is past what `Instant` can represent.
            let deadline = Instant::now().checked_add(inner.settings.stall_wait);
            let gate = loop {
                if state.destroyed {
                    break Gate::Closed;
                }
                if state.outstanding() <= max_pending {
                    break Gate::Open;
                }
                let wait = match deadline {
                    None => None,
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            break Gate::Expired;
                        }
                        Some(deadline - now)
                    }
                };
                let (guard, poisoned) = inner.wait(state, wait);
                state = guard;
                if poisoned {
                    break Gate::Poisoned;
                }
            };
            state.stalled -= 1;

            let error = match gate {
                Gate::Open => None,
                // The registry was drained by close; the message went with it.
                Gate::Closed => return Err(Error::ContextClosed.into()),
                Gate::Expired => {
                    log::warn!(
                        "async publish stalled for {:?} with {} outstanding",
                        inner.settings.stall_wait,
                        max_pending
                    );
                    Some(Error::StallTimeout)
                }
                Gate::Poisoned => Some(Error::LockPoisoned("context state")),
            };
            if let Some(error) = error {
                let held = state.registry.resolve(&token);
                inner.wake_waiters(&state);
                drop(state);
                return Err(match held {
                    Some(mut msg) => {
                        msg.reply = None;
                        PublishError::new(error, msg)
                    }
                    None => error.into(),
                });
            }
        }
        drop(state);

        let Err(err) = inner.transport.publish(&wire) else {
            return Ok(());
        };

        let mut state = inner.lock()?;
        if state.destroyed {
            return Err(err.into());
        }
        match state.registry.resolve(&token) {
            // An ack (or a no-responders reply) got here first and owns the
            // outcome; the send counts as done.
            None => {
                log::trace!("send failure for token {token} already resolved: {err}");
                Ok(())
            }
            Some(mut msg) => {
                inner.wake_waiters(&state);
                drop(state);
                msg.reply = None;
                Err(PublishError::new(err, msg))
            }
        }
    }

    /// Publishes and waits for the stream's ack.
    pub fn publish(
        &self,
        subject: &str,
        data: impl Into<Bytes>,
        opts: Option<&PubOptions>,
    ) -> Result<PubAck> {
        self.publish_message(&Message::new(subject, data), opts)
    }

    pub fn publish_message(&self, msg: &Message, opts: Option<&PubOptions>) -> Result<PubAck> {
        self.ensure_open()?;
        validate_subject(&msg.subject)?;

        let mut request = msg.clone();
        request.reply = None;
        let mut wait = self.inner.settings.wait;
        if let Some(opts) = opts {
            if let Some(max_wait) = opts.max_wait_override()? {
                wait = max_wait;
            }
            opts.apply_headers(&mut request);
        }

        let reply = self.inner.transport.request(&request, wait)?;
        if reply.is_no_responders() {
            return Err(Error::NoResponders);
        }
        api::decode_response(&reply.data)
    }
}

/// Starts the reply listener if needed and mints a fresh `(reply, token)`.
fn reply_subject(inner: &Arc<Inner>, state: &mut State) -> Result<(String, String)> {
    if state.listener.is_none() {
        state.listener = Some(ReplyListener::start(inner)?);
    }
    let Some(listener) = state.listener.as_ref() else {
        return Err(Error::ContextClosed);
    };
    let token = new_token();
    Ok((listener.prefix().reply_subject(&token), token))
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::config::ContextConfig;
    use crate::context::Context;
    use crate::transport::{MemoryTransport, Subscription, Transport};

    /// Context on a transport whose `SINK` subscriber never acks.
    fn sink_context(config: ContextConfig) -> Result<(Context, Box<dyn Subscription>)> {
        let transport = Arc::new(MemoryTransport::new());
        let sink = transport.subscribe("SINK", Box::new(|_| {}))?;
        Ok((Context::open(transport, config)?, sink))
    }

    #[test]
    fn poisoned_gate_undoes_the_stall_and_hands_the_message_back() -> Result<()> {
        let (js, _sink) = sink_context(
            ContextConfig::default()
                .with_max_pending(1)
                .with_stall_wait(Duration::from_millis(300)),
        )?;
        js.publish_async("SINK", "1")?;

        let handle = js.handle();
        let stalled = thread::spawn(move || handle.publish_async_message(Message::new("SINK", "2")));
        let deadline = Instant::now() + Duration::from_secs(2);
        while js.stats().stalls == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(js.stats().stalls, 1);
        js.handle.inner.poison();

        let err = stalled.join().expect("publisher thread").unwrap_err();
        assert!(matches!(err.error, Error::LockPoisoned(_)));
        let back = err.message.expect("message handed back");
        assert_eq!(&back.data[..], b"2");
        assert!(back.reply.is_none());

        let state = js
            .handle
            .inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        assert_eq!(state.stalled, 0);
        assert_eq!(state.registry.len(), 1);
        Ok(())
    }

    #[test]
    fn pending_count_survives_a_poisoned_lock() -> Result<()> {
        let (js, _sink) = sink_context(ContextConfig::default())?;
        js.publish_async("SINK", "1")?;
        js.publish_async("SINK", "2")?;
        js.handle.inner.poison();

        assert_eq!(js.pending_count(), 2);
        assert_eq!(js.stats().pending, 2);
        Ok(())
    }
}
