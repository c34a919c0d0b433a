//! The pub/sub transport the context runs on.
//!
//! The context only borrows a transport; connection management, reconnection
//! and the wire protocol live behind this trait. [`memory::MemoryTransport`] is
//! an in-process loopback used by the tests, the bench and `js-pub`.

use std::time::Duration;

use crate::message::Message;
use crate::Result;

pub mod memory;

pub use memory::MemoryTransport;

/// Callback invoked on a transport-owned thread for every delivered message.
pub type MessageHandler = Box<dyn Fn(Message) + Send + Sync>;

/// Hook run once, after the last delivery of an unsubscribed subscription.
pub type CompleteHook = Box<dyn FnOnce() + Send>;

/// Prefix of every inbox returned by [`Transport::new_inbox`].
pub const INBOX_PREFIX: &str = "_INBOX.";

pub trait Transport: Send + Sync {
    /// Fire-and-forget send. The message's reply subject and headers travel with it.
    fn publish(&self, msg: &Message) -> Result<()>;

    /// Blocking request/reply.
    ///
    /// Returns `Error::NoResponders` when nothing listens on the subject and
    /// `Error::Timeout` when no reply arrives in time.
    fn request(&self, msg: &Message, timeout: Duration) -> Result<Message>;

    /// Asynchronous subscription; `handler` runs on a transport thread.
    fn subscribe(&self, pattern: &str, handler: MessageHandler) -> Result<Box<dyn Subscription>>;

    /// A transport-unique subject of the form `_INBOX.<unique>`.
    fn new_inbox(&self) -> String;
}

pub trait Subscription: Send + Sync {
    fn subject(&self) -> &str;

    /// Limits buffered, undelivered messages. `None` means unlimited.
    fn set_pending_limits(&self, msgs: Option<usize>, bytes: Option<usize>) -> Result<()>;

    /// Messages discarded because the pending limits were exceeded.
    fn dropped(&self) -> u64;

    /// Installs the hook run when the subscription has fully stopped.
    fn set_on_complete(&mut self, hook: CompleteHook);

    /// Stops delivery. In-flight callbacks finish before the complete hook runs.
    fn unsubscribe(self: Box<Self>) -> Result<()>;
}
