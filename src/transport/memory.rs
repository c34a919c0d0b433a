//! In-process loopback transport.
//!
//! Every subscription owns a dispatch thread fed by an unbounded channel, so
//! handlers run off the publisher's thread the way a network client delivers
//! messages. A publish with a reply subject that matches no subscription gets
//! a no-responders status message back on the reply subject.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use rand::Rng;

use super::{CompleteHook, MessageHandler, Subscription, Transport, INBOX_PREFIX};
use crate::message::Message;
use crate::subject::{self, validate_pattern, validate_subject};
use crate::{Error, Result};

pub const DEFAULT_PENDING_MSGS_LIMIT: usize = 65_536;
pub const DEFAULT_PENDING_BYTES_LIMIT: usize = 64 * 1024 * 1024;

const NUID_LEN: usize = 22;
const NUID_DIGITS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

#[derive(Clone, Default)]
pub struct MemoryTransport {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    routes: Mutex<Vec<Route>>,
    closed: AtomicBool,
    fail_publishes: AtomicBool,
    fail_subscribes: AtomicUsize,
    published: AtomicU64,
    next_sid: AtomicU64,
}

struct Route {
    sid: u64,
    pattern: String,
    tx: Sender<Delivery>,
    pending: Arc<Pending>,
}

enum Delivery {
    Msg(Message),
    Stop,
}

struct Pending {
    max_msgs: AtomicUsize,
    max_bytes: AtomicUsize,
    msgs: AtomicUsize,
    bytes: AtomicUsize,
    dropped: AtomicU64,
}

impl Pending {
    fn new() -> Self {
        Self {
            max_msgs: AtomicUsize::new(DEFAULT_PENDING_MSGS_LIMIT),
            max_bytes: AtomicUsize::new(DEFAULT_PENDING_BYTES_LIMIT),
            msgs: AtomicUsize::new(0),
            bytes: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    fn try_admit(&self, len: usize) -> bool {
        let msgs = self.msgs.fetch_add(1, Ordering::AcqRel) + 1;
        let bytes = self.bytes.fetch_add(len, Ordering::AcqRel) + len;
        if msgs > self.max_msgs.load(Ordering::Acquire) || bytes > self.max_bytes.load(Ordering::Acquire) {
            self.release(len);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    fn release(&self, len: usize) {
        self.msgs.fetch_sub(1, Ordering::AcqRel);
        self.bytes.fetch_sub(len, Ordering::AcqRel);
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent publish fail as if no server were reachable.
    pub fn fail_publishes(&self, fail: bool) {
        self.shared.fail_publishes.store(fail, Ordering::Release);
    }

    /// Makes the next subscribe call fail.
    pub fn fail_next_subscribe(&self) {
        self.shared.fail_subscribes.fetch_add(1, Ordering::AcqRel);
    }

    /// Number of messages accepted by `publish`.
    pub fn published(&self) -> u64 {
        self.shared.published.load(Ordering::Acquire)
    }

    /// Number of active subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.shared.routes.lock().map(|routes| routes.len()).unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Closes the transport. Subscriptions stop and further calls fail.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let routes = match self.shared.routes.lock() {
            Ok(mut routes) => std::mem::take(&mut *routes),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for route in routes {
            let _ = route.tx.send(Delivery::Stop);
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        Ok(())
    }

    fn route(&self, msg: &Message) -> Result<usize> {
        let targets = {
            let routes = self
                .shared
                .routes
                .lock()
                .map_err(|_| Error::LockPoisoned("memory transport routes"))?;
            routes
                .iter()
                .filter(|route| subject::matches(&route.pattern, &msg.subject))
                .map(|route| (route.sid, route.tx.clone(), Arc::clone(&route.pending)))
                .collect::<Vec<_>>()
        };
        let mut delivered = 0;
        for (sid, tx, pending) in targets {
            if !pending.try_admit(msg.len()) {
                log::warn!(
                    "slow consumer on subscription {sid}, dropping message on '{}'",
                    msg.subject
                );
                continue;
            }
            if tx.send(Delivery::Msg(msg.clone())).is_err() {
                pending.release(msg.len());
                continue;
            }
            delivered += 1;
        }
        Ok(delivered)
    }

    fn remove_route(shared: &Shared, sid: u64) {
        let removed = match shared.routes.lock() {
            Ok(mut routes) => take_route(&mut routes, sid),
            Err(poisoned) => take_route(&mut poisoned.into_inner(), sid),
        };
        if let Some(route) = removed {
            let _ = route.tx.send(Delivery::Stop);
        }
    }
}

fn take_route(routes: &mut Vec<Route>, sid: u64) -> Option<Route> {
    let idx = routes.iter().position(|route| route.sid == sid)?;
    Some(routes.swap_remove(idx))
}

impl Transport for MemoryTransport {
    fn publish(&self, msg: &Message) -> Result<()> {
        self.check_open()?;
        if self.shared.fail_publishes.load(Ordering::Acquire) {
            return Err(Error::Transport("no server available".to_string()));
        }
        validate_subject(&msg.subject)?;
        self.shared.published.fetch_add(1, Ordering::AcqRel);

        let delivered = self.route(msg)?;
        if delivered == 0 {
            if let Some(reply) = msg.reply.as_deref() {
                self.route(&Message::no_responders(reply))?;
            }
        }
        Ok(())
    }

    fn request(&self, msg: &Message, timeout: Duration) -> Result<Message> {
        self.check_open()?;
        let inbox = self.new_inbox();
        let (tx, rx) = crossbeam_channel::bounded(1);
        let sub = self.subscribe(
            &inbox,
            Box::new(move |reply| {
                let _ = tx.try_send(reply);
            }),
        )?;

        let mut request = msg.clone();
        request.reply = Some(inbox);
        let outcome = self.publish(&request).and_then(|()| match rx.recv_timeout(timeout) {
            Ok(reply) if reply.is_no_responders() => Err(Error::NoResponders),
            Ok(reply) => Ok(reply),
            Err(RecvTimeoutError::Timeout) => Err(Error::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(Error::ConnectionClosed),
        });
        let _ = sub.unsubscribe();
        outcome
    }

    fn subscribe(&self, pattern: &str, handler: MessageHandler) -> Result<Box<dyn Subscription>> {
        self.check_open()?;
        let injected = self
            .shared
            .fail_subscribes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::Transport(format!("subscribe to '{pattern}' failed")));
        }
        validate_pattern(pattern)?;

        let sid = self.shared.next_sid.fetch_add(1, Ordering::AcqRel) + 1;
        let (tx, rx) = crossbeam_channel::unbounded();
        let pending = Arc::new(Pending::new());
        let on_complete: Arc<Mutex<Option<CompleteHook>>> = Arc::new(Mutex::new(None));
        let active = Arc::new(AtomicBool::new(true));

        let worker = DispatchWorker {
            rx,
            handler,
            pending: Arc::clone(&pending),
            active: Arc::clone(&active),
            on_complete: Arc::clone(&on_complete),
        };
        thread::Builder::new()
            .name(format!("memsub-{sid}"))
            .spawn(move || worker.run())
            .map_err(|err| Error::Transport(format!("spawn dispatch thread: {err}")))?;

        self.shared
            .routes
            .lock()
            .map_err(|_| Error::LockPoisoned("memory transport routes"))?
            .push(Route {
                sid,
                pattern: pattern.to_string(),
                tx,
                pending: Arc::clone(&pending),
            });

        Ok(Box::new(MemorySubscription {
            sid,
            subject: pattern.to_string(),
            shared: Arc::clone(&self.shared),
            pending,
            active,
            on_complete,
            stopped: false,
        }))
    }

    fn new_inbox(&self) -> String {
        let mut rng = rand::thread_rng();
        let mut inbox = String::with_capacity(INBOX_PREFIX.len() + NUID_LEN);
        inbox.push_str(INBOX_PREFIX);
        for _ in 0..NUID_LEN {
            inbox.push(NUID_DIGITS[rng.gen_range(0..NUID_DIGITS.len())] as char);
        }
        inbox
    }
}

struct DispatchWorker {
    rx: Receiver<Delivery>,
    handler: MessageHandler,
    pending: Arc<Pending>,
    active: Arc<AtomicBool>,
    on_complete: Arc<Mutex<Option<CompleteHook>>>,
}

impl DispatchWorker {
    fn run(self) {
        while let Ok(delivery) = self.rx.recv() {
            match delivery {
                Delivery::Msg(msg) => {
                    self.pending.release(msg.len());
                    if self.active.load(Ordering::Acquire) {
                        (self.handler)(msg);
                    }
                }
                Delivery::Stop => break,
            }
        }
        // Release the handler before the hook so captured state drops first.
        drop(self.handler);
        let hook = match self.on_complete.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(hook) = hook {
            hook();
        }
    }
}

pub struct MemorySubscription {
    sid: u64,
    subject: String,
    shared: Arc<Shared>,
    pending: Arc<Pending>,
    active: Arc<AtomicBool>,
    on_complete: Arc<Mutex<Option<CompleteHook>>>,
    stopped: bool,
}

impl MemorySubscription {
    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.active.store(false, Ordering::Release);
        MemoryTransport::remove_route(&self.shared, self.sid);
    }
}

impl Subscription for MemorySubscription {
    fn subject(&self) -> &str {
        &self.subject
    }

    fn set_pending_limits(&self, msgs: Option<usize>, bytes: Option<usize>) -> Result<()> {
        if msgs == Some(0) || bytes == Some(0) {
            return Err(Error::InvalidArgument(
                "pending limits cannot be zero".to_string(),
            ));
        }
        self.pending
            .max_msgs
            .store(msgs.unwrap_or(usize::MAX), Ordering::Release);
        self.pending
            .max_bytes
            .store(bytes.unwrap_or(usize::MAX), Ordering::Release);
        Ok(())
    }

    fn dropped(&self) -> u64 {
        self.pending.dropped.load(Ordering::Acquire)
    }

    fn set_on_complete(&mut self, hook: CompleteHook) {
        match self.on_complete.lock() {
            Ok(mut slot) => *slot = Some(hook),
            Err(poisoned) => *poisoned.into_inner() = Some(hook),
        }
    }

    fn unsubscribe(mut self: Box<Self>) -> Result<()> {
        self.stop();
        Ok(())
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        self.stop();
    }
}
