use std::time::{Duration, Instant};

use super::ContextHandle;
use crate::config::PubOptions;
use crate::{Error, Result};

impl ContextHandle {
    /// Blocks until every outstanding async publish is resolved.
    ///
    /// `None` or a zero timeout waits indefinitely.
    pub fn flush_async(&self, timeout: Option<Duration>) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.lock()?;
        if state.destroyed {
            return Err(Error::ContextClosed);
        }
        if state.outstanding() == 0 {
            return Ok(());
        }

        // A timeout too large for `Instant` waits indefinitely.
        let deadline = timeout
            .filter(|t| !t.is_zero())
            .and_then(|t| Instant::now().checked_add(t));
        state.drain_waiters += 1;
        let outcome = loop {
            if state.destroyed {
                break Err(Error::ContextClosed);
            }
            if state.outstanding() == 0 {
                break Ok(());
            }
            let wait = match deadline {
                None => None,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break Err(Error::DrainTimeout);
                    }
                    Some(deadline - now)
                }
            };
            let (guard, poisoned) = inner.wait(state, wait);
            state = guard;
            if poisoned {
                break Err(Error::LockPoisoned("context state"));
            }
        };
        state.drain_waiters -= 1;
        outcome
    }

    /// Same as [`ContextHandle::flush_async`], using `opts.max_wait_ms` as the
    /// timeout.
    pub fn publish_async_complete(&self, opts: Option<&PubOptions>) -> Result<()> {
        let timeout = match opts {
            Some(opts) => opts.max_wait_override()?,
            None => None,
        };
        self.flush_async(timeout)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::config::ContextConfig;
    use crate::context::Context;
    use crate::transport::{MemoryTransport, Transport};

    #[test]
    fn poisoned_drain_unregisters_its_waiter() -> Result<()> {
        let transport = Arc::new(MemoryTransport::new());
        let _sink = transport.subscribe("SINK", Box::new(|_| {}))?;
        let js = Context::open(transport, ContextConfig::default())?;
        js.publish_async("SINK", "1")?;

        let handle = js.handle();
        let drainer = thread::spawn(move || handle.flush_async(Some(Duration::from_millis(300))));
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let waiting = match js.handle.inner.state.lock() {
                Ok(state) => state.drain_waiters,
                Err(_) => 0,
            };
            if waiting == 1 || Instant::now() >= deadline {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        js.handle.inner.poison();

        let err = drainer.join().expect("drainer thread").unwrap_err();
        assert!(matches!(err, Error::LockPoisoned(_)));
        let state = js
            .handle
            .inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        assert_eq!(state.drain_waiters, 0);
        assert_eq!(state.registry.len(), 1);
        Ok(())
    }
}
