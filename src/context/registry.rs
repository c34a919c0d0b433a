//! Pending publish registry: correlation token -> in-flight message.
//!
//! Always used with the context lock held. Nothing here blocks.

use std::collections::HashMap;

use super::PublishError;
use crate::message::Message;
use crate::Error;

#[derive(Debug, Default)]
pub(crate) struct PendingRegistry {
    entries: HashMap<String, Message>,
}

impl PendingRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Takes ownership of `message` under `token`.
    ///
    /// On failure the registry is unchanged and the message is handed back.
    pub(crate) fn register(&mut self, token: String, message: Message) -> Result<(), PublishError> {
        if self.entries.try_reserve(1).is_err() {
            return Err(PublishError::new(Error::NoMemory, message));
        }
        if self.entries.contains_key(&token) {
            return Err(PublishError::new(
                Error::InvalidArgument(format!("duplicate correlation token '{token}'")),
                message,
            ));
        }
        self.entries.insert(token, message);
        Ok(())
    }

    /// Removes the entry. `None` means already resolved or never registered.
    pub(crate) fn resolve(&mut self, token: &str) -> Option<Message> {
        self.entries.remove(token)
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, token: &str) -> bool {
        self.entries.contains_key(token)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Empties the registry, returning the orphaned messages.
    pub(crate) fn drain(&mut self) -> Vec<Message> {
        self.entries.drain().map(|(_, message)| message).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(n: usize) -> Message {
        Message::new(format!("ORDERS.{n}"), format!("payload-{n}"))
    }

    #[test]
    fn size_tracks_registered_minus_resolved() {
        let mut registry = PendingRegistry::new();
        for n in 0..10 {
            registry.register(format!("tok{n:05}"), msg(n)).expect("register");
        }
        assert_eq!(registry.len(), 10);

        for n in (0..10).step_by(2) {
            let resolved = registry.resolve(&format!("tok{n:05}")).expect("resolve");
            assert_eq!(resolved.subject, format!("ORDERS.{n}"));
        }
        assert_eq!(registry.len(), 5);
        assert!(registry.contains("tok00001"));
        assert!(!registry.contains("tok00002"));
    }

    #[test]
    fn resolving_twice_or_unknown_is_a_no_op() {
        let mut registry = PendingRegistry::new();
        registry.register("abc".to_string(), msg(1)).expect("register");
        assert!(registry.resolve("abc").is_some());
        assert!(registry.resolve("abc").is_none());
        assert!(registry.resolve("never").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn duplicate_token_hands_message_back() {
        let mut registry = PendingRegistry::new();
        registry.register("dup".to_string(), msg(1)).expect("register");
        let err = registry.register("dup".to_string(), msg(2)).unwrap_err();
        assert!(matches!(err.error, Error::InvalidArgument(_)));
        assert_eq!(err.message.expect("message back").subject, "ORDERS.2");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn drain_returns_every_orphan() {
        let mut registry = PendingRegistry::new();
        for n in 0..3 {
            registry.register(format!("t{n}"), msg(n)).expect("register");
        }
        let orphans = registry.drain();
        assert_eq!(orphans.len(), 3);
        assert!(registry.is_empty());
    }
}
