//! Messages exchanged with the transport.

use std::collections::BTreeMap;

use bytes::Bytes;

pub const MSG_ID_HDR: &str = "Nats-Msg-Id";
pub const EXPECTED_STREAM_HDR: &str = "Nats-Expected-Stream";
pub const EXPECTED_LAST_SEQ_HDR: &str = "Nats-Expected-Last-Sequence";
pub const EXPECTED_LAST_SUBJECT_SEQ_HDR: &str = "Nats-Expected-Last-Subject-Sequence";
pub const EXPECTED_LAST_MSG_ID_HDR: &str = "Nats-Expected-Last-Msg-Id";

/// Header carrying an inline protocol status (e.g. `503` for no responders).
pub const STATUS_HDR: &str = "Status";
pub const NO_RESPONDERS_STATUS: &str = "503";

/// Multi-valued header map. Keys are kept as given.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: BTreeMap<String, Vec<String>>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces all values of `key` with `value`.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), vec![value.into()]);
    }

    pub fn append(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.entry(key.into()).or_default().push(value.into());
    }

    /// First value of `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(key)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn values(&self, key: &str) -> &[String] {
        self.entries.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn remove(&mut self, key: &str) -> Option<Vec<String>> {
        self.entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub subject: String,
    pub reply: Option<String>,
    pub headers: Headers,
    pub data: Bytes,
}

impl Message {
    pub fn new(subject: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            reply: None,
            headers: Headers::new(),
            data: data.into(),
        }
    }

    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.set(key, value);
        self
    }

    /// Status-only message signalling that nobody listens on the request subject.
    pub fn no_responders(subject: impl Into<String>) -> Self {
        Self::new(subject, Bytes::new()).with_header(STATUS_HDR, NO_RESPONDERS_STATUS)
    }

    pub fn status(&self) -> Option<&str> {
        self.headers.get(STATUS_HDR)
    }

    pub fn is_no_responders(&self) -> bool {
        self.data.is_empty() && self.status() == Some(NO_RESPONDERS_STATUS)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_responders_requires_status_and_empty_body() {
        let msg = Message::no_responders("_INBOX.x");
        assert!(msg.is_no_responders());

        let mut with_body = Message::no_responders("_INBOX.x");
        with_body.data = Bytes::from_static(b"{}");
        assert!(!with_body.is_no_responders());

        assert!(!Message::new("_INBOX.x", Bytes::new()).is_no_responders());
    }

    #[test]
    fn headers_set_replaces_and_append_accumulates() {
        let mut headers = Headers::new();
        headers.append("A", "1");
        headers.append("A", "2");
        assert_eq!(headers.values("A"), ["1", "2"]);
        headers.set("A", "3");
        assert_eq!(headers.get("A"), Some("3"));
        assert_eq!(headers.len(), 1);
        assert!(headers.remove("A").is_some());
        assert!(headers.is_empty());
    }
}
