//! Context and publish configuration.
//!
//! Durations are carried as signed milliseconds so that configuration read
//! from a document can be rejected when negative; `0` selects the default.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::context::{ContextHandle, PubAckError};
use crate::message::{
    Message, EXPECTED_LAST_MSG_ID_HDR, EXPECTED_LAST_SEQ_HDR, EXPECTED_LAST_SUBJECT_SEQ_HDR,
    EXPECTED_STREAM_HDR, MSG_ID_HDR,
};
use crate::{Error, Result};

pub const DEFAULT_API_PREFIX: &str = "$JS.API";
pub const DEFAULT_REQUEST_WAIT_MS: i64 = 5000;
pub const DEFAULT_STALL_WAIT_MS: i64 = 200;

/// Called on a transport thread for every asynchronous publish that failed.
///
/// The handler owns the failed message. Returning `None` means it kept the
/// message (for instance resubmitted it through the handle); returning
/// `Some` hands it back to the context, which drops it.
pub type ErrorHandler = Arc<dyn Fn(&ContextHandle, PubAckError) -> Option<Message> + Send + Sync>;

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// API subject prefix. Default: `$JS.API`.
    pub api_prefix: Option<String>,

    /// JetStream domain; when set the prefix becomes `$JS.<domain>.API`.
    pub domain: Option<String>,

    /// Request timeout for synchronous calls (ms).
    /// Default: 5000
    pub wait_ms: i64,

    pub publish_async: AsyncPublishConfig,

    #[serde(skip)]
    pub error_handler: Option<ErrorHandler>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AsyncPublishConfig {
    /// Outstanding async publishes allowed before publishers stall. `0` = unbounded.
    pub max_pending: usize,

    /// How long a stalled publisher waits for room (ms).
    /// Default: 200
    pub stall_wait_ms: i64,
}

impl Default for AsyncPublishConfig {
    fn default() -> Self {
        Self {
            max_pending: 0,
            stall_wait_ms: DEFAULT_STALL_WAIT_MS,
        }
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            api_prefix: None,
            domain: None,
            wait_ms: DEFAULT_REQUEST_WAIT_MS,
            publish_async: AsyncPublishConfig::default(),
            error_handler: None,
        }
    }
}

impl fmt::Debug for ContextConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextConfig")
            .field("api_prefix", &self.api_prefix)
            .field("domain", &self.domain)
            .field("wait_ms", &self.wait_ms)
            .field("publish_async", &self.publish_async)
            .field("error_handler", &self.error_handler.is_some())
            .finish()
    }
}

impl ContextConfig {
    pub fn from_json_str(doc: &str) -> Result<Self> {
        Ok(serde_json::from_str(doc)?)
    }

    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.publish_async.max_pending = max_pending;
        self
    }

    pub fn with_stall_wait(mut self, stall_wait: Duration) -> Self {
        self.publish_async.stall_wait_ms = duration_to_ms(stall_wait);
        self
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait_ms = duration_to_ms(wait);
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_api_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.api_prefix = Some(prefix.into());
        self
    }

    pub fn with_error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&ContextHandle, PubAckError) -> Option<Message> + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    /// Checks the configuration and fills in defaults.
    pub(crate) fn resolve(self) -> Result<Settings> {
        if self.wait_ms < 0 {
            return Err(Error::InvalidArgument(format!(
                "option 'Wait' ({}) cannot be negative",
                self.wait_ms
            )));
        }
        if self.publish_async.stall_wait_ms < 0 {
            return Err(Error::InvalidArgument(format!(
                "option 'PublishAsyncStallWait' ({}) cannot be negative",
                self.publish_async.stall_wait_ms
            )));
        }
        let wait_ms = if self.wait_ms == 0 { DEFAULT_REQUEST_WAIT_MS } else { self.wait_ms };
        let stall_wait_ms = match self.publish_async.stall_wait_ms {
            0 => DEFAULT_STALL_WAIT_MS,
            ms => ms,
        };
        Ok(Settings {
            api_prefix: api_prefix(self.domain.as_deref(), self.api_prefix.as_deref()),
            wait: Duration::from_millis(wait_ms as u64),
            max_pending: self.publish_async.max_pending,
            stall_wait: Duration::from_millis(stall_wait_ms as u64),
            error_handler: self.error_handler,
        })
    }
}

/// Validated, immutable context settings.
pub(crate) struct Settings {
    pub api_prefix: String,
    pub wait: Duration,
    pub max_pending: usize,
    pub stall_wait: Duration,
    pub error_handler: Option<ErrorHandler>,
}

fn api_prefix(domain: Option<&str>, prefix: Option<&str>) -> String {
    match (domain.filter(|d| !d.is_empty()), prefix.filter(|p| !p.is_empty())) {
        (Some(domain), _) => format!("$JS.{}.API", trim_trailing_dot(domain)),
        (None, Some(prefix)) => trim_trailing_dot(prefix).to_string(),
        (None, None) => DEFAULT_API_PREFIX.to_string(),
    }
}

fn trim_trailing_dot(s: &str) -> &str {
    s.strip_suffix('.').unwrap_or(s)
}

fn duration_to_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Per-publish options. Expectation headers are checked by the server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PubOptions {
    pub msg_id: Option<String>,
    pub expect_stream: Option<String>,
    pub expect_last_msg_id: Option<String>,
    pub expect_last_seq: u64,
    pub expect_last_subject_seq: u64,

    /// Request timeout override for synchronous publish (ms). `0` = context wait.
    pub max_wait_ms: i64,
}

impl PubOptions {
    pub fn msg_id(mut self, id: impl Into<String>) -> Self {
        self.msg_id = Some(id.into());
        self
    }

    pub fn expect_stream(mut self, stream: impl Into<String>) -> Self {
        self.expect_stream = Some(stream.into());
        self
    }

    pub fn expect_last_seq(mut self, seq: u64) -> Self {
        self.expect_last_seq = seq;
        self
    }

    pub fn max_wait(mut self, wait: Duration) -> Self {
        self.max_wait_ms = duration_to_ms(wait);
        self
    }

    pub(crate) fn max_wait_override(&self) -> Result<Option<Duration>> {
        match self.max_wait_ms {
            ms if ms < 0 => Err(Error::InvalidArgument(format!(
                "option 'MaxWait' ({ms}) cannot be negative"
            ))),
            0 => Ok(None),
            ms => Ok(Some(Duration::from_millis(ms as u64))),
        }
    }

    pub(crate) fn apply_headers(&self, msg: &mut Message) {
        if let Some(id) = self.msg_id.as_deref().filter(|s| !s.is_empty()) {
            msg.headers.set(MSG_ID_HDR, id);
        }
        if let Some(id) = self.expect_last_msg_id.as_deref().filter(|s| !s.is_empty()) {
            msg.headers.set(EXPECTED_LAST_MSG_ID_HDR, id);
        }
        if let Some(stream) = self.expect_stream.as_deref().filter(|s| !s.is_empty()) {
            msg.headers.set(EXPECTED_STREAM_HDR, stream);
        }
        if self.expect_last_seq > 0 {
            msg.headers
                .set(EXPECTED_LAST_SEQ_HDR, self.expect_last_seq.to_string());
        }
        if self.expect_last_subject_seq > 0 {
            msg.headers.set(
                EXPECTED_LAST_SUBJECT_SEQ_HDR,
                self.expect_last_subject_seq.to_string(),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn zero_durations_select_defaults() -> Result<()> {
        let settings = ContextConfig {
            wait_ms: 0,
            publish_async: AsyncPublishConfig {
                max_pending: 4,
                stall_wait_ms: 0,
            },
            ..ContextConfig::default()
        }
        .resolve()?;
        assert_eq!(settings.wait, Duration::from_millis(5000));
        assert_eq!(settings.stall_wait, Duration::from_millis(200));
        assert_eq!(settings.max_pending, 4);
        assert_eq!(settings.api_prefix, DEFAULT_API_PREFIX);
        Ok(())
    }

    #[test]
    fn negative_durations_are_rejected() {
        let err = ContextConfig {
            wait_ms: -1,
            ..ContextConfig::default()
        }
        .resolve()
        .err()
        .expect("negative wait");
        assert!(err.to_string().contains("'Wait' (-1)"));

        let mut config = ContextConfig::default();
        config.publish_async.stall_wait_ms = -5;
        let err = config.resolve().err().expect("negative stall wait");
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn prefix_from_domain_or_custom() {
        assert_eq!(api_prefix(Some("hub."), None), "$JS.hub.API");
        assert_eq!(api_prefix(Some("hub"), Some("X")), "$JS.hub.API");
        assert_eq!(api_prefix(None, Some("MY.API.")), "MY.API");
        assert_eq!(api_prefix(Some(""), None), DEFAULT_API_PREFIX);
    }

    #[test]
    fn config_loads_from_json() -> Result<()> {
        let config = ContextConfig::from_json_str(
            r#"{"domain":"leaf","publish_async":{"max_pending":256}}"#,
        )?;
        assert_eq!(config.domain.as_deref(), Some("leaf"));
        assert_eq!(config.publish_async.max_pending, 256);
        assert_eq!(config.publish_async.stall_wait_ms, DEFAULT_STALL_WAIT_MS);
        assert_eq!(config.wait_ms, DEFAULT_REQUEST_WAIT_MS);
        Ok(())
    }

    #[test]
    fn pub_options_set_expectation_headers() -> Result<()> {
        let opts = PubOptions::default()
            .msg_id("m-1")
            .expect_stream("ORDERS")
            .expect_last_seq(7);
        let mut msg = Message::new("ORDERS.new", Bytes::new());
        opts.apply_headers(&mut msg);
        assert_eq!(msg.headers.get(MSG_ID_HDR), Some("m-1"));
        assert_eq!(msg.headers.get(EXPECTED_STREAM_HDR), Some("ORDERS"));
        assert_eq!(msg.headers.get(EXPECTED_LAST_SEQ_HDR), Some("7"));
        assert!(msg.headers.get(EXPECTED_LAST_SUBJECT_SEQ_HDR).is_none());

        assert_eq!(opts.max_wait_override()?, None);
        let bad = PubOptions {
            max_wait_ms: -3,
            ..PubOptions::default()
        };
        assert!(bad.max_wait_override().is_err());
        Ok(())
    }
}
