//! In-process stream responder.
//!
//! Answers the stream API and acknowledges publishes on a [`Transport`] the way
//! a JetStream server does, so a [`Context`](crate::Context) can be driven
//! without one. Streams only keep counters, never payloads. Faults can be
//! injected per publish: error replies, dropped replies and held replies.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::Serialize;
use serde_json::json;

use crate::api::{
    AccountInfo, ApiError, PubAck, PurgeOptions, StorageType, StreamConfig, StreamInfo, StreamState,
    API_ACCOUNT_INFO, API_STREAM_CREATE, API_STREAM_DELETE, API_STREAM_INFO, API_STREAM_PURGE,
    API_STREAM_UPDATE,
};
use crate::config::DEFAULT_API_PREFIX;
use crate::error::JS_STREAM_NOT_FOUND_ERR;
use crate::message::{
    Message, EXPECTED_LAST_MSG_ID_HDR, EXPECTED_LAST_SEQ_HDR, EXPECTED_LAST_SUBJECT_SEQ_HDR,
    EXPECTED_STREAM_HDR, MSG_ID_HDR,
};
use crate::transport::{Subscription, Transport};
use crate::{Error, Result};

pub const STREAM_NAME_IN_USE_ERR: u16 = 10058;
pub const STREAM_WRONG_LAST_SEQ_ERR: u16 = 10071;
pub const STREAM_WRONG_LAST_MSG_ID_ERR: u16 = 10070;
pub const STREAM_NOT_MATCH_ERR: u16 = 10060;
pub const STREAM_STORE_FAILED_ERR: u16 = 10077;
pub const BAD_REQUEST_ERR: u16 = 10003;

const ZERO_TIME: &str = "0001-01-01T00:00:00Z";

pub struct StreamResponder {
    shared: Arc<Shared>,
    api_sub: Option<Box<dyn Subscription>>,
}

struct Shared {
    transport: Arc<dyn Transport>,
    prefix: String,
    streams: Mutex<BTreeMap<String, SimStream>>,
    fail_every: AtomicU64,
    drop_every: AtomicU64,
    hold: AtomicBool,
    held: Mutex<Vec<Message>>,
    received: AtomicU64,
    api_requests: AtomicU64,
}

struct SimStream {
    config: StreamConfig,
    state: StreamState,
    last_by_subject: HashMap<String, u64>,
    msg_ids: HashMap<String, u64>,
    last_msg_id: Option<String>,
    subs: Vec<Box<dyn Subscription>>,
}

impl StreamResponder {
    /// Serves the API under `$JS.API`.
    pub fn start(transport: Arc<dyn Transport>) -> Result<Self> {
        Self::with_prefix(transport, DEFAULT_API_PREFIX)
    }

    pub fn with_prefix(transport: Arc<dyn Transport>, prefix: &str) -> Result<Self> {
        let prefix = prefix.strip_suffix('.').unwrap_or(prefix).to_string();
        let shared = Arc::new(Shared {
            transport: Arc::clone(&transport),
            prefix: prefix.clone(),
            streams: Mutex::new(BTreeMap::new()),
            fail_every: AtomicU64::new(0),
            drop_every: AtomicU64::new(0),
            hold: AtomicBool::new(false),
            held: Mutex::new(Vec::new()),
            received: AtomicU64::new(0),
            api_requests: AtomicU64::new(0),
        });
        let weak = Arc::downgrade(&shared);
        let api_sub = transport.subscribe(
            &format!("{prefix}.>"),
            Box::new(move |msg| {
                if let Some(shared) = weak.upgrade() {
                    shared.on_api(msg);
                }
            }),
        )?;
        log::debug!("stream responder serving '{prefix}.>'");
        Ok(Self {
            shared,
            api_sub: Some(api_sub),
        })
    }

    /// Every `n`-th publish is answered with an API error. `0` disables.
    pub fn fail_every(&self, n: u64) {
        self.shared.fail_every.store(n, Ordering::Release);
    }

    /// Every `n`-th publish gets no reply at all. `0` disables.
    pub fn drop_every(&self, n: u64) {
        self.shared.drop_every.store(n, Ordering::Release);
    }

    /// While holding, replies to publishes are buffered instead of sent.
    pub fn hold_acks(&self, hold: bool) {
        self.shared.hold.store(hold, Ordering::Release);
    }

    pub fn held(&self) -> usize {
        self.shared.held().map(|held| held.len()).unwrap_or(0)
    }

    /// Sends the buffered replies, returning how many were sent.
    pub fn release_held(&self) -> Result<usize> {
        let held = std::mem::take(&mut *self.shared.held()?);
        let count = held.len();
        for reply in held {
            self.shared.transport.publish(&reply)?;
        }
        Ok(count)
    }

    /// Publishes received on stream subjects, replied to or not.
    pub fn received(&self) -> u64 {
        self.shared.received.load(Ordering::Acquire)
    }

    pub fn api_requests(&self) -> u64 {
        self.shared.api_requests.load(Ordering::Acquire)
    }

    pub fn stream_state(&self, name: &str) -> Option<StreamState> {
        let streams = self.shared.streams().ok()?;
        streams.get(name).map(|stream| stream.state.clone())
    }

    pub fn stream_names(&self) -> Vec<String> {
        self.shared
            .streams()
            .map(|streams| streams.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl Drop for StreamResponder {
    fn drop(&mut self) {
        if let Some(sub) = self.api_sub.take() {
            if let Err(err) = sub.unsubscribe() {
                log::warn!("stream responder unsubscribe failed: {err}");
            }
        }
        let streams = match self.shared.streams.lock() {
            Ok(mut streams) => std::mem::take(&mut *streams),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for (_, stream) in streams {
            stream.unsubscribe();
        }
    }
}

impl SimStream {
    fn info(&self) -> StreamInfo {
        StreamInfo {
            config: self.config.clone(),
            created: ZERO_TIME.to_string(),
            state: self.state.clone(),
            cluster: None,
            mirror: None,
            sources: Vec::new(),
        }
    }

    fn unsubscribe(self) {
        for sub in self.subs {
            if let Err(err) = sub.unsubscribe() {
                log::warn!("stream '{}' unsubscribe failed: {err}", self.config.name);
            }
        }
    }

    /// Checks expectation headers, then stores the message.
    fn store(&mut self, msg: &Message) -> std::result::Result<PubAck, ApiError> {
        let name = &self.config.name;
        if let Some(expected) = msg.headers.get(EXPECTED_STREAM_HDR) {
            if expected != name.as_str() {
                return Err(api_error(400, STREAM_NOT_MATCH_ERR, "expected stream does not match"));
            }
        }
        if let Some(expected) = msg.headers.get(EXPECTED_LAST_SEQ_HDR) {
            if expected.parse::<u64>().ok() != Some(self.state.last_seq) {
                return Err(api_error(
                    400,
                    STREAM_WRONG_LAST_SEQ_ERR,
                    &format!("wrong last sequence: {}", self.state.last_seq),
                ));
            }
        }
        if let Some(expected) = msg.headers.get(EXPECTED_LAST_SUBJECT_SEQ_HDR) {
            let last = self.last_by_subject.get(&msg.subject).copied().unwrap_or(0);
            if expected.parse::<u64>().ok() != Some(last) {
                return Err(api_error(
                    400,
                    STREAM_WRONG_LAST_SEQ_ERR,
                    &format!("wrong last sequence: {last}"),
                ));
            }
        }
        if let Some(expected) = msg.headers.get(EXPECTED_LAST_MSG_ID_HDR) {
            if self.last_msg_id.as_deref() != Some(expected) {
                return Err(api_error(
                    400,
                    STREAM_WRONG_LAST_MSG_ID_ERR,
                    &format!(
                        "wrong last msg ID: {}",
                        self.last_msg_id.as_deref().unwrap_or_default()
                    ),
                ));
            }
        }

        let msg_id = msg.headers.get(MSG_ID_HDR).filter(|id| !id.is_empty());
        if let Some(seq) = msg_id.and_then(|id| self.msg_ids.get(id)) {
            return Ok(PubAck {
                stream: name.clone(),
                seq: *seq,
                duplicate: true,
                domain: None,
            });
        }

        let seq = self.state.last_seq + 1;
        self.state.last_seq = seq;
        if self.state.first_seq == 0 {
            self.state.first_seq = seq;
        }
        self.state.messages += 1;
        self.state.bytes += msg.len() as u64;
        self.last_by_subject.insert(msg.subject.clone(), seq);
        if let Some(id) = msg_id {
            self.msg_ids.insert(id.to_string(), seq);
            self.last_msg_id = Some(id.to_string());
        }
        Ok(PubAck {
            stream: name.clone(),
            seq,
            duplicate: false,
            domain: None,
        })
    }

    fn purge(&mut self, opts: &PurgeOptions) -> u64 {
        let before = self.state.messages;
        let keep = if opts.keep > 0 {
            opts.keep.min(before)
        } else if opts.sequence > 0 {
            // Messages below `seq` go.
            self.state
                .last_seq
                .saturating_add(1)
                .saturating_sub(opts.sequence.max(self.state.first_seq))
                .min(before)
        } else {
            0
        };
        self.state.messages = keep;
        if keep == 0 {
            self.state.bytes = 0;
            self.state.first_seq = self.state.last_seq + 1;
            self.last_by_subject.clear();
        } else {
            self.state.first_seq = self.state.last_seq + 1 - keep;
        }
        before - keep
    }
}

impl Shared {
    fn streams(&self) -> Result<MutexGuard<'_, BTreeMap<String, SimStream>>> {
        self.streams
            .lock()
            .map_err(|_| Error::LockPoisoned("responder streams"))
    }

    fn held(&self) -> Result<MutexGuard<'_, Vec<Message>>> {
        self.held
            .lock()
            .map_err(|_| Error::LockPoisoned("responder held replies"))
    }

    fn respond<T: Serialize>(&self, reply: Option<&str>, body: &T) {
        let Some(reply) = reply else {
            return;
        };
        let data = match serde_json::to_vec(body) {
            Ok(data) => data,
            Err(err) => {
                log::warn!("encoding reply for '{reply}' failed: {err}");
                return;
            }
        };
        if let Err(err) = self.transport.publish(&Message::new(reply, data)) {
            log::warn!("reply to '{reply}' failed: {err}");
        }
    }

    fn on_publish(self: &Arc<Self>, stream: &str, msg: Message) {
        let n = self.received.fetch_add(1, Ordering::AcqRel) + 1;
        let Some(reply) = msg.reply.clone() else {
            return;
        };
        let drop_every = self.drop_every.load(Ordering::Acquire);
        if drop_every > 0 && n % drop_every == 0 {
            log::trace!("dropping reply for publish {n} on '{}'", msg.subject);
            return;
        }
        let fail_every = self.fail_every.load(Ordering::Acquire);
        let outcome = if fail_every > 0 && n % fail_every == 0 {
            Err(api_error(503, STREAM_STORE_FAILED_ERR, "maximum messages exceeded"))
        } else {
            match self.streams() {
                Ok(mut streams) => match streams.get_mut(stream) {
                    Some(stream) => stream.store(&msg),
                    None => Err(not_found()),
                },
                Err(_) => return,
            }
        };

        let body = match outcome {
            Ok(ack) => serde_json::to_value(ack),
            Err(err) => Ok(json!({ "error": err })),
        };
        let data = match body.and_then(|body| serde_json::to_vec(&body)) {
            Ok(data) => data,
            Err(err) => {
                log::warn!("encoding ack failed: {err}");
                return;
            }
        };
        let ack = Message::new(reply, data);
        if self.hold.load(Ordering::Acquire) {
            if let Ok(mut held) = self.held() {
                held.push(ack);
            }
            return;
        }
        if let Err(err) = self.transport.publish(&ack) {
            log::warn!("ack to '{}' failed: {err}", ack.subject);
        }
    }

    fn on_api(self: &Arc<Self>, msg: Message) {
        self.api_requests.fetch_add(1, Ordering::AcqRel);
        let reply = msg.reply.as_deref();
        let Some(endpoint) = msg
            .subject
            .strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix('.'))
        else {
            return;
        };

        let outcome = if endpoint == API_ACCOUNT_INFO {
            self.account_info().map(|info| json!(info))
        } else if let Some(name) = under(endpoint, API_STREAM_CREATE) {
            self.create_stream(name, &msg.data).map(|info| json!(info))
        } else if let Some(name) = under(endpoint, API_STREAM_UPDATE) {
            self.update_stream(name, &msg.data).map(|info| json!(info))
        } else if let Some(name) = under(endpoint, API_STREAM_INFO) {
            self.with_stream(name, |stream| Ok(json!(stream.info())))
        } else if let Some(name) = under(endpoint, API_STREAM_DELETE) {
            self.delete_stream(name)
        } else if let Some(name) = under(endpoint, API_STREAM_PURGE) {
            self.purge_stream(name, &msg.data)
        } else {
            Err(api_error(400, BAD_REQUEST_ERR, "unknown API request"))
        };

        match outcome {
            Ok(body) => self.respond(reply, &body),
            Err(err) => self.respond(reply, &json!({ "error": err })),
        }
    }

    fn subscribe_subjects(
        self: &Arc<Self>,
        name: &str,
        subjects: &[String],
    ) -> std::result::Result<Vec<Box<dyn Subscription>>, ApiError> {
        let mut subs = Vec::with_capacity(subjects.len());
        for subject in subjects {
            let weak: Weak<Shared> = Arc::downgrade(self);
            let stream = name.to_string();
            let sub = self.transport.subscribe(
                subject,
                Box::new(move |msg| {
                    if let Some(shared) = weak.upgrade() {
                        shared.on_publish(&stream, msg);
                    }
                }),
            );
            match sub {
                Ok(sub) => subs.push(sub),
                Err(err) => {
                    for sub in subs {
                        let _ = sub.unsubscribe();
                    }
                    return Err(api_error(500, BAD_REQUEST_ERR, &err.to_string()));
                }
            }
        }
        Ok(subs)
    }

    fn create_stream(self: &Arc<Self>, name: &str, body: &[u8]) -> std::result::Result<StreamInfo, ApiError> {
        let mut config = parse_config(name, body)?;
        let mut streams = self.streams().map_err(internal)?;
        if streams.contains_key(name) {
            return Err(api_error(400, STREAM_NAME_IN_USE_ERR, "stream name already in use"));
        }
        if config.subjects.is_empty() {
            config.subjects = vec![name.to_string()];
        }
        let subs = self.subscribe_subjects(name, &config.subjects)?;
        let stream = SimStream {
            config,
            state: StreamState::default(),
            last_by_subject: HashMap::new(),
            msg_ids: HashMap::new(),
            last_msg_id: None,
            subs,
        };
        let info = stream.info();
        streams.insert(name.to_string(), stream);
        log::debug!("stream '{name}' created on {:?}", info.config.subjects);
        Ok(info)
    }

    fn update_stream(self: &Arc<Self>, name: &str, body: &[u8]) -> std::result::Result<StreamInfo, ApiError> {
        let mut config = parse_config(name, body)?;
        let mut streams = self.streams().map_err(internal)?;
        let Some(stream) = streams.get_mut(name) else {
            return Err(not_found());
        };
        if config.subjects.is_empty() {
            config.subjects = vec![name.to_string()];
        }
        if config.subjects != stream.config.subjects {
            let subs = self.subscribe_subjects(name, &config.subjects)?;
            for old in std::mem::replace(&mut stream.subs, subs) {
                let _ = old.unsubscribe();
            }
        }
        stream.config = config;
        Ok(stream.info())
    }

    fn with_stream<F>(&self, name: &str, f: F) -> std::result::Result<serde_json::Value, ApiError>
    where
        F: FnOnce(&mut SimStream) -> std::result::Result<serde_json::Value, ApiError>,
    {
        let mut streams = self.streams().map_err(internal)?;
        match streams.get_mut(name) {
            Some(stream) => f(stream),
            None => Err(not_found()),
        }
    }

    fn delete_stream(&self, name: &str) -> std::result::Result<serde_json::Value, ApiError> {
        let removed = self.streams().map_err(internal)?.remove(name);
        match removed {
            Some(stream) => {
                stream.unsubscribe();
                Ok(json!({ "success": true }))
            }
            None => Err(not_found()),
        }
    }

    fn purge_stream(&self, name: &str, body: &[u8]) -> std::result::Result<serde_json::Value, ApiError> {
        let opts: PurgeOptions = if body.is_empty() {
            PurgeOptions::default()
        } else {
            serde_json::from_slice(body).map_err(|err| api_error(400, BAD_REQUEST_ERR, &err.to_string()))?
        };
        self.with_stream(name, |stream| {
            let purged = stream.purge(&opts);
            Ok(json!({ "success": true, "purged": purged }))
        })
    }

    fn account_info(&self) -> std::result::Result<AccountInfo, ApiError> {
        let streams = self.streams().map_err(internal)?;
        let mut info = AccountInfo {
            streams: streams.len() as i64,
            ..AccountInfo::default()
        };
        for stream in streams.values() {
            match stream.config.storage {
                StorageType::Memory => info.memory += stream.state.bytes,
                StorageType::File => info.storage += stream.state.bytes,
            }
        }
        info.api.total = self.api_requests.load(Ordering::Acquire);
        info.limits.max_memory = -1;
        info.limits.max_storage = -1;
        info.limits.max_streams = -1;
        info.limits.max_consumers = -1;
        Ok(info)
    }
}

fn under<'a>(endpoint: &'a str, api: &str) -> Option<&'a str> {
    endpoint
        .strip_prefix(api)
        .and_then(|rest| rest.strip_prefix('.'))
        .filter(|name| !name.is_empty() && !name.contains('.'))
}

fn parse_config(name: &str, body: &[u8]) -> std::result::Result<StreamConfig, ApiError> {
    let config: StreamConfig = serde_json::from_slice(body)
        .map_err(|err| api_error(400, BAD_REQUEST_ERR, &err.to_string()))?;
    if config.name != name {
        return Err(api_error(
            400,
            BAD_REQUEST_ERR,
            "stream name in subject does not match request",
        ));
    }
    Ok(config)
}

fn api_error(code: i32, err_code: u16, description: &str) -> ApiError {
    ApiError {
        code,
        err_code,
        description: description.to_string(),
    }
}

fn not_found() -> ApiError {
    api_error(404, JS_STREAM_NOT_FOUND_ERR, "stream not found")
}

fn internal(err: Error) -> ApiError {
    api_error(500, BAD_REQUEST_ERR, &err.to_string())
}
