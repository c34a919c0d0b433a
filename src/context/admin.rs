//! Stream administration over the request/reply API.

use bytes::Bytes;
use serde::de::DeserializeOwned;

use super::ContextHandle;
use crate::api::stream::check_stream_name;
use crate::api::{
    self, AccountInfo, ApiError, PurgeOptions, StreamConfig, StreamInfo, SuccessResponse,
    API_ACCOUNT_INFO, API_STREAM_CREATE, API_STREAM_DELETE, API_STREAM_INFO, API_STREAM_PURGE,
    API_STREAM_UPDATE,
};
use crate::error::JS_STREAM_NOT_FOUND_ERR;
use crate::message::Message;
use crate::{Error, Result};

impl ContextHandle {
    pub fn add_stream(&self, config: &StreamConfig) -> Result<StreamInfo> {
        self.put_stream(API_STREAM_CREATE, config)
    }

    pub fn update_stream(&self, config: &StreamConfig) -> Result<StreamInfo> {
        self.put_stream(API_STREAM_UPDATE, config)
    }

    /// Fails with `Error::NotFound` when the stream does not exist.
    pub fn stream_info(&self, name: &str) -> Result<StreamInfo> {
        check_stream_name(name)?;
        match self.api_request(&format!("{API_STREAM_INFO}.{name}"), Bytes::new()) {
            Err(Error::Api(api)) if api.err_code == JS_STREAM_NOT_FOUND_ERR => {
                Err(Error::NotFound(format!("stream '{name}'")))
            }
            other => other,
        }
    }

    pub fn delete_stream(&self, name: &str) -> Result<()> {
        check_stream_name(name)?;
        let resp: SuccessResponse =
            self.api_request(&format!("{API_STREAM_DELETE}.{name}"), Bytes::new())?;
        expect_success(resp, "delete", name)
    }

    pub fn purge_stream(&self, name: &str, opts: Option<&PurgeOptions>) -> Result<()> {
        check_stream_name(name)?;
        let body = match opts {
            Some(opts) => opts.to_request()?,
            None => Vec::new(),
        };
        let resp: SuccessResponse =
            self.api_request(&format!("{API_STREAM_PURGE}.{name}"), body)?;
        expect_success(resp, "purge", name)
    }

    pub fn account_info(&self) -> Result<AccountInfo> {
        self.api_request(API_ACCOUNT_INFO, Bytes::new())
    }

    fn put_stream(&self, endpoint: &str, config: &StreamConfig) -> Result<StreamInfo> {
        check_stream_name(&config.name)?;
        let body = serde_json::to_vec(config)?;
        self.api_request(&format!("{endpoint}.{}", config.name), body)
    }

    fn api_request<T: DeserializeOwned>(&self, endpoint: &str, body: impl Into<Bytes>) -> Result<T> {
        self.ensure_open()?;
        let subject = format!("{}.{endpoint}", self.inner.settings.api_prefix);
        log::trace!("api request on '{subject}'");
        let reply = self
            .inner
            .transport
            .request(&Message::new(subject, body), self.inner.settings.wait)?;
        if reply.is_no_responders() {
            return Err(Error::NoResponders);
        }
        api::decode_response(&reply.data)
    }
}

fn expect_success(resp: SuccessResponse, action: &str, name: &str) -> Result<()> {
    if resp.success {
        return Ok(());
    }
    Err(Error::Api(ApiError {
        code: 0,
        err_code: 0,
        description: format!("failed to {action} stream '{name}'"),
    }))
}
