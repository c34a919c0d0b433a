//! JetStream JSON API: response envelopes, publish acks and admin types.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub mod account;
pub mod stream;

pub use account::{AccountInfo, AccountLimits, ApiStats};
pub use stream::{
    ClusterInfo, DiscardPolicy, ExternalStream, PeerInfo, Placement, PurgeOptions,
    RetentionPolicy, StorageType, StreamConfig, StreamInfo, StreamSource, StreamSourceInfo,
    StreamState,
};

// API subjects, relative to the context's API prefix.
pub const API_ACCOUNT_INFO: &str = "INFO";
pub const API_STREAM_CREATE: &str = "STREAM.CREATE";
pub const API_STREAM_UPDATE: &str = "STREAM.UPDATE";
pub const API_STREAM_INFO: &str = "STREAM.INFO";
pub const API_STREAM_DELETE: &str = "STREAM.DELETE";
pub const API_STREAM_PURGE: &str = "STREAM.PURGE";

/// Error object carried by every failed API response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiError {
    pub code: i32,
    pub err_code: u16,
    pub description: String,
}

impl ApiError {
    pub fn is_err(&self) -> bool {
        self.code != 0 || self.err_code != 0
    }
}

/// Acknowledgement returned by the server for a stored message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubAck {
    pub stream: String,
    pub seq: u64,
    #[serde(default)]
    pub duplicate: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    error: Option<ApiError>,
}

/// Returns the API error carried by `data`, if the payload holds one.
pub fn response_error(data: &[u8]) -> Result<Option<ApiError>> {
    let envelope: Envelope = serde_json::from_slice(data)?;
    Ok(envelope.error.filter(ApiError::is_err))
}

/// Decodes an API response, turning an embedded error into `Error::Api`.
pub fn decode_response<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    let value: serde_json::Value = serde_json::from_slice(data)?;
    if let Some(err) = value.get("error") {
        let api: ApiError = serde_json::from_value(err.clone())?;
        if api.is_err() {
            return Err(Error::Api(api));
        }
    }
    Ok(serde_json::from_value(value)?)
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct SuccessResponse {
    #[serde(default)]
    pub success: bool,
}
