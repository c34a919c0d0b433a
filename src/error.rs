use crate::api::ApiError;

/// JetStream error code reported when the API has no responder.
pub const JS_NOT_ENABLED_ERR: u16 = 10076;

/// JetStream error code for an unknown stream.
pub const JS_STREAM_NOT_FOUND_ERR: u16 = 10059;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("out of memory")]
    NoMemory,
    #[error("stalled with too many outstanding async published messages")]
    StallTimeout,
    #[error("timeout waiting for outstanding async publishes to complete")]
    DrainTimeout,
    #[error("timeout")]
    Timeout,
    #[error("no responders available for request")]
    NoResponders,
    #[error("{}", .0.description)]
    Api(ApiError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("context closed")]
    ContextClosed,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

impl Error {
    /// JetStream error code carried by this error, if any.
    pub fn err_code(&self) -> Option<u16> {
        match self {
            Error::NoResponders => Some(JS_NOT_ENABLED_ERR),
            Error::Api(api) if api.err_code != 0 => Some(api.err_code),
            Error::NotFound(_) => Some(JS_STREAM_NOT_FOUND_ERR),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout | Error::StallTimeout | Error::DrainTimeout)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
