//! JetStream client context with asynchronous publish acknowledgements.
//!
//! A [`Context`] publishes into durable streams over a [`Transport`]. Async
//! publishes are tracked until the stream acks them, bounded by a
//! backpressure limit, and can be drained with [`ContextHandle::flush_async`].
//! Failed acks are reported to the error handler configured in
//! [`ContextConfig`].

pub mod api;
pub mod config;
pub mod context;
pub mod error;
pub mod message;
pub mod sim;
pub mod subject;
pub mod token;
pub mod transport;

pub use api::{PubAck, StreamConfig, StreamInfo};
pub use config::{ContextConfig, PubOptions};
pub use context::{Context, ContextHandle, ContextStats, PubAckError, PublishError};
pub use error::{Error, Result};
pub use message::{Headers, Message};
pub use transport::{MemoryTransport, Transport};
