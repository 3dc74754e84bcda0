//! The `Transport` abstraction the workers depend on. Capability flags tell
//! a caller which optional behaviors a transport actually supports so it
//! can fall back rather than call an unimplemented method — kept as plain
//! `u8` constants rather than a `bitflags`-derived type, the same choice
//! `wc-storage::status` makes for the row-status bitmask.

pub mod inmemory;
pub mod request_response;

#[cfg(feature = "kafka")]
pub mod kafka;

pub use inmemory::InMemoryTransport;
pub use request_response::RequestResponseStore;

#[cfg(feature = "kafka")]
pub use kafka::KafkaTransport;

use async_trait::async_trait;
use thiserror::Error;
use wc_ids::MessageEnvelope;

pub const PUBLISH_SUBSCRIBE: u8 = 0b0001;
pub const RELIABLE: u8 = 0b0010;
pub const ORDERED: u8 = 0b0100;
pub const REQUEST_RESPONSE: u8 = 0b1000;

pub fn has_capability(capabilities: u8, flag: u8) -> bool {
    capabilities & flag != 0
}

/// The envelope shape transports move: payload erased to JSON since a
/// transport has no reason to know the concrete message type, the same way
/// `wc-storage`'s outbox/inbox rows carry `event_data` as `Value`.
pub type RawEnvelope = MessageEnvelope<serde_json::Value>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport not ready")]
    NotReady,
    #[error("publish failed: {0}")]
    PublishFailed(String),
    #[error("subscribe failed: {0}")]
    SubscribeFailed(String),
    #[error("request/response capability not supported by this transport")]
    RequestResponseUnsupported,
    #[error("request timed out waiting for a response")]
    RequestTimedOut,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// A subscription handed back by `subscribe`; dropping it does not itself
/// unsubscribe, callers that want to stop receiving call
/// [`Subscription::unsubscribe`] explicitly.
#[async_trait]
pub trait Subscription: Send + Sync {
    async fn unsubscribe(&self) -> TransportResult<()>;
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, envelope: RawEnvelope) -> TransportResult<()>;
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn initialize(&self) -> TransportResult<()>;

    async fn publish(&self, envelope: RawEnvelope, destination: &str) -> TransportResult<()>;

    async fn subscribe(
        &self,
        destination: &str,
        handler: std::sync::Arc<dyn Handler>,
    ) -> TransportResult<Box<dyn Subscription>>;

    /// Only valid when `capabilities() & REQUEST_RESPONSE != 0`. The default
    /// implementation returns [`TransportError::RequestResponseUnsupported`]
    /// so a transport lacking the capability doesn't need to override it.
    async fn send_request(
        &self,
        _envelope: RawEnvelope,
        _destination: &str,
    ) -> TransportResult<RawEnvelope> {
        Err(TransportError::RequestResponseUnsupported)
    }

    fn capabilities(&self) -> u8;
}
