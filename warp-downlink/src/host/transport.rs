//! Frame transport seam implemented by the embedding.

use crate::error::TransportError;
use crate::uri::Uri;
use async_trait::async_trait;
use std::sync::Arc;

/// Ordered, reliable, message-oriented duplex channel to one host.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, frame: String) -> Result<(), TransportError>;

    /// Waits for the next inbound frame.
    ///
    /// Must be cancel-safe: the driver polls it inside `tokio::select!` and
    /// a cancelled call must not lose a frame.
    async fn receive(&self) -> Result<String, TransportError>;
}

/// Opens transports; called again by the driver after every connection loss.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &Uri) -> Result<Arc<dyn Transport>, TransportError>;
}
