//! Transport seam between the connection manager and a concrete socket.

use crate::error::Result;
use crate::protocol::{InboundEvent, OutboundEvent};
use crate::types::Namespace;
use async_trait::async_trait;

/// Opens bidirectional named-event connections, one per namespace.
/// The `ConnectionManager` calls this for the first connect and every retry.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Establish a new connection for `namespace`.
    async fn connect(&self, namespace: Namespace) -> Result<Box<dyn TransportConnection>>;
}

/// One live connection. Owned exclusively by a connection worker task.
#[async_trait]
pub trait TransportConnection: Send {
    /// Write one event.
    async fn send(&mut self, event: &OutboundEvent) -> Result<()>;

    /// Next inbound event. `None` when the peer ended the stream.
    ///
    /// Must be cancel-safe: the worker polls it inside `tokio::select!`.
    async fn recv(&mut self) -> Option<Result<InboundEvent>>;

    /// Keepalive probe, sent on the configured ping interval.
    async fn heartbeat(&mut self) -> Result<()> {
        Ok(())
    }

    /// Close the connection. Errors are swallowed; the socket is gone either way.
    async fn close(&mut self);
}
