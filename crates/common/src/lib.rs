//! Common types, wire protocol and connection management for the
//! real-time channel client.

pub mod connection;
pub mod error;
pub mod messages;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod protocol;
pub mod transport;
pub mod types;
pub mod ws_transport;

pub use connection::{
    BackoffPolicy, ConnectionConfig, ConnectionEvent, ConnectionHandle, ConnectionManager,
};
pub use error::{Error, Result};
pub use messages::ControlCommand;
pub use protocol::{events, InboundEvent, OutboundEvent};
pub use transport::{Transport, TransportConnection};
pub use types::{
    Channel, ConnectionState, DerivedProbabilities, LiveStatus, Message, Namespace,
    OddsSnapshot, PresenceSnapshot,
};
pub use ws_transport::WsTransport;
