//! Control messages sent from a connection handle to its worker task.

use crate::protocol::OutboundEvent;

/// Commands that a `ConnectionHandle` sends to its connection worker.
///
/// Both variants travel on the same FIFO channel, so an event queued before
/// `Shutdown` is always written before the socket is closed.
#[derive(Debug, Clone)]
pub enum ControlCommand {
    /// Write a named protocol event to the live connection.
    Emit(OutboundEvent),
    /// Graceful shutdown. Wins over any pending reconnect.
    Shutdown,
}
