//! Named-event wire protocol.
//!
//! Every frame is a JSON text message of the form
//! `{"event": "<name>", "data": <payload>}` in both directions.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Event names
// ============================================================================

/// Event names, grouped by namespace.
pub mod events {
    // odds
    pub const JOIN_MARKET: &str = "joinMarket";
    pub const LEAVE_MARKET: &str = "leaveMarket";
    pub const BETTING_UPDATE: &str = "betting:update";

    // presence
    pub const JOIN_WATCH: &str = "joinWatch";
    pub const LEAVE_WATCH: &str = "leaveWatch";
    pub const VIEWERS_COUNT: &str = "viewersCount";
    pub const LIVE_STATUS_CHANGED: &str = "liveStatusChanged";
    pub const MATCH_LIVE_STATUS_CHANGED: &str = "matchLiveStatusChanged";

    // chat
    pub const JOIN_CHANNEL: &str = "joinChannel";
    pub const LEAVE_CHANNEL: &str = "leaveChannel";
    pub const MESSAGE_SEND: &str = "messageSend";
    pub const NEW_MESSAGE: &str = "newMessage";
    pub const MESSAGE_DELETED: &str = "messageDeleted";
    pub const ERROR: &str = "error";
}

// ============================================================================
// Frames
// ============================================================================

/// Event written by the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundEvent {
    #[serde(rename = "event")]
    pub name: String,
    pub data: Value,
}

impl OutboundEvent {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    /// Serialize to a text frame.
    pub fn to_frame(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Event pushed by the server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InboundEvent {
    #[serde(rename = "event")]
    pub name: String,
    #[serde(default)]
    pub data: Value,
}

impl InboundEvent {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    /// Parse a text frame.
    pub fn from_frame(text: &str) -> Result<Self> {
        let event: InboundEvent = serde_json::from_str(text)?;
        if event.name.is_empty() {
            return Err(Error::MalformedFrame("empty event name".to_string()));
        }
        Ok(event)
    }
}
