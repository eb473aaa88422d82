//! Domain types shared by the connection layer, the REST client and the feeds.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

// ============================================================================
// Namespaces and channels
// ============================================================================

/// A partition of the protocol with its own connection and event vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    Chat,
    Presence,
    Odds,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Chat => "chat",
            Namespace::Presence => "presence",
            Namespace::Odds => "odds",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One subscribable target (a match id, competition id or chat channel id)
/// within a namespace. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Channel {
    namespace: Namespace,
    external_id: String,
}

impl Channel {
    pub fn new(namespace: Namespace, external_id: impl Into<String>) -> Self {
        Self {
            namespace,
            external_id: external_id.into(),
        }
    }

    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    pub fn external_id(&self) -> &str {
        &self.external_id
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.external_id)
    }
}

/// Transport-driven connection state. Only the connection worker moves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }
}

// ============================================================================
// Chat
// ============================================================================

/// A chat message. Ordered by `(created_at, id)`, unique by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(deserialize_with = "string_or_number")]
    pub channel_id: String,
    #[serde(deserialize_with = "string_or_number")]
    pub author_id: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Message {
    /// Sort key for the merged sequence.
    pub fn order_key(&self) -> (DateTime<Utc>, &str) {
        (self.created_at, self.id.as_str())
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

// ============================================================================
// Presence
// ============================================================================

/// Broadcast status of a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LiveStatus {
    Scheduled,
    Live,
    Ended,
    #[default]
    #[serde(other)]
    Unknown,
}

/// Spectator presence for one match. Each push yields a new value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceSnapshot {
    pub channel_id: String,
    pub viewer_count: u64,
    pub live_status: LiveStatus,
}

impl PresenceSnapshot {
    pub fn new(channel_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            viewer_count: 0,
            live_status: LiveStatus::Unknown,
        }
    }

    pub fn with_viewer_count(&self, viewer_count: u64) -> Self {
        Self {
            viewer_count,
            ..self.clone()
        }
    }

    pub fn with_live_status(&self, live_status: LiveStatus) -> Self {
        Self {
            live_status,
            ..self.clone()
        }
    }
}

// ============================================================================
// Odds
// ============================================================================

/// Server-derived win probabilities for both sides.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DerivedProbabilities {
    pub a: f64,
    pub b: f64,
}

/// Betting pool state for one match. Replaced wholesale on every push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OddsSnapshot {
    #[serde(deserialize_with = "string_or_number")]
    pub match_id: String,
    pub pool_a: Decimal,
    pub pool_b: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived_probabilities: Option<DerivedProbabilities>,
    #[serde(default)]
    pub time_remaining_pct: f64,
    /// Fields this client does not interpret, kept as received.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl OddsSnapshot {
    /// Total amount staked on both sides.
    pub fn total_pool(&self) -> Decimal {
        self.pool_a + self.pool_b
    }

    /// Server-derived probabilities, or the pool ratio when absent.
    /// `None` when neither is available (both pools empty).
    pub fn implied_probabilities(&self) -> Option<DerivedProbabilities> {
        if let Some(derived) = self.derived_probabilities {
            return Some(derived);
        }
        let total = self.total_pool();
        if total.is_zero() {
            return None;
        }
        let a = (self.pool_a / total).to_f64()?;
        Some(DerivedProbabilities { a, b: 1.0 - a })
    }
}

// ============================================================================
// Serde helpers
// ============================================================================

/// Accepts an identifier sent either as a JSON string or a JSON number.
pub fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Int(i64),
        Uint(u64),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Text(s) => s,
        Id::Int(n) => n.to_string(),
        Id::Uint(n) => n.to_string(),
    })
}

/// Extracts an identifier from a raw JSON value (string or integer).
pub fn id_from_value(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_channel_identity() {
        let a = Channel::new(Namespace::Odds, "m1");
        let b = Channel::new(Namespace::Odds, "m1");
        let c = Channel::new(Namespace::Presence, "m1");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_string(), "odds:m1");
    }

    #[test]
    fn test_message_accepts_numeric_ids() {
        let msg: Message = serde_json::from_value(json!({
            "id": 42,
            "channelId": "c1",
            "authorId": 7,
            "body": "gg",
            "createdAt": "2024-05-01T10:00:00Z"
        }))
        .unwrap();
        assert_eq!(msg.id, "42");
        assert_eq!(msg.author_id, "7");
        assert!(!msg.is_deleted());
    }

    #[test]
    fn test_live_status_unknown_fallback() {
        let status: LiveStatus = serde_json::from_value(json!("paused")).unwrap();
        assert_eq!(status, LiveStatus::Unknown);
        let status: LiveStatus = serde_json::from_value(json!("live")).unwrap();
        assert_eq!(status, LiveStatus::Live);
    }

    #[test]
    fn test_odds_snapshot_keeps_extra_fields() {
        let snapshot: OddsSnapshot = serde_json::from_value(json!({
            "matchId": 9,
            "poolA": "300",
            "poolB": 100,
            "timeRemainingPct": 0.5,
            "bettingOpen": true
        }))
        .unwrap();
        assert_eq!(snapshot.match_id, "9");
        assert_eq!(snapshot.extra.get("bettingOpen"), Some(&json!(true)));

        let p = snapshot.implied_probabilities().unwrap();
        assert!((p.a - 0.75).abs() < 1e-9);
        assert!((p.b - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_odds_prefers_server_probabilities() {
        let snapshot: OddsSnapshot = serde_json::from_value(json!({
            "matchId": "m1",
            "poolA": 0,
            "poolB": 0,
            "derivedProbabilities": { "a": 0.6, "b": 0.4 }
        }))
        .unwrap();
        assert_eq!(
            snapshot.implied_probabilities(),
            Some(DerivedProbabilities { a: 0.6, b: 0.4 })
        );
    }

    #[test]
    fn test_id_from_value() {
        assert_eq!(id_from_value(&json!("m1")), Some("m1".to_string()));
        assert_eq!(id_from_value(&json!(12)), Some("12".to_string()));
        assert_eq!(id_from_value(&json!(1.5)), None);
        assert_eq!(id_from_value(&json!(null)), None);
    }
}
