//! Request and response shapes of the platform REST API.

use common::types::string_or_number;
use common::Message;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// What a chat channel is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Match,
    Competition,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Match => "match",
            ChannelKind::Competition => "competition",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Response of the channel resolution endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveChannelResponse {
    #[serde(default, deserialize_with = "optional_id")]
    pub channel_id: Option<String>,
}

/// One page of history, newest first as served.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Opaque pointer to the next older page; absent on the last page.
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// Badges of one user.
pub type UserBadges = BTreeSet<String>;

/// `userId -> badges` for one channel.
pub type ChannelBadges = HashMap<String, UserBadges>;

/// Aggregate viewer count for one match.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerCount {
    #[serde(deserialize_with = "string_or_number")]
    pub match_id: String,
    pub viewer_count: u64,
}

fn optional_id<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(common::types::id_from_value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_page_without_cursor() {
        let page: MessagePage = serde_json::from_value(json!({
            "messages": [{
                "id": "m1",
                "channelId": "c1",
                "authorId": "u1",
                "body": "hello",
                "createdAt": "2024-05-01T10:00:00Z"
            }]
        }))
        .unwrap();
        assert_eq!(page.messages.len(), 1);
        assert!(page.next_cursor.is_none());
    }

    #[test]
    fn test_resolve_response_numeric_id() {
        let resp: ResolveChannelResponse =
            serde_json::from_value(json!({ "channelId": 17 })).unwrap();
        assert_eq!(resp.channel_id.as_deref(), Some("17"));

        let resp: ResolveChannelResponse = serde_json::from_value(json!({})).unwrap();
        assert!(resp.channel_id.is_none());
    }

    #[test]
    fn test_viewer_count() {
        let counts: Vec<ViewerCount> = serde_json::from_value(json!([
            { "matchId": 1, "viewerCount": 10 },
            { "matchId": "2", "viewerCount": 0 }
        ]))
        .unwrap();
        assert_eq!(counts[0].match_id, "1");
        assert_eq!(counts[1].viewer_count, 0);
    }

    #[test]
    fn test_channel_kind_wire_name() {
        assert_eq!(ChannelKind::Competition.as_str(), "competition");
        assert_eq!(serde_json::to_value(ChannelKind::Match).unwrap(), json!("match"));
    }
}
