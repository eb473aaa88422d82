//! Presence feed: viewer count and live status of one match, plus the
//! namespace-wide live status map.
//!
//! Counts have two writers, the room pushes and the periodic REST poll.
//! Neither carries a sequence number, so whichever is applied last wins.

use crate::dispatcher::{Effect, EventDispatcher, Scope};
use crate::error::Result;
use crate::runtime::{Feed, FeedContext};
use async_trait::async_trait;
use common::types::string_or_number;
use common::{events, Channel, LiveStatus, Namespace, OutboundEvent, PresenceSnapshot};
use rest_client::{PlatformApi, ViewerCount};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Last known presence of any match, fed by global pushes and polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MatchPresence {
    pub viewer_count: u64,
    pub live_status: LiveStatus,
}

#[derive(Debug, Default)]
pub struct PresenceState {
    current: Option<PresenceSnapshot>,
    matches: Arc<HashMap<String, MatchPresence>>,
}

impl PresenceState {
    fn record_count(&mut self, match_id: &str, viewer_count: u64) {
        Arc::make_mut(&mut self.matches)
            .entry(match_id.to_string())
            .or_default()
            .viewer_count = viewer_count;
    }

    /// Snapshot for `match_id`, created on first use.
    fn current_for(&mut self, match_id: &str) -> &mut PresenceSnapshot {
        if self.current.as_ref().map_or(true, |s| s.channel_id != match_id) {
            self.current = Some(PresenceSnapshot::new(match_id));
        }
        self.current.get_or_insert_with(|| PresenceSnapshot::new(match_id))
    }

    fn apply_counts(&mut self, counts: &[ViewerCount]) {
        for count in counts {
            self.record_count(&count.match_id, count.viewer_count);
            if let Some(current) = self.current.as_mut() {
                if current.channel_id == count.match_id {
                    *current = current.with_viewer_count(count.viewer_count);
                }
            }
        }
    }
}

/// Consumer view of presence.
#[derive(Debug, Clone, Default)]
pub struct PresenceView {
    pub current: Option<PresenceSnapshot>,
    pub matches: Arc<HashMap<String, MatchPresence>>,
}

impl PresenceView {
    pub fn viewer_count(&self) -> Option<u64> {
        self.current.as_ref().map(|s| s.viewer_count)
    }

    pub fn live_status(&self) -> Option<LiveStatus> {
        self.current.as_ref().map(|s| s.live_status)
    }

    pub fn match_presence(&self, match_id: &str) -> Option<&MatchPresence> {
        self.matches.get(match_id)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ViewersCount {
    #[serde(deserialize_with = "string_or_number")]
    match_id: String,
    #[serde(alias = "viewerCount")]
    count: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LiveStatusChanged {
    #[serde(deserialize_with = "string_or_number")]
    match_id: String,
    status: LiveStatus,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MatchLiveStatusChanged {
    #[serde(deserialize_with = "string_or_number")]
    match_id: String,
    #[serde(default)]
    viewer_count: Option<u64>,
    #[serde(default, alias = "liveStatus")]
    status: Option<LiveStatus>,
}

pub enum PresenceOutput {
    Counts(Result<Vec<ViewerCount>>),
}

pub struct PresenceFeed {
    api: Arc<dyn PlatformApi>,
    poll_interval: Duration,
}

impl PresenceFeed {
    pub fn new(api: Arc<dyn PlatformApi>, poll_interval: Duration) -> Self {
        Self { api, poll_interval }
    }

    fn room(channel: &Channel) -> serde_json::Value {
        json!({ "matchId": channel.external_id() })
    }
}

#[async_trait]
impl Feed for PresenceFeed {
    const NAMESPACE: Namespace = Namespace::Presence;

    type Target = String;
    type State = PresenceState;
    type Snapshot = PresenceView;
    type Prepared = Vec<ViewerCount>;
    type Command = ();
    type Output = PresenceOutput;

    fn channel_hint(&self, match_id: &String) -> Option<Channel> {
        Some(Channel::new(Namespace::Presence, match_id.clone()))
    }

    /// Seed the count from one poll. A failed poll does not block the feed;
    /// pushes fill the snapshot in.
    async fn prepare(&self, _match_id: String) -> Result<Vec<ViewerCount>> {
        match self.api.fetch_viewer_counts().await {
            Ok(counts) => Ok(counts),
            Err(e) => {
                warn!("[presence] Initial viewer count poll failed: {}", e);
                Ok(Vec::new())
            }
        }
    }

    fn seed(&self, match_id: &String, counts: Vec<ViewerCount>, state: &mut PresenceState) -> Channel {
        state.current_for(match_id);
        state.apply_counts(&counts);
        Channel::new(Namespace::Presence, match_id.clone())
    }

    /// The match map outlives target switches.
    fn reset(&self, state: &mut PresenceState) {
        state.current = None;
    }

    fn join_event(&self, channel: &Channel) -> OutboundEvent {
        OutboundEvent::new(events::JOIN_WATCH, Self::room(channel))
    }

    fn leave_event(&self, channel: &Channel) -> OutboundEvent {
        OutboundEvent::new(events::LEAVE_WATCH, Self::room(channel))
    }

    fn register_routes(&self, dispatcher: &mut EventDispatcher<PresenceState>) {
        dispatcher
            .on(
                events::VIEWERS_COUNT,
                Scope::Channel("matchId"),
                |state: &mut PresenceState, push: ViewersCount| {
                    state.record_count(&push.match_id, push.count);
                    let current = state.current_for(&push.match_id);
                    *current = current.with_viewer_count(push.count);
                    Effect::Updated
                },
            )
            .on(
                events::LIVE_STATUS_CHANGED,
                Scope::Channel("matchId"),
                |state: &mut PresenceState, push: LiveStatusChanged| {
                    Arc::make_mut(&mut state.matches)
                        .entry(push.match_id.clone())
                        .or_default()
                        .live_status = push.status;
                    let current = state.current_for(&push.match_id);
                    *current = current.with_live_status(push.status);
                    Effect::Updated
                },
            )
            .on(
                events::MATCH_LIVE_STATUS_CHANGED,
                Scope::Global,
                |state: &mut PresenceState, push: MatchLiveStatusChanged| {
                    let entry = Arc::make_mut(&mut state.matches)
                        .entry(push.match_id)
                        .or_default();
                    if let Some(count) = push.viewer_count {
                        entry.viewer_count = count;
                    }
                    if let Some(status) = push.status {
                        entry.live_status = status;
                    }
                    Effect::Updated
                },
            );
    }

    fn snapshot(&self, state: &PresenceState) -> PresenceView {
        PresenceView {
            current: state.current.clone(),
            matches: state.matches.clone(),
        }
    }

    fn poll_interval(&self) -> Option<Duration> {
        Some(self.poll_interval)
    }

    fn on_poll(&self, ctx: &mut FeedContext<'_, Self>) {
        debug!("[presence] Polling viewer counts");
        let api = self.api.clone();
        ctx.spawn(async move {
            PresenceOutput::Counts(api.fetch_viewer_counts().await.map_err(Into::into))
        });
    }

    fn on_output(&self, ctx: &mut FeedContext<'_, Self>, output: PresenceOutput) {
        match output {
            PresenceOutput::Counts(Ok(counts)) => {
                ctx.state_mut().apply_counts(&counts);
            }
            PresenceOutput::Counts(Err(e)) => warn!("[presence] Viewer count poll failed: {}", e),
        }
    }
}
