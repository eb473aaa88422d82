//! In-memory `PlatformApi` and fixtures for feed tests.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use common::Message;
use rest_client::{ChannelBadges, ChannelKind, MessagePage, PlatformApi, ViewerCount};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

/// Message `m{i}` on `channel_id`, created `i` seconds after a fixed epoch.
pub fn message(channel_id: &str, i: i64) -> Message {
    Message {
        id: format!("m{}", i),
        channel_id: channel_id.to_string(),
        author_id: "u1".to_string(),
        body: format!("message {}", i),
        created_at: Utc.timestamp_opt(1_700_000_000 + i, 0).single().unwrap(),
        deleted_at: None,
    }
}

pub fn message_json(channel_id: &str, i: i64) -> serde_json::Value {
    serde_json::to_value(message(channel_id, i)).unwrap()
}

#[derive(Default)]
struct FakeState {
    channels: HashMap<(ChannelKind, String), String>,
    /// Ascending per channel.
    history: HashMap<String, Vec<Message>>,
    badges: HashMap<String, ChannelBadges>,
    viewers: Vec<ViewerCount>,
    fail_resolve: bool,
    fail_history: usize,
    fail_viewers: bool,
    resolve_calls: usize,
    history_calls: Vec<Option<String>>,
    viewer_calls: usize,
}

/// Scripted REST backend. Cursors are `before:{index}` into the ascending
/// history, so the same cursor always answers the same page.
#[derive(Clone)]
pub struct FakeApi {
    state: Arc<Mutex<FakeState>>,
    gate: Arc<watch::Sender<bool>>,
}

impl FakeApi {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            state: Arc::new(Mutex::new(FakeState::default())),
            gate: Arc::new(gate),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_channel(&self, kind: ChannelKind, ref_id: &str, channel_id: &str) {
        self.lock()
            .channels
            .insert((kind, ref_id.to_string()), channel_id.to_string());
    }

    pub fn set_history(&self, channel_id: &str, messages: Vec<Message>) {
        self.lock().history.insert(channel_id.to_string(), messages);
    }

    pub fn set_badges(&self, channel_id: &str, badges: &[(&str, &[&str])]) {
        let map = badges
            .iter()
            .map(|(user, list)| (user.to_string(), list.iter().map(|b| b.to_string()).collect()))
            .collect();
        self.lock().badges.insert(channel_id.to_string(), map);
    }

    pub fn set_viewers(&self, counts: &[(&str, u64)]) {
        self.lock().viewers = counts
            .iter()
            .map(|(id, n)| ViewerCount {
                match_id: id.to_string(),
                viewer_count: *n,
            })
            .collect();
    }

    pub fn fail_resolve(&self, fail: bool) {
        self.lock().fail_resolve = fail;
    }

    /// Fail the next `n` history requests.
    pub fn fail_history(&self, n: usize) {
        self.lock().fail_history = n;
    }

    pub fn fail_viewers(&self, fail: bool) {
        self.lock().fail_viewers = fail;
    }

    /// Park REST calls until [`FakeApi::release`].
    pub fn hold(&self) {
        self.gate.send_replace(false);
    }

    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    pub fn resolve_calls(&self) -> usize {
        self.lock().resolve_calls
    }

    pub fn history_calls(&self) -> Vec<Option<String>> {
        self.lock().history_calls.clone()
    }

    pub fn viewer_calls(&self) -> usize {
        self.lock().viewer_calls
    }

    async fn gate(&self) {
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
    }
}

#[async_trait]
impl PlatformApi for FakeApi {
    async fn resolve_channel(&self, kind: ChannelKind, ref_id: &str) -> rest_client::Result<String> {
        self.gate().await;
        let mut state = self.lock();
        state.resolve_calls += 1;
        if state.fail_resolve {
            return Err(rest_client::Error::Api("resolve unavailable".to_string()));
        }
        state
            .channels
            .get(&(kind, ref_id.to_string()))
            .cloned()
            .ok_or_else(|| rest_client::Error::ChannelNotFound(format!("{} {}", kind, ref_id)))
    }

    async fn fetch_messages(
        &self,
        channel_id: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> rest_client::Result<MessagePage> {
        self.gate().await;
        let mut state = self.lock();
        state.history_calls.push(cursor.map(str::to_string));
        if state.fail_history > 0 {
            state.fail_history -= 1;
            return Err(rest_client::Error::Api("history unavailable".to_string()));
        }

        let all = state.history.get(channel_id).cloned().unwrap_or_default();
        let end = match cursor {
            Some(token) => token
                .strip_prefix("before:")
                .and_then(|n| n.parse::<usize>().ok())
                .ok_or_else(|| rest_client::Error::InvalidResponse(format!("bad cursor {}", token)))?,
            None => all.len(),
        }
        .min(all.len());
        let start = end.saturating_sub(limit);

        let mut messages = all[start..end].to_vec();
        messages.reverse();
        Ok(MessagePage {
            messages,
            next_cursor: (start > 0).then(|| format!("before:{}", start)),
        })
    }

    async fn fetch_badges(&self, channel_id: &str) -> rest_client::Result<ChannelBadges> {
        self.gate().await;
        Ok(self.lock().badges.get(channel_id).cloned().unwrap_or_default())
    }

    async fn fetch_viewer_counts(&self) -> rest_client::Result<Vec<ViewerCount>> {
        let mut state = self.lock();
        state.viewer_calls += 1;
        if state.fail_viewers {
            return Err(rest_client::Error::Api("viewers unavailable".to_string()));
        }
        Ok(state.viewers.clone())
    }
}
