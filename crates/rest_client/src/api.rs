//! The REST seam the feeds depend on.

use crate::error::Result;
use crate::types::{ChannelBadges, ChannelKind, MessagePage, ViewerCount};
use async_trait::async_trait;

/// REST operations consumed by the real-time feeds.
#[async_trait]
pub trait PlatformApi: Send + Sync + 'static {
    /// Resolve the chat channel id attached to a match or competition.
    async fn resolve_channel(&self, kind: ChannelKind, ref_id: &str) -> Result<String>;

    /// Fetch one page of messages, newest first. `cursor = None` fetches the
    /// most recent page. Re-requesting a cursor returns the same page.
    async fn fetch_messages(
        &self,
        channel_id: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<MessagePage>;

    /// Fetch `userId -> badges` for a channel.
    async fn fetch_badges(&self, channel_id: &str) -> Result<ChannelBadges>;

    /// Aggregate viewer counts across live matches.
    async fn fetch_viewer_counts(&self) -> Result<Vec<ViewerCount>>;
}
