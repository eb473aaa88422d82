//! Per-feed local state and the immutable views handed to consumers.

use common::{Channel, ConnectionState};
use std::fmt;

/// Data readiness of a feed, independent of the connection state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FeedStatus {
    #[default]
    Uninitialized,
    Loading,
    Ready,
    /// Initialization failed; terminal until the consumer retries.
    Error(String),
}

impl FeedStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, FeedStatus::Ready)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, FeedStatus::Error(_))
    }
}

impl fmt::Display for FeedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedStatus::Uninitialized => f.write_str("uninitialized"),
            FeedStatus::Loading => f.write_str("loading"),
            FeedStatus::Ready => f.write_str("ready"),
            FeedStatus::Error(msg) => write!(f, "error: {}", msg),
        }
    }
}

/// Read-only snapshot of a feed as published to consumers.
#[derive(Debug, Clone, Default)]
pub struct FeedView<V> {
    pub status: FeedStatus,
    pub connection: ConnectionState,
    /// The joined channel, if any.
    pub channel: Option<Channel>,
    /// Last non-fatal problem (server `error` event, failed page load, ...).
    pub notice: Option<String>,
    pub data: V,
}

impl<V> FeedView<V> {
    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn is_ready(&self) -> bool {
        self.status.is_ready()
    }
}

/// Authoritative state of one feed. Only the feed task mutates it.
#[derive(Debug, Default)]
pub struct LocalCache<S> {
    state: S,
    status: FeedStatus,
    notice: Option<String>,
    dirty: bool,
}

impl<S> LocalCache<S> {
    pub fn state(&self) -> &S {
        &self.state
    }

    /// Mutable access; marks the cache for republishing.
    pub fn state_mut(&mut self) -> &mut S {
        self.dirty = true;
        &mut self.state
    }

    /// Run `f` on the state without marking it changed. Callers mark it
    /// themselves once they know whether anything moved.
    pub fn with_state<R>(&mut self, f: impl FnOnce(&mut S) -> R) -> R {
        f(&mut self.state)
    }

    pub fn status(&self) -> &FeedStatus {
        &self.status
    }

    pub fn set_status(&mut self, status: FeedStatus) {
        if self.status != status {
            self.status = status;
            self.dirty = true;
        }
    }

    pub fn notice(&self) -> Option<&str> {
        self.notice.as_deref()
    }

    pub fn set_notice(&mut self, notice: Option<String>) {
        self.notice = notice;
        self.dirty = true;
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Returns whether anything changed since the last call.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dirty_tracking() {
        let mut cache: LocalCache<Vec<u32>> = LocalCache::default();
        assert!(!cache.take_dirty());

        cache.with_state(|s| s.push(1));
        assert!(!cache.take_dirty());

        cache.state_mut().push(2);
        assert!(cache.take_dirty());
        assert!(!cache.take_dirty());

        cache.set_status(FeedStatus::Uninitialized);
        assert!(!cache.take_dirty());
        cache.set_status(FeedStatus::Loading);
        assert!(cache.take_dirty());
        assert_eq!(cache.state(), &vec![1, 2]);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(FeedStatus::Ready.to_string(), "ready");
        assert_eq!(
            FeedStatus::Error("boom".to_string()).to_string(),
            "error: boom"
        );
    }
}
