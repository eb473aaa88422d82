//! Feed configuration.

use common::{BackoffPolicy, ConnectionConfig};
use std::time::Duration;

/// Configuration shared by the chat, presence and odds feeds.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Connection worker settings (reconnect budget, backoff, heartbeat).
    pub connection: ConnectionConfig,
    /// Identity sent with chat join, leave and send events.
    pub user_id: String,
    /// Messages per history page.
    pub history_page_size: usize,
    /// Interval of the presence viewer-count poll.
    pub presence_poll_interval: Duration,
}

fn default_history_page_size() -> usize {
    20
}

fn default_presence_poll_interval() -> Duration {
    Duration::from_secs(10)
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            user_id: String::new(),
            history_page_size: default_history_page_size(),
            presence_poll_interval: default_presence_poll_interval(),
        }
    }
}

impl FeedConfig {
    /// Build from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = ConnectionConfig::default();

        let connection = ConnectionConfig {
            max_reconnect_attempts: env_parse("RECONNECT_MAX_ATTEMPTS")
                .unwrap_or(defaults.max_reconnect_attempts),
            reconnect_delay: env_parse("RECONNECT_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.reconnect_delay),
            max_reconnect_delay: env_parse("RECONNECT_MAX_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_reconnect_delay),
            backoff: std::env::var("RECONNECT_BACKOFF")
                .ok()
                .and_then(|s| parse_backoff(&s))
                .unwrap_or(defaults.backoff),
            ..defaults
        };

        Self {
            connection,
            user_id: std::env::var("USER_ID").unwrap_or_default(),
            history_page_size: env_parse("HISTORY_PAGE_SIZE")
                .filter(|n: &usize| *n > 0)
                .unwrap_or_else(default_history_page_size),
            presence_poll_interval: env_parse("PRESENCE_POLL_INTERVAL_SECS")
                .filter(|n: &u64| *n > 0)
                .map(Duration::from_secs)
                .unwrap_or_else(default_presence_poll_interval),
        }
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn parse_backoff(value: &str) -> Option<BackoffPolicy> {
    match value.trim().to_ascii_lowercase().as_str() {
        "exponential" => Some(BackoffPolicy::Exponential),
        "fixed" => Some(BackoffPolicy::Fixed),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = FeedConfig::default();
        assert_eq!(config.history_page_size, 20);
        assert_eq!(config.presence_poll_interval, Duration::from_secs(10));
        assert_eq!(config.connection.max_reconnect_attempts, 5);
        assert_eq!(config.connection.reconnect_delay, Duration::from_secs(1));
    }

    #[test]
    fn test_parse_backoff() {
        assert_eq!(parse_backoff("Fixed"), Some(BackoffPolicy::Fixed));
        assert_eq!(parse_backoff(" exponential "), Some(BackoffPolicy::Exponential));
        assert_eq!(parse_backoff("linear"), None);
    }
}
