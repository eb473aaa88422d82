//! Client-side subscription and reconciliation layer.
//!
//! Each feed (chat, presence, odds) runs on its own task, owns one
//! namespace connection and keeps at most one room joined. Consumers drive
//! it through a [`FeedClient`] and read immutable [`FeedView`] snapshots.
//!
//! # Example
//!
//! ```ignore
//! use common::{ConnectionManager, WsTransport};
//! use feeds::{ChatFeed, ChatTarget, FeedClient, FeedConfig};
//!
//! let config = FeedConfig::from_env();
//! let manager = ConnectionManager::new(Arc::new(WsTransport::new(ws_url)?), config.connection.clone());
//! let chat = FeedClient::spawn(ChatFeed::new(api, config.user_id.clone(), config.history_page_size), manager);
//!
//! chat.set_target(Some(ChatTarget::for_match("42")))?;
//! let view = chat.wait_for(|v| v.is_ready()).await?;
//! println!("{} messages", view.data.messages.len());
//! chat.fetch_more()?;
//! ```

pub mod cache;
pub mod chat;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod odds;
pub mod paginator;
pub mod presence;
pub mod runtime;
pub mod subscription;

#[cfg(test)]
mod testing;

pub use cache::{FeedStatus, FeedView, LocalCache};
pub use chat::{ChatCommand, ChatFeed, ChatSnapshot, ChatTarget};
pub use config::FeedConfig;
pub use dispatcher::{Dispatch, Effect, EventDispatcher, Scope};
pub use error::{FeedError, Result};
pub use odds::{OddsFeed, OddsState};
pub use paginator::{Cursor, HistoryPage, HistoryPaginator, MessageLog};
pub use presence::{MatchPresence, PresenceFeed, PresenceView};
pub use runtime::{Feed, FeedClient, FeedContext};
pub use subscription::{Subscription, SubscriptionAction, SubscriptionController};
