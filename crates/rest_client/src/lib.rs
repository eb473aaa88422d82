//! REST contracts consumed by the real-time feeds.
//!
//! The feeds depend only on the [`PlatformApi`] trait; [`PlatformClient`] is
//! the HTTP implementation.
//!
//! # Example
//!
//! ```ignore
//! use rest_client::{ChannelKind, PlatformApi, PlatformClient};
//!
//! let client = PlatformClient::new("https://api.example.com").with_bearer_token(token);
//! let channel_id = client.resolve_channel(ChannelKind::Match, "42").await?;
//! let page = client.fetch_messages(&channel_id, None, 20).await?;
//! ```

pub mod api;
pub mod client;
pub mod error;
pub mod types;

pub use api::PlatformApi;
pub use client::PlatformClient;
pub use error::{Error, Result};
pub use types::{ChannelBadges, ChannelKind, MessagePage, UserBadges, ViewerCount};
