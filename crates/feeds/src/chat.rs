//! Chat feed: channel resolution, history pagination, live messages.

use crate::dispatcher::{Effect, EventDispatcher, Scope};
use crate::error::{FeedError, Result};
use crate::paginator::{Cursor, HistoryPage, HistoryPaginator, MessageLog};
use crate::runtime::{Feed, FeedClient, FeedContext};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::types::string_or_number;
use common::{events, Channel, Message, Namespace, OutboundEvent};
use rest_client::{ChannelBadges, ChannelKind, PlatformApi, UserBadges};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

/// What a chat is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChatTarget {
    pub kind: ChannelKind,
    pub ref_id: String,
}

impl ChatTarget {
    pub fn new(kind: ChannelKind, ref_id: impl Into<String>) -> Self {
        Self {
            kind,
            ref_id: ref_id.into(),
        }
    }

    pub fn for_match(match_id: impl Into<String>) -> Self {
        Self::new(ChannelKind::Match, match_id)
    }

    pub fn for_competition(competition_id: impl Into<String>) -> Self {
        Self::new(ChannelKind::Competition, competition_id)
    }
}

#[derive(Debug)]
pub enum ChatCommand {
    /// Load the next older history page.
    FetchMore,
    /// Publish a message to the joined channel.
    Send(String),
}

pub enum ChatOutput {
    OlderPage {
        requested: Cursor,
        result: Result<HistoryPage>,
    },
}

/// Everything fetched before the room is joined.
pub struct ChatPrepared {
    channel_id: String,
    page: HistoryPage,
    badges: ChannelBadges,
}

#[derive(Debug, Default)]
pub struct ChatState {
    channel_id: Option<String>,
    log: MessageLog,
    badges: Arc<ChannelBadges>,
    loading_more: bool,
}

/// Consumer view of the chat.
#[derive(Debug, Clone, Default)]
pub struct ChatSnapshot {
    pub channel_id: Option<String>,
    /// Ascending by `(created_at, id)`, unique by id.
    pub messages: Arc<Vec<Message>>,
    pub has_more: bool,
    pub loading_more: bool,
    pub badges: Arc<ChannelBadges>,
}

impl ChatSnapshot {
    pub fn badges_for(&self, user_id: &str) -> Option<&UserBadges> {
        self.badges.get(user_id)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageDeleted {
    #[serde(deserialize_with = "string_or_number")]
    message_id: String,
    #[serde(default)]
    deleted_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct ServerError {
    #[serde(default)]
    message: String,
}

pub struct ChatFeed {
    api: Arc<dyn PlatformApi>,
    paginator: HistoryPaginator,
    user_id: String,
}

impl ChatFeed {
    pub fn new(api: Arc<dyn PlatformApi>, user_id: impl Into<String>, page_size: usize) -> Self {
        Self {
            paginator: HistoryPaginator::new(api.clone(), page_size),
            api,
            user_id: user_id.into(),
        }
    }

    fn membership(&self, channel: &Channel) -> serde_json::Value {
        json!({ "channelId": channel.external_id(), "userId": self.user_id })
    }

    fn fetch_more(&self, ctx: &mut FeedContext<'_, Self>) {
        let state = ctx.state();
        if state.loading_more || !state.log.has_more() {
            return;
        }
        let Some(cursor) = state.log.cursor().cloned() else {
            return;
        };

        debug!("[chat] Fetching page before {:?}", cursor.token());
        ctx.state_mut().loading_more = true;

        let paginator = self.paginator.clone();
        ctx.spawn(async move {
            let result = paginator.fetch_more(&cursor).await;
            ChatOutput::OlderPage {
                requested: cursor,
                result,
            }
        });
    }

    fn send_message(&self, ctx: &mut FeedContext<'_, Self>, body: String) -> Result<()> {
        let body = body.trim();
        if body.is_empty() {
            return Ok(());
        }
        let channel = ctx.active_channel().ok_or(FeedError::NotJoined)?;
        let event = OutboundEvent::new(
            events::MESSAGE_SEND,
            json!({
                "channelId": channel.external_id(),
                "userId": self.user_id,
                "body": body,
            }),
        );
        ctx.emit(event)
    }
}

#[async_trait]
impl Feed for ChatFeed {
    const NAMESPACE: Namespace = Namespace::Chat;

    type Target = ChatTarget;
    type State = ChatState;
    type Snapshot = ChatSnapshot;
    type Prepared = ChatPrepared;
    type Command = ChatCommand;
    type Output = ChatOutput;

    async fn prepare(&self, target: ChatTarget) -> Result<ChatPrepared> {
        // Each step needs the channel id from the first.
        let channel_id = self.api.resolve_channel(target.kind, &target.ref_id).await?;
        let page = self.paginator.fetch_initial(&channel_id).await?;
        let badges = self.api.fetch_badges(&channel_id).await?;

        info!(
            "[chat] Resolved {} {} to channel {} ({} messages)",
            target.kind,
            target.ref_id,
            channel_id,
            page.messages.len()
        );
        Ok(ChatPrepared {
            channel_id,
            page,
            badges,
        })
    }

    fn seed(&self, _target: &ChatTarget, prepared: ChatPrepared, state: &mut ChatState) -> Channel {
        let channel = Channel::new(Namespace::Chat, prepared.channel_id.clone());
        *state = ChatState {
            channel_id: Some(prepared.channel_id),
            log: MessageLog::seeded(prepared.page),
            badges: Arc::new(prepared.badges),
            loading_more: false,
        };
        channel
    }

    fn join_event(&self, channel: &Channel) -> OutboundEvent {
        OutboundEvent::new(events::JOIN_CHANNEL, self.membership(channel))
    }

    fn leave_event(&self, channel: &Channel) -> OutboundEvent {
        OutboundEvent::new(events::LEAVE_CHANNEL, self.membership(channel))
    }

    fn register_routes(&self, dispatcher: &mut EventDispatcher<ChatState>) {
        dispatcher
            .on(
                events::NEW_MESSAGE,
                Scope::Channel("channelId"),
                |state: &mut ChatState, message: Message| {
                    if state.log.append_live(message) {
                        Effect::Updated
                    } else {
                        Effect::Unchanged
                    }
                },
            )
            .on(
                events::MESSAGE_DELETED,
                Scope::Room,
                |state: &mut ChatState, deleted: MessageDeleted| {
                    let at = deleted.deleted_at.unwrap_or_else(Utc::now);
                    if state.log.mark_deleted(&deleted.message_id, at) {
                        Effect::Updated
                    } else {
                        debug!("[chat] Delete for unknown message {}", deleted.message_id);
                        Effect::Unchanged
                    }
                },
            )
            .on(
                events::ERROR,
                Scope::Global,
                |_: &mut ChatState, error: ServerError| Effect::Notice(error.message),
            );
    }

    fn snapshot(&self, state: &ChatState) -> ChatSnapshot {
        ChatSnapshot {
            channel_id: state.channel_id.clone(),
            messages: state.log.messages().clone(),
            has_more: state.log.has_more(),
            loading_more: state.loading_more,
            badges: state.badges.clone(),
        }
    }

    fn on_command(&self, ctx: &mut FeedContext<'_, Self>, command: ChatCommand) -> Result<()> {
        match command {
            ChatCommand::FetchMore => {
                self.fetch_more(ctx);
                Ok(())
            }
            ChatCommand::Send(body) => self.send_message(ctx, body),
        }
    }

    fn on_output(&self, ctx: &mut FeedContext<'_, Self>, output: ChatOutput) {
        match output {
            ChatOutput::OlderPage { requested, result } => {
                ctx.state_mut().loading_more = false;
                match result {
                    Ok(page) => {
                        let added = ctx.state_mut().log.merge_older(&requested, page);
                        debug!("[chat] Merged {} older messages", added);
                    }
                    Err(e) => ctx.notice(format!("Failed to load older messages: {}", e)),
                }
            }
        }
    }
}

impl FeedClient<ChatFeed> {
    pub fn fetch_more(&self) -> Result<()> {
        self.command(ChatCommand::FetchMore)
    }

    pub fn send_message(&self, body: impl Into<String>) -> Result<()> {
        self.command(ChatCommand::Send(body.into()))
    }
}
