//! Single-room subscription state machine.
//!
//! The controller tracks the `desired` channel requested by the consumer and
//! the `active` subscription the server knows about, and returns the join and
//! leave actions to emit. It never touches the connection itself, so every
//! transition is decided from current state only.

use crate::error::{FeedError, Result};
use common::{Channel, ConnectionState, Namespace};
use tracing::debug;

/// The channel currently joined (or last joined) within a namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub channel: Channel,
    /// False once the connection dropped; server membership does not survive
    /// reconnects.
    pub active: bool,
}

/// Protocol action decided by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionAction {
    Join(Channel),
    Leave(Channel),
}

/// Tracks the desired and active channel for one namespace.
#[derive(Debug)]
pub struct SubscriptionController {
    namespace: Namespace,
    desired: Option<Channel>,
    active: Option<Subscription>,
    connected: bool,
}

impl SubscriptionController {
    pub fn new(namespace: Namespace) -> Self {
        Self {
            namespace,
            desired: None,
            active: None,
            connected: false,
        }
    }

    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    pub fn desired_channel(&self) -> Option<&Channel> {
        self.desired.as_ref()
    }

    pub fn subscription(&self) -> Option<&Subscription> {
        self.active.as_ref()
    }

    /// The joined channel, if membership is currently live.
    pub fn active_channel(&self) -> Option<&Channel> {
        self.active
            .as_ref()
            .filter(|sub| sub.active)
            .map(|sub| &sub.channel)
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Request `channel` (or nothing). Joins happen only while connected;
    /// otherwise the request is recorded and honoured on the next connect.
    pub fn set_desired_channel(&mut self, channel: Option<Channel>) -> Result<Vec<SubscriptionAction>> {
        let Some(channel) = channel else {
            return Ok(self.release());
        };

        if channel.namespace() != self.namespace {
            return Err(FeedError::NamespaceMismatch {
                channel: channel.to_string(),
                expected: self.namespace,
            });
        }

        if self.active_channel() == Some(&channel) {
            return Ok(Vec::new());
        }

        self.desired = Some(channel);

        if !self.connected {
            debug!(
                "[{}] Deferring join for {:?} until connected",
                self.namespace, self.desired
            );
            return Ok(Vec::new());
        }

        Ok(self.switch_to_desired())
    }

    /// Feed a connection state change. `Connected` re-joins whatever is
    /// desired at that moment; anything else marks membership as lost.
    pub fn on_connection_state(&mut self, state: ConnectionState) -> Vec<SubscriptionAction> {
        match state {
            ConnectionState::Connected => {
                if self.connected {
                    return Vec::new();
                }
                self.connected = true;
                // Fresh session: the server holds no membership to leave.
                if let Some(sub) = self.active.as_mut() {
                    sub.active = false;
                }
                self.switch_to_desired()
            }
            _ => {
                self.connected = false;
                if let Some(sub) = self.active.as_mut() {
                    sub.active = false;
                }
                Vec::new()
            }
        }
    }

    /// Drop the desired channel and leave the active room, if any.
    pub fn teardown(&mut self) -> Vec<SubscriptionAction> {
        self.release()
    }

    fn release(&mut self) -> Vec<SubscriptionAction> {
        self.desired = None;
        match self.active.take() {
            Some(sub) if sub.active && self.connected => vec![SubscriptionAction::Leave(sub.channel)],
            _ => Vec::new(),
        }
    }

    /// Leave the live room (if any) and join `desired`. Requires a connection.
    fn switch_to_desired(&mut self) -> Vec<SubscriptionAction> {
        let mut actions = Vec::new();

        if let Some(prev) = self.active.take() {
            if prev.active {
                actions.push(SubscriptionAction::Leave(prev.channel));
            }
        }

        if let Some(channel) = self.desired.clone() {
            actions.push(SubscriptionAction::Join(channel.clone()));
            self.active = Some(Subscription {
                channel,
                active: true,
            });
        }

        actions
    }
}
