//! Odds feed: betting pool snapshot of one match.

use crate::dispatcher::{Effect, EventDispatcher, Scope};
use crate::error::Result;
use crate::runtime::Feed;
use async_trait::async_trait;
use common::{events, Channel, DerivedProbabilities, Namespace, OddsSnapshot, OutboundEvent};
use serde_json::json;
use std::sync::Arc;

/// Latest pool snapshot. Replaced wholesale on every push.
#[derive(Debug, Clone, Default)]
pub struct OddsState {
    pub snapshot: Option<Arc<OddsSnapshot>>,
}

impl OddsState {
    pub fn implied_probabilities(&self) -> Option<DerivedProbabilities> {
        self.snapshot.as_ref()?.implied_probabilities()
    }
}

#[derive(Debug, Default)]
pub struct OddsFeed;

impl OddsFeed {
    pub fn new() -> Self {
        Self
    }

    fn market(channel: &Channel) -> serde_json::Value {
        json!({ "matchId": channel.external_id() })
    }
}

#[async_trait]
impl Feed for OddsFeed {
    const NAMESPACE: Namespace = Namespace::Odds;

    type Target = String;
    type State = OddsState;
    type Snapshot = OddsState;
    type Prepared = ();
    type Command = ();
    type Output = ();

    fn channel_hint(&self, match_id: &String) -> Option<Channel> {
        Some(Channel::new(Namespace::Odds, match_id.clone()))
    }

    /// Nothing to fetch; the first push carries the full snapshot.
    async fn prepare(&self, _match_id: String) -> Result<()> {
        Ok(())
    }

    fn seed(&self, match_id: &String, _: (), _state: &mut OddsState) -> Channel {
        Channel::new(Namespace::Odds, match_id.clone())
    }

    fn join_event(&self, channel: &Channel) -> OutboundEvent {
        OutboundEvent::new(events::JOIN_MARKET, Self::market(channel))
    }

    fn leave_event(&self, channel: &Channel) -> OutboundEvent {
        OutboundEvent::new(events::LEAVE_MARKET, Self::market(channel))
    }

    fn register_routes(&self, dispatcher: &mut EventDispatcher<OddsState>) {
        dispatcher.on(
            events::BETTING_UPDATE,
            Scope::Channel("matchId"),
            |state: &mut OddsState, snapshot: OddsSnapshot| {
                if state.snapshot.as_deref() == Some(&snapshot) {
                    return Effect::Unchanged;
                }
                state.snapshot = Some(Arc::new(snapshot));
                Effect::Updated
            },
        );
    }

    fn snapshot(&self, state: &OddsState) -> OddsState {
        state.clone()
    }
}
