//! Routes inbound protocol events to feed reducers.
//!
//! Each event name is registered with a [`Scope`] deciding whether it is
//! bound to the active channel. Channel-scoped events whose id does not
//! match the active subscription are dropped before the reducer runs; they
//! are leftovers of a switch or a late delivery from a room already left.

use crate::error::{FeedError, Result};
use common::{Channel, InboundEvent, Namespace};
use metrics::counter;
use serde::de::{DeserializeOwned, Error as _};
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

/// How an event relates to the active channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Payload field `key` must equal the active channel id.
    Channel(&'static str),
    /// Applies to the joined room but carries no channel id.
    Room,
    /// Namespace-wide; applied regardless of membership.
    Global,
}

/// What a reducer did to the state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Updated,
    Unchanged,
    /// Non-fatal condition to surface to the consumer.
    Notice(String),
}

/// Outcome of one dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Applied(Effect),
    /// Event for a channel that is not active; dropped.
    Stale,
    /// No route registered under this name.
    Unhandled,
}

type Reducer<S> = Box<dyn Fn(&mut S, Value) -> std::result::Result<Effect, serde_json::Error> + Send + Sync>;

struct Route<S> {
    scope: Scope,
    reducer: Reducer<S>,
}

/// Event-name keyed reducer table for one feed state type.
pub struct EventDispatcher<S> {
    namespace: Namespace,
    routes: HashMap<&'static str, Route<S>>,
}

impl<S> EventDispatcher<S> {
    pub fn new(namespace: Namespace) -> Self {
        Self {
            namespace,
            routes: HashMap::new(),
        }
    }

    /// Register `reducer` for `event`. The payload is decoded into `P` only
    /// after the scope check passed. A later registration replaces an
    /// earlier one for the same name.
    pub fn on<P, F>(&mut self, event: &'static str, scope: Scope, reducer: F) -> &mut Self
    where
        P: DeserializeOwned,
        F: Fn(&mut S, P) -> Effect + Send + Sync + 'static,
    {
        let reducer: Reducer<S> = Box::new(move |state, data| {
            let payload = serde_json::from_value::<P>(data)?;
            Ok(reducer(state, payload))
        });
        self.routes.insert(event, Route { scope, reducer });
        self
    }

    pub fn handles(&self, event: &str) -> bool {
        self.routes.contains_key(event)
    }

    /// Apply `event` to `state` if it belongs to `active`.
    pub fn dispatch(&self, state: &mut S, active: Option<&Channel>, event: InboundEvent) -> Result<Dispatch> {
        let Some(route) = self.routes.get(event.name.as_str()) else {
            debug!("[{}] No route for '{}'", self.namespace, event.name);
            return Ok(Dispatch::Unhandled);
        };

        match route.scope {
            Scope::Global => {}
            Scope::Room => {
                if active.is_none() {
                    return Ok(self.drop_stale(&event.name, None));
                }
            }
            Scope::Channel(key) => {
                let Some(id) = event.data.get(key) else {
                    return Err(FeedError::Payload {
                        event: event.name,
                        source: serde_json::Error::missing_field(key),
                    });
                };
                let id = common::types::id_from_value(id);
                let matches = match (active, id.as_deref()) {
                    (Some(channel), Some(id)) => channel.external_id() == id,
                    _ => false,
                };
                if !matches {
                    return Ok(self.drop_stale(&event.name, id.as_deref()));
                }
            }
        }

        let effect = (route.reducer)(state, event.data).map_err(|source| FeedError::Payload {
            event: event.name,
            source,
        })?;
        Ok(Dispatch::Applied(effect))
    }

    fn drop_stale(&self, event: &str, id: Option<&str>) -> Dispatch {
        debug!(
            "[{}] Dropping stale '{}' for {:?}",
            self.namespace, event, id
        );
        counter!("channel_client_stale_events_dropped_total", "namespace" => self.namespace.as_str())
            .increment(1);
        Dispatch::Stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Default)]
    struct Counter {
        count: u64,
        status: Option<String>,
        global: Vec<String>,
    }

    #[derive(Deserialize)]
    struct CountPayload {
        count: u64,
    }

    #[derive(Deserialize)]
    struct StatusPayload {
        status: String,
    }

    fn dispatcher() -> EventDispatcher<Counter> {
        let mut d = EventDispatcher::new(Namespace::Presence);
        d.on("viewersCount", Scope::Channel("matchId"), |s: &mut Counter, p: CountPayload| {
            s.count = p.count;
            Effect::Updated
        })
        .on("status", Scope::Room, |s: &mut Counter, p: StatusPayload| {
            s.status = Some(p.status);
            Effect::Updated
        })
        .on("global", Scope::Global, |s: &mut Counter, p: StatusPayload| {
            s.global.push(p.status);
            Effect::Updated
        });
        d
    }

    fn m(id: &str) -> Channel {
        Channel::new(Namespace::Presence, id)
    }

    #[test]
    fn test_matching_channel_is_applied() {
        let d = dispatcher();
        let mut state = Counter::default();
        let event = InboundEvent::new("viewersCount", json!({ "matchId": 7, "count": 12 }));

        let out = d.dispatch(&mut state, Some(&m("7")), event).unwrap();
        assert_eq!(out, Dispatch::Applied(Effect::Updated));
        assert_eq!(state.count, 12);
    }

    #[test]
    fn test_foreign_channel_is_stale() {
        let d = dispatcher();
        let mut state = Counter::default();
        let event = InboundEvent::new("viewersCount", json!({ "matchId": "old", "count": 12 }));

        let out = d.dispatch(&mut state, Some(&m("new")), event).unwrap();
        assert_eq!(out, Dispatch::Stale);
        assert_eq!(state.count, 0);
    }

    #[test]
    fn test_scoped_events_dropped_without_active_room() {
        let d = dispatcher();
        let mut state = Counter::default();

        let scoped = InboundEvent::new("viewersCount", json!({ "matchId": "m", "count": 1 }));
        assert_eq!(d.dispatch(&mut state, None, scoped).unwrap(), Dispatch::Stale);

        let room = InboundEvent::new("status", json!({ "status": "live" }));
        assert_eq!(d.dispatch(&mut state, None, room).unwrap(), Dispatch::Stale);
        assert!(state.status.is_none());
    }

    #[test]
    fn test_global_ignores_membership() {
        let d = dispatcher();
        let mut state = Counter::default();
        let event = InboundEvent::new("global", json!({ "status": "live" }));

        assert_eq!(
            d.dispatch(&mut state, None, event).unwrap(),
            Dispatch::Applied(Effect::Updated)
        );
        assert_eq!(state.global, vec!["live"]);
    }

    #[test]
    fn test_unknown_event_is_unhandled() {
        let d = dispatcher();
        let mut state = Counter::default();
        let event = InboundEvent::new("somethingElse", json!({}));
        assert_eq!(d.dispatch(&mut state, Some(&m("1")), event).unwrap(), Dispatch::Unhandled);
    }

    #[test]
    fn test_bad_payload_is_error() {
        let d = dispatcher();
        let mut state = Counter::default();

        let event = InboundEvent::new("viewersCount", json!({ "matchId": "1", "count": "many" }));
        let err = d.dispatch(&mut state, Some(&m("1")), event).unwrap_err();
        assert!(matches!(err, FeedError::Payload { ref event, .. } if event == "viewersCount"));

        let event = InboundEvent::new("viewersCount", json!({ "count": 3 }));
        assert!(d.dispatch(&mut state, Some(&m("1")), event).is_err());
    }
}
