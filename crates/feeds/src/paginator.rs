//! Backward history pagination and the merged chat message log.
//!
//! History pages arrive newest first and are reversed into ascending order.
//! [`MessageLog`] keeps one sequence sorted by `(created_at, id)` and unique
//! by id, whichever way a message arrived (initial page, older page or live
//! push) and in whatever order those paths race.

use crate::error::Result;
use chrono::{DateTime, Utc};
use common::{Message, Namespace};
use metrics::counter;
use rest_client::{MessagePage, PlatformApi};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Opaque backward-pagination pointer bound to one channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cursor {
    channel_id: String,
    token: String,
}

impl Cursor {
    pub fn new(channel_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            token: token.into(),
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

/// One history page in ascending order, with the pointer to the next older
/// page (`None` on the oldest page).
#[derive(Debug, Clone, Default)]
pub struct HistoryPage {
    pub messages: Vec<Message>,
    pub cursor: Option<Cursor>,
}

impl HistoryPage {
    fn from_wire(channel_id: &str, page: MessagePage) -> Self {
        let mut messages = page.messages;
        messages.reverse();
        Self {
            messages,
            cursor: page.next_cursor.map(|token| Cursor::new(channel_id, token)),
        }
    }
}

/// Fetches history pages through the platform API.
#[derive(Clone)]
pub struct HistoryPaginator {
    api: Arc<dyn PlatformApi>,
    page_size: usize,
}

impl HistoryPaginator {
    pub fn new(api: Arc<dyn PlatformApi>, page_size: usize) -> Self {
        Self {
            api,
            page_size: page_size.max(1),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Newest page of `channel_id`.
    pub async fn fetch_initial(&self, channel_id: &str) -> Result<HistoryPage> {
        let page = self
            .api
            .fetch_messages(channel_id, None, self.page_size)
            .await?;
        Ok(HistoryPage::from_wire(channel_id, page))
    }

    /// The page older than `cursor`, on the cursor's own channel.
    pub async fn fetch_more(&self, cursor: &Cursor) -> Result<HistoryPage> {
        let page = self
            .api
            .fetch_messages(&cursor.channel_id, Some(&cursor.token), self.page_size)
            .await?;
        Ok(HistoryPage::from_wire(&cursor.channel_id, page))
    }
}

/// Ordered, id-unique message sequence of one channel.
///
/// The vector sits behind an `Arc` so snapshots share it; mutation goes
/// through `Arc::make_mut` and only copies while a snapshot is still alive.
#[derive(Debug, Clone, Default)]
pub struct MessageLog {
    messages: Arc<Vec<Message>>,
    ids: HashSet<String>,
    cursor: Option<Cursor>,
    has_more: bool,
}

impl MessageLog {
    /// Start a log from the initial page.
    pub fn seeded(page: HistoryPage) -> Self {
        let mut log = Self {
            has_more: page.cursor.is_some(),
            cursor: page.cursor,
            ..Default::default()
        };
        log.insert_all(page.messages);
        log
    }

    pub fn messages(&self) -> &Arc<Vec<Message>> {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn cursor(&self) -> Option<&Cursor> {
        self.cursor.as_ref()
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    /// Merge an older page fetched with `requested`. Ids already present are
    /// skipped. The cursor only moves when `requested` is the cursor held
    /// now, so a retried or superseded fetch never rewinds it.
    ///
    /// Returns the number of messages added.
    pub fn merge_older(&mut self, requested: &Cursor, page: HistoryPage) -> usize {
        let added = self.insert_all(page.messages);

        if self.cursor.as_ref() == Some(requested) {
            self.has_more = page.cursor.is_some();
            self.cursor = page.cursor;
        } else {
            debug!(
                "Page for cursor {:?} no longer current ({:?}), cursor kept",
                requested.token, self.cursor
            );
        }

        counter!("channel_client_history_messages_merged_total", "namespace" => Namespace::Chat.as_str())
            .increment(added as u64);
        added
    }

    /// Add a pushed message. Returns false for an id already present.
    pub fn append_live(&mut self, message: Message) -> bool {
        if self.ids.contains(&message.id) {
            return false;
        }
        self.ids.insert(message.id.clone());
        let messages = Arc::make_mut(&mut self.messages);
        // Live pushes normally land at the tail.
        let pos = messages.partition_point(|m| m.order_key() <= message.order_key());
        messages.insert(pos, message);
        true
    }

    /// Logically delete `id`. Position is kept. Returns false when the id is
    /// unknown or already deleted.
    pub fn mark_deleted(&mut self, id: &str, at: DateTime<Utc>) -> bool {
        if !self.ids.contains(id) {
            return false;
        }
        let messages = Arc::make_mut(&mut self.messages);
        match messages.iter_mut().find(|m| m.id == id) {
            Some(message) if message.deleted_at.is_none() => {
                message.deleted_at = Some(at);
                true
            }
            _ => false,
        }
    }

    fn insert_all(&mut self, incoming: Vec<Message>) -> usize {
        let fresh: Vec<Message> = incoming
            .into_iter()
            .filter(|m| self.ids.insert(m.id.clone()))
            .collect();
        if fresh.is_empty() {
            return 0;
        }

        let added = fresh.len();
        let messages = Arc::make_mut(&mut self.messages);
        messages.extend(fresh);
        messages.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
        added
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{message, FakeApi};
    use std::collections::HashMap;

    fn ids(log: &MessageLog) -> Vec<String> {
        log.messages().iter().map(|m| m.id.clone()).collect()
    }

    fn assert_sorted_unique(log: &MessageLog) {
        let keys: Vec<_> = log.messages().iter().map(|m| m.order_key()).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);

        let unique: HashSet<_> = log.messages().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(unique.len(), log.len());
    }

    fn page(range: std::ops::Range<i64>, cursor: Option<&str>) -> HistoryPage {
        HistoryPage {
            messages: range.map(|i| message("c1", i)).collect(),
            cursor: cursor.map(|t| Cursor::new("c1", t)),
        }
    }

    #[test]
    fn test_seed_and_live_append() {
        let mut log = MessageLog::seeded(page(80..100, Some("k1")));
        assert_eq!(log.len(), 20);
        assert!(log.has_more());

        assert!(log.append_live(message("c1", 100)));
        assert_eq!(log.len(), 21);
        assert_eq!(log.messages().last().unwrap().id, "m100");

        // The same push again is ignored.
        assert!(!log.append_live(message("c1", 100)));
        assert_eq!(log.len(), 21);
        assert_sorted_unique(&log);
    }

    #[test]
    fn test_merge_older_skips_live_duplicates() {
        let mut log = MessageLog::seeded(page(80..100, Some("k1")));
        // Five older messages arrived through live pushes first.
        for i in 60..65 {
            log.append_live(message("c1", i));
        }
        assert_eq!(log.len(), 25);

        let added = log.merge_older(&Cursor::new("c1", "k1"), page(60..80, Some("k2")));
        assert_eq!(added, 15);
        assert_eq!(log.len(), 40);
        assert_eq!(log.cursor(), Some(&Cursor::new("c1", "k2")));
        assert_eq!(ids(&log).first().map(String::as_str), Some("m60"));
        assert_sorted_unique(&log);
    }

    #[test]
    fn test_repeated_cursor_changes_nothing() {
        let mut log = MessageLog::seeded(page(80..100, Some("k1")));
        log.merge_older(&Cursor::new("c1", "k1"), page(60..80, Some("k2")));
        let before = ids(&log);

        let added = log.merge_older(&Cursor::new("c1", "k1"), page(60..80, Some("k2")));
        assert_eq!(added, 0);
        assert_eq!(ids(&log), before);
        assert_eq!(log.cursor(), Some(&Cursor::new("c1", "k2")));
    }

    #[test]
    fn test_last_page_clears_has_more() {
        let mut log = MessageLog::seeded(page(10..20, Some("k1")));
        log.merge_older(&Cursor::new("c1", "k1"), page(0..10, None));
        assert!(!log.has_more());
        assert!(log.cursor().is_none());
    }

    #[test]
    fn test_stale_cursor_does_not_move_pointer() {
        let mut log = MessageLog::seeded(page(80..100, Some("k1")));
        log.merge_older(&Cursor::new("c1", "k1"), page(60..80, Some("k2")));

        // An answer for an old cursor claims there is nothing older.
        log.merge_older(&Cursor::new("c1", "k1"), page(60..80, None));
        assert!(log.has_more());
        assert_eq!(log.cursor(), Some(&Cursor::new("c1", "k2")));
    }

    #[test]
    fn test_interleavings_keep_one_entry_per_id() {
        // Live push before and after the page that also carries the id.
        let mut log = MessageLog::seeded(page(50..60, Some("k1")));
        log.append_live(message("c1", 45));
        log.merge_older(&Cursor::new("c1", "k1"), page(40..50, Some("k2")));
        log.append_live(message("c1", 42));
        log.append_live(message("c1", 61));
        log.merge_older(&Cursor::new("c1", "k2"), page(30..45, None));

        assert_eq!(log.len(), 31);
        assert_eq!(log.messages().iter().filter(|m| m.id == "m45").count(), 1);
        assert_eq!(log.messages().iter().filter(|m| m.id == "m42").count(), 1);
        assert_sorted_unique(&log);
    }

    #[test]
    fn test_ties_on_timestamp_order_by_id() {
        let mut log = MessageLog::default();
        let mut b = message("c1", 1);
        b.id = "b".to_string();
        let mut a = message("c1", 1);
        a.id = "a".to_string();

        log.append_live(b);
        log.append_live(a);
        assert_eq!(ids(&log), vec!["a", "b"]);
    }

    #[test]
    fn test_mark_deleted_keeps_position() {
        let mut log = MessageLog::seeded(page(0..5, None));
        let before = ids(&log);
        let at = Utc::now();

        assert!(log.mark_deleted("m2", at));
        assert_eq!(ids(&log), before);
        assert_eq!(log.messages()[2].deleted_at, Some(at));

        // Already deleted keeps the first timestamp.
        assert!(!log.mark_deleted("m2", at + chrono::Duration::seconds(5)));
        assert_eq!(log.messages()[2].deleted_at, Some(at));
    }

    #[test]
    fn test_mark_deleted_unknown_id_is_noop() {
        let mut log = MessageLog::seeded(page(0..5, None));
        assert!(!log.mark_deleted("missing", Utc::now()));
        assert_eq!(log.len(), 5);
        assert!(log.messages().iter().all(|m| !m.is_deleted()));
    }

    #[test]
    fn test_snapshot_is_not_mutated() {
        let mut log = MessageLog::seeded(page(0..3, None));
        let snapshot = log.messages().clone();
        log.append_live(message("c1", 3));
        assert_eq!(snapshot.len(), 3);
        assert_eq!(log.len(), 4);
    }

    #[tokio::test]
    async fn test_paginator_reverses_pages() {
        let api = FakeApi::new();
        api.set_history("c1", (0..30).map(|i| message("c1", i)).collect());

        let paginator = HistoryPaginator::new(Arc::new(api.clone()), 20);
        let first = paginator.fetch_initial("c1").await.unwrap();
        assert_eq!(first.messages.len(), 20);
        assert_eq!(first.messages.first().unwrap().id, "m10");
        assert_eq!(first.messages.last().unwrap().id, "m29");

        let cursor = first.cursor.clone().unwrap();
        assert_eq!(cursor.channel_id(), "c1");

        let older = paginator.fetch_more(&cursor).await.unwrap();
        assert_eq!(older.messages.len(), 10);
        assert_eq!(older.messages.first().unwrap().id, "m0");
        assert!(older.cursor.is_none());

        // Same cursor, same page.
        let again = paginator.fetch_more(&cursor).await.unwrap();
        let a: Vec<_> = older.messages.iter().map(|m| &m.id).collect();
        let b: Vec<_> = again.messages.iter().map(|m| &m.id).collect();
        assert_eq!(a, b);

        let calls: HashMap<_, _> = api.history_calls().into_iter().fold(HashMap::new(), |mut acc, c| {
            *acc.entry(c).or_insert(0) += 1;
            acc
        });
        assert_eq!(calls.get(&Some(cursor.token().to_string())), Some(&2));
    }
}
