//! Change feed — bounded, newest-first history of entity changes

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::protocol::EntityChange;

/// Default number of retained notifications
pub const DEFAULT_FEED_CAPACITY: usize = 50;

/// A received entity change, as retained by the feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub entity_type: String,
    pub entity_id: String,
    pub change_kind: String,
    pub author_user_id: Option<String>,
    /// Sender timestamp, or receive time when the sender gave none
    pub timestamp: DateTime<Utc>,
    pub payload: Map<String, Value>,
}

impl ChangeNotification {
    pub fn from_change(change: EntityChange, received_at: DateTime<Utc>) -> Self {
        Self {
            entity_type: change.entity_type,
            entity_id: change.entity_id,
            change_kind: change.change_kind,
            author_user_id: change.user_id,
            timestamp: change.timestamp.unwrap_or(received_at),
            payload: change.payload,
        }
    }
}

/// Ring of the most recent changes, newest first
#[derive(Debug, Clone)]
pub struct ChangeFeed {
    entries: VecDeque<ChangeNotification>,
    capacity: usize,
}

impl ChangeFeed {
    /// A zero capacity is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Insert at the front, evicting the oldest entry when full
    pub fn push(&mut self, notification: ChangeNotification) {
        self.entries.push_front(notification);
        self.entries.truncate(self.capacity);
    }

    /// Newest-first snapshot
    pub fn snapshot(&self) -> Vec<ChangeNotification> {
        self.entries.iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<&ChangeNotification> {
        self.entries.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChangeNotification> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn change(n: usize) -> ChangeNotification {
        ChangeNotification::from_change(
            EntityChange::new("task", format!("T{n}"), "updated"),
            Utc::now(),
        )
    }

    #[test]
    fn test_keeps_last_fifty_newest_first() {
        let mut feed = ChangeFeed::default();
        for n in 1..=60 {
            feed.push(change(n));
        }

        let ids: Vec<String> = feed.iter().map(|c| c.entity_id.clone()).collect();
        assert_eq!(ids.len(), 50);
        assert_eq!(ids.first().map(String::as_str), Some("T60"));
        assert_eq!(ids.last().map(String::as_str), Some("T11"));
    }

    #[test]
    fn test_zero_capacity_bumped() {
        let mut feed = ChangeFeed::new(0);
        feed.push(change(1));
        feed.push(change(2));
        assert_eq!(feed.len(), 1);
        assert_eq!(feed.latest().unwrap().entity_id, "T2");
    }

    #[test]
    fn test_timestamp_and_author() {
        let received = Utc::now();
        let sent: DateTime<Utc> = "2026-01-02T03:04:05Z".parse().unwrap();

        let mut with_ts = EntityChange::new("parcel", "P9", "deleted").with_author("u2");
        with_ts.timestamp = Some(sent);
        let n = ChangeNotification::from_change(with_ts, received);
        assert_eq!(n.timestamp, sent);
        assert_eq!(n.author_user_id.as_deref(), Some("u2"));

        let n = ChangeNotification::from_change(
            EntityChange::new("parcel", "P9", "updated").with_field("area", json!(12.5)),
            received,
        );
        assert_eq!(n.timestamp, received);
        assert_eq!(n.payload.get("area"), Some(&json!(12.5)));
    }
}
