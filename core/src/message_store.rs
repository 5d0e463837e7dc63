/// Session message store: append-only, de-duplicating, insertion ordered
/// Ordering by time is a projection concern (see `projector`).
use crate::message::Message;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(1);

pub struct MessageStore {
    entries: Vec<Message>,
    /// (sender, receiver) -> positions in `entries`
    buckets: HashMap<(String, String), Vec<usize>>,
    window: Duration,
}

impl MessageStore {
    /// Create an empty store with the default 1s de-duplication window
    pub fn new() -> Self {
        Self::with_window(DEFAULT_DEDUP_WINDOW)
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            entries: Vec::new(),
            buckets: HashMap::new(),
            window,
        }
    }

    /// Insert unless an existing entry is a duplicate. Returns whether the
    /// message was stored.
    pub fn append(&mut self, message: Message) -> bool {
        let key = (message.sender.clone(), message.receiver.clone());
        if let Some(positions) = self.buckets.get(&key) {
            let window = self.window;
            if let Some(&existing) = positions
                .iter()
                .find(|&&i| self.entries[i].is_duplicate_of(&message, window))
            {
                debug!(
                    "Dropping duplicate {:?} message {} -> {} (matches entry {} from {:?})",
                    message.origin,
                    message.sender,
                    message.receiver,
                    existing,
                    self.entries[existing].origin
                );
                return false;
            }
        }

        let position = self.entries.len();
        self.buckets.entry(key).or_default().push(position);
        self.entries.push(message);
        true
    }

    /// Append each message in order; duplicates are checked against the
    /// existing store and earlier items of the same batch. Returns how many
    /// were stored.
    pub fn append_batch<I>(&mut self, messages: I) -> usize
    where
        I: IntoIterator<Item = Message>,
    {
        let mut stored = 0;
        for message in messages {
            if self.append(message) {
                stored += 1;
            }
        }
        stored
    }

    /// All messages in insertion order
    pub fn all(&self) -> &[Message] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop everything (logout / disconnect)
    pub fn clear(&mut self) {
        self.entries.clear();
        self.buckets.clear();
    }
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Origin;
    use chrono::{DateTime, TimeZone, Utc};

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).single().unwrap()
    }

    fn msg(from: &str, to: &str, body: &str, ms: i64, origin: Origin) -> Message {
        Message::new(from, to, body, at(ms), origin)
    }

    #[test]
    fn test_pushed_echo_is_deduplicated() {
        let mut store = MessageStore::new();
        assert!(store.append(msg("alice", "bob", "hi", 1_000, Origin::Optimistic)));
        assert!(!store.append(msg("alice", "bob", "hi", 1_200, Origin::Pushed)));
        assert_eq!(store.len(), 1);
        assert_eq!(store.all()[0].origin, Origin::Optimistic);
    }

    #[test]
    fn test_same_text_later_is_kept() {
        let mut store = MessageStore::new();
        store.append(msg("alice", "bob", "ok", 0, Origin::Pushed));
        store.append(msg("alice", "bob", "ok", 5_000, Origin::Pushed));
        store.append(msg("bob", "alice", "ok", 0, Origin::Pushed));
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_all_keeps_insertion_order() {
        let mut store = MessageStore::new();
        store.append(msg("bob", "alice", "second", 2_000, Origin::Pushed));
        store.append(msg("alice", "bob", "first", 1_000, Origin::Historical));
        let bodies: Vec<_> = store.all().iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["second", "first"]);
    }

    #[test]
    fn test_batch_dedups_within_itself() {
        let mut store = MessageStore::new();
        let batch = vec![
            msg("alice", "bob", "a", 0, Origin::Historical),
            msg("alice", "bob", "a", 300, Origin::Historical),
            msg("bob", "alice", "b", 1_000, Origin::Historical),
        ];
        assert_eq!(store.append_batch(batch), 2);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_batch_twice_is_idempotent() {
        let mut store = MessageStore::new();
        let batch = vec![
            msg("alice", "bob", "one", 0, Origin::Historical),
            msg("bob", "alice", "two", 10_000, Origin::Historical),
            msg("alice", "bob", "three", 20_000, Origin::Historical),
        ];
        store.append_batch(batch.clone());
        let once: Vec<Message> = store.all().to_vec();
        assert_eq!(store.append_batch(batch), 0);
        assert_eq!(store.all(), once.as_slice());
    }

    #[test]
    fn test_len_never_exceeds_calls() {
        let mut store = MessageStore::new();
        let mut calls = 0;
        let mut dropped = 0;
        for i in 0..50i64 {
            let body = format!("m{}", i % 7);
            calls += 1;
            if !store.append(msg("alice", "bob", &body, (i % 3) * 400, Origin::Pushed)) {
                dropped += 1;
            }
            assert!(store.len() <= calls);
        }
        assert_eq!(store.len(), calls - dropped);
    }

    #[test]
    fn test_clear_empties_store() {
        let mut store = MessageStore::new();
        store.append(msg("alice", "bob", "hi", 0, Origin::Pushed));
        store.clear();
        assert!(store.is_empty());
        assert!(store.append(msg("alice", "bob", "hi", 0, Origin::Pushed)));
    }
}
