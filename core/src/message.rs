/// Canonical message and friend shapes shared by the whole core
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Where a message record came from. Only used to resolve conflicts;
/// never shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Inserted locally at send time, before the broker saw it
    Optimistic,
    /// Loaded from the message history service
    Historical,
    /// Delivered by the push connection
    Pushed,
}

/// A private text message between two users
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub sender: String,
    pub receiver: String,
    pub body: String,
    pub sent_at: DateTime<Utc>,
    #[serde(skip_serializing, default = "default_origin")]
    pub origin: Origin,
}

fn default_origin() -> Origin {
    Origin::Historical
}

impl Message {
    pub fn new(
        sender: impl Into<String>,
        receiver: impl Into<String>,
        body: impl Into<String>,
        sent_at: DateTime<Utc>,
        origin: Origin,
    ) -> Self {
        Self {
            sender: sender.into(),
            receiver: receiver.into(),
            body: body.into(),
            sent_at,
            origin,
        }
    }

    /// De-duplication equality: same sender, receiver and body, with
    /// `sent_at` values no further apart than `window`.
    pub fn is_duplicate_of(&self, other: &Message, window: Duration) -> bool {
        if self.sender != other.sender || self.receiver != other.receiver || self.body != other.body {
            return false;
        }
        let delta = (self.sent_at - other.sent_at).abs();
        match delta.to_std() {
            Ok(d) => d <= window,
            Err(_) => false,
        }
    }

    /// True when `{sender, receiver}` equals the unordered pair `{a, b}`
    pub fn involves(&self, a: &str, b: &str) -> bool {
        (self.sender == a && self.receiver == b) || (self.sender == b && self.receiver == a)
    }
}

/// A user from the friend directory. The core only uses `username` as a
/// conversation key; the rest is carried for UI glue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Friend {
    pub id: i64,
    pub username: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub last_seen: Option<String>,
}
