/// JSON envelopes on the wire and their normalisation into `Message`
///
/// Every inbound payload (pushed frames and history rows alike) goes through
/// [`normalize`]; nothing past this module sees the raw field names.
use crate::error::{ChatError, Result};
use crate::message::{Message, Origin};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

const SENDER_KEYS: [&str; 2] = ["sender", "senderUsername"];
const RECEIVER_KEYS: [&str; 2] = ["receiver", "receiverUsername"];
const BODY_KEYS: [&str; 3] = ["body", "content", "message"];
const TIME_KEYS: [&str; 3] = ["sentAt", "timestamp", "sendTime"];

/// Outbound private message body published to the send destination
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingEnvelope {
    pub receiver_username: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl OutgoingEnvelope {
    /// Trimmed receiver and content; extras never override the core fields
    pub fn new(receiver: &str, content: &str, timestamp: DateTime<Utc>, mut extra: Map<String, Value>) -> Self {
        for reserved in ["receiverUsername", "content", "timestamp"] {
            extra.remove(reserved);
        }
        Self {
            receiver_username: receiver.trim().to_string(),
            content: content.trim().to_string(),
            timestamp,
            extra,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Turn one JSON payload into a canonical message.
///
/// `received_at` stands in for a missing timestamp.
pub fn normalize(value: Value, origin: Origin, received_at: DateTime<Utc>) -> Result<Message> {
    let Value::Object(fields) = value else {
        return Err(ChatError::Protocol("Envelope is not a JSON object".to_string()));
    };

    let sender = required(user_field(&fields, &SENDER_KEYS), "sender")?;
    let receiver = required(user_field(&fields, &RECEIVER_KEYS), "receiver")?;
    let body = first(&fields, &BODY_KEYS)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if body.trim().is_empty() {
        return Err(ChatError::Protocol("Envelope has an empty body".to_string()));
    }
    let sent_at = match first(&fields, &TIME_KEYS) {
        None => received_at,
        Some(v) => parse_timestamp(v)?,
    };

    Ok(Message {
        sender,
        receiver,
        body,
        sent_at,
        origin,
    })
}

/// Parse a pushed frame body
pub fn normalize_str(body: &str, origin: Origin, received_at: DateTime<Utc>) -> Result<Message> {
    let value: Value = serde_json::from_str(body)?;
    normalize(value, origin, received_at)
}

/// First non-null value among the alias keys
fn first<'a>(fields: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| fields.get(*k))
        .find(|v| !v.is_null())
}

/// A party is either a username string or a user object carrying `username`
fn user_field(fields: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    match first(fields, keys)? {
        Value::String(s) => Some(s.clone()),
        Value::Object(user) => user.get("username").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

fn required(field: Option<String>, name: &str) -> Result<String> {
    match field.map(|s| s.trim().to_string()) {
        Some(s) if !s.is_empty() => Ok(s),
        _ => Err(ChatError::Protocol(format!("Envelope is missing {}", name))),
    }
}

/// RFC 3339, zone-less ISO date-time (taken as UTC), or epoch milliseconds
pub fn parse_timestamp(value: &Value) -> Result<DateTime<Utc>> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|ms| ms.is_finite()).map(|ms| ms.trunc() as i64))
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .ok_or_else(|| ChatError::Protocol(format!("Timestamp out of range: {}", n))),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Ok(dt.with_timezone(&Utc));
            }
            for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
                if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
                    return Ok(naive.and_utc());
                }
            }
            Err(ChatError::Protocol(format!("Unparseable timestamp: {}", s)))
        }
        other => Err(ChatError::Protocol(format!("Unexpected timestamp value: {}", other))),
    }
}
