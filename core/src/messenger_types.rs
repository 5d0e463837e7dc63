/// Shared types for the bridge layer
use crate::connection::ConnectionState;
use crate::message::Message;
use serde::Serialize;

/// Real-time events streamed over SSE (/events endpoint)
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessengerEvent {
    /// A message was pushed by the broker
    NewMessage { message: Message },
    /// The connection moved to a new state
    ConnectionState { state: ConnectionState },
    /// Something failed; `message` is the human-readable error
    Error { message: String },
}

/// Session summary returned by GET /api/status
#[derive(Debug, Clone, Serialize)]
pub struct StatusSummary {
    pub session_id: String,
    pub username: String,
    pub connection: ConnectionState,
    pub message_count: usize,
}
