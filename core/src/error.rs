/// Error types for the messaging core
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error("Authentication required: no bearer token available")]
    AuthRequired,

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Not connected to the message broker")]
    NotConnected,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("History fetch for {peer} failed: {reason}")]
    HistoryFetch { peer: String, reason: String },

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Timeout error: {0}")]
    Timeout(String),
}

impl ChatError {
    /// Whether a connection failure should stop automatic reconnection.
    /// Retrying a rejected CONNECT with the same credentials cannot succeed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChatError::AuthRequired | ChatError::Broker(_))
    }
}

impl From<std::io::Error> for ChatError {
    fn from(e: std::io::Error) -> Self {
        ChatError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(e: serde_json::Error) -> Self {
        ChatError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
