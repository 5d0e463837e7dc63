/// ChatLink - messaging client core
///
/// Private one-to-one messaging over STOMP/WebSocket: a connection manager
/// with reconnect, a de-duplicating message store, pure conversation
/// projections, and a facade tying them together for UI glue.

pub mod error;
pub mod config;
pub mod message;
pub mod message_store;
pub mod projector;
pub mod transport;
pub mod connection;
pub mod messenger;
pub mod directory;
pub mod messenger_types;
pub mod messenger_api;
pub mod cli_app;
pub mod utils;

pub use error::{ChatError, Result};
pub use config::Config;
pub use connection::{ConnectionManager, ConnectionState};
pub use message::{Friend, Message, Origin};
pub use message_store::MessageStore;
pub use messenger::Messenger;
