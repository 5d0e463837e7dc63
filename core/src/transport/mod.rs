/// Push transport: STOMP framing, envelopes, and the socket connector
pub mod envelope;
pub mod stomp;
pub mod websocket;

use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

pub use envelope::{normalize, normalize_str, OutgoingEnvelope};
pub use stomp::{Command, Frame, FrameDecoder, Heartbeat};
pub use websocket::WebSocketConnector;

/// An open text-frame link to the broker.
///
/// Dropping `outbound` closes the socket; `inbound` yields `None` once the
/// remote side is gone.
pub struct Link {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

/// Opens links to the broker. The connection manager owns one and calls it
/// for the first connect and every reconnect.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self, url: &str) -> Result<Link>;
}
