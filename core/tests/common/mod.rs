#![allow(dead_code)]
/// In-memory STOMP broker used by the integration tests
use async_trait::async_trait;
use chatlink_core::config::Config;
use chatlink_core::error::{ChatError, Result};
use chatlink_core::transport::{Command, Connector, Frame, FrameDecoder, Link};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

pub const WAIT: Duration = Duration::from_secs(3);

/// Fast settings: no heart-beats, short backoff, two reconnect attempts
pub fn test_config() -> Config {
    Config {
        reconnect_delay: Duration::from_millis(50),
        max_reconnect_attempts: 2,
        heartbeat_incoming: Duration::ZERO,
        heartbeat_outgoing: Duration::ZERO,
        connect_timeout: Duration::from_secs(1),
        ..Default::default()
    }
}

/// Broker end of one client link
pub struct BrokerLink {
    pub to_client: mpsc::UnboundedSender<String>,
    pub from_client: mpsc::UnboundedReceiver<String>,
    decoder: FrameDecoder,
    pending: Vec<Frame>,
    next_message_id: u64,
}

impl BrokerLink {
    /// Next frame sent by the client, skipping heart-beats
    pub async fn next_frame(&mut self) -> Frame {
        loop {
            if !self.pending.is_empty() {
                return self.pending.remove(0);
            }
            let chunk = timeout(WAIT, self.from_client.recv())
                .await
                .expect("client sent nothing")
                .expect("client closed the link");
            self.pending = self.decoder.push(&chunk).expect("client sent a bad frame");
        }
    }

    /// Read CONNECT, answer CONNECTED, read SUBSCRIBE. Returns (CONNECT, SUBSCRIBE).
    pub async fn accept(&mut self) -> (Frame, Frame) {
        self.accept_with_heartbeat("0,0").await
    }

    /// Like `accept`, advertising `heart_beat` in CONNECTED
    pub async fn accept_with_heartbeat(&mut self, heart_beat: &str) -> (Frame, Frame) {
        let connect = self.next_frame().await;
        assert_eq!(connect.command, Command::Connect);
        let connected = Frame::new(Command::Connected)
            .header("version", "1.2")
            .header("heart-beat", heart_beat);
        self.to_client.send(connected.encode()).expect("client gone");
        let subscribe = self.next_frame().await;
        assert_eq!(subscribe.command, Command::Subscribe);
        (connect, subscribe)
    }

    /// Read CONNECT and answer with an ERROR frame
    pub async fn reject(&mut self, reason: &str) {
        let connect = self.next_frame().await;
        assert_eq!(connect.command, Command::Connect);
        let error = Frame::new(Command::Error)
            .header("message", reason)
            .with_body(reason);
        self.to_client.send(error.encode()).expect("client gone");
    }

    /// Next raw chunk from the client, heart-beats included
    pub async fn next_chunk(&mut self) -> String {
        timeout(WAIT, self.from_client.recv())
            .await
            .expect("client sent nothing")
            .expect("client closed the link")
    }

    /// Broker-side heart-beat
    pub fn beat(&self) {
        let _ = self.to_client.send("\n".to_string());
    }

    /// Deliver a MESSAGE frame on the inbox subscription
    pub fn push(&mut self, payload: &Value) {
        self.push_raw(&payload.to_string());
    }

    pub fn push_raw(&mut self, body: &str) {
        self.next_message_id += 1;
        let frame = Frame::new(Command::Message)
            .header("subscription", "sub-0")
            .header("destination", "/user/queue/messages")
            .header("message-id", self.next_message_id.to_string())
            .with_body(body);
        self.to_client.send(frame.encode()).expect("client gone");
    }
}

/// Hands every link opened by the client to the test
pub struct MockBroker {
    links: mpsc::UnboundedReceiver<BrokerLink>,
    refuse: Arc<AtomicBool>,
}

impl MockBroker {
    pub fn new() -> (Self, Arc<dyn Connector>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let refuse = Arc::new(AtomicBool::new(false));
        let connector = MockConnector {
            links: tx,
            refuse: refuse.clone(),
        };
        (
            Self {
                links: rx,
                refuse,
            },
            Arc::new(connector),
        )
    }

    pub async fn next_link(&mut self) -> BrokerLink {
        timeout(WAIT, self.links.recv())
            .await
            .expect("client never opened a link")
            .expect("connector dropped")
    }

    /// True if the client opens a link within `within`
    pub async fn opens_link_within(&mut self, within: Duration) -> bool {
        matches!(timeout(within, self.links.recv()).await, Ok(Some(_)))
    }

    /// Make every following `open` fail like a refused TCP connection
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

struct MockConnector {
    links: mpsc::UnboundedSender<BrokerLink>,
    refuse: Arc<AtomicBool>,
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, _url: &str) -> Result<Link> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(ChatError::Transport("Connection refused".to_string()));
        }
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (broker_tx, broker_rx) = mpsc::unbounded_channel();
        let link = BrokerLink {
            to_client: broker_tx,
            from_client: client_rx,
            decoder: FrameDecoder::new(),
            pending: Vec::new(),
            next_message_id: 0,
        };
        self.links
            .send(link)
            .map_err(|_| ChatError::Transport("Broker gone".to_string()))?;
        Ok(Link {
            outbound: client_tx,
            inbound: broker_rx,
        })
    }
}
