/// WebSocket connector backed by tokio-tungstenite
use super::{Connector, Link};
use crate::error::{ChatError, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, url: &str) -> Result<Link> {
        let (ws_stream, _response) = connect_async(url)
            .await
            .map_err(|e| ChatError::Transport(format!("WebSocket connect to {} failed: {}", url, e)))?;
        debug!("WebSocket open: {}", url);

        let (mut write, mut read) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

        // Writer: ends when every outbound sender is dropped
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = write.send(WsMessage::Text(text)).await {
                    warn!("WebSocket write failed: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        // Reader: dropping in_tx tells the session the link is gone
        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                let text = match msg {
                    Ok(WsMessage::Text(text)) => text,
                    Ok(WsMessage::Binary(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
                    Ok(WsMessage::Close(frame)) => {
                        debug!("WebSocket closed by server: {:?}", frame);
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("WebSocket read failed: {}", e);
                        break;
                    }
                };
                if in_tx.send(text).is_err() {
                    break;
                }
            }
        });

        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
