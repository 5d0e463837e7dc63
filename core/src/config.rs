/// Configuration management
use crate::error::{ChatError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

const DEFAULT_BRIDGE_PORT: u16 = 17082;

/// Session configuration, injected into the connection manager and facade
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// STOMP-over-WebSocket endpoint
    pub broker_url: String,

    /// Base URL of the REST service (friends, users, message history)
    pub api_base_url: String,

    /// Private inbox destination the session subscribes to
    pub inbox_destination: String,

    /// Destination private messages are published to
    pub send_destination: String,

    /// Fixed delay between automatic reconnect attempts
    pub reconnect_delay: Duration,

    /// Consecutive reconnect attempts before giving up
    pub max_reconnect_attempts: u32,

    /// Heart-beat we expect from the broker
    pub heartbeat_incoming: Duration,

    /// Heart-beat we promise to the broker
    pub heartbeat_outgoing: Duration,

    /// How long to wait for CONNECTED after opening the socket
    pub connect_timeout: Duration,

    /// Tolerance window of the message de-duplication relation
    pub dedup_window: Duration,

    /// Local bridge API address (defaults to 127.0.0.1:17082)
    pub bridge_addr: Option<SocketAddr>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker_url: "ws://localhost:9080/chat".to_string(),
            api_base_url: "http://localhost:9080".to_string(),
            inbox_destination: "/user/queue/messages".to_string(),
            send_destination: "/app/chat.private".to_string(),
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_attempts: 5,
            heartbeat_incoming: Duration::from_secs(10),
            heartbeat_outgoing: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            dedup_window: Duration::from_secs(1),
            bridge_addr: None,
        }
    }
}

/// Parsed command line: the local username plus the session config
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub username: String,
    pub config: Config,
}

impl Config {
    /// Create config from command line arguments
    pub fn from_args(args: &[String]) -> Result<LaunchOptions> {
        if args.len() < 2 {
            return Err(ChatError::Config(format!(
                "Usage: {} <username> [--broker-url <url>] [--api-url <url>] [--bridge-port <port>] [--reconnect-delay-ms <ms>] [--max-reconnects <n>]",
                args.first().map(String::as_str).unwrap_or("chatlink")
            )));
        }

        let username = args[1].trim().to_string();
        if username.is_empty() || username.starts_with("--") {
            return Err(ChatError::Config("Username must be the first argument".to_string()));
        }

        let mut config = Config::default();
        let mut bridge_port: Option<u16> = None;

        let mut i = 2;
        while i < args.len() {
            let flag = args[i].as_str();
            let value = || {
                args.get(i + 1).ok_or_else(|| {
                    ChatError::Config(format!("{} requires an argument", flag))
                })
            };
            match flag {
                "--broker-url" => {
                    config.broker_url = value()?.clone();
                }
                "--api-url" => {
                    config.api_base_url = value()?.trim_end_matches('/').to_string();
                }
                "--bridge-port" => {
                    bridge_port = Some(value()?.parse::<u16>().map_err(|_| {
                        ChatError::Config("--bridge-port must be a valid number (0-65535)".to_string())
                    })?);
                }
                "--reconnect-delay-ms" => {
                    let ms = value()?.parse::<u64>().map_err(|_| {
                        ChatError::Config("--reconnect-delay-ms must be a number".to_string())
                    })?;
                    config.reconnect_delay = Duration::from_millis(ms);
                }
                "--max-reconnects" => {
                    config.max_reconnect_attempts = value()?.parse::<u32>().map_err(|_| {
                        ChatError::Config("--max-reconnects must be a number".to_string())
                    })?;
                }
                other => {
                    return Err(ChatError::Config(format!("Unknown argument: {}", other)));
                }
            }
            i += 2;
        }

        // Env overrides (nice for scripts)
        if let Ok(url) = std::env::var("CHATLINK_BROKER_URL") {
            config.broker_url = url;
        }
        if let Ok(url) = std::env::var("CHATLINK_API_URL") {
            config.api_base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(p) = std::env::var("CHATLINK_BRIDGE_PORT")
            .ok()
            .and_then(|s| s.parse::<u16>().ok())
        {
            bridge_port = Some(p);
        }

        config.bridge_addr = bridge_port
            .map(|p| format!("127.0.0.1:{}", p).parse())
            .transpose()
            .map_err(|_| ChatError::Config("Invalid bridge address".to_string()))?;

        config.validate()?;
        Ok(LaunchOptions { username, config })
    }

    /// Bridge API address, falling back to the default port
    pub fn bridge_addr(&self) -> SocketAddr {
        self.bridge_addr
            .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], DEFAULT_BRIDGE_PORT)))
    }

    /// Reject configurations the connection manager cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.broker_url.trim().is_empty() {
            return Err(ChatError::Config("broker_url is empty".to_string()));
        }
        if self.api_base_url.trim().is_empty() {
            return Err(ChatError::Config("api_base_url is empty".to_string()));
        }
        if self.inbox_destination.is_empty() || self.send_destination.is_empty() {
            return Err(ChatError::Config("STOMP destinations must be set".to_string()));
        }
        if self.dedup_window.is_zero() {
            return Err(ChatError::Config("dedup_window must be positive".to_string()));
        }
        Ok(())
    }
}
