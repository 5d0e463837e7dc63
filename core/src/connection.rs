/// Connection lifecycle for the push transport
///
/// One `ConnectionManager` per session. It owns the broker link, runs the
/// STOMP handshake, subscribes the user's inbox, keeps heart-beats going and
/// reconnects after drops with a fixed delay and a bounded attempt count.
use crate::config::Config;
use crate::error::{ChatError, Result};
use crate::message::{Message, Origin};
use crate::transport::envelope::{normalize_str, OutgoingEnvelope};
use crate::transport::stomp::{Command, Frame, FrameDecoder, Heartbeat};
use crate::transport::{Connector, Link};
use crate::utils::event_emitter::{EventEmitter, Subscription};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::future::pending;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, sleep, sleep_until, timeout, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Subscription id used for the private inbox
pub const INBOX_SUBSCRIPTION_ID: &str = "sub-0";

/// Connection state of the session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ConnectionState {
    /// No link; also the state between reconnect attempts
    Disconnected,
    /// Socket opening or STOMP handshake in progress
    Connecting,
    /// CONNECTED received and inbox subscribed
    Connected,
    /// Gave up; only an explicit `connect` leaves this state
    Errored(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

struct Credentials {
    username: String,
    token: String,
}

struct Session {
    username: String,
    shutdown: watch::Sender<bool>,
}

struct Inner {
    config: Config,
    connector: Arc<dyn Connector>,
    state: watch::Sender<ConnectionState>,
    /// Bumped on every connect/disconnect; tasks of older sessions go quiet
    generation: AtomicU64,
    session: Mutex<Option<Session>>,
    outbound: Mutex<Option<(u64, mpsc::UnboundedSender<String>)>>,
    last_error: Mutex<Option<ChatError>>,
    messages: EventEmitter<Message>,
    states: EventEmitter<ConnectionState>,
    errors: EventEmitter<ChatError>,
}

impl Inner {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Move to `next` on behalf of session `generation`. Stale sessions are
    /// ignored. Observers only hear about actual changes.
    fn transition(&self, generation: u64, next: ConnectionState) -> bool {
        if !self.is_current(generation) {
            return false;
        }
        self.force_state(next)
    }

    fn force_state(&self, next: ConnectionState) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next.clone();
                true
            }
        });
        if changed {
            info!("Connection state -> {:?}", next);
            self.states.emit(&next);
        }
        changed
    }

    fn report(&self, generation: u64, err: ChatError) {
        if !self.is_current(generation) {
            return;
        }
        *self.last_error.lock() = Some(err.clone());
        self.errors.emit(&err);
    }

    fn clear_outbound(&self, generation: u64) {
        let mut outbound = self.outbound.lock();
        if matches!(outbound.as_ref(), Some((g, _)) if *g == generation) {
            *outbound = None;
        }
    }
}

/// Owner of the single broker connection of a session
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Create a manager; nothing connects until `connect`
    pub fn new(config: Config, connector: Arc<dyn Connector>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                state,
                generation: AtomicU64::new(0),
                session: Mutex::new(None),
                outbound: Mutex::new(None),
                last_error: Mutex::new(None),
                messages: EventEmitter::new("message-received"),
                states: EventEmitter::new("connection-state-changed"),
                errors: EventEmitter::new("error"),
            }),
        }
    }

    /// Connect and authenticate as `username`.
    ///
    /// Calling this while a connection is being established or is already up
    /// does not start a second one; it resolves with the outcome of the
    /// attempt in progress.
    pub async fn connect(&self, username: &str, token: Option<&str>) -> Result<()> {
        let token = match token.map(str::trim).filter(|t| !t.is_empty()) {
            Some(t) => t.to_string(),
            None => {
                let err = ChatError::AuthRequired;
                error!("{}", err);
                self.inner.errors.emit(&err);
                return Err(err);
            }
        };
        let username = username.trim();
        if username.is_empty() {
            let err = ChatError::InvalidTarget("Username is required".to_string());
            error!("{}", err);
            self.inner.errors.emit(&err);
            return Err(err);
        }

        let inner = &self.inner;
        let mut generation = 0;
        let started = inner.state.send_if_modified(|state| match state {
            ConnectionState::Connecting | ConnectionState::Connected => false,
            _ => {
                generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
                *state = ConnectionState::Connecting;
                true
            }
        });

        if !started {
            warn!("Already connected or connecting; waiting on the current attempt");
            return self.wait_settled().await;
        }

        info!("Connecting to {} as {}", inner.config.broker_url, username);
        *inner.last_error.lock() = None;
        inner.states.emit(&ConnectionState::Connecting);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let previous = inner.session.lock().replace(Session {
            username: username.to_string(),
            shutdown: shutdown_tx,
        });
        if let Some(previous) = previous {
            let _ = previous.shutdown.send(true);
        }

        let credentials = Credentials {
            username: username.to_string(),
            token,
        };
        tokio::spawn(run_session(inner.clone(), generation, credentials, shutdown_rx));

        self.wait_settled().await
    }

    /// Wait until the state leaves `Connecting`
    async fn wait_settled(&self) -> Result<()> {
        let mut rx = self.inner.state.subscribe();
        let settled = rx
            .wait_for(|s| !matches!(s, ConnectionState::Connecting))
            .await
            .map_err(|_| ChatError::Transport("Connection manager shut down".to_string()))?
            .clone();

        match settled {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Errored(reason) => Err(self
                .inner
                .last_error
                .lock()
                .clone()
                .unwrap_or(ChatError::Transport(reason))),
            _ => Err(self
                .inner
                .last_error
                .lock()
                .clone()
                .unwrap_or_else(|| ChatError::Transport("Disconnected before the broker answered".to_string()))),
        }
    }

    /// Tear the connection down and cancel any pending reconnect
    pub fn disconnect(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(session) = self.inner.session.lock().take() {
            info!("Disconnecting {}", session.username);
            let _ = session.shutdown.send(true);
        }
        *self.inner.outbound.lock() = None;
        self.inner.force_state(ConnectionState::Disconnected);
    }

    /// Publish a private message. Fire-and-forget: no delivery receipt is
    /// awaited, and a transmit failure after the state check is only logged.
    pub async fn send(&self, receiver: &str, body: &str) -> Result<OutgoingEnvelope> {
        self.send_with_extras(receiver, body, Map::new()).await
    }

    /// Like [`send`](Self::send), merging `extras` into the JSON envelope
    pub async fn send_with_extras(
        &self,
        receiver: &str,
        body: &str,
        extras: Map<String, Value>,
    ) -> Result<OutgoingEnvelope> {
        if !self.status().is_connected() {
            return Err(ChatError::NotConnected);
        }
        if receiver.trim().is_empty() {
            return Err(ChatError::InvalidMessage("Receiver username is required".to_string()));
        }
        if body.trim().is_empty() {
            return Err(ChatError::InvalidMessage("Message content is required".to_string()));
        }

        let envelope = OutgoingEnvelope::new(receiver, body, Utc::now(), extras);
        let frame = Frame::send_json(&self.inner.config.send_destination, envelope.to_json()?);

        let outbound = self.inner.outbound.lock().as_ref().map(|(_, tx)| tx.clone());
        match outbound {
            Some(tx) if tx.send(frame.encode()).is_ok() => {
                info!(
                    "Sent private message to {} ({} chars)",
                    envelope.receiver_username,
                    envelope.content.chars().count()
                );
            }
            _ => {
                warn!(
                    "Transmit to {} failed: link closed after state check",
                    envelope.receiver_username
                );
            }
        }

        Ok(envelope)
    }

    /// Current connection state
    pub fn status(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    /// Username of the active session, if any
    pub fn current_user(&self) -> Option<String> {
        self.inner.session.lock().as_ref().map(|s| s.username.clone())
    }

    pub fn on_message<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.inner.messages.subscribe(listener)
    }

    pub fn on_state_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        self.inner.states.subscribe(listener)
    }

    pub fn on_error<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ChatError) + Send + Sync + 'static,
    {
        self.inner.errors.subscribe(listener)
    }

    pub fn messages(&self) -> &EventEmitter<Message> {
        &self.inner.messages
    }

    pub fn states(&self) -> &EventEmitter<ConnectionState> {
        &self.inner.states
    }

    pub fn errors(&self) -> &EventEmitter<ChatError> {
        &self.inner.errors
    }
}

/// A link that finished the handshake and holds the inbox subscription
struct LiveLink {
    link: Link,
    decoder: FrameDecoder,
    heartbeat: Heartbeat,
    /// Frames that arrived in the same chunk as CONNECTED
    backlog: Vec<Frame>,
}

enum PumpEnd {
    Shutdown,
    Dropped(String),
}

/// Session task: connect, pump, reconnect until told to stop or out of attempts
async fn run_session(
    inner: Arc<Inner>,
    generation: u64,
    credentials: Credentials,
    mut shutdown: watch::Receiver<bool>,
) {
    let max_attempts = inner.config.max_reconnect_attempts;
    let mut attempts: u32 = 0;
    let mut first = true;

    loop {
        let outcome = tokio::select! {
            outcome = establish(&inner, &credentials) => outcome,
            _ = shutdown.changed() => return,
        };

        match outcome {
            Ok(live) => {
                if !inner.is_current(generation) {
                    let _ = live.link.outbound.send(Frame::disconnect().encode());
                    return;
                }
                attempts = 0;
                first = false;
                *inner.outbound.lock() = Some((generation, live.link.outbound.clone()));
                inner.transition(generation, ConnectionState::Connected);
                info!(
                    "Connected as {}; subscribed to {}",
                    credentials.username, inner.config.inbox_destination
                );

                let ended = pump(&inner, generation, live, &mut shutdown).await;
                inner.clear_outbound(generation);
                match ended {
                    PumpEnd::Shutdown => return,
                    PumpEnd::Dropped(reason) => {
                        warn!("Connection dropped: {}", reason);
                        inner.report(generation, ChatError::Transport(reason));
                        inner.transition(generation, ConnectionState::Disconnected);
                    }
                }
            }
            Err(e) => {
                error!("Connection attempt failed: {}", e);
                inner.report(generation, e.clone());
                if first || e.is_terminal() {
                    inner.transition(generation, ConnectionState::Errored(e.to_string()));
                    return;
                }
                inner.transition(generation, ConnectionState::Disconnected);
            }
        }

        if !inner.is_current(generation) {
            return;
        }
        if attempts >= max_attempts {
            let err = ChatError::Transport(format!(
                "Reconnect attempts exhausted after {} tries",
                max_attempts
            ));
            error!("{}", err);
            inner.report(generation, err.clone());
            inner.transition(generation, ConnectionState::Errored(err.to_string()));
            return;
        }
        attempts += 1;
        info!(
            "Attempting to reconnect in {:?} ({}/{})",
            inner.config.reconnect_delay, attempts, max_attempts
        );

        tokio::select! {
            _ = sleep(inner.config.reconnect_delay) => {}
            _ = shutdown.changed() => return,
        }
        if !inner.transition(generation, ConnectionState::Connecting) {
            return;
        }
    }
}

/// Open a link, authenticate, and subscribe the inbox
async fn establish(inner: &Inner, credentials: &Credentials) -> Result<LiveLink> {
    let config = &inner.config;
    let mut link = inner.connector.open(&config.broker_url).await?;

    let connect = Frame::connect(
        &broker_host(&config.broker_url),
        &credentials.token,
        config.heartbeat_outgoing,
        config.heartbeat_incoming,
    );
    link.outbound
        .send(connect.encode())
        .map_err(|_| ChatError::Transport("Link closed before CONNECT".to_string()))?;

    let mut decoder = FrameDecoder::new();
    let (connected, backlog) = timeout(
        config.connect_timeout,
        await_connected(&mut link, &mut decoder),
    )
    .await
    .map_err(|_| ChatError::Timeout(format!("No CONNECTED frame within {:?}", config.connect_timeout)))??;

    let heartbeat = Heartbeat::negotiate(
        config.heartbeat_outgoing,
        config.heartbeat_incoming,
        connected.get("heart-beat"),
    );
    debug!(
        "Broker accepted CONNECT (version {:?}, heart-beat {:?})",
        connected.get("version"),
        heartbeat
    );

    let subscribe = Frame::subscribe(INBOX_SUBSCRIPTION_ID, &config.inbox_destination);
    link.outbound
        .send(subscribe.encode())
        .map_err(|_| ChatError::Transport("Link closed before SUBSCRIBE".to_string()))?;

    Ok(LiveLink {
        link,
        decoder,
        heartbeat,
        backlog,
    })
}

/// Read until CONNECTED. Frames after it in the same chunk are returned too.
async fn await_connected(link: &mut Link, decoder: &mut FrameDecoder) -> Result<(Frame, Vec<Frame>)> {
    loop {
        let chunk = link
            .inbound
            .recv()
            .await
            .ok_or_else(|| ChatError::Transport("Link closed during handshake".to_string()))?;
        let mut frames = decoder.push(&chunk)?.into_iter();
        while let Some(frame) = frames.next() {
            match frame.command {
                Command::Connected => return Ok((frame, frames.collect())),
                Command::Error => return Err(ChatError::Broker(error_reason(&frame))),
                other => debug!("Ignoring {} before CONNECTED", other),
            }
        }
    }
}

fn error_reason(frame: &Frame) -> String {
    frame
        .get("message")
        .map(str::to_string)
        .unwrap_or_else(|| frame.body.clone())
}

/// Deliver frames until the link drops or shutdown is requested
async fn pump(
    inner: &Inner,
    generation: u64,
    live: LiveLink,
    shutdown: &mut watch::Receiver<bool>,
) -> PumpEnd {
    let LiveLink {
        mut link,
        mut decoder,
        heartbeat,
        backlog,
    } = live;

    for frame in backlog {
        if let Some(end) = handle_frame(inner, generation, frame) {
            return end;
        }
    }

    let mut beat: Option<Interval> = heartbeat.outgoing.map(|every| {
        let mut i = interval_at(Instant::now() + every, every);
        i.set_missed_tick_behavior(MissedTickBehavior::Skip);
        i
    });
    // Allow twice the agreed interval before calling the broker dead
    let silence_limit = heartbeat.incoming.map(|every| every * 2);
    let mut last_seen = Instant::now();

    loop {
        let silence_deadline = silence_limit.map(|limit| last_seen + limit);
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = link.outbound.send(Frame::disconnect().encode());
                return PumpEnd::Shutdown;
            }
            chunk = link.inbound.recv() => {
                let Some(chunk) = chunk else {
                    return PumpEnd::Dropped("Connection closed by broker".to_string());
                };
                last_seen = Instant::now();
                match decoder.push(&chunk) {
                    Ok(frames) => {
                        for frame in frames {
                            if let Some(end) = handle_frame(inner, generation, frame) {
                                return end;
                            }
                        }
                    }
                    Err(e) => warn!("Discarding malformed frame data: {}", e),
                }
            }
            _ = next_beat(&mut beat) => {
                if link.outbound.send("\n".to_string()).is_err() {
                    return PumpEnd::Dropped("Link closed while sending heart-beat".to_string());
                }
            }
            _ = until(silence_deadline) => {
                return PumpEnd::Dropped("Heart-beat timeout".to_string());
            }
        }
    }
}

fn handle_frame(inner: &Inner, generation: u64, frame: Frame) -> Option<PumpEnd> {
    match frame.command {
        Command::Message => {
            if let Some(sub) = frame.get("subscription") {
                if sub != INBOX_SUBSCRIPTION_ID {
                    debug!("Ignoring MESSAGE for unknown subscription {}", sub);
                    return None;
                }
            }
            match normalize_str(&frame.body, Origin::Pushed, Utc::now()) {
                Ok(message) => {
                    debug!("Received message {} -> {}", message.sender, message.receiver);
                    if inner.is_current(generation) {
                        inner.messages.emit(&message);
                    }
                }
                Err(e) => error!("Error parsing incoming message: {}", e),
            }
            None
        }
        Command::Error => {
            let reason = error_reason(&frame);
            error!("Broker error: {}", reason);
            inner.report(generation, ChatError::Broker(reason.clone()));
            Some(PumpEnd::Dropped(format!("Broker error: {}", reason)))
        }
        Command::Receipt => {
            debug!("Receipt {:?}", frame.get("receipt-id"));
            None
        }
        other => {
            debug!("Ignoring unexpected {} frame", other);
            None
        }
    }
}

async fn next_beat(beat: &mut Option<Interval>) {
    match beat {
        Some(i) => {
            i.tick().await;
        }
        None => pending::<()>().await,
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => sleep_until(d).await,
        None => pending::<()>().await,
    }
}

/// Host part of the broker URL, used for the STOMP `host` header
fn broker_host(url: &str) -> String {
    let without_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let authority = without_scheme.split('/').next().unwrap_or(without_scheme);
    let host = match authority.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => authority,
    };
    host.to_string()
}
