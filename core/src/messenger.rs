/// Messaging facade: the single entry point UI glue talks to
///
/// Wires the connection manager to the message store, then answers
/// conversation queries through the projector.
use crate::config::Config;
use crate::connection::{ConnectionManager, ConnectionState};
use crate::error::{ChatError, Result};
use crate::message::{Message, Origin};
use crate::message_store::MessageStore;
use crate::projector::{conversation_between, last_message_per_peer, LastMessage};
use crate::transport::Connector;
use crate::utils::event_emitter::Subscription;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Outcome of loading one peer's history
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryLoad {
    pub peer: String,
    /// Messages actually added to the store
    pub stored: usize,
}

/// Session handle returned by [`Messenger::initialize`]
#[derive(Clone)]
pub struct Messenger {
    session_id: String,
    local_user: String,
    connection: ConnectionManager,
    store: Arc<RwLock<MessageStore>>,
    forwarder: Arc<Mutex<Option<Subscription>>>,
    closed: Arc<AtomicBool>,
}

impl Messenger {
    /// Start a session for `local_user`.
    ///
    /// Missing credentials fail right away. A failed first connection does
    /// not: the handle is returned and the failure shows up in
    /// `connection_status()` and on the error stream.
    pub async fn initialize(
        config: Config,
        connector: Arc<dyn Connector>,
        local_user: &str,
        token: Option<&str>,
    ) -> Result<Self> {
        let local_user = local_user.trim();
        if token.map(str::trim).unwrap_or_default().is_empty() {
            error!("Cannot start a session without a bearer token");
            return Err(ChatError::AuthRequired);
        }
        if local_user.is_empty() {
            return Err(ChatError::InvalidTarget("Username is required".to_string()));
        }

        let store = Arc::new(RwLock::new(MessageStore::with_window(config.dedup_window)));
        let connection = ConnectionManager::new(config, connector);

        let sink = store.clone();
        let forwarder = connection.on_message(move |message: &Message| {
            sink.write().append(message.clone());
        });

        let messenger = Self {
            session_id: Uuid::new_v4().to_string(),
            local_user: local_user.to_string(),
            connection,
            store,
            forwarder: Arc::new(Mutex::new(Some(forwarder))),
            closed: Arc::new(AtomicBool::new(false)),
        };

        info!(
            "Initializing messaging session {} for {}",
            messenger.session_id, messenger.local_user
        );
        match messenger.connection.connect(&messenger.local_user, token).await {
            Ok(()) => {}
            Err(e @ (ChatError::AuthRequired | ChatError::InvalidTarget(_))) => return Err(e),
            Err(e) => warn!("Session started without a live connection: {}", e),
        }

        Ok(messenger)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn local_user(&self) -> &str {
        &self.local_user
    }

    /// Store the message optimistically, then hand it to the connection.
    ///
    /// The optimistic entry stays in the store even when sending fails; the
    /// error is returned and also emitted on the error stream. After
    /// [`shutdown`](Self::shutdown) nothing is stored and `NotConnected` is returned.
    pub async fn send_message(&self, peer: &str, body: &str) -> Result<Message> {
        if self.is_shut_down() {
            return Err(ChatError::NotConnected);
        }
        let peer = peer.trim();
        if peer.is_empty() {
            return Err(ChatError::InvalidMessage("Receiver username is required".to_string()));
        }
        if body.trim().is_empty() {
            return Err(ChatError::InvalidMessage("Message content is required".to_string()));
        }

        let message = Message::new(
            self.local_user.as_str(),
            peer,
            body.trim(),
            Utc::now(),
            Origin::Optimistic,
        );
        self.store.write().append(message.clone());

        match self.connection.send(peer, body).await {
            Ok(_) => Ok(message),
            Err(e) => {
                warn!("Send to {} failed after optimistic insert: {}", peer, e);
                self.connection.errors().emit(&e);
                Err(e)
            }
        }
    }

    /// Fetch history for `peer` and merge it into the store.
    ///
    /// `fetch` receives `(local_user, peer)`. Repeated calls never duplicate
    /// entries.
    pub async fn load_history<F, Fut>(&self, peer: &str, fetch: F) -> Result<HistoryLoad>
    where
        F: FnOnce(String, String) -> Fut,
        Fut: Future<Output = Result<Vec<Message>>>,
    {
        let peer = peer.trim();
        if peer.is_empty() {
            return Err(ChatError::InvalidTarget("Peer username is required".to_string()));
        }

        let messages = fetch(self.local_user.clone(), peer.to_string())
            .await
            .map_err(|e| match e {
                e @ ChatError::HistoryFetch { .. } => e,
                other => ChatError::HistoryFetch {
                    peer: peer.to_string(),
                    reason: other.to_string(),
                },
            })?;

        let fetched = messages.len();
        let stored = self.store.write().append_batch(messages);
        info!("Loaded history with {}: {} fetched, {} new", peer, fetched, stored);
        Ok(HistoryLoad {
            peer: peer.to_string(),
            stored,
        })
    }

    /// Load several peers one after another. A failure for one peer does
    /// not stop the others.
    pub async fn load_histories<F, Fut>(&self, peers: &[String], fetch: F) -> Vec<Result<HistoryLoad>>
    where
        F: Fn(String, String) -> Fut,
        Fut: Future<Output = Result<Vec<Message>>>,
    {
        let mut results = Vec::with_capacity(peers.len());
        for peer in peers {
            let result = self.load_history(peer, &fetch).await;
            if let Err(e) = &result {
                warn!("History load failed: {}", e);
            }
            results.push(result);
        }
        results
    }

    /// Conversation with `peer`, oldest first
    pub fn conversation_with(&self, peer: &str) -> Vec<Message> {
        conversation_between(self.store.read().all(), &self.local_user, peer.trim())
    }

    /// Newest message per peer, in the order of `peers`
    pub fn last_messages<S: AsRef<str>>(&self, peers: &[S]) -> Vec<LastMessage> {
        last_message_per_peer(self.store.read().all(), &self.local_user, peers)
    }

    pub fn connection_status(&self) -> ConnectionState {
        self.connection.status()
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn message_count(&self) -> usize {
        self.store.read().len()
    }

    pub fn on_message<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.connection.on_message(listener)
    }

    pub fn on_state_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        self.connection.on_state_change(listener)
    }

    pub fn on_error<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ChatError) + Send + Sync + 'static,
    {
        self.connection.on_error(listener)
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// End the session: disconnect, detach every listener, drop all messages.
    /// Later calls are no-ops.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down messaging session for {}", self.local_user);
        if let Some(forwarder) = self.forwarder.lock().take() {
            forwarder.unsubscribe();
        }
        // Listeners still hear the final Disconnected
        self.connection.disconnect();
        self.connection.messages().clear();
        self.connection.states().clear();
        self.connection.errors().clear();
        self.store.write().clear();
    }
}
