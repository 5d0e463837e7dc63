/// Bridge REST API + SSE: localhost HTTP server for browser UI glue
///
/// Default address: 127.0.0.1:17082 (see `Config::bridge_addr`)
///
/// Endpoints:
///   GET  /api/status
///   GET  /api/conversations/:peer
///   GET  /api/last-messages            ?peers=a,b
///   POST /api/send                     body: {"to":"<username>","message":"..."}
///   POST /api/history/:peer            fetch history from the REST service
///   GET  /api/friends
///   GET  /api/users/search             ?q=keyword
///   POST /api/friends                  body: {"friend_id":N}
///   GET  /events                       SSE stream of MessengerEvent JSON
use crate::directory::ChatApiClient;
use crate::error::{ChatError, Result};
use crate::message::{Friend, Message};
use crate::messenger::Messenger;
use crate::messenger_types::{MessengerEvent, StatusSummary};
use crate::utils::event_emitter::Subscription;
use futures_util::stream::{unfold, StreamExt};
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, OnceCell};
use tracing::{debug, error, info, warn};

// ─── Type alias ──────────────────────────────────────────────────────────────

type BoxBody = http_body_util::combinators::BoxBody<bytes::Bytes, Infallible>;
type Resp = Response<BoxBody>;

const EVENT_BUFFER: usize = 256;

// ─── State ───────────────────────────────────────────────────────────────────

/// Everything the bridge handlers need: the session facade, the REST
/// directory, and the SSE fan-out fed from the facade's event streams.
pub struct Bridge {
    messenger: Messenger,
    directory: ChatApiClient,
    events: broadcast::Sender<MessengerEvent>,
    me: OnceCell<Friend>,
    _subscriptions: Vec<Subscription>,
}

impl Bridge {
    pub fn new(messenger: Messenger, directory: ChatApiClient) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        let tx = events.clone();
        let on_message = messenger.on_message(move |message: &Message| {
            let _ = tx.send(MessengerEvent::NewMessage {
                message: message.clone(),
            });
        });
        let tx = events.clone();
        let on_state = messenger.on_state_change(move |state| {
            let _ = tx.send(MessengerEvent::ConnectionState { state: state.clone() });
        });
        let tx = events.clone();
        let on_error = messenger.on_error(move |err: &ChatError| {
            let _ = tx.send(MessengerEvent::Error {
                message: err.to_string(),
            });
        });

        Self {
            messenger,
            directory,
            events,
            me: OnceCell::new(),
            _subscriptions: vec![on_message, on_state, on_error],
        }
    }

    pub fn messenger(&self) -> &Messenger {
        &self.messenger
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<MessengerEvent> {
        self.events.subscribe()
    }

    /// The directory record of the logged-in user, fetched once
    async fn me(&self) -> Result<&Friend> {
        self.me.get_or_try_init(|| self.directory.login_user()).await
    }

    /// Directory record of a friend by username
    async fn friend_by_username(&self, username: &str) -> Result<Friend> {
        let me = self.me().await?;
        self.directory
            .list_friends(me.id)
            .await?
            .into_iter()
            .find(|f| f.username == username)
            .ok_or_else(|| ChatError::InvalidTarget(format!("{} is not in the friend list", username)))
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn cors_headers(builder: hyper::http::response::Builder) -> hyper::http::response::Builder {
    builder
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
        .header("Access-Control-Allow-Headers", "Content-Type")
}

fn json_resp(status: StatusCode, body: Vec<u8>) -> Resp {
    cors_headers(Response::builder())
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(bytes::Bytes::from(body)).boxed())
        .unwrap_or_else(|_| Response::new(Full::new(bytes::Bytes::new()).boxed()))
}

fn json_ok(value: serde_json::Value) -> Resp {
    json_resp(StatusCode::OK, serde_json::to_vec(&value).unwrap_or_default())
}

fn json_err(status: StatusCode, msg: &str) -> Resp {
    json_resp(
        status,
        serde_json::to_vec(&serde_json::json!({ "error": msg })).unwrap_or_default(),
    )
}

fn status_for(err: &ChatError) -> StatusCode {
    match err {
        ChatError::AuthRequired => StatusCode::UNAUTHORIZED,
        ChatError::InvalidTarget(_) | ChatError::InvalidMessage(_) => StatusCode::BAD_REQUEST,
        ChatError::NotConnected => StatusCode::SERVICE_UNAVAILABLE,
        ChatError::Http { .. } | ChatError::HistoryFetch { .. } | ChatError::Transport(_) => {
            StatusCode::BAD_GATEWAY
        }
        ChatError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_resp(err: &ChatError) -> Resp {
    json_err(status_for(err), &err.to_string())
}

fn sse_resp(rx: broadcast::Receiver<MessengerEvent>) -> Resp {
    // Keepalive comment sent immediately so the client knows the connection is live
    let initial = bytes::Bytes::from(": connected\n\n");
    let first = futures_util::stream::once(async move {
        Ok::<Frame<bytes::Bytes>, Infallible>(Frame::data(initial))
    });

    let events = unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let json = serde_json::to_string(&event).unwrap_or_default();
                    let data = format!("data: {}\n\n", json);
                    let frame = Frame::data(bytes::Bytes::from(data));
                    return Some((Ok::<_, Infallible>(frame), rx));
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("SSE client lagged {} events", n);
                    continue;
                }
                Err(_) => return None,
            }
        }
    });

    let stream = first.chain(events);
    cors_headers(Response::builder())
        .status(StatusCode::OK)
        .header("Content-Type", "text/event-stream; charset=utf-8")
        .header("Cache-Control", "no-cache")
        .header("X-Accel-Buffering", "no")
        .body(BodyExt::boxed(StreamBody::new(stream)))
        .unwrap_or_else(|_| Response::new(Full::new(bytes::Bytes::new()).boxed()))
}

// ─── Entry point ─────────────────────────────────────────────────────────────

/// Bind `addr` and serve until the task is dropped
pub async fn start_bridge_api(bridge: Arc<Bridge>, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Bridge API started on http://{}", addr);
    serve(listener, bridge).await
}

/// Accept loop on an already bound listener
pub async fn serve(listener: TcpListener, bridge: Arc<Bridge>) -> Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("Bridge connection from {}", peer);
                let io = TokioIo::new(stream);
                let bridge = bridge.clone();
                tokio::spawn(async move {
                    let svc = service_fn(move |req| {
                        let bridge = bridge.clone();
                        async move { Ok::<_, Infallible>(handle(req, bridge).await) }
                    });
                    if let Err(e) = http1::Builder::new().serve_connection(io, svc).await {
                        // Client disconnects are normal for SSE
                        if !e.is_incomplete_message() {
                            error!("Bridge API connection error: {:?}", e);
                        }
                    }
                });
            }
            Err(e) => error!("Bridge API accept error: {}", e),
        }
    }
}

// ─── Router ──────────────────────────────────────────────────────────────────

async fn handle(req: Request<hyper::body::Incoming>, bridge: Arc<Bridge>) -> Resp {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();

    if method == Method::OPTIONS {
        return cors_headers(Response::builder())
            .status(StatusCode::NO_CONTENT)
            .body(Full::new(bytes::Bytes::new()).boxed())
            .unwrap_or_else(|_| Response::new(Full::new(bytes::Bytes::new()).boxed()));
    }

    match (method.clone(), path.as_str()) {
        (Method::GET, "/api/status") => get_status(&bridge),
        (Method::GET, "/api/last-messages") => get_last_messages(&query, &bridge),
        (Method::POST, "/api/send") => post_send(req, &bridge).await,
        (Method::GET, "/api/friends") => get_friends(&bridge).await,
        (Method::POST, "/api/friends") => post_add_friend(req, &bridge).await,
        (Method::GET, "/api/users/search") => get_user_search(&query, &bridge).await,
        (Method::GET, "/events") => sse_resp(bridge.subscribe_events()),
        _ => {
            if method == Method::GET && path.starts_with("/api/conversations/") {
                let peer = path_segment(&path, "/api/conversations/");
                return get_conversation(&peer, &bridge);
            }
            if method == Method::POST && path.starts_with("/api/history/") {
                let peer = path_segment(&path, "/api/history/");
                return post_history(&peer, &bridge).await;
            }
            json_err(StatusCode::NOT_FOUND, "not found")
        }
    }
}

// ─── Handlers ────────────────────────────────────────────────────────────────

fn get_status(bridge: &Bridge) -> Resp {
    let messenger = bridge.messenger();
    let summary = StatusSummary {
        session_id: messenger.session_id().to_string(),
        username: messenger.local_user().to_string(),
        connection: messenger.connection_status(),
        message_count: messenger.message_count(),
    };
    json_ok(serde_json::to_value(summary).unwrap_or_default())
}

fn get_conversation(peer: &str, bridge: &Bridge) -> Resp {
    if peer.is_empty() {
        return json_err(StatusCode::BAD_REQUEST, "peer is required");
    }
    let messages = bridge.messenger().conversation_with(peer);
    json_ok(serde_json::json!({ "peer": peer, "messages": messages }))
}

fn get_last_messages(query: &str, bridge: &Bridge) -> Resp {
    let peers: Vec<String> = query_param(query, "peers")
        .map(|list| {
            list.split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let last = bridge.messenger().last_messages(&peers);
    json_ok(serde_json::json!({ "last_messages": last }))
}

#[derive(Deserialize)]
struct SendRequest {
    to: String,
    message: String,
}

async fn post_send(req: Request<hyper::body::Incoming>, bridge: &Bridge) -> Resp {
    let body = match read_body(req).await {
        Ok(b) => b,
        Err(e) => return json_err(StatusCode::BAD_REQUEST, &format!("body read error: {}", e)),
    };
    let req: SendRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => return json_err(StatusCode::BAD_REQUEST, &format!("invalid JSON: {}", e)),
    };

    let messenger = bridge.messenger();
    match messenger.send_message(&req.to, &req.message).await {
        Ok(message) => json_ok(serde_json::json!({ "message": message })),
        Err(ChatError::NotConnected) => {
            // The optimistic copy is already in the store; hand it back so the UI can show it
            let local = messenger.local_user();
            let body = req.message.trim();
            let optimistic = messenger
                .conversation_with(&req.to)
                .into_iter()
                .rev()
                .find(|m| m.sender == local && m.body == body);
            json_resp(
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::to_vec(&serde_json::json!({
                    "error": ChatError::NotConnected.to_string(),
                    "message": optimistic,
                }))
                .unwrap_or_default(),
            )
        }
        Err(e) => error_resp(&e),
    }
}

async fn post_history(peer: &str, bridge: &Bridge) -> Resp {
    if peer.is_empty() {
        return json_err(StatusCode::BAD_REQUEST, "peer is required");
    }
    let (me, friend) = match bridge.me().await {
        Ok(me) => match bridge.friend_by_username(peer).await {
            Ok(friend) => (me.id, friend.id),
            Err(ChatError::InvalidTarget(msg)) => return json_err(StatusCode::NOT_FOUND, &msg),
            Err(e) => return error_resp(&e),
        },
        Err(e) => return error_resp(&e),
    };

    let directory = bridge.directory.clone();
    let loaded = bridge
        .messenger()
        .load_history(peer, |_, _| async move { directory.fetch_history(me, friend).await })
        .await;
    match loaded {
        Ok(load) => json_ok(serde_json::json!({ "peer": load.peer, "stored": load.stored })),
        Err(e) => error_resp(&e),
    }
}

async fn get_friends(bridge: &Bridge) -> Resp {
    let me = match bridge.me().await {
        Ok(me) => me,
        Err(e) => return error_resp(&e),
    };
    match bridge.directory.list_friends(me.id).await {
        Ok(friends) => json_ok(serde_json::json!({ "friends": friends })),
        Err(e) => error_resp(&e),
    }
}

async fn get_user_search(query: &str, bridge: &Bridge) -> Resp {
    let keyword = query_param(query, "q").unwrap_or_default();
    match bridge.directory.search_users(&keyword).await {
        Ok(users) => json_ok(serde_json::json!({ "users": users })),
        Err(e) => error_resp(&e),
    }
}

#[derive(Deserialize)]
struct AddFriendRequest {
    friend_id: i64,
}

async fn post_add_friend(req: Request<hyper::body::Incoming>, bridge: &Bridge) -> Resp {
    let body = match read_body(req).await {
        Ok(b) => b,
        Err(e) => return json_err(StatusCode::BAD_REQUEST, &format!("body read error: {}", e)),
    };
    let r: AddFriendRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => return json_err(StatusCode::BAD_REQUEST, &format!("invalid JSON: {}", e)),
    };
    let me = match bridge.me().await {
        Ok(me) => me,
        Err(e) => return error_resp(&e),
    };
    match bridge.directory.add_friend(me.id, r.friend_id).await {
        Ok(result) => json_ok(serde_json::json!({ "friendship": result })),
        Err(e) => error_resp(&e),
    }
}

// ─── Utilities ────────────────────────────────────────────────────────────────

async fn read_body(req: Request<hyper::body::Incoming>) -> std::result::Result<bytes::Bytes, String> {
    req.collect()
        .await
        .map(|c| c.to_bytes())
        .map_err(|e| e.to_string())
}

fn path_segment(path: &str, prefix: &str) -> String {
    let raw = path.trim_start_matches(prefix).trim_end_matches('/');
    urlencoding::decode(raw)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}

fn query_param(query: &str, key: &str) -> Option<String> {
    for pair in query.split('&') {
        if let Some((k, v)) = pair.split_once('=') {
            if k == key {
                let v = v.replace('+', " ");
                return urlencoding::decode(&v).ok().map(|s| s.into_owned());
            }
        }
    }
    None
}
