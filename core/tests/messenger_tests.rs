/// Facade behaviour: optimistic sends, echo de-duplication, history merging
mod common;

use chatlink_core::connection::ConnectionState;
use chatlink_core::error::ChatError;
use chatlink_core::message::{Message, Origin};
use chatlink_core::messenger::Messenger;
use chatlink_core::transport::Command;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use common::{test_config, BrokerLink, MockBroker, WAIT};
use serde_json::json;
use tokio::time::timeout;

async fn connected_messenger() -> (Messenger, MockBroker, BrokerLink) {
    let (mut broker, connector) = MockBroker::new();
    let pending = tokio::spawn(async move {
        Messenger::initialize(test_config(), connector, "alice", Some("tok")).await
    });
    let mut link = broker.next_link().await;
    link.accept().await;
    let messenger = pending.await.unwrap().unwrap();
    assert!(messenger.connection_status().is_connected());
    (messenger, broker, link)
}

fn history_row(from: &str, to: &str, body: &str, ms: i64) -> Message {
    let at = Utc.timestamp_millis_opt(ms).single().unwrap();
    Message::new(from, to, body, at, Origin::Historical)
}

#[tokio::test]
async fn test_initialize_requires_token_and_user() {
    let (_broker, connector) = MockBroker::new();
    let err = Messenger::initialize(test_config(), connector.clone(), "alice", None)
        .await
        .err()
        .unwrap();
    assert_eq!(err, ChatError::AuthRequired);

    let err = Messenger::initialize(test_config(), connector, "", Some("tok"))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, ChatError::InvalidTarget(_)));
}

#[tokio::test]
async fn test_initialize_tolerates_unreachable_broker() {
    let (broker, connector) = MockBroker::new();
    broker.refuse_connections(true);
    let messenger = Messenger::initialize(test_config(), connector, "alice", Some("tok"))
        .await
        .unwrap();
    assert!(matches!(messenger.connection_status(), ConnectionState::Errored(_)));
}

#[tokio::test]
async fn test_echo_of_optimistic_send_is_collapsed() {
    let (messenger, _broker, mut link) = connected_messenger().await;
    let mut pushed = messenger.connection().messages().listen();

    let sent = messenger.send_message("bob", "hello bob").await.unwrap();
    assert_eq!(sent.origin, Origin::Optimistic);
    assert_eq!(messenger.message_count(), 1);

    let frame = link.next_frame().await;
    assert_eq!(frame.command, Command::Send);
    let body: serde_json::Value = serde_json::from_str(&frame.body).unwrap();

    let receiver = body["receiverUsername"].as_str().unwrap().to_string();
    let content = body["content"].as_str().unwrap().to_string();

    // The server echoes our own message back with its own timestamp
    link.push(&json!({
        "senderUsername": "alice",
        "receiverUsername": receiver,
        "content": content,
        "timestamp": (sent.sent_at + ChronoDuration::milliseconds(300)).to_rfc3339(),
    }));
    timeout(WAIT, pushed.recv()).await.unwrap().unwrap();

    let conversation = messenger.conversation_with("bob");
    assert_eq!(conversation.len(), 1);
    assert_eq!(conversation[0].body, "hello bob");
    assert_eq!(conversation[0].origin, Origin::Optimistic);
}

#[tokio::test]
async fn test_pushed_messages_reach_the_store() {
    let (messenger, _broker, mut link) = connected_messenger().await;
    let mut pushed = messenger.connection().messages().listen();

    link.push(&json!({
        "senderUsername": "bob",
        "receiverUsername": "alice",
        "content": "are you there?",
        "timestamp": "2024-05-01T10:00:00Z"
    }));
    timeout(WAIT, pushed.recv()).await.unwrap().unwrap();

    let conversation = messenger.conversation_with("bob");
    assert_eq!(conversation.len(), 1);
    assert_eq!(conversation[0].origin, Origin::Pushed);
}

#[tokio::test]
async fn test_send_while_disconnected_keeps_optimistic_entry() {
    let (broker, connector) = MockBroker::new();
    broker.refuse_connections(true);
    let messenger = Messenger::initialize(test_config(), connector, "alice", Some("tok"))
        .await
        .unwrap();
    let mut errors = messenger.connection().errors().listen();

    let err = messenger.send_message("bob", "queued?").await.unwrap_err();
    assert_eq!(err, ChatError::NotConnected);
    assert_eq!(errors.try_recv(), Some(ChatError::NotConnected));

    let conversation = messenger.conversation_with("bob");
    assert_eq!(conversation.len(), 1);
    assert_eq!(conversation[0].origin, Origin::Optimistic);
}

#[tokio::test]
async fn test_send_rejects_blank_input_without_storing() {
    let (messenger, _broker, _link) = connected_messenger().await;
    assert!(matches!(
        messenger.send_message("bob", "   ").await,
        Err(ChatError::InvalidMessage(_))
    ));
    assert!(matches!(
        messenger.send_message("", "hi").await,
        Err(ChatError::InvalidMessage(_))
    ));
    assert_eq!(messenger.message_count(), 0);
}

#[tokio::test]
async fn test_load_history_is_idempotent() {
    let (messenger, _broker, _link) = connected_messenger().await;
    let rows = vec![
        history_row("bob", "alice", "two", 2_000),
        history_row("alice", "bob", "one", 1_000),
        history_row("bob", "alice", "three", 3_000),
    ];

    let first = messenger
        .load_history("bob", |local, peer| {
            assert_eq!(local, "alice");
            assert_eq!(peer, "bob");
            let rows = rows.clone();
            async move { Ok(rows) }
        })
        .await
        .unwrap();
    assert_eq!(first.stored, 3);

    let again = messenger
        .load_history("bob", |_, _| {
            let rows = rows.clone();
            async move { Ok(rows) }
        })
        .await
        .unwrap();
    assert_eq!(again.stored, 0);

    let bodies: Vec<_> = messenger
        .conversation_with("bob")
        .into_iter()
        .map(|m| m.body)
        .collect();
    assert_eq!(bodies, vec!["one", "two", "three"]);
}

#[tokio::test]
async fn test_history_failure_is_wrapped_and_isolated() {
    let (messenger, _broker, _link) = connected_messenger().await;

    let err = messenger
        .load_history("bob", |_, _| async { Err(ChatError::Http { status: 500, message: "boom".to_string() }) })
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::HistoryFetch { ref peer, .. } if peer == "bob"));

    let peers = vec!["bob".to_string(), "carol".to_string()];
    let results = messenger
        .load_histories(&peers, |local, peer| async move {
            if peer == "bob" {
                Err(ChatError::Transport("unreachable".to_string()))
            } else {
                Ok(vec![history_row(&peer, &local, "hi alice", 5_000)])
            }
        })
        .await;
    assert!(results[0].is_err());
    assert_eq!(results[1].as_ref().unwrap().stored, 1);
    assert_eq!(messenger.conversation_with("carol").len(), 1);
}

#[tokio::test]
async fn test_last_messages_per_peer() {
    let (messenger, _broker, _link) = connected_messenger().await;
    messenger
        .load_history("bob", |_, _| async {
            Ok(vec![
                history_row("alice", "bob", "old", 1_000),
                history_row("bob", "alice", "new", 4_000),
                history_row("carol", "alice", "hey", 2_000),
            ])
        })
        .await
        .unwrap();

    let last = messenger.last_messages(&["bob", "carol", "dave"]);
    assert_eq!(last.len(), 2);
    assert_eq!(last[0].peer, "bob");
    assert_eq!(last[0].message.body, "new");
    assert_eq!(last[1].message.body, "hey");
}

#[tokio::test]
async fn test_shutdown_clears_and_disconnects() {
    let (messenger, mut broker, mut link) = connected_messenger().await;
    messenger.send_message("bob", "bye").await.unwrap();
    assert_eq!(link.next_frame().await.command, Command::Send);

    messenger.shutdown();
    assert_eq!(messenger.message_count(), 0);
    assert_eq!(messenger.connection_status(), ConnectionState::Disconnected);
    assert_eq!(link.next_frame().await.command, Command::Disconnect);

    // Pushed frames after shutdown no longer reach the store
    assert!(!broker.opens_link_within(std::time::Duration::from_millis(100)).await);
    assert!(messenger.conversation_with("bob").is_empty());
}

#[tokio::test]
async fn test_shutdown_is_terminal() {
    let (messenger, _broker, _link) = connected_messenger().await;
    let mut states = messenger.connection().states().listen();
    let _watcher = messenger.on_message(|_| {});

    messenger.shutdown();
    assert!(messenger.is_shut_down());
    // The final transition is still delivered, then every listener is gone
    assert_eq!(states.try_recv(), Some(ConnectionState::Disconnected));
    assert_eq!(messenger.connection().messages().listener_count(), 0);
    assert_eq!(messenger.connection().states().listener_count(), 0);
    assert_eq!(messenger.connection().errors().listener_count(), 0);

    assert_eq!(
        messenger.send_message("bob", "too late").await.unwrap_err(),
        ChatError::NotConnected
    );
    assert_eq!(messenger.message_count(), 0);

    // A second shutdown changes nothing
    messenger.shutdown();
    assert_eq!(messenger.connection_status(), ConnectionState::Disconnected);
}
