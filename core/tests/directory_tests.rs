/// REST directory client against a mock HTTP server
use chatlink_core::directory::ChatApiClient;
use chatlink_core::error::ChatError;
use chatlink_core::message::Origin;
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn client() -> (MockServer, ChatApiClient) {
    let server = MockServer::start().await;
    let client = ChatApiClient::new(&format!("{}/", server.uri()), "tok-9");
    (server, client)
}

#[tokio::test]
async fn test_login_user_sends_bearer_token() {
    let (server, client) = client().await;
    Mock::given(method("GET"))
        .and(path("/api/users/login"))
        .and(header("Authorization", "Bearer tok-9"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 7,
            "username": "alice",
            "firstName": "Alice",
            "lastSeen": "2024-05-01T09:00:00"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let me = client.login_user().await.unwrap();
    assert_eq!(me.id, 7);
    assert_eq!(me.username, "alice");
    assert_eq!(me.first_name, "Alice");
}

#[tokio::test]
async fn test_forbidden_maps_to_auth_required() {
    let (server, client) = client().await;
    Mock::given(method("GET"))
        .and(path("/api/friends/7"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    assert_eq!(client.list_friends(7).await.unwrap_err(), ChatError::AuthRequired);
}

#[tokio::test]
async fn test_server_error_maps_to_http() {
    let (server, client) = client().await;
    Mock::given(method("GET"))
        .and(path("/api/friends/7"))
        .respond_with(ResponseTemplate::new(500).set_body_string("database down"))
        .mount(&server)
        .await;

    match client.list_friends(7).await.unwrap_err() {
        ChatError::Http { status, message } => {
            assert_eq!(status, 500);
            assert_eq!(message, "database down");
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn test_search_accepts_single_user_or_list() {
    let (server, client) = client().await;
    Mock::given(method("GET"))
        .and(path("/api/users/username/bo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": 2, "username": "bob", "firstName": "Bob"},
            {"id": 3, "username": "bonnie", "firstName": "Bonnie"}
        ])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/users/username/carol"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(
            {"id": 4, "username": "carol", "firstName": "Carol"}
        )))
        .mount(&server)
        .await;

    let many = client.search_users("bo").await.unwrap();
    assert_eq!(many.len(), 2);
    let one = client.search_users("carol").await.unwrap();
    assert_eq!(one[0].id, 4);
    assert!(client.search_users("   ").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_add_friend_posts_user_pair() {
    let (server, client) = client().await;
    Mock::given(method("POST"))
        .and(path("/api/friends"))
        .and(body_json(json!({"user": {"id": 7}, "friend": {"id": 2}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 99})))
        .expect(1)
        .mount(&server)
        .await;

    let created = client.add_friend(7, 2).await.unwrap();
    assert_eq!(created["id"], 99);
}

#[tokio::test]
async fn test_fetch_history_normalises_rows() {
    let (server, client) = client().await;
    Mock::given(method("GET"))
        .and(path("/api/messages/users/7/2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": 1, "sender": "alice", "receiver": "bob", "message": "hi", "sendTime": "2024-05-01T10:00:00"},
            {"id": 2, "sender": {"id": 2, "username": "bob"}, "receiver": {"id": 7, "username": "alice"}, "message": "yo", "sendTime": "2024-05-01T10:00:05"},
            {"id": 3, "sender": "bob", "receiver": "alice", "message": "   "}
        ])))
        .mount(&server)
        .await;

    let history = client.fetch_history(7, 2).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].body, "hi");
    assert_eq!(history[1].sender, "bob");
    assert!(history.iter().all(|m| m.origin == Origin::Historical));
}

#[tokio::test]
async fn test_fetch_history_failure_is_history_fetch() {
    let (server, client) = client().await;
    Mock::given(method("GET"))
        .and(path("/api/messages/users/7/2"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    assert!(matches!(
        client.fetch_history(7, 2).await,
        Err(ChatError::HistoryFetch { .. })
    ));
}
