/// REST client for the user directory and message history service
use crate::error::{ChatError, Result};
use crate::message::{Friend, Message, Origin};
use crate::transport::envelope::normalize;
use chrono::Utc;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

/// Bearer-authenticated client for `api_base_url`
#[derive(Clone)]
pub struct ChatApiClient {
    base_url: String,
    token: String,
    http: reqwest::Client,
}

impl ChatApiClient {
    pub fn new(base_url: &str, token: &str) -> Self {
        Self {
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            token: token.to_string(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .unwrap_or_default(),
        }
    }

    /// The user the token belongs to
    pub async fn login_user(&self) -> Result<Friend> {
        self.request(Method::GET, "/api/users/login", None).await
    }

    /// Users whose username matches `keyword`
    pub async fn search_users(&self, keyword: &str) -> Result<Vec<Friend>> {
        let keyword = keyword.trim();
        if keyword.is_empty() {
            return Ok(Vec::new());
        }
        let path = format!("/api/users/username/{}", urlencoding::encode(keyword));
        let value: Value = self.request(Method::GET, &path, None).await?;
        // The service answers with a single user or a list depending on the match
        match value {
            Value::Array(_) => Ok(serde_json::from_value(value)?),
            Value::Null => Ok(Vec::new()),
            single => Ok(vec![serde_json::from_value(single)?]),
        }
    }

    pub async fn list_friends(&self, user_id: i64) -> Result<Vec<Friend>> {
        let value: Value = self
            .request(Method::GET, &format!("/api/friends/{}", user_id), None)
            .await?;
        if value.is_null() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Befriend `target_id` on behalf of `self_id`
    pub async fn add_friend(&self, self_id: i64, target_id: i64) -> Result<Value> {
        let body = json!({
            "user": { "id": self_id },
            "friend": { "id": target_id },
        });
        self.request(Method::POST, "/api/friends", Some(body)).await
    }

    /// Messages exchanged between two users, normalised as historical.
    /// Rows that do not normalise are skipped.
    pub async fn fetch_history(&self, user_a: i64, user_b: i64) -> Result<Vec<Message>> {
        let path = format!("/api/messages/users/{}/{}", user_a, user_b);
        let rows: Value = self
            .request(Method::GET, &path, None)
            .await
            .map_err(|e| ChatError::HistoryFetch {
                peer: user_b.to_string(),
                reason: e.to_string(),
            })?;

        let rows = match rows {
            Value::Array(rows) => rows,
            Value::Null => Vec::new(),
            other => {
                return Err(ChatError::HistoryFetch {
                    peer: user_b.to_string(),
                    reason: format!("expected a list of messages, got {}", other),
                })
            }
        };

        let received_at = Utc::now();
        let messages: Vec<Message> = rows
            .into_iter()
            .filter_map(|row| match normalize(row, Origin::Historical, received_at) {
                Ok(m) => Some(m),
                Err(e) => {
                    warn!("Skipping history row: {}", e);
                    None
                }
            })
            .collect();
        debug!("Fetched {} history messages for {}/{}", messages.len(), user_a, user_b);
        Ok(messages)
    }

    async fn request<T: DeserializeOwned>(&self, method: Method, path: &str, body: Option<Value>) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let mut builder = self.http.request(method.clone(), &url).bearer_auth(&self.token);
        if let Some(body) = body {
            builder = builder.json(&body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ChatError::Transport(format!("{} {} failed: {}", method, url, e)))?;

        let status = response.status();
        if status == StatusCode::FORBIDDEN {
            warn!("{} {} answered 403; token rejected", method, url);
            return Err(ChatError::AuthRequired);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ChatError::Http {
                status: status.as_u16(),
                message: if message.is_empty() {
                    status.canonical_reason().unwrap_or("request failed").to_string()
                } else {
                    message
                },
            });
        }

        let text = response
            .text()
            .await
            .map_err(|e| ChatError::Transport(format!("Reading {} failed: {}", url, e)))?;
        if text.trim().is_empty() {
            return Ok(serde_json::from_value(Value::Null)?);
        }
        Ok(serde_json::from_str(&text)?)
    }
}
