//! REST collaborator: online users, conversation list and history.
//!
//! Only the read endpoints the engine itself needs. Requests carry the
//! current token as a bearer header; a missing token fails before any I/O.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chatwire_core::model::WireMessage;
use chatwire_core::{Conversation, ConversationId, Message, MessageOrigin, UserId};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

use crate::auth::{TokenProvider, current_token};
use crate::presence::PresenceSource;

/// Per-request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// REST failures.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Transport or decode failure.
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// Non-success status other than 401/403.
    #[error("server answered HTTP {status}: {body}")]
    Status {
        /// HTTP status.
        status: u16,
        /// Response body, possibly truncated.
        body: String,
    },
    /// No token available.
    #[error("No auth token")]
    AuthMissing,
    /// 401 or 403.
    #[error("authentication rejected (HTTP {status})")]
    AuthRejected {
        /// HTTP status.
        status: u16,
    },
}

/// One page of conversation history.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessagePage {
    /// Messages on this page, tagged [`MessageOrigin::Fetch`].
    pub results: Vec<Message>,
    /// URL of the next page, if any.
    pub next: Option<String>,
}

#[derive(Deserialize)]
struct WirePage {
    #[serde(default)]
    results: Vec<WireMessage>,
    #[serde(default)]
    next: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OnlineUsers {
    Bare(Vec<UserId>),
    Wrapped { online_users: Vec<UserId> },
}

#[derive(Deserialize)]
struct WireConversation {
    #[serde(default)]
    id: Option<ConversationId>,
    #[serde(alias = "other_user")]
    other_user_id: UserId,
    #[serde(default)]
    last_message_preview: Option<String>,
    #[serde(default)]
    last_message_at: Option<DateTime<Utc>>,
    #[serde(default)]
    unread_count: u32,
}

impl From<WireConversation> for Conversation {
    fn from(row: WireConversation) -> Self {
        Self {
            id: row.id,
            other_user_id: row.other_user_id,
            last_message_preview: row.last_message_preview.unwrap_or_default(),
            last_message_at: row.last_message_at,
            unread_count: row.unread_count,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ConversationList {
    Bare(Vec<WireConversation>),
    Paged { results: Vec<WireConversation> },
}

/// Thin client for the chat REST API.
pub struct HttpChatApi {
    client: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenProvider>,
}

impl std::fmt::Debug for HttpChatApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpChatApi")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpChatApi {
    /// Build a client for `base_url` (e.g. `http://host/api`).
    pub fn new(
        base_url: impl Into<String>,
        tokens: Arc<dyn TokenProvider>,
    ) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self::with_client(client, base_url, tokens))
    }

    /// Use an existing `reqwest` client.
    pub fn with_client(
        client: reqwest::Client,
        base_url: impl Into<String>,
        tokens: Arc<dyn TokenProvider>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            tokens,
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ApiError> {
        let token = current_token(self.tokens.as_ref()).ok_or(ApiError::AuthMissing)?;
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        debug!(url = %url, "GET");
        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .query(query)
            .send()
            .await?;
        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(ApiError::AuthRejected {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                body: body.chars().take(512).collect(),
            });
        }
        Ok(response.json().await?)
    }

    /// Ids of users currently online.
    pub async fn online_user_ids(&self) -> Result<Vec<UserId>, ApiError> {
        let users: OnlineUsers = self.get_json("communication/online-users/", &[]).await?;
        Ok(match users {
            OnlineUsers::Bare(ids) | OnlineUsers::Wrapped { online_users: ids } => ids,
        })
    }

    /// Conversation summaries for the local user.
    pub async fn conversations(&self) -> Result<Vec<Conversation>, ApiError> {
        let list: ConversationList = self.get_json("communication/conversations/", &[]).await?;
        let rows = match list {
            ConversationList::Bare(rows) | ConversationList::Paged { results: rows } => rows,
        };
        Ok(rows.into_iter().map(Conversation::from).collect())
    }

    /// One page of history with `peer` (pages start at 1).
    pub async fn conversation_messages(
        &self,
        peer: UserId,
        page: u32,
    ) -> Result<MessagePage, ApiError> {
        let path = format!("communication/conversations/{peer}/messages/");
        let wire: WirePage = self.get_json(&path, &[("page", page.to_string())]).await?;
        Ok(MessagePage {
            results: wire
                .results
                .into_iter()
                .map(|m| m.into_message(MessageOrigin::Fetch))
                .collect(),
            next: wire.next,
        })
    }
}

#[async_trait]
impl PresenceSource for HttpChatApi {
    async fn online_user_ids(&self) -> Result<Vec<UserId>, ApiError> {
        HttpChatApi::online_user_ids(self).await
    }
}
