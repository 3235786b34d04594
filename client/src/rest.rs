//! REST client for the chat-session and contact endpoints.

use async_trait::async_trait;
use athelo_chat_protocol::conversation::Contact;
use athelo_chat_protocol::{ChatRoomId, SessionToken, UserId};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum RestError {
    #[error("http client build failure: {0}")]
    ClientBuild(String),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unexpected status {status} from {path}")]
    Status { status: u16, path: String },
    #[error("missing user credentials")]
    Unauthenticated,
}

pub type Result<T> = std::result::Result<T, RestError>;

/// A chat room as reported by `GET /chats/conversations/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRoomInfo {
    pub chat_room_identifier: ChatRoomId,
    /// Backend ids of all room members, including the current user.
    pub user_ids: Vec<UserId>,
}

/// Backend seam for the REST surface the chat core consumes.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// `POST /chats/sessions/open-session/` — returns a session token
    /// keyed by the stable device identifier.
    async fn open_session(
        &self,
        device_id: Uuid,
        push_token: Option<&str>,
    ) -> Result<SessionToken>;

    /// `POST /chats/sessions/close-session/` — retires a token.
    async fn close_session(&self, token: &SessionToken) -> Result<()>;

    /// `GET /chats/conversations/` — the full room list, or a filtered
    /// subset when `rooms` is non-empty.
    async fn conversations(&self, rooms: &[ChatRoomId]) -> Result<Vec<ChatRoomInfo>>;

    async fn caregiver_contacts(&self) -> Result<Vec<Contact>>;

    async fn patient_contacts(&self) -> Result<Vec<Contact>>;
}

/// Query pairs for `GET /chats/conversations/`. A single room filters
/// by `chat_room_identifier`; several rooms use the comma-joined
/// `chat_room_identifier__in` form.
pub fn conversations_query(rooms: &[ChatRoomId]) -> Vec<(String, String)> {
    match rooms {
        [] => Vec::new(),
        [single] => vec![(
            "chat_room_identifier".to_string(),
            single.as_str().to_owned(),
        )],
        many => vec![(
            "chat_room_identifier__in".to_string(),
            many.iter()
                .map(ChatRoomId::as_str)
                .collect::<Vec<_>>()
                .join(","),
        )],
    }
}

/// Production implementation backed by reqwest.
pub struct HttpChatApi {
    base_url: String,
    access_token: Option<String>,
    client: reqwest::Client,
}

impl HttpChatApi {
    pub fn new(base_url: impl Into<String>, access_token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| RestError::ClientBuild(e.to_string()))?;
        let base_url = base_url.into().trim_end_matches('/').to_owned();
        Ok(Self {
            base_url,
            access_token,
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder> {
        let token = self
            .access_token
            .as_deref()
            .ok_or(RestError::Unauthenticated)?;
        Ok(request.header("Authorization", format!("Bearer {token}")))
    }

    async fn expect_success(
        response: reqwest::Response,
        path: &str,
    ) -> Result<reqwest::Response> {
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(RestError::Status {
                status: response.status().as_u16(),
                path: path.to_string(),
            })
        }
    }

    async fn fetch_contacts(&self, path: &str) -> Result<Vec<Contact>> {
        let response = self
            .authorized(self.client.get(self.url(path)))?
            .send()
            .await?;
        let response = Self::expect_success(response, path).await?;
        let body: Paged<Contact> = response.json().await?;
        Ok(body.results)
    }
}

#[derive(Serialize)]
struct OpenSessionBody<'a> {
    device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    push_token: Option<&'a str>,
}

#[derive(Deserialize)]
struct OpenSessionResponse {
    token: String,
}

#[derive(Serialize)]
struct CloseSessionBody<'a> {
    token: &'a str,
}

/// Django-style paginated list response.
#[derive(Deserialize)]
struct Paged<T> {
    results: Vec<T>,
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn open_session(
        &self,
        device_id: Uuid,
        push_token: Option<&str>,
    ) -> Result<SessionToken> {
        let path = "/chats/sessions/open-session/";
        let request = self
            .authorized(self.client.post(self.url(path)))?
            .json(&OpenSessionBody {
                device_id: device_id.to_string(),
                push_token,
            });
        let response = Self::expect_success(request.send().await?, path).await?;
        let body: OpenSessionResponse = response.json().await?;
        Ok(SessionToken(body.token))
    }

    async fn close_session(&self, token: &SessionToken) -> Result<()> {
        let path = "/chats/sessions/close-session/";
        let request = self
            .authorized(self.client.post(self.url(path)))?
            .json(&CloseSessionBody {
                token: token.as_str(),
            });
        Self::expect_success(request.send().await?, path).await?;
        Ok(())
    }

    async fn conversations(&self, rooms: &[ChatRoomId]) -> Result<Vec<ChatRoomInfo>> {
        let path = "/chats/conversations/";
        let mut request = self.client.get(self.url(path));
        let query = conversations_query(rooms);
        if !query.is_empty() {
            request = request.query(&query);
        }
        let response = self.authorized(request)?.send().await?;
        let response = Self::expect_success(response, path).await?;
        let body: Paged<ChatRoomInfo> = response.json().await?;
        Ok(body.results)
    }

    async fn caregiver_contacts(&self) -> Result<Vec<Contact>> {
        self.fetch_contacts("/health/caregivers/").await
    }

    async fn patient_contacts(&self) -> Result<Vec<Contact>> {
        self.fetch_contacts("/health/patients/").await
    }
}
