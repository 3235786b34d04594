use crate::session::ReconnectPolicy;
use std::env;
use std::path::PathBuf;

/// Runtime configuration for the chat client.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Base URL for the REST API.
    pub api_base_url: String,
    /// WebSocket endpoint of the chat service.
    pub socket_url: String,
    /// User auth token for REST calls. The chat session stays closed
    /// while this is absent.
    pub access_token: Option<String>,
    /// Backend identifier of the current user.
    pub user_id: i64,
    /// Push-notification token forwarded when opening a session.
    pub push_token: Option<String>,
    /// Filesystem path for the credential store.
    pub storage_path: PathBuf,
    pub reconnect: ReconnectPolicy,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let api_base_url =
            env::var("ATHELO_API_URL").unwrap_or_else(|_| "https://api.athelo.app".to_string());
        let socket_url = env::var("ATHELO_CHAT_WS_URL")
            .unwrap_or_else(|_| "wss://chat.athelo.app/ws/chat/".to_string());
        let access_token = env::var("ATHELO_ACCESS_TOKEN").ok();
        let user_id = env::var("ATHELO_USER_ID")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let push_token = env::var("ATHELO_PUSH_TOKEN").ok();
        let storage_path = env::var("ATHELO_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data/chat"));

        Ok(Self {
            api_base_url,
            socket_url,
            access_token,
            user_id,
            push_token,
            storage_path,
            reconnect: ReconnectPolicy::default(),
        })
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn with_storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage_path = path.into();
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }
}
