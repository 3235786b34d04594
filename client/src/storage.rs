//! Persistent store for the chat session token and device identity.

use athelo_chat_protocol::SessionToken;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("failed to open credential store: {0}")]
    Open(String),
    #[error("store error: {0}")]
    Backend(#[from] sled::Error),
    #[error("corrupt record: {0}")]
    Codec(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Sled-backed credential store. The session token is kept until
/// logout, an explicit purge, or a server-side invalidation.
#[derive(Clone)]
pub struct CredentialStore {
    db: sled::Db,
}

#[derive(Serialize, Deserialize)]
struct StoredToken {
    token: String,
    stored_ms: i64,
}

impl CredentialStore {
    const TOKEN_KEY: &'static [u8] = b"chat-session-token";
    const DEVICE_KEY: &'static [u8] = b"device-id";

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)
            .map_err(|e| StorageError::Open(format!("{}: {e}", path.display())))?;
        let db = sled::open(path)
            .map_err(|e| StorageError::Open(format!("{}: {e}", path.display())))?;
        Ok(Self { db })
    }

    /// In-memory store, used by tests.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| StorageError::Open(e.to_string()))?;
        Ok(Self { db })
    }

    pub fn load_token(&self) -> Result<Option<SessionToken>> {
        let Some(raw) = self.db.get(Self::TOKEN_KEY)? else {
            return Ok(None);
        };
        let record: StoredToken = bincode::deserialize(&raw)?;
        Ok(Some(SessionToken(record.token)))
    }

    pub fn store_token(&self, token: &SessionToken) -> Result<()> {
        let record = StoredToken {
            token: token.0.clone(),
            stored_ms: now_ms(),
        };
        self.db.insert(Self::TOKEN_KEY, bincode::serialize(&record)?)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn clear_token(&self) -> Result<()> {
        self.db.remove(Self::TOKEN_KEY)?;
        self.db.flush()?;
        Ok(())
    }

    /// Stable per-device identifier, generated once and persisted.
    pub fn device_id(&self) -> Result<Uuid> {
        if let Some(raw) = self.db.get(Self::DEVICE_KEY)? {
            if let Ok(id) = Uuid::from_slice(&raw) {
                return Ok(id);
            }
        }
        let id = Uuid::new_v4();
        self.db.insert(Self::DEVICE_KEY, id.as_bytes().to_vec())?;
        self.db.flush()?;
        Ok(id)
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
