//! Frame models for the chat WebSocket.
//!
//! Incoming frames are a tagged union over the wire `type` field. Two
//! quirks of the backend format must survive any refactor: `ERROR`
//! frames nest their payload under a top-level `exception` key, and
//! `SYSTEM_ROUTABLE` frames deliver the whole top-level value as the
//! payload instead of wrapping it under `payload`.

use crate::{ChatRoomId, ProtocolError, Result, UserId};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A chat message as carried in socket payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub chat_room_identifier: ChatRoomId,
    /// Microsecond epoch timestamp doubling as the message identifier.
    #[serde(deserialize_with = "deserialize_micros")]
    pub message_id: i64,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub user_id: Option<UserId>,
}

/// A read receipt for a single room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRead {
    pub chat_room_identifier: ChatRoomId,
    #[serde(deserialize_with = "deserialize_micros")]
    pub message_id: i64,
}

/// Unread-message tally for a single room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnreadCount {
    pub chat_room_identifier: ChatRoomId,
    pub unread_count: u64,
}

/// Incoming socket frames, keyed by the wire `type` tag.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingSocketMessage {
    /// `ERROR` — payload arrives under a top-level `exception` key.
    Error { exception: Value },
    /// `GET_HISTORY` — a page of messages for one room.
    History {
        chat_room_identifier: Option<ChatRoomId>,
        messages: Vec<ChatMessage>,
    },
    /// `GET_LAST_CHAT_ROOM_MESSAGE` — the most recent message per room.
    LastMessage { messages: Vec<ChatMessage> },
    /// `SET_LAST_MESSAGE_READ` — acknowledgement of a read marker.
    MessageRead { receipts: Vec<MessageRead> },
    /// `GET_LAST_MESSAGES_READ` — read markers across rooms.
    MessagesRead { receipts: Vec<MessageRead> },
    /// `ROUTABLE` — navigation payload forwarded to consumers unchanged.
    Routable { payload: Value },
    /// `SYSTEM_ROUTABLE` — the payload is the entire top-level frame.
    SystemRoutable { payload: Value },
    /// `GET_UNREAD_MESSAGES_COUNT` — unread tallies.
    UnreadMessages { counts: Vec<UnreadCount> },
}

impl IncomingSocketMessage {
    /// Decode one text frame, dispatching on the `type` tag.
    pub fn decode(raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw)?;
        let tag = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::MalformedFrame("missing type tag".into()))?
            .to_owned();

        match tag.as_str() {
            "ERROR" => Ok(Self::Error {
                exception: value.get("exception").cloned().unwrap_or(Value::Null),
            }),
            "GET_HISTORY" => Ok(Self::History {
                chat_room_identifier: room_of(&value),
                messages: payload_items(&value)?,
            }),
            "GET_LAST_CHAT_ROOM_MESSAGE" => Ok(Self::LastMessage {
                messages: payload_items(&value)?,
            }),
            "SET_LAST_MESSAGE_READ" => Ok(Self::MessageRead {
                receipts: payload_items(&value)?,
            }),
            "GET_LAST_MESSAGES_READ" => Ok(Self::MessagesRead {
                receipts: payload_items(&value)?,
            }),
            "ROUTABLE" => Ok(Self::Routable {
                payload: value.get("payload").cloned().unwrap_or(Value::Null),
            }),
            "SYSTEM_ROUTABLE" => Ok(Self::SystemRoutable { payload: value }),
            "GET_UNREAD_MESSAGES_COUNT" => Ok(Self::UnreadMessages {
                counts: payload_items(&value)?,
            }),
            other => Err(ProtocolError::UnknownType(other.to_owned())),
        }
    }
}

/// Outgoing request envelopes: `{ type, chat_room_identifier, ... }`.
/// Fire-and-forget; there are no correlation identifiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutgoingSocketMessage {
    GetHistory {
        chat_room_identifier: ChatRoomId,
        timestamp: i64,
        limit: u32,
    },
    GetLastChatRoomMessage {
        chat_room_identifier: ChatRoomId,
    },
    SetLastMessageRead {
        chat_room_identifier: ChatRoomId,
        message_id: i64,
    },
    GetUnreadMessagesCount {
        chat_room_identifier: ChatRoomId,
    },
}

impl OutgoingSocketMessage {
    pub fn chat_room_identifier(&self) -> &ChatRoomId {
        match self {
            Self::GetHistory {
                chat_room_identifier,
                ..
            }
            | Self::GetLastChatRoomMessage {
                chat_room_identifier,
            }
            | Self::SetLastMessageRead {
                chat_room_identifier,
                ..
            }
            | Self::GetUnreadMessagesCount {
                chat_room_identifier,
            } => chat_room_identifier,
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

fn room_of(value: &Value) -> Option<ChatRoomId> {
    value
        .get("chat_room_identifier")
        .and_then(Value::as_str)
        .map(ChatRoomId::new)
}

fn payload_items<T: de::DeserializeOwned>(value: &Value) -> Result<Vec<T>> {
    let payload = value
        .get("payload")
        .cloned()
        .unwrap_or_else(|| Value::Array(Vec::new()));
    serde_json::from_value(payload).map_err(|e| ProtocolError::MalformedFrame(e.to_string()))
}

/// Message timestamps arrive as either a JSON integer or a numeric
/// string; try the integer reading first, then parse the string.
fn deserialize_micros<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match &value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
    .ok_or_else(|| de::Error::custom("expected integer or numeric-string timestamp"))
}
