//! Conversation aggregates and the canonical sort order.

use crate::socket::ChatMessage;
use crate::{ChatRoomId, UserId};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A caregiver or patient the current user can message. Sourced from
/// the identity endpoints; this crate only consumes the snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub user_id: UserId,
    pub display_name: String,
    #[serde(default)]
    pub photo_url: Option<String>,
}

/// Per-room aggregate merged from REST snapshots and socket events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// None until the backend has created a room for this pairing.
    pub chat_room_identifier: Option<ChatRoomId>,
    pub contact: Contact,
    pub recent_message: Option<ChatMessage>,
    pub unread_count: Option<u64>,
}

impl Conversation {
    /// A conversation for a contact with no room yet.
    pub fn for_contact(contact: Contact) -> Self {
        Self {
            chat_room_identifier: None,
            contact,
            recent_message: None,
            unread_count: None,
        }
    }

    /// Timestamp of the most recent message, or epoch zero when the
    /// room has no recorded activity.
    pub fn last_message_date(&self) -> i64 {
        self.recent_message
            .as_ref()
            .map(|message| message.message_id)
            .unwrap_or(0)
    }
}

/// Canonical ordering for room-backed conversations: most recent
/// activity first, display name (case-insensitive) breaking ties.
pub fn compare_conversations(a: &Conversation, b: &Conversation) -> Ordering {
    b.last_message_date()
        .cmp(&a.last_message_date())
        .then_with(|| compare_names(&a.contact, &b.contact))
}

/// Name-only ordering used for contacts that have no room yet.
pub fn compare_names(a: &Contact, b: &Contact) -> Ordering {
    a.display_name
        .to_lowercase()
        .cmp(&b.display_name.to_lowercase())
}
