//! The aggregator run loop: exclusive owner of the conversation maps.

use super::AggregatorCommand;
use crate::rest::{ChatApi, ChatRoomInfo};
use crate::session::SessionLink;
use athelo_chat_protocol::conversation::{
    compare_conversations, compare_names, Contact, Conversation,
};
use athelo_chat_protocol::socket::{
    ChatMessage, IncomingSocketMessage, OutgoingSocketMessage, UnreadCount,
};
use athelo_chat_protocol::{now_micros, ChatRoomId, UserId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, warn};

pub(super) struct AggregatorRuntime {
    user_id: UserId,
    api: Arc<dyn ChatApi>,
    link: SessionLink,
    command_rx: mpsc::Receiver<AggregatorCommand>,
    incoming_rx: broadcast::Receiver<IncomingSocketMessage>,
    conversations_tx: watch::Sender<Vec<Conversation>>,
    chat_rooms: HashMap<ChatRoomId, ChatRoomInfo>,
    contacts: HashMap<UserId, Contact>,
    last_messages: HashMap<ChatRoomId, ChatMessage>,
    unread_counts: HashMap<ChatRoomId, u64>,
}

impl AggregatorRuntime {
    pub(super) fn new(
        user_id: UserId,
        api: Arc<dyn ChatApi>,
        link: SessionLink,
        command_rx: mpsc::Receiver<AggregatorCommand>,
        incoming_rx: broadcast::Receiver<IncomingSocketMessage>,
        conversations_tx: watch::Sender<Vec<Conversation>>,
    ) -> Self {
        Self {
            user_id,
            api,
            link,
            command_rx,
            incoming_rx,
            conversations_tx,
            chat_rooms: HashMap::new(),
            contacts: HashMap::new(),
            last_messages: HashMap::new(),
            unread_counts: HashMap::new(),
        }
    }

    pub(super) async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(AggregatorCommand::Refresh { done }) => {
                        self.refresh().await;
                        if let Some(done) = done {
                            let _ = done.send(());
                        }
                    }
                    Some(AggregatorCommand::ContactsUpdated(contacts)) => {
                        self.replace_contacts(contacts);
                        self.publish();
                    }
                    None => break,
                },
                event = self.incoming_rx.recv() => match event {
                    Ok(message) => self.handle_socket_message(message).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "socket event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    /// Re-fetches rooms and both contact lists concurrently, joins,
    /// rebuilds, then primes the last-message cache for every room.
    async fn refresh(&mut self) {
        let (rooms, caregivers, patients) = tokio::join!(
            self.api.conversations(&[]),
            self.api.caregiver_contacts(),
            self.api.patient_contacts(),
        );

        match rooms {
            Ok(rooms) => {
                self.chat_rooms = rooms
                    .into_iter()
                    .map(|room| (room.chat_room_identifier.clone(), room))
                    .collect();
                // Rooms gone from the snapshot take their cached
                // activity with them.
                let rooms = &self.chat_rooms;
                self.last_messages.retain(|room, _| rooms.contains_key(room));
                self.unread_counts.retain(|room, _| rooms.contains_key(room));
            }
            Err(err) => warn!(%err, "chat room refresh failed"),
        }

        let mut fresh_contacts = Vec::new();
        let mut any_contacts = false;
        match caregivers {
            Ok(mut list) => {
                any_contacts = true;
                fresh_contacts.append(&mut list);
            }
            Err(err) => warn!(%err, "caregiver contact refresh failed"),
        }
        match patients {
            Ok(mut list) => {
                any_contacts = true;
                fresh_contacts.append(&mut list);
            }
            Err(err) => warn!(%err, "patient contact refresh failed"),
        }
        if any_contacts {
            self.replace_contacts(fresh_contacts);
        }

        self.publish();

        // timestamp now+1 returns the single item preceding "now"
        for room in self.chat_rooms.keys() {
            self.link
                .send_message(OutgoingSocketMessage::GetHistory {
                    chat_room_identifier: room.clone(),
                    timestamp: now_micros() + 1,
                    limit: 1,
                })
                .await;
        }
    }

    fn replace_contacts(&mut self, contacts: Vec<Contact>) {
        self.contacts = contacts
            .into_iter()
            .map(|contact| (contact.user_id, contact))
            .collect();
    }

    async fn handle_socket_message(&mut self, message: IncomingSocketMessage) {
        match message {
            IncomingSocketMessage::LastMessage { messages } => {
                for message in messages {
                    self.apply_last_message(message, true).await;
                }
            }
            IncomingSocketMessage::History { messages, .. } => {
                for message in messages {
                    self.apply_last_message(message, false).await;
                }
            }
            IncomingSocketMessage::UnreadMessages { counts } => {
                for count in counts {
                    self.apply_unread_count(count).await;
                }
                self.publish();
            }
            _ => {}
        }
    }

    /// Merges a most-recent message. A message for an unknown room
    /// triggers a targeted REST lookup before the merge is retried;
    /// `request_unread` re-checks the room's unread count afterwards
    /// since a new message implies the count may have changed.
    async fn apply_last_message(&mut self, message: ChatMessage, request_unread: bool) {
        let room = message.chat_room_identifier.clone();
        if !self.chat_rooms.contains_key(&room) {
            self.lookup_room(&room).await;
        }
        if !self.chat_rooms.contains_key(&room) {
            // Pair by participant when the backend cannot resolve the
            // room yet.
            let Some(user_id) = message
                .user_id
                .filter(|user_id| self.contacts.contains_key(user_id))
            else {
                debug!(%room, "message for unknown room and participant, dropping");
                return;
            };
            self.chat_rooms.insert(
                room.clone(),
                ChatRoomInfo {
                    chat_room_identifier: room.clone(),
                    user_ids: vec![self.user_id, user_id],
                },
            );
        }
        // A delayed history prime must not displace a newer live event.
        let stale = self
            .last_messages
            .get(&room)
            .is_some_and(|existing| existing.message_id >= message.message_id);
        if stale {
            return;
        }
        self.last_messages.insert(room.clone(), message);
        self.publish();
        if request_unread {
            self.link
                .send_message(OutgoingSocketMessage::GetUnreadMessagesCount {
                    chat_room_identifier: room,
                })
                .await;
        }
    }

    async fn apply_unread_count(&mut self, count: UnreadCount) {
        if !self.chat_rooms.contains_key(&count.chat_room_identifier) {
            self.lookup_room(&count.chat_room_identifier).await;
        }
        if !self.chat_rooms.contains_key(&count.chat_room_identifier) {
            debug!(room = %count.chat_room_identifier, "count for unknown room, dropping");
            return;
        }
        self.unread_counts
            .insert(count.chat_room_identifier, count.unread_count);
    }

    /// Lazily discovers a room created by the other party.
    async fn lookup_room(&mut self, room: &ChatRoomId) {
        match self.api.conversations(std::slice::from_ref(room)).await {
            Ok(rooms) => {
                for info in rooms {
                    self.chat_rooms
                        .insert(info.chat_room_identifier.clone(), info);
                }
            }
            Err(err) => warn!(%err, %room, "single room lookup failed"),
        }
    }

    /// Full rebuild: each room pairs with the contact owning it, rooms
    /// with no contact match are excluded, and contacts with no room
    /// are appended after all room-backed conversations, by name only.
    fn rebuild(&self) -> Vec<Conversation> {
        let mut unpaired = self.contacts.clone();
        let mut active = Vec::new();
        for (room_id, info) in &self.chat_rooms {
            let Some(other) = info
                .user_ids
                .iter()
                .find(|user_id| **user_id != self.user_id)
            else {
                continue;
            };
            let Some(contact) = unpaired.remove(other) else {
                continue;
            };
            active.push(Conversation {
                chat_room_identifier: Some(room_id.clone()),
                contact,
                recent_message: self.last_messages.get(room_id).cloned(),
                unread_count: self.unread_counts.get(room_id).copied(),
            });
        }
        active.sort_by(compare_conversations);

        let mut pending: Vec<Conversation> =
            unpaired.into_values().map(Conversation::for_contact).collect();
        pending.sort_by(|a, b| compare_names(&a.contact, &b.contact));
        active.extend(pending);
        active
    }

    fn publish(&self) {
        self.conversations_tx.send_replace(self.rebuild());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rest::RestError;
    use crate::session::manager::Command;
    use crate::session::SessionLink;
    use crate::ConversationAggregator;
    use async_trait::async_trait;
    use athelo_chat_protocol::SessionToken;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    struct FakeApi {
        rooms: Mutex<Vec<ChatRoomInfo>>,
        lookup_rooms: Mutex<HashMap<ChatRoomId, ChatRoomInfo>>,
        caregivers: Vec<Contact>,
        patients: Vec<Contact>,
        lookup_calls: AtomicUsize,
    }

    impl FakeApi {
        fn new(caregivers: Vec<Contact>, patients: Vec<Contact>) -> Self {
            Self {
                rooms: Mutex::new(Vec::new()),
                lookup_rooms: Mutex::new(HashMap::new()),
                caregivers,
                patients,
                lookup_calls: AtomicUsize::new(0),
            }
        }

        fn with_rooms(self, rooms: Vec<ChatRoomInfo>) -> Self {
            *self.rooms.lock().unwrap() = rooms;
            self
        }

        fn with_lookup(self, info: ChatRoomInfo) -> Self {
            self.lookup_rooms
                .lock()
                .unwrap()
                .insert(info.chat_room_identifier.clone(), info);
            self
        }

        fn set_rooms(&self, rooms: Vec<ChatRoomInfo>) {
            *self.rooms.lock().unwrap() = rooms;
        }
    }

    #[async_trait]
    impl ChatApi for FakeApi {
        async fn open_session(
            &self,
            _device_id: uuid::Uuid,
            _push_token: Option<&str>,
        ) -> Result<SessionToken, RestError> {
            Ok(SessionToken("unused".into()))
        }

        async fn close_session(&self, _token: &SessionToken) -> Result<(), RestError> {
            Ok(())
        }

        async fn conversations(
            &self,
            rooms: &[ChatRoomId],
        ) -> Result<Vec<ChatRoomInfo>, RestError> {
            if rooms.is_empty() {
                return Ok(self.rooms.lock().unwrap().clone());
            }
            self.lookup_calls.fetch_add(1, Ordering::SeqCst);
            let known = self.lookup_rooms.lock().unwrap();
            Ok(rooms
                .iter()
                .filter_map(|room| known.get(room).cloned())
                .collect())
        }

        async fn caregiver_contacts(&self) -> Result<Vec<Contact>, RestError> {
            Ok(self.caregivers.clone())
        }

        async fn patient_contacts(&self) -> Result<Vec<Contact>, RestError> {
            Ok(self.patients.clone())
        }
    }

    fn contact(id: i64, name: &str) -> Contact {
        Contact {
            user_id: UserId(id),
            display_name: name.to_string(),
            photo_url: None,
        }
    }

    fn room(id: &str, members: &[i64]) -> ChatRoomInfo {
        ChatRoomInfo {
            chat_room_identifier: ChatRoomId::new(id),
            user_ids: members.iter().copied().map(UserId).collect(),
        }
    }

    struct Harness {
        api: Arc<FakeApi>,
        aggregator: ConversationAggregator,
        socket_rx: mpsc::Receiver<Command>,
        incoming_tx: broadcast::Sender<IncomingSocketMessage>,
    }

    fn start(api: FakeApi) -> Harness {
        let api = Arc::new(api);
        let (socket_tx, socket_rx) = mpsc::channel(64);
        let (incoming_tx, _) = broadcast::channel(64);
        let link = SessionLink::new_detached(socket_tx, incoming_tx.clone());
        let aggregator = ConversationAggregator::start(UserId(100), api.clone(), link);
        Harness {
            api,
            aggregator,
            socket_rx,
            incoming_tx,
        }
    }

    fn last_message_event(room: &str, user_id: i64, message_id: i64) -> IncomingSocketMessage {
        IncomingSocketMessage::LastMessage {
            messages: vec![ChatMessage {
                chat_room_identifier: ChatRoomId::new(room),
                message_id,
                text: "hello".into(),
                user_id: Some(UserId(user_id)),
            }],
        }
    }

    async fn wait_for<F>(rx: &mut watch::Receiver<Vec<Conversation>>, predicate: F)
    where
        F: Fn(&[Conversation]) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if predicate(&rx.borrow()) {
                    return;
                }
                rx.changed().await.expect("conversation channel closed");
            }
        })
        .await
        .expect("timed out waiting for conversation list");
    }

    #[tokio::test]
    async fn refresh_pairs_rooms_with_contacts_and_primes_history() {
        let api = FakeApi::new(vec![contact(1, "Alice")], vec![contact(2, "Bob")])
            .with_rooms(vec![room("room1", &[100, 1])]);
        let mut harness = start(api);

        harness.aggregator.refresh().await;

        let mut conversations = harness.aggregator.conversations();
        wait_for(&mut conversations, |list| list.len() == 2).await;
        let list = conversations.borrow().clone();
        assert_eq!(
            list[0].chat_room_identifier,
            Some(ChatRoomId::new("room1"))
        );
        assert_eq!(list[0].contact.display_name, "Alice");
        assert_eq!(list[1].chat_room_identifier, None);
        assert_eq!(list[1].contact.display_name, "Bob");

        let primed = harness.socket_rx.recv().await.expect("no socket request");
        match primed {
            Command::Send(OutgoingSocketMessage::GetHistory {
                chat_room_identifier,
                timestamp,
                limit,
            }) => {
                assert_eq!(chat_room_identifier, ChatRoomId::new("room1"));
                assert_eq!(limit, 1);
                assert!(timestamp > now_micros() - 5_000_000);
            }
            _ => panic!("expected a GetHistory request"),
        }
    }

    #[tokio::test]
    async fn unknown_room_is_discovered_via_rest_lookup() {
        // Contacts Alice(1) and Bob(2), no rooms yet. A message for the
        // not-yet-known "room42" owned by Bob must trigger a lookup and
        // promote Bob ahead of Alice.
        let api = FakeApi::new(vec![contact(1, "Alice"), contact(2, "Bob")], vec![])
            .with_lookup(room("room42", &[100, 2]));
        let mut harness = start(api);

        harness.aggregator.refresh().await;
        harness
            .incoming_tx
            .send(last_message_event("room42", 2, 7_000))
            .unwrap();

        let mut conversations = harness.aggregator.conversations();
        wait_for(&mut conversations, |list| {
            list.first()
                .map(|c| c.chat_room_identifier == Some(ChatRoomId::new("room42")))
                .unwrap_or(false)
        })
        .await;

        let list = conversations.borrow().clone();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].contact.display_name, "Bob");
        assert_eq!(
            list[0].recent_message.as_ref().map(|m| m.message_id),
            Some(7_000)
        );
        assert_eq!(list[1].contact.display_name, "Alice");
        assert_eq!(list[1].chat_room_identifier, None);

        // A new message implies the unread count may have changed.
        let followup = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match harness.socket_rx.recv().await.expect("socket closed") {
                    Command::Send(OutgoingSocketMessage::GetUnreadMessagesCount {
                        chat_room_identifier,
                    }) => return chat_room_identifier,
                    _ => continue,
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(followup, ChatRoomId::new("room42"));
    }

    #[tokio::test]
    async fn rooms_without_contacts_are_excluded() {
        let api = FakeApi::new(vec![contact(1, "Alice")], vec![])
            .with_rooms(vec![room("room1", &[100, 1]), room("ghost", &[100, 99])]);
        let harness = start(api);

        harness.aggregator.refresh().await;

        let mut conversations = harness.aggregator.conversations();
        wait_for(&mut conversations, |list| list.len() == 1).await;
        assert_eq!(
            conversations.borrow()[0].chat_room_identifier,
            Some(ChatRoomId::new("room1"))
        );
    }

    #[tokio::test]
    async fn contacts_without_rooms_sort_by_name_after_active_rooms() {
        let api = FakeApi::new(
            vec![contact(1, "alice"), contact(2, "Bob"), contact(3, "Carol")],
            vec![],
        )
        .with_rooms(vec![room("room3", &[100, 3])]);
        let harness = start(api);

        harness.aggregator.refresh().await;
        harness
            .incoming_tx
            .send(last_message_event("room3", 3, 9_000))
            .unwrap();

        let mut conversations = harness.aggregator.conversations();
        wait_for(&mut conversations, |list| {
            list.len() == 3 && list[0].recent_message.is_some()
        })
        .await;

        let names: Vec<String> = conversations
            .borrow()
            .iter()
            .map(|c| c.contact.display_name.clone())
            .collect();
        // Carol has the room and the activity; alice and Bob trail in
        // case-insensitive name order.
        assert_eq!(names, vec!["Carol", "alice", "Bob"]);
    }

    #[tokio::test]
    async fn unread_count_updates_are_merged() {
        let api = FakeApi::new(vec![contact(1, "Alice")], vec![])
            .with_rooms(vec![room("room1", &[100, 1])]);
        let harness = start(api);

        harness.aggregator.refresh().await;
        harness
            .incoming_tx
            .send(IncomingSocketMessage::UnreadMessages {
                counts: vec![UnreadCount {
                    chat_room_identifier: ChatRoomId::new("room1"),
                    unread_count: 4,
                }],
            })
            .unwrap();

        let mut conversations = harness.aggregator.conversations();
        wait_for(&mut conversations, |list| {
            list.first().map(|c| c.unread_count == Some(4)).unwrap_or(false)
        })
        .await;
    }

    #[tokio::test]
    async fn refresh_prunes_caches_for_rooms_that_disappeared() {
        let api = FakeApi::new(vec![contact(1, "Alice")], vec![])
            .with_rooms(vec![room("room1", &[100, 1])]);
        let harness = start(api);

        harness.aggregator.refresh().await;
        harness
            .incoming_tx
            .send(last_message_event("room1", 1, 5_000))
            .unwrap();
        harness
            .incoming_tx
            .send(IncomingSocketMessage::UnreadMessages {
                counts: vec![UnreadCount {
                    chat_room_identifier: ChatRoomId::new("room1"),
                    unread_count: 2,
                }],
            })
            .unwrap();
        let mut conversations = harness.aggregator.conversations();
        wait_for(&mut conversations, |list| {
            list.first()
                .map(|c| c.recent_message.is_some() && c.unread_count == Some(2))
                .unwrap_or(false)
        })
        .await;

        // The room vanishes server-side, then comes back.
        harness.api.set_rooms(Vec::new());
        harness.aggregator.refresh().await;
        harness.api.set_rooms(vec![room("room1", &[100, 1])]);
        harness.aggregator.refresh().await;

        wait_for(&mut conversations, |list| {
            list.first()
                .map(|c| c.chat_room_identifier == Some(ChatRoomId::new("room1")))
                .unwrap_or(false)
        })
        .await;
        let first = conversations.borrow()[0].clone();
        assert!(first.recent_message.is_none());
        assert!(first.unread_count.is_none());
    }

    #[tokio::test]
    async fn counts_for_unknown_rooms_are_dropped() {
        let api = FakeApi::new(vec![contact(1, "Alice")], vec![]);
        let harness = start(api);
        harness.aggregator.refresh().await;

        harness
            .incoming_tx
            .send(IncomingSocketMessage::UnreadMessages {
                counts: vec![UnreadCount {
                    chat_room_identifier: ChatRoomId::new("ghost"),
                    unread_count: 5,
                }],
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Even once the room materializes, the orphaned count from
        // before must not resurface.
        harness.api.set_rooms(vec![room("ghost", &[100, 1])]);
        harness.aggregator.refresh().await;

        let mut conversations = harness.aggregator.conversations();
        wait_for(&mut conversations, |list| {
            list.first()
                .map(|c| c.chat_room_identifier.is_some())
                .unwrap_or(false)
        })
        .await;
        assert_eq!(conversations.borrow()[0].unread_count, None);
    }

    #[tokio::test]
    async fn stale_history_primes_do_not_regress_the_recent_message() {
        let api = FakeApi::new(vec![contact(1, "Alice")], vec![])
            .with_rooms(vec![room("room1", &[100, 1])]);
        let harness = start(api);
        harness.aggregator.refresh().await;

        harness
            .incoming_tx
            .send(last_message_event("room1", 1, 2_000))
            .unwrap();
        let mut conversations = harness.aggregator.conversations();
        wait_for(&mut conversations, |list| {
            list.first()
                .and_then(|c| c.recent_message.as_ref())
                .map(|m| m.message_id == 2_000)
                .unwrap_or(false)
        })
        .await;

        // A delayed prime response carrying an older message.
        harness
            .incoming_tx
            .send(IncomingSocketMessage::History {
                chat_room_identifier: Some(ChatRoomId::new("room1")),
                messages: vec![ChatMessage {
                    chat_room_identifier: ChatRoomId::new("room1"),
                    message_id: 1_000,
                    text: "old".into(),
                    user_id: Some(UserId(1)),
                }],
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(
            conversations.borrow()[0]
                .recent_message
                .as_ref()
                .map(|m| m.message_id),
            Some(2_000)
        );
    }

    #[tokio::test]
    async fn contact_snapshot_replaces_the_pool() {
        let api = FakeApi::new(vec![contact(1, "Alice")], vec![]);
        let harness = start(api);

        harness.aggregator.refresh().await;
        let mut conversations = harness.aggregator.conversations();
        wait_for(&mut conversations, |list| list.len() == 1).await;

        harness
            .aggregator
            .contacts_updated(vec![contact(2, "Bob"), contact(3, "Carol")])
            .await;
        wait_for(&mut conversations, |list| {
            list.len() == 2 && list[0].contact.display_name == "Bob"
        })
        .await;
    }
}
