//! Conversation aggregation: merges REST snapshots with live socket
//! events into one consistently sorted conversation list.

mod runtime;

use crate::rest::ChatApi;
use crate::session::SessionLink;
use athelo_chat_protocol::conversation::{Contact, Conversation};
use athelo_chat_protocol::UserId;
use runtime::AggregatorRuntime;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

pub(crate) enum AggregatorCommand {
    Refresh { done: Option<oneshot::Sender<()>> },
    ContactsUpdated(Vec<Contact>),
}

/// Handle to the aggregator runtime. The backing maps stay inside the
/// runtime task; consumers only ever observe the sorted list.
#[derive(Clone)]
pub struct ConversationAggregator {
    command_tx: mpsc::Sender<AggregatorCommand>,
    conversations_rx: watch::Receiver<Vec<Conversation>>,
}

impl ConversationAggregator {
    pub fn start(user_id: UserId, api: Arc<dyn ChatApi>, link: SessionLink) -> Self {
        let (command_tx, command_rx) = mpsc::channel(64);
        let (conversations_tx, conversations_rx) = watch::channel(Vec::new());
        let incoming_rx = link.subscribe_incoming();
        let runtime = AggregatorRuntime::new(
            user_id,
            api,
            link,
            command_rx,
            incoming_rx,
            conversations_tx,
        );
        tokio::spawn(runtime.run());
        Self {
            command_tx,
            conversations_rx,
        }
    }

    /// Full rebuild: re-fetches rooms and both contact lists, then
    /// primes the most-recent-message caches over the socket. Resolves
    /// once the rebuilt list has been published.
    pub async fn refresh(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .command_tx
            .send(AggregatorCommand::Refresh {
                done: Some(done_tx),
            })
            .await
            .is_ok()
        {
            let _ = done_rx.await;
        }
    }

    /// Replaces the contact pool with a fresh identity-cache snapshot.
    pub async fn contacts_updated(&self, contacts: Vec<Contact>) {
        let _ = self
            .command_tx
            .send(AggregatorCommand::ContactsUpdated(contacts))
            .await;
    }

    /// The sorted conversation list. Updated on every merge.
    pub fn conversations(&self) -> watch::Receiver<Vec<Conversation>> {
        self.conversations_rx.clone()
    }
}
