//! Headless chat client: connects the session, keeps the conversation
//! list current, and prints it whenever it changes.

use anyhow::Context;
use athelo_chat_client::{
    init_tracing, AppConfig, ConversationAggregator, CredentialStore, HttpChatApi, SessionManager,
    TungsteniteConnector,
};
use athelo_chat_protocol::UserId;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = AppConfig::from_env()?;
    let store = CredentialStore::open(&config.storage_path)
        .context("opening the credential store")?;
    let api = Arc::new(HttpChatApi::new(
        config.api_base_url.clone(),
        config.access_token.clone(),
    )?);

    let manager = SessionManager::start(&config, api.clone(), store, Arc::new(TungsteniteConnector))?;
    let aggregator =
        ConversationAggregator::start(UserId(config.user_id), api, manager.link());

    manager.open_session_if_necessary().await;
    aggregator.refresh().await;

    let mut conversations = aggregator.conversations();
    let mut state = manager.connection_state();
    let mut errors = manager.subscribe_errors();

    info!("chat client running, ctrl-c to exit");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = conversations.changed() => {
                if changed.is_err() {
                    break;
                }
                let list = conversations.borrow_and_update().clone();
                info!(count = list.len(), "conversation list updated");
                for conversation in &list {
                    info!(
                        room = ?conversation.chat_room_identifier,
                        contact = %conversation.contact.display_name,
                        unread = ?conversation.unread_count,
                        last = conversation
                            .recent_message
                            .as_ref()
                            .map(|m| m.text.as_str())
                            .unwrap_or(""),
                    );
                }
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                info!(state = ?*state.borrow_and_update(), "connection state");
            }
            err = errors.recv() => {
                if let Ok(err) = err {
                    tracing::warn!(%err, "session error");
                }
            }
        }
    }

    manager.shutdown().await;
    Ok(())
}
