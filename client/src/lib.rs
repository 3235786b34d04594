pub mod aggregator;
pub mod config;
pub mod rest;
pub mod session;
pub mod storage;

pub use aggregator::ConversationAggregator;
pub use config::AppConfig;
pub use rest::{ChatApi, ChatRoomInfo, HttpChatApi};
pub use session::{
    ConnectionState, ReconnectPolicy, SessionError, SessionLink, SessionManager,
    TungsteniteConnector,
};
pub use storage::CredentialStore;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
