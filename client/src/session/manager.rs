//! Session manager: owns the single authenticated chat socket.
//!
//! A cloneable handle feeds commands over a channel to a runtime task
//! that owns the socket and the state machine, so every transition is
//! serialized through one consumer.

use super::socket::{ChatSocket, SocketConnector};
use super::{ConnectionState, ReconnectPolicy, SessionError, SessionState};
use crate::config::AppConfig;
use crate::rest::ChatApi;
use crate::storage::{CredentialStore, StorageError};
use athelo_chat_protocol::socket::{IncomingSocketMessage, OutgoingSocketMessage};
use athelo_chat_protocol::SessionToken;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub(crate) enum Command {
    Open,
    Send(OutgoingSocketMessage),
    Close {
        purge_token: bool,
        done: oneshot::Sender<()>,
    },
}

/// Handle to the session runtime. At most one live socket exists per
/// manager; all operations are idempotent and cheap to call again.
pub struct SessionManager {
    command_tx: mpsc::Sender<Command>,
    incoming_tx: broadcast::Sender<IncomingSocketMessage>,
    error_tx: broadcast::Sender<SessionError>,
    state_rx: watch::Receiver<ConnectionState>,
    runtime_task: tokio::task::JoinHandle<()>,
}

impl SessionManager {
    pub fn start(
        config: &AppConfig,
        api: Arc<dyn ChatApi>,
        store: CredentialStore,
        connector: Arc<dyn SocketConnector>,
    ) -> Result<Self, StorageError> {
        let device_id = store.device_id()?;
        let (command_tx, command_rx) = mpsc::channel(64);
        let (incoming_tx, _) = broadcast::channel(256);
        let (error_tx, _) = broadcast::channel(64);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);

        let runtime = SessionRuntime {
            socket_url: config.socket_url.clone(),
            device_id,
            push_token: config.push_token.clone(),
            has_user_credentials: config.access_token.is_some(),
            api,
            store,
            connector,
            policy: config.reconnect.clone(),
            command_rx,
            incoming_tx: incoming_tx.clone(),
            error_tx: error_tx.clone(),
            state_tx,
            state: SessionState::Idle,
            socket: None,
            attempts: 0,
            retry_at: None,
        };
        let runtime_task = tokio::spawn(runtime.run());

        Ok(Self {
            command_tx,
            incoming_tx,
            error_tx,
            state_rx,
            runtime_task,
        })
    }

    /// Idempotent entry point. A no-op without user credentials; with a
    /// cached chat token the REST fetch is skipped entirely.
    pub async fn open_session_if_necessary(&self) {
        let _ = self.command_tx.send(Command::Open).await;
    }

    /// Fire-and-forget send. Silently dropped unless connected.
    pub async fn send_message(&self, message: OutgoingSocketMessage) {
        let _ = self.command_tx.send(Command::Send(message)).await;
    }

    /// Closes the socket if open. When purging, best-effort informs the
    /// backend the token is retired and clears the cached token.
    pub async fn close_existing_session(&self, purge_token: bool) {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .command_tx
            .send(Command::Close {
                purge_token,
                done: done_tx,
            })
            .await
            .is_ok()
        {
            let _ = done_rx.await;
        }
    }

    pub fn subscribe_incoming(&self) -> broadcast::Receiver<IncomingSocketMessage> {
        self.incoming_tx.subscribe()
    }

    pub fn subscribe_errors(&self) -> broadcast::Receiver<SessionError> {
        self.error_tx.subscribe()
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Cloneable sender half for consumers that only publish socket
    /// requests and read the incoming stream.
    pub fn link(&self) -> SessionLink {
        SessionLink {
            command_tx: self.command_tx.clone(),
            incoming_tx: self.incoming_tx.clone(),
        }
    }

    /// Stops the runtime after closing any open socket.
    pub async fn shutdown(self) {
        self.close_existing_session(false).await;
        drop(self.command_tx);
        let _ = self.runtime_task.await;
    }
}

/// Sender half of a [`SessionManager`].
#[derive(Clone)]
pub struct SessionLink {
    command_tx: mpsc::Sender<Command>,
    incoming_tx: broadcast::Sender<IncomingSocketMessage>,
}

impl SessionLink {
    pub async fn send_message(&self, message: OutgoingSocketMessage) {
        let _ = self.command_tx.send(Command::Send(message)).await;
    }

    pub fn subscribe_incoming(&self) -> broadcast::Receiver<IncomingSocketMessage> {
        self.incoming_tx.subscribe()
    }

    #[cfg(test)]
    pub(crate) fn new_detached(
        command_tx: mpsc::Sender<Command>,
        incoming_tx: broadcast::Sender<IncomingSocketMessage>,
    ) -> Self {
        Self {
            command_tx,
            incoming_tx,
        }
    }
}

enum Wake {
    Command(Option<Command>),
    Frame(Option<Result<String, SessionError>>),
    Retry,
}

struct SessionRuntime {
    socket_url: String,
    device_id: uuid::Uuid,
    push_token: Option<String>,
    has_user_credentials: bool,
    api: Arc<dyn ChatApi>,
    store: CredentialStore,
    connector: Arc<dyn SocketConnector>,
    policy: ReconnectPolicy,
    command_rx: mpsc::Receiver<Command>,
    incoming_tx: broadcast::Sender<IncomingSocketMessage>,
    error_tx: broadcast::Sender<SessionError>,
    state_tx: watch::Sender<ConnectionState>,
    state: SessionState,
    socket: Option<Box<dyn ChatSocket>>,
    attempts: u32,
    retry_at: Option<Instant>,
}

impl SessionRuntime {
    async fn run(mut self) {
        loop {
            let retry_at = self.retry_at;
            let wake = if let Some(socket) = self.socket.as_mut() {
                tokio::select! {
                    cmd = self.command_rx.recv() => Wake::Command(cmd),
                    frame = socket.next_frame() => Wake::Frame(frame),
                }
            } else {
                tokio::select! {
                    cmd = self.command_rx.recv() => Wake::Command(cmd),
                    _ = retry_sleep(retry_at) => Wake::Retry,
                }
            };

            match wake {
                Wake::Command(Some(command)) => self.handle_command(command).await,
                Wake::Command(None) => break,
                Wake::Frame(frame) => self.handle_frame(frame).await,
                Wake::Retry => {
                    self.retry_at = None;
                    self.connect_cycle().await;
                }
            }
        }

        if let Some(mut socket) = self.socket.take() {
            socket.close().await;
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Open => self.open_if_necessary().await,
            Command::Send(message) => self.send_message(message).await,
            Command::Close { purge_token, done } => {
                self.close_session(purge_token).await;
                let _ = done.send(());
            }
        }
    }

    async fn open_if_necessary(&mut self) {
        if !self.has_user_credentials {
            debug!("no user credentials, leaving chat session closed");
            return;
        }
        if self.state != SessionState::Idle {
            debug!(state = ?self.state, "session already opening or open");
            return;
        }
        self.attempts = 0;
        self.connect_cycle().await;
    }

    /// One connection attempt: cached token if present, otherwise a
    /// fresh one over REST, then the socket handshake.
    async fn connect_cycle(&mut self) {
        let cached = match self.store.load_token() {
            Ok(token) => token,
            Err(err) => {
                warn!(%err, "credential store read failed");
                None
            }
        };
        let token = match cached {
            Some(token) => token,
            None => match self.retrieve_token().await {
                Some(token) => token,
                None => return,
            },
        };
        self.open_socket(token).await;
    }

    async fn retrieve_token(&mut self) -> Option<SessionToken> {
        self.set_state(SessionState::RetrievingToken);
        match self
            .api
            .open_session(self.device_id, self.push_token.as_deref())
            .await
        {
            Ok(token) => {
                if let Err(err) = self.store.store_token(&token) {
                    warn!(%err, "failed to persist session token");
                }
                self.set_state(SessionState::TokenRetrieved);
                Some(token)
            }
            Err(err) => {
                // Token failures do not loop; the caller re-invokes
                // open_session_if_necessary when it wants another try.
                self.publish_error(SessionError::Token(err.to_string()));
                self.retry_at = None;
                self.set_state(SessionState::Idle);
                None
            }
        }
    }

    async fn open_socket(&mut self, token: SessionToken) {
        self.set_state(SessionState::CreatingSession);
        match self.connector.connect(&self.socket_url, &token).await {
            Ok(mut socket) => {
                // The token may have been purged while the handshake ran.
                match self.store.load_token() {
                    Ok(Some(_)) => {
                        self.socket = Some(socket);
                        self.attempts = 0;
                        self.set_state(SessionState::Connected);
                        info!("chat session established");
                    }
                    _ => {
                        socket.close().await;
                        self.set_state(SessionState::Idle);
                    }
                }
            }
            Err(err) => {
                self.publish_error(err);
                self.schedule_reconnect();
            }
        }
    }

    async fn handle_frame(&mut self, frame: Option<Result<String, SessionError>>) {
        match frame {
            Some(Ok(text)) => match IncomingSocketMessage::decode(&text) {
                Ok(message) => {
                    let _ = self.incoming_tx.send(message);
                }
                // A malformed frame must not break the connection.
                Err(err) => warn!(%err, "dropping undecodable frame"),
            },
            Some(Err(err)) => {
                self.publish_error(err);
                self.socket_down().await;
            }
            None => {
                debug!("socket closed by peer");
                self.socket_down().await;
            }
        }
    }

    async fn socket_down(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            socket.close().await;
        }
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        // The failing socket may mean the server invalidated the
        // token; drop it so the retry authenticates from scratch.
        if let Err(err) = self.store.clear_token() {
            warn!(%err, "failed to clear session token");
        }
        self.attempts += 1;
        if self.attempts > self.policy.max_attempts {
            let attempts = self.attempts - 1;
            warn!(attempts, "reconnect attempts exhausted, giving up");
            self.publish_error(SessionError::ReconnectExhausted { attempts });
            self.attempts = 0;
            self.retry_at = None;
            self.set_state(SessionState::Idle);
            return;
        }
        let delay = self.policy.delay_for(self.attempts);
        debug!(attempt = self.attempts, ?delay, "scheduling reconnect");
        self.retry_at = Some(Instant::now() + delay);
        self.set_state(SessionState::CreatingSession);
    }

    async fn send_message(&mut self, message: OutgoingSocketMessage) {
        if self.state != SessionState::Connected {
            debug!(state = ?self.state, "dropping send while not connected");
            return;
        }
        let text = match message.encode() {
            Ok(text) => text,
            Err(err) => {
                self.publish_error(SessionError::Send(err.to_string()));
                return;
            }
        };
        let result = match self.socket.as_mut() {
            Some(socket) => socket.send_text(text).await,
            None => return,
        };
        if let Err(err) = result {
            // Fire-and-forget: surfaced for diagnostics, no state change.
            self.publish_error(err);
        }
    }

    async fn close_session(&mut self, purge_token: bool) {
        self.set_state(SessionState::Disconnecting);
        self.retry_at = None;
        self.attempts = 0;
        if purge_token {
            if let Ok(Some(token)) = self.store.load_token() {
                if let Err(err) = self.api.close_session(&token).await {
                    warn!(%err, "best-effort close-session call failed");
                }
            }
            if let Err(err) = self.store.clear_token() {
                warn!(%err, "failed to clear session token");
            }
        }
        if let Some(mut socket) = self.socket.take() {
            socket.close().await;
        }
        self.set_state(SessionState::Idle);
    }

    fn set_state(&mut self, state: SessionState) {
        self.state = state;
        self.state_tx.send_replace(state.connection_state());
    }

    fn publish_error(&self, error: SessionError) {
        let _ = self.error_tx.send(error);
    }
}

async fn retry_sleep(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}
