//! Socket connector seam and the tungstenite-backed implementation.

use super::SessionError;
use async_trait::async_trait;
use athelo_chat_protocol::SessionToken;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Header carrying the session token on the upgrade request.
pub(crate) const TOKEN_HEADER: &str = "X-TOKEN";

/// One live socket connection. `next_frame` re-arms after every frame;
/// `None` means the peer closed the stream.
#[async_trait]
pub trait ChatSocket: Send {
    async fn send_text(&mut self, text: String) -> Result<(), SessionError>;
    async fn next_frame(&mut self) -> Option<Result<String, SessionError>>;
    async fn close(&mut self);
}

/// Opens authenticated sockets. Injected so tests can script
/// transport behavior.
#[async_trait]
pub trait SocketConnector: Send + Sync {
    async fn connect(
        &self,
        url: &str,
        token: &SessionToken,
    ) -> Result<Box<dyn ChatSocket>, SessionError>;
}

pub struct TungsteniteConnector;

#[async_trait]
impl SocketConnector for TungsteniteConnector {
    async fn connect(
        &self,
        url: &str,
        token: &SessionToken,
    ) -> Result<Box<dyn ChatSocket>, SessionError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| SessionError::Transport(e.to_string()))?;
        let value = token
            .as_str()
            .parse()
            .map_err(|_| SessionError::Transport("token is not a valid header value".into()))?;
        request.headers_mut().insert(TOKEN_HEADER, value);

        let (stream, _response) = connect_async(request)
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))?;
        Ok(Box::new(TungsteniteSocket { stream }))
    }
}

struct TungsteniteSocket {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl ChatSocket for TungsteniteSocket {
    async fn send_text(&mut self, text: String) -> Result<(), SessionError> {
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| SessionError::Send(e.to_string()))
    }

    async fn next_frame(&mut self) -> Option<Result<String, SessionError>> {
        while let Some(frame) = self.stream.next().await {
            match frame {
                Ok(Message::Text(text)) => return Some(Ok(text.to_string())),
                Ok(Message::Close(_)) => return None,
                // Ping/pong are handled by tungstenite; binary frames
                // are not part of the chat protocol.
                Ok(_) => continue,
                Err(e) => return Some(Err(SessionError::Transport(e.to_string()))),
            }
        }
        None
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}
