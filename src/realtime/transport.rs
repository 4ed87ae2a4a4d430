//! Socket transport seam.
//!
//! The manager talks to a trait so tests can run against an in-memory
//! mock; production uses tokio-tungstenite.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use super::SyncError;

/// Dials websocket connections.
#[async_trait]
pub trait SocketTransport: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn SocketConnection>, SyncError>;
}

/// One established connection.
#[async_trait]
pub trait SocketConnection: Send {
    async fn send_text(&mut self, text: String) -> Result<(), SyncError>;

    /// Next text frame. `None` means the peer closed the connection.
    async fn next_text(&mut self) -> Option<Result<String, SyncError>>;
}

/// Production transport over tokio-tungstenite.
pub struct TungsteniteTransport;

#[async_trait]
impl SocketTransport for TungsteniteTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn SocketConnection>, SyncError> {
        let (stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| SyncError::Connect(e.to_string()))?;
        Ok(Box::new(TungsteniteConnection { stream }))
    }
}

struct TungsteniteConnection {
    stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
}

#[async_trait]
impl SocketConnection for TungsteniteConnection {
    async fn send_text(&mut self, text: String) -> Result<(), SyncError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| SyncError::Socket(e.to_string()))
    }

    async fn next_text(&mut self) -> Option<Result<String, SyncError>> {
        loop {
            match self.stream.next().await {
                None => return None,
                Some(Ok(Message::Text(text))) => return Some(Ok(text)),
                Some(Ok(Message::Close(_))) => return None,
                // Control and binary frames are not part of the protocol.
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Some(Err(SyncError::Socket(e.to_string()))),
            }
        }
    }
}
