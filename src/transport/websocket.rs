//! WebSocket transport for the persistent relay channel
//!
//! Frames travel as binary WebSocket messages. The session token is
//! presented once, as a header on the upgrade request.

use super::{Connector, Transport, TransportError, TransportResult, SESSION_HEADER};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::debug;

/// WebSocket transport connected to the relay
pub struct WebSocketTransport {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    connected: bool,
}

impl WebSocketTransport {
    /// Connect to the relay endpoint with a session token
    pub async fn connect(endpoint: &str, token: &str) -> TransportResult<Self> {
        let mut request = endpoint
            .into_client_request()
            .map_err(|e| TransportError::UnknownEndpoint(e.to_string()))?;

        let credential = HeaderValue::from_str(token)
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        request.headers_mut().insert(SESSION_HEADER, credential);

        let (ws, _) = connect_async(request)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        debug!(endpoint, "websocket connected");

        Ok(WebSocketTransport {
            ws,
            connected: true,
        })
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, data: &[u8]) -> TransportResult<()> {
        if !self.connected {
            return Err(TransportError::Disconnected);
        }

        self.ws
            .send(Message::Binary(data.to_vec()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn receive(&mut self) -> TransportResult<Vec<u8>> {
        if !self.connected {
            return Err(TransportError::Disconnected);
        }

        loop {
            match self.ws.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(data),
                Some(Ok(Message::Text(text))) => return Ok(text.into_bytes()),
                Some(Ok(Message::Close(_))) | None => {
                    self.connected = false;
                    return Err(TransportError::Disconnected);
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = self.ws.send(Message::Pong(data)).await;
                }
                Some(Err(e)) => {
                    self.connected = false;
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                _ => continue,
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.connected = false;
        self.ws
            .close(None)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}

/// Connector producing [`WebSocketTransport`]s
#[derive(Clone, Debug, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, endpoint: &str, token: &str) -> TransportResult<Box<dyn Transport>> {
        let transport = WebSocketTransport::connect(endpoint, token).await?;
        Ok(Box::new(transport))
    }
}
