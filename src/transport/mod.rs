//! Transport layer abstraction
//!
//! This module provides the persistent duplex channel to the relay:
//! - `Transport`: moves opaque frames between the device and the relay
//! - `Connector`: opens a transport against an endpoint with a session token
//! - `ConnectionManager`: the connection state machine with mute and reconnect
//! - In-memory transports for testing, WebSocket transports for real use
//!
//! # Design
//!
//! The transport layer only moves bytes. Frame meaning lives in
//! [`crate::event`], and whether a connection should exist at all is decided
//! by the session layer.

use async_trait::async_trait;
use thiserror::Error;

pub mod connection;
pub mod websocket;

pub use connection::{CloseNotice, ConnectionManager, ConnectionState};
pub use websocket::{WebSocketConnector, WebSocketTransport};

/// Header carrying the session token on every authenticated request
pub const SESSION_HEADER: &str = "x-session-token";

/// Transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// A frame was sent while the connection was not open
    #[error("Invalid connection state")]
    InvalidConnectionState,

    /// No endpoint is configured for this transport
    #[error("Unknown endpoint: {0}")]
    UnknownEndpoint(String),

    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection closed
    #[error("Connection closed")]
    Disconnected,

    /// Send failed
    #[error("Failed to send: {0}")]
    SendFailed(String),

    /// Receive failed
    #[error("Failed to receive: {0}")]
    ReceiveFailed(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Abstract transport trait
///
/// All transports must implement this trait. The transport is responsible
/// only for moving frames; encoding is handled at a higher layer.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a frame to the relay
    async fn send(&mut self, data: &[u8]) -> TransportResult<()>;

    /// Receive a frame from the relay
    ///
    /// Waits until a frame is available or the connection is closed.
    async fn receive(&mut self) -> TransportResult<Vec<u8>>;

    /// Check if the transport is connected
    fn is_connected(&self) -> bool;

    /// Close the transport
    async fn close(&mut self) -> TransportResult<()>;
}

/// Opens transports against an endpoint
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to `endpoint`, presenting `token` as the session credential
    async fn connect(&self, endpoint: &str, token: &str) -> TransportResult<Box<dyn Transport>>;
}

/// In-memory transport for testing
///
/// Uses channels to simulate a connection between two endpoints.
pub mod memory {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    /// Create a pair of connected in-memory transports
    pub fn create_pair() -> (MemoryTransport, MemoryTransport) {
        let (tx1, rx1) = mpsc::channel(100);
        let (tx2, rx2) = mpsc::channel(100);

        let transport1 = MemoryTransport {
            tx: tx1,
            rx: rx2,
            connected: true,
        };

        let transport2 = MemoryTransport {
            tx: tx2,
            rx: rx1,
            connected: true,
        };

        (transport1, transport2)
    }

    /// In-memory transport endpoint
    pub struct MemoryTransport {
        tx: mpsc::Sender<Vec<u8>>,
        rx: mpsc::Receiver<Vec<u8>>,
        connected: bool,
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn send(&mut self, data: &[u8]) -> TransportResult<()> {
            if !self.connected {
                return Err(TransportError::Disconnected);
            }

            self.tx
                .send(data.to_vec())
                .await
                .map_err(|_| TransportError::SendFailed("Channel closed".to_string()))
        }

        async fn receive(&mut self) -> TransportResult<Vec<u8>> {
            if !self.connected {
                return Err(TransportError::Disconnected);
            }

            self.rx.recv().await.ok_or(TransportError::Disconnected)
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        async fn close(&mut self) -> TransportResult<()> {
            self.connected = false;
            self.rx.close();
            Ok(())
        }
    }

    /// The relay side of an accepted in-memory connection
    pub struct MemoryPeer {
        /// Endpoint the client dialed
        pub endpoint: String,
        /// Session token the client presented
        pub token: String,
        /// Relay end of the channel
        pub transport: MemoryTransport,
    }

    /// Connector handing the relay side of every connection to a test
    pub struct MemoryConnector {
        accepted: mpsc::UnboundedSender<MemoryPeer>,
        attempts: AtomicUsize,
        refuse: AtomicBool,
    }

    impl MemoryConnector {
        /// Create a connector and the receiver of accepted peers
        pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryPeer>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let connector = MemoryConnector {
                accepted: tx,
                attempts: AtomicUsize::new(0),
                refuse: AtomicBool::new(false),
            };
            (connector, rx)
        }

        /// Number of connection attempts so far, including refused ones
        pub fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }

        /// Make subsequent attempts fail
        pub fn set_refuse(&self, refuse: bool) {
            self.refuse.store(refuse, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Connector for MemoryConnector {
        async fn connect(
            &self,
            endpoint: &str,
            token: &str,
        ) -> TransportResult<Box<dyn Transport>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.refuse.load(Ordering::SeqCst) {
                return Err(TransportError::ConnectionFailed("refused".to_string()));
            }

            let (client, relay) = create_pair();
            self.accepted
                .send(MemoryPeer {
                    endpoint: endpoint.to_string(),
                    token: token.to_string(),
                    transport: relay,
                })
                .map_err(|_| TransportError::ConnectionFailed("relay gone".to_string()))?;

            Ok(Box::new(client))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_transport() {
        let (mut device, mut relay) = memory::create_pair();

        device.send(b"frame one").await.unwrap();
        assert_eq!(relay.receive().await.unwrap(), b"frame one");

        relay.send(b"frame two").await.unwrap();
        assert_eq!(device.receive().await.unwrap(), b"frame two");
    }

    #[tokio::test]
    async fn test_memory_transport_close() {
        let (mut device, _relay) = memory::create_pair();

        device.close().await.unwrap();
        assert!(!device.is_connected());
        assert_eq!(device.send(b"test").await, Err(TransportError::Disconnected));
    }

    #[tokio::test]
    async fn test_memory_transport_peer_drop() {
        let (mut device, relay) = memory::create_pair();
        drop(relay);

        assert_eq!(device.receive().await, Err(TransportError::Disconnected));
    }

    #[tokio::test]
    async fn test_memory_connector_hands_out_peer() {
        let (connector, mut peers) = memory::MemoryConnector::new();

        let mut device = connector.connect("mem://relay", "tok").await.unwrap();
        let mut peer = peers.recv().await.unwrap();
        assert_eq!(peer.endpoint, "mem://relay");
        assert_eq!(peer.token, "tok");

        device.send(b"hi").await.unwrap();
        assert_eq!(peer.transport.receive().await.unwrap(), b"hi");
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test]
    async fn test_memory_connector_refuse() {
        let (connector, _peers) = memory::MemoryConnector::new();
        connector.set_refuse(true);

        assert!(matches!(
            connector.connect("mem://relay", "tok").await,
            Err(TransportError::ConnectionFailed(_))
        ));
        assert_eq!(connector.attempts(), 1);
    }
}
