//! # Tether
//!
//! Client-side session and device-linking engine for a decentralized
//! identity network.
//!
//! ## Features
//!
//! - **Session lifecycle**: challenge hash, personal signature, token
//! - **Persistent relay channel** with mute/unmute and timed reconnect
//! - **Typed events** over a compact binary envelope
//! - **Secure device linking**: an authenticated device vouches for a new
//!   one through an out-of-band link plus a relayed signed challenge
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tether::{Config, Device, HttpBackend, MemoryStore, Sdk, SdkOptions, WebSocketConnector};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let sdk = Sdk::new(SdkOptions {
//!     backend: Arc::new(HttpBackend::new()?),
//!     connector: Arc::new(WebSocketConnector),
//!     store: Arc::new(MemoryStore::new()),
//! });
//!
//! let mut config = Config::new("mainnet");
//! config.api_url = Some("https://api.example.org".to_string());
//! sdk.configure(Some(config));
//!
//! // With auto auth, setting a device is enough to get a session
//! sdk.set_device(Some(Arc::new(Device::generate())));
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                 ENGINE (Sdk)                │
//! │    config + device ─► session ─► channel    │
//! └──────────┬──────────────────────┬───────────┘
//!            │                      │
//! ┌──────────▼──────────┐ ┌─────────▼───────────┐
//! │   SESSION + API     │ │   LINK + EVENTS     │
//! │ hash | sign | token │ │ challenge | codec   │
//! └──────────┬──────────┘ └─────────┬───────────┘
//!            │                      │
//! ┌──────────▼──────────────────────▼───────────┐
//! │               CRYPTO LAYER                  │
//! │       secp256k1 | Keccak-256 | nonces       │
//! └─────────────────────┬───────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────┐
//! │             TRANSPORT LAYER                 │
//! │   WebSocket | in-memory | reconnect timer   │
//! └─────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod api;
pub mod config;
pub mod crypto;
pub mod event;
pub mod link;
pub mod sdk;
pub mod session;
pub mod storage;
pub mod transport;

// Re-export main types at crate root
pub use api::{ApiError, Backend, HttpBackend};
pub use config::{AuthMode, Config, ConfigError};
pub use crypto::{random_bytes, Address, CryptoError, CryptoResult, Device, SignatureBytes, Signer};
pub use event::{Decoded, Event};
pub use link::{LinkAction, LinkError, SecureActionKind, SecureLinkCoordinator};
pub use sdk::{Sdk, SdkError, SdkOptions, SdkResult};
pub use session::{Session, SessionManager, SessionState};
pub use storage::{FileStore, KeyValueStore, MemoryStore};
pub use transport::{ConnectionManager, ConnectionState, TransportError, WebSocketConnector};
