//! Out-of-band link actions
//!
//! A [`LinkAction`] is a small self-describing message that travels outside
//! the relay channel: rendered as a QR code or a deep link, scanned or
//! opened by another device. On the wire it is JSON,
//!
//! ```text
//! {"type": "...", "payload": {...}, "sender": {"type": "...", "data": "..."}}
//! ```
//!
//! base64url-encoded into the `action` query parameter of a link URL.
//! `sender` is present only when the action speaks for a specific role.

mod secure;

pub use secure::{SecureAction, SecureLinkCoordinator};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

use crate::crypto::{Address, CryptoError};

/// Size of a secure-action nonce in bytes
pub const NONCE_SIZE: usize = 16;

/// Query parameter carrying the encoded action
const ACTION_PARAM: &str = "action";

/// Link errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// URL has no `action` parameter
    #[error("Link has no action parameter")]
    MissingAction,

    /// Parameter is not valid base64 or JSON of a known action
    #[error("Invalid link action: {0}")]
    InvalidAction(String),

    /// Action cannot be accepted by this device
    #[error("Unsupported link action: {0}")]
    Unsupported(String),

    /// Sender data did not parse
    #[error("Invalid sender: {0}")]
    InvalidSender(#[from] CryptoError),
}

/// Result type for link operations
pub type LinkResult<T> = Result<T, LinkError>;

/// Random challenge a device is asked to sign
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Nonce(pub [u8; NONCE_SIZE]);

impl Nonce {
    /// Fresh random nonce
    pub fn generate() -> Self {
        Nonce(crate::crypto::random_bytes())
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }

    /// `0x`-prefixed hex
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for Nonce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Nonce({})", self.to_hex())
    }
}

impl Serialize for Nonce {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Nonce {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(s.strip_prefix("0x").unwrap_or(&s))
            .map_err(serde::de::Error::custom)?;
        let arr: [u8; NONCE_SIZE] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("nonce must be 16 bytes"))?;
        Ok(Nonce(arr))
    }
}

/// What a pending secure action will do once answered
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SecureActionKind {
    /// Add the answering device to this device's account
    CreateAccountDevice,
}

/// Payload of a `secure-action` link
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecureActionPayload {
    /// Network the challenge belongs to
    pub network: String,
    /// Pending action kind
    pub action: SecureActionKind,
    /// Nonce to sign
    pub hash: Nonce,
}

/// Payload of an `account-device` action
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountDevicePayload {
    /// Device to add
    pub device: Address,
}

/// Action type and payload
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum LinkActionPayload {
    /// Challenge for another device to sign
    SecureAction(SecureActionPayload),
    /// A device vouched for by a resolved challenge
    AccountDevice(AccountDevicePayload),
}

/// Role an action speaks for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SenderKind {
    /// A device; `data` is its address
    Device,
    /// An application; `data` is an app identifier
    App,
}

/// Originator of an action
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSender {
    /// Role
    #[serde(rename = "type")]
    pub kind: SenderKind,
    /// Role-specific identifier
    pub data: String,
}

impl LinkSender {
    /// Sender naming a device
    pub fn device(address: Address) -> Self {
        LinkSender {
            kind: SenderKind::Device,
            data: address.to_hex(),
        }
    }

    /// Device address, when the sender is a device
    pub fn device_address(&self) -> LinkResult<Option<Address>> {
        match self.kind {
            SenderKind::Device => Ok(Some(Address::from_hex(&self.data)?)),
            SenderKind::App => Ok(None),
        }
    }
}

/// A URL-transportable action
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkAction {
    /// Type and payload
    pub payload: LinkActionPayload,
    /// Originator, when the action speaks for a role
    pub sender: Option<LinkSender>,
}

impl LinkAction {
    /// Action without a sender
    pub fn new(payload: LinkActionPayload) -> Self {
        LinkAction {
            payload,
            sender: None,
        }
    }

    /// Attach a sender
    pub fn with_sender(mut self, sender: LinkSender) -> Self {
        self.sender = Some(sender);
        self
    }

    /// Encode into the value of the `action` parameter
    pub fn encode(&self) -> LinkResult<String> {
        let json =
            serde_json::to_vec(self).map_err(|e| LinkError::InvalidAction(e.to_string()))?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    /// Decode the value of an `action` parameter
    pub fn decode(encoded: &str) -> LinkResult<Self> {
        let json = URL_SAFE_NO_PAD
            .decode(encoded.trim())
            .map_err(|e| LinkError::InvalidAction(e.to_string()))?;
        serde_json::from_slice(&json).map_err(|e| LinkError::InvalidAction(e.to_string()))
    }

    /// Render as a link under `base`
    pub fn to_url(&self, base: &str) -> LinkResult<String> {
        let separator = if base.contains('?') { '&' } else { '?' };
        Ok(format!("{base}{separator}{ACTION_PARAM}={}", self.encode()?))
    }

    /// Parse a link produced by [`LinkAction::to_url`]
    pub fn from_url(url: &str) -> LinkResult<Self> {
        let query = url.split_once('?').map(|(_, q)| q).unwrap_or_default();
        let query = query.split('#').next().unwrap_or_default();

        let encoded = query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == ACTION_PARAM)
            .map(|(_, value)| value)
            .ok_or(LinkError::MissingAction)?;

        Self::decode(encoded)
    }
}

impl Serialize for LinkAction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::Error;

        let mut value = serde_json::to_value(&self.payload).map_err(S::Error::custom)?;
        if let (Some(sender), Value::Object(map)) = (&self.sender, &mut value) {
            map.insert(
                "sender".to_string(),
                serde_json::to_value(sender).map_err(S::Error::custom)?,
            );
        }
        value.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for LinkAction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;

        let mut value = Value::deserialize(deserializer)?;
        let sender = match value.as_object_mut().and_then(|map| map.remove("sender")) {
            None | Some(Value::Null) => None,
            Some(sender) => Some(serde_json::from_value(sender).map_err(D::Error::custom)?),
        };
        let payload = serde_json::from_value(value).map_err(D::Error::custom)?;

        Ok(LinkAction { payload, sender })
    }
}
