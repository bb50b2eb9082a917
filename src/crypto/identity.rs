//! secp256k1 device identity
//!
//! A device is identified by an Ethereum-style address (the last 20 bytes of
//! the Keccak-256 hash of its uncompressed public key). Every signature the
//! device produces is a recoverable personal-message signature, so a verifier
//! only needs the message and the signature to learn who signed.

use async_trait::async_trait;
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::error::{CryptoError, CryptoResult};
use super::hash::Hash;

/// Size of an address in bytes
pub const ADDRESS_SIZE: usize = 20;

/// Size of a secret key in bytes
pub const SECRET_KEY_SIZE: usize = 32;

/// Size of a recoverable signature in bytes (r || s || v)
pub const SIGNATURE_SIZE: usize = 65;

/// Strip an optional `0x` prefix and decode hex
fn decode_prefixed_hex(s: &str) -> CryptoResult<Vec<u8>> {
    let trimmed = s.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    hex::decode(digits).map_err(|e| CryptoError::InvalidHex(e.to_string()))
}

/// An account or device address
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(pub [u8; ADDRESS_SIZE]);

impl Address {
    /// Create from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() != ADDRESS_SIZE {
            return Err(CryptoError::InvalidAddressLength {
                expected: ADDRESS_SIZE,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; ADDRESS_SIZE];
        arr.copy_from_slice(bytes);
        Ok(Address(arr))
    }

    /// Derive the address of a secp256k1 public key
    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        let point = key.to_encoded_point(false);
        // Skip the 0x04 uncompressed-point tag
        let hash = Hash::keccak256(&point.as_bytes()[1..]);
        let mut arr = [0u8; ADDRESS_SIZE];
        arr.copy_from_slice(&hash[12..]);
        Address(arr)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; ADDRESS_SIZE] {
        &self.0
    }

    /// Convert to `0x`-prefixed lowercase hex
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    /// Parse from hex, with or without the `0x` prefix
    pub fn from_hex(s: &str) -> CryptoResult<Self> {
        Self::from_bytes(&decode_prefixed_hex(s)?)
    }
}

impl FromStr for Address {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl std::fmt::Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Address({})", self.to_hex())
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// A recoverable signature: `r || s || v` with `v` in {27, 28}
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SignatureBytes(pub [u8; SIGNATURE_SIZE]);

// Custom serde impl because arrays >32 don't auto-derive
impl Serialize for SignatureBytes {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for SignatureBytes {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

impl SignatureBytes {
    /// Create from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() != SIGNATURE_SIZE {
            return Err(CryptoError::InvalidSignatureLength {
                expected: SIGNATURE_SIZE,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; SIGNATURE_SIZE];
        arr.copy_from_slice(bytes);
        Ok(SignatureBytes(arr))
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.0
    }

    /// Convert to `0x`-prefixed hex string
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    /// Create from hex string
    pub fn from_hex(s: &str) -> CryptoResult<Self> {
        Self::from_bytes(&decode_prefixed_hex(s)?)
    }

    /// Recover the address that produced this signature over `message`
    /// (personal-message prefixed).
    pub fn recover_personal(&self, message: &[u8]) -> CryptoResult<Address> {
        let digest = Hash::personal_message(message);
        let recovery_id = parse_recovery_id(self.0[SIGNATURE_SIZE - 1])?;
        let signature = Signature::from_slice(&self.0[..SIGNATURE_SIZE - 1])
            .map_err(|_| CryptoError::RecoveryFailed)?;

        let key = VerifyingKey::recover_from_prehash(&digest, &signature, recovery_id)
            .map_err(|_| CryptoError::RecoveryFailed)?;

        Ok(Address::from_verifying_key(&key))
    }
}

impl std::fmt::Debug for SignatureBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({}...)", &self.to_hex()[..18])
    }
}

/// Accepts both raw (0, 1) and Ethereum-offset (27, 28) recovery bytes
fn parse_recovery_id(v: u8) -> CryptoResult<RecoveryId> {
    let normalized = match v {
        0 | 1 => v,
        27 | 28 => v - 27,
        other => return Err(CryptoError::InvalidRecoveryId(other)),
    };
    RecoveryId::from_byte(normalized).ok_or(CryptoError::InvalidRecoveryId(v))
}

/// Anything able to sign on behalf of a device address.
///
/// The key may live in memory, in a hardware wallet or behind a remote
/// signer; the engine only needs the address and a personal signature.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Address of the signing key
    fn address(&self) -> Address;

    /// Produce a personal-message signature over `message`
    async fn sign_message(&self, message: &[u8]) -> CryptoResult<SignatureBytes>;
}

/// A device keypair held in memory
///
/// The secret key is automatically zeroized when dropped.
#[derive(ZeroizeOnDrop)]
pub struct Device {
    #[zeroize(skip)]
    address: Address,
    secret_key: [u8; SECRET_KEY_SIZE],
}

impl Device {
    /// Generate a new random device key
    pub fn generate() -> Self {
        let signing_key = SigningKey::random(&mut OsRng);
        Self::from_signing_key(&signing_key)
    }

    fn from_signing_key(signing_key: &SigningKey) -> Self {
        let mut secret_key = [0u8; SECRET_KEY_SIZE];
        secret_key.copy_from_slice(&signing_key.to_bytes());

        Device {
            address: Address::from_verifying_key(signing_key.verifying_key()),
            secret_key,
        }
    }

    /// Get the device address
    pub fn address(&self) -> Address {
        self.address
    }

    /// Personal-sign a message
    pub fn sign(&self, message: &[u8]) -> CryptoResult<SignatureBytes> {
        let signing_key =
            SigningKey::from_slice(&self.secret_key).map_err(|_| CryptoError::InvalidSecretKey)?;
        let digest = Hash::personal_message(message);

        let (mut signature, mut recovery_id) = signing_key
            .sign_prehash_recoverable(&digest)
            .map_err(|e| CryptoError::SigningFailed(e.to_string()))?;

        // Low-S form; flipping s mirrors the point so the parity flips too
        if let Some(normalized) = signature.normalize_s() {
            signature = normalized;
            recovery_id = RecoveryId::new(!recovery_id.is_y_odd(), recovery_id.is_x_reduced());
        }

        let mut bytes = [0u8; SIGNATURE_SIZE];
        bytes[..SIGNATURE_SIZE - 1].copy_from_slice(&signature.to_bytes());
        bytes[SIGNATURE_SIZE - 1] = recovery_id.to_byte() + 27;
        Ok(SignatureBytes(bytes))
    }

    /// Export the secret key (for the local key file)
    ///
    /// WARNING: This exposes the secret key. Handle with extreme care.
    pub fn to_bytes(&self) -> [u8; SECRET_KEY_SIZE] {
        self.secret_key
    }

    /// Import a device from its secret key
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() != SECRET_KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: SECRET_KEY_SIZE,
                actual: bytes.len(),
            });
        }

        let mut secret_key = [0u8; SECRET_KEY_SIZE];
        secret_key.copy_from_slice(bytes);
        let signing_key = SigningKey::from_slice(&secret_key);
        secret_key.zeroize();

        let signing_key = signing_key.map_err(|_| CryptoError::InvalidSecretKey)?;
        Ok(Self::from_signing_key(&signing_key))
    }
}

impl Clone for Device {
    fn clone(&self) -> Self {
        Device {
            address: self.address,
            secret_key: self.secret_key,
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Signer for Device {
    fn address(&self) -> Address {
        self.address
    }

    async fn sign_message(&self, message: &[u8]) -> CryptoResult<SignatureBytes> {
        self.sign(message)
    }
}
