//! Cryptographic error types

use thiserror::Error;

/// Errors that can occur in cryptographic operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// The provided key has an invalid length
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected key length in bytes
        expected: usize,
        /// Actual key length in bytes
        actual: usize,
    },

    /// The provided signature has an invalid length
    #[error("Invalid signature length: expected {expected}, got {actual}")]
    InvalidSignatureLength {
        /// Expected signature length in bytes
        expected: usize,
        /// Actual signature length in bytes
        actual: usize,
    },

    /// The provided address has an invalid length
    #[error("Invalid address length: expected {expected}, got {actual}")]
    InvalidAddressLength {
        /// Expected address length in bytes
        expected: usize,
        /// Actual address length in bytes
        actual: usize,
    },

    /// Hex input could not be parsed
    #[error("Invalid hex encoding: {0}")]
    InvalidHex(String),

    /// Recovery id byte is not one of 0, 1, 27, 28
    #[error("Invalid recovery id: {0}")]
    InvalidRecoveryId(u8),

    /// Public key recovery from the signature failed
    #[error("Failed to recover signer from signature")]
    RecoveryFailed,

    /// Signing failed inside the curve implementation
    #[error("Signing failed: {0}")]
    SigningFailed(String),

    /// The secret key format is invalid
    #[error("Invalid secret key format")]
    InvalidSecretKey,
}

/// Result type for cryptographic operations
pub type CryptoResult<T> = Result<T, CryptoError>;
