//! Keccak-256 hashing
//!
//! Ethereum-compatible hashing used for address derivation and for the
//! personal-message prefix applied before every signature this crate makes.

use sha3::{Digest, Keccak256};

/// Size of a hash output in bytes
pub const HASH_SIZE: usize = 32;

/// A hash output
pub type HashOutput = [u8; HASH_SIZE];

const PERSONAL_MESSAGE_PREFIX: &[u8] = b"\x19Ethereum Signed Message:\n";

/// Hashing operations
pub struct Hash;

impl Hash {
    /// Compute the Keccak-256 hash of data
    pub fn keccak256(data: &[u8]) -> HashOutput {
        Keccak256::digest(data).into()
    }

    /// Hash a message the way wallets do before a personal signature:
    /// `keccak256("\x19Ethereum Signed Message:\n" || len(message) || message)`
    pub fn personal_message(message: &[u8]) -> HashOutput {
        let mut hasher = Keccak256::new();
        hasher.update(PERSONAL_MESSAGE_PREFIX);
        hasher.update(message.len().to_string().as_bytes());
        hasher.update(message);
        hasher.finalize().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keccak_empty_input() {
        assert_eq!(
            hex::encode(Hash::keccak256(b"")),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn test_hash_different_inputs() {
        assert_ne!(Hash::keccak256(b"input1"), Hash::keccak256(b"input2"));
    }

    #[test]
    fn test_personal_message_differs_from_plain_hash() {
        let message = b"hello";
        assert_ne!(Hash::personal_message(message), Hash::keccak256(message));
    }

    #[test]
    fn test_personal_message_length_prefix() {
        let mut prefixed = PERSONAL_MESSAGE_PREFIX.to_vec();
        prefixed.extend_from_slice(b"16");
        prefixed.extend_from_slice(&[7u8; 16]);

        assert_eq!(Hash::personal_message(&[7u8; 16]), Hash::keccak256(&prefixed));
    }
}
