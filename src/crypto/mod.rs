//! Cryptographic primitives for Tether
//!
//! This module provides the building blocks the session and link layers use:
//! - `identity`: secp256k1 device keys, addresses and recoverable signatures
//! - `hash`: Keccak-256 and personal-message hashing

pub mod error;
pub mod hash;
pub mod identity;

// Re-export commonly used types
pub use error::{CryptoError, CryptoResult};
pub use hash::Hash;
pub use identity::{Address, Device, SignatureBytes, Signer};

/// Generate cryptographically secure random bytes
pub fn random_bytes<const N: usize>() -> [u8; N] {
    use rand::RngCore;
    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

#[cfg(test)]
mod integration_tests {
    use super::*;

    #[test]
    fn test_challenge_signature_flow() {
        // A relay hands out a random challenge
        let challenge = random_bytes::<16>();

        // The device answers it
        let device = Device::generate();
        let signature = device.sign(&challenge).unwrap();

        // Anyone holding the challenge learns who answered
        assert_eq!(signature.recover_personal(&challenge).unwrap(), device.address());

        // A different challenge does not recover the same device
        let other = random_bytes::<16>();
        assert_ne!(signature.recover_personal(&other).ok(), Some(device.address()));
    }

    #[test]
    fn test_random_bytes_unique() {
        assert_ne!(random_bytes::<16>(), random_bytes::<16>());
    }
}
