//! Typed events carried over the relay channel
//!
//! Every frame is an envelope:
//!
//! ```text
//! [type: u8][payload length: u16 LE][payload]
//! ```
//!
//! Payload fields are fixed-width byte strings (addresses are 20 bytes,
//! signatures 65, nonces 16), so the type tag alone determines the layout.
//! Decoding never fails hard: anything that is not a well-formed frame of a
//! known type comes back as [`Decoded::Unrecognized`], so one bad frame
//! cannot take the channel down.

use thiserror::Error;

use crate::crypto::identity::{ADDRESS_SIZE, SIGNATURE_SIZE};
use crate::crypto::{Address, SignatureBytes};

/// Size of the envelope header
const HEADER_SIZE: usize = 3;

/// Why a frame could not be decoded
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Frame shorter than the envelope header
    #[error("Frame too short: {0} bytes")]
    Truncated(usize),

    /// Header length disagrees with the bytes present
    #[error("Payload length mismatch: header says {declared}, frame has {actual}")]
    LengthMismatch {
        /// Length declared in the header
        declared: usize,
        /// Bytes actually following the header
        actual: usize,
    },

    /// Unknown type tag
    #[error("Unknown event type: {0:#x}")]
    UnknownType(u8),

    /// Payload size wrong for the type
    #[error("Invalid payload for {kind}: expected {expected} bytes, got {actual}")]
    InvalidPayload {
        /// Event kind
        kind: EventKind,
        /// Expected payload size
        expected: usize,
        /// Actual payload size
        actual: usize,
    },
}

/// Event kinds known to this client
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Relay stopped forwarding link traffic to this device
    ConnectionMuted,
    /// Relay resumed forwarding link traffic
    ConnectionUnmuted,
    /// Ask the relay to mute this connection
    MuteConnection,
    /// Ask the relay to unmute this connection
    UnmuteConnection,
    /// Account attributes changed
    AccountUpdated,
    /// A device joined an account
    AccountDeviceAdded,
    /// A device of an account changed
    AccountDeviceUpdated,
    /// A device left an account
    AccountDeviceRemoved,
    /// A signed answer to a secure-link challenge
    SignedSecureAction,
}

impl EventKind {
    /// Wire tag
    pub fn tag(self) -> u8 {
        match self {
            EventKind::ConnectionMuted => 0x01,
            EventKind::ConnectionUnmuted => 0x02,
            EventKind::MuteConnection => 0x03,
            EventKind::UnmuteConnection => 0x04,
            EventKind::AccountUpdated => 0x10,
            EventKind::AccountDeviceAdded => 0x11,
            EventKind::AccountDeviceUpdated => 0x12,
            EventKind::AccountDeviceRemoved => 0x13,
            EventKind::SignedSecureAction => 0x20,
        }
    }

    /// Look up a wire tag
    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0x01 => EventKind::ConnectionMuted,
            0x02 => EventKind::ConnectionUnmuted,
            0x03 => EventKind::MuteConnection,
            0x04 => EventKind::UnmuteConnection,
            0x10 => EventKind::AccountUpdated,
            0x11 => EventKind::AccountDeviceAdded,
            0x12 => EventKind::AccountDeviceUpdated,
            0x13 => EventKind::AccountDeviceRemoved,
            0x20 => EventKind::SignedSecureAction,
            _ => return None,
        })
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// A device of an account, as named by account-device events
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccountDeviceRef {
    /// Account the device belongs to
    pub account: Address,
    /// Device address
    pub device: Address,
}

/// A decoded event
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// Relay muted this connection
    ConnectionMuted,
    /// Relay unmuted this connection
    ConnectionUnmuted,
    /// Request to mute (outbound)
    MuteConnection,
    /// Request to unmute (outbound)
    UnmuteConnection,
    /// Account changed
    AccountUpdated {
        /// The account
        account: Address,
    },
    /// Device joined an account
    AccountDeviceAdded(AccountDeviceRef),
    /// Device of an account changed
    AccountDeviceUpdated(AccountDeviceRef),
    /// Device left an account
    AccountDeviceRemoved(AccountDeviceRef),
    /// Signature over a secure-link nonce.
    ///
    /// Outbound, `device` names the challenging device the relay should
    /// deliver to. Inbound, it is the signer as reported by the relay.
    SignedSecureAction {
        /// Recipient (outbound) or reported signer (inbound)
        device: Address,
        /// Personal signature over the nonce
        signature: SignatureBytes,
    },
}

/// Result of decoding one frame
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decoded {
    /// A well-formed event
    Event(Event),
    /// Anything else, with the reason
    Unrecognized(DecodeError),
}

impl Event {
    /// Kind of this event
    pub fn kind(&self) -> EventKind {
        match self {
            Event::ConnectionMuted => EventKind::ConnectionMuted,
            Event::ConnectionUnmuted => EventKind::ConnectionUnmuted,
            Event::MuteConnection => EventKind::MuteConnection,
            Event::UnmuteConnection => EventKind::UnmuteConnection,
            Event::AccountUpdated { .. } => EventKind::AccountUpdated,
            Event::AccountDeviceAdded(_) => EventKind::AccountDeviceAdded,
            Event::AccountDeviceUpdated(_) => EventKind::AccountDeviceUpdated,
            Event::AccountDeviceRemoved(_) => EventKind::AccountDeviceRemoved,
            Event::SignedSecureAction { .. } => EventKind::SignedSecureAction,
        }
    }

    /// Serialize to a frame
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();

        match self {
            Event::ConnectionMuted
            | Event::ConnectionUnmuted
            | Event::MuteConnection
            | Event::UnmuteConnection => {}
            Event::AccountUpdated { account } => {
                payload.extend_from_slice(account.as_bytes());
            }
            Event::AccountDeviceAdded(device)
            | Event::AccountDeviceUpdated(device)
            | Event::AccountDeviceRemoved(device) => {
                payload.extend_from_slice(device.account.as_bytes());
                payload.extend_from_slice(device.device.as_bytes());
            }
            Event::SignedSecureAction { device, signature } => {
                payload.extend_from_slice(device.as_bytes());
                payload.extend_from_slice(signature.as_bytes());
            }
        }

        let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
        frame.push(self.kind().tag());
        frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        frame.extend_from_slice(&payload);
        frame
    }

    /// Deserialize a frame, reporting why it was rejected
    pub fn from_bytes(frame: &[u8]) -> Result<Self, DecodeError> {
        if frame.len() < HEADER_SIZE {
            return Err(DecodeError::Truncated(frame.len()));
        }

        let tag = frame[0];
        let declared = u16::from_le_bytes([frame[1], frame[2]]) as usize;
        let payload = &frame[HEADER_SIZE..];

        if payload.len() != declared {
            return Err(DecodeError::LengthMismatch {
                declared,
                actual: payload.len(),
            });
        }

        let kind = EventKind::from_tag(tag).ok_or(DecodeError::UnknownType(tag))?;

        let expected = match kind {
            EventKind::ConnectionMuted
            | EventKind::ConnectionUnmuted
            | EventKind::MuteConnection
            | EventKind::UnmuteConnection => 0,
            EventKind::AccountUpdated => ADDRESS_SIZE,
            EventKind::AccountDeviceAdded
            | EventKind::AccountDeviceUpdated
            | EventKind::AccountDeviceRemoved => 2 * ADDRESS_SIZE,
            EventKind::SignedSecureAction => ADDRESS_SIZE + SIGNATURE_SIZE,
        };

        if payload.len() != expected {
            return Err(DecodeError::InvalidPayload {
                kind,
                expected,
                actual: payload.len(),
            });
        }

        // Lengths were checked above
        let address_at = |offset: usize| {
            let mut bytes = [0u8; ADDRESS_SIZE];
            bytes.copy_from_slice(&payload[offset..offset + ADDRESS_SIZE]);
            Address(bytes)
        };

        let event = match kind {
            EventKind::ConnectionMuted => Event::ConnectionMuted,
            EventKind::ConnectionUnmuted => Event::ConnectionUnmuted,
            EventKind::MuteConnection => Event::MuteConnection,
            EventKind::UnmuteConnection => Event::UnmuteConnection,
            EventKind::AccountUpdated => Event::AccountUpdated {
                account: address_at(0),
            },
            EventKind::AccountDeviceAdded
            | EventKind::AccountDeviceUpdated
            | EventKind::AccountDeviceRemoved => {
                let device = AccountDeviceRef {
                    account: address_at(0),
                    device: address_at(ADDRESS_SIZE),
                };
                match kind {
                    EventKind::AccountDeviceAdded => Event::AccountDeviceAdded(device),
                    EventKind::AccountDeviceUpdated => Event::AccountDeviceUpdated(device),
                    _ => Event::AccountDeviceRemoved(device),
                }
            }
            EventKind::SignedSecureAction => {
                let mut signature = [0u8; SIGNATURE_SIZE];
                signature.copy_from_slice(&payload[ADDRESS_SIZE..]);
                Event::SignedSecureAction {
                    device: address_at(0),
                    signature: SignatureBytes(signature),
                }
            }
        };

        Ok(event)
    }
}

/// Decode a frame without ever failing
pub fn decode(frame: &[u8]) -> Decoded {
    match Event::from_bytes(frame) {
        Ok(event) => Decoded::Event(event),
        Err(e) => Decoded::Unrecognized(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_events() -> Vec<Event> {
        let account = Address([0x11; 20]);
        let device = Address([0x22; 20]);
        let pair = AccountDeviceRef { account, device };

        vec![
            Event::ConnectionMuted,
            Event::ConnectionUnmuted,
            Event::MuteConnection,
            Event::UnmuteConnection,
            Event::AccountUpdated { account },
            Event::AccountDeviceAdded(pair),
            Event::AccountDeviceUpdated(pair),
            Event::AccountDeviceRemoved(pair),
            Event::SignedSecureAction {
                device: Address([0xff; 20]),
                signature: SignatureBytes([0xff; 65]),
            },
        ]
    }

    #[test]
    fn test_every_kind_roundtrips() {
        for event in all_events() {
            assert_eq!(decode(&event.encode()), Decoded::Event(event));
        }
    }

    #[test]
    fn test_zero_payload_frame_is_header_only() {
        assert_eq!(Event::ConnectionMuted.encode(), vec![0x01, 0, 0]);
    }

    #[test]
    fn test_tags_are_distinct() {
        let mut tags: Vec<u8> = all_events().iter().map(|e| e.kind().tag()).collect();
        tags.sort_unstable();
        tags.dedup();
        assert_eq!(tags.len(), all_events().len());
    }

    #[test]
    fn test_empty_frame_unrecognized() {
        assert_eq!(decode(&[]), Decoded::Unrecognized(DecodeError::Truncated(0)));
    }

    #[test]
    fn test_unknown_tag_unrecognized() {
        assert_eq!(
            decode(&[0x7f, 0, 0]),
            Decoded::Unrecognized(DecodeError::UnknownType(0x7f))
        );
    }

    #[test]
    fn test_truncated_payload_unrecognized() {
        let mut frame = Event::AccountUpdated {
            account: Address([1; 20]),
        }
        .encode();
        frame.pop();

        assert_eq!(
            decode(&frame),
            Decoded::Unrecognized(DecodeError::LengthMismatch {
                declared: 20,
                actual: 19
            })
        );
    }

    #[test]
    fn test_wrong_payload_size_unrecognized() {
        // Well-formed envelope, but a signature event with an address only
        let mut frame = vec![EventKind::SignedSecureAction.tag(), 20, 0];
        frame.extend_from_slice(&[9u8; 20]);

        assert!(matches!(
            decode(&frame),
            Decoded::Unrecognized(DecodeError::InvalidPayload {
                kind: EventKind::SignedSecureAction,
                expected: 85,
                actual: 20
            })
        ));
    }

    #[test]
    fn test_trailing_bytes_unrecognized() {
        let mut frame = Event::ConnectionUnmuted.encode();
        frame.push(0);
        assert!(matches!(decode(&frame), Decoded::Unrecognized(_)));
    }
}
