//! Challenge side of the secure-link handshake
//!
//! The device that wants to vouch for a new device publishes a challenge
//! out of band. The new device signs the nonce and relays the signature
//! back over the channel. Only one challenge is ever outstanding: the slot
//! is an `Option`, and creating a challenge overwrites it.

use tokio::sync::broadcast;
use tracing::{debug, info};

use super::{
    AccountDevicePayload, LinkAction, LinkActionPayload, LinkSender, Nonce, SecureActionKind,
    SecureActionPayload,
};
use crate::crypto::{Address, SignatureBytes};

/// The outstanding challenge
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecureAction {
    /// What answering it will do
    pub kind: SecureActionKind,
    /// Nonce the answering device must sign
    pub hash: Nonce,
}

/// Holds at most one outstanding challenge and checks answers against it
pub struct SecureLinkCoordinator {
    network: String,
    pending: Option<SecureAction>,
    resolved: broadcast::Sender<LinkAction>,
}

impl SecureLinkCoordinator {
    /// Coordinator for a network
    pub fn new(network: impl Into<String>) -> Self {
        let (resolved, _) = broadcast::channel(16);
        SecureLinkCoordinator {
            network: network.into(),
            pending: None,
            resolved,
        }
    }

    /// Switch networks; an outstanding challenge is dropped
    pub fn set_network(&mut self, network: impl Into<String>) {
        let network = network.into();
        if network != self.network {
            self.network = network;
            self.cancel();
        }
    }

    /// The outstanding challenge, if any
    pub fn pending(&self) -> Option<&SecureAction> {
        self.pending.as_ref()
    }

    /// Observe resolved actions
    pub fn subscribe(&self) -> broadcast::Receiver<LinkAction> {
        self.resolved.subscribe()
    }

    /// Start a challenge, replacing any outstanding one.
    ///
    /// Returns the action to hand to the other device; `device` is this
    /// device's address, which the relay uses to route the answer back.
    pub fn create_challenge(&mut self, kind: SecureActionKind, device: Address) -> LinkAction {
        let hash = Nonce::generate();
        if let Some(previous) = self.pending.replace(SecureAction { kind, hash }) {
            debug!(nonce = ?previous.hash, "outstanding challenge replaced");
        }
        info!(?kind, "secure challenge created");

        LinkAction::new(LinkActionPayload::SecureAction(SecureActionPayload {
            network: self.network.clone(),
            action: kind,
            hash,
        }))
        .with_sender(LinkSender::device(device))
    }

    /// Check an answer relayed for `signer`.
    ///
    /// Answers that do not recover to `signer` over the outstanding nonce are
    /// ignored and leave the challenge in place.
    pub fn resolve(&mut self, signer: &Address, signature: &SignatureBytes) -> Option<LinkAction> {
        let pending = self.pending.as_ref()?;

        match signature.recover_personal(pending.hash.as_bytes()) {
            Ok(recovered) if recovered == *signer => {}
            Ok(recovered) => {
                debug!(%signer, %recovered, "ignoring answer from another signer");
                return None;
            }
            Err(e) => {
                debug!(%signer, error = %e, "ignoring unrecoverable answer");
                return None;
            }
        }

        let pending = self.pending.take()?;
        let action = match pending.kind {
            SecureActionKind::CreateAccountDevice => {
                LinkAction::new(LinkActionPayload::AccountDevice(AccountDevicePayload {
                    device: *signer,
                }))
            }
        };

        info!(device = %signer, "secure challenge resolved");
        let _ = self.resolved.send(action.clone());
        Some(action)
    }

    /// Drop the outstanding challenge; returns whether there was one
    pub fn cancel(&mut self) -> bool {
        let cancelled = self.pending.take().is_some();
        if cancelled {
            info!("secure challenge cancelled");
        }
        cancelled
    }
}
