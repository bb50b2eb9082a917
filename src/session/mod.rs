//! Session lifecycle
//!
//! A session is the authenticated context between this device and the
//! backend. It moves through three states:
//!
//! ```text
//! Destroyed --set_as_verifying--> Verifying --set_as_verified--> Verified
//!     ^                               |                             |
//!     +-------- set_as_destroyed -----+-------- set_as_destroyed ---+
//! ```
//!
//! A token exists only while `Verified`. State is published through a
//! `watch` channel; subscribers get snapshots, never the state itself.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::api::{ApiError, Backend, VerifySessionRequest};
use crate::crypto::{CryptoError, Signer};

/// Session state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// No session
    Destroyed,
    /// Authentication in progress
    Verifying,
    /// Authenticated; a token is held
    Verified,
}

/// Session errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Requested transition is not part of the state machine
    #[error("Invalid session transition: {from:?} -> {to:?}")]
    InvalidTransition {
        /// State before the request
        from: SessionState,
        /// Requested state
        to: SessionState,
    },

    /// Backend call failed
    #[error("Backend: {0}")]
    Api(#[from] ApiError),

    /// Signing failed
    #[error("Signing: {0}")]
    Crypto(#[from] CryptoError),
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Snapshot of the session
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    state: SessionState,
    token: Option<String>,
}

impl Session {
    fn destroyed() -> Self {
        Session {
            state: SessionState::Destroyed,
            token: None,
        }
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Token, present only when verified
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Whether the session is verified
    pub fn is_verified(&self) -> bool {
        self.state == SessionState::Verified
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Owner of the session state
pub struct SessionManager {
    session: watch::Sender<Session>,
}

impl SessionManager {
    /// Create a manager in `Destroyed`
    pub fn new() -> Self {
        let (session, _) = watch::channel(Session::destroyed());
        SessionManager { session }
    }

    /// Current snapshot
    pub fn current(&self) -> Session {
        self.session.borrow().clone()
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.session.borrow().state
    }

    /// Observe snapshots
    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.session.subscribe()
    }

    /// Start a new attempt. Allowed from any state; drops any token.
    pub fn set_as_verifying(&self) {
        let previous = self.session.send_replace(Session {
            state: SessionState::Verifying,
            token: None,
        });
        debug!(from = ?previous.state, "session verifying");
    }

    /// Finish an attempt. Only valid while `Verifying`.
    pub fn set_as_verified(&self, token: String) -> SessionResult<()> {
        let mut rejected = None;
        self.session.send_if_modified(|session| {
            if session.state != SessionState::Verifying {
                rejected = Some(session.state);
                return false;
            }
            *session = Session {
                state: SessionState::Verified,
                token: Some(token),
            };
            true
        });

        match rejected {
            Some(from) => Err(SessionError::InvalidTransition {
                from,
                to: SessionState::Verified,
            }),
            None => {
                info!("session verified");
                Ok(())
            }
        }
    }

    /// Drop the session. Allowed from any state.
    pub fn set_as_destroyed(&self) {
        let changed = self.session.send_if_modified(|session| {
            if session.state == SessionState::Destroyed {
                return false;
            }
            *session = Session::destroyed();
            true
        });
        if changed {
            info!("session destroyed");
        }
    }

    /// Run the challenge exchange: hash, sign, verify, then `Verified`.
    ///
    /// Any failure leaves the session `Destroyed` and is returned. Two
    /// overlapping calls are not serialized here; callers must not start a
    /// second attempt before the first returns.
    pub async fn create_session(
        &self,
        backend: &dyn Backend,
        signer: &dyn Signer,
    ) -> SessionResult<String> {
        self.set_as_verifying();

        let result = match authenticate(backend, signer).await {
            Ok(token) => self.set_as_verified(token.clone()).map(|()| token),
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            warn!(error = %e, "session authentication failed");
            self.set_as_destroyed();
        }
        result
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

async fn authenticate(backend: &dyn Backend, signer: &dyn Signer) -> SessionResult<String> {
    let hash = backend.create_session().await?;
    let signature = signer.sign_message(&hash.0).await?;

    let request = VerifySessionRequest {
        hash,
        signer: signer.address(),
        signature,
    };
    Ok(backend.verify_session(&request).await?)
}
