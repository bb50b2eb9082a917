//! The engine
//!
//! [`Sdk`] wires session, connection, event codec and secure-link
//! coordinator together. One driver task owns every reaction and handles
//! them one at a time in arrival order:
//!
//! - a config or device change re-evaluates whether a session should
//!   exist (auto auth with both present) and creates or tears it down
//! - inbound frames are decoded and dispatched
//! - the connection reporting muted cancels the outstanding challenge
//!
//! Failures inside the driver never escape it; they are forwarded on the
//! error channel returned once by [`Sdk::take_errors`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{ApiError, Backend, Method};
use crate::config::{AuthMode, Config, ConfigError};
use crate::crypto::{Address, CryptoError, Signer};
use crate::event::{self, Decoded, Event};
use crate::link::{
    LinkAction, LinkActionPayload, LinkError, SecureAction, SecureActionKind,
    SecureLinkCoordinator,
};
use crate::session::{Session, SessionError, SessionManager, SessionState};
use crate::storage::{KeyValueStore, StorageError};
use crate::transport::{ConnectionManager, ConnectionState, Connector, TransportError};

const DEVICE_KEY: &str = "device";
const ACCOUNT_KEY: &str = "account";
const ACCOUNT_DEVICE_KEY: &str = "account_device";
const SETTINGS_KEY: &str = "settings";

const ACCOUNT_PATH: &str = "account";
const ACCOUNT_DEVICE_PATH: &str = "account/device";

/// Engine errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SdkError {
    /// Operation needs a device and none is set
    #[error("No device set")]
    NoDevice,

    /// Operation needs a config and none is applied
    #[error("Not configured")]
    NotConfigured,

    /// Session failure
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Connection failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Backend failure
    #[error(transparent)]
    Api(#[from] ApiError),

    /// Signing failure
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Link action failure
    #[error(transparent)]
    Link(#[from] LinkError),

    /// Persistence failure
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Config failure
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Result type for engine operations
pub type SdkResult<T> = Result<T, SdkError>;

/// Collaborators the engine is built from
pub struct SdkOptions {
    /// HTTP backend
    pub backend: Arc<dyn Backend>,
    /// Relay connector
    pub connector: Arc<dyn Connector>,
    /// Local persistence
    pub store: Arc<dyn KeyValueStore>,
}

#[derive(Serialize, Deserialize)]
struct DeviceRecord {
    address: Address,
}

#[derive(Default)]
struct LocalState {
    device: Option<Address>,
    account: Option<Value>,
    account_device: Option<Value>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Shared {
    backend: Arc<dyn Backend>,
    store: Arc<dyn KeyValueStore>,
    session: SessionManager,
    connection: ConnectionManager,
    config: watch::Sender<Option<Config>>,
    device: watch::Sender<Option<Arc<dyn Signer>>>,
    link: Mutex<SecureLinkCoordinator>,
    local: Mutex<LocalState>,
    errors: mpsc::UnboundedSender<SdkError>,
}

impl Shared {
    fn link(&self) -> MutexGuard<'_, SecureLinkCoordinator> {
        lock(&self.link)
    }

    fn report(&self, error: SdkError) {
        warn!(error = %error, "engine error");
        let _ = self.errors.send(error);
    }

    fn persist(&self, key: &str, value: Value) {
        if let Err(e) = self.store.set(key, value) {
            self.report(e.into());
        }
    }

    fn load<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = match self.store.get(key) {
            Ok(Some(Value::Null)) | Ok(None) => return None,
            Ok(Some(value)) => value,
            Err(e) => {
                self.report(e.into());
                return None;
            }
        };

        match serde_json::from_value(value) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                self.report(
                    StorageError::Corrupt {
                        key: key.to_string(),
                        reason: e.to_string(),
                    }
                    .into(),
                );
                None
            }
        }
    }

    /// Load what the last run left behind
    fn restore(&self) {
        {
            let mut local = lock(&self.local);
            local.device = self.load::<DeviceRecord>(DEVICE_KEY).map(|r| r.address);
            local.account = self.load(ACCOUNT_KEY);
            local.account_device = self.load(ACCOUNT_DEVICE_KEY);
        }

        if let Some(config) = self.load::<Config>(SETTINGS_KEY) {
            info!(network = %config.network, "settings restored");
            self.apply_config(&config);
            self.config.send_replace(Some(config));
        }
    }

    fn apply_config(&self, config: &Config) {
        self.backend.set_endpoint(config.api_url.as_deref());
        self.connection
            .set_reconnect_interval(config.reconnect_interval());
        self.link().set_network(config.network.clone());
    }

    fn tracked_account(&self) -> Option<Address> {
        let local = lock(&self.local);
        local
            .account
            .as_ref()?
            .get("address")?
            .as_str()?
            .parse()
            .ok()
    }

    /// Level-triggered session rule
    async fn reconcile(&self, config: Option<Config>, device: Option<Arc<dyn Signer>>) {
        match (config, device) {
            (Some(config), Some(device)) if config.auth == AuthMode::Auto => {
                if self.session.state() != SessionState::Verified {
                    // Failures are reported by authenticate
                    let _ = self.authenticate(&config, device.as_ref()).await;
                } else if self.connection.state() == ConnectionState::Closed {
                    if let Err(e) = self.open_connection(&config).await {
                        self.report(e);
                    }
                }
            }
            _ => self.teardown(),
        }
    }

    fn teardown(&self) {
        self.link().cancel();
        self.session.set_as_destroyed();

        let idle = self.connection.state() == ConnectionState::Closed;
        self.connection.close(idle);
    }

    async fn authenticate(&self, config: &Config, device: &dyn Signer) -> SdkResult<String> {
        // A new attempt drops the old token, so no channel may outlive it
        self.connection.close(true);

        let token = match self
            .session
            .create_session(self.backend.as_ref(), device)
            .await
        {
            Ok(token) => token,
            Err(e) => {
                let error = SdkError::from(e);
                self.report(error.clone());
                return Err(error);
            }
        };
        self.refresh_account().await;

        if let Err(e) = self.open_connection(config).await {
            self.report(e);
        }

        Ok(token)
    }

    async fn open_connection(&self, config: &Config) -> SdkResult<()> {
        let session = self.session.current();
        let token = session
            .token()
            .ok_or(TransportError::InvalidConnectionState)?;
        let endpoint = config.socket_endpoint()?;

        self.connection.open(&endpoint, token).await?;
        Ok(())
    }

    /// Refetch account and account-device; replaces local copies only when
    /// both arrive
    async fn refresh_account(&self) -> bool {
        let Some(token) = self.session.current().token().map(str::to_string) else {
            return false;
        };

        let (account, account_device) = tokio::join!(
            self.backend
                .call(Method::Get, ACCOUNT_PATH, None, Some(&token)),
            self.backend
                .call(Method::Get, ACCOUNT_DEVICE_PATH, None, Some(&token)),
        );

        let (Some(account), Some(account_device)) = (account.data, account_device.data) else {
            debug!("account refresh incomplete, keeping local copies");
            return false;
        };

        {
            let mut local = lock(&self.local);
            local.account = Some(account.clone());
            local.account_device = Some(account_device.clone());
        }
        self.persist(ACCOUNT_KEY, account);
        self.persist(ACCOUNT_DEVICE_KEY, account_device);

        info!("account refreshed");
        true
    }

    /// Forget account copies that belonged to another device
    fn device_changed(&self, address: Option<Address>) {
        let Some(address) = address else {
            return;
        };

        let previous = lock(&self.local).device.replace(address);
        if previous == Some(address) {
            return;
        }

        if previous.is_some() {
            info!(device = %address, "device replaced, clearing account");
            {
                let mut local = lock(&self.local);
                local.account = None;
                local.account_device = None;
            }
            self.persist(ACCOUNT_KEY, Value::Null);
            self.persist(ACCOUNT_DEVICE_KEY, Value::Null);
        }

        match serde_json::to_value(DeviceRecord { address }) {
            Ok(record) => self.persist(DEVICE_KEY, record),
            Err(e) => debug!(error = %e, "device record not serialized"),
        }
    }

    async fn notify(&self, event: Event) {
        if let Err(e) = self.connection.send(event.encode()).await {
            debug!(kind = %event.kind(), error = %e, "relay not notified");
        }
    }

    async fn mute(&self) {
        self.connection.set_muted(true);
        self.notify(Event::MuteConnection).await;
    }

    fn cancel_if_muted(&self) {
        let mut link = self.link();
        if self.connection.is_muted() {
            link.cancel();
        }
    }

    async fn dispatch(&self, frame: &[u8]) {
        let event = match event::decode(frame) {
            Decoded::Event(event) => event,
            Decoded::Unrecognized(reason) => {
                debug!(%reason, len = frame.len(), "dropping frame");
                return;
            }
        };
        debug!(kind = %event.kind(), "event");

        match event {
            Event::ConnectionMuted => {
                let mut link = self.link();
                link.cancel();
                self.connection.set_muted(true);
            }
            Event::ConnectionUnmuted => {
                self.connection.set_muted(false);
            }
            Event::MuteConnection | Event::UnmuteConnection => {
                debug!("ignoring client-bound control event");
            }
            Event::AccountUpdated { account } => {
                if self.tracked_account() == Some(account) {
                    self.refresh_account().await;
                }
            }
            Event::AccountDeviceAdded(r) => {
                info!(account = %r.account, device = %r.device, "account device added");
            }
            Event::AccountDeviceUpdated(r) => {
                info!(account = %r.account, device = %r.device, "account device updated");
            }
            Event::AccountDeviceRemoved(r) => {
                info!(account = %r.account, device = %r.device, "account device removed");
            }
            Event::SignedSecureAction { device, signature } => {
                let resolved = self.link().resolve(&device, &signature);
                if resolved.is_some() {
                    self.mute().await;
                }
            }
        }
    }
}

async fn drive(
    shared: Arc<Shared>,
    mut config: watch::Receiver<Option<Config>>,
    mut device: watch::Receiver<Option<Arc<dyn Signer>>>,
    mut muted: watch::Receiver<bool>,
    mut frames: broadcast::Receiver<Vec<u8>>,
) {
    settle(&shared, &mut config, &mut device).await;

    loop {
        tokio::select! {
            Ok(()) = config.changed() => settle(&shared, &mut config, &mut device).await,
            Ok(()) = device.changed() => settle(&shared, &mut config, &mut device).await,
            Ok(()) = muted.changed() => {
                if *muted.borrow_and_update() {
                    shared.cancel_if_muted();
                }
            }
            frame = frames.recv() => match frame {
                Ok(frame) => shared.dispatch(&frame).await,
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "inbound frames dropped"),
                Err(RecvError::Closed) => break,
            },
            else => break,
        }
    }
}

/// Take both values at once so a pair of changes costs one reconcile
async fn settle(
    shared: &Shared,
    config: &mut watch::Receiver<Option<Config>>,
    device: &mut watch::Receiver<Option<Arc<dyn Signer>>>,
) {
    let current_config = config.borrow_and_update().clone();
    let current_device = device.borrow_and_update().clone();
    shared.reconcile(current_config, current_device).await;
}

/// Session and device-linking engine
///
/// Must be created inside a Tokio runtime.
pub struct Sdk {
    shared: Arc<Shared>,
    driver: JoinHandle<()>,
    errors: Mutex<Option<mpsc::UnboundedReceiver<SdkError>>>,
}

impl Sdk {
    /// Build the engine, restore persisted state and start the driver
    pub fn new(options: SdkOptions) -> Self {
        let (errors, errors_rx) = mpsc::unbounded_channel();
        let (config, _) = watch::channel(None);
        let (device, _) = watch::channel(None);

        let shared = Arc::new(Shared {
            backend: options.backend,
            store: options.store,
            session: SessionManager::new(),
            connection: ConnectionManager::new(options.connector),
            config,
            device,
            link: Mutex::new(SecureLinkCoordinator::new(String::new())),
            local: Mutex::new(LocalState::default()),
            errors,
        });
        shared.restore();

        let driver = tokio::spawn(drive(
            Arc::clone(&shared),
            shared.config.subscribe(),
            shared.device.subscribe(),
            shared.connection.subscribe_muted(),
            shared.connection.subscribe_frames(),
        ));

        Sdk {
            shared,
            driver,
            errors: Mutex::new(Some(errors_rx)),
        }
    }

    /// Apply a config, or clear it. Persisted as the settings for the next
    /// run.
    pub fn configure(&self, config: Option<Config>) {
        if *self.shared.config.borrow() == config {
            return;
        }

        match &config {
            Some(config) => {
                info!(network = %config.network, auth = ?config.auth, "configured");
                self.shared.apply_config(config);
                match serde_json::to_value(config) {
                    Ok(settings) => self.shared.persist(SETTINGS_KEY, settings),
                    Err(e) => self
                        .shared
                        .report(ConfigError::Parse(e.to_string()).into()),
                }
            }
            None => {
                info!("configuration cleared");
                self.shared.backend.set_endpoint(None);
                self.shared.persist(SETTINGS_KEY, Value::Null);
            }
        }

        self.shared.config.send_replace(config);
    }

    /// Applied config
    pub fn config(&self) -> Option<Config> {
        self.shared.config.borrow().clone()
    }

    /// Set or unset the signing device
    pub fn set_device(&self, device: Option<Arc<dyn Signer>>) {
        let address = device.as_ref().map(|d| d.address());
        let current = self.shared.device.borrow().as_ref().map(|d| d.address());
        if address == current {
            return;
        }

        info!(device = ?address, "device changed");
        self.shared.device_changed(address);
        self.shared.device.send_replace(device);
    }

    /// Address of the signing device
    pub fn device_address(&self) -> Option<Address> {
        self.shared.device.borrow().as_ref().map(|d| d.address())
    }

    /// Authenticate now, then open the connection.
    ///
    /// Overlapping calls are not serialized; wait for one to return before
    /// starting another.
    pub async fn create_session(&self) -> SdkResult<String> {
        let config = self.config().ok_or(SdkError::NotConfigured)?;
        let device = self
            .shared
            .device
            .borrow()
            .clone()
            .ok_or(SdkError::NoDevice)?;

        self.shared.authenticate(&config, device.as_ref()).await
    }

    /// Drop the session and close the connection
    pub fn destroy_session(&self) {
        self.shared.link().cancel();
        self.shared.session.set_as_destroyed();
        self.shared.connection.close(false);
    }

    /// Start a secure-link challenge and unmute the connection so the answer
    /// can arrive. Replaces any outstanding challenge.
    pub async fn create_challenge(&self, kind: SecureActionKind) -> SdkResult<LinkAction> {
        let device = self.device_address().ok_or(SdkError::NoDevice)?;
        if self.shared.config.borrow().is_none() {
            return Err(SdkError::NotConfigured);
        }

        let action = {
            let mut link = self.shared.link();
            self.shared.connection.set_muted(false);
            link.create_challenge(kind, device)
        };

        self.shared.notify(Event::UnmuteConnection).await;
        Ok(action)
    }

    /// Drop the outstanding challenge and re-mute; returns whether there was
    /// one
    pub async fn cancel_challenge(&self) -> bool {
        let cancelled = self.shared.link().cancel();
        if cancelled {
            self.shared.mute().await;
        }
        cancelled
    }

    /// The outstanding challenge, if any
    pub fn pending_challenge(&self) -> Option<SecureAction> {
        self.shared.link().pending().cloned()
    }

    /// Answer another device's challenge: sign its nonce and relay the
    /// signature back to the device that issued it
    pub async fn accept_link_action(&self, action: &LinkAction) -> SdkResult<()> {
        let payload = match &action.payload {
            LinkActionPayload::SecureAction(payload) => payload,
            LinkActionPayload::AccountDevice(_) => {
                return Err(LinkError::Unsupported("account-device".to_string()).into())
            }
        };

        let recipient = action
            .sender
            .as_ref()
            .ok_or_else(|| LinkError::Unsupported("secure action without sender".to_string()))?
            .device_address()?
            .ok_or_else(|| LinkError::Unsupported("secure action from an app".to_string()))?;

        if let Some(config) = self.config() {
            if config.network != payload.network {
                return Err(LinkError::Unsupported(format!(
                    "challenge for network {}",
                    payload.network
                ))
                .into());
            }
        }

        let device = self
            .shared
            .device
            .borrow()
            .clone()
            .ok_or(SdkError::NoDevice)?;
        let signature = device.sign_message(payload.hash.as_bytes()).await?;

        let answer = Event::SignedSecureAction {
            device: recipient,
            signature,
        };
        self.shared.connection.send(answer.encode()).await?;

        info!(to = %recipient, "secure challenge answered");
        Ok(())
    }

    /// Error channel; only the first call gets it
    pub fn take_errors(&self) -> Option<mpsc::UnboundedReceiver<SdkError>> {
        lock(&self.errors).take()
    }

    /// Observe actions produced by resolved challenges
    pub fn subscribe_link_actions(&self) -> broadcast::Receiver<LinkAction> {
        self.shared.link().subscribe()
    }

    /// Session snapshot
    pub fn session(&self) -> Session {
        self.shared.session.current()
    }

    /// Observe session snapshots
    pub fn subscribe_session(&self) -> watch::Receiver<Session> {
        self.shared.session.subscribe()
    }

    /// The connection, for state and subscriptions
    pub fn connection(&self) -> &ConnectionManager {
        &self.shared.connection
    }

    /// Local copy of the account attributes
    pub fn account(&self) -> Option<Value> {
        lock(&self.shared.local).account.clone()
    }

    /// Local copy of this device's account-device attributes
    pub fn account_device(&self) -> Option<Value> {
        lock(&self.shared.local).account_device.clone()
    }
}

impl Drop for Sdk {
    fn drop(&mut self) {
        self.driver.abort();
        self.shared.connection.close(true);
    }
}
