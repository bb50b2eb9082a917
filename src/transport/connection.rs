//! Connection state machine
//!
//! [`ConnectionManager`] owns the one persistent channel a device keeps to
//! the relay. It tracks `Closed → Connecting → Opened`, mirrors the relay's
//! mute flag, fans inbound frames out to subscribers and, when configured,
//! keeps re-dialing after an unexpected drop.
//!
//! The manager is a cheap handle; clones share the same connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{Connector, Transport, TransportError, TransportResult};

/// Frames queued for sending before `send` starts waiting
const OUTBOUND_BUFFER: usize = 100;

/// Inbound frames retained for slow subscribers
const INBOUND_BUFFER: usize = 256;

/// Connection lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No channel exists
    Closed,
    /// A channel is being established
    Connecting,
    /// Frames can flow
    Opened,
}

/// Emitted when the connection is closed on purpose (non-silent close)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CloseNotice;

#[derive(Clone)]
struct Credentials {
    endpoint: String,
    token: String,
}

struct Link {
    outbound: mpsc::Sender<Vec<u8>>,
    generation: u64,
}

/// Outcome of one dial
enum Dial {
    Opened,
    /// A close or a newer open took over while dialing
    Superseded,
    Failed(TransportError),
}

struct Inner {
    connector: Arc<dyn Connector>,
    reconnect_interval: Mutex<Option<Duration>>,
    state: watch::Sender<ConnectionState>,
    muted: watch::Sender<bool>,
    frames: broadcast::Sender<Vec<u8>>,
    notices: broadcast::Sender<CloseNotice>,
    link: Mutex<Option<Link>>,
    credentials: Mutex<Option<Credentials>>,
    reconnect: Mutex<Option<JoinHandle<()>>>,
    generation: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Retire the current link and generation under the link lock, then
    /// publish `state`. The pump of a dropped link notices its outbound
    /// queue closing, closes the transport and exits without reporting a
    /// loss.
    fn advance(&self, state: ConnectionState) -> (u64, ConnectionState) {
        let mut link = lock(&self.link);
        link.take();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let previous = self.state.send_replace(state);
        (generation, previous)
    }

    async fn establish(self: &Arc<Self>, endpoint: &str, token: &str) -> Dial {
        let (generation, _) = self.advance(ConnectionState::Connecting);
        debug!(endpoint, "connecting");

        let result = self.connector.connect(endpoint, token).await;

        // Close and newer opens bump the generation under this lock, so a
        // stale dial can neither install its link nor touch the state.
        let mut link = lock(&self.link);
        if !self.is_current(generation) {
            debug!(endpoint, "dial superseded");
            return Dial::Superseded;
        }

        match result {
            Ok(transport) => {
                let (outbound, queue) = mpsc::channel(OUTBOUND_BUFFER);
                tokio::spawn(pump(Arc::clone(self), transport, queue, generation));
                *link = Some(Link {
                    outbound,
                    generation,
                });
                self.state.send_replace(ConnectionState::Opened);
                info!(endpoint, "connection opened");
                Dial::Opened
            }
            Err(e) => {
                self.state.send_replace(ConnectionState::Closed);
                warn!(endpoint, error = %e, "connection attempt failed");
                Dial::Failed(e)
            }
        }
    }

    fn link_lost(self: &Arc<Self>, generation: u64) {
        {
            let mut link = lock(&self.link);
            match link.as_ref() {
                Some(current) if current.generation == generation => {}
                _ => return,
            }
            *link = None;
            self.state.send_replace(ConnectionState::Closed);
        }

        warn!("connection lost");
        self.schedule_reconnect();
    }

    fn cancel_reconnect(&self) {
        if let Some(timer) = lock(&self.reconnect).take() {
            timer.abort();
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) -> bool {
        let Some(interval) = *lock(&self.reconnect_interval) else {
            return false;
        };
        // Held until the timer is stored so a concurrent close either sees
        // the timer or leaves no credentials to arm it with.
        let credentials = lock(&self.credentials);
        let Some(Credentials { endpoint, token }) = credentials.clone() else {
            return false;
        };

        let mut slot = lock(&self.reconnect);
        if let Some(previous) = slot.take() {
            previous.abort();
        }

        let inner = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                info!(%endpoint, "reconnecting");
                match inner.establish(&endpoint, &token).await {
                    Dial::Opened | Dial::Superseded => break,
                    Dial::Failed(e) => debug!(error = %e, "reconnect attempt failed"),
                }
            }
        }));

        debug!(?interval, "reconnect timer armed");
        true
    }
}

/// Moves frames between the transport and the manager until either side ends
async fn pump(
    inner: Arc<Inner>,
    mut transport: Box<dyn Transport>,
    mut queue: mpsc::Receiver<Vec<u8>>,
    generation: u64,
) {
    loop {
        tokio::select! {
            outgoing = queue.recv() => match outgoing {
                Some(frame) => {
                    if let Err(e) = transport.send(&frame).await {
                        warn!(error = %e, "send failed");
                        break;
                    }
                }
                None => {
                    // Released locally
                    let _ = transport.close().await;
                    return;
                }
            },
            incoming = transport.receive() => match incoming {
                Ok(frame) => {
                    // No subscribers is fine
                    let _ = inner.frames.send(frame);
                }
                Err(e) => {
                    debug!(error = %e, "receive ended");
                    break;
                }
            },
        }
    }

    inner.link_lost(generation);
}

/// Owner of the persistent channel
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Create a closed, muted manager
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Closed);
        let (muted, _) = watch::channel(true);
        let (frames, _) = broadcast::channel(INBOUND_BUFFER);
        let (notices, _) = broadcast::channel(16);

        ConnectionManager {
            inner: Arc::new(Inner {
                connector,
                reconnect_interval: Mutex::new(None),
                state,
                muted,
                frames,
                notices,
                link: Mutex::new(None),
                credentials: Mutex::new(None),
                reconnect: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Set or clear the reconnect interval. Takes effect on the next drop.
    pub fn set_reconnect_interval(&self, interval: Option<Duration>) {
        *lock(&self.inner.reconnect_interval) = interval;
    }

    /// Open a connection, replacing any existing one.
    ///
    /// Cancels a pending reconnect timer first. On failure the state returns
    /// to `Closed` and, when an interval is configured, the reconnect timer
    /// is armed. A dial overtaken by `close` or a newer `open` returns
    /// `Disconnected` and arms nothing.
    pub async fn open(&self, endpoint: &str, token: &str) -> TransportResult<()> {
        self.inner.cancel_reconnect();
        *lock(&self.inner.credentials) = Some(Credentials {
            endpoint: endpoint.to_string(),
            token: token.to_string(),
        });

        match self.inner.establish(endpoint, token).await {
            Dial::Opened => Ok(()),
            Dial::Superseded => Err(TransportError::Disconnected),
            Dial::Failed(e) => {
                self.inner.schedule_reconnect();
                Err(e)
            }
        }
    }

    /// Close the connection and disarm the reconnect timer.
    ///
    /// A non-silent close emits a [`CloseNotice`].
    pub fn close(&self, silent: bool) {
        lock(&self.inner.credentials).take();
        self.inner.cancel_reconnect();
        let (_, previous) = self.inner.advance(ConnectionState::Closed);
        if previous != ConnectionState::Closed {
            info!(silent, "connection closed");
        }

        if !silent {
            let _ = self.inner.notices.send(CloseNotice);
        }
    }

    /// Queue a frame for the relay
    pub async fn send(&self, frame: Vec<u8>) -> TransportResult<()> {
        if self.state() != ConnectionState::Opened {
            return Err(TransportError::InvalidConnectionState);
        }

        let outbound = lock(&self.inner.link)
            .as_ref()
            .map(|link| link.outbound.clone())
            .ok_or(TransportError::InvalidConnectionState)?;

        outbound
            .send(frame)
            .await
            .map_err(|_| TransportError::SendFailed("connection closed".to_string()))
    }

    /// Arm the reconnect timer, replacing any armed one.
    ///
    /// Returns false when no interval is configured or the connection holds
    /// no credentials (never opened, or closed explicitly).
    pub fn schedule_reconnect(&self) -> bool {
        self.inner.schedule_reconnect()
    }

    /// Disarm the reconnect timer
    pub fn cancel_reconnect(&self) {
        self.inner.cancel_reconnect();
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Current muted flag
    pub fn is_muted(&self) -> bool {
        *self.inner.muted.borrow()
    }

    /// Set the muted flag; returns true when it changed
    pub fn set_muted(&self, muted: bool) -> bool {
        self.inner.muted.send_if_modified(|current| {
            if *current == muted {
                return false;
            }
            *current = muted;
            true
        })
    }

    /// Observe state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Observe the muted flag
    pub fn subscribe_muted(&self) -> watch::Receiver<bool> {
        self.inner.muted.subscribe()
    }

    /// Observe raw inbound frames
    pub fn subscribe_frames(&self) -> broadcast::Receiver<Vec<u8>> {
        self.inner.frames.subscribe()
    }

    /// Observe deliberate closes
    pub fn subscribe_close_notices(&self) -> broadcast::Receiver<CloseNotice> {
        self.inner.notices.subscribe()
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("muted", &self.is_muted())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{MemoryConnector, MemoryPeer};
    use async_trait::async_trait;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::sync::{oneshot, Notify};

    /// Holds the first dial until the gate opens
    struct GatedConnector {
        inner: MemoryConnector,
        gate: Mutex<Option<oneshot::Receiver<()>>>,
        parked: Notify,
    }

    #[async_trait]
    impl Connector for GatedConnector {
        async fn connect(&self, endpoint: &str, token: &str) -> TransportResult<Box<dyn Transport>> {
            let gate = lock(&self.gate).take();
            if let Some(gate) = gate {
                self.parked.notify_one();
                let _ = gate.await;
            }
            self.inner.connect(endpoint, token).await
        }
    }

    fn gated_manager() -> (
        ConnectionManager,
        Arc<GatedConnector>,
        oneshot::Sender<()>,
        UnboundedReceiver<MemoryPeer>,
    ) {
        let (inner, peers) = MemoryConnector::new();
        let (release, gate) = oneshot::channel();
        let connector = Arc::new(GatedConnector {
            inner,
            gate: Mutex::new(Some(gate)),
            parked: Notify::new(),
        });
        let manager = ConnectionManager::new(connector.clone());
        (manager, connector, release, peers)
    }

    fn manager() -> (ConnectionManager, Arc<MemoryConnector>, UnboundedReceiver<MemoryPeer>) {
        let (connector, peers) = MemoryConnector::new();
        let connector = Arc::new(connector);
        let manager = ConnectionManager::new(connector.clone());
        (manager, connector, peers)
    }

    async fn wait_for(rx: &mut watch::Receiver<ConnectionState>, state: ConnectionState) {
        rx.wait_for(|current| *current == state).await.unwrap();
    }

    #[tokio::test]
    async fn test_open_reaches_opened() {
        let (manager, _connector, mut peers) = manager();

        manager.open("mem://relay", "token-1").await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Opened);

        let peer = peers.recv().await.unwrap();
        assert_eq!(peer.token, "token-1");
    }

    #[tokio::test]
    async fn test_open_failure_returns_to_closed() {
        let (manager, connector, _peers) = manager();
        connector.set_refuse(true);

        assert!(manager.open("mem://relay", "token").await.is_err());
        assert_eq!(manager.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_send_requires_opened() {
        let (manager, _connector, _peers) = manager();
        let mut states = manager.subscribe_state();

        assert_eq!(
            manager.send(vec![1, 2, 3]).await,
            Err(TransportError::InvalidConnectionState)
        );
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert!(!states.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let (manager, _connector, mut peers) = manager();
        let mut frames = manager.subscribe_frames();

        manager.open("mem://relay", "token").await.unwrap();
        let mut peer = peers.recv().await.unwrap();

        manager.send(b"up".to_vec()).await.unwrap();
        assert_eq!(peer.transport.receive().await.unwrap(), b"up");

        peer.transport.send(b"down").await.unwrap();
        assert_eq!(frames.recv().await.unwrap(), b"down");
    }

    #[tokio::test]
    async fn test_reopen_replaces_connection() {
        let (manager, connector, mut peers) = manager();

        manager.open("mem://relay", "old").await.unwrap();
        let mut old_peer = peers.recv().await.unwrap();

        manager.open("mem://relay", "new").await.unwrap();
        let new_peer = peers.recv().await.unwrap();
        assert_eq!(new_peer.token, "new");
        assert_eq!(connector.attempts(), 2);

        // The old channel is closed by the client
        assert_eq!(old_peer.transport.receive().await, Err(TransportError::Disconnected));
        assert_eq!(manager.state(), ConnectionState::Opened);
    }

    #[tokio::test]
    async fn test_peer_drop_closes_connection() {
        let (manager, _connector, mut peers) = manager();
        let mut states = manager.subscribe_state();

        manager.open("mem://relay", "token").await.unwrap();
        drop(peers.recv().await.unwrap());

        wait_for(&mut states, ConnectionState::Closed).await;
    }

    #[tokio::test]
    async fn test_close_notice_only_when_not_silent() {
        let (manager, _connector, _peers) = manager();
        let mut notices = manager.subscribe_close_notices();

        manager.open("mem://relay", "token").await.unwrap();
        manager.close(true);
        assert!(notices.try_recv().is_err());

        manager.open("mem://relay", "token").await.unwrap();
        manager.close(false);
        assert_eq!(notices.try_recv().unwrap(), CloseNotice);
        assert_eq!(manager.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_muted_flag() {
        let (manager, _connector, _peers) = manager();

        assert!(manager.is_muted());
        assert!(manager.set_muted(false));
        assert!(!manager.set_muted(false));
        assert!(!manager.is_muted());
    }

    #[tokio::test]
    async fn test_send_allowed_while_muted() {
        let (manager, _connector, mut peers) = manager();

        manager.open("mem://relay", "token").await.unwrap();
        let mut peer = peers.recv().await.unwrap();
        assert!(manager.is_muted());

        manager.send(b"still flows".to_vec()).await.unwrap();
        assert_eq!(peer.transport.receive().await.unwrap(), b"still flows");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_after_unexpected_drop() {
        let (manager, connector, mut peers) = manager();
        manager.set_reconnect_interval(Some(Duration::from_secs(5)));
        let mut states = manager.subscribe_state();

        manager.open("mem://relay", "token").await.unwrap();
        drop(peers.recv().await.unwrap());
        wait_for(&mut states, ConnectionState::Closed).await;

        let peer = peers.recv().await.unwrap();
        assert_eq!(peer.token, "token");
        wait_for(&mut states, ConnectionState::Opened).await;
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearming_keeps_single_timer() {
        let (manager, connector, _peers) = manager();
        manager.set_reconnect_interval(Some(Duration::from_secs(5)));
        connector.set_refuse(true);

        // Failed open arms the timer once
        assert!(manager.open("mem://relay", "token").await.is_err());
        assert!(manager.schedule_reconnect());
        assert!(manager.schedule_reconnect());

        tokio::time::sleep(Duration::from_millis(5_001)).await;
        assert_eq!(connector.attempts(), 2);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(connector.attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_disarms_timer() {
        let (manager, connector, _peers) = manager();
        manager.set_reconnect_interval(Some(Duration::from_secs(1)));
        connector.set_refuse(true);

        assert!(manager.open("mem://relay", "token").await.is_err());
        manager.close(true);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(connector.attempts(), 1);
        assert!(!manager.schedule_reconnect());
    }

    #[tokio::test]
    async fn test_no_reconnect_without_interval() {
        let (manager, _connector, _peers) = manager();

        manager.open("mem://relay", "token").await.unwrap();
        assert!(!manager.schedule_reconnect());
    }

    #[tokio::test]
    async fn test_dial_finishing_after_close_stays_closed() {
        let (manager, connector, release, _peers) = gated_manager();

        let dialing = tokio::spawn({
            let manager = manager.clone();
            async move { manager.open("mem://relay", "token").await }
        });
        connector.parked.notified().await;

        manager.close(true);
        release.send(()).unwrap();

        assert_eq!(dialing.await.unwrap(), Err(TransportError::Disconnected));
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert_eq!(
            manager.send(b"late".to_vec()).await,
            Err(TransportError::InvalidConnectionState)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_close_during_dial_never_leaves_opened() {
        for _ in 0..200 {
            let (manager, connector, release, _peers) = gated_manager();

            let dialing = tokio::spawn({
                let manager = manager.clone();
                async move { manager.open("mem://relay", "token").await }
            });
            connector.parked.notified().await;

            let closing = tokio::spawn({
                let manager = manager.clone();
                async move { manager.close(true) }
            });
            release.send(()).unwrap();

            closing.await.unwrap();
            let _ = dialing.await.unwrap();
            assert_eq!(manager.state(), ConnectionState::Closed);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_open_arms_no_timer() {
        let (manager, connector, release, mut peers) = gated_manager();
        manager.set_reconnect_interval(Some(Duration::from_secs(5)));

        let first = tokio::spawn({
            let manager = manager.clone();
            async move { manager.open("mem://relay", "a").await }
        });
        connector.parked.notified().await;

        manager.open("mem://relay", "b").await.unwrap();
        let live = peers.recv().await.unwrap();
        assert_eq!(live.token, "b");

        release.send(()).unwrap();
        assert_eq!(first.await.unwrap(), Err(TransportError::Disconnected));

        tokio::time::sleep(Duration::from_secs(12)).await;
        assert_eq!(manager.state(), ConnectionState::Opened);
        assert_eq!(connector.inner.attempts(), 2);
    }
}
