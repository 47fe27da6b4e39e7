//! Session Registry
//!
//! Owns every peer session of one torrent, keyed by `(file, peer, role)`,
//! and routes inbound messages to them. At most one session exists per key:
//! a connect for a key whose session is still draining is remembered and
//! replayed once that session has closed.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::leecher::LeecherSession;
use super::messages::{PeerMessage, SessionInput, SessionNotice, SessionState, TransferEvent};
use super::seeder::SeederSession;
use crate::error::{EngineError, Result};
use crate::transfer::FileTransferManager;
use crate::transport::{Envelope, PeerTransport};
use crate::types::{FileId, HandleId, Role};

/// Maximum number of events to buffer
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// How long `shutdown_all` waits for sessions to drain
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

struct SessionSlot {
    state: SessionState,
    inbox: mpsc::Sender<SessionInput>,
    task: JoinHandle<()>,
    /// Shutdown requested, waiting for the session to close
    draining: bool,
    /// Start a fresh session for this key once the draining one closes
    reconnect: bool,
}

/// Peer sessions of one torrent
pub struct SessionRegistry {
    /// Weak self-reference for background tasks
    self_ref: Weak<Self>,
    manager: Arc<FileTransferManager>,
    transport: Arc<dyn PeerTransport>,
    sessions: RwLock<HashMap<HandleId, SessionSlot>>,
    /// Peers leecher sessions are opened against
    sources: RwLock<BTreeSet<SocketAddr>>,
    notice_tx: mpsc::UnboundedSender<SessionNotice>,
    event_tx: broadcast::Sender<TransferEvent>,
    /// Signalled whenever a session leaves the map
    closed: Notify,
    closing: AtomicBool,
    shutdown: CancellationToken,
}

impl SessionRegistry {
    /// Create a registry over `manager`; must be called inside a tokio runtime
    pub fn new(manager: Arc<FileTransferManager>, transport: Arc<dyn PeerTransport>) -> Arc<Self> {
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let registry = Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            manager,
            transport,
            sessions: RwLock::new(HashMap::new()),
            sources: RwLock::new(BTreeSet::new()),
            notice_tx,
            event_tx,
            closed: Notify::new(),
            closing: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });

        Self::start_notice_task(Arc::downgrade(&registry), registry.shutdown.clone(), notice_rx);
        registry
    }

    fn start_notice_task(
        registry: Weak<Self>,
        shutdown: CancellationToken,
        mut notice_rx: mpsc::UnboundedReceiver<SessionNotice>,
    ) {
        tokio::spawn(async move {
            loop {
                let notice = tokio::select! {
                    notice = notice_rx.recv() => match notice {
                        Some(notice) => notice,
                        None => break,
                    },
                    _ = shutdown.cancelled() => break,
                };
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.on_notice(notice);
            }
        });
    }

    pub fn manager(&self) -> &Arc<FileTransferManager> {
        &self.manager
    }

    /// Subscribe to registry events
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.event_tx.subscribe()
    }

    /// Number of sessions, draining ones included
    pub fn size(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn state(&self, handle: HandleId) -> Option<SessionState> {
        self.sessions.read().get(&handle).map(|slot| slot.state)
    }

    pub fn handles(&self) -> Vec<HandleId> {
        self.sessions.read().keys().copied().collect()
    }

    pub fn sources(&self) -> Vec<SocketAddr> {
        self.sources.read().iter().copied().collect()
    }

    /// Create and start a session for `(file, peer, role)`
    ///
    /// Connecting an existing key returns its handle. If that session is
    /// draining, a fresh one is started after it closes.
    pub fn connect(&self, file: FileId, peer: SocketAddr, role: Role) -> Result<HandleId> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(EngineError::Shutdown);
        }
        let handle = HandleId::new(file, peer, role);

        let mut sessions = self.sessions.write();
        if let Some(slot) = sessions.get_mut(&handle) {
            if slot.draining && !slot.reconnect {
                tracing::debug!("{}: queued behind draining session", handle);
                slot.reconnect = true;
            }
            return Ok(handle);
        }

        let (inbox, rx) = mpsc::channel(self.manager.config().session.inbound_queue);
        let task = self.spawn_session(handle, rx)?;
        sessions.insert(
            handle,
            SessionSlot {
                state: SessionState::SettingUp,
                inbox,
                task,
                draining: false,
                reconnect: false,
            },
        );
        drop(sessions);

        tracing::debug!("{}: session started", handle);
        let _ = self.event_tx.send(TransferEvent::SessionStarted { handle });
        Ok(handle)
    }

    fn spawn_session(
        &self,
        handle: HandleId,
        rx: mpsc::Receiver<SessionInput>,
    ) -> Result<JoinHandle<()>> {
        let config = self.manager.config();
        let transport = Arc::clone(&self.transport);
        let notices = self.notice_tx.clone();
        let task = match handle.role {
            Role::Leecher => {
                self.manager.activate(handle.file)?;
                let store = self.manager.write_to(handle.file)?;
                LeecherSession::new(handle, store, transport, notices, config).spawn(rx)
            }
            Role::Seeder => {
                let view = self.manager.read_from(handle.file)?;
                SeederSession::new(handle, view, transport, notices, config).spawn(rx)
            }
        };
        Ok(task)
    }

    /// Ask a session to shut down; it leaves the map once it has closed
    pub async fn disconnect(&self, handle: HandleId) -> Result<()> {
        let inbox = {
            let mut sessions = self.sessions.write();
            let slot = sessions
                .get_mut(&handle)
                .ok_or_else(|| EngineError::NotFound(handle.to_string()))?;
            slot.draining = true;
            slot.reconnect = false;
            slot.inbox.clone()
        };
        if inbox.send(SessionInput::Shutdown).await.is_err() {
            tracing::debug!("{}: session already stopped", handle);
        }
        Ok(())
    }

    /// Wait until `handle` is no longer in the map
    pub async fn wait_closed(&self, handle: HandleId) {
        loop {
            let notified = self.closed.notified();
            if !self.sessions.read().contains_key(&handle) {
                return;
            }
            notified.await;
        }
    }

    /// Route a message received from `from` to its session
    ///
    /// A `SetupReq` for a file without a session opens a seeder session;
    /// other messages without a session are dropped.
    pub async fn deliver(&self, from: SocketAddr, msg: PeerMessage) -> Result<()> {
        let handle = HandleId::new(msg.file(), from, msg.target_role());
        let target = {
            let mut sessions = self.sessions.write();
            sessions.get_mut(&handle).map(|slot| {
                let winding_down = slot.draining || slot.state == SessionState::ShuttingDown;
                if winding_down && matches!(msg, PeerMessage::SetupReq { .. }) {
                    slot.reconnect = true;
                }
                slot.inbox.clone()
            })
        };

        if let Some(inbox) = target {
            if inbox.send(SessionInput::Peer(msg)).await.is_err() {
                tracing::debug!("{}: session gone, dropping message", handle);
            }
            return Ok(());
        }

        match msg {
            PeerMessage::SetupReq { file, .. } => match self.connect(file, from, Role::Seeder) {
                Ok(handle) => {
                    let inbox = self.sessions.read().get(&handle).map(|slot| slot.inbox.clone());
                    if let Some(inbox) = inbox {
                        let _ = inbox.send(SessionInput::Peer(msg)).await;
                    }
                    Ok(())
                }
                Err(e) => {
                    tracing::warn!("Refusing {} from {}: {}", file, from, e);
                    self.transport
                        .send(
                            from,
                            PeerMessage::Shutdown {
                                file,
                                from: Role::Seeder,
                            },
                        )
                        .await
                }
            },
            PeerMessage::Shutdown { file, from: role } => {
                self.transport
                    .send(
                        from,
                        PeerMessage::ShutdownAck {
                            file,
                            from: role.opposite(),
                        },
                    )
                    .await
            }
            other => {
                tracing::debug!("{}: no session for {}", handle, other.name());
                Ok(())
            }
        }
    }

    /// Feed inbound envelopes into [`deliver`](Self::deliver) until the
    /// stream ends or the registry shuts down
    pub fn attach(&self, mut rx: mpsc::UnboundedReceiver<Envelope>) -> JoinHandle<()> {
        let registry = self.self_ref.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let (from, msg) = tokio::select! {
                    envelope = rx.recv() => match envelope {
                        Some(envelope) => envelope,
                        None => break,
                    },
                    _ = shutdown.cancelled() => break,
                };
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                if let Err(e) = registry.deliver(from, msg).await {
                    tracing::debug!("Delivery from {} failed: {}", from, e);
                }
            }
        })
    }

    /// Download the torrent from `peer` alongside any existing sources
    ///
    /// Opens leecher sessions for ongoing files, then opens pending files as
    /// the ongoing limit allows.
    pub fn download_from(&self, peer: SocketAddr) -> Result<Vec<HandleId>> {
        self.sources.write().insert(peer);
        let mut handles = Vec::new();
        for file in self.manager.ongoing() {
            handles.push(self.connect(file, peer, Role::Leecher)?);
        }
        handles.extend(self.open_pending()?);
        Ok(handles)
    }

    fn open_pending(&self) -> Result<Vec<HandleId>> {
        let sources = self.sources();
        let mut handles = Vec::new();
        if sources.is_empty() {
            return Ok(handles);
        }
        while let Some(file) = self.manager.next_pending() {
            tracing::debug!("Opening {} against {} source(s)", file, sources.len());
            for &peer in &sources {
                handles.push(self.connect(file, peer, Role::Leecher)?);
            }
        }
        Ok(handles)
    }

    /// Apply a window delta to a leecher session
    pub async fn cwnd_control(&self, handle: HandleId, delta: i64) -> Result<()> {
        self.send_input(handle, SessionInput::CwndControl(delta)).await
    }

    /// Cap the blocks a leecher session holds in flight
    pub async fn mem_set(&self, handle: HandleId, max_active_blocks: usize) -> Result<()> {
        self.send_input(handle, SessionInput::MemSet(max_active_blocks)).await
    }

    async fn send_input(&self, handle: HandleId, input: SessionInput) -> Result<()> {
        let inbox = self
            .sessions
            .read()
            .get(&handle)
            .map(|slot| slot.inbox.clone())
            .ok_or_else(|| EngineError::NotFound(handle.to_string()))?;
        inbox.send(input).await.map_err(EngineError::from)
    }

    /// Shut down every session, then close the file stores
    pub async fn shutdown_all(&self) -> Result<()> {
        self.closing.store(true, Ordering::SeqCst);

        let handles = self.handles();
        for handle in handles {
            if let Err(e) = self.disconnect(handle).await {
                tracing::debug!("{}: {}", handle, e);
            }
        }

        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            loop {
                let notified = self.closed.notified();
                if self.sessions.read().is_empty() {
                    return;
                }
                notified.await;
            }
        })
        .await;

        if drained.is_err() {
            let stuck: Vec<SessionSlot> = self.sessions.write().drain().map(|(_, slot)| slot).collect();
            tracing::warn!("Aborting {} session(s) that did not drain", stuck.len());
            for slot in stuck {
                slot.task.abort();
            }
        }

        self.shutdown.cancel();
        self.manager.close().await
    }

    fn on_notice(&self, notice: SessionNotice) {
        match notice {
            SessionNotice::StateChanged { handle, state } => {
                if let Some(slot) = self.sessions.write().get_mut(&handle) {
                    slot.state = state;
                }
                let _ = self
                    .event_tx
                    .send(TransferEvent::SessionStateChanged { handle, state });
            }
            SessionNotice::Report { handle, report } => {
                let _ = self.event_tx.send(TransferEvent::Progress {
                    handle,
                    progress: report.progress,
                    cwnd: report.cwnd,
                });
            }
            SessionNotice::Unhealthy {
                handle,
                consecutive_timeouts,
            } => {
                tracing::warn!("{}: peer unresponsive ({} timeouts)", handle, consecutive_timeouts);
                let _ = self.event_tx.send(TransferEvent::SessionUnhealthy {
                    handle,
                    consecutive_timeouts,
                });
            }
            SessionNotice::FileComplete { handle } => self.on_file_complete(handle),
            SessionNotice::Closed {
                handle,
                incomplete,
                error,
            } => {
                let slot = self.sessions.write().remove(&handle);
                self.closed.notify_waiters();
                match &error {
                    Some(e) => tracing::warn!("{}: closed with error: {}", handle, e),
                    None => tracing::debug!("{}: removed", handle),
                }
                let _ = self.event_tx.send(TransferEvent::SessionClosed {
                    handle,
                    incomplete: incomplete.len(),
                    error,
                });

                let reconnect = slot.is_some_and(|slot| slot.reconnect);
                if reconnect && !self.closing.load(Ordering::SeqCst) {
                    if let Err(e) = self.connect(handle.file, handle.peer, handle.role) {
                        tracing::warn!("{}: reconnect failed: {}", handle, e);
                    }
                }
            }
        }
    }

    fn on_file_complete(&self, handle: HandleId) {
        match self.manager.complete_file(handle.file) {
            Ok(true) => {
                let _ = self
                    .event_tx
                    .send(TransferEvent::FileCompleted { file: handle.file });
                if self.manager.complete() {
                    tracing::info!("Torrent {} complete", self.manager.torrent());
                    let _ = self.event_tx.send(TransferEvent::TorrentCompleted {
                        torrent: self.manager.torrent(),
                    });
                } else if let Err(e) = self.open_pending() {
                    tracing::warn!("Failed to open next file: {}", e);
                }
            }
            Ok(false) => {}
            Err(e) => tracing::warn!("{}: cannot complete file: {}", handle, e),
        }
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransferConfig;
    use crate::storage::{BlockStorage, MemoryStorage};
    use crate::transfer::TorrentManifest;
    use crate::types::{BlockDetails, FileLayout, FileState, TorrentId};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Accepts and records every message
    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(SocketAddr, PeerMessage)>>,
    }

    #[async_trait]
    impl PeerTransport for RecordingTransport {
        async fn send(&self, peer: SocketAddr, msg: PeerMessage) -> Result<()> {
            self.sent.lock().push((peer, msg));
            Ok(())
        }
    }

    fn layout() -> FileLayout {
        FileLayout::new(8 * 1024, BlockDetails::new(1024))
    }

    fn peer() -> SocketAddr {
        "192.0.2.7:6881".parse().unwrap()
    }

    fn registry(seeding: bool) -> (Arc<SessionRegistry>, Arc<RecordingTransport>, FileId) {
        let manifest = TorrentManifest::new(TorrentId::from_name("registry"))
            .with_file("a.bin", layout())
            .with_file("b.bin", layout());
        let file = manifest.file_id("a.bin").unwrap();
        let content = vec![7u8; layout().length as usize];
        let manager = FileTransferManager::new(&manifest, TransferConfig::default(), seeding, |f| {
            let storage: Arc<dyn BlockStorage> = if seeding {
                Arc::new(MemoryStorage::seeded(f.layout, &content))
            } else {
                Arc::new(MemoryStorage::new(f.layout))
            };
            Ok(storage)
        })
        .unwrap();
        let transport = Arc::new(RecordingTransport::default());
        let registry = SessionRegistry::new(Arc::new(manager), transport.clone());
        (registry, transport, file)
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_waits_for_close() {
        let (registry, _transport, file) = registry(false);
        let mut events = registry.subscribe();

        let handle = registry.connect(file, peer(), Role::Leecher).unwrap();
        assert_eq!(registry.size(), 1);
        assert_eq!(registry.manager().state(file), Some(FileState::Ongoing));

        registry.disconnect(handle).await.unwrap();
        let again = registry.connect(file, peer(), Role::Leecher).unwrap();
        assert_eq!(again, handle);
        assert_eq!(registry.size(), 1);

        let mut closed = false;
        loop {
            match events.recv().await.unwrap() {
                TransferEvent::SessionClosed { handle: h, .. } if h == handle => closed = true,
                TransferEvent::SessionStarted { handle: h } if h == handle => {
                    if closed {
                        break;
                    }
                }
                _ => {}
            }
            assert!(registry.size() <= 1);
        }
        assert_eq!(registry.size(), 1);
        assert_eq!(registry.state(handle), Some(SessionState::SettingUp));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_removes_session() {
        let (registry, _transport, file) = registry(false);
        let handle = registry.connect(file, peer(), Role::Leecher).unwrap();
        registry.disconnect(handle).await.unwrap();
        registry.wait_closed(handle).await;
        assert_eq!(registry.size(), 0);
        assert!(registry.disconnect(handle).await.is_err());
    }

    #[tokio::test]
    async fn test_setup_opens_seeder() {
        let (registry, transport, file) = registry(true);
        registry
            .deliver(
                peer(),
                PeerMessage::SetupReq {
                    file,
                    msg_id: 11,
                    with_hashes: true,
                },
            )
            .await
            .unwrap();
        let handle = HandleId::new(file, peer(), Role::Seeder);
        assert!(registry.handles().contains(&handle));

        for _ in 0..100 {
            if !transport.sent.lock().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        let sent = transport.sent.lock().clone();
        assert!(matches!(
            sent.first(),
            Some((to, PeerMessage::SetupResp { msg_id: 11, .. })) if *to == peer()
        ));
    }

    #[tokio::test]
    async fn test_unknown_file_refused() {
        let (registry, transport, _file) = registry(false);
        let unknown = FileId::new(TorrentId::from_name("other"), 0);
        registry
            .deliver(
                peer(),
                PeerMessage::SetupReq {
                    file: unknown,
                    msg_id: 1,
                    with_hashes: false,
                },
            )
            .await
            .unwrap();
        assert_eq!(registry.size(), 0);
        let sent = transport.sent.lock().clone();
        assert!(matches!(
            sent.as_slice(),
            [(_, PeerMessage::Shutdown { from: Role::Seeder, .. })]
        ));
    }

    #[tokio::test]
    async fn test_stray_shutdown_acked() {
        let (registry, transport, file) = registry(false);
        registry
            .deliver(
                peer(),
                PeerMessage::Shutdown {
                    file,
                    from: Role::Leecher,
                },
            )
            .await
            .unwrap();
        let sent = transport.sent.lock().clone();
        assert!(matches!(
            sent.as_slice(),
            [(_, PeerMessage::ShutdownAck { from: Role::Seeder, .. })]
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_download_from_respects_file_limit() {
        let (registry, _transport, file) = registry(false);
        let handles = registry.download_from(peer()).unwrap();
        assert_eq!(handles.len(), 2);
        assert!(handles.contains(&HandleId::new(file, peer(), Role::Leecher)));
        assert!(!registry.manager().has_pending());

        registry.shutdown_all().await.unwrap();
        assert_eq!(registry.size(), 0);
        assert!(registry.connect(file, peer(), Role::Leecher).is_err());
    }
}
