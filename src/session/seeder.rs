//! Seeder session
//!
//! Serves one file to one peer from a [`CompleteFile`] view. Anything the
//! view cannot serve is left out of the response; the leecher notices the
//! gap and asks again.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::messages::{PeerMessage, SessionInput, SessionNotice, SessionReport, SessionState};
use crate::config::TransferConfig;
use crate::storage::ReaderId;
use crate::transfer::CompleteFile;
use crate::transport::PeerTransport;
use crate::types::{BlockNr, FileId, FileLayout, HandleId, MsgId, Role};

static NEXT_READER: AtomicU64 = AtomicU64::new(1);

fn next_reader() -> ReaderId {
    ReaderId(NEXT_READER.fetch_add(1, Ordering::Relaxed))
}

/// One block request to answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServeRequest {
    pub msg_id: MsgId,
    pub blocks: BTreeSet<BlockNr>,
    pub hashes: BTreeSet<BlockNr>,
    pub with_hashes: bool,
    pub cache_hint: BTreeSet<BlockNr>,
}

#[derive(Debug, Clone)]
pub enum SeederEvent {
    Peer { msg: PeerMessage, now: Instant },
    /// A serve task produced its response
    Served { msg_id: MsgId, response: PeerMessage },
    Tick { now: Instant },
    Report,
    Shutdown { now: Instant },
    Fatal { error: String, now: Instant },
}

#[derive(Debug, Clone)]
pub enum SeederEffect {
    Send(PeerMessage),
    Serve(ServeRequest),
    /// Drop read-ahead state held for this peer; emitted once no serve is left
    Clean,
    Report(SessionReport),
    Notify(SessionNotice),
    Closed { error: Option<String> },
}

/// Transition function of a seeder session
pub struct SeederMachine {
    handle: HandleId,
    layout: FileLayout,
    state: SessionState,
    with_hashes: bool,
    timeout: Duration,
    serving: BTreeSet<MsgId>,
    blocks_transferred: u64,
    awaiting_ack: bool,
    shutdown_deadline: Option<Instant>,
    error: Option<String>,
}

impl SeederMachine {
    pub fn new(handle: HandleId, layout: FileLayout, config: &TransferConfig) -> Self {
        Self {
            handle,
            layout,
            state: SessionState::SettingUp,
            with_hashes: config.session.with_hashes,
            timeout: config.session.request_timeout(),
            serving: BTreeSet::new(),
            blocks_transferred: 0,
            awaiting_ack: false,
            shutdown_deadline: None,
            error: None,
        }
    }

    pub fn handle_id(&self) -> HandleId {
        self.handle
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Requests being read from storage
    pub fn serving(&self) -> usize {
        self.serving.len()
    }

    pub fn handle(&mut self, event: SeederEvent) -> Vec<SeederEffect> {
        let mut effects = Vec::new();
        match event {
            SeederEvent::Peer { msg, now } => self.on_peer(msg, now, &mut effects),
            SeederEvent::Served { msg_id, response } => {
                self.on_served(msg_id, response, &mut effects)
            }
            SeederEvent::Tick { now } => {
                if self.state == SessionState::ShuttingDown
                    && self.awaiting_ack
                    && self.shutdown_deadline.is_some_and(|d| d <= now)
                {
                    tracing::debug!("{}: no shutdown ack, closing anyway", self.handle);
                    self.awaiting_ack = false;
                    self.maybe_close(&mut effects);
                }
            }
            SeederEvent::Report => effects.push(SeederEffect::Report(SessionReport {
                blocks_in_flight: self.serving.len(),
                blocks_transferred: self.blocks_transferred,
                ..SessionReport::default()
            })),
            SeederEvent::Shutdown { now } => self.begin_shutdown(now, false, &mut effects),
            SeederEvent::Fatal { error, now } => {
                tracing::error!("{}: {}", self.handle, error);
                self.error.get_or_insert(error);
                self.begin_shutdown(now, false, &mut effects);
                self.awaiting_ack = false;
                self.maybe_close(&mut effects);
            }
        }
        effects
    }

    fn set_state(&mut self, state: SessionState, effects: &mut Vec<SeederEffect>) {
        tracing::debug!("{}: {} -> {}", self.handle, self.state, state);
        self.state = state;
        effects.push(SeederEffect::Notify(SessionNotice::StateChanged {
            handle: self.handle,
            state,
        }));
    }

    fn on_peer(&mut self, msg: PeerMessage, now: Instant, effects: &mut Vec<SeederEffect>) {
        match msg {
            PeerMessage::SetupReq {
                msg_id,
                with_hashes,
                ..
            } => {
                if matches!(self.state, SessionState::ShuttingDown | SessionState::Closed) {
                    tracing::debug!("{}: ignoring SetupReq while {}", self.handle, self.state);
                    return;
                }
                // a repeated SetupReq means our response was lost
                effects.push(SeederEffect::Send(PeerMessage::SetupResp {
                    file: self.handle.file,
                    msg_id,
                    default_block: self.layout.default_block,
                    length: self.layout.length,
                    with_hashes: with_hashes && self.with_hashes,
                }));
                if self.state == SessionState::SettingUp {
                    self.set_state(SessionState::Active, effects);
                }
            }
            PeerMessage::BlocksReq {
                msg_id,
                blocks,
                hashes,
                with_hashes,
                cache_hint,
                ..
            } => {
                if self.state != SessionState::Active {
                    tracing::debug!("{}: ignoring BlocksReq {} while {}", self.handle, msg_id, self.state);
                    return;
                }
                if !self.serving.insert(msg_id) {
                    tracing::debug!("{}: request {} already being served", self.handle, msg_id);
                    return;
                }
                effects.push(SeederEffect::Serve(ServeRequest {
                    msg_id,
                    blocks,
                    hashes,
                    with_hashes,
                    cache_hint,
                }));
            }
            PeerMessage::Shutdown { .. } => self.begin_shutdown(now, true, effects),
            PeerMessage::ShutdownAck { .. } => {
                self.awaiting_ack = false;
                self.maybe_close(effects);
            }
            other => {
                tracing::warn!("{}: unexpected {} for a seeder", self.handle, other.name());
            }
        }
    }

    fn on_served(&mut self, msg_id: MsgId, response: PeerMessage, effects: &mut Vec<SeederEffect>) {
        self.serving.remove(&msg_id);
        if self.state == SessionState::Active {
            if let PeerMessage::BlocksResp { blocks, .. } = &response {
                self.blocks_transferred += blocks.len() as u64;
            }
            effects.push(SeederEffect::Send(response));
        }
        self.maybe_close(effects);
    }

    fn begin_shutdown(&mut self, now: Instant, remote: bool, effects: &mut Vec<SeederEffect>) {
        let file = self.handle.file;
        match self.state {
            SessionState::Closed => return,
            SessionState::ShuttingDown => {
                if remote {
                    effects.push(SeederEffect::Send(PeerMessage::ShutdownAck {
                        file,
                        from: Role::Seeder,
                    }));
                    self.awaiting_ack = false;
                    self.maybe_close(effects);
                }
                return;
            }
            SessionState::SettingUp | SessionState::Active => {}
        }

        self.set_state(SessionState::ShuttingDown, effects);
        if remote {
            effects.push(SeederEffect::Send(PeerMessage::ShutdownAck {
                file,
                from: Role::Seeder,
            }));
        } else {
            effects.push(SeederEffect::Send(PeerMessage::Shutdown {
                file,
                from: Role::Seeder,
            }));
            self.awaiting_ack = true;
            self.shutdown_deadline = Some(now + self.timeout);
        }
        self.maybe_close(effects);
    }

    fn maybe_close(&mut self, effects: &mut Vec<SeederEffect>) {
        if self.state != SessionState::ShuttingDown || self.awaiting_ack || !self.serving.is_empty() {
            return;
        }
        tracing::debug!("{}: closed", self.handle);
        self.state = SessionState::Closed;
        effects.push(SeederEffect::Clean);
        effects.push(SeederEffect::Closed {
            error: self.error.clone(),
        });
    }
}

/// Answer a block request from `view`
///
/// Hashes cover the explicitly requested ones plus, with `with_hashes`, every
/// requested block. Blocks or hashes that cannot be read are omitted.
pub async fn serve_blocks(
    view: &CompleteFile,
    reader: ReaderId,
    file: FileId,
    request: &ServeRequest,
) -> PeerMessage {
    if !request.cache_hint.is_empty() {
        view.set_cache_hint(reader, &request.cache_hint);
    }

    let mut wanted_hashes = request.hashes.clone();
    if request.with_hashes {
        wanted_hashes.extend(request.blocks.iter().copied());
    }

    let mut hashes = BTreeMap::new();
    for nr in wanted_hashes {
        if !view.has_hash(nr) {
            continue;
        }
        match view.read_hash(nr).await {
            Ok(hash) => {
                hashes.insert(nr, hash);
            }
            Err(e) => tracing::debug!("{}: hash {} unavailable: {}", file, nr, e),
        }
    }

    let layout = view.layout();
    let mut blocks = BTreeMap::new();
    let mut irregular_blocks = BTreeMap::new();
    for &nr in &request.blocks {
        if !view.has_block(nr) {
            continue;
        }
        match view.read_block(nr).await {
            Ok(data) => {
                if let Some(details) = layout.irregular_details(nr) {
                    irregular_blocks.insert(nr, details);
                }
                blocks.insert(nr, data);
            }
            Err(e) => tracing::debug!("{}: block {} unavailable: {}", file, nr, e),
        }
    }

    PeerMessage::BlocksResp {
        file,
        msg_id: request.msg_id,
        hashes,
        blocks,
        irregular_blocks,
    }
}

/// Task driving a [`SeederMachine`] against a read view and a transport
pub struct SeederSession {
    machine: SeederMachine,
    view: Arc<CompleteFile>,
    reader: ReaderId,
    transport: Arc<dyn PeerTransport>,
    notices: mpsc::UnboundedSender<SessionNotice>,
    /// Cancelled once shutdown starts; later serves skip the cache hint
    stopping: CancellationToken,
    tick_interval: Duration,
    report_interval: Duration,
}

impl SeederSession {
    pub fn new(
        handle: HandleId,
        view: Arc<CompleteFile>,
        transport: Arc<dyn PeerTransport>,
        notices: mpsc::UnboundedSender<SessionNotice>,
        config: &TransferConfig,
    ) -> Self {
        Self {
            machine: SeederMachine::new(handle, view.layout(), config),
            view,
            reader: next_reader(),
            transport,
            notices,
            stopping: CancellationToken::new(),
            tick_interval: config.session.tick_interval(),
            report_interval: config.session.report_interval(),
        }
    }

    pub fn spawn(self, inbox: mpsc::Receiver<SessionInput>) -> JoinHandle<()> {
        tokio::spawn(self.run(inbox))
    }

    async fn run(mut self, mut inbox: mpsc::Receiver<SessionInput>) {
        let handle = self.machine.handle_id();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        let start = Instant::now();
        let mut tick = interval_at(start + self.tick_interval, self.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut report = interval_at(start + self.report_interval, self.report_interval);
        report.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::debug!("{}: seeder session started", handle);
        let mut inbox_open = true;
        let mut closed = false;

        while !closed {
            let event = tokio::select! {
                input = inbox.recv(), if inbox_open => match input {
                    Some(SessionInput::Peer(msg)) => SeederEvent::Peer { msg, now: Instant::now() },
                    Some(SessionInput::Shutdown) => SeederEvent::Shutdown { now: Instant::now() },
                    // window and memory controls only pace leechers
                    Some(SessionInput::CwndControl(_)) | Some(SessionInput::MemSet(_)) => continue,
                    None => {
                        inbox_open = false;
                        SeederEvent::Shutdown { now: Instant::now() }
                    }
                },
                Some(event) = done_rx.recv() => event,
                _ = tick.tick() => SeederEvent::Tick { now: Instant::now() },
                _ = report.tick() => SeederEvent::Report,
            };
            closed = self.dispatch(event, &done_tx).await;
        }
        tracing::debug!("{}: seeder session ended", handle);
    }

    async fn dispatch(
        &mut self,
        event: SeederEvent,
        done_tx: &mpsc::UnboundedSender<SeederEvent>,
    ) -> bool {
        let handle = self.machine.handle_id();
        let mut queue: VecDeque<SeederEffect> = self.machine.handle(event).into();
        let mut closed = false;
        if matches!(
            self.machine.state(),
            SessionState::ShuttingDown | SessionState::Closed
        ) {
            self.stopping.cancel();
        }

        while let Some(effect) = queue.pop_front() {
            match effect {
                SeederEffect::Send(msg) => {
                    if let Err(e) = self.transport.send(handle.peer, msg).await {
                        tracing::warn!("{}: send failed: {}", handle, e);
                        queue.extend(self.machine.handle(SeederEvent::Fatal {
                            error: e.to_string(),
                            now: Instant::now(),
                        }));
                    }
                }
                SeederEffect::Serve(mut request) => {
                    let view = Arc::clone(&self.view);
                    let reader = self.reader;
                    let done_tx = done_tx.clone();
                    let stopping = self.stopping.clone();
                    tokio::spawn(async move {
                        if stopping.is_cancelled() {
                            request.cache_hint.clear();
                        }
                        let response = serve_blocks(&view, reader, handle.file, &request).await;
                        let _ = done_tx.send(SeederEvent::Served {
                            msg_id: request.msg_id,
                            response,
                        });
                    });
                }
                SeederEffect::Clean => self.view.clean(self.reader),
                SeederEffect::Report(mut report) => {
                    report.progress = self.view.report();
                    let _ = self.notices.send(SessionNotice::Report { handle, report });
                }
                SeederEffect::Notify(notice) => {
                    let _ = self.notices.send(notice);
                }
                SeederEffect::Closed { error } => {
                    let _ = self.notices.send(SessionNotice::Closed {
                        handle,
                        incomplete: BTreeSet::new(),
                        error,
                    });
                    closed = true;
                }
            }
        }
        closed
    }
}
