//! Leecher session
//!
//! Downloads one file from one peer. [`LeecherMachine`] is the transition
//! function: it consumes [`LeecherEvent`]s and returns [`LeecherEffect`]s
//! without touching storage or the network. [`LeecherSession`] is the task
//! that feeds it timers and inbound messages and carries out its effects.
//!
//! Request pacing: the number of blocks requested at once is bounded by the
//! congestion window (blocks on the wire) and by the memory cap (blocks on
//! the wire plus blocks being stored). Each resolved batch yields a delay
//! sample; the congestion verdict adjusts the window.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};

use super::messages::{PeerMessage, SessionInput, SessionNotice, SessionReport, SessionState};
use super::pending::PendingRequests;
use super::window::RequestWindow;
use crate::config::TransferConfig;
use crate::congestion::CongestionController;
use crate::transfer::{BlockOutcome, IncompleteFile};
use crate::transport::PeerTransport;
use crate::types::{BlockDetails, BlockNr, FileLayout, HandleId, MsgId, Role};

/// Blocks and hashes of one response, ready to be persisted
#[derive(Debug, Clone)]
pub struct StoreBatch {
    pub msg_id: MsgId,
    pub sent_at: Instant,
    pub hashes: BTreeMap<BlockNr, Bytes>,
    pub missing_hashes: BTreeSet<BlockNr>,
    pub blocks: BTreeMap<BlockNr, Bytes>,
    pub missing_blocks: BTreeSet<BlockNr>,
}

/// Outcome of persisting a [`StoreBatch`]
#[derive(Debug, Clone)]
pub struct StoreResult {
    pub msg_id: MsgId,
    pub sent_at: Instant,
    /// Blocks handed to the store
    pub blocks: usize,
    /// Blocks verified and persisted
    pub stored: usize,
    /// Requested blocks that were not persisted: missing from the response,
    /// requeued by the store or lost to a failed write
    pub unresolved: BTreeSet<BlockNr>,
    pub file_complete: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub enum LeecherEvent {
    Start {
        now: Instant,
    },
    Peer {
        msg: PeerMessage,
        now: Instant,
    },
    /// Work handed out by the block store after a `Download` effect
    Claimed {
        hashes: BTreeSet<BlockNr>,
        blocks: BTreeSet<BlockNr>,
        irregular_blocks: BTreeMap<BlockNr, BlockDetails>,
        file_complete: bool,
        now: Instant,
    },
    Completed {
        result: StoreResult,
        now: Instant,
    },
    Tick {
        now: Instant,
    },
    /// Base-delay round timer
    Advance,
    Report,
    CwndControl(i64),
    MemSet(usize),
    Shutdown {
        now: Instant,
    },
    Fatal {
        error: String,
        now: Instant,
    },
}

#[derive(Debug, Clone)]
pub enum LeecherEffect {
    Send(PeerMessage),
    /// Claim up to `requested_blocks` blocks (and a hash batch if wanted)
    Download {
        requested_blocks: usize,
        want_hashes: bool,
    },
    Store(StoreBatch),
    /// Return blocks and hashes to the block store
    Requeue {
        blocks: BTreeSet<BlockNr>,
        hashes: BTreeSet<BlockNr>,
    },
    /// Activity summary; the driver fills in progress
    Report(SessionReport),
    Notify(SessionNotice),
    Closed {
        incomplete: BTreeSet<BlockNr>,
        error: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutdownCause {
    Local,
    Remote,
    Fatal,
}

/// Transition function of a leecher session
pub struct LeecherMachine {
    handle: HandleId,
    layout: FileLayout,
    state: SessionState,
    controller: CongestionController,
    window: RequestWindow,
    pending: PendingRequests,
    setup: Option<(MsgId, Instant)>,
    next_msg_id: MsgId,
    with_hashes: bool,
    max_active: usize,
    storing_batches: usize,
    storing_blocks: usize,
    claiming: bool,
    expected_irregular: BTreeMap<BlockNr, BlockDetails>,
    consecutive_timeouts: u32,
    health_threshold: u32,
    blocks_transferred: u64,
    incomplete: BTreeSet<BlockNr>,
    awaiting_ack: bool,
    shutdown_deadline: Option<Instant>,
    error: Option<String>,
    complete_reported: bool,
}

impl LeecherMachine {
    pub fn new(handle: HandleId, layout: FileLayout, config: &TransferConfig) -> Self {
        let session = &config.session;
        let congestion = &config.congestion;
        Self {
            handle,
            layout,
            state: SessionState::SettingUp,
            controller: CongestionController::with_params(
                congestion.mode,
                congestion.history_size,
                congestion.target_delay(),
                congestion.base_round(),
            )
            .with_gain(congestion.gain),
            window: RequestWindow::new(session.initial_cwnd, session.min_cwnd, session.max_cwnd),
            pending: PendingRequests::new(session.request_timeout()),
            setup: None,
            next_msg_id: rand::random::<u32>() as MsgId,
            with_hashes: session.with_hashes,
            max_active: session.max_active_blocks,
            storing_batches: 0,
            storing_blocks: 0,
            claiming: false,
            expected_irregular: BTreeMap::new(),
            consecutive_timeouts: 0,
            health_threshold: session.timeout_health_threshold,
            blocks_transferred: 0,
            incomplete: BTreeSet::new(),
            awaiting_ack: false,
            shutdown_deadline: None,
            error: None,
            complete_reported: false,
        }
    }

    pub fn handle_id(&self) -> HandleId {
        self.handle
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn cwnd(&self) -> u32 {
        self.window.cwnd()
    }

    /// Hashes negotiated to travel with their blocks
    pub fn with_hashes(&self) -> bool {
        self.with_hashes
    }

    pub fn blocks_in_flight(&self) -> usize {
        self.pending.blocks_in_flight()
    }

    pub fn blocks_storing(&self) -> usize {
        self.storing_blocks
    }

    /// Blocks that may be requested right now
    pub fn budget(&self) -> usize {
        let wire = self.pending.blocks_in_flight();
        let active = wire + self.storing_blocks;
        self.window
            .available(wire)
            .min(self.max_active.saturating_sub(active))
    }

    pub fn handle(&mut self, event: LeecherEvent) -> Vec<LeecherEffect> {
        let mut effects = Vec::new();
        match event {
            LeecherEvent::Start { now } => self.on_start(now, &mut effects),
            LeecherEvent::Peer { msg, now } => self.on_peer(msg, now, &mut effects),
            LeecherEvent::Claimed {
                hashes,
                blocks,
                irregular_blocks,
                file_complete,
                now,
            } => self.on_claimed(hashes, blocks, irregular_blocks, file_complete, now, &mut effects),
            LeecherEvent::Completed { result, now } => self.on_completed(result, now, &mut effects),
            LeecherEvent::Tick { now } => self.on_tick(now, &mut effects),
            LeecherEvent::Advance => self.controller.advance_round(),
            LeecherEvent::Report => effects.push(LeecherEffect::Report(SessionReport {
                cwnd: self.window.cwnd(),
                blocks_in_flight: self.pending.blocks_in_flight() + self.storing_blocks,
                blocks_transferred: self.blocks_transferred,
                queuing_delay: self.controller.queuing_delay(),
                ..SessionReport::default()
            })),
            LeecherEvent::CwndControl(delta) => {
                self.window.apply(delta);
                self.try_download(&mut effects);
            }
            LeecherEvent::MemSet(max) => {
                self.max_active = max.max(1);
                self.try_download(&mut effects);
            }
            LeecherEvent::Shutdown { now } => {
                self.begin_shutdown(now, ShutdownCause::Local, &mut effects)
            }
            LeecherEvent::Fatal { error, now } => self.on_fatal(error, now, &mut effects),
        }
        effects
    }

    fn next_id(&mut self) -> MsgId {
        self.next_msg_id = self.next_msg_id.wrapping_add(1);
        self.next_msg_id
    }

    fn set_state(&mut self, state: SessionState, effects: &mut Vec<LeecherEffect>) {
        tracing::debug!("{}: {} -> {}", self.handle, self.state, state);
        self.state = state;
        effects.push(LeecherEffect::Notify(SessionNotice::StateChanged {
            handle: self.handle,
            state,
        }));
    }

    fn send_setup(&mut self, now: Instant, effects: &mut Vec<LeecherEffect>) {
        let msg_id = self.next_id();
        self.setup = Some((msg_id, now + self.pending.timeout()));
        effects.push(LeecherEffect::Send(PeerMessage::SetupReq {
            file: self.handle.file,
            msg_id,
            with_hashes: self.with_hashes,
        }));
    }

    fn on_start(&mut self, now: Instant, effects: &mut Vec<LeecherEffect>) {
        if self.state != SessionState::SettingUp || self.setup.is_some() {
            return;
        }
        self.send_setup(now, effects);
    }

    fn on_peer(&mut self, msg: PeerMessage, now: Instant, effects: &mut Vec<LeecherEffect>) {
        match msg {
            PeerMessage::SetupResp {
                msg_id,
                default_block,
                length,
                with_hashes,
                ..
            } => self.on_setup_resp(msg_id, default_block, length, with_hashes, now, effects),
            PeerMessage::BlocksResp {
                msg_id,
                hashes,
                blocks,
                irregular_blocks,
                ..
            } => self.on_blocks_resp(msg_id, hashes, blocks, irregular_blocks, effects),
            PeerMessage::Shutdown { .. } => {
                self.begin_shutdown(now, ShutdownCause::Remote, effects)
            }
            PeerMessage::ShutdownAck { .. } => {
                self.awaiting_ack = false;
                self.maybe_close(effects);
            }
            other => {
                tracing::warn!("{}: unexpected {} for a leecher", self.handle, other.name());
            }
        }
    }

    fn on_setup_resp(
        &mut self,
        msg_id: MsgId,
        default_block: BlockDetails,
        length: u64,
        with_hashes: bool,
        now: Instant,
        effects: &mut Vec<LeecherEffect>,
    ) {
        match self.setup {
            Some((expected, _)) if expected == msg_id && self.state == SessionState::SettingUp => {}
            _ => {
                tracing::debug!("{}: dropping late SetupResp {}", self.handle, msg_id);
                return;
            }
        }
        self.setup = None;

        if default_block != self.layout.default_block || length != self.layout.length {
            self.on_fatal(
                format!(
                    "peer layout {} bytes / {:?} does not match {} bytes / {:?}",
                    length, default_block, self.layout.length, self.layout.default_block
                ),
                now,
                effects,
            );
            return;
        }

        self.with_hashes &= with_hashes;
        self.consecutive_timeouts = 0;
        self.set_state(SessionState::Active, effects);
        self.try_download(effects);
    }

    fn on_claimed(
        &mut self,
        hashes: BTreeSet<BlockNr>,
        blocks: BTreeSet<BlockNr>,
        irregular_blocks: BTreeMap<BlockNr, BlockDetails>,
        file_complete: bool,
        now: Instant,
        effects: &mut Vec<LeecherEffect>,
    ) {
        self.claiming = false;

        if self.state != SessionState::Active {
            if !blocks.is_empty() || !hashes.is_empty() {
                effects.push(LeecherEffect::Requeue { blocks, hashes });
            }
            self.maybe_close(effects);
            return;
        }

        if blocks.is_empty() && hashes.is_empty() {
            let idle = self.pending.is_empty() && self.storing_batches == 0;
            if file_complete && idle {
                self.finish(now, effects);
            }
            return;
        }

        let msg_id = self.next_id();
        self.expected_irregular.extend(irregular_blocks);
        self.pending
            .insert(msg_id, self.handle.peer, now, blocks.clone(), hashes.clone());
        tracing::trace!(
            "{}: request {} for {} blocks, {} hashes",
            self.handle,
            msg_id,
            blocks.len(),
            hashes.len()
        );
        effects.push(LeecherEffect::Send(PeerMessage::BlocksReq {
            file: self.handle.file,
            msg_id,
            cache_hint: blocks.clone(),
            blocks,
            hashes,
            with_hashes: self.with_hashes,
        }));
    }

    fn on_blocks_resp(
        &mut self,
        msg_id: MsgId,
        hashes: BTreeMap<BlockNr, Bytes>,
        blocks: BTreeMap<BlockNr, Bytes>,
        irregular_blocks: BTreeMap<BlockNr, BlockDetails>,
        effects: &mut Vec<LeecherEffect>,
    ) {
        let Some(request) = self.pending.resolve(msg_id) else {
            tracing::debug!("{}: dropping late response {}", self.handle, msg_id);
            return;
        };
        self.consecutive_timeouts = 0;

        let mut received = BTreeMap::new();
        for (nr, data) in blocks {
            if !request.blocks.contains(&nr) {
                tracing::debug!("{}: ignoring unrequested block {}", self.handle, nr);
                continue;
            }
            if irregular_blocks.get(&nr) != self.expected_irregular.get(&nr) {
                tracing::warn!("{}: block {} arrived with the wrong shape", self.handle, nr);
                continue;
            }
            received.insert(nr, data);
        }
        for nr in &request.blocks {
            self.expected_irregular.remove(nr);
        }

        let missing_blocks: BTreeSet<BlockNr> = request
            .blocks
            .iter()
            .filter(|nr| !received.contains_key(nr))
            .copied()
            .collect();
        let missing_hashes: BTreeSet<BlockNr> = request
            .hashes
            .iter()
            .filter(|nr| !hashes.contains_key(nr))
            .copied()
            .collect();

        self.storing_batches += 1;
        self.storing_blocks += received.len();
        effects.push(LeecherEffect::Store(StoreBatch {
            msg_id,
            sent_at: request.sent_at,
            hashes,
            missing_hashes,
            blocks: received,
            missing_blocks,
        }));
        self.try_download(effects);
    }

    fn on_completed(&mut self, result: StoreResult, now: Instant, effects: &mut Vec<LeecherEffect>) {
        self.storing_batches = self.storing_batches.saturating_sub(1);
        self.storing_blocks = self.storing_blocks.saturating_sub(result.blocks);
        self.blocks_transferred += result.stored as u64;

        self.controller
            .on_sample(result.sent_at.into_std(), now.into_std());
        let verdict = self.controller.decide();
        let delta = self.window.on_verdict(verdict);
        tracing::trace!(
            "{}: batch {} stored {}/{}, {:?} ({:+}) cwnd {}",
            self.handle,
            result.msg_id,
            result.stored,
            result.blocks,
            verdict,
            delta,
            self.window.cwnd()
        );

        if result.error.is_some() || self.state == SessionState::ShuttingDown {
            self.incomplete.extend(result.unresolved.iter().copied());
        }

        if let Some(error) = result.error {
            self.on_fatal(error, now, effects);
            return;
        }

        if result.file_complete && self.state == SessionState::Active {
            self.finish(now, effects);
            return;
        }

        self.try_download(effects);
        self.maybe_close(effects);
    }

    fn on_tick(&mut self, now: Instant, effects: &mut Vec<LeecherEffect>) {
        if let Some((msg_id, deadline)) = self.setup {
            if deadline <= now && self.state == SessionState::SettingUp {
                tracing::debug!("{}: setup {} timed out", self.handle, msg_id);
                self.record_timeout(effects);
                self.send_setup(now, effects);
            }
        }

        for request in self.pending.expired(now) {
            tracing::debug!(
                "{}: request {} timed out ({} blocks)",
                self.handle,
                request.msg_id,
                request.blocks.len()
            );
            for nr in &request.blocks {
                self.expected_irregular.remove(nr);
            }
            effects.push(LeecherEffect::Requeue {
                blocks: request.blocks,
                hashes: request.hashes,
            });
            let verdict = self.controller.on_timeout();
            self.window.on_verdict(verdict);
            self.record_timeout(effects);
        }

        if self.state == SessionState::ShuttingDown {
            if self.awaiting_ack && self.shutdown_deadline.is_some_and(|d| d <= now) {
                tracing::debug!("{}: no shutdown ack, closing anyway", self.handle);
                self.awaiting_ack = false;
            }
            self.maybe_close(effects);
        } else {
            self.try_download(effects);
        }
    }

    fn record_timeout(&mut self, effects: &mut Vec<LeecherEffect>) {
        self.consecutive_timeouts += 1;
        if self.consecutive_timeouts == self.health_threshold {
            tracing::warn!(
                "{}: {} consecutive timeouts",
                self.handle,
                self.consecutive_timeouts
            );
            effects.push(LeecherEffect::Notify(SessionNotice::Unhealthy {
                handle: self.handle,
                consecutive_timeouts: self.consecutive_timeouts,
            }));
        }
    }

    fn try_download(&mut self, effects: &mut Vec<LeecherEffect>) {
        if self.state != SessionState::Active || self.claiming {
            return;
        }
        let requested_blocks = self.budget();
        let want_hashes = self.pending.hashes_in_flight() == 0;
        if requested_blocks == 0 && !want_hashes {
            return;
        }
        self.claiming = true;
        effects.push(LeecherEffect::Download {
            requested_blocks,
            want_hashes,
        });
    }

    fn finish(&mut self, now: Instant, effects: &mut Vec<LeecherEffect>) {
        if !self.complete_reported {
            self.complete_reported = true;
            tracing::info!("{}: file complete", self.handle);
            effects.push(LeecherEffect::Notify(SessionNotice::FileComplete {
                handle: self.handle,
            }));
        }
        self.begin_shutdown(now, ShutdownCause::Local, effects);
    }

    fn on_fatal(&mut self, error: String, now: Instant, effects: &mut Vec<LeecherEffect>) {
        tracing::error!("{}: {}", self.handle, error);
        self.error.get_or_insert(error);
        self.begin_shutdown(now, ShutdownCause::Fatal, effects);
    }

    fn begin_shutdown(&mut self, now: Instant, cause: ShutdownCause, effects: &mut Vec<LeecherEffect>) {
        let file = self.handle.file;
        if matches!(self.state, SessionState::ShuttingDown | SessionState::Closed) {
            if cause == ShutdownCause::Remote && self.state == SessionState::ShuttingDown {
                effects.push(LeecherEffect::Send(PeerMessage::ShutdownAck {
                    file,
                    from: Role::Leecher,
                }));
            }
            if cause != ShutdownCause::Local {
                self.awaiting_ack = false;
                self.maybe_close(effects);
            }
            return;
        }

        self.set_state(SessionState::ShuttingDown, effects);
        self.setup = None;

        let mut blocks = BTreeSet::new();
        let mut hashes = BTreeSet::new();
        for request in self.pending.drain() {
            blocks.extend(request.blocks);
            hashes.extend(request.hashes);
        }
        for nr in &blocks {
            self.expected_irregular.remove(nr);
        }
        if !blocks.is_empty() || !hashes.is_empty() {
            self.incomplete.extend(blocks.iter().copied());
            effects.push(LeecherEffect::Requeue { blocks, hashes });
        }

        match cause {
            ShutdownCause::Remote => {
                effects.push(LeecherEffect::Send(PeerMessage::ShutdownAck {
                    file,
                    from: Role::Leecher,
                }));
                self.awaiting_ack = false;
            }
            ShutdownCause::Local => {
                effects.push(LeecherEffect::Send(PeerMessage::Shutdown {
                    file,
                    from: Role::Leecher,
                }));
                self.awaiting_ack = true;
                self.shutdown_deadline = Some(now + self.pending.timeout());
            }
            ShutdownCause::Fatal => {
                effects.push(LeecherEffect::Send(PeerMessage::Shutdown {
                    file,
                    from: Role::Leecher,
                }));
                self.awaiting_ack = false;
            }
        }
        self.maybe_close(effects);
    }

    fn maybe_close(&mut self, effects: &mut Vec<LeecherEffect>) {
        if self.state != SessionState::ShuttingDown
            || self.awaiting_ack
            || self.storing_batches > 0
            || self.claiming
        {
            return;
        }
        tracing::debug!("{}: closed", self.handle);
        self.state = SessionState::Closed;
        effects.push(LeecherEffect::Closed {
            incomplete: std::mem::take(&mut self.incomplete),
            error: self.error.clone(),
        });
    }
}

/// Task driving a [`LeecherMachine`] against a block store and a transport
pub struct LeecherSession {
    machine: LeecherMachine,
    store: Arc<IncompleteFile>,
    transport: Arc<dyn PeerTransport>,
    notices: mpsc::UnboundedSender<SessionNotice>,
    tick_interval: Duration,
    report_interval: Duration,
    round_time: Duration,
}

impl LeecherSession {
    pub fn new(
        handle: HandleId,
        store: Arc<IncompleteFile>,
        transport: Arc<dyn PeerTransport>,
        notices: mpsc::UnboundedSender<SessionNotice>,
        config: &TransferConfig,
    ) -> Self {
        Self {
            machine: LeecherMachine::new(handle, store.layout(), config),
            store,
            transport,
            notices,
            tick_interval: config.session.tick_interval(),
            report_interval: config.session.report_interval(),
            round_time: config.congestion.base_round(),
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
        // free-running; request activity never resets it
        let mut advance = interval_at(start + self.round_time, self.round_time);
        let mut report = interval_at(start + self.report_interval, self.report_interval);
        report.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::debug!("{}: leecher session started", handle);
        let mut inbox_open = true;
        let mut closed = self
            .dispatch(LeecherEvent::Start { now: start }, &done_tx)
            .await;

        while !closed {
            let event = tokio::select! {
                input = inbox.recv(), if inbox_open => match input {
                    Some(input) => from_input(input),
                    None => {
                        inbox_open = false;
                        LeecherEvent::Shutdown { now: Instant::now() }
                    }
                },
                Some(event) = done_rx.recv() => event,
                _ = tick.tick() => LeecherEvent::Tick { now: Instant::now() },
                _ = advance.tick() => LeecherEvent::Advance,
                _ = report.tick() => LeecherEvent::Report,
            };
            closed = self.dispatch(event, &done_tx).await;
        }
        tracing::debug!("{}: leecher session ended", handle);
    }

    /// Apply one event; returns true once the session has closed
    async fn dispatch(
        &mut self,
        event: LeecherEvent,
        done_tx: &mpsc::UnboundedSender<LeecherEvent>,
    ) -> bool {
        let handle = self.machine.handle_id();
        let mut queue: VecDeque<LeecherEffect> = self.machine.handle(event).into();
        let mut closed = false;

        while let Some(effect) = queue.pop_front() {
            match effect {
                LeecherEffect::Send(msg) => {
                    if let Err(e) = self.transport.send(handle.peer, msg).await {
                        tracing::warn!("{}: send failed: {}", handle, e);
                        queue.extend(self.machine.handle(LeecherEvent::Fatal {
                            error: e.to_string(),
                            now: Instant::now(),
                        }));
                    }
                }
                LeecherEffect::Download {
                    requested_blocks,
                    want_hashes,
                } => {
                    let claimed = self.claim(requested_blocks, want_hashes);
                    queue.extend(self.machine.handle(claimed));
                }
                LeecherEffect::Store(batch) => self.spawn_store(batch, done_tx.clone()),
                LeecherEffect::Requeue { blocks, hashes } => {
                    for nr in blocks {
                        self.store.reset_block(nr);
                    }
                    for nr in hashes {
                        self.store.reset_hash(nr);
                    }
                }
                LeecherEffect::Report(mut report) => {
                    report.progress = self.store.report();
                    let _ = self.notices.send(SessionNotice::Report { handle, report });
                }
                LeecherEffect::Notify(notice) => {
                    let _ = self.notices.send(notice);
                }
                LeecherEffect::Closed { incomplete, error } => {
                    let _ = self.notices.send(SessionNotice::Closed {
                        handle,
                        incomplete,
                        error,
                    });
                    closed = true;
                }
            }
        }
        closed
    }

    fn claim(&self, requested_blocks: usize, want_hashes: bool) -> LeecherEvent {
        let mut blocks = BTreeSet::new();
        let mut irregular_blocks = BTreeMap::new();
        while blocks.len() < requested_blocks && self.store.has_blocks() {
            let Some((nr, details)) = self.store.request_block() else {
                break;
            };
            if let Some(details) = details {
                irregular_blocks.insert(nr, details);
            }
            blocks.insert(nr);
        }

        // blocks carry their own hashes when negotiated
        let hashes = if want_hashes
            && (blocks.is_empty() || !self.machine.with_hashes())
            && self.store.has_hashes()
        {
            self.store.request_hashes()
        } else {
            BTreeSet::new()
        };

        LeecherEvent::Claimed {
            hashes,
            blocks,
            irregular_blocks,
            file_complete: self.store.is_complete(),
            now: Instant::now(),
        }
    }

    fn spawn_store(&self, batch: StoreBatch, done_tx: mpsc::UnboundedSender<LeecherEvent>) {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            let StoreBatch {
                msg_id,
                sent_at,
                hashes,
                missing_hashes,
                blocks,
                missing_blocks,
            } = batch;

            let mut error = None;
            if let Err(e) = store.hashes(hashes, missing_hashes).await {
                error = Some(e.to_string());
            }
            for &nr in &missing_blocks {
                store.reset_block(nr);
            }

            let count = blocks.len();
            let mut stored = 0;
            let mut unresolved = missing_blocks;
            for (nr, data) in blocks {
                match store.block(nr, data).await {
                    Ok(BlockOutcome::Stored) => stored += 1,
                    Ok(BlockOutcome::Requeued) => {
                        unresolved.insert(nr);
                    }
                    Ok(BlockOutcome::Ignored) => {}
                    Err(e) => {
                        unresolved.insert(nr);
                        error.get_or_insert_with(|| e.to_string());
                    }
                }
            }

            let result = StoreResult {
                msg_id,
                sent_at,
                blocks: count,
                stored,
                unresolved,
                file_complete: store.is_complete(),
                error,
            };
            let _ = done_tx.send(LeecherEvent::Completed {
                result,
                now: Instant::now(),
            });
        });
    }
}

fn from_input(input: SessionInput) -> LeecherEvent {
    match input {
        SessionInput::Peer(msg) => LeecherEvent::Peer {
            msg,
            now: Instant::now(),
        },
        SessionInput::CwndControl(delta) => LeecherEvent::CwndControl(delta),
        SessionInput::MemSet(max) => LeecherEvent::MemSet(max),
        SessionInput::Shutdown => LeecherEvent::Shutdown { now: Instant::now() },
    }
}
