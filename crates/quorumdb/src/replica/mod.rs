// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 quorumdb contributors

//! The replica: a single-threaded VSR state machine.
//!
//! Inputs are exactly three: a validated [`Message`], a timer tick, and
//! storage fault results surfaced through the driver. All output goes to
//! the [`Outbox`]; whoever drives the replica (UDP bus or simulator)
//! routes it. No handler blocks: anything that cannot proceed (missing
//! body, unloaded state machine) parks until repair or a later message
//! unblocks it.
//!
//! Module split follows the protocol: normal operation and commit live
//! here, view changes in [`view_change`], repair and state sync in
//! [`repair`] and [`sync`].

pub mod client_sessions;
pub mod pipeline;
pub mod repair;
pub mod status;
pub mod sync;
pub mod timeout;
pub mod view_change;

pub use status::Status;

use crate::bus::{Outbox, Target};
use crate::checksum::checksum;
use crate::config::{
    checkpoint_after, prepare_max_for_checkpoint, trigger_for_checkpoint, Options,
    COMMIT_HEARTBEAT_TICKS, MESSAGE_BODY_SIZE_MAX, PING_TIMEOUT_TICKS,
    PREPARE_TIMEOUT_TICKS, PRIMARY_ABDICATE_TIMEOUT_TICKS, RELEASES_BUNDLED, RELEASE_CLIENT_MIN,
    REPAIR_TIMEOUT_TICKS, REPLICAS_MAX, SCRUB_TIMEOUT_TICKS, SYNC_TIMEOUT_TICKS,
    VIEW_CHANGE_STATUS_TIMEOUT_TICKS, VIEW_CHANGE_TIMEOUT_TICKS,
};
use crate::error::{Error, Result};
use crate::grid::{Grid, Scrubber};
use crate::state_machine::StateMachine;
use crate::storage::Storage;
use crate::superblock::SuperBlock;
use crate::wal::{self, slot_for_op, Journal, SlotRecovery};
use crate::wire::{Command, Header, Message, Operation};

use client_sessions::{Admission, ClientSessions};
use pipeline::Pipeline;
use sync::SyncStage;
use timeout::Timeout;
use view_change::{DvcQuorum, VoteTracker};

/// A replica process. Owns the data file, the journal, the grid, and the
/// application state machine; holds no back-references (peers are indices).
pub struct Replica<S: StateMachine> {
    options: Options,
    status: Status,
    view: u32,
    log_view: u32,
    /// Head op: highest op this replica has a header for.
    op: u64,
    commit_min: u64,
    commit_max: u64,
    release: u16,
    /// Release announced by a committed upgrade op, installed at the next
    /// checkpoint.
    release_next: Option<u16>,
    /// Primary-side: pad the current bar with upgrade ops toward this
    /// release.
    upgrade_target: Option<u16>,

    storage: Box<dyn Storage>,
    superblock: SuperBlock,
    journal: Journal,
    grid: Grid,
    scrubber: Scrubber,
    sessions: ClientSessions,
    pipeline: Pipeline,
    machine: S,
    machine_loaded: bool,
    outbox: Outbox,

    ping_timeout: Timeout,
    commit_heartbeat: Timeout,
    view_change_timeout: Timeout,
    view_change_status_timeout: Timeout,
    prepare_timeout: Timeout,
    abdicate_timeout: Timeout,
    repair_timeout: Timeout,
    scrub_timeout: Timeout,
    sync_timeout: Timeout,

    svc_votes: VoteTracker,
    dvcs: DvcQuorum,
    do_view_change_sent: bool,
    /// Primary-elect: canonical log adopted, bodies repairing.
    log_selected: bool,

    sync: SyncStage,
    peer_checkpoints: Vec<Option<(u64, u128)>>,
    repair_cursor: u8,
    /// request_start_view already sent this repair period.
    rsv_sent: bool,
    abdicating: bool,
    fatal: Option<Error>,
}

impl<S: StateMachine> Replica<S> {
    /// Initialize a fresh data file for this cluster member.
    pub fn format(storage: &mut dyn Storage, options: &Options) -> Result<()> {
        SuperBlock::format(storage, options)?;
        Ok(())
    }

    /// Open a formatted data file and recover replica state.
    pub fn open(mut storage: Box<dyn Storage>, options: Options, machine: S) -> Result<Self> {
        let superblock = SuperBlock::open(storage.as_mut())?;
        if superblock.cluster != options.cluster {
            return Err(Error::ClusterMismatch {
                expected: options.cluster,
                actual: superblock.cluster,
            });
        }
        if superblock.replica != options.replica {
            return Err(Error::ReplicaMismatch {
                expected: options.replica,
                actual: superblock.replica,
            });
        }
        if !RELEASES_BUNDLED.contains(&superblock.release) {
            return Err(Error::ReleaseNotBundled(superblock.release));
        }

        let op_checkpoint = superblock.vsr_state.op_checkpoint;
        let mut journal = Journal::new();
        let mut head_torn = false;
        let mut beyond_checkpoint_faults = 0usize;
        let recovered = wal::recover(storage.as_mut())?;
        for (slot, recovery) in recovered.iter().enumerate() {
            match recovery {
                SlotRecovery::Empty => {}
                SlotRecovery::Clean(header) => {
                    journal.set_header(*header);
                    journal.mark_clean(header.op);
                }
                SlotRecovery::Torn(header) => {
                    if header.op > op_checkpoint {
                        journal.set_header(*header);
                        beyond_checkpoint_faults += 1;
                    }
                    // A torn slot at or below the checkpoint is a stale
                    // body half-overwritten before the crash; the op it
                    // held is checkpointed and needs nothing.
                }
                SlotRecovery::Faulty => {
                    journal.mark_faulty(slot as u64);
                    beyond_checkpoint_faults += 1;
                }
            }
        }

        let op = journal.op_max().max(op_checkpoint);
        if let Some(head) = journal.header_for_op(op) {
            if !journal.has_clean(head.op) {
                head_torn = true;
            }
        }

        // The checkpoint image holds state through the trigger op that
        // produced it; commit resumes from there, while op_checkpoint only
        // labels the WAL window.
        let commit_floor = superblock.vsr_state.commit_min.max(op_checkpoint);
        let op = op.max(commit_floor);

        let seed = u64::from(options.replica) + 1;
        let mut replica = Self {
            status: Status::Recovering,
            view: superblock.vsr_state.view,
            log_view: superblock.vsr_state.log_view,
            op,
            commit_min: commit_floor,
            commit_max: commit_floor,
            release: superblock.release,
            release_next: None,
            upgrade_target: None,
            grid: Grid::from_superblock(&superblock),
            sessions: ClientSessions::restore(&superblock.sessions, storage.as_mut())?,
            scrubber: Scrubber::new(),
            journal,
            pipeline: Pipeline::new(),
            machine,
            machine_loaded: superblock.checkpoint_size == 0,
            outbox: Outbox::new(),
            ping_timeout: Timeout::new(PING_TIMEOUT_TICKS, seed),
            commit_heartbeat: Timeout::new(COMMIT_HEARTBEAT_TICKS, seed.wrapping_mul(3)),
            view_change_timeout: Timeout::new(VIEW_CHANGE_TIMEOUT_TICKS, seed.wrapping_mul(5)),
            view_change_status_timeout: Timeout::new(
                VIEW_CHANGE_STATUS_TIMEOUT_TICKS,
                seed.wrapping_mul(7),
            ),
            prepare_timeout: Timeout::new(PREPARE_TIMEOUT_TICKS, seed.wrapping_mul(11)),
            abdicate_timeout: Timeout::new(PRIMARY_ABDICATE_TIMEOUT_TICKS, seed.wrapping_mul(13)),
            repair_timeout: Timeout::new(REPAIR_TIMEOUT_TICKS, seed.wrapping_mul(17)),
            scrub_timeout: Timeout::new(SCRUB_TIMEOUT_TICKS, seed.wrapping_mul(19)),
            sync_timeout: Timeout::new(SYNC_TIMEOUT_TICKS, seed.wrapping_mul(23)),
            svc_votes: VoteTracker::new(),
            dvcs: DvcQuorum::new(),
            do_view_change_sent: false,
            log_selected: false,
            sync: SyncStage::Idle,
            peer_checkpoints: (0..REPLICAS_MAX).map(|_| None).collect(),
            repair_cursor: 0,
            rsv_sent: false,
            abdicating: false,
            fatal: None,
            superblock,
            storage,
            options,
        };

        if !replica.machine_loaded {
            replica.try_load_machine()?;
        }

        // Unrepairable alone: a solitary replica with untrustworthy slots
        // beyond its checkpoint has lost committed state.
        if replica.options.member_count() == 1 && beyond_checkpoint_faults > 0 {
            let slot = (0..crate::config::SLOT_COUNT)
                .find(|&s| replica.journal.is_faulty_slot(s))
                .unwrap_or(slot_for_op(replica.op));
            return Err(Error::WalCorrupt { slot });
        }

        replica.status = if replica.log_view < replica.view {
            Status::ViewChange
        } else if replica.journal.faulty_count() > 0 || head_torn {
            Status::RecoveringHead
        } else {
            Status::Normal
        };

        replica.ping_timeout.start();
        replica.repair_timeout.start();
        match replica.status {
            Status::Normal => replica.enter_normal_timeouts(),
            Status::ViewChange => {
                let view = replica.view;
                replica.rejoin_view_change(view);
            }
            _ => {}
        }

        // A cluster of one is its own quorum: everything journaled commits.
        if replica.options.replica_count == 1 && replica.status == Status::Normal {
            replica.commit_max = replica.op;
            replica.advance_commit();
        } else if replica.is_primary() && replica.op > replica.commit_min {
            // Re-commit the recovered suffix without waiting for traffic.
            replica.inject_pulse();
        }

        log::info!(
            "[replica] open replica={} status={} view={} op={} checkpoint={}",
            replica.options.replica,
            replica.status,
            replica.view,
            replica.op,
            replica.superblock.vsr_state.op_checkpoint,
        );
        Ok(replica)
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    #[must_use]
    pub fn status(&self) -> Status {
        self.status
    }

    #[must_use]
    pub fn view(&self) -> u32 {
        self.view
    }

    #[must_use]
    pub fn op_head(&self) -> u64 {
        self.op
    }

    #[must_use]
    pub fn commit_min(&self) -> u64 {
        self.commit_min
    }

    #[must_use]
    pub fn commit_max(&self) -> u64 {
        self.commit_max
    }

    #[must_use]
    pub fn op_checkpoint(&self) -> u64 {
        self.superblock.vsr_state.op_checkpoint
    }

    #[must_use]
    pub fn checkpoint_id(&self) -> u128 {
        self.superblock.vsr_state.checkpoint_id
    }

    #[must_use]
    pub fn release(&self) -> u16 {
        self.release
    }

    #[must_use]
    pub fn replica_index(&self) -> u8 {
        self.options.replica
    }

    /// True when this replica is the primary of its view, in normal status.
    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.status == Status::Normal
            && !self.options.is_standby()
            && self.options.primary_for_view(self.view) == self.options.replica
    }

    #[must_use]
    pub fn grid_faulty_count(&self) -> usize {
        self.grid.faulty_count()
    }

    /// The application state machine, for inspection in tests and tooling.
    #[must_use]
    pub fn machine(&self) -> &S {
        &self.machine
    }

    /// The grid, for scrub/repair inspection.
    #[must_use]
    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    /// Fatal condition, if the replica must stop (see error policy).
    #[must_use]
    pub fn fatal(&self) -> Option<&Error> {
        self.fatal.as_ref()
    }

    /// Take the fatal condition for the caller to act on (exit codes).
    pub fn take_fatal(&mut self) -> Option<Error> {
        self.fatal.take()
    }

    /// Drain queued output for routing.
    #[must_use]
    pub fn drain_outbox(&mut self) -> Vec<crate::bus::Envelope> {
        self.outbox.drain()
    }

    /// Request a cluster upgrade (primary only). The primary pads the bar
    /// before the next checkpoint with upgrade prepares; the release is
    /// installed cluster-wide at that checkpoint.
    pub fn request_upgrade(&mut self, release: u16) {
        assert!(release > self.release);
        self.upgrade_target = Some(release);
    }

    // ========================================================================
    // Event loop input
    // ========================================================================

    /// Count one tick and run any fired timers.
    pub fn tick(&mut self) {
        if self.fatal.is_some() {
            return;
        }
        self.ping_timeout.tick();
        self.commit_heartbeat.tick();
        self.view_change_timeout.tick();
        self.view_change_status_timeout.tick();
        self.prepare_timeout.tick();
        self.abdicate_timeout.tick();
        self.repair_timeout.tick();
        self.scrub_timeout.tick();
        self.sync_timeout.tick();

        if self.ping_timeout.fired() {
            self.ping_timeout.reset();
            let ping = self.base_header(Command::Ping);
            self.send(Target::AllReplicas, ping, Vec::new());
        }

        if self.commit_heartbeat.fired() {
            self.commit_heartbeat.reset();
            if self.is_primary() && !self.abdicating {
                self.broadcast_commit();
            }
        }

        if self.view_change_timeout.fired() {
            self.view_change_timeout.reset();
            let primary_silent = self.status == Status::Normal
                && !self.is_primary()
                && !self.options.is_standby();
            if primary_silent {
                log::warn!(
                    "[view] replica={} primary of view {} silent, starting view change",
                    self.options.replica,
                    self.view
                );
                self.begin_view_change(self.view + 1);
            }
        }

        if self.view_change_status_timeout.fired() {
            if self.status == Status::ViewChange {
                self.view_change_status_timeout.backoff();
                if self.view_change_status_timeout.attempts() >= 3 {
                    // This view change is stuck (candidate down?); try the
                    // next one.
                    self.begin_view_change(self.view + 1);
                } else {
                    self.resend_view_change_messages();
                }
            } else {
                self.view_change_status_timeout.stop();
            }
        }

        if self.prepare_timeout.fired() {
            self.prepare_timeout.backoff();
            self.retransmit_pipeline_head();
        }

        if self.abdicate_timeout.fired() {
            self.abdicate_timeout.reset();
            if self.is_primary() && self.pipeline.prepares_len() > 0 {
                log::warn!(
                    "[view] replica={} abdicating view {}: no prepare_ok majority",
                    self.options.replica,
                    self.view
                );
                self.abdicating = true;
            }
        }

        if self.repair_timeout.fired() {
            self.repair_timeout.reset();
            self.repair_round();
        }

        if self.scrub_timeout.fired() {
            self.scrub_timeout.reset();
            if self.status == Status::Normal {
                let result = self.scrubber.step(&mut self.grid, self.storage.as_mut());
                self.guard(result.map(|_| ()));
            }
        }

        if self.sync_timeout.fired() {
            self.sync_timeout.backoff();
            self.continue_sync();
        }

        self.maybe_inject_upgrade();
        self.advance_commit();
    }

    /// Feed one validated message.
    pub fn on_message(&mut self, message: &Message) {
        if self.fatal.is_some() {
            return;
        }
        let header = &message.header;
        if header.command != Command::Request && header.replica as usize >= REPLICAS_MAX {
            return;
        }
        #[cfg(feature = "trace-protocol")]
        log::debug!(
            "[replica] {} <- {:?} view={} op={} from={}",
            self.options.replica,
            header.command,
            header.view,
            header.op,
            header.replica
        );

        match header.command {
            Command::Ping => self.on_ping(message),
            Command::Pong => self.on_pong(message),
            Command::Request => self.on_request(message),
            Command::Prepare => self.on_prepare(message),
            Command::PrepareOk => self.on_prepare_ok(message),
            Command::Commit => self.on_commit_message(message),
            Command::Reply => self.on_reply_for_repair(message),
            Command::StartViewChange => self.on_start_view_change(message),
            Command::DoViewChange => self.on_do_view_change(message),
            Command::StartView => self.on_start_view(message),
            Command::RequestStartView => self.on_request_start_view(message),
            Command::RequestPrepare => self.on_request_prepare(message),
            Command::RequestHeaders => self.on_request_headers(message),
            Command::Headers => self.on_headers(message),
            Command::RequestReply => self.on_request_reply(message),
            Command::RequestBlock => self.on_request_block(message),
            Command::Block => self.on_block(message),
            Command::RequestSyncCheckpoint => self.on_request_sync_checkpoint(message),
            Command::SyncCheckpoint => self.on_sync_checkpoint(message),
        }
    }

    // ========================================================================
    // Normal operation
    // ========================================================================

    fn on_ping(&mut self, message: &Message) {
        if message.header.replica == self.options.replica {
            return;
        }
        let mut pong = self.base_header(Command::Pong);
        pong.op = self.superblock.vsr_state.op_checkpoint;
        pong.parent = self.superblock.vsr_state.checkpoint_id;
        self.send(Target::Replica(message.header.replica), pong, Vec::new());
    }

    fn on_pong(&mut self, message: &Message) {
        let replica = message.header.replica as usize;
        self.peer_checkpoints[replica] = Some((message.header.op, message.header.parent));
        // Pongs also carry commit progress, which feeds sync detection.
        self.observe_commit_max(message.header.commit);
        self.maybe_sync();
    }

    fn on_request(&mut self, message: &Message) {
        if !self.is_primary() {
            return;
        }
        let header = &message.header;
        if header.client == 0 || header.release < RELEASE_CLIENT_MIN {
            return;
        }
        if header.operation < Operation::USER_MIN {
            return;
        }
        match self.sessions.admit(header.client, header.request) {
            Admission::Drop => {}
            Admission::Replay(reply) => {
                log::debug!(
                    "[replica] replaying request {} for client {:#x}",
                    header.request,
                    header.client
                );
                self.outbox.send(Target::Client(header.client), *reply);
            }
            Admission::Execute => {
                if self.pipeline.contains_client(header.client) {
                    return;
                }
                if self.pipeline.prepare_queue_full() || !self.can_assign_next_op() {
                    if !self.pipeline.push_request(message.clone()) {
                        log::debug!("[replica] request queue full, shedding client {:#x}", header.client);
                    }
                    return;
                }
                self.primary_prepare(message.clone());
            }
        }
    }

    /// Turn a request into a prepare: assign the op, chain the parent,
    /// persist locally, replicate.
    fn primary_prepare(&mut self, request: Message) {
        assert!(self.is_primary());
        assert!(!self.pipeline.prepare_queue_full());
        assert!(self.can_assign_next_op());

        let op = self.op + 1;
        let mut header = self.base_header(Command::Prepare);
        header.op = op;
        header.parent = self.parent_checksum(op).expect("primary log is contiguous");
        header.client = request.header.client;
        header.request = request.header.request;
        header.operation = request.header.operation;
        header.timestamp = op;
        let prepare = Message::new(header, request.body().to_vec());

        let result = wal::write_prepare(self.storage.as_mut(), &prepare);
        if self.guard(result) {
            return;
        }
        self.journal.set_header(prepare.header);
        self.journal.mark_clean(op);
        self.op = op;

        self.pipeline.push_prepare(prepare.clone());
        let entry = self.pipeline.prepare_by_op(op).expect("just pushed");
        entry.ack(self.options.replica);

        self.send_message(Target::AllReplicas, prepare);
        self.prepare_timeout.start();
        if !self.abdicate_timeout.is_ticking() {
            self.abdicate_timeout.start();
        }
        self.commit_if_quorum();
    }

    fn on_prepare(&mut self, message: &Message) {
        let header = message.header;

        // Repair delivery: we already know exactly this prepare's header
        // and only lack its body. Valid in any view and almost any status.
        if let Some(expected) = self.journal.header_for_op(header.op) {
            if expected.checksum == header.checksum && !self.journal.has_clean(header.op) {
                let result = wal::write_prepare(self.storage.as_mut(), message);
                if self.guard(result) {
                    return;
                }
                self.journal.mark_clean(header.op);
                log::debug!("[repair] replica={} repaired op={}", self.options.replica, header.op);
                self.send_prepare_ok(&header);
                self.after_repair_progress();
                self.advance_commit();
                return;
            }
        }

        if header.view > self.view {
            self.note_newer_view(header.view);
            return;
        }
        if self.status == Status::RecoveringHead {
            // Learn the authoritative head before accepting new prepares.
            self.request_start_view_from_primary();
            return;
        }
        if self.status != Status::Normal || header.view < self.view {
            return;
        }
        if self.is_primary() {
            return;
        }
        if header.replica != self.options.primary_for_view(self.view) {
            return;
        }

        self.view_change_timeout.reset();
        self.observe_commit_max(header.commit);

        if header.op <= self.op {
            // Duplicate: count it once, re-ack if we hold it.
            if self.journal.checksum_for_op(header.op) == Some(header.checksum)
                && self.journal.has_clean(header.op)
            {
                self.send_prepare_ok(&header);
            }
            self.advance_commit();
            return;
        }

        if header.op > prepare_max_for_checkpoint(self.superblock.vsr_state.op_checkpoint) {
            // Too far ahead for our WAL window; we need a newer checkpoint.
            self.maybe_sync();
            return;
        }

        if header.op == self.op + 1 {
            if let Some(parent) = self.parent_checksum(header.op) {
                if parent != header.parent {
                    // Our op-1 disagrees with the primary's chain: our copy
                    // is from an abandoned fork. Re-learn the suffix.
                    log::warn!(
                        "[replica] replica={} chain mismatch at op {}, repairing",
                        self.options.replica,
                        header.op
                    );
                    self.accept_gap_prepare(message);
                    self.request_headers_range(self.commit_min + 1, header.op);
                    return;
                }
            }
            let result = wal::write_prepare(self.storage.as_mut(), message);
            if self.guard(result) {
                return;
            }
            self.journal.set_header(header);
            self.journal.mark_clean(header.op);
            self.op = header.op;
            self.send_prepare_ok(&header);
        } else {
            self.accept_gap_prepare(message);
        }
        self.advance_commit();
    }

    /// Accept a prepare beyond a gap: store it, move the head, let repair
    /// fill the middle.
    fn accept_gap_prepare(&mut self, message: &Message) {
        let header = message.header;
        let result = wal::write_prepare(self.storage.as_mut(), message);
        if self.guard(result) {
            return;
        }
        self.journal.set_header(header);
        self.journal.mark_clean(header.op);
        self.op = header.op;
        self.send_prepare_ok(&header);
    }

    fn send_prepare_ok(&mut self, prepare: &Header) {
        if self.status != Status::Normal || self.options.is_standby() {
            return;
        }
        let mut ok = self.base_header(Command::PrepareOk);
        ok.op = prepare.op;
        ok.parent = prepare.checksum;
        let primary = self.options.primary_for_view(self.view);
        if primary == self.options.replica {
            // Own ack is recorded directly at the pipeline.
            return;
        }
        self.send(Target::Replica(primary), ok, Vec::new());
    }

    fn on_prepare_ok(&mut self, message: &Message) {
        if !self.is_primary() || message.header.view != self.view {
            return;
        }
        let header = message.header;
        if header.replica >= self.options.replica_count {
            // Standbys replicate but never count toward the quorum.
            return;
        }
        let Some(entry) = self.pipeline.prepare_by_op(header.op) else { return };
        if entry.message.header.checksum != header.parent {
            return;
        }
        if entry.ack(header.replica) {
            self.abdicating = false;
            self.abdicate_timeout.reset();
        }
        self.commit_if_quorum();
    }

    /// Pop every pipeline head whose replication quorum is met, in order.
    fn commit_if_quorum(&mut self) {
        let quorum = self.options.quorum_replication();
        let mut advanced = false;
        while let Some(head) = self.pipeline.head() {
            if head.ack_count() < quorum {
                break;
            }
            let op = head.message.header.op;
            self.pipeline.pop_head();
            self.observe_commit_max(op);
            advanced = true;
        }
        if advanced {
            self.prepare_timeout.reset();
            self.abdicate_timeout.reset();
            self.advance_commit();
            self.broadcast_commit();
            self.admit_queued_requests();
        }
    }

    fn admit_queued_requests(&mut self) {
        while !self.pipeline.prepare_queue_full() && self.can_assign_next_op() {
            let Some(request) = self.pipeline.pop_request() else { break };
            self.primary_prepare(request);
        }
        self.maybe_inject_upgrade();
    }

    /// Prepare a no-op. A primary with an uncommitted suffix (fresh from
    /// open or a view change) uses this to drive re-commit without waiting
    /// for client traffic.
    pub(crate) fn inject_pulse(&mut self) {
        if !self.is_primary() || self.pipeline.prepare_queue_full() || !self.can_assign_next_op() {
            return;
        }
        let op = self.op + 1;
        let mut header = self.base_header(Command::Prepare);
        header.op = op;
        header.parent = self.parent_checksum(op).expect("primary log is contiguous");
        header.operation = Operation::Pulse as u8;
        header.timestamp = op;
        let prepare = Message::new(header, Vec::new());

        let result = wal::write_prepare(self.storage.as_mut(), &prepare);
        if self.guard(result) {
            return;
        }
        self.journal.set_header(prepare.header);
        self.journal.mark_clean(op);
        self.op = op;
        self.pipeline.push_prepare(prepare.clone());
        let entry = self.pipeline.prepare_by_op(op).expect("just pushed");
        entry.ack(self.options.replica);
        self.send_message(Target::AllReplicas, prepare);
        self.prepare_timeout.start();
        if !self.abdicate_timeout.is_ticking() {
            self.abdicate_timeout.start();
        }
        self.commit_if_quorum();
    }

    /// When an upgrade is pending and the pipeline has room, pad the bar
    /// toward the next checkpoint trigger with upgrade prepares, so the
    /// checkpoint that installs the release is the next one.
    fn maybe_inject_upgrade(&mut self) {
        let Some(target) = self.upgrade_target else { return };
        if self.release >= target {
            self.upgrade_target = None;
            return;
        }
        if !self.is_primary() {
            return;
        }
        let trigger = trigger_for_checkpoint(checkpoint_after(self.superblock.vsr_state.op_checkpoint));
        while self.op < trigger && !self.pipeline.prepare_queue_full() && self.can_assign_next_op() {
            let op = self.op + 1;
            let mut header = self.base_header(Command::Prepare);
            header.op = op;
            header.parent = self.parent_checksum(op).expect("primary log is contiguous");
            header.operation = Operation::Upgrade as u8;
            header.timestamp = op;
            let body = target.to_le_bytes().to_vec();
            let prepare = Message::new(header, body);

            let result = wal::write_prepare(self.storage.as_mut(), &prepare);
            if self.guard(result) {
                return;
            }
            self.journal.set_header(prepare.header);
            self.journal.mark_clean(op);
            self.op = op;
            self.pipeline.push_prepare(prepare.clone());
            let entry = self.pipeline.prepare_by_op(op).expect("just pushed");
            entry.ack(self.options.replica);
            self.send_message(Target::AllReplicas, prepare);
        }
        self.commit_if_quorum();
    }

    fn on_commit_message(&mut self, message: &Message) {
        let header = &message.header;
        if header.view > self.view {
            self.note_newer_view(header.view);
            return;
        }
        if self.status == Status::RecoveringHead {
            self.request_start_view_from_primary();
            return;
        }
        if self.status != Status::Normal || header.view < self.view || self.is_primary() {
            return;
        }
        if header.replica != self.options.primary_for_view(self.view) {
            return;
        }
        self.view_change_timeout.reset();
        self.observe_commit_max(header.commit);
        self.advance_commit();
        self.maybe_sync();
    }

    // ========================================================================
    // Commit machinery
    // ========================================================================

    fn observe_commit_max(&mut self, commit: u64) {
        if commit > self.commit_max {
            self.commit_max = commit;
        }
    }

    /// Apply committed ops in order as far as bodies and the state machine
    /// allow. Stalls (never blocks) on a missing body or unloaded machine.
    fn advance_commit(&mut self) {
        loop {
            if self.fatal.is_some() || self.commit_min >= self.commit_max {
                return;
            }
            if !self.machine_loaded {
                let result = self.try_load_machine();
                if self.guard(result) {
                    return;
                }
                if !self.machine_loaded {
                    return;
                }
            }
            let op = self.commit_min + 1;
            if !self.journal.has_clean(op) {
                // Repair fetches it; commit resumes afterwards.
                return;
            }
            let prepare = match wal::read_prepare(self.storage.as_mut(), slot_for_op(op)) {
                Ok(Some(prepare)) if Some(prepare.header.checksum) == self.journal.checksum_for_op(op) => prepare,
                Ok(_) => {
                    // Body no longer matches the journal: surfaced media
                    // fault after the open scan.
                    let slot = slot_for_op(op);
                    self.journal.mark_faulty(slot);
                    if self.options.member_count() == 1 {
                        self.fatal = Some(Error::WalCorrupt { slot });
                    }
                    return;
                }
                Err(err) => {
                    self.fatal = Some(err);
                    return;
                }
            };

            // Hash-chain continuity: a backup never commits an op whose
            // parent does not match the committed prefix.
            if op > self.superblock.vsr_state.op_checkpoint + 1 {
                if let Some(parent) = self.journal.checksum_for_op(op - 1) {
                    assert_eq!(
                        prepare.header.parent, parent,
                        "chain break at committed op {}: replicas would diverge",
                        op
                    );
                }
            }

            if !RELEASES_BUNDLED.contains(&prepare.header.release) {
                self.fatal = Some(Error::ReleaseNotBundled(prepare.header.release));
                return;
            }

            self.commit_op(&prepare);
            self.commit_min = op;

            let next_checkpoint = checkpoint_after(self.superblock.vsr_state.op_checkpoint);
            if self.commit_min == trigger_for_checkpoint(next_checkpoint) {
                let result = self.checkpoint(next_checkpoint);
                if self.guard(result) {
                    return;
                }
            }
        }
    }

    fn commit_op(&mut self, prepare: &Message) {
        let header = &prepare.header;
        match header.operation {
            op if op == Operation::Pulse as u8 => {}
            op if op == Operation::Upgrade as u8 => {
                let mut release = [0u8; 2];
                release.copy_from_slice(&prepare.body()[..2]);
                let release = u16::from_le_bytes(release);
                log::info!(
                    "[replica] replica={} upgrade to release {} at op {}",
                    self.options.replica,
                    release,
                    header.op
                );
                self.release_next = Some(release);
            }
            operation => {
                self.machine.prefetch(operation, prepare.body());
                let reply_body =
                    self.machine.commit(header.op, header.timestamp, operation, prepare.body());
                assert!(reply_body.len() <= MESSAGE_BODY_SIZE_MAX);

                if header.client != 0 {
                    // Every reply field derives from the prepare, so all
                    // replicas store byte-identical replies: that is what
                    // makes cross-replica reply repair and cache replay
                    // checksum-verifiable.
                    let mut reply = Header::new(self.options.cluster, Command::Reply);
                    reply.client = header.client;
                    reply.request = header.request;
                    reply.op = header.op;
                    reply.commit = header.op;
                    reply.operation = operation;
                    reply.timestamp = header.timestamp;
                    reply.view = header.view;
                    reply.parent = header.checksum;
                    reply.release = header.release;
                    reply.replica = self.options.primary_for_view(header.view);
                    let reply = Message::new(reply, reply_body);
                    let result = self.sessions.update(self.storage.as_mut(), &reply);
                    if self.guard(result) {
                        return;
                    }
                    if self.is_primary() {
                        self.outbox.send(Target::Client(header.client), reply);
                    }
                }
            }
        }
    }

    fn checkpoint(&mut self, checkpoint_op: u64) -> Result<()> {
        assert!(self.machine_loaded);
        let image = self.machine.encode();
        let checkpoint_id = Self::checkpoint_id_for(&image, checkpoint_op);

        // The previous image's blocks die with this checkpoint.
        let old_blocks: Vec<u64> = self
            .superblock
            .checkpoint_blocks
            .iter()
            .copied()
            .filter(|&address| address != 0)
            .collect();
        for address in old_blocks {
            self.grid.release_at_checkpoint(address);
        }

        let mut checkpoint_blocks = [0u64; crate::config::CHECKPOINT_BLOCKS_MAX];
        for (i, chunk) in image.chunks(crate::grid::BLOCK_PAYLOAD_MAX).enumerate() {
            assert!(i < checkpoint_blocks.len(), "checkpoint image exceeds CHECKPOINT_BLOCKS_MAX");
            let address = self.grid.acquire().expect("grid capacity for checkpoint image");
            self.grid.write_block(self.storage.as_mut(), address, chunk)?;
            checkpoint_blocks[i] = address;
        }

        let (free_set_words, grid_index) = self.grid.checkpoint();
        let sessions = self.sessions.snapshot();
        let release = match self.release_next.take() {
            Some(next) => {
                if !RELEASES_BUNDLED.contains(&next) {
                    return Err(Error::ReleaseNotBundled(next));
                }
                next
            }
            None => self.release,
        };

        let view = self.view;
        let log_view = self.log_view;
        let commit_min = self.commit_min;
        let image_len = image.len() as u32;
        self.superblock.update(self.storage.as_mut(), |s| {
            s.vsr_state.view = view;
            s.vsr_state.log_view = log_view;
            s.vsr_state.commit_min = commit_min;
            s.vsr_state.op_checkpoint = checkpoint_op;
            s.vsr_state.checkpoint_id = checkpoint_id;
            s.free_set_words = free_set_words;
            s.grid_index.copy_from_slice(&grid_index);
            s.checkpoint_blocks = checkpoint_blocks;
            s.checkpoint_size = image_len;
            s.sessions = sessions;
            s.release = release;
        })?;
        self.release = release;
        if self.upgrade_target == Some(release) {
            self.upgrade_target = None;
        }

        log::info!(
            "[replica] replica={} checkpoint at op {} id={:#034x}",
            self.options.replica,
            checkpoint_op,
            checkpoint_id
        );
        Ok(())
    }

    pub(crate) fn checkpoint_id_for(image: &[u8], checkpoint_op: u64) -> u128 {
        let mut buf = Vec::with_capacity(image.len() + 8);
        buf.extend_from_slice(image);
        buf.extend_from_slice(&checkpoint_op.to_le_bytes());
        checksum(&buf)
    }

    /// Reassemble the checkpoint image from grid blocks and restore the
    /// state machine. A missing block leaves the machine unloaded with the
    /// block queued for repair.
    fn try_load_machine(&mut self) -> Result<()> {
        assert!(!self.machine_loaded);
        let mut image = Vec::with_capacity(self.superblock.checkpoint_size as usize);
        for &address in self.superblock.checkpoint_blocks.iter().filter(|&&a| a != 0) {
            match self.grid.read_block(self.storage.as_mut(), address)? {
                Some(payload) => image.extend_from_slice(&payload),
                None => return Ok(()), // faulty; repair path will heal it
            }
        }
        image.truncate(self.superblock.checkpoint_size as usize);
        let expected = self.superblock.vsr_state.checkpoint_id;
        let actual = Self::checkpoint_id_for(&image, self.superblock.vsr_state.op_checkpoint);
        if actual != expected {
            log::warn!("[replica] checkpoint image mismatch, awaiting grid repair");
            return Ok(());
        }
        self.machine.restore(&image);
        self.machine_loaded = true;
        Ok(())
    }

    // ========================================================================
    // Shared helpers
    // ========================================================================

    /// Parent checksum expected for `op`: the chain root for op 1, unknown
    /// (None) below the checkpoint horizon, otherwise the journal's entry.
    fn parent_checksum(&self, op: u64) -> Option<u128> {
        assert!(op >= 1);
        if op == 1 {
            return Some(Header::root_parent(self.options.cluster));
        }
        if op - 1 <= self.superblock.vsr_state.op_checkpoint && !self.journal.has_header(op - 1) {
            return None;
        }
        self.journal.checksum_for_op(op - 1)
    }

    fn can_assign_next_op(&self) -> bool {
        self.op + 1 <= prepare_max_for_checkpoint(self.superblock.vsr_state.op_checkpoint)
    }

    fn base_header(&self, command: Command) -> Header {
        let mut header = Header::new(self.options.cluster, command);
        header.view = self.view;
        header.commit = self.commit_max;
        header.replica = self.options.replica;
        header.release = self.release;
        header
    }

    fn broadcast_commit(&mut self) {
        let mut header = self.base_header(Command::Commit);
        header.commit = self.commit_max;
        header.op = self.op;
        self.send(Target::AllReplicas, header, Vec::new());
    }

    fn retransmit_pipeline_head(&mut self) {
        if !self.is_primary() {
            return;
        }
        let Some(head) = self.pipeline.head() else { return };
        let prepare = head.message.clone();
        log::debug!(
            "[replica] replica={} retransmitting op {}",
            self.options.replica,
            prepare.header.op
        );
        self.send_message(Target::AllReplicas, prepare);
    }

    fn enter_normal_timeouts(&mut self) {
        self.view_change_status_timeout.stop();
        if self.is_primary() {
            self.commit_heartbeat.start();
            self.view_change_timeout.stop();
        } else {
            self.commit_heartbeat.stop();
            self.prepare_timeout.stop();
            self.abdicate_timeout.stop();
            if !self.options.is_standby() {
                self.view_change_timeout.start();
            }
        }
        self.scrub_timeout.start();
    }

    fn send(&mut self, to: Target, header: Header, body: Vec<u8>) {
        self.send_message(to, Message::new(header, body));
    }

    fn send_message(&mut self, to: Target, message: Message) {
        self.outbox.send(to, message);
    }

    /// Record a hard failure; true when the caller must bail out.
    fn guard(&mut self, result: Result<()>) -> bool {
        match result {
            Ok(()) => false,
            Err(err) => {
                log::error!("[replica] replica={} fatal: {}", self.options.replica, err);
                self.fatal = Some(err);
                true
            }
        }
    }
}
