// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 quorumdb contributors

//! Repair and state sync.
//!
//! Repair is pull-based and idempotent: the repair timeout walks every
//! deficit this replica knows about (journal gaps, dirty bodies, corrupt
//! replies, faulty grid blocks) and asks a peer for each, a bounded batch
//! per round. Peers answer only from verified local state, so a repair
//! response can always be checked against the checksum that requested it.
//!
//! State sync takes over when WAL repair cannot: the cluster's commit has
//! left our checkpoint's WAL window entirely, so we fetch a newer
//! checkpoint wholesale and rejoin from there.

use crate::bus::Target;
use crate::config::{prepare_max_for_checkpoint, RELEASES_BUNDLED};
use crate::grid::Grid;
use crate::replica::client_sessions::ClientSessions;
use crate::replica::sync::{CheckpointPackage, SyncStage};
use crate::replica::{Replica, Status};
use crate::state_machine::StateMachine;
use crate::wal;
use crate::wire::{encode_headers, Command, Message};

/// Journal repair requests per round.
const REPAIR_PREPARE_BATCH: usize = 4;
/// Grid block repair requests per round.
const REPAIR_BLOCK_BATCH: usize = 4;
/// Reply repair requests per round.
const REPAIR_REPLY_BATCH: usize = 2;

impl<S: StateMachine> Replica<S> {
    /// One pass over every known deficit.
    pub(crate) fn repair_round(&mut self) {
        self.rsv_sent = false;
        if self.fatal.is_some() {
            return;
        }
        if self.status == Status::RecoveringHead {
            self.request_start_view_from_primary();
        }

        // Headers we do not even know about: the cluster committed past
        // our head.
        if self.commit_max > self.op {
            self.request_headers_range(self.op + 1, self.commit_max);
        }

        // Dirty bodies and headerless ops inside the live range.
        let targets = self.journal.repair_targets(self.commit_min + 1, self.op);
        let mut headerless: Option<(u64, u64)> = None;
        let mut requested = 0usize;
        for op in targets {
            if requested >= REPAIR_PREPARE_BATCH {
                break;
            }
            match self.journal.checksum_for_op(op) {
                Some(checksum) => {
                    let Some(peer) = self.repair_peer() else { break };
                    let mut header = self.base_header(Command::RequestPrepare);
                    header.op = op;
                    header.parent = checksum;
                    self.send(Target::Replica(peer), header, Vec::new());
                    requested += 1;
                }
                None => {
                    headerless = Some(match headerless {
                        None => (op, op),
                        Some((min, _)) => (min, op),
                    });
                }
            }
        }
        if let Some((min, max)) = headerless {
            self.request_headers_range(min, max);
        }

        // Replies lost to reply-zone corruption.
        for (client, checksum) in
            self.sessions.repair_targets().into_iter().take(REPAIR_REPLY_BATCH)
        {
            let Some(peer) = self.repair_peer() else { break };
            let mut header = self.base_header(Command::RequestReply);
            header.client = client;
            header.parent = checksum;
            self.send(Target::Replica(peer), header, Vec::new());
        }

        // Faulty grid blocks.
        for address in self.grid.faulty_addresses().into_iter().take(REPAIR_BLOCK_BATCH) {
            let Some(peer) = self.repair_peer() else { break };
            let mut header = self.base_header(Command::RequestBlock);
            header.op = address;
            header.parent = self.grid.expected(address);
            self.send(Target::Replica(peer), header, Vec::new());
        }

        self.maybe_start_view_broadcast();
        self.maybe_sync();
    }

    /// Called whenever a repair lands, to unblock whatever waited on it.
    pub(crate) fn after_repair_progress(&mut self) {
        self.maybe_start_view_broadcast();
    }

    /// Round-robin over cluster members, standbys included (any member
    /// with a verified copy is a valid repair source). Backups prefer the
    /// primary first within each cycle.
    fn repair_peer(&mut self) -> Option<u8> {
        let members = self.options.member_count() as u8;
        if members <= 1 {
            return None;
        }
        for _ in 0..members {
            let candidate = self.repair_cursor % members;
            self.repair_cursor = self.repair_cursor.wrapping_add(1);
            if candidate != self.options.replica {
                return Some(candidate);
            }
        }
        None
    }

    pub(crate) fn request_headers_range(&mut self, op_min: u64, op_max: u64) {
        assert!(op_min <= op_max);
        let Some(peer) = self.repair_peer() else { return };
        let mut header = self.base_header(Command::RequestHeaders);
        header.timestamp = op_min;
        header.op = op_max;
        self.send(Target::Replica(peer), header, Vec::new());
    }

    // ========================================================================
    // Serving repairs
    // ========================================================================

    pub(crate) fn on_request_prepare(&mut self, message: &Message) {
        let op = message.header.op;
        let expected = message.header.parent;
        if !self.journal.has_clean(op) {
            return;
        }
        if expected != 0 && self.journal.checksum_for_op(op) != Some(expected) {
            return;
        }
        match wal::read_prepare(self.storage.as_mut(), wal::slot_for_op(op)) {
            Ok(Some(prepare)) if prepare.header.op == op => {
                self.send_message(Target::Replica(message.header.replica), prepare);
            }
            Ok(_) => {
                // The journal thought the slot was clean; disk disagrees.
                self.journal.mark_faulty(wal::slot_for_op(op));
            }
            Err(err) => {
                let _ = self.guard(Err(err));
            }
        }
    }

    pub(crate) fn on_request_headers(&mut self, message: &Message) {
        let op_min = message.header.timestamp;
        let op_max = message.header.op;
        if op_min > op_max {
            return;
        }
        let headers: Vec<_> = (op_min..=op_max.min(op_min + 30))
            .filter_map(|op| self.journal.header_for_op(op))
            .copied()
            .collect();
        if headers.is_empty() {
            return;
        }
        let header = self.base_header(Command::Headers);
        self.send(Target::Replica(message.header.replica), header, encode_headers(&headers));
    }

    pub(crate) fn on_headers(&mut self, message: &Message) {
        let Some(headers) = crate::wire::decode_headers(message.body()) else { return };
        let window_max = prepare_max_for_checkpoint(self.superblock.vsr_state.op_checkpoint);
        let from_primary = message.header.replica == self.options.primary_for_view(self.view)
            && message.header.view == self.view;
        let mut installed = false;

        for header in headers {
            if header.is_blank() || header.command != Command::Prepare {
                continue;
            }
            if header.op <= self.superblock.vsr_state.op_checkpoint || header.op > window_max {
                continue;
            }
            // Committed headers are safe from anyone; uncommitted ones only
            // from the primary we currently follow.
            if header.op > self.commit_max && !from_primary {
                continue;
            }
            if self.journal.checksum_for_op(header.op) == Some(header.checksum) {
                continue;
            }
            self.journal.set_header(header);
            let persisted = wal::repair_header(self.storage.as_mut(), &header);
            if self.guard(persisted) {
                return;
            }
            if header.op <= self.commit_max && header.op > self.op {
                self.op = header.op;
            }
            installed = true;
        }
        if installed {
            self.after_repair_progress();
            self.advance_commit();
        }
    }

    pub(crate) fn on_request_reply(&mut self, message: &Message) {
        let client = message.header.client;
        let expected = message.header.parent;
        let Some(reply) = self.sessions.cached_reply(client) else { return };
        if reply.header.checksum != expected {
            return;
        }
        let reply = reply.clone();
        self.send_message(Target::Replica(message.header.replica), reply);
    }

    /// A reply arriving at a replica (not a client) is reply-cache repair.
    pub(crate) fn on_reply_for_repair(&mut self, message: &Message) {
        let result = self.sessions.repair(self.storage.as_mut(), message);
        match result {
            Ok(_) => {}
            Err(err) => {
                let _ = self.guard(Err(err));
            }
        }
    }

    pub(crate) fn on_request_block(&mut self, message: &Message) {
        let address = message.header.op;
        let expected = message.header.parent;
        if address == 0
            || address > crate::config::GRID_BLOCKS_MAX
            || self.grid.expected(address) != expected
            || expected == 0
        {
            return;
        }
        let raw = match self.grid.read_block_raw(self.storage.as_mut(), address) {
            Ok(Some(raw)) => raw,
            Ok(None) => return, // our copy is faulty too
            Err(err) => {
                let _ = self.guard(Err(err));
                return;
            }
        };
        let mut header = self.base_header(Command::Block);
        header.op = address;
        header.parent = expected;
        self.send(Target::Replica(message.header.replica), header, raw);
    }

    pub(crate) fn on_block(&mut self, message: &Message) {
        let address = message.header.op;
        if address == 0 || address > crate::config::GRID_BLOCKS_MAX {
            return;
        }
        let repaired =
            match self.grid.repair_block(self.storage.as_mut(), address, message.body()) {
                Ok(repaired) => repaired,
                Err(err) => {
                    let _ = self.guard(Err(err));
                    return;
                }
            };
        if repaired && !self.machine_loaded {
            // The checkpoint image may be whole again.
            self.advance_commit();
        }
    }

    // ========================================================================
    // State sync
    // ========================================================================

    /// Fall back to state sync when the cluster's commit has left our WAL
    /// window: no sequence of request_prepare can catch us up.
    pub(crate) fn maybe_sync(&mut self) {
        if self.options.member_count() <= 1 || self.fatal.is_some() {
            return;
        }
        if matches!(self.sync, SyncStage::Requesting { .. }) {
            return;
        }
        if self.commit_max <= prepare_max_for_checkpoint(self.superblock.vsr_state.op_checkpoint) {
            return;
        }

        // Choose the highest checkpoint with enough independent agreement
        // on its id.
        let own = self.superblock.vsr_state.op_checkpoint;
        let mut best: Option<(u64, u128)> = None;
        for (replica, advertised) in self.peer_checkpoints.iter().enumerate() {
            let Some((op, id)) = *advertised else { continue };
            if op <= own || replica == self.options.replica as usize {
                continue;
            }
            let agreement = self
                .peer_checkpoints
                .iter()
                .flatten()
                .filter(|(o, i)| *o == op && *i == id)
                .count();
            if agreement >= self.options.quorum_sync()
                && best.map_or(true, |(bo, _)| op > bo)
            {
                best = Some((op, id));
            }
        }
        let Some((target_op, target_id)) = best else { return };

        log::info!(
            "[sync] replica={} starting state sync to checkpoint {} (own {})",
            self.options.replica,
            target_op,
            own
        );
        self.sync = SyncStage::Requesting { target_op, target_id };
        self.sync_timeout.start();
        self.send_sync_request();
    }

    pub(crate) fn continue_sync(&mut self) {
        match self.sync {
            SyncStage::Idle => self.sync_timeout.stop(),
            SyncStage::Requesting { .. } => self.send_sync_request(),
        }
    }

    fn send_sync_request(&mut self) {
        let SyncStage::Requesting { target_op, target_id } = self.sync else { return };
        // Ask a peer that advertised exactly this checkpoint.
        let advertiser = self
            .peer_checkpoints
            .iter()
            .enumerate()
            .filter(|(replica, advertised)| {
                *replica != self.options.replica as usize
                    && **advertised == Some((target_op, target_id))
            })
            .map(|(replica, _)| replica as u8)
            .nth(self.repair_cursor as usize % 2);
        let peer = match advertiser.or_else(|| {
            self.peer_checkpoints
                .iter()
                .position(|a| *a == Some((target_op, target_id)))
                .map(|r| r as u8)
        }) {
            Some(peer) => peer,
            None => {
                self.sync = SyncStage::Idle;
                self.sync_timeout.stop();
                return;
            }
        };
        let mut header = self.base_header(Command::RequestSyncCheckpoint);
        header.op = target_op;
        header.parent = target_id;
        self.send(Target::Replica(peer), header, Vec::new());
    }

    pub(crate) fn on_request_sync_checkpoint(&mut self, message: &Message) {
        let state = &self.superblock.vsr_state;
        if message.header.op != state.op_checkpoint
            || message.header.parent != state.checkpoint_id
            || self.superblock.checkpoint_size == 0
        {
            return;
        }

        // Reassemble the checkpoint image; a locally faulty block means we
        // cannot serve (the requester will try another peer).
        let mut image = Vec::with_capacity(self.superblock.checkpoint_size as usize);
        for &address in self.superblock.checkpoint_blocks.iter().filter(|&&a| a != 0) {
            match self.grid.read_block(self.storage.as_mut(), address) {
                Ok(Some(payload)) => image.extend_from_slice(&payload),
                Ok(None) => return,
                Err(err) => {
                    let _ = self.guard(Err(err));
                    return;
                }
            }
        }
        image.truncate(self.superblock.checkpoint_size as usize);

        let package = CheckpointPackage {
            op_checkpoint: state.op_checkpoint,
            checkpoint_id: state.checkpoint_id,
            release: self.superblock.release,
            commit_min: state.commit_min,
            free_set_words: self.superblock.free_set_words,
            grid_index: self.superblock.grid_index.to_vec(),
            checkpoint_blocks: self.superblock.checkpoint_blocks,
            checkpoint_size: self.superblock.checkpoint_size,
            sessions: self.superblock.sessions,
            image,
        };
        let mut header = self.base_header(Command::SyncCheckpoint);
        header.op = state.op_checkpoint;
        header.parent = state.checkpoint_id;
        self.send(Target::Replica(message.header.replica), header, package.encode());
    }

    pub(crate) fn on_sync_checkpoint(&mut self, message: &Message) {
        let SyncStage::Requesting { target_op, target_id } = self.sync else { return };
        if message.header.op != target_op || message.header.parent != target_id {
            return;
        }
        let Some(package) = CheckpointPackage::decode(message.body()) else { return };
        if package.op_checkpoint != target_op || package.checkpoint_id != target_id {
            return;
        }
        if Self::checkpoint_id_for(&package.image, target_op) != target_id {
            return;
        }
        if target_op <= self.superblock.vsr_state.op_checkpoint {
            self.sync = SyncStage::Idle;
            self.sync_timeout.stop();
            return;
        }

        log::info!(
            "[sync] replica={} installing checkpoint {} (commit_min {})",
            self.options.replica,
            target_op,
            package.commit_min
        );

        let update = {
            let package = &package;
            self.superblock.update(self.storage.as_mut(), |s| {
                s.vsr_state.op_checkpoint = package.op_checkpoint;
                s.vsr_state.checkpoint_id = package.checkpoint_id;
                s.vsr_state.commit_min = package.commit_min;
                s.vsr_state.sync_op_min = 0;
                s.vsr_state.sync_op_max = 0;
                s.free_set_words = package.free_set_words;
                s.grid_index.copy_from_slice(&package.grid_index);
                s.checkpoint_blocks = package.checkpoint_blocks;
                s.checkpoint_size = package.checkpoint_size;
                s.sessions = package.sessions;
                s.release = package.release;
            })
        };
        if self.guard(update) {
            return;
        }

        self.grid = Grid::from_superblock(&self.superblock);
        let audit = self.grid.audit(self.storage.as_mut());
        match audit {
            Ok(faults) => {
                if faults > 0 {
                    log::info!("[sync] replica={} queued {} grid block fetches", self.options.replica, faults);
                }
            }
            Err(err) => {
                let _ = self.guard(Err(err));
                return;
            }
        }
        let sessions = ClientSessions::restore(&self.superblock.sessions, self.storage.as_mut());
        match sessions {
            Ok(sessions) => self.sessions = sessions,
            Err(err) => {
                let _ = self.guard(Err(err));
                return;
            }
        }

        self.machine.restore(&package.image);
        self.machine_loaded = true;
        self.commit_min = package.commit_min;
        self.observe_commit_max(package.commit_min);
        // Prepares already journaled beyond the new checkpoint survive:
        // truncation is only ever a view-change decision.
        self.op = self.op.max(self.commit_min);
        self.sync = SyncStage::Idle;
        self.sync_timeout.stop();

        if !RELEASES_BUNDLED.contains(&package.release) {
            // The checkpoint runs a release this binary does not carry.
            let _ = self.guard(Err(crate::error::Error::ReleaseNotBundled(package.release)));
            return;
        }
        self.release = package.release;

        self.status = Status::RecoveringHead;
        self.rsv_sent = false;
        self.request_start_view_from_primary();
        self.advance_commit();
    }
}
