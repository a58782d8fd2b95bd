// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 quorumdb contributors

//! View-change bookkeeping: vote tracking, do_view_change quorums, and
//! canonical log selection.
//!
//! A do_view_change carries the sender's journal suffix with blank
//! placeholder headers for ops it has no header for. A blank is a nack:
//! an op is truncated only when every quorum member sent a blank for it
//! and no member's commit covers it. Any real header, from any log view,
//! keeps the op alive (it is then repaired, not trusted blindly - bodies
//! still verify against the adopted header checksums).

use crate::config::REPLICAS_MAX;
use crate::wire::{decode_headers, Command, Header, Message};

/// Per-view vote set (start_view_change).
#[derive(Debug)]
pub struct VoteTracker {
    view: u32,
    votes: u16,
}

impl VoteTracker {
    #[must_use]
    pub fn new() -> Self {
        Self { view: 0, votes: 0 }
    }

    /// Clear votes when moving to a new view.
    pub fn reset(&mut self, view: u32) {
        self.view = view;
        self.votes = 0;
    }

    /// Record a vote. Duplicates count once.
    pub fn record(&mut self, view: u32, replica: u8) -> bool {
        assert!((replica as usize) < REPLICAS_MAX);
        if view != self.view {
            return false;
        }
        let bit = 1u16 << replica;
        let new = self.votes & bit == 0;
        self.votes |= bit;
        new
    }

    #[must_use]
    pub fn count(&self, view: u32) -> usize {
        if view == self.view {
            self.votes.count_ones() as usize
        } else {
            0
        }
    }
}

impl Default for VoteTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// A parsed do_view_change.
#[derive(Debug, Clone)]
pub struct DoViewChange {
    pub replica: u8,
    pub view: u32,
    pub log_view: u32,
    /// Sender's op head.
    pub op: u64,
    pub commit_max: u64,
    pub op_checkpoint: u64,
    /// Journal suffix, ascending op, blanks included.
    pub headers: Vec<Header>,
}

impl DoViewChange {
    /// Parse from the wire message. `timestamp` carries log_view and
    /// `parent` carries op_checkpoint, per the header field-reuse table.
    #[must_use]
    pub fn from_message(message: &Message) -> Option<Self> {
        assert_eq!(message.header.command, Command::DoViewChange);
        let headers = decode_headers(message.body())?;
        for header in &headers {
            if !header.is_blank() && header.command != Command::Prepare {
                return None;
            }
        }
        Some(Self {
            replica: message.header.replica,
            view: message.header.view,
            log_view: u32::try_from(message.header.timestamp).ok()?,
            op: message.header.op,
            commit_max: message.header.commit,
            op_checkpoint: u64::try_from(message.header.parent).ok()?,
            headers,
        })
    }

    /// Non-blank header for `op` in this suffix.
    #[must_use]
    pub fn header_for_op(&self, op: u64) -> Option<&Header> {
        self.headers.iter().find(|h| h.op == op && !h.is_blank())
    }

    /// True when this suffix covers `op` (blank or not).
    #[must_use]
    pub fn covers(&self, op: u64) -> bool {
        self.headers.iter().any(|h| h.op == op)
    }
}

/// Collected do_view_change messages for one view.
#[derive(Debug)]
pub struct DvcQuorum {
    view: u32,
    received: Vec<Option<DoViewChange>>,
}

impl DvcQuorum {
    #[must_use]
    pub fn new() -> Self {
        Self { view: 0, received: (0..REPLICAS_MAX).map(|_| None).collect() }
    }

    pub fn reset(&mut self, view: u32) {
        self.view = view;
        for slot in &mut self.received {
            *slot = None;
        }
    }

    /// Record a DVC for the tracked view. First message per replica wins.
    pub fn record(&mut self, dvc: DoViewChange) {
        if dvc.view != self.view {
            return;
        }
        let slot = &mut self.received[dvc.replica as usize];
        if slot.is_none() {
            *slot = Some(dvc);
        }
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.received.iter().flatten().count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DoViewChange> {
        self.received.iter().flatten()
    }

    #[must_use]
    pub fn contains(&self, replica: u8) -> bool {
        self.received[replica as usize].is_some()
    }
}

impl Default for DvcQuorum {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of canonical log selection.
#[derive(Debug)]
pub struct LogSelection {
    /// New op head after any truncation.
    pub op_head: u64,
    /// Cluster commit high-water mark across the quorum.
    pub commit_max: u64,
    /// Adopted suffix headers, ascending op.
    pub headers: Vec<Header>,
    /// Committed ops below the suffix that no quorum member could name;
    /// the primary must fetch their headers from peers before starting
    /// the view.
    pub missing_committed: Vec<u64>,
    /// Ops truncated as certainly absent (diagnostic).
    pub truncated_from: Option<u64>,
}

/// Pick the canonical log from a DVC quorum.
///
/// `from` is the new primary's own `commit_min + 1`: everything below is
/// already applied locally and needs no header.
#[must_use]
pub fn select_log(quorum: &DvcQuorum, from: u64) -> LogSelection {
    let canonical = quorum
        .iter()
        .max_by_key(|dvc| (dvc.log_view, dvc.op))
        .expect("selection requires a non-empty quorum");
    let commit_max = quorum.iter().map(|dvc| dvc.commit_max).max().unwrap_or(0);

    let mut headers = Vec::new();
    let mut missing_committed = Vec::new();
    let mut truncated_from = None;
    let mut op_head = canonical.op.max(commit_max);

    let mut op = from;
    while op <= op_head {
        // Prefer the canonical log view's header; fall back to any header
        // (an op with any surviving header is not certainly absent).
        let adopted = quorum
            .iter()
            .filter(|dvc| dvc.log_view == canonical.log_view)
            .find_map(|dvc| dvc.header_for_op(op))
            .or_else(|| quorum.iter().find_map(|dvc| dvc.header_for_op(op)));

        match adopted {
            Some(header) => {
                // Same op in the same log view is the same prepare.
                for dvc in quorum.iter().filter(|d| d.log_view == canonical.log_view) {
                    if let Some(other) = dvc.header_for_op(op) {
                        assert_eq!(other.checksum, header.checksum);
                    }
                }
                headers.push(*header);
            }
            None if op <= commit_max => {
                // Committed but below every member's suffix window: the
                // header exists in peers' WALs, just not in the DVCs.
                missing_committed.push(op);
            }
            None => {
                // Every quorum member nacked (blank or beyond their head)
                // and no commit covers it: certainly absent. The suffix
                // above it chains through it and dies with it.
                truncated_from = Some(op);
                op_head = op - 1;
                break;
            }
        }
        op += 1;
    }

    LogSelection { op_head, commit_max, headers, missing_committed, truncated_from }
}

// ============================================================================
// Replica view-change protocol
// ============================================================================

use crate::bus::Target;
use crate::config::prepare_max_for_checkpoint;
use crate::replica::{Replica, Status};
use crate::state_machine::StateMachine;
use crate::wal;
use crate::wire::encode_headers;

impl<S: StateMachine> Replica<S> {
    /// A message named a view beyond ours: ask that view's primary for
    /// start_view rather than guessing state.
    pub(crate) fn note_newer_view(&mut self, view: u32) {
        assert!(view > self.view);
        let primary = self.options.primary_for_view(view);
        if primary == self.options.replica {
            return;
        }
        let mut header = self.base_header(Command::RequestStartView);
        header.view = view;
        self.send(Target::Replica(primary), header, Vec::new());
    }

    /// recovering_head: learn the authoritative head from the current
    /// primary. Rate-limited to once per repair period.
    pub(crate) fn request_start_view_from_primary(&mut self) {
        if self.rsv_sent {
            return;
        }
        let primary = self.options.primary_for_view(self.view);
        if primary == self.options.replica {
            return;
        }
        self.rsv_sent = true;
        let header = self.base_header(Command::RequestStartView);
        self.send(Target::Replica(primary), header, Vec::new());
    }

    /// Enter (or re-announce) a view change for `view`.
    pub(crate) fn begin_view_change(&mut self, view: u32) {
        if self.options.is_standby() {
            return;
        }
        assert!(view > self.view || (view == self.view && self.status == Status::ViewChange));
        log::info!(
            "[view] replica={} view_change view {} -> {}",
            self.options.replica,
            self.view,
            view
        );
        self.view = view;
        self.status = Status::ViewChange;
        self.abdicating = false;
        self.pipeline.clear();
        self.do_view_change_sent = false;
        self.log_selected = false;
        self.svc_votes.reset(view);
        self.dvcs.reset(view);

        self.commit_heartbeat.stop();
        self.prepare_timeout.stop();
        self.abdicate_timeout.stop();
        self.view_change_timeout.stop();
        self.view_change_status_timeout.start();

        self.svc_votes.record(view, self.options.replica);
        let header = self.base_header(Command::StartViewChange);
        self.send(Target::AllActive, header, Vec::new());
        self.check_svc_quorum();
    }

    /// Open-time re-entry: the superblock says a view change was promised
    /// (log_view < view) but never completed.
    pub(crate) fn rejoin_view_change(&mut self, view: u32) {
        assert_eq!(self.status, Status::ViewChange);
        assert_eq!(view, self.view);
        self.begin_view_change(view);
    }

    /// Periodic re-announcement while the view change is unresolved.
    pub(crate) fn resend_view_change_messages(&mut self) {
        assert_eq!(self.status, Status::ViewChange);
        let header = self.base_header(Command::StartViewChange);
        self.send(Target::AllActive, header, Vec::new());
        if self.do_view_change_sent
            && self.options.primary_for_view(self.view) != self.options.replica
        {
            self.send_do_view_change();
        }
        self.maybe_start_view_broadcast();
    }

    pub(crate) fn on_start_view_change(&mut self, message: &Message) {
        let header = &message.header;
        if self.options.is_standby() || header.view < self.view {
            return;
        }
        if self.status == Status::RecoveringHead {
            // An untrusted head must not vote; it waits for start_view.
            return;
        }
        if header.view > self.view {
            self.begin_view_change(header.view);
        }
        if self.status != Status::ViewChange || header.view != self.view {
            return;
        }
        self.svc_votes.record(self.view, header.replica);
        self.check_svc_quorum();
    }

    fn check_svc_quorum(&mut self) {
        if self.status != Status::ViewChange || self.do_view_change_sent {
            return;
        }
        if self.svc_votes.count(self.view) >= self.options.quorum_view_change() {
            self.send_do_view_change();
        }
    }

    /// The view promise: durably record the view, then hand the primary
    /// our log suffix (blanks mark ops we cannot vouch for).
    fn send_do_view_change(&mut self) {
        assert_eq!(self.status, Status::ViewChange);
        self.do_view_change_sent = true;

        let view = self.view;
        let update = self.superblock.update(self.storage.as_mut(), |s| {
            s.vsr_state.view = view;
        });
        if self.guard(update) {
            return;
        }

        let mut headers = Vec::new();
        for op in self.commit_min + 1..=self.op {
            match self.journal.header_for_op(op) {
                Some(header) => headers.push(*header),
                None => headers.push(Header::blank(self.options.cluster, view, op)),
            }
        }

        let primary = self.options.primary_for_view(view);
        if primary == self.options.replica {
            let dvc = DoViewChange {
                replica: self.options.replica,
                view,
                log_view: self.log_view,
                op: self.op,
                commit_max: self.commit_max,
                op_checkpoint: self.superblock.vsr_state.op_checkpoint,
                headers,
            };
            self.dvcs.record(dvc);
            self.maybe_complete_view_change();
        } else {
            let mut header = self.base_header(Command::DoViewChange);
            header.op = self.op;
            header.commit = self.commit_max;
            header.timestamp = u64::from(self.log_view);
            header.parent = u128::from(self.superblock.vsr_state.op_checkpoint);
            self.send(Target::Replica(primary), header, encode_headers(&headers));
        }
    }

    pub(crate) fn on_do_view_change(&mut self, message: &Message) {
        let header = &message.header;
        if self.options.is_standby() || header.view < self.view {
            return;
        }
        if self.status == Status::RecoveringHead {
            return;
        }
        if header.view > self.view {
            self.begin_view_change(header.view);
        }
        if self.options.primary_for_view(self.view) != self.options.replica {
            return;
        }
        if self.status == Status::Normal && header.view == self.view {
            // Already through: the sender missed our start_view.
            let (sv, body) = self.build_start_view();
            self.send(Target::Replica(header.replica), sv, body);
            return;
        }
        if self.status != Status::ViewChange || header.view != self.view {
            return;
        }
        let Some(dvc) = DoViewChange::from_message(message) else { return };
        // A do_view_change implies the sender saw a start_view_change
        // quorum; it counts as a vote too.
        self.svc_votes.record(self.view, header.replica);
        self.dvcs.record(dvc);
        self.check_svc_quorum();
        self.maybe_complete_view_change();
    }

    /// With a DVC quorum in hand: forfeit if our checkpoint cannot host
    /// the cluster's log, otherwise adopt the canonical log and repair.
    fn maybe_complete_view_change(&mut self) {
        if self.status != Status::ViewChange || self.log_selected || !self.do_view_change_sent {
            return;
        }
        if self.options.primary_for_view(self.view) != self.options.replica {
            return;
        }
        if self.dvcs.count() < self.options.quorum_view_change()
            || !self.dvcs.contains(self.options.replica)
        {
            return;
        }

        let commit_all = self.dvcs.iter().map(|d| d.commit_max).max().unwrap_or(0);
        if commit_all > prepare_max_for_checkpoint(self.superblock.vsr_state.op_checkpoint) {
            // Our checkpoint is too stale to repair up to the cluster's
            // commit: forfeit so the next in line leads.
            log::warn!(
                "[view] replica={} forfeits view {}: checkpoint {} too stale for commit {}",
                self.options.replica,
                self.view,
                self.superblock.vsr_state.op_checkpoint,
                commit_all
            );
            self.begin_view_change(self.view + 1);
            return;
        }

        let selection = select_log(&self.dvcs, self.commit_min + 1);
        log::info!(
            "[view] replica={} selected log for view {}: op_head={} commit_max={} missing={} truncated_from={:?}",
            self.options.replica,
            self.view,
            selection.op_head,
            selection.commit_max,
            selection.missing_committed.len(),
            selection.truncated_from,
        );

        self.journal.truncate_after(selection.op_head);
        self.op = selection.op_head;
        for header in &selection.headers {
            if self.journal.checksum_for_op(header.op) == Some(header.checksum) {
                continue;
            }
            self.journal.set_header(*header);
            let persisted = wal::repair_header(self.storage.as_mut(), header);
            if self.guard(persisted) {
                return;
            }
        }
        self.observe_commit_max(selection.commit_max);
        self.log_selected = true;
        self.maybe_start_view_broadcast();
    }

    /// Broadcast start_view once the canonical log is complete on disk.
    pub(crate) fn maybe_start_view_broadcast(&mut self) {
        if self.status != Status::ViewChange || !self.log_selected {
            return;
        }
        if self.options.primary_for_view(self.view) != self.options.replica {
            return;
        }
        if !self.journal.repair_targets(self.commit_min + 1, self.op).is_empty() {
            return;
        }

        self.status = Status::Normal;
        self.log_view = self.view;
        let (view, log_view) = (self.view, self.log_view);
        let update = self.superblock.update(self.storage.as_mut(), |s| {
            s.vsr_state.view = view;
            s.vsr_state.log_view = log_view;
        });
        if self.guard(update) {
            return;
        }

        let (header, body) = self.build_start_view();
        self.send(Target::AllReplicas, header, body);

        // Rebuild the pipeline over the uncommitted suffix so backup acks
        // have something to land on.
        self.pipeline.clear();
        for op in self.commit_max + 1..=self.op {
            let prepare = match wal::read_prepare(self.storage.as_mut(), wal::slot_for_op(op)) {
                Ok(Some(prepare)) => prepare,
                _ => break,
            };
            if self.pipeline.prepare_queue_full() {
                break;
            }
            self.pipeline.push_prepare(prepare);
            let replica = self.options.replica;
            let entry = self.pipeline.prepare_by_op(op).expect("just pushed");
            entry.ack(replica);
        }

        self.enter_normal_timeouts();
        log::info!(
            "[view] replica={} is primary of view {} (op={} commit={})",
            self.options.replica,
            self.view,
            self.op,
            self.commit_max
        );
        self.advance_commit();
        if self.op > self.commit_min && self.pipeline.prepares_len() == 0 {
            self.inject_pulse();
        }
    }

    pub(crate) fn build_start_view(&self) -> (Header, Vec<u8>) {
        let mut headers = Vec::new();
        for op in self.commit_min + 1..=self.op {
            let header = self.journal.header_for_op(op).expect("canonical log is complete");
            headers.push(*header);
        }
        let mut header = self.base_header(Command::StartView);
        header.op = self.op;
        header.commit = self.commit_max;
        (header, encode_headers(&headers))
    }

    pub(crate) fn on_start_view(&mut self, message: &Message) {
        let header = &message.header;
        if header.view < self.view {
            return;
        }
        if header.replica != self.options.primary_for_view(header.view)
            || header.replica == self.options.replica
        {
            return;
        }
        let Some(headers) = crate::wire::decode_headers(message.body()) else { return };

        self.view = header.view;
        self.journal.truncate_after(header.op);
        for suffix_header in &headers {
            assert!(!suffix_header.is_blank());
            if self.journal.checksum_for_op(suffix_header.op) == Some(suffix_header.checksum) {
                continue;
            }
            self.journal.set_header(*suffix_header);
            let persisted = wal::repair_header(self.storage.as_mut(), suffix_header);
            if self.guard(persisted) {
                return;
            }
        }
        self.op = header.op;
        self.observe_commit_max(header.commit);

        let was = self.status;
        self.status = Status::Normal;
        self.log_view = self.view;
        let (view, log_view) = (self.view, self.log_view);
        let update = self.superblock.update(self.storage.as_mut(), |s| {
            s.vsr_state.view = view;
            s.vsr_state.log_view = log_view;
        });
        if self.guard(update) {
            return;
        }
        self.pipeline.clear();
        self.abdicating = false;
        self.do_view_change_sent = false;
        self.log_selected = false;
        self.enter_normal_timeouts();
        log::info!(
            "[view] replica={} entering view {} from {} (op={} commit_max={})",
            self.options.replica,
            self.view,
            was,
            self.op,
            self.commit_max
        );

        // Ack whatever part of the uncommitted suffix we already hold.
        let acks: Vec<Header> = (self.commit_max + 1..=self.op)
            .filter(|&op| self.journal.has_clean(op))
            .filter_map(|op| self.journal.header_for_op(op).copied())
            .collect();
        for prepare in acks {
            self.send_prepare_ok(&prepare);
        }
        self.advance_commit();
    }

    pub(crate) fn on_request_start_view(&mut self, message: &Message) {
        if !self.is_primary() || message.header.view > self.view {
            return;
        }
        let (header, body) = self.build_start_view();
        self.send(Target::Replica(message.header.replica), header, body);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Operation;

    fn header(op: u64, view: u32, parent: u128) -> Header {
        let mut h = Header::new(1, Command::Prepare);
        h.op = op;
        h.view = view;
        h.parent = parent;
        h.operation = Operation::USER_MIN;
        h.set_checksum_body(&[]);
        h.set_checksum();
        h
    }

    fn dvc(replica: u8, view: u32, log_view: u32, commit_max: u64, headers: Vec<Header>) -> DoViewChange {
        let op = headers.iter().filter(|h| !h.is_blank()).map(|h| h.op).max().unwrap_or(commit_max);
        DoViewChange { replica, view, log_view, op, commit_max, op_checkpoint: 0, headers }
    }

    #[test]
    fn test_vote_tracker_dedupes() {
        let mut votes = VoteTracker::new();
        votes.reset(3);
        assert!(votes.record(3, 0));
        assert!(!votes.record(3, 0));
        assert!(votes.record(3, 1));
        assert_eq!(votes.count(3), 2);
        assert_eq!(votes.count(4), 0);
    }

    #[test]
    fn test_select_adopts_highest_log_view() {
        let mut quorum = DvcQuorum::new();
        quorum.reset(2);
        let old = header(5, 0, 0);
        let new = header(5, 1, 0);
        quorum.record(dvc(0, 2, 1, 4, vec![new]));
        quorum.record(dvc(1, 2, 0, 4, vec![old]));

        let selection = select_log(&quorum, 5);
        assert_eq!(selection.op_head, 5);
        assert_eq!(selection.headers.len(), 1);
        assert_eq!(selection.headers[0].checksum, new.checksum);
    }

    #[test]
    fn test_select_truncates_all_blank_uncommitted() {
        let mut quorum = DvcQuorum::new();
        quorum.reset(2);
        // Both replicas have op 5 but nack op 6.
        let h5 = header(5, 1, 0);
        quorum.record(dvc(0, 2, 1, 5, vec![h5, Header::blank(1, 2, 6)]));
        quorum.record(dvc(1, 2, 1, 5, vec![h5, Header::blank(1, 2, 6)]));

        let selection = select_log(&quorum, 5);
        assert_eq!(selection.op_head, 5);
        assert_eq!(selection.truncated_from, Some(6));
    }

    #[test]
    fn test_select_keeps_op_with_single_header() {
        let mut quorum = DvcQuorum::new();
        quorum.reset(2);
        let h5 = header(5, 1, 0);
        let h6 = header(6, 1, h5.checksum);
        // Replica 0 nacks op 6; replica 1 has it: not certainly absent.
        quorum.record(dvc(0, 2, 1, 5, vec![h5, Header::blank(1, 2, 6)]));
        quorum.record(dvc(1, 2, 1, 5, vec![h5, h6]));

        let selection = select_log(&quorum, 5);
        assert_eq!(selection.op_head, 6);
        assert_eq!(selection.headers.last().expect("kept").checksum, h6.checksum);
        assert_eq!(selection.truncated_from, None);
    }

    #[test]
    fn test_select_never_truncates_committed() {
        let mut quorum = DvcQuorum::new();
        quorum.reset(2);
        // Nobody can name op 5, but replica 1's commit covers it.
        quorum.record(dvc(0, 2, 1, 4, vec![Header::blank(1, 2, 5)]));
        quorum.record(dvc(1, 2, 1, 5, vec![Header::blank(1, 2, 5)]));

        let selection = select_log(&quorum, 5);
        assert_eq!(selection.op_head, 5);
        assert_eq!(selection.missing_committed, vec![5]);
        assert_eq!(selection.truncated_from, None);
    }

    #[test]
    fn test_dvc_quorum_counts_distinct_replicas() {
        let mut quorum = DvcQuorum::new();
        quorum.reset(1);
        quorum.record(dvc(0, 1, 0, 0, vec![]));
        quorum.record(dvc(0, 1, 0, 0, vec![]));
        quorum.record(dvc(2, 1, 0, 0, vec![]));
        assert_eq!(quorum.count(), 2);
        assert!(quorum.contains(0));
        assert!(!quorum.contains(1));
    }
}
