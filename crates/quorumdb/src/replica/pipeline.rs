// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 quorumdb contributors

//! Primary-side prepare pipeline and request queue.
//!
//! At most `PIPELINE_PREPARE_QUEUE_MAX` uncommitted prepares are in flight;
//! behind them at most `PIPELINE_REQUEST_QUEUE_MAX` requests wait for a
//! slot. Anything beyond that is dropped - clients retry idempotently by
//! request number. Acks are a replica-id bitmask so duplicates count once.

use std::collections::VecDeque;

use crate::config::{PIPELINE_PREPARE_QUEUE_MAX, PIPELINE_REQUEST_QUEUE_MAX, REPLICAS_MAX};
use crate::wire::Message;

/// One in-flight prepare with its ack set.
#[derive(Debug)]
pub struct PipelineEntry {
    pub message: Message,
    acks: u16,
}

impl PipelineEntry {
    fn new(message: Message) -> Self {
        Self { message, acks: 0 }
    }

    /// Record an ack. Returns false for duplicates.
    pub fn ack(&mut self, replica: u8) -> bool {
        assert!((replica as usize) < REPLICAS_MAX);
        let bit = 1u16 << replica;
        if self.acks & bit != 0 {
            return false;
        }
        self.acks |= bit;
        true
    }

    #[must_use]
    pub fn ack_count(&self) -> usize {
        self.acks.count_ones() as usize
    }

    #[must_use]
    pub fn acked_by(&self, replica: u8) -> bool {
        self.acks & (1u16 << replica) != 0
    }
}

/// FIFO pipeline plus bounded request queue.
#[derive(Debug, Default)]
pub struct Pipeline {
    prepares: VecDeque<PipelineEntry>,
    requests: VecDeque<Message>,
}

impl Pipeline {
    #[must_use]
    pub fn new() -> Self {
        Self {
            prepares: VecDeque::with_capacity(PIPELINE_PREPARE_QUEUE_MAX),
            requests: VecDeque::with_capacity(PIPELINE_REQUEST_QUEUE_MAX),
        }
    }

    #[must_use]
    pub fn prepare_queue_full(&self) -> bool {
        self.prepares.len() >= PIPELINE_PREPARE_QUEUE_MAX
    }

    /// Queue an incoming request behind the pipeline. Returns false (drop)
    /// when the request queue is also full.
    pub fn push_request(&mut self, request: Message) -> bool {
        if self.requests.len() >= PIPELINE_REQUEST_QUEUE_MAX {
            return false;
        }
        self.requests.push_back(request);
        true
    }

    pub fn pop_request(&mut self) -> Option<Message> {
        self.requests.pop_front()
    }

    pub fn push_prepare(&mut self, message: Message) {
        assert!(!self.prepare_queue_full());
        if let Some(last) = self.prepares.back() {
            assert_eq!(last.message.header.op + 1, message.header.op);
        }
        self.prepares.push_back(PipelineEntry::new(message));
    }

    /// Entry for `op`, if in flight.
    pub fn prepare_by_op(&mut self, op: u64) -> Option<&mut PipelineEntry> {
        self.prepares.iter_mut().find(|e| e.message.header.op == op)
    }

    /// Oldest in-flight prepare.
    #[must_use]
    pub fn head(&self) -> Option<&PipelineEntry> {
        self.prepares.front()
    }

    /// Pop the head once its quorum is met and it is committed.
    pub fn pop_head(&mut self) -> Option<PipelineEntry> {
        self.prepares.pop_front()
    }

    /// True when any prepare or queued request references the client, which
    /// enforces one in-flight request per client.
    #[must_use]
    pub fn contains_client(&self, client: u128) -> bool {
        self.prepares.iter().any(|e| e.message.header.client == client)
            || self.requests.iter().any(|m| m.header.client == client)
    }

    #[must_use]
    pub fn prepares_len(&self) -> usize {
        self.prepares.len()
    }

    #[must_use]
    pub fn requests_len(&self) -> usize {
        self.requests.len()
    }

    pub fn iter_prepares(&self) -> impl Iterator<Item = &PipelineEntry> {
        self.prepares.iter()
    }

    /// Discard everything (view change: the new primary rebuilds from the
    /// canonical log, not from this queue).
    pub fn clear(&mut self) {
        self.prepares.clear();
        self.requests.clear();
    }
}
