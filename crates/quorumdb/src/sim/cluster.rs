// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 quorumdb contributors

//! The simulated cluster: replicas, virtual network, scripted clients.

use std::collections::VecDeque;

use crate::bus::{Envelope, Target};
use crate::config::{Options, RELEASE};
use crate::error::Result;
use crate::replica::{Replica, Status};
use crate::state_machine::Accumulator;
use crate::storage::{SimDisk, Zone};
use crate::wire::{Command, Header, Message, REPLICA_CLIENT};

/// Ticks a client waits for a reply before rebroadcasting its request.
const CLIENT_RETRY_TICKS: u64 = 40;

/// A scripted client: one in-flight request, retries by request number.
pub struct SimClient {
    id: u128,
    next_request: u32,
    inflight: Option<(u32, Message, u64)>,
    pending: VecDeque<(u8, Vec<u8>)>,
    /// (request, reply body) in completion order.
    pub replies: Vec<(u32, Vec<u8>)>,
    /// Replies received for already-answered request numbers (cache
    /// replays after an explicit resend).
    pub duplicate_replies: Vec<(u32, Vec<u8>)>,
    last_sent: Option<Message>,
    resend_queued: bool,
    inbox: Vec<Message>,
}

impl SimClient {
    fn new(id: u128) -> Self {
        Self {
            id,
            next_request: 1,
            inflight: None,
            pending: VecDeque::new(),
            replies: Vec::new(),
            duplicate_replies: Vec::new(),
            last_sent: None,
            resend_queued: false,
            inbox: Vec::new(),
        }
    }

    /// Queue one operation for submission.
    pub fn submit(&mut self, operation: u8, payload: Vec<u8>) {
        self.pending.push_back((operation, payload));
    }

    /// Re-send the most recent request verbatim (duplicate delivery).
    pub fn resend_last(&mut self) {
        assert!(self.last_sent.is_some(), "nothing sent yet");
        self.resend_queued = true;
    }

    #[must_use]
    pub fn done(&self) -> bool {
        self.pending.is_empty() && self.inflight.is_none()
    }

    fn build_request(&self, cluster: u64, request: u32, operation: u8, payload: &[u8]) -> Message {
        let mut header = Header::new(cluster, Command::Request);
        header.client = self.id;
        header.request = request;
        header.operation = operation;
        header.replica = REPLICA_CLIENT;
        header.release = RELEASE;
        Message::new(header, payload.to_vec())
    }

    // Returns a request to broadcast, if due this tick.
    fn step(&mut self, cluster: u64) -> Option<Message> {
        for reply in std::mem::take(&mut self.inbox) {
            assert_eq!(reply.header.command, Command::Reply);
            let request = reply.header.request;
            if self.inflight.as_ref().is_some_and(|(r, _, _)| *r == request) {
                self.replies.push((request, reply.body().to_vec()));
                self.inflight = None;
            } else if request < self.next_request {
                self.duplicate_replies.push((request, reply.body().to_vec()));
            }
        }

        if self.resend_queued {
            self.resend_queued = false;
            return self.last_sent.clone();
        }

        match &mut self.inflight {
            Some((_, message, waited)) => {
                *waited += 1;
                if *waited >= CLIENT_RETRY_TICKS {
                    *waited = 0;
                    return Some(message.clone());
                }
                None
            }
            None => {
                let (operation, payload) = self.pending.pop_front()?;
                let request = self.next_request;
                self.next_request += 1;
                let message = self.build_request(cluster, request, operation, &payload);
                self.inflight = Some((request, message.clone(), 0));
                self.last_sent = Some(message.clone());
                Some(message)
            }
        }
    }
}

/// A full simulated cluster.
pub struct Cluster {
    cluster_id: u64,
    replica_count: u8,
    standby_count: u8,
    replicas: Vec<Option<Replica<Accumulator>>>,
    disks: Vec<SimDisk>,
    inboxes: Vec<Vec<Message>>,
    isolated: Vec<bool>,
    clients: Vec<SimClient>,
    ticks: u64,
}

impl Cluster {
    /// Format and open a fresh cluster.
    pub fn new(replica_count: u8, standby_count: u8) -> Result<Self> {
        let cluster_id = 0xC1A5;
        let members = usize::from(replica_count) + usize::from(standby_count);
        let mut disks = Vec::with_capacity(members);
        let mut replicas = Vec::with_capacity(members);
        for replica in 0..members as u8 {
            let disk = SimDisk::new();
            let options =
                Options { cluster: cluster_id, replica, replica_count, standby_count };
            Replica::<Accumulator>::format(&mut disk.storage(), &options)?;
            let opened =
                Replica::open(Box::new(disk.storage()), options, Accumulator::new())?;
            disks.push(disk);
            replicas.push(Some(opened));
        }
        Ok(Self {
            cluster_id,
            replica_count,
            standby_count,
            replicas,
            inboxes: vec![Vec::new(); members],
            isolated: vec![false; members],
            disks,
            clients: Vec::new(),
            ticks: 0,
        })
    }

    #[must_use]
    pub fn members(&self) -> usize {
        usize::from(self.replica_count) + usize::from(self.standby_count)
    }

    /// Virtual ticks elapsed.
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Add a scripted client; returns its index.
    pub fn add_client(&mut self) -> usize {
        let id = 0x1000 + self.clients.len() as u128 + 1;
        self.clients.push(SimClient::new(id));
        self.clients.len() - 1
    }

    pub fn client(&mut self, index: usize) -> &mut SimClient {
        &mut self.clients[index]
    }

    /// The client has received a reply for everything it submitted.
    #[must_use]
    pub fn client_done(&self, index: usize) -> bool {
        self.clients[index].done()
    }

    /// Queue `count` ADD operations spread over one client.
    pub fn submit_adds(&mut self, client: usize, count: u64) {
        for i in 0..count {
            self.clients[client].submit(crate::state_machine::op::ADD, (i + 1).to_le_bytes().to_vec());
        }
    }

    // ------------------------------------------------------------------
    // Fault control
    // ------------------------------------------------------------------

    /// Stop a replica (drop its process; the disk survives).
    pub fn stop(&mut self, replica: usize) {
        assert!(self.replicas[replica].is_some(), "already stopped");
        self.replicas[replica] = None;
        self.inboxes[replica].clear();
    }

    /// Restart a stopped replica over its surviving disk.
    pub fn restart(&mut self, replica: usize) -> Result<()> {
        assert!(self.replicas[replica].is_none(), "still running");
        let options = Options {
            cluster: self.cluster_id,
            replica: replica as u8,
            replica_count: self.replica_count,
            standby_count: self.standby_count,
        };
        let opened = Replica::open(
            Box::new(self.disks[replica].storage()),
            options,
            Accumulator::new(),
        )?;
        self.replicas[replica] = Some(opened);
        Ok(())
    }

    /// Fully partition a replica from everything (peers and clients).
    pub fn isolate(&mut self, replica: usize) {
        self.isolated[replica] = true;
        self.inboxes[replica].clear();
    }

    /// Reconnect an isolated replica.
    pub fn reconnect(&mut self, replica: usize) {
        self.isolated[replica] = false;
    }

    /// Direct disk access for corruption injection.
    #[must_use]
    pub fn disk(&self, replica: usize) -> &SimDisk {
        &self.disks[replica]
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn replica(&self, index: usize) -> &Replica<Accumulator> {
        self.replicas[index].as_ref().expect("replica is running")
    }

    pub fn replica_mut(&mut self, index: usize) -> &mut Replica<Accumulator> {
        self.replicas[index].as_mut().expect("replica is running")
    }

    #[must_use]
    pub fn is_running(&self, index: usize) -> bool {
        self.replicas[index].is_some()
    }

    #[must_use]
    pub fn commit_min_of(&self, index: usize) -> u64 {
        self.replica(index).commit_min()
    }

    #[must_use]
    pub fn status_of(&self, index: usize) -> Status {
        self.replica(index).status()
    }

    /// Index of the unique normal-status primary among connected active
    /// replicas, if exactly one exists.
    #[must_use]
    pub fn current_primary(&self) -> Option<usize> {
        let primaries: Vec<usize> = (0..usize::from(self.replica_count))
            .filter(|&i| !self.isolated[i])
            .filter(|&i| self.replicas[i].as_ref().is_some_and(Replica::is_primary))
            .collect();
        if primaries.len() == 1 {
            Some(primaries[0])
        } else {
            None
        }
    }

    /// Number of replicas (connected or not) currently claiming primacy.
    #[must_use]
    pub fn primary_count(&self) -> usize {
        (0..usize::from(self.replica_count))
            .filter(|&i| self.replicas[i].as_ref().is_some_and(Replica::is_primary))
            .count()
    }

    /// All running, connected replicas agree on `commit` and state digest.
    #[must_use]
    pub fn converged_at(&self, commit: u64) -> bool {
        let mut digest = None;
        for index in 0..self.members() {
            let Some(replica) = &self.replicas[index] else { continue };
            if self.isolated[index] {
                continue;
            }
            if replica.commit_min() != commit {
                return false;
            }
            let d = replica.machine().digest();
            match digest {
                None => digest = Some(d),
                Some(previous) => {
                    // Agreement: same commit number means same history.
                    assert_eq!(previous, d, "state divergence at commit {}", commit);
                }
            }
        }
        digest.is_some()
    }

    /// Live grid contents of two replicas are byte-identical for every
    /// address acquired in both free sets.
    #[must_use]
    pub fn grids_identical(&self, a: usize, b: usize) -> bool {
        let grid_a = self.disks[a].zone_bytes(Zone::Grid);
        let grid_b = self.disks[b].zone_bytes(Zone::Grid);
        let block = crate::config::BLOCK_SIZE;
        let live: Vec<u64> = self.replica(a).grid().free_set().iter_acquired().collect();
        for address in live {
            let start = (address as usize - 1) * block;
            if grid_a[start..start + block] != grid_b[start..start + block] {
                return false;
            }
        }
        true
    }

    /// Protocol invariants that must hold at every step on every replica.
    pub fn check_invariants(&self) {
        for index in 0..self.members() {
            let Some(replica) = &self.replicas[index] else { continue };
            assert!(replica.commit_min() <= replica.commit_max());
            assert!(replica.commit_min() >= replica.op_checkpoint());
            assert!(replica.commit_min() <= replica.op_head());
        }
    }

    // ------------------------------------------------------------------
    // Stepping
    // ------------------------------------------------------------------

    /// One virtual tick: deliver inboxes, tick replicas, route outboxes,
    /// step clients. Messages cross the network in one tick.
    pub fn step(&mut self) {
        self.ticks += 1;

        for index in 0..self.members() {
            let inbox = std::mem::take(&mut self.inboxes[index]);
            let Some(replica) = self.replicas[index].as_mut() else { continue };
            if !self.isolated[index] {
                for message in inbox {
                    replica.on_message(&message);
                }
            }
            replica.tick();
            let envelopes = replica.drain_outbox();
            self.route(index, envelopes);
        }

        for client in 0..self.clients.len() {
            let cluster_id = self.cluster_id;
            if let Some(request) = self.clients[client].step(cluster_id) {
                // Clients broadcast; only the primary admits requests.
                for target in 0..usize::from(self.replica_count) {
                    self.deliver(target, request.clone());
                }
            }
        }

        self.check_invariants();
    }

    /// Run a fixed number of ticks.
    pub fn run(&mut self, ticks: u64) {
        for _ in 0..ticks {
            self.step();
        }
    }

    /// Step until `predicate` holds; false when `max_ticks` ran out first.
    pub fn run_until<F>(&mut self, max_ticks: u64, mut predicate: F) -> bool
    where
        F: FnMut(&Cluster) -> bool,
    {
        for _ in 0..max_ticks {
            if predicate(self) {
                return true;
            }
            self.step();
        }
        predicate(self)
    }

    fn route(&mut self, from: usize, envelopes: Vec<Envelope>) {
        if self.isolated[from] {
            return;
        }
        for envelope in envelopes {
            match envelope.to {
                Target::Replica(to) => self.deliver(to as usize, envelope.message),
                Target::AllReplicas => {
                    for to in 0..self.members() {
                        if to != from {
                            self.deliver(to, envelope.message.clone());
                        }
                    }
                }
                Target::AllActive => {
                    for to in 0..usize::from(self.replica_count) {
                        if to != from {
                            self.deliver(to, envelope.message.clone());
                        }
                    }
                }
                Target::Client(id) => {
                    if let Some(client) = self.clients.iter_mut().find(|c| c.id == id) {
                        client.inbox.push(envelope.message);
                    }
                }
            }
        }
    }

    fn deliver(&mut self, to: usize, message: Message) {
        if to >= self.members() || self.isolated[to] || self.replicas[to].is_none() {
            return;
        }
        self.inboxes[to].push(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_three_replica_cluster_commits() {
        let mut cluster = Cluster::new(3, 0).expect("cluster");
        let client = cluster.add_client();
        cluster.submit_adds(client, 5);
        assert!(cluster.run_until(2000, |c| c.converged_at(5)));
        assert_eq!(cluster.client(client).replies.len(), 5);
    }

    #[test]
    fn test_single_replica_cluster_commits() {
        let mut cluster = Cluster::new(1, 0).expect("cluster");
        let client = cluster.add_client();
        cluster.submit_adds(client, 3);
        assert!(cluster.run_until(2000, |c| c.converged_at(3)));
    }

    #[test]
    fn test_replies_are_in_request_order() {
        let mut cluster = Cluster::new(3, 0).expect("cluster");
        let client = cluster.add_client();
        cluster.submit_adds(client, 4);
        assert!(cluster.run_until(2000, |c| c.client_done(client)));
        let requests: Vec<u32> = cluster.client(client).replies.iter().map(|(r, _)| *r).collect();
        assert_eq!(requests, vec![1, 2, 3, 4]);
    }
}
