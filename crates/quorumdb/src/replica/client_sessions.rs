// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 quorumdb contributors

//! Client sessions and the persisted reply cache.
//!
//! One slot per session, `CLIENTS_MAX` slots. Each slot stores the latest
//! reply message for its client in the client-replies zone, so a duplicate
//! request (same request number) is answered from cache without
//! re-execution - that is the at-most-once guarantee. Slot assignment is
//! stable for the life of a session; when all slots are taken the session
//! that committed least recently is evicted.

use crate::config::{CLIENTS_MAX, HEADER_SIZE, MESSAGE_SIZE_MAX};
use crate::error::Result;
use crate::storage::{Storage, Zone};
use crate::superblock::SessionSnapshot;
use crate::wire::{Command, Header, Message};

#[derive(Debug, Clone)]
struct Session {
    client: u128,
    request: u32,
    reply: Option<Message>,
    /// Commit number of the last reply, drives eviction order.
    last_op: u64,
    /// Reply lost to disk corruption; re-request it from a peer.
    needs_repair: bool,
    /// Expected reply checksum while repairing.
    repair_checksum: u128,
}

/// The session table.
pub struct ClientSessions {
    slots: Vec<Option<Session>>,
}

/// Outcome of admitting a request at the primary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Fresh request number: execute it.
    Execute,
    /// Same request number: replay this cached reply.
    Replay(Box<Message>),
    /// Stale or unanswerable (reply evicted, repair pending): drop.
    Drop,
}

impl ClientSessions {
    #[must_use]
    pub fn new() -> Self {
        Self { slots: vec![None; CLIENTS_MAX] }
    }

    /// Restore from the superblock snapshot, verifying each persisted reply
    /// against its recorded checksum. A corrupt slot keeps its session but
    /// flags the reply for repair from a peer.
    pub fn restore(
        superblock_sessions: &[SessionSnapshot; CLIENTS_MAX],
        storage: &mut dyn Storage,
    ) -> Result<Self> {
        let mut sessions = Self::new();
        for (slot, snapshot) in superblock_sessions.iter().enumerate() {
            if snapshot.client == 0 {
                continue;
            }
            let mut session = Session {
                client: snapshot.client,
                request: snapshot.request,
                reply: None,
                last_op: 0,
                needs_repair: false,
                repair_checksum: snapshot.reply_checksum,
            };
            match Self::read_reply_slot(storage, slot)? {
                Some(reply)
                    if reply.header.checksum == snapshot.reply_checksum
                        && reply.header.client == snapshot.client =>
                {
                    session.last_op = reply.header.op;
                    session.reply = Some(reply);
                }
                _ => {
                    log::warn!(
                        "[sessions] reply for client {:#x} corrupt, repair queued",
                        snapshot.client
                    );
                    session.needs_repair = true;
                }
            }
            sessions.slots[slot] = Some(session);
        }
        Ok(sessions)
    }

    /// Classify an incoming request against the session table.
    #[must_use]
    pub fn admit(&self, client: u128, request: u32) -> Admission {
        match self.find(client) {
            None => Admission::Execute,
            Some(session) => {
                if request > session.request {
                    Admission::Execute
                } else if request == session.request {
                    match &session.reply {
                        Some(reply) => Admission::Replay(Box::new(reply.clone())),
                        None => Admission::Drop,
                    }
                } else {
                    Admission::Drop
                }
            }
        }
    }

    /// Record a committed reply, persisting it to the reply zone. Creates
    /// the session on first use, evicting the least recently committed
    /// session if the table is full.
    pub fn update(&mut self, storage: &mut dyn Storage, reply: &Message) -> Result<()> {
        assert_eq!(reply.header.command, Command::Reply);
        let client = reply.header.client;
        assert!(client != 0);

        let slot = match self.find_slot(client) {
            Some(slot) => slot,
            None => self.allocate_slot(client),
        };
        Self::write_reply_slot(storage, slot, reply)?;
        self.slots[slot] = Some(Session {
            client,
            request: reply.header.request,
            reply: Some(reply.clone()),
            last_op: reply.header.op,
            needs_repair: false,
            repair_checksum: reply.header.checksum,
        });
        Ok(())
    }

    /// Cached reply for a client, if any.
    #[must_use]
    pub fn cached_reply(&self, client: u128) -> Option<&Message> {
        self.find(client).and_then(|s| s.reply.as_ref())
    }

    /// Clients whose replies await repair, with expected checksums.
    #[must_use]
    pub fn repair_targets(&self) -> Vec<(u128, u128)> {
        self.slots
            .iter()
            .flatten()
            .filter(|s| s.needs_repair)
            .map(|s| (s.client, s.repair_checksum))
            .collect()
    }

    /// Install a reply obtained from a peer, if it is the one we lost.
    pub fn repair(&mut self, storage: &mut dyn Storage, reply: &Message) -> Result<bool> {
        let client = reply.header.client;
        let Some(slot) = self.find_slot(client) else { return Ok(false) };
        let session = self.slots[slot].as_mut().expect("slot occupied");
        if !session.needs_repair || reply.header.checksum != session.repair_checksum {
            return Ok(false);
        }
        Self::write_reply_slot(storage, slot, reply)?;
        session.reply = Some(reply.clone());
        session.last_op = reply.header.op;
        session.needs_repair = false;
        log::debug!("[sessions] reply repaired for client {:#x}", client);
        Ok(true)
    }

    /// Snapshot for superblock persistence.
    #[must_use]
    pub fn snapshot(&self) -> [SessionSnapshot; CLIENTS_MAX] {
        let mut snapshots = [SessionSnapshot::default(); CLIENTS_MAX];
        for (slot, session) in self.slots.iter().enumerate() {
            if let Some(session) = session {
                snapshots[slot] = SessionSnapshot {
                    client: session.client,
                    request: session.request,
                    reply_checksum: session.repair_checksum,
                };
            }
        }
        snapshots
    }

    fn find(&self, client: u128) -> Option<&Session> {
        self.slots.iter().flatten().find(|s| s.client == client)
    }

    fn find_slot(&self, client: u128) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|s| s.client == client))
    }

    fn allocate_slot(&mut self, client: u128) -> usize {
        if let Some(free) = self.slots.iter().position(Option::is_none) {
            return free;
        }
        // Evict the session that committed least recently.
        let victim = self
            .slots
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| s.as_ref().map_or(0, |s| s.last_op))
            .map(|(i, _)| i)
            .expect("table is non-empty");
        log::debug!(
            "[sessions] evicting client {:#x} for client {:#x}",
            self.slots[victim].as_ref().map_or(0, |s| s.client),
            client
        );
        self.slots[victim] = None;
        victim
    }

    fn read_reply_slot(storage: &mut dyn Storage, slot: usize) -> Result<Option<Message>> {
        let mut buf = vec![0u8; MESSAGE_SIZE_MAX];
        if storage.read(Zone::ClientReplies, (slot * MESSAGE_SIZE_MAX) as u64, &mut buf).is_err() {
            return Ok(None);
        }
        let Some(header) = Header::decode_le(&buf[..HEADER_SIZE]) else {
            return Ok(None);
        };
        if !header.valid_checksum() || header.command != Command::Reply {
            return Ok(None);
        }
        let body = &buf[HEADER_SIZE..header.size as usize];
        if !header.valid_checksum_body(body) {
            return Ok(None);
        }
        Ok(Some(Message::from_parts(header, body.to_vec())))
    }

    fn write_reply_slot(storage: &mut dyn Storage, slot: usize, reply: &Message) -> Result<()> {
        let mut buf = vec![0u8; MESSAGE_SIZE_MAX];
        let wire = reply.encode();
        buf[..wire.len()].copy_from_slice(&wire);
        storage.write(Zone::ClientReplies, (slot * MESSAGE_SIZE_MAX) as u64, &buf)?;
        storage.flush()?;
        Ok(())
    }
}

impl Default for ClientSessions {
    fn default() -> Self {
        Self::new()
    }
}
