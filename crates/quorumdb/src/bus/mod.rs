// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 quorumdb contributors

//! Message bus: how replica output reaches the world.
//!
//! The replica is a pure event machine; it never touches a socket. Every
//! message it wants delivered goes into its [`Outbox`] with a [`Target`],
//! and whoever drives the replica (the UDP bus in production, the cluster
//! harness in tests) drains the outbox and routes the envelopes. Broadcast
//! targets are expanded by the router so the replica stays ignorant of
//! addressing.

pub mod udp;

pub use udp::{ReplicaAddresses, UdpBus};

use crate::wire::Message;

/// Routing target for an outgoing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// One cluster member by index (active replica or standby).
    Replica(u8),
    /// Every cluster member except the sender, standbys included.
    AllReplicas,
    /// Every active replica except the sender (quorum traffic).
    AllActive,
    /// A client session.
    Client(u128),
}

/// An addressed outgoing message.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub to: Target,
    pub message: Message,
}

/// Accumulates replica output within one event-loop turn.
#[derive(Debug, Default)]
pub struct Outbox {
    queue: Vec<Envelope>,
}

impl Outbox {
    #[must_use]
    pub fn new() -> Self {
        Self { queue: Vec::new() }
    }

    pub fn send(&mut self, to: Target, message: Message) {
        self.queue.push(Envelope { to, message });
    }

    /// Take everything queued so far.
    #[must_use]
    pub fn drain(&mut self) -> Vec<Envelope> {
        std::mem::take(&mut self.queue)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{Command, Header};

    #[test]
    fn test_outbox_drains_in_order() {
        let mut outbox = Outbox::new();
        let ping = Message::new(Header::new(1, Command::Ping), Vec::new());
        let pong = Message::new(Header::new(1, Command::Pong), Vec::new());
        outbox.send(Target::AllActive, ping);
        outbox.send(Target::Replica(2), pong);

        let drained = outbox.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].to, Target::AllActive);
        assert_eq!(drained[1].to, Target::Replica(2));
        assert!(outbox.is_empty());
    }
}
