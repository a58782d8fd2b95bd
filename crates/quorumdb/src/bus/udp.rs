// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 quorumdb contributors

//! UDP message bus.
//!
//! One datagram per message. A mio poll thread owns the receive socket,
//! validates datagrams at the edge (checksum, cluster, command), and hands
//! whole messages to the replica thread over a crossbeam channel. Sends go
//! out a separate socket so the two threads never share one. Client return
//! addresses are learned from request datagrams and kept in a concurrent
//! map; the replica address table is swapped atomically so an operator
//! reload never tears it.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use arc_swap::ArcSwap;
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use dashmap::DashMap;
use mio::{Events, Interest, Poll, Token};
use socket2::{Domain, Protocol, Socket, Type};

use crate::bus::{Envelope, Target};
use crate::error::{Error, Result};
use crate::replica::Replica;
use crate::state_machine::StateMachine;
use crate::wire::{Command, InvalidMessage, Message, MessagePool};

const RECV_TOKEN: Token = Token(0);
/// Receive buffers preallocated for the poll thread.
const POOL_BUFFERS: usize = 64;
/// Channel depth between the poll thread and the replica loop.
const CHANNEL_DEPTH: usize = 256;

/// Listen addresses for every cluster member, indexed by replica.
#[derive(Debug, Clone)]
pub struct ReplicaAddresses {
    pub addresses: Vec<SocketAddr>,
}

impl ReplicaAddresses {
    /// Parse a comma-separated `host:port` list.
    pub fn parse(spec: &str) -> Result<Self> {
        let mut addresses = Vec::new();
        for part in spec.split(',') {
            let address = part
                .trim()
                .parse()
                .map_err(|_| Error::BindFailed(format!("bad address '{}'", part)))?;
            addresses.push(address);
        }
        Ok(Self { addresses })
    }
}

/// UDP bus bound to one replica's listen address.
pub struct UdpBus {
    replica: u8,
    addresses: ArcSwap<Vec<SocketAddr>>,
    clients: Arc<DashMap<u128, SocketAddr>>,
    send_socket: UdpSocket,
    rx: Receiver<Message>,
    shutdown: Arc<AtomicBool>,
    poll_thread: Option<JoinHandle<()>>,
}

impl UdpBus {
    /// Bind the replica's listen address and start the poll thread.
    pub fn bind(cluster: u64, replica: u8, addresses: ReplicaAddresses) -> Result<Self> {
        let listen = *addresses
            .addresses
            .get(replica as usize)
            .ok_or_else(|| Error::BindFailed(format!("no address for replica {}", replica)))?;

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| Error::BindFailed(e.to_string()))?;
        socket
            .set_reuse_address(true)
            .map_err(|e| Error::BindFailed(e.to_string()))?;
        socket
            .bind(&listen.into())
            .map_err(|e| Error::BindFailed(format!("{}: {}", listen, e)))?;
        let std_socket: UdpSocket = socket.into();
        std_socket
            .set_nonblocking(true)
            .map_err(|e| Error::BindFailed(e.to_string()))?;

        let send_socket = UdpSocket::bind("0.0.0.0:0")
            .map_err(|e| Error::BindFailed(e.to_string()))?;

        let (tx, rx) = bounded(CHANNEL_DEPTH);
        let clients = Arc::new(DashMap::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let poll_thread = Some(spawn_poll_thread(
            cluster,
            std_socket,
            tx,
            Arc::clone(&clients),
            Arc::clone(&shutdown),
        )?);

        log::info!("[bus] replica={} listening on {}", replica, listen);
        Ok(Self {
            replica,
            addresses: ArcSwap::from_pointee(addresses.addresses),
            clients,
            send_socket,
            rx,
            shutdown,
            poll_thread,
        })
    }

    /// Next validated message, or `None` after `timeout` (the tick signal).
    #[must_use]
    pub fn poll_message(&self, timeout: Duration) -> Option<Message> {
        match self.rx.recv_timeout(timeout) {
            Ok(message) => Some(message),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Route one batch of replica output.
    pub fn dispatch(&self, envelopes: Vec<Envelope>) -> Result<()> {
        let addresses = self.addresses.load();
        for envelope in envelopes {
            let wire = envelope.message.encode();
            match envelope.to {
                Target::Replica(to) => {
                    if let Some(address) = addresses.get(to as usize) {
                        self.send_to(&wire, *address)?;
                    }
                }
                Target::AllReplicas => {
                    for (index, address) in addresses.iter().enumerate() {
                        if index != self.replica as usize {
                            self.send_to(&wire, *address)?;
                        }
                    }
                }
                Target::AllActive => {
                    // Standby addresses trail the active ones; the replica
                    // sizes its own quorums, the bus just fans out.
                    for (index, address) in addresses.iter().enumerate() {
                        if index != self.replica as usize {
                            self.send_to(&wire, *address)?;
                        }
                    }
                }
                Target::Client(client) => {
                    if let Some(address) = self.clients.get(&client) {
                        self.send_to(&wire, *address)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn send_to(&self, wire: &[u8], address: SocketAddr) -> Result<()> {
        match self.send_socket.send_to(wire, address) {
            Ok(_) => Ok(()),
            // Transient send failures are the network dropping a message,
            // which the protocol already tolerates.
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => {
                log::warn!("[bus] send to {} failed: {}", address, err);
                Ok(())
            }
        }
    }

    /// Drive a replica until it reports a fatal condition.
    pub fn run<S: StateMachine>(&self, replica: &mut Replica<S>, tick: Duration) -> Error {
        loop {
            if let Some(message) = self.poll_message(tick) {
                replica.on_message(&message);
            } else {
                replica.tick();
            }
            let envelopes = replica.drain_outbox();
            if let Err(err) = self.dispatch(envelopes) {
                return err;
            }
            if let Some(err) = replica.take_fatal() {
                return err;
            }
        }
    }
}

impl Drop for UdpBus {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.poll_thread.take() {
            let _ = handle.join();
        }
    }
}

fn spawn_poll_thread(
    cluster: u64,
    socket: UdpSocket,
    tx: Sender<Message>,
    clients: Arc<DashMap<u128, SocketAddr>>,
    shutdown: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    let mut mio_socket = mio::net::UdpSocket::from_std(socket);
    let mut poll = Poll::new()?;
    poll.registry()
        .register(&mut mio_socket, RECV_TOKEN, Interest::READABLE)?;

    let handle = std::thread::Builder::new()
        .name("quorumdb-bus".into())
        .spawn(move || {
            let mut events = Events::with_capacity(64);
            let mut pool = MessagePool::new(POOL_BUFFERS);
            while !shutdown.load(Ordering::Acquire) {
                if poll.poll(&mut events, Some(Duration::from_millis(50))).is_err() {
                    continue;
                }
                for event in events.iter() {
                    if event.token() != RECV_TOKEN {
                        continue;
                    }
                    loop {
                        let Some(mut buf) = pool.acquire() else { break };
                        match mio_socket.recv_from(&mut buf) {
                            Ok((len, source)) => {
                                match Message::decode(cluster, &buf[..len]) {
                                    Ok(message) => {
                                        if message.header.command == Command::Request {
                                            clients.insert(message.header.client, source);
                                        }
                                        if tx.try_send(message).is_err() {
                                            log::warn!("[bus] replica busy, dropping datagram");
                                        }
                                    }
                                    Err(InvalidMessage::WrongCluster) => {
                                        log::debug!("[bus] foreign cluster datagram from {}", source);
                                    }
                                    Err(reason) => {
                                        log::debug!("[bus] invalid datagram from {}: {:?}", source, reason);
                                    }
                                }
                                pool.release(buf);
                            }
                            Err(err) => {
                                pool.release(buf);
                                if err.kind() != std::io::ErrorKind::WouldBlock {
                                    log::warn!("[bus] recv error: {}", err);
                                }
                                break;
                            }
                        }
                    }
                }
            }
        })
        .map_err(|e| Error::BindFailed(e.to_string()))?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_addresses() {
        let parsed = ReplicaAddresses::parse("127.0.0.1:4000, 127.0.0.1:4001,127.0.0.1:4002")
            .expect("parses");
        assert_eq!(parsed.addresses.len(), 3);
        assert_eq!(parsed.addresses[1].port(), 4001);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ReplicaAddresses::parse("not-an-address").is_err());
    }

    #[test]
    fn test_bind_and_shutdown() {
        let addresses = ReplicaAddresses::parse("127.0.0.1:0").expect("parse");
        let bus = UdpBus::bind(1, 0, addresses).expect("bind");
        assert!(bus.poll_message(Duration::from_millis(10)).is_none());
        drop(bus); // joins the poll thread
    }
}
