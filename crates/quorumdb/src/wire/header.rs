// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 quorumdb contributors

//! Message header: the fixed 128-byte envelope on every message, WAL entry,
//! and client reply.
//!
//! Two independent checksums: `checksum` covers the header itself (bytes 16
//! onward), `checksum_body` covers the body. A torn write that zeroes a
//! prepare's tail corrupts the body without invalidating the header, which
//! is exactly the signal used to classify a slot as torn rather than faulty.
//!
//! Several fields are context-dependent (noted per command below); the wire
//! layout never changes.

use crate::checksum::checksum;
use crate::config::{HEADER_SIZE, MESSAGE_SIZE_MAX};

/// Wire command tag.
///
/// Field reuse per command:
/// - `do_view_change`: `timestamp` carries the sender's log_view; the body
///   is the journal suffix headers, blanks included.
/// - `start_view` / `headers`: body is a run of encoded headers.
/// - `prepare_ok`: `parent` carries the checksum of the acked prepare.
/// - `request_prepare`: `op` is the wanted op, `parent` its known checksum
///   (zero when unknown).
/// - `request_block` / `block`: `op` is the grid address, `parent` the
///   expected content checksum; a block's `checksum_body` IS its block id.
/// - `pong`: `op` carries op_checkpoint, `parent` the checkpoint id.
/// - `request_sync_checkpoint` / `sync_checkpoint`: same two fields name
///   the requested/shipped checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    Ping = 1,
    Pong = 2,
    Request = 3,
    Prepare = 4,
    PrepareOk = 5,
    Reply = 6,
    Commit = 7,
    StartViewChange = 8,
    DoViewChange = 9,
    StartView = 10,
    RequestStartView = 11,
    RequestPrepare = 12,
    RequestHeaders = 13,
    Headers = 14,
    RequestReply = 15,
    RequestBlock = 16,
    Block = 17,
    RequestSyncCheckpoint = 18,
    SyncCheckpoint = 19,
}

impl Command {
    /// Decode a wire tag. Unknown tags make the whole message invalid.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => Command::Ping,
            2 => Command::Pong,
            3 => Command::Request,
            4 => Command::Prepare,
            5 => Command::PrepareOk,
            6 => Command::Reply,
            7 => Command::Commit,
            8 => Command::StartViewChange,
            9 => Command::DoViewChange,
            10 => Command::StartView,
            11 => Command::RequestStartView,
            12 => Command::RequestPrepare,
            13 => Command::RequestHeaders,
            14 => Command::Headers,
            15 => Command::RequestReply,
            16 => Command::RequestBlock,
            17 => Command::Block,
            18 => Command::RequestSyncCheckpoint,
            19 => Command::SyncCheckpoint,
            _ => return None,
        })
    }
}

/// Operation tag inside a prepare.
///
/// Values below [`Operation::USER_MIN`] are reserved for the protocol;
/// everything at or above it belongs to the application state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Operation {
    /// Placeholder in do_view_change suffixes for an op the sender does not
    /// have. Never written to a WAL. A blank header is a nack.
    Blank = 0,
    /// No-op injected by the primary to pad a bar up to a checkpoint.
    Pulse = 1,
    /// Cluster release upgrade; body is the target release (u16 LE).
    Upgrade = 2,
}

impl Operation {
    /// First operation value owned by the application state machine.
    pub const USER_MIN: u8 = 16;
}

/// The fixed-size header. Field order mirrors the wire layout; encoding is
/// explicit little-endian, no implicit padding travels to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct Header {
    /// Checksum of header bytes 16..128. Set last.
    pub checksum: u128,
    /// Checksum of the message body (zero-length body included).
    pub checksum_body: u128,
    /// Checksum of the prepare at op-1 (hash chain), or context field.
    pub parent: u128,
    /// Client session id (zero for replica-to-replica traffic).
    pub client: u128,
    /// Cluster id; messages from other clusters are dropped.
    pub cluster: u64,
    /// Op number, or context field (grid address, checkpoint op).
    pub op: u64,
    /// Sender's commit_max at send time.
    pub commit: u64,
    /// Prepare timestamp, or log_view in do_view_change.
    pub timestamp: u64,
    /// Sender's view.
    pub view: u32,
    /// Client request number.
    pub request: u32,
    /// Total message size, header included.
    pub size: u32,
    /// Release that produced this message.
    pub release: u16,
    /// Wire command tag.
    pub command: Command,
    /// Operation tag (meaningful for prepares and requests).
    pub operation: u8,
    /// Sender replica index (0xFF for clients).
    pub replica: u8,
}

/// Replica index value used by clients.
pub const REPLICA_CLIENT: u8 = 0xFF;

const RESERVED_LEN: usize = 15;

impl Header {
    /// Build a header with checksums unset. Callers fill context fields and
    /// then call [`Header::set_checksum_body`] / [`Header::set_checksum`].
    #[must_use]
    pub fn new(cluster: u64, command: Command) -> Self {
        Self {
            checksum: 0,
            checksum_body: 0,
            parent: 0,
            client: 0,
            cluster,
            op: 0,
            commit: 0,
            timestamp: 0,
            view: 0,
            request: 0,
            size: HEADER_SIZE as u32,
            release: crate::config::RELEASE,
            command,
            operation: 0,
            replica: 0,
        }
    }

    /// The parent checksum of op 1: a chain root derived from the cluster
    /// id, so logs from different clusters can never splice.
    #[must_use]
    pub fn root_parent(cluster: u64) -> u128 {
        checksum(&cluster.to_le_bytes())
    }

    /// Encode to the 128-byte wire form.
    #[must_use]
    pub fn encode_le(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..16].copy_from_slice(&self.checksum.to_le_bytes());
        buf[16..32].copy_from_slice(&self.checksum_body.to_le_bytes());
        buf[32..48].copy_from_slice(&self.parent.to_le_bytes());
        buf[48..64].copy_from_slice(&self.client.to_le_bytes());
        buf[64..72].copy_from_slice(&self.cluster.to_le_bytes());
        buf[72..80].copy_from_slice(&self.op.to_le_bytes());
        buf[80..88].copy_from_slice(&self.commit.to_le_bytes());
        buf[88..96].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[96..100].copy_from_slice(&self.view.to_le_bytes());
        buf[100..104].copy_from_slice(&self.request.to_le_bytes());
        buf[104..108].copy_from_slice(&self.size.to_le_bytes());
        buf[108..110].copy_from_slice(&self.release.to_le_bytes());
        buf[110] = self.command as u8;
        buf[111] = self.operation;
        buf[112] = self.replica;
        // buf[113..128] reserved, must be zero.
        buf
    }

    /// Decode from the 128-byte wire form. Verifies structure only; checksum
    /// validity is a separate question ([`Header::valid_checksum`]).
    pub fn decode_le(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }

        let command = Command::from_u8(buf[110])?;
        let size = u32::from_le_bytes(buf[104..108].try_into().ok()?);
        if (size as usize) < HEADER_SIZE || (size as usize) > MESSAGE_SIZE_MAX {
            return None;
        }
        if buf[113..HEADER_SIZE].iter().any(|&b| b != 0) {
            return None;
        }

        Some(Self {
            checksum: u128::from_le_bytes(buf[0..16].try_into().ok()?),
            checksum_body: u128::from_le_bytes(buf[16..32].try_into().ok()?),
            parent: u128::from_le_bytes(buf[32..48].try_into().ok()?),
            client: u128::from_le_bytes(buf[48..64].try_into().ok()?),
            cluster: u64::from_le_bytes(buf[64..72].try_into().ok()?),
            op: u64::from_le_bytes(buf[72..80].try_into().ok()?),
            commit: u64::from_le_bytes(buf[80..88].try_into().ok()?),
            timestamp: u64::from_le_bytes(buf[88..96].try_into().ok()?),
            view: u32::from_le_bytes(buf[96..100].try_into().ok()?),
            request: u32::from_le_bytes(buf[100..104].try_into().ok()?),
            size,
            release: u16::from_le_bytes(buf[108..110].try_into().ok()?),
            command,
            operation: buf[111],
            replica: buf[112],
        })
    }

    /// Checksum of the header's covered region (everything after the
    /// checksum field itself).
    #[must_use]
    pub fn calculate_checksum(&self) -> u128 {
        let encoded = self.encode_le();
        checksum(&encoded[16..HEADER_SIZE])
    }

    /// Finalize the header checksum. Must be called after every other field
    /// (checksum_body included) is set.
    pub fn set_checksum(&mut self) {
        self.checksum = self.calculate_checksum();
    }

    /// Set the body checksum and size for the given body.
    pub fn set_checksum_body(&mut self, body: &[u8]) {
        debug_assert!(HEADER_SIZE + body.len() <= MESSAGE_SIZE_MAX);
        self.checksum_body = checksum(body);
        self.size = (HEADER_SIZE + body.len()) as u32;
    }

    /// True when the header checksum matches the covered bytes.
    #[must_use]
    pub fn valid_checksum(&self) -> bool {
        self.checksum == self.calculate_checksum()
    }

    /// True when `body` matches the body checksum and the declared size.
    #[must_use]
    pub fn valid_checksum_body(&self, body: &[u8]) -> bool {
        self.size as usize == HEADER_SIZE + body.len() && self.checksum_body == checksum(body)
    }

    /// Body length declared by this header.
    #[must_use]
    pub fn body_len(&self) -> usize {
        self.size as usize - HEADER_SIZE
    }

    /// A blank suffix header: a placeholder (and therefore a nack) for an op
    /// the sender has no header for.
    #[must_use]
    pub fn blank(cluster: u64, view: u32, op: u64) -> Self {
        let mut header = Header::new(cluster, Command::Prepare);
        header.operation = Operation::Blank as u8;
        header.view = view;
        header.op = op;
        header.set_checksum_body(&[]);
        header.set_checksum();
        header
    }

    /// True for blank placeholder headers.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.operation == Operation::Blank as u8 && self.command == Command::Prepare
    }

    const _ASSERT: () = {
        // 16*4 + 8*4 + 4*3 + 2 + 1*3 + reserved
        assert!(16 + 16 + 16 + 16 + 8 + 8 + 8 + 8 + 4 + 4 + 4 + 2 + 1 + 1 + 1 + RESERVED_LEN == HEADER_SIZE);
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Header {
        let mut header = Header::new(7, Command::Prepare);
        header.op = 42;
        header.commit = 40;
        header.view = 3;
        header.parent = 0xDEAD_BEEF;
        header.timestamp = 123_456;
        header.replica = 1;
        header.operation = Operation::USER_MIN;
        header.set_checksum_body(b"payload");
        header.set_checksum();
        header
    }

    #[test]
    fn test_roundtrip() {
        let header = sample();
        let encoded = header.encode_le();
        let decoded = Header::decode_le(&encoded).expect("decodes");
        assert_eq!(header, decoded);
        assert!(decoded.valid_checksum());
        assert!(decoded.valid_checksum_body(b"payload"));
    }

    #[test]
    fn test_header_checksum_covers_body_checksum() {
        let mut header = sample();
        header.checksum_body ^= 1;
        assert!(!header.valid_checksum());
    }

    #[test]
    fn test_corrupt_byte_detected() {
        let header = sample();
        let mut encoded = header.encode_le();
        encoded[72] ^= 0x40; // op field
        let decoded = Header::decode_le(&encoded).expect("still structurally valid");
        assert!(!decoded.valid_checksum());
    }

    #[test]
    fn test_reserved_bytes_reject() {
        let header = sample();
        let mut encoded = header.encode_le();
        encoded[120] = 1;
        assert!(Header::decode_le(&encoded).is_none());
    }

    #[test]
    fn test_unknown_command_rejects() {
        let header = sample();
        let mut encoded = header.encode_le();
        encoded[110] = 200;
        assert!(Header::decode_le(&encoded).is_none());
    }

    #[test]
    fn test_size_bounds_reject() {
        let header = sample();
        let mut encoded = header.encode_le();
        encoded[104..108].copy_from_slice(&(MESSAGE_SIZE_MAX as u32 + 1).to_le_bytes());
        assert!(Header::decode_le(&encoded).is_none());
    }

    #[test]
    fn test_blank_is_valid_and_marked() {
        let blank = Header::blank(7, 2, 9);
        assert!(blank.is_blank());
        assert!(blank.valid_checksum());
        assert!(blank.valid_checksum_body(&[]));
    }

    #[test]
    fn test_root_parent_depends_on_cluster() {
        assert_ne!(Header::root_parent(1), Header::root_parent(2));
    }
}
