// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 quorumdb contributors

//! Message envelope: a validated header plus its body.

use crate::config::{HEADER_SIZE, MESSAGE_SIZE_MAX};
use crate::wire::header::{Command, Header};

/// A complete message. Construction through [`Message::new`] or
/// [`Message::decode`] guarantees the size/checksum relationship between
/// header and body; the header checksum itself is finalized by `new` and
/// verified by `decode`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    body: Vec<u8>,
}

/// Why an incoming datagram was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidMessage {
    TooShort,
    HeaderStructure,
    HeaderChecksum,
    BodyChecksum,
    WrongCluster,
}

impl Message {
    /// Seal a message: sets body checksum, size, and header checksum.
    #[must_use]
    pub fn new(mut header: Header, body: Vec<u8>) -> Self {
        assert!(HEADER_SIZE + body.len() <= MESSAGE_SIZE_MAX);
        header.set_checksum_body(&body);
        header.set_checksum();
        Self { header, body }
    }

    /// Wrap a header and body that already carry valid checksums (a prepare
    /// read back from the WAL, a stored reply). Asserts the invariant it
    /// relies on.
    #[must_use]
    pub fn from_parts(header: Header, body: Vec<u8>) -> Self {
        assert!(header.valid_checksum());
        assert!(header.valid_checksum_body(&body));
        Self { header, body }
    }

    /// Validate and decode a wire datagram for the given cluster.
    pub fn decode(cluster: u64, datagram: &[u8]) -> Result<Self, InvalidMessage> {
        if datagram.len() < HEADER_SIZE {
            return Err(InvalidMessage::TooShort);
        }
        let header =
            Header::decode_le(&datagram[..HEADER_SIZE]).ok_or(InvalidMessage::HeaderStructure)?;
        if !header.valid_checksum() {
            return Err(InvalidMessage::HeaderChecksum);
        }
        if header.cluster != cluster {
            return Err(InvalidMessage::WrongCluster);
        }
        if datagram.len() < header.size as usize {
            return Err(InvalidMessage::TooShort);
        }
        let body = &datagram[HEADER_SIZE..header.size as usize];
        if !header.valid_checksum_body(body) {
            return Err(InvalidMessage::BodyChecksum);
        }
        Ok(Self { header, body: body.to_vec() })
    }

    /// Encode to wire bytes (header immediately followed by body).
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.header.size as usize);
        buf.extend_from_slice(&self.header.encode_le());
        buf.extend_from_slice(&self.body);
        buf
    }

    /// Message body.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Command shorthand.
    #[must_use]
    pub fn command(&self) -> Command {
        self.header.command
    }
}

/// Encode a run of headers into a body (do_view_change, start_view,
/// headers commands).
#[must_use]
pub fn encode_headers(headers: &[Header]) -> Vec<u8> {
    let mut body = Vec::with_capacity(headers.len() * HEADER_SIZE);
    for header in headers {
        body.extend_from_slice(&header.encode_le());
    }
    body
}

/// Decode a run of headers from a body. Every entry must decode and carry a
/// valid checksum; a suffix that fails wholesale-invalidates the message.
#[must_use]
pub fn decode_headers(body: &[u8]) -> Option<Vec<Header>> {
    if body.len() % HEADER_SIZE != 0 {
        return None;
    }
    let mut headers = Vec::with_capacity(body.len() / HEADER_SIZE);
    for chunk in body.chunks_exact(HEADER_SIZE) {
        let header = Header::decode_le(chunk)?;
        if !header.valid_checksum() {
            return None;
        }
        headers.push(header);
    }
    Some(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::header::Operation;

    fn prepare(op: u64) -> Message {
        let mut header = Header::new(9, Command::Prepare);
        header.op = op;
        header.operation = Operation::USER_MIN;
        Message::new(header, vec![1, 2, 3])
    }

    #[test]
    fn test_decode_accepts_own_encoding() {
        let msg = prepare(5);
        let decoded = Message::decode(9, &msg.encode()).expect("valid");
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_decode_rejects_wrong_cluster() {
        let msg = prepare(5);
        assert_eq!(Message::decode(10, &msg.encode()), Err(InvalidMessage::WrongCluster));
    }

    #[test]
    fn test_decode_rejects_flipped_body_bit() {
        let msg = prepare(5);
        let mut wire = msg.encode();
        let last = wire.len() - 1;
        wire[last] ^= 0x01;
        assert_eq!(Message::decode(9, &wire), Err(InvalidMessage::BodyChecksum));
    }

    #[test]
    fn test_decode_rejects_truncation() {
        let msg = prepare(5);
        let wire = msg.encode();
        assert_eq!(Message::decode(9, &wire[..wire.len() - 1]), Err(InvalidMessage::TooShort));
    }

    #[test]
    fn test_headers_roundtrip() {
        let headers: Vec<Header> = (1..=3).map(|op| prepare(op).header).collect();
        let body = encode_headers(&headers);
        let decoded = decode_headers(&body).expect("valid run");
        assert_eq!(decoded, headers);
    }

    #[test]
    fn test_headers_reject_corruption() {
        let headers: Vec<Header> = (1..=3).map(|op| prepare(op).header).collect();
        let mut body = encode_headers(&headers);
        body[130] ^= 0xFF;
        assert!(decode_headers(&body).is_none());
    }
}
