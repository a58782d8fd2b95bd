// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 quorumdb contributors

//! State-sync checkpoint transfer format.
//!
//! The `sync_checkpoint` body is a deflate-compressed serialization of
//! everything a lagging replica needs to install the checkpoint: the vsr
//! essentials, the free set and grid index (block payloads heal lazily
//! through the grid repair path), the session table, and the state-machine
//! image. Compression matters because the grid index is mostly zeros and
//! the body must fit one message.

use std::io::{Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

use crate::config::{CHECKPOINT_BLOCKS_MAX, CLIENTS_MAX, GRID_BLOCKS_MAX, MESSAGE_BODY_SIZE_MAX};
use crate::superblock::{SessionSnapshot, FREE_SET_WORDS};

/// Everything shipped by `sync_checkpoint`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointPackage {
    pub op_checkpoint: u64,
    pub checkpoint_id: u128,
    pub release: u16,
    pub commit_min: u64,
    pub free_set_words: [u64; FREE_SET_WORDS],
    pub grid_index: Vec<u128>,
    pub checkpoint_blocks: [u64; CHECKPOINT_BLOCKS_MAX],
    pub checkpoint_size: u32,
    pub sessions: [SessionSnapshot; CLIENTS_MAX],
    pub image: Vec<u8>,
}

impl CheckpointPackage {
    /// Serialize and compress into a message body.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        assert_eq!(self.grid_index.len(), GRID_BLOCKS_MAX as usize);

        let mut raw = Vec::with_capacity(4096);
        raw.extend_from_slice(&self.op_checkpoint.to_le_bytes());
        raw.extend_from_slice(&self.checkpoint_id.to_le_bytes());
        raw.extend_from_slice(&self.release.to_le_bytes());
        raw.extend_from_slice(&self.commit_min.to_le_bytes());
        for word in &self.free_set_words {
            raw.extend_from_slice(&word.to_le_bytes());
        }
        for entry in &self.grid_index {
            raw.extend_from_slice(&entry.to_le_bytes());
        }
        for address in &self.checkpoint_blocks {
            raw.extend_from_slice(&address.to_le_bytes());
        }
        raw.extend_from_slice(&self.checkpoint_size.to_le_bytes());
        for session in &self.sessions {
            raw.extend_from_slice(&session.client.to_le_bytes());
            raw.extend_from_slice(&session.request.to_le_bytes());
            raw.extend_from_slice(&session.reply_checksum.to_le_bytes());
        }
        raw.extend_from_slice(&(self.image.len() as u32).to_le_bytes());
        raw.extend_from_slice(&self.image);

        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&raw).expect("in-memory deflate cannot fail");
        let body = encoder.finish().expect("in-memory deflate cannot fail");
        assert!(body.len() <= MESSAGE_BODY_SIZE_MAX, "checkpoint package too large");
        body
    }

    /// Decompress and parse a message body.
    #[must_use]
    pub fn decode(body: &[u8]) -> Option<Self> {
        let mut raw = Vec::new();
        let mut decoder = DeflateDecoder::new(body);
        decoder.read_to_end(&mut raw).ok()?;
        let mut cursor = Cursor { raw: &raw, offset: 0 };

        let op_checkpoint = u64::from_le_bytes(cursor.take(8)?.try_into().ok()?);
        let checkpoint_id = u128::from_le_bytes(cursor.take(16)?.try_into().ok()?);
        let release = u16::from_le_bytes(cursor.take(2)?.try_into().ok()?);
        let commit_min = u64::from_le_bytes(cursor.take(8)?.try_into().ok()?);

        let mut free_set_words = [0u64; FREE_SET_WORDS];
        for word in &mut free_set_words {
            *word = u64::from_le_bytes(cursor.take(8)?.try_into().ok()?);
        }
        let mut grid_index = Vec::with_capacity(GRID_BLOCKS_MAX as usize);
        for _ in 0..GRID_BLOCKS_MAX {
            grid_index.push(u128::from_le_bytes(cursor.take(16)?.try_into().ok()?));
        }
        let mut checkpoint_blocks = [0u64; CHECKPOINT_BLOCKS_MAX];
        for address in &mut checkpoint_blocks {
            *address = u64::from_le_bytes(cursor.take(8)?.try_into().ok()?);
        }
        let checkpoint_size = u32::from_le_bytes(cursor.take(4)?.try_into().ok()?);
        let mut sessions = [SessionSnapshot::default(); CLIENTS_MAX];
        for session in &mut sessions {
            session.client = u128::from_le_bytes(cursor.take(16)?.try_into().ok()?);
            session.request = u32::from_le_bytes(cursor.take(4)?.try_into().ok()?);
            session.reply_checksum = u128::from_le_bytes(cursor.take(16)?.try_into().ok()?);
        }
        let image_len = u32::from_le_bytes(cursor.take(4)?.try_into().ok()?) as usize;
        let image = cursor.take(image_len)?.to_vec();
        if cursor.offset != raw.len() {
            return None;
        }

        Some(Self {
            op_checkpoint,
            checkpoint_id,
            release,
            commit_min,
            free_set_words,
            grid_index,
            checkpoint_blocks,
            checkpoint_size,
            sessions,
            image,
        })
    }
}

struct Cursor<'a> {
    raw: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let slice = self.raw.get(self.offset..self.offset + n)?;
        self.offset += n;
        Some(slice)
    }
}

/// Sync progress at a lagging replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStage {
    /// Not syncing.
    Idle,
    /// Waiting for a quorum-agreed target and a checkpoint transfer.
    Requesting { target_op: u64, target_id: u128 },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn package() -> CheckpointPackage {
        let mut grid_index = vec![0u128; GRID_BLOCKS_MAX as usize];
        grid_index[0] = 0xAAAA;
        grid_index[5] = 0xBBBB;
        let mut sessions = [SessionSnapshot::default(); CLIENTS_MAX];
        sessions[2] = SessionSnapshot { client: 77, request: 3, reply_checksum: 0xCC };
        CheckpointPackage {
            op_checkpoint: 16,
            checkpoint_id: 0x1234_5678,
            release: 1,
            commit_min: 20,
            free_set_words: [0b100001, 0],
            grid_index,
            checkpoint_blocks: [1, 0, 0, 0, 0, 0, 0, 0],
            checkpoint_size: 32,
            sessions,
            image: vec![9; 32],
        }
    }

    #[test]
    fn test_roundtrip() {
        let original = package();
        let body = original.encode();
        let decoded = CheckpointPackage::decode(&body).expect("decodes");
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_compressed_body_fits_one_message() {
        let body = package().encode();
        assert!(body.len() <= MESSAGE_BODY_SIZE_MAX);
    }

    #[test]
    fn test_truncated_body_rejected() {
        let body = package().encode();
        assert!(CheckpointPackage::decode(&body[..body.len() / 2]).is_none());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(CheckpointPackage::decode(&[0xFF; 100]).is_none());
    }
}
