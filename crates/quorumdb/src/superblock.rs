// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 quorumdb contributors

//! Superblock: the durable, quorum-replicated root of replica state.
//!
//! Written in [`SUPERBLOCK_COPIES`] identical copies at fixed offsets. Each
//! copy carries the update sequence and a checksum; open selects the
//! highest sequence backed by a quorum (majority + 1 of copies) and fails
//! with `SuperblockCorrupt` otherwise. Updates are double-buffered: the new
//! encoding is written and fsynced copy by copy, and only then does the
//! in-memory working copy advance.

use crate::checksum::checksum;
use crate::config::{
    CHECKPOINT_BLOCKS_MAX, CLIENTS_MAX, FORMAT_VERSION, GRID_BLOCKS_MAX, Options, RELEASE,
    SUPERBLOCK_COPIES, SUPERBLOCK_COPY_SIZE,
};
use crate::error::{Error, Result};
use crate::storage::{Storage, Zone};

const MAGIC: u64 = u64::from_le_bytes(*b"QDBSUPER");

/// Words in the persisted free-set bitmap.
pub const FREE_SET_WORDS: usize = (GRID_BLOCKS_MAX as usize).div_ceil(64);

/// Offset of the per-copy index byte; excluded from the copy checksum so
/// all copies of one update have identical checksums.
const COPY_INDEX_OFFSET: usize = 12;
const CHECKSUM_OFFSET: usize = SUPERBLOCK_COPY_SIZE - 16;

/// Replication state persisted in the superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VsrState {
    pub view: u32,
    /// View whose prepares this replica's log is authoritative for.
    /// Invariant: `log_view <= view`.
    pub log_view: u32,
    pub commit_min: u64,
    pub op_checkpoint: u64,
    pub checkpoint_id: u128,
    /// Ops bracketing a state-sync install in progress. Zero when no sync
    /// is mid-install; a single-message transfer never persists a window.
    pub sync_op_min: u64,
    pub sync_op_max: u64,
}

impl VsrState {
    fn zero() -> Self {
        Self {
            view: 0,
            log_view: 0,
            commit_min: 0,
            op_checkpoint: 0,
            checkpoint_id: 0,
            sync_op_min: 0,
            sync_op_max: 0,
        }
    }
}

/// One client session as persisted at checkpoint time. A zero client id
/// means the slot is free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionSnapshot {
    pub client: u128,
    pub request: u32,
    pub reply_checksum: u128,
}

/// In-memory working copy of the superblock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuperBlock {
    pub sequence: u64,
    pub cluster: u64,
    pub replica: u8,
    pub replica_count: u8,
    pub standby_count: u8,
    pub release: u16,
    pub vsr_state: VsrState,
    pub free_set_words: [u64; FREE_SET_WORDS],
    pub sessions: [SessionSnapshot; CLIENTS_MAX],
    /// Expected content checksum per grid address (1-based; entry 0 of the
    /// array is address 1). Zero = address not live at the checkpoint.
    pub grid_index: [u128; GRID_BLOCKS_MAX as usize],
    /// Grid addresses holding the checkpoint image, in image order.
    /// Zero-terminated.
    pub checkpoint_blocks: [u64; CHECKPOINT_BLOCKS_MAX],
    /// Byte length of the checkpoint image.
    pub checkpoint_size: u32,
}

impl SuperBlock {
    /// Quorum required among copies: majority + 1, per the open procedure.
    const COPY_QUORUM: usize = SUPERBLOCK_COPIES / 2 + 1;

    /// Format a fresh data file: sequence 1, zero state, all copies.
    pub fn format(storage: &mut dyn Storage, options: &Options) -> Result<Self> {
        let superblock = Self {
            sequence: 1,
            cluster: options.cluster,
            replica: options.replica,
            replica_count: options.replica_count,
            standby_count: options.standby_count,
            release: RELEASE,
            vsr_state: VsrState::zero(),
            free_set_words: [0; FREE_SET_WORDS],
            sessions: [SessionSnapshot::default(); CLIENTS_MAX],
            grid_index: [0; GRID_BLOCKS_MAX as usize],
            checkpoint_blocks: [0; CHECKPOINT_BLOCKS_MAX],
            checkpoint_size: 0,
        };
        superblock.write_all_copies(storage)?;
        log::info!(
            "[superblock] formatted cluster={:#x} replica={} copies={}",
            options.cluster,
            options.replica,
            SUPERBLOCK_COPIES
        );
        Ok(superblock)
    }

    /// Open: read every copy, select the highest sequence with a quorum of
    /// identical valid copies.
    pub fn open(storage: &mut dyn Storage) -> Result<Self> {
        let mut candidates: Vec<(u64, u128, Self)> = Vec::with_capacity(SUPERBLOCK_COPIES);
        for copy in 0..SUPERBLOCK_COPIES {
            let mut buf = vec![0u8; SUPERBLOCK_COPY_SIZE];
            let offset = copy as u64 * SUPERBLOCK_COPY_SIZE as u64;
            if storage.read(Zone::Superblock, offset, &mut buf).is_err() {
                log::warn!("[superblock] copy {} unreadable", copy);
                continue;
            }
            match Self::decode_copy(&buf) {
                Some((superblock, content_checksum)) => {
                    candidates.push((superblock.sequence, content_checksum, superblock));
                }
                None => log::warn!("[superblock] copy {} invalid", copy),
            }
        }

        // Highest sequence first, then count agreement on the content hash.
        candidates.sort_by(|a, b| b.0.cmp(&a.0));
        for (sequence, content, superblock) in &candidates {
            let agreeing = candidates
                .iter()
                .filter(|(s, c, _)| s == sequence && c == content)
                .count();
            if agreeing >= Self::COPY_QUORUM {
                if superblock.vsr_state.log_view > superblock.vsr_state.view {
                    return Err(Error::SuperblockCorrupt);
                }
                log::debug!(
                    "[superblock] open sequence={} quorum={}/{}",
                    sequence,
                    agreeing,
                    SUPERBLOCK_COPIES
                );
                return Ok(superblock.clone());
            }
        }
        Err(Error::SuperblockCorrupt)
    }

    /// Durable update: mutate a staging copy, bump the sequence, write and
    /// fsync every copy, then replace the working copy. At most one update
    /// is ever in flight because the replica is single-threaded.
    pub fn update<F>(&mut self, storage: &mut dyn Storage, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut SuperBlock),
    {
        let mut staging = self.clone();
        mutate(&mut staging);
        staging.sequence = self.sequence + 1;
        assert!(staging.vsr_state.view >= self.vsr_state.view);
        assert!(staging.vsr_state.op_checkpoint >= self.vsr_state.op_checkpoint);
        assert!(staging.vsr_state.log_view <= staging.vsr_state.view);
        staging.write_all_copies(storage)?;
        *self = staging;
        Ok(())
    }

    fn write_all_copies(&self, storage: &mut dyn Storage) -> Result<()> {
        for copy in 0..SUPERBLOCK_COPIES {
            let encoded = self.encode_copy(copy as u8);
            let offset = copy as u64 * SUPERBLOCK_COPY_SIZE as u64;
            storage.write(Zone::Superblock, offset, &encoded)?;
            storage.flush()?;
        }
        Ok(())
    }

    fn encode_copy(&self, copy: u8) -> Vec<u8> {
        let mut buf = vec![0u8; SUPERBLOCK_COPY_SIZE];
        buf[0..8].copy_from_slice(&MAGIC.to_le_bytes());
        buf[8..12].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        buf[COPY_INDEX_OFFSET] = copy;
        buf[16..24].copy_from_slice(&self.sequence.to_le_bytes());
        buf[24..32].copy_from_slice(&self.cluster.to_le_bytes());
        buf[32] = self.replica;
        buf[33] = self.replica_count;
        buf[34] = self.standby_count;
        buf[36..38].copy_from_slice(&self.release.to_le_bytes());
        buf[40..44].copy_from_slice(&self.vsr_state.view.to_le_bytes());
        buf[44..48].copy_from_slice(&self.vsr_state.log_view.to_le_bytes());
        buf[48..56].copy_from_slice(&self.vsr_state.commit_min.to_le_bytes());
        buf[56..64].copy_from_slice(&self.vsr_state.op_checkpoint.to_le_bytes());
        buf[64..80].copy_from_slice(&self.vsr_state.checkpoint_id.to_le_bytes());
        buf[80..88].copy_from_slice(&self.vsr_state.sync_op_min.to_le_bytes());
        buf[88..96].copy_from_slice(&self.vsr_state.sync_op_max.to_le_bytes());

        let mut offset = 96;
        for word in &self.free_set_words {
            buf[offset..offset + 8].copy_from_slice(&word.to_le_bytes());
            offset += 8;
        }
        for session in &self.sessions {
            buf[offset..offset + 16].copy_from_slice(&session.client.to_le_bytes());
            buf[offset + 16..offset + 20].copy_from_slice(&session.request.to_le_bytes());
            buf[offset + 24..offset + 40].copy_from_slice(&session.reply_checksum.to_le_bytes());
            offset += 40;
        }
        for entry in &self.grid_index {
            buf[offset..offset + 16].copy_from_slice(&entry.to_le_bytes());
            offset += 16;
        }
        for address in &self.checkpoint_blocks {
            buf[offset..offset + 8].copy_from_slice(&address.to_le_bytes());
            offset += 8;
        }
        buf[offset..offset + 4].copy_from_slice(&self.checkpoint_size.to_le_bytes());
        offset += 4;
        assert!(offset <= CHECKSUM_OFFSET);

        let content = Self::content_checksum(&buf);
        buf[CHECKSUM_OFFSET..].copy_from_slice(&content.to_le_bytes());
        buf
    }

    fn decode_copy(buf: &[u8]) -> Option<(Self, u128)> {
        if buf.len() != SUPERBLOCK_COPY_SIZE {
            return None;
        }
        if u64::from_le_bytes(buf[0..8].try_into().ok()?) != MAGIC {
            return None;
        }
        if u32::from_le_bytes(buf[8..12].try_into().ok()?) != FORMAT_VERSION {
            return None;
        }
        let stored = u128::from_le_bytes(buf[CHECKSUM_OFFSET..].try_into().ok()?);
        let content = Self::content_checksum(buf);
        if stored != content {
            return None;
        }

        let vsr_state = VsrState {
            view: u32::from_le_bytes(buf[40..44].try_into().ok()?),
            log_view: u32::from_le_bytes(buf[44..48].try_into().ok()?),
            commit_min: u64::from_le_bytes(buf[48..56].try_into().ok()?),
            op_checkpoint: u64::from_le_bytes(buf[56..64].try_into().ok()?),
            checkpoint_id: u128::from_le_bytes(buf[64..80].try_into().ok()?),
            sync_op_min: u64::from_le_bytes(buf[80..88].try_into().ok()?),
            sync_op_max: u64::from_le_bytes(buf[88..96].try_into().ok()?),
        };

        let mut free_set_words = [0u64; FREE_SET_WORDS];
        let mut offset = 96;
        for word in &mut free_set_words {
            *word = u64::from_le_bytes(buf[offset..offset + 8].try_into().ok()?);
            offset += 8;
        }
        let mut sessions = [SessionSnapshot::default(); CLIENTS_MAX];
        for session in &mut sessions {
            session.client = u128::from_le_bytes(buf[offset..offset + 16].try_into().ok()?);
            session.request = u32::from_le_bytes(buf[offset + 16..offset + 20].try_into().ok()?);
            session.reply_checksum =
                u128::from_le_bytes(buf[offset + 24..offset + 40].try_into().ok()?);
            offset += 40;
        }
        let mut grid_index = [0u128; GRID_BLOCKS_MAX as usize];
        for entry in &mut grid_index {
            *entry = u128::from_le_bytes(buf[offset..offset + 16].try_into().ok()?);
            offset += 16;
        }
        let mut checkpoint_blocks = [0u64; CHECKPOINT_BLOCKS_MAX];
        for address in &mut checkpoint_blocks {
            *address = u64::from_le_bytes(buf[offset..offset + 8].try_into().ok()?);
            offset += 8;
        }
        let checkpoint_size = u32::from_le_bytes(buf[offset..offset + 4].try_into().ok()?);

        let superblock = Self {
            sequence: u64::from_le_bytes(buf[16..24].try_into().ok()?),
            cluster: u64::from_le_bytes(buf[24..32].try_into().ok()?),
            replica: buf[32],
            replica_count: buf[33],
            standby_count: buf[34],
            release: u16::from_le_bytes(buf[36..38].try_into().ok()?),
            vsr_state,
            free_set_words,
            sessions,
            grid_index,
            checkpoint_blocks,
            checkpoint_size,
        };
        Some((superblock, content))
    }

    // Copy checksum with the copy-index byte masked, so all copies of one
    // update agree.
    fn content_checksum(buf: &[u8]) -> u128 {
        let mut masked = buf[..CHECKSUM_OFFSET].to_vec();
        masked[COPY_INDEX_OFFSET] = 0;
        checksum(&masked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SimDisk;

    fn options() -> Options {
        Options { cluster: 0xC1, replica: 1, replica_count: 3, standby_count: 0 }
    }

    #[test]
    fn test_format_then_open() {
        let disk = SimDisk::new();
        let mut storage = disk.storage();
        let formatted = SuperBlock::format(&mut storage, &options()).expect("format");
        let opened = SuperBlock::open(&mut storage).expect("open");
        assert_eq!(formatted, opened);
        assert_eq!(opened.sequence, 1);
        assert_eq!(opened.cluster, 0xC1);
    }

    #[test]
    fn test_update_advances_sequence_durably() {
        let disk = SimDisk::new();
        let mut storage = disk.storage();
        let mut superblock = SuperBlock::format(&mut storage, &options()).expect("format");
        superblock
            .update(&mut storage, |s| {
                s.vsr_state.commit_min = 20;
                s.vsr_state.op_checkpoint = 16;
                s.vsr_state.checkpoint_id = 0xFEED;
            })
            .expect("update");
        assert_eq!(superblock.sequence, 2);

        let reopened = SuperBlock::open(&mut disk.storage()).expect("open");
        assert_eq!(reopened.vsr_state.op_checkpoint, 16);
        assert_eq!(reopened.sequence, 2);
    }

    #[test]
    fn test_open_survives_minority_corruption() {
        let disk = SimDisk::new();
        let mut storage = disk.storage();
        SuperBlock::format(&mut storage, &options()).expect("format");
        disk.corrupt(Zone::Superblock, 0, SUPERBLOCK_COPY_SIZE);
        let opened = SuperBlock::open(&mut storage).expect("open with 3/4");
        assert_eq!(opened.sequence, 1);
    }

    #[test]
    fn test_open_fails_without_quorum() {
        let disk = SimDisk::new();
        let mut storage = disk.storage();
        SuperBlock::format(&mut storage, &options()).expect("format");
        disk.corrupt(Zone::Superblock, 0, SUPERBLOCK_COPY_SIZE);
        disk.corrupt(Zone::Superblock, SUPERBLOCK_COPY_SIZE as u64, SUPERBLOCK_COPY_SIZE);
        match SuperBlock::open(&mut storage) {
            Err(Error::SuperblockCorrupt) => {}
            other => panic!("expected SuperblockCorrupt, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_torn_update_leaves_prior_state() {
        let disk = SimDisk::new();
        let mut storage = disk.storage();
        let mut superblock = SuperBlock::format(&mut storage, &options()).expect("format");
        superblock.update(&mut storage, |s| s.vsr_state.commit_min = 5).expect("update");

        // A torn next update reaches only one copy: that copy (sequence 3)
        // has no quorum, so open falls back to sequence 2.
        let mut torn = superblock.clone();
        torn.sequence = 3;
        torn.vsr_state.commit_min = 9;
        let encoded = torn.encode_copy(0);
        storage.write(Zone::Superblock, 0, &encoded).expect("write");

        let opened = SuperBlock::open(&mut storage).expect("open");
        assert_eq!(opened.sequence, 2);
        assert_eq!(opened.vsr_state.commit_min, 5);
    }

    #[test]
    fn test_sessions_roundtrip() {
        let disk = SimDisk::new();
        let mut storage = disk.storage();
        let mut superblock = SuperBlock::format(&mut storage, &options()).expect("format");
        superblock
            .update(&mut storage, |s| {
                s.sessions[0] =
                    SessionSnapshot { client: 0xABCD, request: 7, reply_checksum: 0x1234 };
                s.free_set_words[0] = 0b1010;
            })
            .expect("update");
        let reopened = SuperBlock::open(&mut disk.storage()).expect("open");
        assert_eq!(reopened.sessions[0].client, 0xABCD);
        assert_eq!(reopened.free_set_words[0], 0b1010);
    }
}
