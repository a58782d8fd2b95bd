// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 quorumdb contributors

//! Grid: content-addressed block storage.
//!
//! Blocks are fixed-size, immutable once written, and identified by an
//! (address, checksum) pair: any peer whose block at that address hashes to
//! the expected checksum is a valid repair source. The in-memory index maps
//! every live address to its expected checksum; it is persisted in the
//! superblock at checkpoint boundaries, which is also the only point where
//! staged releases actually free addresses.

pub mod free_set;
pub mod scrubber;

pub use free_set::FreeSet;
pub use scrubber::Scrubber;

use crate::checksum::checksum;
use crate::config::{BLOCK_SIZE, GRID_BLOCKS_MAX};
use crate::error::Result;
use crate::storage::{Storage, Zone};
use crate::superblock::{SuperBlock, FREE_SET_WORDS};

/// Maximum payload bytes per block (4 bytes of length framing).
pub const BLOCK_PAYLOAD_MAX: usize = BLOCK_SIZE - 4;

/// Content-addressed block store state.
pub struct Grid {
    free_set: FreeSet,
    /// Expected checksum per address, index 0 unused (addresses 1-based).
    index: Vec<u128>,
    /// Addresses whose local copy failed verification.
    faulty: Vec<bool>,
    /// Releases staged until the next checkpoint.
    staged_releases: Vec<u64>,
}

impl Grid {
    #[must_use]
    pub fn new() -> Self {
        Self {
            free_set: FreeSet::new(),
            index: vec![0; GRID_BLOCKS_MAX as usize + 1],
            faulty: vec![false; GRID_BLOCKS_MAX as usize + 1],
            staged_releases: Vec::new(),
        }
    }

    /// Restore index and free set from an opened superblock.
    #[must_use]
    pub fn from_superblock(superblock: &SuperBlock) -> Self {
        let mut grid = Self::new();
        grid.free_set = FreeSet::from_words(superblock.free_set_words);
        for (i, &expected) in superblock.grid_index.iter().enumerate() {
            grid.index[i + 1] = expected;
        }
        grid
    }

    /// Acquire a fresh address for a block about to be written.
    pub fn acquire(&mut self) -> Option<u64> {
        self.free_set.acquire()
    }

    /// Stage an address for release at the next checkpoint.
    pub fn release_at_checkpoint(&mut self, address: u64) {
        assert!(self.free_set.is_acquired(address));
        self.staged_releases.push(address);
    }

    /// Encode, checksum, and durably write a block. Returns the block id.
    pub fn write_block(
        &mut self,
        storage: &mut dyn Storage,
        address: u64,
        payload: &[u8],
    ) -> Result<u128> {
        assert!(self.free_set.is_acquired(address));
        assert!(payload.len() <= BLOCK_PAYLOAD_MAX);

        let buf = Self::encode_block(payload);
        let block_id = checksum(&buf);
        storage.write(Zone::Grid, (address - 1) * BLOCK_SIZE as u64, &buf)?;
        storage.flush()?;
        self.index[address as usize] = block_id;
        self.faulty[address as usize] = false;
        Ok(block_id)
    }

    /// Install a block obtained from a peer. The content must hash to the
    /// expected id for the address; anything else is discarded.
    pub fn repair_block(
        &mut self,
        storage: &mut dyn Storage,
        address: u64,
        raw: &[u8],
    ) -> Result<bool> {
        let expected = self.index[address as usize];
        if expected == 0 || raw.len() != BLOCK_SIZE || checksum(raw) != expected {
            return Ok(false);
        }
        storage.write(Zone::Grid, (address - 1) * BLOCK_SIZE as u64, raw)?;
        storage.flush()?;
        self.faulty[address as usize] = false;
        log::debug!("[grid] repaired block address={}", address);
        Ok(true)
    }

    /// Read and verify the payload of a live block. A verification failure
    /// marks the address faulty and returns `None`; the repair path takes
    /// over from there.
    pub fn read_block(&mut self, storage: &mut dyn Storage, address: u64) -> Result<Option<Vec<u8>>> {
        match self.read_block_raw(storage, address)? {
            Some(raw) => Ok(Some(Self::decode_block(&raw))),
            None => Ok(None),
        }
    }

    /// Read and verify the raw (padded) block bytes, as shipped to peers.
    pub fn read_block_raw(
        &mut self,
        storage: &mut dyn Storage,
        address: u64,
    ) -> Result<Option<Vec<u8>>> {
        let expected = self.index[address as usize];
        assert!(expected != 0, "read of unindexed address {}", address);

        let mut raw = vec![0u8; BLOCK_SIZE];
        let read = storage.read(Zone::Grid, (address - 1) * BLOCK_SIZE as u64, &mut raw);
        if read.is_err() || checksum(&raw) != expected {
            self.faulty[address as usize] = true;
            log::warn!("[grid] verification failed address={}", address);
            return Ok(None);
        }
        Ok(Some(raw))
    }

    /// Expected checksum for an address (zero when not live).
    #[must_use]
    pub fn expected(&self, address: u64) -> u128 {
        self.index[address as usize]
    }

    /// Mark every live address faulty except those that verify locally.
    /// Used after state sync installs a foreign index.
    pub fn audit(&mut self, storage: &mut dyn Storage) -> Result<usize> {
        let live: Vec<u64> = self.free_set.iter_acquired().collect();
        let mut faults = 0;
        for address in live {
            if self.index[address as usize] == 0 {
                continue;
            }
            if self.read_block_raw(storage, address)?.is_none() {
                faults += 1;
            }
        }
        Ok(faults)
    }

    pub fn mark_faulty(&mut self, address: u64) {
        assert!(self.index[address as usize] != 0);
        self.faulty[address as usize] = true;
    }

    #[must_use]
    pub fn is_faulty(&self, address: u64) -> bool {
        self.faulty[address as usize]
    }

    /// Addresses currently awaiting repair.
    #[must_use]
    pub fn faulty_addresses(&self) -> Vec<u64> {
        (1..=GRID_BLOCKS_MAX).filter(|&a| self.faulty[a as usize]).collect()
    }

    #[must_use]
    pub fn faulty_count(&self) -> usize {
        self.faulty.iter().filter(|&&f| f).count()
    }

    #[must_use]
    pub fn free_set(&self) -> &FreeSet {
        &self.free_set
    }

    /// Checkpoint boundary: apply staged releases and export the persisted
    /// form (free-set words + index) for the superblock.
    pub fn checkpoint(&mut self) -> ([u64; FREE_SET_WORDS], Vec<u128>) {
        for address in self.staged_releases.drain(..) {
            self.free_set.release(address);
            self.index[address as usize] = 0;
            self.faulty[address as usize] = false;
        }
        (self.free_set.to_words(), self.index[1..].to_vec())
    }

    fn encode_block(payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        buf[0..4].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        buf[4..4 + payload.len()].copy_from_slice(payload);
        buf
    }

    fn decode_block(raw: &[u8]) -> Vec<u8> {
        let len = u32::from_le_bytes(raw[0..4].try_into().unwrap()) as usize;
        assert!(len <= BLOCK_PAYLOAD_MAX);
        raw[4..4 + len].to_vec()
    }
}

impl Default for Grid {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SimDisk;

    #[test]
    fn test_write_read_roundtrip() {
        let disk = SimDisk::new();
        let mut storage = disk.storage();
        let mut grid = Grid::new();
        let address = grid.acquire().expect("address");
        let id = grid.write_block(&mut storage, address, b"table data").expect("write");
        assert_eq!(grid.expected(address), id);
        let payload = grid.read_block(&mut storage, address).expect("io").expect("verified");
        assert_eq!(payload, b"table data");
    }

    #[test]
    fn test_corruption_detected_and_repaired() {
        let disk = SimDisk::new();
        let mut storage = disk.storage();
        let mut grid = Grid::new();
        let address = grid.acquire().expect("address");
        grid.write_block(&mut storage, address, b"payload").expect("write");

        // Keep a healthy copy, then corrupt the stored block.
        let healthy = grid.read_block_raw(&mut storage, address).expect("io").expect("raw");
        disk.corrupt(Zone::Grid, (address - 1) * BLOCK_SIZE as u64, 32);

        assert!(grid.read_block(&mut storage, address).expect("io").is_none());
        assert!(grid.is_faulty(address));
        assert_eq!(grid.faulty_count(), 1);

        assert!(grid.repair_block(&mut storage, address, &healthy).expect("repair"));
        assert_eq!(grid.faulty_count(), 0);
        assert!(grid.read_block(&mut storage, address).expect("io").is_some());
    }

    #[test]
    fn test_repair_rejects_wrong_content() {
        let disk = SimDisk::new();
        let mut storage = disk.storage();
        let mut grid = Grid::new();
        let address = grid.acquire().expect("address");
        grid.write_block(&mut storage, address, b"payload").expect("write");
        grid.mark_faulty(address);
        let forged = vec![0xEE; BLOCK_SIZE];
        assert!(!grid.repair_block(&mut storage, address, &forged).expect("repair attempt"));
        assert!(grid.is_faulty(address));
    }

    #[test]
    fn test_release_only_at_checkpoint() {
        let mut grid = Grid::new();
        let address = grid.acquire().expect("address");
        grid.release_at_checkpoint(address);
        // Still acquired until the checkpoint boundary.
        assert!(grid.free_set().is_acquired(address));
        grid.checkpoint();
        assert!(!grid.free_set().is_acquired(address));
    }

    #[test]
    fn test_superblock_roundtrip() {
        let disk = SimDisk::new();
        let mut storage = disk.storage();
        let mut grid = Grid::new();
        let address = grid.acquire().expect("address");
        let id = grid.write_block(&mut storage, address, b"persisted").expect("write");
        let (words, index) = grid.checkpoint();

        let mut superblock = SuperBlock::format(
            &mut storage,
            &crate::config::Options { cluster: 1, replica: 0, replica_count: 1, standby_count: 0 },
        )
        .expect("format");
        superblock
            .update(&mut storage, |s| {
                s.free_set_words = words;
                s.grid_index.copy_from_slice(&index);
            })
            .expect("update");

        let restored = Grid::from_superblock(&superblock);
        assert!(restored.free_set().is_acquired(address));
        assert_eq!(restored.expected(address), id);
    }
}
