// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 quorumdb contributors

//! Deterministic in-memory storage for tests and simulation.
//!
//! A [`SimDisk`] is the durable medium: it outlives any one replica
//! process, so a crash/restart is modeled by dropping the old
//! [`SimStorage`] view and opening a new one over the same disk. The
//! harness injects faults directly on the disk:
//!
//! - `corrupt` scrambles bytes deterministically (checksums catch it),
//! - `zero` models a torn write that never reached the media,
//! - `fault_sector` makes reads of that sector report a hard fault.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::SECTOR_SIZE;
use crate::error::{Error, Result};
use crate::storage::{assert_zone_bounds, data_file_size, Storage, Zone};

struct DiskState {
    bytes: Vec<u8>,
    faulty_sectors: HashSet<u64>,
    reads: u64,
    writes: u64,
}

/// Shared durable medium. Cheap to clone; all clones view the same bytes.
#[derive(Clone)]
pub struct SimDisk {
    state: Arc<Mutex<DiskState>>,
}

impl SimDisk {
    /// A zero-filled disk of exactly the data-file size.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(DiskState {
                bytes: vec![0u8; data_file_size() as usize],
                faulty_sectors: HashSet::new(),
                reads: 0,
                writes: 0,
            })),
        }
    }

    /// Open a driver view over this disk.
    #[must_use]
    pub fn storage(&self) -> SimStorage {
        SimStorage { disk: self.clone() }
    }

    /// Deterministically scramble `len` bytes at a zone offset. The pattern
    /// is position-dependent and never a fixed byte, so a scrambled header
    /// cannot alias a valid zeroed region.
    pub fn corrupt(&self, zone: Zone, offset: u64, len: usize) {
        assert_zone_bounds(zone, offset, len);
        let start = (zone.start() + offset) as usize;
        let mut state = self.state.lock();
        for i in 0..len {
            let b = state.bytes[start + i];
            state.bytes[start + i] = b ^ (0xA5u8.wrapping_add((i as u8).wrapping_mul(7)) | 0x01);
        }
    }

    /// Zero `len` bytes at a zone offset (lost write).
    pub fn zero(&self, zone: Zone, offset: u64, len: usize) {
        assert_zone_bounds(zone, offset, len);
        let start = (zone.start() + offset) as usize;
        let mut state = self.state.lock();
        state.bytes[start..start + len].fill(0);
    }

    /// Mark the sector containing the given zone offset as hard-faulted:
    /// reads covering it return `ReadFault` until `clear_faults`.
    pub fn fault_sector(&self, zone: Zone, offset: u64) {
        let absolute = zone.start() + offset;
        self.state.lock().faulty_sectors.insert(absolute / SECTOR_SIZE as u64);
    }

    /// Clear all hard sector faults (media replaced / transient cleared).
    pub fn clear_faults(&self) {
        self.state.lock().faulty_sectors.clear();
    }

    /// Raw copy of a whole zone, for byte-level comparisons in tests.
    #[must_use]
    pub fn zone_bytes(&self, zone: Zone) -> Vec<u8> {
        let state = self.state.lock();
        let start = zone.start() as usize;
        state.bytes[start..start + zone.size() as usize].to_vec()
    }

    /// Total reads and writes served, for I/O-pacing assertions.
    #[must_use]
    pub fn io_counts(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.reads, state.writes)
    }
}

impl Default for SimDisk {
    fn default() -> Self {
        Self::new()
    }
}

/// Driver view over a [`SimDisk`].
pub struct SimStorage {
    disk: SimDisk,
}

impl Storage for SimStorage {
    fn read(&mut self, zone: Zone, offset: u64, buf: &mut [u8]) -> Result<()> {
        assert_zone_bounds(zone, offset, buf.len());
        let start = zone.start() + offset;
        let mut state = self.disk.state.lock();
        state.reads += 1;

        let first_sector = start / SECTOR_SIZE as u64;
        let last_sector = (start + buf.len() as u64).saturating_sub(1) / SECTOR_SIZE as u64;
        for sector in first_sector..=last_sector {
            if state.faulty_sectors.contains(&sector) {
                return Err(Error::ReadFault { zone, offset });
            }
        }

        let start = start as usize;
        buf.copy_from_slice(&state.bytes[start..start + buf.len()]);
        Ok(())
    }

    fn write(&mut self, zone: Zone, offset: u64, data: &[u8]) -> Result<()> {
        assert_zone_bounds(zone, offset, data.len());
        let start = (zone.start() + offset) as usize;
        let mut state = self.disk.state.lock();
        state.writes += 1;
        state.bytes[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_roundtrip() {
        let disk = SimDisk::new();
        let mut storage = disk.storage();
        storage.write(Zone::Grid, 100, b"block").expect("write");
        let mut buf = [0u8; 5];
        storage.read(Zone::Grid, 100, &mut buf).expect("read");
        assert_eq!(&buf, b"block");
    }

    #[test]
    fn test_survives_reopen() {
        let disk = SimDisk::new();
        {
            let mut storage = disk.storage();
            storage.write(Zone::WalHeaders, 0, b"hdr").expect("write");
        }
        let mut storage = disk.storage();
        let mut buf = [0u8; 3];
        storage.read(Zone::WalHeaders, 0, &mut buf).expect("read");
        assert_eq!(&buf, b"hdr");
    }

    #[test]
    fn test_corrupt_changes_bytes() {
        let disk = SimDisk::new();
        let mut storage = disk.storage();
        storage.write(Zone::WalPrepares, 0, &[7u8; 64]).expect("write");
        disk.corrupt(Zone::WalPrepares, 0, 64);
        let mut buf = [0u8; 64];
        storage.read(Zone::WalPrepares, 0, &mut buf).expect("read");
        assert_ne!(buf, [7u8; 64]);
        // Corruption is not zeroing: a scrambled region never looks unwritten.
        assert!(buf.iter().any(|&b| b != 0));
    }

    #[test]
    fn test_faulted_sector_reports_read_fault() {
        let disk = SimDisk::new();
        let mut storage = disk.storage();
        disk.fault_sector(Zone::Grid, 0);
        let mut buf = [0u8; 16];
        match storage.read(Zone::Grid, 0, &mut buf) {
            Err(Error::ReadFault { zone: Zone::Grid, .. }) => {}
            other => panic!("expected ReadFault, got {:?}", other),
        }
        disk.clear_faults();
        assert!(storage.read(Zone::Grid, 0, &mut buf).is_ok());
    }
}
