// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 quorumdb contributors

//! Production storage driver over one preallocated data file.

use std::fs::{File, OpenOptions};
use std::path::Path;

use crate::error::{Error, Result};
use crate::storage::{assert_zone_bounds, data_file_size, Storage, Zone};

#[cfg(unix)]
use std::os::unix::fs::FileExt;

/// Positional-I/O driver for the replica data file.
pub struct FileStorage {
    file: File,
}

impl FileStorage {
    /// Create and preallocate a fresh data file. Fails if the file exists,
    /// so an operator cannot format over a live replica by accident.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).create_new(true).open(path)?;
        file.set_len(data_file_size())?;
        file.sync_all()?;
        Ok(Self { file })
    }

    /// Open an existing data file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let actual = file.metadata()?.len();
        let required = data_file_size();
        if actual < required {
            return Err(Error::DataFileTooSmall { actual, required });
        }
        Ok(Self { file })
    }
}

impl Storage for FileStorage {
    fn read(&mut self, zone: Zone, offset: u64, buf: &mut [u8]) -> Result<()> {
        assert_zone_bounds(zone, offset, buf.len());
        self.file.read_exact_at(buf, zone.start() + offset)?;
        Ok(())
    }

    fn write(&mut self, zone: Zone, offset: u64, data: &[u8]) -> Result<()> {
        assert_zone_bounds(zone, offset, data.len());
        self.file.write_all_at(data, zone.start() + offset)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_open_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("replica.qdb");

        let mut storage = FileStorage::create(&path).expect("create");
        storage.write(Zone::WalHeaders, 128, b"abcd").expect("write");
        storage.flush().expect("flush");
        drop(storage);

        let mut storage = FileStorage::open(&path).expect("open");
        let mut buf = [0u8; 4];
        storage.read(Zone::WalHeaders, 128, &mut buf).expect("read");
        assert_eq!(&buf, b"abcd");
    }

    #[test]
    fn test_create_refuses_existing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("replica.qdb");
        FileStorage::create(&path).expect("create");
        assert!(FileStorage::create(&path).is_err());
    }

    #[test]
    fn test_open_rejects_short_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("short.qdb");
        std::fs::write(&path, b"tiny").expect("write");
        match FileStorage::open(&path) {
            Err(Error::DataFileTooSmall { actual, .. }) => assert_eq!(actual, 4),
            other => panic!("expected DataFileTooSmall, got {:?}", other.map(|_| ())),
        }
    }
}
