// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 quorumdb contributors

//! Crate error type.
//!
//! Only conditions that a single replica can recover from, or that an
//! operator must act on, are represented here. Conditions that could let
//! replicas diverge (chain mismatch on a committed op, quorum arithmetic
//! violations) are assertions: the process halts rather than continue on a
//! log it cannot trust.

use crate::storage::Zone;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the replication core.
#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Data-file format / open errors
    // ========================================================================
    /// No superblock quorum: fewer than a majority of copies agree.
    SuperblockCorrupt,
    /// The data file is smaller than the fixed zone layout requires.
    DataFileTooSmall { actual: u64, required: u64 },
    /// The data file was formatted by an incompatible layout version.
    FormatVersionUnsupported(u32),
    /// The data file belongs to a different cluster.
    ClusterMismatch { expected: u64, actual: u64 },
    /// The data file was formatted for a different replica index.
    ReplicaMismatch { expected: u8, actual: u8 },

    // ========================================================================
    // WAL errors
    // ========================================================================
    /// A committed prepare is unreadable and no peer can supply it (R=1).
    WalCorrupt { slot: u64 },

    // ========================================================================
    // Storage errors
    // ========================================================================
    /// The driver reported an unrecoverable read fault.
    ReadFault { zone: Zone, offset: u64 },
    /// The driver reported an unrecoverable write fault.
    WriteFault { zone: Zone, offset: u64 },
    /// Underlying I/O error from the production driver.
    Io(std::io::Error),

    // ========================================================================
    // Upgrade / release errors
    // ========================================================================
    /// A committed upgrade (or synced checkpoint) names a release that is
    /// not in this binary's bundle. Exit cleanly; the operator restarts
    /// with the right binary.
    ReleaseNotBundled(u16),

    // ========================================================================
    // Bus errors
    // ========================================================================
    /// Failed to bind a replica's listen address.
    BindFailed(String),
    /// Datagram send failed.
    SendFailed(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            // Format / open
            Error::SuperblockCorrupt => write!(f, "superblock: no quorum of valid copies"),
            Error::DataFileTooSmall { actual, required } => {
                write!(f, "data file too small: {} bytes, need {}", actual, required)
            }
            Error::FormatVersionUnsupported(version) => {
                write!(f, "unsupported data file format version {}", version)
            }
            Error::ClusterMismatch { expected, actual } => {
                write!(f, "cluster mismatch: expected {:#x}, file has {:#x}", expected, actual)
            }
            Error::ReplicaMismatch { expected, actual } => {
                write!(f, "replica mismatch: expected {}, file has {}", expected, actual)
            }
            // WAL
            Error::WalCorrupt { slot } => {
                write!(f, "WAL corrupt at slot {} and no peer can repair it", slot)
            }
            // Storage
            Error::ReadFault { zone, offset } => {
                write!(f, "read fault in zone {:?} at offset {}", zone, offset)
            }
            Error::WriteFault { zone, offset } => {
                write!(f, "write fault in zone {:?} at offset {}", zone, offset)
            }
            Error::Io(err) => write!(f, "I/O error: {}", err),
            // Upgrade
            Error::ReleaseNotBundled(release) => {
                write!(f, "release {} is not bundled; restart with the matching binary", release)
            }
            // Bus
            Error::BindFailed(msg) => write!(f, "bind failed: {}", msg),
            Error::SendFailed(msg) => write!(f, "send failed: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_operator_readable() {
        let err = Error::DataFileTooSmall { actual: 100, required: 4096 };
        assert!(err.to_string().contains("100"));
        assert!(err.to_string().contains("4096"));
    }

    #[test]
    fn test_io_source_preserved() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err = Error::from(io);
        assert!(std::error::Error::source(&err).is_some());
    }
}
