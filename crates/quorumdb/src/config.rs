// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 quorumdb contributors

//! Global configuration - single source of truth.
//!
//! This module centralizes every static bound and all derived layout and
//! quorum arithmetic. **Never hardcode these values elsewhere!**
//!
//! Two levels:
//! - Compile-time constants: sizes, slot counts, timeout ticks.
//! - [`Options`]: per-process runtime configuration (cluster id, replica
//!   index, cluster shape, addresses) passed to format/open.

// =======================================================================
// On-disk geometry
// =======================================================================

/// Smallest unit of atomic disk I/O assumed by the torn-write model.
/// Writes may tear at this granularity but never within it.
pub const SECTOR_SIZE: usize = 512;

/// Fixed size of every message header, on disk and on the wire.
pub const HEADER_SIZE: usize = 128;

/// Maximum size of a full message (header + body). One WAL prepare slot and
/// one client-reply slot are exactly this large.
pub const MESSAGE_SIZE_MAX: usize = 4096;

/// Maximum message body size.
pub const MESSAGE_BODY_SIZE_MAX: usize = MESSAGE_SIZE_MAX - HEADER_SIZE;

/// Size of one grid block.
pub const BLOCK_SIZE: usize = 8192;

/// Number of addressable grid blocks. Addresses are 1-based.
pub const GRID_BLOCKS_MAX: u64 = 128;

/// Number of WAL slots. Power of two, and strictly greater than
/// `PIPELINE_PREPARE_QUEUE_MAX + CHECKPOINT_INTERVAL` so the prepares of the
/// current checkpoint cannot be overwritten before the next checkpoint is
/// durable.
pub const SLOT_COUNT: u64 = 32;

/// Number of redundant superblock copies.
pub const SUPERBLOCK_COPIES: usize = 4;

/// Reserved on-disk size of one superblock copy (sector-aligned).
pub const SUPERBLOCK_COPY_SIZE: usize = 4096;

/// Maximum grid blocks referenced by one checkpoint image.
pub const CHECKPOINT_BLOCKS_MAX: usize = 8;

/// Releases bundled into this binary. A replica can only run prepares whose
/// release it carries.
pub const RELEASES_BUNDLED: &[u16] = &[1, 2];

// =======================================================================
// Cluster shape
// =======================================================================

/// Hard cap on replicas + standbys per cluster.
pub const REPLICAS_MAX: usize = 8;

/// Maximum concurrent client sessions (reply-cache slots).
pub const CLIENTS_MAX: usize = 8;

/// Maximum uncommitted prepares in flight at the primary.
pub const PIPELINE_PREPARE_QUEUE_MAX: usize = 4;

/// Maximum client requests queued at the primary beyond the prepare
/// pipeline. Overflow is dropped; clients retry by request number.
pub const PIPELINE_REQUEST_QUEUE_MAX: usize = 4;

/// Ops between checkpoints.
pub const CHECKPOINT_INTERVAL: u64 = 16;

/// Current code release. Prepares carry the release that produced them.
pub const RELEASE: u16 = 1;

/// Oldest client release the cluster accepts.
pub const RELEASE_CLIENT_MIN: u16 = 1;

/// Data-file layout version, rejected on open if unknown.
pub const FORMAT_VERSION: u32 = 3;

// =======================================================================
// Checkpoint arithmetic
// =======================================================================

/// The op whose checkpoint follows `op_checkpoint`.
#[must_use]
pub const fn checkpoint_after(op_checkpoint: u64) -> u64 {
    op_checkpoint + CHECKPOINT_INTERVAL
}

/// The op whose commit causes checkpoint `c` to be written. The gap keeps
/// the pipeline flowing while the checkpoint is made durable.
#[must_use]
pub const fn trigger_for_checkpoint(c: u64) -> u64 {
    c + PIPELINE_PREPARE_QUEUE_MAX as u64
}

/// Highest op that may occupy the WAL while `c` is the current checkpoint.
/// Bounded by `SLOT_COUNT - PIPELINE_PREPARE_QUEUE_MAX` so that slots of
/// checkpointed ops are the only ones ever overwritten.
#[must_use]
pub const fn prepare_max_for_checkpoint(c: u64) -> u64 {
    c + SLOT_COUNT - PIPELINE_PREPARE_QUEUE_MAX as u64
}

// =======================================================================
// Timeout ticks
//
// All protocol timing is counted in event-loop ticks; the production bus
// turns wall-clock time into ticks, the simulator steps them directly.
// =======================================================================

/// Primary heartbeat (commit broadcast) period.
pub const COMMIT_HEARTBEAT_TICKS: u64 = 5;

/// Ping period (clock exchange + checkpoint advertisement).
pub const PING_TIMEOUT_TICKS: u64 = 10;

/// Backup declares the primary dead after this many ticks of silence.
pub const VIEW_CHANGE_TIMEOUT_TICKS: u64 = 50;

/// View-change status gives up waiting and re-announces after this long.
pub const VIEW_CHANGE_STATUS_TIMEOUT_TICKS: u64 = 30;

/// Primary retransmits unacknowledged prepares after this many ticks.
pub const PREPARE_TIMEOUT_TICKS: u64 = 20;

/// Primary abdicates (stops heartbeating) after this many ticks without a
/// prepare-ok majority.
pub const PRIMARY_ABDICATE_TIMEOUT_TICKS: u64 = 100;

/// Journal repair requests are re-issued at this period.
pub const REPAIR_TIMEOUT_TICKS: u64 = 15;

/// Scrubber advances one block per firing.
pub const SCRUB_TIMEOUT_TICKS: u64 = 8;

/// State-sync requests are re-issued at this period.
pub const SYNC_TIMEOUT_TICKS: u64 = 25;

// =======================================================================
// Runtime options
// =======================================================================

/// Per-process configuration for `format` and `open`.
#[derive(Debug, Clone)]
pub struct Options {
    /// Cluster identifier; every message and on-disk structure carries it.
    pub cluster: u64,
    /// This replica's index. `< replica_count` for active replicas,
    /// `replica_count..replica_count + standby_count` for standbys.
    pub replica: u8,
    /// Number of active (quorum-bearing) replicas. Odd, typically 3 or 5.
    pub replica_count: u8,
    /// Number of standbys following the cluster.
    pub standby_count: u8,
}

impl Options {
    /// Total processes in the cluster, standbys included.
    #[must_use]
    pub fn member_count(&self) -> usize {
        usize::from(self.replica_count) + usize::from(self.standby_count)
    }

    /// True when this process is a standby (replicates, never votes).
    #[must_use]
    pub fn is_standby(&self) -> bool {
        self.replica >= self.replica_count
    }

    /// Replication quorum: prepare-oks needed to commit, primary included.
    /// f+1 with 2f+1 = R; for even R the smaller half, so a cluster of 4
    /// keeps committing with 2 alive. Intersection with the view-change
    /// quorum is what protects committed ops.
    #[must_use]
    pub fn quorum_replication(&self) -> usize {
        let r = usize::from(self.replica_count);
        match r {
            1 => 1,
            2 => 2,
            _ => r.div_ceil(2),
        }
    }

    /// View-change quorum: strict majority, so any two view changes share
    /// a replica and every replication quorum intersects it.
    #[must_use]
    pub fn quorum_view_change(&self) -> usize {
        let r = usize::from(self.replica_count);
        match r {
            1 => 1,
            2 => 2,
            _ => r / 2 + 1,
        }
    }

    /// Agreement needed on a sync target: f+1 peers advertising the same
    /// checkpoint id.
    #[must_use]
    pub fn quorum_sync(&self) -> usize {
        (usize::from(self.replica_count) - 1) / 2 + 1
    }

    /// Primary index for a view.
    #[must_use]
    pub fn primary_for_view(&self, view: u32) -> u8 {
        (view % u32::from(self.replica_count)) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_count_exceeds_checkpoint_window() {
        assert!(SLOT_COUNT > PIPELINE_PREPARE_QUEUE_MAX as u64 + CHECKPOINT_INTERVAL);
        assert!(SLOT_COUNT.is_power_of_two());
    }

    #[test]
    fn test_message_sizes_sector_aligned() {
        assert_eq!(MESSAGE_SIZE_MAX % SECTOR_SIZE, 0);
        assert_eq!(BLOCK_SIZE % SECTOR_SIZE, 0);
        assert_eq!(SUPERBLOCK_COPY_SIZE % SECTOR_SIZE, 0);
    }

    #[test]
    fn test_checkpoint_arithmetic() {
        let c1 = checkpoint_after(0);
        assert_eq!(c1, CHECKPOINT_INTERVAL);
        assert!(trigger_for_checkpoint(c1) > c1);
        assert!(prepare_max_for_checkpoint(0) >= trigger_for_checkpoint(c1));
        // The trigger of the next checkpoint always fits in the WAL window
        // of the current one.
        assert!(trigger_for_checkpoint(checkpoint_after(0)) <= prepare_max_for_checkpoint(0));
    }

    #[test]
    fn test_quorum_arithmetic() {
        let opts = Options { cluster: 1, replica: 0, replica_count: 3, standby_count: 1 };
        assert_eq!(opts.quorum_replication(), 2);
        assert_eq!(opts.quorum_view_change(), 2);
        assert_eq!(opts.member_count(), 4);
        assert!(!opts.is_standby());
        let standby = Options { replica: 3, ..opts };
        assert!(standby.is_standby());
    }

    #[test]
    fn test_quorums_intersect() {
        for replica_count in 1..=REPLICAS_MAX as u8 {
            let opts =
                Options { cluster: 1, replica: 0, replica_count, standby_count: 0 };
            assert!(
                opts.quorum_replication() + opts.quorum_view_change()
                    > usize::from(replica_count),
                "no intersection at R={}",
                replica_count
            );
        }
    }

    #[test]
    fn test_primary_rotation() {
        let opts = Options { cluster: 1, replica: 0, replica_count: 3, standby_count: 0 };
        assert_eq!(opts.primary_for_view(0), 0);
        assert_eq!(opts.primary_for_view(1), 1);
        assert_eq!(opts.primary_for_view(3), 0);
    }
}
