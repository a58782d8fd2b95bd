// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 quorumdb contributors

//! State sync: replicas too far behind for WAL repair fetch a whole
//! checkpoint and rejoin from it.

use quorumdb::sim::Cluster;
use quorumdb::Status;

/// Cluster of 4: two replicas sleep through two checkpoints while the
/// remaining pair keeps committing far enough that the sleepers' WAL
/// windows can never be refilled (their missing prepares have been
/// overwritten cluster-wide). On restart they must state-sync and then
/// converge to the cluster's commit.
#[test]
fn test_two_laggards_of_four_state_sync() {
    let mut cluster = Cluster::new(4, 0).expect("cluster");
    let client = cluster.add_client();
    cluster.submit_adds(client, 10);
    assert!(cluster.run_until(6000, |c| c.converged_at(10)));

    cluster.stop(2);
    cluster.stop(3);

    // 34 more ops: past two checkpoint triggers (20 and 36), and far
    // enough that ops 11 and 12 are overwritten in every live WAL.
    cluster.submit_adds(client, 34);
    assert!(cluster.run_until(30000, |c| {
        c.commit_min_of(0) == 44 && c.commit_min_of(1) == 44
    }));
    assert_eq!(cluster.replica(0).op_checkpoint(), 32);

    cluster.restart(2).expect("reopen r2");
    cluster.restart(3).expect("reopen r3");
    assert!(
        cluster.run_until(60000, |c| c.converged_at(44)),
        "laggards sync to the checkpoint and replay the tail"
    );
    // They arrived via checkpoint install, not genesis replay.
    assert_eq!(cluster.replica(2).op_checkpoint(), 32);
    assert_eq!(cluster.replica(3).op_checkpoint(), 32);
    for replica in 0..4 {
        assert_eq!(cluster.status_of(replica), Status::Normal);
    }
}

/// A synced replica also heals its grid from peers afterwards.
#[test]
fn test_sync_then_grid_heals() {
    let mut cluster = Cluster::new(4, 0).expect("cluster");
    let client = cluster.add_client();
    cluster.submit_adds(client, 10);
    assert!(cluster.run_until(6000, |c| c.converged_at(10)));

    cluster.stop(3);
    cluster.submit_adds(client, 34);
    assert!(cluster.run_until(30000, |c| c.commit_min_of(0) == 44));

    cluster.restart(3).expect("reopen");
    assert!(cluster.run_until(60000, |c| {
        c.converged_at(44) && c.replica(3).grid_faulty_count() == 0
    }));
    assert!(cluster.grids_identical(3, 0), "synced grid matches a healthy peer");
}
