// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 quorumdb contributors

//! Release upgrades ride the replicated log: the primary pads the bar
//! before a checkpoint with upgrade prepares, and the checkpoint installs
//! the new release cluster-wide.

use quorumdb::config::{trigger_for_checkpoint, CHECKPOINT_INTERVAL};
use quorumdb::sim::Cluster;
use quorumdb::Status;

#[test]
fn test_upgrade_installs_at_checkpoint() {
    let mut cluster = Cluster::new(3, 0).expect("cluster");
    let client = cluster.add_client();
    cluster.submit_adds(client, 3);
    assert!(cluster.run_until(4000, |c| c.converged_at(3)));
    for replica in 0..3 {
        assert_eq!(cluster.replica(replica).release(), 1);
    }

    let primary = cluster.current_primary().expect("primary");
    cluster.replica_mut(primary).request_upgrade(2);

    // The primary pads to the trigger; the checkpoint carries release 2.
    let trigger = trigger_for_checkpoint(CHECKPOINT_INTERVAL);
    assert!(
        cluster.run_until(20000, |c| (0..3).all(|i| c.replica(i).release() == 2)),
        "every replica installs release 2"
    );
    for replica in 0..3 {
        assert_eq!(cluster.replica(replica).op_checkpoint(), CHECKPOINT_INTERVAL);
        assert!(cluster.commit_min_of(replica) >= trigger);
        assert_eq!(cluster.status_of(replica), Status::Normal);
    }

    // The upgraded cluster keeps serving, with prepares on the new release.
    cluster.submit_adds(client, 2);
    assert!(cluster.run_until(6000, |c| c.converged_at(trigger + 2)));
}

#[test]
fn test_upgraded_cluster_survives_restart() {
    let mut cluster = Cluster::new(3, 0).expect("cluster");
    let client = cluster.add_client();
    cluster.submit_adds(client, 3);
    assert!(cluster.run_until(4000, |c| c.converged_at(3)));

    let primary = cluster.current_primary().expect("primary");
    cluster.replica_mut(primary).request_upgrade(2);
    assert!(cluster.run_until(20000, |c| (0..3).all(|i| c.replica(i).release() == 2)));

    cluster.stop(1);
    cluster.restart(1).expect("reopen on new release");
    assert_eq!(cluster.replica(1).release(), 2);
    let committed = cluster.commit_min_of(0);
    assert!(cluster.run_until(8000, |c| c.converged_at(committed)));
}
