// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 quorumdb contributors

//! Checkpointing, WAL repair from peers, and reply-cache idempotence.

use quorumdb::config::{
    trigger_for_checkpoint, CHECKPOINT_INTERVAL, MESSAGE_SIZE_MAX, PIPELINE_PREPARE_QUEUE_MAX,
};
use quorumdb::sim::Cluster;
use quorumdb::storage::Zone;
use quorumdb::Status;

/// A backup that crashes just before the checkpoint trigger, and loses an
/// early WAL slot on top, repairs everything from its peers: the pipeline
/// bound guarantees the primary has not yet overwritten the slot.
#[test]
fn test_backup_repairs_from_before_checkpoint() {
    let checkpoint_1_trigger = trigger_for_checkpoint(CHECKPOINT_INTERVAL);

    let mut cluster = Cluster::new(3, 0).expect("cluster");
    let client = cluster.add_client();
    cluster.submit_adds(client, checkpoint_1_trigger - 1);
    assert!(cluster.run_until(8000, |c| c.converged_at(checkpoint_1_trigger - 1)));

    // B1 misses the trigger op.
    cluster.stop(1);
    cluster.submit_adds(client, 1);
    assert!(cluster.run_until(6000, |c| {
        c.commit_min_of(0) == checkpoint_1_trigger && c.commit_min_of(2) == checkpoint_1_trigger
    }));
    assert_eq!(cluster.replica(0).op_checkpoint(), CHECKPOINT_INTERVAL);

    // B1's first WAL entry dies with the crash.
    cluster.disk(1).corrupt(Zone::WalPrepares, MESSAGE_SIZE_MAX as u64, 256);
    cluster.restart(1).expect("reopen b1");
    assert_eq!(cluster.status_of(1), Status::RecoveringHead);

    let target = checkpoint_1_trigger + PIPELINE_PREPARE_QUEUE_MAX as u64;
    cluster.submit_adds(client, PIPELINE_PREPARE_QUEUE_MAX as u64);
    assert!(
        cluster.run_until(30000, |c| c.converged_at(target)),
        "B1 repairs op 1 from peers and catches up to {}",
        target
    );
    assert_eq!(cluster.status_of(1), Status::Normal);
}

/// Checkpoints advance with the interval and survive restart.
#[test]
fn test_checkpoint_interval_and_restart() {
    let mut cluster = Cluster::new(3, 0).expect("cluster");
    let client = cluster.add_client();

    let second_trigger = trigger_for_checkpoint(2 * CHECKPOINT_INTERVAL);
    cluster.submit_adds(client, second_trigger);
    assert!(cluster.run_until(20000, |c| c.converged_at(second_trigger)));
    for replica in 0..3 {
        assert_eq!(cluster.replica(replica).op_checkpoint(), 2 * CHECKPOINT_INTERVAL);
    }

    cluster.stop(2);
    cluster.restart(2).expect("reopen");
    assert_eq!(cluster.replica(2).op_checkpoint(), 2 * CHECKPOINT_INTERVAL);
    assert_eq!(cluster.commit_min_of(2), second_trigger);
}

/// Replaying a client request with an already-answered request number
/// yields a byte-identical reply from the cache, without re-execution.
#[test]
fn test_duplicate_request_replays_identical_reply() {
    let mut cluster = Cluster::new(3, 0).expect("cluster");
    let client = cluster.add_client();
    cluster.submit_adds(client, 3);
    assert!(cluster.run_until(4000, |c| c.client_done(client)));

    let committed = cluster.commit_min_of(0);
    let original = cluster.client(client).replies.last().expect("three replies").clone();

    cluster.client(client).resend_last();
    assert!(
        cluster.run_until(2000, |c| {
            // The duplicate is answered from cache eventually.
            c.converged_at(committed)
        })
    );
    cluster.run(200);

    let duplicates: Vec<_> = cluster
        .client(client)
        .duplicate_replies
        .iter()
        .filter(|(request, _)| *request == original.0)
        .cloned()
        .collect();
    assert!(!duplicates.is_empty(), "duplicate request got a reply");
    for duplicate in &duplicates {
        assert_eq!(duplicate, &original, "cache replay is byte-identical");
    }
    // No re-execution: commit did not advance for the duplicate.
    assert_eq!(cluster.commit_min_of(0), committed);
}
