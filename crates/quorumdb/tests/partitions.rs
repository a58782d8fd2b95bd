// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 quorumdb contributors

//! Partition scenarios: isolated backups, competing primaries.

use quorumdb::sim::Cluster;
use quorumdb::Status;

/// A fully isolated backup does not stop the remaining majority; its
/// commit freezes until it is reunited.
#[test]
fn test_isolated_backup_catches_up() {
    let mut cluster = Cluster::new(3, 0).expect("cluster");
    let client = cluster.add_client();
    cluster.submit_adds(client, 5);
    assert!(cluster.run_until(4000, |c| c.converged_at(5)));

    cluster.isolate(2);
    cluster.submit_adds(client, 5);
    assert!(
        cluster.run_until(6000, |c| c.converged_at(10)),
        "majority keeps committing without the isolated backup"
    );
    assert_eq!(cluster.commit_min_of(2), 5, "isolated backup frozen at pre-partition commit");

    cluster.reconnect(2);
    assert!(
        cluster.run_until(20000, |c| {
            c.commit_min_of(2) == 10 && c.status_of(2) == Status::Normal && c.converged_at(10)
        }),
        "reunited backup converges"
    );
}

/// Two successive partitions produce primaries in distinct views; when
/// everyone is reunited the cluster settles on exactly one primary with
/// the commit preserved and no divergence.
#[test]
fn test_duelling_primaries_converge() {
    let mut cluster = Cluster::new(3, 0).expect("cluster");
    let client = cluster.add_client();
    cluster.submit_adds(client, 5);
    assert!(cluster.run_until(4000, |c| c.converged_at(5)));
    assert_eq!(cluster.current_primary(), Some(0));

    // First duel contender: isolate the primary of view 0.
    cluster.isolate(0);
    assert!(
        cluster.run_until(10000, |c| c.current_primary().is_some_and(|p| p != 0)),
        "remaining pair elects a new primary"
    );
    let first = cluster.current_primary().expect("new primary");

    // Second: isolate that one too and bring the old primary back.
    cluster.isolate(first);
    cluster.reconnect(0);
    assert!(
        cluster.run_until(15000, |c| c.current_primary().is_some_and(|p| p != first)),
        "a third primary forms in a higher view"
    );

    // Reunite everyone: exactly one primary, commit unchanged, identical
    // state (converged_at asserts digest agreement).
    cluster.reconnect(first);
    assert!(
        cluster.run_until(20000, |c| {
            c.primary_count() == 1
                && (0..3).all(|i| c.status_of(i) == Status::Normal)
                && c.converged_at(5)
        }),
        "single primary, no divergence, commit preserved"
    );
}

/// Replies are delivered per client in request order even across a view
/// change in the middle of the workload.
#[test]
fn test_replies_ordered_across_view_change() {
    let mut cluster = Cluster::new(3, 0).expect("cluster");
    let client = cluster.add_client();
    cluster.submit_adds(client, 3);
    assert!(cluster.run_until(4000, |c| c.client_done(client)));

    // Force a view change, then continue the workload.
    cluster.isolate(0);
    cluster.submit_adds(client, 3);
    assert!(cluster.run_until(15000, |c| c.client_done(client)));
    cluster.reconnect(0);
    assert!(cluster.run_until(15000, |c| c.converged_at(6)));

    let requests: Vec<u32> = cluster.client(client).replies.iter().map(|(r, _)| *r).collect();
    assert_eq!(requests, vec![1, 2, 3, 4, 5, 6]);
}
