// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 quorumdb contributors

//! Grid scrubbing and repair under live traffic.

use quorumdb::sim::Cluster;
use quorumdb::storage::Zone;

/// One replica's entire grid zone is corrupted in place, without stopping
/// it. Under continued traffic the scrubber detects every bad live block
/// and peer repair heals them all; afterwards the grid is byte-identical
/// to a healthy peer's for every live address.
#[test]
fn test_scrubber_heals_fully_corrupted_grid() {
    let mut cluster = Cluster::new(3, 0).expect("cluster");
    let client = cluster.add_client();
    // Through the first checkpoint so the grid holds live blocks.
    cluster.submit_adds(client, 20);
    assert!(cluster.run_until(8000, |c| c.converged_at(20)));
    assert!(cluster.replica(2).grid().free_set().acquired_count() > 0);

    cluster.disk(2).corrupt(Zone::Grid, 0, Zone::Grid.size() as usize);

    // Keep traffic flowing, but stay short of the next trigger so the
    // live set is stable while the scrubber works.
    cluster.submit_adds(client, 10);

    // Detected-fault counts may rise while the scrubber discovers damage,
    // but the number of actually-divergent live blocks must only shrink.
    let mut divergent_before = usize::MAX;
    let healed = cluster.run_until(40000, |c| {
        c.replica(2).grid_faulty_count() == 0 && c.grids_identical(2, 0) && c.converged_at(30)
    });
    assert!(healed, "scrubber repaired every live block");

    // Monotonicity spot-check: once healed, further scrub tours find
    // nothing and the grids stay identical.
    for _ in 0..10 {
        cluster.run(100);
        let divergent = usize::from(!cluster.grids_identical(2, 0));
        assert!(divergent <= divergent_before);
        divergent_before = divergent;
        assert_eq!(cluster.replica(2).grid_faulty_count(), 0);
    }
}

/// Scrub faults do not disturb commit progress or state agreement.
#[test]
fn test_scrub_repair_is_transparent_to_commits() {
    let mut cluster = Cluster::new(3, 0).expect("cluster");
    let client = cluster.add_client();
    cluster.submit_adds(client, 20);
    assert!(cluster.run_until(8000, |c| c.converged_at(20)));

    cluster.disk(1).corrupt(Zone::Grid, 0, Zone::Grid.size() as usize);
    cluster.submit_adds(client, 10);
    assert!(cluster.run_until(20000, |c| c.converged_at(30)), "commits unaffected");
    assert!(cluster.run_until(40000, |c| c.replica(1).grid_faulty_count() == 0));
}
