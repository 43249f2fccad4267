//! End-to-end replication tests on in-process clusters.

mod common;

use std::time::Duration;

use common::{fast_config, TestCluster, CONVERGE_TIMEOUT};
use memberlist_kv::testing::{wait_until, ChaosConfig};
use memberlist_kv::{Action, JoinStatus, MergePolicy};
use rand::seq::SliceRandom;
use rand::Rng;

#[tokio::test]
async fn test_three_node_add_then_delete() {
    let cluster = TestCluster::start(3).await;

    cluster.node(0).add("x", "1").unwrap();
    assert!(
        cluster.wait_for_value("x", Some("1")).await,
        "add did not reach every node"
    );

    cluster.node(0).del("x").unwrap();
    assert!(
        cluster.wait_for_value("x", None).await,
        "delete did not reach every node"
    );

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_change_from_any_node_propagates() {
    let cluster = TestCluster::start(4).await;

    cluster.node(2).add("from-2", "a").unwrap();
    cluster.node(3).add("from-3", "b").unwrap();
    assert!(cluster.wait_for_value("from-2", Some("a")).await);
    assert!(cluster.wait_for_value("from-3", Some("b")).await);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_late_joiner_reads_existing_state_immediately() {
    let mut cluster = TestCluster::start(3).await;
    cluster.node(0).add("x", "1").unwrap();
    assert!(cluster.wait_for_value("x", Some("1")).await);

    let status = cluster.add_node(fast_config("late")).await;
    assert!(matches!(status, JoinStatus::Joined { contacted: 1 }));

    // The join exchange carries the seed's store; no gossip round needed.
    assert_eq!(cluster.node(3).read_local("x").as_deref(), Some("1"));
    assert!(cluster.wait_for_members(4).await);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_sync_repairs_missed_delta() {
    let cluster = TestCluster::start(3).await;
    let (a, b, c) = (cluster.addr(0), cluster.addr(1), cluster.addr(2));

    cluster.net.chaos().isolate(c, [a, b]);
    cluster.node(0).add("y", "1").unwrap();

    assert!(
        wait_until(
            || cluster.node(1).read_local("y").is_some(),
            CONVERGE_TIMEOUT
        )
        .await
    );
    // Let every copy of the delta exhaust its retransmit budget.
    assert!(
        wait_until(
            || cluster.node(0).pending_broadcasts() == 0 && cluster.node(1).pending_broadcasts() == 0,
            CONVERGE_TIMEOUT
        )
        .await
    );
    assert_eq!(cluster.node(2).read_local("y"), None);

    // Only the link to the writer comes back.
    cluster.net.chaos().heal(&c, &a);
    assert!(cluster.net.chaos().is_partitioned(&c, &b));
    cluster.node(2).sync_with(a).await.unwrap();
    assert_eq!(cluster.node(2).read_local("y").as_deref(), Some("1"));

    cluster.net.chaos().heal_all();

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_periodic_push_pull_with_always_policy() {
    let cluster = TestCluster::start_with(3, |name| {
        fast_config(name)
            .with_push_pull_interval(Duration::from_millis(100))
            .with_merge_policy(MergePolicy::Always)
    })
    .await;

    // Written straight into one replica, so it is never gossiped.
    cluster
        .node(2)
        .store()
        .apply_update(&memberlist_kv::Update::add("hidden", "v"));

    assert!(cluster.wait_for_value("hidden", Some("v")).await);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_periodic_push_pull_join_only_ignores_state() {
    let cluster = TestCluster::start_with(2, |name| {
        fast_config(name).with_push_pull_interval(Duration::from_millis(50))
    })
    .await;

    cluster
        .node(1)
        .store()
        .apply_update(&memberlist_kv::Update::add("hidden", "v"));

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(cluster.node(0).read_local("hidden"), None);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_random_operations_converge() {
    let cluster = TestCluster::start(5).await;
    let mut rng = rand::rng();

    // Every key is written exactly once per phase, so no two updates race.
    let mut keys = Vec::new();
    for i in 0..40 {
        let key = format!("k{}", i);
        let origin = rng.random_range(0..cluster.nodes.len());
        cluster.node(origin).add(key.as_str(), format!("v{}", i)).unwrap();
        keys.push(key);
    }
    assert!(cluster.wait_for_convergence().await, "phase 1 diverged");
    assert_eq!(cluster.snapshot(0).len(), 40);
    // A phase-one relay still in flight could resurrect a phase-two delete.
    assert!(cluster.wait_for_quiet().await);

    keys.shuffle(&mut rng);
    let (deleted, updated) = keys.split_at(15);
    for key in deleted {
        let origin = rng.random_range(0..cluster.nodes.len());
        cluster.node(origin).del(key.as_str()).unwrap();
    }
    for key in &updated[..10] {
        let origin = rng.random_range(0..cluster.nodes.len());
        cluster
            .node(origin)
            .submit_local_change(Action::Add, key.as_str(), "updated")
            .unwrap();
    }
    assert!(cluster.wait_for_convergence().await, "phase 2 diverged");

    let snapshot = cluster.snapshot(0);
    assert_eq!(snapshot.len(), 25);
    for key in deleted {
        assert!(!snapshot.contains_key(key));
    }
    for key in &updated[..10] {
        assert_eq!(snapshot.get(key).map(String::as_str), Some("updated"));
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_rewriting_earlier_value_reaches_every_node() {
    let cluster = TestCluster::start(12).await;

    // The third write encodes the same update as the first.
    for value in ["1", "2", "1"] {
        cluster.node(0).add("x", value).unwrap();
        assert!(
            cluster.wait_for_value("x", Some(value)).await,
            "x={} did not reach every node",
            value
        );
        assert!(cluster.wait_for_quiet().await);
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_convergence_under_packet_loss() {
    let cluster = TestCluster::start_with(4, |name| {
        // Loss can get a node suspected; keep suspicion long enough to refute.
        fast_config(name).with_suspicion_mult(20)
    })
    .await;
    cluster
        .net
        .chaos()
        .set_config(ChaosConfig::new().with_message_loss_rate(0.1));

    for i in 0..10 {
        cluster.node(i % 4).add(format!("lossy-{}", i), "v").unwrap();
    }
    assert!(cluster.wait_for_convergence().await);
    assert_eq!(cluster.snapshot(3).len(), 10);
    assert!(cluster.net.chaos().stats().dropped > 0);

    cluster.net.chaos().disable();
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_convergence_with_latency_and_jitter() {
    let cluster = TestCluster::start_with(4, |name| {
        // Round trips can take up to 30ms; keep probes from timing out.
        fast_config(name)
            .with_probe_timeout(Duration::from_millis(80))
            .with_suspicion_mult(20)
    })
    .await;
    cluster.net.chaos().set_config(
        ChaosConfig::new()
            .with_latency(Duration::from_millis(5))
            .with_jitter(Duration::from_millis(10)),
    );

    // Jitter reorders deliveries, so each key has a single writer.
    for i in 0..12 {
        cluster.node(i % 4).add(format!("slow-{}", i), i.to_string()).unwrap();
    }
    assert!(cluster.wait_for_convergence().await);
    assert_eq!(cluster.snapshot(0).len(), 12);
    assert!(cluster.net.chaos().stats().delayed > 0);
    assert_eq!(cluster.node(3).num_members(), 4);

    cluster.net.chaos().disable();
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_last_write_wins_on_one_origin() {
    let cluster = TestCluster::start(3).await;

    cluster.node(1).add("k", "first").unwrap();
    cluster.node(1).add("k", "second").unwrap();
    // The second write supersedes the first in the queue.
    assert_eq!(cluster.node(1).pending_broadcasts(), 1);
    assert!(cluster.wait_for_value("k", Some("second")).await);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_dead_node_leaves_membership() {
    let cluster = TestCluster::start(3).await;

    cluster.node(2).shutdown().await.unwrap();
    assert!(
        wait_until(
            || cluster.node(0).num_members() == 2 && cluster.node(1).num_members() == 2,
            CONVERGE_TIMEOUT
        )
        .await
    );

    // The survivors keep replicating.
    cluster.node(0).add("after", "1").unwrap();
    assert!(
        wait_until(
            || cluster.node(1).read_local("after").as_deref() == Some("1"),
            CONVERGE_TIMEOUT
        )
        .await
    );

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_graceful_leave() {
    let cluster = TestCluster::start(3).await;

    cluster
        .node(2)
        .leave(Duration::from_secs(2))
        .await
        .unwrap();
    assert!(
        wait_until(
            || cluster.node(0).num_members() == 2 && cluster.node(1).num_members() == 2,
            CONVERGE_TIMEOUT
        )
        .await
    );

    cluster.shutdown().await;
}
