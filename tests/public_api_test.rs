//! Public API contract tests.
//!
//! These check that the public surface stays available and that the wire
//! formats peers depend on stay stable.

use std::time::Duration;

use bytes::Bytes;
use memberlist_kv::kv::{encode_delta, DATA_TAG};
use memberlist_kv::*;

// =============================================================================
// Configuration API
// =============================================================================

#[test]
fn test_config_presets_validate() {
    ClusterConfig::default().validate().unwrap();
    ClusterConfig::lan().validate().unwrap();
    ClusterConfig::wan().validate().unwrap();
    ClusterConfig::local().validate().unwrap();
}

#[test]
fn test_config_builder_methods() {
    let config = ClusterConfig::lan()
        .with_name("api")
        .with_bind_port(9000)
        .with_retransmit_mult(5)
        .with_gossip_nodes(4)
        .with_push_pull_interval(Duration::ZERO)
        .with_merge_policy(MergePolicy::Always);

    assert_eq!(config.name, "api");
    assert_eq!(config.bind_addr.port(), 9000);
    assert_eq!(config.retransmit_mult, 5);
    assert_eq!(config.gossip_nodes, 4);
    assert!(config.push_pull_interval.is_zero());
    assert_eq!(config.merge_policy, MergePolicy::Always);
}

#[test]
fn test_default_names_are_unique() {
    assert_ne!(ClusterConfig::lan().name, ClusterConfig::lan().name);
}

#[test]
fn test_default_merge_policy_is_join_only() {
    assert_eq!(ClusterConfig::default().merge_policy, MergePolicy::JoinOnly);
}

// =============================================================================
// Error API
// =============================================================================

#[test]
fn test_error_display() {
    let err = Error::JoinFailed {
        attempted: 2,
        reason: "connection refused".into(),
    };
    let msg = err.to_string();
    assert!(msg.contains('2'));
    assert!(msg.contains("connection refused"));

    let err = Error::Timeout {
        operation: "push/pull",
        after: Duration::from_secs(1),
    };
    assert!(err.to_string().contains("push/pull"));
}

// =============================================================================
// Wire formats
// =============================================================================

#[test]
fn test_gossip_payload_format() {
    let mut data = std::collections::BTreeMap::new();
    data.insert("x".to_string(), "1".to_string());
    let bytes = encode_delta(Action::Add, data).unwrap();
    assert_eq!(bytes[0], DATA_TAG);
    assert_eq!(&bytes[..], br#"d[{"Action":"add","Data":{"x":"1"}}]"#);
}

#[test]
fn test_anti_entropy_payload_format() {
    let store = Store::new();
    assert_eq!(&store.local_state().unwrap()[..], b"{}");

    store.apply_update(&Update::add("k", "v"));
    assert_eq!(&store.local_state().unwrap()[..], br#"{"k":"v"}"#);

    // An empty payload is "nothing to merge".
    assert_eq!(store.merge_remote_state(b"").unwrap(), 0);
}

// =============================================================================
// Broadcast queue
// =============================================================================

struct Counted(Bytes);

impl Broadcast for Counted {
    fn invalidates(&self, _other: &Self) -> bool {
        false
    }

    fn message(&self) -> &Bytes {
        &self.0
    }
}

#[test]
fn test_retransmit_bound() {
    for (members, mult) in [(1usize, 4usize), (1, 3), (3, 3), (9, 4), (10, 4), (120, 2)] {
        let bound = (mult as f64 * ((members + 1) as f64).ln()).ceil() as usize;
        let queue = TransmitLimitedQueue::new(mult, move || members);
        queue.queue_broadcast(Counted(Bytes::from_static(b"payload")));

        let mut sent = 0;
        while !queue.get_broadcasts(0, 1024).is_empty() {
            sent += 1;
            assert!(sent <= 1000, "queue never retired the broadcast");
        }
        assert!(sent <= bound, "{} members, mult {}: sent {} > {}", members, mult, sent, bound);
        assert_eq!(sent, retransmit_limit(mult, members));
        assert_eq!(queue.num_queued(), 0);
    }

    assert_eq!(retransmit_limit(4, 1), 3);
    assert_eq!(retransmit_limit(3, 9), 7);
    assert_eq!(retransmit_limit(4, 10), 10);
    assert_eq!(retransmit_limit(2, 120), 10);
}

#[test]
fn test_kv_broadcast_supersedes_same_key() {
    let queue = TransmitLimitedQueue::new(3, || 3);
    queue.queue_broadcast(KvBroadcast::new(vec![Update::add("x", "1")]).unwrap());
    queue.queue_broadcast(KvBroadcast::new(vec![Update::add("y", "1")]).unwrap());
    queue.queue_broadcast(KvBroadcast::new(vec![Update::del("x")]).unwrap());
    assert_eq!(queue.num_queued(), 2);
}

// =============================================================================
// Node API
// =============================================================================

#[tokio::test]
async fn test_node_surface() {
    let net = MemoryNetwork::new();
    let (node, status) = KvNode::start(ClusterConfig::local().with_name("api"), net.bind(), &[])
        .await
        .unwrap();
    assert!(matches!(status, JoinStatus::Standalone));
    assert!(!status.is_joined());

    assert_eq!(node.local_name(), "api");
    assert_eq!(node.num_members(), 1);
    assert_eq!(node.members().len(), 1);
    assert_eq!(node.members()[0].state, NodeState::Alive);

    node.submit_local_change(Action::Add, "k", "v").unwrap();
    assert_eq!(node.read_local("k").as_deref(), Some("v"));
    assert_eq!(node.snapshot().len(), 1);
    assert_eq!(node.pending_broadcasts(), 1);
    assert!(!node.memberlist().is_shutdown());

    node.shutdown().await.unwrap();
    assert!(node.memberlist().is_shutdown());
    // Shutdown is idempotent.
    node.shutdown().await.unwrap();
}
