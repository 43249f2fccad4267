//! Shared helpers for memberlist-kv integration tests.
//!
//! Builds in-process clusters on a [`MemoryNetwork`] so tests run without
//! real sockets and can inject loss and partitions.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use memberlist_kv::testing::wait_until;
use memberlist_kv::{ClusterConfig, JoinStatus, KvNode, MemoryNetwork, MemoryTransport};

/// How long convergence checks wait before failing.
pub const CONVERGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Fast timings for in-process clusters.
pub fn fast_config(name: &str) -> ClusterConfig {
    ClusterConfig::local()
        .with_name(name)
        .with_probe_interval(Duration::from_millis(100))
        .with_probe_timeout(Duration::from_millis(30))
        .with_gossip_interval(Duration::from_millis(20))
        .with_suspicion_mult(2)
        .with_push_pull_interval(Duration::ZERO)
}

/// A cluster of [`KvNode`]s sharing one in-memory network.
pub struct TestCluster {
    pub net: MemoryNetwork,
    pub nodes: Vec<KvNode<MemoryTransport>>,
}

impl TestCluster {
    /// Start `n` nodes with [`fast_config`]; every node joins through the
    /// first one.
    pub async fn start(n: usize) -> Self {
        Self::start_with(n, fast_config).await
    }

    /// Start `n` nodes, building each config with `config(name)`.
    pub async fn start_with(n: usize, config: impl Fn(&str) -> ClusterConfig) -> Self {
        let mut cluster = Self {
            net: MemoryNetwork::new(),
            nodes: Vec::with_capacity(n),
        };
        for i in 0..n {
            cluster.add_node(config(&format!("node-{}", i))).await;
        }
        assert!(
            cluster.wait_for_members(n).await,
            "cluster of {} did not form",
            n
        );
        cluster
    }

    /// Start one more node joining through the first node.
    pub async fn add_node(&mut self, config: ClusterConfig) -> JoinStatus {
        let seeds: Vec<SocketAddr> = self.nodes.first().map(|n| n.local_addr()).into_iter().collect();
        let (node, status) = KvNode::start(config, self.net.bind(), &seeds)
            .await
            .expect("start node");
        self.nodes.push(node);
        status
    }

    pub fn node(&self, i: usize) -> &KvNode<MemoryTransport> {
        &self.nodes[i]
    }

    pub fn addr(&self, i: usize) -> SocketAddr {
        self.nodes[i].local_addr()
    }

    /// Wait until every node sees `n` members.
    pub async fn wait_for_members(&self, n: usize) -> bool {
        wait_until(
            || self.nodes.iter().all(|node| node.num_members() == n),
            CONVERGE_TIMEOUT,
        )
        .await
    }

    /// Wait until every node reads `expected` for `key`.
    pub async fn wait_for_value(&self, key: &str, expected: Option<&str>) -> bool {
        wait_until(
            || {
                self.nodes
                    .iter()
                    .all(|node| node.read_local(key).as_deref() == expected)
            },
            CONVERGE_TIMEOUT,
        )
        .await
    }

    /// Wait until no node has store broadcasts left to gossip.
    pub async fn wait_for_quiet(&self) -> bool {
        wait_until(
            || self.nodes.iter().all(|node| node.pending_broadcasts() == 0),
            CONVERGE_TIMEOUT,
        )
        .await
    }

    /// Wait until every node holds the same mapping.
    pub async fn wait_for_convergence(&self) -> bool {
        wait_until(|| self.converged(), CONVERGE_TIMEOUT).await
    }

    /// Whether every node holds the same mapping.
    pub fn converged(&self) -> bool {
        let mut snapshots = self.nodes.iter().map(|n| n.snapshot());
        let Some(first) = snapshots.next() else {
            return true;
        };
        snapshots.all(|s| s == first)
    }

    pub fn snapshot(&self, i: usize) -> BTreeMap<String, String> {
        self.nodes[i].snapshot()
    }

    pub async fn shutdown(&self) {
        for node in &self.nodes {
            let _ = node.shutdown().await;
        }
    }
}
