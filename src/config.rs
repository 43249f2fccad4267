//! Configuration for cluster membership, gossip and anti-entropy.

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::message::{COMPOUND_HEADER_OVERHEAD, COMPOUND_PART_OVERHEAD, USER_MSG_OVERHEAD};

/// Controls whether periodic (non-join) push/pull exchanges merge key-value state.
///
/// Membership state is always merged. Join-time exchanges always merge
/// key-value state regardless of this policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum MergePolicy {
    /// Only merge remote key-value state during the join exchange.
    #[default]
    JoinOnly,
    /// Merge remote key-value state on every push/pull exchange.
    Always,
}

/// Configuration options for a cluster node.
///
/// The defaults match a LAN deployment. Use [`ClusterConfig::wan`] for
/// high-latency links and [`ClusterConfig::local`] for loopback clusters.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ClusterConfig {
    /// Unique logical name of this node.
    ///
    /// Default: `node-<uuid v4>`
    pub name: String,

    /// Address to bind the gossip transport to (UDP and TCP on the same port).
    ///
    /// Default: 0.0.0.0:7946
    pub bind_addr: SocketAddr,

    /// Address advertised to other nodes.
    ///
    /// Default: None (use the transport's bound address)
    pub advertise_addr: Option<SocketAddr>,

    /// Interval between failure-detector probes.
    ///
    /// Default: 1s
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde_impl"))]
    pub probe_interval: Duration,

    /// How long to wait for a direct ack before asking other nodes to probe.
    ///
    /// Must be shorter than `probe_interval`.
    ///
    /// Default: 500ms
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde_impl"))]
    pub probe_timeout: Duration,

    /// Number of nodes asked to relay a probe when the direct probe fails.
    ///
    /// Default: 3
    pub indirect_checks: usize,

    /// Multiplier for the suspicion timeout.
    ///
    /// A suspected node is declared dead after
    /// `suspicion_mult * max(1, log10(n)) * probe_interval`.
    ///
    /// Default: 4
    pub suspicion_mult: u32,

    /// How long dead nodes are retained in the membership table.
    ///
    /// Retained dead nodes keep receiving gossip so they can refute.
    ///
    /// Default: 30s
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde_impl"))]
    pub dead_node_retention: Duration,

    /// Interval between gossip rounds.
    ///
    /// Default: 200ms
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde_impl"))]
    pub gossip_interval: Duration,

    /// Number of random nodes contacted per gossip round.
    ///
    /// Default: 3
    pub gossip_nodes: usize,

    /// Retransmit multiplier for queued broadcasts.
    ///
    /// Each broadcast is sent at most
    /// `ceil(retransmit_mult * ln(n + 1))` times.
    ///
    /// Default: 4
    pub retransmit_mult: usize,

    /// Interval between periodic push/pull exchanges.
    ///
    /// Set to `Duration::ZERO` to only exchange state at join time.
    ///
    /// Default: 30s
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde_impl"))]
    pub push_pull_interval: Duration,

    /// Overall timeout for a push/pull exchange.
    ///
    /// Default: 10s
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde_impl"))]
    pub push_pull_timeout: Duration,

    /// Bytes per packet available to a message and its piggybacked broadcasts.
    ///
    /// Default: 1400
    pub packet_budget: usize,

    /// Whether periodic push/pull exchanges merge key-value state.
    ///
    /// Default: [`MergePolicy::JoinOnly`]
    pub merge_policy: MergePolicy,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self::lan()
    }
}

/// Default gossip port.
pub const DEFAULT_PORT: u16 = 7946;

/// Smallest packet budget that still fits a probe and its compound header.
pub const MIN_PACKET_BUDGET: usize = 512;

fn default_name() -> String {
    format!("node-{}", uuid::Uuid::new_v4())
}

impl ClusterConfig {
    /// Create a new configuration with default (LAN) values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration tuned for a LAN.
    pub fn lan() -> Self {
        Self {
            name: default_name(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            advertise_addr: None,
            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(500),
            indirect_checks: 3,
            suspicion_mult: 4,
            dead_node_retention: Duration::from_secs(30),
            gossip_interval: Duration::from_millis(200),
            gossip_nodes: 3,
            retransmit_mult: 4,
            push_pull_interval: Duration::from_secs(30),
            push_pull_timeout: Duration::from_secs(10),
            packet_budget: 1400,
            merge_policy: MergePolicy::JoinOnly,
        }
    }

    /// Configuration tuned for a WAN.
    ///
    /// - Longer probe timeouts
    /// - More conservative suspicion
    /// - Less frequent push/pull
    pub fn wan() -> Self {
        Self {
            probe_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(3),
            suspicion_mult: 6,
            gossip_interval: Duration::from_millis(500),
            gossip_nodes: 4,
            push_pull_interval: Duration::from_secs(60),
            push_pull_timeout: Duration::from_secs(30),
            ..Self::lan()
        }
    }

    /// Configuration tuned for nodes on the same host (loopback).
    pub fn local() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            probe_timeout: Duration::from_millis(200),
            suspicion_mult: 3,
            gossip_interval: Duration::from_millis(100),
            retransmit_mult: 3,
            push_pull_interval: Duration::from_secs(15),
            push_pull_timeout: Duration::from_secs(1),
            ..Self::lan()
        }
    }

    /// Check the configuration for values the node cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("node name must not be empty".into()));
        }
        if self.name.len() > u16::MAX as usize {
            return Err(Error::Config("node name is too long".into()));
        }
        if self.probe_interval.is_zero() || self.gossip_interval.is_zero() {
            return Err(Error::Config(
                "probe_interval and gossip_interval must be non-zero".into(),
            ));
        }
        if self.probe_timeout >= self.probe_interval {
            return Err(Error::Config(format!(
                "probe_timeout ({:?}) must be shorter than probe_interval ({:?})",
                self.probe_timeout, self.probe_interval
            )));
        }
        if self.push_pull_timeout.is_zero() {
            return Err(Error::Config("push_pull_timeout must be non-zero".into()));
        }
        if self.packet_budget < MIN_PACKET_BUDGET {
            return Err(Error::Config(format!(
                "packet_budget must be at least {} bytes",
                MIN_PACKET_BUDGET
            )));
        }
        Ok(())
    }

    /// Set the node name (builder pattern).
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the bind address (builder pattern).
    pub const fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the bind port, keeping the bind IP (builder pattern).
    pub fn with_bind_port(mut self, port: u16) -> Self {
        self.bind_addr.set_port(port);
        self
    }

    /// Set the advertise address (builder pattern).
    pub const fn with_advertise_addr(mut self, addr: SocketAddr) -> Self {
        self.advertise_addr = Some(addr);
        self
    }

    /// Set the probe interval (builder pattern).
    pub const fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    /// Set the probe timeout (builder pattern).
    pub const fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Set the number of indirect probes (builder pattern).
    pub const fn with_indirect_checks(mut self, checks: usize) -> Self {
        self.indirect_checks = checks;
        self
    }

    /// Set the suspicion multiplier (builder pattern).
    pub const fn with_suspicion_mult(mut self, mult: u32) -> Self {
        self.suspicion_mult = mult;
        self
    }

    /// Set the dead node retention window (builder pattern).
    pub const fn with_dead_node_retention(mut self, retention: Duration) -> Self {
        self.dead_node_retention = retention;
        self
    }

    /// Set the gossip interval (builder pattern).
    pub const fn with_gossip_interval(mut self, interval: Duration) -> Self {
        self.gossip_interval = interval;
        self
    }

    /// Set the gossip fanout (builder pattern).
    pub const fn with_gossip_nodes(mut self, nodes: usize) -> Self {
        self.gossip_nodes = nodes;
        self
    }

    /// Set the retransmit multiplier (builder pattern).
    pub const fn with_retransmit_mult(mut self, mult: usize) -> Self {
        self.retransmit_mult = mult;
        self
    }

    /// Set the push/pull interval (builder pattern).
    ///
    /// `Duration::ZERO` disables periodic exchanges.
    pub const fn with_push_pull_interval(mut self, interval: Duration) -> Self {
        self.push_pull_interval = interval;
        self
    }

    /// Set the push/pull timeout (builder pattern).
    pub const fn with_push_pull_timeout(mut self, timeout: Duration) -> Self {
        self.push_pull_timeout = timeout;
        self
    }

    /// Set the packet budget (builder pattern).
    pub const fn with_packet_budget(mut self, budget: usize) -> Self {
        self.packet_budget = budget;
        self
    }

    /// Set the merge policy for periodic exchanges (builder pattern).
    pub const fn with_merge_policy(mut self, policy: MergePolicy) -> Self {
        self.merge_policy = policy;
        self
    }

    /// Suspicion timeout for a cluster of `n` nodes.
    pub fn suspicion_timeout(&self, n: usize) -> Duration {
        let scale = (n.max(1) as f64).log10().max(1.0);
        self.probe_interval
            .mul_f64(self.suspicion_mult as f64 * scale)
    }

    /// Largest delegate payload that fits in one gossip packet on its own.
    pub const fn max_user_payload(&self) -> usize {
        self.packet_budget
            .saturating_sub(COMPOUND_HEADER_OVERHEAD + COMPOUND_PART_OVERHEAD + USER_MSG_OVERHEAD)
    }
}

#[cfg(feature = "serde")]
mod humantime_serde_impl {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        } else {
            serializer.serialize_u64(duration.as_millis() as u64)
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            let ms: u64 = s
                .trim_end_matches("ms")
                .parse()
                .map_err(serde::de::Error::custom)?;
            Ok(Duration::from_millis(ms))
        } else {
            let ms = u64::deserialize(deserializer)?;
            Ok(Duration::from_millis(ms))
        }
    }
}
