//! A replicated key-value node.
//!
//! [`KvNode`] ties a [`Store`] to a [`Memberlist`]: local changes are applied
//! immediately and gossiped as deltas, peers' deltas are applied as they
//! arrive, and push/pull exchanges carry the full store to repair anything
//! gossip missed.
//!
//! # Example
//!
//! ```ignore
//! use memberlist_kv::{ClusterConfig, JoinStatus, KvNode};
//!
//! let config = ClusterConfig::lan().with_bind_port(7946);
//! let (node, status) = KvNode::start_node(config, &["10.0.0.1:7946"]).await?;
//! if let JoinStatus::Failed(e) = &status {
//!     tracing::warn!("running standalone: {}", e);
//! }
//!
//! node.add("x", "1")?;
//! assert_eq!(node.read_local("x").as_deref(), Some("1"));
//! ```

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::{
    broadcast::TransmitLimitedQueue,
    config::ClusterConfig,
    error::{Error, Result},
    kv::{Action, KvDelegate, Store, Update},
    membership::{ClusterSize, Node},
    memberlist::Memberlist,
    transport::{NetTransport, NetTransportError, Transport},
};

/// Outcome of the initial join performed by [`KvNode::start`].
///
/// A failed join is not fatal: the node keeps serving local reads and writes
/// as a singleton cluster and can [`join`](KvNode::join) later.
#[derive(Debug)]
pub enum JoinStatus {
    /// No seeds were given (or every seed was this node).
    Standalone,
    /// Joined through at least one seed.
    Joined {
        /// Number of seeds that completed the join exchange.
        contacted: usize,
    },
    /// No seed could be contacted.
    Failed(Error),
}

impl JoinStatus {
    /// Whether at least one seed was contacted.
    pub fn is_joined(&self) -> bool {
        matches!(self, JoinStatus::Joined { .. })
    }
}

/// A node of the replicated key-value store.
///
/// Cloning is cheap; clones share the store and the background tasks.
pub struct KvNode<T> {
    memberlist: Memberlist<T, KvDelegate>,
}

impl<T> Clone for KvNode<T> {
    fn clone(&self) -> Self {
        Self {
            memberlist: self.memberlist.clone(),
        }
    }
}

impl<T> std::fmt::Debug for KvNode<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvNode")
            .field("memberlist", &self.memberlist)
            .finish()
    }
}

impl KvNode<NetTransport> {
    /// Bind UDP and TCP on `config.bind_addr`, start the node and join
    /// through `seeds`.
    ///
    /// Seeds are `host:port` strings; a bare host uses the local bind port.
    /// Fails only if the configuration is invalid or the socket cannot be
    /// bound. Seed problems are reported through [`JoinStatus`].
    pub async fn start_node<S: AsRef<str>>(
        config: ClusterConfig,
        seeds: &[S],
    ) -> Result<(Self, JoinStatus)> {
        config.validate()?;

        let transport = NetTransport::bind(config.bind_addr)
            .await
            .map_err(|e| match e {
                NetTransportError::Bind { addr, source } => Error::Bind { addr, source },
                other => Error::Transport(other.to_string()),
            })?;

        let default_port = transport.local_addr().port();
        let resolved = resolve_seeds(seeds, default_port).await;

        if !seeds.is_empty() && resolved.is_empty() {
            let (node, _) = Self::start(config, transport, &[]).await?;
            let err = Error::JoinFailed {
                attempted: seeds.len(),
                reason: "no seed address could be resolved".into(),
            };
            tracing::warn!("{}; running as a singleton cluster", err);
            return Ok((node, JoinStatus::Failed(err)));
        }

        Self::start(config, transport, &resolved).await
    }
}

async fn resolve_seeds<S: AsRef<str>>(seeds: &[S], default_port: u16) -> Vec<SocketAddr> {
    let mut resolved = Vec::with_capacity(seeds.len());
    for seed in seeds {
        let seed = seed.as_ref().trim();
        if seed.is_empty() {
            continue;
        }
        let addrs = match tokio::net::lookup_host(seed).await {
            Ok(addrs) => Ok(addrs.collect::<Vec<_>>()),
            Err(_) => tokio::net::lookup_host((seed, default_port))
                .await
                .map(|addrs| addrs.collect::<Vec<_>>()),
        };
        match addrs {
            Ok(addrs) => {
                tracing::debug!(seed, ?addrs, "resolved seed");
                resolved.extend(addrs);
            }
            Err(e) => tracing::warn!(seed, "failed to resolve seed: {}", e),
        }
    }
    resolved.dedup();
    resolved
}

impl<T: Transport> KvNode<T> {
    /// Start a node over `transport` and join through `seeds`.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn start(
        config: ClusterConfig,
        transport: T,
        seeds: &[SocketAddr],
    ) -> Result<(Self, JoinStatus)> {
        let size = ClusterSize::new();
        let queue_size = size.clone();
        let broadcasts = Arc::new(TransmitLimitedQueue::new(config.retransmit_mult, move || {
            queue_size.get()
        }));
        let delegate = KvDelegate::new(Arc::new(Store::new()), broadcasts, config.merge_policy)
            .with_max_payload(config.max_user_payload());

        let memberlist = Memberlist::create_with_size(config, transport, delegate, size)?;
        let node = Self { memberlist };

        if seeds.is_empty() {
            return Ok((node, JoinStatus::Standalone));
        }

        let status = match node.join(seeds).await {
            Ok(0) => JoinStatus::Standalone,
            Ok(contacted) => JoinStatus::Joined { contacted },
            Err(e) => {
                tracing::warn!("initial join failed, running as a singleton cluster: {}", e);
                JoinStatus::Failed(e)
            }
        };
        Ok((node, status))
    }

    /// Apply a change locally and queue it for gossip.
    ///
    /// Returns once the change is visible to [`read_local`](Self::read_local);
    /// it does not wait for the change to reach any peer. For
    /// [`Action::Del`] the value is ignored. A change whose encoding does not
    /// fit in one gossip packet is rejected with [`Error::MessageTooLarge`]
    /// and not applied.
    pub fn submit_local_change(
        &self,
        action: Action,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<()> {
        self.submit(action, key.into(), value.into(), None)
    }

    /// Like [`submit_local_change`](Self::submit_local_change), also returning
    /// a receiver that is closed once the change has been gossiped as often as
    /// the retransmit limit allows (or was superseded by a newer change).
    pub fn submit_local_change_notify(
        &self,
        action: Action,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<async_channel::Receiver<()>> {
        let (tx, rx) = async_channel::bounded(1);
        self.submit(action, key.into(), value.into(), Some(tx))?;
        Ok(rx)
    }

    fn submit(
        &self,
        action: Action,
        key: String,
        value: String,
        notify: Option<async_channel::Sender<()>>,
    ) -> Result<()> {
        let update = match action {
            Action::Add => Update::add(key, value),
            Action::Del => Update::del(key),
            Action::Unknown => {
                return Err(Error::Encode(format!("cannot submit {} action", action)));
            }
        };

        self.delegate().submit_local(vec![update], notify)?;
        tracing::trace!(%action, "applied local change");

        #[cfg(feature = "metrics")]
        crate::metrics::set_store_keys(self.store().len());

        Ok(())
    }

    /// Set `key` to `value`.
    pub fn add(&self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        self.submit_local_change(Action::Add, key, value)
    }

    /// Remove `key`.
    pub fn del(&self, key: impl Into<String>) -> Result<()> {
        self.submit_local_change(Action::Del, key, "")
    }

    /// Read `key` from the local replica. Never touches the network.
    pub fn read_local(&self, key: &str) -> Option<String> {
        self.store().get(key)
    }

    /// Sorted copy of the local replica.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.store().snapshot()
    }

    /// Run one anti-entropy exchange with `addr`.
    ///
    /// The exchange is flagged as a join, so both sides merge each other's
    /// store whatever their [`MergePolicy`](crate::MergePolicy).
    pub async fn sync_with(&self, addr: SocketAddr) -> Result<()> {
        self.memberlist.push_pull_node(addr, true).await
    }

    /// Join a cluster through `seeds`. Returns the number of seeds contacted.
    pub async fn join(&self, seeds: &[SocketAddr]) -> Result<usize> {
        self.memberlist.join(seeds).await
    }

    /// Announce departure and wait up to `timeout` for it to be gossiped.
    pub async fn leave(&self, timeout: Duration) -> Result<()> {
        self.memberlist.leave(timeout).await
    }

    /// Stop background tasks and close the transport.
    pub async fn shutdown(&self) -> Result<()> {
        self.memberlist.shutdown().await
    }

    /// Address announced to peers.
    pub fn local_addr(&self) -> SocketAddr {
        self.memberlist.advertise_addr()
    }

    /// Local node name.
    pub fn local_name(&self) -> &str {
        self.memberlist.local_name()
    }

    /// Number of non-dead members, including this node.
    pub fn num_members(&self) -> usize {
        self.memberlist.num_members()
    }

    /// Non-dead members, including this node.
    pub fn members(&self) -> Vec<Node> {
        self.memberlist.members()
    }

    /// Store broadcasts waiting to be gossiped.
    pub fn pending_broadcasts(&self) -> usize {
        self.delegate().num_queued()
    }

    /// The local replica.
    pub fn store(&self) -> &Arc<Store> {
        self.delegate().store()
    }

    /// The membership layer.
    pub fn memberlist(&self) -> &Memberlist<T, KvDelegate> {
        &self.memberlist
    }

    fn delegate(&self) -> &KvDelegate {
        self.memberlist.delegate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryNetwork, MemoryTransport};

    fn test_config(name: &str) -> ClusterConfig {
        ClusterConfig::local()
            .with_name(name)
            .with_probe_interval(Duration::from_millis(100))
            .with_probe_timeout(Duration::from_millis(30))
            .with_gossip_interval(Duration::from_millis(20))
            .with_push_pull_interval(Duration::ZERO)
    }

    async fn start(
        net: &MemoryNetwork,
        name: &str,
        seeds: &[SocketAddr],
    ) -> (KvNode<MemoryTransport>, JoinStatus) {
        KvNode::start(test_config(name), net.bind(), seeds)
            .await
            .unwrap()
    }

    async fn wait_for(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    #[tokio::test]
    async fn test_standalone_reads_own_writes() {
        let net = MemoryNetwork::new();
        let (node, status) = start(&net, "a", &[]).await;
        assert!(matches!(status, JoinStatus::Standalone));

        node.add("x", "1").unwrap();
        assert_eq!(node.read_local("x").as_deref(), Some("1"));
        assert_eq!(node.pending_broadcasts(), 1);

        node.del("x").unwrap();
        assert_eq!(node.read_local("x"), None);
        // The delete supersedes the queued add.
        assert_eq!(node.pending_broadcasts(), 1);

        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_action_rejected() {
        let net = MemoryNetwork::new();
        let (node, _) = start(&net, "a", &[]).await;
        let result = node.submit_local_change(Action::Unknown, "x", "1");
        assert!(matches!(result, Err(Error::Encode(_))));
        assert!(node.store().is_empty());
        assert_eq!(node.pending_broadcasts(), 0);
    }

    #[tokio::test]
    async fn test_oversize_change_rejected() {
        let net = MemoryNetwork::new();
        let (a, _) = start(&net, "a", &[]).await;
        let (b, _) = start(&net, "b", &[a.local_addr()]).await;

        let result = a.add("big", "v".repeat(2000));
        assert!(matches!(
            result,
            Err(Error::MessageTooLarge { size, max_size }) if size > max_size
        ));
        assert_eq!(a.read_local("big"), None);
        assert_eq!(a.pending_broadcasts(), 0);

        a.add("big", "v".repeat(1000)).unwrap();
        assert!(wait_for(|| b.read_local("big").map(|v| v.len()) == Some(1000)).await);
        assert!(wait_for(|| a.pending_broadcasts() == 0).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writes_reach_peer() {
        let net = MemoryNetwork::new();
        let (a, _) = start(&net, "a", &[]).await;
        let (b, _) = start(&net, "b", &[a.local_addr()]).await;

        let writers: Vec<_> = (0..4)
            .map(|t| {
                let a = a.clone();
                tokio::task::spawn_blocking(move || {
                    for i in 0..25 {
                        a.add("x", format!("{}-{}", t, i)).unwrap();
                    }
                })
            })
            .collect();
        for w in writers {
            w.await.unwrap();
        }

        let expected = a.read_local("x");
        assert!(expected.is_some());
        assert!(wait_for(|| b.read_local("x") == expected).await);
    }

    #[tokio::test]
    async fn test_failed_join_keeps_serving() {
        let net = MemoryNetwork::new();
        let (node, status) = start(&net, "a", &["127.0.0.1:1".parse().unwrap()]).await;
        assert!(matches!(
            status,
            JoinStatus::Failed(Error::JoinFailed { attempted: 1, .. })
        ));

        node.add("x", "1").unwrap();
        assert_eq!(node.read_local("x").as_deref(), Some("1"));
        assert_eq!(node.num_members(), 1);
    }

    #[tokio::test]
    async fn test_joining_self_is_standalone() {
        let net = MemoryNetwork::new();
        let transport = net.bind();
        let own = transport.local_addr();
        let (_node, status) = KvNode::start(test_config("a"), transport, &[own])
            .await
            .unwrap();
        assert!(matches!(status, JoinStatus::Standalone));
    }

    #[tokio::test]
    async fn test_change_propagates() {
        let net = MemoryNetwork::new();
        let (a, _) = start(&net, "a", &[]).await;
        let (b, status) = start(&net, "b", &[a.local_addr()]).await;
        assert!(status.is_joined());

        a.add("x", "1").unwrap();
        assert!(wait_for(|| b.read_local("x").as_deref() == Some("1")).await);

        b.del("x").unwrap();
        assert!(wait_for(|| a.read_local("x").is_none()).await);
    }

    #[tokio::test]
    async fn test_join_pulls_existing_state() {
        let net = MemoryNetwork::new();
        let (a, _) = start(&net, "a", &[]).await;
        a.add("x", "1").unwrap();

        let (d, status) = start(&net, "d", &[a.local_addr()]).await;
        assert!(status.is_joined());
        // Merged during the join exchange, before any gossip round.
        assert_eq!(d.read_local("x").as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_notify_closes_after_gossip() {
        let net = MemoryNetwork::new();
        let (a, _) = start(&net, "a", &[]).await;
        let (_b, _) = start(&net, "b", &[a.local_addr()]).await;

        let done = a.submit_local_change_notify(Action::Add, "x", "1").unwrap();
        let closed = tokio::time::timeout(Duration::from_secs(2), done.recv()).await;
        assert!(matches!(closed, Ok(Err(_))));
        assert_eq!(a.pending_broadcasts(), 0);
    }

    #[tokio::test]
    async fn test_start_node_binds_loopback() {
        let config = ClusterConfig::local().with_name("net-a");
        let (node, status) = KvNode::start_node(config, &[] as &[&str]).await.unwrap();
        assert!(matches!(status, JoinStatus::Standalone));
        assert!(node.local_addr().ip().is_loopback());
        assert_ne!(node.local_addr().port(), 0);
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_node_bind_failure() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();
        let config = ClusterConfig::local().with_bind_addr(addr);
        let result = KvNode::start_node(config, &[] as &[&str]).await;
        assert!(matches!(result, Err(Error::Bind { .. })));
    }

    #[tokio::test]
    async fn test_start_node_unresolvable_seed() {
        let config = ClusterConfig::local().with_name("net-b");
        let (node, status) = KvNode::start_node(config, &["seed.invalid:7946"])
            .await
            .unwrap();
        assert!(matches!(status, JoinStatus::Failed(Error::JoinFailed { .. })));
        node.add("k", "v").unwrap();
        assert_eq!(node.read_local("k").as_deref(), Some("v"));
        node.shutdown().await.unwrap();
    }
}
