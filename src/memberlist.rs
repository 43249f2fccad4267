//! SWIM-style cluster membership with piggybacked gossip and push/pull
//! anti-entropy.
//!
//! A [`Memberlist`] owns the membership [`Directory`], the queue of pending
//! membership updates and the background tasks that drive the protocol:
//!
//! - **Probe loop**: every `probe_interval`, ping the next node in a shuffled
//!   round-robin. Without an ack within `probe_timeout`, ask
//!   `indirect_checks` other nodes to ping it. Without any ack by the end of
//!   the interval, suspect it. Suspects that do not refute in time die, and
//!   dead nodes are forgotten after `dead_node_retention`.
//! - **Gossip loop**: every `gossip_interval`, send pending broadcasts to
//!   `gossip_nodes` random nodes.
//! - **Push/pull loop**: every `push_pull_interval`, exchange full state with
//!   one random node over a reliable stream.
//!
//! Every outgoing packet carries as many pending broadcasts (membership
//! first, then the delegate's) as fit in `packet_budget`.

use bytes::Bytes;
use futures::channel::oneshot;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use crate::{
    broadcast::{MemberBroadcast, TransmitLimitedQueue},
    config::ClusterConfig,
    delegate::{Delegate, NoopDelegate},
    error::{Error, Result},
    membership::{
        AliveOutcome, ClusterSize, DeadOutcome, Directory, Node, NodeState, SuspectOutcome,
    },
    message::{
        Ack, Alive, Dead, IndirectPing, Message, Ping, PushNodeState, PushPull, Suspect,
        COMPOUND_HEADER_OVERHEAD, COMPOUND_PART_OVERHEAD, USER_MSG_OVERHEAD,
    },
    transport::{Packet, StreamRequest, Transport},
};

#[cfg(feature = "metrics")]
use crate::metrics;

/// Cluster membership handle.
///
/// Cloning is cheap; all clones share the same state and background tasks.
pub struct Memberlist<T, D = NoopDelegate> {
    inner: Arc<Inner<T, D>>,
}

struct Inner<T, D> {
    config: ClusterConfig,
    transport: T,
    delegate: D,
    advertise: SocketAddr,
    local_name: String,
    directory: RwLock<Directory>,
    size: ClusterSize,
    broadcasts: TransmitLimitedQueue<MemberBroadcast>,
    ack_handlers: Mutex<HashMap<u32, oneshot::Sender<()>>>,
    seq: AtomicU32,
    leaving: AtomicBool,
    shutdown: AtomicBool,
    shutdown_tx: async_channel::Sender<()>,
    shutdown_rx: async_channel::Receiver<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T, D> Clone for Memberlist<T, D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, D> std::fmt::Debug for Memberlist<T, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memberlist")
            .field("name", &self.inner.local_name)
            .field("advertise", &self.inner.advertise)
            .field("members", &self.inner.size.get())
            .finish()
    }
}

/// Resolve the address announced to peers.
///
/// Peers cannot dial an unspecified address, so it is replaced by loopback.
fn advertise_addr(config: &ClusterConfig, bound: SocketAddr) -> SocketAddr {
    let mut addr = config.advertise_addr.unwrap_or(bound);
    if addr.ip().is_unspecified() {
        let loopback = if addr.is_ipv4() {
            Ipv4Addr::LOCALHOST.into()
        } else {
            Ipv6Addr::LOCALHOST.into()
        };
        tracing::warn!(
            bound = %addr,
            "advertise address is unspecified, announcing loopback; set advertise_addr for multi-host clusters"
        );
        addr.set_ip(loopback);
    }
    addr
}

impl<T, D> Memberlist<T, D>
where
    T: Transport,
    D: Delegate,
{
    /// Create a memberlist and start its background tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn create(config: ClusterConfig, transport: T, delegate: D) -> Result<Self> {
        Self::create_with_size(config, transport, delegate, ClusterSize::new())
    }

    /// Create a memberlist that publishes its member count to `size`.
    ///
    /// Lets queues built before the memberlist (such as the delegate's) size
    /// their retransmit limit from the live member count.
    pub fn create_with_size(
        config: ClusterConfig,
        transport: T,
        delegate: D,
        size: ClusterSize,
    ) -> Result<Self> {
        config.validate()?;

        let advertise = advertise_addr(&config, transport.local_addr());
        let local_name = config.name.clone();
        let directory = Directory::new(Node::new(local_name.clone(), advertise), size.clone());

        let queue_size = size.clone();
        let broadcasts =
            TransmitLimitedQueue::new(config.retransmit_mult, move || queue_size.get());

        let (shutdown_tx, shutdown_rx) = async_channel::bounded(1);

        let memberlist = Self {
            inner: Arc::new(Inner {
                config,
                transport,
                delegate,
                advertise,
                local_name,
                directory: RwLock::new(directory),
                size,
                broadcasts,
                ack_handlers: Mutex::new(HashMap::new()),
                seq: AtomicU32::new(0),
                leaving: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                shutdown_tx,
                shutdown_rx,
                tasks: Mutex::new(Vec::new()),
            }),
        };

        memberlist.announce_alive(0);
        memberlist.start_tasks();

        tracing::info!(
            name = %memberlist.inner.local_name,
            addr = %advertise,
            "memberlist started"
        );

        Ok(memberlist)
    }

    fn start_tasks(&self) {
        let mut tasks = Vec::with_capacity(5);

        let this = self.clone();
        tasks.push(tokio::spawn(async move { this.run_packet_handler().await }));

        let this = self.clone();
        tasks.push(tokio::spawn(async move { this.run_stream_handler().await }));

        let this = self.clone();
        tasks.push(tokio::spawn(async move { this.run_probe_loop().await }));

        let this = self.clone();
        tasks.push(tokio::spawn(async move { this.run_gossip_loop().await }));

        if !self.inner.config.push_pull_interval.is_zero() {
            let this = self.clone();
            tasks.push(tokio::spawn(async move { this.run_push_pull_loop().await }));
        }

        *self.inner.tasks.lock() = tasks;
    }

    /// Local node name.
    pub fn local_name(&self) -> &str {
        &self.inner.local_name
    }

    /// Address announced to peers.
    pub fn advertise_addr(&self) -> SocketAddr {
        self.inner.advertise
    }

    /// Snapshot of the local node.
    pub fn local_node(&self) -> Node {
        let local = self.inner.directory.read().local_node();
        local.unwrap_or_else(|| Node::new(self.inner.local_name.clone(), self.inner.advertise))
    }

    /// Number of non-dead members, including the local node.
    pub fn num_members(&self) -> usize {
        self.inner.directory.read().num_members()
    }

    /// All non-dead members, including the local node.
    pub fn members(&self) -> Vec<Node> {
        self.inner.directory.read().members()
    }

    /// Shared member count handle.
    pub fn cluster_size(&self) -> ClusterSize {
        self.inner.size.clone()
    }

    /// Configuration in use.
    pub fn config(&self) -> &ClusterConfig {
        &self.inner.config
    }

    /// The application delegate.
    pub fn delegate(&self) -> &D {
        &self.inner.delegate
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    /// Number of membership updates waiting to be gossiped.
    pub fn num_queued_broadcasts(&self) -> usize {
        self.inner.broadcasts.num_queued()
    }

    /// Check if shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Join a cluster by exchanging state with each seed.
    ///
    /// Returns the number of seeds successfully contacted. Seeds equal to our
    /// own address are skipped. Fails only if every contacted seed failed.
    pub async fn join(&self, seeds: &[SocketAddr]) -> Result<usize> {
        let own = [self.inner.advertise, self.inner.transport.local_addr()];
        let mut attempted = 0;
        let mut contacted = 0;
        let mut last_err = None;

        for &seed in seeds {
            if own.contains(&seed) {
                continue;
            }
            attempted += 1;
            match self.push_pull_node(seed, true).await {
                Ok(()) => contacted += 1,
                Err(e) => {
                    tracing::warn!(%seed, "failed to join via seed: {}", e);
                    last_err = Some(e);
                }
            }
        }

        if contacted == 0 && attempted > 0 {
            return Err(Error::JoinFailed {
                attempted,
                reason: last_err.map(|e| e.to_string()).unwrap_or_default(),
            });
        }

        if contacted > 0 {
            tracing::info!(
                contacted,
                members = self.num_members(),
                "joined cluster"
            );
        }
        Ok(contacted)
    }

    /// Run one push/pull exchange with `addr`.
    ///
    /// Nothing is merged unless a complete, well-formed response arrives
    /// within `push_pull_timeout`.
    pub async fn push_pull_node(&self, addr: SocketAddr, join: bool) -> Result<()> {
        if self.is_shutdown() {
            return Err(Error::Shutdown);
        }

        #[cfg(feature = "metrics")]
        metrics::record_push_pull();

        let request = Message::PushPull(self.local_push_pull(join)).encode_to_bytes();
        let after = self.inner.config.push_pull_timeout;

        let result = async {
            let response =
                tokio::time::timeout(after, self.inner.transport.exchange(addr, request))
                    .await
                    .map_err(|_| Error::Timeout {
                        operation: "push/pull",
                        after,
                    })?
                    .map_err(|e| Error::Transport(e.to_string()))?;

            match Message::decode_from_slice(&response) {
                Some(Message::PushPull(remote)) => Ok(remote),
                Some(other) => Err(Error::UnexpectedMessage(format!(
                    "{:?} in push/pull response",
                    other.tag()
                ))),
                None => Err(Error::Decode("malformed push/pull response".into())),
            }
        }
        .await;

        match result {
            Ok(remote) => {
                tracing::debug!(%addr, nodes = remote.nodes.len(), join, "push/pull complete");
                self.merge_push_pull(remote, join);
                Ok(())
            }
            Err(e) => {
                #[cfg(feature = "metrics")]
                metrics::record_push_pull_failure();
                Err(e)
            }
        }
    }

    /// Gracefully leave the cluster.
    ///
    /// Gossips our own death and waits until it has been transmitted enough
    /// times, or until `timeout` elapses.
    pub async fn leave(&self, timeout: Duration) -> Result<()> {
        if self.inner.leaving.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let dead = self.inner.directory.write().leave_local(Instant::now());
        let Some(dead) = dead else {
            return Ok(());
        };

        #[cfg(feature = "metrics")]
        metrics::set_members(self.inner.size.get());

        // Nobody to tell.
        if self.num_members() == 0 {
            return Ok(());
        }

        let (tx, rx) = async_channel::bounded::<()>(1);
        let msg = Message::Dead(dead).encode_to_bytes();
        self.inner
            .broadcasts
            .queue_broadcast(MemberBroadcast::new(self.inner.local_name.clone(), msg).with_notify(tx));

        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(_) => {
                tracing::info!(name = %self.inner.local_name, "left cluster");
                Ok(())
            }
            Err(_) => {
                tracing::warn!("timed out waiting for leave broadcast");
                Err(Error::Timeout {
                    operation: "leave",
                    after: timeout,
                })
            }
        }
    }

    /// Stop background tasks and shut the transport down.
    pub async fn shutdown(&self) -> Result<()> {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // Closing the channel wakes every background loop.
        self.inner.shutdown_tx.close();

        let result = self
            .inner
            .transport
            .shutdown()
            .await
            .map_err(|e| Error::Transport(e.to_string()));

        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        self.inner.ack_handlers.lock().clear();
        self.inner.broadcasts.reset();

        tracing::info!(name = %self.inner.local_name, "memberlist shut down");
        result
    }

    // ---------------------------------------------------------------------
    // Background loops
    // ---------------------------------------------------------------------

    /// Sleep for `period`. Returns `false` if shutdown was requested.
    async fn tick(&self, period: Duration) -> bool {
        let sleep = tokio::time::sleep(period).fuse();
        let shutdown_recv = self.inner.shutdown_rx.recv().fuse();
        futures::pin_mut!(sleep, shutdown_recv);

        futures::select! {
            _ = sleep => !self.is_shutdown(),
            _ = shutdown_recv => false,
        }
    }

    async fn run_packet_handler(&self) {
        let packets = self.inner.transport.packets();
        loop {
            let next = packets.recv().fuse();
            let shutdown_recv = self.inner.shutdown_rx.recv().fuse();
            futures::pin_mut!(next, shutdown_recv);

            let packet: Packet = futures::select! {
                packet = next => match packet {
                    Ok(packet) => packet,
                    Err(_) => break,
                },
                _ = shutdown_recv => break,
            };

            self.handle_packet(packet).await;
        }
        tracing::debug!("packet handler stopped");
    }

    async fn run_stream_handler(&self) {
        let streams = self.inner.transport.streams();
        loop {
            let next = streams.recv().fuse();
            let shutdown_recv = self.inner.shutdown_rx.recv().fuse();
            futures::pin_mut!(next, shutdown_recv);

            let request: StreamRequest = futures::select! {
                request = next => match request {
                    Ok(request) => request,
                    Err(_) => break,
                },
                _ = shutdown_recv => break,
            };

            self.handle_stream(request);
        }
        tracing::debug!("stream handler stopped");
    }

    async fn run_probe_loop(&self) {
        while self.tick(self.inner.config.probe_interval).await {
            self.probe().await;
            self.check_suspects();
        }
    }

    async fn run_gossip_loop(&self) {
        while self.tick(self.inner.config.gossip_interval).await {
            self.gossip().await;
        }
    }

    async fn run_push_pull_loop(&self) {
        while self.tick(self.inner.config.push_pull_interval).await {
            let peer = self
                .inner
                .directory
                .read()
                .random_nodes(1, |n| n.state == NodeState::Alive)
                .pop();
            let Some(peer) = peer else {
                continue;
            };
            if let Err(e) = self.push_pull_node(peer.addr, false).await {
                tracing::debug!(peer = %peer, "periodic push/pull failed: {}", e);
            }
        }
    }

    // ---------------------------------------------------------------------
    // Failure detection
    // ---------------------------------------------------------------------

    fn next_seq(&self) -> u32 {
        self.inner.seq.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    fn register_ack(&self, seq: u32) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.inner.ack_handlers.lock().insert(seq, tx);
        rx
    }

    fn clear_ack(&self, seq: u32) {
        self.inner.ack_handlers.lock().remove(&seq);
    }

    async fn probe(&self) {
        let target = self.inner.directory.write().next_probe_target();
        let Some(target) = target else {
            return;
        };

        #[cfg(feature = "metrics")]
        metrics::record_probe();

        let seq = self.next_seq();
        let mut ack = self.register_ack(seq);
        let ping = Message::Ping(Ping {
            seq,
            target: target.name.clone(),
            source: self.inner.local_name.clone(),
        });

        if let Err(e) = self.send_msg(target.addr, ping).await {
            tracing::debug!(target = %target, "failed to send ping: {}", e);
        }

        if let Ok(Ok(())) = tokio::time::timeout(self.inner.config.probe_timeout, &mut ack).await {
            self.clear_ack(seq);
            tracing::trace!(target = %target, "probe acked");
            return;
        }

        let relays = self
            .inner
            .directory
            .read()
            .random_nodes(self.inner.config.indirect_checks, |n| {
                n.state == NodeState::Alive && n.name != target.name
            });
        for relay in &relays {
            let req = Message::IndirectPing(IndirectPing {
                seq,
                target: target.name.clone(),
                target_addr: target.addr,
                source: self.inner.local_name.clone(),
            });
            if let Err(e) = self.send_msg(relay.addr, req).await {
                tracing::debug!(relay = %relay, "failed to send indirect ping: {}", e);
            }
        }

        let remaining = self
            .inner
            .config
            .probe_interval
            .saturating_sub(self.inner.config.probe_timeout);
        let acked = matches!(tokio::time::timeout(remaining, &mut ack).await, Ok(Ok(())));
        self.clear_ack(seq);
        if acked {
            tracing::debug!(target = %target, relays = relays.len(), "indirect probe acked");
            return;
        }

        #[cfg(feature = "metrics")]
        metrics::record_probe_failure();

        tracing::debug!(target = %target, "probe failed, suspecting node");
        self.apply_suspect(Suspect {
            incarnation: target.incarnation,
            node: target.name,
            from: self.inner.local_name.clone(),
        });
    }

    fn check_suspects(&self) {
        let now = Instant::now();
        let timeout = self.inner.config.suspicion_timeout(self.inner.size.get());
        let retention = self.inner.config.dead_node_retention;

        let (expired, reaped) = {
            let mut directory = self.inner.directory.write();
            (
                directory.expire_suspects(now, timeout),
                directory.reap_dead(now, retention),
            )
        };

        for node in expired {
            tracing::info!(node = %node, "suspect not refuted, marking dead");
            #[cfg(feature = "metrics")]
            metrics::record_dead();
            self.queue_member(
                &node.name,
                Message::Dead(Dead {
                    incarnation: node.incarnation,
                    node: node.name.clone(),
                    from: self.inner.local_name.clone(),
                }),
            );
            self.inner.delegate.notify_leave(&node);
        }

        for node in reaped {
            tracing::debug!(node = %node, "removed dead node");
        }

        #[cfg(feature = "metrics")]
        metrics::set_members(self.inner.size.get());
    }

    async fn handle_indirect_ping(&self, from: SocketAddr, req: IndirectPing) {
        let seq = self.next_seq();
        let ack = self.register_ack(seq);
        let ping = Message::Ping(Ping {
            seq,
            target: req.target.clone(),
            source: self.inner.local_name.clone(),
        });
        if let Err(e) = self.send_msg(req.target_addr, ping).await {
            tracing::debug!(target = %req.target_addr, "failed to relay ping: {}", e);
        }

        let acked = matches!(
            tokio::time::timeout(self.inner.config.probe_timeout, ack).await,
            Ok(Ok(()))
        );
        self.clear_ack(seq);
        if acked {
            if let Err(e) = self.send_msg(from, Message::Ack(Ack { seq: req.seq })).await {
                tracing::debug!(%from, "failed to forward ack: {}", e);
            }
        }
    }

    // ---------------------------------------------------------------------
    // State transitions
    // ---------------------------------------------------------------------

    fn queue_member(&self, node: &str, msg: Message) {
        self.inner
            .broadcasts
            .queue_broadcast(MemberBroadcast::new(node, msg.encode_to_bytes()));
    }

    fn announce_alive(&self, incarnation: u32) {
        let alive = Message::Alive(Alive {
            incarnation,
            node: self.inner.local_name.clone(),
            addr: self.inner.advertise,
        });
        self.queue_member(&self.inner.local_name, alive);
    }

    fn refute(&self, incarnation: u32) {
        if self.inner.leaving.load(Ordering::Acquire) {
            return;
        }
        tracing::info!(incarnation, "refuting accusation about local node");
        #[cfg(feature = "metrics")]
        metrics::record_refutation();
        self.announce_alive(incarnation);
    }

    fn apply_alive(&self, alive: Alive) {
        let outcome = self
            .inner
            .directory
            .write()
            .apply_alive(&alive, Instant::now());

        match outcome {
            AliveOutcome::Ignored => return,
            AliveOutcome::Joined(node) => {
                tracing::info!(node = %node, "node joined");
                self.queue_member(&node.name, Message::Alive(alive));
                self.inner.delegate.notify_join(&node);
            }
            AliveOutcome::Updated(node) => {
                tracing::debug!(node = %node, incarnation = node.incarnation, "node updated");
                self.queue_member(&node.name, Message::Alive(alive));
                self.inner.delegate.notify_update(&node);
            }
        }

        #[cfg(feature = "metrics")]
        metrics::set_members(self.inner.size.get());
    }

    fn apply_suspect(&self, suspect: Suspect) {
        let outcome = self
            .inner
            .directory
            .write()
            .apply_suspect(&suspect, Instant::now());

        match outcome {
            SuspectOutcome::Ignored => {}
            SuspectOutcome::Refute(incarnation) => self.refute(incarnation),
            SuspectOutcome::Suspected(node) => {
                tracing::info!(node = %node, from = %suspect.from, "node suspected");
                #[cfg(feature = "metrics")]
                metrics::record_suspect();
                self.queue_member(&node.name, Message::Suspect(suspect));
            }
        }
    }

    fn apply_dead(&self, dead: Dead) {
        let outcome = self
            .inner
            .directory
            .write()
            .apply_dead(&dead, Instant::now());

        match outcome {
            DeadOutcome::Ignored => {}
            DeadOutcome::Refute(incarnation) => self.refute(incarnation),
            DeadOutcome::Died { node, left } => {
                if left {
                    tracing::info!(node = %node, "node left");
                } else {
                    tracing::info!(node = %node, from = %dead.from, "node declared dead");
                }
                #[cfg(feature = "metrics")]
                {
                    metrics::record_dead();
                    metrics::set_members(self.inner.size.get());
                }
                self.queue_member(&node.name, Message::Dead(dead));
                self.inner.delegate.notify_leave(&node);
            }
        }
    }

    // ---------------------------------------------------------------------
    // Anti-entropy
    // ---------------------------------------------------------------------

    fn local_push_pull(&self, join: bool) -> PushPull {
        let nodes = self.inner.directory.read().push_states();
        PushPull {
            join,
            nodes,
            user_state: self.inner.delegate.local_state(join),
        }
    }

    fn merge_push_pull(&self, remote: PushPull, join: bool) {
        for state in remote.nodes {
            let PushNodeState {
                name,
                addr,
                incarnation,
                state,
            } = state;
            match state {
                NodeState::Alive => self.apply_alive(Alive {
                    incarnation,
                    node: name,
                    addr,
                }),
                // A remote death is only a suspicion here, so the node gets a
                // chance to refute it through us.
                NodeState::Suspect | NodeState::Dead => self.apply_suspect(Suspect {
                    incarnation,
                    node: name,
                    from: self.inner.local_name.clone(),
                }),
            }
        }

        self.inner
            .delegate
            .merge_remote_state(&remote.user_state, join);
    }

    fn handle_stream(&self, request: StreamRequest) {
        let from = request.from;
        match Message::decode_from_slice(&request.payload) {
            Some(Message::PushPull(remote)) => {
                let join = remote.join;
                let reply = Message::PushPull(self.local_push_pull(join)).encode_to_bytes();
                if !request.respond(reply) {
                    tracing::debug!(%from, "push/pull requester went away");
                }
                tracing::debug!(%from, nodes = remote.nodes.len(), join, "push/pull served");
                self.merge_push_pull(remote, join);
            }
            Some(other) => {
                tracing::debug!(%from, tag = ?other.tag(), "unexpected message on stream");
            }
            None => {
                #[cfg(feature = "metrics")]
                metrics::record_malformed();
                tracing::debug!(%from, "malformed stream request dropped");
            }
        }
    }

    // ---------------------------------------------------------------------
    // Packets
    // ---------------------------------------------------------------------

    async fn handle_packet(&self, packet: Packet) {
        let Some(msg) = Message::decode_from_slice(&packet.payload) else {
            #[cfg(feature = "metrics")]
            metrics::record_malformed();
            tracing::debug!(from = %packet.from, len = packet.payload.len(), "malformed packet dropped");
            return;
        };

        match msg {
            Message::Compound(parts) => {
                for part in parts {
                    match Message::decode_from_slice(&part) {
                        Some(Message::Compound(_)) => {
                            tracing::debug!(from = %packet.from, "nested compound message dropped");
                        }
                        Some(msg) => self.handle_message(packet.from, msg).await,
                        None => {
                            #[cfg(feature = "metrics")]
                            metrics::record_malformed();
                            tracing::debug!(from = %packet.from, "malformed compound part dropped");
                        }
                    }
                }
            }
            msg => self.handle_message(packet.from, msg).await,
        }
    }

    async fn handle_message(&self, from: SocketAddr, msg: Message) {
        tracing::trace!(%from, tag = ?msg.tag(), "received message");
        match msg {
            Message::Ping(ping) => {
                if ping.target != self.inner.local_name {
                    tracing::debug!(
                        %from,
                        target = %ping.target,
                        "ping for another node dropped"
                    );
                    return;
                }
                if let Err(e) = self.send_msg(from, Message::Ack(Ack { seq: ping.seq })).await {
                    tracing::debug!(%from, "failed to send ack: {}", e);
                }
            }
            Message::IndirectPing(req) => {
                let this = self.clone();
                tokio::spawn(async move { this.handle_indirect_ping(from, req).await });
            }
            Message::Ack(ack) => {
                let handler = self.inner.ack_handlers.lock().remove(&ack.seq);
                if let Some(handler) = handler {
                    let _ = handler.send(());
                }
            }
            Message::Alive(alive) => self.apply_alive(alive),
            Message::Suspect(suspect) => self.apply_suspect(suspect),
            Message::Dead(dead) => self.apply_dead(dead),
            Message::User(payload) => self.inner.delegate.notify_msg(payload),
            Message::PushPull(_) | Message::Compound(_) => {
                tracing::debug!(%from, "unexpected message in packet");
            }
        }
    }

    /// Pending broadcasts that fit in a packet already holding `used` bytes.
    fn collect_broadcasts(&self, used: usize) -> Vec<Bytes> {
        let mut remaining = self.inner.config.packet_budget.saturating_sub(used);
        if remaining <= COMPOUND_PART_OVERHEAD {
            return Vec::new();
        }

        let mut parts = self
            .inner
            .broadcasts
            .get_broadcasts(COMPOUND_PART_OVERHEAD, remaining);
        let member_bytes: usize = parts.iter().map(|p| COMPOUND_PART_OVERHEAD + p.len()).sum();
        remaining = remaining.saturating_sub(member_bytes);

        let user = self
            .inner
            .delegate
            .get_broadcasts(COMPOUND_PART_OVERHEAD + USER_MSG_OVERHEAD, remaining);
        parts.extend(
            user.into_iter()
                .map(|payload| Message::User(payload).encode_to_bytes()),
        );
        parts
    }

    /// Send a message with as many pending broadcasts as fit piggybacked.
    async fn send_msg(&self, target: SocketAddr, msg: Message) -> Result<()> {
        let encoded = msg.encode_to_bytes();
        let parts =
            self.collect_broadcasts(COMPOUND_HEADER_OVERHEAD + COMPOUND_PART_OVERHEAD + encoded.len());

        let packet = if parts.is_empty() {
            encoded
        } else {
            let mut all = Vec::with_capacity(parts.len() + 1);
            all.push(encoded);
            all.extend(parts);
            Message::compound(all)
        };

        self.send_packet(target, packet).await
    }

    async fn send_packet(&self, target: SocketAddr, packet: Bytes) -> Result<()> {
        #[cfg(feature = "metrics")]
        metrics::record_packet_size(packet.len());

        self.inner
            .transport
            .send_packet(target, packet)
            .await
            .map_err(|e| Error::Send {
                target,
                reason: e.to_string(),
            })
    }

    async fn gossip(&self) {
        // Dead nodes stay eligible until reaped so they can learn they were
        // declared dead and refute.
        let peers = self
            .inner
            .directory
            .read()
            .random_nodes(self.inner.config.gossip_nodes, |_| true);

        for peer in peers {
            let parts = self.collect_broadcasts(COMPOUND_HEADER_OVERHEAD);
            if parts.is_empty() {
                return;
            }
            let packet = Message::compound(parts);
            if let Err(e) = self.send_packet(peer.addr, packet).await {
                tracing::debug!(peer = %peer, "failed to gossip: {}", e);
            }
        }
    }
}
