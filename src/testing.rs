//! Fault injection for in-process clusters.
//!
//! [`MemoryNetwork`](crate::transport::MemoryNetwork) asks a
//! [`ChaosController`] about every datagram and stream exchange, so tests can
//! run the failure detector and anti-entropy over a lossy, slow or split
//! network.
//!
//! Loss only applies to datagrams. Stream exchanges are reliable and fail
//! only across a partition; both kinds are delayed by the configured latency.
//!
//! ## Example
//!
//! ```ignore
//! use memberlist_kv::testing::ChaosConfig;
//! use memberlist_kv::transport::MemoryNetwork;
//!
//! let net = MemoryNetwork::new();
//! net.chaos().set_config(ChaosConfig::new().with_message_loss_rate(0.1));
//! net.chaos().partition(a_addr, b_addr);
//! ```

use std::{
    collections::HashSet,
    hash::Hash,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::RwLock;
use rand::Rng;

/// Loss and latency applied to deliveries. The default injects nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ChaosConfig {
    /// Probability of dropping a datagram, in `0.0..=1.0`.
    pub loss_rate: f64,
    /// Fixed delay added to every delivery.
    pub latency: Duration,
    /// Upper bound of a uniformly random delay added on top of `latency`.
    pub jitter: Duration,
}

impl ChaosConfig {
    /// Create a config that injects no loss or latency.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the datagram loss rate, clamped to `0.0..=1.0`.
    pub fn with_message_loss_rate(mut self, rate: f64) -> Self {
        self.loss_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Set the fixed delay added to every delivery.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Set the upper bound of the random extra delay.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    fn drops(&self, rng: &mut impl Rng) -> bool {
        self.loss_rate > 0.0 && rng.random::<f64>() < self.loss_rate
    }

    fn delay(&self, rng: &mut impl Rng) -> Duration {
        if self.jitter.is_zero() {
            return self.latency;
        }
        let extra = rng.random_range(0..=self.jitter.as_micros() as u64);
        self.latency + Duration::from_micros(extra)
    }
}

/// Point-in-time delivery counters of a [`ChaosController`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    /// Deliveries attempted.
    pub sent: u64,
    /// Datagrams lost to the loss rate.
    pub dropped: u64,
    /// Deliveries refused by a partition.
    pub blocked: u64,
    /// Deliveries that were held back by latency.
    pub delayed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    dropped: AtomicU64,
    blocked: AtomicU64,
    delayed: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DeliveryStats {
        DeliveryStats {
            sent: self.sent.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            delayed: self.delayed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
struct ChaosInner<I> {
    config: RwLock<ChaosConfig>,
    // Directed pairs; `partition` always inserts both directions.
    cut: RwLock<HashSet<(I, I)>>,
    counters: Counters,
}

/// Loss, latency and partitions for a network of endpoints addressed by `I`.
///
/// Cloning is cheap; clones share the same state.
#[derive(Debug)]
pub struct ChaosController<I> {
    inner: Arc<ChaosInner<I>>,
}

impl<I> Clone for ChaosController<I> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<I: Clone + Eq + Hash> Default for ChaosController<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: Clone + Eq + Hash> ChaosController<I> {
    /// A controller that injects nothing.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ChaosInner {
                config: RwLock::new(ChaosConfig::default()),
                cut: RwLock::new(HashSet::new()),
                counters: Counters::default(),
            }),
        }
    }

    /// Replace the loss and latency settings.
    pub fn set_config(&self, config: ChaosConfig) {
        *self.inner.config.write() = config;
    }

    /// Current loss and latency settings.
    pub fn config(&self) -> ChaosConfig {
        *self.inner.config.read()
    }

    /// Stop injecting faults and heal every partition.
    pub fn disable(&self) {
        self.set_config(ChaosConfig::default());
        self.heal_all();
    }

    /// Cut the link between `a` and `b` in both directions.
    pub fn partition(&self, a: I, b: I) {
        let mut cut = self.inner.cut.write();
        cut.insert((a.clone(), b.clone()));
        cut.insert((b, a));
    }

    /// Cut `node` off from every endpoint in `others` except itself.
    pub fn isolate(&self, node: I, others: impl IntoIterator<Item = I>) {
        for other in others.into_iter().filter(|o| *o != node) {
            self.partition(node.clone(), other);
        }
    }

    /// Restore the link between `a` and `b`.
    pub fn heal(&self, a: &I, b: &I) {
        let mut cut = self.inner.cut.write();
        cut.remove(&(a.clone(), b.clone()));
        cut.remove(&(b.clone(), a.clone()));
    }

    /// Restore every link.
    pub fn heal_all(&self) {
        self.inner.cut.write().clear();
    }

    /// Whether `from` cannot reach `to`.
    pub fn is_partitioned(&self, from: &I, to: &I) -> bool {
        let cut = self.inner.cut.read();
        !cut.is_empty() && cut.contains(&(from.clone(), to.clone()))
    }

    /// Decide the fate of one datagram: the delay to apply, or `None` if it
    /// is lost.
    pub fn packet_delay(&self, from: &I, to: &I) -> Option<Duration> {
        self.deliver(from, to, true)
    }

    /// Decide the fate of one stream exchange: the delay to apply, or `None`
    /// if a partition refuses it.
    pub fn stream_delay(&self, from: &I, to: &I) -> Option<Duration> {
        self.deliver(from, to, false)
    }

    fn deliver(&self, from: &I, to: &I, lossy: bool) -> Option<Duration> {
        let counters = &self.inner.counters;
        Counters::bump(&counters.sent);

        if self.is_partitioned(from, to) {
            Counters::bump(&counters.blocked);
            return None;
        }

        let config = self.config();
        let mut rng = rand::rng();
        if lossy && config.drops(&mut rng) {
            Counters::bump(&counters.dropped);
            return None;
        }

        let delay = config.delay(&mut rng);
        if !delay.is_zero() {
            Counters::bump(&counters.delayed);
        }
        Some(delay)
    }

    /// Delivery counters so far.
    pub fn stats(&self) -> DeliveryStats {
        self.inner.counters.snapshot()
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` elapses.
///
/// Returns the final value of `condition`. Must be called from within a
/// tokio runtime.
pub async fn wait_until<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            return condition();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_injects_nothing() {
        let chaos: ChaosController<u16> = ChaosController::new();
        for _ in 0..100 {
            assert_eq!(chaos.packet_delay(&1, &2), Some(Duration::ZERO));
        }
        assert_eq!(
            chaos.stats(),
            DeliveryStats {
                sent: 100,
                ..DeliveryStats::default()
            }
        );
    }

    #[test]
    fn test_loss_rate_extremes() {
        let never = ChaosConfig::new().with_message_loss_rate(0.0);
        let always = ChaosConfig::new().with_message_loss_rate(5.0);
        assert_eq!(always.loss_rate, 1.0);

        let mut rng = rand::rng();
        for _ in 0..100 {
            assert!(!never.drops(&mut rng));
            assert!(always.drops(&mut rng));
        }
    }

    #[test]
    fn test_delay_bounds() {
        let config = ChaosConfig::new()
            .with_latency(Duration::from_millis(100))
            .with_jitter(Duration::from_millis(50));
        let mut rng = rand::rng();
        for _ in 0..50 {
            let delay = config.delay(&mut rng);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }

        let fixed = ChaosConfig::new().with_latency(Duration::from_millis(7));
        assert_eq!(fixed.delay(&mut rng), Duration::from_millis(7));
    }

    #[test]
    fn test_partition_heal_one_link() {
        let chaos: ChaosController<u16> = ChaosController::new();
        chaos.isolate(1, [1, 2, 3]);
        assert!(chaos.is_partitioned(&1, &2));
        assert!(chaos.is_partitioned(&3, &1));
        assert!(!chaos.is_partitioned(&1, &1));
        assert!(!chaos.is_partitioned(&2, &3));

        chaos.heal(&2, &1);
        assert!(!chaos.is_partitioned(&1, &2));
        assert!(chaos.is_partitioned(&1, &3));

        chaos.heal_all();
        assert!(!chaos.is_partitioned(&1, &3));
    }

    #[test]
    fn test_streams_are_not_lossy() {
        let chaos: ChaosController<u16> = ChaosController::new();
        chaos.set_config(ChaosConfig::new().with_message_loss_rate(1.0));
        assert_eq!(chaos.packet_delay(&1, &2), None);
        assert_eq!(chaos.stream_delay(&1, &2), Some(Duration::ZERO));

        chaos.partition(1, 2);
        assert_eq!(chaos.stream_delay(&1, &2), None);

        let stats = chaos.stats();
        assert_eq!(stats.sent, 3);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.blocked, 1);
    }

    #[test]
    fn test_clones_share_state() {
        let chaos: ChaosController<u16> = ChaosController::new();
        let other = chaos.clone();
        other.partition(1, 2);
        other.set_config(ChaosConfig::new().with_latency(Duration::from_millis(1)));
        assert!(chaos.is_partitioned(&1, &2));
        assert_eq!(chaos.config().latency, Duration::from_millis(1));

        chaos.disable();
        assert!(!other.is_partitioned(&1, &2));
        assert_eq!(other.config(), ChaosConfig::default());
    }

    #[tokio::test]
    async fn test_wait_until() {
        let mut calls = 0;
        assert!(
            wait_until(
                || {
                    calls += 1;
                    calls >= 3
                },
                Duration::from_secs(1)
            )
            .await
        );
        assert!(!wait_until(|| false, Duration::from_millis(30)).await);
    }
}
