//! Metrics for the membership layer and the replicated store.
//!
//! ## Available Metrics
//!
//! ### Counters
//! - `memberlist_kv_probes_total` - Probes started
//! - `memberlist_kv_probe_failures_total` - Probes with no direct or indirect ack
//! - `memberlist_kv_suspect_total` - Nodes marked suspect
//! - `memberlist_kv_dead_total` - Nodes marked dead (including leaves)
//! - `memberlist_kv_refutations_total` - Accusations about the local node refuted
//! - `memberlist_kv_push_pull_total` - Push/pull exchanges initiated
//! - `memberlist_kv_push_pull_failures_total` - Push/pull exchanges that failed or timed out
//! - `memberlist_kv_broadcasts_queued_total` - Key-value broadcasts queued
//! - `memberlist_kv_broadcasts_retired_total` - Key-value broadcasts retired
//! - `memberlist_kv_updates_applied_total` - Updates applied to the local store
//! - `memberlist_kv_malformed_total` - Malformed packets or payloads dropped
//!
//! ### Histograms
//! - `memberlist_kv_packet_size_bytes` - Outgoing packet size distribution
//!
//! ### Gauges
//! - `memberlist_kv_members` - Current number of non-dead members
//! - `memberlist_kv_store_keys` - Current number of keys in the local store

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

/// Initialize metric descriptions.
///
/// Call this once at application startup to register all metric descriptions.
pub fn init_metrics() {
    describe_counter!("memberlist_kv_probes_total", "Total number of probes started");
    describe_counter!(
        "memberlist_kv_probe_failures_total",
        "Total number of probes that received no ack"
    );
    describe_counter!(
        "memberlist_kv_suspect_total",
        "Total number of nodes marked suspect"
    );
    describe_counter!("memberlist_kv_dead_total", "Total number of nodes marked dead");
    describe_counter!(
        "memberlist_kv_refutations_total",
        "Total number of accusations about the local node refuted"
    );
    describe_counter!(
        "memberlist_kv_push_pull_total",
        "Total number of push/pull exchanges initiated"
    );
    describe_counter!(
        "memberlist_kv_push_pull_failures_total",
        "Total number of push/pull exchanges that failed or timed out"
    );
    describe_counter!(
        "memberlist_kv_broadcasts_queued_total",
        "Total number of key-value broadcasts queued"
    );
    describe_counter!(
        "memberlist_kv_broadcasts_retired_total",
        "Total number of key-value broadcasts retired from the queue"
    );
    describe_counter!(
        "memberlist_kv_updates_applied_total",
        "Total number of updates applied to the local store"
    );
    describe_counter!(
        "memberlist_kv_malformed_total",
        "Total number of malformed packets or payloads dropped"
    );

    describe_histogram!(
        "memberlist_kv_packet_size_bytes",
        "Outgoing packet size in bytes"
    );

    describe_gauge!("memberlist_kv_members", "Current number of non-dead members");
    describe_gauge!(
        "memberlist_kv_store_keys",
        "Current number of keys in the local store"
    );
}

/// Record a probe.
pub fn record_probe() {
    counter!("memberlist_kv_probes_total").increment(1);
}

/// Record a probe that got no ack.
pub fn record_probe_failure() {
    counter!("memberlist_kv_probe_failures_total").increment(1);
}

/// Record a node becoming suspect.
pub fn record_suspect() {
    counter!("memberlist_kv_suspect_total").increment(1);
}

/// Record a node becoming dead.
pub fn record_dead() {
    counter!("memberlist_kv_dead_total").increment(1);
}

/// Record a refutation.
pub fn record_refutation() {
    counter!("memberlist_kv_refutations_total").increment(1);
}

/// Record a push/pull exchange.
pub fn record_push_pull() {
    counter!("memberlist_kv_push_pull_total").increment(1);
}

/// Record a failed push/pull exchange.
pub fn record_push_pull_failure() {
    counter!("memberlist_kv_push_pull_failures_total").increment(1);
}

/// Record a key-value broadcast being queued.
pub fn record_broadcast_queued() {
    counter!("memberlist_kv_broadcasts_queued_total").increment(1);
}

/// Record a key-value broadcast leaving the queue.
pub fn record_broadcast_retired() {
    counter!("memberlist_kv_broadcasts_retired_total").increment(1);
}

/// Record updates applied to the store.
pub fn record_updates_applied(count: usize) {
    counter!("memberlist_kv_updates_applied_total").increment(count as u64);
}

/// Record a dropped malformed packet or payload.
pub fn record_malformed() {
    counter!("memberlist_kv_malformed_total").increment(1);
}

/// Record an outgoing packet size.
pub fn record_packet_size(size: usize) {
    histogram!("memberlist_kv_packet_size_bytes").record(size as f64);
}

/// Update the member count gauge.
pub fn set_members(count: usize) {
    gauge!("memberlist_kv_members").set(count as f64);
}

/// Update the store size gauge.
pub fn set_store_keys(count: usize) {
    gauge!("memberlist_kv_store_keys").set(count as f64);
}
