//! HTTP front end for a replicated key-value node.
//!
//! ```text
//! cargo run --example http-kv -- --port 4001
//! cargo run --example http-kv -- --port 4002 --members 127.0.0.1:<gossip port of the first node>
//!
//! curl 'localhost:4001/add?key=x&val=1'
//! curl 'localhost:4002/get?key=x'
//! curl 'localhost:4002/del?key=x'
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::any,
    Router,
};
use clap::Parser;
use memberlist_kv::{ClusterConfig, JoinStatus, KvNode, NetTransport};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "http-kv", about = "Gossip-replicated key-value store over HTTP")]
struct Args {
    /// Comma separated list of members to join.
    #[arg(long, env = "KV_MEMBERS", default_value = "")]
    members: String,

    /// HTTP port.
    #[arg(long, env = "KV_PORT", default_value_t = 4001)]
    port: u16,

    /// Gossip port (UDP and TCP). 0 picks a free port.
    #[arg(long, env = "KV_GOSSIP_PORT", default_value_t = 0)]
    gossip_port: u16,

    /// Merge key-value state on every periodic push/pull, not only on join.
    #[arg(long)]
    always_merge: bool,
}

#[derive(Debug, Deserialize)]
struct KvParams {
    #[serde(default)]
    key: String,
    #[serde(default)]
    val: String,
}

type Node = KvNode<NetTransport>;

async fn add(State(node): State<Node>, Query(params): Query<KvParams>) -> (StatusCode, String) {
    match node.add(params.key, params.val) {
        Ok(()) => (StatusCode::OK, String::new()),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn del(State(node): State<Node>, Query(params): Query<KvParams>) -> (StatusCode, String) {
    match node.del(params.key) {
        Ok(()) => (StatusCode::OK, String::new()),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn get(State(node): State<Node>, Query(params): Query<KvParams>) -> String {
    node.read_local(&params.key).unwrap_or_default()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = ClusterConfig::local().with_bind_port(args.gossip_port);
    if args.always_merge {
        config = config.with_merge_policy(memberlist_kv::MergePolicy::Always);
    }

    let seeds: Vec<&str> = args
        .members
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();

    let (node, status) = KvNode::start_node(config, &seeds).await?;
    match &status {
        JoinStatus::Standalone => tracing::info!("started a new cluster"),
        JoinStatus::Joined { contacted } => tracing::info!(contacted, "joined cluster"),
        JoinStatus::Failed(e) => tracing::warn!("running standalone: {}", e),
    }
    tracing::info!(name = %node.local_name(), addr = %node.local_addr(), "local member");

    let app = Router::new()
        .route("/add", any(add))
        .route("/del", any(del))
        .route("/get", any(get))
        .with_state(node.clone());

    let http_addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    tracing::info!(%http_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    if let Err(e) = node.leave(Duration::from_secs(2)).await {
        tracing::warn!("leave: {}", e);
    }
    node.shutdown().await?;
    Ok(())
}
