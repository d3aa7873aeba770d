// Roost node binary entry point.
//
// Wires the cluster configuration, storage engines, transport, slot and
// channel planes, and the reactor, then parks until interrupted.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use roost_cluster::node::{Node, NodeOptions};

#[derive(Parser, Debug)]
#[command(name = "roost-node", about = "Clustered message-processing node")]
struct NodeArgs {
    /// Stable numeric id of this node.
    #[arg(long)]
    node_id: u64,

    /// Cluster listen address, e.g. 127.0.0.1:11001.
    #[arg(long)]
    listen: String,

    /// Seed list as `id@host:port`, comma separated. Must include this node.
    #[arg(long)]
    initial_members: String,

    /// Data directory for the cluster config, logs, and placements.
    #[arg(long, default_value = "./roost-data")]
    data_dir: PathBuf,

    /// Number of slots partitioning the channel key-space.
    #[arg(long, default_value_t = 64)]
    slot_count: u32,

    /// Replicas per slot.
    #[arg(long, default_value_t = 2)]
    slot_replicas: u32,

    /// Replicas per channel log.
    #[arg(long, default_value_t = 2)]
    channel_replicas: u32,

    /// Shared cluster token verified at transport handshake.
    #[arg(long, default_value = "roost", env = "ROOST_TOKEN")]
    token: String,

    /// Reactor lanes (channel workers).
    #[arg(long, default_value_t = 4)]
    reactor_lanes: usize,

    /// Coarse tick period in milliseconds.
    #[arg(long, default_value_t = 100)]
    tick_ms: u64,

    /// Keep all state in memory (no fjall engines).
    #[arg(long, default_value_t = false)]
    in_memory: bool,
}

fn parse_members(raw: &str) -> anyhow::Result<BTreeMap<u64, String>> {
    let mut members = BTreeMap::new();
    for part in raw.split(',').filter(|p| !p.trim().is_empty()) {
        let (id, addr) = part
            .trim()
            .split_once('@')
            .with_context(|| format!("bad member entry {part:?}, expected id@addr"))?;
        let id: u64 = id.parse().with_context(|| format!("bad node id {id:?}"))?;
        members.insert(id, addr.to_string());
    }
    anyhow::ensure!(!members.is_empty(), "initial members list is empty");
    Ok(members)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = NodeArgs::parse();
    let init_nodes = parse_members(&args.initial_members)?;
    anyhow::ensure!(
        init_nodes.contains_key(&args.node_id),
        "initial members must include this node"
    );

    let node = Node::start(NodeOptions {
        node_id: args.node_id,
        listen_addr: args.listen.clone(),
        init_nodes,
        data_dir: args.data_dir,
        slot_count: args.slot_count,
        slot_replica_count: args.slot_replicas,
        channel_replica_count: args.channel_replicas,
        token: args.token,
        reactor_lanes: args.reactor_lanes,
        tick_interval: Duration::from_millis(args.tick_ms.max(10)),
        in_memory: args.in_memory,
        ..Default::default()
    })
    .await?;

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    node.stop();
    Ok(())
}
