use std::sync::Arc;

use anyhow::Context;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use tokio::io::BufReader;

use bfr_cluster::{ClusterSettings, LocalNetwork, Node, NodeInfo};
use bfr_server::{run_console, AdminConsole};
use bfr_storage::MemRecordStore;

#[derive(clap::Parser, Debug)]
#[command(name = "bfr-node", about = "Bifrost replicated document store")]
struct Cli {
    #[arg(long)]
    config: Option<std::path::PathBuf>,
    /// Node the admin console talks to; defaults to the first configured node
    #[arg(long)]
    node: Option<String>,
    /// Admin command to run instead of reading stdin, repeatable
    #[arg(long = "exec")]
    exec: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct NodeConfig {
    id: String,
    address: String,
}

#[derive(Debug, Deserialize)]
struct TopologyConfig {
    nodes: Vec<NodeConfig>,
}

#[derive(Debug, Deserialize)]
struct ObservabilityConfig {
    log_level: String,
    log_format: String,
}

#[derive(Debug, Deserialize)]
struct Config {
    cluster: ClusterSettings,
    topology: TopologyConfig,
    observability: ObservabilityConfig,
}

type LocalNode = Node<MemRecordStore, LocalNetwork>;

async fn boot(
    settings: &ClusterSettings,
    topology: &TopologyConfig,
) -> anyhow::Result<Vec<LocalNode>> {
    let net = LocalNetwork::new();
    let mut nodes: Vec<LocalNode> = Vec::with_capacity(topology.nodes.len());
    for entry in &topology.nodes {
        let seeds: Vec<String> = nodes.first().map(|n| n.id().to_string()).into_iter().collect();
        let inbox = net.register(&entry.id);
        let node = Node::start(
            NodeInfo::new(entry.id.as_str(), entry.address.as_str()),
            settings.clone(),
            Arc::new(MemRecordStore::new()),
            net.clone(),
            inbox,
            &seeds,
        )
        .await
        .with_context(|| format!("failed to start node {}", entry.id))?;
        nodes.push(node);
    }
    Ok(nodes)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use clap::Parser;
    let cli = Cli::parse();

    let mut figment = Figment::new()
        .merge(Toml::string(include_str!("../../../config/default.toml")));

    if let Some(ref config_path) = cli.config {
        figment = figment.merge(Toml::file_exact(config_path));
    }

    let config: Config = figment
        .merge(Env::prefixed("BIFROST_").split("__"))
        .extract()
        .context("failed to load configuration")?;

    match config.observability.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(&config.observability.log_level)
                .with_writer(std::io::stderr)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(&config.observability.log_level)
                .with_writer(std::io::stderr)
                .init();
        }
    }

    anyhow::ensure!(
        !config.topology.nodes.is_empty(),
        "topology.nodes must list at least one node"
    );
    tracing::info!(
        nodes = config.topology.nodes.len(),
        write_quorum = %config.cluster.default_write_quorum,
        read_quorum = %config.cluster.default_read_quorum,
        "booting cluster"
    );

    let nodes = boot(&config.cluster, &config.topology).await?;
    let target = cli.node.as_deref().unwrap_or(config.topology.nodes[0].id.as_str());
    let node = nodes
        .iter()
        .find(|n| n.id() == target)
        .cloned()
        .with_context(|| format!("unknown node: {target}"))?;
    let mut console = AdminConsole::new(node);

    let failed = if cli.exec.is_empty() {
        run_console(&mut console, BufReader::new(tokio::io::stdin()), tokio::io::stdout()).await?
    } else {
        let script = cli.exec.join("\n");
        run_console(&mut console, script.as_bytes(), tokio::io::stdout()).await?
    };

    for node in nodes.iter().rev() {
        node.shutdown().await;
    }
    anyhow::ensure!(failed == 0, "{failed} command(s) failed");
    Ok(())
}
