//! kad-daemon: a single-process Kademlia DHT node.
//!
//! Runs on a current-thread Tokio runtime; all daemon state lives on one
//! task with no internal synchronization (spec §5).

mod config;
mod node;
mod state;

use tracing::info;

use crate::config::DaemonConfig;
use crate::state::{load_bootstrap_nodes, DaemonState};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let config = DaemonConfig::load()?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(bind_addr = %config.bind_addr, bind_port = config.bind_port, "kad-daemon starting");

    std::fs::create_dir_all(config.conf_dir())?;

    let mut daemon_state = DaemonState::load_or_new(&config.routes_path());
    info!(self_id = %daemon_state.self_id, routes = daemon_state.routing_table.len(), "routing state loaded");

    let bootstrap_path = config.bootstrap_nodes_path();
    if bootstrap_path.exists() {
        match load_bootstrap_nodes(&bootstrap_path) {
            Ok(nodes) => {
                info!(count = nodes.len(), "bootstrap nodes loaded");
                daemon_state.bootstrap(nodes, now_secs());
            }
            Err(err) => tracing::warn!(%err, "failed to load bootstrap nodes file"),
        }
    }

    let result = node::run(&config, daemon_state).await;
    if let Err(err) = &result {
        tracing::error!(%err, "daemon exited with an error");
    }
    result
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
