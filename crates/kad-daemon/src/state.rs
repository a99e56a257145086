//! Daemon-wide state: routing table, in-flight queries, dispatcher, and
//! the single active lookup, plus the persisted-file load/save paths
//! described in spec §6.

use std::path::Path;

use kad_dht::lookup::LookupState;
use kad_dht::routing::RoutingTable;
use kad_dht::{ALPHA, K};
use kad_proto::bencode;
use kad_proto::guid::{Guid, NodeInfo};
use kad_proto::message::decode_compact_node;
use kad_rpc::{Dispatcher, InFlightLru};

/// Everything the event loop mutates each poll cycle.
pub struct DaemonState {
    pub self_id: Guid,
    pub routing_table: RoutingTable,
    pub in_flight: InFlightLru,
    pub dispatcher: Dispatcher,
    pub lookup: Option<LookupState>,
}

impl DaemonState {
    /// Load persisted routing state from `routes_path` if present,
    /// otherwise start fresh under a random `self_id`.
    pub fn load_or_new(routes_path: &Path) -> Self {
        let routing_table = if routes_path.exists() {
            match RoutingTable::read_file(routes_path, K) {
                Ok(table) => table,
                Err(err) => {
                    tracing::warn!(%err, path = %routes_path.display(), "failed to load routing state, starting fresh");
                    RoutingTable::with_default_k(Guid::random())
                }
            }
        } else {
            RoutingTable::with_default_k(Guid::random())
        };
        let self_id = routing_table.self_id();
        Self {
            self_id,
            routing_table,
            in_flight: InFlightLru::default(),
            dispatcher: Dispatcher::new(self_id),
            lookup: None,
        }
    }

    pub fn persist(&self, routes_path: &Path) -> anyhow::Result<()> {
        self.routing_table.write_file(routes_path)?;
        Ok(())
    }

    /// Seed the routing table with bootstrap peers and start an initial
    /// lookup for `self_id`, the standard Kademlia join procedure.
    pub fn bootstrap(&mut self, nodes: Vec<NodeInfo>, now: u64) {
        for node in nodes {
            let _ = self.routing_table.upsert(node, now);
        }
        self.start_lookup(self.self_id);
    }

    pub fn start_lookup(&mut self, target: Guid) {
        self.lookup = Some(LookupState::new(target, ALPHA, K, &self.routing_table));
    }
}

/// Load the bootstrap-nodes file (spec §6): a top-level bencode list of
/// compact node-info strings.
pub fn load_bootstrap_nodes(path: &Path) -> anyhow::Result<Vec<NodeInfo>> {
    let bytes = std::fs::read(path)?;
    let value = bencode::decode(&bytes)?;
    let list = value
        .as_list()
        .ok_or_else(|| anyhow::anyhow!("bootstrap nodes file is not a bencode list"))?;
    let mut nodes = Vec::with_capacity(list.len());
    for item in list {
        let Some(raw) = item.as_bytes() else {
            continue;
        };
        match decode_compact_node(raw) {
            Ok(info) => nodes.push(info),
            Err(err) => tracing::warn!(%err, "skipping malformed bootstrap node entry"),
        }
    }
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_or_new_without_a_file_starts_fresh() {
        let dir = std::env::temp_dir().join(format!("kad-daemon-state-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("test fixture");
        let path = dir.join("routes.dat");

        let state = DaemonState::load_or_new(&path);
        assert!(state.routing_table.is_empty());
        assert!(state.self_id.is_set());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn persist_then_reload_preserves_self_id() {
        let dir = std::env::temp_dir().join(format!("kad-daemon-state-test2-{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("test fixture");
        let path = dir.join("routes.dat");

        let state = DaemonState::load_or_new(&path);
        let original_id = state.self_id;
        state.persist(&path).expect("test fixture");

        let reloaded = DaemonState::load_or_new(&path);
        assert_eq!(reloaded.self_id, original_id, "restart must not randomize the node's identity");

        std::fs::remove_dir_all(&dir).ok();
    }
}
