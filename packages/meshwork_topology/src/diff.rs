use std::collections::BTreeSet;

use crate::topology::{NodeConfig, Topology};

/// What has to change on one node to move it from the current to the desired topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDelta {
    /// Name of the node.
    pub name: String,

    /// The change.
    pub change: Change,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// Bring the node to a new configuration.
    Configure {
        /// The complete desired configuration.
        config: NodeConfig,

        /// Whether the node's own overlay address changed, or the node is new.
        readdressed: bool,

        /// Peers that are new.
        added: BTreeSet<String>,

        /// Peers that are gone.
        removed: BTreeSet<String>,

        /// Peers whose endpoint, allowed IPs or key changed.
        changed: BTreeSet<String>,
    },

    /// Tear down the node's configuration.
    Remove,
}

impl NodeDelta {
    /// The desired configuration, unless the node is being removed.
    pub fn config(&self) -> Option<&NodeConfig> {
        match &self.change {
            Change::Configure { config, .. } => Some(config),
            Change::Remove => None,
        }
    }
}

/// Compute the per-node changes from `current` to `desired`.
///
/// Nodes whose configuration is the same in both produce no delta. Deltas are ordered by name.
pub fn diff(current: &Topology, desired: &Topology) -> Vec<NodeDelta> {
    let mut deltas = Vec::new();

    for (name, config) in &desired.nodes {
        let Some(old) = current.nodes.get(name) else {
            deltas.push(NodeDelta {
                name: name.clone(),
                change: Change::Configure {
                    config: config.clone(),
                    readdressed: true,
                    added: config.peers.keys().cloned().collect(),
                    removed: BTreeSet::new(),
                    changed: BTreeSet::new(),
                },
            });
            continue;
        };

        if old == config {
            continue;
        }

        let added = config
            .peers
            .keys()
            .filter(|peer| !old.peers.contains_key(*peer))
            .cloned()
            .collect();
        let removed = old
            .peers
            .keys()
            .filter(|peer| !config.peers.contains_key(*peer))
            .cloned()
            .collect();
        let changed = config
            .peers
            .iter()
            .filter(|&(peer, new)| old.peers.get(peer).is_some_and(|old| old != new))
            .map(|(peer, _)| peer.clone())
            .collect();

        deltas.push(NodeDelta {
            name: name.clone(),
            change: Change::Configure {
                config: config.clone(),
                readdressed: old.address != config.address,
                added,
                removed,
                changed,
            },
        });
    }

    deltas.extend(
        current
            .nodes
            .keys()
            .filter(|name| !desired.nodes.contains_key(*name))
            .map(|name| NodeDelta {
                name: name.clone(),
                change: Change::Remove,
            }),
    );
    deltas.sort_by(|a, b| a.name.cmp(&b.name));

    deltas
}
