use cidr::{IpCidr, IpInet};

/// A participant in the mesh, as far as topology computation is concerned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Node {
    /// Identity of the node, as given by the backend.
    pub name: String,

    /// Publicly reachable address of the node, with its prefix length.
    pub external_ip: Option<IpInet>,

    /// Address of the node on its local network, with its prefix length.
    pub internal_ip: Option<IpInet>,

    /// Public key of the node.
    ///
    /// `None` means the key is not known yet. An empty key is still a known key.
    pub key: Option<Vec<u8>>,

    /// Grouping label. Nodes with the same location form a segment.
    pub location: String,

    /// Workload subnet routed through the node, with its host bits zeroed.
    pub subnet: Option<IpCidr>,

    /// Whether the node is explicitly designated as its segment's leader.
    pub leader: bool,

    /// Address of the node on the overlay, if one was assigned in an earlier pass.
    pub overlay_ip: Option<IpInet>,
}

impl Node {
    /// Whether the node has everything it needs to take part in the topology.
    pub fn is_ready(&self) -> bool {
        self.external_ip.is_some()
            && self.internal_ip.is_some()
            && self.key.is_some()
            && self.subnet.is_some()
    }
}

/// Readiness of a node that might not exist.
pub fn ready(node: Option<&Node>) -> bool {
    node.is_some_and(Node::is_ready)
}
