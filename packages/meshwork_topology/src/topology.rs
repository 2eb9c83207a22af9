use std::{
    collections::{BTreeMap, BTreeSet},
    net::{IpAddr, SocketAddr},
};

use cidr::{IpCidr, IpInet};
use serde::{Deserialize, Serialize};

use crate::{allocator::Allocator, node::Node};

/// Port tunnel endpoints listen on, unless configured otherwise.
pub const DEFAULT_PORT: u16 = 51820;

/// How nodes are grouped into segments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    /// Nodes sharing a location form one segment, reached through its leader.
    #[default]
    Location,

    /// Every node is its own segment, so every node is reached on its external address.
    Full,
}

/// Options for building a topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    /// How nodes are grouped into segments.
    pub granularity: Granularity,

    /// Port every node's tunnel endpoint listens on.
    pub port: u16,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            granularity: Granularity::default(),
            port: DEFAULT_PORT,
        }
    }
}

/// An immutable snapshot of the mesh.
///
/// Every collection is ordered, so two snapshots built from the same nodes compare equal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    /// Segments, ordered by location.
    pub segments: Vec<Segment>,

    /// Tunnel configuration of every node that takes part, by name.
    pub nodes: BTreeMap<String, NodeConfig>,

    /// Ready nodes left out because no overlay address could be assigned to them.
    pub unassigned: BTreeSet<String>,

    /// Overlay addresses the backend does not know about yet, by node name.
    pub assigned: BTreeMap<String, IpInet>,
}

/// A group of co-located nodes, reached from outside through its leader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// The location shared by the members. Under [`Granularity::Full`], the name of the only member.
    pub location: String,

    /// Name of the elected leader.
    pub leader: String,

    /// How the leader was elected.
    pub election: Election,

    /// Names of the members, in order.
    pub members: Vec<String>,

    /// The leader's external endpoint.
    pub endpoint: SocketAddr,

    /// The leader's public key.
    pub key: Vec<u8>,

    /// Subnets, internal addresses and overlay addresses of every member.
    pub allowed_ips: BTreeSet<IpCidr>,
}

/// Outcome of a segment's leader election.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Election {
    /// Exactly one member asked to lead.
    Explicit,

    /// No member asked to lead, so the first member by name leads.
    Implicit,

    /// This many members asked to lead, and the first of them by name leads.
    Contested(usize),
}

/// Tunnel configuration of one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    /// Name of the node.
    pub name: String,

    /// Location of the node's segment.
    pub segment: String,

    /// Whether the node leads its segment.
    pub leader: bool,

    /// Address of the node on the overlay.
    pub address: IpInet,

    /// Peers, by name.
    pub peers: BTreeMap<String, Peer>,
}

/// A tunnel peer of some node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    /// Name of the peer node.
    pub name: String,

    /// Where to send packets for the peer.
    pub endpoint: SocketAddr,

    /// Destination ranges routed through the peer.
    pub allowed_ips: BTreeSet<IpCidr>,

    /// Public key of the peer.
    pub key: Vec<u8>,
}

impl Topology {
    /// The segment at a location.
    pub fn segment(&self, location: &str) -> Option<&Segment> {
        self.segments
            .iter()
            .find(|segment| segment.location == location)
    }

    /// The segment a node belongs to.
    pub fn segment_of(&self, name: &str) -> Option<&Segment> {
        self.segment(&self.nodes.get(name)?.segment)
    }
}

/// A ready node with an overlay address.
struct Member<'n> {
    node: &'n Node,
    external: IpAddr,
    internal: IpAddr,
    subnet: IpCidr,
    key: &'n [u8],
    address: IpInet,
}

impl<'n> Member<'n> {
    fn new(node: &'n Node, address: IpInet) -> Option<Self> {
        Some(Self {
            node,
            external: node.external_ip?.address(),
            internal: node.internal_ip?.address(),
            subnet: node.subnet?,
            key: node.key.as_deref()?,
            address,
        })
    }

    fn name(&self) -> &'n str {
        &self.node.name
    }

    /// Ranges the member is the destination for: its subnet, internal address and overlay address.
    fn routes(&self) -> [IpCidr; 3] {
        [
            self.subnet,
            IpCidr::new_host(self.internal),
            IpCidr::new_host(self.address.address()),
        ]
    }
}

/// Build a topology snapshot from a set of nodes.
///
/// Nodes that are not ready are ignored. Nodes without an overlay address get one from the
/// allocator; a node for which the pool is exhausted is left out of this snapshot and listed in
/// [`Topology::unassigned`], without affecting anyone else.
///
/// Nodes are identified by name. If several share a name, the last one wins.
pub fn build<'n>(
    nodes: impl IntoIterator<Item = &'n Node>,
    allocator: &Allocator,
    options: &Options,
) -> Topology {
    let nodes: BTreeMap<&str, &Node> = nodes
        .into_iter()
        .map(|node| (node.name.as_str(), node))
        .collect();

    let mut topology = Topology::default();

    // Claim the addresses on record first, so none of them is handed to another node.
    let mut claimed = BTreeMap::new();
    for node in nodes.values() {
        let Some(overlay_ip) = node.overlay_ip else {
            continue;
        };

        match allocator.claim(&node.name, overlay_ip.address()) {
            Ok(()) => {
                claimed.insert(node.name.as_str(), overlay_ip);
            }
            Err(e) => log::warn!("ignoring overlay address of `{}`: {e}", node.name),
        }
    }

    let mut grouped: BTreeMap<&str, Vec<Member>> = BTreeMap::new();
    for node in nodes.values().copied().filter(|node| node.is_ready()) {
        let address = match claimed.get(node.name.as_str()) {
            Some(&address) => address,
            None => match allocator.assign(&node.name) {
                Ok(address) => {
                    topology.assigned.insert(node.name.clone(), address);
                    address
                }
                Err(e) => {
                    log::warn!("leaving `{}` out of the topology: {e}", node.name);
                    topology.unassigned.insert(node.name.clone());
                    continue;
                }
            },
        };

        let Some(member) = Member::new(node, address) else {
            continue;
        };

        let key = match options.granularity {
            Granularity::Location => node.location.as_str(),
            Granularity::Full => node.name.as_str(),
        };
        grouped.entry(key).or_default().push(member);
    }

    let segments: Vec<(Segment, Vec<Member>)> = grouped
        .into_iter()
        .map(|(location, members)| {
            (segment(location, &members, options.port), members)
        })
        .collect();

    for (index, (segment, members)) in segments.iter().enumerate() {
        // Everything outside the segment, which is only reachable through its leader.
        let beyond: BTreeSet<IpCidr> = segments
            .iter()
            .enumerate()
            .filter(|&(other, _)| other != index)
            .flat_map(|(_, (remote, _))| remote.allowed_ips.iter().copied())
            .collect();

        for member in members {
            let is_leader = segment.leader == member.name();
            let mut peers = BTreeMap::new();

            // Within a segment, everyone talks to everyone on their internal addresses.
            // Non-leaders send traffic for other segments to their own leader.
            for other in members.iter().filter(|other| other.name() != member.name()) {
                let mut allowed_ips: BTreeSet<IpCidr> = other.routes().into_iter().collect();
                if !is_leader && other.name() == segment.leader {
                    allowed_ips.extend(beyond.iter().copied());
                }

                peers.insert(
                    other.name().to_owned(),
                    Peer {
                        name: other.name().to_owned(),
                        endpoint: SocketAddr::new(other.internal, options.port),
                        allowed_ips,
                        key: other.key.to_vec(),
                    },
                );
            }

            // Leaders peer each other on their external addresses.
            if is_leader {
                for (_, (remote, _)) in segments
                    .iter()
                    .enumerate()
                    .filter(|&(other, _)| other != index)
                {
                    peers.insert(
                        remote.leader.clone(),
                        Peer {
                            name: remote.leader.clone(),
                            endpoint: remote.endpoint,
                            allowed_ips: remote.allowed_ips.clone(),
                            key: remote.key.clone(),
                        },
                    );
                }
            }

            topology.nodes.insert(
                member.name().to_owned(),
                NodeConfig {
                    name: member.name().to_owned(),
                    segment: segment.location.clone(),
                    leader: is_leader,
                    address: member.address,
                    peers,
                },
            );
        }
    }

    topology.segments = segments.into_iter().map(|(segment, _)| segment).collect();

    log::debug!(
        "built topology of {} segments over {} nodes ({} left out)",
        topology.segments.len(),
        topology.nodes.len(),
        topology.unassigned.len()
    );

    topology
}

/// Form a segment from its members, which must be non-empty and ordered by name.
fn segment(location: &str, members: &[Member], port: u16) -> Segment {
    let (leader, election) = elect(location, members);

    Segment {
        location: location.to_owned(),
        leader: leader.name().to_owned(),
        election,
        members: members.iter().map(|m| m.name().to_owned()).collect(),
        endpoint: SocketAddr::new(leader.external, port),
        key: leader.key.to_vec(),
        allowed_ips: members.iter().flat_map(|m| m.routes()).collect(),
    }
}

/// Elect the leader of a segment.
///
/// The first member by name that asked to lead wins; if nobody asked, the first member by name
/// leads. Members must be non-empty and ordered by name.
fn elect<'m, 'n>(location: &str, members: &'m [Member<'n>]) -> (&'m Member<'n>, Election) {
    let mut claims = members.iter().filter(|m| m.node.leader);

    match (claims.next(), claims.count()) {
        (Some(leader), 0) => (leader, Election::Explicit),
        (Some(leader), others) => {
            log::warn!(
                "{} nodes in segment `{location}` ask to lead; electing `{}`",
                others + 1,
                leader.name()
            );
            (leader, Election::Contested(others + 1))
        }
        (None, _) => {
            let leader = &members[0];
            log::debug!(
                "no node in segment `{location}` asks to lead; electing `{}`",
                leader.name()
            );
            (leader, Election::Implicit)
        }
    }
}
