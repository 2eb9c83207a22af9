use cidr::{IpCidr, IpInet};
use meshwork_topology::Node;

use crate::record::*;

/// Translate a backend record into a [`Node`].
///
/// Never fails: a field that is missing or does not parse is absent on the node.
pub fn translate(record: &NodeRecord) -> Node {
    let annotation = |key: &str| record.annotations.get(key).map(String::as_str);

    // A valid forced address wins outright; an invalid one is ignored.
    let external_ip = annotation(FORCE_EXTERNAL_IP_ANNOTATION)
        .and_then(parse_inet)
        .or_else(|| annotation(EXTERNAL_IP_ANNOTATION).and_then(parse_inet));

    let location = annotation(LOCATION_ANNOTATION)
        .or_else(|| record.labels.get(REGION_LABEL).map(String::as_str))
        .unwrap_or_default();

    Node {
        name: record.name.clone(),
        external_ip,
        internal_ip: annotation(INTERNAL_IP_ANNOTATION).and_then(parse_inet),
        key: annotation(KEY_ANNOTATION).map(|key| key.as_bytes().to_vec()),
        location: location.to_owned(),
        subnet: record.pod_cidr.as_deref().and_then(parse_subnet),
        leader: annotation(LEADER_ANNOTATION).is_some(),
        overlay_ip: annotation(OVERLAY_IP_ANNOTATION).and_then(parse_inet),
    }
}

/// Parse an address with an explicit prefix length, keeping the host part.
pub fn parse_inet(s: &str) -> Option<IpInet> {
    if !s.contains('/') {
        return None;
    }

    s.trim().parse().ok()
}

/// Parse a network, zeroing any host bits.
pub fn parse_subnet(s: &str) -> Option<IpCidr> {
    parse_inet(s).map(|inet| inet.network())
}
