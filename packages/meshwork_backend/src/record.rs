use std::collections::BTreeMap;

use cidr::IpInet;
use serde::{Deserialize, Serialize};

/// Annotation holding the node's publicly reachable address.
pub const EXTERNAL_IP_ANNOTATION: &str = "meshwork.io/external-ip";

/// Annotation that replaces [`EXTERNAL_IP_ANNOTATION`] when it holds a valid address.
pub const FORCE_EXTERNAL_IP_ANNOTATION: &str = "meshwork.io/force-external-ip";

/// Annotation holding the node's address on its local network.
pub const INTERNAL_IP_ANNOTATION: &str = "meshwork.io/internal-ip";

/// Annotation holding the node's public key.
pub const KEY_ANNOTATION: &str = "meshwork.io/key";

/// Annotation whose presence asks for the node to lead its segment.
pub const LEADER_ANNOTATION: &str = "meshwork.io/leader";

/// Annotation that overrides the region label as the node's location.
pub const LOCATION_ANNOTATION: &str = "meshwork.io/location";

/// Annotation holding the node's overlay address, written back by the reconciler.
pub const OVERLAY_IP_ANNOTATION: &str = "meshwork.io/overlay-ip";

/// Well-known label for the node's region.
pub const REGION_LABEL: &str = "topology.kubernetes.io/region";

/// Annotations written through [`crate::Backend::set`] rather than by the node's owner.
pub const DERIVED_ANNOTATIONS: [&str; 1] = [OVERLAY_IP_ANNOTATION];

/// A node as stored by the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Identity of the node.
    pub name: String,

    #[serde(default)]
    pub annotations: BTreeMap<String, String>,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// The workload subnet assigned to the node.
    #[serde(default)]
    pub pod_cidr: Option<String>,
}

/// Fields derived by the mesh that are stored back on a node's record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DerivedFields {
    /// The overlay address assigned to the node.
    pub overlay_ip: Option<IpInet>,
}

impl DerivedFields {
    /// Write the fields into a record's annotations. Absent fields are left untouched.
    pub fn apply_to(&self, record: &mut NodeRecord) {
        if let Some(overlay_ip) = self.overlay_ip {
            record.annotations.insert(
                OVERLAY_IP_ANNOTATION.to_owned(),
                format!("{}/{}", overlay_ip.address(), overlay_ip.network_length()),
            );
        }
    }
}
