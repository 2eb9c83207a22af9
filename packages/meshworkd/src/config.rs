use std::{path::PathBuf, time::Duration};

use cidr::IpCidr;
use meshwork_topology::{Granularity, DEFAULT_PORT};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};

/// Meshwork daemon configuration.
#[serde_as]
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Meshwork {
    /// Pool that overlay addresses are assigned from.
    pub overlay_cidr: IpCidr,

    /// How nodes are grouped into segments.
    #[serde(default)]
    pub granularity: Granularity,

    /// Port every node's tunnel endpoint listens on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// File holding the node records.
    #[serde(default = "default_nodes_file")]
    pub nodes_file: PathBuf,

    /// Directory node configurations are written to.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Maximum time to wait for one node's configuration to be written.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_apply_timeout")]
    pub apply_timeout: Duration,

    /// Time between re-reads of the node records file.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: Duration,
}

impl Meshwork {
    /// Options for the reconciliation loop.
    pub fn reconcile_options(&self) -> meshwork_reconcile::Options {
        meshwork_reconcile::Options {
            topology: meshwork_topology::Options {
                granularity: self.granularity,
                port: self.port,
            },
            apply_timeout: self.apply_timeout,
            ..meshwork_reconcile::Options::default()
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_nodes_file() -> PathBuf {
    PathBuf::from("nodes.toml")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("conf")
}

fn default_apply_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(5)
}
