use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    process,
    sync::atomic::{AtomicU64, Ordering},
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use cidr::IpCidr;
use meshwork_reconcile::Applier;
use meshwork_topology::{NodeConfig, NodeDelta};
use miette::Diagnostic;
use thiserror::Error;

/// A node's configuration in WireGuard's INI format.
pub struct Rendered<'c> {
    pub config: &'c NodeConfig,
    pub port: u16,
}

impl fmt::Display for Rendered<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let address = self.config.address;

        writeln!(f, "# {}", self.config.name)?;
        writeln!(f, "[Interface]")?;
        writeln!(
            f,
            "Address = {}/{}",
            address.address(),
            address.network_length()
        )?;
        writeln!(f, "ListenPort = {}", self.port)?;

        for peer in self.config.peers.values() {
            writeln!(f)?;
            writeln!(f, "# {}", peer.name)?;
            writeln!(f, "[Peer]")?;
            writeln!(f, "PublicKey = {}", render_key(&peer.key))?;
            writeln!(f, "Endpoint = {}", peer.endpoint)?;

            let allowed_ips: Vec<_> = peer.allowed_ips.iter().map(render_cidr).collect();
            writeln!(f, "AllowedIPs = {}", allowed_ips.join(", "))?;
        }

        Ok(())
    }
}

/// Keys are opaque bytes; textual keys are written as they are.
fn render_key(key: &[u8]) -> String {
    match std::str::from_utf8(key) {
        Ok(key) => key.to_owned(),
        Err(_) => STANDARD.encode(key),
    }
}

fn render_cidr(cidr: &IpCidr) -> String {
    format!("{}/{}", cidr.first_address(), cidr.network_length())
}

/// Writes each node's configuration to `<dir>/<node>.conf`.
#[derive(Debug)]
pub struct ConfDirApplier {
    dir: PathBuf,
    port: u16,
}

impl ConfDirApplier {
    /// Create an applier writing into `dir`, creating it if needed.
    pub fn new(dir: impl Into<PathBuf>, port: u16) -> Result<Self, Error> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| Error::CreateDir {
            path: dir.clone(),
            source,
        })?;

        Ok(Self { dir, port })
    }

    /// Path of a node's configuration file.
    pub fn path(&self, node: &str) -> Result<PathBuf, Error> {
        let valid = !node.is_empty()
            && !node.starts_with('.')
            && !node.contains(|c: char| c == '/' || c == '\\' || c == '\0');
        if !valid {
            return Err(Error::InvalidName {
                name: node.to_owned(),
            });
        }

        Ok(self.dir.join(format!("{node}.conf")))
    }

    /// Replace the file at `path` in one step, so readers never see a partial configuration.
    ///
    /// Every write goes through its own temporary file, which node names cannot collide with.
    fn write_atomic(path: &Path, contents: &str) -> io::Result<()> {
        static WRITES: AtomicU64 = AtomicU64::new(0);

        let file_name = path.file_name().unwrap_or_default().to_string_lossy();
        let tmp = path.with_file_name(format!(
            ".{file_name}.{}.{}.tmp",
            process::id(),
            WRITES.fetch_add(1, Ordering::Relaxed)
        ));

        fs::write(&tmp, contents)?;
        fs::rename(&tmp, path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            e
        })
    }
}

impl Applier for ConfDirApplier {
    type Error = Error;

    fn apply(&self, delta: &NodeDelta) -> Result<(), Error> {
        let path = self.path(&delta.name)?;

        match delta.config() {
            Some(config) => {
                let rendered = Rendered {
                    config,
                    port: self.port,
                }
                .to_string();

                Self::write_atomic(&path, &rendered)
                    .map_err(|source| Error::Write { path, source })?;
                log::debug!("wrote configuration of `{}`", delta.name);
            }
            None => match fs::remove_file(&path) {
                Ok(()) => log::debug!("removed configuration of `{}`", delta.name),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(source) => return Err(Error::Remove { path, source }),
            },
        }

        Ok(())
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum Error {
    #[error("failed to create configuration directory {path:?}")]
    #[diagnostic(code(meshwork::conf::create_dir_failed))]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("node name `{name}` cannot be used as a file name")]
    #[diagnostic(code(meshwork::conf::invalid_name))]
    InvalidName { name: String },

    #[error("failed to write configuration to {path:?}")]
    #[diagnostic(code(meshwork::conf::write_failed))]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to remove configuration {path:?}")]
    #[diagnostic(code(meshwork::conf::remove_failed))]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
