//! Backends supplying node records to the mesh, and the translation of those records into
//! [`meshwork_topology::Node`]s.

pub mod file;
pub mod memory;
pub mod record;
pub mod translate;

use std::{io, path::PathBuf, sync::mpsc, sync::Arc};

use miette::Diagnostic;
use thiserror::Error;

pub use file::FileBackend;
pub use memory::MemoryBackend;
pub use record::{DerivedFields, NodeRecord};
pub use translate::translate;

/// A change to one node record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Identity of the node.
    pub name: String,

    /// The new record, or `None` if the node was deleted.
    pub record: Option<NodeRecord>,
}

/// A source of node records.
pub trait Backend {
    type Error: std::error::Error + Send + Sync + 'static;

    /// All current records.
    fn list(&self) -> Result<Vec<NodeRecord>, Self::Error>;

    /// Subscribe to changes.
    ///
    /// Events for one node arrive in order. The stream ends when the sender side is dropped,
    /// which means the backend can no longer deliver changes.
    fn watch(&self) -> Result<mpsc::Receiver<Event>, Self::Error>;

    /// Store fields derived by the mesh on a node's record.
    fn set(&self, name: &str, fields: &DerivedFields) -> Result<(), Self::Error>;
}

impl<B: Backend + ?Sized> Backend for Arc<B> {
    type Error = B::Error;

    fn list(&self) -> Result<Vec<NodeRecord>, Self::Error> {
        (**self).list()
    }

    fn watch(&self) -> Result<mpsc::Receiver<Event>, Self::Error> {
        (**self).watch()
    }

    fn set(&self, name: &str, fields: &DerivedFields) -> Result<(), Self::Error> {
        (**self).set(name, fields)
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum Error {
    #[error("no node named `{name}`")]
    #[diagnostic(code(meshwork::backend::unknown_node))]
    UnknownNode { name: String },

    #[error("failed to read node records from {path:?}")]
    #[diagnostic(code(meshwork::backend::read_failed))]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse node records in {path:?}")]
    #[diagnostic(code(meshwork::backend::parse_failed))]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("backend is closed")]
    #[diagnostic(code(meshwork::backend::closed))]
    Closed,
}
