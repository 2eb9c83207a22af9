use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
    sync::mpsc,
};

use serde::Deserialize;

use crate::{
    record::DERIVED_ANNOTATIONS, Backend, DerivedFields, Error, Event, MemoryBackend, NodeRecord,
};

/// Node records read from a TOML file.
///
/// The file is only read on [`FileBackend::refresh`]; changes between refreshes are turned into
/// watch events. Derived fields stored through [`Backend::set`] live in memory and survive
/// refreshes, unless the file sets them itself.
#[derive(Debug)]
pub struct FileBackend {
    /// Path of the records file.
    path: PathBuf,

    /// The records as of the last refresh.
    memory: MemoryBackend,
}

/// Layout of the records file.
#[derive(Debug, Deserialize)]
struct NodesFile {
    #[serde(default, rename = "node")]
    nodes: Vec<NodeRecord>,
}

/// Statistics on the records added, updated, removed and kept during a refresh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshStats {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub kept: usize,
}

impl FileBackend {
    /// Open a records file and read it for the first time.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let backend = Self {
            path: path.into(),
            memory: MemoryBackend::new(),
        };
        backend.refresh()?;

        Ok(backend)
    }

    /// Path of the records file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the file again and publish the differences.
    ///
    /// If the file cannot be read or parsed, nothing changes.
    pub fn refresh(&self) -> Result<RefreshStats, Error> {
        let text = fs::read_to_string(&self.path).map_err(|source| Error::Read {
            path: self.path.clone(),
            source,
        })?;
        let file: NodesFile = toml::from_str(&text).map_err(|source| Error::Parse {
            path: self.path.clone(),
            source,
        })?;

        let mut stats = RefreshStats::default();
        let mut seen = BTreeSet::new();

        for mut record in file.nodes {
            seen.insert(record.name.clone());

            match self.memory.get(&record.name) {
                Some(existing) => {
                    for key in DERIVED_ANNOTATIONS {
                        if let Some(value) = existing.annotations.get(key) {
                            record
                                .annotations
                                .entry(key.to_owned())
                                .or_insert_with(|| value.clone());
                        }
                    }

                    if existing == record {
                        stats.kept += 1;
                        continue;
                    }
                    stats.updated += 1;
                }
                None => stats.added += 1,
            }

            self.memory.upsert(record);
        }

        for name in self.memory.names() {
            if !seen.contains(&name) {
                self.memory.delete(&name);
                stats.removed += 1;
            }
        }

        log::debug!("refreshed node records from {:?}: {stats:?}", self.path);

        Ok(stats)
    }
}

impl Backend for FileBackend {
    type Error = Error;

    fn list(&self) -> Result<Vec<NodeRecord>, Error> {
        self.memory.list()
    }

    fn watch(&self) -> Result<mpsc::Receiver<Event>, Error> {
        self.memory.watch()
    }

    fn set(&self, name: &str, fields: &DerivedFields) -> Result<(), Error> {
        self.memory.set(name, fields)
    }
}
