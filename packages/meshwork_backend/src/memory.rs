use std::{
    collections::BTreeMap,
    sync::{mpsc, Mutex, MutexGuard, PoisonError},
};

use crate::{Backend, DerivedFields, Error, Event, NodeRecord};

/// An in-process store of node records.
///
/// Every change is broadcast to all live watchers. Watchers whose receiver was dropped are
/// forgotten on the next broadcast.
#[derive(Debug)]
pub struct MemoryBackend {
    /// Records, by name.
    records: Mutex<BTreeMap<String, NodeRecord>>,

    /// Senders of live watch streams. `None` once the backend is closed.
    watchers: Mutex<Option<Vec<mpsc::Sender<Event>>>>,
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self {
            records: Mutex::new(BTreeMap::new()),
            watchers: Mutex::new(Some(Vec::new())),
        }
    }

    /// Insert or replace a record.
    pub fn upsert(&self, record: NodeRecord) {
        let mut records = lock(&self.records);

        log::trace!("upserting node record `{}`", record.name);
        records.insert(record.name.clone(), record.clone());

        self.broadcast(Event {
            name: record.name.clone(),
            record: Some(record),
        });
    }

    /// Delete a record, returning it if it existed.
    pub fn delete(&self, name: &str) -> Option<NodeRecord> {
        let mut records = lock(&self.records);

        let removed = records.remove(name)?;
        log::trace!("deleted node record `{name}`");

        self.broadcast(Event {
            name: name.to_owned(),
            record: None,
        });

        Some(removed)
    }

    /// Get a copy of a record.
    pub fn get(&self, name: &str) -> Option<NodeRecord> {
        lock(&self.records).get(name).cloned()
    }

    /// Names of all records.
    pub fn names(&self) -> Vec<String> {
        lock(&self.records).keys().cloned().collect()
    }

    /// End every watch stream and refuse new ones, as if the connection to the backend was lost.
    pub fn close(&self) {
        log::debug!("closing memory backend");
        *lock(&self.watchers) = None;
    }

    /// Accept watchers again after [`MemoryBackend::close`].
    pub fn reopen(&self) {
        lock(&self.watchers).get_or_insert_with(Vec::new);
    }

    /// Send an event to every watcher. Must be called with the records lock held, so that
    /// events for one node are delivered in the order the changes were made.
    fn broadcast(&self, event: Event) {
        if let Some(watchers) = lock(&self.watchers).as_mut() {
            watchers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for MemoryBackend {
    type Error = Error;

    fn list(&self) -> Result<Vec<NodeRecord>, Error> {
        Ok(lock(&self.records).values().cloned().collect())
    }

    fn watch(&self) -> Result<mpsc::Receiver<Event>, Error> {
        let (tx, rx) = mpsc::channel();

        lock(&self.watchers).as_mut().ok_or(Error::Closed)?.push(tx);

        Ok(rx)
    }

    fn set(&self, name: &str, fields: &DerivedFields) -> Result<(), Error> {
        let mut records = lock(&self.records);

        let record = records.get_mut(name).ok_or_else(|| Error::UnknownNode {
            name: name.to_owned(),
        })?;
        fields.apply_to(record);
        let record = record.clone();

        self.broadcast(Event {
            name: name.to_owned(),
            record: Some(record),
        });

        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
