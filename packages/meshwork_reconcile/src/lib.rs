//! The reconciliation loop of a meshwork overlay.
//!
//! A [`Reconciler`] tracks the nodes of a [`Backend`], rebuilds the topology whenever a node
//! changes in a way that matters, and pushes the differences to an [`Applier`]. The applied
//! topology only advances once every difference was applied, so a failed pass is simply retried.

pub mod apply;

use std::{
    collections::{BTreeMap, BTreeSet},
    error::Error as StdError,
    sync::{atomic::AtomicBool, atomic::Ordering, mpsc, Arc},
    time::Duration,
};

use arc_swap::ArcSwap;
use meshwork_backend::{translate, Backend, DerivedFields, Event};
use meshwork_topology::{build, diff, Allocator, Change, Node, NodeDelta, Topology};
use miette::Diagnostic;
use thiserror::Error;

use apply::Applies;
pub use apply::{Applier, ApplyError};

/// Options of the reconciliation loop.
#[derive(Debug, Clone)]
pub struct Options {
    /// Options for building topologies.
    pub topology: meshwork_topology::Options,

    /// How long a single node's configuration may take to apply before it counts as failed.
    pub apply_timeout: Duration,

    /// How long to wait for an event before checking for shutdown and retrying failed passes.
    pub tick: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            topology: meshwork_topology::Options::default(),
            apply_timeout: Duration::from_secs(10),
            tick: Duration::from_millis(100),
        }
    }
}

/// Keeps the applied configuration in line with the nodes of a backend.
pub struct Reconciler<B, A> {
    backend: B,
    applier: Arc<A>,
    allocator: Arc<Allocator>,
    options: Options,

    /// Every node known to the backend, ready or not, by name.
    nodes: BTreeMap<String, Node>,

    /// The topology that is currently applied.
    current: Arc<Topology>,

    /// Where the current topology is published for other threads.
    published: Arc<ArcSwap<Topology>>,

    /// Applies that failed or are still running, by node.
    applies: Applies,

    /// Whether the last pass left something to retry.
    retry: bool,
}

/// A read handle on the topology a [`Reconciler`] has applied.
#[derive(Clone)]
pub struct Snapshot(Arc<ArcSwap<Topology>>);

impl Snapshot {
    /// The latest applied topology.
    pub fn load(&self) -> Arc<Topology> {
        self.0.load_full()
    }
}

/// Statistics on what a reconciliation pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassStats {
    /// Deltas that were applied.
    pub applied: usize,

    /// Deltas that failed or timed out.
    pub failed: usize,

    /// Deltas held back because an earlier apply of the same node is still running.
    pub busy: usize,

    /// Overlay addresses written back to the backend.
    pub written: usize,

    /// Overlay addresses that could not be written back.
    pub write_failed: usize,

    /// Nodes left out because no overlay address was available.
    pub unassigned: usize,

    /// Whether the built topology became the current one.
    pub committed: bool,
}

impl<B, A> Reconciler<B, A>
where
    B: Backend,
    A: Applier,
{
    /// Create a reconciler. Nothing is considered applied yet.
    pub fn new(backend: B, applier: A, allocator: Arc<Allocator>, options: Options) -> Self {
        let current = Arc::new(Topology::default());

        Self {
            backend,
            applier: Arc::new(applier),
            allocator,
            options,
            nodes: BTreeMap::new(),
            published: Arc::new(ArcSwap::new(current.clone())),
            current,
            applies: Applies::default(),
            retry: false,
        }
    }

    /// A handle on the applied topology, readable from any thread.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot(self.published.clone())
    }

    /// The topology that is currently applied.
    pub fn current(&self) -> &Topology {
        &self.current
    }

    /// Take in one backend event, returning whether it changed a tracked node.
    ///
    /// Deleting a node gives its overlay address back to the allocator.
    pub fn observe(&mut self, event: Event) -> bool {
        match event.record {
            Some(record) => {
                let node = translate(&record);
                if self.nodes.get(&event.name) == Some(&node) {
                    return false;
                }

                log::trace!("node `{}` changed: {node:?}", event.name);
                self.nodes.insert(event.name, node);
                true
            }
            None => {
                if self.nodes.remove(&event.name).is_none() {
                    return false;
                }

                match self.allocator.release(&event.name) {
                    Some(address) => {
                        log::debug!("node `{}` is gone, released {address}", event.name)
                    }
                    None => log::debug!("node `{}` is gone", event.name),
                }
                true
            }
        }
    }

    /// Build the topology of the tracked nodes and apply its differences from the current one.
    pub fn pass(&mut self) -> PassStats {
        let desired = build(self.nodes.values(), &self.allocator, &self.options.topology);

        let mut stats = PassStats {
            unassigned: desired.unassigned.len(),
            ..PassStats::default()
        };

        for (name, &address) in &desired.assigned {
            let fields = DerivedFields {
                overlay_ip: Some(address),
            };

            match self.backend.set(name, &fields) {
                Ok(()) => stats.written += 1,
                Err(e) => {
                    log::warn!("failed to write overlay address {address} of `{name}`: {e}");
                    stats.write_failed += 1;
                }
            }
        }

        self.applies.reap();

        for delta in self.deltas(&desired) {
            match self
                .applies
                .start(&self.applier, &delta, self.options.apply_timeout)
            {
                Ok(()) => {
                    log::trace!("applied {delta:?}");
                    stats.applied += 1;
                }
                Err(ApplyError::Busy { node }) => {
                    log::debug!("holding back configuration of `{node}` until its last apply ends");
                    stats.busy += 1;
                }
                Err(e) => {
                    log::warn!("{e}{}", source_suffix(&e));
                    stats.failed += 1;
                }
            }
        }

        if stats.failed == 0 && stats.busy == 0 {
            for segment in &desired.segments {
                let previous = self.current.segment(&segment.location);
                if previous.map(|s| &s.leader) != Some(&segment.leader) {
                    log::info!(
                        "`{}` leads segment `{}` ({:?})",
                        segment.leader,
                        segment.location,
                        segment.election
                    );
                }
            }

            self.current = Arc::new(desired);
            self.published.store(self.current.clone());
            stats.committed = true;
        }

        self.retry = stats.failed > 0 || stats.busy > 0 || stats.write_failed > 0;

        stats
    }

    /// The deltas from the current to the desired topology, plus a full reapply of every node
    /// whose last apply did not succeed.
    fn deltas(&self, desired: &Topology) -> Vec<NodeDelta> {
        let mut deltas = diff(&self.current, desired);

        for name in self.applies.unsettled() {
            if deltas.iter().any(|delta| &delta.name == name) {
                continue;
            }

            let change = match desired.nodes.get(name) {
                Some(config) => Change::Configure {
                    config: config.clone(),
                    readdressed: true,
                    added: config.peers.keys().cloned().collect(),
                    removed: BTreeSet::new(),
                    changed: BTreeSet::new(),
                },
                None => Change::Remove,
            };
            deltas.push(NodeDelta {
                name: name.clone(),
                change,
            });
        }
        deltas.sort_by(|a, b| a.name.cmp(&b.name));

        deltas
    }

    /// Reconcile until `shutdown` is set or the backend's event stream ends.
    ///
    /// The stream ending is an error: the caller is expected to start over with a new
    /// reconciler, since everything is rederived from the backend.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<(), Error> {
        let events = self.backend.watch().map_err(Error::backend)?;
        for record in self.backend.list().map_err(Error::backend)? {
            self.observe(Event {
                name: record.name.clone(),
                record: Some(record),
            });
        }

        log::info!("reconciling {} nodes", self.nodes.len());

        let mut dirty = true;
        loop {
            if shutdown.load(Ordering::Relaxed) {
                log::info!("received shutdown signal, stopping reconciliation");
                return Ok(());
            }

            match events.recv_timeout(self.options.tick) {
                Ok(event) => {
                    dirty |= self.observe(event);

                    // Coalesce everything already queued into one pass.
                    for event in events.try_iter() {
                        dirty |= self.observe(event);
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => return Err(Error::StreamClosed),
            }

            if dirty || self.retry {
                dirty = false;

                let stats = self.pass();
                if stats.committed {
                    log::debug!("reconciliation pass committed: {stats:?}");
                } else {
                    log::debug!("reconciliation pass will be retried: {stats:?}");
                }
            }
        }
    }
}

fn source_suffix(e: &ApplyError) -> String {
    e.source().map(|s| format!(": {s}")).unwrap_or_default()
}

#[derive(Debug, Error, Diagnostic)]
pub enum Error {
    #[error("backend failed")]
    #[diagnostic(code(meshwork::reconcile::backend))]
    Backend(#[source] Box<dyn StdError + Send + Sync>),

    #[error("backend event stream closed")]
    #[diagnostic(
        code(meshwork::reconcile::stream_closed),
        help("the topology is rederived from the backend, so reconciliation can be restarted")
    )]
    StreamClosed,
}

impl Error {
    fn backend(e: impl StdError + Send + Sync + 'static) -> Self {
        Self::Backend(Box::new(e))
    }
}
