use std::{
    collections::{BTreeMap, BTreeSet},
    error::Error as StdError,
    sync::{mpsc, Arc},
    thread,
    time::Duration,
};

use meshwork_topology::NodeDelta;
use miette::Diagnostic;
use thiserror::Error;

/// Pushes configuration to nodes.
///
/// Applying must be idempotent: applying a delta whose configuration is already in place is a
/// no-op. A delta is either applied completely or reported as failed.
pub trait Applier: Send + Sync + 'static {
    type Error: StdError + Send + Sync + 'static;

    fn apply(&self, delta: &NodeDelta) -> Result<(), Self::Error>;
}

impl<A: Applier> Applier for Arc<A> {
    type Error = A::Error;

    fn apply(&self, delta: &NodeDelta) -> Result<(), Self::Error> {
        (**self).apply(delta)
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum ApplyError {
    #[error("failed to apply configuration of `{node}`")]
    #[diagnostic(code(meshwork::reconcile::apply_failed))]
    Failed {
        node: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    #[error("applying configuration of `{node}` took longer than {timeout:?}")]
    #[diagnostic(code(meshwork::reconcile::apply_timed_out))]
    TimedOut { node: String, timeout: Duration },

    #[error("applier of `{node}` exited without a result")]
    #[diagnostic(code(meshwork::reconcile::applier_lost))]
    Lost { node: String },

    #[error("an earlier configuration of `{node}` is still being applied")]
    #[diagnostic(code(meshwork::reconcile::apply_busy))]
    Busy { node: String },

    #[error("failed to spawn applier thread")]
    #[diagnostic(code(meshwork::reconcile::spawn_failed))]
    Spawn(#[source] std::io::Error),
}

/// Tracks the applies started for each node, so that at most one runs per node at a time.
#[derive(Debug, Default)]
pub(crate) struct Applies {
    /// Applies that outlived their timeout and may still be running, by node.
    running: BTreeMap<String, mpsc::Receiver<()>>,

    /// Nodes whose last apply did not succeed, so their configuration is unknown.
    unsettled: BTreeSet<String>,
}

impl Applies {
    /// Forget timed-out applies that have since finished.
    pub(crate) fn reap(&mut self) {
        self.running.retain(|node, done| {
            let finished = !matches!(done.try_recv(), Err(mpsc::TryRecvError::Empty));
            if finished {
                log::debug!("late apply of `{node}` finished");
            }
            !finished
        });
    }

    /// Nodes whose configuration is unknown and must be applied again.
    pub(crate) fn unsettled(&self) -> &BTreeSet<String> {
        &self.unsettled
    }

    /// Whether an earlier apply of `node` may still be running.
    pub(crate) fn busy(&self, node: &str) -> bool {
        self.running.contains_key(node)
    }

    /// Apply one delta on its own thread, waiting at most `timeout` for it.
    ///
    /// Refused while an earlier apply of the same node is running. A timed-out apply keeps
    /// running in the background and blocks the node until it finishes.
    pub(crate) fn start<A: Applier>(
        &mut self,
        applier: &Arc<A>,
        delta: &NodeDelta,
        timeout: Duration,
    ) -> Result<(), ApplyError> {
        if self.busy(&delta.name) {
            return Err(ApplyError::Busy {
                node: delta.name.clone(),
            });
        }

        let result = self.run(applier, delta, timeout);
        if result.is_ok() {
            self.unsettled.remove(&delta.name);
        } else {
            self.unsettled.insert(delta.name.clone());
        }

        result
    }

    fn run<A: Applier>(
        &mut self,
        applier: &Arc<A>,
        delta: &NodeDelta,
        timeout: Duration,
    ) -> Result<(), ApplyError> {
        let (tx_result, rx_result) = mpsc::sync_channel(1);
        let (tx_done, rx_done) = mpsc::sync_channel(1);

        thread::Builder::new()
            .name(format!("apply-{}", delta.name))
            .spawn({
                let applier = applier.clone();
                let delta = delta.clone();
                move || {
                    let _ = tx_result.send(applier.apply(&delta));
                    let _ = tx_done.send(());
                }
            })
            .map_err(ApplyError::Spawn)?;

        match rx_result.recv_timeout(timeout) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ApplyError::Failed {
                node: delta.name.clone(),
                source: Box::new(e),
            }),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                self.running.insert(delta.name.clone(), rx_done);
                Err(ApplyError::TimedOut {
                    node: delta.name.clone(),
                    timeout,
                })
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(ApplyError::Lost {
                node: delta.name.clone(),
            }),
        }
    }
}
