use std::{
    collections::{BTreeMap, VecDeque},
    fmt,
    net::IpAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use meshwork_backend::{
    record::{
        EXTERNAL_IP_ANNOTATION, INTERNAL_IP_ANNOTATION, KEY_ANNOTATION, LOCATION_ANNOTATION,
        OVERLAY_IP_ANNOTATION,
    },
    Backend, Event, MemoryBackend, NodeRecord,
};
use meshwork_reconcile::*;
use meshwork_topology::{Allocator, Change, NodeConfig, NodeDelta};

/// Test that a first pass configures every ready node and a second pass does nothing.
#[test]
fn converges() {
    let (backend, applier, mut reconciler) = setup(&["a", "b", "c"]);
    observe_all(&mut reconciler, &backend);

    let stats = reconciler.pass();
    assert_eq!(stats.applied, 3, "every node should be configured");
    assert!(stats.committed, "a clean pass should commit");
    assert_eq!(reconciler.current().nodes.len(), 3);
    assert_eq!(applier.names(), ["a", "b", "c"]);

    applier.clear();
    let stats = reconciler.pass();
    assert_eq!(stats.applied, 0, "nothing changed, so nothing should be applied");
    assert_eq!(stats.failed, 0);
    assert!(stats.committed);
    assert!(applier.deltas().is_empty());
}

/// Test that assigned overlay addresses are written back, and that the resulting events
/// are not treated as relevant changes to the topology.
#[test]
fn writes_back_overlay_addresses() {
    let (backend, applier, mut reconciler) = setup(&["a", "b"]);
    let events = backend.watch().unwrap();
    observe_all(&mut reconciler, &backend);

    let stats = reconciler.pass();
    assert_eq!(stats.written, 2, "both addresses should be written back");

    assert_eq!(
        overlay_annotations(&backend),
        BTreeMap::from([
            ("a".to_owned(), "10.4.0.1/32".to_owned()),
            ("b".to_owned(), "10.4.0.2/32".to_owned()),
        ])
    );

    let mut relevant = false;
    for event in events.try_iter() {
        relevant |= reconciler.observe(event);
    }
    assert!(relevant, "the overlay address is part of the node");

    applier.clear();
    let stats = reconciler.pass();
    assert_eq!(stats.written, 0, "addresses on record should not be rewritten");
    assert_eq!(stats.applied, 0, "recording the address should not change the topology");
}

/// Test that seeing the same record twice is not a relevant change.
#[test]
fn unchanged_records_are_irrelevant() {
    let (backend, _, mut reconciler) = setup(&["a"]);
    let record = backend.get("a").unwrap();

    assert!(reconciler.observe(upsert(record.clone())));
    assert!(!reconciler.observe(upsert(record)));
    assert!(
        !reconciler.observe(Event {
            name: "unknown".to_owned(),
            record: None
        }),
        "deleting an untracked node is not a change"
    );
}

/// Test that a failing apply leaves the current topology alone and is retried.
#[test]
fn failed_apply_is_retried() {
    let (backend, applier, mut reconciler) = setup(&["a", "b"]);
    observe_all(&mut reconciler, &backend);

    applier.set_failing(true);
    let stats = reconciler.pass();
    assert_eq!(stats.failed, 2);
    assert!(!stats.committed, "a failed pass must not commit");
    assert!(reconciler.current().nodes.is_empty());
    assert!(reconciler.snapshot().load().nodes.is_empty());

    applier.set_failing(false);
    applier.clear();
    let stats = reconciler.pass();
    assert_eq!(stats.applied, 2, "the same deltas should be applied again");
    assert!(stats.committed);
    assert_eq!(reconciler.snapshot().load().nodes.len(), 2);
    assert!(
        applier
            .deltas()
            .iter()
            .all(|delta| matches!(delta.change, Change::Configure { readdressed: true, .. })),
        "the retried deltas should still configure new nodes"
    );
}

/// Test that an apply exceeding the timeout counts as a failure.
#[test]
fn slow_apply_times_out() {
    let backend = Arc::new(MemoryBackend::new());
    backend.upsert(ready_record("a", "eu", 1));

    let applier = Arc::new(RecordingApplier::default());
    applier.set_delay(Duration::from_millis(500));

    let mut reconciler = Reconciler::new(
        backend.clone(),
        applier.clone(),
        Arc::new(Allocator::new("10.4.0.0/16".parse().unwrap())),
        Options {
            apply_timeout: Duration::from_millis(20),
            ..Options::default()
        },
    );
    observe_all(&mut reconciler, &backend);

    let stats = reconciler.pass();
    assert_eq!(stats.failed, 1, "the slow apply should time out");
    assert!(!stats.committed);
}

/// Test that an apply outliving its timeout is never overtaken by a newer one for the same node,
/// so the configuration a node ends up with is the one the reconciler considers current.
#[test]
fn late_apply_is_not_overtaken() {
    let backend = Arc::new(MemoryBackend::new());
    backend.upsert(ready_record("a", "eu", 1));

    let device = Arc::new(DeviceApplier::default());
    device.delay_next(Duration::from_millis(300));

    let mut reconciler = Reconciler::new(
        backend.clone(),
        device.clone(),
        Arc::new(Allocator::new("10.4.0.0/16".parse().unwrap())),
        Options {
            apply_timeout: Duration::from_millis(50),
            ..Options::default()
        },
    );
    observe_all(&mut reconciler, &backend);

    let stats = reconciler.pass();
    assert_eq!(stats.failed, 1, "the first apply should time out");
    assert!(!stats.committed);

    backend.upsert(ready_record("b", "eu", 2));
    reconciler.observe(upsert(backend.get("b").unwrap()));

    let stats = reconciler.pass();
    assert_eq!(stats.busy, 1, "`a` is still being configured");
    assert_eq!(stats.applied, 1, "`b` is not held back by `a`");
    assert!(!stats.committed, "a pass with a held back node must not commit");

    let deadline = Instant::now() + Duration::from_secs(5);
    while !reconciler.pass().committed {
        assert!(Instant::now() < deadline, "the late apply never finished");
        thread::sleep(Duration::from_millis(20));
    }

    let current = reconciler.current().clone();
    assert_eq!(current.nodes["a"].peers.len(), 1);
    assert_eq!(device.calls("a"), 2, "`a` should be configured once more after the late apply");
    for (name, config) in &current.nodes {
        assert_eq!(
            device.configured(name).as_ref(),
            Some(config),
            "`{name}` should hold its current configuration"
        );
    }

    let stats = reconciler.pass();
    assert_eq!(stats.applied, 0);
    assert_eq!(device.configured("a").as_ref(), Some(&current.nodes["a"]));
}

/// Test that deleting a node removes it, updates its peers and frees its address.
#[test]
fn deletion() {
    let (backend, applier, mut reconciler) = setup(&["a", "b"]);
    observe_all(&mut reconciler, &backend);
    reconciler.pass();
    applier.clear();

    backend.delete("a");
    assert!(reconciler.observe(Event {
        name: "a".to_owned(),
        record: None
    }));

    let stats = reconciler.pass();
    assert_eq!(stats.applied, 2);

    let deltas = applier.deltas();
    assert_eq!(deltas[0].change, Change::Remove, "`a` should be torn down");
    match &deltas[1].change {
        Change::Configure { removed, .. } => assert!(
            removed.contains("a"),
            "`b` should lose its peer `a`"
        ),
        Change::Remove => panic!("`b` should be reconfigured, not removed"),
    }

    backend.upsert(ready_record("c", "eu", 3));
    reconciler.observe(upsert(backend.get("c").unwrap()));
    reconciler.pass();
    assert_eq!(
        reconciler.current().nodes["c"].address.address(),
        IpAddr::from([10, 4, 0, 1]),
        "the address of `a` should be reused"
    );
}

/// Test that the loop converges on records that appear while it runs, and stops on shutdown.
#[test]
fn run_follows_events_until_shutdown() {
    let (backend, _, reconciler) = setup(&["a"]);
    let snapshot = reconciler.snapshot();
    let shutdown = Arc::new(AtomicBool::new(false));

    let handle = spawn(reconciler, shutdown.clone());

    wait_for(|| snapshot.load().nodes.len() == 1, "the initial node");

    backend.upsert(ready_record("b", "eu", 2));
    backend.upsert(ready_record("c", "us", 3));
    wait_for(|| snapshot.load().nodes.len() == 3, "the added nodes");
    assert_eq!(snapshot.load().segments.len(), 2);

    shutdown.store(true, Ordering::SeqCst);
    let result = handle.join().unwrap();
    assert!(result.is_ok(), "shutdown should end the loop cleanly");
}

/// Test that shutdown unblocks a loop that receives no events at all.
#[test]
fn shutdown_unblocks_idle_loop() {
    let (_, _, reconciler) = setup(&[]);
    let shutdown = Arc::new(AtomicBool::new(false));

    let handle = spawn(reconciler, shutdown.clone());
    thread::sleep(Duration::from_millis(50));

    let start = Instant::now();
    shutdown.store(true, Ordering::SeqCst);
    assert!(handle.join().unwrap().is_ok());
    assert!(
        start.elapsed() < Duration::from_secs(5),
        "shutdown should not wait for an event"
    );
}

/// Test that the loop ends with an error when the event stream closes.
#[test]
fn closed_stream_is_an_error() {
    let (backend, _, reconciler) = setup(&["a"]);
    let snapshot = reconciler.snapshot();

    let handle = spawn(reconciler, Arc::new(AtomicBool::new(false)));
    wait_for(|| snapshot.load().nodes.len() == 1, "the initial node");

    backend.close();
    assert!(matches!(handle.join().unwrap(), Err(Error::StreamClosed)));
}

/// Test that a closed backend refuses to start the loop.
#[test]
fn closed_backend_cannot_start() {
    let (backend, _, mut reconciler) = setup(&["a"]);
    backend.close();

    assert!(matches!(
        reconciler.run(&AtomicBool::new(false)),
        Err(Error::Backend(_))
    ));
}

type TestReconciler = Reconciler<Arc<MemoryBackend>, Arc<RecordingApplier>>;

/// Create a backend with ready nodes in one location, and a reconciler over it.
fn setup(names: &[&str]) -> (Arc<MemoryBackend>, Arc<RecordingApplier>, TestReconciler) {
    let backend = Arc::new(MemoryBackend::new());
    for (i, name) in names.iter().enumerate() {
        backend.upsert(ready_record(name, "eu", i as u8 + 1));
    }

    let applier = Arc::new(RecordingApplier::default());
    let reconciler = Reconciler::new(
        backend.clone(),
        applier.clone(),
        Arc::new(Allocator::new("10.4.0.0/16".parse().unwrap())),
        Options {
            tick: Duration::from_millis(10),
            ..Options::default()
        },
    );

    (backend, applier, reconciler)
}

fn ready_record(name: &str, location: &str, n: u8) -> NodeRecord {
    NodeRecord {
        name: name.to_owned(),
        annotations: [
            (EXTERNAL_IP_ANNOTATION, format!("203.0.113.{n}/32")),
            (INTERNAL_IP_ANNOTATION, format!("192.168.0.{n}/24")),
            (KEY_ANNOTATION, format!("key-{name}")),
            (LOCATION_ANNOTATION, location.to_owned()),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_owned(), value))
        .collect(),
        labels: BTreeMap::new(),
        pod_cidr: Some(format!("10.2.{n}.0/24")),
    }
}

fn upsert(record: NodeRecord) -> Event {
    Event {
        name: record.name.clone(),
        record: Some(record),
    }
}

fn observe_all<A: Applier>(
    reconciler: &mut Reconciler<Arc<MemoryBackend>, A>,
    backend: &MemoryBackend,
) {
    for record in backend.list().unwrap() {
        reconciler.observe(upsert(record));
    }
}

fn overlay_annotations(backend: &MemoryBackend) -> BTreeMap<String, String> {
    backend
        .list()
        .unwrap()
        .into_iter()
        .filter_map(|record| {
            let overlay_ip = record.annotations.get(OVERLAY_IP_ANNOTATION)?.clone();
            Some((record.name, overlay_ip))
        })
        .collect()
}

fn spawn(
    mut reconciler: TestReconciler,
    shutdown: Arc<AtomicBool>,
) -> thread::JoinHandle<Result<(), Error>> {
    thread::spawn(move || reconciler.run(&shutdown))
}

/// Poll a condition until it holds, failing the test after a few seconds.
fn wait_for(condition: impl Fn() -> bool, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

#[derive(Debug)]
struct Refused;

impl fmt::Display for Refused {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("refused")
    }
}

impl std::error::Error for Refused {}

/// An applier that records the deltas it applied, and can be told to fail or dawdle.
#[derive(Default)]
struct RecordingApplier {
    deltas: Mutex<Vec<NodeDelta>>,
    failing: AtomicBool,
    delay: Mutex<Option<Duration>>,
}

impl RecordingApplier {
    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    fn clear(&self) {
        self.deltas.lock().unwrap().clear();
    }

    fn deltas(&self) -> Vec<NodeDelta> {
        let mut deltas = self.deltas.lock().unwrap().clone();
        deltas.sort_by(|a, b| a.name.cmp(&b.name));
        deltas
    }

    fn names(&self) -> Vec<String> {
        self.deltas().into_iter().map(|delta| delta.name).collect()
    }
}

impl Applier for RecordingApplier {
    type Error = Refused;

    fn apply(&self, delta: &NodeDelta) -> Result<(), Refused> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            thread::sleep(delay);
        }

        if self.failing.load(Ordering::SeqCst) {
            return Err(Refused);
        }

        self.deltas.lock().unwrap().push(delta.clone());
        Ok(())
    }
}

/// An applier that keeps the configuration each node ends up with, like a real device would.
#[derive(Default)]
struct DeviceApplier {
    configured: Mutex<BTreeMap<String, Option<NodeConfig>>>,
    calls: Mutex<BTreeMap<String, usize>>,
    delays: Mutex<VecDeque<Duration>>,
}

impl DeviceApplier {
    /// Make the next apply take `delay` before it takes effect.
    fn delay_next(&self, delay: Duration) {
        self.delays.lock().unwrap().push_back(delay);
    }

    fn configured(&self, node: &str) -> Option<NodeConfig> {
        self.configured.lock().unwrap().get(node).cloned().flatten()
    }

    fn calls(&self, node: &str) -> usize {
        self.calls.lock().unwrap().get(node).copied().unwrap_or_default()
    }
}

impl Applier for DeviceApplier {
    type Error = Refused;

    fn apply(&self, delta: &NodeDelta) -> Result<(), Refused> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(delta.name.clone())
            .or_default() += 1;

        let delay = self.delays.lock().unwrap().pop_front();
        if let Some(delay) = delay {
            thread::sleep(delay);
        }

        self.configured
            .lock()
            .unwrap()
            .insert(delta.name.clone(), delta.config().cloned());
        Ok(())
    }
}
