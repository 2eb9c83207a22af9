mod conf;
mod config;

use std::{
    env, fs,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use meshwork_backend::FileBackend;
use meshwork_reconcile::Reconciler;
use meshwork_topology::Allocator;
use miette::{Context, IntoDiagnostic, Report, Result};

#[derive(Debug, clap::Parser)]
struct Opt {
    /// Path to config file.
    config: PathBuf,

    /// Path to the node records file, overriding the config file.
    #[clap(long)]
    nodes: Option<PathBuf>,

    /// Directory to write node configurations to, overriding the config file.
    #[clap(long, short)]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    if env::var_os("RUST_LOG").is_none() {
        env::set_var("RUST_LOG", "info");
    }

    pretty_env_logger::init_timed();

    let opt = <Opt as clap::Parser>::parse();
    log::debug!("opt: {:#?}", opt);

    let mut config: config::Meshwork = toml::from_str(
        fs::read_to_string(&opt.config)
            .into_diagnostic()
            .wrap_err("failed to open config file")?
            .as_str(),
    )
    .into_diagnostic()
    .wrap_err("failed to parse config")?;
    if let Some(nodes) = opt.nodes {
        config.nodes_file = nodes;
    }
    if let Some(output) = opt.output {
        config.output_dir = output;
    }
    log::debug!("config: {:#?}", config);

    let backend = Arc::new(
        FileBackend::open(&config.nodes_file).wrap_err("failed to open node records")?,
    );
    let applier = conf::ConfDirApplier::new(&config.output_dir, config.port)
        .wrap_err("failed to prepare configuration directory")?;
    let allocator = Arc::new(Allocator::new(config.overlay_cidr));

    let mut reconciler = Reconciler::new(
        backend.clone(),
        applier,
        allocator,
        config.reconcile_options(),
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    log::debug!("starting shutdown signal handler");
    ctrlc::set_handler({
        let shutdown = shutdown.clone();
        move || {
            shutdown.store(true, Ordering::SeqCst);
        }
    })
    .into_diagnostic()
    .wrap_err("failed to set shutdown signal handler")?;

    log::info!(
        "meshing nodes from {:?} into {:?} over {}",
        config.nodes_file,
        config.output_dir,
        config.overlay_cidr
    );

    thread::scope(|s| {
        s.spawn(|| refresh_loop(&backend, config.refresh_interval, &shutdown));

        let result = reconciler.run(&shutdown);

        // Stop the refresher too if reconciliation ended on its own.
        shutdown.store(true, Ordering::SeqCst);

        result.wrap_err("reconciliation failed")
    })
}

/// Re-read the node records every `interval` until shutdown.
fn refresh_loop(backend: &FileBackend, interval: Duration, shutdown: &AtomicBool) {
    let poll = interval.min(Duration::from_millis(100));
    let mut last = Instant::now();

    while !shutdown.load(Ordering::Relaxed) {
        thread::sleep(poll);
        if last.elapsed() < interval {
            continue;
        }
        last = Instant::now();

        match backend.refresh() {
            Ok(stats) => log::trace!("refreshed node records: {stats:?}"),
            Err(e) => log::warn!("{:?}", Report::new(e)),
        }
    }
}
