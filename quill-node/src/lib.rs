//! Process wiring: configuration, logging, bootstrap, and the background
//! sync-registry thread that lets the registry leave replay mode once it
//! has caught up with real time.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use quill_chain::{ChainState, Consensus, SystemClock};
use quill_config::QuillConfig;

/// Poll cadence of the sync-registry loop.
const SYNCREG_SLEEP_MS: u64 = 1;

/// Command-line overrides applied on top of the configuration file.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub network: Option<String>,
    pub datadir: Option<PathBuf>,
    pub check_level: Option<u32>,
    pub check_blocks: Option<i32>,
}

pub fn init_logging(filter: &str) {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Start the node: bootstrap the chain state and run until shutdown is
/// requested.
pub fn run_node(config_path: PathBuf, overrides: Overrides) -> Result<()> {
    let mut cfg = QuillConfig::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;
    if let Some(network) = overrides.network {
        cfg.network = network;
    }
    if let Some(datadir) = overrides.datadir {
        cfg.storage.datadir = datadir;
    }
    if let Some(level) = overrides.check_level {
        cfg.validation.check_level = level;
    }
    if let Some(blocks) = overrides.check_blocks {
        cfg.validation.check_blocks = blocks;
    }
    init_logging(&cfg.log_filter);
    let params = cfg.chain_params()?;
    info!(network = %cfg.network, datadir = %cfg.storage.datadir.display(), "starting quilld");

    let shutdown = quill_chain::ShutdownFlag::new();
    let clock = Arc::new(SystemClock::new());
    let mut state = ChainState::open(params, &cfg.storage.datadir)?;
    let height = state.load_block_index(
        &*clock,
        &shutdown,
        cfg.validation.check_level,
        cfg.validation.check_blocks,
    )?;
    info!(height, "chain state ready");

    let consensus = Arc::new(Consensus::with_shutdown(state, clock, shutdown));
    let sync_handle = spawn_sync_registry(consensus.clone());

    // TODO: replace this idle loop with the p2p service once it is wired in
    while !consensus.shutdown.is_requested() {
        thread::sleep(Duration::from_millis(500));
    }
    sync_handle.join().ok();
    info!("shutdown complete");
    Ok(())
}

/// While the registry is replaying, poll once per millisecond whether it has
/// caught up to real time and may exit replay.
pub fn spawn_sync_registry(consensus: Arc<Consensus>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while !consensus.shutdown.is_requested() {
            consensus.sync_registry_tick();
            thread::sleep(Duration::from_millis(SYNCREG_SLEEP_MS));
        }
    })
}
