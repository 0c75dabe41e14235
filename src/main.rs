use slp_census::config::{self, ScanConfig};
use slp_census::scanner::{Scanner, ShutdownHandle};
use slp_census::store::RecordStore;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};

/// Descriptors kept free for the store, stdio and the runtime itself.
const FD_HEADROOM: u64 = 256;

/// slp-census: scan the public IPv4 space for Minecraft servers and record their status.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "slp-census",
    version,
    about = "Scan the public IPv4 space for Minecraft servers and record their status.",
    long_about = None
)]
struct Cli {
    /// Number of concurrent probes. Invalid or non-positive values use the default (10000).
    workers: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let workers = config::parse_worker_count(cli.workers.as_deref());
    let config = ScanConfig::default().with_workers(workers);
    raise_fd_limit(config.workers);
    info!("starting with {} workers", config.workers);

    let dir = config::data_dir();
    let store = RecordStore::open(&dir)
        .with_context(|| format!("failed to open record store in {}", dir.display()))?;
    info!("writing records to {}", store.path().display());

    let scanner = Scanner::new(config);
    spawn_signal_listener(scanner.shutdown_handle());

    // The store flushes on every put; dropping it closes the log.
    let _store = scanner.run(store).await;
    info!("writer has finished");
    Ok(())
}

/// Every worker holds at most one socket.
fn raise_fd_limit(workers: usize) {
    let wanted = workers as u64 + FD_HEADROOM;
    match rlimit::increase_nofile_limit(wanted) {
        Ok(limit) if limit < wanted => warn!(
            "open file limit is {limit}, below the {wanted} needed for {workers} workers; \
             expect dial failures"
        ),
        Ok(_) => {}
        Err(e) => warn!("could not raise open file limit: {e}"),
    }
}

fn spawn_signal_listener(handle: ShutdownHandle) {
    tokio::spawn(async move {
        wait_for_signal().await;
        handle.request_shutdown();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!("cannot listen for SIGTERM: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received interrupt"),
        _ = term.recv() => info!("received terminate"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("received interrupt");
}
