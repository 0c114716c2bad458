//! ontosync daemon
//!
//! Watches a registry snapshot file and keeps a SPARQL store in sync with it.
//! SIGINT and SIGTERM stop the service cleanly. Pending batches and the
//! connection phase history survive restarts when journal paths are
//! configured.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ontosync::{FileRegistrySource, HttpStore, SyncConfig, SyncService};

#[derive(Debug, Parser)]
#[command(name = "ontosync", version, about = "Sync a unit registry into a SPARQL store")]
struct Args {
    /// JSON configuration file. Defaults apply when omitted.
    #[arg(short, long, env = "ONTOSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Registry snapshot file to watch.
    #[arg(short, long, env = "ONTOSYNC_REGISTRY")]
    registry: PathBuf,

    /// Overrides the configured query endpoint.
    #[arg(long, env = "ONTOSYNC_QUERY_ENDPOINT")]
    query_endpoint: Option<String>,

    /// Overrides the configured update endpoint.
    #[arg(long, env = "ONTOSYNC_UPDATE_ENDPOINT")]
    update_endpoint: Option<String>,

    /// How often the registry file is checked for changes.
    #[arg(long, default_value_t = 1_000)]
    registry_poll_ms: u64,

    /// Stop after this many seconds instead of running until interrupted.
    #[arg(long)]
    run_for_secs: Option<u64>,

    /// Emit logs as JSON lines.
    #[arg(long, env = "ONTOSYNC_LOG_JSON")]
    log_json: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(args: &Args) -> ontosync::SyncResult<SyncConfig> {
    let mut config = match &args.config {
        Some(path) => SyncConfig::from_json_file(path)?,
        None => SyncConfig::default(),
    };
    if let Some(endpoint) = &args.query_endpoint {
        config.store.query_endpoint.clone_from(endpoint);
    }
    if let Some(endpoint) = &args.update_endpoint {
        config.store.update_endpoint.clone_from(endpoint);
    }
    config.validate()?;
    Ok(config)
}

/// Channel that fires once on SIGINT or SIGTERM.
fn termination_signal() -> ontosync::SyncResult<Receiver<()>> {
    let (tx, rx) = bounded(1);
    ctrlc::set_handler(move || {
        let _ = tx.try_send(());
    })
    .map_err(|e| ontosync::SyncError::internal(format!("cannot install signal handler: {e}")))?;
    Ok(rx)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Signal,
    Elapsed,
    HandlerGone,
}

/// Blocks until a termination signal arrives or `run_for` elapses.
fn wait_for_stop(stop: &Receiver<()>, run_for: Option<Duration>) -> StopReason {
    let received = match run_for {
        Some(limit) => stop.recv_timeout(limit),
        None => stop.recv().map_err(|_| RecvTimeoutError::Disconnected),
    };
    match received {
        Ok(()) => StopReason::Signal,
        Err(RecvTimeoutError::Timeout) => StopReason::Elapsed,
        Err(RecvTimeoutError::Disconnected) => StopReason::HandlerGone,
    }
}

fn run(args: &Args) -> ontosync::SyncResult<()> {
    let config = load_config(args)?;
    let stop = termination_signal()?;
    let store = Arc::new(HttpStore::new(&config.store)?);
    let registry = Arc::new(FileRegistrySource::new(
        &args.registry,
        Duration::from_millis(args.registry_poll_ms.max(1)),
    ));

    let service = SyncService::start(config, store, registry, None)?;
    info!(registry = %args.registry.display(), "watching registry");

    match wait_for_stop(&stop, args.run_for_secs.map(Duration::from_secs)) {
        StopReason::Signal => info!("termination signal received"),
        StopReason::Elapsed => info!("run time elapsed"),
        StopReason::HandlerGone => warn!("signal handler dropped"),
    }

    let report = service.shutdown();
    info!(pending = report.pending, applied = report.stats.applied, "exiting");
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.log_json);

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "ontosync failed");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_ends_the_wait() {
        let (tx, rx) = bounded(1);
        tx.send(()).unwrap();
        assert_eq!(wait_for_stop(&rx, None), StopReason::Signal);
    }

    #[test]
    fn run_limit_ends_the_wait_without_signal() {
        let (_tx, rx) = bounded::<()>(1);
        assert_eq!(
            wait_for_stop(&rx, Some(Duration::from_millis(10))),
            StopReason::Elapsed
        );
    }

    #[test]
    fn dropped_handler_does_not_hang() {
        let (tx, rx) = bounded::<()>(1);
        drop(tx);
        assert_eq!(wait_for_stop(&rx, None), StopReason::HandlerGone);
    }
}
