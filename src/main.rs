//! Economic router server.
//!
//! ```text
//! economic-router [--config <path>] [--check] [--print-schema]
//! ```
//!
//! - `--config <path>`: TOML configuration; built-in defaults when omitted
//! - `--check`: load and validate the configuration, then exit
//! - `--print-schema`: print the configuration JSON Schema, then exit
//!
//! ## Environment Variables
//!
//! - `LOG_FORMAT=json`: structured JSON output (production)
//! - `RUST_LOG=info`: log level filter (default: info)

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use economic_router::config::loader::load_from_file;
use economic_router::config::watcher::ConfigWatcher;
use economic_router::config::{export_schema, RouterConfig};
use economic_router::optimizer::{OptimizationMonitor, SpendSource};
use economic_router::routing::store::{restore_ledger, spawn_persister};
use economic_router::routing::{HealthProber, HttpHealthProbe, JsonFileStore, LedgerStore};
use economic_router::{init_tracing, metrics, Clock, EconomicRouter, SystemClock};
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    check: bool,
    print_schema: bool,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args::default();
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = iter
                    .next()
                    .ok_or_else(|| "--config requires a path".to_string())?;
                args.config = Some(PathBuf::from(path));
            }
            "--check" => args.check = true,
            "--print-schema" => args.print_schema = true,
            other => return Err(format!("unknown argument '{other}'")),
        }
    }
    Ok(args)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = parse_args()?;

    if args.print_schema {
        println!("{}", export_schema()?);
        return Ok(());
    }

    let _ = init_tracing();
    metrics::init_metrics()?;

    let config = match &args.config {
        Some(path) => load_from_file(path)?,
        None => RouterConfig::default(),
    };

    if args.check {
        println!("configuration OK");
        return Ok(());
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let router = Arc::new(EconomicRouter::from_config(&config, clock.clone())?);
    info!(
        router = router.name(),
        mode = router.mode().as_str(),
        tiers = config.tiers.len(),
        "economic router starting"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();

    if let Some(path) = &config.persistence.ledger_path {
        let store: Arc<dyn LedgerStore> = Arc::new(JsonFileStore::new(path.clone()));
        match restore_ledger(router.ledger(), store.as_ref()).await {
            Ok(restored) => info!(path = %path.display(), restored, "ledger restored"),
            Err(e) => warn!(path = %path.display(), error = %e, "ledger restore failed, starting empty"),
        }
        handles.push(spawn_persister(
            router.ledger().clone(),
            store,
            Duration::from_millis(config.persistence.flush_interval_ms),
            shutdown_rx.clone(),
        ));
    }

    let probe = Arc::new(HttpHealthProbe::new(&config.probe));
    handles.push(
        HealthProber::new(router.registry().clone(), probe, config.probe.clone())
            .spawn(shutdown_rx.clone()),
    );

    let source: Arc<dyn SpendSource> = router.clone();
    let monitor = Arc::new(OptimizationMonitor::new(
        source,
        router.ledger().clone(),
        router.tunables().clone(),
        clock,
        config.optimizer.clone(),
    ));
    handles.extend(monitor.clone().spawn(shutdown_rx.clone()));

    // Keep the watcher alive for the life of the process.
    let _watcher = match &args.config {
        Some(path) => match ConfigWatcher::new(path.clone()) {
            Ok((watcher, mut updates)) => {
                let router = router.clone();
                let monitor = monitor.clone();
                let mut shutdown = shutdown_rx.clone();
                handles.push(tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            update = updates.recv() => match update {
                                Ok(cfg) => {
                                    router.apply_config(&cfg);
                                    monitor.update_config(cfg.optimizer.clone());
                                    info!("configuration reloaded");
                                }
                                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                                    warn!(skipped = n, "config reload lagged");
                                }
                                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                            },
                            _ = shutdown.changed() => break,
                        }
                    }
                }));
                Some(watcher)
            }
            Err(e) => {
                warn!(error = %e, "config hot reload disabled");
                None
            }
        },
        None => None,
    };

    let server = {
        let state = economic_router::web_api::AppState::new(router.clone()).with_monitor(monitor.clone());
        let server_config = config.server.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = economic_router::web_api::start_server(server_config, state, shutdown).await {
                error!(error = %e, "web API exited");
            }
        })
    };

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);

    let _ = server.await;
    for handle in handles {
        let _ = handle.await;
    }

    let stats = monitor.stats();
    info!(
        passes = stats.passes,
        applied_savings_usd = stats.applied_savings_usd,
        "economic router stopped"
    );
    Ok(())
}
