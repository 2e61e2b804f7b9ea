use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cadence_core::config::{CadenceConfig, LogConfig};
use cadence_core::types::IntervalCode;
use cadence_scheduler::daemon::backoff_delay;
use cadence_scheduler::{
    DaemonLoop, DaemonSettings, SchedulingEngine, SqliteStore, TracingSink, WindowCalculator,
};

const INTERVAL_MISSING: &str = "interval minute/hour/day/week/month/year missing";

#[derive(Parser, Debug)]
#[command(name = "cadence", version, about = "Multi-tenant run-template scheduler")]
struct Cli {
    /// Config file; falls back to ~/.cadence/cadence.toml
    #[arg(long, global = true, env = "CADENCE_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Schedule continuously, one pass per tick.
    Daemon,
    /// Run one pass for a single fixed interval and exit.
    Schedule {
        /// minute|hour|day|week|month|year (or i/h/d/w/m/y)
        interval: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let interval = match &cli.command {
        Command::Daemon => None,
        Command::Schedule { interval: None } => {
            eprintln!("{INTERVAL_MISSING}");
            eprintln!("usage: cadence [--config <PATH>] schedule <minute|hour|day|week|month|year>");
            std::process::exit(1);
        }
        Command::Schedule {
            interval: Some(raw),
        } => Some(parse_fixed_interval(raw)?),
    };

    let config = CadenceConfig::load(cli.config.as_deref());
    init_tracing(config.as_ref().ok().map(|c| &c.log));
    let config = config.context("loading configuration")?;

    let calculator = WindowCalculator::new(config.timezone()?);
    let settings = DaemonSettings::from(&config.daemon);

    ensure_parent_dir(&config.database.path);
    let store = Arc::new(open_store(&config, &settings).await?);

    let engine = SchedulingEngine::new(store.clone(), calculator, Arc::new(TracingSink))
        .with_verbose(config.log.debug);

    if let Some(interval) = interval {
        info!(%interval, "one-shot scheduling pass");
        let report = engine.run_interval(interval, Utc::now())?;
        info!(
            tenants = report.tenants,
            enqueued = report.enqueued,
            skipped = report.skipped,
            disabled = report.disabled,
            failed = report.failed,
            "pass finished"
        );
        return Ok(());
    }

    let daemon = DaemonLoop::new(engine, store, settings);

    if !config.daemon.daemonize {
        let report = daemon.run_single().await?;
        info!(enqueued = report.enqueued, failed = report.failed, "single pass finished");
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handle = tokio::spawn(daemon.run(shutdown_rx));

    tokio::select! {
        finished = &mut handle => {
            // the loop only ends on its own when startup failed
            return finished?.map_err(Into::into);
        }
        _ = shutdown_signal() => {
            info!("shutdown requested, finishing current pass");
        }
    }

    let _ = shutdown_tx.send(true);
    handle.await??;
    Ok(())
}

fn parse_fixed_interval(raw: &str) -> anyhow::Result<IntervalCode> {
    let interval: IntervalCode = raw.parse()?;
    if !interval.is_fixed() {
        anyhow::bail!("{INTERVAL_MISSING}: '{raw}' is not a fixed interval");
    }
    Ok(interval)
}

/// `RUST_LOG` wins, then `log.filter`, then a default raised to debug by `log.debug`.
fn init_tracing(log: Option<&LogConfig>) {
    let default = if log.is_some_and(|l| l.debug) {
        "cadence=debug,cadence_daemon=debug,cadence_scheduler=debug,cadence_core=debug"
    } else {
        "cadence=info,cadence_daemon=info,cadence_scheduler=info,cadence_core=info"
    };
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => log
            .and_then(|l| l.filter.as_deref())
            .and_then(|directive| EnvFilter::try_new(directive).ok())
            .unwrap_or_else(|| EnvFilter::new(default)),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Open the store, retrying with the daemon's backoff until `startup_retries` runs out.
async fn open_store(config: &CadenceConfig, settings: &DaemonSettings) -> anyhow::Result<SqliteStore> {
    let attempts = settings.startup_retries.max(1);
    let mut attempt = 1;
    loop {
        match SqliteStore::open(&config.database.path, config.database.busy_timeout()) {
            Ok(store) => return Ok(store),
            Err(e) if attempt < attempts => {
                error!(attempt, attempts, path = %config.database.path, err = %e, "database unavailable");
                tokio::time::sleep(backoff_delay(
                    settings.reconnect_base,
                    settings.reconnect_cap,
                    attempt,
                ))
                .await;
                attempt += 1;
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!(
                        "database {} unavailable after {attempts} attempts",
                        config.database.path
                    )
                })
            }
        }
    }
}

async fn shutdown_signal() {
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                warn!(err = %e, "ctrl-c handler failed");
                std::future::pending::<()>().await;
            }
        }
        _ = async {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    return;
                }
            }
            std::future::pending::<()>().await
        } => {}
    }
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
