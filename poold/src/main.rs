// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! `scriptpoold`: run a scriptpool as a long-lived service.
//!
//! Loads a JSON pool config, applies CLI overrides, starts the pool, logs a
//! stats snapshot on an interval, and drains gracefully on SIGINT/SIGTERM.
//!
//! ```text
//! scriptpoold --config /etc/scriptpool/pool.json
//! scriptpoold --worker /usr/local/bin/scriptpool-worker --pool-size 4
//! ```

use clap::Parser;
use miette::{Context, IntoDiagnostic, miette};
use std::{path::PathBuf, time::Duration};

use scriptpool::{PoolConfig, ScriptPool, WorkerCommand};

#[derive(Debug, Parser)]
#[command(bin_name = "scriptpoold")]
#[command(about = "Process pool daemon for scripting-runtime workers")]
#[command(version)]
#[command(next_line_help = true)]
struct CliArg {
    /// Path to a JSON pool config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Worker executable; shorthand for a config file containing only
    /// `worker.exec_path`. Ignored when --config is given.
    #[arg(short, long)]
    worker: Option<PathBuf>,

    /// Override the configured worker count.
    #[arg(long)]
    pool_size: Option<usize>,

    /// Tracing filter, e.g. `info` or `scriptpool=debug`.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Append logs to this file instead of stderr.
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Seconds between stats snapshots in the log. 0 disables them.
    #[arg(long, default_value_t = 60)]
    stats_interval_secs: u64,
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli_arg = CliArg::parse();

    // Keep the non-blocking writer guard alive for the process lifetime.
    let _log_guard = init_tracing(&cli_arg)?;

    let config = load_config(&cli_arg)?;
    tracing::info!(
        pool = %config.name,
        pool_size = config.pool_size,
        worker = %config.worker.exec_path.display(),
        "starting pool"
    );

    let pool = ScriptPool::start(config)
        .await
        .map_err(miette::Report::new)
        .wrap_err("pool startup failed")?;

    let stats_every = (cli_arg.stats_interval_secs > 0)
        .then(|| Duration::from_secs(cli_arg.stats_interval_secs));

    run_until_shutdown(&pool, stats_every).await;

    tracing::info!("shutdown signal received, draining pool");
    pool.shutdown(None).await;
    tracing::info!("pool drained, exiting");
    Ok(())
}

/// Serves until SIGINT/SIGTERM, logging stats snapshots on the interval.
async fn run_until_shutdown(pool: &ScriptPool, stats_every: Option<Duration>) {
    let mut stats_interval = stats_every.map(tokio::time::interval);
    if let Some(interval) = stats_interval.as_mut() {
        // Skip the immediate first tick.
        interval.reset();
    }

    loop {
        tokio::select! {
            () = shutdown_signal() => return,
            () = async {
                match stats_interval.as_mut() {
                    Some(interval) => { interval.tick().await; }
                    None => std::future::pending().await,
                }
            } => {
                let stats = pool.stats().await;
                tracing::info!(
                    size = stats.size,
                    available = stats.available,
                    busy = stats.busy,
                    queue_depth = stats.queue_depth,
                    requests_served = stats.requests_served,
                    errors = stats.errors,
                    sessions = stats.session_count,
                    uptime_ms = stats.uptime_ms,
                    "pool stats"
                );
            }
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(error) => {
                tracing::warn!(%error, "SIGTERM handler unavailable, using Ctrl-C only");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn load_config(cli_arg: &CliArg) -> miette::Result<PoolConfig> {
    let mut config = match (&cli_arg.config, &cli_arg.worker) {
        (Some(path), _) => {
            let raw = std::fs::read_to_string(path)
                .into_diagnostic()
                .wrap_err_with(|| format!("cannot read config file {}", path.display()))?;
            serde_json::from_str::<PoolConfig>(&raw)
                .into_diagnostic()
                .wrap_err_with(|| format!("cannot parse config file {}", path.display()))?
        }
        (None, Some(worker)) => PoolConfig::with_worker(WorkerCommand::new(worker)),
        (None, None) => {
            return Err(miette!(
                help = "pass --config pool.json or --worker /path/to/worker",
                "no pool configuration given"
            ));
        }
    };

    if let Some(pool_size) = cli_arg.pool_size {
        config.pool_size = pool_size;
        config.min_ready = config.min_ready.min(pool_size.max(1));
    }
    Ok(config)
}

type LogGuard = Option<tracing_appender::non_blocking::WorkerGuard>;

fn init_tracing(cli_arg: &CliArg) -> miette::Result<LogGuard> {
    let filter = tracing_subscriber::EnvFilter::try_new(&cli_arg.log_level)
        .into_diagnostic()
        .wrap_err("invalid --log-level filter")?;

    match &cli_arg.log_file {
        Some(path) => {
            let directory = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path
                .file_name()
                .ok_or_else(|| miette!("--log-file must name a file"))?;
            let appender = tracing_appender::rolling::never(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            Ok(None)
        }
    }
}
