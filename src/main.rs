use clap::Parser;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use webperf_collector::backend::harness::check_installation;
use webperf_collector::backend::{BackendClient, LocalHarnessClient, RemoteScoringClient};
use webperf_collector::config::{
    BackendKind, CliArgs, CollectorConfig, DEFAULT_HARNESS_BINARY, ESTIMATED_SECS_PER_MEASUREMENT,
    ESTIMATE_OVERHEAD_FACTOR,
};
use webperf_collector::model::{BatchReport, Target, TaskResult};
use webperf_collector::orchestrator::{build_tasks, run_batch};
use webperf_collector::settings::load_settings;
use webperf_collector::sink::{FileSink, MemorySink, ResultSink};
use webperf_collector::targets::load_targets;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    let settings = load_settings(&args.config)?;

    let log_guard = init_logging(
        args.log_level(&settings),
        settings.output.log_file.as_deref(),
    );

    info!("Starting webperf-collector v{}", env!("CARGO_PKG_VERSION"));
    info!("Settings: {:?}", args.config);

    if args.check_harness {
        let report = check_installation(DEFAULT_HARNESS_BINARY).await;
        info!(
            "Local harness: {}",
            match (&report.local, &report.local_version) {
                (true, Some(v)) => format!("available ({})", v),
                (true, None) => "available".to_string(),
                (false, _) => "not found".to_string(),
            }
        );
        info!(
            "Docker: {}",
            match (&report.docker, &report.docker_version) {
                (true, Some(v)) => format!("available ({})", v),
                (true, None) => "available".to_string(),
                (false, _) => "not found".to_string(),
            }
        );
        match report.recommended {
            Some(mode) => info!("Recommended harness mode: {:?}", mode),
            None => warn!("No harness available: install sitespeed.io or Docker"),
        }
        return Ok(());
    }

    let config = CollectorConfig::resolve(&args, settings)?;
    let targets = load_targets(&config.targets_csv)?;

    let backend: Arc<dyn BackendClient> = match config.backend {
        BackendKind::Remote => Arc::new(RemoteScoringClient::new(config.remote.clone())?),
        BackendKind::Harness => Arc::new(LocalHarnessClient::new(config.harness.clone())),
    };

    if config.batch.dry_run {
        log_plan(&config, &targets, backend.name());
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            let _ = stop_tx.send(true);
        }
    });

    // Dry runs leave the output files alone.
    let mut sink: Box<dyn ResultSink> = if config.batch.dry_run {
        Box::new(MemorySink::default())
    } else {
        Box::new(FileSink::new(&config.output.json_dir, &config.output.csv_file)?)
    };

    let report = run_batch(
        backend,
        &targets,
        &config.strategies,
        &config.batch,
        sink.as_mut(),
        stop_rx,
    )
    .await;

    log_summary(&report);

    if !report.all_succeeded() {
        // Flush the file log before exiting.
        drop(log_guard);
        std::process::exit(1);
    }
    Ok(())
}

fn init_logging(
    level: &str,
    log_file: Option<&Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("webperf_collector={}", level).into());

    let (file_layer, guard) = match log_file.and_then(|p| Some((p.parent()?, p.file_name()?))) {
        Some((dir, name)) => {
            let dir = if dir.as_os_str().is_empty() {
                Path::new(".")
            } else {
                dir
            };
            let _ = std::fs::create_dir_all(dir);
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    guard
}

fn log_plan(config: &CollectorConfig, targets: &[Target], backend: &str) {
    let tasks = build_tasks(targets, &config.strategies);
    let enabled: Vec<&Target> = targets.iter().filter(|t| t.enabled).collect();

    info!("=== Dry run ===");
    info!("Backend: {}", backend);
    info!(
        "Strategies: {}",
        config
            .strategies
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    info!(
        "Execution: {}, timeout {}s, {} attempts per task",
        if config.batch.parallel {
            format!("parallel ({} workers)", config.batch.max_workers)
        } else {
            "sequential".to_string()
        },
        config.batch.timeout.as_secs(),
        config.batch.retry.max_attempts
    );
    info!(
        "Targets: {} total, {} enabled, {} measurements",
        targets.len(),
        enabled.len(),
        tasks.len()
    );

    let mut categories: BTreeMap<&str, usize> = BTreeMap::new();
    for t in &enabled {
        *categories
            .entry(t.category.as_deref().unwrap_or("uncategorized"))
            .or_default() += 1;
    }
    for (category, count) in &categories {
        info!("  {}: {}", category, count);
    }

    for t in enabled.iter().take(10) {
        info!("  - {} ({})", t.name, t.url);
    }
    if enabled.len() > 10 {
        info!("  ... and {} more", enabled.len() - 10);
    }

    let workers = if config.batch.parallel {
        config.batch.max_workers.max(1) as f64
    } else {
        1.0
    };
    let estimate_secs =
        tasks.len() as f64 * ESTIMATED_SECS_PER_MEASUREMENT * ESTIMATE_OVERHEAD_FACTOR / workers;
    info!("Estimated duration: {:.1} minutes", estimate_secs / 60.0);
}

fn log_summary(report: &BatchReport) {
    let stats = &report.stats;
    info!("=== Summary ===");
    info!(
        "Tasks: {} succeeded, {} failed, {} skipped",
        report.succeeded_tasks(),
        report.failed_tasks().count(),
        report.skipped_tasks
    );
    info!(
        "Requests: {} total, {} successful, {} failed, {} retried, {} rate limited ({:.1}% success)",
        stats.total_requests,
        stats.successful,
        stats.failed,
        stats.retried,
        stats.rate_limited,
        stats.success_rate()
    );
    if report.sink_errors > 0 {
        warn!("{} result(s) could not be written", report.sink_errors);
    }

    for outcome in report.failed_tasks().take(5) {
        if let TaskResult::Failure { kind, message } = &outcome.result {
            error!(
                "  {} ({}) [{}] after {} attempt(s): {}",
                outcome.target.name, outcome.strategy, kind, outcome.attempts, message
            );
        }
    }
}
