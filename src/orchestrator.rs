use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::backend::{BackendClient, DryRunClient, ErrorKind, Failure, RawResponse};
use crate::config::BatchConfig;
use crate::model::{
    BatchReport, ProcessingStats, Strategy, Target, TaskOutcome, TaskResult,
};
use crate::normalize::normalize;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::sink::ResultSink;

/// One (target, strategy) pair. `index` is its position in the expanded list.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub index: usize,
    pub target: Target,
    pub strategy: Strategy,
}

/// Enabled targets × strategies, in target order then mobile before desktop.
pub fn build_tasks(targets: &[Target], strategies: &[Strategy]) -> Vec<Task> {
    let mut strategies = strategies.to_vec();
    strategies.sort();
    strategies.dedup();

    targets
        .iter()
        .filter(|t| t.enabled)
        .flat_map(|t| strategies.iter().map(move |s| (t, *s)))
        .enumerate()
        .map(|(index, (target, strategy))| Task {
            index,
            target: target.clone(),
            strategy,
        })
        .collect()
}

// ============================================================================
// Worker → aggregator events
// ============================================================================

#[derive(Debug)]
enum TaskEvent {
    AttemptStarted { retry: bool },
    AttemptFailed { kind: ErrorKind },
    Finished {
        outcome: TaskOutcome,
        raw: Option<RawResponse>,
    },
}

/// Runs every task and returns once each dispatched task is terminal.
///
/// Stats are only touched by the aggregation loop in this function; workers
/// report through a channel. Setting `stop_rx` to `true` (or reaching
/// `config.batch_timeout`) stops dispatching, abandons tasks waiting in
/// backoff and lets in-flight calls finish.
pub async fn run_batch(
    backend: Arc<dyn BackendClient>,
    targets: &[Target],
    strategies: &[Strategy],
    config: &BatchConfig,
    sink: &mut dyn ResultSink,
    stop_rx: watch::Receiver<bool>,
) -> BatchReport {
    let run_id = uuid::Uuid::new_v4().to_string();
    let tasks = build_tasks(targets, strategies);
    let total = tasks.len();

    let backend: Arc<dyn BackendClient> = if config.dry_run {
        Arc::new(DryRunClient)
    } else {
        backend
    };

    info!(
        "Batch {} started: {} tasks, backend={}, mode={}",
        run_id,
        total,
        backend.name(),
        if config.parallel {
            format!("parallel({})", config.max_workers)
        } else {
            "sequential".to_string()
        }
    );

    let (cancel_tx, cancel_rx) = watch::channel(*stop_rx.borrow());
    let forwarder = tokio::spawn(forward_cancellation(stop_rx, cancel_tx, config.batch_timeout));

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let dispatcher = tokio::spawn(dispatch(
        tasks,
        backend,
        WorkerSettings {
            policy: config.retry,
            timeout: config.timeout,
        },
        if config.parallel {
            config.max_workers.clamp(1, total.max(1))
        } else {
            0
        },
        events_tx,
        cancel_rx.clone(),
    ));

    let mut agg = Aggregator::new(sink, total);
    while let Some(event) = events_rx.recv().await {
        agg.apply(event);
    }

    let skipped_tasks = match dispatcher.await {
        Ok(skipped) => skipped,
        Err(e) => {
            error!("Dispatcher failed: {}", e);
            total.saturating_sub(agg.outcomes.len())
        }
    };
    let cancelled = *cancel_rx.borrow();
    forwarder.abort();

    if let Err(e) = agg.sink.finish() {
        error!("Result sink failed to finish: {}", e);
        agg.sink_errors += 1;
    }

    let mut report = agg.into_report(run_id, cancelled, skipped_tasks);
    report.outcomes.sort_by_key(|o| o.index);

    info!(
        "Batch {} finished: {} attempts, {} successful, {} failed, {} retried, {} rate limited{}",
        report.run_id,
        report.stats.total_requests,
        report.stats.successful,
        report.stats.failed,
        report.stats.retried,
        report.stats.rate_limited,
        if report.cancelled {
            format!(" (cancelled, {} tasks skipped)", report.skipped_tasks)
        } else {
            String::new()
        }
    );
    report
}

/// Relays the external stop signal and the batch deadline into one channel.
async fn forward_cancellation(
    mut stop_rx: watch::Receiver<bool>,
    cancel_tx: watch::Sender<bool>,
    batch_timeout: Option<Duration>,
) {
    let deadline = async {
        match batch_timeout {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() {
                    // Stop sender dropped; only the deadline can cancel now.
                    (&mut deadline).await;
                    warn!("Batch timeout reached, no new tasks will be dispatched");
                    let _ = cancel_tx.send(true);
                    return;
                }
                if *stop_rx.borrow_and_update() {
                    info!("Stop requested, no new tasks will be dispatched");
                    let _ = cancel_tx.send(true);
                    return;
                }
            }
            _ = &mut deadline => {
                warn!("Batch timeout reached, no new tasks will be dispatched");
                let _ = cancel_tx.send(true);
                return;
            }
        }
    }
}

async fn wait_cancelled(cancel_rx: &mut watch::Receiver<bool>) {
    loop {
        if *cancel_rx.borrow_and_update() {
            return;
        }
        if cancel_rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

// ============================================================================
// Dispatch
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct WorkerSettings {
    policy: RetryPolicy,
    timeout: Duration,
}

/// Runs tasks inline (`workers == 0`) or on a semaphore-gated JoinSet.
/// Returns the number of tasks never dispatched.
async fn dispatch(
    tasks: Vec<Task>,
    backend: Arc<dyn BackendClient>,
    settings: WorkerSettings,
    workers: usize,
    events: mpsc::UnboundedSender<TaskEvent>,
    mut cancel_rx: watch::Receiver<bool>,
) -> usize {
    let total = tasks.len();
    let mut remaining = tasks.into_iter();

    if workers == 0 {
        while let Some(task) = remaining.next() {
            if *cancel_rx.borrow() {
                return 1 + remaining.len();
            }
            run_task(task, backend.as_ref(), settings, &events, cancel_rx.clone()).await;
        }
        return 0;
    }

    let sem = Arc::new(Semaphore::new(workers));
    let mut join_set = JoinSet::new();
    let mut skipped = 0;

    while let Some(task) = remaining.next() {
        let permit = tokio::select! {
            permit = sem.clone().acquire_owned() => permit.ok(),
            _ = wait_cancelled(&mut cancel_rx) => None,
        };
        let permit = match permit {
            Some(p) if !*cancel_rx.borrow() => p,
            _ => {
                skipped = 1 + remaining.len();
                break;
            }
        };

        let backend = backend.clone();
        let events = events.clone();
        let cancel = cancel_rx.clone();
        join_set.spawn(async move {
            let _permit = permit;
            run_task(task, backend.as_ref(), settings, &events, cancel).await;
        });
    }
    drop(events);

    while let Some(res) = join_set.join_next().await {
        if let Err(e) = res {
            error!("Measurement worker failed: {}", e);
        }
    }

    debug!("Dispatched {} of {} tasks", total - skipped, total);
    skipped
}

/// Attempt loop for one task: Attempting → Succeeded | Retrying → Attempting
/// | FailedPermanently.
async fn run_task(
    task: Task,
    backend: &dyn BackendClient,
    settings: WorkerSettings,
    events: &mpsc::UnboundedSender<TaskEvent>,
    mut cancel_rx: watch::Receiver<bool>,
) {
    let Task {
        index,
        target,
        strategy,
    } = task;
    let mut attempt: u32 = 0;

    let finish = |attempts: u32, result: TaskResult, raw: Option<RawResponse>| {
        let _ = events.send(TaskEvent::Finished {
            outcome: TaskOutcome {
                index,
                target: target.clone(),
                strategy,
                attempts,
                result,
            },
            raw,
        });
    };

    loop {
        attempt += 1;
        let _ = events.send(TaskEvent::AttemptStarted { retry: attempt > 1 });

        let result = match tokio::time::timeout(
            settings.timeout,
            backend.measure(&target, strategy, settings.timeout),
        )
        .await
        {
            Ok(r) => r,
            Err(_) => Err(Failure::transient(format!(
                "Measurement timed out after {}s",
                settings.timeout.as_secs_f64()
            ))),
        };

        let failure = match result {
            Ok(raw) => match normalize(&raw, &target, strategy) {
                Ok(measurement) => {
                    finish(attempt, TaskResult::Success(measurement), Some(raw));
                    return;
                }
                Err(e) => {
                    error!(
                        "{} <{}> ({}): normalization failed: {} [payload: {}]",
                        target.name,
                        target.url,
                        strategy,
                        e,
                        raw.describe()
                    );
                    let _ = events.send(TaskEvent::AttemptFailed {
                        kind: ErrorKind::Normalization,
                    });
                    finish(
                        attempt,
                        TaskResult::Failure {
                            kind: ErrorKind::Normalization,
                            message: e.to_string(),
                        },
                        None,
                    );
                    return;
                }
            },
            Err(failure) => failure,
        };

        let _ = events.send(TaskEvent::AttemptFailed { kind: failure.kind });

        match settings.policy.decide(attempt, &failure) {
            RetryDecision::Retry(delay) => {
                warn!(
                    "{} ({}): attempt {} failed ({}), retrying in {:.1}s",
                    target.name,
                    strategy,
                    attempt,
                    failure,
                    delay.as_secs_f64()
                );
                let cancelled = tokio::select! {
                    _ = tokio::time::sleep(delay) => false,
                    _ = wait_cancelled(&mut cancel_rx) => true,
                };
                if cancelled {
                    warn!("{} ({}): cancelled during backoff", target.name, strategy);
                    finish(
                        attempt,
                        TaskResult::Failure {
                            kind: failure.kind,
                            message: format!("cancelled during backoff: {}", failure.message),
                        },
                        None,
                    );
                    return;
                }
            }
            RetryDecision::GiveUp => {
                error!(
                    "{} ({}): failed after {} attempt(s): {}",
                    target.name, strategy, attempt, failure
                );
                finish(
                    attempt,
                    TaskResult::Failure {
                        kind: failure.kind,
                        message: failure.message,
                    },
                    None,
                );
                return;
            }
        }
    }
}

// ============================================================================
// Aggregation
// ============================================================================

struct Aggregator<'a> {
    sink: &'a mut dyn ResultSink,
    stats: ProcessingStats,
    outcomes: Vec<TaskOutcome>,
    sink_errors: usize,
    total_tasks: usize,
}

impl<'a> Aggregator<'a> {
    fn new(sink: &'a mut dyn ResultSink, total_tasks: usize) -> Self {
        Aggregator {
            sink,
            stats: ProcessingStats::default(),
            outcomes: Vec::with_capacity(total_tasks),
            sink_errors: 0,
            total_tasks,
        }
    }

    fn apply(&mut self, event: TaskEvent) {
        match event {
            TaskEvent::AttemptStarted { retry } => {
                self.stats.total_requests += 1;
                if retry {
                    self.stats.retried += 1;
                }
            }
            TaskEvent::AttemptFailed { kind } => {
                self.stats.failed += 1;
                if kind == ErrorKind::RateLimited {
                    self.stats.rate_limited += 1;
                }
            }
            TaskEvent::Finished { outcome, raw } => {
                let done = self.outcomes.len() + 1;
                match &outcome.result {
                    TaskResult::Success(measurement) => {
                        self.stats.successful += 1;
                        let m = &measurement.metrics;
                        info!(
                            "[{}/{}] {} ({}): onload={} ttfb={} lcp={}",
                            done,
                            self.total_tasks,
                            m.site_name,
                            m.strategy,
                            fmt_ms(m.onload_ms),
                            fmt_ms(m.ttfb_ms),
                            fmt_ms(m.lcp_ms)
                        );
                        if let Some(raw) = &raw {
                            if let Err(e) = self.sink.record(measurement, raw) {
                                error!("Failed to record {} ({}): {}", m.site_name, m.strategy, e);
                                self.sink_errors += 1;
                            }
                        }
                    }
                    TaskResult::Failure { kind, message } => {
                        warn!(
                            "[{}/{}] {} ({}) failed [{}]: {}",
                            done,
                            self.total_tasks,
                            outcome.target.name,
                            outcome.strategy,
                            kind,
                            message
                        );
                    }
                }
                self.outcomes.push(outcome);
            }
        }
    }

    fn into_report(mut self, run_id: String, cancelled: bool, skipped_tasks: usize) -> BatchReport {
        // A worker that died mid-attempt never resolved it.
        let resolved = self.stats.successful + self.stats.failed;
        if self.stats.total_requests > resolved {
            warn!(
                "{} attempt(s) never resolved, counting them as failed",
                self.stats.total_requests - resolved
            );
            self.stats.failed += self.stats.total_requests - resolved;
        }

        BatchReport {
            run_id,
            stats: self.stats,
            outcomes: self.outcomes,
            cancelled,
            skipped_tasks,
            sink_errors: self.sink_errors,
        }
    }
}

fn fmt_ms(v: Option<f64>) -> String {
    match v {
        Some(ms) => format!("{:.0}ms", ms),
        None => "N/A".to_string(),
    }
}
