use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

use crate::backend::{HarnessOptions, RemoteOptions};
use crate::error::CollectorError;
use crate::model::Strategy;
use crate::retry::RetryPolicy;
use crate::settings::{FileSettings, OutputSettings};

/// Web performance collector: measures target URLs through a scoring API or a
/// local browser harness and writes normalized metrics.
#[derive(Parser, Debug, Clone)]
#[command(name = "webperf-collector", version)]
pub struct CliArgs {
    /// Path to the YAML settings file
    #[arg(short = 'c', long = "config", default_value = "config/config.yaml")]
    pub config: PathBuf,

    /// Device strategy to measure
    #[arg(short = 's', long = "strategy", value_enum, default_value_t = StrategyArg::Both)]
    pub strategy: StrategyArg,

    /// Measurement backend
    #[arg(short = 'b', long = "backend", value_enum, default_value_t = BackendKind::Remote)]
    pub backend: BackendKind,

    /// Validate inputs and exercise the pipeline without calling any backend
    #[arg(long = "dry-run")]
    pub dry_run: bool,

    /// Override the target CSV from the settings file
    #[arg(short = 't', long = "targets-csv")]
    pub targets_csv: Option<PathBuf>,

    /// Run measurements concurrently
    #[arg(short = 'p', long = "parallel")]
    pub parallel: bool,

    /// Concurrent measurements in parallel mode
    #[arg(short = 'w', long = "max-workers")]
    pub max_workers: Option<usize>,

    /// Debug logging
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Report local harness / Docker availability and exit
    #[arg(long = "check-harness")]
    pub check_harness: bool,
}

impl CliArgs {
    /// `-v` wins over the settings file.
    pub fn log_level<'a>(&self, settings: &'a FileSettings) -> &'a str {
        if self.verbose {
            "debug"
        } else {
            settings.logging.level.as_str()
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyArg {
    Mobile,
    Desktop,
    Both,
}

impl StrategyArg {
    pub fn strategies(&self) -> Vec<Strategy> {
        match self {
            StrategyArg::Mobile => vec![Strategy::Mobile],
            StrategyArg::Desktop => vec![Strategy::Desktop],
            StrategyArg::Both => Strategy::ALL.to_vec(),
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Remote,
    Harness,
}

/// Knobs of one batch run.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub parallel: bool,
    pub max_workers: usize,
    pub retry: RetryPolicy,
    /// Per-call timeout.
    pub timeout: Duration,
    pub dry_run: bool,
    /// Stop dispatching new tasks after this long.
    pub batch_timeout: Option<Duration>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig {
            parallel: false,
            max_workers: default_max_workers(),
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            dry_run: false,
            batch_timeout: None,
        }
    }
}

/// Everything a run needs, resolved from CLI flags and the settings file.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub backend: BackendKind,
    pub strategies: Vec<Strategy>,
    pub targets_csv: PathBuf,
    pub batch: BatchConfig,
    pub remote: RemoteOptions,
    pub harness: HarnessOptions,
    pub output: OutputSettings,
}

// Retry constants
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
pub const DEFAULT_MAX_DELAY_SECS: u64 = 60;

// Timeout constants
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;
pub const MIN_REMOTE_TIMEOUT_SECS: u64 = 10;
pub const HARNESS_TIMEOUT_SECS: u64 = 300; // 5 minutes
pub const HARNESS_VERSION_TIMEOUT_SECS: u64 = 10;

// Concurrency constants
pub const DEFAULT_MAX_WORKERS: usize = 4;

// Remote API constants
pub const DEFAULT_PSI_ENDPOINT: &str = "https://www.googleapis.com/pagespeedonline/v5/runPagespeed";
pub const DEFAULT_LOCALE: &str = "ja";
pub const USER_AGENT: &str = concat!("webperf-collector/", env!("CARGO_PKG_VERSION"));
pub const PLACEHOLDER_API_KEY: &str = "your_api_key_here";
pub const API_KEY_ENV: &str = "PSI_API_KEY";

// Harness constants
pub const DEFAULT_HARNESS_BINARY: &str = "sitespeed.io";
pub const DEFAULT_DOCKER_IMAGE: &str = "sitespeedio/sitespeed.io:latest";

// Target constants
pub const MAX_URL_LENGTH: usize = 2000;

// Output constants
pub const MAX_CSV_FILE_BYTES: u64 = 100 * 1024 * 1024;

// Dry-run estimate
pub const ESTIMATED_SECS_PER_MEASUREMENT: f64 = 30.0;
pub const ESTIMATE_OVERHEAD_FACTOR: f64 = 1.1;

/// `min(DEFAULT_MAX_WORKERS, available cores)`.
pub fn default_max_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(DEFAULT_MAX_WORKERS)
}

impl CollectorConfig {
    /// Merges CLI flags over file settings and validates the result.
    pub fn resolve(args: &CliArgs, settings: FileSettings) -> Result<Self, CollectorError> {
        let api = settings.api;

        if api.retry_count == 0 {
            return Err(CollectorError::Config(
                "api.retry_count must be at least 1".to_string(),
            ));
        }
        if api.timeout_secs == 0 || settings.harness.timeout_secs == 0 {
            return Err(CollectorError::Config(
                "timeouts must be positive".to_string(),
            ));
        }

        let api_key = api
            .key
            .filter(|k| !k.trim().is_empty() && !k.starts_with("${"))
            .or_else(|| std::env::var(API_KEY_ENV).ok().filter(|k| !k.trim().is_empty()));

        if args.backend == BackendKind::Remote && !args.dry_run {
            match api_key.as_deref() {
                None => {
                    return Err(CollectorError::Config(format!(
                        "API key is not set (api.key or {})",
                        API_KEY_ENV
                    )))
                }
                Some(PLACEHOLDER_API_KEY) => {
                    return Err(CollectorError::Config(
                        "API key is still the placeholder value".to_string(),
                    ))
                }
                Some(_) => {}
            }
        }

        let timeout = match args.backend {
            BackendKind::Remote => {
                Duration::from_secs(api.timeout_secs.max(MIN_REMOTE_TIMEOUT_SECS))
            }
            BackendKind::Harness => Duration::from_secs(settings.harness.timeout_secs),
        };

        let max_workers = args
            .max_workers
            .or(settings.execution.max_workers)
            .unwrap_or_else(default_max_workers)
            .max(1);

        let batch = BatchConfig {
            parallel: args.parallel || settings.execution.parallel,
            max_workers,
            retry: RetryPolicy {
                max_attempts: api.retry_count,
                base_delay: Duration::from_millis(api.base_delay_ms),
                max_delay: Duration::from_secs(api.max_delay_secs),
            },
            timeout,
            dry_run: args.dry_run,
            batch_timeout: settings.execution.batch_timeout_secs.map(Duration::from_secs),
        };

        let harness = HarnessOptions {
            mode: settings.harness.mode,
            binary: DEFAULT_HARNESS_BINARY.to_string(),
            docker_image: settings.harness.docker_image,
            browser: settings.harness.browser,
            iterations: settings.harness.iterations.max(1),
            connectivity: settings.harness.connectivity,
            output_dir: settings.harness.output_dir,
            extra_options: settings.harness.extra_options,
            allow_private_hosts: settings.harness.allow_private_hosts,
        };

        Ok(CollectorConfig {
            backend: args.backend,
            strategies: args.strategy.strategies(),
            targets_csv: args
                .targets_csv
                .clone()
                .unwrap_or(settings.input.targets_csv),
            batch,
            remote: RemoteOptions {
                api_key,
                endpoint: api.endpoint,
                locale: api.locale,
            },
            harness,
            output: settings.output,
        })
    }
}
