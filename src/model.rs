use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::backend::ErrorKind;

// ============================================================================
// Targets and strategies
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "high" => Some(Priority::High),
            "medium" => Some(Priority::Medium),
            "low" => Some(Priority::Low),
            _ => None,
        }
    }
}

/// One URL to measure. Identity is the URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub url: String,
    pub name: String,
    pub enabled: bool,
    pub category: Option<String>,
    pub priority: Option<Priority>,
    pub description: Option<String>,
}

impl Target {
    pub fn new(url: impl Into<String>, name: impl Into<String>) -> Self {
        Target {
            url: url.into(),
            name: name.into(),
            enabled: true,
            category: None,
            priority: None,
            description: None,
        }
    }
}

/// Device emulation mode. Declaration order is the task order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    #[default]
    Mobile,
    Desktop,
}

impl Strategy {
    pub const ALL: [Strategy; 2] = [Strategy::Mobile, Strategy::Desktop];

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Mobile => "mobile",
            Strategy::Desktop => "desktop",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Canonical metrics
// ============================================================================

/// Canonical per-(target, strategy) metrics. Unmeasured values stay `None`
/// and serialize as `null`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub site_name: String,
    pub url: String,
    pub strategy: Strategy,
    pub onload_ms: Option<f64>,
    pub ttfb_ms: Option<f64>,
    pub lcp_ms: Option<f64>,
    pub cls: Option<f64>,
    pub speed_index_ms: Option<f64>,
    pub fetched_at: Option<String>,

    pub fcp_ms: Option<f64>,
    pub tbt_ms: Option<f64>,
    pub interactive_ms: Option<f64>,
    pub dom_content_loaded_ms: Option<f64>,
    pub server_response_time_ms: Option<f64>,
    pub observed_lcp_ms: Option<f64>,
    pub observed_cls: Option<f64>,
    pub performance_score: Option<f64>,

    // Field (real-user) data
    pub field_lcp_ms: Option<f64>,
    pub field_cls: Option<f64>,
    pub field_fcp_ms: Option<f64>,
    pub field_inp_ms: Option<f64>,
    pub field_overall_category: Option<String>,

    pub lighthouse_version: Option<String>,
    pub form_factor: Option<String>,
    pub tool: String,
    pub category: Option<String>,
    pub priority: Option<Priority>,
}

impl MetricsRecord {
    /// Identity fields only; every measurement left unset.
    pub fn identity(target: &Target, strategy: Strategy, tool: &str) -> Self {
        MetricsRecord {
            site_name: target.name.clone(),
            url: target.url.clone(),
            strategy,
            tool: tool.to_string(),
            category: target.category.clone(),
            priority: target.priority,
            ..Default::default()
        }
    }
}

// ============================================================================
// Waterfall
// ============================================================================

/// Sentinel for a connection phase that did not occur.
pub const PHASE_ABSENT: f64 = -1.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RequestTimings {
    pub blocked: f64,
    pub dns: f64,
    pub connect: f64,
    pub ssl: f64,
    pub send: f64,
    pub wait: f64,
    pub receive: f64,
}

impl Default for RequestTimings {
    fn default() -> Self {
        RequestTimings {
            blocked: PHASE_ABSENT,
            dns: PHASE_ABSENT,
            connect: PHASE_ABSENT,
            ssl: PHASE_ABSENT,
            send: PHASE_ABSENT,
            wait: PHASE_ABSENT,
            receive: PHASE_ABSENT,
        }
    }
}

impl RequestTimings {
    pub fn phases(&self) -> [(&'static str, f64); 7] {
        [
            ("blocked", self.blocked),
            ("dns", self.dns),
            ("connect", self.connect),
            ("ssl", self.ssl),
            ("send", self.send),
            ("wait", self.wait),
            ("receive", self.receive),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEntry {
    pub index: usize,
    pub url: String,
    pub host: String,
    pub path: String,
    pub method: String,
    pub status: Option<u16>,
    pub status_text: String,
    pub content_type: String,
    pub mime_type: String,
    pub resource_type: String,
    pub protocol: String,
    pub transfer_size: u64,
    pub content_size: u64,
    pub header_size: u64,
    pub start_time_ms: f64,
    pub end_time_ms: f64,
    pub duration_ms: f64,
    pub timings: RequestTimings,
    pub connection_reused: bool,
    pub server_ip: Option<String>,
    pub is_secure: bool,
    pub from_cache: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Milestone {
    pub key: String,
    pub time_ms: f64,
    pub label: String,
    pub color: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaterfallMeta {
    pub tool: String,
    pub extracted_at: String,
    pub url: String,
    pub site_name: String,
    pub strategy: Strategy,
    pub browser: Option<String>,
    pub lighthouse_version: Option<String>,
    pub started_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceTypeBreakdown {
    /// Entry count per resource type.
    pub counts: BTreeMap<String, usize>,
    /// Transfer bytes per resource type.
    pub sizes: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseStats {
    pub count: usize,
    pub total_ms: f64,
    pub avg_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub reused: usize,
    pub new: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub from_cache: usize,
    pub from_network: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WaterfallSummary {
    pub total_entries: usize,
    pub total_transfer_size: u64,
    pub by_resource_type: ResourceTypeBreakdown,
    pub timing_stats: BTreeMap<String, PhaseStats>,
    pub connection_stats: ConnectionStats,
    pub cache_stats: CacheStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaterfallDocument {
    pub meta: WaterfallMeta,
    pub page_metrics: BTreeMap<String, Option<f64>>,
    pub milestones: Vec<Milestone>,
    pub entries: Vec<RequestEntry>,
    pub summary: WaterfallSummary,
}

// ============================================================================
// Batch accounting
// ============================================================================

/// Attempt-level counters. Every attempt resolves to exactly one of
/// `successful` or `failed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingStats {
    pub total_requests: u64,
    pub successful: u64,
    pub failed: u64,
    pub retried: u64,
    pub rate_limited: u64,
}

impl ProcessingStats {
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.successful as f64 / self.total_requests as f64 * 100.0
    }

    pub fn is_balanced(&self) -> bool {
        self.total_requests == self.successful + self.failed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub metrics: MetricsRecord,
    pub waterfall: Option<WaterfallDocument>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskResult {
    Success(Measurement),
    Failure { kind: ErrorKind, message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub index: usize,
    pub target: Target,
    pub strategy: Strategy,
    pub attempts: u32,
    pub result: TaskResult,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self.result, TaskResult::Success(_))
    }

    pub fn measurement(&self) -> Option<&Measurement> {
        match &self.result {
            TaskResult::Success(m) => Some(m),
            TaskResult::Failure { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchReport {
    pub run_id: String,
    pub stats: ProcessingStats,
    /// Ordered by task index.
    pub outcomes: Vec<TaskOutcome>,
    pub cancelled: bool,
    pub skipped_tasks: usize,
    pub sink_errors: usize,
}

impl BatchReport {
    pub fn succeeded_tasks(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failed_tasks(&self) -> impl Iterator<Item = &TaskOutcome> {
        self.outcomes.iter().filter(|o| !o.is_success())
    }

    pub fn all_succeeded(&self) -> bool {
        !self.cancelled && self.skipped_tasks == 0 && self.outcomes.iter().all(|o| o.is_success())
    }
}
