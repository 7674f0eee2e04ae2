pub mod har;
pub mod resource;
pub mod scoring;
pub mod summary;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

use crate::backend::RawResponse;
use crate::model::{Measurement, MetricsRecord, Milestone, Strategy, Target};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NormalizationError {
    #[error("response has no {0}")]
    Missing(&'static str),

    #[error("unexpected shape at {path}: {message}")]
    Shape { path: String, message: String },

    #[error("harness produced neither HAR nor browsertime data")]
    EmptyHarness,
}

/// Canonical metrics (and waterfall, when per-request data exists) for one
/// raw backend response.
pub fn normalize(
    raw: &RawResponse,
    target: &Target,
    strategy: Strategy,
) -> Result<Measurement, NormalizationError> {
    normalize_at(raw, target, strategy, Utc::now())
}

/// Same as [`normalize`] with a fixed extraction timestamp, so the output is a
/// pure function of its inputs.
pub fn normalize_at(
    raw: &RawResponse,
    target: &Target,
    strategy: Strategy,
    extracted_at: DateTime<Utc>,
) -> Result<Measurement, NormalizationError> {
    let extracted_at = extracted_at.to_rfc3339_opts(SecondsFormat::Millis, true);
    match raw {
        RawResponse::Scoring(body) => scoring::normalize(body, target, strategy, &extracted_at),
        RawResponse::Harness(output) => har::normalize(output, target, strategy, &extracted_at),
        RawResponse::DryRun => Ok(Measurement {
            metrics: MetricsRecord::identity(target, strategy, "dry_run"),
            waterfall: None,
        }),
    }
}

// ============================================================================
// Shared extraction helpers
// ============================================================================

/// A finite, non-negative number. Anything else is treated as absent.
pub(crate) fn metric(value: Option<&Value>) -> Option<f64> {
    value
        .and_then(Value::as_f64)
        .filter(|v| v.is_finite() && *v >= 0.0)
}

/// Strictly positive byte count.
pub(crate) fn positive_size(value: Option<&Value>) -> Option<u64> {
    value
        .and_then(Value::as_f64)
        .filter(|v| v.is_finite() && *v > 0.0)
        .map(|v| v.round() as u64)
}

pub(crate) fn text(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

// key, label, color
const MILESTONES: &[(&str, &str, &str)] = &[
    ("ttfb", "Time to First Byte", "#4CAF50"),
    ("start_render", "Start Render", "#2196F3"),
    ("fcp", "First Contentful Paint", "#FF9800"),
    ("lcp", "Largest Contentful Paint", "#E91E63"),
    ("dom_content_loaded", "DOM Content Loaded", "#9C27B0"),
    ("dom_complete", "DOM Complete", "#673AB7"),
    ("load", "Load Event", "#F44336"),
    ("fully_loaded", "Fully Loaded", "#607D8B"),
];

/// Milestones with a positive time, ordered by time.
pub(crate) fn milestones(values: &[(&str, Option<f64>)]) -> Vec<Milestone> {
    let mut out: Vec<Milestone> = MILESTONES
        .iter()
        .filter_map(|(key, label, color)| {
            let time = values
                .iter()
                .find(|(k, _)| k == key)
                .and_then(|(_, v)| *v)
                .filter(|t| *t > 0.0)?;
            Some(Milestone {
                key: key.to_string(),
                time_ms: time,
                label: label.to_string(),
                color: color.to_string(),
            })
        })
        .collect();
    out.sort_by(|a, b| a.time_ms.total_cmp(&b.time_ms));
    out
}
