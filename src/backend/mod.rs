pub mod dry_run;
pub mod harness;
pub mod remote;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::model::{Strategy, Target};

pub use dry_run::DryRunClient;
pub use harness::{HarnessMode, HarnessOptions, LocalHarnessClient};
pub use remote::{RemoteOptions, RemoteScoringClient};

// ============================================================================
// Failure taxonomy
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// HTTP 429 or a harness quota signal.
    RateLimited,
    /// Timeout, connect error, 5xx, harness crash.
    Transient,
    /// Malformed URL or a 4xx the backend will keep rejecting.
    InvalidTarget,
    /// Missing/invalid credentials or an absent harness.
    BackendUnavailable,
    /// Response arrived but could not be turned into a record.
    Normalization,
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::RateLimited | ErrorKind::Transient)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Transient => "transient",
            ErrorKind::InvalidTarget => "invalid_target",
            ErrorKind::BackendUnavailable => "backend_unavailable",
            ErrorKind::Normalization => "normalization",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure of one backend call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Failure {
    pub kind: ErrorKind,
    pub message: String,
    /// Backend-provided hint, only set for `RateLimited`.
    pub retry_after: Option<Duration>,
}

impl Failure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Failure {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Failure {
            kind: ErrorKind::RateLimited,
            message: message.into(),
            retry_after,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn invalid_target(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidTarget, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BackendUnavailable, message)
    }
}

// ============================================================================
// Raw responses
// ============================================================================

/// Artifacts of one harness run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HarnessOutput {
    pub har: Option<serde_json::Value>,
    pub browsertime: Option<serde_json::Value>,
    pub artifact_dir: Option<PathBuf>,
    pub browser: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RawResponse {
    /// Scoring API JSON body.
    Scoring(serde_json::Value),
    Harness(HarnessOutput),
    /// Placeholder produced without touching any backend.
    DryRun,
}

impl RawResponse {
    /// JSON written next to the normalized output.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            RawResponse::Scoring(body) => body.clone(),
            RawResponse::Harness(out) => serde_json::json!({
                "har": out.har,
                "browsertime": out.browsertime,
                "artifact_dir": out.artifact_dir,
                "browser": out.browser,
            }),
            RawResponse::DryRun => serde_json::json!({ "dry_run": true }),
        }
    }

    /// Where a human can find the payload when normalization fails.
    pub fn describe(&self) -> String {
        match self {
            RawResponse::Scoring(body) => {
                let bytes = serde_json::to_string(body).map(|s| s.len()).unwrap_or(0);
                let keys = match body.as_object() {
                    Some(obj) if !obj.is_empty() => {
                        obj.keys().map(String::as_str).collect::<Vec<_>>().join(", ")
                    }
                    Some(_) => "none".to_string(),
                    None => format!("not an object ({})", json_kind(body)),
                };
                format!("scoring api body, {} bytes, top-level keys: {}", bytes, keys)
            }
            RawResponse::Harness(out) => match &out.artifact_dir {
                Some(dir) => format!("harness artifacts at {}", dir.display()),
                None => "harness output".to_string(),
            },
            RawResponse::DryRun => "dry run".to_string(),
        }
    }
}

fn json_kind(v: &serde_json::Value) -> &'static str {
    match v {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

// ============================================================================
// Backend trait
// ============================================================================

/// One measurement call for one (target, strategy). Implementations never
/// retry internally.
#[async_trait]
pub trait BackendClient: Send + Sync {
    fn name(&self) -> &'static str;

    async fn measure(
        &self,
        target: &Target,
        strategy: Strategy,
        timeout: Duration,
    ) -> Result<RawResponse, Failure>;
}

#[async_trait]
impl<T: BackendClient + ?Sized> BackendClient for std::sync::Arc<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn measure(
        &self,
        target: &Target,
        strategy: Strategy,
        timeout: Duration,
    ) -> Result<RawResponse, Failure> {
        (**self).measure(target, strategy, timeout).await
    }
}

/// Scheme, length and parse checks shared by every backend.
pub fn validate_target_url(raw: &str, max_len: usize) -> Result<url::Url, Failure> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Failure::invalid_target("URL is empty"));
    }
    if trimmed.len() > max_len {
        return Err(Failure::invalid_target(format!(
            "URL is {} characters long (max {})",
            trimmed.len(),
            max_len
        )));
    }
    let parsed = url::Url::parse(trimmed)
        .map_err(|e| Failure::invalid_target(format!("Invalid URL '{}': {}", trimmed, e)))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(Failure::invalid_target(format!(
            "Unsupported scheme '{}' in {}",
            parsed.scheme(),
            trimmed
        )));
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(Failure::invalid_target(format!("URL has no host: {}", trimmed)));
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(ErrorKind::RateLimited.is_retryable());
        assert!(ErrorKind::Transient.is_retryable());
        assert!(!ErrorKind::InvalidTarget.is_retryable());
        assert!(!ErrorKind::BackendUnavailable.is_retryable());
        assert!(!ErrorKind::Normalization.is_retryable());
    }

    #[test]
    fn test_validate_target_url() {
        assert!(validate_target_url("https://example.com/a?b=c", 2000).is_ok());
        assert!(validate_target_url("http://example.com", 2000).is_ok());

        let err = validate_target_url("ftp://example.com", 2000).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidTarget);

        let long = format!("https://example.com/{}", "a".repeat(2000));
        assert_eq!(
            validate_target_url(&long, 2000).unwrap_err().kind,
            ErrorKind::InvalidTarget
        );

        assert!(validate_target_url("", 2000).is_err());
        assert!(validate_target_url("not a url", 2000).is_err());
    }
    #[test]
    fn test_describe_scoring_body() {
        let body = serde_json::json!({"id": "x", "error": {"code": 500}});
        let len = serde_json::to_string(&body).unwrap().len();
        let text = RawResponse::Scoring(body).describe();
        assert!(text.contains(&format!("{} bytes", len)), "{}", text);
        assert!(text.contains("top-level keys:"), "{}", text);
        assert!(text.contains("error") && text.contains("id"), "{}", text);

        let text = RawResponse::Scoring(serde_json::json!([1, 2])).describe();
        assert!(text.contains("not an object (array)"), "{}", text);
    }
}
