use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use super::{validate_target_url, BackendClient, Failure, RawResponse};
use crate::config::{DEFAULT_PSI_ENDPOINT, DEFAULT_LOCALE, MAX_URL_LENGTH, USER_AGENT};
use crate::error::CollectorError;
use crate::model::{Strategy, Target};

#[derive(Debug, Clone)]
pub struct RemoteOptions {
    pub api_key: Option<String>,
    pub endpoint: String,
    pub locale: String,
}

impl Default for RemoteOptions {
    fn default() -> Self {
        RemoteOptions {
            api_key: None,
            endpoint: DEFAULT_PSI_ENDPOINT.to_string(),
            locale: DEFAULT_LOCALE.to_string(),
        }
    }
}

/// PageSpeed Insights style scoring API.
pub struct RemoteScoringClient {
    http: reqwest::Client,
    options: RemoteOptions,
}

impl RemoteScoringClient {
    pub fn new(options: RemoteOptions) -> Result<Self, CollectorError> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .pool_max_idle_per_host(4)
            .build()
            .map_err(|e| CollectorError::Other(format!("Failed to create HTTP client: {}", e)))?;
        Ok(RemoteScoringClient { http, options })
    }

    fn request_url(&self, target_url: &str, strategy: Strategy, key: &str) -> Result<url::Url, Failure> {
        url::Url::parse_with_params(
            &self.options.endpoint,
            &[
                ("url", target_url),
                ("key", key),
                ("strategy", strategy.as_str()),
                ("category", "performance"),
                ("locale", self.options.locale.as_str()),
            ],
        )
        .map_err(|e| {
            Failure::unavailable(format!(
                "Invalid API endpoint '{}': {}",
                self.options.endpoint, e
            ))
        })
    }
}

#[async_trait]
impl BackendClient for RemoteScoringClient {
    fn name(&self) -> &'static str {
        "pagespeed_insights"
    }

    async fn measure(
        &self,
        target: &Target,
        strategy: Strategy,
        timeout: Duration,
    ) -> Result<RawResponse, Failure> {
        let key = match self.options.api_key.as_deref() {
            Some(k) if !k.trim().is_empty() => k,
            _ => return Err(Failure::unavailable("API key is not configured")),
        };
        let target_url = validate_target_url(&target.url, MAX_URL_LENGTH)?;
        let request_url = self.request_url(target_url.as_str(), strategy, key)?;

        debug!("Scoring request: {} ({})", target.url, strategy);

        let response = self
            .http
            .get(request_url)
            .timeout(timeout)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        match status.as_u16() {
            200..=299 => {
                let body: serde_json::Value = response.json().await.map_err(|e| {
                    Failure::transient(format!("Unparseable response body: {}", e.without_url()))
                })?;
                Ok(RawResponse::Scoring(body))
            }

            429 => {
                let retry_after = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .map(Duration::from_secs);
                Err(Failure::rate_limited("HTTP 429: quota exceeded", retry_after))
            }

            401 | 403 => {
                let detail = error_detail(response).await;
                Err(Failure::unavailable(format!(
                    "HTTP {}: API key rejected{}",
                    status.as_u16(),
                    detail
                )))
            }

            400..=499 => {
                let detail = error_detail(response).await;
                Err(Failure::invalid_target(format!(
                    "HTTP {} for {}{}",
                    status.as_u16(),
                    target.url,
                    detail
                )))
            }

            _ => {
                let detail = error_detail(response).await;
                Err(Failure::transient(format!(
                    "HTTP {}: server error{}",
                    status.as_u16(),
                    detail
                )))
            }
        }
    }
}

/// The request URL carries the API key, so it is stripped from the message.
fn classify_transport_error(e: reqwest::Error) -> Failure {
    let e = e.without_url();
    if e.is_timeout() {
        Failure::transient(format!("Request timed out: {}", e))
    } else if e.is_connect() {
        Failure::transient(format!("Connection failed: {}", e))
    } else {
        Failure::transient(format!("Request failed: {}", e))
    }
}

/// `error.message` from the API body, formatted as a suffix.
async fn error_detail(response: reqwest::Response) -> String {
    let body: Option<serde_json::Value> = response.json().await.ok();
    body.as_ref()
        .and_then(|b| b.get("error"))
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
        .map(|m| format!(" ({})", m))
        .unwrap_or_default()
}
