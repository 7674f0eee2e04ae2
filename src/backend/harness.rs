use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{validate_target_url, BackendClient, Failure, HarnessOutput, RawResponse};
use crate::config::{
    DEFAULT_DOCKER_IMAGE, DEFAULT_HARNESS_BINARY, HARNESS_VERSION_TIMEOUT_SECS, MAX_URL_LENGTH,
};
use crate::model::{Strategy, Target};
use crate::sink::safe_file_name;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HarnessMode {
    #[default]
    Local,
    Docker,
}

#[derive(Debug, Clone)]
pub struct HarnessOptions {
    pub mode: HarnessMode,
    /// Program for local mode; resolved through PATH.
    pub binary: String,
    pub docker_image: String,
    pub browser: String,
    pub iterations: u32,
    /// `native` means no throttling.
    pub connectivity: String,
    pub output_dir: PathBuf,
    pub extra_options: BTreeMap<String, String>,
    pub allow_private_hosts: bool,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        HarnessOptions {
            mode: HarnessMode::Local,
            binary: DEFAULT_HARNESS_BINARY.to_string(),
            docker_image: DEFAULT_DOCKER_IMAGE.to_string(),
            browser: "chrome".to_string(),
            iterations: 1,
            connectivity: "native".to_string(),
            output_dir: PathBuf::from("output/harness"),
            extra_options: BTreeMap::new(),
            allow_private_hosts: false,
        }
    }
}

/// sitespeed.io style browser harness, run as a local binary or in Docker.
pub struct LocalHarnessClient {
    options: HarnessOptions,
}

impl LocalHarnessClient {
    pub fn new(options: HarnessOptions) -> Self {
        LocalHarnessClient { options }
    }

    fn program(&self) -> &str {
        match self.options.mode {
            HarnessMode::Local => &self.options.binary,
            HarnessMode::Docker => "docker",
        }
    }

    /// Full argument list for one run. `host_dir` is the artifact directory
    /// on this machine.
    pub fn build_args(&self, url: &str, strategy: Strategy, host_dir: &Path) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();

        let output_folder = match self.options.mode {
            HarnessMode::Docker => {
                args.extend([
                    "run".to_string(),
                    "--rm".to_string(),
                    "-v".to_string(),
                    format!("{}:/sitespeed.io", host_dir.display()),
                    self.options.docker_image.clone(),
                ]);
                "/sitespeed.io".to_string()
            }
            HarnessMode::Local => host_dir.display().to_string(),
        };

        args.extend([
            url.to_string(),
            "--outputFolder".to_string(),
            output_folder,
            "-b".to_string(),
            self.options.browser.clone(),
            "-n".to_string(),
            self.options.iterations.max(1).to_string(),
        ]);

        if self.options.connectivity != "native" {
            args.extend(["-c".to_string(), self.options.connectivity.clone()]);
        }
        if strategy == Strategy::Mobile {
            args.push("--mobile".to_string());
        }
        args.push("--visualMetrics".to_string());
        args.extend(["--screenshot.type".to_string(), "png".to_string()]);

        for (key, value) in &self.options.extra_options {
            match value.as_str() {
                "true" => args.push(format!("--{}", key)),
                "false" | "" => {}
                v => args.extend([format!("--{}", key), v.to_string()]),
            }
        }

        args
    }

    fn validate(&self, target: &Target) -> Result<url::Url, Failure> {
        if let Some(c) = target.url.chars().find(|c| is_dangerous_char(*c)) {
            return Err(Failure::invalid_target(format!(
                "URL contains dangerous character {:?}: {}",
                c, target.url
            )));
        }
        let parsed = validate_target_url(&target.url, MAX_URL_LENGTH)?;
        if !self.options.allow_private_hosts {
            check_public_host(&parsed)?;
        }
        for (key, value) in &self.options.extra_options {
            validate_option_key(key).map_err(Failure::unavailable)?;
            validate_option_value(value).map_err(Failure::unavailable)?;
        }
        Ok(parsed)
    }
}

#[async_trait]
impl BackendClient for LocalHarnessClient {
    fn name(&self) -> &'static str {
        "sitespeed"
    }

    async fn measure(
        &self,
        target: &Target,
        strategy: Strategy,
        timeout: Duration,
    ) -> Result<RawResponse, Failure> {
        let url = self.validate(target)?;

        let program = which::which(self.program()).map_err(|e| {
            Failure::unavailable(format!("{} not found on PATH: {}", self.program(), e))
        })?;

        let run_dir = self.options.output_dir.join(format!(
            "{}_{}_{}",
            safe_file_name(&target.name),
            strategy,
            uuid::Uuid::new_v4().simple()
        ));
        tokio::fs::create_dir_all(&run_dir).await.map_err(|e| {
            Failure::transient(format!("Failed to create {}: {}", run_dir.display(), e))
        })?;
        let run_dir = tokio::fs::canonicalize(&run_dir).await.unwrap_or(run_dir);

        let args = self.build_args(url.as_str(), strategy, &run_dir);
        debug!("Harness command: {} {}", program.display(), args.join(" "));

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(timeout, cmd.output()).await {
            Err(_) => {
                return Err(Failure::transient(format!(
                    "Harness timed out after {}s",
                    timeout.as_secs()
                )))
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Failure::unavailable(format!(
                    "Failed to spawn {}: {}",
                    program.display(),
                    e
                )))
            }
            Ok(Err(e)) => {
                return Err(Failure::transient(format!(
                    "Failed to spawn {}: {}",
                    program.display(),
                    e
                )))
            }
            Ok(Ok(output)) => output,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let detail = tail(stderr.trim(), 500);
            let message = format!("Harness exited with {}: {}", output.status, detail);
            if signals_rate_limit(&stderr) || signals_rate_limit(&stdout) {
                return Err(Failure::rate_limited(message, None));
            }
            return Err(Failure::transient(message));
        }

        Ok(RawResponse::Harness(collect_artifacts(
            &run_dir,
            Some(self.options.browser.clone()),
        )))
    }
}

// ============================================================================
// Artifact collection
// ============================================================================

/// First HAR file and `browsertime.json` found anywhere below `dir`.
pub fn collect_artifacts(dir: &Path, browser: Option<String>) -> HarnessOutput {
    HarnessOutput {
        har: find_json(dir, "*.har"),
        browsertime: find_json(dir, "browsertime.json"),
        artifact_dir: Some(dir.to_path_buf()),
        browser,
    }
}

fn find_json(dir: &Path, file_pattern: &str) -> Option<serde_json::Value> {
    let pattern = format!(
        "{}/**/{}",
        glob::Pattern::escape(&dir.to_string_lossy()),
        file_pattern
    );
    let mut paths: Vec<PathBuf> = match glob::glob(&pattern) {
        Ok(paths) => paths.filter_map(Result::ok).collect(),
        Err(e) => {
            warn!("Bad artifact pattern {}: {}", pattern, e);
            return None;
        }
    };
    paths.sort();

    let path = paths.into_iter().next()?;
    let content = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) => {
            warn!("Failed to read {:?}: {}", path, e);
            return None;
        }
    };
    match serde_json::from_str(&content) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!("Failed to parse {:?}: {}", path, e);
            None
        }
    }
}

// ============================================================================
// Input validation
// ============================================================================

fn is_dangerous_char(c: char) -> bool {
    c.is_whitespace() || c.is_control() || matches!(c, ';' | '|' | '`' | '$' | '<' | '>' | '\\')
}

fn check_public_host(url: &url::Url) -> Result<(), Failure> {
    let host = match url.host() {
        Some(h) => h,
        None => return Err(Failure::invalid_target("URL has no host")),
    };
    let ip: Option<IpAddr> = match host {
        url::Host::Domain(d) => {
            if d.eq_ignore_ascii_case("localhost") || d.ends_with(".localhost") {
                return Err(Failure::invalid_target(format!("Local host not allowed: {}", d)));
            }
            None
        }
        url::Host::Ipv4(v4) => Some(IpAddr::V4(v4)),
        url::Host::Ipv6(v6) => Some(IpAddr::V6(v6)),
    };
    if let Some(ip) = ip {
        if ip.is_loopback() || ip.is_unspecified() {
            return Err(Failure::invalid_target(format!("Local host not allowed: {}", ip)));
        }
        let private = match ip {
            IpAddr::V4(v4) => v4.is_private() || v4.is_link_local(),
            IpAddr::V6(v6) => (v6.segments()[0] & 0xfe00) == 0xfc00,
        };
        if private {
            return Err(Failure::invalid_target(format!("Private IP not allowed: {}", ip)));
        }
    }
    Ok(())
}

pub fn validate_option_key(key: &str) -> Result<(), String> {
    let mut chars = key.chars();
    match chars.next() {
        None => return Err("Option key is empty".to_string()),
        Some(c) if !c.is_ascii_alphabetic() => {
            return Err(format!("Invalid option key: {}", key));
        }
        Some(_) => {}
    }
    if chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')) {
        Ok(())
    } else {
        Err(format!("Invalid option key: {}", key))
    }
}

pub fn validate_option_value(value: &str) -> Result<(), String> {
    if value
        .chars()
        .any(|c| c.is_control() || matches!(c, ';' | '|' | '`' | '$' | '<' | '>'))
    {
        return Err(format!("Option value contains dangerous characters: {}", value));
    }
    Ok(())
}

const RATE_LIMIT_PHRASES: &[&str] = &[
    "http 429",
    "status 429",
    "status code 429",
    "too many requests",
    "rate limit",
    "quota exceeded",
];

fn signals_rate_limit(output: &str) -> bool {
    let lower = output.to_ascii_lowercase();
    RATE_LIMIT_PHRASES.iter().any(|p| lower.contains(p))
}

fn tail(s: &str, max_chars: usize) -> &str {
    let count = s.chars().count();
    if count <= max_chars {
        return s;
    }
    match s.char_indices().nth(count - max_chars) {
        Some((i, _)) => &s[i..],
        None => s,
    }
}

// ============================================================================
// Installation check
// ============================================================================

#[derive(Debug, Clone, Default, Serialize)]
pub struct HarnessInstallation {
    pub local: bool,
    pub local_version: Option<String>,
    pub docker: bool,
    pub docker_version: Option<String>,
    pub recommended: Option<HarnessMode>,
}

/// Reports which harness modes are usable on this machine.
pub async fn check_installation(binary: &str) -> HarnessInstallation {
    let mut report = HarnessInstallation::default();

    if let Ok(path) = which::which(binary) {
        report.local = true;
        report.local_version = program_version(&path).await;
    }
    if let Ok(path) = which::which("docker") {
        report.docker = true;
        report.docker_version = program_version(&path).await;
    }

    report.recommended = if report.local {
        Some(HarnessMode::Local)
    } else if report.docker {
        Some(HarnessMode::Docker)
    } else {
        None
    };
    report
}

async fn program_version(program: &Path) -> Option<String> {
    let mut cmd = Command::new(program);
    cmd.arg("--version")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    let output = tokio::time::timeout(
        Duration::from_secs(HARNESS_VERSION_TIMEOUT_SECS),
        cmd.output(),
    )
    .await
    .ok()?
    .ok()?;
    let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if version.is_empty() {
        None
    } else {
        Some(version)
    }
}
