use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::backend::HarnessMode;
use crate::config::{
    DEFAULT_BASE_DELAY_MS, DEFAULT_DOCKER_IMAGE, DEFAULT_LOCALE, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_MAX_DELAY_SECS, DEFAULT_PSI_ENDPOINT, DEFAULT_TIMEOUT_SECS, HARNESS_TIMEOUT_SECS,
};
use crate::error::CollectorError;

/// YAML settings file. Every section and field has a default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileSettings {
    pub api: ApiSettings,
    pub harness: HarnessSettings,
    pub input: InputSettings,
    pub output: OutputSettings,
    pub execution: ExecutionSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    pub key: Option<String>,
    pub endpoint: String,
    pub locale: String,
    pub timeout_secs: u64,
    /// Total attempts per task.
    pub retry_count: u32,
    pub base_delay_ms: u64,
    pub max_delay_secs: u64,
}

impl Default for ApiSettings {
    fn default() -> Self {
        ApiSettings {
            key: None,
            endpoint: DEFAULT_PSI_ENDPOINT.to_string(),
            locale: DEFAULT_LOCALE.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            retry_count: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_secs: DEFAULT_MAX_DELAY_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessSettings {
    pub mode: HarnessMode,
    pub docker_image: String,
    pub browser: String,
    pub iterations: u32,
    pub connectivity: String,
    pub output_dir: PathBuf,
    pub timeout_secs: u64,
    pub allow_private_hosts: bool,
    pub extra_options: BTreeMap<String, String>,
}

impl Default for HarnessSettings {
    fn default() -> Self {
        HarnessSettings {
            mode: HarnessMode::Local,
            docker_image: DEFAULT_DOCKER_IMAGE.to_string(),
            browser: "chrome".to_string(),
            iterations: 1,
            connectivity: "native".to_string(),
            output_dir: PathBuf::from("output/harness"),
            timeout_secs: HARNESS_TIMEOUT_SECS,
            allow_private_hosts: false,
            extra_options: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InputSettings {
    pub targets_csv: PathBuf,
}

impl Default for InputSettings {
    fn default() -> Self {
        InputSettings {
            targets_csv: PathBuf::from("config/targets.csv"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    pub json_dir: PathBuf,
    pub csv_file: PathBuf,
    pub log_file: Option<PathBuf>,
}

impl Default for OutputSettings {
    fn default() -> Self {
        OutputSettings {
            json_dir: PathBuf::from("output/json"),
            csv_file: PathBuf::from("output/csv/metrics.csv"),
            log_file: Some(PathBuf::from("logs/execution.log")),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSettings {
    pub parallel: bool,
    pub max_workers: Option<usize>,
    pub batch_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        LoggingSettings {
            level: "info".to_string(),
        }
    }
}

/// Reads the settings file. A missing file yields defaults; an unreadable
/// or malformed one is an error.
pub fn load_settings(path: &Path) -> Result<FileSettings, CollectorError> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("Settings file {:?} not found, using defaults", path);
            return Ok(FileSettings::default());
        }
        Err(e) => return Err(e.into()),
    };
    let settings = parse_settings(&content)?;
    info!("Loaded settings from {:?}", path);
    Ok(settings)
}

pub fn parse_settings(content: &str) -> Result<FileSettings, CollectorError> {
    let mut raw: serde_yaml::Value = serde_yaml::from_str(content)?;
    if raw.is_null() {
        return Ok(FileSettings::default());
    }
    substitute_env(&mut raw);
    Ok(serde_yaml::from_value(raw)?)
}

/// Replaces whole-string `${VAR}` values with the environment value. Unset
/// variables are left as-is.
fn substitute_env(value: &mut serde_yaml::Value) {
    match value {
        serde_yaml::Value::String(s) => {
            if let Some(name) = s.strip_prefix("${").and_then(|r| r.strip_suffix('}')) {
                match std::env::var(name) {
                    Ok(v) => *s = v,
                    Err(_) => warn!("Environment variable {} is not set", name),
                }
            }
        }
        serde_yaml::Value::Sequence(items) => items.iter_mut().for_each(substitute_env),
        serde_yaml::Value::Mapping(map) => {
            for (_, v) in map.iter_mut() {
                substitute_env(v);
            }
        }
        serde_yaml::Value::Tagged(tagged) => substitute_env(&mut tagged.value),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substitutes_whole_string_only() {
        std::env::set_var("WEBPERF_SETTINGS_TEST_KEY", "abc123");
        let s = parse_settings(
            "api:\n  key: \"${WEBPERF_SETTINGS_TEST_KEY}\"\n  endpoint: \"https://x/${WEBPERF_SETTINGS_TEST_KEY}\"\n",
        )
        .unwrap();
        assert_eq!(s.api.key.as_deref(), Some("abc123"));
        assert_eq!(s.api.endpoint, "https://x/${WEBPERF_SETTINGS_TEST_KEY}");
    }

    #[test]
    fn test_unset_variable_is_kept() {
        let s = parse_settings("api:\n  key: \"${WEBPERF_SETTINGS_TEST_UNSET}\"\n").unwrap();
        assert_eq!(s.api.key.as_deref(), Some("${WEBPERF_SETTINGS_TEST_UNSET}"));
    }
}
