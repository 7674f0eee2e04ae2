use std::path::PathBuf;
use tempfile::TempDir;

use webperf_collector::backend::HarnessMode;
use webperf_collector::settings::{load_settings, parse_settings};

#[test]
fn test_load_missing_file() {
    let dir = TempDir::new().unwrap();
    let settings = load_settings(&dir.path().join("nonexistent.yaml")).unwrap();
    assert!(settings.api.key.is_none());
    assert_eq!(settings.api.retry_count, 3);
    assert_eq!(settings.logging.level, "info");
    assert_eq!(settings.output.csv_file, PathBuf::from("output/csv/metrics.csv"));
}

#[test]
fn test_load_invalid_yaml() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bad.yaml");
    std::fs::write(&path, "api: [unterminated").unwrap();
    assert!(load_settings(&path).is_err());
}

#[test]
fn test_empty_file_is_defaults() {
    let settings = parse_settings("").unwrap();
    assert_eq!(settings.api.timeout_secs, 60);
    assert!(!settings.execution.parallel);
}

#[test]
fn test_load_full_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(
        &path,
        r#"
api:
  key: abc
  timeout_secs: 45
  retry_count: 5
  locale: en
harness:
  mode: docker
  browser: firefox
  iterations: 3
  extra_options:
    --cpu: "true"
output:
  json_dir: out/json
  csv_file: out/metrics.csv
  log_file: ~
execution:
  parallel: true
  max_workers: 2
logging:
  level: debug
"#,
    )
    .unwrap();

    let settings = load_settings(&path).unwrap();
    assert_eq!(settings.api.key.as_deref(), Some("abc"));
    assert_eq!(settings.api.timeout_secs, 45);
    assert_eq!(settings.api.retry_count, 5);
    assert_eq!(settings.api.locale, "en");
    // Unlisted fields keep their defaults.
    assert_eq!(settings.api.base_delay_ms, 1000);

    assert_eq!(settings.harness.mode, HarnessMode::Docker);
    assert_eq!(settings.harness.browser, "firefox");
    assert_eq!(settings.harness.iterations, 3);
    assert_eq!(settings.harness.extra_options["--cpu"], "true");

    assert_eq!(settings.output.json_dir, PathBuf::from("out/json"));
    assert!(settings.output.log_file.is_none());
    assert!(settings.execution.parallel);
    assert_eq!(settings.execution.max_workers, Some(2));
    assert_eq!(settings.logging.level, "debug");
}

#[test]
fn test_env_substitution_in_nested_values() {
    std::env::set_var("WEBPERF_SETTINGS_IT_DIR", "/data/out");
    let settings = parse_settings("output:\n  json_dir: \"${WEBPERF_SETTINGS_IT_DIR}\"\n").unwrap();
    assert_eq!(settings.output.json_dir, PathBuf::from("/data/out"));
}
