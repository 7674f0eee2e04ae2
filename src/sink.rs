use chrono::Utc;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::backend::RawResponse;
use crate::config::MAX_CSV_FILE_BYTES;
use crate::error::CollectorError;
use crate::model::{Measurement, MetricsRecord, Priority, Strategy};

/// Receives each successful task's measurement, once, from the aggregation
/// point. Errors are logged and counted; they never fail the task.
pub trait ResultSink: Send {
    fn record(&mut self, measurement: &Measurement, raw: &RawResponse)
        -> Result<(), CollectorError>;

    fn finish(&mut self) -> Result<(), CollectorError> {
        Ok(())
    }
}

impl<F> ResultSink for F
where
    F: FnMut(&Measurement, &RawResponse) -> Result<(), CollectorError> + Send,
{
    fn record(
        &mut self,
        measurement: &Measurement,
        raw: &RawResponse,
    ) -> Result<(), CollectorError> {
        self(measurement, raw)
    }
}

/// Keeps every measurement in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub measurements: Vec<Measurement>,
}

impl ResultSink for MemorySink {
    fn record(&mut self, measurement: &Measurement, _raw: &RawResponse) -> Result<(), CollectorError> {
        self.measurements.push(measurement.clone());
        Ok(())
    }
}

// ============================================================================
// File output
// ============================================================================

#[derive(Serialize)]
struct CsvRow<'a> {
    site_name: &'a str,
    strategy: Strategy,
    onload_ms: Option<f64>,
    ttfb_ms: Option<f64>,
    lcp_ms: Option<f64>,
    cls: Option<f64>,
    speed_index_ms: Option<f64>,
}

/// Full per-run record, identity first, then lab, observed and field values.
#[derive(Serialize)]
struct SummaryRow<'a> {
    site_name: &'a str,
    url: &'a str,
    strategy: Strategy,
    category: Option<&'a str>,
    priority: Option<Priority>,
    fetched_at: Option<&'a str>,
    onload_ms: Option<f64>,
    ttfb_ms: Option<f64>,
    lcp_ms: Option<f64>,
    cls: Option<f64>,
    speed_index_ms: Option<f64>,
    fcp_ms: Option<f64>,
    tbt_ms: Option<f64>,
    interactive_ms: Option<f64>,
    observed_lcp_ms: Option<f64>,
    observed_cls: Option<f64>,
    dom_content_loaded_ms: Option<f64>,
    server_response_time_ms: Option<f64>,
    field_lcp_ms: Option<f64>,
    field_fcp_ms: Option<f64>,
    field_cls: Option<f64>,
    field_inp_ms: Option<f64>,
    field_overall_category: Option<&'a str>,
    performance_score: Option<f64>,
    lighthouse_version: Option<&'a str>,
    form_factor: Option<&'a str>,
    tool: &'a str,
}

impl<'a> From<&'a MetricsRecord> for SummaryRow<'a> {
    fn from(m: &'a MetricsRecord) -> Self {
        SummaryRow {
            site_name: &m.site_name,
            url: &m.url,
            strategy: m.strategy,
            category: m.category.as_deref(),
            priority: m.priority,
            fetched_at: m.fetched_at.as_deref(),
            onload_ms: m.onload_ms,
            ttfb_ms: m.ttfb_ms,
            lcp_ms: m.lcp_ms,
            cls: m.cls,
            speed_index_ms: m.speed_index_ms,
            fcp_ms: m.fcp_ms,
            tbt_ms: m.tbt_ms,
            interactive_ms: m.interactive_ms,
            observed_lcp_ms: m.observed_lcp_ms,
            observed_cls: m.observed_cls,
            dom_content_loaded_ms: m.dom_content_loaded_ms,
            server_response_time_ms: m.server_response_time_ms,
            field_lcp_ms: m.field_lcp_ms,
            field_fcp_ms: m.field_fcp_ms,
            field_cls: m.field_cls,
            field_inp_ms: m.field_inp_ms,
            field_overall_category: m.field_overall_category.as_deref(),
            performance_score: m.performance_score,
            lighthouse_version: m.lighthouse_version.as_deref(),
            form_factor: m.form_factor.as_deref(),
            tool: &m.tool,
        }
    }
}

/// Appends one CSV row per measurement and writes the raw response and the
/// waterfall as JSON files. On `finish`, the run's full records go to a
/// timestamped summary CSV next to the metrics CSV.
pub struct FileSink {
    json_dir: PathBuf,
    csv_path: PathBuf,
    csv: csv::Writer<File>,
    rows_written: usize,
    records: Vec<MetricsRecord>,
    summary_path: Option<PathBuf>,
}

impl FileSink {
    pub fn new(json_dir: &Path, csv_path: &Path) -> Result<Self, CollectorError> {
        Self::with_csv_limit(json_dir, csv_path, MAX_CSV_FILE_BYTES)
    }

    /// Like `new`, but an existing metrics CSV larger than `max_csv_bytes`
    /// is moved aside first.
    pub fn with_csv_limit(
        json_dir: &Path,
        csv_path: &Path,
        max_csv_bytes: u64,
    ) -> Result<Self, CollectorError> {
        std::fs::create_dir_all(json_dir)?;
        if let Some(parent) = csv_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        if let Some(backup) = rotate_if_oversized(csv_path, max_csv_bytes)? {
            info!("Metrics CSV rotated to {:?}", backup);
        }

        let is_new = std::fs::metadata(csv_path).map(|m| m.len() == 0).unwrap_or(true);
        let file = OpenOptions::new().create(true).append(true).open(csv_path)?;
        let csv = csv::WriterBuilder::new()
            .has_headers(is_new)
            .from_writer(file);

        Ok(FileSink {
            json_dir: json_dir.to_path_buf(),
            csv_path: csv_path.to_path_buf(),
            csv,
            rows_written: 0,
            records: Vec::new(),
            summary_path: None,
        })
    }

    pub fn rows_written(&self) -> usize {
        self.rows_written
    }

    /// Summary CSV written by the last `finish`, if any rows were recorded.
    pub fn summary_path(&self) -> Option<&Path> {
        self.summary_path.as_deref()
    }

    fn write_summary(&mut self) -> Result<(), CollectorError> {
        let records = std::mem::take(&mut self.records);
        if records.is_empty() {
            debug!("No measurements recorded, summary CSV skipped");
            return Ok(());
        }

        let dir = self.csv_path.parent().unwrap_or_else(|| Path::new(""));
        let path = dir.join(format!(
            "metrics_summary_{}.csv",
            Utc::now().format("%Y%m%d_%H%M%S")
        ));
        let mut writer = csv::Writer::from_path(&path)?;
        for record in &records {
            writer.serialize(SummaryRow::from(record))?;
        }
        writer.flush()?;

        info!("Summary CSV written: {:?} ({} rows)", path, records.len());
        self.summary_path = Some(path);
        Ok(())
    }

    fn write_json(&self, file_name: &str, value: &impl Serialize) -> Result<PathBuf, CollectorError> {
        let path = self.json_dir.join(file_name);
        let json = serde_json::to_string_pretty(value)?;
        std::fs::write(&path, json)
            .map_err(|e| CollectorError::Output(format!("Failed to write {:?}: {}", path, e)))?;
        Ok(path)
    }
}

impl ResultSink for FileSink {
    fn record(&mut self, measurement: &Measurement, raw: &RawResponse) -> Result<(), CollectorError> {
        let m = &measurement.metrics;
        self.csv.serialize(CsvRow {
            site_name: &m.site_name,
            strategy: m.strategy,
            onload_ms: m.onload_ms,
            ttfb_ms: m.ttfb_ms,
            lcp_ms: m.lcp_ms,
            cls: m.cls,
            speed_index_ms: m.speed_index_ms,
        })?;
        self.csv.flush()?;
        self.rows_written += 1;
        self.records.push(m.clone());

        let stem = format!(
            "{}_{}_{}",
            safe_file_name(&m.site_name),
            m.strategy,
            Utc::now().format("%Y%m%d_%H%M%S_%3f")
        );

        if !matches!(raw, RawResponse::DryRun) {
            let path = self.write_json(&format!("{}.json", stem), &raw.to_json())?;
            debug!("Raw response saved: {:?}", path);
        }
        if let Some(waterfall) = &measurement.waterfall {
            let path = self.write_json(&format!("{}_waterfall.json", stem), waterfall)?;
            debug!("Waterfall saved: {:?}", path);
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), CollectorError> {
        self.csv.flush().map_err(|e| {
            CollectorError::Output(format!("Failed to flush {:?}: {}", self.csv_path, e))
        })?;
        self.write_summary()
    }
}

/// Moves `path` to `{stem}_backup_{timestamp}{.ext}` in the same directory
/// when it is larger than `max_bytes`. Returns the backup path.
pub fn rotate_if_oversized(path: &Path, max_bytes: u64) -> Result<Option<PathBuf>, CollectorError> {
    let size = match std::fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(_) => return Ok(None),
    };
    if size <= max_bytes {
        return Ok(None);
    }

    warn!("Metrics CSV {:?} is {} bytes, rotating", path, size);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "metrics".to_string());
    let suffix = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let backup = path.with_file_name(format!(
        "{}_backup_{}{}",
        stem,
        Utc::now().format("%Y%m%d_%H%M%S"),
        suffix
    ));
    std::fs::rename(path, &backup).map_err(|e| {
        CollectorError::Output(format!("Failed to rotate {:?} to {:?}: {}", path, backup, e))
    })?;
    Ok(Some(backup))
}

/// Keeps alphanumerics, `-` and `_`; everything else becomes `_`.
pub fn safe_file_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "unnamed".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_file_name() {
        assert_eq!(safe_file_name("Example Site / Top"), "Example_Site___Top");
        assert_eq!(safe_file_name("トップ-page_1"), "トップ-page_1");
        assert_eq!(safe_file_name("  "), "unnamed");
    }
}
