use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{info, warn};

use crate::backend::validate_target_url;
use crate::config::MAX_URL_LENGTH;
use crate::error::CollectorError;
use crate::model::{Priority, Target};

const REQUIRED_COLUMNS: &[&str] = &["url", "name"];

/// Loads the target list. Rows with an invalid URL or a URL seen earlier are
/// skipped with a warning.
pub fn load_targets(path: &Path) -> Result<Vec<Target>, CollectorError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        CollectorError::Targets(format!("Failed to read {:?}: {}", path, e))
    })?;
    let targets = parse_targets(&content)?;
    let enabled = targets.iter().filter(|t| t.enabled).count();
    info!(
        "Loaded {} targets from {:?} ({} enabled)",
        targets.len(),
        path,
        enabled
    );
    Ok(targets)
}

pub fn parse_targets(content: &str) -> Result<Vec<Target>, CollectorError> {
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(content.as_bytes());

    let columns: HashMap<String, usize> = reader
        .headers()?
        .iter()
        .enumerate()
        .map(|(i, h)| (h.trim().to_ascii_lowercase(), i))
        .collect();
    let missing: Vec<&str> = REQUIRED_COLUMNS
        .iter()
        .copied()
        .filter(|c| !columns.contains_key(*c))
        .collect();
    if !missing.is_empty() {
        return Err(CollectorError::Targets(format!(
            "Missing required columns: {}",
            missing.join(", ")
        )));
    }

    let mut targets = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for (i, record) in reader.records().enumerate() {
        let record = record?;
        let line = i + 2;
        let field = |name: &str| cell(&record, &columns, name);

        let (url, name) = match (field("url"), field("name")) {
            (Some(u), Some(n)) => (u.to_string(), n.to_string()),
            _ => {
                if record.iter().any(|v| !v.trim().is_empty()) {
                    warn!("Line {}: url and name are required, skipping", line);
                }
                continue;
            }
        };

        if let Err(e) = validate_target_url(&url, MAX_URL_LENGTH) {
            warn!("Line {}: {}, skipping", line, e.message);
            continue;
        }
        if !seen.insert(url.to_ascii_lowercase()) {
            warn!("Line {}: duplicate URL {}, skipping", line, url);
            continue;
        }

        let enabled = match field("enabled") {
            None => true,
            Some(v) => parse_bool(v).unwrap_or_else(|| {
                warn!("Line {}: unrecognized enabled value '{}', treating as enabled", line, v);
                true
            }),
        };
        let priority = field("priority").and_then(|p| {
            let parsed = Priority::parse(p);
            if parsed.is_none() {
                warn!("Line {}: unknown priority '{}'", line, p);
            }
            parsed
        });

        targets.push(Target {
            url,
            name,
            enabled,
            category: field("category").map(str::to_string),
            priority,
            description: field("description").map(str::to_string),
        });
    }

    if targets.is_empty() {
        return Err(CollectorError::Targets("No valid targets found".to_string()));
    }
    Ok(targets)
}

fn cell<'r>(
    record: &'r csv::StringRecord,
    columns: &HashMap<String, usize>,
    name: &str,
) -> Option<&'r str> {
    columns
        .get(name)
        .and_then(|idx| record.get(*idx))
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "y" | "on" => Some(true),
        "false" | "0" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}
