use serde_json::Value;
use std::collections::BTreeMap;
use tracing::warn;

use super::resource::{classify, host_of, path_of, status_text};
use super::summary::summarize;
use super::{metric, milestones, positive_size, text, NormalizationError};
use crate::model::{
    Measurement, MetricsRecord, RequestEntry, RequestTimings, Strategy, Target, WaterfallDocument,
    WaterfallMeta,
};

const TOOL: &str = "pagespeed_insights";

// audits.metrics.details.items[0] key → record field
const LAB_ONLOAD: &str = "observedLoad";
const LAB_TTFB: &str = "timeToFirstByte";
const LAB_LCP: &str = "observedLargestContentfulPaint";
const LAB_CLS: &str = "observedCumulativeLayoutShift";
const LAB_DCL: &str = "observedDomContentLoaded";
const LAB_FIRST_VISUAL_CHANGE: &str = "observedFirstVisualChange";

pub(super) fn normalize(
    body: &Value,
    target: &Target,
    strategy: Strategy,
    extracted_at: &str,
) -> Result<Measurement, NormalizationError> {
    let lighthouse = body
        .get("lighthouseResult")
        .filter(|v| v.is_object())
        .ok_or(NormalizationError::Missing("lighthouseResult"))?;
    let audits = lighthouse.get("audits");
    if let Some(a) = audits {
        if !a.is_object() {
            return Err(NormalizationError::Shape {
                path: "lighthouseResult.audits".to_string(),
                message: "expected an object".to_string(),
            });
        }
    }

    let lab = audits.and_then(|a| a.pointer("/metrics/details/items/0"));
    let lab_value = |key: &str| metric(lab.and_then(|l| l.get(key)));
    let audit_value = |id: &str| metric(audits.and_then(|a| a.get(id)).and_then(|a| a.get("numericValue")));

    let mut m = MetricsRecord::identity(target, strategy, TOOL);
    m.onload_ms = lab_value(LAB_ONLOAD);
    m.ttfb_ms = lab_value(LAB_TTFB);
    m.observed_lcp_ms = lab_value(LAB_LCP);
    m.observed_cls = lab_value(LAB_CLS);
    m.dom_content_loaded_ms = lab_value(LAB_DCL);

    m.lcp_ms = audit_value("largest-contentful-paint");
    m.cls = audit_value("cumulative-layout-shift");
    m.speed_index_ms = audit_value("speed-index");
    m.fcp_ms = audit_value("first-contentful-paint");
    m.tbt_ms = audit_value("total-blocking-time");
    m.interactive_ms = audit_value("interactive");
    m.server_response_time_ms = audit_value("server-response-time");

    m.performance_score = metric(lighthouse.pointer("/categories/performance/score"))
        .map(|s| (s * 100.0).round());
    m.fetched_at = text(lighthouse.get("fetchTime"));
    m.lighthouse_version = text(lighthouse.get("lighthouseVersion"));
    m.form_factor = text(lighthouse.pointer("/configSettings/formFactor"));

    apply_field_data(&mut m, body.get("loadingExperience"));

    let waterfall = network_items(audits, target)
        .map(|items| build_waterfall(items, &m, lab, extracted_at));

    Ok(Measurement {
        metrics: m,
        waterfall,
    })
}

/// Real-user percentiles from `loadingExperience`.
fn apply_field_data(m: &mut MetricsRecord, experience: Option<&Value>) {
    let Some(experience) = experience else {
        return;
    };
    let percentile = |key: &str| {
        metric(
            experience
                .get("metrics")
                .and_then(|ms| ms.get(key))
                .and_then(|v| v.get("percentile")),
        )
    };
    m.field_lcp_ms = percentile("LARGEST_CONTENTFUL_PAINT_MS");
    // Reported ×100.
    m.field_cls = percentile("CUMULATIVE_LAYOUT_SHIFT_SCORE").map(|v| v / 100.0);
    m.field_fcp_ms = percentile("FIRST_CONTENTFUL_PAINT_MS");
    m.field_inp_ms = percentile("INTERACTION_TO_NEXT_PAINT");
    m.field_overall_category = text(experience.get("overall_category"));
}

/// A present but non-array list only costs the waterfall, not the metrics.
fn network_items<'a>(audits: Option<&'a Value>, target: &Target) -> Option<&'a Vec<Value>> {
    let items = audits.and_then(|a| a.pointer("/network-requests/details/items"))?;
    if items.is_null() {
        return None;
    }
    let list = items.as_array();
    if list.is_none() {
        warn!(
            "{}: audits.network-requests.details.items is not an array, skipping waterfall",
            target.url
        );
    }
    list
}

fn build_waterfall(
    items: &[Value],
    m: &MetricsRecord,
    lab: Option<&Value>,
    extracted_at: &str,
) -> WaterfallDocument {
    let entries: Vec<RequestEntry> = items
        .iter()
        .enumerate()
        .map(|(i, item)| convert_item(i, item))
        .collect();
    let summary = summarize(&entries);

    let first_visual_change = metric(lab.and_then(|l| l.get(LAB_FIRST_VISUAL_CHANGE)));

    let mut page_metrics = BTreeMap::new();
    page_metrics.insert("ttfb_ms".to_string(), m.ttfb_ms);
    page_metrics.insert("fcp_ms".to_string(), m.fcp_ms);
    page_metrics.insert("lcp_ms".to_string(), m.lcp_ms);
    page_metrics.insert("cls".to_string(), m.cls);
    page_metrics.insert("speed_index_ms".to_string(), m.speed_index_ms);
    page_metrics.insert("tbt_ms".to_string(), m.tbt_ms);
    page_metrics.insert("interactive_ms".to_string(), m.interactive_ms);
    page_metrics.insert("dom_content_loaded_ms".to_string(), m.dom_content_loaded_ms);
    page_metrics.insert("load_time_ms".to_string(), m.onload_ms);
    page_metrics.insert("start_render_ms".to_string(), first_visual_change);
    page_metrics.insert("total_requests".to_string(), Some(entries.len() as f64));
    page_metrics.insert(
        "total_size".to_string(),
        Some(summary.total_transfer_size as f64),
    );

    let milestones = milestones(&[
        ("ttfb", m.ttfb_ms),
        ("start_render", first_visual_change),
        ("fcp", m.fcp_ms),
        ("lcp", m.lcp_ms),
        ("dom_content_loaded", m.dom_content_loaded_ms),
        ("load", m.onload_ms),
    ]);

    WaterfallDocument {
        meta: WaterfallMeta {
            tool: TOOL.to_string(),
            extracted_at: extracted_at.to_string(),
            url: m.url.clone(),
            site_name: m.site_name.clone(),
            strategy: m.strategy,
            browser: None,
            lighthouse_version: m.lighthouse_version.clone(),
            started_at: m.fetched_at.clone(),
        },
        page_metrics,
        milestones,
        entries,
        summary,
    }
}

fn convert_item(index: usize, item: &Value) -> RequestEntry {
    let url = text(item.get("url")).unwrap_or_default();
    let mime_type = text(item.get("mimeType")).unwrap_or_default();

    let start = metric(item.get("networkRequestTime")).or_else(|| metric(item.get("startTime")));
    let end = metric(item.get("networkEndTime")).or_else(|| metric(item.get("endTime")));
    let start_time_ms = start.unwrap_or(0.0);
    let duration_ms = match (start, end) {
        (Some(s), Some(e)) if e >= s => e - s,
        _ => 0.0,
    };

    let status = item
        .get("statusCode")
        .and_then(Value::as_u64)
        .filter(|s| *s > 0 && *s < 1000)
        .map(|s| s as u16);

    let transfer_size = positive_size(item.get("transferSize"))
        .or_else(|| positive_size(item.get("resourceSize")))
        .unwrap_or(0);

    RequestEntry {
        index,
        host: host_of(&url),
        path: path_of(&url),
        method: text(item.get("requestMethod")).unwrap_or_else(|| "GET".to_string()),
        status,
        status_text: status.map(status_text).unwrap_or_default().to_string(),
        content_type: mime_type.clone(),
        resource_type: classify(
            item.get("resourceType").and_then(Value::as_str),
            &mime_type,
            &url,
        ),
        mime_type,
        protocol: text(item.get("protocol")).unwrap_or_default(),
        transfer_size,
        content_size: positive_size(item.get("resourceSize")).unwrap_or(0),
        header_size: 0,
        start_time_ms,
        end_time_ms: start_time_ms + duration_ms,
        duration_ms,
        timings: RequestTimings::default(),
        connection_reused: false,
        server_ip: None,
        is_secure: url.starts_with("https://"),
        from_cache: false,
        url,
    }
}
