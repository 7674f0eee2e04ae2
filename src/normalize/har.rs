use chrono::DateTime;
use serde_json::Value;
use std::collections::BTreeMap;

use super::resource::{classify, host_of, path_of, status_text};
use super::summary::summarize;
use super::{metric, milestones, positive_size, text, NormalizationError};
use crate::backend::HarnessOutput;
use crate::model::{
    Measurement, MetricsRecord, RequestEntry, RequestTimings, Strategy, Target, WaterfallDocument,
    WaterfallMeta, PHASE_ABSENT,
};

const TOOL: &str = "sitespeed";

/// Views into the browsertime result for the first measured URL.
struct Browsertime<'a> {
    timings: Option<&'a Value>,
    pageinfo: Option<&'a Value>,
    visual: Option<&'a Value>,
}

impl<'a> Browsertime<'a> {
    fn new(raw: Option<&'a Value>) -> Self {
        // browsertime.json is an array with one element per URL.
        let first = raw.and_then(|v| if v.is_array() { v.get(0) } else { Some(v) });
        Browsertime {
            timings: first.and_then(|b| b.pointer("/browserScripts/0/timings")),
            pageinfo: first.and_then(|b| b.pointer("/browserScripts/0/pageinfo")),
            visual: first.and_then(|b| b.pointer("/visualMetrics/0")),
        }
    }

    fn timing(&self, pointer: &str) -> Option<f64> {
        metric(self.timings.and_then(|t| t.pointer(pointer)))
    }

    fn visual(&self, key: &str) -> Option<f64> {
        metric(self.visual.and_then(|v| v.get(key)))
    }
}

pub(super) fn normalize(
    output: &HarnessOutput,
    target: &Target,
    strategy: Strategy,
    extracted_at: &str,
) -> Result<Measurement, NormalizationError> {
    if output.har.is_none() && output.browsertime.is_none() {
        return Err(NormalizationError::EmptyHarness);
    }

    let log = match &output.har {
        Some(har) => Some(har.get("log").filter(|l| l.is_object()).ok_or_else(|| {
            NormalizationError::Shape {
                path: "log".to_string(),
                message: "HAR has no log object".to_string(),
            }
        })?),
        None => None,
    };
    let raw_entries: &[Value] = log
        .and_then(|l| l.get("entries"))
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[]);
    let page = log.and_then(|l| l.pointer("/pages/0"));
    let page_timing = |key: &str| metric(page.and_then(|p| p.pointer(&format!("/pageTimings/{}", key))));
    let custom_timing = |key: &str| metric(page.and_then(|p| p.get("_timings")).and_then(|t| t.get(key)));

    let bt = Browsertime::new(output.browsertime.as_ref());
    let entries = convert_entries(raw_entries);
    let first_wait = entries
        .first()
        .map(|e| e.timings.wait)
        .filter(|w| *w >= 0.0);

    let mut m = MetricsRecord::identity(target, strategy, TOOL);
    m.ttfb_ms = bt
        .timing("/ttfb")
        .or_else(|| bt.timing("/navigationTiming/responseStart"))
        .or(first_wait);
    m.onload_ms = bt
        .timing("/navigationTiming/loadEventStart")
        .or_else(|| page_timing("onLoad"));
    m.dom_content_loaded_ms = bt
        .timing("/navigationTiming/domContentLoadedEventStart")
        .or_else(|| page_timing("onContentLoad"));
    m.fcp_ms = bt
        .timing("/paintTiming/first-contentful-paint")
        .or_else(|| custom_timing("firstContentfulPaint"));
    m.lcp_ms = bt
        .timing("/largestContentfulPaint/renderTime")
        .or_else(|| custom_timing("largestContentfulPaint"));
    m.cls = metric(bt.pageinfo.and_then(|p| p.get("cumulativeLayoutShift")));
    m.speed_index_ms = bt.visual("SpeedIndex");
    m.fetched_at = text(page.and_then(|p| p.get("startedDateTime")))
        .or_else(|| text(raw_entries.first().and_then(|e| e.get("startedDateTime"))));

    let waterfall = log.map(|_| {
        let start_render = bt.visual("FirstVisualChange");
        let dom_complete = bt.timing("/navigationTiming/domComplete");
        let fully_loaded = bt.timing("/fullyLoaded");
        let summary = summarize(&entries);
        let first = entries.first();
        let first_phase = |f: fn(&RequestTimings) -> f64| {
            first.map(|e| f(&e.timings)).filter(|v| *v >= 0.0)
        };

        let mut page_metrics = BTreeMap::new();
        page_metrics.insert("ttfb_ms".to_string(), m.ttfb_ms);
        page_metrics.insert("dom_content_loaded_ms".to_string(), m.dom_content_loaded_ms);
        page_metrics.insert("load_time_ms".to_string(), m.onload_ms);
        page_metrics.insert("fcp_ms".to_string(), m.fcp_ms);
        page_metrics.insert("lcp_ms".to_string(), m.lcp_ms);
        page_metrics.insert("cls".to_string(), m.cls);
        page_metrics.insert("speed_index_ms".to_string(), m.speed_index_ms);
        page_metrics.insert("start_render_ms".to_string(), start_render);
        page_metrics.insert("last_visual_change_ms".to_string(), bt.visual("LastVisualChange"));
        page_metrics.insert("visual_complete_85_ms".to_string(), bt.visual("VisualComplete85"));
        page_metrics.insert("visual_complete_99_ms".to_string(), bt.visual("VisualComplete99"));
        page_metrics.insert("dns_ms".to_string(), first_phase(|t| t.dns));
        page_metrics.insert("connect_ms".to_string(), first_phase(|t| t.connect));
        page_metrics.insert("ssl_ms".to_string(), first_phase(|t| t.ssl));
        page_metrics.insert("total_requests".to_string(), Some(entries.len() as f64));
        page_metrics.insert(
            "total_size".to_string(),
            Some(summary.total_transfer_size as f64),
        );

        let milestones = milestones(&[
            ("ttfb", m.ttfb_ms),
            ("start_render", start_render),
            ("fcp", m.fcp_ms),
            ("lcp", m.lcp_ms),
            ("dom_content_loaded", m.dom_content_loaded_ms),
            ("dom_complete", dom_complete),
            ("load", m.onload_ms),
            ("fully_loaded", fully_loaded),
        ]);

        WaterfallDocument {
            meta: WaterfallMeta {
                tool: TOOL.to_string(),
                extracted_at: extracted_at.to_string(),
                url: target.url.clone(),
                site_name: target.name.clone(),
                strategy,
                browser: output.browser.clone(),
                lighthouse_version: None,
                started_at: m.fetched_at.clone(),
            },
            page_metrics,
            milestones,
            entries,
            summary,
        }
    });

    Ok(Measurement {
        metrics: m,
        waterfall,
    })
}

fn convert_entries(raw: &[Value]) -> Vec<RequestEntry> {
    let base_ms = raw
        .first()
        .and_then(|e| epoch_ms(e.get("startedDateTime")));
    raw.iter()
        .enumerate()
        .map(|(i, entry)| convert_entry(i, entry, base_ms))
        .collect()
}

fn epoch_ms(value: Option<&Value>) -> Option<f64> {
    let s = value.and_then(Value::as_str)?;
    let dt = DateTime::parse_from_rfc3339(s).ok()?;
    Some(dt.timestamp_micros() as f64 / 1000.0)
}

fn phase(timings: Option<&Value>, key: &str) -> f64 {
    metric(timings.and_then(|t| t.get(key))).unwrap_or(PHASE_ABSENT)
}

fn convert_entry(index: usize, entry: &Value, base_ms: Option<f64>) -> RequestEntry {
    let request = entry.get("request");
    let response = entry.get("response");
    let content = response.and_then(|r| r.get("content"));
    let t = entry.get("timings");

    let url = text(request.and_then(|r| r.get("url"))).unwrap_or_default();

    let ssl = phase(t, "ssl");
    let mut connect = phase(t, "connect");
    // HAR connect time includes the TLS handshake.
    if connect >= 0.0 && ssl >= 0.0 {
        connect = (connect - ssl).max(0.0);
    }
    let timings = RequestTimings {
        blocked: phase(t, "blocked"),
        dns: phase(t, "dns"),
        connect,
        ssl,
        send: phase(t, "send"),
        wait: phase(t, "wait"),
        receive: phase(t, "receive"),
    };

    let start_time_ms = match (epoch_ms(entry.get("startedDateTime")), base_ms) {
        (Some(start), Some(base)) => round2((start - base).max(0.0)),
        _ => 0.0,
    };
    let duration_ms = metric(entry.get("time")).unwrap_or_else(|| {
        timings
            .phases()
            .iter()
            .map(|(_, v)| v.max(0.0))
            .sum()
    });

    let content_type = response
        .and_then(|r| r.get("headers"))
        .and_then(Value::as_array)
        .and_then(|headers| {
            headers.iter().find(|h| {
                h.get("name")
                    .and_then(Value::as_str)
                    .is_some_and(|n| n.eq_ignore_ascii_case("content-type"))
            })
        })
        .and_then(|h| text(h.get("value")))
        .or_else(|| text(content.and_then(|c| c.get("mimeType"))))
        .unwrap_or_default();
    let mime_type = text(content.and_then(|c| c.get("mimeType"))).unwrap_or_else(|| content_type.clone());

    let status = response
        .and_then(|r| r.get("status"))
        .and_then(Value::as_u64)
        .filter(|s| *s > 0 && *s < 1000)
        .map(|s| s as u16);
    let status_text = text(response.and_then(|r| r.get("statusText")))
        .unwrap_or_else(|| status.map(status_text).unwrap_or_default().to_string());

    let from_cache = match response.and_then(|r| r.get("_fromCache")) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => !s.is_empty(),
        _ => false,
    };

    RequestEntry {
        index,
        host: host_of(&url),
        path: path_of(&url),
        method: text(request.and_then(|r| r.get("method"))).unwrap_or_else(|| "GET".to_string()),
        status,
        status_text,
        resource_type: classify(
            entry.get("_resourceType").and_then(Value::as_str),
            &content_type,
            &url,
        ),
        content_type,
        mime_type,
        protocol: text(response.and_then(|r| r.get("httpVersion")))
            .or_else(|| text(request.and_then(|r| r.get("httpVersion"))))
            .unwrap_or_default(),
        transfer_size: har_transfer_size(response, from_cache),
        content_size: positive_size(content.and_then(|c| c.get("size"))).unwrap_or(0),
        header_size: positive_size(response.and_then(|r| r.get("headersSize"))).unwrap_or(0),
        start_time_ms,
        end_time_ms: round2(start_time_ms + duration_ms),
        duration_ms: round2(duration_ms),
        connection_reused: timings.dns < 0.0 && timings.connect < 0.0,
        timings,
        server_ip: text(entry.get("serverIPAddress")),
        is_secure: url.starts_with("https://"),
        from_cache,
        url,
    }
}

/// `_transferSize` → 0 when served from cache → `bodySize` → `content.size` → 0.
pub fn har_transfer_size(response: Option<&Value>, from_cache: bool) -> u64 {
    if let Some(size) = positive_size(response.and_then(|r| r.get("_transferSize"))) {
        return size;
    }
    if from_cache {
        return 0;
    }
    positive_size(response.and_then(|r| r.get("bodySize")))
        .or_else(|| positive_size(response.and_then(|r| r.pointer("/content/size"))))
        .unwrap_or(0)
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
