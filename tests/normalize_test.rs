use chrono::{TimeZone, Utc};
use serde_json::json;

use webperf_collector::backend::{HarnessOutput, RawResponse};
use webperf_collector::model::{Strategy, Target, PHASE_ABSENT};
use webperf_collector::normalize::{normalize, normalize_at, NormalizationError};

fn target() -> Target {
    Target::new("https://shop.example/", "Shop")
}

// --- scoring api ---

fn scoring_fixture() -> serde_json::Value {
    json!({
        "id": "https://shop.example/",
        "loadingExperience": {
            "overall_category": "AVERAGE",
            "metrics": {
                "LARGEST_CONTENTFUL_PAINT_MS": {"percentile": 2600},
                "CUMULATIVE_LAYOUT_SHIFT_SCORE": {"percentile": 12},
                "FIRST_CONTENTFUL_PAINT_MS": {"percentile": 1500},
                "INTERACTION_TO_NEXT_PAINT": {"percentile": 180}
            }
        },
        "lighthouseResult": {
            "fetchTime": "2024-05-01T09:30:00.000Z",
            "lighthouseVersion": "12.0.0",
            "configSettings": {"formFactor": "mobile"},
            "categories": {"performance": {"score": 0.734}},
            "audits": {
                "metrics": {"details": {"items": [{
                    "observedLoad": 3120,
                    "timeToFirstByte": 410,
                    "observedLargestContentfulPaint": 2480,
                    "observedCumulativeLayoutShift": 0.02,
                    "observedDomContentLoaded": 1900,
                    "observedFirstVisualChange": 950
                }]}},
                "largest-contentful-paint": {"numericValue": 2950.5},
                "cumulative-layout-shift": {"numericValue": 0.08},
                "speed-index": {"numericValue": 2210},
                "first-contentful-paint": {"numericValue": 1400},
                "total-blocking-time": {"numericValue": 120},
                "interactive": {"numericValue": 4100},
                "server-response-time": {"numericValue": 390},
                "network-requests": {"details": {"items": [
                    {
                        "url": "https://shop.example/",
                        "networkRequestTime": 0,
                        "networkEndTime": 420,
                        "transferSize": 15000,
                        "resourceSize": 60000,
                        "mimeType": "text/html",
                        "resourceType": "Document",
                        "statusCode": 200,
                        "protocol": "h2"
                    },
                    {
                        "url": "https://cdn.shop.example/app.js",
                        "startTime": 430,
                        "endTime": 700,
                        "transferSize": 0,
                        "resourceSize": 500,
                        "mimeType": "application/javascript",
                        "statusCode": 200
                    },
                    {
                        "url": "https://cdn.shop.example/hero.webp",
                        "networkRequestTime": 450,
                        "networkEndTime": 900,
                        "mimeType": "image/webp",
                        "statusCode": 200
                    }
                ]}}
            }
        }
    })
}

#[test]
fn test_scoring_lab_and_audit_metrics() {
    let m = normalize(&RawResponse::Scoring(scoring_fixture()), &target(), Strategy::Mobile)
        .unwrap();
    let r = &m.metrics;

    assert_eq!(r.site_name, "Shop");
    assert_eq!(r.url, "https://shop.example/");
    assert_eq!(r.strategy, Strategy::Mobile);
    assert_eq!(r.tool, "pagespeed_insights");
    assert_eq!(r.onload_ms, Some(3120.0));
    assert_eq!(r.ttfb_ms, Some(410.0));
    assert_eq!(r.lcp_ms, Some(2950.5));
    assert_eq!(r.cls, Some(0.08));
    assert_eq!(r.speed_index_ms, Some(2210.0));
    assert_eq!(r.fcp_ms, Some(1400.0));
    assert_eq!(r.tbt_ms, Some(120.0));
    assert_eq!(r.interactive_ms, Some(4100.0));
    assert_eq!(r.server_response_time_ms, Some(390.0));
    assert_eq!(r.observed_lcp_ms, Some(2480.0));
    assert_eq!(r.dom_content_loaded_ms, Some(1900.0));
    assert_eq!(r.performance_score, Some(73.0));
    assert_eq!(r.fetched_at.as_deref(), Some("2024-05-01T09:30:00.000Z"));
    assert_eq!(r.lighthouse_version.as_deref(), Some("12.0.0"));
    assert_eq!(r.form_factor.as_deref(), Some("mobile"));
}

#[test]
fn test_scoring_field_data() {
    let m = normalize(&RawResponse::Scoring(scoring_fixture()), &target(), Strategy::Mobile)
        .unwrap();
    let r = &m.metrics;

    assert_eq!(r.field_lcp_ms, Some(2600.0));
    assert_eq!(r.field_cls, Some(0.12));
    assert_eq!(r.field_fcp_ms, Some(1500.0));
    assert_eq!(r.field_inp_ms, Some(180.0));
    assert_eq!(r.field_overall_category.as_deref(), Some("AVERAGE"));
}

#[test]
fn test_scoring_missing_values_are_null_not_zero() {
    let body = json!({
        "lighthouseResult": {
            "audits": {
                "metrics": {"details": {"items": [{"observedLoad": 1800}]}},
                "speed-index": {"numericValue": null}
            }
        }
    });
    let m = normalize(&RawResponse::Scoring(body), &target(), Strategy::Desktop).unwrap();

    assert_eq!(m.metrics.onload_ms, Some(1800.0));
    assert_eq!(m.metrics.ttfb_ms, None);
    assert_eq!(m.metrics.lcp_ms, None);
    assert_eq!(m.metrics.speed_index_ms, None);
    assert!(m.waterfall.is_none());

    let json = serde_json::to_value(&m.metrics).unwrap();
    assert!(json["ttfb_ms"].is_null());
    assert!(json["lcp_ms"].is_null());
    assert!(json["cls"].is_null());
    assert_eq!(json["onload_ms"], json!(1800.0));
}

#[test]
fn test_scoring_without_lighthouse_result_is_an_error() {
    let err = normalize(
        &RawResponse::Scoring(json!({"error": {"message": "boom"}})),
        &target(),
        Strategy::Mobile,
    )
    .unwrap_err();
    assert_eq!(err, NormalizationError::Missing("lighthouseResult"));
}

#[test]
fn test_scoring_malformed_network_requests_keeps_metrics() {
    let body = json!({
        "lighthouseResult": {
            "audits": {
                "speed-index": {"numericValue": 2100},
                "network-requests": {"details": {"items": "nope"}}
            }
        }
    });
    let m = normalize(&RawResponse::Scoring(body), &target(), Strategy::Mobile).unwrap();
    assert_eq!(m.metrics.speed_index_ms, Some(2100.0));
    assert!(m.waterfall.is_none());
}

#[test]
fn test_scoring_waterfall_entries_and_sizes() {
    let m = normalize(&RawResponse::Scoring(scoring_fixture()), &target(), Strategy::Mobile)
        .unwrap();
    let wf = m.waterfall.expect("network-requests should produce a waterfall");

    assert_eq!(wf.entries.len(), 3);
    let doc = &wf.entries[0];
    assert_eq!(doc.resource_type, "document");
    assert_eq!(doc.transfer_size, 15000);
    assert_eq!(doc.duration_ms, 420.0);
    assert_eq!(doc.status, Some(200));
    assert_eq!(doc.method, "GET");
    assert_eq!(doc.timings.dns, PHASE_ABSENT);

    let script = &wf.entries[1];
    assert_eq!(script.transfer_size, 500, "zero transferSize falls back to resourceSize");
    assert_eq!(script.start_time_ms, 430.0);
    assert_eq!(script.end_time_ms, 700.0);
    assert_eq!(script.host, "cdn.shop.example");
    assert_eq!(script.resource_type, "script");

    let image = &wf.entries[2];
    assert_eq!(image.transfer_size, 0);
    assert_eq!(image.resource_type, "image");

    assert_eq!(wf.summary.total_entries, 3);
    assert_eq!(wf.summary.total_transfer_size, 15500);
    assert_eq!(wf.meta.tool, "pagespeed_insights");
    assert_eq!(wf.meta.lighthouse_version.as_deref(), Some("12.0.0"));
    assert_eq!(wf.page_metrics["total_requests"], Some(3.0));

    let keys: Vec<&str> = wf.milestones.iter().map(|ms| ms.key.as_str()).collect();
    assert_eq!(
        keys,
        vec!["ttfb", "start_render", "fcp", "dom_content_loaded", "lcp", "load"]
    );
}

// --- harness ---

fn har_fixture() -> serde_json::Value {
    json!({
        "log": {
            "pages": [{
                "startedDateTime": "2024-05-01T10:00:00.000Z",
                "pageTimings": {"onContentLoad": 1200, "onLoad": 2400},
                "_timings": {"firstContentfulPaint": 900, "largestContentfulPaint": 1700}
            }],
            "entries": [
                {
                    "startedDateTime": "2024-05-01T10:00:00.000Z",
                    "time": 350,
                    "request": {"method": "GET", "url": "https://shop.example/", "httpVersion": "h2"},
                    "response": {
                        "status": 200,
                        "httpVersion": "h2",
                        "headers": [{"name": "Content-Type", "value": "text/html; charset=utf-8"}],
                        "content": {"size": 40000, "mimeType": "text/html"},
                        "bodySize": 12000,
                        "headersSize": 300,
                        "_transferSize": 12300
                    },
                    "timings": {"blocked": 2, "dns": 20, "connect": 60, "ssl": 40, "send": 1, "wait": 220, "receive": 47},
                    "serverIPAddress": "203.0.113.10"
                },
                {
                    "startedDateTime": "2024-05-01T10:00:00.400Z",
                    "time": 80,
                    "request": {"method": "GET", "url": "https://shop.example/site.css"},
                    "response": {
                        "status": 200,
                        "headers": [],
                        "content": {"size": 9000, "mimeType": "text/css"},
                        "bodySize": 3000
                    },
                    "timings": {"blocked": 1, "dns": -1, "connect": -1, "ssl": -1, "send": 0, "wait": 60, "receive": 19}
                },
                {
                    "startedDateTime": "2024-05-01T10:00:00.500Z",
                    "request": {"method": "GET", "url": "https://shop.example/logo.svg"},
                    "response": {
                        "status": 304,
                        "content": {"size": 2500, "mimeType": "image/svg+xml"},
                        "bodySize": -1
                    },
                    "timings": {"blocked": 0, "dns": -1, "connect": -1, "ssl": -1, "send": 1, "wait": 30, "receive": 4}
                },
                {
                    "startedDateTime": "2024-05-01T10:00:00.600Z",
                    "time": 5,
                    "request": {"method": "GET", "url": "https://shop.example/font.woff2"},
                    "response": {
                        "status": 200,
                        "content": {"size": 20000, "mimeType": "font/woff2"},
                        "bodySize": 18000,
                        "_fromCache": "memory"
                    },
                    "timings": {"blocked": 0, "dns": -1, "connect": -1, "ssl": -1, "send": 0, "wait": 5, "receive": 0}
                }
            ]
        }
    })
}

fn browsertime_fixture() -> serde_json::Value {
    json!([{
        "info": {"url": "https://shop.example/"},
        "browserScripts": [{
            "timings": {
                "ttfb": 215,
                "navigationTiming": {"loadEventStart": 2350, "domContentLoadedEventStart": 1180, "domComplete": 2300},
                "paintTiming": {"first-contentful-paint": 880},
                "largestContentfulPaint": {"renderTime": 1650},
                "fullyLoaded": 3100
            },
            "pageinfo": {"cumulativeLayoutShift": 0.031}
        }],
        "visualMetrics": [{"SpeedIndex": 1420, "FirstVisualChange": 860, "LastVisualChange": 2900}]
    }])
}

fn harness(har: bool, browsertime: bool) -> RawResponse {
    RawResponse::Harness(HarnessOutput {
        har: har.then(har_fixture),
        browsertime: browsertime.then(browsertime_fixture),
        artifact_dir: None,
        browser: Some("chrome".to_string()),
    })
}

#[test]
fn test_harness_prefers_browsertime_values() {
    let m = normalize(&harness(true, true), &target(), Strategy::Desktop).unwrap();
    let r = &m.metrics;

    assert_eq!(r.tool, "sitespeed");
    assert_eq!(r.ttfb_ms, Some(215.0));
    assert_eq!(r.onload_ms, Some(2350.0));
    assert_eq!(r.dom_content_loaded_ms, Some(1180.0));
    assert_eq!(r.fcp_ms, Some(880.0));
    assert_eq!(r.lcp_ms, Some(1650.0));
    assert_eq!(r.cls, Some(0.031));
    assert_eq!(r.speed_index_ms, Some(1420.0));
    assert_eq!(r.fetched_at.as_deref(), Some("2024-05-01T10:00:00.000Z"));
}

#[test]
fn test_harness_falls_back_to_har_page_timings() {
    let m = normalize(&harness(true, false), &target(), Strategy::Desktop).unwrap();
    let r = &m.metrics;

    // First entry's wait phase.
    assert_eq!(r.ttfb_ms, Some(220.0));
    assert_eq!(r.onload_ms, Some(2400.0));
    assert_eq!(r.dom_content_loaded_ms, Some(1200.0));
    assert_eq!(r.fcp_ms, Some(900.0));
    assert_eq!(r.lcp_ms, Some(1700.0));
    assert_eq!(r.cls, None);
    assert_eq!(r.speed_index_ms, None);
}

#[test]
fn test_harness_browsertime_only_has_no_waterfall() {
    let m = normalize(&harness(false, true), &target(), Strategy::Mobile).unwrap();
    assert_eq!(m.metrics.onload_ms, Some(2350.0));
    assert!(m.waterfall.is_none());
}

#[test]
fn test_harness_without_artifacts_is_an_error() {
    let err = normalize(&harness(false, false), &target(), Strategy::Mobile).unwrap_err();
    assert_eq!(err, NormalizationError::EmptyHarness);
}

#[test]
fn test_har_waterfall_entries() {
    let m = normalize(&harness(true, true), &target(), Strategy::Desktop).unwrap();
    let wf = m.waterfall.unwrap();
    assert_eq!(wf.entries.len(), 4);

    let doc = &wf.entries[0];
    assert_eq!(doc.transfer_size, 12300);
    assert_eq!(doc.timings.ssl, 40.0);
    assert_eq!(doc.timings.connect, 20.0);
    assert_eq!(doc.content_type, "text/html; charset=utf-8");
    assert_eq!(doc.resource_type, "document");
    assert_eq!(doc.server_ip.as_deref(), Some("203.0.113.10"));
    assert!(doc.is_secure);
    assert!(!doc.connection_reused);

    let css = &wf.entries[1];
    assert_eq!(css.start_time_ms, 400.0);
    assert_eq!(css.end_time_ms, 480.0);
    assert_eq!(css.transfer_size, 3000);
    assert_eq!(css.resource_type, "stylesheet");
    assert!(css.connection_reused);

    let logo = &wf.entries[2];
    assert_eq!(logo.transfer_size, 2500, "bodySize -1 falls back to content.size");
    assert_eq!(logo.duration_ms, 35.0, "missing time sums the phases");
    assert_eq!(logo.status, Some(304));

    let font = &wf.entries[3];
    assert!(font.from_cache);
    assert_eq!(font.transfer_size, 0);
    assert_eq!(font.resource_type, "font");
}

#[test]
fn test_har_summary_matches_entries() {
    let m = normalize(&harness(true, true), &target(), Strategy::Desktop).unwrap();
    let wf = m.waterfall.unwrap();
    let s = &wf.summary;

    let sum: u64 = wf.entries.iter().map(|e| e.transfer_size).sum();
    assert_eq!(s.total_transfer_size, sum);
    assert_eq!(s.total_transfer_size, 12300 + 3000 + 2500);
    assert_eq!(s.total_entries, 4);
    assert_eq!(s.connection_stats.reused, 3);
    assert_eq!(s.connection_stats.new, 1);
    assert_eq!(s.cache_stats.from_cache, 1);
    assert_eq!(s.cache_stats.from_network, 3);
    assert_eq!(s.by_resource_type.counts["image"], 1);
    assert_eq!(s.by_resource_type.sizes["image"], 2500);
    assert_eq!(s.by_resource_type.counts.values().sum::<usize>(), 4);
    assert_eq!(s.by_resource_type.sizes.values().sum::<u64>(), sum);

    // Only the first entry resolved DNS.
    assert_eq!(s.timing_stats["dns"].count, 1);
    assert_eq!(s.timing_stats["dns"].avg_ms, 20.0);
    assert_eq!(s.timing_stats["wait"].count, 4);

    assert_eq!(wf.page_metrics["total_size"], Some(17800.0));
    assert_eq!(wf.page_metrics["dns_ms"], Some(20.0));
    assert_eq!(wf.page_metrics["start_render_ms"], Some(860.0));
    assert_eq!(wf.meta.browser.as_deref(), Some("chrome"));
}

#[test]
fn test_resource_type_sizes_follow_fallback_fields() {
    let har = json!({
        "log": {
            "entries": [
                {
                    "startedDateTime": "2024-05-01T10:00:00.000Z",
                    "time": 40,
                    "request": {"method": "GET", "url": "https://shop.example/app.js"},
                    "response": {"status": 200, "content": {"size": 0}, "_transferSize": 1000},
                    "timings": {"wait": 30, "receive": 10}
                },
                {
                    "startedDateTime": "2024-05-01T10:00:00.050Z",
                    "time": 20,
                    "request": {"method": "GET", "url": "https://shop.example/banner.png"},
                    "response": {"status": 200, "content": {"size": 0}, "bodySize": 500},
                    "timings": {"wait": 15, "receive": 5}
                }
            ]
        }
    });
    let raw = RawResponse::Harness(HarnessOutput {
        har: Some(har),
        ..Default::default()
    });
    let wf = normalize(&raw, &target(), Strategy::Mobile)
        .unwrap()
        .waterfall
        .unwrap();

    let summary = serde_json::to_value(&wf.summary).unwrap();
    let by_type = &summary["by_resource_type"];
    assert_eq!(by_type["counts"], json!({"image": 1, "script": 1}));
    assert_eq!(by_type["sizes"], json!({"image": 500, "script": 1000}));
    assert_eq!(summary["total_transfer_size"], json!(1500));
}

#[test]
fn test_har_milestones_are_ordered() {
    let m = normalize(&harness(true, true), &target(), Strategy::Desktop).unwrap();
    let wf = m.waterfall.unwrap();
    let times: Vec<f64> = wf.milestones.iter().map(|ms| ms.time_ms).collect();
    let mut sorted = times.clone();
    sorted.sort_by(f64::total_cmp);
    assert_eq!(times, sorted);
    assert_eq!(wf.milestones.first().unwrap().key, "ttfb");
    assert_eq!(wf.milestones.last().unwrap().key, "fully_loaded");
}

// --- determinism ---

#[test]
fn test_normalization_is_deterministic() {
    let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    for raw in [RawResponse::Scoring(scoring_fixture()), harness(true, true)] {
        let a = normalize_at(&raw, &target(), Strategy::Mobile, at).unwrap();
        let b = normalize_at(&raw, &target(), Strategy::Mobile, at).unwrap();
        assert_eq!(a, b);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
        assert_eq!(
            a.waterfall.unwrap().meta.extracted_at,
            "2024-05-01T12:00:00.000Z"
        );
    }
}

#[test]
fn test_dry_run_record_has_identity_only() {
    let mut t = target();
    t.category = Some("retail".to_string());
    let m = normalize(&RawResponse::DryRun, &t, Strategy::Desktop).unwrap();
    assert_eq!(m.metrics.tool, "dry_run");
    assert_eq!(m.metrics.category.as_deref(), Some("retail"));
    assert_eq!(m.metrics.onload_ms, None);
    assert!(m.waterfall.is_none());
}
