use crate::model::{PhaseStats, RequestEntry, WaterfallSummary};

// Phases reported in timing_stats; `blocked` is queueing, not network time.
const SUMMARY_PHASES: &[&str] = &["dns", "connect", "ssl", "send", "wait", "receive"];

/// Aggregate view over the final entry list.
pub fn summarize(entries: &[RequestEntry]) -> WaterfallSummary {
    let mut summary = WaterfallSummary {
        total_entries: entries.len(),
        ..Default::default()
    };

    for entry in entries {
        summary.total_transfer_size += entry.transfer_size;

        let by_type = &mut summary.by_resource_type;
        *by_type
            .counts
            .entry(entry.resource_type.clone())
            .or_default() += 1;
        *by_type
            .sizes
            .entry(entry.resource_type.clone())
            .or_default() += entry.transfer_size;

        if entry.connection_reused {
            summary.connection_stats.reused += 1;
        } else {
            summary.connection_stats.new += 1;
        }

        if entry.from_cache {
            summary.cache_stats.from_cache += 1;
        } else {
            summary.cache_stats.from_network += 1;
        }

        for (phase, value) in entry.timings.phases() {
            if !SUMMARY_PHASES.contains(&phase) || value < 0.0 {
                continue;
            }
            let stats = summary.timing_stats.entry(phase.to_string()).or_default();
            stats.count += 1;
            stats.total_ms += value;
        }
    }

    for stats in summary.timing_stats.values_mut() {
        *stats = finish(stats);
    }

    summary
}

fn finish(stats: &PhaseStats) -> PhaseStats {
    let avg = if stats.count == 0 {
        0.0
    } else {
        stats.total_ms / stats.count as f64
    };
    PhaseStats {
        count: stats.count,
        total_ms: round2(stats.total_ms),
        avg_ms: round2(avg),
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
