//! Prometheus-compatible `/metrics` endpoint.
//!
//! All metrics are derived from the in-memory ring-buffer window. Because the
//! buffer has a fixed capacity, values represent a **sliding window** of recent
//! requests rather than lifetime counters. Use `TYPE gauge` throughout for
//! semantic accuracy — values may decrease as old entries rotate out.
//!
//! Metric families:
//! - `blockrun_window_size`          — entries currently in the ring buffer
//! - `blockrun_requests`             — per-tier/model/outcome request counts
//! - `blockrun_latency_ms_sum`       — sum of latencies per tier/model (for avg)
//! - `blockrun_latency_ms_count`     — denominator matching the sum above
//! - `blockrun_escalations_total`    — requests that fell through the fallback chain
//! - `blockrun_errors_total`         — requests that returned an error
//! - `blockrun_dedup_hits_total`     — requests served from the dedup cache
//! - `blockrun_dedup_misses_total`   — requests that required an upstream dispatch

use std::{
    collections::HashMap,
    sync::Arc,
};

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
};

use crate::router::RouterState;

/// `GET /metrics` — renders Prometheus text format.
pub async fn metrics(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    // Grab the full ring-buffer window in one lock acquisition.
    let entries = state.traffic.recent(usize::MAX).await;

    // --- aggregate ---
    let window_size = entries.len();
    let mut escalations: u64 = 0;
    let mut errors: u64 = 0;
    let mut dedup_hits: u64 = 0;
    let mut dedup_misses: u64 = 0;

    // (tier, model, success) → count
    let mut request_counts: HashMap<(String, String, bool), u64> = HashMap::new();
    // (tier, model) → (latency_sum_ms, count)
    let mut latency: HashMap<(String, String), (u64, u64)> = HashMap::new();

    for e in &entries {
        if e.escalated { escalations += 1; }
        if !e.success { errors += 1; }
        if e.dedup_hit { dedup_hits += 1; } else { dedup_misses += 1; }

        *request_counts
            .entry((e.tier.clone(), e.model.clone(), e.success))
            .or_default() += 1;

        let lat = latency.entry((e.tier.clone(), e.model.clone())).or_default();
        lat.0 += e.latency_ms;
        lat.1 += 1;
    }

    // --- render ---
    let mut out = String::with_capacity(1024);

    // window_size
    out.push_str("# HELP blockrun_window_size Number of requests currently held in the ring-buffer window.\n");
    out.push_str("# TYPE blockrun_window_size gauge\n");
    out.push_str(&format!("blockrun_window_size {window_size}\n\n"));

    // request counts
    out.push_str("# HELP blockrun_requests Request count in the current window, labelled by tier, model, and outcome.\n");
    out.push_str("# TYPE blockrun_requests gauge\n");
    let mut req_rows: Vec<_> = request_counts.iter().collect();
    req_rows.sort_by(|a, b| a.0.cmp(b.0));
    for ((tier, model, success), count) in req_rows {
        let success_str = if *success { "true" } else { "false" };
        out.push_str(&format!(
            "blockrun_requests{{tier=\"{tier}\",model=\"{model}\",success=\"{success_str}\"}} {count}\n"
        ));
    }
    out.push('\n');

    // latency sum + count
    out.push_str("# HELP blockrun_latency_ms_sum Sum of request latency (ms) in the current window, grouped by tier and model.\n");
    out.push_str("# TYPE blockrun_latency_ms_sum gauge\n");
    out.push_str("# HELP blockrun_latency_ms_count Number of observations for the latency sum above.\n");
    out.push_str("# TYPE blockrun_latency_ms_count gauge\n");
    let mut lat_rows: Vec<_> = latency.iter().collect();
    lat_rows.sort_by(|a, b| a.0.cmp(b.0));
    for ((tier, model), (sum, count)) in lat_rows {
        out.push_str(&format!(
            "blockrun_latency_ms_sum{{tier=\"{tier}\",model=\"{model}\"}} {sum}\n"
        ));
        out.push_str(&format!(
            "blockrun_latency_ms_count{{tier=\"{tier}\",model=\"{model}\"}} {count}\n"
        ));
    }
    out.push('\n');

    // escalations
    out.push_str("# HELP blockrun_escalations_total Requests that fell through the fallback chain in the current window.\n");
    out.push_str("# TYPE blockrun_escalations_total gauge\n");
    out.push_str(&format!("blockrun_escalations_total {escalations}\n\n"));

    // errors
    out.push_str("# HELP blockrun_errors_total Requests that returned an error in the current window.\n");
    out.push_str("# TYPE blockrun_errors_total gauge\n");
    out.push_str(&format!("blockrun_errors_total {errors}\n\n"));

    // dedup
    out.push_str("# HELP blockrun_dedup_hits_total Requests served from the dedup cache in the current window.\n");
    out.push_str("# TYPE blockrun_dedup_hits_total gauge\n");
    out.push_str(&format!("blockrun_dedup_hits_total {dedup_hits}\n"));
    out.push_str("# HELP blockrun_dedup_misses_total Requests that required a fresh upstream dispatch in the current window.\n");
    out.push_str("# TYPE blockrun_dedup_misses_total gauge\n");
    out.push_str(&format!("blockrun_dedup_misses_total {dedup_misses}\n"));

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        out,
    )
}
