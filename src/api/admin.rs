//! Admin API (`BLOCKRUN_ADMIN_PORT`) — operator-facing introspection
//! endpoints.
//!
//! Separated onto its own port so it can be network-restricted
//! independently of the client API, gated by [`crate::api::admin_auth`]
//! when `admin_token_env` is configured.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;

use crate::router::RouterState;

/// Build the admin-facing axum router.
pub fn router(state: Arc<RouterState>) -> Router {
    Router::new()
        .route("/admin/traffic", get(traffic))
        .route("/admin/config", get(config))
        .route("/admin/dedup", get(dedup))
        .route("/healthz", get(crate::api::health::healthz))
        .route("/metrics", get(crate::api::metrics::metrics))
        .with_state(state)
}

#[derive(Deserialize)]
pub struct TrafficQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}
fn default_limit() -> usize {
    100
}

/// GET /admin/traffic?limit=N — recent N routing decisions + dedup outcomes.
pub async fn traffic(
    State(state): State<Arc<RouterState>>,
    Query(q): Query<TrafficQuery>,
) -> impl IntoResponse {
    let entries = state.traffic.recent(q.limit).await;
    let stats = state.traffic.stats().await;
    Json(json!({
        "stats": stats,
        "entries": entries,
    }))
}

/// GET /admin/config — current live config with secrets redacted.
pub async fn config(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    let cfg = state.config();

    Json(json!({
        "gateway": {
            "client_port": cfg.gateway.client_port,
            "admin_port": cfg.gateway.admin_port(),
            "traffic_log_capacity": cfg.gateway.traffic_log_capacity,
        },
        "upstream": {
            "base_url": cfg.upstream.base_url,
            "api_key_env": cfg.upstream.api_key_env,
        },
        "dedup": cfg.dedup,
        "compression": cfg.compression,
        "dispatch": cfg.dispatch,
        "routing": {
            "baseline_model": cfg.routing.baseline_model,
            "tiers": cfg.routing.tiers,
            "eco_tiers": cfg.routing.eco_tiers,
            "premium_tiers": cfg.routing.premium_tiers,
            "agentic_tiers": cfg.routing.agentic_tiers,
            "pricing": cfg.routing.pricing,
            "overrides": cfg.routing.overrides,
        },
        "wallet": { "address": state.signer.address() },
    }))
}

/// GET /admin/dedup — dedup cache occupancy for operational visibility.
pub async fn dedup(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    Json(json!({
        "completed_count": state.dedup.completed_count(),
        "inflight_count": state.dedup.inflight_count(),
    }))
}
