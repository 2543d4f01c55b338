//! Client-facing API (`BLOCKRUN_PROXY_PORT`) — the endpoint agents talk to.
//!
//! This is intentionally a thin layer: all pipeline logic lives in
//! [`crate::dispatcher`]. Handlers translate HTTP concerns (status codes,
//! headers, timing) into a call into the dispatcher and back.

use std::{sync::Arc, time::Instant};

use axum::{
    body::{Body, Bytes},
    extract::{Extension, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::{
    api::request_id::RequestId,
    config::RoutingProfile,
    dispatcher::{self, DispatchBody},
    router::RouterState,
};

/// Build the client-facing axum router.
pub fn router(state: Arc<RouterState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/healthz", get(crate::api::health::healthz))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        .route("/dashboard", get(dashboard))
        .with_state(state)
}

/// POST /v1/chat/completions — run the full dispatch pipeline.
pub async fn chat_completions(
    State(state): State<Arc<RouterState>>,
    Extension(request_id): Extension<RequestId>,
    body: Bytes,
) -> Response {
    let started = Instant::now();
    let profile = extract_profile(&body);

    match dispatcher::dispatch(&state, body.to_vec(), profile).await {
        Ok(outcome) => {
            let mut entry = crate::traffic::TrafficEntry::new(
                outcome.tier.clone().unwrap_or_else(|| "cached".into()),
                outcome.model.clone().unwrap_or_else(|| "cached".into()),
                started.elapsed().as_millis() as u64,
                (200..300).contains(&outcome.status),
            )
            .with_profile(&format!("{profile:?}").to_lowercase());
            entry.id = request_id.0.clone();
            if let Some(method) = &outcome.method {
                entry = entry.with_routing_mode(method);
            }
            if outcome.escalated {
                entry = entry.mark_escalated();
            }
            if outcome.dedup_hit {
                entry = entry.mark_dedup_hit();
            }
            if let (Some(cost_estimate), Some(savings)) = (outcome.cost_estimate, outcome.savings) {
                entry = entry.with_economics(cost_estimate, savings);
            }
            state.traffic.push(entry);

            let status = StatusCode::from_u16(outcome.status).unwrap_or(StatusCode::BAD_GATEWAY);
            let mut headers = HeaderMap::new();
            for (name, value) in outcome.headers {
                if let (Ok(name), Ok(value)) =
                    (HeaderName::try_from(name), HeaderValue::from_str(&value))
                {
                    headers.insert(name, value);
                }
            }
            match outcome.body {
                DispatchBody::Buffered(bytes) => (status, headers, bytes).into_response(),
                DispatchBody::Streamed(stream) => {
                    let mut response = Response::new(Body::from_stream(stream));
                    *response.status_mut() = status;
                    *response.headers_mut() = headers;
                    response
                }
            }
        }
        Err(e) => {
            let message = e.to_string();
            let mut entry = crate::traffic::TrafficEntry::new(
                "n/a".into(),
                "n/a".into(),
                started.elapsed().as_millis() as u64,
                false,
            )
            .with_profile(&format!("{profile:?}").to_lowercase())
            .with_error(&message);
            entry.id = request_id.0.clone();
            state.traffic.push(entry);
            e.into_response()
        }
    }
}

/// Best-effort extraction of the routing profile from the request's `model`
/// field — falls back to AUTO on any parse failure so a malformed body still
/// reaches dispatcher validation (and its proper 400) instead of failing here.
fn extract_profile(body: &[u8]) -> RoutingProfile {
    serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| v.get("model").and_then(Value::as_str).and_then(RoutingProfile::parse))
        .unwrap_or_default()
}

/// GET /health — liveness probe that also surfaces the signer's address
/// and process uptime.
pub async fn health(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "wallet": state.signer.address(),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

/// GET /v1/models — static catalog built from every model referenced in the
/// active tier ladders.
pub async fn list_models(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    let config = state.config();
    let mut models: Vec<&str> = config
        .routing
        .tiers
        .values()
        .chain(config.routing.eco_tiers.values())
        .chain(config.routing.premium_tiers.values())
        .chain(config.routing.agentic_tiers.values())
        .flat_map(|t| std::iter::once(t.primary.as_str()).chain(t.fallback.iter().map(String::as_str)))
        .collect();
    models.sort_unstable();
    models.dedup();

    let data: Vec<Value> = models
        .into_iter()
        .map(|id| json!({ "id": id, "object": "model" }))
        .collect();

    Json(json!({ "object": "list", "data": data }))
}

/// GET /dashboard — the stats dashboard is an external collaborator, out of
/// scope for this crate.
pub async fn dashboard() -> impl IntoResponse {
    (
        StatusCode::NOT_IMPLEMENTED,
        Json(json!({ "error": { "message": "dashboard is not implemented by this proxy", "type": "not_implemented" } })),
    )
}
