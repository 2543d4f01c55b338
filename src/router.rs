//! Router Facade — the brain of blockrun-proxy.
//!
//! Combines Scorer → Classifier → Selector into a single `route()` call,
//! and holds the shared application state injected into every handler via
//! [`axum::extract::State`], the same role the teacher's `RouterState`
//! plays for lm-gateway.

use std::{
    path::PathBuf,
    sync::{Arc, RwLock},
};

use crate::{
    classifier,
    config::{Config, RoutingProfile},
    dedup_cache::SharedDedupCache,
    scorer,
    selector::{self, RoutingDecision},
    traffic::TrafficLog,
    upstream::UpstreamClient,
    wallet::WalletSigner,
};

/// Shared application state injected into every request handler.
pub struct RouterState {
    /// Atomically-swappable live config; the lock is held only for the
    /// duration of `Arc::clone`, so it never blocks request handling.
    config_lock: Arc<RwLock<Arc<Config>>>,
    /// Path to the config file on disk — used by the hot-reload task.
    pub config_path: PathBuf,
    /// In-memory ring-buffer of recent requests, exposed through the admin API.
    pub traffic: Arc<TrafficLog>,
    /// Proxy start time — used to compute uptime for `/health`.
    pub started_at: std::time::Instant,
    pub dedup: SharedDedupCache,
    /// Loaded once at startup; never hot-reloaded — the wallet key is
    /// security-sensitive and a config-file reload should never change it.
    pub signer: Arc<dyn WalletSigner>,
    pub upstream: Arc<UpstreamClient>,
    /// Bearer token required for `/admin/*`. `None` disables admin auth.
    pub admin_token: Option<String>,
}

impl RouterState {
    pub fn new(
        config: Arc<Config>,
        config_path: PathBuf,
        traffic: Arc<TrafficLog>,
        dedup: SharedDedupCache,
        signer: Arc<dyn WalletSigner>,
    ) -> Self {
        let admin_token = config
            .gateway
            .admin_token_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|t| !t.is_empty());
        let upstream =
            Arc::new(UpstreamClient::new(&config.upstream, config.dispatch.upstream_timeout_secs));

        Self {
            config_lock: Arc::new(RwLock::new(config)),
            config_path,
            traffic,
            started_at: std::time::Instant::now(),
            dedup,
            signer,
            upstream,
            admin_token,
        }
    }

    /// Returns a snapshot of the current live config. The `RwLock` is held
    /// only for the duration of `Arc::clone`, so callers get a stable
    /// reference with no contention risk.
    pub fn config(&self) -> Arc<Config> {
        self.config_lock.read().expect("config lock poisoned").clone()
    }

    /// Atomically replaces the live config. Called only from the
    /// hot-reload task. Does not rebuild the upstream client or signer.
    pub fn replace_config(&self, new: Arc<Config>) {
        *self.config_lock.write().expect("config lock poisoned") = new;
    }
}

/// Combine Scorer → Classifier → Selector into a single routing decision.
///
/// `request_model` is the caller's raw `model` field. A routing-profile
/// keyword (`free`/`eco`/`auto`/`premium`) or anything else unrecognized
/// runs the normal classification chain under `profile`. An explicit,
/// provider-qualified id found in any tier ladder bypasses classification
/// and dispatches directly through its own fallback chain (§6). An id that
/// is neither a keyword nor a known model is rejected — callers should
/// surface this as 400 naming the `model` field.
pub fn route(
    request_model: &str,
    prompt: &str,
    system: Option<&str>,
    max_output_tokens: usize,
    config: &Config,
    profile: RoutingProfile,
) -> Result<RoutingDecision, String> {
    let estimated_tokens = (system.unwrap_or("").len() + prompt.len()) / 4;

    if RoutingProfile::parse(request_model).is_none() {
        if let Some((tier, fallback_chain)) = config.routing.resolve_explicit_model(request_model) {
            return Ok(selector::explicit_model(
                fallback_chain,
                tier,
                &config.routing.pricing,
                &config.routing.baseline_model,
                estimated_tokens,
                max_output_tokens,
                profile == RoutingProfile::Premium,
            ));
        }
        return Err(format!("unknown model id \"{request_model}\""));
    }

    let scoring = scorer::score(system, prompt, &config.routing.scoring);
    let has_structured = classifier::has_structured_output(system);
    let classification =
        classifier::classify(&scoring, &config.routing.overrides, estimated_tokens, has_structured);

    let agentic = config.routing.overrides.agentic_mode && scoring.agentic_score >= config.routing.scoring.agentic_threshold;
    let tier_configs = config.routing.tier_set(profile, agentic);

    Ok(selector::select_model(
        classification.tier,
        classification.confidence,
        &classification.reasoning,
        tier_configs,
        &config.routing.pricing,
        &config.routing.baseline_model,
        &config.routing.context_windows,
        estimated_tokens,
        max_output_tokens,
        profile == RoutingProfile::Premium,
    ))
}
