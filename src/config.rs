//! Configuration types for blockrun-proxy.
//!
//! Config is loaded once at startup from a TOML file and validated before
//! the server opens any ports, mirroring the teacher's `Config::load`.
//! Unlike the teacher's flat gateway/backends/tiers shape, this config is
//! organized around the four core subsystems (routing, dedup, compression,
//! dispatch) plus the ambient `[gateway]` section.

use std::{collections::HashMap, path::Path};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Complexity tier, totally ordered SIMPLE < MEDIUM < COMPLEX < REASONING.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Simple,
    Medium,
    Complex,
    Reasoning,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Simple, Tier::Medium, Tier::Complex, Tier::Reasoning];
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Simple => "simple",
            Self::Medium => "medium",
            Self::Complex => "complex",
            Self::Reasoning => "reasoning",
        })
    }
}

/// Routing profile selected by the client's `model` field (`free`, `eco`,
/// `auto`, `premium`) or defaulted to AUTO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingProfile {
    Free,
    Eco,
    #[default]
    Auto,
    Premium,
}

impl RoutingProfile {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "free" => Some(Self::Free),
            "eco" => Some(Self::Eco),
            "auto" => Some(Self::Auto),
            "premium" => Some(Self::Premium),
            _ => None,
        }
    }
}

/// A model's per-token pricing in $/M tokens.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_price: f64,
    pub output_price: f64,
}

/// Primary + ordered fallback models for a single tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    pub primary: String,
    #[serde(default)]
    pub fallback: Vec<String>,
}

impl TierConfig {
    /// `[primary, ...fallback]`, the order the dispatcher attempts models in.
    pub fn chain(&self) -> Vec<String> {
        let mut chain = Vec::with_capacity(1 + self.fallback.len());
        chain.push(self.primary.clone());
        chain.extend(self.fallback.iter().cloned());
        chain
    }
}

/// Weights for the scorer's ~15 independent dimensions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringWeights {
    pub code: f64,
    pub reasoning: f64,
    pub technical: f64,
    pub creative: f64,
    pub simple: f64,
    pub multi_step: f64,
    pub question_complexity: f64,
    pub imperative: f64,
    pub constraint: f64,
    pub structured_output: f64,
    pub reference: f64,
    pub negation: f64,
    pub domain: f64,
    pub agentic: f64,
    pub length: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            code: 0.15,
            reasoning: 0.18,
            technical: 0.10,
            creative: 0.05,
            simple: 0.08,
            multi_step: 0.12,
            question_complexity: 0.05,
            imperative: 0.03,
            constraint: 0.04,
            structured_output: 0.06,
            reference: 0.02,
            negation: 0.01,
            domain: 0.03,
            agentic: 0.04,
            length: 0.08,
        }
    }
}

/// Score boundaries separating the four tiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierBoundaries {
    pub simple_medium: f64,
    pub medium_complex: f64,
    pub complex_reasoning: f64,
}

impl Default for TierBoundaries {
    fn default() -> Self {
        Self { simple_medium: 0.15, medium_complex: 0.35, complex_reasoning: 0.6 }
    }
}

/// Token-count bands used by the length-proxy dimension.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenThresholds {
    pub short_upper: usize,
    pub long_lower: usize,
}

impl Default for TokenThresholds {
    fn default() -> Self {
        Self { short_upper: 200, long_lower: 2000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    #[serde(default)]
    pub weights: ScoringWeights,
    #[serde(default)]
    pub tier_boundaries: TierBoundaries,
    #[serde(default)]
    pub token_thresholds: TokenThresholds,
    /// Half-width of the neutral band around a tier boundary within which
    /// the scorer declares ambiguity (returns `tier = None`).
    #[serde(default = "defaults::ambiguity_epsilon")]
    pub ambiguity_epsilon: f64,
    /// Agentic-score threshold above which `agenticTiers` is selected for
    /// the AUTO profile.
    #[serde(default = "defaults::agentic_threshold")]
    pub agentic_threshold: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weights: ScoringWeights::default(),
            tier_boundaries: TierBoundaries::default(),
            token_thresholds: TokenThresholds::default(),
            ambiguity_epsilon: defaults::ambiguity_epsilon(),
            agentic_threshold: defaults::agentic_threshold(),
        }
    }
}

/// Classifier-level overrides applied after the scorer's tentative tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Overrides {
    #[serde(default = "defaults::max_tokens_force_complex")]
    pub max_tokens_force_complex: usize,
    #[serde(default = "defaults::structured_output_min_tier")]
    pub structured_output_min_tier: Tier,
    #[serde(default = "defaults::ambiguous_default_tier")]
    pub ambiguous_default_tier: Tier,
    #[serde(default)]
    pub agentic_mode: bool,
}

impl Default for Overrides {
    fn default() -> Self {
        Self {
            max_tokens_force_complex: defaults::max_tokens_force_complex(),
            structured_output_min_tier: defaults::structured_output_min_tier(),
            ambiguous_default_tier: defaults::ambiguous_default_tier(),
            agentic_mode: false,
        }
    }
}

/// Per-profile tier ladders, pricing table and scoring/override config —
/// everything the Scorer → Classifier → Selector chain needs.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RoutingConfig {
    #[serde(default)]
    pub tiers: HashMap<Tier, TierConfig>,
    #[serde(default)]
    pub eco_tiers: HashMap<Tier, TierConfig>,
    #[serde(default)]
    pub premium_tiers: HashMap<Tier, TierConfig>,
    #[serde(default)]
    pub agentic_tiers: HashMap<Tier, TierConfig>,
    #[serde(default)]
    pub pricing: HashMap<String, ModelPricing>,
    /// Known context window sizes (tokens) for models that filtering should
    /// consider; unknown models are treated as having no known limit.
    #[serde(default)]
    pub context_windows: HashMap<String, usize>,
    pub baseline_model: String,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub overrides: Overrides,
}

impl RoutingConfig {
    /// Tier ladder for the given profile/agentic combination (§4.C step 1).
    pub fn tier_set(&self, profile: RoutingProfile, agentic: bool) -> &HashMap<Tier, TierConfig> {
        match profile {
            RoutingProfile::Eco | RoutingProfile::Free => &self.eco_tiers,
            RoutingProfile::Premium => &self.premium_tiers,
            RoutingProfile::Auto => {
                if agentic && !self.agentic_tiers.is_empty() {
                    &self.agentic_tiers
                } else {
                    &self.tiers
                }
            }
        }
    }

    pub fn pricing_of(&self, model: &str) -> ModelPricing {
        self.pricing.get(model).copied().unwrap_or_default()
    }

    /// Resolve an explicit, provider-qualified `model` id (e.g.
    /// `"openai/gpt-4o-mini"`) against every tier ladder, independent of
    /// profile. Returns the tier it was found in and the fallback chain
    /// starting at that model (its own tier's remaining chain), so a
    /// request for a non-primary model still retries the rungs below it.
    ///
    /// `None` means the id is neither a routing-profile keyword nor a
    /// known model — callers should reject it with 400.
    pub fn resolve_explicit_model(&self, model: &str) -> Option<(Tier, Vec<String>)> {
        for ladder in [&self.tiers, &self.eco_tiers, &self.premium_tiers, &self.agentic_tiers] {
            for tier in Tier::ALL {
                let Some(cfg) = ladder.get(&tier) else { continue };
                let chain = cfg.chain();
                if let Some(idx) = chain.iter().position(|m| m == model) {
                    return Some((tier, chain[idx..].to_vec()));
                }
            }
        }
        None
    }
}

/// Dedup cache parameters (§4.E).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    #[serde(default = "defaults::dedup_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "defaults::max_body_size")]
    pub max_body_size: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self { ttl_secs: defaults::dedup_ttl_secs(), max_body_size: defaults::max_body_size() }
    }
}

/// Compression pipeline layer toggles and thresholds (§4.D).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    #[serde(default = "defaults::true_")]
    pub dedup_layer: bool,
    #[serde(default = "defaults::true_")]
    pub whitespace_layer: bool,
    #[serde(default)]
    pub static_dictionary_layer: bool,
    #[serde(default)]
    pub path_prefix_layer: bool,
    #[serde(default = "defaults::true_")]
    pub json_compact_layer: bool,
    #[serde(default)]
    pub tool_observation_layer: bool,
    #[serde(default)]
    pub dynamic_codebook_layer: bool,
    /// Skip the whole pipeline below this total content size.
    #[serde(default = "defaults::should_compress_bytes")]
    pub should_compress_bytes: usize,
    /// Layer 6 per-message threshold for producing a summary instead of
    /// passing content through verbatim.
    #[serde(default = "defaults::tool_observation_threshold")]
    pub tool_observation_threshold: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            dedup_layer: true,
            whitespace_layer: true,
            static_dictionary_layer: false,
            path_prefix_layer: false,
            json_compact_layer: true,
            tool_observation_layer: false,
            dynamic_codebook_layer: false,
            should_compress_bytes: defaults::should_compress_bytes(),
            tool_observation_threshold: defaults::tool_observation_threshold(),
        }
    }
}

/// Dispatcher-level limits (§4.F).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "defaults::max_request_size_kb")]
    pub max_request_size_kb: usize,
    #[serde(default = "defaults::compression_threshold_kb")]
    pub compression_threshold_kb: usize,
    #[serde(default = "defaults::true_")]
    pub auto_compress_requests: bool,
    #[serde(default = "defaults::max_fallback_attempts")]
    pub max_fallback_attempts: usize,
    #[serde(default = "defaults::upstream_timeout_secs")]
    pub upstream_timeout_secs: u64,
    /// Model used as a last-resort attempt once the whole fallback chain
    /// is exhausted (§4.F step 8).
    pub emergency_fallback_model: Option<String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_request_size_kb: defaults::max_request_size_kb(),
            compression_threshold_kb: defaults::compression_threshold_kb(),
            auto_compress_requests: true,
            max_fallback_attempts: defaults::max_fallback_attempts(),
            upstream_timeout_secs: defaults::upstream_timeout_secs(),
            emergency_fallback_model: None,
        }
    }
}

/// The single OpenAI-compatible upstream inference endpoint every model in
/// `[[routing]]` is dispatched against (model id selects the backend model
/// server-side, the way OpenRouter-style aggregators work).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
}

impl UpstreamConfig {
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env.as_deref().and_then(|var| std::env::var(var).ok())
    }
}

/// Core gateway/process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "defaults::client_port")]
    pub client_port: u16,
    #[serde(default)]
    pub admin_port: Option<u16>,
    #[serde(default)]
    pub admin_token_env: Option<String>,
    #[serde(default = "defaults::traffic_log_capacity")]
    pub traffic_log_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            client_port: defaults::client_port(),
            admin_port: None,
            admin_token_env: None,
            traffic_log_capacity: defaults::traffic_log_capacity(),
        }
    }
}

impl GatewayConfig {
    pub fn admin_port(&self) -> u16 {
        self.admin_port.unwrap_or(self.client_port + 1)
    }
}

/// Top-level proxy configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    pub upstream: UpstreamConfig,
    pub routing: RoutingConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub compression: CompressionConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: Self = toml::from_str(&content).context("parsing config TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field invariants from spec §3. Missing pricing is not
    /// fatal (it emits a diagnostic and defaults to zero cost); everything
    /// else is rejected outright.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.upstream.base_url.is_empty(), "[upstream] base_url must be set");
        anyhow::ensure!(!self.routing.baseline_model.is_empty(), "[routing] baseline_model must be set");

        for (label, set) in [
            ("tiers", &self.routing.tiers),
            ("eco_tiers", &self.routing.eco_tiers),
            ("premium_tiers", &self.routing.premium_tiers),
            ("agentic_tiers", &self.routing.agentic_tiers),
        ] {
            if set.is_empty() {
                continue;
            }
            for tier in Tier::ALL {
                let cfg = set.get(&tier).with_context(|| {
                    format!("[routing.{label}] is missing a TierConfig for tier `{tier}`")
                })?;
                anyhow::ensure!(
                    !cfg.fallback.is_empty(),
                    "[routing.{label}] tier `{tier}` has an empty fallback list"
                );
                anyhow::ensure!(
                    !cfg.fallback.contains(&cfg.primary),
                    "[routing.{label}] tier `{tier}` lists its primary model in its own fallback list"
                );
                let mut seen = std::collections::HashSet::new();
                for m in &cfg.fallback {
                    anyhow::ensure!(
                        seen.insert(m.as_str()),
                        "[routing.{label}] tier `{tier}` fallback list contains duplicate `{m}`"
                    );
                }
            }
        }

        // Diagnostic-only: every model referenced anywhere should have pricing.
        let mut referenced: std::collections::HashSet<&str> = std::collections::HashSet::new();
        for set in [&self.routing.tiers, &self.routing.eco_tiers, &self.routing.premium_tiers, &self.routing.agentic_tiers] {
            for cfg in set.values() {
                referenced.insert(cfg.primary.as_str());
                referenced.extend(cfg.fallback.iter().map(String::as_str));
            }
        }
        for model in referenced {
            if !self.routing.pricing.contains_key(model) {
                tracing::warn!(model, "no pricing entry for referenced model — cost defaults to 0");
            }
        }

        Ok(())
    }
}

mod defaults {
    use super::Tier;

    pub fn client_port() -> u16 {
        std::env::var("BLOCKRUN_PROXY_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8402)
    }
    pub fn traffic_log_capacity() -> usize { 500 }
    pub fn dedup_ttl_secs() -> u64 { 30 }
    pub fn max_body_size() -> usize { 1024 * 1024 }
    pub fn should_compress_bytes() -> usize { 5 * 1024 }
    pub fn tool_observation_threshold() -> usize { 500 }
    pub fn max_request_size_kb() -> usize { 1024 }
    pub fn compression_threshold_kb() -> usize { 32 }
    pub fn max_fallback_attempts() -> usize { 3 }
    pub fn upstream_timeout_secs() -> u64 { 30 }
    pub fn ambiguity_epsilon() -> f64 { 0.03 }
    pub fn agentic_threshold() -> f64 { 0.5 }
    pub fn max_tokens_force_complex() -> usize { 100_000 }
    pub fn structured_output_min_tier() -> Tier { Tier::Medium }
    pub fn ambiguous_default_tier() -> Tier { Tier::Medium }
    pub fn true_() -> bool { true }
}
