//! Tier-to-model selector — the final stage of the Router Facade.
//!
//! Given a tier and the tier ladder for the active profile, builds the
//! ordered fallback chain, filters it by known context window, and computes
//! cost/savings against the baseline model. Grounded on a production
//! router's `select_model` step: token-force-complex already handled by
//! [`crate::classifier`], so this module only needs the tier → model →
//! cost path.

use std::collections::HashMap;

use crate::config::{ModelPricing, Tier, TierConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingMethod {
    Rules,
    /// Reserved for an LLM-adjudicated classification path; the ambiguous
    /// band currently resolves via `overrides.ambiguous_default_tier`
    /// instead of an actual model call, so this is never constructed.
    #[allow(dead_code)]
    LlmFallback,
}

impl std::fmt::Display for RoutingMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Rules => "rules",
            Self::LlmFallback => "llm-fallback",
        })
    }
}

/// The final output of the Scorer → Classifier → Selector chain.
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub model: String,
    /// The full ordered fallback chain, `[model, ...fallback]`, for the
    /// dispatcher to walk on failure.
    pub fallback_chain: Vec<String>,
    pub tier: Tier,
    pub confidence: f64,
    pub method: RoutingMethod,
    pub reasoning: String,
    pub cost_estimate: f64,
    pub baseline_cost: f64,
    pub savings: f64,
}

/// Select a model (and its fallback chain) for `tier` out of `tier_configs`,
/// filtering by context window and computing cost/savings vs. `baseline`.
///
/// `is_premium` disables savings reporting unconditionally (§4.C step 4).
#[allow(clippy::too_many_arguments)]
pub fn select_model(
    tier: Tier,
    confidence: f64,
    reasoning: &str,
    tier_configs: &HashMap<Tier, TierConfig>,
    pricing: &HashMap<String, ModelPricing>,
    baseline_model: &str,
    context_windows: &HashMap<String, usize>,
    input_tokens: usize,
    max_output_tokens: usize,
    is_premium: bool,
) -> RoutingDecision {
    let chain = tier_configs.get(&tier).map(TierConfig::chain).unwrap_or_default();
    let estimated_total = input_tokens + max_output_tokens;

    let filtered: Vec<String> = chain
        .iter()
        .filter(|model| match context_windows.get(model.as_str()) {
            Some(&window) => (window as f64) >= estimated_total as f64 * 1.1,
            None => true,
        })
        .cloned()
        .collect();
    let fallback_chain = if filtered.is_empty() { chain } else { filtered };

    build_decision(
        fallback_chain,
        tier,
        confidence,
        RoutingMethod::Rules,
        reasoning.to_string(),
        pricing,
        baseline_model,
        input_tokens,
        max_output_tokens,
        is_premium,
    )
}

/// Build a [`RoutingDecision`] for an explicit, provider-qualified `model`
/// id that bypasses the Scorer → Classifier chain entirely (§6: "any
/// explicit provider-qualified id bypasses classification but still uses
/// the fallback chain"). `fallback_chain` and `tier` come from
/// [`crate::config::RoutingConfig::resolve_explicit_model`].
#[allow(clippy::too_many_arguments)]
pub fn explicit_model(
    fallback_chain: Vec<String>,
    tier: Tier,
    pricing: &HashMap<String, ModelPricing>,
    baseline_model: &str,
    input_tokens: usize,
    max_output_tokens: usize,
    is_premium: bool,
) -> RoutingDecision {
    build_decision(
        fallback_chain,
        tier,
        1.0,
        RoutingMethod::Rules,
        "explicit model id bypasses classification".to_string(),
        pricing,
        baseline_model,
        input_tokens,
        max_output_tokens,
        is_premium,
    )
}

#[allow(clippy::too_many_arguments)]
fn build_decision(
    fallback_chain: Vec<String>,
    tier: Tier,
    confidence: f64,
    method: RoutingMethod,
    reasoning: String,
    pricing: &HashMap<String, ModelPricing>,
    baseline_model: &str,
    input_tokens: usize,
    max_output_tokens: usize,
    is_premium: bool,
) -> RoutingDecision {
    let model = fallback_chain.first().cloned().unwrap_or_else(|| baseline_model.to_string());

    let model_pricing = pricing.get(&model).copied().unwrap_or_default();
    let cost_estimate = cost_of(&model_pricing, input_tokens, max_output_tokens);

    let baseline_pricing = pricing.get(baseline_model).copied().unwrap_or_default();
    let baseline_cost = cost_of(&baseline_pricing, input_tokens, max_output_tokens);

    let savings = if is_premium || baseline_cost <= 0.0 {
        0.0
    } else {
        ((baseline_cost - cost_estimate) / baseline_cost).max(0.0)
    };

    RoutingDecision {
        model,
        fallback_chain,
        tier,
        confidence,
        method,
        reasoning,
        cost_estimate,
        baseline_cost,
        savings,
    }
}

fn cost_of(pricing: &ModelPricing, input_tokens: usize, output_tokens: usize) -> f64 {
    input_tokens as f64 * pricing.input_price / 1_000_000.0
        + output_tokens as f64 * pricing.output_price / 1_000_000.0
}
