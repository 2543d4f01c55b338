//! Classifier — turns a [`ScoringResult`] into a final [`Tier`] decision.
//!
//! Applies the override precedence documented on [`crate::config::Overrides`]:
//! large-context force-complex, then the scorer's tentative tier (or the
//! configured ambiguous default), then a structured-output minimum-tier
//! upgrade. Mirrors the override-precedence structure of a production
//! router's `route()` function, adapted to operate on the scorer's output
//! directly rather than re-deriving it.

use crate::config::{Overrides, Tier};
use crate::scorer::ScoringResult;

#[derive(Debug, Clone)]
pub struct ClassificationResult {
    pub tier: Tier,
    pub confidence: f64,
    pub reasoning: String,
}

/// Classify a request given its scorer output and estimated input token
/// count. `has_structured_output` should reflect whether the system prompt
/// matches the case-insensitive `json|schema|structured` pattern.
pub fn classify(
    scoring: &ScoringResult,
    overrides: &Overrides,
    estimated_tokens: usize,
    has_structured_output: bool,
) -> ClassificationResult {
    if estimated_tokens > overrides.max_tokens_force_complex {
        return ClassificationResult {
            tier: Tier::Complex,
            confidence: 0.95,
            reasoning: format!(
                "large context ({estimated_tokens} tokens > {})",
                overrides.max_tokens_force_complex
            ),
        };
    }

    let (mut tier, confidence, mut reasoning) = match scoring.tier {
        Some(tier) => (
            tier,
            scoring.confidence,
            format!("score={:.2} | {}", scoring.score, scoring.signals.join(", ")),
        ),
        None => (
            overrides.ambiguous_default_tier,
            0.5,
            format!(
                "score={:.2} | {} | ambiguous -> default: {}",
                scoring.score,
                scoring.signals.join(", "),
                overrides.ambiguous_default_tier
            ),
        ),
    };

    if has_structured_output && tier < overrides.structured_output_min_tier {
        reasoning += &format!(" | upgraded to {} (structured output)", overrides.structured_output_min_tier);
        tier = overrides.structured_output_min_tier;
    }

    ClassificationResult { tier, confidence, reasoning }
}

/// Matches the system prompt against the structured-output keyword set
/// (case-insensitive `json|schema|structured`).
pub fn has_structured_output(system: Option<&str>) -> bool {
    system
        .map(|s| s.to_lowercase())
        .map(|s| s.contains("json") || s.contains("schema") || s.contains("structured"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scoring(tier: Option<Tier>) -> ScoringResult {
        ScoringResult { score: 0.4, agentic_score: 0.0, signals: vec![], tier, confidence: 0.8 }
    }

    #[test]
    fn large_context_forces_complex_regardless_of_scorer_tier() {
        let overrides = Overrides::default();
        let result = classify(&scoring(Some(Tier::Simple)), &overrides, 200_000, false);
        assert_eq!(result.tier, Tier::Complex);
        assert_eq!(result.confidence, 0.95);
    }

    #[test]
    fn scorer_tier_is_used_when_present() {
        let overrides = Overrides::default();
        let result = classify(&scoring(Some(Tier::Complex)), &overrides, 100, false);
        assert_eq!(result.tier, Tier::Complex);
        assert_eq!(result.confidence, 0.8);
    }

    #[test]
    fn ambiguous_scorer_tier_falls_back_to_configured_default() {
        let overrides = Overrides { ambiguous_default_tier: Tier::Medium, ..Overrides::default() };
        let result = classify(&scoring(None), &overrides, 100, false);
        assert_eq!(result.tier, Tier::Medium);
        assert_eq!(result.confidence, 0.5);
        assert!(result.reasoning.contains("ambiguous"));
    }

    #[test]
    fn structured_output_upgrades_below_minimum_tier() {
        let overrides = Overrides { structured_output_min_tier: Tier::Medium, ..Overrides::default() };
        let result = classify(&scoring(Some(Tier::Simple)), &overrides, 100, true);
        assert_eq!(result.tier, Tier::Medium);
        assert!(result.reasoning.contains("structured output"));
    }

    #[test]
    fn structured_output_does_not_downgrade_a_higher_tier() {
        let overrides = Overrides { structured_output_min_tier: Tier::Medium, ..Overrides::default() };
        let result = classify(&scoring(Some(Tier::Complex)), &overrides, 100, true);
        assert_eq!(result.tier, Tier::Complex);
    }

    #[test]
    fn detects_structured_output_keywords_case_insensitively() {
        assert!(has_structured_output(Some("Respond with valid JSON only.")));
        assert!(has_structured_output(Some("Follow this SCHEMA exactly.")));
        assert!(!has_structured_output(Some("You are a helpful assistant.")));
        assert!(!has_structured_output(None));
    }
}
