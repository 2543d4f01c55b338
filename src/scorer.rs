//! Complexity scorer — the first stage of the Router Facade.
//!
//! Evaluates ~15 independent text dimensions against a chat request's
//! prompt/system text and produces a weighted `[0,1]` score plus a tentative
//! [`Tier`]. Keyword lists and the multi-step regex are adapted from a
//! production scoring reference; weights and boundaries are read from
//! [`ScoringConfig`] so operators can retune without a rebuild.

use std::sync::LazyLock;

use regex::Regex;

use crate::config::{ScoringConfig, Tier};

/// Result of scoring a single request's text.
#[derive(Debug, Clone)]
pub struct ScoringResult {
    pub score: f64,
    pub agentic_score: f64,
    pub signals: Vec<String>,
    /// `None` when the score falls inside the neutral band around a tier
    /// boundary — the classifier treats this as ambiguous.
    pub tier: Option<Tier>,
    pub confidence: f64,
}

#[derive(Debug, Clone, Default)]
struct Dimensions {
    code: f64,
    reasoning: f64,
    technical: f64,
    creative: f64,
    simple: f64,
    multi_step: f64,
    question_complexity: f64,
    imperative: f64,
    constraint: f64,
    structured_output: f64,
    reference: f64,
    negation: f64,
    domain: f64,
    agentic: f64,
    length: f64,
}

const CODE_KEYWORDS: &[&str] = &[
    "function", "class", "import", "const", "let", "var", "return", "async", "await", "def ",
    "print(", "console.log", "```", "pub fn", "impl ", "struct ", "enum ", "select", "insert",
    "update", "delete", "create table",
];

const REASONING_KEYWORDS: &[&str] = &[
    "prove", "theorem", "derive", "step by step", "chain of thought", "formally", "mathematical",
    "proof", "logically", "contradiction", "induction", "hypothesis", "therefore", "axiom",
    "lemma", "corollary", "deduce", "implies", "why",
];

const TECHNICAL_KEYWORDS: &[&str] = &[
    "algorithm", "optimize", "architecture", "distributed", "kubernetes", "microservice",
    "database", "infrastructure", "concurrent", "latency", "throughput", "scalable",
    "middleware", "authentication", "authorization", "encryption",
];

const CREATIVE_KEYWORDS: &[&str] = &[
    "story", "poem", "compose", "brainstorm", "creative", "imagine", "write a", "fiction",
    "narrative", "character", "plot", "metaphor",
];

const SIMPLE_KEYWORDS: &[&str] = &[
    "what is", "define", "translate", "hello", "yes or no", "capital of", "how old", "who is",
    "when was", "meaning of", "true or false",
];

const IMPERATIVE_KEYWORDS: &[&str] = &[
    "build", "create", "implement", "design", "develop", "construct", "generate", "deploy",
    "configure", "set up", "refactor", "migrate", "integrate",
];

const CONSTRAINT_KEYWORDS: &[&str] = &[
    "under", "at most", "at least", "within", "no more than", "o(", "maximum", "minimum",
    "limit", "budget", "constraint",
];

const STRUCTURED_OUTPUT_KEYWORDS: &[&str] =
    &["json", "yaml", "xml", "table", "csv", "markdown", "schema", "format as", "structured"];

const REFERENCE_KEYWORDS: &[&str] = &[
    "above", "below", "previous", "following", "the docs", "the api", "the code", "earlier",
    "attached", "mentioned",
];

const NEGATION_KEYWORDS: &[&str] = &[
    "don't", "do not", "avoid", "never", "without", "except", "exclude", "no longer",
    "must not", "shouldn't",
];

const DOMAIN_KEYWORDS: &[&str] = &[
    "quantum", "fpga", "vlsi", "risc-v", "asic", "photonics", "genomics", "proteomics",
    "topological", "homomorphic", "zero-knowledge", "lattice-based",
];

const AGENTIC_KEYWORDS: &[&str] = &[
    "read file", "read the file", "look at", "check the", "open the", "edit", "modify",
    "update the", "change the", "write to", "create file", "execute", "deploy", "install",
    "npm", "pip", "compile", "after that", "and also", "once done", "step 1", "step 2", "fix",
    "debug", "until it works", "keep trying", "iterate", "make sure", "verify", "confirm",
    "analyze", "research", "plan", "then",
];

static MULTI_STEP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(first\b.*\bthen\b|step\s+\d|1\.\s.*2\.\s)").unwrap());

/// Score `system` + `prompt` text against `config` and return the tentative
/// tier, confidence, and the signal strings that drove the decision.
pub fn score(system: Option<&str>, prompt: &str, config: &ScoringConfig) -> ScoringResult {
    let text = format!("{}\n{}", system.unwrap_or(""), prompt).to_lowercase();
    let estimated_tokens = estimate_token_count(&text);
    let mut signals: Vec<String> = Vec::new();

    let (agentic, agentic_count) = score_agentic(&text, &mut signals);

    let dims = Dimensions {
        code: keyword_score(&text, CODE_KEYWORDS, "code", &mut signals),
        reasoning: keyword_score(&text, REASONING_KEYWORDS, "reasoning", &mut signals),
        technical: keyword_score(&text, TECHNICAL_KEYWORDS, "technical", &mut signals),
        creative: keyword_score(&text, CREATIVE_KEYWORDS, "creative", &mut signals),
        simple: keyword_score(&text, SIMPLE_KEYWORDS, "simple", &mut signals),
        multi_step: multi_step_score(&text, &mut signals),
        question_complexity: question_complexity_score(&text, &mut signals),
        imperative: keyword_score(&text, IMPERATIVE_KEYWORDS, "imperative", &mut signals),
        constraint: keyword_score(&text, CONSTRAINT_KEYWORDS, "constraint", &mut signals),
        structured_output: keyword_score(
            &text,
            STRUCTURED_OUTPUT_KEYWORDS,
            "structured_output",
            &mut signals,
        ),
        reference: keyword_score(&text, REFERENCE_KEYWORDS, "reference", &mut signals),
        negation: keyword_score(&text, NEGATION_KEYWORDS, "negation", &mut signals),
        domain: keyword_score(&text, DOMAIN_KEYWORDS, "domain", &mut signals),
        agentic,
        length: length_score(estimated_tokens, &config.token_thresholds),
    };
    if agentic_count > 0 {
        signals.push(format!("agentic:{agentic_count}"));
    }

    let raw = weighted_sum(&dims, config);
    let score = raw.clamp(0.0, 1.0);

    let boundaries = &config.tier_boundaries;
    let tier = classify(score, boundaries, config.ambiguity_epsilon);
    let confidence = calibrate_confidence(score, boundaries);

    ScoringResult { score, agentic_score: dims.agentic, signals, tier, confidence }
}

fn estimate_token_count(text: &str) -> usize {
    text.len() / 4
}

fn length_score(tokens: usize, thresholds: &crate::config::TokenThresholds) -> f64 {
    if tokens < thresholds.short_upper {
        0.0
    } else if tokens > thresholds.long_lower {
        1.0
    } else {
        0.5
    }
}

/// Count keyword matches and map to a score: 0→0.0, 1→0.3, 2→0.6, 3+→1.0.
fn keyword_score(text: &str, keywords: &[&str], name: &str, signals: &mut Vec<String>) -> f64 {
    let count = keywords.iter().filter(|kw| text.contains(**kw)).count();
    if count > 0 {
        signals.push(format!("{name}:{count}"));
    }
    match count {
        0 => 0.0,
        1 => 0.3,
        2 => 0.6,
        _ => 1.0,
    }
}

fn multi_step_score(text: &str, signals: &mut Vec<String>) -> f64 {
    if MULTI_STEP_RE.is_match(text) {
        signals.push("multi_step".to_string());
        0.5
    } else {
        0.0
    }
}

fn question_complexity_score(text: &str, signals: &mut Vec<String>) -> f64 {
    let count = text.chars().filter(|c| *c == '?').count();
    if count > 3 {
        signals.push(format!("questions:{count}"));
        0.5
    } else {
        0.0
    }
}

/// Tiered agentic-intent scoring: 0→0.0, 1-2→0.2, 3→0.6, 4+→1.0.
fn score_agentic(text: &str, signals: &mut Vec<String>) -> (f64, usize) {
    let count = AGENTIC_KEYWORDS.iter().filter(|kw| text.contains(**kw)).count();
    let score = match count {
        0 => 0.0,
        1..=2 => 0.2,
        3 => 0.6,
        _ => 1.0,
    };
    let _ = signals;
    (score, count)
}

fn weighted_sum(d: &Dimensions, config: &ScoringConfig) -> f64 {
    let w = &config.weights;
    d.code * w.code
        + d.reasoning * w.reasoning
        + d.technical * w.technical
        + d.creative * w.creative
        - d.simple * w.simple
        + d.multi_step * w.multi_step
        + d.question_complexity * w.question_complexity
        + d.imperative * w.imperative
        + d.constraint * w.constraint
        + d.structured_output * w.structured_output
        + d.reference * w.reference
        + d.negation * w.negation
        + d.domain * w.domain
        + d.agentic * w.agentic
        + d.length * w.length
}

fn classify(
    score: f64,
    boundaries: &crate::config::TierBoundaries,
    epsilon: f64,
) -> Option<Tier> {
    let points = [
        (boundaries.simple_medium, Tier::Medium),
        (boundaries.medium_complex, Tier::Complex),
        (boundaries.complex_reasoning, Tier::Reasoning),
    ];
    for (boundary, _) in points {
        if (score - boundary).abs() <= epsilon {
            return None;
        }
    }
    Some(if score < boundaries.simple_medium {
        Tier::Simple
    } else if score < boundaries.medium_complex {
        Tier::Medium
    } else if score < boundaries.complex_reasoning {
        Tier::Complex
    } else {
        Tier::Reasoning
    })
}

/// Sigmoid confidence calibration based on distance from the nearest
/// boundary. Returns a value in `(0.5, 1.0)`.
fn calibrate_confidence(score: f64, boundaries: &crate::config::TierBoundaries) -> f64 {
    const STEEPNESS: f64 = 12.0;
    let points = [boundaries.simple_medium, boundaries.medium_complex, boundaries.complex_reasoning];
    let min_distance = points.iter().map(|b| (score - b).abs()).fold(f64::MAX, f64::min);
    1.0 / (1.0 + (-STEEPNESS * min_distance).exp())
}
