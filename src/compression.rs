//! Request-body compression pipeline.
//!
//! Transforms a list of [`NormalizedMessage`] into an equivalent-meaning
//! list plus optional codebook headers prepended to the first user
//! message. Each layer is a free function returning `(messages, LayerReport)`
//! so [`CompressionPipeline::run`] can thread the list through whichever
//! layers are enabled in [`CompressionConfig`], in order. Every layer's
//! regex is a `LazyLock` static compiled once, the same pattern the scorer
//! uses for its multi-step detector.

use std::collections::HashMap;
use std::sync::LazyLock;

use md5::{Digest, Md5};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::CompressionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// An assistant-issued tool call, normalized to flat fields for the
/// compression layers. Serializes/deserializes through [`WireToolCall`] so
/// the wire shape stays the OpenAI `{id, type, function: {name, arguments}}`
/// nesting regardless of this crate's internal field layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "WireToolCall", into = "WireToolCall")]
pub struct ToolCall {
    pub id: String,
    pub function_name: String,
    pub arguments_json: String,
}

/// OpenAI chat-completions wire shape for a single tool call:
/// `{ "id": "...", "type": "function", "function": { "name": "...", "arguments": "..." } }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(default = "wire_tool_call_type", rename = "type")]
    kind: String,
    function: WireFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireFunction {
    name: String,
    arguments: String,
}

fn wire_tool_call_type() -> String {
    "function".to_string()
}

impl From<WireToolCall> for ToolCall {
    fn from(wire: WireToolCall) -> Self {
        Self { id: wire.id, function_name: wire.function.name, arguments_json: wire.function.arguments }
    }
}

impl From<ToolCall> for WireToolCall {
    fn from(tc: ToolCall) -> Self {
        Self {
            id: tc.id,
            kind: wire_tool_call_type(),
            function: WireFunction { name: tc.function_name, arguments: tc.arguments_json },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedMessage {
    pub role: Role,
    pub content: Option<String>,
    #[serde(default)]
    pub tool_call_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

/// Per-layer bookkeeping: bytes/characters saved and an optional header
/// fragment to prepend to the first user message.
#[derive(Debug, Clone, Default)]
pub struct LayerReport {
    pub name: &'static str,
    pub chars_saved: usize,
    pub header: Option<String>,
}

/// Total result of running the pipeline.
#[derive(Debug, Clone, Default)]
pub struct CompressionReport {
    pub layers: Vec<LayerReport>,
}

impl CompressionReport {
    pub fn total_chars_saved(&self) -> usize {
        self.layers.iter().map(|l| l.chars_saved).sum()
    }
}

/// Skip the whole pipeline when total content is under this size.
pub fn should_compress(messages: &[NormalizedMessage], config: &CompressionConfig) -> bool {
    let total: usize = messages.iter().filter_map(|m| m.content.as_ref()).map(|c| c.len()).sum();
    total >= config.should_compress_bytes
}

pub struct CompressionPipeline;

impl CompressionPipeline {
    /// Run every layer enabled in `config`, in spec order, and prepend any
    /// accumulated codebook headers to the first user message.
    pub fn run(
        mut messages: Vec<NormalizedMessage>,
        config: &CompressionConfig,
    ) -> (Vec<NormalizedMessage>, CompressionReport) {
        let mut report = CompressionReport::default();

        if config.dedup_layer {
            let (m, r) = dedup_layer(messages);
            messages = m;
            report.layers.push(r);
        }
        if config.whitespace_layer {
            let (m, r) = whitespace_layer(messages);
            messages = m;
            report.layers.push(r);
        }
        if config.static_dictionary_layer {
            let (m, r) = static_dictionary_layer(messages);
            messages = m;
            report.layers.push(r);
        }
        if config.path_prefix_layer {
            let (m, r) = path_prefix_layer(messages);
            messages = m;
            report.layers.push(r);
        }
        if config.json_compact_layer {
            let (m, r) = json_compact_layer(messages);
            messages = m;
            report.layers.push(r);
        }
        if config.tool_observation_layer {
            let (m, r) = tool_observation_layer(messages, config.tool_observation_threshold);
            messages = m;
            report.layers.push(r);
        }
        if config.dynamic_codebook_layer {
            let (m, r) = dynamic_codebook_layer(messages);
            messages = m;
            report.layers.push(r);
        }

        let headers: Vec<String> = report.layers.iter().filter_map(|l| l.header.clone()).collect();
        if !headers.is_empty() {
            prepend_headers(&mut messages, &headers);
        }

        (messages, report)
    }
}

fn prepend_headers(messages: &mut [NormalizedMessage], headers: &[String]) {
    if let Some(first_user) = messages.iter_mut().find(|m| m.role == Role::User) {
        let block = headers.join("\n");
        first_user.content = Some(match &first_user.content {
            Some(existing) => format!("{block}\n{existing}"),
            None => block,
        });
    }
}

/// Message indices whose `toolCalls` are referenced by a later `tool`
/// message — these assistant messages are never eligible for dedup since
/// removing them would orphan the `tool` reply that follows.
fn referenced_tool_call_indices(messages: &[NormalizedMessage]) -> std::collections::HashSet<usize> {
    let referenced_ids: std::collections::HashSet<&str> = messages
        .iter()
        .filter(|m| m.role == Role::Tool)
        .filter_map(|m| m.tool_call_id.as_deref())
        .collect();

    messages
        .iter()
        .enumerate()
        .filter(|(_, m)| {
            m.role == Role::Assistant && m.tool_calls.iter().any(|tc| referenced_ids.contains(tc.id.as_str()))
        })
        .map(|(i, _)| i)
        .collect()
}

/// Hashes role + content + tool_call_id + name only — deliberately excludes
/// `tool_calls` so a later plain-text restatement of an earlier tool-call
/// response still hashes equal to it and gets deduped. Messages whose own
/// tool calls are referenced downstream are protected from removal by the
/// caller regardless of this hash.
fn message_hash(m: &NormalizedMessage) -> String {
    let mut hasher = Md5::new();
    hasher.update(format!("{:?}", m.role));
    hasher.update(m.content.as_deref().unwrap_or(""));
    hasher.update(m.tool_call_id.as_deref().unwrap_or(""));
    hasher.update(m.name.as_deref().unwrap_or(""));
    format!("{:x}", hasher.finalize())
}

/// Layer 1 — dedup identical assistant messages by MD5 hash, skipping any
/// assistant message whose tool calls are still referenced downstream.
fn dedup_layer(messages: Vec<NormalizedMessage>) -> (Vec<NormalizedMessage>, LayerReport) {
    let protected = referenced_tool_call_indices(&messages);
    let mut seen_hashes = std::collections::HashSet::new();
    let mut removed_chars = 0usize;
    let mut out = Vec::with_capacity(messages.len());

    for (i, m) in messages.into_iter().enumerate() {
        if m.role != Role::Assistant {
            out.push(m);
            continue;
        }
        let hash = message_hash(&m);
        if protected.contains(&i) {
            seen_hashes.insert(hash);
            out.push(m);
            continue;
        }
        if seen_hashes.contains(&hash) {
            removed_chars += m.content.as_ref().map(String::len).unwrap_or(0);
            continue;
        }
        seen_hashes.insert(hash);
        out.push(m);
    }

    (out, LayerReport { name: "dedup", chars_saved: removed_chars, header: None })
}

static LEADING_SPACES_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^( {8,})").unwrap());
static INTERIOR_SPACES_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^\S\n]{2,}").unwrap());
static MULTI_NEWLINE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());

/// Layer 2 — whitespace normalization.
fn whitespace_layer(messages: Vec<NormalizedMessage>) -> (Vec<NormalizedMessage>, LayerReport) {
    let mut saved = 0usize;
    let out = messages
        .into_iter()
        .map(|mut m| {
            if let Some(content) = m.content.take() {
                let before = content.len();
                let normalized = normalize_whitespace(&content);
                saved += before.saturating_sub(normalized.len());
                m.content = Some(normalized);
            }
            m
        })
        .collect();
    (out, LayerReport { name: "whitespace", chars_saved: saved, header: None })
}

fn normalize_whitespace(content: &str) -> String {
    let unified = content.replace("\r\n", "\n").replace('\r', "\n");
    let capped = MULTI_NEWLINE_RE.replace_all(&unified, "\n\n");
    let lines: Vec<String> = capped
        .lines()
        .map(|line| {
            let expanded = line.replace('\t', "  ");
            let indent_normalized = LEADING_SPACES_RE
                .replace(&expanded, |caps: &regex::Captures| {
                    let spaces = caps[1].len();
                    "  ".repeat((spaces / 4).max(1))
                })
                .to_string();
            let collapsed = INTERIOR_SPACES_RE.replace_all(&indent_normalized, " ");
            collapsed.trim_end().to_string()
        })
        .collect();
    lines.join("\n").trim().to_string()
}

/// Layer 3 — static dictionary substitution.
fn static_dictionary_layer(messages: Vec<NormalizedMessage>) -> (Vec<NormalizedMessage>, LayerReport) {
    let mut dictionary: Vec<(&str, &str)> = STATIC_DICTIONARY.to_vec();
    dictionary.sort_by_key(|(_, phrase)| std::cmp::Reverse(phrase.len()));

    let mut used: Vec<(&str, &str)> = Vec::new();
    let mut saved = 0usize;

    let out = messages
        .into_iter()
        .map(|mut m| {
            if let Some(content) = m.content.take() {
                let mut new_content = content.clone();
                for (code, phrase) in &dictionary {
                    if new_content.contains(phrase) {
                        let before = new_content.len();
                        new_content = new_content.replace(phrase, code);
                        saved += before.saturating_sub(new_content.len());
                        if !used.iter().any(|(c, _)| c == code) {
                            used.push((code, phrase));
                        }
                    }
                }
                m.content = Some(new_content);
            }
            m
        })
        .collect();

    let header = (!used.is_empty()).then(|| {
        let entries: Vec<String> = used.iter().map(|(c, p)| format!("{c}={p}")).collect();
        format!("[Dict: {}]", entries.join(", "))
    });

    (out, LayerReport { name: "static_dictionary", chars_saved: saved, header })
}

const STATIC_DICTIONARY: &[(&str, &str)] = &[
    ("$C1", "I understand you want me to"),
    ("$C2", "Based on the information provided"),
    ("$C3", "Please let me know if you have any questions"),
    ("$C4", "Here is a summary of the changes"),
];

static PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:/[\w.\-]+){3,}").unwrap());

/// Layer 4 — path-prefix shortening.
fn path_prefix_layer(messages: Vec<NormalizedMessage>) -> (Vec<NormalizedMessage>, LayerReport) {
    let all_content: Vec<&str> = messages.iter().filter_map(|m| m.content.as_deref()).collect();
    let combined = all_content.join("\n");

    let mut prefix_counts: HashMap<String, usize> = HashMap::new();
    for m in PATH_RE.find_iter(&combined) {
        let path = m.as_str();
        let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        for len in 2..parts.len() {
            let prefix = format!("/{}", parts[..len].join("/"));
            *prefix_counts.entry(prefix).or_insert(0) += 1;
        }
    }

    let mut candidates: Vec<(String, usize)> =
        prefix_counts.into_iter().filter(|(_, count)| *count >= 3).collect();
    candidates.sort_by_key(|(prefix, count)| (std::cmp::Reverse(*count), std::cmp::Reverse(prefix.len())));
    candidates.truncate(5);

    let codes: Vec<(String, String)> = candidates
        .into_iter()
        .enumerate()
        .map(|(i, (prefix, _))| (format!("$P{}", i + 1), prefix))
        .collect();

    let mut saved = 0usize;
    let out = messages
        .into_iter()
        .map(|mut m| {
            if let Some(content) = m.content.take() {
                let mut new_content = content.clone();
                for (code, prefix) in &codes {
                    let replacement = format!("{code}/");
                    let needle = format!("{prefix}/");
                    if new_content.contains(&needle) {
                        let before = new_content.len();
                        new_content = new_content.replace(&needle, &replacement);
                        saved += before.saturating_sub(new_content.len());
                    }
                }
                m.content = Some(new_content);
            }
            m
        })
        .collect();

    let header = (!codes.is_empty()).then(|| {
        let entries: Vec<String> = codes.iter().map(|(c, p)| format!("{c}={p}/")).collect();
        format!("[Paths: {}]", entries.join(", "))
    });

    (out, LayerReport { name: "path_prefix", chars_saved: saved, header })
}

/// Layer 5 — JSON compaction of tool call arguments and tool-message bodies.
fn json_compact_layer(messages: Vec<NormalizedMessage>) -> (Vec<NormalizedMessage>, LayerReport) {
    let mut saved = 0usize;
    let out = messages
        .into_iter()
        .map(|mut m| {
            for tc in &mut m.tool_calls {
                if let Some(minified) = minify_json(&tc.arguments_json) {
                    saved += tc.arguments_json.len().saturating_sub(minified.len());
                    tc.arguments_json = minified;
                }
            }
            if m.role == Role::Tool {
                if let Some(content) = m.content.take() {
                    let trimmed = content.trim();
                    let looks_like_json = (trimmed.starts_with('{') && trimmed.ends_with('}'))
                        || (trimmed.starts_with('[') && trimmed.ends_with(']'));
                    if looks_like_json {
                        if let Some(minified) = minify_json(trimmed) {
                            saved += content.len().saturating_sub(minified.len());
                            m.content = Some(minified);
                        } else {
                            m.content = Some(content);
                        }
                    } else {
                        m.content = Some(content);
                    }
                }
            }
            m
        })
        .collect();
    (out, LayerReport { name: "json_compact", chars_saved: saved, header: None })
}

fn minify_json(raw: &str) -> Option<String> {
    serde_json::from_str::<Value>(raw).ok().and_then(|v| serde_json::to_string(&v).ok())
}

static OBSERVATION_ERROR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)error|exception|failed|traceback|invalid").unwrap());
static OBSERVATION_STATUS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)success|complete|found|passed|ok\b").unwrap());
static KV_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""(id|name|status|error|message|count|total|url|path)"\s*:\s*"?([^",}\n]+)"?"#).unwrap()
});

/// Layer 6 — approximate tool-observation summarization, plus cross-message
/// dedup of large blocks whose first 200 bytes repeat.
fn tool_observation_layer(
    messages: Vec<NormalizedMessage>,
    threshold: usize,
) -> (Vec<NormalizedMessage>, LayerReport) {
    let mut seen_prefixes: HashMap<String, usize> = HashMap::new();
    let mut saved = 0usize;
    let mut out = Vec::with_capacity(messages.len());

    for (idx, mut m) in messages.into_iter().enumerate() {
        if m.role != Role::Tool {
            out.push(m);
            continue;
        }
        let Some(content) = m.content.take() else {
            out.push(m);
            continue;
        };
        if content.len() <= threshold {
            m.content = Some(content);
            out.push(m);
            continue;
        }

        let prefix: String = content.chars().take(200).collect();
        if let Some(&first_idx) = seen_prefixes.get(&prefix) {
            let replacement = format!("[See message #{first_idx} — same content]");
            saved += content.len().saturating_sub(replacement.len());
            m.content = Some(replacement);
            out.push(m);
            continue;
        }
        seen_prefixes.insert(prefix, idx);

        let summary = summarize_observation(&content);
        saved += content.len().saturating_sub(summary.len());
        m.content = Some(summary);
        out.push(m);
    }

    (out, LayerReport { name: "tool_observation", chars_saved: saved, header: None })
}

fn summarize_observation(content: &str) -> String {
    let mut parts: Vec<String> = Vec::new();

    let error_lines: Vec<&str> =
        content.lines().filter(|l| OBSERVATION_ERROR_RE.is_match(l)).take(3).collect();
    parts.extend(error_lines.iter().map(|s| s.to_string()));

    let status_lines: Vec<&str> =
        content.lines().filter(|l| OBSERVATION_STATUS_RE.is_match(l)).take(3).collect();
    parts.extend(status_lines.iter().map(|s| s.to_string()));

    for caps in KV_RE.captures_iter(content).take(5) {
        parts.push(format!("{}={}", &caps[1], &caps[2]));
    }

    if parts.is_empty() {
        let lines: Vec<&str> = content.lines().collect();
        if let (Some(first), Some(last)) = (lines.first(), lines.last()) {
            let marker = format!("[...{} lines...]", lines.len().saturating_sub(2));
            parts.push(format!("{first}\n{marker}\n{last}"));
        }
    }

    let mut summary = parts.join(" | ");
    summary.truncate(300);
    summary
}

static SENTENCE_SPLIT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[.\n]").unwrap());

/// Layer 7 — dynamic codebook of frequently repeated phrases.
fn dynamic_codebook_layer(messages: Vec<NormalizedMessage>) -> (Vec<NormalizedMessage>, LayerReport) {
    let combined: String = messages
        .iter()
        .filter_map(|m| m.content.as_deref())
        .collect::<Vec<_>>()
        .join("\n");

    let mut counts: HashMap<String, usize> = HashMap::new();
    for phrase in SENTENCE_SPLIT_RE.split(&combined) {
        let trimmed = phrase.trim();
        if trimmed.len() >= 20 && trimmed.len() <= 200 {
            *counts.entry(trimmed.to_string()).or_insert(0) += 1;
        }
    }

    let mut scored: Vec<(String, usize, i64)> = counts
        .into_iter()
        .filter(|(_, count)| *count >= 3)
        .map(|(phrase, count)| {
            let score = (phrase.len() as i64 - 4) * count as i64;
            (phrase, count, score)
        })
        .filter(|(phrase, count, _)| (phrase.len() as i64 - 4) * (*count as i64 - 1) > 50)
        .collect();
    scored.sort_by_key(|(_, _, score)| std::cmp::Reverse(*score));
    scored.truncate(100);
    scored.sort_by_key(|(phrase, _, _)| std::cmp::Reverse(phrase.len()));

    let codes: Vec<(String, String)> = scored
        .into_iter()
        .enumerate()
        .map(|(i, (phrase, _, _))| (format!("$D{:02}", i + 1), phrase))
        .collect();

    let mut saved = 0usize;
    let out = messages
        .into_iter()
        .map(|mut m| {
            if let Some(content) = m.content.take() {
                let mut new_content = content.clone();
                for (code, phrase) in &codes {
                    if new_content.contains(phrase.as_str()) {
                        let before = new_content.len();
                        new_content = new_content.replace(phrase.as_str(), code);
                        saved += before.saturating_sub(new_content.len());
                    }
                }
                m.content = Some(new_content);
            }
            m
        })
        .collect();

    let header = (!codes.is_empty()).then(|| {
        let entries: Vec<String> = codes
            .iter()
            .take(20)
            .map(|(c, p)| {
                let truncated: String = p.chars().take(40).collect();
                format!("{c}={truncated}")
            })
            .collect();
        format!("[DynDict: {}]", entries.join(", "))
    });

    (out, LayerReport { name: "dynamic_codebook", chars_saved: saved, header })
}
