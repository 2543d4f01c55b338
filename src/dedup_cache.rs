//! Dedup cache — coalesces concurrent identical requests into one upstream
//! dispatch.
//!
//! Grounded on the teacher's `dashmap::DashMap`-backed `RateLimiter` for the
//! concurrent-map shape (one entry per key, non-blocking access) and
//! `traffic::TrafficLog`'s mutex-guarded bookkeeping for prune/notify.
//! Waiter fan-out uses one `tokio::sync::broadcast::Sender` per
//! [`InflightEntry`], closed after a single broadcast.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;

use crate::config::DedupConfig;
use crate::error::ProxyError;

/// A completed upstream response, cached for replay to later identical
/// requests within the TTL window.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub completed_at: Instant,
}

struct InflightEntry {
    sender: broadcast::Sender<Result<CachedResponse, String>>,
}

pub struct DedupCache {
    completed: DashMap<String, CachedResponse>,
    inflight: DashMap<String, InflightEntry>,
    config: DedupConfig,
}

impl DedupCache {
    pub fn new(config: DedupConfig) -> Self {
        Self { completed: DashMap::new(), inflight: DashMap::new(), config }
    }

    /// SHA-256-derived 16-hex-char key over the canonicalized request body.
    pub fn key_for(body: &[u8]) -> String {
        let canonical = canonicalize(body);
        let digest = Sha256::digest(&canonical);
        digest.iter().take(8).map(|b| format!("{b:02x}")).collect()
    }

    /// Return a cached response if present and still within TTL; lazily
    /// evicts an expired entry on miss.
    pub fn get_cached(&self, key: &str) -> Option<CachedResponse> {
        let expired = match self.completed.get(key) {
            Some(entry) => entry.completed_at.elapsed() > Duration::from_secs(self.config.ttl_secs),
            None => return None,
        };
        if expired {
            self.completed.remove(key);
            None
        } else {
            self.completed.get(key).map(|e| e.clone())
        }
    }

    /// Subscribe to an in-flight request's eventual resolution, if one
    /// exists for `key`.
    pub fn get_inflight(&self, key: &str) -> Option<broadcast::Receiver<Result<CachedResponse, String>>> {
        self.inflight.get(key).map(|entry| entry.sender.subscribe())
    }

    /// Register this key as in-flight. Caller must eventually call
    /// [`Self::complete`] or [`Self::remove_inflight`].
    pub fn mark_inflight(&self, key: &str) {
        let (sender, _) = broadcast::channel(1);
        self.inflight.insert(key.to_string(), InflightEntry { sender });
    }

    /// Complete an in-flight request: cache the response (if within size
    /// limits), wake every waiter, and prune expired entries.
    pub fn complete(&self, key: &str, response: CachedResponse) {
        if response.body.len() <= self.config.max_body_size {
            self.completed.insert(key.to_string(), response.clone());
        }
        if let Some((_, entry)) = self.inflight.remove(key) {
            let _ = entry.sender.send(Ok(response));
        }
        self.prune();
    }

    /// Resolve every waiter with a synthetic origin-failure response;
    /// never caches the failure.
    pub fn remove_inflight(&self, key: &str) {
        if let Some((_, entry)) = self.inflight.remove(key) {
            let err = ProxyError::new(
                crate::error::ErrorKind::DedupOriginFailed,
                "Original request failed, please retry",
            );
            let _ = entry.sender.send(Err(err.to_json().to_string()));
        }
    }

    /// Drop expired completed entries.
    pub fn prune(&self) {
        let ttl = Duration::from_secs(self.config.ttl_secs);
        self.completed.retain(|_, entry| entry.completed_at.elapsed() <= ttl);
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }
}

/// Shared handle, matching the teacher's `Arc<RateLimiter>` style.
pub type SharedDedupCache = Arc<DedupCache>;

/// Canonicalize a request body for hashing: parse as JSON, strip a leading
/// timestamp marker from any `content` string field, recursively sort
/// object keys, re-serialize. Falls back to raw bytes on parse failure.
fn canonicalize(body: &[u8]) -> Vec<u8> {
    let Ok(text) = std::str::from_utf8(body) else { return body.to_vec() };
    let Ok(mut value) = serde_json::from_str::<Value>(text) else { return body.to_vec() };
    strip_timestamps(&mut value);
    let sorted = sort_keys(&value);
    serde_json::to_vec(&sorted).unwrap_or_else(|_| body.to_vec())
}

static TIMESTAMP_RE: std::sync::LazyLock<regex::Regex> = std::sync::LazyLock::new(|| {
    regex::Regex::new(r"^\[\w{3}\s+\d{4}-\d{2}-\d{2}\s+\d{2}:\d{2}\s+\w+\]\s*").unwrap()
});

fn strip_timestamps(value: &mut Value) {
    match value {
        Value::String(s) => {
            if let Some(m) = TIMESTAMP_RE.find(s) {
                *s = s[m.end()..].to_string();
            }
        }
        Value::Array(items) => items.iter_mut().for_each(strip_timestamps),
        Value::Object(map) => map.values_mut().for_each(strip_timestamps),
        _ => {}
    }
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted = serde_json::Map::new();
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                sorted.insert(key.clone(), sort_keys(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}
