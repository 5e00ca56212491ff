//! Prompt-cache simulator. Emulates Anthropic's cache-stat usage fields
//! (`cache_creation_input_tokens` / `cache_read_input_tokens`) without any
//! real caching effect on upstream traffic: entries are content hashes plus
//! token estimates, expiry is a sliding window from last access, and
//! eviction is batched LRU with a token-count tiebreak.

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::models::{ClaudeRequest, ContentBlock, MessageContent, SystemPrompt};
use crate::tokenizer::TokenEstimator;

pub const MIN_TTL_SECS: u64 = 60;
pub const MAX_TTL_SECS: u64 = 604_800;
pub const MIN_ENTRIES: usize = 100;
pub const MAX_ENTRIES: usize = 100_000;

#[derive(Debug, Clone)]
struct CacheEntry {
    token_count: u32,
    #[allow(dead_code)]
    created_at: i64,
    last_accessed: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheOutcome {
    pub hit: bool,
    pub cache_creation_tokens: u32,
    pub cache_read_tokens: u32,
}

impl CacheOutcome {
    pub const NONE: CacheOutcome = CacheOutcome {
        hit: false,
        cache_creation_tokens: 0,
        cache_read_tokens: 0,
    };
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub total_requests: u64,
    pub hit_rate: f64,
}

pub struct PromptCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    ttl_secs: i64,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl PromptCache {
    pub fn new(ttl_secs: u64, max_entries: usize) -> Self {
        let ttl_secs = ttl_secs.clamp(MIN_TTL_SECS, MAX_TTL_SECS);
        let max_entries = max_entries.clamp(MIN_ENTRIES, MAX_ENTRIES);
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl_secs: ttl_secs as i64,
            max_entries,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn check(&self, key: &str, token_count: u32) -> CacheOutcome {
        self.check_at(key, token_count, chrono::Utc::now().timestamp())
    }

    fn check_at(&self, key: &str, token_count: u32, now: i64) -> CacheOutcome {
        let mut entries = self.entries.lock();
        entries.retain(|_, entry| now - entry.last_accessed <= self.ttl_secs);

        if let Some(entry) = entries.get_mut(key) {
            entry.last_accessed = now;
            let read = entry.token_count;
            self.hits.fetch_add(1, Ordering::Relaxed);
            return CacheOutcome {
                hit: true,
                cache_creation_tokens: 0,
                cache_read_tokens: read,
            };
        }

        if entries.len() >= self.max_entries {
            Self::evict_batch(&mut entries, self.max_entries);
        }
        entries.insert(
            key.to_string(),
            CacheEntry {
                token_count,
                created_at: now,
                last_accessed: now,
            },
        );
        self.misses.fetch_add(1, Ordering::Relaxed);
        CacheOutcome {
            hit: false,
            cache_creation_tokens: token_count,
            cache_read_tokens: 0,
        }
    }

    /// Evict ⌈max·10%⌉ entries in `(last_accessed, token_count)` order.
    fn evict_batch(entries: &mut HashMap<String, CacheEntry>, max_entries: usize) {
        let batch = (max_entries + 9) / 10;
        let mut ranked: Vec<(String, i64, u32)> = entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.last_accessed, entry.token_count))
            .collect();
        ranked.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.2.cmp(&b.2)));
        for (key, _, _) in ranked.into_iter().take(batch) {
            entries.remove(&key);
        }
    }

    /// Seed entries ahead of traffic. Does not count as hits or misses.
    pub fn prewarm(&self, estimator: &dyn TokenEstimator, contents: &[String]) {
        let now = chrono::Utc::now().timestamp();
        let mut entries = self.entries.lock();
        for content in contents {
            let key = hash_content(content);
            entries.entry(key).or_insert(CacheEntry {
                token_count: estimator.estimate(content),
                created_at: now,
                last_accessed: now,
            });
        }
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            entries: self.entries.lock().len(),
            hits,
            misses,
            total_requests: total,
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }
}

pub fn hash_content(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Build the cacheable prefix: system blocks and message content blocks
/// explicitly marked `cache_control: ephemeral`, in message order, plus the
/// tool definitions when any marker exists and tools are present. Returns
/// `None` when the request marks nothing cacheable.
pub fn extract_cacheable_content(request: &ClaudeRequest) -> Option<String> {
    let mut parts: Vec<String> = Vec::new();

    if let Some(SystemPrompt::Blocks(blocks)) = &request.system {
        for block in blocks {
            let ephemeral = block
                .cache_control
                .as_ref()
                .map(|c| c.is_ephemeral())
                .unwrap_or(false);
            if ephemeral && block.block_type == "text" && !block.text.is_empty() {
                parts.push(block.text.clone());
            }
        }
    }

    for message in &request.messages {
        if let MessageContent::Blocks(blocks) = &message.content {
            for block in blocks {
                match block {
                    ContentBlock::Text {
                        text,
                        cache_control: Some(control),
                    } if control.is_ephemeral() && !text.is_empty() => {
                        parts.push(text.clone());
                    }
                    ContentBlock::ToolUse {
                        name,
                        input,
                        cache_control: Some(control),
                        ..
                    } if control.is_ephemeral() => {
                        parts.push(format!("{}:{}", name, input));
                    }
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        cache_control: Some(control),
                        ..
                    } if control.is_ephemeral() => {
                        parts.push(format!("{}:{}", tool_use_id, content));
                    }
                    _ => {}
                }
            }
        }
    }

    if parts.is_empty() {
        return None;
    }

    if let Some(tools) = &request.tools {
        if !tools.is_empty() {
            if let Ok(serialized) = serde_json::to_string(tools) {
                parts.push(serialized);
            }
        }
    }

    Some(parts.join("\n"))
}

/// Key + estimated token count for the request's cacheable prefix.
pub fn cache_key_for(
    estimator: &dyn TokenEstimator,
    request: &ClaudeRequest,
) -> Option<(String, u32)> {
    let content = extract_cacheable_content(request)?;
    let tokens = estimator.estimate(&content);
    Some((hash_content(&content), tokens))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::HeuristicEstimator;
    use serde_json::json;

    #[test]
    fn miss_then_hit_reports_cache_stats() {
        let cache = PromptCache::new(60, 100);
        let miss = cache.check_at("abc", 40, 1_000);
        assert_eq!(
            miss,
            CacheOutcome {
                hit: false,
                cache_creation_tokens: 40,
                cache_read_tokens: 0
            }
        );
        // 30 seconds later, inside the TTL.
        let hit = cache.check_at("abc", 40, 1_030);
        assert_eq!(
            hit,
            CacheOutcome {
                hit: true,
                cache_creation_tokens: 0,
                cache_read_tokens: 40
            }
        );
    }

    #[test]
    fn sliding_ttl_survives_repeated_access() {
        let cache = PromptCache::new(60, 100);
        cache.check_at("k", 10, 0);
        // Each access inside the window pushes expiry forward.
        for t in [50, 100, 150, 200] {
            assert!(cache.check_at("k", 10, t).hit, "t={}", t);
        }
        // Gap larger than the TTL: entry is gone.
        assert!(!cache.check_at("k", 10, 290).hit);
    }

    #[test]
    fn eviction_takes_lru_batch_with_token_tiebreak() {
        let cache = PromptCache::new(3600, 100);
        // Fill to capacity; entry "old-small" is oldest with the smallest
        // token count, so it must be in the evicted batch.
        cache.check_at("old-small", 1, 0);
        cache.check_at("old-big", 100, 0);
        for i in 0..98 {
            cache.check_at(&format!("k{}", i), 10, 10 + i as i64);
        }
        assert_eq!(cache.stats().entries, 100);

        cache.check_at("overflow", 10, 1_000);
        let stats = cache.stats();
        // ⌈100·10%⌉ = 10 evicted, one inserted.
        assert_eq!(stats.entries, 91);
        // The two oldest went first, smallest token count leading.
        assert!(!cache.check_at("old-small", 1, 1_001).hit);
        assert!(!cache.check_at("old-big", 100, 1_002).hit);
    }

    #[test]
    fn stats_hit_rate_is_exact() {
        let cache = PromptCache::new(3600, 100);
        cache.check_at("a", 1, 0);
        cache.check_at("a", 1, 1);
        cache.check_at("a", 1, 2);
        cache.check_at("b", 1, 3);
        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.total_requests, 4);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn clamps_apply() {
        let cache = PromptCache::new(1, 5);
        assert_eq!(cache.ttl_secs, MIN_TTL_SECS as i64);
        assert_eq!(cache.max_entries, MIN_ENTRIES);
    }

    #[test]
    fn key_is_sha256_of_content() {
        // SHA-256("abc")
        assert_eq!(
            hash_content("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn cacheable_prefix_requires_markers() {
        let unmarked: ClaudeRequest = serde_json::from_value(json!({
            "model": "m",
            "system": "plain system",
            "messages": [{"role": "user", "content": "hello"}]
        }))
        .unwrap();
        assert!(extract_cacheable_content(&unmarked).is_none());

        let marked: ClaudeRequest = serde_json::from_value(json!({
            "model": "m",
            "system": [{"type": "text", "text": "big context", "cache_control": {"type": "ephemeral"}}],
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": "doc body", "cache_control": {"type": "ephemeral"}},
                {"type": "text", "text": "question"}
            ]}],
            "tools": [{"name": "t", "description": "d", "input_schema": {}}]
        }))
        .unwrap();
        let content = extract_cacheable_content(&marked).unwrap();
        assert!(content.contains("big context"));
        assert!(content.contains("doc body"));
        assert!(!content.contains("question"));
        assert!(content.contains("input_schema"));
    }

    #[test]
    fn key_is_deterministic_for_identical_content() {
        let request: ClaudeRequest = serde_json::from_value(json!({
            "model": "m",
            "system": [{"type": "text", "text": "ctx", "cache_control": {"type": "ephemeral"}}],
            "messages": []
        }))
        .unwrap();
        let estimator = HeuristicEstimator;
        let (k1, t1) = cache_key_for(&estimator, &request).unwrap();
        let (k2, t2) = cache_key_for(&estimator, &request).unwrap();
        assert_eq!(k1, k2);
        assert_eq!(t1, t2);
        assert_eq!(k1, hash_content("ctx"));
    }

    #[test]
    fn prewarm_seeds_without_touching_counters() {
        let cache = PromptCache::new(3600, 100);
        let estimator = HeuristicEstimator;
        cache.prewarm(&estimator, &["warm content".to_string()]);
        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.total_requests, 0);
        assert!(cache.check(&hash_content("warm content"), 3).hit);
    }
}
