//! Approximate token estimation. Upstreams all tokenize differently; the
//! numbers produced here are advisory (usage rows, cache stats, input
//! validation) and make no bit-equality claim against upstream billing.

use crate::models::{ClaudeRequest, ContentBlock, MessageContent};

pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> u32;
}

/// Character-ratio estimator: ASCII averages ~4 chars/token, CJK closer to
/// one token per character.
#[derive(Debug, Default)]
pub struct HeuristicEstimator;

impl TokenEstimator for HeuristicEstimator {
    fn estimate(&self, text: &str) -> u32 {
        if text.is_empty() {
            return 0;
        }
        let mut ascii = 0u64;
        let mut wide = 0u64;
        for ch in text.chars() {
            if ch.is_ascii() {
                ascii += 1;
            } else {
                wide += 1;
            }
        }
        let estimate = ascii / 4 + wide;
        estimate.max(1) as u32
    }
}

/// Ingress input-token rule: system text + every message text + serialized
/// tool list through the estimator.
pub fn estimate_request_input(estimator: &dyn TokenEstimator, request: &ClaudeRequest) -> u32 {
    let mut total = estimator.estimate(&request.system_text());
    for message in &request.messages {
        match &message.content {
            MessageContent::Text(text) => total += estimator.estimate(text),
            MessageContent::Blocks(blocks) => {
                for block in blocks {
                    match block {
                        ContentBlock::Text { text, .. } => total += estimator.estimate(text),
                        ContentBlock::Thinking { thinking, .. } => {
                            total += estimator.estimate(thinking)
                        }
                        ContentBlock::ToolUse { input, .. } => {
                            total += estimator.estimate(&input.to_string())
                        }
                        ContentBlock::ToolResult { content, .. } => {
                            total += estimator.estimate(&crate::models::tool_result_text(content))
                        }
                        _ => {}
                    }
                }
            }
        }
    }
    if let Some(tools) = &request.tools {
        if !tools.is_empty() {
            if let Ok(serialized) = serde_json::to_string(tools) {
                total += estimator.estimate(&serialized);
            }
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_text_is_zero() {
        assert_eq!(HeuristicEstimator.estimate(""), 0);
    }

    #[test]
    fn short_text_is_at_least_one() {
        assert_eq!(HeuristicEstimator.estimate("ab"), 1);
    }

    #[test]
    fn wide_chars_count_heavier() {
        let ascii = HeuristicEstimator.estimate("hello world, how are you");
        let cjk = HeuristicEstimator.estimate("你好世界你好世界你好世界");
        assert!(cjk > ascii);
    }

    #[test]
    fn request_estimate_includes_tools() {
        let bare: ClaudeRequest = serde_json::from_value(json!({
            "model": "m",
            "messages": [{"role": "user", "content": "tell me about rust"}]
        }))
        .unwrap();
        let with_tools: ClaudeRequest = serde_json::from_value(json!({
            "model": "m",
            "messages": [{"role": "user", "content": "tell me about rust"}],
            "tools": [{"name": "search", "description": "search the web for a query string",
                       "input_schema": {"type": "object", "properties": {"q": {"type": "string"}}}}]
        }))
        .unwrap();
        let estimator = HeuristicEstimator;
        assert!(
            estimate_request_input(&estimator, &with_tools)
                > estimate_request_input(&estimator, &bare)
        );
    }
}
