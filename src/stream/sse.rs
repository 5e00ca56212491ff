//! Claude SSE event construction shared by every adapter. Adapters own the
//! event ordering; the `BlockTracker` hands out monotonic content-block
//! indices and keeps start/stop pairs balanced.

use bytes::Bytes;
use serde_json::{json, Value};

pub fn sse_event(event_type: &str, data: &Value) -> Bytes {
    let payload = serde_json::to_string(data).unwrap_or_default();
    Bytes::from(format!("event: {}\ndata: {}\n\n", event_type, payload))
}

pub fn message_start(
    message_id: &str,
    model: &str,
    input_tokens: i64,
    cache_creation_tokens: i64,
    cache_read_tokens: i64,
) -> Bytes {
    sse_event(
        "message_start",
        &json!({
            "type": "message_start",
            "message": {
                "id": message_id,
                "type": "message",
                "role": "assistant",
                "content": [],
                "model": model,
                "stop_reason": null,
                "stop_sequence": null,
                "usage": {
                    "input_tokens": input_tokens,
                    "output_tokens": 0,
                    "cache_creation_input_tokens": cache_creation_tokens,
                    "cache_read_input_tokens": cache_read_tokens,
                }
            }
        }),
    )
}

pub fn ping() -> Bytes {
    sse_event("ping", &json!({"type": "ping"}))
}

pub fn text_delta(index: u64, text: &str) -> Bytes {
    sse_event(
        "content_block_delta",
        &json!({
            "type": "content_block_delta",
            "index": index,
            "delta": {"type": "text_delta", "text": text},
        }),
    )
}

pub fn thinking_delta(index: u64, thinking: &str) -> Bytes {
    sse_event(
        "content_block_delta",
        &json!({
            "type": "content_block_delta",
            "index": index,
            "delta": {"type": "thinking_delta", "thinking": thinking},
        }),
    )
}

pub fn signature_delta(index: u64, signature: &str) -> Bytes {
    sse_event(
        "content_block_delta",
        &json!({
            "type": "content_block_delta",
            "index": index,
            "delta": {"type": "signature_delta", "signature": signature},
        }),
    )
}

pub fn input_json_delta(index: u64, partial_json: &str) -> Bytes {
    sse_event(
        "content_block_delta",
        &json!({
            "type": "content_block_delta",
            "index": index,
            "delta": {"type": "input_json_delta", "partial_json": partial_json},
        }),
    )
}

pub fn message_delta(
    stop_reason: &str,
    input_tokens: i64,
    output_tokens: i64,
    cache_creation_tokens: i64,
    cache_read_tokens: i64,
) -> Bytes {
    sse_event(
        "message_delta",
        &json!({
            "type": "message_delta",
            "delta": {"stop_reason": stop_reason, "stop_sequence": null},
            "usage": {
                "input_tokens": input_tokens,
                "output_tokens": output_tokens,
                "cache_creation_input_tokens": cache_creation_tokens,
                "cache_read_input_tokens": cache_read_tokens,
            }
        }),
    )
}

pub fn message_stop() -> Bytes {
    sse_event("message_stop", &json!({"type": "message_stop"}))
}

pub fn error_event(error_type: &str, message: &str) -> Bytes {
    sse_event(
        "error",
        &json!({
            "type": "error",
            "error": {"type": error_type, "message": message},
        }),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Text,
    Thinking,
    Tool,
}

/// Index allocator + open/close bookkeeping for content blocks. Indices are
/// strictly monotonic per message.
#[derive(Debug)]
pub struct BlockTracker {
    next_index: u64,
    open: Option<(u64, BlockKind)>,
}

impl BlockTracker {
    pub fn new() -> Self {
        Self {
            next_index: 0,
            open: None,
        }
    }

    pub fn open_kind(&self) -> Option<BlockKind> {
        self.open.map(|(_, kind)| kind)
    }

    pub fn open_index(&self) -> Option<u64> {
        self.open.map(|(index, _)| index)
    }

    /// Open a new block, emitting the stop for any block still open.
    pub fn open_block(&mut self, kind: BlockKind, content_block: Value, out: &mut Vec<Bytes>) -> u64 {
        self.close_block(out);
        let index = self.next_index;
        self.next_index += 1;
        self.open = Some((index, kind));
        out.push(sse_event(
            "content_block_start",
            &json!({
                "type": "content_block_start",
                "index": index,
                "content_block": content_block,
            }),
        ));
        index
    }

    pub fn open_text(&mut self, out: &mut Vec<Bytes>) -> u64 {
        self.open_block(BlockKind::Text, json!({"type": "text", "text": ""}), out)
    }

    pub fn open_thinking(&mut self, out: &mut Vec<Bytes>) -> u64 {
        self.open_block(
            BlockKind::Thinking,
            json!({"type": "thinking", "thinking": ""}),
            out,
        )
    }

    pub fn open_tool(&mut self, id: &str, name: &str, out: &mut Vec<Bytes>) -> u64 {
        self.open_block(
            BlockKind::Tool,
            json!({"type": "tool_use", "id": id, "name": name, "input": {}}),
            out,
        )
    }

    /// Text delta into the current text block, opening one if needed.
    pub fn text(&mut self, content: &str, out: &mut Vec<Bytes>) {
        let index = match self.open {
            Some((index, BlockKind::Text)) => index,
            _ => self.open_text(out),
        };
        out.push(text_delta(index, content));
    }

    pub fn thinking(&mut self, content: &str, out: &mut Vec<Bytes>) {
        let index = match self.open {
            Some((index, BlockKind::Thinking)) => index,
            _ => self.open_thinking(out),
        };
        out.push(thinking_delta(index, content));
    }

    pub fn close_block(&mut self, out: &mut Vec<Bytes>) {
        if let Some((index, _)) = self.open.take() {
            out.push(sse_event(
                "content_block_stop",
                &json!({"type": "content_block_stop", "index": index}),
            ));
        }
    }
}

impl Default for BlockTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events_of(chunks: &[Bytes]) -> Vec<String> {
        chunks
            .iter()
            .filter_map(|b| {
                let text = String::from_utf8_lossy(b);
                text.lines()
                    .find(|l| l.starts_with("event: "))
                    .map(|l| l.trim_start_matches("event: ").to_string())
            })
            .collect()
    }

    #[test]
    fn tracker_indices_are_monotonic_and_balanced() {
        let mut tracker = BlockTracker::new();
        let mut out = Vec::new();
        tracker.text("a", &mut out);
        tracker.thinking("b", &mut out);
        tracker.open_tool("t1", "f", &mut out);
        tracker.close_block(&mut out);

        assert_eq!(
            events_of(&out),
            vec![
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "content_block_start",
                "content_block_stop",
            ]
        );
        // Three blocks were opened: indices 0, 1, 2.
        assert_eq!(tracker.next_index, 3);
        assert!(tracker.open_kind().is_none());
    }

    #[test]
    fn consecutive_text_deltas_share_one_block() {
        let mut tracker = BlockTracker::new();
        let mut out = Vec::new();
        tracker.text("a", &mut out);
        tracker.text("b", &mut out);
        tracker.close_block(&mut out);
        let starts = events_of(&out)
            .iter()
            .filter(|e| *e == "content_block_start")
            .count();
        assert_eq!(starts, 1);
    }

    #[test]
    fn message_start_carries_cache_stats() {
        let chunk = message_start("msg_1", "claude-sonnet-4-5", 100, 40, 0);
        let text = String::from_utf8_lossy(&chunk);
        let data: Value =
            serde_json::from_str(text.lines().nth(1).unwrap().trim_start_matches("data: "))
                .unwrap();
        assert_eq!(data["message"]["usage"]["cache_creation_input_tokens"], 40);
        assert_eq!(data["message"]["usage"]["input_tokens"], 100);
    }
}
