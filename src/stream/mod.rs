//! Upstream → Claude SSE stream adapters. Every adapter yields the same
//! well-formed event sequence (`message_start`, content blocks, a final
//! `message_delta` with usage, `message_stop`) and interleaves `ping`
//! events after at most 15 seconds of upstream silence.

pub mod amazonq;
pub mod event_stream;
pub mod gemini;
pub mod openai;
pub mod passthrough;
pub mod sse;
pub mod thinking;

use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

pub type UpstreamByteStream =
    Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;
pub type ClaudeSseStream = Pin<Box<dyn Stream<Item = Result<Bytes, String>> + Send>>;

/// Per-request framing inputs: identity for `message_start` plus the cache
/// stats the simulator produced at request entry.
#[derive(Debug, Clone)]
pub struct StreamContext {
    pub message_id: String,
    pub model: String,
    pub input_tokens: i64,
    pub cache_creation_tokens: i64,
    pub cache_read_tokens: i64,
}

/// Shared usage accounting the orchestrator reads after the stream ends.
/// Adapters update `output_tokens` as deltas flow and flip `completed` only
/// on a clean upstream termination.
#[derive(Debug, Default)]
pub struct StreamUsage {
    pub input_tokens: AtomicI64,
    pub output_tokens: AtomicI64,
    pub completed: AtomicBool,
    pub used_tool: AtomicBool,
}

impl StreamUsage {
    pub fn add_output(&self, tokens: i64) {
        self.output_tokens.fetch_add(tokens, Ordering::Relaxed);
    }

    pub fn set_input(&self, tokens: i64) {
        self.input_tokens.store(tokens, Ordering::Relaxed);
    }

    pub fn set_output(&self, tokens: i64) {
        self.output_tokens.store(tokens, Ordering::Relaxed);
    }

    pub fn mark_completed(&self) {
        self.completed.store(true, Ordering::Relaxed);
    }

    pub fn input(&self) -> i64 {
        self.input_tokens.load(Ordering::Relaxed)
    }

    pub fn output(&self) -> i64 {
        self.output_tokens.load(Ordering::Relaxed)
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use futures::StreamExt;

    /// Collect a full adapter output and return the SSE event names plus the
    /// parsed data payloads, for sequence assertions.
    pub async fn collect_events(mut stream: ClaudeSseStream) -> Vec<(String, serde_json::Value)> {
        let mut out = Vec::new();
        let mut buffer = String::new();
        while let Some(item) = stream.next().await {
            let chunk = item.expect("stream chunk");
            buffer.push_str(&String::from_utf8_lossy(&chunk));
        }
        for block in buffer.split("\n\n") {
            let mut event = None;
            let mut data = None;
            for line in block.lines() {
                if let Some(rest) = line.strip_prefix("event: ") {
                    event = Some(rest.to_string());
                } else if let Some(rest) = line.strip_prefix("data: ") {
                    data = serde_json::from_str(rest).ok();
                }
            }
            if let (Some(event), Some(data)) = (event, data) {
                out.push((event, data));
            }
        }
        out
    }

    /// Assert the canonical Claude event shape:
    /// message_start (ping | blocks)+ message_delta message_stop,
    /// with strictly monotonic content-block indices.
    pub fn assert_claude_sequence(events: &[(String, serde_json::Value)]) {
        assert!(!events.is_empty(), "no events");
        assert_eq!(events[0].0, "message_start");
        assert_eq!(events[events.len() - 1].0, "message_stop");
        assert_eq!(events[events.len() - 2].0, "message_delta");

        let mut open: Option<i64> = None;
        let mut last_index: i64 = -1;
        for (event, data) in &events[1..events.len() - 2] {
            match event.as_str() {
                "ping" => {}
                "content_block_start" => {
                    assert!(open.is_none(), "nested content_block_start");
                    let index = data["index"].as_i64().unwrap();
                    assert!(index > last_index, "non-monotonic index {}", index);
                    last_index = index;
                    open = Some(index);
                }
                "content_block_delta" => {
                    assert_eq!(open, data["index"].as_i64(), "delta outside block");
                }
                "content_block_stop" => {
                    assert_eq!(open.take(), data["index"].as_i64(), "unbalanced stop");
                }
                other => panic!("unexpected event {}", other),
            }
        }
        assert!(open.is_none(), "unclosed content block");
    }

    pub fn byte_stream(chunks: Vec<Vec<u8>>) -> UpstreamByteStream {
        Box::pin(futures::stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok::<Bytes, reqwest::Error>(Bytes::from(c))),
        ))
    }

    pub fn context() -> StreamContext {
        StreamContext {
            message_id: "msg_test".into(),
            model: "claude-sonnet-4-5".into(),
            input_tokens: 10,
            cache_creation_tokens: 0,
            cache_read_tokens: 0,
        }
    }
}
