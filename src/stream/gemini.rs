//! Gemini SSE → Claude SSE. The upstream streams line-delimited JSON under
//! `data:` lines; parts flagged `thought` become thinking blocks (with a
//! trailing `signature_delta` when Gemini signs them), plain text becomes
//! text blocks, and functionCall parts become complete tool_use blocks.

use async_stream::stream;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use serde_json::Value;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::constants::PING_INTERVAL_SECS;
use crate::stream::amazonq::open_message;
use crate::stream::sse::{self, BlockKind, BlockTracker};
use crate::stream::{ClaudeSseStream, StreamContext, StreamUsage, UpstreamByteStream};
use crate::tokenizer::TokenEstimator;

pub fn adapt(
    mut upstream: UpstreamByteStream,
    context: StreamContext,
    estimator: Arc<dyn TokenEstimator>,
    usage: Arc<StreamUsage>,
) -> ClaudeSseStream {
    Box::pin(stream! {
        let mut tracker = BlockTracker::new();
        let mut buffer = BytesMut::new();
        let mut message_started = false;
        let mut stop_reason: Option<&'static str> = None;
        let mut upstream_output_tokens: Option<i64> = None;
        usage.set_input(context.input_tokens);

        'read: loop {
            let next = tokio::time::timeout(
                Duration::from_secs(PING_INTERVAL_SECS),
                upstream.next(),
            )
            .await;
            let chunk = match next {
                Err(_) => {
                    if message_started {
                        yield Ok(sse::ping());
                    }
                    continue;
                }
                Ok(None) => break 'read,
                Ok(Some(Err(e))) => {
                    yield Err(format!("upstream read failed: {}", e));
                    return;
                }
                Ok(Some(Ok(chunk))) => chunk,
            };

            buffer.extend_from_slice(&chunk);
            while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                let line_raw = buffer.split_to(pos + 1);
                let line = match std::str::from_utf8(&line_raw) {
                    Ok(line) => line.trim(),
                    Err(_) => continue,
                };
                if line.is_empty() || line.starts_with(':') {
                    continue;
                }
                let Some(data) = line.strip_prefix("data:") else {
                    continue;
                };
                let parsed: Value = match serde_json::from_str(data.trim()) {
                    Ok(parsed) => parsed,
                    Err(_) => continue,
                };

                for chunk in open_message(&mut message_started, &context.message_id, &context) {
                    yield Ok(chunk);
                }

                let mut out = Vec::new();
                process_chunk(
                    &parsed,
                    &mut tracker,
                    estimator.as_ref(),
                    &usage,
                    &mut stop_reason,
                    &mut upstream_output_tokens,
                    &mut out,
                );
                for chunk in out { yield Ok(chunk); }
            }
        }

        for chunk in open_message(&mut message_started, &context.message_id, &context) {
            yield Ok(chunk);
        }
        let mut out = Vec::new();
        tracker.close_block(&mut out);
        for chunk in out { yield Ok(chunk); }

        if let Some(tokens) = upstream_output_tokens {
            usage.set_output(tokens);
        }
        // A finishReason from upstream marks a clean completion; a stream
        // that just stops mid-flight is closed for the client but recorded
        // as an upstream error.
        if stop_reason.is_some() {
            usage.mark_completed();
        }
        let stop_reason = stop_reason.unwrap_or(
            if usage.used_tool.load(Ordering::Relaxed) { "tool_use" } else { "end_turn" },
        );
        yield Ok(sse::message_delta(
            stop_reason,
            usage.input(),
            usage.output(),
            context.cache_creation_tokens,
            context.cache_read_tokens,
        ));
        yield Ok(sse::message_stop());
    })
}

fn process_chunk(
    parsed: &Value,
    tracker: &mut BlockTracker,
    estimator: &dyn TokenEstimator,
    usage: &StreamUsage,
    stop_reason: &mut Option<&'static str>,
    upstream_output_tokens: &mut Option<i64>,
    out: &mut Vec<Bytes>,
) {
    if let Some(metadata) = parsed.get("usageMetadata") {
        if let Some(prompt) = metadata.get("promptTokenCount").and_then(|v| v.as_i64()) {
            usage.set_input(prompt);
        }
        if let Some(candidates) = metadata
            .get("candidatesTokenCount")
            .and_then(|v| v.as_i64())
        {
            *upstream_output_tokens = Some(candidates);
        }
    }

    let Some(candidate) = parsed
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
    else {
        return;
    };

    let parts = candidate
        .get("content")
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array())
        .cloned()
        .unwrap_or_default();

    for part in &parts {
        if let Some(call) = part.get("functionCall") {
            let name = call.get("name").and_then(|n| n.as_str()).unwrap_or("");
            let args = call.get("args").cloned().unwrap_or(Value::Null);
            let id = format!("toolu_{}", &Uuid::new_v4().simple().to_string()[..24]);
            usage.used_tool.store(true, Ordering::Relaxed);
            let index = tracker.open_tool(&id, name, out);
            let payload = args.to_string();
            usage.add_output(estimator.estimate(&payload) as i64);
            out.push(sse::input_json_delta(index, &payload));
            tracker.close_block(out);
            continue;
        }

        let Some(text) = part.get("text").and_then(|t| t.as_str()) else {
            continue;
        };
        if text.is_empty() {
            continue;
        }
        let is_thought = part.get("thought").and_then(|t| t.as_bool()).unwrap_or(false);
        usage.add_output(estimator.estimate(text) as i64);
        if is_thought {
            tracker.thinking(text, out);
            if let Some(signature) = part.get("thoughtSignature").and_then(|s| s.as_str()) {
                if let Some(index) = tracker.open_index() {
                    out.push(sse::signature_delta(index, signature));
                }
            }
        } else {
            // Leaving a thinking run: the block closes before text resumes.
            if tracker.open_kind() == Some(BlockKind::Thinking) {
                tracker.close_block(out);
            }
            tracker.text(text, out);
        }
    }

    // finishReason resolves after the parts so a closing chunk that both
    // calls a function and finishes reports tool_use.
    if let Some(reason) = candidate.get("finishReason").and_then(|r| r.as_str()) {
        *stop_reason = Some(match reason {
            "MAX_TOKENS" => "max_tokens",
            _ if usage.used_tool.load(Ordering::Relaxed) => "tool_use",
            _ => "end_turn",
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::testing::{assert_claude_sequence, byte_stream, collect_events, context};
    use crate::tokenizer::HeuristicEstimator;
    use serde_json::json;

    fn sse_chunk(value: Value) -> Vec<u8> {
        format!("data: {}\n", value).into_bytes()
    }

    async fn run(chunks: Vec<Vec<u8>>) -> (Vec<(String, serde_json::Value)>, Arc<StreamUsage>) {
        let usage = Arc::new(StreamUsage::default());
        let stream = adapt(
            byte_stream(chunks),
            context(),
            Arc::new(HeuristicEstimator),
            Arc::clone(&usage),
        );
        (collect_events(stream).await, usage)
    }

    #[tokio::test]
    async fn thought_parts_become_thinking_blocks_with_signature() {
        let chunks = vec![
            sse_chunk(json!({"candidates": [{"content": {"parts": [
                {"text": "pondering...", "thought": true, "thoughtSignature": "sig-1"}
            ]}}]})),
            sse_chunk(json!({"candidates": [{"content": {"parts": [
                {"text": "the answer"}
            ]}, "finishReason": "STOP"}],
            "usageMetadata": {"promptTokenCount": 42, "candidatesTokenCount": 7}})),
        ];
        let (events, usage) = run(chunks).await;
        assert_claude_sequence(&events);

        let signature = events
            .iter()
            .find(|(e, d)| e == "content_block_delta" && d["delta"]["type"] == "signature_delta")
            .expect("signature delta");
        assert_eq!(signature.1["delta"]["signature"], "sig-1");

        let (_, delta) = events.iter().find(|(e, _)| e == "message_delta").unwrap();
        assert_eq!(delta["delta"]["stop_reason"], "end_turn");
        assert_eq!(delta["usage"]["input_tokens"], 42);
        assert_eq!(delta["usage"]["output_tokens"], 7);
        assert!(usage.is_completed());
    }

    #[tokio::test]
    async fn function_call_streams_as_tool_use_block() {
        let chunks = vec![sse_chunk(json!({"candidates": [{"content": {"parts": [
            {"functionCall": {"name": "get_weather", "args": {"city": "Lima"}}}
        ]}, "finishReason": "STOP"}]}))];
        let (events, _) = run(chunks).await;
        assert_claude_sequence(&events);

        let (_, start) = events
            .iter()
            .find(|(e, _)| e == "content_block_start")
            .unwrap();
        assert_eq!(start["content_block"]["type"], "tool_use");
        assert_eq!(start["content_block"]["name"], "get_weather");
        assert!(start["content_block"]["id"]
            .as_str()
            .unwrap()
            .starts_with("toolu_"));

        let (_, delta) = events
            .iter()
            .find(|(e, d)| e == "content_block_delta" && d["delta"]["type"] == "input_json_delta")
            .unwrap();
        let args: Value =
            serde_json::from_str(delta["delta"]["partial_json"].as_str().unwrap()).unwrap();
        assert_eq!(args["city"], "Lima");

        let (_, message_delta) = events.iter().find(|(e, _)| e == "message_delta").unwrap();
        assert_eq!(message_delta["delta"]["stop_reason"], "tool_use");
    }

    #[tokio::test]
    async fn text_split_across_network_chunks_reassembles() {
        let line = format!(
            "data: {}\n",
            json!({"candidates": [{"content": {"parts": [{"text": "hello world"}]}}]})
        );
        let bytes = line.into_bytes();
        let (left, right) = bytes.split_at(20);
        let (events, _) = run(vec![left.to_vec(), right.to_vec()]).await;
        assert_claude_sequence(&events);
        let text: String = events
            .iter()
            .filter(|(e, d)| e == "content_block_delta" && d["delta"]["type"] == "text_delta")
            .map(|(_, d)| d["delta"]["text"].as_str().unwrap())
            .collect();
        assert_eq!(text, "hello world");
    }
}
