//! OpenAI chat-completions SSE → Claude SSE. Text deltas run through the
//! `<thinking>` tag parser when thinking emulation is on; tool-call deltas
//! stream as `input_json_delta` inside tool_use blocks keyed by the
//! upstream's tool-call id. `data: [DONE]` is the clean terminator.

use async_stream::stream;
use bytes::BytesMut;
use futures::StreamExt;
use serde_json::Value;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::constants::PING_INTERVAL_SECS;
use crate::convert::openai::map_finish_reason;
use crate::stream::amazonq::{emit_segments, open_message};
use crate::stream::sse::{self, BlockKind, BlockTracker};
use crate::stream::thinking::ThinkingTagParser;
use crate::stream::{ClaudeSseStream, StreamContext, StreamUsage, UpstreamByteStream};
use crate::tokenizer::TokenEstimator;

pub fn adapt(
    mut upstream: UpstreamByteStream,
    context: StreamContext,
    thinking_enabled: bool,
    estimator: Arc<dyn TokenEstimator>,
    usage: Arc<StreamUsage>,
) -> ClaudeSseStream {
    Box::pin(stream! {
        let mut tracker = BlockTracker::new();
        let mut parser = ThinkingTagParser::new();
        let mut buffer = BytesMut::new();
        let mut message_started = false;
        let mut finish_reason: Option<&'static str> = None;
        let mut current_tool_index: Option<i64> = None;
        let mut done = false;
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
                let data = data.trim();
                if data == "[DONE]" {
                    done = true;
                    break 'read;
                }
                let parsed: Value = match serde_json::from_str(data) {
                    Ok(parsed) => parsed,
                    Err(_) => continue,
                };

                for chunk in open_message(&mut message_started, &context.message_id, &context) {
                    yield Ok(chunk);
                }

                let mut out = Vec::new();
                process_event(
                    &parsed,
                    thinking_enabled,
                    &mut tracker,
                    &mut parser,
                    &mut current_tool_index,
                    &mut finish_reason,
                    estimator.as_ref(),
                    &usage,
                    &mut out,
                );
                for chunk in out { yield Ok(chunk); }
            }
        }

        for chunk in open_message(&mut message_started, &context.message_id, &context) {
            yield Ok(chunk);
        }
        let mut out = Vec::new();
        emit_segments(parser.finish(), &mut tracker, &mut out);
        tracker.close_block(&mut out);
        for chunk in out { yield Ok(chunk); }

        if done {
            usage.mark_completed();
        }
        let stop_reason = finish_reason.unwrap_or(
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

#[allow(clippy::too_many_arguments)]
fn process_event(
    parsed: &Value,
    thinking_enabled: bool,
    tracker: &mut BlockTracker,
    parser: &mut ThinkingTagParser,
    current_tool_index: &mut Option<i64>,
    finish_reason: &mut Option<&'static str>,
    estimator: &dyn TokenEstimator,
    usage: &StreamUsage,
    out: &mut Vec<bytes::Bytes>,
) {
    if let Some(reported) = parsed.get("usage") {
        if let Some(prompt) = reported.get("prompt_tokens").and_then(|v| v.as_i64()) {
            usage.set_input(prompt);
        }
        if let Some(completion) = reported.get("completion_tokens").and_then(|v| v.as_i64()) {
            usage.set_output(completion);
        }
    }

    let Some(choice) = parsed
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
    else {
        return;
    };

    let delta = choice.get("delta").cloned().unwrap_or(Value::Null);

    if let Some(content) = delta.get("content").and_then(|c| c.as_str()) {
        if !content.is_empty() {
            // Tool block gives way to text.
            if tracker.open_kind() == Some(BlockKind::Tool) {
                tracker.close_block(out);
                *current_tool_index = None;
            }
            usage.add_output(estimator.estimate(content) as i64);
            if thinking_enabled {
                emit_segments(parser.push(content), tracker, out);
            } else {
                tracker.text(content, out);
            }
        }
    }

    if let Some(tool_calls) = delta.get("tool_calls").and_then(|t| t.as_array()) {
        for call in tool_calls {
            let call_index = call.get("index").and_then(|i| i.as_i64()).unwrap_or(0);
            let id = call.get("id").and_then(|i| i.as_str());
            let function = call.get("function").cloned().unwrap_or(Value::Null);
            let name = function.get("name").and_then(|n| n.as_str());

            // An id or name opens a new tool call; bare argument fragments
            // continue the current one.
            if id.is_some() || name.is_some() {
                let tool_id = id
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| {
                        format!("toolu_{}", &Uuid::new_v4().simple().to_string()[..24])
                    });
                tracker.open_tool(&tool_id, name.unwrap_or(""), out);
                *current_tool_index = Some(call_index);
                usage.used_tool.store(true, Ordering::Relaxed);
            }

            if let Some(arguments) = function.get("arguments").and_then(|a| a.as_str()) {
                if !arguments.is_empty() {
                    if let Some(index) = tracker.open_index() {
                        usage.add_output(estimator.estimate(arguments) as i64);
                        out.push(sse::input_json_delta(index, arguments));
                    }
                }
            }
        }
    }

    if let Some(reason) = choice.get("finish_reason").and_then(|r| r.as_str()) {
        *finish_reason = Some(map_finish_reason(reason));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::testing::{assert_claude_sequence, byte_stream, collect_events, context};
    use crate::tokenizer::HeuristicEstimator;
    use serde_json::json;

    fn sse(value: Value) -> Vec<u8> {
        format!("data: {}\n\n", value).into_bytes()
    }

    async fn run(
        chunks: Vec<Vec<u8>>,
        thinking: bool,
    ) -> (Vec<(String, serde_json::Value)>, Arc<StreamUsage>) {
        let usage = Arc::new(StreamUsage::default());
        let stream = adapt(
            byte_stream(chunks),
            context(),
            thinking,
            Arc::new(HeuristicEstimator),
            Arc::clone(&usage),
        );
        (collect_events(stream).await, usage)
    }

    #[tokio::test]
    async fn text_deltas_concatenate_and_done_completes() {
        let chunks = vec![
            sse(json!({"choices": [{"delta": {"content": "Hel"}}]})),
            sse(json!({"choices": [{"delta": {"content": "lo"}, "finish_reason": "stop"}]})),
            sse(json!({"usage": {"prompt_tokens": 12, "completion_tokens": 2}})),
            b"data: [DONE]\n\n".to_vec(),
        ];
        let (events, usage) = run(chunks, false).await;
        assert_claude_sequence(&events);
        let text: String = events
            .iter()
            .filter(|(e, d)| e == "content_block_delta" && d["delta"]["type"] == "text_delta")
            .map(|(_, d)| d["delta"]["text"].as_str().unwrap())
            .collect();
        assert_eq!(text, "Hello");
        assert!(usage.is_completed());
        let (_, delta) = events.iter().find(|(e, _)| e == "message_delta").unwrap();
        assert_eq!(delta["usage"]["input_tokens"], 12);
        assert_eq!(delta["usage"]["output_tokens"], 2);
        assert_eq!(delta["delta"]["stop_reason"], "end_turn");
    }

    #[tokio::test]
    async fn missing_done_marker_is_not_a_clean_completion() {
        let chunks = vec![sse(json!({"choices": [{"delta": {"content": "partial"}}]}))];
        let (events, usage) = run(chunks, false).await;
        // The client still sees a well-formed ending.
        assert_claude_sequence(&events);
        assert!(!usage.is_completed());
    }

    #[tokio::test]
    async fn tool_call_deltas_stream_with_preserved_id() {
        let chunks = vec![
            sse(json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "call_99", "function": {"name": "search", "arguments": ""}}
            ]}}]})),
            sse(json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "{\"q\":\"rust\"}"}}
            ]}}]})),
            sse(json!({"choices": [{"delta": {}, "finish_reason": "tool_calls"}]})),
            b"data: [DONE]\n\n".to_vec(),
        ];
        let (events, _) = run(chunks, false).await;
        assert_claude_sequence(&events);
        let (_, start) = events
            .iter()
            .find(|(e, _)| e == "content_block_start")
            .unwrap();
        assert_eq!(start["content_block"]["id"], "call_99");
        assert_eq!(start["content_block"]["name"], "search");
        let (_, delta) = events.iter().find(|(e, _)| e == "message_delta").unwrap();
        assert_eq!(delta["delta"]["stop_reason"], "tool_use");
    }

    #[tokio::test]
    async fn thinking_tags_parse_when_enabled() {
        let chunks = vec![
            sse(json!({"choices": [{"delta": {"content": "<thinking>hmm</thin"}}]})),
            sse(json!({"choices": [{"delta": {"content": "king>result"}, "finish_reason": "stop"}]})),
            b"data: [DONE]\n\n".to_vec(),
        ];
        let (events, _) = run(chunks, true).await;
        assert_claude_sequence(&events);
        let starts: Vec<&str> = events
            .iter()
            .filter(|(e, _)| e == "content_block_start")
            .map(|(_, d)| d["content_block"]["type"].as_str().unwrap())
            .collect();
        assert_eq!(starts, vec!["thinking", "text"]);
    }
}
