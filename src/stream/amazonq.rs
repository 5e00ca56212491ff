//! Amazon Q binary event-stream → Claude SSE. The upstream sends no block
//! boundaries of its own: `initial-response` opens the message, text arrives
//! as `assistantResponseEvent` chunks run through the `<thinking>` tag
//! parser, and `toolUseEvent` fragments accumulate into tool_use blocks.

use async_stream::stream;
use bytes::Bytes;
use futures::StreamExt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::constants::PING_INTERVAL_SECS;
use crate::stream::event_stream::EventStreamDecoder;
use crate::stream::sse::{self, BlockKind, BlockTracker};
use crate::stream::thinking::{Segment, ThinkingTagParser};
use crate::stream::{ClaudeSseStream, StreamContext, StreamUsage, UpstreamByteStream};
use crate::tokenizer::TokenEstimator;

pub fn adapt(
    mut upstream: UpstreamByteStream,
    context: StreamContext,
    estimator: Arc<dyn TokenEstimator>,
    usage: Arc<StreamUsage>,
) -> ClaudeSseStream {
    Box::pin(stream! {
        let mut decoder = EventStreamDecoder::new();
        let mut tracker = BlockTracker::new();
        let mut parser = ThinkingTagParser::new();
        let mut message_started = false;
        let mut current_tool: Option<String> = None;
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

            decoder.push(&chunk);
            loop {
                let frame = match decoder.next_frame() {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(e.to_string());
                        return;
                    }
                };

                if frame.message_type == "exception" {
                    let detail = String::from_utf8_lossy(&frame.payload).to_string();
                    yield Err(format!("upstream exception: {}", detail));
                    return;
                }

                let payload = match frame.payload_json() {
                    Some(payload) => payload,
                    None => continue,
                };

                match frame.event_type.as_str() {
                    "initial-response" => {
                        let conversation_id = payload
                            .get("conversationId")
                            .and_then(|v| v.as_str())
                            .map(|s| s.to_string())
                            .unwrap_or_else(|| context.message_id.clone());
                        for chunk in open_message(&mut message_started, &conversation_id, &context) {
                            yield Ok(chunk);
                        }
                    }
                    "assistantResponseEvent" => {
                        let content = payload
                            .get("content")
                            .and_then(|v| v.as_str())
                            .unwrap_or("");
                        if content.is_empty() {
                            continue;
                        }
                        for chunk in open_message(&mut message_started, &context.message_id, &context) {
                            yield Ok(chunk);
                        }
                        // Text resumes after a tool block: close it first.
                        if tracker.open_kind() == Some(BlockKind::Tool) {
                            let mut out = Vec::new();
                            tracker.close_block(&mut out);
                            for chunk in out { yield Ok(chunk); }
                            current_tool = None;
                        }
                        usage.add_output(estimator.estimate(content) as i64);
                        let mut out = Vec::new();
                        emit_segments(parser.push(content), &mut tracker, &mut out);
                        for chunk in out { yield Ok(chunk); }
                    }
                    "toolUseEvent" => {
                        let tool_use_id = payload
                            .get("toolUseId")
                            .and_then(|v| v.as_str())
                            .unwrap_or("")
                            .to_string();
                        if tool_use_id.is_empty() {
                            continue;
                        }
                        for chunk in open_message(&mut message_started, &context.message_id, &context) {
                            yield Ok(chunk);
                        }
                        usage.used_tool.store(true, Ordering::Relaxed);

                        let mut out = Vec::new();
                        if current_tool.as_deref() != Some(tool_use_id.as_str()) {
                            let name = payload
                                .get("name")
                                .and_then(|v| v.as_str())
                                .unwrap_or("");
                            tracker.open_tool(&tool_use_id, name, &mut out);
                            current_tool = Some(tool_use_id.clone());
                        }
                        if let Some(fragment) = payload.get("input").and_then(|v| v.as_str()) {
                            if !fragment.is_empty() {
                                if let Some(index) = tracker.open_index() {
                                    usage.add_output(estimator.estimate(fragment) as i64);
                                    out.push(sse::input_json_delta(index, fragment));
                                }
                            }
                        }
                        if payload.get("stop").and_then(|v| v.as_bool()).unwrap_or(false) {
                            tracker.close_block(&mut out);
                            current_tool = None;
                        }
                        for chunk in out { yield Ok(chunk); }
                    }
                    _ => {}
                }
            }
        }

        // Clean end of stream: flush the tag parser, close any open block,
        // and emit the closing pair.
        for chunk in open_message(&mut message_started, &context.message_id, &context) {
            yield Ok(chunk);
        }
        let mut out = Vec::new();
        emit_segments(parser.finish(), &mut tracker, &mut out);
        tracker.close_block(&mut out);
        for chunk in out { yield Ok(chunk); }

        let stop_reason = if usage.used_tool.load(Ordering::Relaxed) {
            "tool_use"
        } else {
            "end_turn"
        };
        usage.mark_completed();
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

/// `message_start` + initial ping, emitted exactly once per message.
pub(crate) fn open_message(
    started: &mut bool,
    message_id: &str,
    context: &StreamContext,
) -> Vec<Bytes> {
    if *started {
        return Vec::new();
    }
    *started = true;
    vec![
        sse::message_start(
            message_id,
            &context.model,
            context.input_tokens,
            context.cache_creation_tokens,
            context.cache_read_tokens,
        ),
        sse::ping(),
    ]
}

/// Map parser segments onto block operations. No `signature` is ever
/// emitted on this channel; the upstream cannot sign its reasoning.
pub(crate) fn emit_segments(segments: Vec<Segment>, tracker: &mut BlockTracker, out: &mut Vec<Bytes>) {
    for segment in segments {
        match segment {
            Segment::Text(text) => tracker.text(&text, out),
            Segment::ThinkingStart => {
                tracker.open_thinking(out);
            }
            Segment::Thinking(text) => tracker.thinking(&text, out),
            Segment::ThinkingEnd => tracker.close_block(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::event_stream::build_frame;
    use crate::stream::testing::{assert_claude_sequence, byte_stream, collect_events, context};
    use crate::tokenizer::HeuristicEstimator;
    use serde_json::json;

    async fn run(frames: Vec<Vec<u8>>) -> (Vec<(String, serde_json::Value)>, Arc<StreamUsage>) {
        let usage = Arc::new(StreamUsage::default());
        let stream = adapt(
            byte_stream(frames),
            context(),
            Arc::new(HeuristicEstimator),
            Arc::clone(&usage),
        );
        let events = collect_events(stream).await;
        (events, usage)
    }

    #[tokio::test]
    async fn three_text_chunks_produce_three_deltas_in_order() {
        let mut frames = vec![build_frame(
            "initial-response",
            &json!({"conversationId": "conv-9"}),
        )];
        for content in ["foo", "bar", "baz"] {
            frames.push(build_frame(
                "assistantResponseEvent",
                &json!({"content": content}),
            ));
        }
        let (events, usage) = run(frames).await;
        assert_claude_sequence(&events);
        assert_eq!(events[0].1["message"]["id"], "conv-9");

        let texts: Vec<&str> = events
            .iter()
            .filter(|(e, d)| e == "content_block_delta" && d["delta"]["type"] == "text_delta")
            .map(|(_, d)| d["delta"]["text"].as_str().unwrap())
            .collect();
        assert_eq!(texts, vec!["foo", "bar", "baz"]);
        assert!(usage.is_completed());
    }

    #[tokio::test]
    async fn thinking_tags_split_into_thinking_blocks() {
        let frames = vec![
            build_frame("initial-response", &json!({"conversationId": "c"})),
            build_frame("assistantResponseEvent", &json!({"content": "<thin"})),
            build_frame("assistantResponseEvent", &json!({"content": "king>deep"})),
            build_frame("assistantResponseEvent", &json!({"content": " thought</thinking>answer"})),
        ];
        let (events, _) = run(frames).await;
        assert_claude_sequence(&events);

        let starts: Vec<&str> = events
            .iter()
            .filter(|(e, _)| e == "content_block_start")
            .map(|(_, d)| d["content_block"]["type"].as_str().unwrap())
            .collect();
        assert_eq!(starts, vec!["thinking", "text"]);

        let thinking: String = events
            .iter()
            .filter(|(e, d)| e == "content_block_delta" && d["delta"]["type"] == "thinking_delta")
            .map(|(_, d)| d["delta"]["thinking"].as_str().unwrap())
            .collect();
        assert_eq!(thinking, "deep thought");
    }

    #[tokio::test]
    async fn tool_use_fragments_accumulate_into_one_block() {
        let frames = vec![
            build_frame("initial-response", &json!({"conversationId": "c"})),
            build_frame("toolUseEvent", &json!({"toolUseId": "t1", "name": "bash", "input": "{\"cmd\":"})),
            build_frame("toolUseEvent", &json!({"toolUseId": "t1", "input": "\"ls\"}", "stop": true})),
        ];
        let (events, usage) = run(frames).await;
        assert_claude_sequence(&events);

        let start = events
            .iter()
            .find(|(e, _)| e == "content_block_start")
            .unwrap();
        assert_eq!(start.1["content_block"]["type"], "tool_use");
        assert_eq!(start.1["content_block"]["id"], "t1");
        assert_eq!(start.1["content_block"]["name"], "bash");

        let joined: String = events
            .iter()
            .filter(|(e, d)| e == "content_block_delta" && d["delta"]["type"] == "input_json_delta")
            .map(|(_, d)| d["delta"]["partial_json"].as_str().unwrap())
            .collect();
        assert_eq!(joined, "{\"cmd\":\"ls\"}");

        let (_, delta) = events.iter().find(|(e, _)| e == "message_delta").unwrap();
        assert_eq!(delta["delta"]["stop_reason"], "tool_use");
        assert!(usage.is_completed());
    }

    #[tokio::test]
    async fn empty_stream_still_closes_cleanly() {
        let (events, usage) = run(vec![]).await;
        assert_eq!(events[0].0, "message_start");
        assert_eq!(events[events.len() - 1].0, "message_stop");
        assert!(usage.is_completed());
    }
}
