//! Claude-format passthrough stream. Bytes are forwarded unchanged except
//! for `message_start`, which gets the simulator's cache stats spliced into
//! its usage object. Usage numbers are read off the wire for bookkeeping.

use async_stream::stream;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::constants::PING_INTERVAL_SECS;
use crate::stream::sse;
use crate::stream::{ClaudeSseStream, StreamContext, StreamUsage, UpstreamByteStream};

pub fn adapt(
    mut upstream: UpstreamByteStream,
    context: StreamContext,
    usage: Arc<StreamUsage>,
) -> ClaudeSseStream {
    Box::pin(stream! {
        let mut buffer = BytesMut::new();
        let mut saw_first_event = false;
        usage.set_input(context.input_tokens);

        'read: loop {
            let next = tokio::time::timeout(
                Duration::from_secs(PING_INTERVAL_SECS),
                upstream.next(),
            )
            .await;
            let chunk = match next {
                Err(_) => {
                    if saw_first_event {
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
            // SSE events are double-newline delimited.
            while let Some(pos) = find_event_boundary(&buffer) {
                let event_raw = buffer.split_to(pos + 2);
                let Ok(event_text) = std::str::from_utf8(&event_raw) else {
                    yield Ok(Bytes::from(event_raw.to_vec()));
                    continue;
                };
                saw_first_event = true;
                let patched = inspect_and_patch(event_text, &context, &usage);
                yield Ok(patched);
            }
        }

        if !buffer.is_empty() {
            yield Ok(Bytes::from(buffer.to_vec()));
        }
    })
}

fn find_event_boundary(buffer: &BytesMut) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

/// Forward the event untouched unless it is `message_start` (cache stats get
/// injected) while mining usage fields along the way.
fn inspect_and_patch(event_text: &str, context: &StreamContext, usage: &StreamUsage) -> Bytes {
    let mut data_json: Option<Value> = None;
    for line in event_text.lines() {
        if let Some(rest) = line.strip_prefix("data:") {
            data_json = serde_json::from_str(rest.trim()).ok();
        }
    }
    let Some(mut data) = data_json else {
        return Bytes::from(event_text.to_string());
    };

    match data.get("type").and_then(|t| t.as_str()) {
        Some("message_start") => {
            if let Some(wire_usage) = data
                .get_mut("message")
                .and_then(|m| m.get_mut("usage"))
                .and_then(|u| u.as_object_mut())
            {
                if let Some(input) = wire_usage.get("input_tokens").and_then(|v| v.as_i64()) {
                    usage.set_input(input);
                }
                wire_usage.insert(
                    "cache_creation_input_tokens".into(),
                    Value::from(context.cache_creation_tokens),
                );
                wire_usage.insert(
                    "cache_read_input_tokens".into(),
                    Value::from(context.cache_read_tokens),
                );
            }
            return sse::sse_event("message_start", &data);
        }
        Some("message_delta") => {
            if let Some(output) = data
                .get("usage")
                .and_then(|u| u.get("output_tokens"))
                .and_then(|v| v.as_i64())
            {
                usage.set_output(output);
            }
        }
        Some("message_stop") => {
            usage.mark_completed();
        }
        _ => {}
    }
    Bytes::from(event_text.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::testing::{byte_stream, collect_events};
    use serde_json::json;

    fn sse_bytes(event: &str, data: Value) -> Vec<u8> {
        format!("event: {}\ndata: {}\n\n", event, data).into_bytes()
    }

    fn ctx() -> StreamContext {
        StreamContext {
            message_id: "msg_p".into(),
            model: "claude-sonnet-4-5".into(),
            input_tokens: 0,
            cache_creation_tokens: 40,
            cache_read_tokens: 8,
        }
    }

    #[tokio::test]
    async fn message_start_gains_cache_stats_and_rest_is_verbatim() {
        let chunks = vec![
            sse_bytes("message_start", json!({"type": "message_start", "message": {
                "id": "m1", "usage": {"input_tokens": 77, "output_tokens": 0}
            }})),
            sse_bytes("content_block_start", json!({"type": "content_block_start", "index": 0,
                "content_block": {"type": "text", "text": ""}})),
            sse_bytes("content_block_delta", json!({"type": "content_block_delta", "index": 0,
                "delta": {"type": "text_delta", "text": "hi"}})),
            sse_bytes("content_block_stop", json!({"type": "content_block_stop", "index": 0})),
            sse_bytes("message_delta", json!({"type": "message_delta",
                "delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": 5}})),
            sse_bytes("message_stop", json!({"type": "message_stop"})),
        ];
        let usage = Arc::new(StreamUsage::default());
        let events =
            collect_events(adapt(byte_stream(chunks), ctx(), Arc::clone(&usage))).await;

        let (_, start) = events.iter().find(|(e, _)| e == "message_start").unwrap();
        assert_eq!(start["message"]["usage"]["cache_creation_input_tokens"], 40);
        assert_eq!(start["message"]["usage"]["cache_read_input_tokens"], 8);
        assert_eq!(start["message"]["usage"]["input_tokens"], 77);

        let (_, delta) = events.iter().find(|(e, _)| e == "content_block_delta").unwrap();
        assert_eq!(delta["delta"]["text"], "hi");

        assert!(usage.is_completed());
        assert_eq!(usage.input(), 77);
        assert_eq!(usage.output(), 5);
    }

    #[tokio::test]
    async fn stream_without_message_stop_is_incomplete() {
        let chunks = vec![sse_bytes("message_start", json!({"type": "message_start", "message": {
            "id": "m1", "usage": {"input_tokens": 1}
        }}))];
        let usage = Arc::new(StreamUsage::default());
        let _ = collect_events(adapt(byte_stream(chunks), ctx(), Arc::clone(&usage))).await;
        assert!(!usage.is_completed());
    }
}
