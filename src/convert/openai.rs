//! Claude → OpenAI chat-completions conversion. Multi-block content is
//! flattened to strings, tool_use becomes tool_calls, and tool_result
//! becomes a `role: tool` message. Ids are preserved verbatim in both
//! directions so the backend can correlate calls and results.

use serde_json::{json, Value};

use crate::constants::THINKING_HINT;
use crate::models::{tool_result_text, ClaudeRequest, ContentBlock, MessageContent};

pub fn build_request(request: &ClaudeRequest, target_model: &str, thinking_enabled: bool) -> Value {
    let mut messages: Vec<Value> = Vec::new();

    let mut system_content = request.system_text();
    if thinking_enabled {
        system_content = if system_content.is_empty() {
            THINKING_HINT.to_string()
        } else {
            format!("{}\n{}", system_content, THINKING_HINT)
        };
    }
    if !system_content.is_empty() {
        messages.push(json!({"role": "system", "content": system_content}));
    }

    for message in &request.messages {
        if message.role == "assistant" {
            if let Some(converted) = convert_assistant_message(&message.content, thinking_enabled) {
                messages.push(converted);
            }
        } else {
            messages.extend(convert_user_message(&message.content));
        }
    }

    let mut body = json!({
        "model": target_model,
        "messages": messages,
        "stream": true,
        "stream_options": {"include_usage": true},
    });
    if let Some(max_tokens) = request.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    if let Some(temperature) = request.temperature {
        body["temperature"] = json!(temperature);
    }
    if let Some(tools) = &request.tools {
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools.iter().map(tool_to_function).collect());
        }
    }
    body
}

fn tool_to_function(tool: &crate::models::ClaudeTool) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.input_schema,
        }
    })
}

/// Tool results come back as `role: tool` messages ahead of any user text
/// from the same Claude turn.
fn convert_user_message(content: &MessageContent) -> Vec<Value> {
    match content {
        MessageContent::Text(text) => vec![json!({"role": "user", "content": text})],
        MessageContent::Blocks(blocks) => {
            let mut messages = Vec::new();
            let mut text_parts = Vec::new();
            for block in blocks {
                match block {
                    ContentBlock::Text { text, .. } => text_parts.push(text.clone()),
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        ..
                    } => {
                        messages.push(json!({
                            "role": "tool",
                            "tool_call_id": tool_use_id,
                            "content": tool_result_text(content),
                        }));
                    }
                    ContentBlock::Image { source, .. } => {
                        if let (Some(mime), Some(data)) = (
                            source.get("media_type").and_then(|v| v.as_str()),
                            source.get("data").and_then(|v| v.as_str()),
                        ) {
                            messages.push(json!({
                                "role": "user",
                                "content": [{
                                    "type": "image_url",
                                    "image_url": {"url": format!("data:{};base64,{}", mime, data)},
                                }]
                            }));
                        }
                    }
                    _ => {}
                }
            }
            let combined = text_parts.join("\n");
            if !combined.trim().is_empty() {
                messages.push(json!({"role": "user", "content": combined}));
            }
            messages
        }
    }
}

fn convert_assistant_message(content: &MessageContent, thinking_enabled: bool) -> Option<Value> {
    match content {
        MessageContent::Text(text) => Some(json!({"role": "assistant", "content": text})),
        MessageContent::Blocks(blocks) => {
            let mut text_parts: Vec<String> = Vec::new();
            let mut tool_calls: Vec<Value> = Vec::new();
            for block in blocks {
                match block {
                    ContentBlock::Text { text, .. } => text_parts.push(text.clone()),
                    ContentBlock::Thinking { thinking, .. } => {
                        // History reasoning is only meaningful to a backend
                        // that was asked to think; otherwise it is dropped.
                        if thinking_enabled && !thinking.is_empty() {
                            text_parts.push(format!("<thinking>{}</thinking>", thinking));
                        }
                    }
                    ContentBlock::ToolUse {
                        id, name, input, ..
                    } => {
                        tool_calls.push(json!({
                            "id": id,
                            "type": "function",
                            "function": {
                                "name": name,
                                "arguments": input.to_string(),
                            }
                        }));
                    }
                    _ => {}
                }
            }
            let combined = text_parts.join("\n");
            let mut message = json!({"role": "assistant"});
            message["content"] = if combined.trim().is_empty() {
                Value::Null
            } else {
                json!(combined)
            };
            if !tool_calls.is_empty() {
                message["tool_calls"] = Value::Array(tool_calls);
            }
            Some(message)
        }
    }
}

/// OpenAI finish_reason → Claude stop_reason.
pub fn map_finish_reason(reason: &str) -> &'static str {
    match reason {
        "length" => "max_tokens",
        "tool_calls" | "function_call" => "tool_use",
        _ => "end_turn",
    }
}

/// Map an OpenAI error body (plus HTTP status) onto a Claude error body.
pub fn error_to_claude(error: &Value, status: u16) -> Value {
    let detail = error.get("error").cloned().unwrap_or_else(|| error.clone());
    let message = detail
        .get("message")
        .and_then(|m| m.as_str())
        .unwrap_or("Unknown error")
        .to_string();
    let openai_type = detail.get("type").and_then(|t| t.as_str()).unwrap_or("");

    let claude_type = match openai_type {
        "invalid_request_error" | "authentication_error" | "permission_error"
        | "not_found_error" | "rate_limit_error" => openai_type,
        "server_error" => "api_error",
        "service_unavailable" => "overloaded_error",
        _ => match status {
            400 => "invalid_request_error",
            401 => "authentication_error",
            403 => "permission_error",
            404 => "not_found_error",
            429 => "rate_limit_error",
            503 => "overloaded_error",
            _ => "api_error",
        },
    };

    json!({
        "type": "error",
        "error": {"type": claude_type, "message": message}
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(value: Value) -> ClaudeRequest {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn string_content_round_trips() {
        let req = request(json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": "plain words"}]
        }));
        let body = build_request(&req, "gpt-4o", false);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "plain words");
        assert_eq!(body["model"], "gpt-4o");
    }

    #[test]
    fn tool_definition_converts_losslessly() {
        let schema = json!({"type": "object", "properties": {"q": {"type": "string"}}, "required": ["q"]});
        let req = request(json!({
            "model": "m",
            "messages": [{"role": "user", "content": "x"}],
            "tools": [{"name": "search", "description": "find things", "input_schema": schema}]
        }));
        let body = build_request(&req, "gpt-4o", false);
        let function = &body["tools"][0]["function"];
        assert_eq!(function["name"], "search");
        assert_eq!(function["description"], "find things");
        assert_eq!(function["parameters"], schema);
    }

    #[test]
    fn tool_ids_survive_both_directions() {
        let req = request(json!({
            "model": "m",
            "messages": [
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "toolu_abc", "name": "f", "input": {"a": 1}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_abc", "content": "done"}
                ]}
            ]
        }));
        let body = build_request(&req, "gpt-4o", false);
        assert_eq!(body["messages"][0]["tool_calls"][0]["id"], "toolu_abc");
        assert_eq!(body["messages"][1]["role"], "tool");
        assert_eq!(body["messages"][1]["tool_call_id"], "toolu_abc");
    }

    #[test]
    fn thinking_hint_lands_in_system_prompt() {
        let req = request(json!({
            "model": "m",
            "system": "base",
            "messages": [{"role": "user", "content": "x"}],
            "thinking": true
        }));
        let body = build_request(&req, "gpt-4o", true);
        let system = body["messages"][0]["content"].as_str().unwrap();
        assert!(system.starts_with("base\n"));
        assert!(system.contains("<thinking_mode>"));
    }

    #[test]
    fn history_thinking_renders_as_tags_when_enabled() {
        let req = request(json!({
            "model": "m",
            "messages": [{"role": "assistant", "content": [
                {"type": "thinking", "thinking": "step one"},
                {"type": "text", "text": "answer"}
            ]}]
        }));
        let enabled = build_request(&req, "gpt-4o", true);
        assert!(enabled["messages"][0]["content"]
            .as_str()
            .unwrap()
            .contains("<thinking>step one</thinking>"));
        let disabled = build_request(&req, "gpt-4o", false);
        assert_eq!(disabled["messages"][0]["content"], "answer");
    }

    #[test]
    fn finish_reason_mapping() {
        assert_eq!(map_finish_reason("stop"), "end_turn");
        assert_eq!(map_finish_reason("length"), "max_tokens");
        assert_eq!(map_finish_reason("tool_calls"), "tool_use");
        assert_eq!(map_finish_reason("content_filter"), "end_turn");
    }

    #[test]
    fn error_mapping_uses_type_then_status() {
        let typed = error_to_claude(
            &json!({"error": {"type": "rate_limit_error", "message": "slow"}}),
            500,
        );
        assert_eq!(typed["error"]["type"], "rate_limit_error");
        let by_status = error_to_claude(&json!({"error": {"message": "nope"}}), 401);
        assert_eq!(by_status["error"]["type"], "authentication_error");
        assert_eq!(by_status["error"]["message"], "nope");
    }
}
