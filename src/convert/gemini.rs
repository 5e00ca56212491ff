//! Claude → Gemini request conversion. Roles map user↔user and
//! assistant↔model; tool traffic becomes functionCall/functionResponse
//! parts, with the tool name for a response recovered from the earlier
//! tool_use id in the same conversation.

use serde_json::{json, Value};
use std::collections::HashMap;

use crate::models::{tool_result_text, ClaudeRequest, ContentBlock, MessageContent};

pub fn build_request(
    request: &ClaudeRequest,
    thinking_enabled: bool,
    thinking_budget: u32,
) -> Value {
    // tool_use_id -> tool name, gathered over the whole conversation first
    // so a functionResponse can name the function it answers.
    let mut tool_names: HashMap<String, String> = HashMap::new();
    for message in &request.messages {
        if let MessageContent::Blocks(blocks) = &message.content {
            for block in blocks {
                if let ContentBlock::ToolUse { id, name, .. } = block {
                    tool_names.insert(id.clone(), name.clone());
                }
            }
        }
    }

    let mut contents: Vec<Value> = Vec::new();
    for message in &request.messages {
        let role = if message.role == "assistant" {
            "model"
        } else {
            "user"
        };
        let mut parts: Vec<Value> = Vec::new();
        match &message.content {
            MessageContent::Text(text) => {
                if !text.is_empty() {
                    parts.push(json!({"text": text}));
                }
            }
            MessageContent::Blocks(blocks) => {
                for block in blocks {
                    match block {
                        ContentBlock::Text { text, .. } => {
                            if !text.is_empty() {
                                parts.push(json!({"text": text}));
                            }
                        }
                        ContentBlock::Thinking {
                            thinking,
                            signature,
                        } => {
                            let mut part = json!({"text": thinking, "thought": true});
                            // Signatures let Gemini resume prior reasoning.
                            if let Some(signature) = signature {
                                part["thoughtSignature"] = json!(signature);
                            }
                            parts.push(part);
                        }
                        ContentBlock::ToolUse { name, input, .. } => {
                            parts.push(json!({
                                "functionCall": {"name": name, "args": input}
                            }));
                        }
                        ContentBlock::ToolResult {
                            tool_use_id,
                            content,
                            ..
                        } => {
                            let name = tool_names
                                .get(tool_use_id)
                                .cloned()
                                .unwrap_or_else(|| tool_use_id.clone());
                            parts.push(json!({
                                "functionResponse": {
                                    "name": name,
                                    "response": {"result": tool_result_text(content)},
                                }
                            }));
                        }
                        ContentBlock::Image { source, .. } => {
                            if let (Some(mime), Some(data)) = (
                                source.get("media_type").and_then(|v| v.as_str()),
                                source.get("data").and_then(|v| v.as_str()),
                            ) {
                                parts.push(json!({
                                    "inlineData": {"mimeType": mime, "data": data}
                                }));
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
        // Messages that convert to nothing are dropped outright.
        if !parts.is_empty() {
            contents.push(json!({"role": role, "parts": parts}));
        }
    }

    let mut generation_config = json!({
        "thinkingConfig": {
            "includeThoughts": thinking_enabled,
            "thinkingBudget": thinking_budget,
        }
    });
    if let Some(max_tokens) = request.max_tokens {
        generation_config["maxOutputTokens"] = json!(max_tokens);
    }
    if let Some(temperature) = request.temperature {
        generation_config["temperature"] = json!(temperature);
    }
    if let Some(top_p) = request.top_p {
        generation_config["topP"] = json!(top_p);
    }

    let mut body = json!({
        "contents": contents,
        "generationConfig": generation_config,
    });

    let system_text = request.system_text();
    if !system_text.is_empty() {
        body["systemInstruction"] = json!({"parts": [{"text": system_text}]});
    }

    if let Some(tools) = &request.tools {
        if !tools.is_empty() {
            let declarations: Vec<Value> = tools
                .iter()
                .map(|tool| {
                    json!({
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.input_schema,
                    })
                })
                .collect();
            body["tools"] = json!([{"functionDeclarations": declarations}]);
        }
    }

    body
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(value: Value) -> ClaudeRequest {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn roles_map_and_empty_messages_drop() {
        let req = request(json!({
            "model": "gemini-2.5-pro",
            "messages": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": []},
                {"role": "assistant", "content": "hello"}
            ]
        }));
        let body = build_request(&req, false, 1024);
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 2);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
    }

    #[test]
    fn function_response_recovers_tool_name() {
        let req = request(json!({
            "model": "gemini-2.5-pro",
            "messages": [
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "call_7", "name": "get_weather", "input": {"city": "Oslo"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "call_7", "content": "rainy"}
                ]}
            ]
        }));
        let body = build_request(&req, false, 1024);
        let call = &body["contents"][0]["parts"][0]["functionCall"];
        assert_eq!(call["name"], "get_weather");
        assert_eq!(call["args"]["city"], "Oslo");
        let response = &body["contents"][1]["parts"][0]["functionResponse"];
        assert_eq!(response["name"], "get_weather");
        assert_eq!(response["response"]["result"], "rainy");
    }

    #[test]
    fn thinking_config_and_signature_passthrough() {
        let req = request(json!({
            "model": "gemini-2.5-pro",
            "messages": [
                {"role": "assistant", "content": [
                    {"type": "thinking", "thinking": "prior reasoning", "signature": "sig-abc"}
                ]},
                {"role": "user", "content": "continue"}
            ]
        }));
        let body = build_request(&req, true, 2048);
        let config = &body["generationConfig"]["thinkingConfig"];
        assert_eq!(config["includeThoughts"], true);
        assert_eq!(config["thinkingBudget"], 2048);
        let part = &body["contents"][0]["parts"][0];
        assert_eq!(part["thought"], true);
        assert_eq!(part["thoughtSignature"], "sig-abc");
    }

    #[test]
    fn tools_become_function_declarations() {
        let req = request(json!({
            "model": "gemini-2.5-pro",
            "messages": [{"role": "user", "content": "x"}],
            "system": "sys",
            "tools": [{"name": "t", "description": "d", "input_schema": {"type": "object"}}]
        }));
        let body = build_request(&req, false, 1024);
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "sys");
        let decl = &body["tools"][0]["functionDeclarations"][0];
        assert_eq!(decl["name"], "t");
        assert_eq!(decl["parameters"]["type"], "object");
    }
}
