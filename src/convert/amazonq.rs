//! Claude → Amazon Q (CodeWhisperer) request conversion. The upstream takes
//! one synthesized user message plus a history of strictly alternating
//! user/assistant turns; tool traffic in history is rendered as text tags,
//! while tool results on the current turn travel structurally in
//! `userInputMessageContext.toolResults`.

use serde_json::{json, Value};
use uuid::Uuid;

use crate::constants::THINKING_HINT;
use crate::models::{tool_result_text, ClaudeRequest, ContentBlock, Message, MessageContent};

#[derive(Debug, Clone)]
pub struct AmazonQRequest {
    pub conversation_id: String,
    pub body: Value,
}

/// Fold arbitrary Claude model ids onto the upstream's supported set.
pub fn map_model(claude_model: &str) -> &'static str {
    let model = claude_model.to_ascii_lowercase();
    if model.contains("sonnet") {
        if model.contains("4.6") || model.contains("4-6") {
            return "claude-sonnet-4.6";
        }
        return "claude-sonnet-4.5";
    }
    if model.contains("opus") {
        if model.contains("4.5") || model.contains("4-5") {
            return "claude-opus-4.5";
        }
        return "claude-opus-4.6";
    }
    if model.contains("haiku") {
        return "claude-haiku-4.5";
    }
    "claude-sonnet-4.5"
}

#[derive(Debug, Clone, PartialEq)]
struct MergedMessage {
    role: String,
    text: String,
}

/// Serialize content blocks to the upstream's text form. Thinking blocks are
/// kept (signature or not) as `<thinking>` tags so the model can see its own
/// prior reasoning.
fn render_blocks_as_text(content: &MessageContent) -> String {
    match content {
        MessageContent::Text(text) => text.clone(),
        MessageContent::Blocks(blocks) => {
            let mut parts = Vec::new();
            for block in blocks {
                match block {
                    ContentBlock::Text { text, .. } => parts.push(text.clone()),
                    ContentBlock::Thinking { thinking, .. } => {
                        parts.push(format!("<thinking>{}</thinking>", thinking))
                    }
                    ContentBlock::ToolUse { name, input, .. } => parts.push(format!(
                        "<tool_use><name>{}</name><input>{}</input></tool_use>",
                        name, input
                    )),
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        ..
                    } => parts.push(format!(
                        "<tool_result id=\"{}\">{}</tool_result>",
                        tool_use_id,
                        tool_result_text(content)
                    )),
                    _ => {}
                }
            }
            parts.join("\n")
        }
    }
}

/// Merge consecutive same-role messages and force the sequence to open with
/// a user turn; the result alternates strictly.
fn merge_history(messages: &[Message]) -> Vec<MergedMessage> {
    let mut merged: Vec<MergedMessage> = Vec::new();
    for message in messages {
        let role = if message.role == "assistant" {
            "assistant"
        } else {
            "user"
        };
        let text = render_blocks_as_text(&message.content);
        match merged.last_mut() {
            Some(last) if last.role == role => {
                if !text.is_empty() {
                    if !last.text.is_empty() {
                        last.text.push('\n');
                    }
                    last.text.push_str(&text);
                }
            }
            _ => merged.push(MergedMessage {
                role: role.to_string(),
                text,
            }),
        }
    }
    if merged.first().map(|m| m.role != "user").unwrap_or(false) {
        merged.insert(
            0,
            MergedMessage {
                role: "user".to_string(),
                text: String::new(),
            },
        );
    }
    merged
}

fn current_timestamp() -> String {
    let now = chrono::Local::now();
    format!(
        "{}, {}",
        now.format("%A"),
        now.to_rfc3339_opts(chrono::SecondsFormat::Millis, false)
    )
}

/// Structured tool results from the latest user turn. Empty results get a
/// placeholder so the upstream never sees an empty content array.
fn extract_tool_results(message: &Message) -> Option<Vec<Value>> {
    let blocks = match &message.content {
        MessageContent::Blocks(blocks) => blocks,
        MessageContent::Text(_) => return None,
    };
    let mut results = Vec::new();
    for block in blocks {
        if let ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
            ..
        } = block
        {
            let text = tool_result_text(content);
            let text = if text.trim().is_empty() {
                if is_error.unwrap_or(false) {
                    "Tool use was cancelled by the user".to_string()
                } else {
                    "Command executed successfully".to_string()
                }
            } else {
                text
            };
            results.push(json!({
                "toolUseId": tool_use_id,
                "content": [{"text": text}],
                "status": if is_error.unwrap_or(false) { "error" } else { "success" },
            }));
        }
    }
    if results.is_empty() {
        None
    } else {
        Some(results)
    }
}

pub fn build_request(
    request: &ClaudeRequest,
    target_model: &str,
    profile_arn: Option<&str>,
    thinking_enabled: bool,
) -> AmazonQRequest {
    let conversation_id = Uuid::new_v4().to_string();

    let (history_messages, current) = match request.messages.split_last() {
        Some((last, rest)) if last.role == "user" => (rest, Some(last)),
        _ => (&request.messages[..], None),
    };

    let mut prompt_content = current
        .map(|m| render_blocks_as_text(&m.content))
        .unwrap_or_default();
    let tool_results = current.and_then(extract_tool_results);
    let has_tool_result = tool_results.is_some();

    if thinking_enabled && !prompt_content.is_empty() {
        prompt_content = format!("{}\n{}", prompt_content, THINKING_HINT);
    }

    // Tool-result-only turns skip the preamble; the upstream treats them as
    // continuation frames, not fresh user input.
    let mut formatted = if has_tool_result && prompt_content.is_empty() {
        String::new()
    } else {
        format!(
            "--- CONTEXT ENTRY BEGIN ---\nCurrent time: {}\n--- CONTEXT ENTRY END ---\n\n--- USER MESSAGE BEGIN ---\n{}\n--- USER MESSAGE END ---",
            current_timestamp(),
            prompt_content
        )
    };

    let system_text = request.system_text();
    if !system_text.is_empty() && !formatted.is_empty() {
        formatted = format!(
            "--- SYSTEM PROMPT BEGIN ---\n{}\n--- SYSTEM PROMPT END ---\n\n{}",
            system_text, formatted
        );
    }

    let mut context = serde_json::Map::new();
    if let Some(tools) = &request.tools {
        if !tools.is_empty() {
            context.insert(
                "envState".to_string(),
                json!({"operatingSystem": "macos", "currentWorkingDirectory": "/"}),
            );
            let specs: Vec<Value> = tools
                .iter()
                .map(|tool| {
                    json!({
                        "toolSpecification": {
                            "name": tool.name,
                            "description": tool.description,
                            "inputSchema": {"json": tool.input_schema},
                        }
                    })
                })
                .collect();
            context.insert("tools".to_string(), Value::Array(specs));
        }
    }
    if let Some(results) = tool_results {
        context.insert("toolResults".to_string(), Value::Array(results));
    }

    let history: Vec<Value> = merge_history(history_messages)
        .into_iter()
        .map(|m| {
            if m.role == "user" {
                json!({
                    "userInputMessage": {
                        "content": m.text,
                        "userInputMessageContext": {
                            "envState": {"operatingSystem": "macos", "currentWorkingDirectory": "/"}
                        },
                        "origin": "CLI",
                    }
                })
            } else {
                json!({
                    "assistantResponseMessage": {
                        "messageId": Uuid::new_v4().to_string(),
                        "content": m.text,
                    }
                })
            }
        })
        .collect();

    let mut body = json!({
        "conversationState": {
            "conversationId": conversation_id,
            "history": history,
            "currentMessage": {
                "userInputMessage": {
                    "content": formatted,
                    "userInputMessageContext": Value::Object(context),
                    "origin": "CLI",
                    "modelId": map_model(target_model),
                }
            },
            "chatTriggerType": "MANUAL",
        }
    });
    if let Some(arn) = profile_arn {
        body["profileArn"] = json!(arn);
    }

    AmazonQRequest {
        conversation_id,
        body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(value: Value) -> ClaudeRequest {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn model_mapping_covers_families() {
        assert_eq!(map_model("claude-sonnet-4-5-20250929"), "claude-sonnet-4.5");
        assert_eq!(map_model("claude-sonnet-4-6"), "claude-sonnet-4.6");
        assert_eq!(map_model("claude-opus-4-5"), "claude-opus-4.5");
        assert_eq!(map_model("claude-opus-4-6"), "claude-opus-4.6");
        assert_eq!(map_model("claude-haiku-4-5"), "claude-haiku-4.5");
        assert_eq!(map_model("somebody-elses-model"), "claude-sonnet-4.5");
    }

    #[test]
    fn history_merges_consecutive_roles_and_opens_with_user() {
        let messages: Vec<Message> = serde_json::from_value(json!([
            {"role": "assistant", "content": "first"},
            {"role": "assistant", "content": "second"},
            {"role": "user", "content": "reply"}
        ]))
        .unwrap();
        let merged = merge_history(&messages);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].role, "user");
        assert_eq!(merged[0].text, "");
        assert_eq!(merged[1].role, "assistant");
        assert_eq!(merged[1].text, "first\nsecond");
        assert_eq!(merged[2].role, "user");
    }

    #[test]
    fn history_blocks_render_as_tags() {
        let messages: Vec<Message> = serde_json::from_value(json!([
            {"role": "assistant", "content": [
                {"type": "thinking", "thinking": "pondering"},
                {"type": "tool_use", "id": "t1", "name": "lookup", "input": {"q": "x"}}
            ]},
            {"role": "user", "content": [
                {"type": "tool_result", "tool_use_id": "t1", "content": "42"}
            ]}
        ]))
        .unwrap();
        let merged = merge_history(&messages);
        assert!(merged[1].text.contains("<thinking>pondering</thinking>"));
        assert!(merged[1]
            .text
            .contains("<tool_use><name>lookup</name><input>{\"q\":\"x\"}</input></tool_use>"));
        assert!(merged[2].text.contains("<tool_result id=\"t1\">42</tool_result>"));
    }

    #[test]
    fn thinking_hint_appends_only_when_enabled() {
        let req = request(json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": "hello"}]
        }));
        let with = build_request(&req, "claude-sonnet-4-5", None, true);
        let without = build_request(&req, "claude-sonnet-4-5", None, false);
        let content_of = |r: &AmazonQRequest| {
            r.body["conversationState"]["currentMessage"]["userInputMessage"]["content"]
                .as_str()
                .unwrap()
                .to_string()
        };
        assert!(content_of(&with).contains("<thinking_mode>"));
        assert!(!content_of(&without).contains("<thinking_mode>"));
    }

    #[test]
    fn current_turn_carries_structured_tool_results() {
        let req = request(json!({
            "model": "claude-sonnet-4-5",
            "messages": [
                {"role": "user", "content": "run it"},
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "t1", "name": "bash", "input": {"cmd": "ls"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "t1", "content": ""}
                ]}
            ]
        }));
        let built = build_request(&req, "claude-sonnet-4-5", Some("arn:aws:p"), false);
        let results = &built.body["conversationState"]["currentMessage"]["userInputMessage"]
            ["userInputMessageContext"]["toolResults"];
        assert_eq!(results[0]["toolUseId"], "t1");
        // Empty success result gets the placeholder text.
        assert_eq!(results[0]["content"][0]["text"], "Command executed successfully");
        assert_eq!(built.body["profileArn"], "arn:aws:p");
    }

    #[test]
    fn system_prompt_and_preamble_wrap_the_message() {
        let req = request(json!({
            "model": "claude-sonnet-4-5",
            "system": "be terse",
            "messages": [{"role": "user", "content": "hi"}]
        }));
        let built = build_request(&req, "claude-sonnet-4-5", None, false);
        let content = built.body["conversationState"]["currentMessage"]["userInputMessage"]
            ["content"]
            .as_str()
            .unwrap();
        assert!(content.starts_with("--- SYSTEM PROMPT BEGIN ---\nbe terse"));
        assert!(content.contains("--- USER MESSAGE BEGIN ---\nhi\n--- USER MESSAGE END ---"));
        assert!(content.contains("Current time:"));
    }

    #[test]
    fn tools_land_in_context_with_json_schema_wrapper() {
        let req = request(json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [{"name": "get_weather", "description": "d",
                       "input_schema": {"type": "object"}}]
        }));
        let built = build_request(&req, "claude-sonnet-4-5", None, false);
        let tools = &built.body["conversationState"]["currentMessage"]["userInputMessage"]
            ["userInputMessageContext"]["tools"];
        assert_eq!(tools[0]["toolSpecification"]["name"], "get_weather");
        assert_eq!(
            tools[0]["toolSpecification"]["inputSchema"]["json"]["type"],
            "object"
        );
    }
}
