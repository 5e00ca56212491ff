//! Claude-format passthrough. Requests are forwarded verbatim apart from the
//! auth header; the Azure variant of the upstream needs a cleanup pass
//! first, chiefly around thinking blocks whose signatures it refuses to
//! validate.

use serde_json::{json, Map, Value};

const UNSUPPORTED_TOP_LEVEL: &[&str] = &["context_management", "betas", "anthropic_beta"];

const BUILTIN_TOOL_TYPES: &[&str] = &[
    "bash_20250124",
    "bash_20241022",
    "text_editor_20250124",
    "text_editor_20250429",
    "text_editor_20250728",
    "text_editor_20241022",
    "web_search_20250305",
    "computer_20241022",
];

/// Azure cleanup: strip unsupported fields, rewrite unsigned thinking
/// blocks, normalize tool shapes, and drop the `thinking` parameter unless
/// the last assistant message still opens with a signed thinking block.
pub fn clean_for_azure(request: &Value) -> Value {
    let mut cleaned = request.clone();
    if let Value::Object(ref mut root) = cleaned {
        clean_root(root);
    }
    cleaned
}

fn clean_root(root: &mut Map<String, Value>) {
    for field in UNSUPPORTED_TOP_LEVEL {
        root.remove(*field);
    }

    if let Some(Value::Array(messages)) = root.get_mut("messages") {
        let last_index = messages.len().saturating_sub(1);
        let mut rewritten = Vec::with_capacity(messages.len());
        for (index, message) in messages.iter().enumerate() {
            let mut message = message.clone();
            if let Some(content) = message.get_mut("content") {
                if let Value::Array(blocks) = content {
                    *blocks = blocks.iter().filter_map(clean_content_block).collect();
                }
            }
            // Empty messages confuse the upstream; only a trailing assistant
            // turn (prefill) may stay empty.
            let is_empty = match message.get("content") {
                None | Some(Value::Null) => true,
                Some(Value::String(text)) => text.trim().is_empty(),
                Some(Value::Array(blocks)) => blocks.is_empty(),
                _ => false,
            };
            let role = message.get("role").and_then(|r| r.as_str()).unwrap_or("");
            if is_empty && !(role == "assistant" && index == last_index) {
                continue;
            }
            rewritten.push(message);
        }
        *messages = rewritten;
    }

    if !last_assistant_opens_with_signed_thinking(root.get("messages")) {
        root.remove("thinking");
    }

    if let Some(Value::Array(tools)) = root.get_mut("tools") {
        *tools = tools.iter().filter_map(normalize_tool).collect();
    }
}

/// Signed thinking survives; unsigned thinking degrades to literal text;
/// redacted thinking without data disappears.
fn clean_content_block(block: &Value) -> Option<Value> {
    let block_type = block.get("type").and_then(|t| t.as_str()).unwrap_or("");
    match block_type {
        "thinking" => {
            let signed = block
                .get("signature")
                .and_then(|s| s.as_str())
                .map(|s| !s.is_empty())
                .unwrap_or(false);
            if signed {
                Some(block.clone())
            } else {
                let text = block.get("thinking").and_then(|t| t.as_str()).unwrap_or("");
                Some(json!({
                    "type": "text",
                    "text": format!("<previous_thinking>{}</previous_thinking>", text),
                }))
            }
        }
        "redacted_thinking" => {
            if block.get("data").and_then(|d| d.as_str()).is_some() {
                Some(block.clone())
            } else {
                None
            }
        }
        _ => Some(block.clone()),
    }
}

fn last_assistant_opens_with_signed_thinking(messages: Option<&Value>) -> bool {
    let Some(Value::Array(messages)) = messages else {
        return false;
    };
    let Some(last_assistant) = messages
        .iter()
        .rev()
        .find(|m| m.get("role").and_then(|r| r.as_str()) == Some("assistant"))
    else {
        return false;
    };
    let Some(Value::Array(blocks)) = last_assistant.get("content") else {
        return false;
    };
    let Some(first) = blocks.first() else {
        return false;
    };
    first.get("type").and_then(|t| t.as_str()) == Some("thinking")
        && first
            .get("signature")
            .and_then(|s| s.as_str())
            .map(|s| !s.is_empty())
            .unwrap_or(false)
}

/// Normalize any of the tool shapes in the wild (builtin, custom-wrapped,
/// OpenAI function, plain Claude) to the minimal accepted form.
fn normalize_tool(tool: &Value) -> Option<Value> {
    let object = tool.as_object()?;
    let tool_type = object.get("type").and_then(|t| t.as_str());

    if let Some(tool_type) = tool_type {
        if BUILTIN_TOOL_TYPES.contains(&tool_type) {
            let mut normalized = Map::new();
            normalized.insert("type".into(), json!(tool_type));
            if let Some(name) = object.get("name") {
                normalized.insert("name".into(), name.clone());
            }
            return Some(Value::Object(normalized));
        }
    }

    let source: &Map<String, Value> = match tool_type {
        Some("custom") => object
            .get("custom")
            .and_then(|c| c.as_object())
            .unwrap_or(object),
        Some("function") => object
            .get("function")
            .and_then(|f| f.as_object())
            .unwrap_or(object),
        _ if object.contains_key("function") => object
            .get("function")
            .and_then(|f| f.as_object())
            .unwrap_or(object),
        _ => object,
    };

    let mut normalized = Map::new();
    let name = source
        .get("name")
        .or_else(|| object.get("name"))
        .cloned()?;
    normalized.insert("name".into(), name);
    if let Some(description) = source.get("description").or_else(|| object.get("description")) {
        normalized.insert("description".into(), description.clone());
    }
    if let Some(schema) = source
        .get("input_schema")
        .or_else(|| source.get("parameters"))
        .or_else(|| object.get("input_schema"))
    {
        normalized.insert("input_schema".into(), schema.clone());
    }
    Some(Value::Object(normalized))
}
