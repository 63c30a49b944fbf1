//! Parses the agent CLI's NDJSON `stream-json` output, one line at a time.

use serde_json::Value;

use crate::db::models::Usage;

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedEvent {
    /// `system`/`init`: carries the session id to resume later turns.
    Init { session_id: String },
    /// `assistant` content block of type `text`.
    AssistantText(String),
    /// `assistant` content block of type `tool_use`.
    ToolUse { name: String, input: Value },
    /// `user` message carrying `tool_result` blocks, concatenated without
    /// newlines to preserve intra-result formatting.
    ToolResult(String),
    /// `result`: authoritative final text, superseding the accumulation.
    Result {
        text: String,
        duration_ms: Option<i64>,
        cost_usd: Option<f64>,
        usage: Usage,
    },
}

pub fn parse_line(line: &str) -> Vec<ParsedEvent> {
    let line = line.trim();
    if line.is_empty() {
        return Vec::new();
    }
    let Ok(v) = serde_json::from_str::<Value>(line) else {
        return Vec::new();
    };
    let Some(event_type) = v.get("type").and_then(Value::as_str) else {
        return Vec::new();
    };

    match event_type {
        "system" => parse_system(&v).into_iter().collect(),
        "assistant" => parse_assistant(&v),
        "user" => parse_user(&v).into_iter().collect(),
        "result" => parse_result(&v).into_iter().collect(),
        _ => Vec::new(),
    }
}

fn parse_system(v: &Value) -> Option<ParsedEvent> {
    if v.get("subtype").and_then(Value::as_str) != Some("init") {
        return None;
    }
    let session_id = v.get("session_id").and_then(Value::as_str)?.to_string();
    Some(ParsedEvent::Init { session_id })
}

fn parse_assistant(v: &Value) -> Vec<ParsedEvent> {
    let mut events = Vec::new();
    let Some(blocks) = v
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array)
    else {
        return events;
    };

    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    if !text.is_empty() {
                        events.push(ParsedEvent::AssistantText(text.to_string()));
                    }
                }
            }
            Some("tool_use") => {
                let name = block
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string();
                let input = block.get("input").cloned().unwrap_or(Value::Null);
                events.push(ParsedEvent::ToolUse { name, input });
            }
            _ => {}
        }
    }
    events
}

/// Extracts the textual payload of a single content block, whether it is a
/// bare string or a further array of sub-blocks.
fn block_text(block: &Value) -> String {
    if let Some(s) = block.as_str() {
        return s.to_string();
    }
    if let Some(s) = block.get("text").and_then(Value::as_str) {
        return s.to_string();
    }
    if let Some(content) = block.get("content") {
        return content_to_text(content);
    }
    String::new()
}

fn content_to_text(content: &Value) -> String {
    if let Some(s) = content.as_str() {
        return s.to_string();
    }
    if let Some(arr) = content.as_array() {
        return arr.iter().map(block_text).collect::<Vec<_>>().concat();
    }
    String::new()
}

fn parse_user(v: &Value) -> Option<ParsedEvent> {
    let blocks = v
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array)?;

    let mut out = String::new();
    let mut saw_tool_result = false;
    for block in blocks {
        if block.get("type").and_then(Value::as_str) == Some("tool_result") {
            saw_tool_result = true;
            out.push_str(&content_to_text(
                block.get("content").unwrap_or(&Value::Null),
            ));
        }
    }

    if saw_tool_result {
        Some(ParsedEvent::ToolResult(out))
    } else {
        None
    }
}

fn parse_result(v: &Value) -> Option<ParsedEvent> {
    let text = v.get("result").and_then(Value::as_str).unwrap_or("").to_string();
    let duration_ms = v.get("duration_ms").and_then(Value::as_i64);
    let cost_usd = v
        .get("total_cost_usd")
        .or_else(|| v.get("cost_usd"))
        .and_then(Value::as_f64);

    let usage_val = v.get("usage");
    let usage = Usage {
        input_tokens: usage_val.and_then(|u| u.get("input_tokens")).and_then(Value::as_i64),
        output_tokens: usage_val.and_then(|u| u.get("output_tokens")).and_then(Value::as_i64),
        cache_creation_tokens: usage_val
            .and_then(|u| u.get("cache_creation_input_tokens"))
            .and_then(Value::as_i64),
        cache_read_tokens: usage_val
            .and_then(|u| u.get("cache_read_input_tokens"))
            .and_then(Value::as_i64),
        duration_ms,
        cost_usd,
    };

    Some(ParsedEvent::Result {
        text,
        duration_ms,
        cost_usd,
        usage,
    })
}
