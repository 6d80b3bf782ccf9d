//! Extraction of structured tool-call requests from free-form text.

use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub tool: String,
    pub arguments: Map<String, Value>,
}

/// Parse a line of user text as a tool-call request.
///
/// The whole line is tried as a JSON document first, accepting `tool`/`name`
/// and `arguments`/`args` aliases and re-parsing string-encoded arguments.
/// When the line is not clean JSON, a brace-depth scan takes the last
/// balanced `{...}` object embedded in the text. `None` means the line is
/// not a tool call at all.
pub fn parse_tool_call(text: &str) -> Option<ToolCall> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return tool_call_from_value(value);
    }
    let candidate = last_balanced_object(trimmed)?;
    let value = serde_json::from_str::<Value>(candidate).ok()?;
    tool_call_from_value(value)
}

fn tool_call_from_value(value: Value) -> Option<ToolCall> {
    let object = value.as_object()?;
    let tool = object
        .get("tool")
        .or_else(|| object.get("name"))?
        .as_str()?
        .to_string();
    let arguments = match object.get("arguments").or_else(|| object.get("args")) {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        // arguments may arrive as a string-encoded JSON document
        Some(Value::String(raw)) => serde_json::from_str::<Value>(raw)
            .ok()?
            .as_object()?
            .clone(),
        Some(_) => return None,
    };
    Some(ToolCall { tool, arguments })
}

/// Find the last balanced top-level `{...}` span in mixed text, honoring
/// string literals and escapes so braces inside quoted values do not count.
fn last_balanced_object(text: &str) -> Option<&str> {
    let mut last_span: Option<(usize, usize)> = None;
    let mut start = None;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' if depth > 0 => in_string = true,
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    last_span = Some((start.take().unwrap_or(i), i + 1));
                }
            }
            _ => {}
        }
    }
    last_span.map(|(begin, end)| &text[begin..end])
}
