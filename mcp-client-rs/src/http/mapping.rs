//! Response mapping for the MCP JSON-RPC transport
//!
//! Converts JSON-RPC envelopes and HTTP error bodies into tool payloads or
//! classified [`ToolError`]s.

use serde_json::{json, Value};

use error_handling_rs::{classify_message, ToolError};

/// Extract the tool payload from a JSON-RPC response envelope
pub fn parse_rpc_response(envelope: Value) -> Result<Value, ToolError> {
    if let Some(error) = envelope.get("error").filter(|e| !e.is_null()) {
        return Err(map_rpc_error(error));
    }

    match envelope.get("result") {
        Some(result) => Ok(parse_result(result)),
        None => Err(ToolError::malformed(
            "JSON-RPC response has neither result nor error",
        )),
    }
}

/// Normalize an MCP `result` into `{"results": [...], "status": "success"}`
fn parse_result(result: &Value) -> Value {
    match result {
        Value::Object(map) => match map.get("content") {
            Some(Value::Array(items)) => {
                let results: Vec<Value> = items.iter().map(parse_content_item).collect();
                json!({"results": results, "status": "success"})
            }
            Some(other) => json!({"results": other, "status": "success"}),
            None => result.clone(),
        },
        Value::Array(items) => json!({"results": items, "status": "success"}),
        other => json!({"results": [other], "status": "success"}),
    }
}

/// Text items are parsed as JSON when possible, otherwise kept verbatim
fn parse_content_item(item: &Value) -> Value {
    let is_text = item.get("type").and_then(Value::as_str) == Some("text");
    match (is_text, item.get("text").and_then(Value::as_str)) {
        (true, Some(text)) => {
            serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
        }
        _ => item.clone(),
    }
}

/// Map a JSON-RPC error object onto the taxonomy
pub fn map_rpc_error(error: &Value) -> ToolError {
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| error.as_str().map(str::to_string))
        .unwrap_or_else(|| error.to_string());

    // JSON-RPC reserves -32700 for parse errors.
    if error.get("code").and_then(Value::as_i64) == Some(-32700) {
        return ToolError::malformed(message);
    }
    ToolError::from_kind(classify_message(&message), message)
}

/// Best-effort error message from a non-success HTTP body
pub fn extract_error_message(body: &str) -> String {
    match serde_json::from_str::<Value>(body) {
        Ok(json) => json
            .get("error")
            .and_then(|e| e.as_str().map(str::to_string).or_else(|| e.get("message").and_then(Value::as_str).map(str::to_string)))
            .or_else(|| json.get("detail").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| body.to_string()),
        Err(_) if body.is_empty() => "empty response body".to_string(),
        Err(_) => body.chars().take(512).collect(),
    }
}

/// Tool names from a `/api/toolset` manifest (object keyed by name, or list)
pub fn parse_toolset(manifest: &Value) -> Vec<String> {
    let tools = manifest.get("tools").unwrap_or(manifest);
    let mut names: Vec<String> = match tools {
        Value::Object(map) => map.keys().cloned().collect(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| {
                item.get("name")
                    .and_then(Value::as_str)
                    .or_else(|| item.as_str())
                    .map(str::to_string)
            })
            .collect(),
        _ => Vec::new(),
    };
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use error_handling_rs::ErrorKind;

    #[test]
    fn test_text_content_is_parsed_as_json() {
        let envelope = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {"content": [
                {"type": "text", "text": "{\"row_count\": 2}"},
                {"type": "text", "text": "plain words"},
                {"type": "image", "data": "..."}
            ]}
        });
        let payload = parse_rpc_response(envelope).unwrap();
        assert_eq!(payload["status"], "success");
        assert_eq!(payload["results"][0]["row_count"], 2);
        assert_eq!(payload["results"][1], "plain words");
        assert_eq!(payload["results"][2]["type"], "image");
    }

    #[test]
    fn test_rpc_error_is_classified() {
        let err = parse_rpc_response(json!({"error": {"code": -32000, "message": "upstream timed out"}}))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);

        let err = parse_rpc_response(json!({"error": {"code": -32700, "message": "bad"}})).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedResponse);
    }

    #[test]
    fn test_missing_result_is_malformed() {
        let err = parse_rpc_response(json!({"jsonrpc": "2.0", "id": 1})).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedResponse);
    }

    #[test]
    fn test_extract_error_message() {
        assert_eq!(extract_error_message(r#"{"error": "tool not found"}"#), "tool not found");
        assert_eq!(extract_error_message(r#"{"detail": "Invalid API Key"}"#), "Invalid API Key");
        assert_eq!(extract_error_message("Bad Gateway"), "Bad Gateway");
    }

    #[test]
    fn test_parse_toolset() {
        let manifest = json!({"tools": {"text2sql": {}, "execute_generated_sql": {}}});
        assert_eq!(parse_toolset(&manifest), vec!["execute_generated_sql", "text2sql"]);

        let manifest = json!({"tools": [{"name": "list_products"}, "search_customers"]});
        assert_eq!(parse_toolset(&manifest), vec!["list_products", "search_customers"]);
    }
}
