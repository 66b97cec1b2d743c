//! Pure response normalization: a server's raw reply becomes one canonical
//! [`CallResult`] shape.
//!
//! The rule set here is a wire-compatibility contract shared with existing
//! callers. Change it only in lockstep with them.

use serde_json::Value;

use crate::types::CallResult;

/// Normalize a raw reply envelope into a [`CallResult`].
///
/// Precedence: `error` → `result.content` → bare `result` → top-level
/// `content` → whole-value passthrough.
pub fn normalize(raw: &Value) -> CallResult {
    if let Some(err) = raw.get("error") {
        return CallResult::err(error_message(err));
    }

    if let Some(result) = raw.get("result") {
        if let Some(content) = result.get("content") {
            return CallResult::ok(extract_content(Some(content)));
        }
        return CallResult::ok(Some(result.clone()));
    }

    if let Some(content) = raw.get("content") {
        return CallResult::ok(extract_content(Some(content)));
    }

    CallResult::ok(Some(raw.clone()))
}

fn error_message(err: &Value) -> String {
    match err {
        Value::String(s) => s.clone(),
        _ => err
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("Unknown error")
            .to_string(),
    }
}

/// Unwrap a `content` part list.
///
/// A single `text` part is parsed as a JSON literal when possible, otherwise
/// returned as its raw string. Everything else (empty lists, multi-part
/// lists, non-list scalars, non-text parts) passes through unchanged.
pub fn extract_content(parts: Option<&Value>) -> Option<Value> {
    let parts = parts?;

    let Value::Array(items) = parts else {
        return Some(parts.clone());
    };
    if items.len() != 1 {
        return Some(parts.clone());
    }

    let item = &items[0];
    if item.get("type").and_then(Value::as_str) == Some("text")
        && let Some(text) = item.get("text").and_then(Value::as_str)
    {
        return Some(
            serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string())),
        );
    }

    Some(item.clone())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn structured_error_extracts_message() {
        let r = normalize(&json!({"error": {"code": -1, "message": "boom"}}));
        assert_eq!(r, CallResult::err("boom"));
    }

    #[test]
    fn string_error_used_verbatim() {
        let r = normalize(&json!({"error": "boom"}));
        assert_eq!(r, CallResult::err("boom"));
    }

    #[test]
    fn error_without_message_falls_back() {
        let r = normalize(&json!({"error": {"code": -32600}}));
        assert_eq!(r, CallResult::err("Unknown error"));
    }

    #[test]
    fn single_text_part_parses_as_data() {
        let r = normalize(&json!({"result": {"content": [{"type": "text", "text": "5"}]}}));
        assert_eq!(r, CallResult::ok(Some(json!(5))));
    }

    #[test]
    fn unparseable_text_stays_a_string() {
        let r = normalize(&json!({"result": {"content": [{"type": "text", "text": "hello"}]}}));
        assert_eq!(r, CallResult::ok(Some(json!("hello"))));
    }

    #[test]
    fn bare_result_passes_through() {
        let r = normalize(&json!({"result": {"ok": true}}));
        assert_eq!(r, CallResult::ok(Some(json!({"ok": true}))));
    }

    #[test]
    fn top_level_content_is_extracted() {
        let r = normalize(&json!({"content": [{"type": "text", "text": "42"}]}));
        assert_eq!(r, CallResult::ok(Some(json!(42))));
    }

    #[test]
    fn unrecognized_envelope_passes_through_whole() {
        let raw = json!({"jsonrpc": "2.0", "id": 3});
        let r = normalize(&raw);
        assert_eq!(r, CallResult::ok(Some(raw)));
    }

    #[test]
    fn extract_none_is_none() {
        assert_eq!(extract_content(None), None);
    }

    #[test]
    fn extract_empty_list_unchanged() {
        assert_eq!(extract_content(Some(&json!([]))), Some(json!([])));
    }

    #[test]
    fn extract_scalar_unchanged() {
        assert_eq!(extract_content(Some(&json!("raw"))), Some(json!("raw")));
    }

    #[test]
    fn extract_two_parts_never_merged() {
        let parts = json!([
            {"type": "text", "text": "a"},
            {"type": "text", "text": "b"}
        ]);
        assert_eq!(extract_content(Some(&parts)), Some(parts.clone()));
    }

    #[test]
    fn extract_single_non_text_part_unchanged() {
        let parts = json!([{"type": "image", "data": "...", "mimeType": "image/png"}]);
        assert_eq!(
            extract_content(Some(&parts)),
            Some(json!({"type": "image", "data": "...", "mimeType": "image/png"}))
        );
    }

    #[test]
    fn extract_text_part_missing_text_field_unchanged() {
        let parts = json!([{"type": "text"}]);
        assert_eq!(extract_content(Some(&parts)), Some(json!({"type": "text"})));
    }
}
