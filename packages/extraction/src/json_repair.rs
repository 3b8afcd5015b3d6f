//! Bounded repair of malformed LM JSON output.
//!
//! Models wrap JSON in markdown fences, cut off mid-string, or leave
//! brackets unbalanced at the end of output. Repair is strictly additive
//! at the tail: strip non-JSON framing, close an unterminated string,
//! then balance brackets from the deepest unclosed point. Anything beyond
//! that is unrecoverable and the caller falls back to an empty result.

use serde_json::Value;

/// Maximum closers appended during bracket balancing.
const MAX_CLOSERS: usize = 32;

/// Parse `text` as JSON, repairing if needed.
///
/// Already-valid JSON is returned from the unmodified input, so repair is
/// the identity on well-formed output.
pub fn parse_or_repair(text: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return Some(value);
    }

    let stripped = strip_framing(text);
    if let Ok(value) = serde_json::from_str::<Value>(stripped) {
        return Some(value);
    }

    let repaired = balance(stripped)?;
    serde_json::from_str::<Value>(&repaired).ok()
}

/// Drop markdown fences and any prose before the first `{`/`[` or after
/// the last `}`/`]`.
fn strip_framing(text: &str) -> &str {
    let mut s = text.trim();
    if let Some(rest) = s.strip_prefix("```json") {
        s = rest;
    } else if let Some(rest) = s.strip_prefix("```") {
        s = rest;
    }
    if let Some(rest) = s.strip_suffix("```") {
        s = rest;
    }
    s = s.trim();

    let start = s.find(['{', '[']);
    let end = s.rfind(['}', ']']);
    match (start, end) {
        (Some(start), Some(end)) if end >= start => &s[start..=end],
        (Some(start), _) => &s[start..],
        _ => s,
    }
}

/// Close an unterminated trailing string and balance brackets.
fn balance(text: &str) -> Option<String> {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in text.chars() {
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
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                // A mismatched closer is beyond tail repair.
                if stack.pop() != Some(c) {
                    return None;
                }
            }
            _ => {}
        }
    }

    if stack.is_empty() && !in_string {
        return None;
    }
    if stack.len() > MAX_CLOSERS {
        return None;
    }

    let mut repaired = text.trim_end().to_string();
    // A dangling escape cannot be completed meaningfully.
    if escaped {
        repaired.pop();
    }
    if in_string {
        repaired.push('"');
    }
    // Drop a trailing comma left by truncation.
    while repaired.ends_with(',') {
        repaired.pop();
    }
    for closer in stack.iter().rev() {
        repaired.push(*closer);
    }
    Some(repaired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_valid_json_identity() {
        let input = r#"{"a": 1, "b": [true, null]}"#;
        let parsed = parse_or_repair(input).unwrap();
        assert_eq!(parsed, json!({"a": 1, "b": [true, null]}));
        // Byte-identical round trip for already-valid input.
        let direct: Value = serde_json::from_str(input).unwrap();
        assert_eq!(parsed, direct);
    }

    #[test]
    fn test_markdown_fence_stripped() {
        let input = "```json\n{\"a\": 1}\n```";
        assert_eq!(parse_or_repair(input).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn test_prose_prefix_stripped() {
        let input = "Here is the JSON you asked for: {\"a\": 1}";
        assert_eq!(parse_or_repair(input).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn test_unterminated_string_closed() {
        let input = r#"{"name": "acme"#;
        assert_eq!(parse_or_repair(input).unwrap(), json!({"name": "acme"}));
    }

    #[test]
    fn test_unbalanced_brackets_closed() {
        let input = r#"{"items": [{"a": 1}, {"b": 2}"#;
        assert_eq!(
            parse_or_repair(input).unwrap(),
            json!({"items": [{"a": 1}, {"b": 2}]})
        );
    }

    #[test]
    fn test_trailing_comma_after_truncation() {
        let input = r#"{"items": [1, 2,"#;
        assert_eq!(parse_or_repair(input).unwrap(), json!({"items": [1, 2]}));
    }

    #[test]
    fn test_hopeless_input_is_none() {
        assert!(parse_or_repair("no json here at all").is_none());
        assert!(parse_or_repair("").is_none());
        // Mismatched closer cannot be repaired at the tail.
        assert!(parse_or_repair(r#"{"a": ]}"#).is_none());
    }

    #[test]
    fn test_escaped_quote_inside_string() {
        let input = r#"{"quote": "she said \"hi\""#;
        assert_eq!(
            parse_or_repair(input).unwrap(),
            json!({"quote": "she said \"hi\""})
        );
    }
}
