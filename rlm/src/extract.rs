//! Balanced JSON extraction from free-form model output
//!
//! Models wrap JSON in prose, Markdown fences and stray braces. The scanner
//! walks the text once per candidate opener, tracking a stack of open
//! brackets and string-literal state (active quote plus escapes), and yields
//! every span that closes back to depth zero and parses as JSON.

use serde_json::Value;
use tracing::debug;

/// Return the first well-formed JSON object or array embedded in `text`
pub fn extract_json(text: &str) -> Option<Value> {
    debug!(len = text.len(), "extract_json: called");
    Candidates::new(text).next()
}

/// Return every well-formed top-level JSON object or array in `text`, in order
pub fn extract_json_candidates(text: &str) -> Vec<Value> {
    debug!(len = text.len(), "extract_json_candidates: called");
    Candidates::new(text).collect()
}

/// Parse the whole of `text` (minus fences) as a bare JSON scalar
///
/// Used for schemas whose answer is a single number, string or boolean,
/// where there is no bracketed span to find.
pub fn extract_scalar(text: &str) -> Option<Value> {
    let body = strip_fences(text);
    match serde_json::from_str::<Value>(body) {
        Ok(value) if !value.is_object() && !value.is_array() => Some(value),
        _ => None,
    }
}

/// Strip one surrounding Markdown code fence, if present
pub fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string (```json)
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    body.trim_end().trim_end_matches("```").trim()
}

/// Iterator over parseable candidate spans
struct Candidates<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Candidates<'a> {
    fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }

    /// Find the byte index of the next `{` or `[` at or after `from`
    fn next_opener(&self, from: usize) -> Option<usize> {
        self.text[from..].find(['{', '[']).map(|i| from + i)
    }
}

impl Iterator for Candidates<'_> {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        while let Some(start) = self.next_opener(self.pos) {
            match balanced_end(self.text, start) {
                Some(end) => {
                    let span = &self.text[start..end];
                    if let Ok(value) = serde_json::from_str::<Value>(span) {
                        self.pos = end;
                        return Some(value);
                    }
                    debug!(start, end, "Candidates::next: span did not parse, rescanning");
                }
                None => {
                    debug!(start, "Candidates::next: unbalanced span, rescanning");
                }
            }
            // Opener is ASCII, so start + 1 is a char boundary
            self.pos = start + 1;
        }
        self.pos = self.text.len();
        None
    }
}

/// Scan from the opener at `start`; return the exclusive end of its balanced span
fn balanced_end(text: &str, start: usize) -> Option<usize> {
    let mut stack: Vec<u8> = Vec::new();
    let mut quote: Option<u8> = None;
    let mut escaped = false;

    for (offset, &byte) in text.as_bytes()[start..].iter().enumerate() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == q {
                quote = None;
            }
            continue;
        }

        match byte {
            b'"' => quote = Some(byte),
            b'{' => stack.push(b'}'),
            b'[' => stack.push(b']'),
            b'}' | b']' => {
                if stack.pop() != Some(byte) {
                    return None;
                }
                if stack.is_empty() {
                    return Some(start + offset + 1);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extracts_object_from_prose() {
        let text = r#"Sure, here: {"a":1,"b":{"c":[1,2,3]}} - let me know if that helps (btw {not json)"#;
        assert_eq!(extract_json(text), Some(json!({"a":1,"b":{"c":[1,2,3]}})));
    }

    #[test]
    fn test_braces_inside_strings() {
        let text = r#"Result: {"note": "use {x} and [y]", "ok": true} done"#;
        assert_eq!(extract_json(text), Some(json!({"note": "use {x} and [y]", "ok": true})));
    }

    #[test]
    fn test_escaped_quotes_inside_strings() {
        let text = r#"{"quote": "she said \"}\" loudly"}"#;
        assert_eq!(extract_json(text), Some(json!({"quote": "she said \"}\" loudly"})));
    }

    #[test]
    fn test_skips_malformed_candidate() {
        let text = r#"First try {name: 'bob'} then {"name": "bob"}"#;
        assert_eq!(extract_json(text), Some(json!({"name": "bob"})));
    }

    #[test]
    fn test_unmatched_prefix_brace() {
        let text = r#"Thinking { about it... {"x": [1, 2]}"#;
        assert_eq!(extract_json(text), Some(json!({"x": [1, 2]})));
    }

    #[test]
    fn test_markdown_fence() {
        let text = "Here you go:\n```json\n[{\"phrase\": \"great\"}]\n```\n";
        assert_eq!(extract_json(text), Some(json!([{"phrase": "great"}])));
    }

    #[test]
    fn test_multiple_candidates() {
        let text = r#"{"a": 1} or maybe {"a": 2} or [3]"#;
        assert_eq!(extract_json_candidates(text), vec![json!({"a": 1}), json!({"a": 2}), json!([3])]);
    }

    #[test]
    fn test_mismatched_closer_rejected() {
        assert_eq!(extract_json("{[}]"), None);
        assert_eq!(extract_json("no json here"), None);
        assert_eq!(extract_json(""), None);
    }

    #[test]
    fn test_non_ascii_prose() {
        let text = "Résumé → {\"name\": \"Zoë\"} ✓";
        assert_eq!(extract_json(text), Some(json!({"name": "Zoë"})));
    }

    #[test]
    fn test_extract_scalar() {
        assert_eq!(extract_scalar(" 42 "), Some(json!(42)));
        assert_eq!(extract_scalar("```\ntrue\n```"), Some(json!(true)));
        assert_eq!(extract_scalar("\"text\""), Some(json!("text")));
        assert_eq!(extract_scalar("{\"a\":1}"), None);
        assert_eq!(extract_scalar("the answer is 42"), None);
    }

    #[test]
    fn test_strip_fences() {
        assert_eq!(strip_fences("```json\n{}\n```"), "{}");
        assert_eq!(strip_fences("  plain  "), "plain");
    }
}
