//! Turning a model response into a sandbox program
//!
//! The program is the body of every fenced code block tagged as script code
//! (in order), followed by every balanced `FINAL(...)` / `FINAL_VAR(...)`
//! call written outside those blocks. A response with neither is a plain-text
//! answer.

use tracing::debug;

/// Fence info strings treated as executable code
const CODE_TAGS: &[&str] = &["", "js", "javascript", "python", "py"];

const FINAL_MARKERS: &[&str] = &["FINAL_VAR(", "FINAL("];

/// Build the program for `response`, or `None` when it contains no code
pub fn extract_program(response: &str) -> Option<String> {
    debug!(len = response.len(), "extract_program: called");
    let (blocks, prose) = split_fences(response);
    let mut parts: Vec<String> = blocks;
    for segment in &prose {
        parts.extend(final_calls(segment));
    }
    let program = parts.join("\n");
    if program.trim().is_empty() {
        debug!("extract_program: no code found");
        None
    } else {
        Some(program)
    }
}

/// Whether the response mentions a termination call anywhere
pub fn mentions_final(response: &str) -> bool {
    FINAL_MARKERS.iter().any(|m| response.contains(m))
}

/// Split into code block bodies and the prose between them
///
/// Blocks with a non-code tag (e.g. `json`) count as prose. An unterminated
/// fence runs to the end of the response.
fn split_fences(text: &str) -> (Vec<String>, Vec<&str>) {
    let mut blocks = Vec::new();
    let mut prose = Vec::new();
    let mut rest = text;

    while let Some(open) = rest.find("```") {
        let after_ticks = &rest[open + 3..];
        let (tag, body_start) = match after_ticks.find('\n') {
            Some(nl) => (after_ticks[..nl].trim(), nl + 1),
            None => (after_ticks.trim(), after_ticks.len()),
        };
        let body_and_rest = &after_ticks[body_start..];
        let (body, next) = match body_and_rest.find("```") {
            Some(close) => (&body_and_rest[..close], &body_and_rest[close + 3..]),
            None => (body_and_rest, ""),
        };

        let tag = tag.to_ascii_lowercase();
        if CODE_TAGS.contains(&tag.as_str()) {
            prose.push(&rest[..open]);
            if !body.trim().is_empty() {
                blocks.push(body.trim_end().to_string());
            }
        } else {
            // Non-code fence: keep it with the surrounding prose
            let consumed = rest.len() - next.len();
            prose.push(&rest[..consumed]);
        }
        rest = next;
    }
    prose.push(rest);
    (blocks, prose)
}

/// Every balanced termination call in `text`, in order
fn final_calls(text: &str) -> Vec<String> {
    let mut calls = Vec::new();
    let mut pos = 0;
    while pos < text.len() {
        let next = FINAL_MARKERS
            .iter()
            .filter_map(|m| text[pos..].find(m).map(|i| (pos + i, *m)))
            .min_by_key(|(i, m)| (*i, std::cmp::Reverse(m.len())));
        let Some((start, marker)) = next else { break };

        let preceded_by_word = text[..start]
            .chars()
            .next_back()
            .is_some_and(|c| c.is_alphanumeric() || c == '_' || c == '.');
        let open = start + marker.len() - 1;
        match (preceded_by_word, balanced_close(text, open)) {
            (false, Some(close)) => {
                calls.push(text[start..=close].to_string());
                pos = close + 1;
            }
            _ => pos = start + marker.len(),
        }
    }
    calls
}

/// Byte index of the `)` matching the `(` at `open`, skipping string literals
fn balanced_close(text: &str, open: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut i = open;
    while i < bytes.len() {
        match bytes[i] {
            b'(' | b'[' | b'{' => depth += 1,
            b')' | b']' | b'}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return (bytes[i] == b')').then_some(i);
                }
            }
            quote @ (b'"' | b'\'' | b'`') => {
                let triple = bytes.get(i..i + 3) == Some(&[quote, quote, quote][..]);
                i = if triple {
                    let body = i + 3;
                    let end = text[body..].find(std::str::from_utf8(&[quote, quote, quote]).ok()?)?;
                    body + end + 2
                } else {
                    skip_string(bytes, i, quote)?
                };
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// Index of the closing quote of the string starting at `start`
fn skip_string(bytes: &[u8], start: usize, quote: u8) -> Option<usize> {
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 1,
            b if b == quote => return Some(i),
            // Only template literals span lines
            b'\n' if quote != b'`' => return None,
            _ => {}
        }
        i += 1;
    }
    None
}
