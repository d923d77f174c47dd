//! Source-level fixups applied before a script reaches the engine

use regex::Regex;
use std::borrow::Cow;
use std::collections::BTreeSet;
use std::sync::LazyLock;

/// `const x`, `let y`, `var z` opening a line or following `;` / `}`
static SIMPLE_DECL: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?m)(?:^|[;}])\s*(?:const|let|var)\s+([A-Za-z_$][\w$]*)").ok());
/// `const {a, b: [c]} =` / `let [x, ...rest] =` in the same positions
static PATTERN_DECL: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?m)(?:^|[;}])\s*(?:const|let|var)\s*([\[{][^=;]*[\]}])\s*=").ok());
static IDENT: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"[A-Za-z_$][\w$]*").ok());

/// Top-level names a script may have declared with `const`/`let`/`var`
///
/// Over-approximates: property keys inside destructuring patterns are
/// included, and resolving a name that was never bound is harmless.
pub fn declared_names(code: &str) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    if let Some(re) = SIMPLE_DECL.as_ref() {
        names.extend(re.captures_iter(code).filter_map(|c| c.get(1)).map(|m| m.as_str().to_string()));
    }
    if let (Some(re), Some(ident)) = (PATTERN_DECL.as_ref(), IDENT.as_ref()) {
        for caps in re.captures_iter(code) {
            if let Some(pattern) = caps.get(1) {
                names.extend(ident.find_iter(pattern.as_str()).map(|m| m.as_str().to_string()));
            }
        }
    }
    names
}

/// Rewrite Python-style `"""..."""` / `'''...'''` literals as JS strings
pub fn expand_triple_quotes(code: &str) -> Cow<'_, str> {
    if !code.contains("\"\"\"") && !code.contains("'''") {
        return Cow::Borrowed(code);
    }

    let mut out = String::with_capacity(code.len());
    let mut rest = code;
    while let Some((offset, quote)) = next_literal(rest) {
        out.push_str(&rest[..offset]);
        let after = &rest[offset..];
        let delimiter = if quote == '"' { "\"\"\"" } else { "'''" };
        if let Some(body) = after.strip_prefix(delimiter)
            && let Some(end) = body.find(delimiter)
        {
            let literal = &body[..end];
            out.push_str(&serde_json::to_string(literal).unwrap_or_else(|_| format!("{delimiter}{literal}{delimiter}")));
            rest = &body[end + delimiter.len()..];
            continue;
        }
        // Ordinary string literal or an unterminated triple quote: copy it verbatim
        let len = literal_len(after, quote);
        out.push_str(&after[..len]);
        rest = &after[len..];
    }
    out.push_str(rest);
    Cow::Owned(out)
}

/// Byte offset and quote of the next string literal outside comments
fn next_literal(code: &str) -> Option<(usize, char)> {
    let bytes = code.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                i = code[i..].find('\n').map_or(bytes.len(), |n| i + n);
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i = code[i + 2..].find("*/").map_or(bytes.len(), |n| i + n + 4);
            }
            q @ (b'"' | b'\'' | b'`') => return Some((i, q as char)),
            _ => i += 1,
        }
    }
    None
}

/// Length in bytes of the literal opening at the start of `s`, closing quote included
fn literal_len(s: &str, quote: char) -> usize {
    let mut escaped = false;
    for (i, c) in s.char_indices().skip(1) {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            c if c == quote => return i + c.len_utf8(),
            '\n' if quote != '`' => return i,
            _ => {}
        }
    }
    s.len()
}
