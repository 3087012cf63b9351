//! Regular expression dialect translation.
//!
//! Clients quote literal text with `\Q...\E`. The relational engine has no
//! such construct, so quoted runs are rewritten into backslash-escaped
//! literals before the pattern is bound.

use serde_json::Value;

use crate::error::{AdapterError, AdapterResult};

/// Translate a client pattern into the engine's dialect.
/// Anchors are kept in place around the literalized body.
pub fn process_regex_pattern(pattern: &str) -> String {
    if let Some(rest) = pattern.strip_prefix('^') {
        return format!("^{}", literalize(rest));
    }
    if let Some(rest) = pattern.strip_suffix('$') {
        return format!("{}$", literalize(rest));
    }
    literalize(pattern)
}

/// Rewrite every `\Q...\E` run into escaped literal text.
/// An unterminated `\Q` quotes to the end of the pattern; a stray `\E` is dropped.
pub fn literalize(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut chars = pattern.chars().peekable();
    let mut quoted = false;

    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.peek() {
                Some('Q') if !quoted => {
                    chars.next();
                    quoted = true;
                    continue;
                }
                Some('E') => {
                    chars.next();
                    quoted = false;
                    continue;
                }
                _ => {}
            }
            if !quoted {
                out.push(c);
                if let Some(next) = chars.next() {
                    out.push(next);
                }
                continue;
            }
        }

        if quoted {
            push_literal(&mut out, c);
        } else {
            out.push(c);
        }
    }
    out
}

/// Escape every character of `text` that could carry regex meaning
pub fn create_literal_regex(text: &str) -> String {
    let mut out = String::with_capacity(text.len() * 2);
    for c in text.chars() {
        push_literal(&mut out, c);
    }
    out
}

fn push_literal(out: &mut String, c: char) {
    if c.is_alphanumeric() || c == ' ' {
        out.push(c);
    } else {
        out.push('\\');
        out.push(c);
    }
}

/// Strip unescaped whitespace and `#` comments, for the `x` option
pub fn remove_whitespace(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut chars = pattern.chars();
    let mut in_comment = false;

    while let Some(c) = chars.next() {
        if in_comment {
            if c == '\n' {
                in_comment = false;
            }
            continue;
        }
        match c {
            '\\' => {
                out.push(c);
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            }
            '#' => in_comment = true,
            c if c.is_whitespace() => {}
            c => out.push(c),
        }
    }
    out
}

/// True for `^\Q...\E` patterns, i.e. anchored literal prefixes
pub fn is_starts_with_regex(pattern: &str) -> bool {
    if !pattern.starts_with('^') {
        return false;
    }
    match pattern.find("^\\Q") {
        Some(start) => pattern[start + 3..].contains("\\E"),
        None => false,
    }
}

fn regex_of(value: &Value) -> Option<&str> {
    value.get("$regex").and_then(Value::as_str)
}

/// `$all` lists containing anchored literal regexes
pub fn is_any_value_starts_with_regex(values: &[Value]) -> bool {
    values
        .iter()
        .any(|v| regex_of(v).map_or(false, is_starts_with_regex))
}

/// Either every element is an anchored literal regex or none is
pub fn is_all_values_regex_or_none(values: &[Value]) -> bool {
    let mut kinds = values
        .iter()
        .map(|v| regex_of(v).map_or(false, is_starts_with_regex));
    match kinds.next() {
        None => true,
        Some(first) => kinds.all(|k| k == first),
    }
}

/// Rewrite anchored literal regexes into `LIKE` prefix patterns
pub fn starts_with_patterns(values: &[Value]) -> AdapterResult<Vec<Value>> {
    if !is_all_values_regex_or_none(values) {
        return Err(AdapterError::InvalidQuery(format!(
            "All $all values must be of regex type or none: {}",
            Value::Array(values.to_vec())
        )));
    }
    values
        .iter()
        .map(|v| {
            let pattern = regex_of(v)
                .ok_or_else(|| AdapterError::InvalidQuery(format!("bad $all value: {}", v)))?;
            let processed = process_regex_pattern(pattern);
            let prefix = processed.strip_prefix('^').unwrap_or(&processed);
            Ok(Value::String(format!("{}%", prefix)))
        })
        .collect()
}
