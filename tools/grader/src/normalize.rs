//! Canonical text forms used for equivalence checks.

use serde_json::Value;

/// Canonicalizes a payload or console transcript for comparison.
///
/// Valid JSON is re-serialized compactly with sorted keys. Anything else has
/// `\uXXXX` escapes decoded, typographic punctuation folded to ASCII and
/// whitespace runs collapsed. The result is a fixed point:
/// `normalize_text(&normalize_text(s)) == normalize_text(s)`.
pub fn normalize_text(input: &str) -> String {
    if input.trim().is_empty() {
        return String::new();
    }
    if let Ok(value) = serde_json::from_str::<Value>(input) {
        return canonical_json(&fold_value(value));
    }

    let text = fold_punctuation(&unescape_fully(input));
    if let Ok(value) = serde_json::from_str::<Value>(&text) {
        return canonical_json(&fold_value(value));
    }

    let collapsed = collapse_whitespace(&text);
    match serde_json::from_str::<Value>(&collapsed) {
        Ok(value) => canonical_json(&fold_value(value)),
        Err(_) => collapsed,
    }
}

/// Normalized, case-insensitive equality.
pub fn text_equivalent(a: &str, b: &str) -> bool {
    normalize_text(a).to_lowercase() == normalize_text(b).to_lowercase()
}

pub fn fold_punctuation(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{2032}' => out.push('\''),
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{2033}' => out.push('"'),
            '\u{2013}' | '\u{2014}' | '\u{2212}' => out.push('-'),
            '\u{2026}' => out.push_str("..."),
            '\u{00A0}' | '\u{2007}' | '\u{202F}' => out.push(' '),
            other => out.push(other),
        }
    }
    out
}

pub fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Every pass shortens the text, so decoding until nothing changes terminates.
fn unescape_fully(input: &str) -> String {
    let mut current = input.to_string();
    loop {
        let next = unescape_once(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

fn unescape_once(input: &str) -> String {
    let chars = input.chars().collect::<Vec<_>>();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;
    while i < chars.len() {
        if let Some(unit) = escape_at(&chars, i) {
            if (0xD800..0xDC00).contains(&unit) {
                if let Some(low) = escape_at(&chars, i + 6).filter(|low| (0xDC00..0xE000).contains(low)) {
                    let code = 0x10000 + ((unit - 0xD800) << 10) + (low - 0xDC00);
                    if let Some(c) = char::from_u32(code) {
                        out.push(c);
                        i += 12;
                        continue;
                    }
                }
            } else if let Some(c) = char::from_u32(unit) {
                out.push(c);
                i += 6;
                continue;
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

fn escape_at(chars: &[char], at: usize) -> Option<u32> {
    if chars.get(at) != Some(&'\\') || chars.get(at + 1) != Some(&'u') {
        return None;
    }
    let hex = chars.get(at + 2..at + 6)?.iter().collect::<String>();
    u32::from_str_radix(&hex, 16).ok()
}

fn fold_value(value: Value) -> Value {
    match value {
        Value::String(text) => Value::String(fold_punctuation(&text)),
        Value::Array(items) => Value::Array(items.into_iter().map(fold_value).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| (fold_punctuation(&key), fold_value(value)))
                .collect(),
        ),
        other => other,
    }
}

/// Compact JSON with object keys in sorted order.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys = map.keys().collect::<Vec<_>>();
            keys.sort();
            out.push('{');
            for (index, key) in keys.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                if let Some(item) = map.get(key) {
                    write_canonical(item, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}
