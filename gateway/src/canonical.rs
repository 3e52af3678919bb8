//! Deterministic byte-level serialization of structured values (spec §4.1).
//!
//! Logically equal `serde_json::Value`s must produce byte-equal output: object
//! keys sorted lexicographically, no insignificant whitespace, numbers in
//! their shortest exact decimal form. Used everywhere a hash or fingerprint is
//! taken — the audit chain and the anti-replay fingerprint both go through
//! this path so neither can be fooled by key reordering or whitespace.

use serde_json::Value;
use std::fmt::Write as _;

/// Render `value` as its canonical byte string.
pub fn canonicalize(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            // serde_json already prints the shortest exact decimal for the
            // numeric types it supports; we just need to guarantee it never
            // emits e.g. "1.0" vs "1" differently across equal inputs, which
            // serde_json::Number upholds by construction.
            let _ = write!(out, "{n}");
        }
        Value::String(s) => write_json_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_json_string(key, out);
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
    }
}

fn write_json_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

/// Fixed UTC textual form used for any timestamp embedded in a canonicalized
/// value (RFC 3339 with fixed millisecond precision and a literal `Z`).
pub fn canonical_timestamp(ts: chrono::DateTime<chrono::Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}
