//! Process Entry Canonicalization
//!
//! Deterministic byte encoding and hashing of audited process entries.
//! Objects are emitted with keys sorted at every nesting level and no
//! whitespace, so logically equal entries always hash identically.

use serde_json::{Number, Value};
use sha3::{Digest, Sha3_256};

/// One audited event. Any JSON value is accepted; no schema is enforced.
pub type ProcessEntry = Value;

/// SHA3-256 digest of an entry's canonical encoding, or of two child nodes.
pub type EntryHash = [u8; 32];

/// Identifier recorded in proofs for the leaf and node hash function.
pub const HASH_ALGORITHM: &str = "sha3_256";

/// Encode an entry into its canonical byte form.
pub fn canonicalize(entry: &ProcessEntry) -> Vec<u8> {
    let mut out = Vec::with_capacity(128);
    write_canonical(entry, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Number(n) => write_number(n, out),
        Value::String(s) => write_string(s, out),
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();

            out.push(b'{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_string(key, out);
                out.push(b':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push(b'}');
        }
    }
}

/// Integers keep every digit, however large. Other numbers are rendered
/// from their `f64` value, so `1.0`, `1.00` and `1e0` encode alike.
fn write_number(n: &Number, out: &mut Vec<u8>) {
    let text = n.to_string();
    let digits = text.strip_prefix('-').unwrap_or(&text);
    if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
        out.extend_from_slice(text.as_bytes());
        return;
    }
    match n.as_f64().and_then(Number::from_f64) {
        Some(float) => out.extend_from_slice(float.to_string().as_bytes()),
        None => out.extend_from_slice(text.as_bytes()),
    }
}

fn write_string(s: &str, out: &mut Vec<u8>) {
    out.push(b'"');
    for c in s.chars() {
        match c {
            '"' => out.extend_from_slice(b"\\\""),
            '\\' => out.extend_from_slice(b"\\\\"),
            '\n' => out.extend_from_slice(b"\\n"),
            '\r' => out.extend_from_slice(b"\\r"),
            '\t' => out.extend_from_slice(b"\\t"),
            '\u{08}' => out.extend_from_slice(b"\\b"),
            '\u{0c}' => out.extend_from_slice(b"\\f"),
            c if (c as u32) < 0x20 => {
                out.extend_from_slice(format!("\\u{:04x}", c as u32).as_bytes());
            }
            c => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
    out.push(b'"');
}

/// Hash raw bytes with the tree's hash function.
pub fn digest(bytes: &[u8]) -> EntryHash {
    let mut hasher = Sha3_256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Leaf hash of an entry.
pub fn hash_entry(entry: &ProcessEntry) -> EntryHash {
    digest(&canonicalize(entry))
}

/// Two entries match when their canonical encodings are byte-identical.
pub fn entries_match(a: &ProcessEntry, b: &ProcessEntry) -> bool {
    canonicalize(a) == canonicalize(b)
}

/// Parse a hex digest, accepting surrounding whitespace.
pub fn parse_hash(hex_str: &str) -> Option<EntryHash> {
    let bytes = hex::decode(hex_str.trim()).ok()?;
    bytes.try_into().ok()
}
