//! Canonical JSON for signing.
//!
//! Sender and verifier must produce byte-identical input to the signature, so
//! the inner `data` object is re-serialized with:
//!
//! - object keys sorted by their UTF-8 bytes, at every depth;
//! - no whitespace between tokens;
//! - strings escaped by `serde_json`, numbers in `serde_json`'s shortest form.
//!
//! The signed message is `canonical(data) || decimal(counter)`.

use std::io::Write as _;

use serde_json::Value;

use crate::error::ProtocolError;

/// Serialize `value` into its canonical byte form.
pub fn to_canonical_bytes(value: &Value) -> Result<Vec<u8>, ProtocolError> {
    let mut out = Vec::with_capacity(128);
    write_value(&mut out, value)?;
    Ok(out)
}

/// The exact bytes covered by an envelope signature.
pub fn signing_bytes(data: &Value, counter: u64) -> Result<Vec<u8>, ProtocolError> {
    let mut out = to_canonical_bytes(data)?;
    out.extend_from_slice(counter.to_string().as_bytes());
    Ok(out)
}

fn write_value(out: &mut Vec<u8>, value: &Value) -> Result<(), ProtocolError> {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Number(n) => write!(out, "{n}")
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?,
        Value::String(s) => write_string(out, s)?,
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_value(out, item)?;
            }
            out.push(b']');
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_unstable_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

            out.push(b'{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_string(out, key)?;
                out.push(b':');
                write_value(out, item)?;
            }
            out.push(b'}');
        }
    }
    Ok(())
}

fn write_string(out: &mut Vec<u8>, s: &str) -> Result<(), ProtocolError> {
    serde_json::to_writer(&mut *out, s).map_err(|e| ProtocolError::Serialization(e.to_string()))
}
