//! Canonical JSON: the stable byte representation used for hashing.
//!
//! Canonicalization serializes a value, reparses it into a generic
//! [`serde_json::Value`], and reserializes compactly. Object keys come out
//! lexicographically sorted because `Value` keeps objects in a `BTreeMap`,
//! and the `arbitrary_precision` feature preserves numeric tokens exactly,
//! so integers never round-trip through floating point.

use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Failure to produce canonical bytes.
#[derive(Debug, Error)]
#[error("canonical json: {0}")]
pub struct CanonicalError(#[from] serde_json::Error);

/// Produces the canonical byte representation of `value`.
///
/// Serializing the same logical object twice yields identical bytes,
/// regardless of field or key insertion order.
///
/// # Errors
///
/// Returns an error if the value cannot be serialized as JSON.
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CanonicalError> {
    let raw = serde_json::to_vec(value)?;
    let generic: serde_json::Value = serde_json::from_slice(&raw)?;
    Ok(serde_json::to_vec(&generic)?)
}

/// Hex-encoded SHA-256 of arbitrary bytes.
#[must_use]
pub fn hash_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Canonicalizes `value` and returns both the bytes and their SHA-256.
///
/// # Errors
///
/// Returns an error if the value cannot be serialized as JSON.
pub fn hash_payload<T: Serialize + ?Sized>(value: &T) -> Result<(Vec<u8>, String), CanonicalError> {
    let canon = canonical_json(value)?;
    let hash = hash_bytes(&canon);
    Ok((canon, hash))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sorts_object_keys() {
        let canon = canonical_json(&serde_json::json!({"b": 1, "a": 2, "c": {"z": 0, "y": 1}}))
            .expect("canonical");
        assert_eq!(canon, br#"{"a":2,"b":1,"c":{"y":1,"z":0}}"#);
    }

    #[test]
    fn identical_objects_produce_identical_bytes() {
        let one: serde_json::Value =
            serde_json::from_str(r#"{"x": 1, "y": [1, 2, {"k": "v"}], "z": "s"}"#).unwrap();
        let two: serde_json::Value =
            serde_json::from_str(r#"{"z": "s", "y": [1, 2, {"k": "v"}], "x": 1}"#).unwrap();
        assert_eq!(canonical_json(&one).unwrap(), canonical_json(&two).unwrap());
    }

    #[test]
    fn preserves_integer_identity() {
        let canon = canonical_json(&serde_json::json!({
            "big": 9_007_199_254_740_993_i64,
            "small": 1,
        }))
        .expect("canonical");
        let text = String::from_utf8(canon).unwrap();
        assert!(text.contains("9007199254740993"), "{text}");
    }

    #[test]
    fn hash_is_stable() {
        let (canon_a, hash_a) = hash_payload(&serde_json::json!({"a": 1, "b": 2})).unwrap();
        let (canon_b, hash_b) = hash_payload(&serde_json::json!({"b": 2, "a": 1})).unwrap();
        assert_eq!(canon_a, canon_b);
        assert_eq!(hash_a, hash_b);
        assert_eq!(hash_a.len(), 64);
    }
}
