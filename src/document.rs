//! Document shape: a plain JSON object carrying a string `_id`.
//!
//! Unlike the teacher's `Document` wrapper (a numeric id alongside the
//! data), documents here are represented directly as `serde_json::Value`
//! objects with `_id` as an ordinary field — the primary index ties a
//! document to its `_id` the same way any other index ties it to a field
//! value, so no separate envelope is needed.

use rand::Rng;
use serde_json::{Map, Value as Json};

use crate::error::{Error, Result};
use crate::value;

pub type DocumentId = String;

const ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
const ID_LEN: usize = 16;

/// Generates a random alphanumeric id with enough entropy that collisions
/// are negligible in practice; callers still must handle the rare
/// collision by retrying with a fresh id.
pub fn generate_id() -> DocumentId {
    let mut rng = rand::rng();
    (0..ID_LEN)
        .map(|_| ID_ALPHABET[rng.random_range(0..ID_ALPHABET.len())] as char)
        .collect()
}

/// Returns the document's `_id` field as a string, if present and valid.
pub fn get_id(doc: &Json) -> Option<&str> {
    doc.get("_id").and_then(Json::as_str)
}

/// Validates that `doc` is an object, that every key in it obeys the
/// naming invariants, and — if `_id` is present — that it is a string.
pub fn validate_document(doc: &Json) -> Result<()> {
    if !doc.is_object() {
        return Err(Error::InvalidKey("document must be an object".to_string()));
    }
    if let Some(id_val) = doc.get("_id") {
        if !id_val.is_string() {
            return Err(Error::InvalidKey("'_id' must be a string".to_string()));
        }
    }
    value::validate_keys_recursive(doc)
}

/// Returns a copy of `doc` with `_id` assigned if missing. `taken` is
/// consulted to retry on collision.
pub fn with_assigned_id(mut doc: Json, taken: &impl Fn(&str) -> bool) -> Json {
    let needs_id = !matches!(doc.get("_id"), Some(Json::String(_)));
    if needs_id {
        let mut id = generate_id();
        while taken(&id) {
            id = generate_id();
        }
        if let Some(map) = doc.as_object_mut() {
            map.insert("_id".to_string(), Json::String(id));
        }
    }
    doc
}

pub fn as_object(doc: &Json) -> Option<&Map<String, Json>> {
    doc.as_object()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn generated_ids_are_expected_length() {
        let id = generate_id();
        assert_eq!(id.len(), ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn validate_rejects_non_object() {
        assert!(validate_document(&json!(5)).is_err());
    }

    #[test]
    fn validate_rejects_numeric_id() {
        assert!(validate_document(&json!({"_id": 0})).is_err());
    }

    #[test]
    fn validate_accepts_string_id() {
        assert!(validate_document(&json!({"_id": "0"})).is_ok());
    }

    #[test]
    fn assigns_id_when_missing() {
        let doc = with_assigned_id(json!({"a": 1}), &|_| false);
        assert!(get_id(&doc).is_some());
    }

    #[test]
    fn keeps_existing_string_id() {
        let doc = with_assigned_id(json!({"_id": "fixed"}), &|_| true);
        assert_eq!(get_id(&doc), Some("fixed"));
    }
}
