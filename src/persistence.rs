//! Loading, appending, and compacting the on-disk log.
//!
//! Grounded on the teacher's `Collection::compact` (copy every live record
//! into a fresh file, then atomically swap it in) generalized to the full
//! 6-step crash-safe rewrite in [`crate::storage`], and on `engine.rs`'s
//! verbose/log-callback idiom for the diagnostics this module emits during
//! load.

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use serde_json::{Map, Value as Json};

use crate::document::DocumentId;
use crate::error::{Error, Result};
use crate::events::EventBroker;
use crate::storage::Storage;

pub type SerializeHook = Arc<dyn Fn(&str) -> String + Send + Sync>;
pub type DeserializeHook = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// A persisted index specification, round-tripped through `$$indexCreated`.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexSpec {
    pub field_name: String,
    pub unique: bool,
    pub sparse: bool,
    pub expire_after_seconds: Option<i64>,
}

pub const MIN_AUTOCOMPACTION_INTERVAL_MS: i64 = 5_000;

fn index_created_record(spec: &IndexSpec) -> Json {
    let mut body = Map::new();
    body.insert("fieldName".to_string(), Json::String(spec.field_name.clone()));
    body.insert("unique".to_string(), Json::Bool(spec.unique));
    body.insert("sparse".to_string(), Json::Bool(spec.sparse));
    if let Some(s) = spec.expire_after_seconds {
        body.insert("expireAfterSeconds".to_string(), Json::from(s));
    }
    let mut rec = Map::new();
    rec.insert("$$indexCreated".to_string(), Json::Object(body));
    Json::Object(rec)
}

fn index_removed_record(field_name: &str) -> Json {
    let mut rec = Map::new();
    rec.insert("$$indexRemoved".to_string(), Json::String(field_name.to_string()));
    Json::Object(rec)
}

pub fn tombstone_record(id: &str) -> Json {
    let mut rec = Map::new();
    rec.insert("_id".to_string(), Json::String(id.to_string()));
    rec.insert("$$deleted".to_string(), Json::Bool(true));
    Json::Object(rec)
}

fn parse_index_spec(body: &Json) -> Option<IndexSpec> {
    let obj = body.as_object()?;
    Some(IndexSpec {
        field_name: obj.get("fieldName")?.as_str()?.to_string(),
        unique: obj.get("unique").and_then(Json::as_bool).unwrap_or(false),
        sparse: obj.get("sparse").and_then(Json::as_bool).unwrap_or(false),
        expire_after_seconds: obj.get("expireAfterSeconds").and_then(Json::as_i64),
    })
}

/// Result of replaying a log's lines into in-memory state.
pub struct LoadedState {
    pub docs: HashMap<DocumentId, Json>,
    pub index_specs: Vec<IndexSpec>,
    pub corrupt_lines: usize,
    pub total_lines: usize,
}

/// Replays raw log lines, applying `$$deleted`/`$$indexCreated`/
/// `$$indexRemoved` semantics. Fails if the fraction of unparseable lines
/// exceeds `corrupt_alert_threshold`.
pub fn treat_raw_data(
    lines: &[String],
    before_deserialization: Option<&DeserializeHook>,
    corrupt_alert_threshold: f64,
) -> Result<LoadedState> {
    let mut docs: HashMap<DocumentId, Json> = HashMap::new();
    let mut index_specs: Vec<IndexSpec> = Vec::new();
    let mut corrupt = 0usize;
    let mut total = 0usize;

    for raw in lines {
        if raw.is_empty() {
            continue;
        }
        total += 1;
        let line = match before_deserialization {
            Some(f) => f(raw),
            None => raw.clone(),
        };
        let value: Json = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(_) => {
                corrupt += 1;
                continue;
            }
        };
        let Some(obj) = value.as_object() else {
            corrupt += 1;
            continue;
        };

        if let Some(spec_body) = obj.get("$$indexCreated") {
            match parse_index_spec(spec_body) {
                Some(spec) => {
                    index_specs.retain(|s| s.field_name != spec.field_name);
                    index_specs.push(spec);
                }
                None => corrupt += 1,
            }
            continue;
        }
        if let Some(field) = obj.get("$$indexRemoved").and_then(Json::as_str) {
            index_specs.retain(|s| s.field_name != field);
            continue;
        }
        if obj.get("$$deleted").and_then(Json::as_bool) == Some(true) {
            if let Some(id) = obj.get("_id").and_then(Json::as_str) {
                docs.remove(id);
            } else {
                corrupt += 1;
            }
            continue;
        }
        match obj.get("_id").and_then(Json::as_str) {
            Some(id) => {
                docs.insert(id.to_string(), value.clone());
            }
            None => corrupt += 1,
        }
    }

    if total > 0 {
        let ratio = corrupt as f64 / total as f64;
        if ratio > corrupt_alert_threshold {
            return Err(Error::CorruptDatafile(format!(
                "more than {:.0}% of the data file is corrupt ({corrupt}/{total} lines)",
                corrupt_alert_threshold * 100.0
            )));
        }
    }

    Ok(LoadedState { docs, index_specs, corrupt_lines: corrupt, total_lines: total })
}

fn serialize_record(record: &Json, after_serialization: Option<&SerializeHook>) -> Result<String> {
    let line = serde_json::to_string(record)?;
    Ok(match after_serialization {
        Some(f) => f(&line),
        None => line,
    })
}

/// Appends new records to the log without forcing a sync. A no-op when
/// `storage` is `None` (in-memory-only collections).
pub fn persist_new_state(
    storage: Option<&Storage>,
    records: &[Json],
    after_serialization: Option<&SerializeHook>,
) -> Result<()> {
    let Some(storage) = storage else {
        return Ok(());
    };
    let mut lines = Vec::with_capacity(records.len());
    for r in records {
        lines.push(serialize_record(r, after_serialization)?);
    }
    storage.append_lines(lines)
}

/// Rewrites the log to its minimal equivalent form: one line per live
/// document plus one `$$indexCreated` line per non-primary index. Fires
/// `compaction.done` on success. A no-op when `storage` is `None`.
pub fn compact<'a>(
    storage: Option<&Storage>,
    live_docs: impl Iterator<Item = &'a Json>,
    index_specs: &[IndexSpec],
    after_serialization: Option<&SerializeHook>,
    events: &EventBroker,
) -> Result<()> {
    let Some(storage) = storage else {
        return Ok(());
    };
    let mut lines = Vec::new();
    for doc in live_docs {
        lines.push(serialize_record(doc, after_serialization)?);
    }
    for spec in index_specs {
        lines.push(serialize_record(&index_created_record(spec), after_serialization)?);
    }
    storage.rewrite_all(lines)?;
    events.notify_compaction_done();
    Ok(())
}

pub fn index_removed_line(field_name: &str, after_serialization: Option<&SerializeHook>) -> Result<String> {
    serialize_record(&index_removed_record(field_name), after_serialization)
}

pub fn index_created_line(spec: &IndexSpec, after_serialization: Option<&SerializeHook>) -> Result<String> {
    serialize_record(&index_created_record(spec), after_serialization)
}

/// Probes a `before`/`after` hook pair with random strings to confirm they
/// are inverses of one another before the collection is allowed to open.
pub fn validate_hook_bijection(
    before_deserialization: &DeserializeHook,
    after_serialization: &SerializeHook,
) -> Result<()> {
    let mut rng = rand::rng();
    for _ in 0..30 {
        let len = rng.random_range(0..256usize);
        let sample: String = (0..len).map(|_| rng.random_range(b'!'..=b'~') as char).collect();
        let round_tripped = before_deserialization(&after_serialization(&sample));
        if round_tripped != sample {
            return Err(Error::InvalidOptions(
                "beforeDeserialization/afterSerialization hooks are not inverses of one another".to_string(),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn treat_raw_data_replays_insert_update_delete() {
        let lines = vec![
            json!({"_id": "1", "a": 1}).to_string(),
            json!({"_id": "2", "a": 2}).to_string(),
            json!({"_id": "1", "a": 99}).to_string(),
            json!({"_id": "2", "$$deleted": true}).to_string(),
        ];
        let state = treat_raw_data(&lines, None, 0.1).unwrap();
        assert_eq!(state.docs.len(), 1);
        assert_eq!(state.docs["1"]["a"], json!(99));
    }

    #[test]
    fn treat_raw_data_tracks_index_specs() {
        let spec = IndexSpec { field_name: "a".into(), unique: true, sparse: false, expire_after_seconds: None };
        let lines = vec![index_created_line(&spec, None).unwrap(), index_removed_line("a", None).unwrap()];
        let state = treat_raw_data(&lines, None, 0.1).unwrap();
        assert!(state.index_specs.is_empty());
    }

    #[test]
    fn treat_raw_data_rejects_excess_corruption() {
        let lines = vec!["not json".to_string(), "also not json".to_string(), json!({"_id": "1"}).to_string()];
        let result = treat_raw_data(&lines, None, 0.1);
        assert!(result.is_err());
    }

    #[test]
    fn blank_trailing_line_is_not_corruption() {
        let lines = vec![json!({"_id": "1"}).to_string(), String::new()];
        let state = treat_raw_data(&lines, None, 0.1).unwrap();
        assert_eq!(state.corrupt_lines, 0);
    }

    #[test]
    fn identity_hooks_are_a_valid_bijection() {
        let before: DeserializeHook = Arc::new(|s: &str| s.to_string());
        let after: SerializeHook = Arc::new(|s: &str| s.to_string());
        assert!(validate_hook_bijection(&before, &after).is_ok());
    }

    #[test]
    fn mismatched_hooks_are_rejected() {
        let before: DeserializeHook = Arc::new(|s: &str| s.to_string());
        let after: SerializeHook = Arc::new(|s: &str| format!("{s}x"));
        assert!(validate_hook_bijection(&before, &after).is_err());
    }
}
