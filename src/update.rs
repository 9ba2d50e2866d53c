//! The update-modifier language: `modify_doc(old, update)`.
//!
//! Grounded on the teacher's `update.rs` (operator dispatch over a fields
//! object per modifier, shared `resolve`/`set` path helpers — now
//! `value::resolve_path`/`value::set_path`), trimmed of `$mul`/`$rename`/
//! `$currentDate` (not part of this system) and extended with `$push`
//! `$each`/`$slice`, `$addToSet` `$each`, and a subquery-based `$pull`.

use std::cmp::Ordering;

use serde_json::{Map, Value as Json};

use crate::error::{Error, Result};
use crate::query;
use crate::value::{self, default_str_compare};

/// Applies `update` to `old`, returning the new document. `old`'s `_id` is
/// always preserved; attempting to change it is an error. If `update`
/// contains no `$`-prefixed keys it is treated as a full replacement;
/// mixing modifier keys and plain fields is an error.
pub fn modify_doc(old: &Json, update: &Json) -> Result<Json> {
    let update_obj = update
        .as_object()
        .ok_or_else(|| Error::InvalidQuery("update document must be an object".to_string()))?;

    let has_modifiers = update_obj.keys().any(|k| k.starts_with('$'));
    let all_modifiers = update_obj.keys().all(|k| k.starts_with('$'));
    if has_modifiers && !all_modifiers {
        return Err(Error::MixedFieldsAndModifiers);
    }

    let new_doc = if !has_modifiers {
        let mut replacement = update.clone();
        if let Some(map) = replacement.as_object_mut() {
            match (old.get("_id"), map.get("_id")) {
                (Some(old_id), Some(new_id)) if old_id != new_id => return Err(Error::IdImmutable),
                (Some(old_id), None) => {
                    map.insert("_id".to_string(), old_id.clone());
                }
                _ => {}
            }
        }
        replacement
    } else {
        let mut doc = old.clone();
        for (op, fields) in update_obj {
            let fields = fields
                .as_object()
                .ok_or_else(|| Error::InvalidModifier(format!("{op} requires an object argument")))?;
            match op.as_str() {
                "$set" => apply_set(&mut doc, fields),
                "$unset" => apply_unset(&mut doc, fields),
                "$inc" => apply_inc(&mut doc, fields)?,
                "$min" => apply_min_max(&mut doc, fields, Ordering::Less)?,
                "$max" => apply_min_max(&mut doc, fields, Ordering::Greater)?,
                "$push" => apply_push(&mut doc, fields)?,
                "$addToSet" => apply_add_to_set(&mut doc, fields)?,
                "$pop" => apply_pop(&mut doc, fields)?,
                "$pull" => apply_pull(&mut doc, fields)?,
                other => return Err(Error::InvalidModifier(format!("unknown modifier '{other}'"))),
            }
        }
        if doc.get("_id") != old.get("_id") {
            return Err(Error::IdImmutable);
        }
        doc
    };

    value::validate_keys_recursive(&new_doc)?;
    Ok(new_doc)
}

fn apply_set(doc: &mut Json, fields: &Map<String, Json>) {
    for (path, v) in fields {
        value::set_path(doc, path, v.clone());
    }
}

fn apply_unset(doc: &mut Json, fields: &Map<String, Json>) {
    for path in fields.keys() {
        value::unset_path(doc, path);
    }
}

fn as_f64(v: &Json) -> Option<f64> {
    v.as_f64()
}

fn number_to_json(n: f64) -> Json {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Json::from(n as i64)
    } else {
        serde_json::Number::from_f64(n).map(Json::Number).unwrap_or(Json::Null)
    }
}

fn apply_inc(doc: &mut Json, fields: &Map<String, Json>) -> Result<()> {
    for (path, delta) in fields {
        let delta = as_f64(delta)
            .ok_or_else(|| Error::InvalidModifier(format!("$inc on '{path}' requires a number")))?;
        let current = value::resolve_path(doc, path);
        let base = match &current {
            None => 0.0,
            Some(v) => as_f64(v)
                .ok_or_else(|| Error::InvalidModifier(format!("$inc on '{path}' requires a numeric field")))?,
        };
        value::set_path(doc, path, number_to_json(base + delta));
    }
    Ok(())
}

fn apply_min_max(doc: &mut Json, fields: &Map<String, Json>, want: Ordering) -> Result<()> {
    for (path, candidate) in fields {
        let current = value::resolve_path(doc, path);
        let should_set = match &current {
            None => true,
            Some(v) => value::compare(candidate, v, &default_str_compare) == want,
        };
        if should_set {
            value::set_path(doc, path, candidate.clone());
        }
    }
    Ok(())
}

fn each_and_slice(spec: &Json) -> Result<(Vec<Json>, Option<i64>)> {
    match spec {
        Json::Object(m) if m.contains_key("$each") => {
            let each = m
                .get("$each")
                .and_then(Json::as_array)
                .ok_or_else(|| Error::InvalidModifier("$each requires an array".to_string()))?
                .clone();
            let slice = m.get("$slice").and_then(Json::as_i64);
            Ok((each, slice))
        }
        other => Ok((vec![other.clone()], None)),
    }
}

fn apply_push(doc: &mut Json, fields: &Map<String, Json>) -> Result<()> {
    for (path, spec) in fields {
        let (items, slice) = each_and_slice(spec)?;
        let current = value::resolve_path(doc, path);
        let mut arr = match current {
            Some(Json::Array(a)) => a,
            None => Vec::new(),
            Some(_) => return Err(Error::InvalidModifier(format!("$push on '{path}' requires an array field"))),
        };
        arr.extend(items);
        if let Some(n) = slice {
            apply_slice(&mut arr, n);
        }
        value::set_path(doc, path, Json::Array(arr));
    }
    Ok(())
}

fn apply_slice(arr: &mut Vec<Json>, n: i64) {
    let len = arr.len() as i64;
    if n >= 0 {
        let keep = n.min(len) as usize;
        arr.truncate(keep);
    } else {
        let keep = (-n).min(len) as usize;
        let drop = arr.len() - keep;
        arr.drain(0..drop);
    }
}

fn apply_add_to_set(doc: &mut Json, fields: &Map<String, Json>) -> Result<()> {
    for (path, spec) in fields {
        let (items, _) = each_and_slice(spec)?;
        let current = value::resolve_path(doc, path);
        let mut arr = match current {
            Some(Json::Array(a)) => a,
            None => Vec::new(),
            Some(_) => {
                return Err(Error::InvalidModifier(format!("$addToSet on '{path}' requires an array field")))
            }
        };
        for item in items {
            let already_present = arr.iter().any(|e| value::things_equal(Some(e), Some(&item)));
            if !already_present {
                arr.push(item);
            }
        }
        value::set_path(doc, path, Json::Array(arr));
    }
    Ok(())
}

fn apply_pop(doc: &mut Json, fields: &Map<String, Json>) -> Result<()> {
    for (path, dir) in fields {
        let dir = dir
            .as_i64()
            .ok_or_else(|| Error::InvalidModifier(format!("$pop on '{path}' requires an integer")))?;
        if dir == 0 {
            continue;
        }
        let current = value::resolve_path(doc, path);
        let mut arr = match current {
            Some(Json::Array(a)) => a,
            None => continue,
            Some(_) => return Err(Error::InvalidModifier(format!("$pop on '{path}' requires an array field"))),
        };
        if arr.is_empty() {
            continue;
        }
        if dir > 0 {
            arr.pop();
        } else {
            arr.remove(0);
        }
        value::set_path(doc, path, Json::Array(arr));
    }
    Ok(())
}

fn apply_pull(doc: &mut Json, fields: &Map<String, Json>) -> Result<()> {
    for (path, condition) in fields {
        let current = value::resolve_path(doc, path);
        let arr = match current {
            Some(Json::Array(a)) => a,
            None => continue,
            Some(_) => return Err(Error::InvalidModifier(format!("$pull on '{path}' requires an array field"))),
        };
        let is_subquery = matches!(condition, Json::Object(m) if m.keys().all(|k| k.starts_with('$')) && !m.is_empty());
        let kept: Vec<Json> = arr
            .into_iter()
            .filter(|elem| {
                let matched = if is_subquery {
                    let mut wrapped_doc = Map::new();
                    wrapped_doc.insert("__elem__".to_string(), elem.clone());
                    let mut wrapped_query = Map::new();
                    wrapped_query.insert("__elem__".to_string(), condition.clone());
                    query::matches(&Json::Object(wrapped_doc), &Json::Object(wrapped_query), None).unwrap_or(false)
                } else {
                    value::things_equal(Some(elem), Some(condition))
                };
                !matched
            })
            .collect();
        value::set_path(doc, path, Json::Array(kept));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn full_replacement_preserves_id() {
        let old = json!({"_id": "x", "a": 1});
        let new = modify_doc(&old, &json!({"a": 2})).unwrap();
        assert_eq!(new, json!({"_id": "x", "a": 2}));
    }

    #[test]
    fn full_replacement_rejects_changing_id() {
        let old = json!({"_id": "x", "a": 1});
        assert!(modify_doc(&old, &json!({"_id": "y", "a": 2})).is_err());
    }

    #[test]
    fn mixing_modifiers_and_plain_fields_errors() {
        let old = json!({"_id": "x"});
        assert!(modify_doc(&old, &json!({"$set": {"a": 1}, "b": 2})).is_err());
    }

    #[test]
    fn set_and_unset() {
        let old = json!({"_id": "x", "a": 1, "b": 2});
        let new = modify_doc(&old, &json!({"$set": {"a": 5}, "$unset": {"b": ""}})).unwrap();
        assert_eq!(new, json!({"_id": "x", "a": 5}));
    }

    #[test]
    fn inc_creates_missing_field() {
        let old = json!({"_id": "x"});
        let new = modify_doc(&old, &json!({"$inc": {"a": 3}})).unwrap();
        assert_eq!(new["a"], json!(3));
    }

    #[test]
    fn inc_on_non_numeric_errors() {
        let old = json!({"_id": "x", "a": "s"});
        assert!(modify_doc(&old, &json!({"$inc": {"a": 1}})).is_err());
    }

    #[test]
    fn min_max() {
        let old = json!({"_id": "x", "a": 5});
        assert_eq!(modify_doc(&old, &json!({"$min": {"a": 3}})).unwrap()["a"], json!(3));
        assert_eq!(modify_doc(&old, &json!({"$max": {"a": 3}})).unwrap()["a"], json!(5));
    }

    #[test]
    fn push_with_each_and_slice() {
        let old = json!({"_id": "x", "a": [1, 2]});
        let new = modify_doc(&old, &json!({"$push": {"a": {"$each": [3, 4], "$slice": -2}}})).unwrap();
        assert_eq!(new["a"], json!([3, 4]));
    }

    #[test]
    fn add_to_set_deduplicates() {
        let old = json!({"_id": "x", "a": [1, 2]});
        let new = modify_doc(&old, &json!({"$addToSet": {"a": {"$each": [2, 3]}}})).unwrap();
        assert_eq!(new["a"], json!([1, 2, 3]));
    }

    #[test]
    fn pop_front_and_back() {
        let old = json!({"_id": "x", "a": [1, 2, 3]});
        assert_eq!(modify_doc(&old, &json!({"$pop": {"a": 1}})).unwrap()["a"], json!([1, 2]));
        assert_eq!(modify_doc(&old, &json!({"$pop": {"a": -1}})).unwrap()["a"], json!([2, 3]));
    }

    #[test]
    fn pull_by_equality_and_subquery() {
        let old = json!({"_id": "x", "a": [1, 2, 3, 4]});
        assert_eq!(modify_doc(&old, &json!({"$pull": {"a": 2}})).unwrap()["a"], json!([1, 3, 4]));
        assert_eq!(
            modify_doc(&old, &json!({"$pull": {"a": {"$gt": 2}}})).unwrap()["a"],
            json!([1, 2])
        );
    }

    #[test]
    fn post_modification_key_validation() {
        let old = json!({"_id": "x"});
        let result = modify_doc(&old, &json!({"$set": {"$evil": 1}}));
        assert!(result.is_err());
    }
}
