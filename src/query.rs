//! The predicate language: `matches(document, query)`.
//!
//! Grounded on the teacher's `query.rs` (operator-document detection via
//! "any key starts with `$`", the `$and`/`$or` array handling, and the
//! index-acceleration entry point), generalized to the full operator set
//! this system needs: `$not`, `$where`, `$nin`, `$size`, `$elemMatch`, and
//! array "any element matches" semantics with a whole-array-equality
//! override. Regex and comparison operators only match within the same
//! primitive type, mirroring the teacher's type-segregated comparison
//! rather than coercing across types.

use std::cmp::Ordering;
use std::sync::Arc;

use regex::Regex;
use serde_json::Value as Json;

use crate::error::{Error, Result};
use crate::value::{self, default_str_compare};

/// A user-supplied `$where` predicate, invoked with the top-level document
/// being tested (matching this language's own semantics: `$where` always
/// sees the whole document, even nested inside `$and`/`$or`).
pub type WherePredicate = Arc<dyn Fn(&Json) -> bool + Send + Sync>;

const COMPARISON_OPS: &[&str] = &["$lt", "$lte", "$gt", "$gte", "$ne", "$in", "$nin", "$regex", "$exists", "$size", "$elemMatch", "$options"];

fn is_operator_key(k: &str) -> bool {
    k.starts_with('$')
}

fn is_operator_document(map: &serde_json::Map<String, Json>) -> Result<bool> {
    let any_op = map.keys().any(|k| is_operator_key(k));
    if !any_op {
        return Ok(false);
    }
    let all_op = map.keys().all(|k| is_operator_key(k));
    if !all_op {
        return Err(Error::InvalidQuery(
            "operator documents cannot mix '$'-prefixed operators with plain fields".to_string(),
        ));
    }
    Ok(true)
}

/// Evaluates `query` against `doc`. `where_fn` is consulted whenever a
/// `$where` key is encountered anywhere in the query tree.
pub fn matches(doc: &Json, query: &Json, where_fn: Option<&WherePredicate>) -> Result<bool> {
    let obj = query
        .as_object()
        .ok_or_else(|| Error::InvalidQuery("query must be an object".to_string()))?;

    for (key, clause) in obj {
        let ok = match key.as_str() {
            "$and" => {
                let arr = clause
                    .as_array()
                    .ok_or_else(|| Error::InvalidQuery("$and requires an array".to_string()))?;
                let mut all = true;
                for sub in arr {
                    if !matches(doc, sub, where_fn)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$or" => {
                let arr = clause
                    .as_array()
                    .ok_or_else(|| Error::InvalidQuery("$or requires an array".to_string()))?;
                let mut any = false;
                for sub in arr {
                    if matches(doc, sub, where_fn)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            "$not" => !matches(doc, clause, where_fn)?,
            "$where" => match where_fn {
                Some(f) => f(doc),
                None => return Err(Error::InvalidQuery("$where predicate was not supplied".to_string())),
            },
            field => matches_field(doc, field, clause)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn matches_field(doc: &Json, field: &str, clause: &Json) -> Result<bool> {
    let actual = value::resolve_path(doc, field);

    if let Json::Object(map) = clause {
        if !value::is_date(clause) && is_operator_document(map)? {
            // $size/$elemMatch are array-specific: they always apply to the
            // whole array. Every other operator applies per-element against
            // an array-valued field ("any element matches").
            let array_specific = map.keys().any(|k| k == "$size" || k == "$elemMatch");
            if !array_specific {
                if let Some(Json::Array(items)) = &actual {
                    for item in items {
                        if apply_all_operators(&Some(item.clone()), map)? {
                            return Ok(true);
                        }
                    }
                    return Ok(false);
                }
            }
            return apply_all_operators(&actual, map);
        }
    }

    Ok(matches_value_clause(actual.as_ref(), clause))
}

fn apply_all_operators(actual: &Option<Json>, map: &serde_json::Map<String, Json>) -> Result<bool> {
    for (op, arg) in map {
        if op == "$options" {
            continue; // consumed alongside $regex below
        }
        if !apply_operator(actual, op, arg, map)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Plain (non-operator) value matching, with array "any element" semantics.
fn matches_value_clause(actual: Option<&Json>, clause: &Json) -> bool {
    match actual {
        Some(Json::Array(items)) if !matches!(clause, Json::Array(_)) => {
            items.iter().any(|e| value::things_equal(Some(e), Some(clause)))
        }
        _ => value::things_equal(actual, Some(clause)),
    }
}

fn apply_operator(
    actual: &Option<Json>,
    op: &str,
    arg: &Json,
    siblings: &serde_json::Map<String, Json>,
) -> Result<bool> {
    match op {
        "$lt" | "$lte" | "$gt" | "$gte" => Ok(compare_same_type(actual.as_ref(), arg, op)),
        "$ne" => Ok(match actual {
            None => true,
            Some(a) => !value::things_equal(Some(a), Some(arg)),
        }),
        "$in" => {
            let candidates = arg
                .as_array()
                .ok_or_else(|| Error::InvalidQuery("$in requires an array".to_string()))?;
            Ok(candidates.iter().any(|c| value::things_equal(actual.as_ref(), Some(c))))
        }
        "$nin" => {
            let candidates = arg
                .as_array()
                .ok_or_else(|| Error::InvalidQuery("$nin requires an array".to_string()))?;
            Ok(!candidates.iter().any(|c| value::things_equal(actual.as_ref(), Some(c))))
        }
        "$regex" => {
            let pattern = arg
                .as_str()
                .ok_or_else(|| Error::InvalidQuery("$regex requires a string pattern".to_string()))?;
            let options = siblings.get("$options").and_then(Json::as_str).unwrap_or("");
            let pattern = if options.contains('i') {
                format!("(?i){pattern}")
            } else {
                pattern.to_string()
            };
            let re = Regex::new(&pattern).map_err(|e| Error::InvalidQuery(format!("invalid regex: {e}")))?;
            Ok(match actual {
                Some(Json::String(s)) => re.is_match(s),
                _ => false,
            })
        }
        "$exists" => {
            let want = truthy(arg);
            Ok(want != actual.is_none())
        }
        "$size" => {
            let n = arg
                .as_i64()
                .ok_or_else(|| Error::InvalidQuery("$size requires an integer".to_string()))?;
            Ok(match actual {
                Some(Json::Array(items)) => items.len() as i64 == n,
                _ => false,
            })
        }
        "$elemMatch" => Ok(match actual {
            Some(Json::Array(items)) => {
                let sub_is_operator =
                    matches!(arg, Json::Object(m) if !value::is_date(arg) && is_operator_document(m).unwrap_or(false));
                items.iter().any(|e| {
                    if sub_is_operator {
                        let wrapped = serde_json::json!({ "__elem__": e });
                        matches_field(&wrapped, "__elem__", arg).unwrap_or(false)
                    } else {
                        matches(e, arg, None).unwrap_or(false)
                    }
                })
            }
            _ => false,
        }),
        other => Err(Error::InvalidQuery(format!("unknown operator '{other}'"))),
    }
}

fn truthy(v: &Json) -> bool {
    match v {
        Json::Null => false,
        Json::Bool(b) => *b,
        Json::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Json::String(s) => !s.is_empty(),
        Json::Array(_) | Json::Object(_) => true,
    }
}

fn same_primitive_type(a: &Json, b: &Json) -> bool {
    match (a, b) {
        (Json::Number(_), Json::Number(_)) => true,
        (Json::String(_), Json::String(_)) => true,
        (a, b) if value::is_date(a) && value::is_date(b) => true,
        _ => false,
    }
}

fn compare_same_type(actual: Option<&Json>, arg: &Json, op: &str) -> bool {
    let actual = match actual {
        Some(a) => a,
        None => return false,
    };
    if !same_primitive_type(actual, arg) {
        return false;
    }
    let c = value::compare(actual, arg, &default_str_compare);
    match op {
        "$lt" => c == Ordering::Less,
        "$lte" => c != Ordering::Greater,
        "$gt" => c == Ordering::Greater,
        "$gte" => c != Ordering::Less,
        _ => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn m(doc: &Json, q: &Json) -> bool {
        matches(doc, q, None).unwrap()
    }

    #[test]
    fn plain_equality() {
        assert!(m(&json!({"a": 1}), &json!({"a": 1})));
        assert!(!m(&json!({"a": 1}), &json!({"a": 2})));
    }

    #[test]
    fn and_or_not() {
        let doc = json!({"a": 1, "b": 2});
        assert!(m(&doc, &json!({"$and": [{"a": 1}, {"b": 2}]})));
        assert!(!m(&doc, &json!({"$and": [{"a": 1}, {"b": 3}]})));
        assert!(m(&doc, &json!({"$or": [{"a": 9}, {"b": 2}]})));
        assert!(m(&doc, &json!({"$not": {"a": 2}})));
    }

    #[test]
    fn comparison_operators_same_type_only() {
        assert!(m(&json!({"a": 5}), &json!({"a": {"$gt": 1}})));
        assert!(!m(&json!({"a": "5"}), &json!({"a": {"$gt": 1}})));
    }

    #[test]
    fn ne_true_for_undefined() {
        assert!(m(&json!({}), &json!({"a": {"$ne": 1}})));
    }

    #[test]
    fn in_and_nin() {
        assert!(m(&json!({"a": 2}), &json!({"a": {"$in": [1, 2, 3]}})));
        assert!(m(&json!({"a": 9}), &json!({"a": {"$nin": [1, 2, 3]}})));
    }

    #[test]
    fn exists_operator() {
        assert!(m(&json!({"a": 1}), &json!({"a": {"$exists": true}})));
        assert!(m(&json!({}), &json!({"a": {"$exists": false}})));
    }

    #[test]
    fn size_operator() {
        assert!(m(&json!({"a": [1, 2, 3]}), &json!({"a": {"$size": 3}})));
        assert!(!m(&json!({"a": [1, 2]}), &json!({"a": {"$size": 3}})));
    }

    #[test]
    fn array_any_element_matches() {
        assert!(m(&json!({"a": [1, 2, 3]}), &json!({"a": 2})));
        assert!(!m(&json!({"a": [1, 2, 3]}), &json!({"a": 9})));
    }

    #[test]
    fn array_vs_array_is_whole_equality() {
        assert!(m(&json!({"a": [1, 2]}), &json!({"a": [1, 2]})));
        assert!(!m(&json!({"a": [1, 2, 3]}), &json!({"a": [1, 2]})));
    }

    #[test]
    fn operator_on_array_field_matches_any_element() {
        assert!(m(&json!({"tags": ["a", "b"]}), &json!({"tags": {"$in": ["a"]}})));
        assert!(m(&json!({"a": [1, 10]}), &json!({"a": {"$gt": 5}})));
        assert!(!m(&json!({"a": [1, 2]}), &json!({"a": {"$gt": 5}})));
    }

    #[test]
    fn elem_match_with_operators() {
        let doc = json!({"a": [1, 5, 10]});
        assert!(m(&doc, &json!({"a": {"$elemMatch": {"$gt": 4, "$lt": 8}}})));
    }

    #[test]
    fn regex_operator_with_options() {
        assert!(m(&json!({"a": "Hello"}), &json!({"a": {"$regex": "^hello$", "$options": "i"}})));
    }

    #[test]
    fn tagged_date_equality_is_not_an_operator_document() {
        let doc = json!({"exp": {"$$date": 123}});
        assert!(m(&doc, &json!({"exp": {"$$date": 123}})));
        assert!(!m(&doc, &json!({"exp": {"$$date": 124}})));
    }

    #[test]
    fn mixed_operator_and_plain_keys_is_error() {
        let result = matches(&json!({"a": 1}), &json!({"a": {"$gt": 0, "b": 1}}), None);
        assert!(result.is_err());
    }

    #[test]
    fn where_predicate_invoked_with_document() {
        let pred: WherePredicate = Arc::new(|d: &Json| d.get("a").and_then(Json::as_i64) == Some(1));
        assert!(matches(&json!({"a": 1}), &json!({"$where": true}), Some(&pred)).unwrap());
    }
}
