//! Canonical value ordering, equality, dot-path access, and key validation.
//!
//! Documents are represented as plain `serde_json::Value` trees. Dates have
//! no native JSON representation, so this module (and everything built on
//! it) represents a date uniformly, at rest and in memory, as a single-key
//! object `{"$$date": <milliseconds since epoch>}`. Every comparison,
//! equality check, and dot-path traversal in the crate goes through the
//! functions here rather than through `serde_json::Value`'s own `PartialEq`/
//! `PartialOrd`, which do not implement this system's rules for arrays,
//! dates, or cross-type comparison.

use std::cmp::Ordering;

use serde_json::{Map, Number, Value as Json};

use crate::error::{Error, Result};

/// A pluggable string comparator, used for locale-sensitive sort.
pub type StrCompare = dyn Fn(&str, &str) -> Ordering + Send + Sync;

pub fn default_str_compare(a: &str, b: &str) -> Ordering {
    a.cmp(b)
}

const DATE_TAG: &str = "$$date";

/// Reserved key names permitted to start with `$`.
fn is_sentinel_key(key: &str) -> bool {
    matches!(key, "$$date" | "$$deleted" | "$$indexCreated" | "$$indexRemoved")
}

/// Builds the canonical tagged representation of a date.
pub fn make_date(epoch_millis: i64) -> Json {
    let mut m = Map::with_capacity(1);
    m.insert(DATE_TAG.to_string(), Json::Number(epoch_millis.into()));
    Json::Object(m)
}

/// Returns the millisecond timestamp if `v` is a tagged date object.
pub fn as_date_millis(v: &Json) -> Option<i64> {
    match v {
        Json::Object(m) if m.len() == 1 => m.get(DATE_TAG).and_then(Number::as_i64),
        _ => None,
    }
}

pub fn is_date(v: &Json) -> bool {
    as_date_millis(v).is_some()
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ---------------------------------------------------------------------
// Key-name validation
// ---------------------------------------------------------------------

/// Validates a single key in isolation: no dots, no leading `$` unless it
/// is one of the reserved sentinel forms used by persisted meta-records.
pub fn validate_key(key: &str) -> Result<()> {
    if key.contains('.') {
        return Err(Error::InvalidKey(key.to_string()));
    }
    if key.starts_with('$') && !is_sentinel_key(key) {
        return Err(Error::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Recursively validates every key in a document tree.
pub fn validate_keys_recursive(v: &Json) -> Result<()> {
    match v {
        Json::Object(m) if as_date_millis(v).is_some() => {
            let _ = m;
            Ok(())
        }
        Json::Object(m) => {
            for (k, val) in m {
                validate_key(k)?;
                validate_keys_recursive(val)?;
            }
            Ok(())
        }
        Json::Array(items) => {
            for item in items {
                validate_keys_recursive(item)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

// ---------------------------------------------------------------------
// Ordering
// ---------------------------------------------------------------------

fn type_rank(v: &Json) -> u8 {
    match v {
        Json::Null => 1,
        Json::Number(_) => 2,
        Json::String(_) => 3,
        Json::Bool(_) => 4,
        Json::Object(_) if as_date_millis(v).is_some() => 5,
        Json::Array(_) => 6,
        Json::Object(_) => 7,
    }
}

/// Total order over `Option<&Json>`, where `None` stands for "undefined"
/// and ranks below everything else, including `null`.
pub fn compare_opt(a: Option<&Json>, b: Option<&Json>, strcmp: &StrCompare) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => compare(x, y, strcmp),
    }
}

/// Total order between two present values.
pub fn compare(a: &Json, b: &Json, strcmp: &StrCompare) -> Ordering {
    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (Json::Null, Json::Null) => Ordering::Equal,
        (Json::Number(x), Json::Number(y)) => x
            .as_f64()
            .unwrap_or(f64::NAN)
            .partial_cmp(&y.as_f64().unwrap_or(f64::NAN))
            .unwrap_or(Ordering::Equal),
        (Json::String(x), Json::String(y)) => strcmp(x, y),
        (Json::Bool(x), Json::Bool(y)) => x.cmp(y),
        (Json::Object(_), Json::Object(_)) if ra == 5 => {
            let (dx, dy) = (as_date_millis(a).unwrap(), as_date_millis(b).unwrap());
            dx.cmp(&dy)
        }
        (Json::Array(x), Json::Array(y)) => compare_arrays(x, y, strcmp),
        (Json::Object(x), Json::Object(y)) => compare_objects(x, y, strcmp),
        _ => Ordering::Equal,
    }
}

fn compare_arrays(x: &[Json], y: &[Json], strcmp: &StrCompare) -> Ordering {
    for (xi, yi) in x.iter().zip(y.iter()) {
        let c = compare(xi, yi, strcmp);
        if c != Ordering::Equal {
            return c;
        }
    }
    x.len().cmp(&y.len())
}

fn compare_objects(x: &Map<String, Json>, y: &Map<String, Json>, strcmp: &StrCompare) -> Ordering {
    let mut xk: Vec<&String> = x.keys().collect();
    let mut yk: Vec<&String> = y.keys().collect();
    xk.sort();
    yk.sort();

    for (a, b) in xk.iter().zip(yk.iter()) {
        let c = strcmp(a, b);
        if c != Ordering::Equal {
            return c;
        }
    }
    let key_len_cmp = xk.len().cmp(&yk.len());
    if key_len_cmp != Ordering::Equal {
        return key_len_cmp;
    }

    for k in &xk {
        let c = compare(x.get(*k).unwrap(), y.get(*k).unwrap(), strcmp);
        if c != Ordering::Equal {
            return c;
        }
    }
    x.len().cmp(&y.len())
}

// ---------------------------------------------------------------------
// Equality ("thingsEqual")
// ---------------------------------------------------------------------

/// Equality used by queries and unique-index membership checks. Differs
/// from [`compare`]: `undefined` (`None`) is never equal to anything, and
/// an array never compares equal to a non-array — two arrays compare
/// equal element-wise. Array "any element" membership is handled
/// separately by the query layer.
pub fn things_equal(a: Option<&Json>, b: Option<&Json>) -> bool {
    match (a, b) {
        (None, _) | (_, None) => false,
        (Some(x), Some(y)) => values_equal(x, y),
    }
}

fn values_equal(a: &Json, b: &Json) -> bool {
    if matches!(a, Json::Array(_)) != matches!(b, Json::Array(_)) {
        return false;
    }
    match (a, b) {
        (Json::Null, Json::Null) => true,
        (Json::Bool(x), Json::Bool(y)) => x == y,
        (Json::Number(x), Json::Number(y)) => x.as_f64() == y.as_f64(),
        (Json::String(x), Json::String(y)) => x == y,
        (Json::Array(x), Json::Array(y)) => x.len() == y.len() && x.iter().zip(y).all(|(e1, e2)| values_equal(e1, e2)),
        (Json::Object(x), Json::Object(y)) => {
            let (dx, dy) = (as_date_millis(a), as_date_millis(b));
            match (dx, dy) {
                (Some(mx), Some(my)) => mx == my,
                (None, None) => {
                    x.len() == y.len()
                        && x.iter().all(|(k, v)| y.get(k).is_some_and(|v2| values_equal(v, v2)))
                }
                _ => false,
            }
        }
        _ => false,
    }
}

// ---------------------------------------------------------------------
// Dot-path access
// ---------------------------------------------------------------------

/// Resolves a dot-path against a document. Numeric segments index into
/// arrays; non-numeric segments project the remaining path over each
/// element of an array, producing an array of results. Returns `None` for
/// "undefined".
pub fn resolve_path(doc: &Json, path: &str) -> Option<Json> {
    if path.is_empty() {
        return Some(doc.clone());
    }
    let (head, rest) = match path.split_once('.') {
        Some((h, r)) => (h, r),
        None => (path, ""),
    };
    match doc {
        Json::Array(items) => {
            if let Ok(idx) = head.parse::<usize>() {
                let elem = items.get(idx)?;
                if rest.is_empty() {
                    Some(elem.clone())
                } else {
                    resolve_path(elem, rest)
                }
            } else {
                let projected: Vec<Json> =
                    items.iter().filter_map(|elem| resolve_path(elem, path)).collect();
                Some(Json::Array(projected))
            }
        }
        Json::Object(map) => {
            let next = map.get(head)?;
            if rest.is_empty() {
                Some(next.clone())
            } else {
                resolve_path(next, rest)
            }
        }
        _ => None,
    }
}

/// Sets a value at a dot-path, creating intermediate objects as needed.
pub fn set_path(doc: &mut Json, path: &str, value: Json) {
    let (head, rest) = match path.split_once('.') {
        Some((h, r)) => (h, r),
        None => (path, ""),
    };
    if !doc.is_object() {
        *doc = Json::Object(Map::new());
    }
    let map = doc.as_object_mut().unwrap();
    if rest.is_empty() {
        map.insert(head.to_string(), value);
        return;
    }
    let entry = map.entry(head.to_string()).or_insert_with(|| Json::Object(Map::new()));
    set_path(entry, rest, value)
}

/// Removes a value at a dot-path. A no-op if the path does not exist.
pub fn unset_path(doc: &mut Json, path: &str) {
    let (head, rest) = match path.split_once('.') {
        Some((h, r)) => (h, r),
        None => (path, ""),
    };
    if let Some(map) = doc.as_object_mut() {
        if rest.is_empty() {
            map.remove(head);
        } else if let Some(next) = map.get_mut(head) {
            unset_path(next, rest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cmp(a: &Json, b: &Json) -> Ordering {
        compare(a, b, &default_str_compare)
    }

    #[test]
    fn type_ordering_is_total() {
        let vals = vec![
            json!(null),
            json!(1),
            json!("s"),
            json!(true),
            make_date(5),
            json!([1, 2]),
            json!({"a": 1}),
        ];
        for w in vals.windows(2) {
            assert_eq!(cmp(&w[0], &w[1]), Ordering::Less, "{:?} should be < {:?}", w[0], w[1]);
        }
    }

    #[test]
    fn undefined_ranks_below_null() {
        assert_eq!(compare_opt(None, Some(&json!(null)), &default_str_compare), Ordering::Less);
    }

    #[test]
    fn numbers_compare_numerically() {
        assert_eq!(cmp(&json!(2), &json!(10)), Ordering::Less);
    }

    #[test]
    fn dates_compare_by_millis() {
        assert_eq!(cmp(&make_date(1), &make_date(2)), Ordering::Less);
    }

    #[test]
    fn arrays_compare_lexicographically() {
        assert_eq!(cmp(&json!([1, 2]), &json!([1, 3])), Ordering::Less);
        assert_eq!(cmp(&json!([1]), &json!([1, 0])), Ordering::Less);
    }

    #[test]
    fn things_equal_rejects_undefined() {
        assert!(!things_equal(None, None));
        assert!(!things_equal(None, Some(&json!(null))));
    }

    #[test]
    fn things_equal_arrays_always_unequal() {
        assert!(!things_equal(Some(&json!([1, 2])), Some(&json!([1, 2]))));
    }

    #[test]
    fn things_equal_objects_by_keyset() {
        assert!(things_equal(Some(&json!({"a": 1, "b": 2})), Some(&json!({"b": 2, "a": 1}))));
        assert!(!things_equal(Some(&json!({"a": 1})), Some(&json!({"a": 1, "b": 2}))));
    }

    #[test]
    fn things_equal_dates_by_timestamp() {
        assert!(things_equal(Some(&make_date(10)), Some(&make_date(10))));
        assert!(!things_equal(Some(&make_date(10)), Some(&make_date(11))));
    }

    #[test]
    fn resolve_simple_path() {
        let doc = json!({"a": {"b": 5}});
        assert_eq!(resolve_path(&doc, "a.b"), Some(json!(5)));
        assert_eq!(resolve_path(&doc, "a.c"), None);
    }

    #[test]
    fn resolve_numeric_segment_indexes_array() {
        let doc = json!({"a": [10, 20, 30]});
        assert_eq!(resolve_path(&doc, "a.1"), Some(json!(20)));
    }

    #[test]
    fn resolve_non_numeric_segment_projects_over_array() {
        let doc = json!({"a": [{"b": 1}, {"b": 2}, {}]});
        assert_eq!(resolve_path(&doc, "a.b"), Some(json!([1, 2])));
    }

    #[test]
    fn key_validation_rejects_dots_and_dollar() {
        assert!(validate_key("a.b").is_err());
        assert!(validate_key("$set").is_err());
        assert!(validate_key("$$deleted").is_ok());
        assert!(validate_key("name").is_ok());
    }

    #[test]
    fn set_and_unset_path() {
        let mut doc = json!({});
        set_path(&mut doc, "a.b", json!(1));
        assert_eq!(doc, json!({"a": {"b": 1}}));
        unset_path(&mut doc, "a.b");
        assert_eq!(doc, json!({"a": {}}));
    }
}
