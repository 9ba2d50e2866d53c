//! Ordered field indexes and the primary (`_id`) document store.
//!
//! Grounded on the teacher's `FieldIndex` (a `BTreeMap`-of-`BTreeSet` ordered
//! multimap with an optional uniqueness check), generalized with the
//! atomic insert/remove/update/revert-update rollback contract this system
//! requires and with sparse and array-field support. Unlike the teacher's
//! version, a single index's insert can itself partially fail across the
//! several keys contributed by an array-valued field — that partial
//! failure must roll back within this module, not just at the collection
//! level.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde_json::Value as Json;

use crate::document::{self, DocumentId};
use crate::error::{Error, Result};
use crate::value::{self, default_str_compare};

#[derive(Debug, Clone)]
struct IndexKey(Json);

impl PartialEq for IndexKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for IndexKey {}
impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        value::compare(&self.0, &other.0, &default_str_compare)
    }
}

/// A `$lt`/`$lte`/`$gt`/`$gte`-style range, used by `FieldIndex::get_between_bounds`.
#[derive(Debug, Default, Clone)]
pub struct Bounds {
    pub gt: Option<Json>,
    pub gte: Option<Json>,
    pub lt: Option<Json>,
    pub lte: Option<Json>,
}

/// Deduplicates array elements by `things_equal`-style equality (so dates
/// dedupe by timestamp, objects by key-set, etc.), preserving first-seen order.
fn unique_array_values(items: &[Json]) -> Vec<Json> {
    let mut out: Vec<Json> = Vec::new();
    'outer: for v in items {
        for existing in &out {
            if value::things_equal(Some(existing), Some(v)) {
                continue 'outer;
            }
        }
        out.push(v.clone());
    }
    out
}

/// An ordered index over one (possibly dotted) field.
#[derive(Debug)]
pub struct FieldIndex {
    pub field: String,
    pub unique: bool,
    pub sparse: bool,
    tree: BTreeMap<IndexKey, BTreeSet<DocumentId>>,
    /// Ids of documents for which `field` resolved to undefined. Only
    /// tracked when `!sparse`, so a non-sparse unique index can still
    /// enforce "at most one document missing the field".
    undefined_docs: BTreeSet<DocumentId>,
}

impl FieldIndex {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            unique: false,
            sparse: false,
            tree: BTreeMap::new(),
            undefined_docs: BTreeSet::new(),
        }
    }

    pub fn new_unique(field: impl Into<String>) -> Self {
        let mut s = Self::new(field);
        s.unique = true;
        s
    }

    pub fn sparse(mut self, sparse: bool) -> Self {
        self.sparse = sparse;
        self
    }

    fn resolve<'a>(&self, doc: &'a Json) -> Option<Json> {
        value::resolve_path(doc, &self.field)
    }

    fn insert_key(&mut self, value: Json, id: &str) -> Result<()> {
        let key = IndexKey(value.clone());
        let set = self.tree.entry(key).or_default();
        if self.unique && !set.is_empty() && !set.contains(id) {
            return Err(Error::UniqueViolated {
                field: self.field.clone(),
                key: value.to_string(),
            });
        }
        set.insert(id.to_string());
        Ok(())
    }

    fn remove_key(&mut self, value: &Json, id: &str) {
        let key = IndexKey(value.clone());
        if let Some(set) = self.tree.get_mut(&key) {
            set.remove(id);
            if set.is_empty() {
                self.tree.remove(&key);
            }
        }
    }

    /// Inserts one document. On failure, any keys already inserted for
    /// this same document (e.g. earlier elements of an array field) are
    /// rolled back before the error is returned.
    pub fn insert_doc(&mut self, id: &str, doc: &Json) -> Result<()> {
        match self.resolve(doc) {
            None => {
                if self.sparse {
                    return Ok(());
                }
                if self.unique && !self.undefined_docs.is_empty() && !self.undefined_docs.contains(id) {
                    return Err(Error::UniqueViolated {
                        field: self.field.clone(),
                        key: "undefined".to_string(),
                    });
                }
                self.undefined_docs.insert(id.to_string());
                Ok(())
            }
            Some(Json::Array(items)) => {
                let keys = unique_array_values(&items);
                let mut inserted = Vec::with_capacity(keys.len());
                for k in keys {
                    if let Err(e) = self.insert_key(k.clone(), id) {
                        for done in &inserted {
                            self.remove_key(done, id);
                        }
                        return Err(e);
                    }
                    inserted.push(k);
                }
                Ok(())
            }
            Some(v) => self.insert_key(v, id),
        }
    }

    /// Removes one document. Never fails — removal can't violate uniqueness.
    pub fn remove_doc(&mut self, id: &str, doc: &Json) {
        match self.resolve(doc) {
            None => {
                if !self.sparse {
                    self.undefined_docs.remove(id);
                }
            }
            Some(Json::Array(items)) => {
                for k in unique_array_values(&items) {
                    self.remove_key(&k, id);
                }
            }
            Some(v) => self.remove_key(&v, id),
        }
    }

    /// Removes `old`, inserts `new`. On failure the old state is restored
    /// (guaranteed to succeed, since removing never fails) and the error
    /// is propagated.
    pub fn update_doc(&mut self, id: &str, old: &Json, new: &Json) -> Result<()> {
        self.remove_doc(id, old);
        if let Err(e) = self.insert_doc(id, new) {
            self.insert_doc(id, old).expect("re-inserting prior state must not fail");
            return Err(e);
        }
        Ok(())
    }

    /// Undoes a previously applied `update_doc(id, old, new)`.
    pub fn revert_update(&mut self, id: &str, old: &Json, new: &Json) -> Result<()> {
        self.update_doc(id, new, old)
    }

    /// Vectorized update: removes every `old`, then inserts every `new`.
    /// On the first failed insert, every `new` already inserted in this
    /// batch is undone and every `old` is reinserted, so the index ends
    /// up exactly as it started.
    pub fn update_many(&mut self, changes: &[(DocumentId, Json, Json)]) -> Result<()> {
        for (id, old, _) in changes {
            self.remove_doc(id, old);
        }
        for (i, (id, _, new)) in changes.iter().enumerate() {
            if let Err(e) = self.insert_doc(id, new) {
                for (id2, _, new2) in &changes[..i] {
                    self.remove_doc(id2, new2);
                }
                for (id2, old2, _) in changes {
                    self.insert_doc(id2, old2).expect("re-inserting prior state must not fail");
                }
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn get_matching(&self, value: &Json) -> Vec<DocumentId> {
        match value {
            Json::Array(items) => {
                let mut seen = BTreeSet::new();
                for item in items {
                    if let Some(set) = self.tree.get(&IndexKey(item.clone())) {
                        seen.extend(set.iter().cloned());
                    }
                }
                seen.into_iter().collect()
            }
            _ => self
                .tree
                .get(&IndexKey(value.clone()))
                .map(|s| s.iter().cloned().collect())
                .unwrap_or_default(),
        }
    }

    pub fn get_between_bounds(&self, bounds: &Bounds) -> Vec<DocumentId> {
        let mut out = BTreeSet::new();
        for (key, set) in self.tree.iter() {
            if let Some(gt) = &bounds.gt {
                if value::compare(&key.0, gt, &default_str_compare) != Ordering::Greater {
                    continue;
                }
            }
            if let Some(gte) = &bounds.gte {
                if value::compare(&key.0, gte, &default_str_compare) == Ordering::Less {
                    continue;
                }
            }
            if let Some(lt) = &bounds.lt {
                if value::compare(&key.0, lt, &default_str_compare) != Ordering::Less {
                    continue;
                }
            }
            if let Some(lte) = &bounds.lte {
                if value::compare(&key.0, lte, &default_str_compare) == Ordering::Greater {
                    continue;
                }
            }
            out.extend(set.iter().cloned());
        }
        out.into_iter().collect()
    }

    pub fn get_all(&self) -> Vec<DocumentId> {
        let mut out: Vec<DocumentId> = self.tree.values().flat_map(|s| s.iter().cloned()).collect();
        out.extend(self.undefined_docs.iter().cloned());
        out
    }

    pub fn reset(&mut self) {
        self.tree.clear();
        self.undefined_docs.clear();
    }

    pub fn len(&self) -> usize {
        self.tree.values().map(|s| s.len()).sum::<usize>() + self.undefined_docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------
// Primary index: the canonical document store, keyed uniquely by `_id`.
// ---------------------------------------------------------------------

/// The always-present, implicitly-unique index over `_id`. Doubles as the
/// canonical in-memory store of live documents: every other index stores
/// only ids, and resolves the actual document by going through here.
#[derive(Debug, Default)]
pub struct PrimaryIndex {
    docs: HashMap<DocumentId, Json>,
}

impl PrimaryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&Json> {
        self.docs.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.docs.contains_key(id)
    }

    /// Inserts a document carrying a string `_id`. Fails if a document
    /// with that id already exists.
    pub fn insert_doc(&mut self, doc: Json) -> Result<()> {
        let id = document::get_id(&doc)
            .ok_or_else(|| Error::InvalidKey("'_id' must be a string".to_string()))?
            .to_string();
        if self.docs.contains_key(&id) {
            return Err(Error::UniqueViolated { field: "_id".to_string(), key: id });
        }
        self.docs.insert(id, doc);
        Ok(())
    }

    pub fn remove_doc(&mut self, id: &str) -> Option<Json> {
        self.docs.remove(id)
    }

    /// Replaces the document at `id` with `new`, returning the previous
    /// value. Used by `update_doc` so callers can roll back on failure
    /// elsewhere without re-serializing.
    pub fn replace_doc(&mut self, id: &str, new: Json) -> Option<Json> {
        self.docs.insert(id.to_string(), new)
    }

    pub fn all(&self) -> impl Iterator<Item = (&DocumentId, &Json)> {
        self.docs.iter()
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn reset(&mut self) {
        self.docs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unique_index_rejects_duplicate_key() {
        let mut idx = FieldIndex::new_unique("a");
        idx.insert_doc("1", &json!({"a": 1})).unwrap();
        let err = idx.insert_doc("2", &json!({"a": 1})).unwrap_err();
        assert!(matches!(err, Error::UniqueViolated { .. }));
    }

    #[test]
    fn sparse_index_skips_missing_field() {
        let mut idx = FieldIndex::new_unique("a").sparse(true);
        idx.insert_doc("1", &json!({})).unwrap();
        idx.insert_doc("2", &json!({})).unwrap();
        assert_eq!(idx.len(), 0);
    }

    #[test]
    fn non_sparse_unique_allows_one_missing() {
        let mut idx = FieldIndex::new_unique("a");
        idx.insert_doc("1", &json!({})).unwrap();
        let err = idx.insert_doc("2", &json!({})).unwrap_err();
        assert!(matches!(err, Error::UniqueViolated { .. }));
    }

    #[test]
    fn array_field_indexes_each_unique_element() {
        let mut idx = FieldIndex::new("tags");
        idx.insert_doc("1", &json!({"tags": ["a", "b", "a"]})).unwrap();
        assert_eq!(idx.get_matching(&json!("a")), vec!["1".to_string()]);
        assert_eq!(idx.get_matching(&json!("b")), vec!["1".to_string()]);
        assert_eq!(idx.len(), 2);
    }

    #[test]
    fn array_field_unique_violation_rolls_back_partial_insert() {
        let mut idx = FieldIndex::new_unique("tags");
        idx.insert_doc("1", &json!({"tags": ["a", "b"]})).unwrap();
        let err = idx.insert_doc("2", &json!({"tags": ["c", "a"]})).unwrap_err();
        assert!(matches!(err, Error::UniqueViolated { .. }));
        // "c" must have been rolled back along with "a" failing.
        assert!(idx.get_matching(&json!("c")).is_empty());
        assert_eq!(idx.get_matching(&json!("a")), vec!["1".to_string()]);
    }

    #[test]
    fn update_doc_rolls_back_on_failure() {
        let mut idx = FieldIndex::new_unique("a");
        idx.insert_doc("1", &json!({"a": 1})).unwrap();
        idx.insert_doc("2", &json!({"a": 2})).unwrap();
        let err = idx.update_doc("2", &json!({"a": 2}), &json!({"a": 1})).unwrap_err();
        assert!(matches!(err, Error::UniqueViolated { .. }));
        assert_eq!(idx.get_matching(&json!(2)), vec!["2".to_string()]);
        assert_eq!(idx.get_matching(&json!(1)), vec!["1".to_string()]);
    }

    #[test]
    fn update_many_rolls_back_whole_batch_on_single_failure() {
        let mut idx = FieldIndex::new_unique("a");
        idx.insert_doc("1", &json!({"a": 1})).unwrap();
        idx.insert_doc("2", &json!({"a": 2})).unwrap();
        idx.insert_doc("3", &json!({"a": 3})).unwrap();
        let changes = vec![
            ("1".to_string(), json!({"a": 1}), json!({"a": 10})),
            ("2".to_string(), json!({"a": 2}), json!({"a": 3})), // collides with doc 3
        ];
        let err = idx.update_many(&changes).unwrap_err();
        assert!(matches!(err, Error::UniqueViolated { .. }));
        assert_eq!(idx.get_matching(&json!(1)), vec!["1".to_string()]);
        assert_eq!(idx.get_matching(&json!(2)), vec!["2".to_string()]);
        assert_eq!(idx.get_matching(&json!(3)), vec!["3".to_string()]);
        assert!(idx.get_matching(&json!(10)).is_empty());
    }

    #[test]
    fn between_bounds_range_scan() {
        let mut idx = FieldIndex::new("n");
        for i in 0..5 {
            idx.insert_doc(&i.to_string(), &json!({"n": i})).unwrap();
        }
        let bounds = Bounds { gte: Some(json!(1)), lt: Some(json!(4)), ..Default::default() };
        let mut got = idx.get_between_bounds(&bounds);
        got.sort();
        assert_eq!(got, vec!["1", "2", "3"]);
    }

    #[test]
    fn primary_index_enforces_uniqueness() {
        let mut p = PrimaryIndex::new();
        p.insert_doc(json!({"_id": "x"})).unwrap();
        assert!(p.insert_doc(json!({"_id": "x"})).is_err());
    }
}
