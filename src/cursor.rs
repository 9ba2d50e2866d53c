//! Deferred query execution: predicate filter, optional sort, skip/limit,
//! and projection, shaped for `count`/`find`/`findOne`.
//!
//! Has no direct teacher counterpart — the teacher answers queries inline
//! inside `Collection::find_with_options`. This module factors that same
//! sort/skip/limit/projection pipeline out into its own type, matching the
//! "Cursor" entry in this system's own component table. Candidate
//! documents are fetched eagerly (a cheap index lookup) by the caller;
//! the cursor only defers the comparatively expensive filter/sort/
//! projection work until [`Cursor::exec`] runs.

use std::cmp::Ordering;
use std::sync::Arc;

use serde_json::{Map, Value as Json};

use crate::error::{Error, Result};
use crate::query::{self, WherePredicate};
use crate::value::{self, StrCompare};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecKind {
    Count,
    Find,
    FindOne,
}

pub struct Cursor {
    candidates: Vec<Json>,
    query: Json,
    where_fn: Option<WherePredicate>,
    sort: Vec<(String, i8)>,
    skip: usize,
    limit: usize,
    projection: Option<Json>,
    exec_kind: ExecKind,
    str_compare: Arc<StrCompare>,
}

impl Cursor {
    pub fn new(candidates: Vec<Json>, query: Json, exec_kind: ExecKind) -> Self {
        Self {
            candidates,
            query,
            where_fn: None,
            sort: Vec::new(),
            skip: 0,
            limit: 0,
            projection: None,
            exec_kind,
            str_compare: Arc::new(value::default_str_compare),
        }
    }

    /// Overrides the string comparator used when sorting (e.g. for
    /// locale-sensitive sort); defaults to byte ordering.
    pub fn with_str_compare(mut self, cmp: Arc<StrCompare>) -> Self {
        self.str_compare = cmp;
        self
    }

    pub fn with_where(mut self, f: WherePredicate) -> Self {
        self.where_fn = Some(f);
        self
    }

    /// `fields` is `(path, direction)` where direction is `1` or `-1`.
    pub fn sort_by(mut self, fields: Vec<(String, i8)>) -> Self {
        self.sort = fields;
        self
    }

    pub fn skip(mut self, n: usize) -> Self {
        self.skip = n;
        self
    }

    /// `0` means unlimited.
    pub fn limit(mut self, n: usize) -> Self {
        self.limit = n;
        self
    }

    pub fn project(mut self, projection: Json) -> Self {
        self.projection = Some(projection);
        self
    }

    pub fn exec(self) -> Result<Json> {
        let matches_doc = |doc: &Json| query::matches(doc, &self.query, self.where_fn.as_ref());

        let mut matched: Vec<Json> = if self.sort.is_empty() {
            let mut out = Vec::new();
            let mut skipped = 0usize;
            for c in &self.candidates {
                if matches_doc(c)? {
                    if skipped < self.skip {
                        skipped += 1;
                        continue;
                    }
                    out.push(c.clone());
                    if self.limit != 0 && out.len() >= self.limit {
                        break;
                    }
                }
            }
            out
        } else {
            let mut filtered = Vec::new();
            for c in &self.candidates {
                if matches_doc(c)? {
                    filtered.push(c.clone());
                }
            }
            filtered.sort_by(|a, b| self.compare_by_sort_keys(a, b));
            let start = self.skip.min(filtered.len());
            let end = if self.limit == 0 { filtered.len() } else { (start + self.limit).min(filtered.len()) };
            filtered[start..end].to_vec()
        };

        apply_projection(&mut matched, self.projection.as_ref())?;

        Ok(match self.exec_kind {
            ExecKind::Count => Json::from(matched.len()),
            ExecKind::Find => Json::Array(matched),
            ExecKind::FindOne => matched.into_iter().next().unwrap_or(Json::Null),
        })
    }

    fn compare_by_sort_keys(&self, a: &Json, b: &Json) -> Ordering {
        for (field, dir) in &self.sort {
            let av = value::resolve_path(a, field);
            let bv = value::resolve_path(b, field);
            let mut c = value::compare_opt(av.as_ref(), bv.as_ref(), self.str_compare.as_ref());
            if *dir < 0 {
                c = c.reverse();
            }
            if c != Ordering::Equal {
                return c;
            }
        }
        Ordering::Equal
    }
}

fn proj_flag(v: &Json) -> Result<bool> {
    match v.as_i64() {
        Some(1) => Ok(true),
        Some(0) => Ok(false),
        _ => Err(Error::ProjectionConflict),
    }
}

/// Applies a pick-mode or omit-mode projection in place. `_id` may be
/// omitted independently of the overall pick/omit mode of the rest of the
/// projection.
fn apply_projection(docs: &mut [Json], projection: Option<&Json>) -> Result<()> {
    let Some(proj) = projection else {
        return Ok(());
    };
    let obj = proj.as_object().ok_or(Error::ProjectionConflict)?;
    if obj.is_empty() {
        return Ok(());
    }

    let mut pick_keys = Vec::new();
    let mut omit_keys = Vec::new();
    let mut id_omitted = false;
    let mut mode: Option<bool> = None;

    for (k, v) in obj {
        let flag = proj_flag(v)?;
        if k == "_id" {
            if !flag {
                id_omitted = true;
            }
            continue;
        }
        match mode {
            None => mode = Some(flag),
            Some(m) if m != flag => return Err(Error::ProjectionConflict),
            _ => {}
        }
        if flag {
            pick_keys.push(k.clone());
        } else {
            omit_keys.push(k.clone());
        }
    }

    for doc in docs.iter_mut() {
        match mode {
            Some(true) => {
                let mut result = Json::Object(Map::new());
                for k in &pick_keys {
                    if let Some(v) = value::resolve_path(doc, k) {
                        value::set_path(&mut result, k, v);
                    }
                }
                if !id_omitted {
                    if let Some(id) = doc.get("_id") {
                        value::set_path(&mut result, "_id", id.clone());
                    }
                }
                *doc = result;
            }
            Some(false) | None => {
                for k in &omit_keys {
                    value::unset_path(doc, k);
                }
                if id_omitted {
                    if let Some(map) = doc.as_object_mut() {
                        map.remove("_id");
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn docs() -> Vec<Json> {
        vec![
            json!({"_id": "1", "a": 3, "b": "x"}),
            json!({"_id": "2", "a": 1, "b": "y"}),
            json!({"_id": "3", "a": 2, "b": "z"}),
        ]
    }

    #[test]
    fn count_matches() {
        let c = Cursor::new(docs(), json!({}), ExecKind::Count);
        assert_eq!(c.exec().unwrap(), json!(3));
    }

    #[test]
    fn find_one_returns_null_when_nothing_matches() {
        let c = Cursor::new(docs(), json!({"a": 99}), ExecKind::FindOne);
        assert_eq!(c.exec().unwrap(), Json::Null);
    }

    #[test]
    fn sort_ascending_and_descending() {
        let asc = Cursor::new(docs(), json!({}), ExecKind::Find).sort_by(vec![("a".to_string(), 1)]).exec().unwrap();
        let ids: Vec<&str> = asc.as_array().unwrap().iter().map(|d| d["_id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["2", "3", "1"]);

        let desc = Cursor::new(docs(), json!({}), ExecKind::Find).sort_by(vec![("a".to_string(), -1)]).exec().unwrap();
        let ids: Vec<&str> = desc.as_array().unwrap().iter().map(|d| d["_id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["1", "3", "2"]);
    }

    #[test]
    fn skip_and_limit_without_sort() {
        let result = Cursor::new(docs(), json!({}), ExecKind::Find).skip(1).limit(1).exec().unwrap();
        assert_eq!(result.as_array().unwrap().len(), 1);
    }

    #[test]
    fn projection_pick_mode_keeps_id() {
        let result = Cursor::new(docs(), json!({"_id": "1"}), ExecKind::FindOne)
            .project(json!({"a": 1}))
            .exec()
            .unwrap();
        assert_eq!(result, json!({"_id": "1", "a": 3}));
    }

    #[test]
    fn projection_pick_mode_can_still_omit_id() {
        let result = Cursor::new(docs(), json!({"_id": "1"}), ExecKind::FindOne)
            .project(json!({"a": 1, "_id": 0}))
            .exec()
            .unwrap();
        assert_eq!(result, json!({"a": 3}));
    }

    #[test]
    fn projection_omit_mode() {
        let result = Cursor::new(docs(), json!({"_id": "1"}), ExecKind::FindOne)
            .project(json!({"b": 0}))
            .exec()
            .unwrap();
        assert_eq!(result, json!({"_id": "1", "a": 3}));
    }

    #[test]
    fn projection_mixing_pick_and_omit_is_error() {
        let result = Cursor::new(docs(), json!({"_id": "1"}), ExecKind::FindOne).project(json!({"a": 1, "b": 0})).exec();
        assert!(result.is_err());
    }
}
