//! Orchestrates the primary/secondary indexes, persistence, and the
//! executor into the single public entry point of this crate.
//!
//! Grounded on the teacher's `Collection` (the struct that wires together
//! `Storage`/`Wal`/indexes and exposes `insert`/`find`/`update`/`remove`,
//! and its atomic rollback discipline across `insert_many`), and on
//! `engine.rs`'s `verbose`/`LogCallback` diagnostics convention. The
//! teacher shares one `&mut self` borrow across its methods; here every
//! mutating method instead hands a boxed closure to the `Executor`, so
//! the indexed state lives behind `Arc<Mutex<Inner>>` and mutations are
//! only ever applied from inside that closure.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde_json::{Map, Value as Json};

use crate::cursor::{Cursor, ExecKind};
use crate::document::{self, DocumentId};
use crate::error::{Error, Result};
use crate::events::{CompactionWatcher, EventBroker};
use crate::executor::Executor;
use crate::index::{Bounds, FieldIndex, PrimaryIndex};
use crate::persistence::{self, DeserializeHook, IndexSpec, SerializeHook, MIN_AUTOCOMPACTION_INTERVAL_MS};
use crate::query::{self, WherePredicate};
use crate::storage::Storage;
use crate::update;
use crate::value::{self, StrCompare};

/// Called with a diagnostic line; mirrors the teacher's `verbose` +
/// `LogCallback` pair rather than pulling in a logging crate the
/// teacher's own dependency stack doesn't carry.
pub type LogCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Construction-time configuration for a [`Collection`].
#[derive(Clone)]
pub struct CollectionOptions {
    /// Path to the log file. `None` means in-memory only.
    pub filename: Option<PathBuf>,
    /// Forces in-memory operation even when `filename` is set.
    pub in_memory_only: bool,
    /// Auto-maintains `createdAt`/`updatedAt` date fields.
    pub timestamp_data: bool,
    /// Runs `load` synchronously as part of `Collection::open`.
    pub autoload: bool,
    /// Fraction (0.0-1.0) of unparseable log lines that aborts a load.
    pub corrupt_alert_threshold: f64,
    /// Paired with `after_serialization`; must be its exact inverse.
    pub before_deserialization: Option<DeserializeHook>,
    pub after_serialization: Option<SerializeHook>,
    /// Alternative string comparator for sort ordering.
    pub compare_strings: Option<Arc<StrCompare>>,
    /// Enables a background thread that periodically compacts the log.
    /// Clamped to at least [`MIN_AUTOCOMPACTION_INTERVAL_MS`].
    pub autocompaction_interval: Option<Duration>,
    pub verbose: bool,
    pub log_callback: Option<LogCallback>,
}

impl Default for CollectionOptions {
    fn default() -> Self {
        Self {
            filename: None,
            in_memory_only: false,
            timestamp_data: false,
            autoload: true,
            corrupt_alert_threshold: 0.1,
            before_deserialization: None,
            after_serialization: None,
            compare_strings: None,
            autocompaction_interval: None,
            verbose: false,
            log_callback: None,
        }
    }
}

#[derive(Default, Clone, Copy)]
pub struct FindOptions<'a> {
    pub sort: &'a [(&'a str, i8)],
    pub skip: usize,
    pub limit: usize,
}

impl<'a> FindOptions<'a> {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Default, Clone, Copy)]
pub struct UpdateOptions {
    pub multi: bool,
    pub upsert: bool,
    pub return_updated_docs: bool,
}

pub struct UpdateResult {
    pub num_affected: usize,
    pub affected_documents: Option<Json>,
    pub upsert: bool,
}

struct Inner {
    primary: PrimaryIndex,
    indexes: HashMap<String, FieldIndex>,
    ttl_indexes: HashMap<String, i64>,
    storage: Option<Storage>,
}

struct AutocompactionHandle {
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for AutocompactionHandle {
    fn drop(&mut self) {
        self.shutdown.store(true, AtomicOrdering::SeqCst);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

/// An embedded, single-file, append-only document collection with
/// MongoDB-style query and update semantics.
pub struct Collection {
    inner: Arc<Mutex<Inner>>,
    executor: Arc<Executor>,
    events: Arc<EventBroker>,
    options: CollectionOptions,
    autocompaction: Option<AutocompactionHandle>,
}

// ---------------------------------------------------------------------
// Candidate selection and TTL reaping
// ---------------------------------------------------------------------

fn all_docs(inner: &Inner) -> Vec<Json> {
    inner.primary.all().map(|(_, d)| d.clone()).collect()
}

fn ids_to_docs(inner: &Inner, ids: &[DocumentId]) -> Vec<Json> {
    ids.iter().filter_map(|id| inner.primary.get(id).cloned()).collect()
}

/// Heuristic candidate selection per this system's own component table:
/// `_id` equality/`$in`, then a single simple-equality indexed field, then
/// an indexed `$in`, then an indexed range, else a full scan.
fn select_candidates(inner: &Inner, query: &Json) -> Vec<Json> {
    let Some(obj) = query.as_object() else {
        return all_docs(inner);
    };

    if obj.len() == 1 {
        if let Some(id_clause) = obj.get("_id") {
            match id_clause {
                Json::String(s) => return inner.primary.get(s).cloned().into_iter().collect(),
                Json::Object(m) if m.len() == 1 => {
                    if let Some(arr) = m.get("$in").and_then(Json::as_array) {
                        let ids: Vec<DocumentId> =
                            arr.iter().filter_map(Json::as_str).map(str::to_string).collect();
                        return ids.iter().filter_map(|id| inner.primary.get(id).cloned()).collect();
                    }
                }
                _ => {}
            }
        }
    }

    for (field, clause) in obj {
        if field.starts_with('$') {
            continue;
        }
        let is_operator_document = !value::is_date(clause)
            && matches!(clause, Json::Object(m) if !m.is_empty() && m.keys().all(|k| k.starts_with('$')));
        if !is_operator_document {
            if let Some(idx) = inner.indexes.get(field) {
                return ids_to_docs(inner, &idx.get_matching(clause));
            }
        }
    }

    for (field, clause) in obj {
        if field.starts_with('$') {
            continue;
        }
        if let Json::Object(m) = clause {
            if let (Some(idx), Some(arr)) = (inner.indexes.get(field), m.get("$in").and_then(Json::as_array)) {
                return ids_to_docs(inner, &idx.get_matching(&Json::Array(arr.clone())));
            }
        }
    }

    for (field, clause) in obj {
        if field.starts_with('$') {
            continue;
        }
        if let Json::Object(m) = clause {
            let has_range = m.keys().any(|k| matches!(k.as_str(), "$lt" | "$lte" | "$gt" | "$gte"));
            if has_range {
                if let Some(idx) = inner.indexes.get(field) {
                    let bounds = Bounds {
                        gt: m.get("$gt").cloned(),
                        gte: m.get("$gte").cloned(),
                        lt: m.get("$lt").cloned(),
                        lte: m.get("$lte").cloned(),
                    };
                    return ids_to_docs(inner, &idx.get_between_bounds(&bounds));
                }
            }
        }
    }

    all_docs(inner)
}

fn remove_doc_from_indexes(inner: &mut Inner, id: &str, doc: &Json) {
    inner.primary.remove_doc(id);
    for idx in inner.indexes.values_mut() {
        idx.remove_doc(id, doc);
    }
}

/// Reaps documents whose TTL field has expired, persisting one tombstone
/// per reaped document. Reap failures are swallowed: a bad write here
/// must not break the caller's read.
fn reap_expired(inner: &mut Inner, after_serialization: Option<&SerializeHook>, candidates: Vec<Json>) -> Vec<Json> {
    if inner.ttl_indexes.is_empty() {
        return candidates;
    }
    let now = value::now_millis();
    let ttl: Vec<(String, i64)> = inner.ttl_indexes.iter().map(|(f, s)| (f.clone(), *s)).collect();

    let mut live = Vec::with_capacity(candidates.len());
    let mut expired_docs = Vec::new();
    for doc in candidates {
        let mut expired = false;
        for (field, secs) in &ttl {
            if let Some(ms) = value::resolve_path(&doc, field).as_ref().and_then(value::as_date_millis) {
                if ms <= now - secs * 1000 {
                    expired = true;
                    break;
                }
            }
        }
        if expired {
            expired_docs.push(doc);
        } else {
            live.push(doc);
        }
    }

    if expired_docs.is_empty() {
        return live;
    }
    let tombstones: Vec<Json> = expired_docs
        .iter()
        .filter_map(|d| document::get_id(d))
        .map(persistence::tombstone_record)
        .collect();
    if persistence::persist_new_state(inner.storage.as_ref(), &tombstones, after_serialization).is_ok() {
        for doc in &expired_docs {
            if let Some(id) = document::get_id(doc) {
                remove_doc_from_indexes(inner, id, doc);
            }
        }
    }
    live
}

fn select_and_reap(
    inner: &mut Inner,
    query: &Json,
    after_serialization: Option<&SerializeHook>,
    skip_expiration: bool,
) -> Vec<Json> {
    let candidates = select_candidates(inner, query);
    if skip_expiration {
        candidates
    } else {
        reap_expired(inner, after_serialization, candidates)
    }
}

// ---------------------------------------------------------------------
// Insert
// ---------------------------------------------------------------------

fn rollback_insert(inner: &mut Inner, prepared: &[Json], primary_done: &[DocumentId], indexes_done: &[String]) {
    for name in indexes_done {
        if let Some(idx) = inner.indexes.get_mut(name) {
            for doc in prepared {
                if let Some(id) = document::get_id(doc) {
                    idx.remove_doc(id, doc);
                }
            }
        }
    }
    for id in primary_done {
        inner.primary.remove_doc(id);
    }
}

fn insert_many_locked(
    inner: &mut Inner,
    after_serialization: Option<&SerializeHook>,
    timestamp_data: bool,
    docs: Vec<Json>,
) -> Result<Vec<Json>> {
    if docs.is_empty() {
        return Ok(Vec::new());
    }

    let now = value::now_millis();
    let mut prepared = Vec::with_capacity(docs.len());
    for doc in docs {
        document::validate_document(&doc)?;
        let mut doc = document::with_assigned_id(doc, &|id| inner.primary.contains(id));
        if timestamp_data {
            let obj = doc.as_object_mut().expect("validated document is an object");
            obj.entry("createdAt".to_string()).or_insert_with(|| value::make_date(now));
            obj.insert("updatedAt".to_string(), value::make_date(now));
        }
        document::validate_document(&doc)?;
        prepared.push(doc);
    }

    let mut primary_done: Vec<DocumentId> = Vec::new();
    for doc in &prepared {
        match inner.primary.insert_doc(doc.clone()) {
            Ok(()) => primary_done.push(document::get_id(doc).expect("assigned id").to_string()),
            Err(e) => {
                rollback_insert(inner, &prepared, &primary_done, &[]);
                return Err(e);
            }
        }
    }

    let index_names: Vec<String> = inner.indexes.keys().cloned().collect();
    let mut indexes_done: Vec<String> = Vec::new();
    for name in &index_names {
        let idx = inner.indexes.get_mut(name).expect("index listed by name exists");
        let mut doc_done = 0usize;
        let mut failure = None;
        for doc in &prepared {
            let id = document::get_id(doc).expect("assigned id");
            match idx.insert_doc(id, doc) {
                Ok(()) => doc_done += 1,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        if let Some(e) = failure {
            for doc in &prepared[..doc_done] {
                idx.remove_doc(document::get_id(doc).expect("assigned id"), doc);
            }
            rollback_insert(inner, &prepared, &primary_done, &indexes_done);
            return Err(e);
        }
        indexes_done.push(name.clone());
    }

    if let Err(e) = persistence::persist_new_state(inner.storage.as_ref(), &prepared, after_serialization) {
        rollback_insert(inner, &prepared, &primary_done, &indexes_done);
        return Err(e);
    }

    Ok(prepared)
}

// ---------------------------------------------------------------------
// Update
// ---------------------------------------------------------------------

fn is_pure_modifier(update_spec: &Json) -> bool {
    match update_spec.as_object() {
        Some(m) if !m.is_empty() => m.keys().all(|k| k.starts_with('$')),
        _ => false,
    }
}

/// Strips operator clauses from a query, keeping only plain equality
/// fields, to synthesize a base document for an upsert whose update is a
/// pure modifier document.
fn build_base_from_query(query: &Json) -> Json {
    let mut base = Map::new();
    if let Some(obj) = query.as_object() {
        for (k, v) in obj {
            if k.starts_with('$') {
                continue;
            }
            match v {
                Json::Object(m) if !value::is_date(v) && !m.is_empty() && m.keys().all(|kk| kk.starts_with('$')) => {
                    continue
                }
                _ => {
                    base.insert(k.clone(), v.clone());
                }
            }
        }
    }
    Json::Object(base)
}

#[allow(clippy::too_many_arguments)]
fn do_update(
    inner: &Arc<Mutex<Inner>>,
    after_serialization: Option<&SerializeHook>,
    timestamp_data: bool,
    query: &Json,
    update_spec: &Json,
    where_fn: Option<&WherePredicate>,
    opts: UpdateOptions,
) -> Result<UpdateResult> {
    if opts.upsert && opts.multi {
        return Err(Error::InvalidOptions("upsert and multi cannot both be set".to_string()));
    }

    let mut guard = inner.lock().expect("collection mutex poisoned");
    let candidates = select_and_reap(&mut guard, query, after_serialization, false);

    let mut matched: Vec<Json> = Vec::new();
    for doc in &candidates {
        if query::matches(doc, query, where_fn)? {
            matched.push(doc.clone());
            if !opts.multi {
                break;
            }
        }
    }

    if matched.is_empty() {
        if !opts.upsert {
            return Ok(UpdateResult { num_affected: 0, affected_documents: None, upsert: false });
        }
        let base = if is_pure_modifier(update_spec) { build_base_from_query(query) } else { Json::Object(Map::new()) };
        let new_doc = update::modify_doc(&base, update_spec)?;
        let inserted = insert_many_locked(&mut guard, after_serialization, timestamp_data, vec![new_doc])?;
        let doc = inserted.into_iter().next().expect("exactly one document was prepared");
        return Ok(UpdateResult { num_affected: 1, affected_documents: Some(doc), upsert: true });
    }

    let now = value::now_millis();
    let mut changes: Vec<(DocumentId, Json, Json)> = Vec::with_capacity(matched.len());
    for old in &matched {
        let mut new_doc = update::modify_doc(old, update_spec)?;
        if timestamp_data {
            if let Some(obj) = new_doc.as_object_mut() {
                if let Some(created) = old.get("createdAt") {
                    obj.insert("createdAt".to_string(), created.clone());
                }
                obj.insert("updatedAt".to_string(), value::make_date(now));
            }
        }
        let id = document::get_id(old).expect("candidate carries an id").to_string();
        changes.push((id, old.clone(), new_doc));
    }

    let mut primary_done: Vec<(DocumentId, Json)> = Vec::new();
    for (id, _, new) in &changes {
        if let Some(prev) = guard.primary.replace_doc(id, new.clone()) {
            primary_done.push((id.clone(), prev));
        }
    }

    let index_names: Vec<String> = guard.indexes.keys().cloned().collect();
    let mut indexes_done: Vec<String> = Vec::new();
    for name in &index_names {
        let idx = guard.indexes.get_mut(name).expect("index listed by name exists");
        if let Err(e) = idx.update_many(&changes) {
            for done_name in &indexes_done {
                let done_idx = guard.indexes.get_mut(done_name).expect("index listed by name exists");
                for (id, old, new) in &changes {
                    let _ = done_idx.revert_update(id, old, new);
                }
            }
            for (id, prev) in &primary_done {
                guard.primary.replace_doc(id, prev.clone());
            }
            return Err(e);
        }
        indexes_done.push(name.clone());
    }

    let new_docs: Vec<Json> = changes.iter().map(|(_, _, new)| new.clone()).collect();
    if let Err(e) = persistence::persist_new_state(guard.storage.as_ref(), &new_docs, after_serialization) {
        for name in &indexes_done {
            let idx = guard.indexes.get_mut(name).expect("index listed by name exists");
            for (id, old, new) in &changes {
                let _ = idx.revert_update(id, old, new);
            }
        }
        for (id, prev) in &primary_done {
            guard.primary.replace_doc(id, prev.clone());
        }
        return Err(e);
    }

    let affected = if opts.return_updated_docs {
        if opts.multi { Some(Json::Array(new_docs.clone())) } else { new_docs.first().cloned() }
    } else {
        None
    };

    Ok(UpdateResult { num_affected: changes.len(), affected_documents: affected, upsert: false })
}

// ---------------------------------------------------------------------
// Remove
// ---------------------------------------------------------------------

fn do_remove(
    inner: &Arc<Mutex<Inner>>,
    after_serialization: Option<&SerializeHook>,
    query: &Json,
    where_fn: Option<&WherePredicate>,
    multi: bool,
) -> Result<usize> {
    let mut guard = inner.lock().expect("collection mutex poisoned");
    let candidates = select_and_reap(&mut guard, query, after_serialization, true);

    let mut targets: Vec<Json> = Vec::new();
    for doc in &candidates {
        if query::matches(doc, query, where_fn)? {
            targets.push(doc.clone());
            if !multi {
                break;
            }
        }
    }
    if targets.is_empty() {
        return Ok(0);
    }

    let tombstones: Vec<Json> =
        targets.iter().filter_map(|d| document::get_id(d)).map(persistence::tombstone_record).collect();
    persistence::persist_new_state(guard.storage.as_ref(), &tombstones, after_serialization)?;

    for doc in &targets {
        if let Some(id) = document::get_id(doc) {
            remove_doc_from_indexes(&mut guard, id, doc);
        }
    }
    Ok(targets.len())
}

// ---------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------

fn current_index_specs(guard: &Inner) -> Vec<IndexSpec> {
    guard
        .indexes
        .values()
        .map(|idx| IndexSpec {
            field_name: idx.field.clone(),
            unique: idx.unique,
            sparse: idx.sparse,
            expire_after_seconds: guard.ttl_indexes.get(&idx.field).copied(),
        })
        .collect()
}

fn do_load(
    inner: &Arc<Mutex<Inner>>,
    events: &EventBroker,
    before_deserialization: Option<&DeserializeHook>,
    after_serialization: Option<&SerializeHook>,
    corrupt_alert_threshold: f64,
    verbose: bool,
    log_callback: Option<&LogCallback>,
) -> Result<()> {
    let mut guard = inner.lock().expect("collection mutex poisoned");
    let log = |msg: &str| {
        if verbose {
            eprintln!("{msg}");
        }
        if let Some(cb) = log_callback {
            cb(msg);
        }
    };

    guard.primary.reset();
    guard.indexes.clear();
    guard.ttl_indexes.clear();

    let Some(storage) = guard.storage.as_ref() else {
        return Ok(());
    };
    let lines = storage.read_all_lines()?;
    log(&format!("[load] read {} line(s) from {}", lines.len(), storage.path().display()));

    let state = persistence::treat_raw_data(&lines, before_deserialization, corrupt_alert_threshold)?;

    for spec in &state.index_specs {
        let mut idx =
            (if spec.unique { FieldIndex::new_unique(&spec.field_name) } else { FieldIndex::new(&spec.field_name) })
                .sparse(spec.sparse);
        for (id, doc) in &state.docs {
            idx.insert_doc(id, doc)?;
        }
        if let Some(secs) = spec.expire_after_seconds {
            guard.ttl_indexes.insert(spec.field_name.clone(), secs);
        }
        guard.indexes.insert(spec.field_name.clone(), idx);
    }

    for doc in state.docs.values() {
        guard.primary.insert_doc(doc.clone())?;
    }

    log(&format!(
        "[load] {} document(s) loaded, {} corrupt line(s) skipped",
        state.docs.len(),
        state.corrupt_lines
    ));

    let live_docs = all_docs(&guard);
    let specs = current_index_specs(&guard);
    persistence::compact(guard.storage.as_ref(), live_docs.iter(), &specs, after_serialization, events)?;

    Ok(())
}

fn spawn_autocompaction(
    inner: Arc<Mutex<Inner>>,
    events: Arc<EventBroker>,
    executor: Arc<Executor>,
    after_serialization: Option<SerializeHook>,
    interval: Duration,
) -> AutocompactionHandle {
    let interval = interval.max(Duration::from_millis(MIN_AUTOCOMPACTION_INTERVAL_MS as u64));
    let shutdown = Arc::new(AtomicBool::new(false));
    let worker_shutdown = Arc::clone(&shutdown);
    let tick = Duration::from_millis(200).min(interval);

    let thread = thread::spawn(move || {
        let mut elapsed = Duration::ZERO;
        while !worker_shutdown.load(AtomicOrdering::SeqCst) {
            thread::sleep(tick);
            elapsed += tick;
            if elapsed < interval {
                continue;
            }
            elapsed = Duration::ZERO;
            if worker_shutdown.load(AtomicOrdering::SeqCst) {
                break;
            }
            let inner = Arc::clone(&inner);
            let events = Arc::clone(&events);
            let after = after_serialization.clone();
            executor.run_sync(move || {
                let guard = inner.lock().expect("collection mutex poisoned");
                let live_docs = all_docs(&guard);
                let specs = current_index_specs(&guard);
                let _ = persistence::compact(guard.storage.as_ref(), live_docs.iter(), &specs, after.as_ref(), &events);
            });
        }
    });

    AutocompactionHandle { shutdown, thread: Some(thread) }
}

impl Collection {
    /// Opens (creating if necessary) a collection under `options`. When
    /// `options.autoload` is set and the collection is not in-memory-only,
    /// this synchronously replays the log before returning.
    pub fn open(options: CollectionOptions) -> Result<Self> {
        match (&options.before_deserialization, &options.after_serialization) {
            (Some(before), Some(after)) => persistence::validate_hook_bijection(before, after)?,
            (None, None) => {}
            _ => {
                return Err(Error::InvalidOptions(
                    "before_deserialization and after_serialization must both be set or neither".to_string(),
                ));
            }
        }

        let in_memory = options.in_memory_only || options.filename.is_none();
        let storage = if in_memory {
            None
        } else {
            Some(Storage::open(options.filename.as_ref().expect("filename required when not in-memory"))?)
        };

        let inner = Arc::new(Mutex::new(Inner {
            primary: PrimaryIndex::new(),
            indexes: HashMap::new(),
            ttl_indexes: HashMap::new(),
            storage,
        }));
        let events = Arc::new(EventBroker::new());
        let executor = Arc::new(if in_memory { Executor::new_running() } else { Executor::new_buffering() });

        let mut collection = Self { inner, executor, events, options, autocompaction: None };

        if !in_memory && collection.options.autoload {
            collection.load()?;
        } else if in_memory {
            // Nothing to replay; the executor is already running.
        }

        if !in_memory {
            if let Some(interval) = collection.options.autocompaction_interval {
                collection.autocompaction = Some(spawn_autocompaction(
                    Arc::clone(&collection.inner),
                    Arc::clone(&collection.events),
                    Arc::clone(&collection.executor),
                    collection.options.after_serialization.clone(),
                    interval,
                ));
            }
        }

        Ok(collection)
    }

    /// Convenience constructor for an in-memory-only collection.
    pub fn open_in_memory() -> Result<Self> {
        Self::open(CollectionOptions { in_memory_only: true, ..Default::default() })
    }

    /// Replays the on-disk log into memory, rebuilds indexes, compacts,
    /// and drains the executor's pre-load buffer. A no-op beyond clearing
    /// state for in-memory-only collections.
    pub fn load(&self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        let events = Arc::clone(&self.events);
        let before = self.options.before_deserialization.clone();
        let after = self.options.after_serialization.clone();
        let threshold = self.options.corrupt_alert_threshold;
        let verbose = self.options.verbose;
        let log_callback = self.options.log_callback.clone();

        let result = self.executor.run_sync_now(move || {
            do_load(&inner, &events, before.as_ref(), after.as_ref(), threshold, verbose, log_callback.as_ref())
        });
        if result.is_ok() {
            self.executor.process_buffer();
        }
        result
    }

    pub fn insert(&self, doc: Json) -> Result<Json> {
        Ok(self.insert_many(vec![doc])?.into_iter().next().expect("exactly one document was inserted"))
    }

    pub fn insert_many(&self, docs: Vec<Json>) -> Result<Vec<Json>> {
        let inner = Arc::clone(&self.inner);
        let after = self.options.after_serialization.clone();
        let timestamp_data = self.options.timestamp_data;
        self.executor.run_sync(move || {
            let mut guard = inner.lock().expect("collection mutex poisoned");
            insert_many_locked(&mut guard, after.as_ref(), timestamp_data, docs)
        })
    }

    pub fn ensure_index(
        &self,
        field_name: impl Into<String>,
        unique: bool,
        sparse: bool,
        expire_after_seconds: Option<i64>,
    ) -> Result<()> {
        let field_name = field_name.into();
        let inner = Arc::clone(&self.inner);
        let after = self.options.after_serialization.clone();
        self.executor.run_sync(move || {
            let mut guard = inner.lock().expect("collection mutex poisoned");
            if guard.indexes.contains_key(&field_name) {
                return Ok(());
            }

            if expire_after_seconds.is_some() {
                for (_, doc) in guard.primary.all() {
                    if value::resolve_path(doc, &field_name).is_some_and(|v| v.is_array()) {
                        return Err(Error::InvalidOptions(format!(
                            "TTL field '{field_name}' must not hold an array value"
                        )));
                    }
                }
            }

            let mut idx =
                (if unique { FieldIndex::new_unique(&field_name) } else { FieldIndex::new(&field_name) }).sparse(sparse);
            for (id, doc) in guard.primary.all() {
                idx.insert_doc(id, doc)?;
            }

            let spec = IndexSpec { field_name: field_name.clone(), unique, sparse, expire_after_seconds };
            if let Some(storage) = guard.storage.as_ref() {
                let line = persistence::index_created_line(&spec, after.as_ref())?;
                storage.append_lines([line])?;
            }

            if let Some(secs) = expire_after_seconds {
                guard.ttl_indexes.insert(field_name.clone(), secs);
            }
            guard.indexes.insert(field_name, idx);
            Ok(())
        })
    }

    /// Removing a nonexistent index is not an error.
    pub fn remove_index(&self, field_name: impl Into<String>) -> Result<()> {
        let field_name = field_name.into();
        let inner = Arc::clone(&self.inner);
        let after = self.options.after_serialization.clone();
        self.executor.run_sync(move || {
            let mut guard = inner.lock().expect("collection mutex poisoned");
            if guard.indexes.remove(&field_name).is_none() {
                return Ok(());
            }
            guard.ttl_indexes.remove(&field_name);
            if let Some(storage) = guard.storage.as_ref() {
                let line = persistence::index_removed_line(&field_name, after.as_ref())?;
                storage.append_lines([line])?;
            }
            Ok(())
        })
    }

    fn with_inner<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> T {
        let mut guard = self.inner.lock().expect("collection mutex poisoned");
        f(&mut guard)
    }

    fn cursor_for(&self, inner: &mut Inner, query: &Json, kind: ExecKind, opts: FindOptions) -> Cursor {
        let candidates = select_and_reap(inner, query, self.options.after_serialization.as_ref(), false);
        let sort: Vec<(String, i8)> = opts.sort.iter().map(|(f, d)| (f.to_string(), *d)).collect();
        let mut cursor = Cursor::new(candidates, query.clone(), kind).sort_by(sort).skip(opts.skip).limit(opts.limit);
        if let Some(cmp) = &self.options.compare_strings {
            cursor = cursor.with_str_compare(Arc::clone(cmp));
        }
        cursor
    }

    pub fn find(&self, query: Json) -> Result<Vec<Json>> {
        self.find_with_options(query, FindOptions::new())
    }

    pub fn find_with_options(&self, query: Json, opts: FindOptions) -> Result<Vec<Json>> {
        let result = self.with_inner(|inner| self.cursor_for(inner, &query, ExecKind::Find, opts).exec())?;
        Ok(result.as_array().cloned().unwrap_or_default())
    }

    pub fn find_one(&self, query: Json) -> Result<Option<Json>> {
        let result = self.with_inner(|inner| self.cursor_for(inner, &query, ExecKind::FindOne, FindOptions::new()).exec())?;
        Ok(if result.is_null() { None } else { Some(result) })
    }

    pub fn count(&self, query: Json) -> Result<usize> {
        let result = self.with_inner(|inner| self.cursor_for(inner, &query, ExecKind::Count, FindOptions::new()).exec())?;
        Ok(result.as_u64().unwrap_or(0) as usize)
    }

    pub fn update(&self, query: Json, update_spec: Json, opts: UpdateOptions) -> Result<UpdateResult> {
        let inner = Arc::clone(&self.inner);
        let after = self.options.after_serialization.clone();
        let timestamp_data = self.options.timestamp_data;
        self.executor.run_sync(move || do_update(&inner, after.as_ref(), timestamp_data, &query, &update_spec, None, opts))
    }

    pub fn remove(&self, query: Json, multi: bool) -> Result<usize> {
        let inner = Arc::clone(&self.inner);
        let after = self.options.after_serialization.clone();
        self.executor.run_sync(move || do_remove(&inner, after.as_ref(), &query, None, multi))
    }

    /// Manually triggers a compaction. Autocompaction (if configured) runs
    /// this same procedure on a timer.
    pub fn compact(&self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        let events = Arc::clone(&self.events);
        let after = self.options.after_serialization.clone();
        self.executor.run_sync(move || {
            let guard = inner.lock().expect("collection mutex poisoned");
            let live_docs = all_docs(&guard);
            let specs = current_index_specs(&guard);
            persistence::compact(guard.storage.as_ref(), live_docs.iter(), &specs, after.as_ref(), &events)
        })
    }

    pub fn subscribe_compaction(&self) -> CompactionWatcher {
        self.events.subscribe()
    }

    pub fn len(&self) -> usize {
        self.with_inner(|inner| inner.primary.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn opts_at(path: PathBuf) -> CollectionOptions {
        CollectionOptions { filename: Some(path), ..Default::default() }
    }

    #[test]
    fn scenario_insert_find_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.db");
        {
            let col = Collection::open(opts_at(path.clone())).unwrap();
            col.insert(json!({"a": 5, "b": "hello"})).unwrap();
            col.insert(json!({"a": 42, "b": "world"})).unwrap();
            let found = col.find(json!({})).unwrap();
            assert_eq!(found.len(), 2);
        }
        let col = Collection::open(opts_at(path)).unwrap();
        let found = col.find(json!({})).unwrap();
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn scenario_unique_index_bulk_insert_rolls_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.db");
        let col = Collection::open(opts_at(path.clone())).unwrap();
        col.ensure_index("a", true, false, None).unwrap();

        let result = col.insert_many(vec![
            json!({"a": 5, "b": "hello"}),
            json!({"a": 42, "b": "world"}),
            json!({"a": 5, "b": "bloup"}),
            json!({"a": 7}),
        ]);
        assert!(result.is_err());
        assert_eq!(col.count(json!({})).unwrap(), 0);

        let lines = std::fs::read_to_string(&path).unwrap();
        let non_blank: Vec<&str> = lines.lines().filter(|l| !l.is_empty()).collect();
        assert_eq!(non_blank.len(), 1);
        assert!(non_blank[0].contains("$$indexCreated"));
    }

    #[test]
    fn scenario_ttl_expiration_and_compaction() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.db");
        let col = Collection::open(opts_at(path.clone())).unwrap();
        col.ensure_index("exp", false, false, Some(0)).unwrap();

        let past = value::now_millis() - 5_000;
        col.insert(json!({"hello": "world", "exp": {"$$date": past}})).unwrap();

        let found = col.find_one(json!({})).unwrap();
        assert!(found.is_none());

        col.compact().unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(!contents.contains("\"hello\""));
    }

    #[test]
    fn scenario_in_query_is_order_independent() {
        let col = Collection::open_in_memory().unwrap();
        let docs = col
            .insert_many(vec![json!({"docNumber": 1}), json!({"docNumber": 2}), json!({"docNumber": 3})])
            .unwrap();
        let ids: Vec<Json> = docs.iter().map(|d| d["_id"].clone()).collect();

        let found = col
            .find(json!({"_id": {"$in": [ids[0].clone(), ids[2].clone(), ids[1].clone()]}}))
            .unwrap();
        assert_eq!(found.len(), 3);
    }

    #[test]
    fn scenario_or_upsert_into_empty_collection() {
        let col = Collection::open_in_memory().unwrap();
        let result = col
            .update(
                json!({"$or": [{"a": 4}, {"a": 5}]}),
                json!({"$set": {"hello": "world"}, "$inc": {"bloup": 3}}),
                UpdateOptions { upsert: true, return_updated_docs: true, ..Default::default() },
            )
            .unwrap();
        assert!(result.upsert);
        assert_eq!(result.num_affected, 1);
        let doc = result.affected_documents.unwrap();
        assert_eq!(doc["hello"], json!("world"));
        assert_eq!(doc["bloup"], json!(3));
    }

    #[test]
    fn scenario_three_unique_indexes_update_rolls_back() {
        let col = Collection::open_in_memory().unwrap();
        col.ensure_index("a", true, false, None).unwrap();
        col.ensure_index("b", true, false, None).unwrap();
        col.ensure_index("c", true, false, None).unwrap();

        col.insert(json!({"a": 1, "b": 10, "c": 100})).unwrap();
        col.insert(json!({"a": 2, "b": 20, "c": 200})).unwrap();
        col.insert(json!({"a": 3, "b": 30, "c": 300})).unwrap();

        let result = col.update(
            json!({"a": 2}),
            json!({"$inc": {"a": 10, "c": 1000}, "$set": {"b": 30}}),
            UpdateOptions::default(),
        );
        assert!(result.is_err());

        assert_eq!(col.count(json!({"a": 1})).unwrap(), 1);
        assert_eq!(col.count(json!({"a": 2})).unwrap(), 1);
        assert_eq!(col.count(json!({"a": 3})).unwrap(), 1);
        assert_eq!(col.count(json!({"a": 12})).unwrap(), 0);
    }

    #[test]
    fn id_zero_number_rejected_string_accepted() {
        let col = Collection::open_in_memory().unwrap();
        assert!(col.insert(json!({"_id": 0})).is_err());
        assert!(col.insert(json!({"_id": "0"})).is_ok());
    }

    #[test]
    fn remove_respects_multi_flag() {
        let col = Collection::open_in_memory().unwrap();
        col.insert_many(vec![json!({"a": 1}), json!({"a": 1}), json!({"a": 1})]).unwrap();
        let removed = col.remove(json!({"a": 1}), false).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(col.count(json!({"a": 1})).unwrap(), 2);
        let removed = col.remove(json!({"a": 1}), true).unwrap();
        assert_eq!(removed, 2);
    }

    #[test]
    fn ensure_index_is_idempotent() {
        let col = Collection::open_in_memory().unwrap();
        col.insert(json!({"a": 1})).unwrap();
        col.ensure_index("a", true, false, None).unwrap();
        assert!(col.ensure_index("a", true, false, None).is_ok());
    }

    #[test]
    fn find_with_sort_and_limit() {
        let col = Collection::open_in_memory().unwrap();
        col.insert_many(vec![json!({"n": 3}), json!({"n": 1}), json!({"n": 2})]).unwrap();
        let opts = FindOptions { sort: &[("n", 1)], skip: 0, limit: 2 };
        let found = col.find_with_options(json!({}), opts).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0]["n"], json!(1));
        assert_eq!(found[1]["n"], json!(2));
    }
}
