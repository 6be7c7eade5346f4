//! In-process server
//!
//! `MemoryConnection` answers the same commands a MongoDB server would for
//! the subset of features the collection layer uses:
//! - CRUD commands with the usual reply shapes, including `writeErrors`
//! - server-side cursors (`firstBatch`, `getMore`, `killCursors`)
//! - unique and sparse indexes
//! - simple aggregation pipelines
//!
//! It also records every command and can inject failures or latency, which
//! makes it the backbone of the crate's behaviour tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use mongodb::bson::{doc, oid::ObjectId, Bson, Document};
use tracing::{debug, trace};

use crate::command::Namespace;
use crate::error::{CollectionError, Result};
use crate::read_preference::ReadPreference;

use super::Connection;

mod query;
mod update;

const DEFAULT_BATCH_SIZE: usize = 101;

/// In-memory server implementing [`Connection`]
#[derive(Clone, Default)]
pub struct MemoryConnection {
    state: Arc<Mutex<ServerState>>,
    hooks: Arc<Mutex<Hooks>>,
}

#[derive(Default)]
struct ServerState {
    databases: BTreeMap<String, BTreeMap<String, CollectionState>>,
    cursors: HashMap<i64, ServerCursor>,
    next_cursor_id: i64,
}

#[derive(Default)]
struct Hooks {
    log: Vec<(String, Document)>,
    failures: VecDeque<CollectionError>,
    latency: Option<Duration>,
}

#[derive(Debug, Clone)]
struct CollectionState {
    documents: Vec<Document>,
    indexes: Vec<IndexState>,
}

#[derive(Debug, Clone)]
struct IndexState {
    name: String,
    keys: Document,
    unique: bool,
    sparse: bool,
}

struct ServerCursor {
    namespace: Namespace,
    remaining: VecDeque<Document>,
}

impl Default for CollectionState {
    fn default() -> Self {
        Self {
            documents: Vec::new(),
            indexes: vec![IndexState {
                name: "_id_".to_string(),
                keys: doc! { "_id": 1 },
                unique: true,
                sparse: false,
            }],
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next command fail with `error` instead of running.
    ///
    /// Failures queue up; each one is consumed by a single command.
    pub fn fail_next(&self, error: CollectionError) {
        lock(&self.hooks).failures.push_back(error);
    }

    /// Delay every command by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        lock(&self.hooks).latency = latency;
    }

    /// Every command received so far, with its target database.
    pub fn commands(&self) -> Vec<(String, Document)> {
        lock(&self.hooks).log.clone()
    }

    /// Names of the commands received so far.
    pub fn command_names(&self) -> Vec<String> {
        lock(&self.hooks)
            .log
            .iter()
            .filter_map(|(_, command)| command.keys().next().cloned())
            .collect()
    }

    /// Number of server cursors still open.
    pub fn open_cursors(&self) -> usize {
        lock(&self.state).cursors.len()
    }

    /// Copy of a collection's documents in insertion order.
    pub fn documents(&self, database: &str, collection: &str) -> Vec<Document> {
        lock(&self.state)
            .databases
            .get(database)
            .and_then(|colls| colls.get(collection))
            .map(|c| c.documents.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn submit_command(
        &self,
        database: &str,
        command: Document,
        read_preference: &ReadPreference,
    ) -> Result<Document> {
        let (latency, failure) = {
            let mut hooks = lock(&self.hooks);
            hooks.log.push((database.to_string(), command.clone()));
            (hooks.latency, hooks.failures.pop_front())
        };

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if let Some(error) = failure {
            debug!("Injected failure for command on '{}': {}", database, error);
            return Err(error);
        }

        trace!("Memory server ({}) running {:?}", read_preference.mode, command);
        let mut state = lock(&self.state);
        state.execute(database, &command)
    }
}

/* ========================= Command dispatch ========================= */

impl ServerState {
    fn execute(&mut self, database: &str, command: &Document) -> Result<Document> {
        let name = command
            .keys()
            .next()
            .ok_or_else(|| CollectionError::command(59, "empty command"))?
            .clone();

        match name.as_str() {
            "ping" => Ok(doc! { "ok": 1.0 }),
            "find" => self.find(database, command),
            "getMore" => self.get_more(command),
            "killCursors" => self.kill_cursors(command),
            "count" => self.count(database, command),
            "insert" => self.insert(database, command),
            "update" => self.update(database, command),
            "delete" => self.delete(database, command),
            "createIndexes" => self.create_indexes(database, command),
            "dropIndexes" => self.drop_indexes(database, command),
            "listIndexes" => self.list_indexes(database, command),
            "aggregate" => self.aggregate(database, command),
            "renameCollection" => self.rename(database, command),
            "collStats" => self.coll_stats(database, command),
            "drop" => self.drop_collection(database, command),
            "mapReduce" => Err(CollectionError::command(
                115,
                "mapReduce requires a JavaScript engine",
            )),
            other => Err(CollectionError::command(
                59,
                format!("no such command: '{other}'"),
            )),
        }
    }

    fn namespace(database: &str, command: &Document, field: &str) -> Result<Namespace> {
        let collection = command
            .get_str(field)
            .map_err(|_| CollectionError::command(73, format!("'{field}' must be a string")))?;
        Namespace::new(database, collection)
            .map_err(|e| CollectionError::command(73, e.to_string()))
    }

    fn collection(&self, ns: &Namespace) -> Option<&CollectionState> {
        self.databases.get(&ns.database)?.get(&ns.collection)
    }

    fn collection_mut(&mut self, ns: &Namespace) -> Option<&mut CollectionState> {
        self.databases.get_mut(&ns.database)?.get_mut(&ns.collection)
    }

    fn collection_or_create(&mut self, ns: &Namespace) -> &mut CollectionState {
        self.databases
            .entry(ns.database.clone())
            .or_default()
            .entry(ns.collection.clone())
            .or_default()
    }

    fn documents(&self, ns: &Namespace) -> &[Document] {
        self.collection(ns).map(|c| c.documents.as_slice()).unwrap_or(&[])
    }

    /// Register a cursor over `results` and build the `firstBatch` reply.
    fn cursor_reply(&mut self, ns: Namespace, results: Vec<Document>, batch_size: usize) -> Document {
        let mut remaining: VecDeque<Document> = results.into();
        let first: Vec<Bson> = take_batch(&mut remaining, batch_size);

        let id = if remaining.is_empty() {
            0
        } else {
            self.next_cursor_id += 1;
            let id = self.next_cursor_id;
            self.cursors.insert(
                id,
                ServerCursor {
                    namespace: ns.clone(),
                    remaining,
                },
            );
            id
        };

        doc! {
            "cursor": {
                "firstBatch": first,
                "id": id,
                "ns": ns.to_string(),
            },
            "ok": 1.0,
        }
    }

    fn find(&mut self, database: &str, command: &Document) -> Result<Document> {
        let ns = Self::namespace(database, command, "find")?;
        let filter = optional_document(command, "filter")?;
        let projection = optional_document(command, "projection")?;
        let sort = optional_document(command, "sort")?;
        let skip = optional_count(command, "skip")?.unwrap_or(0);
        let limit = optional_count(command, "limit")?.unwrap_or(0);
        let batch_size = optional_count(command, "batchSize")?.unwrap_or(DEFAULT_BATCH_SIZE);

        let mut results = filter_documents(self.documents(&ns), &filter)?;
        query::sort_documents(&mut results, &sort)?;
        let results = results
            .into_iter()
            .skip(skip)
            .take(if limit == 0 { usize::MAX } else { limit })
            .map(|d| query::project(&d, &projection))
            .collect::<Result<Vec<_>>>()?;

        Ok(self.cursor_reply(ns, results, batch_size))
    }

    fn get_more(&mut self, command: &Document) -> Result<Document> {
        let id = match command.get("getMore") {
            Some(Bson::Int64(id)) => *id,
            Some(Bson::Int32(id)) => i64::from(*id),
            _ => return Err(CollectionError::command(14, "getMore id must be an integer")),
        };
        let batch_size = optional_count(command, "batchSize")?.unwrap_or(DEFAULT_BATCH_SIZE);

        let cursor = self
            .cursors
            .get_mut(&id)
            .ok_or_else(|| CollectionError::command(43, format!("cursor id {id} not found")))?;
        let next: Vec<Bson> = take_batch(&mut cursor.remaining, batch_size);
        let ns = cursor.namespace.to_string();
        let mut reply_id = id;
        if cursor.remaining.is_empty() {
            self.cursors.remove(&id);
            reply_id = 0;
        }

        Ok(doc! {
            "cursor": {
                "nextBatch": next,
                "id": reply_id,
                "ns": ns,
            },
            "ok": 1.0,
        })
    }

    fn kill_cursors(&mut self, command: &Document) -> Result<Document> {
        let ids = command
            .get_array("cursors")
            .map_err(|_| CollectionError::command(14, "cursors must be an array"))?;
        let mut killed = Vec::new();
        let mut not_found = Vec::new();
        for id in ids {
            let id = match id {
                Bson::Int64(id) => *id,
                Bson::Int32(id) => i64::from(*id),
                _ => continue,
            };
            if self.cursors.remove(&id).is_some() {
                killed.push(id);
            } else {
                not_found.push(id);
            }
        }
        Ok(doc! {
            "cursorsKilled": killed,
            "cursorsNotFound": not_found,
            "ok": 1.0,
        })
    }

    fn count(&mut self, database: &str, command: &Document) -> Result<Document> {
        let ns = Self::namespace(database, command, "count")?;
        let filter = optional_document(command, "query")?;
        let n = filter_documents(self.documents(&ns), &filter)?.len();
        Ok(doc! { "n": n as i32, "ok": 1.0 })
    }

    fn insert(&mut self, database: &str, command: &Document) -> Result<Document> {
        let ns = Self::namespace(database, command, "insert")?;
        let documents = command
            .get_array("documents")
            .map_err(|_| CollectionError::command(9, "documents must be an array"))?;

        let collection = self.collection_or_create(&ns);
        let mut n = 0;
        let mut write_errors = Vec::new();
        for (index, item) in documents.iter().enumerate() {
            let Bson::Document(document) = item else {
                write_errors.push(write_error(index, 2, "document must be an object"));
                break;
            };
            let mut document = document.clone();
            if !document.contains_key("_id") {
                let mut with_id = doc! { "_id": ObjectId::new() };
                with_id.extend(document);
                document = with_id;
            }
            if let Err(message) = collection.check_unique(&ns, &document, None) {
                write_errors.push(write_error(index, 11000, &message));
                break;
            }
            collection.documents.push(document);
            n += 1;
        }

        let mut reply = doc! { "n": n, "ok": 1.0 };
        if !write_errors.is_empty() {
            reply.insert("writeErrors", write_errors);
        }
        Ok(reply)
    }

    fn update(&mut self, database: &str, command: &Document) -> Result<Document> {
        let ns = Self::namespace(database, command, "update")?;
        let statements = command
            .get_array("updates")
            .map_err(|_| CollectionError::command(9, "updates must be an array"))?;

        let collection = self.collection_or_create(&ns);
        let mut matched = 0;
        let mut modified = 0;
        let mut upserted = Vec::new();
        let mut write_errors = Vec::new();

        for (index, statement) in statements.iter().enumerate() {
            let Bson::Document(statement) = statement else {
                write_errors.push(write_error(index, 9, "update statement must be an object"));
                break;
            };
            let criteria = optional_document(statement, "q")?;
            let change = statement
                .get_document("u")
                .map_err(|_| CollectionError::command(9, "u must be an object"))?;
            let upsert = statement.get_bool("upsert").unwrap_or(false);
            let multi = statement.get_bool("multi").unwrap_or(false);

            match collection.apply_update(&ns, &criteria, change, upsert, multi) {
                Ok(outcome) => {
                    matched += outcome.matched;
                    modified += outcome.modified;
                    if let Some(id) = outcome.upserted {
                        upserted.push(doc! { "index": index as i32, "_id": id });
                    }
                }
                Err(UpdateFailure::Duplicate(message)) => {
                    write_errors.push(write_error(index, 11000, &message));
                    break;
                }
                Err(UpdateFailure::Command(error)) => {
                    let code = error.code().unwrap_or(2);
                    write_errors.push(write_error(index, code, &error.to_string()));
                    break;
                }
            }
        }

        let mut reply = doc! {
            "n": matched + upserted.len() as i32,
            "nModified": modified,
            "ok": 1.0,
        };
        if !upserted.is_empty() {
            reply.insert("upserted", upserted);
        }
        if !write_errors.is_empty() {
            reply.insert("writeErrors", write_errors);
        }
        Ok(reply)
    }

    fn delete(&mut self, database: &str, command: &Document) -> Result<Document> {
        let ns = Self::namespace(database, command, "delete")?;
        let statements = command
            .get_array("deletes")
            .map_err(|_| CollectionError::command(9, "deletes must be an array"))?
            .clone();

        let mut n = 0;
        let Some(collection) = self.collection_mut(&ns) else {
            return Ok(doc! { "n": 0, "ok": 1.0 });
        };
        for statement in statements {
            let Bson::Document(statement) = statement else {
                return Err(CollectionError::command(9, "delete statement must be an object"));
            };
            let criteria = optional_document(&statement, "q")?;
            let just_one = optional_count(&statement, "limit")?.unwrap_or(0) == 1;

            let mut removed = Vec::new();
            for (position, document) in collection.documents.iter().enumerate() {
                if just_one && !removed.is_empty() {
                    break;
                }
                if query::matches(document, &criteria)? {
                    removed.push(position);
                }
            }
            for position in removed.iter().rev() {
                collection.documents.remove(*position);
            }
            n += removed.len() as i32;
        }
        Ok(doc! { "n": n, "ok": 1.0 })
    }

    fn create_indexes(&mut self, database: &str, command: &Document) -> Result<Document> {
        let ns = Self::namespace(database, command, "createIndexes")?;
        let specs = command
            .get_array("indexes")
            .map_err(|_| CollectionError::command(9, "indexes must be an array"))?;

        let created_collection = self.collection(&ns).is_none();
        let collection = self.collection_or_create(&ns);
        let before = collection.indexes.len() as i32;

        for spec in specs {
            let Bson::Document(spec) = spec else {
                return Err(CollectionError::command(9, "index spec must be an object"));
            };
            let keys = spec
                .get_document("key")
                .map_err(|_| CollectionError::command(67, "index spec needs a key"))?
                .clone();
            if keys.is_empty() {
                return Err(CollectionError::command(67, "index key pattern is empty"));
            }
            let name = spec
                .get_str("name")
                .map_err(|_| CollectionError::command(9, "index spec needs a name"))?
                .to_string();
            let index = IndexState {
                name,
                keys,
                unique: spec.get_bool("unique").unwrap_or(false),
                sparse: spec.get_bool("sparse").unwrap_or(false),
            };

            let same_options = collection
                .indexes
                .iter()
                .find(|i| i.name == index.name)
                .map(|existing| {
                    existing.keys == index.keys
                        && existing.unique == index.unique
                        && existing.sparse == index.sparse
                });
            match same_options {
                Some(true) => {}
                Some(false) => {
                    return Err(CollectionError::command(
                        85,
                        format!("index '{}' already exists with different options", index.name),
                    ));
                }
                None => {
                    if index.unique {
                        collection.verify_unique(&ns, &index)?;
                    }
                    collection.indexes.push(index);
                }
            }
        }

        Ok(doc! {
            "createdCollectionAutomatically": created_collection,
            "numIndexesBefore": before,
            "numIndexesAfter": collection.indexes.len() as i32,
            "ok": 1.0,
        })
    }

    fn drop_indexes(&mut self, database: &str, command: &Document) -> Result<Document> {
        let ns = Self::namespace(database, command, "dropIndexes")?;
        let name = command
            .get_str("index")
            .map_err(|_| CollectionError::command(9, "index must be a name"))?
            .to_string();
        let collection = self
            .collection_mut(&ns)
            .ok_or_else(|| CollectionError::command(26, format!("ns not found {ns}")))?;
        let before = collection.indexes.len() as i32;

        if name == "*" {
            collection.indexes.retain(|i| i.name == "_id_");
        } else if name == "_id_" {
            return Err(CollectionError::command(72, "cannot drop _id index"));
        } else {
            let position = collection
                .indexes
                .iter()
                .position(|i| i.name == name)
                .ok_or_else(|| CollectionError::command(27, format!("index not found with name [{name}]")))?;
            collection.indexes.remove(position);
        }
        Ok(doc! { "nIndexesWas": before, "ok": 1.0 })
    }

    fn list_indexes(&mut self, database: &str, command: &Document) -> Result<Document> {
        let ns = Self::namespace(database, command, "listIndexes")?;
        let batch_size = command
            .get_document("cursor")
            .ok()
            .and_then(|c| optional_count(c, "batchSize").ok().flatten())
            .unwrap_or(DEFAULT_BATCH_SIZE);
        let collection = self
            .collection(&ns)
            .ok_or_else(|| CollectionError::command(26, format!("ns does not exist: {ns}")))?;

        let indexes = collection
            .indexes
            .iter()
            .map(|index| {
                let mut description = doc! {
                    "v": 2,
                    "key": index.keys.clone(),
                    "name": index.name.clone(),
                };
                if index.unique && index.name != "_id_" {
                    description.insert("unique", true);
                }
                if index.sparse {
                    description.insert("sparse", true);
                }
                description
            })
            .collect();
        Ok(self.cursor_reply(ns, indexes, batch_size))
    }

    fn aggregate(&mut self, database: &str, command: &Document) -> Result<Document> {
        let ns = Self::namespace(database, command, "aggregate")?;
        let pipeline = command
            .get_array("pipeline")
            .map_err(|_| CollectionError::command(14, "pipeline must be an array"))?;

        let mut results = self.documents(&ns).to_vec();
        for stage in pipeline {
            let Bson::Document(stage) = stage else {
                return Err(CollectionError::command(14, "pipeline stage must be an object"));
            };
            results = run_stage(results, stage)?;
        }

        if command.get_bool("explain").unwrap_or(false) {
            return Ok(doc! { "stages": pipeline.clone(), "ok": 1.0 });
        }
        match command.get_document("cursor") {
            Ok(cursor) => {
                let batch_size = optional_count(cursor, "batchSize")?.unwrap_or(DEFAULT_BATCH_SIZE);
                Ok(self.cursor_reply(ns, results, batch_size))
            }
            Err(_) => {
                let results: Vec<Bson> = results.into_iter().map(Bson::Document).collect();
                Ok(doc! { "result": results, "ok": 1.0 })
            }
        }
    }

    fn rename(&mut self, database: &str, command: &Document) -> Result<Document> {
        if database != "admin" {
            return Err(CollectionError::command(
                13,
                "renameCollection may only be run against the admin database",
            ));
        }
        let source = command
            .get_str("renameCollection")
            .map_err(|_| CollectionError::command(73, "source namespace must be a string"))
            .and_then(|ns| Namespace::parse(ns).map_err(|e| CollectionError::command(73, e.to_string())))?;
        let target = command
            .get_str("to")
            .map_err(|_| CollectionError::command(73, "target namespace must be a string"))
            .and_then(|ns| Namespace::parse(ns).map_err(|e| CollectionError::command(73, e.to_string())))?;
        let drop_target = command.get_bool("dropTarget").unwrap_or(false);

        if self.collection(&source).is_none() {
            return Err(CollectionError::command(26, "source namespace does not exist"));
        }
        if self.collection(&target).is_some() && !drop_target {
            return Err(CollectionError::command(48, "target namespace exists"));
        }

        let moved = self
            .databases
            .get_mut(&source.database)
            .and_then(|colls| colls.remove(&source.collection))
            .unwrap_or_default();
        self.databases
            .entry(target.database.clone())
            .or_default()
            .insert(target.collection.clone(), moved);
        Ok(doc! { "ok": 1.0 })
    }

    fn coll_stats(&mut self, database: &str, command: &Document) -> Result<Document> {
        let ns = Self::namespace(database, command, "collStats")?;
        let collection = self
            .collection(&ns)
            .ok_or_else(|| CollectionError::command(26, format!("ns not found {ns}")))?;

        let count = collection.documents.len() as i64;
        let size: i64 = collection
            .documents
            .iter()
            .map(|d| mongodb::bson::to_vec(d).map(|bytes| bytes.len() as i64).unwrap_or(0))
            .sum();
        let mut stats = doc! {
            "ns": ns.to_string(),
            "count": count,
            "size": size,
        };
        if count > 0 {
            stats.insert("avgObjSize", size / count);
        }
        stats.insert("nindexes", collection.indexes.len() as i32);
        let names: Vec<Bson> = collection.indexes.iter().map(|i| Bson::String(i.name.clone())).collect();
        stats.insert("indexNames", names);
        stats.insert("ok", 1.0);
        Ok(stats)
    }

    fn drop_collection(&mut self, database: &str, command: &Document) -> Result<Document> {
        let ns = Self::namespace(database, command, "drop")?;
        let removed = self
            .databases
            .get_mut(&ns.database)
            .and_then(|colls| colls.remove(&ns.collection))
            .ok_or_else(|| CollectionError::command(26, "ns not found"))?;
        self.cursors.retain(|_, cursor| cursor.namespace != ns);
        Ok(doc! {
            "ns": ns.to_string(),
            "nIndexesWas": removed.indexes.len() as i32,
            "ok": 1.0,
        })
    }
}

/* ========================= Writes and indexes ========================= */

struct UpdateOutcome {
    matched: i32,
    modified: i32,
    upserted: Option<Bson>,
}

enum UpdateFailure {
    Duplicate(String),
    Command(CollectionError),
}

impl From<CollectionError> for UpdateFailure {
    fn from(error: CollectionError) -> Self {
        UpdateFailure::Command(error)
    }
}

impl CollectionState {
    fn apply_update(
        &mut self,
        ns: &Namespace,
        criteria: &Document,
        change: &Document,
        upsert: bool,
        multi: bool,
    ) -> std::result::Result<UpdateOutcome, UpdateFailure> {
        let mut outcome = UpdateOutcome {
            matched: 0,
            modified: 0,
            upserted: None,
        };

        for position in 0..self.documents.len() {
            if !query::matches(&self.documents[position], criteria)? {
                continue;
            }
            outcome.matched += 1;

            let mut candidate = self.documents[position].clone();
            if update::apply(&mut candidate, change)? {
                self.check_unique(ns, &candidate, Some(position))
                    .map_err(UpdateFailure::Duplicate)?;
                self.documents[position] = candidate;
                outcome.modified += 1;
            }
            if !multi {
                break;
            }
        }

        if outcome.matched == 0 && upsert {
            let mut document = if update::is_replacement(change) {
                Document::new()
            } else {
                update::upsert_seed(criteria)
            };
            update::apply(&mut document, change)?;
            if !document.contains_key("_id") {
                let id = criteria
                    .get("_id")
                    .cloned()
                    .unwrap_or_else(|| Bson::ObjectId(ObjectId::new()));
                let mut with_id = doc! { "_id": id };
                with_id.extend(document);
                document = with_id;
            }
            self.check_unique(ns, &document, None)
                .map_err(UpdateFailure::Duplicate)?;
            outcome.upserted = document.get("_id").cloned();
            self.documents.push(document);
        }
        Ok(outcome)
    }

    /// Check every unique index for a conflict with `document`.
    ///
    /// `skip` is the position of the document being replaced, if any.
    fn check_unique(
        &self,
        ns: &Namespace,
        document: &Document,
        skip: Option<usize>,
    ) -> std::result::Result<(), String> {
        for index in self.indexes.iter().filter(|i| i.unique) {
            let Some(key) = index.key_of(document) else {
                continue;
            };
            let conflict = self
                .documents
                .iter()
                .enumerate()
                .filter(|(position, _)| Some(*position) != skip)
                .any(|(_, other)| index.key_of(other).as_ref() == Some(&key));
            if conflict {
                return Err(index.duplicate_message(ns, &key));
            }
        }
        Ok(())
    }

    fn verify_unique(&self, ns: &Namespace, index: &IndexState) -> Result<()> {
        let mut seen: Vec<Vec<Bson>> = Vec::new();
        for document in &self.documents {
            if let Some(key) = index.key_of(document) {
                if seen.contains(&key) {
                    return Err(CollectionError::command(11000, index.duplicate_message(ns, &key)));
                }
                seen.push(key);
            }
        }
        Ok(())
    }
}

impl IndexState {
    /// Index key of `document`, or `None` when a sparse index skips it.
    fn key_of(&self, document: &Document) -> Option<Vec<Bson>> {
        let values: Vec<Option<&Bson>> = self
            .keys
            .keys()
            .map(|field| query::get_path(document, field))
            .collect();
        if self.sparse && values.iter().all(Option::is_none) {
            return None;
        }
        Some(
            values
                .into_iter()
                .map(|v| normalize_key(v.cloned().unwrap_or(Bson::Null)))
                .collect(),
        )
    }

    fn duplicate_message(&self, ns: &Namespace, key: &[Bson]) -> String {
        let mut dup = Document::new();
        for (field, value) in self.keys.keys().zip(key) {
            dup.insert(field.clone(), value.clone());
        }
        format!(
            "E11000 duplicate key error collection: {ns} index: {} dup key: {dup}",
            self.name
        )
    }
}

/// Numbers of different BSON types compare equal in index keys.
fn normalize_key(value: Bson) -> Bson {
    match value {
        Bson::Int32(v) => Bson::Double(f64::from(v)),
        Bson::Int64(v) => Bson::Double(v as f64),
        other => other,
    }
}

/* ========================= Helpers ========================= */

fn run_stage(documents: Vec<Document>, stage: &Document) -> Result<Vec<Document>> {
    let Some((name, spec)) = stage.iter().next() else {
        return Err(CollectionError::command(40323, "pipeline stage is empty"));
    };
    match (name.as_str(), spec) {
        ("$match", Bson::Document(filter)) => filter_documents(&documents, filter),
        ("$sort", Bson::Document(sort)) => {
            let mut documents = documents;
            query::sort_documents(&mut documents, sort)?;
            Ok(documents)
        }
        ("$skip", value) => Ok(documents.into_iter().skip(stage_count(name, value)?).collect()),
        ("$limit", value) => Ok(documents.into_iter().take(stage_count(name, value)?).collect()),
        ("$project", Bson::Document(projection)) => documents
            .iter()
            .map(|d| query::project(d, projection))
            .collect(),
        ("$count", Bson::String(field)) if !field.is_empty() && !field.starts_with('$') => {
            if documents.is_empty() {
                return Ok(Vec::new());
            }
            let mut counted = Document::new();
            counted.insert(field.clone(), documents.len() as i32);
            Ok(vec![counted])
        }
        (other, _) => Err(CollectionError::command(
            40324,
            format!("Unrecognized pipeline stage name: '{other}'"),
        )),
    }
}

fn stage_count(stage: &str, value: &Bson) -> Result<usize> {
    let n = match value {
        Bson::Int32(v) => i64::from(*v),
        Bson::Int64(v) => *v,
        Bson::Double(v) if v.fract() == 0.0 => *v as i64,
        _ => -1,
    };
    usize::try_from(n)
        .map_err(|_| CollectionError::command(15958, format!("{stage} must be a non-negative integer")))
}

fn filter_documents(documents: &[Document], filter: &Document) -> Result<Vec<Document>> {
    let mut out = Vec::new();
    for document in documents {
        if query::matches(document, filter)? {
            out.push(document.clone());
        }
    }
    Ok(out)
}

fn take_batch(remaining: &mut VecDeque<Document>, batch_size: usize) -> Vec<Bson> {
    let size = if batch_size == 0 { DEFAULT_BATCH_SIZE } else { batch_size };
    let take = size.min(remaining.len());
    remaining.drain(..take).map(Bson::Document).collect()
}

fn optional_document(command: &Document, field: &str) -> Result<Document> {
    match command.get(field) {
        None | Some(Bson::Null) => Ok(Document::new()),
        Some(Bson::Document(d)) => Ok(d.clone()),
        Some(_) => Err(CollectionError::command(14, format!("'{field}' must be an object"))),
    }
}

fn optional_count(command: &Document, field: &str) -> Result<Option<usize>> {
    let value = match command.get(field) {
        None => return Ok(None),
        Some(Bson::Int32(v)) => i64::from(*v),
        Some(Bson::Int64(v)) => *v,
        Some(Bson::Double(v)) => *v as i64,
        Some(_) => return Err(CollectionError::command(14, format!("'{field}' must be a number"))),
    };
    usize::try_from(value)
        .map(Some)
        .map_err(|_| CollectionError::command(2, format!("'{field}' must be non-negative")))
}

fn write_error(index: usize, code: i32, message: &str) -> Document {
    doc! {
        "index": index as i32,
        "code": code,
        "errmsg": message,
    }
}

#[cfg(test)]
mod tests;
