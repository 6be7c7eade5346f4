//! Command document builders
//!
//! Pure functions turning typed call arguments into canonical command
//! documents. The command name always comes first and modifiers follow in a
//! fixed order, so the same inputs always produce byte-identical commands.
//! Structurally invalid input fails with `InvalidArgument` before any I/O.

use std::fmt;

use mongodb::bson::{doc, Bson, Document};

use crate::error::{CollectionError, Result};

mod params;

pub use params::{
    AggregateFlags, FindParams, IndexOptions, IndexSpec, MapReduceParams, UpdateParams,
};

/// Fully qualified collection name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    pub database: String,
    pub collection: String,
}

impl Namespace {
    /// Build a namespace, validating both parts.
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Result<Self> {
        let database = database.into();
        let collection = collection.into();
        validate_database_name(&database)?;
        validate_collection_name(&collection)?;
        Ok(Self {
            database,
            collection,
        })
    }

    /// Split `db.collection` at the first dot.
    pub fn parse(absolute: &str) -> Result<Self> {
        match absolute.split_once('.') {
            Some((database, collection)) => Self::new(database, collection),
            None => Err(CollectionError::invalid_argument(format!(
                "namespace '{absolute}' has no collection part"
            ))),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

pub(crate) fn validate_database_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(CollectionError::invalid_argument("database name is empty"));
    }
    if let Some(c) = name.chars().find(|c| matches!(c, '.' | '$' | '/' | '\\' | ' ' | '\0')) {
        return Err(CollectionError::invalid_argument(format!(
            "database name '{name}' contains '{c}'"
        )));
    }
    Ok(())
}

pub(crate) fn validate_collection_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(CollectionError::invalid_argument("collection name is empty"));
    }
    if name.contains('$') || name.contains('\0') {
        return Err(CollectionError::invalid_argument(format!(
            "collection name '{name}' contains a reserved character"
        )));
    }
    if name.starts_with('.') || name.ends_with('.') {
        return Err(CollectionError::invalid_argument(format!(
            "collection name '{name}' cannot start or end with '.'"
        )));
    }
    Ok(())
}

fn non_negative(field: &str, value: i64) -> Result<()> {
    if value < 0 {
        return Err(CollectionError::invalid_argument(format!(
            "{field} must be >= 0, got {value}"
        )));
    }
    Ok(())
}

/// `find, filter, projection, skip, limit, sort`
pub fn find(ns: &Namespace, params: &FindParams) -> Result<Document> {
    non_negative("skip", params.skip)?;
    non_negative("limit", params.limit)?;

    let mut projection = Document::new();
    for field in &params.fields {
        if field.is_empty() {
            return Err(CollectionError::invalid_argument("projected field name is empty"));
        }
        projection.insert(field.clone(), 1);
    }

    Ok(doc! {
        "find": &ns.collection,
        "filter": params.criteria.clone(),
        "projection": projection,
        "skip": params.skip,
        "limit": params.limit,
        "sort": params.sort.clone(),
    })
}

/// `count, query`
pub fn count(ns: &Namespace, criteria: &Document) -> Result<Document> {
    Ok(doc! {
        "count": &ns.collection,
        "query": criteria.clone(),
    })
}

/// `insert, documents, ordered`
pub fn insert(ns: &Namespace, documents: &[Document]) -> Result<Document> {
    if documents.is_empty() {
        return Err(CollectionError::invalid_argument("no documents to insert"));
    }
    let documents: Vec<Bson> = documents.iter().cloned().map(Bson::Document).collect();
    Ok(doc! {
        "insert": &ns.collection,
        "documents": documents,
        "ordered": true,
    })
}

/// `update, updates: [{q, u, upsert, multi}], ordered`
pub fn update(ns: &Namespace, params: &UpdateParams) -> Result<Document> {
    if params.update.is_empty() {
        return Err(CollectionError::invalid_argument("update document is empty"));
    }

    let operators = params.update.keys().filter(|k| k.starts_with('$')).count();
    if operators != 0 && operators != params.update.len() {
        return Err(CollectionError::invalid_argument(
            "update document mixes operators and plain fields",
        ));
    }
    if operators == 0 && params.multi {
        return Err(CollectionError::invalid_argument(
            "a replacement document cannot be applied to multiple documents",
        ));
    }

    Ok(doc! {
        "update": &ns.collection,
        "updates": [{
            "q": params.criteria.clone(),
            "u": params.update.clone(),
            "upsert": params.upsert,
            "multi": params.multi,
        }],
        "ordered": true,
    })
}

/// `delete, deletes: [{q, limit: 0}], ordered`
pub fn delete(ns: &Namespace, criteria: &Document) -> Result<Document> {
    Ok(doc! {
        "delete": &ns.collection,
        "deletes": [{
            "q": criteria.clone(),
            "limit": 0,
        }],
        "ordered": true,
    })
}

/// `renameCollection, to, dropTarget`; runs against `admin`
pub fn rename(
    ns: &Namespace,
    new_database: &str,
    new_collection: &str,
    drop_target: bool,
) -> Result<Document> {
    let target = Namespace::new(new_database, new_collection)?;
    if &target == ns {
        return Err(CollectionError::invalid_argument(format!(
            "cannot rename '{ns}' to itself"
        )));
    }
    Ok(doc! {
        "renameCollection": ns.to_string(),
        "to": target.to_string(),
        "dropTarget": drop_target,
    })
}

/// `createIndexes, indexes: [{key, name, <flags>}]`
pub fn create_index(ns: &Namespace, spec: &IndexSpec) -> Result<Document> {
    if spec.keys.is_empty() {
        return Err(CollectionError::invalid_argument("index key pattern is empty"));
    }

    let name = if spec.name.is_empty() {
        index_name(&spec.keys)
    } else {
        spec.name.clone()
    };

    let mut index = doc! {
        "key": spec.keys.clone(),
        "name": name,
    };
    if spec.options.contains(IndexOptions::UNIQUE) {
        index.insert("unique", true);
    }
    if spec.options.contains(IndexOptions::DROP_DUPS) {
        index.insert("dropDups", true);
    }
    if spec.options.contains(IndexOptions::BACKGROUND) {
        index.insert("background", true);
    }
    if spec.options.contains(IndexOptions::SPARSE) {
        index.insert("sparse", true);
    }

    Ok(doc! {
        "createIndexes": &ns.collection,
        "indexes": [index],
    })
}

/// Conventional index name: `field_direction` pairs joined by `_`.
pub fn index_name(keys: &Document) -> String {
    keys.iter()
        .map(|(field, direction)| {
            let direction = match direction {
                Bson::Int32(v) => v.to_string(),
                Bson::Int64(v) => v.to_string(),
                Bson::Double(v) if v.fract() == 0.0 => format!("{}", *v as i64),
                Bson::Double(v) => v.to_string(),
                Bson::String(s) => s.clone(),
                other => other.to_string(),
            };
            format!("{field}_{direction}")
        })
        .collect::<Vec<_>>()
        .join("_")
}

/// `dropIndexes, index`
pub fn drop_index(ns: &Namespace, name: &str) -> Result<Document> {
    if name.is_empty() {
        return Err(CollectionError::invalid_argument("index name is empty"));
    }
    Ok(doc! {
        "dropIndexes": &ns.collection,
        "index": name,
    })
}

/// `listIndexes, cursor`
pub fn list_indexes(ns: &Namespace) -> Result<Document> {
    Ok(doc! {
        "listIndexes": &ns.collection,
        "cursor": {},
    })
}

const RESERVED_AGGREGATE_OPTIONS: [&str; 4] = ["aggregate", "pipeline", "cursor", "explain"];

/// `aggregate, pipeline, [explain], [allowDiskUse], [cursor], <options>`
pub fn aggregate(
    ns: &Namespace,
    pipeline: &[Document],
    flags: &AggregateFlags,
    options: &Document,
) -> Result<Document> {
    for (position, stage) in pipeline.iter().enumerate() {
        let mut keys = stage.keys();
        match (keys.next(), keys.next()) {
            (Some(op), None) if op.starts_with('$') => {}
            _ => {
                return Err(CollectionError::invalid_argument(format!(
                    "pipeline stage {position} must have exactly one '$' operator"
                )));
            }
        }
    }
    if let Some(key) = options
        .keys()
        .find(|k| RESERVED_AGGREGATE_OPTIONS.contains(&k.as_str()))
    {
        return Err(CollectionError::invalid_argument(format!(
            "aggregate option '{key}' is set by flags"
        )));
    }

    let stages: Vec<Bson> = pipeline.iter().cloned().map(Bson::Document).collect();
    let mut command = doc! {
        "aggregate": &ns.collection,
        "pipeline": stages,
    };
    if flags.explain {
        command.insert("explain", true);
    }
    if flags.allow_disk_use {
        command.insert("allowDiskUse", true);
    }
    if flags.cursor && !flags.explain {
        let cursor = match flags.batch_size {
            Some(size) => doc! { "batchSize": i64::from(size) },
            None => Document::new(),
        };
        command.insert("cursor", cursor);
    }
    for (key, value) in options {
        command.insert(key.clone(), value.clone());
    }
    Ok(command)
}

/// `mapReduce, map, reduce, [query], [sort], [limit], out, [keeptemp], [finalize], [scope], jsMode, verbose`
pub fn map_reduce(ns: &Namespace, params: &MapReduceParams) -> Result<Document> {
    if params.map.trim().is_empty() {
        return Err(CollectionError::invalid_argument("map function is empty"));
    }
    if params.reduce.trim().is_empty() {
        return Err(CollectionError::invalid_argument("reduce function is empty"));
    }
    non_negative("limit", params.limit)?;

    let mut command = doc! {
        "mapReduce": &ns.collection,
        "map": Bson::JavaScriptCode(params.map.clone()),
        "reduce": Bson::JavaScriptCode(params.reduce.clone()),
    };
    if let Some(query) = &params.query {
        command.insert("query", query.clone());
    }
    if let Some(sort) = &params.sort {
        command.insert("sort", sort.clone());
    }
    if params.limit > 0 {
        command.insert("limit", params.limit);
    }
    let out = params.output.clone().unwrap_or_else(|| doc! { "inline": 1 });
    command.insert("out", out);
    if params.keep_temp {
        command.insert("keeptemp", true);
    }
    if let Some(finalize) = &params.finalize {
        command.insert("finalize", Bson::JavaScriptCode(finalize.clone()));
    }
    if let Some(scope) = &params.scope {
        command.insert("scope", scope.clone());
    }
    command.insert("jsMode", params.js_mode);
    command.insert("verbose", params.verbose);
    Ok(command)
}

/// `collStats`
pub fn stats(ns: &Namespace) -> Result<Document> {
    Ok(doc! { "collStats": &ns.collection })
}

/// `drop`
pub fn drop(ns: &Namespace) -> Result<Document> {
    Ok(doc! { "drop": &ns.collection })
}

/// `getMore, collection, batchSize`
pub fn get_more(ns: &Namespace, cursor_id: i64, batch_size: u32) -> Result<Document> {
    if cursor_id == 0 {
        return Err(CollectionError::invalid_argument("cursor id 0 is already exhausted"));
    }
    Ok(doc! {
        "getMore": cursor_id,
        "collection": &ns.collection,
        "batchSize": i64::from(batch_size),
    })
}

/// `killCursors, cursors`
pub fn kill_cursors(ns: &Namespace, cursor_ids: &[i64]) -> Result<Document> {
    let ids: Vec<Bson> = cursor_ids.iter().map(|id| Bson::Int64(*id)).collect();
    Ok(doc! {
        "killCursors": &ns.collection,
        "cursors": ids,
    })
}
