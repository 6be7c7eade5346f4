//! Typed parameters accepted by the command builders

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use mongodb::bson::Document;

/// Parameters of a `find`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindParams {
    /// Query filter; empty matches everything
    pub criteria: Document,

    /// Names of the fields to return; empty returns whole documents
    pub fields: Vec<String>,

    pub skip: i64,

    /// Maximum number of documents; 0 means no limit
    pub limit: i64,

    pub sort: Document,
}

impl FindParams {
    pub fn new(criteria: Document) -> Self {
        Self {
            criteria,
            ..Default::default()
        }
    }

    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn skip(mut self, skip: i64) -> Self {
        self.skip = skip;
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn sort(mut self, sort: Document) -> Self {
        self.sort = sort;
        self
    }
}

/// Parameters of an `update`
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateParams {
    pub criteria: Document,

    /// Either an operator document (`$set`, ...) or a replacement document
    pub update: Document,

    /// Insert a new document when nothing matches
    pub upsert: bool,

    /// Apply to every matching document instead of the first one
    pub multi: bool,
}

impl UpdateParams {
    pub fn new(criteria: Document, update: Document) -> Self {
        Self {
            criteria,
            update,
            upsert: false,
            multi: false,
        }
    }

    pub fn upsert(mut self, upsert: bool) -> Self {
        self.upsert = upsert;
        self
    }

    pub fn multi(mut self, multi: bool) -> Self {
        self.multi = multi;
        self
    }
}

/// Independent index option flags
///
/// Flags combine with `|` and the result does not depend on the order in
/// which they were combined.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct IndexOptions(u8);

impl IndexOptions {
    pub const NONE: IndexOptions = IndexOptions(0);
    pub const UNIQUE: IndexOptions = IndexOptions(1 << 0);
    pub const DROP_DUPS: IndexOptions = IndexOptions(1 << 2);
    pub const BACKGROUND: IndexOptions = IndexOptions(1 << 3);
    pub const SPARSE: IndexOptions = IndexOptions(1 << 4);

    pub fn contains(&self, other: IndexOptions) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn bits(&self) -> u8 {
        self.0
    }
}

impl BitOr for IndexOptions {
    type Output = IndexOptions;

    fn bitor(self, rhs: IndexOptions) -> IndexOptions {
        IndexOptions(self.0 | rhs.0)
    }
}

impl BitOrAssign for IndexOptions {
    fn bitor_assign(&mut self, rhs: IndexOptions) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for IndexOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [
            (IndexOptions::UNIQUE, "UNIQUE"),
            (IndexOptions::DROP_DUPS, "DROP_DUPS"),
            (IndexOptions::BACKGROUND, "BACKGROUND"),
            (IndexOptions::SPARSE, "SPARSE"),
        ]
        .iter()
        .filter(|(flag, _)| self.contains(*flag))
        .map(|(_, name)| *name)
        .collect();
        write!(f, "IndexOptions({})", names.join(" | "))
    }
}

/// Index description passed to `createIndexes`
#[derive(Debug, Clone, PartialEq)]
pub struct IndexSpec {
    /// Key pattern, e.g. `{ "email": 1 }`
    pub keys: Document,

    /// Index name; empty means the conventional generated name
    pub name: String,

    pub options: IndexOptions,
}

impl IndexSpec {
    pub fn new(keys: Document) -> Self {
        Self {
            keys,
            name: String::new(),
            options: IndexOptions::NONE,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn options(mut self, options: IndexOptions) -> Self {
        self.options = options;
        self
    }
}

/// Switches of an `aggregate`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregateFlags {
    /// Ask for a cursor-shaped reply
    pub cursor: bool,

    /// Batch size of the first cursor batch
    pub batch_size: Option<u32>,

    /// Return the query plan instead of results
    pub explain: bool,

    pub allow_disk_use: bool,
}

impl Default for AggregateFlags {
    fn default() -> Self {
        Self {
            cursor: true,
            batch_size: None,
            explain: false,
            allow_disk_use: false,
        }
    }
}

/// Parameters of a `mapReduce`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MapReduceParams {
    /// JavaScript source of the map function
    pub map: String,

    /// JavaScript source of the reduce function
    pub reduce: String,

    pub query: Option<Document>,
    pub sort: Option<Document>,

    /// 0 means no limit
    pub limit: i64,

    /// Output spec; `{ inline: 1 }` when absent
    pub output: Option<Document>,

    pub keep_temp: bool,

    /// JavaScript source of the finalize function
    pub finalize: Option<String>,

    pub scope: Option<Document>,
    pub js_mode: bool,
    pub verbose: bool,
}

impl MapReduceParams {
    pub fn new(map: impl Into<String>, reduce: impl Into<String>) -> Self {
        Self {
            map: map.into(),
            reduce: reduce.into(),
            ..Default::default()
        }
    }
}
