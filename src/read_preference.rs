//! Read preference values and resolution
//!
//! A read preference is an immutable routing directive. Each operation may
//! supply its own; otherwise the collection default applies, and failing that
//! the process-wide default (`primary`).

use std::fmt;

use mongodb::bson::{doc, Bson, Document};
use serde::{Deserialize, Serialize};

/// Routing mode of a read preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum ReadMode {
    #[default]
    Primary,
    PrimaryPreferred,
    Secondary,
    SecondaryPreferred,
    Nearest,
}

/// Read preference: a mode plus optional tag sets
///
/// Tag sets are ordered; the server tries them in sequence. `primary` never
/// carries tags.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReadPreference {
    pub mode: ReadMode,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<Document>,
}

impl ReadPreference {
    pub fn new(mode: ReadMode) -> Self {
        Self {
            mode,
            tags: Vec::new(),
        }
    }

    pub fn primary() -> Self {
        Self::new(ReadMode::Primary)
    }

    pub fn secondary() -> Self {
        Self::new(ReadMode::Secondary)
    }

    pub fn nearest() -> Self {
        Self::new(ReadMode::Nearest)
    }

    /// Append a tag set.
    ///
    /// Tags on a `primary` preference are dropped, matching server rules.
    pub fn with_tags(mut self, tags: Document) -> Self {
        if self.mode != ReadMode::Primary {
            self.tags.push(tags);
        }
        self
    }

    /// Wire form attached to commands as `$readPreference`.
    pub fn to_document(&self) -> Document {
        let mut document = doc! { "mode": self.mode.as_str() };
        if !self.tags.is_empty() {
            let tags: Vec<Bson> = self.tags.iter().cloned().map(Bson::Document).collect();
            document.insert("tags", tags);
        }
        document
    }
}

impl ReadMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadMode::Primary => "primary",
            ReadMode::PrimaryPreferred => "primaryPreferred",
            ReadMode::Secondary => "secondary",
            ReadMode::SecondaryPreferred => "secondaryPreferred",
            ReadMode::Nearest => "nearest",
        }
    }
}

impl fmt::Display for ReadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pick the effective read preference for one operation.
///
/// The override wins entirely when present; there is no field-level merge.
pub fn resolve(
    operation_override: Option<&ReadPreference>,
    collection_default: Option<&ReadPreference>,
) -> ReadPreference {
    operation_override
        .or(collection_default)
        .cloned()
        .unwrap_or_default()
}
