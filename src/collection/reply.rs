//! Typed views of command replies

use std::fmt;

use mongodb::bson::{Bson, Document};

use crate::cursor::Cursor;
use crate::error::{CollectionError, Result};

/// Outcome of an insert, update, save or remove
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteReply {
    /// Documents inserted, matched or deleted
    pub n: i64,

    /// Documents actually changed by an update
    pub n_modified: i64,

    /// Documents created by upserts
    pub upserted: Vec<Upserted>,

    /// `_id` values of inserted documents, in input order
    pub inserted_ids: Vec<Bson>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Upserted {
    /// Position of the update statement that upserted
    pub index: i64,
    pub id: Bson,
}

impl WriteReply {
    /// Decode a write command reply.
    ///
    /// A non-empty `writeErrors` or a `writeConcernError` becomes a
    /// `Command` error carrying the first error's code and message.
    pub(crate) fn parse(reply: &Document) -> Result<Self> {
        check_write_errors(reply)?;

        let mut upserted = Vec::new();
        if let Ok(entries) = reply.get_array("upserted") {
            for entry in entries {
                let Bson::Document(entry) = entry else {
                    return Err(CollectionError::decode("upserted entry is not a document"));
                };
                upserted.push(Upserted {
                    index: integer(entry, "index").unwrap_or(0),
                    id: entry.get("_id").cloned().unwrap_or(Bson::Null),
                });
            }
        }

        Ok(Self {
            n: integer(reply, "n").unwrap_or(0),
            n_modified: integer(reply, "nModified").unwrap_or(0),
            upserted,
            inserted_ids: Vec::new(),
        })
    }
}

/// Result of `aggregate`
pub enum AggregateOutput {
    /// The reply carried a cursor batch
    Cursor(Cursor),
    /// Plain reply, e.g. for `explain` or cursor-less pipelines
    Reply(Document),
}

impl AggregateOutput {
    pub fn into_cursor(self) -> Option<Cursor> {
        match self {
            AggregateOutput::Cursor(cursor) => Some(cursor),
            AggregateOutput::Reply(_) => None,
        }
    }

    pub fn into_reply(self) -> Option<Document> {
        match self {
            AggregateOutput::Reply(reply) => Some(reply),
            AggregateOutput::Cursor(_) => None,
        }
    }
}

impl fmt::Debug for AggregateOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggregateOutput::Cursor(cursor) => f.debug_tuple("Cursor").field(cursor).finish(),
            AggregateOutput::Reply(reply) => f.debug_tuple("Reply").field(reply).finish(),
        }
    }
}

pub(crate) fn check_write_errors(reply: &Document) -> Result<()> {
    if let Ok(errors) = reply.get_array("writeErrors") {
        if let Some(Bson::Document(first)) = errors.first() {
            return Err(error_from(first));
        }
    }
    if let Ok(concern) = reply.get_document("writeConcernError") {
        return Err(error_from(concern));
    }
    Ok(())
}

/// `n` of a `count` reply.
pub(crate) fn count(reply: &Document) -> Result<i64> {
    integer(reply, "n").ok_or_else(|| CollectionError::decode("count reply has no numeric 'n'"))
}

fn error_from(entry: &Document) -> CollectionError {
    let code = integer(entry, "code")
        .and_then(|code| i32::try_from(code).ok())
        .unwrap_or(0);
    let message = entry.get_str("errmsg").unwrap_or("write failed");
    CollectionError::command(code, message)
}

fn integer(document: &Document, field: &str) -> Option<i64> {
    match document.get(field)? {
        Bson::Int32(v) => Some(i64::from(*v)),
        Bson::Int64(v) => Some(*v),
        Bson::Double(v) if v.fract() == 0.0 => Some(*v as i64),
        _ => None,
    }
}
