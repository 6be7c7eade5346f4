//! Connection boundary
//!
//! Everything below this trait (wire protocol, sockets, pooling, server
//! selection) belongs to a lower-level driver. The collection layer needs only
//! four capabilities from it:
//! - submit one command and receive the decoded reply
//! - open a server cursor
//! - fetch the next batch of an open cursor
//! - release a cursor
//!
//! Only `submit_command` must be implemented; the cursor methods are provided
//! in terms of the `find`/`getMore`/`killCursors` commands. Implementations
//! that track cursors themselves (the driver-backed one does) override them.
//!
//! Two implementations ship with the crate: [`MongoConnection`] on top of the
//! official driver and [`MemoryConnection`], an in-process server.

use async_trait::async_trait;
use mongodb::bson::{Bson, Document};
use tracing::debug;

use crate::command::{self, Namespace};
use crate::error::{CollectionError, Result};
use crate::read_preference::ReadPreference;

mod memory;
mod mongo;

pub use memory::MemoryConnection;
pub use mongo::MongoConnection;

/// Fetch sizing negotiated with the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchHints {
    pub batch_size: u32,
}

impl Default for BatchHints {
    fn default() -> Self {
        Self { batch_size: 101 }
    }
}

/// Opaque handle to a server-side cursor
#[derive(Debug, Clone, PartialEq)]
pub struct CursorHandle {
    id: i64,
    namespace: Namespace,
    read_preference: ReadPreference,
}

impl CursorHandle {
    pub(crate) fn new(id: i64, namespace: Namespace, read_preference: ReadPreference) -> Self {
        Self {
            id,
            namespace,
            read_preference,
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn read_preference(&self) -> &ReadPreference {
        &self.read_preference
    }
}

/// One batch of documents in server order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub documents: Vec<Document>,
    pub more_available: bool,
}

/// A decoded `cursor` reply section: `{ id, ns, firstBatch | nextBatch }`
#[derive(Debug, Clone, PartialEq)]
pub struct CursorReply {
    pub id: i64,
    pub namespace: Option<Namespace>,
    pub documents: Vec<Document>,
}

impl CursorReply {
    /// True when the reply carries a cursor section at all.
    pub fn is_cursor_reply(reply: &Document) -> bool {
        matches!(reply.get("cursor"), Some(Bson::Document(cursor)) if cursor.contains_key("id"))
    }

    /// Decode the `cursor` section of a reply.
    ///
    /// `batch_field` is `firstBatch` for the opening command and `nextBatch`
    /// for `getMore`.
    pub fn parse(reply: &Document, batch_field: &str) -> Result<Self> {
        let cursor = reply
            .get_document("cursor")
            .map_err(|_| CollectionError::decode("reply has no cursor document"))?;

        let id = match cursor.get("id") {
            Some(Bson::Int64(id)) => *id,
            Some(Bson::Int32(id)) => i64::from(*id),
            _ => return Err(CollectionError::decode("cursor id is missing or not an integer")),
        };

        let namespace = match cursor.get("ns") {
            Some(Bson::String(ns)) => Namespace::parse(ns).ok(),
            _ => None,
        };

        let batch = cursor.get_array(batch_field).map_err(|_| {
            CollectionError::decode(format!("cursor reply has no '{batch_field}' array"))
        })?;

        let documents = batch
            .iter()
            .map(|item| match item {
                Bson::Document(document) => Ok(document.clone()),
                other => Err(CollectionError::decode(format!(
                    "cursor batch element is not a document: {other}"
                ))),
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            id,
            namespace,
            documents,
        })
    }

    pub fn into_batch(self) -> Batch {
        Batch {
            more_available: self.id != 0,
            documents: self.documents,
        }
    }
}

/// The lower-level driver as seen by the collection layer
#[async_trait]
pub trait Connection: Send + Sync {
    /// Run one command against `database` and return the decoded reply.
    ///
    /// Server-side command failures (`ok: 0`) are returned as
    /// `CollectionError::Command`.
    async fn submit_command(
        &self,
        database: &str,
        command: Document,
        read_preference: &ReadPreference,
    ) -> Result<Document>;

    /// Run a cursor-producing command and return its handle and first batch.
    async fn open_cursor(
        &self,
        namespace: &Namespace,
        mut command: Document,
        hints: BatchHints,
        read_preference: &ReadPreference,
    ) -> Result<(CursorHandle, Batch)> {
        set_batch_size(&mut command, hints.batch_size);
        let reply = self
            .submit_command(&namespace.database, command, read_preference)
            .await?;
        let parsed = CursorReply::parse(&reply, "firstBatch")?;
        let handle = CursorHandle::new(
            parsed.id,
            parsed.namespace.clone().unwrap_or_else(|| namespace.clone()),
            read_preference.clone(),
        );
        debug!(
            "Opened cursor {} on '{}' with {} documents",
            handle.id,
            handle.namespace,
            parsed.documents.len()
        );
        Ok((handle, parsed.into_batch()))
    }

    /// Fetch the next batch of an open cursor.
    async fn fetch_more(&self, handle: &CursorHandle, hints: BatchHints) -> Result<Batch> {
        get_more(self, handle, hints).await
    }

    /// Release a server cursor. Closing an exhausted cursor is a no-op.
    async fn close_cursor(&self, handle: &CursorHandle) -> Result<()> {
        kill_cursor(self, handle).await
    }

    /// Release driver resources on client teardown.
    async fn shutdown(&self) {}
}

/// Put the batch size hint where the command expects it: inside the
/// `cursor` option when there is one, top level otherwise.
pub(crate) fn set_batch_size(command: &mut Document, batch_size: u32) {
    let batch_size = i64::from(batch_size);
    match command.get_mut("cursor") {
        Some(Bson::Document(cursor)) => {
            cursor.insert("batchSize", batch_size);
        }
        _ => {
            command.insert("batchSize", batch_size);
        }
    }
}

/// `getMore` sent through [`Connection::submit_command`].
pub(crate) async fn get_more<C>(
    connection: &C,
    handle: &CursorHandle,
    hints: BatchHints,
) -> Result<Batch>
where
    C: Connection + ?Sized,
{
    let command = command::get_more(&handle.namespace, handle.id, hints.batch_size)?;
    let reply = connection
        .submit_command(&handle.namespace.database, command, &handle.read_preference)
        .await?;
    Ok(CursorReply::parse(&reply, "nextBatch")?.into_batch())
}

/// `killCursors` sent through [`Connection::submit_command`].
pub(crate) async fn kill_cursor<C>(connection: &C, handle: &CursorHandle) -> Result<()>
where
    C: Connection + ?Sized,
{
    if handle.id == 0 {
        return Ok(());
    }
    let command = command::kill_cursors(&handle.namespace, &[handle.id])?;
    connection
        .submit_command(&handle.namespace.database, command, &handle.read_preference)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::doc;

    #[test]
    fn test_parse_first_batch() {
        let reply = doc! {
            "cursor": {
                "id": 77_i64,
                "ns": "shop.orders",
                "firstBatch": [ { "_id": 1 }, { "_id": 2 } ],
            },
            "ok": 1.0,
        };
        assert!(CursorReply::is_cursor_reply(&reply));

        let parsed = CursorReply::parse(&reply, "firstBatch").unwrap();
        assert_eq!(parsed.id, 77);
        assert_eq!(parsed.namespace, Some(Namespace::new("shop", "orders").unwrap()));

        let batch = parsed.into_batch();
        assert!(batch.more_available);
        assert_eq!(batch.documents, vec![doc! { "_id": 1 }, doc! { "_id": 2 }]);
    }

    #[test]
    fn test_parse_exhausted_cursor() {
        let reply = doc! { "cursor": { "id": 0, "nextBatch": [] }, "ok": 1 };
        let batch = CursorReply::parse(&reply, "nextBatch").unwrap().into_batch();
        assert!(!batch.more_available);
        assert!(batch.documents.is_empty());
    }

    #[test]
    fn test_parse_rejects_malformed_replies() {
        let no_cursor = doc! { "result": [], "ok": 1 };
        assert!(!CursorReply::is_cursor_reply(&no_cursor));
        assert!(matches!(
            CursorReply::parse(&no_cursor, "firstBatch"),
            Err(CollectionError::Decode(_))
        ));

        let wrong_field = doc! { "cursor": { "id": 0_i64, "nextBatch": [] } };
        assert!(CursorReply::parse(&wrong_field, "firstBatch").is_err());

        let scalar_item = doc! { "cursor": { "id": 0_i64, "firstBatch": [1] } };
        assert!(matches!(
            CursorReply::parse(&scalar_item, "firstBatch"),
            Err(CollectionError::Decode(_))
        ));
    }
}
