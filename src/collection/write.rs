//! Write-side collection operations
//!
//! Writes and catalog changes always route to the primary.

use mongodb::bson::{doc, oid::ObjectId, Bson, Document};

use crate::command::{self, IndexSpec, UpdateParams};
use crate::error::Result;
use crate::operation::Query;
use crate::read_preference::ReadPreference;

use super::reply::WriteReply;

impl super::Collection {
    /// Rename this collection to `<new_database>.<new_collection>`.
    ///
    /// Issued against `admin`; fails on the server when the target exists.
    pub fn rename<C>(&self, new_database: &str, new_collection: &str, callback: C) -> Result<Query>
    where
        C: FnOnce(Result<()>, &Query) + Send + 'static,
    {
        self.rename_with(new_database, new_collection, false, callback)
    }

    /// Rename, optionally dropping an existing target collection first.
    pub fn rename_with<C>(
        &self,
        new_database: &str,
        new_collection: &str,
        drop_target: bool,
        callback: C,
    ) -> Result<Query>
    where
        C: FnOnce(Result<()>, &Query) + Send + 'static,
    {
        let command = command::rename(&self.namespace, new_database, new_collection, drop_target)?;
        Ok(self.run(
            "rename",
            "admin",
            command,
            ReadPreference::primary(),
            |s| async move { s.send().await.map(|_| ()) },
            callback,
        ))
    }

    /// Insert `documents` in order.
    ///
    /// Documents without an `_id` get a fresh `ObjectId` as their first
    /// field; the ids are reported in [`WriteReply::inserted_ids`].
    pub fn insert<C>(&self, documents: Vec<Document>, callback: C) -> Result<Query>
    where
        C: FnOnce(Result<WriteReply>, &Query) + Send + 'static,
    {
        let documents: Vec<Document> = documents.into_iter().map(with_id).collect();
        let ids: Vec<Bson> = documents
            .iter()
            .map(|d| d.get("_id").cloned().unwrap_or(Bson::Null))
            .collect();
        let command = command::insert(&self.namespace, &documents)?;
        Ok(self.run(
            "insert",
            &self.namespace.database,
            command,
            ReadPreference::primary(),
            |s| async move {
                let mut reply = WriteReply::parse(&s.send().await?)?;
                let inserted = usize::try_from(reply.n).unwrap_or(0).min(ids.len());
                reply.inserted_ids = ids[..inserted].to_vec();
                Ok(reply)
            },
            callback,
        ))
    }

    /// Update documents matching `params.criteria`.
    pub fn update<C>(&self, params: UpdateParams, callback: C) -> Result<Query>
    where
        C: FnOnce(Result<WriteReply>, &Query) + Send + 'static,
    {
        let command = command::update(&self.namespace, &params)?;
        self.submit_write("update", command, callback)
    }

    /// Replace the document with the same `_id`, or insert it.
    ///
    /// A document without `_id` is inserted with a generated one.
    pub fn save<C>(&self, document: Document, callback: C) -> Result<Query>
    where
        C: FnOnce(Result<WriteReply>, &Query) + Send + 'static,
    {
        let Some(id) = document.get("_id").cloned() else {
            return self.insert(vec![document], callback);
        };
        let params = UpdateParams::new(doc! { "_id": id }, document).upsert(true);
        let command = command::update(&self.namespace, &params)?;
        self.submit_write("save", command, callback)
    }

    /// Delete every document matching `criteria`.
    pub fn remove<C>(&self, criteria: Document, callback: C) -> Result<Query>
    where
        C: FnOnce(Result<WriteReply>, &Query) + Send + 'static,
    {
        let command = command::delete(&self.namespace, &criteria)?;
        self.submit_write("remove", command, callback)
    }

    /// Drop the collection and its indexes.
    pub fn drop<C>(&self, callback: C) -> Result<Query>
    where
        C: FnOnce(Result<()>, &Query) + Send + 'static,
    {
        let command = command::drop(&self.namespace)?;
        self.submit_catalog("drop", command, callback)
    }

    /// Build an index.
    ///
    /// With an empty name the conventional generated name is used, e.g.
    /// `email_1_created_-1`.
    pub fn create_index<C>(&self, spec: IndexSpec, callback: C) -> Result<Query>
    where
        C: FnOnce(Result<()>, &Query) + Send + 'static,
    {
        let command = command::create_index(&self.namespace, &spec)?;
        self.submit_catalog("createIndex", command, callback)
    }

    pub fn drop_index<C>(&self, name: &str, callback: C) -> Result<Query>
    where
        C: FnOnce(Result<()>, &Query) + Send + 'static,
    {
        let command = command::drop_index(&self.namespace, name)?;
        self.submit_catalog("dropIndex", command, callback)
    }

    fn submit_write<C>(&self, operation: &'static str, command: Document, callback: C) -> Result<Query>
    where
        C: FnOnce(Result<WriteReply>, &Query) + Send + 'static,
    {
        Ok(self.run(
            operation,
            &self.namespace.database,
            command,
            ReadPreference::primary(),
            |s| async move { WriteReply::parse(&s.send().await?) },
            callback,
        ))
    }

    fn submit_catalog<C>(&self, operation: &'static str, command: Document, callback: C) -> Result<Query>
    where
        C: FnOnce(Result<()>, &Query) + Send + 'static,
    {
        Ok(self.run(
            operation,
            &self.namespace.database,
            command,
            ReadPreference::primary(),
            |s| async move {
                let reply = s.send().await?;
                super::reply::check_write_errors(&reply)?;
                Ok(())
            },
            callback,
        ))
    }
}

/// Give `document` a leading `ObjectId` `_id` unless it has one.
fn with_id(document: Document) -> Document {
    if document.contains_key("_id") {
        return document;
    }
    let mut assigned = doc! { "_id": ObjectId::new() };
    assigned.extend(document);
    assigned
}
