//! Read-side collection operations
//!
//! Reads honour the per-call read preference, then the collection default,
//! then `primary`.

use mongodb::bson::Document;
use tracing::debug;

use crate::command::{self, AggregateFlags, FindParams, MapReduceParams};
use crate::connection::CursorReply;
use crate::cursor::Cursor;
use crate::error::{CollectionError, Result};
use crate::operation::Query;
use crate::read_preference::ReadPreference;

use super::reply::{self, AggregateOutput};

impl super::Collection {
    /// Run an arbitrary command against this collection's database.
    ///
    /// # Arguments
    /// * `command` - Non-empty command document, first key is the command name
    /// * `read_preference` - Routing override for this call
    /// * `callback` - Receives the raw reply
    pub fn command_simple<C>(
        &self,
        command: Document,
        read_preference: Option<&ReadPreference>,
        callback: C,
    ) -> Result<Query>
    where
        C: FnOnce(Result<Document>, &Query) + Send + 'static,
    {
        if command.is_empty() {
            return Err(CollectionError::invalid_argument("command document is empty"));
        }
        let rp = self.effective_read_preference(read_preference);
        let database = self.namespace.database.clone();
        Ok(self.run(
            "command",
            &database,
            command,
            rp,
            |s| async move { s.send().await },
            callback,
        ))
    }

    /// Collection statistics (`collStats`).
    pub fn stats<C>(&self, callback: C) -> Result<Query>
    where
        C: FnOnce(Result<Document>, &Query) + Send + 'static,
    {
        let command = command::stats(&self.namespace)?;
        let rp = self.effective_read_preference(None);
        Ok(self.run(
            "stats",
            &self.namespace.database,
            command,
            rp,
            |s| async move { s.send().await },
            callback,
        ))
    }

    /// Lazy cursor over the documents matching `criteria`.
    ///
    /// No command is sent until the first [`Cursor::next`].
    pub fn cursor(
        &self,
        criteria: Document,
        fields: &[&str],
        skip: i64,
        limit: i64,
        sort: Document,
    ) -> Result<Cursor> {
        let params = FindParams::new(criteria)
            .fields(fields.iter().copied())
            .skip(skip)
            .limit(limit)
            .sort(sort);
        let command = command::find(&self.namespace, &params)?;
        let context = self.cursor_context()?;
        Ok(Cursor::lazy(
            context,
            self.namespace.clone(),
            command,
            self.effective_read_preference(None),
        ))
    }

    /// Fetch every matching document.
    pub fn find<C>(&self, params: FindParams, callback: C) -> Result<Query>
    where
        C: FnOnce(Result<Vec<Document>>, &Query) + Send + 'static,
    {
        let command = command::find(&self.namespace, &params)?;
        let rp = self.effective_read_preference(None);
        Ok(self.run(
            "find",
            &self.namespace.database,
            command,
            rp,
            |s| async move {
                let mut cursor = Cursor::lazy(s.cursor, s.namespace, s.command, s.read_preference);
                cursor.collect_all().await
            },
            callback,
        ))
    }

    /// Number of documents matching `criteria`.
    pub fn count<C>(
        &self,
        criteria: Document,
        read_preference: Option<&ReadPreference>,
        callback: C,
    ) -> Result<Query>
    where
        C: FnOnce(Result<i64>, &Query) + Send + 'static,
    {
        let command = command::count(&self.namespace, &criteria)?;
        let rp = self.effective_read_preference(read_preference);
        Ok(self.run(
            "count",
            &self.namespace.database,
            command,
            rp,
            |s| async move { reply::count(&s.send().await?) },
            callback,
        ))
    }

    /// Index descriptions (`listIndexes`), draining the listing cursor.
    pub fn index_list<C>(&self, callback: C) -> Result<Query>
    where
        C: FnOnce(Result<Vec<Document>>, &Query) + Send + 'static,
    {
        let command = command::list_indexes(&self.namespace)?;
        let rp = self.effective_read_preference(None);
        Ok(self.run(
            "indexList",
            &self.namespace.database,
            command,
            rp,
            |s| async move {
                let mut cursor = Cursor::lazy(s.cursor, s.namespace, s.command, s.read_preference);
                cursor.collect_all().await
            },
            callback,
        ))
    }

    /// Run an aggregation pipeline.
    ///
    /// The callback receives [`AggregateOutput::Cursor`] when the reply
    /// carries a cursor batch, and [`AggregateOutput::Reply`] otherwise
    /// (`explain`, or `flags.cursor == false` on servers that allow it).
    pub fn aggregate<C>(
        &self,
        pipeline: Vec<Document>,
        flags: AggregateFlags,
        options: Document,
        read_preference: Option<&ReadPreference>,
        callback: C,
    ) -> Result<Query>
    where
        C: FnOnce(Result<AggregateOutput>, &Query) + Send + 'static,
    {
        let command = command::aggregate(&self.namespace, &pipeline, &flags, &options)?;
        let rp = self.effective_read_preference(read_preference);
        Ok(self.run(
            "aggregate",
            &self.namespace.database,
            command,
            rp,
            move |s| async move {
                if flags.cursor && !flags.explain {
                    let mut cursor =
                        Cursor::lazy(s.cursor, s.namespace, s.command, s.read_preference);
                    if let Some(size) = flags.batch_size {
                        cursor.set_batch_size(size);
                    }
                    cursor.prime().await?;
                    return Ok(AggregateOutput::Cursor(cursor));
                }

                let reply = s.send().await?;
                if !CursorReply::is_cursor_reply(&reply) {
                    return Ok(AggregateOutput::Reply(reply));
                }
                let cursor = Cursor::from_reply(s.cursor, s.namespace, &reply, s.read_preference)?;
                Ok(AggregateOutput::Cursor(cursor))
            },
            callback,
        ))
    }

    /// Run a map-reduce job.
    ///
    /// Inline output follows the usual read routing; any other output target
    /// writes a collection and goes to the primary.
    pub fn map_reduce<C>(
        &self,
        params: MapReduceParams,
        read_preference: Option<&ReadPreference>,
        callback: C,
    ) -> Result<Query>
    where
        C: FnOnce(Result<Document>, &Query) + Send + 'static,
    {
        let command = command::map_reduce(&self.namespace, &params)?;
        let inline = params
            .output
            .as_ref()
            .is_none_or(|out| out.contains_key("inline"));
        let rp = if inline {
            self.effective_read_preference(read_preference)
        } else {
            debug!("mapReduce on '{}' writes output, routing to primary", self.namespace);
            ReadPreference::primary()
        };
        Ok(self.run(
            "mapReduce",
            &self.namespace.database,
            command,
            rp,
            |s| async move { s.send().await },
            callback,
        ))
    }
}
