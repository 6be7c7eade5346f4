//! Lazy cursors over server-side result sets
//!
//! A [`Cursor`] yields documents one at a time in server order and fetches
//! further batches on demand. At most one batch is buffered locally; the
//! batch size hint is clamped to `[1, max_batch_size]`.
//!
//! Find cursors are created without any I/O and open on the first
//! [`Cursor::next`]. Aggregate cursors are opened before they are handed
//! out, so the first batch is already buffered.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use futures::stream::{self, Stream};
use mongodb::bson::{self, Document};
use serde::de::DeserializeOwned;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::command::Namespace;
use crate::connection::{BatchHints, Connection, CursorHandle, CursorReply};
use crate::error::{CollectionError, Result};
use crate::read_preference::ReadPreference;

/// Client resources a cursor needs after it leaves the collection
#[derive(Clone)]
pub(crate) struct CursorContext {
    pub connection: Arc<dyn Connection>,
    pub runtime: Handle,
    pub teardown: CancellationToken,
    pub tracker: TaskTracker,
    pub batch_size: u32,
    pub max_batch_size: u32,
}

/// Server code for a cursor the server no longer knows
const CURSOR_NOT_FOUND: i32 = 43;

#[derive(Clone)]
enum CursorState {
    /// Command not sent yet
    Pending(Document),
    /// Server cursor still holds results
    Open(CursorHandle),
    Exhausted,
}

/// Forward-only iterator over query results
pub struct Cursor {
    context: CursorContext,
    namespace: Namespace,
    read_preference: ReadPreference,
    state: CursorState,
    buffer: VecDeque<Document>,
    batch_size: u32,
    returned: u64,
    teardown_reported: bool,
}

impl Cursor {
    /// Cursor that runs `command` on first use.
    pub(crate) fn lazy(
        context: CursorContext,
        namespace: Namespace,
        command: Document,
        read_preference: ReadPreference,
    ) -> Self {
        let batch_size = context.batch_size;
        let mut cursor = Self {
            context,
            namespace,
            read_preference,
            state: CursorState::Pending(command),
            buffer: VecDeque::new(),
            batch_size,
            returned: 0,
            teardown_reported: false,
        };
        cursor.set_batch_size(batch_size);
        cursor
    }

    /// Cursor continuing from a reply with a `cursor.firstBatch` section.
    pub(crate) fn from_reply(
        context: CursorContext,
        namespace: Namespace,
        reply: &Document,
        read_preference: ReadPreference,
    ) -> Result<Self> {
        let parsed = CursorReply::parse(reply, "firstBatch")?;
        let namespace = parsed.namespace.clone().unwrap_or(namespace);
        let state = if parsed.id == 0 {
            CursorState::Exhausted
        } else {
            CursorState::Open(CursorHandle::new(
                parsed.id,
                namespace.clone(),
                read_preference.clone(),
            ))
        };
        debug!(
            "Cursor {} on '{}' starts with {} documents",
            parsed.id,
            namespace,
            parsed.documents.len()
        );

        let batch_size = context.batch_size;
        let mut cursor = Self {
            context,
            namespace,
            read_preference,
            state,
            buffer: parsed.documents.into(),
            batch_size,
            returned: 0,
            teardown_reported: false,
        };
        cursor.set_batch_size(batch_size);
        Ok(cursor)
    }

    /// Builder form of [`Cursor::set_batch_size`].
    pub fn batch_size(mut self, size: u32) -> Self {
        self.set_batch_size(size);
        self
    }

    /// Set the batch size hint for the next fetch.
    ///
    /// The value is clamped to `[1, max_batch_size]`.
    pub fn set_batch_size(&mut self, size: u32) {
        let max = self.context.max_batch_size.max(1);
        self.batch_size = size.clamp(1, max);
    }

    pub fn current_batch_size(&self) -> u32 {
        self.batch_size
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn read_preference(&self) -> &ReadPreference {
        &self.read_preference
    }

    /// Server cursor id while the server still holds results.
    pub fn cursor_id(&self) -> Option<i64> {
        match &self.state {
            CursorState::Open(handle) => Some(handle.id()),
            _ => None,
        }
    }

    /// Number of documents handed out so far.
    pub fn documents_returned(&self) -> u64 {
        self.returned
    }

    /// Documents buffered locally and not yet returned.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// True once no further document can be returned.
    pub fn is_exhausted(&self) -> bool {
        matches!(self.state, CursorState::Exhausted) && self.buffer.is_empty()
    }

    /// Next document, fetching a new batch when the buffer runs dry.
    ///
    /// # Returns
    /// * `Ok(Some(doc))` - Next document in server order
    /// * `Ok(None)` - The cursor is exhausted
    /// * `Err(...)` - The fetch failed; the cursor is exhausted afterwards
    ///   and later calls return `Ok(None)`
    pub async fn next(&mut self) -> Result<Option<Document>> {
        if self.context.teardown.is_cancelled() {
            if self.is_exhausted() {
                return Ok(None);
            }
            return self.report_teardown();
        }

        loop {
            if let Some(document) = self.buffer.pop_front() {
                self.returned += 1;
                return Ok(Some(document));
            }

            // The state only changes once a round trip has finished, so a
            // dropped `next()` future leaves the cursor resumable.
            let fetched = match self.state.clone() {
                CursorState::Exhausted => {
                    return Ok(None);
                }
                CursorState::Pending(command) => self.open(command).await,
                CursorState::Open(handle) => self.fetch(&handle).await.map(|more| {
                    if more {
                        CursorState::Open(handle)
                    } else {
                        CursorState::Exhausted
                    }
                }),
            };
            match fetched {
                Ok(next) => self.state = next,
                Err(e) => return self.fetch_failed(e),
            }
        }
    }

    /// Open a pending cursor without consuming a document.
    pub(crate) async fn prime(&mut self) -> Result<()> {
        if let CursorState::Pending(command) = self.state.clone() {
            match self.open(command).await {
                Ok(next) => self.state = next,
                Err(e) => return self.fetch_failed(e).map(|_| ()),
            }
        }
        Ok(())
    }

    /// Next document decoded into `T`.
    pub async fn next_as<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        match self.next().await? {
            Some(document) => Ok(Some(bson::from_document(document)?)),
            None => Ok(None),
        }
    }

    /// Drain the remaining documents.
    pub async fn collect_all(&mut self) -> Result<Vec<Document>> {
        let mut documents = Vec::new();
        while let Some(document) = self.next().await? {
            documents.push(document);
        }
        Ok(documents)
    }

    /// Adapt the cursor into a `Stream` of documents.
    pub fn into_stream(self) -> impl Stream<Item = Result<Document>> + Send {
        stream::unfold(self, |mut cursor| async move {
            match cursor.next().await {
                Ok(Some(document)) => Some((Ok(document), cursor)),
                Ok(None) => None,
                Err(e) => Some((Err(e), cursor)),
            }
        })
    }

    /// Release the server cursor. Closing twice is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        self.buffer.clear();
        let CursorState::Open(handle) = self.state.clone() else {
            self.state = CursorState::Exhausted;
            return Ok(());
        };
        if self.context.teardown.is_cancelled() {
            self.state = CursorState::Exhausted;
            return Ok(());
        }

        let result = self.context.connection.close_cursor(&handle).await;
        self.state = CursorState::Exhausted;
        match &result {
            Ok(()) => info!(
                "Closed cursor {} on '{}' after {} documents",
                handle.id(),
                self.namespace,
                self.returned
            ),
            Err(e) => warn!("Failed to close cursor {}: {}", handle.id(), e),
        }
        result
    }

    async fn open(&mut self, command: Document) -> Result<CursorState> {
        let hints = self.hints();
        let open = self.context.connection.open_cursor(
            &self.namespace,
            command,
            hints,
            &self.read_preference,
        );
        let (handle, batch) = tokio::select! {
            opened = open => opened?,
            _ = self.context.teardown.cancelled() => return Err(CollectionError::closed()),
        };
        self.buffer.extend(batch.documents);
        if batch.more_available {
            Ok(CursorState::Open(handle))
        } else {
            Ok(CursorState::Exhausted)
        }
    }

    /// Fetch the next batch; returns whether the server has more.
    async fn fetch(&mut self, handle: &CursorHandle) -> Result<bool> {
        let hints = self.hints();
        let fetch = self.context.connection.fetch_more(handle, hints);
        let batch = tokio::select! {
            fetched = fetch => fetched?,
            _ = self.context.teardown.cancelled() => return Err(CollectionError::closed()),
        };
        debug!(
            "Fetched batch of {} documents from cursor {} (total: {})",
            batch.documents.len(),
            handle.id(),
            self.returned + batch.documents.len() as u64
        );
        self.buffer.extend(batch.documents);
        Ok(batch.more_available)
    }

    fn hints(&self) -> BatchHints {
        BatchHints {
            batch_size: self.batch_size,
        }
    }

    /// Give up on the cursor after a failed round trip.
    ///
    /// An open server cursor is released unless the failure means it is
    /// already gone.
    fn fetch_failed(&mut self, error: CollectionError) -> Result<Option<Document>> {
        let state = std::mem::replace(&mut self.state, CursorState::Exhausted);
        self.buffer.clear();
        if error.is_closed() {
            self.teardown_reported = true;
        } else if let CursorState::Open(handle) = state
            && error.code() != Some(CURSOR_NOT_FOUND)
        {
            self.release(handle);
        }
        debug!("Cursor on '{}' failed: {}", self.namespace, error);
        Err(error)
    }

    /// Kill `handle` in the background on the client's tracker.
    fn release(&self, handle: CursorHandle) {
        if self.context.teardown.is_cancelled() {
            return;
        }
        let connection = self.context.connection.clone();
        self.context.tracker.spawn_on(
            async move {
                if let Err(e) = connection.close_cursor(&handle).await {
                    warn!("Failed to release cursor {}: {}", handle.id(), e);
                }
            },
            &self.context.runtime,
        );
    }

    fn report_teardown(&mut self) -> Result<Option<Document>> {
        self.state = CursorState::Exhausted;
        self.buffer.clear();
        if self.teardown_reported {
            return Ok(None);
        }
        self.teardown_reported = true;
        Err(CollectionError::closed())
    }
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("namespace", &self.namespace.to_string())
            .field("cursor_id", &self.cursor_id())
            .field("buffered", &self.buffer.len())
            .field("returned", &self.returned)
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        let state = std::mem::replace(&mut self.state, CursorState::Exhausted);
        if let CursorState::Open(handle) = state {
            debug!("Cursor {} dropped while open, releasing", handle.id());
            self.release(handle);
        }
    }
}

#[cfg(test)]
mod tests;
