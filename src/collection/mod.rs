//! Client, database and collection handles
//!
//! A [`Client`] owns the connection and the runtime plumbing that drives
//! operations. [`Database`] and [`Collection`] are lightweight values that
//! refer back to the client without keeping it alive: once every `Client`
//! clone is gone, operations on a leftover collection complete immediately
//! with `Connection(Closed)`.
//!
//! Collection operations validate their arguments synchronously. Invalid
//! input is returned as `Err(InvalidArgument)` and the callback is never
//! invoked. Otherwise the operation is submitted, a [`Query`] handle is
//! returned and the callback fires exactly once with the outcome.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use mongodb::bson::Document;
use tracing::info;
use uuid::Uuid;

use crate::command::{self, Namespace};
use crate::config::Config;
use crate::connection::{Connection, MongoConnection};
use crate::cursor::CursorContext;
use crate::error::{CollectionError, Result};
use crate::operation::{operation_comment, Completion, Dispatcher, Query};
use crate::read_preference::{self, ReadPreference};

mod read;
mod reply;
mod write;

pub use reply::{AggregateOutput, Upserted, WriteReply};

/// Entry point owning the connection
///
/// Cloning is cheap; all clones share one connection and one teardown.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    connection: Arc<dyn Connection>,
    config: Config,
    dispatcher: Dispatcher,
    shut_down: AtomicBool,
}

impl Client {
    /// Connect through the MongoDB driver using `config.connection`.
    ///
    /// Must be called inside a tokio runtime.
    pub async fn connect(config: Config) -> Result<Self> {
        config.validate()?;
        let connection = MongoConnection::connect(&config.connection).await?;
        Self::with_connection(Arc::new(connection), config)
    }

    /// Build a client over any [`Connection`] implementation.
    ///
    /// Captures the current tokio runtime; outside a runtime this fails with
    /// `Connection(NoRuntime)`.
    pub fn with_connection(connection: Arc<dyn Connection>, config: Config) -> Result<Self> {
        let dispatcher = Dispatcher::new()?;
        Ok(Self {
            inner: Arc::new(ClientInner {
                connection,
                config,
                dispatcher,
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    pub fn database(&self, name: &str) -> Result<Database> {
        command::validate_database_name(name)?;
        Ok(Database {
            name: name.to_string(),
            client: Arc::downgrade(&self.inner),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn connection(&self) -> Arc<dyn Connection> {
        self.inner.connection.clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.dispatcher.is_closed()
    }

    /// Tear the client down.
    ///
    /// In-flight operations complete with `Connection(Closed)`; this returns
    /// once every pending callback has fired. Later submissions fail the
    /// same way. Calling it again is a no-op.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.dispatcher.shutdown().await;
        self.inner.connection.shutdown().await;
        info!("Client shut down");
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl ClientInner {
    fn cursor_context(&self) -> CursorContext {
        CursorContext {
            connection: self.connection.clone(),
            runtime: self.dispatcher.runtime().clone(),
            teardown: self.dispatcher.cancel_token().clone(),
            tracker: self.dispatcher.tracker().clone(),
            batch_size: self.config.cursor.batch_size,
            max_batch_size: self.config.cursor.max_batch_size,
        }
    }

    /// Attach the operation comment when configured.
    fn tag_command(&self, mut command: Document, id: Uuid) -> Document {
        let operation = &self.config.operation;
        if operation.attach_comment && !command.contains_key("comment") {
            command.insert("comment", operation_comment(&operation.client_id, id));
        }
        command
    }
}

/// Named database of a client
#[derive(Clone)]
pub struct Database {
    name: String,
    client: Weak<ClientInner>,
}

impl Database {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The owning client, if it is still alive.
    pub fn client(&self) -> Option<Client> {
        self.client.upgrade().map(|inner| Client { inner })
    }

    /// Collection handle with the configured default read preference.
    pub fn collection(&self, name: &str) -> Result<Collection> {
        let namespace = Namespace::new(self.name.clone(), name)?;
        let read_preference = self
            .client
            .upgrade()
            .and_then(|inner| inner.config.read_preference.clone());
        Ok(Collection {
            database: self.clone(),
            namespace,
            read_preference,
        })
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database").field("name", &self.name).finish()
    }
}

/// Everything a submitted operation needs once it runs
pub(crate) struct Submission {
    pub connection: Arc<dyn Connection>,
    pub database: String,
    pub namespace: Namespace,
    pub command: Document,
    pub read_preference: ReadPreference,
    pub cursor: CursorContext,
}

impl Submission {
    /// Send the command and return the raw reply.
    pub async fn send(&self) -> Result<Document> {
        self.connection
            .submit_command(&self.database, self.command.clone(), &self.read_preference)
            .await
    }
}

/// Handle to one collection of a database
#[derive(Clone)]
pub struct Collection {
    database: Database,
    namespace: Namespace,
    read_preference: Option<ReadPreference>,
}

impl Collection {
    pub fn name(&self) -> &str {
        &self.namespace.collection
    }

    /// `<database>.<collection>`
    pub fn absolute_name(&self) -> String {
        self.namespace.to_string()
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn client(&self) -> Option<Client> {
        self.database.client()
    }

    /// Collection default read preference, if one is set.
    pub fn read_preference(&self) -> Option<&ReadPreference> {
        self.read_preference.as_ref()
    }

    pub fn set_read_preference(&mut self, read_preference: Option<ReadPreference>) {
        self.read_preference = read_preference;
    }

    pub fn with_read_preference(mut self, read_preference: ReadPreference) -> Self {
        self.read_preference = Some(read_preference);
        self
    }

    /// Read preference for a read with an optional per-call override.
    fn effective_read_preference(&self, requested: Option<&ReadPreference>) -> ReadPreference {
        read_preference::resolve(requested, self.read_preference.as_ref())
    }

    fn cursor_context(&self) -> Result<CursorContext> {
        let inner = self
            .database
            .client
            .upgrade()
            .ok_or_else(CollectionError::closed)?;
        if inner.dispatcher.is_closed() {
            return Err(CollectionError::closed());
        }
        Ok(inner.cursor_context())
    }

    /// Submit `command` against `database` and run `work` with it.
    ///
    /// # Arguments
    /// * `operation` - Name recorded on the query
    /// * `database` - Target database (`admin` for `renameCollection`)
    /// * `command` - Validated command document
    /// * `read_preference` - Effective routing for the command
    /// * `work` - Sends the command and interprets the reply
    /// * `callback` - Fired exactly once with the outcome
    fn run<T, W, Fut, C>(
        &self,
        operation: &'static str,
        database: &str,
        command: Document,
        read_preference: ReadPreference,
        work: W,
        callback: C,
    ) -> Query
    where
        T: Send + 'static,
        W: FnOnce(Submission) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        C: FnOnce(Result<T>, &Query) + Send + 'static,
    {
        let id = Uuid::new_v4();
        let client = self.database.client.upgrade();
        let command = match &client {
            Some(inner) => inner.tag_command(command, id),
            None => command,
        };
        let query = Query::new(
            id,
            operation,
            self.namespace.clone(),
            command.clone(),
            read_preference.clone(),
        );
        let completion = Completion::new(query.clone(), callback);

        let Some(inner) = client else {
            completion.fire(Err(CollectionError::closed()));
            return query;
        };
        let submission = Submission {
            connection: inner.connection.clone(),
            database: database.to_string(),
            namespace: self.namespace.clone(),
            command,
            read_preference,
            cursor: inner.cursor_context(),
        };
        inner.dispatcher.submit(completion, work(submission));
        query
    }
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("namespace", &self.absolute_name())
            .field("read_preference", &self.read_preference)
            .finish()
    }
}

#[cfg(test)]
mod tests;
