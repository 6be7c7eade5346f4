//! Driver-backed connection
//!
//! Plain commands go through `Database::run_command` with the resolved read
//! preference as selection criteria. Cursor-producing commands go through
//! `Database::run_cursor_command`, and the resulting driver cursor is kept
//! in a registry keyed by a local id. Batches are pulled from that cursor, so
//! the driver keeps every `getMore` on the server and session that opened
//! it and kills the server cursor when it is dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use mongodb::bson::{Bson, Document};
use mongodb::options::{
    ClientOptions, ReadPreference as DriverReadPreference, ReadPreferenceOptions,
    SelectionCriteria,
};
use mongodb::{Client, Cursor};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::command::Namespace;
use crate::config::ConnectionConfig;
use crate::error::Result;
use crate::read_preference::{ReadMode, ReadPreference};

use super::{Batch, BatchHints, Connection, CursorHandle};

/// Driver cursor plus documents pulled from it but not yet handed out
struct DriverCursor {
    cursor: Cursor<Document>,
    pending: Vec<Document>,
}

type SharedCursor = Arc<AsyncMutex<DriverCursor>>;

/// Connection backed by the official MongoDB driver
#[derive(Clone)]
pub struct MongoConnection {
    client: Client,
    cursors: Arc<Mutex<HashMap<i64, SharedCursor>>>,
    next_cursor_id: Arc<AtomicI64>,
}

impl MongoConnection {
    /// Parse the configured URI and build a driver client.
    ///
    /// The driver connects lazily, so this does not touch the network.
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let mut options = ClientOptions::parse(&config.uri).await?;
        options.app_name = Some(config.app_name.clone());
        options.max_pool_size = Some(config.max_pool_size);
        options.min_pool_size = Some(config.min_pool_size);
        options.connect_timeout = Some(Duration::from_secs(config.timeout));
        options.server_selection_timeout = Some(Duration::from_secs(config.timeout));

        let client = Client::with_options(options)?;
        info!("Created MongoDB client for '{}'", redact_uri(&config.uri));
        Ok(Self::from_client(client))
    }

    /// Wrap an existing driver client.
    pub fn from_client(client: Client) -> Self {
        Self {
            client,
            cursors: Arc::new(Mutex::new(HashMap::new())),
            next_cursor_id: Arc::new(AtomicI64::new(1)),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Number of driver cursors still registered.
    pub fn open_cursors(&self) -> usize {
        self.registry().len()
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<i64, SharedCursor>> {
        self.cursors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lookup(&self, id: i64) -> Option<SharedCursor> {
        self.registry().get(&id).cloned()
    }

    fn forget(&self, id: i64) -> bool {
        self.registry().remove(&id).is_some()
    }
}

#[async_trait]
impl Connection for MongoConnection {
    async fn submit_command(
        &self,
        database: &str,
        command: Document,
        read_preference: &ReadPreference,
    ) -> Result<Document> {
        debug!("Running command on '{}': {:?}", database, command.keys().next());
        let reply = self
            .client
            .database(database)
            .run_command(command)
            .selection_criteria(selection_criteria(read_preference))
            .await?;
        Ok(reply)
    }

    async fn open_cursor(
        &self,
        namespace: &Namespace,
        mut command: Document,
        hints: BatchHints,
        read_preference: &ReadPreference,
    ) -> Result<(CursorHandle, Batch)> {
        super::set_batch_size(&mut command, hints.batch_size);
        let cursor = self
            .client
            .database(&namespace.database)
            .run_cursor_command(command)
            .selection_criteria(selection_criteria(read_preference))
            .batch_size(hints.batch_size)
            .await?;

        let mut cursor = DriverCursor {
            cursor,
            pending: Vec::new(),
        };
        let batch = cursor.next_batch(hints.batch_size).await?;
        let id = self.next_cursor_id.fetch_add(1, Ordering::Relaxed);
        if batch.more_available {
            self.registry().insert(id, Arc::new(AsyncMutex::new(cursor)));
        }
        debug!(
            "Opened driver cursor {} on '{}' with {} documents",
            id,
            namespace,
            batch.documents.len()
        );

        let id = if batch.more_available { id } else { 0 };
        Ok((
            CursorHandle::new(id, namespace.clone(), read_preference.clone()),
            batch,
        ))
    }

    async fn fetch_more(&self, handle: &CursorHandle, hints: BatchHints) -> Result<Batch> {
        let Some(cursor) = self.lookup(handle.id()) else {
            // Cursors continued from a raw reply were not opened here.
            return super::get_more(self, handle, hints).await;
        };

        let batch = cursor.lock().await.next_batch(hints.batch_size).await;
        match &batch {
            Ok(batch) if batch.more_available => {}
            _ => {
                self.forget(handle.id());
            }
        }
        batch
    }

    async fn close_cursor(&self, handle: &CursorHandle) -> Result<()> {
        if self.forget(handle.id()) {
            debug!("Released driver cursor {}", handle.id());
            return Ok(());
        }
        super::kill_cursor(self, handle).await
    }

    async fn shutdown(&self) {
        self.registry().clear();
        self.client.clone().shutdown().await;
    }
}

impl DriverCursor {
    /// Pull up to `batch_size` documents.
    ///
    /// Documents accumulate in `pending` until the batch is complete, so an
    /// abandoned call loses nothing.
    async fn next_batch(&mut self, batch_size: u32) -> Result<Batch> {
        let wanted = batch_size.max(1) as usize;
        let mut exhausted = false;
        while self.pending.len() < wanted {
            if !self.cursor.advance().await? {
                exhausted = true;
                break;
            }
            self.pending.push(self.cursor.deserialize_current()?);
        }
        Ok(Batch {
            documents: std::mem::take(&mut self.pending),
            more_available: !exhausted,
        })
    }
}

/// Convert a read preference into the driver's selection criteria.
pub(crate) fn selection_criteria(read_preference: &ReadPreference) -> SelectionCriteria {
    let options = if read_preference.tags.is_empty() {
        None
    } else {
        let tag_sets = read_preference
            .tags
            .iter()
            .map(|tags| {
                tags.iter()
                    .map(|(key, value)| {
                        let value = match value {
                            Bson::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        (key.clone(), value)
                    })
                    .collect::<HashMap<String, String>>()
            })
            .collect::<Vec<_>>();
        Some(ReadPreferenceOptions::builder().tag_sets(tag_sets).build())
    };

    let driver = match read_preference.mode {
        ReadMode::Primary => {
            if options.is_some() {
                warn!("Ignoring tag sets on a primary read preference");
            }
            DriverReadPreference::Primary
        }
        ReadMode::PrimaryPreferred => DriverReadPreference::PrimaryPreferred { options },
        ReadMode::Secondary => DriverReadPreference::Secondary { options },
        ReadMode::SecondaryPreferred => DriverReadPreference::SecondaryPreferred { options },
        ReadMode::Nearest => DriverReadPreference::Nearest { options },
    };
    SelectionCriteria::ReadPreference(driver)
}

/// Strip credentials from a URI before it is logged.
fn redact_uri(uri: &str) -> String {
    match (uri.find("://"), uri.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***@{}", &uri[..scheme_end], &uri[at + 1..])
        }
        _ => uri.to_string(),
    }
}
