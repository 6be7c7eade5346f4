//! Asynchronous operations
//!
//! Every collection operation is represented by a [`Query`]: a shared handle
//! that names the operation, carries the command it sent and tracks its
//! lifecycle:
//!
//! ```text
//! Created ──► Submitted ──► Completed
//!    │             │
//!    └─────────────┴──────► Failed
//! ```
//!
//! The completion callback lives in a one-shot slot owned by the submitted
//! task. It fires exactly once: with the command's result, with
//! `Connection(Closed)` when the client is torn down first, or with
//! `Connection(Closed)` when the task itself is dropped by a runtime that is
//! shutting down.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use mongodb::bson::Document;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::command::Namespace;
use crate::error::{CollectionError, ConnectionError, Result};
use crate::read_preference::ReadPreference;

/// Lifecycle state of a [`Query`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryStatus {
    Created,
    Submitted,
    Completed,
    Failed,
}

impl QueryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, QueryStatus::Completed | QueryStatus::Failed)
    }

    fn can_become(&self, next: QueryStatus) -> bool {
        matches!(
            (self, next),
            (QueryStatus::Created, QueryStatus::Submitted)
                | (QueryStatus::Created, QueryStatus::Failed)
                | (QueryStatus::Submitted, QueryStatus::Completed)
                | (QueryStatus::Submitted, QueryStatus::Failed)
        )
    }
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QueryStatus::Created => "created",
            QueryStatus::Submitted => "submitted",
            QueryStatus::Completed => "completed",
            QueryStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Handle to one in-flight or finished operation
///
/// Cloning is cheap; all clones observe the same state.
#[derive(Clone)]
pub struct Query {
    inner: Arc<QueryInner>,
}

struct QueryInner {
    id: Uuid,
    operation: &'static str,
    namespace: Namespace,
    command: Document,
    read_preference: ReadPreference,
    created_at: Instant,
    state: Mutex<QueryState>,
    done: watch::Sender<bool>,
}

struct QueryState {
    status: QueryStatus,
    completed_at: Option<Instant>,
    failure: Option<CollectionError>,
}

impl Query {
    pub(crate) fn new(
        id: Uuid,
        operation: &'static str,
        namespace: Namespace,
        command: Document,
        read_preference: ReadPreference,
    ) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            inner: Arc::new(QueryInner {
                id,
                operation,
                namespace,
                command,
                read_preference,
                created_at: Instant::now(),
                state: Mutex::new(QueryState {
                    status: QueryStatus::Created,
                    completed_at: None,
                    failure: None,
                }),
                done,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Operation name, e.g. `"find"` or `"createIndex"`.
    pub fn operation(&self) -> &'static str {
        self.inner.operation
    }

    pub fn namespace(&self) -> &Namespace {
        &self.inner.namespace
    }

    /// The command document exactly as it was submitted.
    pub fn command(&self) -> &Document {
        &self.inner.command
    }

    /// Read preference the command was routed with.
    pub fn read_preference(&self) -> &ReadPreference {
        &self.inner.read_preference
    }

    pub fn status(&self) -> QueryStatus {
        self.state().status
    }

    pub fn is_done(&self) -> bool {
        self.status().is_terminal()
    }

    /// Failure description once the query has failed.
    pub fn failure(&self) -> Option<CollectionError> {
        self.state().failure.clone()
    }

    pub fn created_at(&self) -> Instant {
        self.inner.created_at
    }

    pub fn completed_at(&self) -> Option<Instant> {
        self.state().completed_at
    }

    /// Time from creation to completion, or until now while running.
    pub fn elapsed(&self) -> Duration {
        let end = self.completed_at().unwrap_or_else(Instant::now);
        end.duration_since(self.inner.created_at)
    }

    /// Wait until the query reached a terminal state and its callback ran.
    ///
    /// Waiting observes the query; it never consumes the result.
    pub async fn wait(&self) -> QueryStatus {
        let mut done = self.inner.done.subscribe();
        // The sender lives in `self`, so the channel cannot close while waiting.
        let _ = done.wait_for(|finished| *finished).await;
        self.status()
    }

    fn state(&self) -> MutexGuard<'_, QueryState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, next: QueryStatus, failure: Option<CollectionError>) -> bool {
        let mut state = self.state();
        if !state.status.can_become(next) {
            warn!(
                "Ignoring illegal transition {} -> {} for {} {}",
                state.status, next, self.inner.operation, self.inner.id
            );
            return false;
        }
        state.status = next;
        if next.is_terminal() {
            state.completed_at = Some(Instant::now());
            state.failure = failure;
        }
        true
    }

    pub(crate) fn mark_submitted(&self) -> bool {
        self.transition(QueryStatus::Submitted, None)
    }

    fn finish<T>(&self, result: &Result<T>) {
        let applied = match result {
            Ok(_) => self.transition(QueryStatus::Completed, None),
            Err(e) => self.transition(QueryStatus::Failed, Some(e.clone())),
        };
        if !applied {
            return;
        }
        match result {
            Ok(_) => debug!(
                "{} {} on '{}' completed in {:?}",
                self.inner.operation,
                self.inner.id,
                self.inner.namespace,
                self.elapsed()
            ),
            Err(e) => debug!(
                "{} {} on '{}' failed after {:?}: {}",
                self.inner.operation,
                self.inner.id,
                self.inner.namespace,
                self.elapsed(),
                e
            ),
        }
    }

    fn notify_done(&self) {
        self.inner.done.send_replace(true);
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("id", &self.inner.id)
            .field("operation", &self.inner.operation)
            .field("namespace", &self.inner.namespace.to_string())
            .field("status", &self.status())
            .finish()
    }
}

/// Comment attached to commands so operations can be found in `$currentOp`.
///
/// Format: `mongo-collection-<client_id>-<uuid>`
pub fn operation_comment(client_id: &str, id: Uuid) -> String {
    format!("mongo-collection-{client_id}-{id}")
}

type Callback<T> = Box<dyn FnOnce(Result<T>, &Query) + Send + 'static>;

/// One-shot completion slot
///
/// Dropping an unfired slot fires it with `Connection(Closed)`.
pub(crate) struct Completion<T> {
    query: Query,
    callback: Option<Callback<T>>,
}

impl<T> Completion<T> {
    pub(crate) fn new<C>(query: Query, callback: C) -> Self
    where
        C: FnOnce(Result<T>, &Query) + Send + 'static,
    {
        Self {
            query,
            callback: Some(Box::new(callback)),
        }
    }

    pub(crate) fn query(&self) -> &Query {
        &self.query
    }

    /// Record the outcome, run the callback, then wake waiters.
    pub(crate) fn fire(mut self, result: Result<T>) {
        self.complete(result);
    }

    fn complete(&mut self, result: Result<T>) {
        let Some(callback) = self.callback.take() else {
            return;
        };
        self.query.finish(&result);
        let _done = WakeWaiters(&self.query);
        callback(result, &self.query);
    }
}

/// Wakes `Query::wait` callers when dropped, also while a panicking
/// callback unwinds.
struct WakeWaiters<'a>(&'a Query);

impl Drop for WakeWaiters<'_> {
    fn drop(&mut self) {
        self.0.notify_done();
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        if self.callback.is_some() {
            debug!(
                "{} {} dropped before completion",
                self.query.operation(),
                self.query.id()
            );
            self.complete(Err(CollectionError::closed()));
        }
    }
}

/// Runs operations on the client's runtime and tracks them for teardown
pub(crate) struct Dispatcher {
    runtime: Handle,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Dispatcher {
    /// Capture the current tokio runtime.
    pub(crate) fn new() -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| ConnectionError::NoRuntime)?;
        Ok(Self {
            runtime,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.runtime
    }

    /// Token cancelled on teardown.
    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Submit `work` and fire `completion` with its result.
    ///
    /// The work races against teardown; whichever finishes first decides
    /// the result.
    pub(crate) fn submit<T, F>(&self, completion: Completion<T>, work: F)
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        if self.is_closed() {
            completion.fire(Err(CollectionError::closed()));
            return;
        }

        let query = completion.query().clone();
        if !query.mark_submitted() {
            completion.fire(Err(CollectionError::invalid_argument(
                "query was already submitted",
            )));
            return;
        }
        debug!(
            "Submitting {} {} on '{}'",
            query.operation(),
            query.id(),
            query.namespace()
        );

        let cancel = self.cancel.clone();
        self.tracker.spawn_on(
            async move {
                let result = tokio::select! {
                    result = work => result,
                    _ = cancel.cancelled() => Err(CollectionError::closed()),
                };
                completion.fire(result);
            },
            &self.runtime,
        );
    }

    /// Cancel in-flight work and wait until every callback has fired.
    pub(crate) async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
