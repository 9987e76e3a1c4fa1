//! # Async API for Eventide
//!
//! [`EventLog`] wires the pieces together: one store, one buffered writer,
//! one dispatcher and a registry of projection streams.
//!
//! ```text
//!                 append / write                      subscribe_all / subscribe_live
//!  callers ──────────────┬──────────────────────┐     ▲
//!                        ▼                      │     │
//!              ┌──────────────────┐             │  ┌──┴───────────┐
//!              │  BufferedWriter  │─notify──────┼─►│  Dispatcher  │──► ProjectionStream(s)
//!              └────────┬─────────┘             │  └──────────────┘          │
//!                       ▼                       ▼                            ▼
//!              ┌────────────────────────────────────────────────────────────────┐
//!              │                     EventStore (SQLite / memory)               │
//!              └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Direct appends ([`EventLog::append`]) carry an expected stream sequence and
//! go straight to the store. Buffered writes ([`EventLog::write`]) are
//! group-committed. Either way the persisted events are handed to the
//! dispatcher, which publishes them in global order.
//!
//! ## Example
//!
//! ```rust,no_run
//! use eventide::{EventData, EventLog, ExpectedSequence, GlobalSeq, StreamId};
//!
//! #[tokio::main]
//! async fn main() -> eventide::Result<()> {
//!     let log = EventLog::open("events.db").await?;
//!
//!     let stream = StreamId::new("order-42");
//!     log.append(&stream, ExpectedSequence::None, vec![EventData::new("OrderPlaced", b"{}".to_vec())])
//!         .await?;
//!
//!     let mut all = log.subscribe_all(GlobalSeq::FIRST).await?;
//!     while let Some(event) = all.next().await {
//!         println!("{}", event?.global_seq);
//!     }
//!
//!     log.shutdown().await
//! }
//! ```

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::config::EventLogConfig;
use crate::dispatcher::{spawn_dispatcher, DispatcherHandle};
use crate::error::Result;
use crate::projection::{ProjectionRegistry, ProjectionStreamHandle, ProjectionStreamQuery};
use crate::store::{collect_events, collect_stream, EventStore, MemoryStore, SqliteConfig, SqliteStore};
use crate::subscription::{
    CatchUpSubscription, DispatcherSubscription, ProjectionSubscription, DEFAULT_CATCHUP_BATCH_SIZE,
};
use crate::types::{
    EventData, ExpectedSequence, GlobalSeq, ProjectionSeq, ReadCount, RecordedEvent, StreamId,
    StreamSeq,
};
use crate::writer::{spawn_buffered_writer, WriterHandle};

struct Inner {
    store: Arc<dyn EventStore>,
    writer: WriterHandle,
    dispatcher: DispatcherHandle,
    projections: ProjectionRegistry,
}

/// The main async handle.
///
/// `EventLog` is `Clone`; all clones share the same actors and store.
#[derive(Clone)]
pub struct EventLog {
    inner: Arc<Inner>,
}

impl EventLog {
    /// Opens or creates a SQLite-backed log with default settings.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(path, SqliteConfig::default(), EventLogConfig::default()).await
    }

    /// Opens or creates a SQLite-backed log.
    pub async fn open_with_config(
        path: impl AsRef<Path>,
        sqlite: SqliteConfig,
        config: EventLogConfig,
    ) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening event log");
        let store = SqliteStore::open(path, sqlite)?;
        Self::with_store(Arc::new(store), config).await
    }

    /// Creates a log over a fresh [`MemoryStore`].
    pub async fn open_in_memory() -> Result<Self> {
        Self::with_store(Arc::new(MemoryStore::new()), EventLogConfig::default()).await
    }

    /// Creates a log over any store. The store is initialized first.
    pub async fn with_store(store: Arc<dyn EventStore>, config: EventLogConfig) -> Result<Self> {
        store.initialize().await?;

        let dispatcher = spawn_dispatcher(store.clone(), config.dispatcher.clone());
        let writer = spawn_buffered_writer(store.clone(), Some(dispatcher.clone()), config.writer.clone());
        let projections = ProjectionRegistry::new(store.clone(), dispatcher.clone(), config.projection);

        Ok(Self {
            inner: Arc::new(Inner {
                store,
                writer,
                dispatcher,
                projections,
            }),
        })
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.inner.store
    }

    /// The dispatcher handle.
    pub fn dispatcher(&self) -> &DispatcherHandle {
        &self.inner.dispatcher
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Appends to one stream with an optimistic concurrency check.
    ///
    /// # Errors
    ///
    /// - `Error::UnexpectedSequence` if the stream is not at `expected`
    /// - `Error::Duplicate` if an event id already exists
    pub async fn append(
        &self,
        stream_id: &StreamId,
        expected: ExpectedSequence,
        events: Vec<EventData>,
    ) -> Result<Vec<RecordedEvent>> {
        let recorded = self.inner.store.append(stream_id, expected, events).await?;
        self.inner.dispatcher.notify(recorded.clone()).await?;
        Ok(recorded)
    }

    /// Writes through the buffered writer (group commit, no concurrency check).
    pub async fn write(&self, events: Vec<(StreamId, EventData)>) -> Result<Vec<RecordedEvent>> {
        self.inner.writer.write(events).await
    }

    /// Writes events of one stream through the buffered writer.
    pub async fn write_stream(&self, stream_id: &StreamId, events: Vec<EventData>) -> Result<Vec<RecordedEvent>> {
        self.inner.writer.write_stream(stream_id, events).await
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Reads from the global log, starting at `from` (inclusive).
    pub async fn read(&self, from: GlobalSeq, count: ReadCount) -> Result<Vec<RecordedEvent>> {
        collect_events(self.inner.store.as_ref(), from, count).await
    }

    /// Reads one stream, starting at `from` (inclusive).
    pub async fn read_stream(
        &self,
        stream_id: &StreamId,
        from: StreamSeq,
        count: ReadCount,
    ) -> Result<Vec<RecordedEvent>> {
        collect_stream(self.inner.store.as_ref(), stream_id, from, count).await
    }

    /// Current event count of a stream.
    pub async fn stream_sequence(&self, stream_id: &StreamId) -> Result<StreamSeq> {
        self.inner.store.read_highest_stream_sequence(stream_id).await
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Events published from now on.
    pub async fn subscribe_live(&self) -> Result<DispatcherSubscription> {
        self.inner.dispatcher.subscribe().await
    }

    /// Every event from `from` on: history from the store, then live.
    pub async fn subscribe_all(&self, from: GlobalSeq) -> Result<CatchUpSubscription> {
        let live = self.inner.dispatcher.subscribe().await?;
        Ok(CatchUpSubscription::new(
            self.inner.store.clone(),
            from,
            live,
            DEFAULT_CATCHUP_BATCH_SIZE,
        ))
    }

    /// Every event of one stream from global position `from` on.
    pub async fn subscribe_stream(&self, stream_id: StreamId, from: GlobalSeq) -> Result<CatchUpSubscription> {
        Ok(self.subscribe_all(from).await?.with_filter(stream_id))
    }

    // =========================================================================
    // Projections
    // =========================================================================

    /// The projection stream for `query`, started on first use.
    pub fn projection(&self, query: ProjectionStreamQuery) -> Result<ProjectionStreamHandle> {
        self.inner.projections.get_or_spawn(query)
    }

    /// Subscribes to the projection stream for `query` from after `last_known`.
    pub async fn subscribe_projection(
        &self,
        query: ProjectionStreamQuery,
        last_known: ProjectionSeq,
    ) -> Result<ProjectionSubscription> {
        self.projection(query)?.subscribe(last_known).await
    }

    /// The projection registry.
    pub fn projections(&self) -> &ProjectionRegistry {
        &self.inner.projections
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Stops projections, flushes the writer, then stops the dispatcher.
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.projections.shutdown().await?;
        self.inner.writer.shutdown().await?;
        self.inner.dispatcher.shutdown().await?;
        info!("event log shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::projection::Predicate;
    use crate::subscription::ProjectionMessage;

    #[tokio::test]
    async fn test_append_read_subscribe() {
        let log = EventLog::open_in_memory().await.unwrap();
        let stream = StreamId::new("cart-1");

        log.append(&stream, ExpectedSequence::None, vec![EventData::new("Added", Vec::new())])
            .await
            .unwrap();
        log.write_stream(&stream, vec![EventData::new("Removed", Vec::new())])
            .await
            .unwrap();

        let events = log.read(GlobalSeq::FIRST, ReadCount::Unlimited).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(log.stream_sequence(&stream).await.unwrap(), StreamSeq::from_raw(2));

        let mut all = log.subscribe_all(GlobalSeq::FIRST).await.unwrap();
        assert_eq!(all.next().await.unwrap().unwrap().global_seq.as_raw(), 1);
        assert_eq!(all.next().await.unwrap().unwrap().global_seq.as_raw(), 2);

        log.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_conflict_does_not_notify() {
        let log = EventLog::open_in_memory().await.unwrap();
        let stream = StreamId::new("s");
        log.append(&stream, ExpectedSequence::None, vec![EventData::new("A", Vec::new())])
            .await
            .unwrap();

        let err = log
            .append(&stream, ExpectedSequence::None, vec![EventData::new("B", Vec::new())])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnexpectedSequence { actual: 1, .. }));

        log.dispatcher().wait_for(GlobalSeq::FIRST).await.unwrap();
        assert_eq!(log.dispatcher().position(), GlobalSeq::FIRST);
        assert_eq!(log.read(GlobalSeq::FIRST, ReadCount::Unlimited).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_projection_via_facade() {
        let log = EventLog::open_in_memory().await.unwrap();
        let stream = StreamId::new("s");
        log.write_stream(&stream, vec![EventData::new("A", Vec::new()), EventData::new("B", Vec::new())])
            .await
            .unwrap();

        let query = ProjectionStreamQuery::new([Predicate::event_type("B")]).unwrap();
        let mut sub = log.subscribe_projection(query, ProjectionSeq::NONE).await.unwrap();

        let mut received = Vec::new();
        while let Some(message) = sub.next().await {
            match message {
                ProjectionMessage::Event { projection_seq, event } => {
                    received.push((projection_seq.as_raw(), event.global_seq.as_raw()))
                }
                ProjectionMessage::ReplayFinished { .. } | ProjectionMessage::CaughtUp { .. } => break,
                ProjectionMessage::Unsubscribed => panic!("unexpected unsubscribe"),
            }
        }
        assert_eq!(received, vec![(1, 2)]);
        log.shutdown().await.unwrap();
    }
}
