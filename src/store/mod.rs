//! # Storage Contract
//!
//! [`EventStore`] is the pluggable backend behind everything else: the
//! buffered writer appends through it, the dispatcher recovers gaps from it,
//! and projection streams keep their sparse index and checkpoint in it.
//!
//! Two backends ship with the crate:
//!
//! - [`MemoryStore`]: a mutex-guarded vector, for tests and embedding
//! - [`SqliteStore`]: a dedicated writer thread owning a `rusqlite` connection
//!
//! ## Reads and Cancellation
//!
//! Range reads push items into a caller-supplied sink instead of returning a
//! `Vec`, so replay loops never hold more than one page in memory. The
//! cancellation token is checked *between* delivered items: once it fires,
//! the sink is not called again for that read, but the item currently being
//! delivered always completes.
//!
//! ```text
//! read(from=6, count=3) over a 5-event log   → delivers nothing
//! read(from=5, count=3) over a 5-event log   → delivers 5
//! read(from=4, count=3) over a 5-event log   → delivers 4, 5
//! read(from=2, count=2)                      → delivers 2, 3
//! read(from=-2, count=2)                     → delivers 1, 2   (start clamped)
//! ```

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::types::{
    EventData, ExpectedSequence, GlobalSeq, IndexEntry, ProjectionSeq, ProjectionStreamId,
    ReadCount, RecordedEvent, StreamId, StreamSeq,
};

pub mod batch;
pub mod memory;
pub mod schema;
pub mod sqlite;

pub use memory::MemoryStore;
pub use schema::{SqlDialect, SqliteDialect, TableNames};
pub use sqlite::{SqliteConfig, SqliteStore};

/// Callback receiving events from a range read.
pub type EventSink<'a> = &'a mut (dyn FnMut(RecordedEvent) + Send);

/// Callback receiving projection index entries from a range read.
pub type IndexSink<'a> = &'a mut (dyn FnMut(IndexEntry) + Send);

// =============================================================================
// EventStore Trait
// =============================================================================

/// A storage backend for the event log and projection index.
///
/// All writes are atomic: either every event (or index entry) of a call is
/// committed, or none is.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Creates tables and indexes. Safe to call repeatedly.
    async fn initialize(&self) -> Result<()>;

    /// Appends events to one stream under an optimistic-concurrency check.
    ///
    /// Events receive contiguous global sequences.
    ///
    /// # Errors
    ///
    /// - `Error::UnexpectedSequence` if `expected` does not match the stream
    /// - `Error::Duplicate` if any event id already exists (or repeats in `events`)
    async fn append(
        &self,
        stream_id: &StreamId,
        expected: ExpectedSequence,
        events: Vec<EventData>,
    ) -> Result<Vec<RecordedEvent>>;

    /// Appends events spanning arbitrary streams with `Any` semantics per stream.
    ///
    /// Same atomicity and duplicate rules as [`EventStore::append`]. Results
    /// come back in input order.
    async fn append_multi(&self, events: Vec<(StreamId, EventData)>) -> Result<Vec<RecordedEvent>>;

    /// Reads the global log from `from` (clamped to 1). Returns how many
    /// events were delivered.
    async fn read(
        &self,
        from: GlobalSeq,
        count: ReadCount,
        cancel: &CancellationToken,
        sink: EventSink<'_>,
    ) -> Result<usize>;

    /// Reads one stream from `from` (clamped to 1).
    async fn read_stream(
        &self,
        stream_id: &StreamId,
        from: StreamSeq,
        count: ReadCount,
        cancel: &CancellationToken,
        sink: EventSink<'_>,
    ) -> Result<usize>;

    /// Highest assigned global sequence, or `GlobalSeq::ZERO` for an empty log.
    async fn read_highest_global_sequence(&self) -> Result<GlobalSeq>;

    /// Current event count of a stream, or `StreamSeq::NONE`.
    async fn read_highest_stream_sequence(&self, stream_id: &StreamId) -> Result<StreamSeq>;

    /// Appends index entries numbered `expected + 1, expected + 2, ...`.
    ///
    /// # Errors
    ///
    /// - `Error::UnexpectedSequence` if the stored highest projection sequence is not `expected`
    /// - `Error::Duplicate` if one of `global_seqs` is already indexed for this stream
    async fn write_projection_index(
        &self,
        projection_id: &ProjectionStreamId,
        expected: ProjectionSeq,
        global_seqs: &[GlobalSeq],
    ) -> Result<()>;

    /// Reads index entries from projection sequence `from` (clamped to 1).
    async fn read_projection_index(
        &self,
        projection_id: &ProjectionStreamId,
        from: ProjectionSeq,
        count: ReadCount,
        cancel: &CancellationToken,
        sink: IndexSink<'_>,
    ) -> Result<usize>;

    /// The last index entry of a projection stream, if any.
    async fn read_highest_projection_entry(
        &self,
        projection_id: &ProjectionStreamId,
    ) -> Result<Option<IndexEntry>>;

    /// Stores the checkpoint, replacing any previous value.
    async fn write_projection_checkpoint(
        &self,
        projection_id: &ProjectionStreamId,
        checkpoint: GlobalSeq,
    ) -> Result<()>;

    /// Reads the checkpoint; `GlobalSeq::ZERO` when none was written.
    async fn read_projection_checkpoint(&self, projection_id: &ProjectionStreamId)
        -> Result<GlobalSeq>;

    /// Deletes every index entry and the checkpoint of a projection stream.
    async fn clear_projection_index(&self, projection_id: &ProjectionStreamId) -> Result<()>;
}

// =============================================================================
// Helpers
// =============================================================================

/// Reads a global range into a `Vec`. Convenience for tests and small reads.
pub async fn collect_events(
    store: &dyn EventStore,
    from: GlobalSeq,
    count: ReadCount,
) -> Result<Vec<RecordedEvent>> {
    let mut events = Vec::new();
    let cancel = CancellationToken::new();
    store
        .read(from, count, &cancel, &mut |event| events.push(event))
        .await?;
    Ok(events)
}

/// Reads a stream range into a `Vec`.
pub async fn collect_stream(
    store: &dyn EventStore,
    stream_id: &StreamId,
    from: StreamSeq,
    count: ReadCount,
) -> Result<Vec<RecordedEvent>> {
    let mut events = Vec::new();
    let cancel = CancellationToken::new();
    store
        .read_stream(stream_id, from, count, &cancel, &mut |event| events.push(event))
        .await?;
    Ok(events)
}

/// Pushes items into a sink, stopping before the next item once `cancel` fires.
pub(crate) fn deliver<T>(
    items: impl IntoIterator<Item = T>,
    cancel: &CancellationToken,
    sink: &mut (dyn FnMut(T) + Send),
) -> usize {
    let mut delivered = 0;
    for item in items {
        if cancel.is_cancelled() {
            break;
        }
        sink(item);
        delivered += 1;
    }
    delivered
}
