//! In-memory [`EventStore`] backend.
//!
//! Everything lives behind one `std::sync::Mutex`. The lock is never held
//! across an `.await`: each operation copies what it needs out of the state
//! and delivers to the sink after releasing it.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::store::{deliver, EventSink, EventStore, IndexSink};
use crate::types::{
    current_time_ms, EventData, EventId, ExpectedSequence, GlobalSeq, IndexEntry, ProjectionSeq,
    ProjectionStreamId, ReadCount, RecordedEvent, StreamId, StreamSeq,
};

#[derive(Default)]
struct MemoryState {
    /// The log; `events[i]` has global sequence `i + 1`.
    events: Vec<RecordedEvent>,
    event_ids: HashSet<EventId>,
    /// Offsets into `events`, per stream, in stream order.
    streams: HashMap<StreamId, Vec<usize>>,
    /// `index[id][i]` is the global sequence of projection sequence `i + 1`.
    index: HashMap<ProjectionStreamId, Vec<GlobalSeq>>,
    indexed: HashMap<ProjectionStreamId, HashSet<GlobalSeq>>,
    checkpoints: HashMap<ProjectionStreamId, GlobalSeq>,
}

impl MemoryState {
    fn stream_len(&self, stream_id: &StreamId) -> StreamSeq {
        StreamSeq::from_raw(self.streams.get(stream_id).map_or(0, |v| v.len() as i32))
    }

    fn check_duplicates<'a>(&self, ids: impl Iterator<Item = &'a EventId>) -> Result<()> {
        let mut batch = HashSet::new();
        for id in ids {
            if self.event_ids.contains(id) || !batch.insert(*id) {
                return Err(Error::Duplicate {
                    what: format!("event {}", id),
                });
            }
        }
        Ok(())
    }

    /// Appends already-validated events. Assigns contiguous global sequences.
    fn push(&mut self, events: Vec<(StreamId, EventData)>) -> Vec<RecordedEvent> {
        let now_ms = current_time_ms();
        let mut recorded = Vec::with_capacity(events.len());
        for (stream_id, data) in events {
            let global_seq = GlobalSeq::from_raw(self.events.len() as i64 + 1);
            let stream_seq = self.stream_len(&stream_id).next();
            let event = RecordedEvent::from_data(data, stream_id.clone(), global_seq, stream_seq, now_ms);
            self.event_ids.insert(event.event_id);
            self.streams.entry(stream_id).or_default().push(self.events.len());
            self.events.push(event.clone());
            recorded.push(event);
        }
        recorded
    }
}

/// An [`EventStore`] that keeps everything in process memory.
///
/// # Example
///
/// ```rust
/// # tokio_test_block_on(async {
/// use eventide::store::{collect_events, EventStore, MemoryStore};
/// use eventide::types::{EventData, ExpectedSequence, GlobalSeq, ReadCount, StreamId};
///
/// let store = MemoryStore::new();
/// let stream = StreamId::new("cart-1");
/// store
///     .append(&stream, ExpectedSequence::None, vec![EventData::new("Added", b"{}".to_vec())])
///     .await
///     .unwrap();
/// let events = collect_events(&store, GlobalSeq::FIRST, ReadCount::Unlimited).await.unwrap();
/// assert_eq!(events.len(), 1);
/// # });
/// # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
/// # }
/// ```
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| Error::Storage("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn append(
        &self,
        stream_id: &StreamId,
        expected: ExpectedSequence,
        events: Vec<EventData>,
    ) -> Result<Vec<RecordedEvent>> {
        let mut state = self.lock()?;

        let actual = state.stream_len(stream_id);
        if !expected.matches(actual) {
            return Err(Error::UnexpectedSequence {
                stream_id: stream_id.to_string(),
                expected: expected.to_string(),
                actual: actual.as_raw() as i64,
            });
        }
        state.check_duplicates(events.iter().map(|e| &e.event_id))?;

        let events = events
            .into_iter()
            .map(|data| (stream_id.clone(), data))
            .collect();
        Ok(state.push(events))
    }

    async fn append_multi(&self, events: Vec<(StreamId, EventData)>) -> Result<Vec<RecordedEvent>> {
        let mut state = self.lock()?;
        state.check_duplicates(events.iter().map(|(_, e)| &e.event_id))?;
        Ok(state.push(events))
    }

    async fn read(
        &self,
        from: GlobalSeq,
        count: ReadCount,
        cancel: &CancellationToken,
        sink: EventSink<'_>,
    ) -> Result<usize> {
        let page: Vec<RecordedEvent> = {
            let state = self.lock()?;
            let start = (from.clamp_start().as_raw() - 1) as usize;
            state
                .events
                .iter()
                .skip(start)
                .take(count.as_limit())
                .cloned()
                .collect()
        };
        Ok(deliver(page, cancel, sink))
    }

    async fn read_stream(
        &self,
        stream_id: &StreamId,
        from: StreamSeq,
        count: ReadCount,
        cancel: &CancellationToken,
        sink: EventSink<'_>,
    ) -> Result<usize> {
        let page: Vec<RecordedEvent> = {
            let state = self.lock()?;
            let start = (from.clamp_start().as_raw() - 1) as usize;
            match state.streams.get(stream_id) {
                Some(offsets) => offsets
                    .iter()
                    .skip(start)
                    .take(count.as_limit())
                    .map(|&i| state.events[i].clone())
                    .collect(),
                None => Vec::new(),
            }
        };
        Ok(deliver(page, cancel, sink))
    }

    async fn read_highest_global_sequence(&self) -> Result<GlobalSeq> {
        Ok(GlobalSeq::from_raw(self.lock()?.events.len() as i64))
    }

    async fn read_highest_stream_sequence(&self, stream_id: &StreamId) -> Result<StreamSeq> {
        Ok(self.lock()?.stream_len(stream_id))
    }

    async fn write_projection_index(
        &self,
        projection_id: &ProjectionStreamId,
        expected: ProjectionSeq,
        global_seqs: &[GlobalSeq],
    ) -> Result<()> {
        let mut state = self.lock()?;

        let actual = state.index.get(projection_id).map_or(0, |v| v.len() as i64);
        if actual != expected.as_raw() {
            return Err(Error::UnexpectedSequence {
                stream_id: projection_id.to_string(),
                expected: expected.to_string(),
                actual,
            });
        }

        let existing = state.indexed.entry(projection_id.clone()).or_default();
        let mut batch = HashSet::new();
        for g in global_seqs {
            if existing.contains(g) || !batch.insert(*g) {
                return Err(Error::Duplicate {
                    what: format!("global sequence {} already indexed for {}", g, projection_id),
                });
            }
        }
        existing.extend(batch);
        state
            .index
            .entry(projection_id.clone())
            .or_default()
            .extend_from_slice(global_seqs);
        Ok(())
    }

    async fn read_projection_index(
        &self,
        projection_id: &ProjectionStreamId,
        from: ProjectionSeq,
        count: ReadCount,
        cancel: &CancellationToken,
        sink: IndexSink<'_>,
    ) -> Result<usize> {
        let page: Vec<IndexEntry> = {
            let state = self.lock()?;
            let start = (from.as_raw().max(1) - 1) as usize;
            match state.index.get(projection_id) {
                Some(entries) => entries
                    .iter()
                    .enumerate()
                    .skip(start)
                    .take(count.as_limit())
                    .map(|(i, g)| IndexEntry {
                        projection_seq: ProjectionSeq::from_raw(i as i64 + 1),
                        global_seq: *g,
                    })
                    .collect(),
                None => Vec::new(),
            }
        };
        Ok(deliver(page, cancel, sink))
    }

    async fn read_highest_projection_entry(
        &self,
        projection_id: &ProjectionStreamId,
    ) -> Result<Option<IndexEntry>> {
        let state = self.lock()?;
        Ok(state.index.get(projection_id).and_then(|entries| {
            entries.last().map(|g| IndexEntry {
                projection_seq: ProjectionSeq::from_raw(entries.len() as i64),
                global_seq: *g,
            })
        }))
    }

    async fn write_projection_checkpoint(
        &self,
        projection_id: &ProjectionStreamId,
        checkpoint: GlobalSeq,
    ) -> Result<()> {
        self.lock()?
            .checkpoints
            .insert(projection_id.clone(), checkpoint);
        Ok(())
    }

    async fn read_projection_checkpoint(
        &self,
        projection_id: &ProjectionStreamId,
    ) -> Result<GlobalSeq> {
        Ok(self
            .lock()?
            .checkpoints
            .get(projection_id)
            .copied()
            .unwrap_or(GlobalSeq::ZERO))
    }

    async fn clear_projection_index(&self, projection_id: &ProjectionStreamId) -> Result<()> {
        let mut state = self.lock()?;
        state.index.remove(projection_id);
        state.indexed.remove(projection_id);
        state.checkpoints.remove(projection_id);
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
