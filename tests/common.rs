#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use eventide::store::{EventSink, IndexSink};
use eventide::{
    Error, EventData, EventLog, EventLogConfig, EventStore, ExpectedSequence, GlobalSeq, IndexEntry,
    ProjectionSeq, ProjectionStreamId, ReadCount, RecordedEvent, Result, SqliteConfig, SqliteStore,
    StreamId, StreamSeq, WriterConfig,
};
use tokio_util::sync::CancellationToken;

pub fn create_temp_db_file(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    (dir, path)
}

pub fn open_sqlite_store(path: &Path) -> Arc<SqliteStore> {
    Arc::new(SqliteStore::open(path, SqliteConfig::default()).expect("open sqlite store"))
}

pub async fn open_sqlite_log(path: &Path) -> EventLog {
    EventLog::open_with_config(path, SqliteConfig::default(), fast_config())
        .await
        .expect("open event log")
}

/// Short flush delays so tests don't wait on timers.
pub fn fast_config() -> EventLogConfig {
    let mut config = EventLogConfig::default();
    config.projection.index_flush_delay = Duration::from_millis(5);
    config.projection.checkpoint_flush_delay = Duration::from_millis(5);
    config.dispatcher.recovery_delay = Duration::from_millis(20);
    config
}

pub fn writer_config_with_flush_delay(flush_delay: Duration) -> WriterConfig {
    WriterConfig {
        flush_delay,
        ..WriterConfig::default()
    }
}

pub fn event(kind: &str) -> EventData {
    EventData::new(kind, b"{}".to_vec())
}

/// Appends one event per kind to `stream`, one store call each.
pub async fn append_kinds(store: &dyn EventStore, stream: &StreamId, kinds: &[&str]) -> Vec<RecordedEvent> {
    let mut recorded = Vec::new();
    for kind in kinds {
        recorded.extend(
            store
                .append(stream, ExpectedSequence::Any, vec![event(kind)])
                .await
                .expect("append"),
        );
    }
    recorded
}

pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}

// =============================================================================
// Store Wrappers
// =============================================================================

/// Delegates to another store and records every global `read` as `(from, count)`.
pub struct RecordingStore {
    inner: Arc<dyn EventStore>,
    reads: Mutex<Vec<(i64, usize)>>,
}

impl RecordingStore {
    pub fn new(inner: Arc<dyn EventStore>) -> Self {
        Self {
            inner,
            reads: Mutex::new(Vec::new()),
        }
    }

    pub fn reads(&self) -> Vec<(i64, usize)> {
        self.reads.lock().unwrap().clone()
    }
}

/// Delegates to another store, failing `append_multi` for any batch that
/// contains an event of type `poison`.
pub struct FaultyStore {
    inner: Arc<dyn EventStore>,
    poison: String,
}

impl FaultyStore {
    pub fn new(inner: Arc<dyn EventStore>, poison: &str) -> Self {
        Self {
            inner,
            poison: poison.to_string(),
        }
    }
}

/// Forwards every `EventStore` method except the ones listed to `self.inner`.
macro_rules! delegate_store {
    ($ty:ty, { $($own:item)* }) => {
        #[async_trait]
        impl EventStore for $ty {
            $($own)*

            async fn initialize(&self) -> Result<()> {
                self.inner.initialize().await
            }

            async fn append(
                &self,
                stream_id: &StreamId,
                expected: ExpectedSequence,
                events: Vec<EventData>,
            ) -> Result<Vec<RecordedEvent>> {
                self.inner.append(stream_id, expected, events).await
            }

            async fn read_stream(
                &self,
                stream_id: &StreamId,
                from: StreamSeq,
                count: ReadCount,
                cancel: &CancellationToken,
                sink: EventSink<'_>,
            ) -> Result<usize> {
                self.inner.read_stream(stream_id, from, count, cancel, sink).await
            }

            async fn read_highest_global_sequence(&self) -> Result<GlobalSeq> {
                self.inner.read_highest_global_sequence().await
            }

            async fn read_highest_stream_sequence(&self, stream_id: &StreamId) -> Result<StreamSeq> {
                self.inner.read_highest_stream_sequence(stream_id).await
            }

            async fn write_projection_index(
                &self,
                projection_id: &ProjectionStreamId,
                expected: ProjectionSeq,
                global_seqs: &[GlobalSeq],
            ) -> Result<()> {
                self.inner.write_projection_index(projection_id, expected, global_seqs).await
            }

            async fn read_projection_index(
                &self,
                projection_id: &ProjectionStreamId,
                from: ProjectionSeq,
                count: ReadCount,
                cancel: &CancellationToken,
                sink: IndexSink<'_>,
            ) -> Result<usize> {
                self.inner.read_projection_index(projection_id, from, count, cancel, sink).await
            }

            async fn read_highest_projection_entry(
                &self,
                projection_id: &ProjectionStreamId,
            ) -> Result<Option<IndexEntry>> {
                self.inner.read_highest_projection_entry(projection_id).await
            }

            async fn write_projection_checkpoint(
                &self,
                projection_id: &ProjectionStreamId,
                checkpoint: GlobalSeq,
            ) -> Result<()> {
                self.inner.write_projection_checkpoint(projection_id, checkpoint).await
            }

            async fn read_projection_checkpoint(
                &self,
                projection_id: &ProjectionStreamId,
            ) -> Result<GlobalSeq> {
                self.inner.read_projection_checkpoint(projection_id).await
            }

            async fn clear_projection_index(&self, projection_id: &ProjectionStreamId) -> Result<()> {
                self.inner.clear_projection_index(projection_id).await
            }
        }
    };
}

delegate_store!(RecordingStore, {
    async fn append_multi(&self, events: Vec<(StreamId, EventData)>) -> Result<Vec<RecordedEvent>> {
        self.inner.append_multi(events).await
    }

    async fn read(
        &self,
        from: GlobalSeq,
        count: ReadCount,
        cancel: &CancellationToken,
        sink: EventSink<'_>,
    ) -> Result<usize> {
        self.reads.lock().unwrap().push((from.as_raw(), count.as_limit()));
        self.inner.read(from, count, cancel, sink).await
    }
});

delegate_store!(FaultyStore, {
    async fn append_multi(&self, events: Vec<(StreamId, EventData)>) -> Result<Vec<RecordedEvent>> {
        if events.iter().any(|(_, e)| e.event_type == self.poison) {
            return Err(Error::Storage(format!("injected failure for {}", self.poison)));
        }
        self.inner.append_multi(events).await
    }

    async fn read(
        &self,
        from: GlobalSeq,
        count: ReadCount,
        cancel: &CancellationToken,
        sink: EventSink<'_>,
    ) -> Result<usize> {
        self.inner.read(from, count, cancel, sink).await
    }
});
