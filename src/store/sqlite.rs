//! # SQLite Backend
//!
//! [`SqliteStore`] implements [`EventStore`] on top of `rusqlite`.
//!
//! ## Architecture
//!
//! ```text
//!   async callers (writer, dispatcher, projections, ...)
//!         │  job: Box<dyn FnOnce(&mut Worker)>      ▲ oneshot reply
//!         ▼                                         │
//!   ┌──────────────────────────────────────────────────────┐
//!   │  "eventide-sqlite" thread                            │
//!   │  owns the Connection, runs one job at a time         │
//!   └──────────────────────────────────────────────────────┘
//!                          │
//!                          ▼
//!                   SQLite (WAL mode)
//! ```
//!
//! `rusqlite::Connection` is blocking and not `Sync`, so a single OS thread
//! owns it and executes closures sent over a channel. Every write runs in an
//! immediate transaction on that thread: the concurrency check, the global
//! sequence assignment (`MAX(global_seq) + 1`) and the insert commit together
//! or not at all.
//!
//! Range reads are fetched one page at a time on the worker and handed to the
//! sink on the async side, so the cancellation token is checked between every
//! delivered event without holding the connection.

use std::collections::HashMap;
use std::path::Path;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use async_trait::async_trait;
use rusqlite::types::{Type, ValueRef};
use rusqlite::{Connection, OptionalExtension, ToSql, Transaction, TransactionBehavior};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::store::batch::split_batches;
use crate::store::schema::{
    self, classify, multi_row_insert, SqliteDialect, Statements, TableNames,
    EVENT_COLUMNS, INDEX_COLUMNS,
};
use crate::store::{deliver, EventSink, EventStore, IndexSink};
use crate::types::{
    current_time_ms, EventData, EventId, ExpectedSequence, GlobalSeq, IndexEntry, ProjectionSeq,
    ProjectionStreamId, ReadCount, RecordedEvent, StreamId, StreamSeq,
};

// =============================================================================
// Configuration
// =============================================================================

/// Default row limit for one multi-row insert statement.
pub const DEFAULT_MAX_BATCH_ITEMS: usize = 500;

/// Default soft byte limit for one multi-row insert statement.
pub const DEFAULT_MAX_BATCH_BYTES: usize = 4 * 1024 * 1024;

/// Default page size for range reads.
pub const DEFAULT_READ_PAGE_SIZE: usize = 512;

/// Configuration for [`SqliteStore`].
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Table names.
    pub tables: TableNames,

    /// Maximum rows per insert statement.
    pub max_batch_items: usize,

    /// Soft byte limit per insert statement. A single larger row still goes
    /// through, alone in its own statement.
    pub max_batch_bytes: usize,

    /// Rows fetched per round-trip to the worker during range reads.
    pub read_page_size: usize,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            tables: TableNames::default(),
            max_batch_items: DEFAULT_MAX_BATCH_ITEMS,
            max_batch_bytes: DEFAULT_MAX_BATCH_BYTES,
            read_page_size: DEFAULT_READ_PAGE_SIZE,
        }
    }
}

// =============================================================================
// Worker
// =============================================================================

type Job = Box<dyn FnOnce(&mut Worker) + Send>;

/// State owned by the worker thread.
struct Worker {
    conn: Connection,
    statements: Statements,
    dialect: SqliteDialect,
    config: SqliteConfig,
}

fn run_worker(mut worker: Worker, jobs: mpsc::Receiver<Job>) {
    while let Ok(job) = jobs.recv() {
        job(&mut worker);
    }
    debug!("sqlite worker stopped");
}

// =============================================================================
// SqliteStore
// =============================================================================

/// An [`EventStore`] backed by a SQLite database file.
///
/// Dropping the store closes the job channel and waits for the worker thread,
/// so the database file is released when `drop` returns.
pub struct SqliteStore {
    jobs: Option<mpsc::Sender<Job>>,
    thread_handle: Option<JoinHandle<()>>,
    read_page_size: usize,
}

impl SqliteStore {
    /// Opens (creating if necessary) a database file and initializes the schema.
    ///
    /// # Errors
    ///
    /// - `Error::Sqlite` if the file can't be opened
    /// - `Error::Schema` if it was created by an incompatible version
    pub fn open(path: impl AsRef<Path>, config: SqliteConfig) -> Result<Self> {
        Self::spawn(Connection::open(path)?, config)
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory(config: SqliteConfig) -> Result<Self> {
        Self::spawn(Connection::open_in_memory()?, config)
    }

    fn spawn(conn: Connection, config: SqliteConfig) -> Result<Self> {
        let dialect = SqliteDialect;
        let statements = Statements::render(&config.tables, &dialect);
        schema::initialize(&conn, &statements)?;

        let read_page_size = config.read_page_size.max(1);
        let worker = Worker {
            conn,
            statements,
            dialect,
            config,
        };

        let (jobs_tx, jobs_rx) = mpsc::channel();
        let thread_handle = thread::Builder::new()
            .name("eventide-sqlite".to_string())
            .spawn(move || run_worker(worker, jobs_rx))
            .map_err(|e| Error::Storage(format!("failed to spawn sqlite worker: {e}")))?;

        Ok(Self {
            jobs: Some(jobs_tx),
            thread_handle: Some(thread_handle),
            read_page_size,
        })
    }

    /// Runs `f` on the worker thread and awaits its result.
    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Worker) -> Result<T> + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job = Box::new(move |worker| {
            let _ = reply_tx.send(f(worker));
        });

        self.jobs
            .as_ref()
            .ok_or(Error::Closed("sqlite worker"))?
            .send(job)
            .map_err(|_| Error::Closed("sqlite worker"))?;

        reply_rx.await.map_err(|_| Error::Closed("sqlite worker"))?
    }
}

impl Drop for SqliteStore {
    fn drop(&mut self) {
        self.jobs.take();
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                warn!("sqlite worker thread panicked");
            }
        }
    }
}

#[async_trait]
impl EventStore for SqliteStore {
    async fn initialize(&self) -> Result<()> {
        self.call(|w| schema::initialize(&w.conn, &w.statements)).await
    }

    async fn append(
        &self,
        stream_id: &StreamId,
        expected: ExpectedSequence,
        events: Vec<EventData>,
    ) -> Result<Vec<RecordedEvent>> {
        let stream_id = stream_id.clone();
        self.call(move |w| w.append(&stream_id, expected, events)).await
    }

    async fn append_multi(&self, events: Vec<(StreamId, EventData)>) -> Result<Vec<RecordedEvent>> {
        self.call(move |w| w.append_multi(events)).await
    }

    async fn read(
        &self,
        from: GlobalSeq,
        count: ReadCount,
        cancel: &CancellationToken,
        sink: EventSink<'_>,
    ) -> Result<usize> {
        let mut next = from.clamp_start().as_raw();
        let mut remaining = count.as_limit();
        let mut delivered = 0;

        while remaining > 0 && !cancel.is_cancelled() {
            let limit = remaining.min(self.read_page_size);
            let page = self
                .call(move |w| w.select_events(next, limit))
                .await?;
            let fetched = page.len();
            if let Some(last) = page.last() {
                next = last.global_seq.as_raw() + 1;
            }

            let n = deliver(page, cancel, &mut *sink);
            delivered += n;
            remaining -= n;
            if n < fetched || fetched < limit {
                break;
            }
        }
        Ok(delivered)
    }

    async fn read_stream(
        &self,
        stream_id: &StreamId,
        from: StreamSeq,
        count: ReadCount,
        cancel: &CancellationToken,
        sink: EventSink<'_>,
    ) -> Result<usize> {
        let mut next = from.clamp_start().as_raw();
        let mut remaining = count.as_limit();
        let mut delivered = 0;

        while remaining > 0 && !cancel.is_cancelled() {
            let limit = remaining.min(self.read_page_size);
            let stream_id = stream_id.clone();
            let page = self
                .call(move |w| w.select_stream(&stream_id, next, limit))
                .await?;
            let fetched = page.len();
            if let Some(last) = page.last() {
                next = last.stream_seq.as_raw() + 1;
            }

            let n = deliver(page, cancel, &mut *sink);
            delivered += n;
            remaining -= n;
            if n < fetched || fetched < limit {
                break;
            }
        }
        Ok(delivered)
    }

    async fn read_highest_global_sequence(&self) -> Result<GlobalSeq> {
        self.call(|w| {
            let max: i64 = w
                .conn
                .query_row(&w.statements.max_global_seq, [], |row| row.get(0))?;
            Ok(GlobalSeq::from_raw(max))
        })
        .await
    }

    async fn read_highest_stream_sequence(&self, stream_id: &StreamId) -> Result<StreamSeq> {
        let stream_id = stream_id.clone();
        self.call(move |w| max_stream_seq(&w.conn, &w.statements, &stream_id))
            .await
    }

    async fn write_projection_index(
        &self,
        projection_id: &ProjectionStreamId,
        expected: ProjectionSeq,
        global_seqs: &[GlobalSeq],
    ) -> Result<()> {
        let projection_id = projection_id.clone();
        let global_seqs = global_seqs.to_vec();
        self.call(move |w| w.write_index(&projection_id, expected, &global_seqs))
            .await
    }

    async fn read_projection_index(
        &self,
        projection_id: &ProjectionStreamId,
        from: ProjectionSeq,
        count: ReadCount,
        cancel: &CancellationToken,
        sink: IndexSink<'_>,
    ) -> Result<usize> {
        let mut next = from.as_raw().max(1);
        let mut remaining = count.as_limit();
        let mut delivered = 0;

        while remaining > 0 && !cancel.is_cancelled() {
            let limit = remaining.min(self.read_page_size);
            let projection_id = projection_id.clone();
            let page = self
                .call(move |w| w.select_index(&projection_id, next, limit))
                .await?;
            let fetched = page.len();
            if let Some(last) = page.last() {
                next = last.projection_seq.as_raw() + 1;
            }

            let n = deliver(page, cancel, &mut *sink);
            delivered += n;
            remaining -= n;
            if n < fetched || fetched < limit {
                break;
            }
        }
        Ok(delivered)
    }

    async fn read_highest_projection_entry(
        &self,
        projection_id: &ProjectionStreamId,
    ) -> Result<Option<IndexEntry>> {
        let projection_id = projection_id.clone();
        self.call(move |w| max_projection_entry(&w.conn, &w.statements, &projection_id))
            .await
    }

    async fn write_projection_checkpoint(
        &self,
        projection_id: &ProjectionStreamId,
        checkpoint: GlobalSeq,
    ) -> Result<()> {
        let projection_id = projection_id.clone();
        self.call(move |w| {
            w.conn.prepare_cached(&w.statements.upsert_checkpoint)?.execute((
                projection_id.as_str(),
                checkpoint.as_raw(),
            ))?;
            Ok(())
        })
        .await
    }

    async fn read_projection_checkpoint(
        &self,
        projection_id: &ProjectionStreamId,
    ) -> Result<GlobalSeq> {
        let projection_id = projection_id.clone();
        self.call(move |w| {
            let value: Option<i64> = w
                .conn
                .prepare_cached(&w.statements.select_checkpoint)?
                .query_row([projection_id.as_str()], |row| row.get(0))
                .optional()?;
            Ok(value.map_or(GlobalSeq::ZERO, GlobalSeq::from_raw))
        })
        .await
    }

    async fn clear_projection_index(&self, projection_id: &ProjectionStreamId) -> Result<()> {
        let projection_id = projection_id.clone();
        self.call(move |w| {
            let tx = w.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(&w.statements.delete_index, [projection_id.as_str()])?;
            tx.execute(&w.statements.delete_checkpoint, [projection_id.as_str()])?;
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

// =============================================================================
// Worker Operations
// =============================================================================

impl Worker {
    fn append(
        &mut self,
        stream_id: &StreamId,
        expected: ExpectedSequence,
        events: Vec<EventData>,
    ) -> Result<Vec<RecordedEvent>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let actual = max_stream_seq(&tx, &self.statements, stream_id)?;
        if !expected.matches(actual) {
            return Err(Error::UnexpectedSequence {
                stream_id: stream_id.to_string(),
                expected: expected.to_string(),
                actual: actual.as_raw() as i64,
            });
        }
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let mut global_seq = max_global_seq(&tx, &self.statements)?;
        let mut stream_seq = actual;
        let now_ms = current_time_ms();
        let recorded: Vec<RecordedEvent> = events
            .into_iter()
            .map(|data| {
                global_seq = global_seq.next();
                stream_seq = stream_seq.next();
                RecordedEvent::from_data(data, stream_id.clone(), global_seq, stream_seq, now_ms)
            })
            .collect();

        insert_events(&tx, &self.statements, &self.dialect, &self.config, &recorded)?;
        tx.commit()?;

        debug!(stream = %stream_id, count = recorded.len(), "appended");
        Ok(recorded)
    }

    fn append_multi(&mut self, events: Vec<(StreamId, EventData)>) -> Result<Vec<RecordedEvent>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut global_seq = max_global_seq(&tx, &self.statements)?;
        let mut heads: HashMap<StreamId, StreamSeq> = HashMap::new();
        let now_ms = current_time_ms();
        let mut recorded = Vec::with_capacity(events.len());

        for (stream_id, data) in events {
            let head = match heads.get(&stream_id) {
                Some(seq) => *seq,
                None => max_stream_seq(&tx, &self.statements, &stream_id)?,
            };
            let stream_seq = head.next();
            heads.insert(stream_id.clone(), stream_seq);
            global_seq = global_seq.next();
            recorded.push(RecordedEvent::from_data(data, stream_id, global_seq, stream_seq, now_ms));
        }

        insert_events(&tx, &self.statements, &self.dialect, &self.config, &recorded)?;
        tx.commit()?;

        debug!(count = recorded.len(), streams = heads.len(), "appended multi-stream batch");
        Ok(recorded)
    }

    fn select_events(&mut self, from: i64, limit: usize) -> Result<Vec<RecordedEvent>> {
        let mut stmt = self.conn.prepare_cached(&self.statements.select_events_from)?;
        let rows = stmt.query_map((from, limit as i64), event_from_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    fn select_stream(
        &mut self,
        stream_id: &StreamId,
        from: i32,
        limit: usize,
    ) -> Result<Vec<RecordedEvent>> {
        let hash = stream_id.hash();
        let mut stmt = self.conn.prepare_cached(&self.statements.select_stream_from)?;
        let rows = stmt.query_map(
            (&hash.as_bytes()[..], from, limit as i64),
            event_from_row,
        )?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    fn select_index(
        &mut self,
        projection_id: &ProjectionStreamId,
        from: i64,
        limit: usize,
    ) -> Result<Vec<IndexEntry>> {
        let mut stmt = self.conn.prepare_cached(&self.statements.select_index_from)?;
        let rows = stmt.query_map((projection_id.as_str(), from, limit as i64), |row| {
            Ok(IndexEntry {
                projection_seq: ProjectionSeq::from_raw(row.get(0)?),
                global_seq: GlobalSeq::from_raw(row.get(1)?),
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    fn write_index(
        &mut self,
        projection_id: &ProjectionStreamId,
        expected: ProjectionSeq,
        global_seqs: &[GlobalSeq],
    ) -> Result<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let actual = max_projection_entry(&tx, &self.statements, projection_id)?
            .map_or(ProjectionSeq::NONE, |e| e.projection_seq);
        if actual != expected {
            return Err(Error::UnexpectedSequence {
                stream_id: projection_id.to_string(),
                expected: expected.to_string(),
                actual: actual.as_raw(),
            });
        }

        let pid = projection_id.as_str();
        let chunks = split_batches(
            &vec![pid.len() + 16; global_seqs.len()],
            self.config.max_batch_items,
            self.config.max_batch_bytes,
        );
        for chunk in chunks {
            let sql = multi_row_insert(&self.statements.insert_index_prefix, chunk.len(), INDEX_COLUMNS);
            let rows: Vec<(i64, i64)> = chunk
                .clone()
                .map(|i| (expected.as_raw() + i as i64 + 1, global_seqs[i].as_raw()))
                .collect();
            let mut params: Vec<&dyn ToSql> = Vec::with_capacity(rows.len() * INDEX_COLUMNS);
            for (seq, global) in &rows {
                params.push(&pid);
                params.push(seq);
                params.push(global);
            }
            tx.prepare_cached(&sql)?
                .execute(params.as_slice())
                .map_err(|e| {
                    classify(&self.dialect, e, || {
                        format!("global sequence already indexed for {}", projection_id)
                    })
                })?;
        }

        tx.commit()?;
        Ok(())
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn max_global_seq(conn: &Connection, statements: &Statements) -> Result<GlobalSeq> {
    let max: i64 = conn
        .prepare_cached(&statements.max_global_seq)?
        .query_row([], |row| row.get(0))?;
    Ok(GlobalSeq::from_raw(max))
}

fn max_stream_seq(conn: &Connection, statements: &Statements, stream_id: &StreamId) -> Result<StreamSeq> {
    let hash = stream_id.hash();
    let max: i32 = conn
        .prepare_cached(&statements.max_stream_seq)?
        .query_row([&hash.as_bytes()[..]], |row| row.get(0))?;
    Ok(StreamSeq::from_raw(max))
}

fn max_projection_entry(
    conn: &Connection,
    statements: &Statements,
    projection_id: &ProjectionStreamId,
) -> Result<Option<IndexEntry>> {
    let entry = conn
        .prepare_cached(&statements.max_projection_entry)?
        .query_row([projection_id.as_str()], |row| {
            Ok(IndexEntry {
                projection_seq: ProjectionSeq::from_raw(row.get(0)?),
                global_seq: GlobalSeq::from_raw(row.get(1)?),
            })
        })
        .optional()?;
    Ok(entry)
}

/// Inserts already-sequenced events, split into statements the backend accepts.
fn insert_events(
    tx: &Transaction<'_>,
    statements: &Statements,
    dialect: &SqliteDialect,
    config: &SqliteConfig,
    events: &[RecordedEvent],
) -> Result<()> {
    let sizes: Vec<usize> = events
        .iter()
        .map(|e| {
            e.payload.len()
                + e.metadata.as_ref().map_or(0, |m| m.len())
                + e.event_type.len()
                + e.stream_id.as_str().len()
                + 64
        })
        .collect();
    let hashes: Vec<[u8; 20]> = events.iter().map(|e| *e.stream_id.hash().as_bytes()).collect();
    let rows: Vec<EventRow<'_>> = events
        .iter()
        .zip(&hashes)
        .map(|(e, hash)| EventRow::new(e, hash))
        .collect();

    for chunk in split_batches(&sizes, config.max_batch_items, config.max_batch_bytes) {
        let sql = multi_row_insert(&statements.insert_events_prefix, chunk.len(), EVENT_COLUMNS);
        let mut params: Vec<&dyn ToSql> = Vec::with_capacity(chunk.len() * EVENT_COLUMNS);
        for row in &rows[chunk.clone()] {
            row.push_params(&mut params);
        }

        let first = &events[chunk.start];
        tx.prepare_cached(&sql)?
            .execute(params.as_slice())
            .map_err(|e| {
                classify(dialect, e, || {
                    format!(
                        "event id already stored (batch starting at stream '{}')",
                        first.stream_id
                    )
                })
            })?;
        debug!(rows = chunk.len(), "insert statement executed");
    }
    Ok(())
}

/// Borrowed, SQL-ready view of one event row.
struct EventRow<'a> {
    global_seq: i64,
    event_id: &'a [u8],
    stream_hash: &'a [u8],
    stream_id: &'a str,
    stream_seq: i32,
    event_type: &'a str,
    created_ms: i64,
    payload_format: i32,
    metadata: Option<&'a [u8]>,
    payload: &'a [u8],
}

impl<'a> EventRow<'a> {
    fn new(event: &'a RecordedEvent, hash: &'a [u8; 20]) -> Self {
        Self {
            global_seq: event.global_seq.as_raw(),
            event_id: event.event_id.as_uuid().as_bytes(),
            stream_hash: hash,
            stream_id: event.stream_id.as_str(),
            stream_seq: event.stream_seq.as_raw(),
            event_type: &event.event_type,
            created_ms: event.timestamp_ms as i64,
            payload_format: event.payload_format,
            metadata: event.metadata.as_deref(),
            payload: &event.payload,
        }
    }

    fn push_params<'p>(&'p self, params: &mut Vec<&'p dyn ToSql>) {
        params.push(&self.global_seq);
        params.push(&self.event_id);
        params.push(&self.stream_hash);
        params.push(&self.stream_id);
        params.push(&self.stream_seq);
        params.push(&self.event_type);
        params.push(&self.created_ms);
        params.push(&self.payload_format);
        params.push(&self.metadata);
        params.push(&self.payload);
    }
}

fn event_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RecordedEvent> {
    let id_bytes = match row.get_ref(1)? {
        ValueRef::Blob(b) => b,
        other => {
            return Err(rusqlite::Error::InvalidColumnType(1, "event_id".into(), other.data_type()))
        }
    };
    let uuid = Uuid::from_slice(id_bytes)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Blob, Box::new(e)))?;
    let stream_id: String = row.get(2)?;
    let event_type: String = row.get(4)?;
    let created_ms: i64 = row.get(5)?;
    let metadata: Option<Vec<u8>> = row.get(7)?;
    let payload: Vec<u8> = row.get(8)?;

    Ok(RecordedEvent {
        global_seq: GlobalSeq::from_raw(row.get(0)?),
        event_id: EventId::from_uuid(uuid),
        stream_id: StreamId::new(stream_id),
        stream_seq: StreamSeq::from_raw(row.get(3)?),
        event_type: event_type.into(),
        timestamp_ms: created_ms.max(0) as u64,
        payload: payload.into(),
        payload_format: row.get(6)?,
        metadata: metadata.map(Into::into),
    })
}

// =============================================================================
// Tests
// =============================================================================
