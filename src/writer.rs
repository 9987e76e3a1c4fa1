//! # Buffered Writer with Group Commit
//!
//! Collects concurrent write requests over a short window and commits them
//! with a single [`EventStore::append_multi`] call.
//!
//! ## Why Group Commit?
//!
//! Each store transaction costs a round-trip and (for SQLite) an fsync. By
//! batching many requests into one transaction the cost is amortized:
//!
//! ```text
//! Without batching:                With batching:
//! ┌──────────────────────────┐     ┌──────────────────────────┐
//! │ req1 → BEGIN → COMMIT    │     │ BEGIN                    │
//! │ req2 → BEGIN → COMMIT    │     │   req1, req2, req3, ...  │
//! │ req3 → BEGIN → COMMIT    │     │ COMMIT                   │
//! │ 100 commits              │     │ 1 commit                 │
//! └──────────────────────────┘     └──────────────────────────┘
//! ```
//!
//! ## Fallback
//!
//! One bad event must not fail its whole batch. When the batched write fails:
//!
//! - a batch of exactly one request reports that error directly
//! - a larger batch is replayed request by request, in arrival order, and
//!   each request gets its own success, duplicate or failure
//!
//! ## Flush Timing
//!
//! The flush timer is armed by the first request of an idle period and is not
//! reset by later arrivals (coalescing, not debouncing). Reaching
//! `max_batch_size` flushes early.
//!
//! ## Invariants
//!
//! - Requests are acknowledged in arrival order
//! - Persisted events are forwarded to the dispatcher after the store commit

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::{WriterConfig, MAILBOX_SIZE};
use crate::dispatcher::DispatcherHandle;
use crate::error::{Error, Result};
use crate::store::EventStore;
use crate::types::{EventData, RecordedEvent, StreamId};

// =============================================================================
// Request Types
// =============================================================================

/// Messages understood by the writer task.
enum WriterMessage {
    /// Events to append, each carrying its own stream.
    Write {
        events: Vec<(StreamId, EventData)>,
        response: oneshot::Sender<Result<Vec<RecordedEvent>>>,
    },

    /// Flush what is buffered, then stop.
    Shutdown { done: oneshot::Sender<()> },
}

/// A buffered request waiting for the next flush.
struct PendingWrite {
    events: Vec<(StreamId, EventData)>,
    response: oneshot::Sender<Result<Vec<RecordedEvent>>>,
}

// =============================================================================
// Buffered Writer
// =============================================================================

/// The state owned by the writer task.
pub struct BufferedWriter {
    store: Arc<dyn EventStore>,
    dispatcher: Option<DispatcherHandle>,
}

impl BufferedWriter {
    /// Creates a writer over `store`, forwarding commits to `dispatcher` if given.
    pub fn new(store: Arc<dyn EventStore>, dispatcher: Option<DispatcherHandle>) -> Self {
        Self { store, dispatcher }
    }

    /// Writes one batch and answers every request in it.
    async fn flush(&mut self, batch: Vec<PendingWrite>) {
        if batch.is_empty() {
            return;
        }

        let counts: Vec<usize> = batch.iter().map(|p| p.events.len()).collect();
        let combined: Vec<(StreamId, EventData)> = batch
            .iter()
            .flat_map(|p| p.events.iter().cloned())
            .collect();

        debug!(requests = batch.len(), events = combined.len(), "flushing write batch");

        match self.store.append_multi(combined).await {
            Ok(recorded) => {
                self.forward(&recorded).await;

                let mut recorded = recorded.into_iter();
                for (pending, count) in batch.into_iter().zip(counts) {
                    let events: Vec<RecordedEvent> = recorded.by_ref().take(count).collect();
                    let _ = pending.response.send(Ok(events));
                }
            }
            Err(e) if batch.len() == 1 => {
                debug!(error = %e, "single-request batch failed");
                if let Some(pending) = batch.into_iter().next() {
                    let _ = pending.response.send(Err(e));
                }
            }
            Err(e) => {
                warn!(
                    error = %e,
                    requests = batch.len(),
                    "batched write failed, retrying requests individually"
                );
                for pending in batch {
                    let result = self.store.append_multi(pending.events).await;
                    if let Ok(recorded) = &result {
                        self.forward(recorded).await;
                    }
                    let _ = pending.response.send(result);
                }
            }
        }
    }

    async fn forward(&self, recorded: &[RecordedEvent]) {
        if let Some(dispatcher) = &self.dispatcher {
            if let Err(e) = dispatcher.notify(recorded.to_vec()).await {
                // The dispatcher recovers anything it missed from the store.
                debug!(error = %e, "dispatcher unavailable, notification dropped");
            }
        }
    }
}

// =============================================================================
// Writer Handle (Async Interface)
// =============================================================================

/// Async handle to the buffered writer.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<WriterMessage>,
}

impl WriterHandle {
    /// Appends events (each with its own stream, `Any` semantics per stream).
    ///
    /// Resolves after the batch containing this request has been committed.
    /// The events of one request always receive contiguous global sequences.
    pub async fn write(&self, events: Vec<(StreamId, EventData)>) -> Result<Vec<RecordedEvent>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(WriterMessage::Write {
                events,
                response: response_tx,
            })
            .await
            .map_err(|_| Error::Closed("writer"))?;

        response_rx.await.map_err(|_| Error::Closed("writer"))?
    }

    /// Appends events to a single stream.
    pub async fn write_stream(
        &self,
        stream_id: &StreamId,
        events: Vec<EventData>,
    ) -> Result<Vec<RecordedEvent>> {
        let events = events
            .into_iter()
            .map(|e| (stream_id.clone(), e))
            .collect();
        self.write(events).await
    }

    /// Flushes buffered requests and stops the writer.
    pub async fn shutdown(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(WriterMessage::Shutdown { done: done_tx })
            .await
            .map_err(|_| Error::Closed("writer"))?;
        done_rx.await.map_err(|_| Error::Closed("writer"))
    }
}

// =============================================================================
// Writer Loop
// =============================================================================

/// Runs the writer loop until shutdown or until every handle is dropped.
async fn run_buffered_writer(
    mut writer: BufferedWriter,
    mut rx: mpsc::Receiver<WriterMessage>,
    config: WriterConfig,
) {
    let mut batch: Vec<PendingWrite> = Vec::new();
    let mut batch_start: Option<Instant> = None;

    loop {
        let wait_timeout = match batch_start {
            // No pending requests - wait indefinitely
            None => Duration::from_secs(3600),
            Some(start) => config.flush_delay.saturating_sub(start.elapsed()),
        };

        match timeout(wait_timeout, rx.recv()).await {
            Ok(Some(WriterMessage::Write { events, response })) => {
                if batch.is_empty() {
                    batch_start = Some(Instant::now());
                }
                batch.push(PendingWrite { events, response });

                if batch.len() >= config.max_batch_size {
                    writer.flush(std::mem::take(&mut batch)).await;
                    batch_start = None;
                }
            }
            Ok(Some(WriterMessage::Shutdown { done })) => {
                writer.flush(std::mem::take(&mut batch)).await;
                let _ = done.send(());
                break;
            }
            Ok(None) => {
                writer.flush(std::mem::take(&mut batch)).await;
                break;
            }
            Err(_) => {
                writer.flush(std::mem::take(&mut batch)).await;
                batch_start = None;
            }
        }
    }

    info!("buffered writer stopped");
}

/// Spawns the buffered writer on the current runtime.
pub fn spawn_buffered_writer(
    store: Arc<dyn EventStore>,
    dispatcher: Option<DispatcherHandle>,
    config: WriterConfig,
) -> WriterHandle {
    let (tx, rx) = mpsc::channel(MAILBOX_SIZE);
    let writer = BufferedWriter::new(store, dispatcher);
    tokio::spawn(run_buffered_writer(writer, rx, config));
    WriterHandle { tx }
}

// =============================================================================
// Tests
// =============================================================================
