//! Buffered persistence of projection index entries and checkpoints.
//!
//! Projection streams never write to the store directly. They enqueue index
//! entries and checkpoints into two small actors that accumulate requests per
//! projection stream and flush them on a coalescing timer: the first request
//! of an idle period arms the timer, later requests ride along.
//!
//! ```text
//! ProjectionStream ──enqueue──► IndexWriter ──write_projection_index──► store
//!        ▲                          │
//!        └──── inconsistency ───────┘
//!
//! ProjectionStream ──enqueue──► CheckpointWriter ──write_projection_checkpoint──► store
//! ```
//!
//! Mailboxes are unbounded so an enqueue never blocks the projection stream.
//!
//! ## Failure Handling
//!
//! - A transient store error keeps the entries buffered for the next flush.
//! - `UnexpectedSequence` or `Duplicate` from an index write means the stored
//!   index and the stream's numbering disagree. The entries are dropped and
//!   the owning stream is told through its fault channel, which triggers a
//!   rebuild.
//! - Checkpoints keep only the highest value per stream; a failed write is
//!   retried unless a newer value arrived meanwhile.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::store::EventStore;
use crate::types::{GlobalSeq, IndexEntry, ProjectionSeq, ProjectionStreamId};

/// Channel a projection stream listens on for index inconsistencies.
pub(crate) type FaultSender = mpsc::UnboundedSender<Error>;

// =============================================================================
// Index Writer
// =============================================================================

enum IndexMessage {
    Enqueue {
        projection_id: ProjectionStreamId,
        entry: IndexEntry,
        faults: FaultSender,
    },
    /// Drop everything buffered for one stream (used before a rebuild).
    Discard {
        projection_id: ProjectionStreamId,
        done: oneshot::Sender<()>,
    },
    Flush {
        done: oneshot::Sender<()>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

struct PendingIndex {
    entries: Vec<IndexEntry>,
    faults: FaultSender,
}

struct IndexWriter {
    store: Arc<dyn EventStore>,
    pending: HashMap<ProjectionStreamId, PendingIndex>,
}

impl IndexWriter {
    fn enqueue(&mut self, projection_id: ProjectionStreamId, entry: IndexEntry, faults: FaultSender) {
        let pending = self
            .pending
            .entry(projection_id)
            .or_insert_with(|| PendingIndex {
                entries: Vec::new(),
                faults: faults.clone(),
            });
        pending.faults = faults;
        pending.entries.push(entry);
    }

    /// Writes every buffered stream. Returns true if something stays buffered.
    async fn flush(&mut self) -> bool {
        if self.pending.is_empty() {
            return false;
        }

        for (projection_id, mut pending) in std::mem::take(&mut self.pending) {
            pending.entries.sort_by_key(|e| e.projection_seq);
            pending.entries.dedup_by_key(|e| e.projection_seq);

            let first = pending.entries[0].projection_seq;
            let dense = pending
                .entries
                .iter()
                .enumerate()
                .all(|(i, e)| e.projection_seq.as_raw() == first.as_raw() + i as i64);
            if !dense {
                let _ = pending.faults.send(Error::InconsistentProjection {
                    projection_id: projection_id.to_string(),
                    reason: "buffered index entries are not contiguous".to_string(),
                });
                continue;
            }

            let expected = ProjectionSeq::from_raw(first.as_raw() - 1);
            let globals: Vec<GlobalSeq> = pending.entries.iter().map(|e| e.global_seq).collect();

            match self
                .store
                .write_projection_index(&projection_id, expected, &globals)
                .await
            {
                Ok(()) => {
                    debug!(
                        projection = %projection_id,
                        count = globals.len(),
                        "projection index flushed"
                    );
                }
                Err(e) if e.is_unexpected_sequence() || e.is_duplicate() => {
                    warn!(projection = %projection_id, error = %e, "projection index rejected");
                    let _ = pending.faults.send(Error::InconsistentProjection {
                        projection_id: projection_id.to_string(),
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    warn!(projection = %projection_id, error = %e, "projection index write failed, will retry");
                    self.pending.insert(projection_id, pending);
                }
            }
        }

        !self.pending.is_empty()
    }
}

async fn run_index_writer(
    mut writer: IndexWriter,
    mut rx: mpsc::UnboundedReceiver<IndexMessage>,
    flush_delay: Duration,
) {
    let mut batch_start: Option<Instant> = None;

    loop {
        let wait_timeout = match batch_start {
            None => Duration::from_secs(3600),
            Some(start) => flush_delay.saturating_sub(start.elapsed()),
        };

        match timeout(wait_timeout, rx.recv()).await {
            Ok(Some(IndexMessage::Enqueue {
                projection_id,
                entry,
                faults,
            })) => {
                writer.enqueue(projection_id, entry, faults);
                if batch_start.is_none() {
                    batch_start = Some(Instant::now());
                }
            }
            Ok(Some(IndexMessage::Discard { projection_id, done })) => {
                writer.pending.remove(&projection_id);
                let _ = done.send(());
            }
            Ok(Some(IndexMessage::Flush { done })) => {
                let retry = writer.flush().await;
                batch_start = retry.then(Instant::now);
                let _ = done.send(());
            }
            Ok(Some(IndexMessage::Shutdown { done })) => {
                writer.flush().await;
                let _ = done.send(());
                break;
            }
            Ok(None) => {
                writer.flush().await;
                break;
            }
            Err(_) => {
                let retry = writer.flush().await;
                batch_start = retry.then(Instant::now);
            }
        }
    }

    info!("projection index writer stopped");
}

/// Handle to the index writer task.
#[derive(Clone)]
pub struct IndexWriterHandle {
    tx: mpsc::UnboundedSender<IndexMessage>,
}

impl IndexWriterHandle {
    pub(crate) fn enqueue(
        &self,
        projection_id: ProjectionStreamId,
        entry: IndexEntry,
        faults: FaultSender,
    ) -> Result<()> {
        self.tx
            .send(IndexMessage::Enqueue {
                projection_id,
                entry,
                faults,
            })
            .map_err(|_| Error::Closed("index writer"))
    }

    /// Drops buffered entries of one projection stream.
    pub async fn discard(&self, projection_id: &ProjectionStreamId) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(IndexMessage::Discard {
                projection_id: projection_id.clone(),
                done,
            })
            .map_err(|_| Error::Closed("index writer"))?;
        rx.await.map_err(|_| Error::Closed("index writer"))
    }

    /// Flushes everything buffered now, without waiting for the timer.
    pub async fn flush(&self) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(IndexMessage::Flush { done })
            .map_err(|_| Error::Closed("index writer"))?;
        rx.await.map_err(|_| Error::Closed("index writer"))
    }

    /// Flushes and stops the writer.
    pub async fn shutdown(&self) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(IndexMessage::Shutdown { done })
            .map_err(|_| Error::Closed("index writer"))?;
        rx.await.map_err(|_| Error::Closed("index writer"))
    }
}

/// Spawns the projection index writer.
pub fn spawn_index_writer(store: Arc<dyn EventStore>, flush_delay: Duration) -> IndexWriterHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let writer = IndexWriter {
        store,
        pending: HashMap::new(),
    };
    tokio::spawn(run_index_writer(writer, rx, flush_delay));
    IndexWriterHandle { tx }
}

// =============================================================================
// Checkpoint Writer
// =============================================================================

enum CheckpointMessage {
    Enqueue {
        projection_id: ProjectionStreamId,
        checkpoint: GlobalSeq,
    },
    Discard {
        projection_id: ProjectionStreamId,
        done: oneshot::Sender<()>,
    },
    Flush {
        done: oneshot::Sender<()>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

struct CheckpointWriter {
    store: Arc<dyn EventStore>,
    pending: HashMap<ProjectionStreamId, GlobalSeq>,
}

impl CheckpointWriter {
    fn enqueue(&mut self, projection_id: ProjectionStreamId, checkpoint: GlobalSeq) {
        let slot = self.pending.entry(projection_id).or_insert(checkpoint);
        if checkpoint > *slot {
            *slot = checkpoint;
        }
    }

    async fn flush(&mut self) -> bool {
        for (projection_id, checkpoint) in std::mem::take(&mut self.pending) {
            if let Err(e) = self
                .store
                .write_projection_checkpoint(&projection_id, checkpoint)
                .await
            {
                warn!(projection = %projection_id, error = %e, "checkpoint write failed, will retry");
                self.enqueue(projection_id, checkpoint);
            }
        }
        !self.pending.is_empty()
    }
}

async fn run_checkpoint_writer(
    mut writer: CheckpointWriter,
    mut rx: mpsc::UnboundedReceiver<CheckpointMessage>,
    flush_delay: Duration,
) {
    let mut batch_start: Option<Instant> = None;

    loop {
        let wait_timeout = match batch_start {
            None => Duration::from_secs(3600),
            Some(start) => flush_delay.saturating_sub(start.elapsed()),
        };

        match timeout(wait_timeout, rx.recv()).await {
            Ok(Some(CheckpointMessage::Enqueue {
                projection_id,
                checkpoint,
            })) => {
                writer.enqueue(projection_id, checkpoint);
                if batch_start.is_none() {
                    batch_start = Some(Instant::now());
                }
            }
            Ok(Some(CheckpointMessage::Discard { projection_id, done })) => {
                writer.pending.remove(&projection_id);
                let _ = done.send(());
            }
            Ok(Some(CheckpointMessage::Flush { done })) => {
                let retry = writer.flush().await;
                batch_start = retry.then(Instant::now);
                let _ = done.send(());
            }
            Ok(Some(CheckpointMessage::Shutdown { done })) => {
                writer.flush().await;
                let _ = done.send(());
                break;
            }
            Ok(None) => {
                writer.flush().await;
                break;
            }
            Err(_) => {
                let retry = writer.flush().await;
                batch_start = retry.then(Instant::now);
            }
        }
    }

    info!("projection checkpoint writer stopped");
}

/// Handle to the checkpoint writer task.
#[derive(Clone)]
pub struct CheckpointWriterHandle {
    tx: mpsc::UnboundedSender<CheckpointMessage>,
}

impl CheckpointWriterHandle {
    pub(crate) fn enqueue(&self, projection_id: ProjectionStreamId, checkpoint: GlobalSeq) -> Result<()> {
        self.tx
            .send(CheckpointMessage::Enqueue {
                projection_id,
                checkpoint,
            })
            .map_err(|_| Error::Closed("checkpoint writer"))
    }

    /// Drops the buffered checkpoint of one projection stream.
    pub async fn discard(&self, projection_id: &ProjectionStreamId) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(CheckpointMessage::Discard {
                projection_id: projection_id.clone(),
                done,
            })
            .map_err(|_| Error::Closed("checkpoint writer"))?;
        rx.await.map_err(|_| Error::Closed("checkpoint writer"))
    }

    /// Flushes now.
    pub async fn flush(&self) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(CheckpointMessage::Flush { done })
            .map_err(|_| Error::Closed("checkpoint writer"))?;
        rx.await.map_err(|_| Error::Closed("checkpoint writer"))
    }

    /// Flushes and stops the writer.
    pub async fn shutdown(&self) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(CheckpointMessage::Shutdown { done })
            .map_err(|_| Error::Closed("checkpoint writer"))?;
        rx.await.map_err(|_| Error::Closed("checkpoint writer"))
    }
}

/// Spawns the projection checkpoint writer.
pub fn spawn_checkpoint_writer(store: Arc<dyn EventStore>, flush_delay: Duration) -> CheckpointWriterHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let writer = CheckpointWriter {
        store,
        pending: HashMap::new(),
    };
    tokio::spawn(run_checkpoint_writer(writer, rx, flush_delay));
    CheckpointWriterHandle { tx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use tokio_util::sync::CancellationToken;

    fn entry(seq: i64, global: i64) -> IndexEntry {
        IndexEntry {
            projection_seq: ProjectionSeq::from_raw(seq),
            global_seq: GlobalSeq::from_raw(global),
        }
    }

    async fn stored_index(store: &MemoryStore, id: &ProjectionStreamId) -> Vec<IndexEntry> {
        let mut entries = Vec::new();
        store
            .read_projection_index(
                id,
                ProjectionSeq::from_raw(1),
                crate::types::ReadCount::Unlimited,
                &CancellationToken::new(),
                &mut |e| entries.push(e),
            )
            .await
            .unwrap();
        entries
    }

    #[tokio::test]
    async fn test_index_entries_coalesce_into_one_write() {
        let store = Arc::new(MemoryStore::new());
        let writer = spawn_index_writer(store.clone(), Duration::from_secs(60));
        let (faults, mut fault_rx) = mpsc::unbounded_channel();
        let id = ProjectionStreamId::new("$projection-a");

        // Out of order on purpose; the flush sorts by projection sequence
        writer.enqueue(id.clone(), entry(2, 7), faults.clone()).unwrap();
        writer.enqueue(id.clone(), entry(1, 3), faults.clone()).unwrap();
        writer.enqueue(id.clone(), entry(3, 9), faults).unwrap();
        writer.flush().await.unwrap();

        assert_eq!(stored_index(&store, &id).await, vec![entry(1, 3), entry(2, 7), entry(3, 9)]);
        assert!(fault_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_index_conflict_reports_fault() {
        let store = Arc::new(MemoryStore::new());
        let id = ProjectionStreamId::new("$projection-b");
        store
            .write_projection_index(&id, ProjectionSeq::NONE, &[GlobalSeq::from_raw(1)])
            .await
            .unwrap();

        let writer = spawn_index_writer(store.clone(), Duration::from_secs(60));
        let (faults, mut fault_rx) = mpsc::unbounded_channel();
        writer.enqueue(id.clone(), entry(1, 5), faults).unwrap();
        writer.flush().await.unwrap();

        assert!(matches!(
            fault_rx.recv().await,
            Some(Error::InconsistentProjection { .. })
        ));
        assert_eq!(stored_index(&store, &id).await, vec![entry(1, 1)]);
    }

    #[tokio::test]
    async fn test_index_discard() {
        let store = Arc::new(MemoryStore::new());
        let writer = spawn_index_writer(store.clone(), Duration::from_secs(60));
        let (faults, _fault_rx) = mpsc::unbounded_channel();
        let id = ProjectionStreamId::new("$projection-c");

        writer.enqueue(id.clone(), entry(1, 1), faults).unwrap();
        writer.discard(&id).await.unwrap();
        writer.shutdown().await.unwrap();

        assert!(stored_index(&store, &id).await.is_empty());
    }

    #[tokio::test]
    async fn test_timer_flush() {
        let store = Arc::new(MemoryStore::new());
        let writer = spawn_index_writer(store.clone(), Duration::from_millis(10));
        let (faults, _fault_rx) = mpsc::unbounded_channel();
        let id = ProjectionStreamId::new("$projection-d");

        writer.enqueue(id.clone(), entry(1, 4), faults).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(stored_index(&store, &id).await, vec![entry(1, 4)]);
    }

    #[tokio::test]
    async fn test_checkpoint_keeps_highest() {
        let store = Arc::new(MemoryStore::new());
        let writer = spawn_checkpoint_writer(store.clone(), Duration::from_secs(60));
        let id = ProjectionStreamId::new("$projection-e");

        writer.enqueue(id.clone(), GlobalSeq::from_raw(5)).unwrap();
        writer.enqueue(id.clone(), GlobalSeq::from_raw(9)).unwrap();
        writer.enqueue(id.clone(), GlobalSeq::from_raw(7)).unwrap();
        writer.shutdown().await.unwrap();

        assert_eq!(
            store.read_projection_checkpoint(&id).await.unwrap(),
            GlobalSeq::from_raw(9)
        );
    }
}
