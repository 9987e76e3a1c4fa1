//! Replay of a projection stream to one late subscriber.
//!
//! A subscriber that joins with `last_known` behind the stream's current
//! sequence is brought forward by a worker task running next to the stream:
//!
//! ```text
//! anchor ──► index entries ──► log scan ──► ReplayDone
//!   │        (dense, each        (from the last indexed
//!   │         event fetched       global sequence up to
//!   │         and re-checked)     the stream's checkpoint)
//!   └── min(last_known, index tip)
//! ```
//!
//! Only events with a projection sequence above `last_known` are sent. The
//! worker must land exactly on the stream's sequence at spawn time; any
//! disagreement between index, log and query is reported as
//! [`Error::InconsistentProjection`] and makes the stream rebuild.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::projection::query::ProjectionStreamQuery;
use crate::store::EventStore;
use crate::subscription::ProjectionMessage;
use crate::types::{GlobalSeq, IndexEntry, ProjectionSeq, ReadCount, RecordedEvent};

/// What the worker must deliver.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReplayTarget {
    /// Highest sequence the subscriber already has.
    pub last_known: ProjectionSeq,
    /// The stream's sequence when the worker was spawned.
    pub projection_seq: ProjectionSeq,
    /// The stream's checkpoint at the same moment.
    pub checkpoint: GlobalSeq,
}

struct Replay<'a> {
    store: &'a dyn EventStore,
    query: &'a ProjectionStreamQuery,
    sender: &'a mpsc::Sender<ProjectionMessage>,
    cancel: &'a CancellationToken,
    target: ReplayTarget,
    page_size: usize,
    /// Last projection sequence reached and the global sequence it maps to.
    seq: ProjectionSeq,
    global: GlobalSeq,
}

/// Sends every missing event to `sender`. Returns the final sequence.
pub(crate) async fn replay_to_subscriber(
    store: Arc<dyn EventStore>,
    query: Arc<ProjectionStreamQuery>,
    target: ReplayTarget,
    page_size: usize,
    sender: mpsc::Sender<ProjectionMessage>,
    cancel: CancellationToken,
) -> Result<ProjectionSeq> {
    let mut replay = Replay {
        store: store.as_ref(),
        query: query.as_ref(),
        sender: &sender,
        cancel: &cancel,
        target,
        page_size: page_size.max(1),
        seq: ProjectionSeq::NONE,
        global: GlobalSeq::ZERO,
    };

    let tip = replay.anchor().await?;
    replay.from_index(tip).await?;
    replay.from_log().await?;

    if replay.seq != target.projection_seq {
        return Err(replay.inconsistent(format!(
            "replay ended at {} but the stream is at {}",
            replay.seq, target.projection_seq
        )));
    }
    Ok(replay.seq)
}

impl Replay<'_> {
    fn inconsistent(&self, reason: String) -> Error {
        Error::InconsistentProjection {
            projection_id: self.query.id().to_string(),
            reason,
        }
    }

    /// Positions the worker at `min(last_known, index tip)`. Returns the tip.
    async fn anchor(&mut self) -> Result<ProjectionSeq> {
        let tip = self
            .store
            .read_highest_projection_entry(self.query.id())
            .await?;
        let tip_seq = tip.map_or(ProjectionSeq::NONE, |e| e.projection_seq);
        let last_known = self.target.last_known;

        if last_known == ProjectionSeq::NONE {
            return Ok(tip_seq);
        }

        if last_known <= tip_seq {
            let entry = self
                .index_page(last_known, 1)
                .await?
                .into_iter()
                .next()
                .filter(|e| e.projection_seq == last_known)
                .ok_or_else(|| self.inconsistent(format!("index entry {} is missing", last_known)))?;
            self.seq = entry.projection_seq;
            self.global = entry.global_seq;
        } else if let Some(entry) = tip {
            self.seq = entry.projection_seq;
            self.global = entry.global_seq;
        }
        Ok(tip_seq)
    }

    async fn from_index(&mut self, tip: ProjectionSeq) -> Result<()> {
        let stop = tip.min(self.target.projection_seq);

        while self.seq < stop {
            let remaining = (stop.as_raw() - self.seq.as_raw()) as usize;
            let entries = self
                .index_page(self.seq.next(), remaining.min(self.page_size))
                .await?;
            if entries.is_empty() {
                break;
            }

            for entry in entries {
                if self.cancel.is_cancelled() {
                    return Err(Error::Canceled);
                }
                if entry.projection_seq != self.seq.next() {
                    return Err(self.inconsistent(format!(
                        "index jumps from {} to {}",
                        self.seq, entry.projection_seq
                    )));
                }
                if entry.global_seq <= self.global {
                    return Err(self.inconsistent(format!(
                        "index entry {} points backwards to {}",
                        entry.projection_seq, entry.global_seq
                    )));
                }

                let event = self.fetch(entry.global_seq).await?;
                if !self.query.matches(&event) {
                    return Err(self.inconsistent(format!(
                        "indexed event {} does not match the query",
                        entry.global_seq
                    )));
                }

                self.seq = entry.projection_seq;
                self.global = entry.global_seq;
                self.emit(event).await?;
            }
        }
        Ok(())
    }

    async fn from_log(&mut self) -> Result<()> {
        let end = self.target.checkpoint;
        let mut next = self.global.next();

        while self.seq < self.target.projection_seq && next <= end {
            let remaining = (end.as_raw() - next.as_raw() + 1) as usize;
            let mut page = Vec::new();
            self.store
                .read(
                    next,
                    ReadCount::Limited(remaining.min(self.page_size)),
                    self.cancel,
                    &mut |event| page.push(event),
                )
                .await?;
            if self.cancel.is_cancelled() {
                return Err(Error::Canceled);
            }
            if page.is_empty() {
                break;
            }

            for event in page {
                next = event.global_seq.next();
                if !self.query.matches(&event) {
                    continue;
                }
                self.seq = self.seq.next();
                self.global = event.global_seq;
                self.emit(event).await?;
                if self.seq == self.target.projection_seq {
                    break;
                }
            }
        }
        Ok(())
    }

    async fn emit(&self, event: RecordedEvent) -> Result<()> {
        if self.seq <= self.target.last_known {
            return Ok(());
        }
        let message = ProjectionMessage::Event {
            projection_seq: self.seq,
            event: Arc::new(event),
        };
        tokio::select! {
            sent = self.sender.send(message) => sent.map_err(|_| Error::Closed("projection subscriber")),
            _ = self.cancel.cancelled() => Err(Error::Canceled),
        }
    }

    async fn fetch(&self, global: GlobalSeq) -> Result<RecordedEvent> {
        let mut found = None;
        self.store
            .read(global, ReadCount::Limited(1), self.cancel, &mut |event| {
                found = Some(event)
            })
            .await?;
        found
            .filter(|event| event.global_seq == global)
            .ok_or_else(|| self.inconsistent(format!("indexed event {} is not in the log", global)))
    }

    async fn index_page(&self, from: ProjectionSeq, count: usize) -> Result<Vec<IndexEntry>> {
        let mut entries = Vec::with_capacity(count);
        self.store
            .read_projection_index(
                self.query.id(),
                from,
                ReadCount::Limited(count),
                self.cancel,
                &mut |entry| entries.push(entry),
            )
            .await?;
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projection::query::Predicate;
    use crate::store::MemoryStore;
    use crate::types::{EventData, StreamId};

    /// Appends `kinds` as single-event appends and returns the store.
    async fn store_with(kinds: &[&str]) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let stream = StreamId::new("s");
        for kind in kinds {
            store
                .append_multi(vec![(stream.clone(), EventData::new(*kind, Vec::new()))])
                .await
                .unwrap();
        }
        store
    }

    fn query() -> Arc<ProjectionStreamQuery> {
        Arc::new(ProjectionStreamQuery::new([Predicate::event_type("A")]).unwrap())
    }

    async fn run(
        store: Arc<MemoryStore>,
        query: Arc<ProjectionStreamQuery>,
        target: ReplayTarget,
    ) -> (Result<ProjectionSeq>, Vec<(i64, i64)>) {
        let (tx, mut rx) = mpsc::channel(64);
        let result =
            replay_to_subscriber(store, query, target, 2, tx, CancellationToken::new()).await;
        let mut seen = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let ProjectionMessage::Event {
                projection_seq,
                event,
            } = msg
            {
                seen.push((projection_seq.as_raw(), event.global_seq.as_raw()));
            }
        }
        (result, seen)
    }

    fn target(last_known: i64, seq: i64, checkpoint: i64) -> ReplayTarget {
        ReplayTarget {
            last_known: ProjectionSeq::from_raw(last_known),
            projection_seq: ProjectionSeq::from_raw(seq),
            checkpoint: GlobalSeq::from_raw(checkpoint),
        }
    }

    #[tokio::test]
    async fn test_log_only_replay() {
        // A at 1, 3, 4, 6
        let store = store_with(&["A", "B", "A", "A", "B", "A"]).await;
        let (result, seen) = run(store, query(), target(1, 4, 6)).await;

        assert_eq!(result.unwrap(), ProjectionSeq::from_raw(4));
        assert_eq!(seen, vec![(2, 3), (3, 4), (4, 6)]);
    }

    #[tokio::test]
    async fn test_index_then_log() {
        let store = store_with(&["A", "B", "A", "A", "B", "A"]).await;
        let query = query();
        // Index covers the first two matches only
        store
            .write_projection_index(
                query.id(),
                ProjectionSeq::NONE,
                &[GlobalSeq::from_raw(1), GlobalSeq::from_raw(3)],
            )
            .await
            .unwrap();

        let (result, seen) = run(store, query, target(0, 4, 6)).await;
        assert_eq!(result.unwrap(), ProjectionSeq::from_raw(4));
        assert_eq!(seen, vec![(1, 1), (2, 3), (3, 4), (4, 6)]);
    }

    #[tokio::test]
    async fn test_last_known_beyond_index_tip() {
        let store = store_with(&["A", "B", "A", "A", "B", "A"]).await;
        let query = query();
        store
            .write_projection_index(query.id(), ProjectionSeq::NONE, &[GlobalSeq::from_raw(1)])
            .await
            .unwrap();

        let (result, seen) = run(store, query, target(3, 4, 6)).await;
        assert_eq!(result.unwrap(), ProjectionSeq::from_raw(4));
        assert_eq!(seen, vec![(4, 6)]);
    }

    #[tokio::test]
    async fn test_index_pointing_at_wrong_event() {
        let store = store_with(&["A", "B", "A"]).await;
        let query = query();
        // Event 2 is a "B"; the query never matches it
        store
            .write_projection_index(query.id(), ProjectionSeq::NONE, &[GlobalSeq::from_raw(2)])
            .await
            .unwrap();

        let (result, _) = run(store, query, target(0, 2, 3)).await;
        assert!(matches!(result, Err(Error::InconsistentProjection { .. })));
    }

    #[tokio::test]
    async fn test_short_log_is_inconsistent() {
        let store = store_with(&["A", "B"]).await;
        let (result, _) = run(store, query(), target(0, 3, 2)).await;
        assert!(matches!(result, Err(Error::InconsistentProjection { .. })));
    }
}
