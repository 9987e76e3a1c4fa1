//! # Subscriptions & Live Tailing
//!
//! Subscriber-side types for the two publishers in the crate:
//!
//! - the global dispatcher, which publishes every persisted event in strict
//!   global-sequence order ([`DispatcherSubscription`], [`CatchUpSubscription`])
//! - projection streams, which publish a filtered and re-sequenced view
//!   ([`ProjectionSubscription`])
//!
//! ## The Catch-Up + Live Pattern
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Subscription Timeline                            │
//! │                                                                         │
//! │  Subscriber starts                   Dispatcher cursor = 500            │
//! │  from sequence 100                   (at subscribe time)                │
//! │       │                                      │                          │
//! │       ▼                                      ▼                          │
//! │  ┌────────────────────────────────┐  ┌──────────────────────────────┐   │
//! │  │     Phase 1: Catch-Up          │  │     Phase 2: Live            │   │
//! │  │     Read events 100-500        │  │     Receive events 501+      │   │
//! │  │     from the store             │  │     via broadcast channel    │   │
//! │  └────────────────────────────────┘  └──────────────────────────────┘   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The dispatcher hands out the broadcast receiver together with its cursor in
//! one mailbox step, so the receiver sees exactly the events after the cursor.
//! Catch-up reads up to the cursor and nothing is missed or seen twice.
//!
//! ## Backpressure Handling
//!
//! The broadcast channel is bounded. A receiver that falls too far behind gets
//! `Error::SubscriptionLagged(n)` and should resubscribe from its last
//! position. When the dispatcher restarts after a fatal error, its channel is
//! closed: `next()` returns `None` and the subscriber must resubscribe.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::store::EventStore;
use crate::types::{GlobalSeq, ProjectionSeq, ReadCount, RecordedEvent, StreamId};

/// Default batch size for catch-up reads.
pub const DEFAULT_CATCHUP_BATCH_SIZE: usize = 1000;

// =============================================================================
// Dispatcher Subscription
// =============================================================================

/// A live subscription to the global dispatcher.
///
/// # Example
///
/// ```rust,ignore
/// let mut sub = log.subscribe_live().await?;
/// while let Some(result) = sub.next().await {
///     let event = result?;
///     println!("{} {}", event.global_seq, event.event_type);
/// }
/// ```
pub struct DispatcherSubscription {
    receiver: broadcast::Receiver<Arc<RecordedEvent>>,
    position: GlobalSeq,
    stream_filter: Option<StreamId>,
}

impl DispatcherSubscription {
    pub(crate) fn new(receiver: broadcast::Receiver<Arc<RecordedEvent>>, position: GlobalSeq) -> Self {
        Self {
            receiver,
            position,
            stream_filter: None,
        }
    }

    /// Only yield events of one stream.
    pub fn with_filter(mut self, stream_id: StreamId) -> Self {
        self.stream_filter = Some(stream_id);
        self
    }

    /// The dispatcher cursor at subscription time.
    ///
    /// The first live event this subscription yields is `position + 1`.
    pub fn position(&self) -> GlobalSeq {
        self.position
    }

    /// Receives the next event.
    ///
    /// # Returns
    ///
    /// - `Some(Ok(event))` - Next event
    /// - `Some(Err(Error::SubscriptionLagged(n)))` - `n` events were missed
    /// - `None` - The dispatcher closed this subscription
    pub async fn next(&mut self) -> Option<Result<Arc<RecordedEvent>>> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if let Some(ref filter) = self.stream_filter {
                        if &event.stream_id != filter {
                            continue;
                        }
                    }
                    return Some(Ok(event));
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    return Some(Err(Error::SubscriptionLagged(n)));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Receives the next event without waiting. `None` if nothing is ready.
    pub fn try_next(&mut self) -> Option<Result<Arc<RecordedEvent>>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if let Some(ref filter) = self.stream_filter {
                        if &event.stream_id != filter {
                            continue;
                        }
                    }
                    return Some(Ok(event));
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(Error::SubscriptionLagged(n)));
                }
                Err(broadcast::error::TryRecvError::Closed) => return None,
            }
        }
    }

    /// Number of published events not yet received.
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    /// Returns true if nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Catch-Up Subscription
// =============================================================================

/// A subscription that reads history from the store, then switches to live.
pub struct CatchUpSubscription {
    phase: CatchUpPhase,
    store: Arc<dyn EventStore>,
    /// Next global sequence to yield.
    next_seq: GlobalSeq,
    /// Last sequence served from the store; live events start after it.
    live_start: GlobalSeq,
    live: DispatcherSubscription,
    batch_size: usize,
    buffer: VecDeque<Arc<RecordedEvent>>,
    stream_filter: Option<StreamId>,
}

enum CatchUpPhase {
    CatchingUp,
    Live,
    Ended,
}

impl CatchUpSubscription {
    /// Creates a subscription yielding events from `from` (clamped to 1) onward.
    pub fn new(
        store: Arc<dyn EventStore>,
        from: GlobalSeq,
        live: DispatcherSubscription,
        batch_size: usize,
    ) -> Self {
        let next_seq = from.clamp_start();
        let live_start = live.position();
        let phase = if next_seq > live_start {
            CatchUpPhase::Live
        } else {
            CatchUpPhase::CatchingUp
        };

        Self {
            phase,
            store,
            next_seq,
            live_start,
            live,
            batch_size: batch_size.max(1),
            buffer: VecDeque::new(),
            stream_filter: None,
        }
    }

    /// Only yield events of one stream.
    pub fn with_filter(mut self, stream_id: StreamId) -> Self {
        self.stream_filter = Some(stream_id);
        self
    }

    /// Gets the next event.
    pub async fn next(&mut self) -> Option<Result<Arc<RecordedEvent>>> {
        loop {
            match self.phase {
                CatchUpPhase::CatchingUp => {
                    if let Some(event) = self.buffer.pop_front() {
                        self.next_seq = event.global_seq.next();
                        if !self.passes_filter(&event) {
                            continue;
                        }
                        return Some(Ok(event));
                    }

                    if self.next_seq > self.live_start {
                        self.phase = CatchUpPhase::Live;
                        continue;
                    }

                    let remaining = (self.live_start.as_raw() - self.next_seq.as_raw() + 1) as usize;
                    let limit = remaining.min(self.batch_size);
                    let cancel = CancellationToken::new();
                    let buffer = &mut self.buffer;
                    let read = self
                        .store
                        .read(self.next_seq, ReadCount::Limited(limit), &cancel, &mut |event| {
                            buffer.push_back(Arc::new(event))
                        })
                        .await;

                    match read {
                        Ok(0) => self.phase = CatchUpPhase::Live,
                        Ok(_) => {}
                        Err(e) => {
                            self.phase = CatchUpPhase::Ended;
                            return Some(Err(e));
                        }
                    }
                }

                CatchUpPhase::Live => match self.live.next().await {
                    Some(Ok(event)) => {
                        // Already served from the store
                        if event.global_seq < self.next_seq {
                            continue;
                        }
                        self.next_seq = event.global_seq.next();
                        if !self.passes_filter(&event) {
                            continue;
                        }
                        return Some(Ok(event));
                    }
                    Some(Err(e)) => return Some(Err(e)),
                    None => {
                        self.phase = CatchUpPhase::Ended;
                        return None;
                    }
                },

                CatchUpPhase::Ended => return None,
            }
        }
    }

    /// Returns whether the subscription is in the live phase.
    pub fn is_live(&self) -> bool {
        matches!(self.phase, CatchUpPhase::Live)
    }

    /// The next global sequence this subscription will yield.
    pub fn current_position(&self) -> GlobalSeq {
        self.next_seq
    }

    fn passes_filter(&self, event: &RecordedEvent) -> bool {
        self.stream_filter
            .as_ref()
            .map_or(true, |filter| &event.stream_id == filter)
    }
}

// =============================================================================
// Projection Subscription
// =============================================================================

/// A message delivered to a projection stream subscriber.
#[derive(Debug, Clone)]
pub enum ProjectionMessage {
    /// The next event of the projection stream.
    Event {
        /// Position within the projection stream.
        projection_seq: ProjectionSeq,
        /// The underlying log event.
        event: Arc<RecordedEvent>,
    },

    /// The subscriber was already current; live events follow.
    CaughtUp {
        /// The projection stream's sequence at subscription time.
        projection_seq: ProjectionSeq,
    },

    /// Replay is complete; live events follow.
    ReplayFinished {
        /// The last replayed projection sequence.
        projection_seq: ProjectionSeq,
    },

    /// The projection stream restarted or stopped. Resubscribe from the last
    /// received sequence to keep receiving events.
    Unsubscribed,
}

/// A subscription to one projection stream.
pub struct ProjectionSubscription {
    receiver: mpsc::Receiver<ProjectionMessage>,
}

impl ProjectionSubscription {
    pub(crate) fn new(receiver: mpsc::Receiver<ProjectionMessage>) -> Self {
        Self { receiver }
    }

    /// Receives the next message; `None` once the stream dropped this subscriber.
    pub async fn next(&mut self) -> Option<ProjectionMessage> {
        self.receiver.recv().await
    }

    /// Receives the next message without waiting.
    pub fn try_next(&mut self) -> Option<ProjectionMessage> {
        self.receiver.try_recv().ok()
    }
}

impl Stream for ProjectionSubscription {
    type Item = ProjectionMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

// =============================================================================
// Tests
// =============================================================================
