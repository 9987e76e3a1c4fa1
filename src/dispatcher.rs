//! # Global Dispatcher
//!
//! Turns "persisted, notified in any order" into "published in strict global
//! order, gap-free, exactly once" for every downstream consumer.
//!
//! Concurrent writers commit in sequence order but their notifications can
//! arrive out of order. The dispatcher keeps a cursor (the last sequence it
//! published) and defers anything that arrives early. If a gap stays open for
//! `recovery_delay`, the missing range is read from the store.
//!
//! ## State Machine
//!
//! ```text
//!   AwaitingInitialSequence ──(highest seq from store)──► Ready
//!                                                          │  ▲
//!                              recovery timer fired        │  │ read complete,
//!                                                          ▼  │ cursor = first_seen - 1
//!                                                       Recovering
//! ```
//!
//! In `Ready`, for a persisted event `g`:
//!
//! | Condition        | Action                                                     |
//! |------------------|------------------------------------------------------------|
//! | `g == cursor+1`  | publish; if a recovery timer is pending, cancel it and re-inject deferred events |
//! | `g > cursor+1`   | defer; arm the timer (once) and track the lowest `g` past the gap |
//! | `g <= cursor`    | stale duplicate, ignore                                    |
//!
//! Deferred events are re-injected ahead of the mailbox, so they are always
//! handled before anything newer.
//!
//! ## Failure
//!
//! A store error during recovery is fatal to the current instance: deferred
//! state is dropped, the broadcast channel is replaced (subscribers observe
//! closure and must resubscribe) and the dispatcher starts over from
//! `AwaitingInitialSequence`.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{DispatcherConfig, MAILBOX_SIZE};
use crate::error::{Error, Result};
use crate::store::EventStore;
use crate::subscription::DispatcherSubscription;
use crate::types::{GlobalSeq, ReadCount, RecordedEvent};

// =============================================================================
// Messages and State
// =============================================================================

enum DispatcherMessage {
    Persisted(Arc<RecordedEvent>),
    Subscribe(oneshot::Sender<DispatcherSubscription>),
    Shutdown(oneshot::Sender<()>),
}

/// Lifecycle state of the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    /// Waiting for the store's highest global sequence.
    AwaitingInitialSequence,
    /// Publishing in order; a gap may be open.
    Ready,
    /// Reading a missing range from the store.
    Recovering,
}

struct Dispatcher {
    store: Arc<dyn EventStore>,
    config: DispatcherConfig,
    state: DispatcherState,

    /// Last published global sequence.
    cursor: GlobalSeq,
    /// Lowest sequence seen beyond the open gap.
    first_seen_after_gap: Option<GlobalSeq>,
    recovery_deadline: Option<Instant>,

    /// Events that arrived ahead of the cursor.
    deferred: Vec<Arc<RecordedEvent>>,
    /// Deferred events put back for processing before the mailbox.
    reinjected: VecDeque<Arc<RecordedEvent>>,

    sender: broadcast::Sender<Arc<RecordedEvent>>,
    position: watch::Sender<GlobalSeq>,
    state_tx: watch::Sender<DispatcherState>,
}

impl Dispatcher {
    fn set_state(&mut self, state: DispatcherState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "dispatcher state change");
            self.state = state;
            self.state_tx.send_replace(state);
        }
    }

    async fn load_initial_sequence(&mut self) {
        loop {
            match self.store.read_highest_global_sequence().await {
                Ok(seq) => {
                    self.cursor = seq;
                    self.position.send_replace(seq);
                    self.set_state(DispatcherState::Ready);
                    debug!(cursor = %seq, "dispatcher cursor initialized");
                    return;
                }
                Err(e) => {
                    error!(error = %e, "failed to read highest global sequence");
                    sleep(self.config.recovery_delay).await;
                }
            }
        }
    }

    fn on_persisted(&mut self, event: Arc<RecordedEvent>) {
        let g = event.global_seq;

        if g <= self.cursor {
            debug!(seq = %g, cursor = %self.cursor, "ignoring stale notification");
            return;
        }

        if g == self.cursor.next() {
            publish(&mut self.cursor, &self.sender, &self.position, event);
            if self.recovery_deadline.take().is_some() {
                self.first_seen_after_gap = None;
                self.reinject_deferred();
            }
            return;
        }

        self.deferred.push(event);
        match self.first_seen_after_gap {
            None => {
                self.first_seen_after_gap = Some(g);
                self.recovery_deadline = Some(Instant::now() + self.config.recovery_delay);
                debug!(cursor = %self.cursor, seen = %g, "gap detected, recovery timer armed");
            }
            Some(first) if g < first => self.first_seen_after_gap = Some(g),
            Some(_) => {}
        }
    }

    fn reinject_deferred(&mut self) {
        for event in self.deferred.drain(..).rev() {
            self.reinjected.push_front(event);
        }
    }

    /// Reads `[cursor + 1, first_seen_after_gap)` from the store and publishes it.
    async fn recover(&mut self) {
        self.recovery_deadline = None;
        let Some(first_seen) = self.first_seen_after_gap.take() else {
            return;
        };

        self.set_state(DispatcherState::Recovering);
        let from = self.cursor.next();
        let count = (first_seen.as_raw() - from.as_raw()).max(0) as usize;
        debug!(from = %from, count, "recovering gap from store");

        let store = self.store.clone();
        let cancel = CancellationToken::new();
        let cursor = &mut self.cursor;
        let sender = &self.sender;
        let position = &self.position;
        let result = store
            .read(from, ReadCount::Limited(count), &cancel, &mut |event| {
                if event.global_seq > *cursor && event.global_seq < first_seen {
                    publish(cursor, sender, position, Arc::new(event));
                }
            })
            .await;

        match result {
            Ok(read) => {
                if read < count {
                    warn!(
                        from = %from,
                        expected = count,
                        read,
                        "store returned fewer events than the gap; treating the rest as holes"
                    );
                }
                let end = GlobalSeq::from_raw(first_seen.as_raw() - 1);
                if end > self.cursor {
                    self.cursor = end;
                    self.position.send_replace(end);
                }
                self.set_state(DispatcherState::Ready);
                self.reinject_deferred();
            }
            Err(e) => {
                error!(error = %e, from = %from, count, "gap recovery failed, restarting dispatcher");
                self.restart();
            }
        }
    }

    /// Drops all in-flight state and closes the current broadcast channel.
    fn restart(&mut self) {
        self.deferred.clear();
        self.reinjected.clear();
        self.first_seen_after_gap = None;
        self.recovery_deadline = None;
        let (sender, _) = broadcast::channel(self.config.broadcast_capacity);
        self.sender = sender;
        self.set_state(DispatcherState::AwaitingInitialSequence);
    }
}

fn publish(
    cursor: &mut GlobalSeq,
    sender: &broadcast::Sender<Arc<RecordedEvent>>,
    position: &watch::Sender<GlobalSeq>,
    event: Arc<RecordedEvent>,
) {
    *cursor = event.global_seq;
    // No receivers is fine.
    let _ = sender.send(event);
    position.send_replace(*cursor);
}

async fn run_dispatcher(mut dispatcher: Dispatcher, mut rx: mpsc::Receiver<DispatcherMessage>) {
    info!("dispatcher started");

    loop {
        if dispatcher.state == DispatcherState::AwaitingInitialSequence {
            dispatcher.load_initial_sequence().await;
        }

        let message = match dispatcher.reinjected.pop_front() {
            Some(event) => DispatcherMessage::Persisted(event),
            None => {
                let deadline = dispatcher.recovery_deadline;
                tokio::select! {
                    biased;
                    _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                        dispatcher.recover().await;
                        continue;
                    }
                    message = rx.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                }
            }
        };

        match message {
            DispatcherMessage::Persisted(event) => dispatcher.on_persisted(event),
            DispatcherMessage::Subscribe(reply) => {
                let subscription =
                    DispatcherSubscription::new(dispatcher.sender.subscribe(), dispatcher.cursor);
                let _ = reply.send(subscription);
            }
            DispatcherMessage::Shutdown(done) => {
                let _ = done.send(());
                break;
            }
        }
    }

    info!(cursor = %dispatcher.cursor, "dispatcher stopped");
}

// =============================================================================
// Dispatcher Handle
// =============================================================================

/// Async handle to the dispatcher task.
#[derive(Clone)]
pub struct DispatcherHandle {
    tx: mpsc::Sender<DispatcherMessage>,
    position: watch::Receiver<GlobalSeq>,
    state: watch::Receiver<DispatcherState>,
}

impl DispatcherHandle {
    /// Reports persisted events. Any order, duplicates allowed.
    pub async fn notify(&self, events: Vec<RecordedEvent>) -> Result<()> {
        for event in events {
            self.tx
                .send(DispatcherMessage::Persisted(Arc::new(event)))
                .await
                .map_err(|_| Error::Closed("dispatcher"))?;
        }
        Ok(())
    }

    /// Subscribes to published events.
    ///
    /// The returned subscription carries the cursor at subscription time and
    /// yields exactly the events after it.
    pub async fn subscribe(&self) -> Result<DispatcherSubscription> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(DispatcherMessage::Subscribe(reply_tx))
            .await
            .map_err(|_| Error::Closed("dispatcher"))?;
        reply_rx.await.map_err(|_| Error::Closed("dispatcher"))
    }

    /// The last published global sequence.
    pub fn position(&self) -> GlobalSeq {
        *self.position.borrow()
    }

    /// A watch on the last published global sequence.
    pub fn watch_position(&self) -> watch::Receiver<GlobalSeq> {
        self.position.clone()
    }

    /// Current state of the dispatcher.
    pub fn state(&self) -> DispatcherState {
        *self.state.borrow()
    }

    /// Waits until everything up to `seq` has been published.
    pub async fn wait_for(&self, seq: GlobalSeq) -> Result<()> {
        let mut position = self.position.clone();
        position
            .wait_for(|p| *p >= seq)
            .await
            .map(|_| ())
            .map_err(|_| Error::Closed("dispatcher"))
    }

    /// Stops the dispatcher. Subscribers observe their channel closing.
    pub async fn shutdown(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(DispatcherMessage::Shutdown(done_tx))
            .await
            .map_err(|_| Error::Closed("dispatcher"))?;
        done_rx.await.map_err(|_| Error::Closed("dispatcher"))
    }
}

/// Spawns the dispatcher on the current runtime.
pub fn spawn_dispatcher(store: Arc<dyn EventStore>, config: DispatcherConfig) -> DispatcherHandle {
    let (tx, rx) = mpsc::channel(MAILBOX_SIZE);
    let (position_tx, position_rx) = watch::channel(GlobalSeq::ZERO);
    let (state_tx, state_rx) = watch::channel(DispatcherState::AwaitingInitialSequence);
    let (sender, _) = broadcast::channel(config.broadcast_capacity);

    let dispatcher = Dispatcher {
        store,
        config,
        state: DispatcherState::AwaitingInitialSequence,
        cursor: GlobalSeq::ZERO,
        first_seen_after_gap: None,
        recovery_deadline: None,
        deferred: Vec::new(),
        reinjected: VecDeque::new(),
        sender,
        position: position_tx,
        state_tx,
    };
    tokio::spawn(run_dispatcher(dispatcher, rx));

    DispatcherHandle {
        tx,
        position: position_rx,
        state: state_rx,
    }
}

// =============================================================================
// Tests
// =============================================================================
