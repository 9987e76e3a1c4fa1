//! # Projection Stream Actor
//!
//! One task per query. It follows the dispatcher, numbers every matching
//! event with a dense projection sequence, and fans the result out to its
//! subscribers.
//!
//! ## Startup
//!
//! ```text
//! Uninitialized ──► ReplayFromIndex ──► ReplayFromEvents ──► Ready
//!                   (index tip H at      (log from g_H + 1 up to
//!                    global g_H)          the dispatcher cursor)
//! ```
//!
//! The dispatcher subscription is taken *before* the index is read, so
//! nothing published during the replay is lost: live events at or below the
//! checkpoint are skipped, anything beyond is applied in order.
//!
//! ## Numbering
//!
//! For every event the checkpoint advances. For a matching event the
//! projection sequence advances, and an index entry is enqueued only when the
//! sequence is beyond what was already indexed.
//!
//! ## Subscribers
//!
//! A subscriber that is already current gets `CaughtUp` and live events.
//! Anyone behind gets a replay worker; live events for it are held back
//! until the worker reports. `ReplayFinished` and the held events then go
//! out through a backlog task that waits for channel space, so a slow reader
//! never loses the handoff. The subscriber turns live once a backlog task
//! finds nothing more held.
//!
//! Live delivery never waits. One slot of every subscriber channel stays
//! free for `Unsubscribed`, so a live subscriber that falls a full buffer
//! behind is told to resubscribe before it is dropped.
//!
//! ## Rebuild
//!
//! An inconsistency (from a replay worker or the index writer) cancels all
//! workers, tells every subscriber `Unsubscribed`, clears the stored index
//! and checkpoint, and starts over from an empty projection. After
//! `max_rebuilds` consecutive rebuilds without live progress the stream
//! stops.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ProjectionConfig, MAILBOX_SIZE};
use crate::dispatcher::DispatcherHandle;
use crate::error::{Error, Result};
use crate::projection::persistence::{CheckpointWriterHandle, FaultSender, IndexWriterHandle};
use crate::projection::query::ProjectionStreamQuery;
use crate::projection::replay::{replay_to_subscriber, ReplayTarget};
use crate::store::EventStore;
use crate::subscription::{DispatcherSubscription, ProjectionMessage, ProjectionSubscription};
use crate::types::{GlobalSeq, IndexEntry, ProjectionSeq, ProjectionStreamId, ReadCount, RecordedEvent};

// =============================================================================
// Public State
// =============================================================================

/// Lifecycle state of a projection stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectionState {
    /// Not started, or restarting.
    Uninitialized,
    /// Loading the index tip and checkpoint.
    ReplayFromIndex,
    /// Re-deriving sequences from the log.
    ReplayFromEvents,
    /// Following the dispatcher.
    Ready,
    /// Gave up after too many rebuilds, or shut down.
    Stopped,
}

/// Snapshot of a projection stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectionStatus {
    /// Lifecycle state.
    pub state: ProjectionState,
    /// Last assigned projection sequence.
    pub projection_seq: ProjectionSeq,
    /// Last global sequence seen, matching or not.
    pub checkpoint: GlobalSeq,
    /// Highest projection sequence handed to the index writer.
    pub last_indexed: ProjectionSeq,
    /// Connected subscribers.
    pub subscribers: usize,
    /// Consecutive rebuilds so far.
    pub rebuilds: u32,
}

/// Everything a projection stream needs besides its query.
#[derive(Clone)]
pub struct ProjectionContext {
    /// The event store.
    pub store: Arc<dyn EventStore>,
    /// Source of live events.
    pub dispatcher: DispatcherHandle,
    /// Shared index writer.
    pub index: IndexWriterHandle,
    /// Shared checkpoint writer.
    pub checkpoints: CheckpointWriterHandle,
    /// Tuning.
    pub config: ProjectionConfig,
}

// =============================================================================
// Actor
// =============================================================================

enum StreamCommand {
    Subscribe {
        last_known: ProjectionSeq,
        reply: oneshot::Sender<ProjectionSubscription>,
    },
    Status(oneshot::Sender<ProjectionStatus>),
    ReplayDone {
        subscriber: u64,
        result: Result<ProjectionSeq>,
    },
    BacklogDelivered {
        subscriber: u64,
        result: Result<()>,
    },
    Shutdown(oneshot::Sender<()>),
}

enum Delivery {
    Live,
    /// A replay worker or backlog task owns the channel; live messages wait here.
    Replaying(Vec<ProjectionMessage>),
}

struct Subscriber {
    id: u64,
    sender: mpsc::Sender<ProjectionMessage>,
    delivery: Delivery,
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

struct ProjectionStream {
    query: Arc<ProjectionStreamQuery>,
    ctx: ProjectionContext,
    commands: mpsc::WeakSender<StreamCommand>,
    stop: CancellationToken,

    faults: FaultSender,
    fault_rx: mpsc::UnboundedReceiver<Error>,

    state: ProjectionState,
    projection_seq: ProjectionSeq,
    checkpoint: GlobalSeq,
    last_indexed: ProjectionSeq,
    live: Option<DispatcherSubscription>,

    subscribers: Vec<Subscriber>,
    next_subscriber: u64,
    /// Cancels replay workers; replaced on every reset.
    workers: CancellationToken,

    rebuilds: u32,
    needs_clear: bool,
}

impl ProjectionStream {
    fn id(&self) -> &ProjectionStreamId {
        self.query.id()
    }

    fn inconsistent(&self, reason: String) -> Error {
        Error::InconsistentProjection {
            projection_id: self.id().to_string(),
            reason,
        }
    }

    fn set_state(&mut self, state: ProjectionState) {
        if self.state != state {
            debug!(projection = %self.query.id(), from = ?self.state, to = ?state, "projection state change");
            self.state = state;
        }
    }

    fn status(&self) -> ProjectionStatus {
        ProjectionStatus {
            state: self.state,
            projection_seq: self.projection_seq,
            checkpoint: self.checkpoint,
            last_indexed: self.last_indexed,
            subscribers: self.subscribers.len(),
            rebuilds: self.rebuilds,
        }
    }

    /// Loads the position from the index tip and catches up to the dispatcher.
    ///
    /// The stored checkpoint is advisory here. Index flushes can lag
    /// checkpoint flushes, so resuming past the index tip could skip a
    /// matching event that was never indexed and renumber the rest.
    async fn start(&mut self) -> Result<()> {
        self.set_state(ProjectionState::Uninitialized);
        let id = self.id().clone();

        if self.needs_clear {
            self.ctx.index.discard(&id).await?;
            self.ctx.checkpoints.discard(&id).await?;
            self.ctx.store.clear_projection_index(&id).await?;
            // Faults raised before the clear belong to the old numbering
            while self.fault_rx.try_recv().is_ok() {}
            self.needs_clear = false;
            info!(projection = %id, "projection index cleared");
        } else {
            self.ctx.index.flush().await?;
            self.ctx.checkpoints.flush().await?;
        }

        let live = self.ctx.dispatcher.subscribe().await?;
        let head = live.position();
        self.live = Some(live);

        self.set_state(ProjectionState::ReplayFromIndex);
        let tip = self.ctx.store.read_highest_projection_entry(&id).await?;
        let stored_checkpoint = self.ctx.store.read_projection_checkpoint(&id).await?;
        (self.projection_seq, self.checkpoint) = tip.map_or((ProjectionSeq::NONE, GlobalSeq::ZERO), |e| {
            (e.projection_seq, e.global_seq)
        });
        self.last_indexed = self.projection_seq;

        if self.checkpoint > head {
            return Err(self.inconsistent(format!(
                "index references {} beyond the log head {}",
                self.checkpoint, head
            )));
        }
        debug!(
            projection = %id,
            projection_seq = %self.projection_seq,
            index_checkpoint = %self.checkpoint,
            stored_checkpoint = %stored_checkpoint,
            "loaded projection position"
        );

        self.set_state(ProjectionState::ReplayFromEvents);
        self.catch_up(head).await?;

        self.set_state(ProjectionState::Ready);
        info!(
            projection = %id,
            projection_seq = %self.projection_seq,
            checkpoint = %self.checkpoint,
            "projection stream ready"
        );
        Ok(())
    }

    /// Applies everything in the log after the checkpoint up to `until`.
    async fn catch_up(&mut self, until: GlobalSeq) -> Result<()> {
        let page_size = self.ctx.config.replay_page_size.max(1);

        while self.checkpoint < until {
            let remaining = (until.as_raw() - self.checkpoint.as_raw()) as usize;
            let mut page = Vec::new();
            self.ctx
                .store
                .read(
                    self.checkpoint.next(),
                    ReadCount::Limited(remaining.min(page_size)),
                    &self.stop,
                    &mut |event| page.push(event),
                )
                .await?;
            if self.stop.is_cancelled() {
                return Err(Error::Canceled);
            }

            if page.is_empty() {
                // Holes at the end of the range never fill in
                self.checkpoint = until;
                self.enqueue_checkpoint();
                break;
            }
            for event in page {
                self.apply(Arc::new(event));
            }
        }
        Ok(())
    }

    fn enqueue_checkpoint(&self) {
        if let Err(e) = self.ctx.checkpoints.enqueue(self.id().clone(), self.checkpoint) {
            debug!(projection = %self.query.id(), error = %e, "checkpoint not enqueued");
        }
    }

    fn apply(&mut self, event: Arc<RecordedEvent>) {
        self.checkpoint = event.global_seq;
        self.enqueue_checkpoint();

        if !self.query.matches(&event) {
            return;
        }

        self.projection_seq = self.projection_seq.next();
        if self.projection_seq > self.last_indexed {
            let entry = IndexEntry {
                projection_seq: self.projection_seq,
                global_seq: event.global_seq,
            };
            if let Err(e) = self.ctx.index.enqueue(self.id().clone(), entry, self.faults.clone()) {
                debug!(projection = %self.query.id(), error = %e, "index entry not enqueued");
            }
            self.last_indexed = self.projection_seq;
        }

        self.publish(ProjectionMessage::Event {
            projection_seq: self.projection_seq,
            event,
        });
    }

    fn publish(&mut self, message: ProjectionMessage) {
        let query = &self.query;
        self.subscribers.retain_mut(|sub| match &mut sub.delivery {
            Delivery::Replaying(pending) => {
                pending.push(message.clone());
                true
            }
            Delivery::Live => {
                if sub.sender.capacity() <= 1 {
                    warn!(projection = %query.id(), subscriber = sub.id, "projection subscriber is full, dropping it");
                    let _ = sub.sender.try_send(ProjectionMessage::Unsubscribed);
                    return false;
                }
                sub.sender.try_send(message.clone()).is_ok()
            }
        });
    }

    async fn on_live(&mut self, event: Arc<RecordedEvent>) -> Result<()> {
        if event.global_seq <= self.checkpoint {
            return Ok(());
        }
        if event.global_seq > self.checkpoint.next() {
            debug!(
                projection = %self.query.id(),
                checkpoint = %self.checkpoint,
                received = %event.global_seq,
                "projection behind live event, reading from store"
            );
            self.catch_up(GlobalSeq::from_raw(event.global_seq.as_raw() - 1)).await?;
        }
        if event.global_seq > self.checkpoint {
            self.apply(event);
        }
        self.rebuilds = 0;
        Ok(())
    }

    async fn resubscribe(&mut self) -> Result<()> {
        self.live = None;
        let live = self.ctx.dispatcher.subscribe().await?;
        let head = live.position();
        self.live = Some(live);
        self.catch_up(head).await
    }

    /// Handles a mailbox command. Returns an inconsistency that requires a rebuild.
    fn handle(&mut self, command: StreamCommand) -> Option<Error> {
        match command {
            StreamCommand::Subscribe { last_known, reply } => {
                let subscription = self.subscribe(last_known);
                let _ = reply.send(subscription);
                None
            }
            StreamCommand::Status(reply) => {
                let _ = reply.send(self.status());
                None
            }
            StreamCommand::ReplayDone { subscriber, result } => self.on_replay_done(subscriber, result),
            StreamCommand::BacklogDelivered { subscriber, result } => {
                self.on_backlog_delivered(subscriber, result);
                None
            }
            // Handled by the run loop
            StreamCommand::Shutdown(done) => {
                let _ = done.send(());
                None
            }
        }
    }

    fn subscribe(&mut self, last_known: ProjectionSeq) -> ProjectionSubscription {
        // The extra slot is kept for `Unsubscribed`
        let (sender, receiver) = mpsc::channel(self.ctx.config.subscriber_buffer.max(1) + 1);
        let id = self.next_subscriber;
        self.next_subscriber += 1;

        if last_known >= self.projection_seq {
            let _ = sender.try_send(ProjectionMessage::CaughtUp {
                projection_seq: self.projection_seq,
            });
            self.subscribers.push(Subscriber {
                id,
                sender,
                delivery: Delivery::Live,
            });
            return ProjectionSubscription::new(receiver);
        }

        let Some(commands) = self.commands.upgrade() else {
            return ProjectionSubscription::new(receiver);
        };
        let target = ReplayTarget {
            last_known,
            projection_seq: self.projection_seq,
            checkpoint: self.checkpoint,
        };
        debug!(projection = %self.query.id(), subscriber = id, from = %last_known, to = %target.projection_seq, "starting replay");

        let store = self.ctx.store.clone();
        let query = self.query.clone();
        let page_size = self.ctx.config.replay_page_size;
        let cancel = self.workers.child_token();
        let worker_sender = sender.clone();
        tokio::spawn(async move {
            let result =
                replay_to_subscriber(store, query, target, page_size, worker_sender, cancel).await;
            let _ = commands
                .send(StreamCommand::ReplayDone {
                    subscriber: id,
                    result,
                })
                .await;
        });

        self.subscribers.push(Subscriber {
            id,
            sender,
            delivery: Delivery::Replaying(Vec::new()),
        });
        ProjectionSubscription::new(receiver)
    }

    fn on_replay_done(&mut self, subscriber: u64, result: Result<ProjectionSeq>) -> Option<Error> {
        // Gone already, or from before a reset
        let pos = self.subscribers.iter().position(|s| s.id == subscriber)?;

        match result {
            Ok(replayed) => {
                let held = match &mut self.subscribers[pos].delivery {
                    Delivery::Replaying(held) => std::mem::take(held),
                    Delivery::Live => Vec::new(),
                };
                let mut backlog = Vec::with_capacity(held.len() + 1);
                backlog.push(ProjectionMessage::ReplayFinished {
                    projection_seq: replayed,
                });
                backlog.extend(held);

                let sub = &mut self.subscribers[pos];
                sub.delivery = Delivery::Replaying(Vec::new());
                let sender = sub.sender.clone();
                self.spawn_backlog(subscriber, sender, backlog);
                None
            }
            Err(Error::Closed(_)) | Err(Error::Canceled) => {
                self.subscribers.remove(pos);
                None
            }
            Err(e @ Error::InconsistentProjection { .. }) => Some(e),
            Err(e) => {
                warn!(projection = %self.query.id(), subscriber, error = %e, "replay failed");
                let sub = self.subscribers.remove(pos);
                let _ = sub.sender.try_send(ProjectionMessage::Unsubscribed);
                None
            }
        }
    }

    /// Sends `messages` in order, waiting for the subscriber to make room.
    fn spawn_backlog(&self, subscriber: u64, sender: mpsc::Sender<ProjectionMessage>, messages: Vec<ProjectionMessage>) {
        let Some(commands) = self.commands.upgrade() else {
            return;
        };
        let cancel = self.workers.child_token();
        tokio::spawn(async move {
            let result = deliver_backlog(&sender, messages, &cancel).await;
            drop(sender);
            let _ = commands
                .send(StreamCommand::BacklogDelivered { subscriber, result })
                .await;
        });
    }

    fn on_backlog_delivered(&mut self, subscriber: u64, result: Result<()>) {
        let Some(pos) = self.subscribers.iter().position(|s| s.id == subscriber) else {
            return;
        };
        if result.is_err() {
            self.subscribers.remove(pos);
            return;
        }

        let sub = &mut self.subscribers[pos];
        let held = match &mut sub.delivery {
            Delivery::Replaying(held) => std::mem::take(held),
            Delivery::Live => return,
        };
        if held.is_empty() {
            debug!(projection = %self.query.id(), subscriber, "subscriber is live");
            sub.delivery = Delivery::Live;
            return;
        }
        let sender = sub.sender.clone();
        self.spawn_backlog(subscriber, sender, held);
    }

    /// Cancels workers and tells every subscriber to come back later.
    ///
    /// A subscriber whose channel a replay worker filled may only see the
    /// channel close; that means the same as `Unsubscribed`.
    fn drop_subscribers(&mut self) {
        self.workers.cancel();
        self.workers = CancellationToken::new();
        for sub in self.subscribers.drain(..) {
            let _ = sub.sender.try_send(ProjectionMessage::Unsubscribed);
        }
    }

    fn rebuild(&mut self, reason: Error) -> Flow {
        self.rebuilds += 1;
        warn!(
            projection = %self.query.id(),
            error = %reason,
            attempt = self.rebuilds,
            "rebuilding projection stream"
        );

        self.drop_subscribers();
        self.live = None;
        self.projection_seq = ProjectionSeq::NONE;
        self.checkpoint = GlobalSeq::ZERO;
        self.last_indexed = ProjectionSeq::NONE;
        self.needs_clear = true;

        if self.rebuilds > self.ctx.config.max_rebuilds {
            error!(
                projection = %self.query.id(),
                rebuilds = self.rebuilds,
                "projection keeps diverging from the log, stopping"
            );
            return Flow::Stop;
        }
        Flow::Continue
    }

    async fn on_failure(&mut self, err: Error) -> Flow {
        match err {
            Error::InconsistentProjection { .. } => self.rebuild(err),
            Error::Canceled => Flow::Stop,
            Error::Closed(what) => {
                error!(projection = %self.query.id(), "{} has shut down, stopping projection stream", what);
                Flow::Stop
            }
            err => {
                warn!(projection = %self.query.id(), error = %err, "projection stream failed, restarting");
                self.drop_subscribers();
                self.live = None;
                sleep(self.ctx.config.retry_delay).await;
                Flow::Continue
            }
        }
    }

    async fn close(&mut self) {
        self.drop_subscribers();
        self.live = None;
        self.set_state(ProjectionState::Stopped);

        if self.needs_clear {
            let _ = self.ctx.index.discard(self.query.id()).await;
            let _ = self.ctx.checkpoints.discard(self.query.id()).await;
        } else {
            let _ = self.ctx.index.flush().await;
            let _ = self.ctx.checkpoints.flush().await;
        }
    }
}

async fn deliver_backlog(
    sender: &mpsc::Sender<ProjectionMessage>,
    messages: Vec<ProjectionMessage>,
    cancel: &CancellationToken,
) -> Result<()> {
    for message in messages {
        tokio::select! {
            sent = sender.send(message) => sent.map_err(|_| Error::Closed("projection subscriber"))?,
            _ = cancel.cancelled() => return Err(Error::Canceled),
        }
    }
    Ok(())
}

async fn next_live(live: &mut Option<DispatcherSubscription>) -> Option<Result<Arc<RecordedEvent>>> {
    match live {
        Some(subscription) => subscription.next().await,
        None => std::future::pending().await,
    }
}

async fn run_projection_stream(mut stream: ProjectionStream, mut rx: mpsc::Receiver<StreamCommand>) {
    info!(projection = %stream.query.id(), query = %stream.query, "projection stream started");

    let mut ready = false;
    let mut shutdown: Option<oneshot::Sender<()>> = None;

    loop {
        if !ready {
            match stream.start().await {
                Ok(()) => ready = true,
                Err(e) => {
                    if stream.on_failure(e).await == Flow::Stop {
                        break;
                    }
                    continue;
                }
            }
        }

        tokio::select! {
            biased;
            command = rx.recv() => match command {
                None => break,
                Some(StreamCommand::Shutdown(done)) => {
                    shutdown = Some(done);
                    break;
                }
                Some(command) => {
                    if let Some(reason) = stream.handle(command) {
                        ready = false;
                        if stream.rebuild(reason) == Flow::Stop {
                            break;
                        }
                    }
                }
            },
            Some(reason) = stream.fault_rx.recv() => {
                ready = false;
                if stream.rebuild(reason) == Flow::Stop {
                    break;
                }
            }
            event = next_live(&mut stream.live) => {
                let result = match event {
                    Some(Ok(event)) => stream.on_live(event).await,
                    Some(Err(e)) => {
                        warn!(projection = %stream.query.id(), error = %e, "projection stream lagged, resubscribing");
                        stream.resubscribe().await
                    }
                    None => {
                        warn!(projection = %stream.query.id(), "dispatcher subscription closed, resubscribing");
                        stream.resubscribe().await
                    }
                };
                if let Err(e) = result {
                    ready = false;
                    if stream.on_failure(e).await == Flow::Stop {
                        break;
                    }
                }
            }
        }
    }

    stream.close().await;

    // Answer anyone still waiting
    rx.close();
    while let Ok(command) = rx.try_recv() {
        if let StreamCommand::Shutdown(done) = command {
            let _ = done.send(());
        }
    }
    if let Some(done) = shutdown {
        let _ = done.send(());
    }

    info!(
        projection = %stream.query.id(),
        projection_seq = %stream.projection_seq,
        checkpoint = %stream.checkpoint,
        "projection stream stopped"
    );
}

// =============================================================================
// Handle
// =============================================================================

/// Async handle to a projection stream task.
#[derive(Clone)]
pub struct ProjectionStreamHandle {
    query: Arc<ProjectionStreamQuery>,
    tx: mpsc::Sender<StreamCommand>,
    stop: CancellationToken,
}

impl ProjectionStreamHandle {
    /// The projection stream id.
    pub fn id(&self) -> &ProjectionStreamId {
        self.query.id()
    }

    /// The query this stream evaluates.
    pub fn query(&self) -> &ProjectionStreamQuery {
        &self.query
    }

    /// Subscribes from just after `last_known` (use `ProjectionSeq::NONE` for everything).
    pub async fn subscribe(&self, last_known: ProjectionSeq) -> Result<ProjectionSubscription> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StreamCommand::Subscribe { last_known, reply })
            .await
            .map_err(|_| Error::Closed("projection stream"))?;
        rx.await.map_err(|_| Error::Closed("projection stream"))
    }

    /// Current position and state.
    pub async fn status(&self) -> Result<ProjectionStatus> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StreamCommand::Status(reply))
            .await
            .map_err(|_| Error::Closed("projection stream"))?;
        rx.await.map_err(|_| Error::Closed("projection stream"))
    }

    /// Returns true once the stream task has exited.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Stops the stream and flushes its pending index entries and checkpoint.
    pub async fn shutdown(&self) -> Result<()> {
        self.stop.cancel();
        let (done, rx) = oneshot::channel();
        if self.tx.send(StreamCommand::Shutdown(done)).await.is_err() {
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }
}

/// Spawns a projection stream for `query`.
pub fn spawn_projection_stream(query: ProjectionStreamQuery, ctx: ProjectionContext) -> ProjectionStreamHandle {
    let query = Arc::new(query);
    let (tx, rx) = mpsc::channel(MAILBOX_SIZE);
    let (faults, fault_rx) = mpsc::unbounded_channel();
    let stop = CancellationToken::new();

    let stream = ProjectionStream {
        query: query.clone(),
        ctx,
        commands: tx.downgrade(),
        stop: stop.clone(),
        faults,
        fault_rx,
        state: ProjectionState::Uninitialized,
        projection_seq: ProjectionSeq::NONE,
        checkpoint: GlobalSeq::ZERO,
        last_indexed: ProjectionSeq::NONE,
        live: None,
        subscribers: Vec::new(),
        next_subscriber: 0,
        workers: CancellationToken::new(),
        rebuilds: 0,
        needs_clear: false,
    };
    tokio::spawn(run_projection_stream(stream, rx));

    ProjectionStreamHandle { query, tx, stop }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatcherConfig;
    use crate::dispatcher::spawn_dispatcher;
    use crate::projection::persistence::{spawn_checkpoint_writer, spawn_index_writer};
    use crate::projection::query::Predicate;
    use crate::store::MemoryStore;
    use crate::types::{EventData, StreamId};
    use std::time::Duration;
    use tokio::time::timeout;

    struct Harness {
        store: Arc<MemoryStore>,
        ctx: ProjectionContext,
    }

    impl Harness {
        fn new(store: Arc<MemoryStore>) -> Self {
            Self::with_config(store, ProjectionConfig::default())
        }

        fn with_config(store: Arc<MemoryStore>, config: ProjectionConfig) -> Self {
            let dispatcher = spawn_dispatcher(store.clone(), DispatcherConfig::default());
            let ctx = ProjectionContext {
                store: store.clone(),
                dispatcher,
                index: spawn_index_writer(store.clone(), Duration::from_millis(5)),
                checkpoints: spawn_checkpoint_writer(store.clone(), Duration::from_millis(5)),
                config,
            };
            Self { store, ctx }
        }

        async fn append(&self, kinds: &[&str]) {
            let events = kinds
                .iter()
                .map(|kind| (StreamId::new("orders"), EventData::new(*kind, Vec::new())))
                .collect();
            let recorded = self.store.append_multi(events).await.unwrap();
            self.ctx.dispatcher.notify(recorded).await.unwrap();
        }

        fn spawn(&self) -> ProjectionStreamHandle {
            let query = ProjectionStreamQuery::new([Predicate::event_type("Placed")]).unwrap();
            spawn_projection_stream(query, self.ctx.clone())
        }
    }

    async fn recv(sub: &mut ProjectionSubscription) -> ProjectionMessage {
        timeout(Duration::from_secs(5), sub.next())
            .await
            .expect("timed out")
            .expect("subscription closed")
    }

    async fn recv_events(sub: &mut ProjectionSubscription, n: usize) -> Vec<(i64, i64)> {
        let mut out = Vec::new();
        while out.len() < n {
            if let ProjectionMessage::Event {
                projection_seq,
                event,
            } = recv(sub).await
            {
                out.push((projection_seq.as_raw(), event.global_seq.as_raw()));
            }
        }
        out
    }

    #[tokio::test]
    async fn test_live_subscriber() {
        let harness = Harness::new(Arc::new(MemoryStore::new()));
        let stream = harness.spawn();

        let mut sub = stream.subscribe(ProjectionSeq::NONE).await.unwrap();
        assert!(matches!(
            recv(&mut sub).await,
            ProjectionMessage::CaughtUp { projection_seq } if projection_seq == ProjectionSeq::NONE
        ));

        harness.append(&["Placed", "Shipped", "Placed"]).await;
        assert_eq!(recv_events(&mut sub, 2).await, vec![(1, 1), (2, 3)]);
    }

    #[tokio::test]
    async fn test_late_subscriber_is_replayed() {
        let harness = Harness::new(Arc::new(MemoryStore::new()));
        harness.append(&["Placed", "Shipped", "Placed", "Placed"]).await;
        let stream = harness.spawn();

        let status = stream.status().await.unwrap();
        assert_eq!(status.state, ProjectionState::Ready);
        assert_eq!(status.projection_seq, ProjectionSeq::from_raw(3));
        assert_eq!(status.checkpoint, GlobalSeq::from_raw(4));

        let mut sub = stream.subscribe(ProjectionSeq::from_raw(1)).await.unwrap();
        assert_eq!(recv_events(&mut sub, 2).await, vec![(2, 3), (3, 4)]);
        assert!(matches!(
            recv(&mut sub).await,
            ProjectionMessage::ReplayFinished { projection_seq } if projection_seq == ProjectionSeq::from_raw(3)
        ));

        harness.append(&["Placed"]).await;
        assert_eq!(recv_events(&mut sub, 1).await, vec![(4, 5)]);
    }

    #[tokio::test]
    async fn test_restart_keeps_numbering() {
        let store = Arc::new(MemoryStore::new());
        let harness = Harness::new(store.clone());
        harness.append(&["Placed", "Shipped", "Placed"]).await;

        let first = harness.spawn();
        assert_eq!(first.status().await.unwrap().projection_seq, ProjectionSeq::from_raw(2));
        first.shutdown().await.unwrap();
        assert_eq!(
            store.read_projection_checkpoint(first.id()).await.unwrap(),
            GlobalSeq::from_raw(3)
        );

        harness.append(&["Shipped", "Placed"]).await;
        let second = harness.spawn();
        let status = second.status().await.unwrap();
        assert_eq!(status.projection_seq, ProjectionSeq::from_raw(3));
        assert_eq!(status.last_indexed, ProjectionSeq::from_raw(3));

        let mut sub = second.subscribe(ProjectionSeq::NONE).await.unwrap();
        assert_eq!(recv_events(&mut sub, 3).await, vec![(1, 1), (2, 3), (3, 5)]);
    }

    #[tokio::test]
    async fn test_corrupt_index_triggers_rebuild() {
        let store = Arc::new(MemoryStore::new());
        let harness = Harness::new(store.clone());
        harness.append(&["Placed", "Shipped", "Placed"]).await;

        // Entry 1 points at the "Shipped" event
        let query = ProjectionStreamQuery::new([Predicate::event_type("Placed")]).unwrap();
        store
            .write_projection_index(query.id(), ProjectionSeq::NONE, &[GlobalSeq::from_raw(2)])
            .await
            .unwrap();

        let stream = harness.spawn();
        let mut sub = stream.subscribe(ProjectionSeq::NONE).await.unwrap();
        loop {
            if matches!(recv(&mut sub).await, ProjectionMessage::Unsubscribed) {
                break;
            }
        }

        let status = stream.status().await.unwrap();
        assert_eq!(status.rebuilds, 1);
        assert_eq!(status.projection_seq, ProjectionSeq::from_raw(2));

        let mut sub = stream.subscribe(ProjectionSeq::NONE).await.unwrap();
        assert_eq!(recv_events(&mut sub, 2).await, vec![(1, 1), (2, 3)]);
    }

    #[tokio::test]
    async fn test_full_live_subscriber_is_unsubscribed() {
        let config = ProjectionConfig {
            subscriber_buffer: 2,
            ..ProjectionConfig::default()
        };
        let harness = Harness::with_config(Arc::new(MemoryStore::new()), config);
        let stream = harness.spawn();

        let mut sub = stream.subscribe(ProjectionSeq::NONE).await.unwrap();
        harness.append(&["Placed", "Placed", "Placed", "Placed"]).await;
        let status = loop {
            let status = stream.status().await.unwrap();
            if status.projection_seq == ProjectionSeq::from_raw(4) {
                break status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        assert_eq!(status.subscribers, 0);

        assert!(matches!(recv(&mut sub).await, ProjectionMessage::CaughtUp { .. }));
        assert_eq!(recv_events(&mut sub, 1).await, vec![(1, 1)]);
        assert!(matches!(recv(&mut sub).await, ProjectionMessage::Unsubscribed));
        assert!(sub.next().await.is_none());

        // Coming back from the last received sequence replays the rest
        let mut sub = stream.subscribe(ProjectionSeq::from_raw(1)).await.unwrap();
        assert_eq!(recv_events(&mut sub, 3).await, vec![(2, 2), (3, 3), (4, 4)]);
    }

    #[tokio::test]
    async fn test_shutdown_unsubscribes() {
        let harness = Harness::new(Arc::new(MemoryStore::new()));
        let stream = harness.spawn();
        let mut sub = stream.subscribe(ProjectionSeq::NONE).await.unwrap();
        let _ = recv(&mut sub).await;

        stream.shutdown().await.unwrap();
        assert!(matches!(recv(&mut sub).await, ProjectionMessage::Unsubscribed));
        assert!(sub.next().await.is_none());
        assert!(stream.subscribe(ProjectionSeq::NONE).await.is_err());
    }
}
