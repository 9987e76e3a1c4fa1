//! # Eventide - Event Log Runtime
//!
//! Eventide is an append-only event log with an async runtime around it:
//!
//! - **Per-stream optimistic concurrency**: appends carry an expected sequence
//! - **Group commit**: a buffered writer batches concurrent writes into one transaction
//! - **Ordered dispatch**: every event is published once, in global order, without gaps
//! - **Projection streams**: dense, restart-stable numbering of the events a query matches
//! - **Pluggable storage**: SQLite and in-memory backends behind one trait
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Async API Layer                          │
//! │            (append, write, read, subscribe, projections)        │
//! └──────────────┬──────────────────────────────┬───────────────────┘
//!                │                              │
//!                ▼                              ▼
//! ┌──────────────────────────┐     ┌─────────────────────────────────┐
//! │     Buffered Writer      │     │           Dispatcher            │
//! │  (group commit, per-     │────►│  (reorders notifications,       │
//! │   request fallback)      │     │   recovers gaps from the store) │
//! └─────────────┬────────────┘     └───────────────┬─────────────────┘
//!               │                                  │ broadcast
//!               │                                  ▼
//!               │                  ┌─────────────────────────────────┐
//!               │                  │       Projection Streams        │
//!               │                  │  (query → dense sequence, index │
//!               │                  │   + checkpoint, replay workers) │
//!               │                  └───────────────┬─────────────────┘
//!               ▼                                  ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                EventStore (SQLite worker thread / memory)       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Durable ordering**: `global_seq` strictly increases, never reused
//! 2. **Stream correctness**: `stream_seq` strictly increases per stream, no gaps
//! 3. **Idempotency**: an event id is stored at most once across the whole log
//! 4. **Ordered delivery**: subscribers see global sequences strictly increasing, without gaps
//! 5. **Stable projections**: a projection sequence, once assigned, always refers to the same event
//!
//! ## Module Organization
//!
//! - [`error`]: error enum and `Result` alias
//! - [`types`]: sequences, stream ids, events
//! - [`config`]: tuning knobs with defaults
//! - [`store`]: the storage trait and its SQLite and in-memory backends
//! - [`writer`]: buffered writer with group commit
//! - [`dispatcher`]: ordered, gap-free publication
//! - [`subscription`]: subscriber-side handles
//! - [`projection`]: projection streams
//! - [`serializer`]: domain event encoding and the type registry
//! - [`api`]: [`EventLog`], the main entry point

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types.
pub mod error;

/// Domain types: sequences, identifiers and events.
pub mod types;

/// Configuration structs and defaults.
pub mod config;

/// Storage contract and backends.
///
/// [`store::EventStore`] is implemented by [`store::SqliteStore`] (a dedicated
/// thread owning the connection) and [`store::MemoryStore`].
pub mod store;

/// Buffered writer with group commit.
///
/// Requests arriving within `flush_delay` of each other are committed in one
/// store call. If that call fails, the batch is retried request by request so
/// one bad event only fails its own request.
pub mod writer;

/// Ordered publication of persisted events.
pub mod dispatcher;

/// Subscriptions to the dispatcher and to projection streams.
///
/// See [`subscription::CatchUpSubscription`] for history followed by live
/// events, and [`subscription::ProjectionSubscription`] for projection streams.
pub mod subscription;

/// Projection streams: queries, the per-query actor, replay and persistence.
pub mod projection;

/// Serializing domain events.
pub mod serializer;

/// Async API.
///
/// The main entry point is [`EventLog`](api::EventLog).
pub mod api;

// =============================================================================
// Re-exports
// =============================================================================

pub use api::EventLog;
pub use config::{DispatcherConfig, EventLogConfig, ProjectionConfig, WriterConfig};
pub use dispatcher::{spawn_dispatcher, DispatcherHandle, DispatcherState};
pub use error::{Error, Result};
pub use projection::{
    Predicate, ProjectionRegistry, ProjectionState, ProjectionStatus, ProjectionStreamHandle,
    ProjectionStreamQuery,
};
pub use serializer::{DomainEvent, EventSerializer, EventTypeRegistry, JsonSerializer, SerializedEvent};
pub use store::{EventStore, MemoryStore, SqliteConfig, SqliteStore};
pub use subscription::{
    CatchUpSubscription, DispatcherSubscription, ProjectionMessage, ProjectionSubscription,
};
pub use types::{
    EventData, EventId, ExpectedSequence, GlobalSeq, IndexEntry, ProjectionSeq, ProjectionStreamId,
    ReadCount, RecordedEvent, StreamHash, StreamId, StreamSeq,
};
pub use writer::{spawn_buffered_writer, WriterHandle};
