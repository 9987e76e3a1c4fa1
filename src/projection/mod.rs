//! # Projection Streams
//!
//! A projection stream is a derived, densely numbered view of the global log:
//! every event matching a [`ProjectionStreamQuery`] gets the next
//! [`ProjectionSeq`](crate::types::ProjectionSeq), starting at 1.
//!
//! ```text
//!  global log:   1:A  2:B  3:A  4:C  5:A
//!  query [A]:    1→1       2→3       3→5
//! ```
//!
//! Numbering is a pure function of the log and the query, so it survives
//! restarts. To avoid rescanning the log on every start, each stream keeps
//! two pieces of state in the store:
//!
//! - a sparse **index** (projection sequence → global sequence), written in
//!   batches by the index writer
//! - a **checkpoint**, the last global sequence the stream has looked at
//!
//! Startup resumes from the index tip, not the stored checkpoint: index
//! flushes can lag checkpoint flushes, and skipping an unindexed match would
//! renumber everything after it.
//!
//! ## Modules
//!
//! - [`query`]: predicates and content-derived stream ids
//! - [`stream`]: the per-query actor and its handle
//! - `replay`: bringing a late subscriber up to date
//! - [`persistence`]: coalescing index and checkpoint writers
//! - [`registry`]: get-or-spawn by query

pub mod persistence;
pub mod query;
pub mod registry;
pub(crate) mod replay;
pub mod stream;

pub use persistence::{CheckpointWriterHandle, IndexWriterHandle};
pub use query::{Predicate, ProjectionStreamQuery, PROJECTION_ID_PREFIX};
pub use registry::ProjectionRegistry;
pub use stream::{
    spawn_projection_stream, ProjectionContext, ProjectionState, ProjectionStatus,
    ProjectionStreamHandle,
};
