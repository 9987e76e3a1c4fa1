//! # Error Handling for Eventide
//!
//! A single error enum ([`Error`]) covers every failure mode in the crate:
//! storage backends, the buffered writer, the dispatcher and projection
//! streams all return the same [`Result`] alias.
//!
//! ## Error Categories
//!
//! | Category | Variants | Typical Response |
//! |----------|----------|------------------|
//! | Concurrency | `UnexpectedSequence` | Re-read, recompute, retry with fresh expectation |
//! | Idempotency | `Duplicate` | Treat as "already done" or fail, caller decides |
//! | Storage | `Sqlite`, `Storage` | Retry later; logical state is unchanged |
//! | Projection | `InconsistentProjection` | Clear the index and rebuild |
//! | Lifecycle | `Closed`, `Canceled`, `SubscriptionLagged` | Resubscribe or shut down |
//!
//! The store layer never retries an `UnexpectedSequence` on its own. Only the
//! caller knows whether the decision it made is still valid against the new
//! stream state.

use thiserror::Error;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in eventide operations.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Concurrency and Idempotency
    // =========================================================================

    /// Optimistic concurrency violation.
    ///
    /// # When This Happens
    ///
    /// - An append carried an expected sequence that no longer matches the
    ///   stream's event count at commit time.
    /// - A projection index write expected a different highest projection
    ///   sequence than the one stored.
    ///
    /// # Recovery
    ///
    /// 1. Re-read the stream
    /// 2. Re-apply business logic
    /// 3. Retry with the new expected sequence
    #[error("unexpected sequence on stream '{stream_id}': expected {expected}, but found {actual}")]
    UnexpectedSequence {
        /// Stream (or projection stream) the check ran against.
        stream_id: String,
        /// What the caller expected, rendered for display (`any`, `none`, or a number).
        expected: String,
        /// The actual current sequence.
        actual: i64,
    },

    /// An event identifier or projection index entry already exists.
    ///
    /// Some callers treat this as success (the write already happened);
    /// others treat it as a hard failure. The store never decides for them.
    #[error("duplicate: {what}")]
    Duplicate {
        /// Human-readable description of the duplicated key.
        what: String,
    },

    // =========================================================================
    // Storage Errors (transient, retryable)
    // =========================================================================

    /// SQLite operation failed.
    ///
    /// Duplicate-key violations are classified before they reach this variant,
    /// so anything seen here is an infrastructure failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Backend-neutral storage failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Schema version mismatch or a corrupt row.
    #[error("schema error: {0}")]
    Schema(String),

    // =========================================================================
    // Serialization
    // =========================================================================

    /// A domain event could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No decoder is registered for the stored event type name.
    #[error("unknown event type '{0}'")]
    UnknownEventType(String),

    // =========================================================================
    // Projection and Subscription Errors
    // =========================================================================

    /// The projection index disagrees with the replayed log.
    ///
    /// # Recovery
    ///
    /// The owning projection stream clears its index and checkpoint and
    /// replays the log from the start.
    #[error("projection '{projection_id}' is inconsistent: {reason}")]
    InconsistentProjection {
        /// The projection stream identifier.
        projection_id: String,
        /// What disagreed.
        reason: String,
    },

    /// A subscriber fell behind the broadcast buffer and missed `n` messages.
    #[error("subscription lagged: missed {0} events")]
    SubscriptionLagged(u64),

    /// A read or replay observed its cancellation token.
    #[error("operation canceled")]
    Canceled,

    /// An actor's mailbox was closed (it has shut down or crashed).
    #[error("{0} has shut down")]
    Closed(&'static str),
}

impl Error {
    /// Returns true for errors that never change logical state and may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Sqlite(_) | Error::Storage(_))
    }

    /// Returns true for [`Error::Duplicate`].
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Error::Duplicate { .. })
    }

    /// Returns true for [`Error::UnexpectedSequence`].
    pub fn is_unexpected_sequence(&self) -> bool {
        matches!(self, Error::UnexpectedSequence { .. })
    }

    /// Copies an error for fan-out to several waiters.
    ///
    /// `rusqlite::Error` and `serde_json::Error` are not `Clone`, so those
    /// degrade to their rendered message in the `Storage` class.
    pub(crate) fn duplicate_for_fanout(&self) -> Error {
        match self {
            Error::UnexpectedSequence {
                stream_id,
                expected,
                actual,
            } => Error::UnexpectedSequence {
                stream_id: stream_id.clone(),
                expected: expected.clone(),
                actual: *actual,
            },
            Error::Duplicate { what } => Error::Duplicate { what: what.clone() },
            Error::Schema(msg) => Error::Schema(msg.clone()),
            Error::UnknownEventType(name) => Error::UnknownEventType(name.clone()),
            Error::InconsistentProjection {
                projection_id,
                reason,
            } => Error::InconsistentProjection {
                projection_id: projection_id.clone(),
                reason: reason.clone(),
            },
            Error::SubscriptionLagged(n) => Error::SubscriptionLagged(*n),
            Error::Canceled => Error::Canceled,
            Error::Closed(what) => Error::Closed(what),
            other => Error::Storage(other.to_string()),
        }
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
