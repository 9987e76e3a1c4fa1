//! # Configuration
//!
//! Plain structs with `Default` impls. Every default is a named constant so
//! tests and callers can reason about timing without guessing.
//!
//! ```rust
//! use std::time::Duration;
//! use eventide::config::{EventLogConfig, WriterConfig};
//!
//! let config = EventLogConfig {
//!     writer: WriterConfig {
//!         flush_delay: Duration::from_millis(2),
//!         ..WriterConfig::default()
//!     },
//!     ..EventLogConfig::default()
//! };
//! assert_eq!(config.writer.max_batch_size, eventide::config::DEFAULT_WRITER_MAX_BATCH_SIZE);
//! ```

use std::time::Duration;

// =============================================================================
// Defaults
// =============================================================================

/// Buffered writer: delay between the first request of an idle period and the flush.
pub const DEFAULT_WRITER_FLUSH_DELAY_MS: u64 = 10;

/// Buffered writer: flush early once this many requests are buffered.
pub const DEFAULT_WRITER_MAX_BATCH_SIZE: usize = 1000;

/// Dispatcher: how long a gap may stay open before the store is asked for it.
///
/// Also the pause before a projection stream retries a failed startup.
pub const DEFAULT_RECOVERY_DELAY_MS: u64 = 100;

/// Dispatcher: broadcast channel capacity.
///
/// Slow subscribers that fall further behind observe a lag and resubscribe.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 10_000;

/// Projection writers: coalescing delay for index and checkpoint flushes.
pub const DEFAULT_PERSIST_FLUSH_DELAY_MS: u64 = 250;

/// Page size for replay reads against the store.
pub const DEFAULT_REPLAY_PAGE_SIZE: usize = 1000;

/// Per-subscriber channel capacity for projection subscriptions.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 10_000;

/// Consecutive rebuilds tolerated before a projection stream stops itself.
pub const DEFAULT_MAX_REBUILDS: u32 = 3;

/// Size of actor mailboxes.
pub const MAILBOX_SIZE: usize = 4096;

// =============================================================================
// Component Configs
// =============================================================================

/// Configuration for the buffered writer.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Delay between the first enqueue of an idle period and the flush.
    ///
    /// Not reset by later arrivals: one flush per idle-to-busy transition.
    pub flush_delay: Duration,

    /// Flush immediately once this many requests are waiting.
    pub max_batch_size: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            flush_delay: Duration::from_millis(DEFAULT_WRITER_FLUSH_DELAY_MS),
            max_batch_size: DEFAULT_WRITER_MAX_BATCH_SIZE,
        }
    }
}

/// Configuration for the global dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Bounded delay before a gap is recovered from the store.
    pub recovery_delay: Duration,

    /// Capacity of the downstream broadcast channel.
    pub broadcast_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            recovery_delay: Duration::from_millis(DEFAULT_RECOVERY_DELAY_MS),
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
        }
    }
}

/// Configuration shared by projection streams and their persistence writers.
#[derive(Debug, Clone)]
pub struct ProjectionConfig {
    /// Flush delay of the index writer.
    pub index_flush_delay: Duration,

    /// Flush delay of the checkpoint writer.
    pub checkpoint_flush_delay: Duration,

    /// Page size for index and log replay reads.
    pub replay_page_size: usize,

    /// Channel capacity per projection subscriber, plus one slot kept for `Unsubscribed`.
    pub subscriber_buffer: usize,

    /// Consecutive rebuilds tolerated before the stream stops.
    pub max_rebuilds: u32,

    /// Pause before retrying a startup that failed on a transient store error.
    pub retry_delay: Duration,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            index_flush_delay: Duration::from_millis(DEFAULT_PERSIST_FLUSH_DELAY_MS),
            checkpoint_flush_delay: Duration::from_millis(DEFAULT_PERSIST_FLUSH_DELAY_MS),
            replay_page_size: DEFAULT_REPLAY_PAGE_SIZE,
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
            max_rebuilds: DEFAULT_MAX_REBUILDS,
            retry_delay: Duration::from_millis(DEFAULT_RECOVERY_DELAY_MS),
        }
    }
}

/// Top-level configuration for an [`EventLog`](crate::api::EventLog).
#[derive(Debug, Clone, Default)]
pub struct EventLogConfig {
    /// Buffered writer settings.
    pub writer: WriterConfig,
    /// Dispatcher settings.
    pub dispatcher: DispatcherConfig,
    /// Projection settings.
    pub projection: ProjectionConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EventLogConfig::default();
        assert_eq!(config.writer.flush_delay, Duration::from_millis(10));
        assert_eq!(config.dispatcher.broadcast_capacity, DEFAULT_BROADCAST_CAPACITY);
        assert_eq!(config.projection.max_rebuilds, 3);
    }
}
