//! # Domain Types for Eventide
//!
//! Newtypes for every number and identifier that flows through the log, so a
//! global sequence can never be passed where a stream sequence is expected.
//!
//! ## Invariants
//!
//! - [`GlobalSeq`]: strictly increasing, assigned once by the store at commit,
//!   starts at 1 (zero means "nothing yet")
//! - [`StreamSeq`]: strictly increasing per stream, starts at 1, no gaps
//! - [`ProjectionSeq`]: dense per projection stream, starts at 1
//! - [`StreamId`]: compared case-insensitively; [`StreamHash`] is the SHA-1 of
//!   the lowercased name
//!
//! ## Example
//!
//! ```rust
//! use eventide::types::{ExpectedSequence, StreamId, StreamSeq};
//!
//! let a = StreamId::new("Order-42");
//! let b = StreamId::new("order-42");
//! assert_eq!(a, b);
//! assert_eq!(a.hash(), b.hash());
//!
//! assert!(ExpectedSequence::None.matches(StreamSeq::NONE));
//! assert!(!ExpectedSequence::Exact(StreamSeq::from_raw(3)).matches(StreamSeq::from_raw(4)));
//! ```

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use uuid::Uuid;

// =============================================================================
// Stream Identification
// =============================================================================

/// The name of an event stream.
///
/// Stream names are case-insensitive: `"Order-42"` and `"order-42"` name the
/// same stream. The original spelling is kept for display; equality, hashing
/// and [`StreamId::hash`] all use the lowercased key.
#[derive(Clone, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct StreamId {
    name: String,
    key: String,
}

impl StreamId {
    /// Creates a stream ID from any string-like value.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let key = name.to_lowercase();
        Self { name, key }
    }

    /// The name as it was given.
    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// The lowercased comparison key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Computes the fixed-width storage hash of this stream.
    ///
    /// SHA-1 over the lowercased name. Collisions are not handled: two names
    /// with the same hash are treated as the same stream by the SQL backend.
    pub fn hash(&self) -> StreamHash {
        let digest = Sha1::digest(self.key.as_bytes());
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(digest.as_slice());
        StreamHash(bytes)
    }
}

impl PartialEq for StreamId {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for StreamId {}

impl Hash for StreamId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StreamId").field(&self.name).finish()
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl From<&str> for StreamId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for StreamId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<StreamId> for String {
    fn from(id: StreamId) -> Self {
        id.name
    }
}

/// 20-byte hash of a [`StreamId`] used as the compact indexed key in SQL.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHash([u8; 20]);

impl StreamHash {
    /// Wraps raw bytes read back from storage.
    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// The raw bytes for storage.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Debug for StreamHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamHash({})", self)
    }
}

impl fmt::Display for StreamHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

// =============================================================================
// Sequences
// =============================================================================

/// A position in the global event log.
///
/// Zero is the "nothing delivered yet" cursor value; real events start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct GlobalSeq(i64);

impl GlobalSeq {
    /// Cursor value before any event.
    pub const ZERO: GlobalSeq = GlobalSeq(0);

    /// The first assigned sequence.
    pub const FIRST: GlobalSeq = GlobalSeq(1);

    /// Creates a GlobalSeq from a raw value.
    pub fn from_raw(value: i64) -> Self {
        Self(value)
    }

    /// Returns the raw value for storage.
    pub fn as_raw(&self) -> i64 {
        self.0
    }

    /// Returns the next sequence.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Adds an offset.
    pub fn add(&self, count: i64) -> Self {
        Self(self.0 + count)
    }

    /// Clamps a read start position: anything at or below zero reads from 1.
    pub fn clamp_start(self) -> Self {
        Self(self.0.max(1))
    }
}

impl fmt::Display for GlobalSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A sequence number within one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct StreamSeq(i32);

impl StreamSeq {
    /// "No events yet".
    pub const NONE: StreamSeq = StreamSeq(0);

    /// The first event in a stream.
    pub const FIRST: StreamSeq = StreamSeq(1);

    /// Creates a StreamSeq from a raw value.
    pub fn from_raw(value: i32) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    pub fn as_raw(&self) -> i32 {
        self.0
    }

    /// Returns the next sequence.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Clamps a read start position: anything at or below zero reads from 1.
    pub fn clamp_start(self) -> Self {
        Self(self.0.max(1))
    }
}

impl fmt::Display for StreamSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A sequence number within a projection stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct ProjectionSeq(i64);

impl ProjectionSeq {
    /// "Nothing emitted yet".
    pub const NONE: ProjectionSeq = ProjectionSeq(0);

    /// Creates a ProjectionSeq from a raw value.
    pub fn from_raw(value: i64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    pub fn as_raw(&self) -> i64 {
        self.0
    }

    /// Returns the next sequence.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for ProjectionSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Concurrency Token
// =============================================================================

/// What the caller believes about a stream's length when appending.
///
/// Checked atomically with the append by every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedSequence {
    /// Append unconditionally.
    Any,
    /// The stream must not exist yet.
    None,
    /// The stream must contain exactly this many events.
    Exact(StreamSeq),
}

impl ExpectedSequence {
    /// Returns true if a stream currently at `actual` satisfies this expectation.
    pub fn matches(&self, actual: StreamSeq) -> bool {
        match self {
            ExpectedSequence::Any => true,
            ExpectedSequence::None => actual == StreamSeq::NONE,
            ExpectedSequence::Exact(expected) => *expected == actual,
        }
    }
}

impl fmt::Display for ExpectedSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectedSequence::Any => write!(f, "any"),
            ExpectedSequence::None => write!(f, "none"),
            ExpectedSequence::Exact(seq) => write!(f, "{}", seq),
        }
    }
}

// =============================================================================
// Read Pagination
// =============================================================================

/// How many items a range read may deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadCount {
    /// At most this many.
    Limited(usize),
    /// Everything from the start position onward.
    Unlimited,
}

impl ReadCount {
    /// Returns the limit, or `usize::MAX` for [`ReadCount::Unlimited`].
    pub fn as_limit(&self) -> usize {
        match self {
            ReadCount::Limited(n) => *n,
            ReadCount::Unlimited => usize::MAX,
        }
    }

    /// Returns true if nothing may be read.
    pub fn is_zero(&self) -> bool {
        matches!(self, ReadCount::Limited(0))
    }
}

impl From<usize> for ReadCount {
    fn from(n: usize) -> Self {
        ReadCount::Limited(n)
    }
}

// =============================================================================
// Events
// =============================================================================

/// Globally unique event identifier; the duplicate-detection key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(Uuid);

impl EventId {
    /// Generates a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An event to be appended. Sequences are assigned by the store.
#[derive(Debug, Clone)]
pub struct EventData {
    /// Duplicate-detection key.
    pub event_id: EventId,

    /// Event type name, e.g. `"OrderPlaced"`.
    pub event_type: String,

    /// Opaque payload. The store never looks inside.
    pub payload: Vec<u8>,

    /// Tag describing the payload encoding (JSON, protobuf, ...).
    pub payload_format: i32,

    /// Optional opaque metadata (correlation ids, causation, user).
    pub metadata: Option<Vec<u8>>,
}

impl EventData {
    /// Creates an event with a fresh identifier and format tag 0.
    pub fn new(event_type: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            event_id: EventId::new(),
            event_type: event_type.into(),
            payload: payload.into(),
            payload_format: 0,
            metadata: None,
        }
    }

    /// Sets the event identifier (builder pattern).
    pub fn with_id(mut self, event_id: EventId) -> Self {
        self.event_id = event_id;
        self
    }

    /// Adds metadata.
    pub fn with_metadata(mut self, metadata: impl Into<Vec<u8>>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }

    /// Sets the payload format tag.
    pub fn with_format(mut self, payload_format: i32) -> Self {
        self.payload_format = payload_format;
        self
    }

    /// Approximate encoded size, used to split large SQL batches.
    pub fn encoded_len(&self) -> usize {
        self.payload.len()
            + self.metadata.as_ref().map_or(0, |m| m.len())
            + self.event_type.len()
            + 64
    }
}

/// A persisted event. Immutable once the store has assigned its global sequence.
///
/// Payload and metadata sit behind `Arc` so the dispatcher can fan an event
/// out to many subscribers without copying bytes.
#[derive(Debug, Clone)]
pub struct RecordedEvent {
    /// Position in the global log.
    pub global_seq: GlobalSeq,

    /// Duplicate-detection key.
    pub event_id: EventId,

    /// Owning stream.
    pub stream_id: StreamId,

    /// Position within the stream.
    pub stream_seq: StreamSeq,

    /// Event type name.
    pub event_type: Arc<str>,

    /// Commit time, Unix milliseconds (UTC).
    pub timestamp_ms: u64,

    /// Opaque payload.
    pub payload: Arc<[u8]>,

    /// Payload encoding tag.
    pub payload_format: i32,

    /// Opaque metadata.
    pub metadata: Option<Arc<[u8]>>,
}

impl RecordedEvent {
    /// Builds the persisted form of `data` at the assigned positions.
    pub fn from_data(
        data: EventData,
        stream_id: StreamId,
        global_seq: GlobalSeq,
        stream_seq: StreamSeq,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            global_seq,
            event_id: data.event_id,
            stream_id,
            stream_seq,
            event_type: Arc::from(data.event_type),
            timestamp_ms,
            payload: Arc::from(data.payload),
            payload_format: data.payload_format,
            metadata: data.metadata.map(Arc::from),
        }
    }
}

/// Identifier of a projection stream, derived from its query.
///
/// Also the storage key for the projection index and checkpoint rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProjectionStreamId(String);

impl ProjectionStreamId {
    /// Wraps an identifier string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectionStreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One projection index row: projection sequence → global sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// Dense sequence within the projection stream.
    pub projection_seq: ProjectionSeq,
    /// The referenced event.
    pub global_seq: GlobalSeq,
}

/// Current time in Unix milliseconds.
pub fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_id_case_insensitive() {
        let a = StreamId::new("User-123");
        let b = StreamId::new("user-123");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "User-123");
        assert_eq!(a.key(), "user-123");
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn test_stream_hash_different_for_different_ids() {
        let id1 = StreamId::new("user-123");
        let id2 = StreamId::new("user-456");
        assert_ne!(id1.hash(), id2.hash());
        assert_eq!(id1.hash().to_string().len(), 40);
    }

    #[test]
    fn test_stream_id_serde_keeps_spelling() {
        let id = StreamId::new("Cart-9");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"Cart-9\"");
        let back: StreamId = serde_json::from_str(&json).unwrap();
        assert_eq!(back.as_str(), "Cart-9");
    }

    #[test]
    fn test_expected_sequence() {
        assert!(ExpectedSequence::Any.matches(StreamSeq::from_raw(17)));
        assert!(ExpectedSequence::None.matches(StreamSeq::NONE));
        assert!(!ExpectedSequence::None.matches(StreamSeq::FIRST));
        assert!(ExpectedSequence::Exact(StreamSeq::from_raw(2)).matches(StreamSeq::from_raw(2)));
        assert_eq!(ExpectedSequence::None.to_string(), "none");
        assert_eq!(ExpectedSequence::Any.to_string(), "any");
    }

    #[test]
    fn test_clamp_start() {
        assert_eq!(GlobalSeq::from_raw(-4).clamp_start(), GlobalSeq::FIRST);
        assert_eq!(GlobalSeq::ZERO.clamp_start(), GlobalSeq::FIRST);
        assert_eq!(GlobalSeq::from_raw(9).clamp_start().as_raw(), 9);
        assert_eq!(StreamSeq::NONE.clamp_start(), StreamSeq::FIRST);
    }

    #[test]
    fn test_read_count() {
        assert_eq!(ReadCount::Unlimited.as_limit(), usize::MAX);
        assert!(ReadCount::Limited(0).is_zero());
        assert_eq!(ReadCount::from(3), ReadCount::Limited(3));
    }

    #[test]
    fn test_recorded_event_from_data() {
        let data = EventData::new("Greeting", b"hello".to_vec()).with_metadata(b"m".to_vec());
        let id = data.event_id;
        let rec = RecordedEvent::from_data(
            data,
            StreamId::new("s"),
            GlobalSeq::from_raw(7),
            StreamSeq::FIRST,
            42,
        );
        assert_eq!(rec.event_id, id);
        assert_eq!(&*rec.event_type, "Greeting");
        assert_eq!(&*rec.payload, b"hello");
        assert_eq!(rec.metadata.as_deref(), Some(&b"m"[..]));
    }
}
