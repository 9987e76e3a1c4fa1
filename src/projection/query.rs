//! Projection stream queries.
//!
//! A query is a set of [`Predicate`]s combined with logical OR. Its identity
//! is content-addressed: the predicate set is kept sorted and deduplicated,
//! serialized to JSON and hashed, so two queries naming the same predicates in
//! any order share one projection stream (and one stored index).

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::error::Result;
use crate::types::{ProjectionStreamId, RecordedEvent, StreamId};

/// Prefix of every projection stream identifier.
pub const PROJECTION_ID_PREFIX: &str = "$projection-";

/// One condition an event may satisfy.
///
/// Stream names are compared case-insensitively, like [`StreamId`]. Event
/// types are compared exactly.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Predicate {
    /// Every event.
    All,
    /// Events whose type name equals the value.
    EventType(String),
    /// Events of exactly this stream (lowercased key).
    Stream(String),
    /// Events of any stream whose key starts with the value (lowercased).
    StreamPrefix(String),
}

impl Predicate {
    /// Matches events of the given type.
    pub fn event_type(name: impl Into<String>) -> Self {
        Predicate::EventType(name.into())
    }

    /// Matches events of one stream.
    pub fn stream(stream_id: &StreamId) -> Self {
        Predicate::Stream(stream_id.key().to_string())
    }

    /// Matches events of every stream starting with `prefix`.
    pub fn stream_prefix(prefix: &str) -> Self {
        Predicate::StreamPrefix(prefix.to_lowercase())
    }

    /// Returns true if `event` satisfies this predicate.
    pub fn matches(&self, event: &RecordedEvent) -> bool {
        match self {
            Predicate::All => true,
            Predicate::EventType(name) => &*event.event_type == name.as_str(),
            Predicate::Stream(key) => event.stream_id.key() == key,
            Predicate::StreamPrefix(prefix) => event.stream_id.key().starts_with(prefix.as_str()),
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::All => write!(f, "all"),
            Predicate::EventType(name) => write!(f, "type={}", name),
            Predicate::Stream(key) => write!(f, "stream={}", key),
            Predicate::StreamPrefix(prefix) => write!(f, "stream^={}", prefix),
        }
    }
}

/// An immutable predicate set and the projection stream id derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectionStreamQuery {
    predicates: BTreeSet<Predicate>,
    id: ProjectionStreamId,
}

impl ProjectionStreamQuery {
    /// Builds a query from predicates, in any order, duplicates allowed.
    ///
    /// An empty set matches nothing.
    ///
    /// ```rust
    /// use eventide::projection::{Predicate, ProjectionStreamQuery};
    ///
    /// let a = ProjectionStreamQuery::new([Predicate::event_type("A"), Predicate::event_type("B")]).unwrap();
    /// let b = ProjectionStreamQuery::new([Predicate::event_type("B"), Predicate::event_type("A")]).unwrap();
    /// assert_eq!(a.id(), b.id());
    /// assert!(a.id().as_str().starts_with("$projection-"));
    /// ```
    pub fn new(predicates: impl IntoIterator<Item = Predicate>) -> Result<Self> {
        let predicates: BTreeSet<Predicate> = predicates.into_iter().collect();
        let canonical = serde_json::to_vec(&predicates)?;

        let digest = Sha1::digest(&canonical);
        let mut id = String::with_capacity(PROJECTION_ID_PREFIX.len() + digest.len() * 2);
        id.push_str(PROJECTION_ID_PREFIX);
        for byte in digest.iter() {
            id.push_str(&format!("{:02x}", byte));
        }

        Ok(Self {
            predicates,
            id: ProjectionStreamId::new(id),
        })
    }

    /// The content-derived projection stream id.
    pub fn id(&self) -> &ProjectionStreamId {
        &self.id
    }

    /// The canonical (sorted, deduplicated) predicates.
    pub fn predicates(&self) -> impl Iterator<Item = &Predicate> {
        self.predicates.iter()
    }

    /// Returns true if any predicate matches.
    pub fn matches(&self, event: &RecordedEvent) -> bool {
        self.predicates.iter().any(|p| p.matches(event))
    }
}

impl fmt::Display for ProjectionStreamQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.predicates.iter().map(|p| p.to_string()).collect();
        write!(f, "[{}]", parts.join(" | "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventData, GlobalSeq, StreamSeq};

    fn event(stream: &str, kind: &str) -> RecordedEvent {
        RecordedEvent::from_data(
            EventData::new(kind, Vec::new()),
            StreamId::new(stream),
            GlobalSeq::FIRST,
            StreamSeq::FIRST,
            0,
        )
    }

    #[test]
    fn test_id_ignores_order_and_duplicates() {
        let a = ProjectionStreamQuery::new([
            Predicate::event_type("Deposited"),
            Predicate::stream_prefix("Account-"),
        ])
        .unwrap();
        let b = ProjectionStreamQuery::new([
            Predicate::stream_prefix("account-"),
            Predicate::event_type("Deposited"),
            Predicate::event_type("Deposited"),
        ])
        .unwrap();
        assert_eq!(a.id(), b.id());

        let c = ProjectionStreamQuery::new([Predicate::event_type("Withdrawn")]).unwrap();
        assert_ne!(a.id(), c.id());
        // "$projection-" + 40 hex chars
        assert_eq!(a.id().as_str().len(), PROJECTION_ID_PREFIX.len() + 40);
    }

    #[test]
    fn test_matching_is_or() {
        let query = ProjectionStreamQuery::new([
            Predicate::event_type("Opened"),
            Predicate::stream(&StreamId::new("Audit")),
        ])
        .unwrap();

        assert!(query.matches(&event("account-1", "Opened")));
        assert!(query.matches(&event("audit", "Anything")));
        assert!(!query.matches(&event("account-1", "Closed")));
        assert!(!query.matches(&event("account-1", "opened")));
    }

    #[test]
    fn test_prefix_and_all() {
        let prefix = Predicate::stream_prefix("Order-");
        assert!(prefix.matches(&event("ORDER-7", "X")));
        assert!(!prefix.matches(&event("orders", "X")));
        assert!(Predicate::All.matches(&event("x", "y")));

        let empty = ProjectionStreamQuery::new(Vec::new()).unwrap();
        assert!(!empty.matches(&event("x", "y")));
    }

    #[test]
    fn test_display() {
        let query =
            ProjectionStreamQuery::new([Predicate::All, Predicate::event_type("A")]).unwrap();
        assert_eq!(query.to_string(), "[all | type=A]");
    }
}
