//! # Domain Event Serialization
//!
//! The log stores opaque payload bytes plus a type name. Turning domain
//! events into that pair and back is the job of an [`EventSerializer`].
//!
//! Decoding is driven by an explicit [`EventTypeRegistry`]: a table from a
//! stable type name to a decode function, built once at startup and then
//! shared read-only. There is no global registry; whoever builds the
//! serializer owns its registry.
//!
//! ```rust
//! use eventide::serializer::{DomainEvent, EventSerializer, EventTypeRegistry, JsonSerializer};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, PartialEq, Serialize, Deserialize)]
//! struct Deposited { amount: u64 }
//!
//! #[derive(Debug, PartialEq, Serialize)]
//! #[serde(untagged)]
//! enum Account { Deposited(Deposited) }
//!
//! impl DomainEvent for Account {
//!     fn event_type(&self) -> &'static str {
//!         match self { Account::Deposited(_) => "Deposited" }
//!     }
//! }
//!
//! let registry = EventTypeRegistry::builder()
//!     .register("Deposited", Account::Deposited)
//!     .build();
//! let serializer = JsonSerializer::new(registry);
//!
//! let encoded = serializer.serialize(&Account::Deposited(Deposited { amount: 5 })).unwrap();
//! assert_eq!(encoded.event_type, "Deposited");
//! let decoded = serializer.deserialize("Deposited", &encoded.payload).unwrap();
//! assert_eq!(decoded, Account::Deposited(Deposited { amount: 5 }));
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::types::{EventData, RecordedEvent};

/// Payload format tag written by [`JsonSerializer`].
pub const PAYLOAD_FORMAT_JSON: i32 = 1;

/// A domain event that knows its stable type name.
pub trait DomainEvent {
    /// The name stored with the event and used to pick a decoder.
    fn event_type(&self) -> &'static str;
}

/// A serialized domain event, ready to become [`EventData`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedEvent {
    /// Stable type name.
    pub event_type: String,
    /// Encoded payload.
    pub payload: Vec<u8>,
    /// Encoding tag.
    pub payload_format: i32,
}

impl SerializedEvent {
    /// Wraps the payload in an [`EventData`] with a fresh event id.
    pub fn into_event_data(self) -> EventData {
        EventData::new(self.event_type, self.payload).with_format(self.payload_format)
    }
}

/// Encodes and decodes domain events of type `E`.
pub trait EventSerializer<E>: Send + Sync {
    /// Encodes an event.
    fn serialize(&self, event: &E) -> Result<SerializedEvent>;

    /// Decodes a payload stored under `event_type`.
    fn deserialize(&self, event_type: &str, payload: &[u8]) -> Result<E>;

    /// Decodes a persisted event.
    fn decode(&self, event: &RecordedEvent) -> Result<E> {
        self.deserialize(&event.event_type, &event.payload)
    }
}

// =============================================================================
// Registry
// =============================================================================

type DecodeFn<E> = Box<dyn Fn(&[u8]) -> Result<E> + Send + Sync>;

/// Immutable map from type name to decoder.
pub struct EventTypeRegistry<E> {
    decoders: HashMap<String, DecodeFn<E>>,
}

impl<E: 'static> EventTypeRegistry<E> {
    /// Starts an empty registry.
    pub fn builder() -> EventTypeRegistryBuilder<E> {
        EventTypeRegistryBuilder {
            decoders: HashMap::new(),
        }
    }

    /// Decodes `payload` with the decoder registered for `event_type`.
    pub fn decode(&self, event_type: &str, payload: &[u8]) -> Result<E> {
        let decoder = self
            .decoders
            .get(event_type)
            .ok_or_else(|| Error::UnknownEventType(event_type.to_string()))?;
        decoder(payload)
    }

    /// Returns true if a decoder exists for `event_type`.
    pub fn contains(&self, event_type: &str) -> bool {
        self.decoders.contains_key(event_type)
    }

    /// Registered type names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.decoders.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Builder for [`EventTypeRegistry`]. Each `register` consumes and returns it.
pub struct EventTypeRegistryBuilder<E> {
    decoders: HashMap<String, DecodeFn<E>>,
}

impl<E: 'static> EventTypeRegistryBuilder<E> {
    /// Registers a JSON-decodable payload type `T` under `name`, wrapped into
    /// `E` by `wrap`. A later registration for the same name replaces it.
    pub fn register<T>(mut self, name: &str, wrap: fn(T) -> E) -> Self
    where
        T: DeserializeOwned + 'static,
    {
        let decode = move |payload: &[u8]| -> Result<E> {
            let value: T = serde_json::from_slice(payload)?;
            Ok(wrap(value))
        };
        self.decoders.insert(name.to_string(), Box::new(decode));
        self
    }

    /// Freezes the registry.
    pub fn build(self) -> EventTypeRegistry<E> {
        EventTypeRegistry {
            decoders: self.decoders,
        }
    }
}

// =============================================================================
// JSON
// =============================================================================

/// [`EventSerializer`] writing JSON payloads.
pub struct JsonSerializer<E> {
    registry: Arc<EventTypeRegistry<E>>,
}

impl<E: 'static> JsonSerializer<E> {
    /// Creates a serializer decoding through `registry`.
    pub fn new(registry: EventTypeRegistry<E>) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    /// The registry used for decoding.
    pub fn registry(&self) -> &EventTypeRegistry<E> {
        &self.registry
    }
}

impl<E> Clone for JsonSerializer<E> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
        }
    }
}

impl<E> EventSerializer<E> for JsonSerializer<E>
where
    E: DomainEvent + Serialize + Send + Sync + 'static,
{
    fn serialize(&self, event: &E) -> Result<SerializedEvent> {
        Ok(SerializedEvent {
            event_type: event.event_type().to_string(),
            payload: serde_json::to_vec(event)?,
            payload_format: PAYLOAD_FORMAT_JSON,
        })
    }

    fn deserialize(&self, event_type: &str, payload: &[u8]) -> Result<E> {
        self.registry.decode(event_type, payload)
    }
}
