//! Event data model for the projection engine.
//!
//! This module defines the core `Event` struct consumed by reducers, the
//! string-typed `AggregateType` / `EventType` discriminants (the event
//! universe is open: aggregates and event types are declared by the
//! application, not by this crate), and typed payload access via
//! [`Event::payload_as`].
//!
//! Events are read-only here. They are produced and persisted elsewhere; the
//! engine only pulls them, in global commit order, through the
//! [`source::EventSource`] trait.

pub mod memory;
pub mod source;

pub use memory::MemoryEventSource;
pub use source::{EventFilter, EventSource, FetchRequest, SourceError};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Aggregate type discriminant (e.g. `"action"`, `"org"`, `"user"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AggregateType(String);

impl AggregateType {
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AggregateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AggregateType {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl From<String> for AggregateType {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

/// Event type discriminant in dotted form (e.g. `"action.added"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(String);

impl EventType {
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventType {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl From<String> for EventType {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

/// Error returned by [`Event::payload_as`] when the payload cannot supply the
/// shape a reducer expects. Never coerced into a partial write; the engine
/// treats it as fatal for the batch.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("event {event_type} carries no payload")]
    Missing { event_type: EventType },

    #[error("payload of {event_type} failed to deserialize: {source}")]
    Decode {
        event_type: EventType,
        #[source]
        source: serde_json::Error,
    },
}

/// A single committed event from the log.
///
/// Events are immutable facts. The engine never mutates or re-emits them; it
/// folds them into projection tables and remembers how far it got.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Tenant/instance the event belongs to. Every projection row carries it.
    pub instance_id: String,

    /// Aggregate type this event was recorded for.
    pub aggregate_type: AggregateType,

    /// Aggregate instance ID, stable within the instance.
    pub aggregate_id: String,

    /// Owning organization/resource of the aggregate at commit time.
    ///
    /// Ownership-removal cascades scope on `(instance_id, resource_owner)`.
    pub resource_owner: String,

    /// Per-aggregate sequence number.
    ///
    /// Strictly increasing and gap-free per `(instance_id, aggregate_id)`.
    pub sequence: u64,

    /// Global commit-order token assigned by the log.
    ///
    /// Strictly increasing across the whole stream; fetches resume strictly
    /// after a position and checkpoints store one.
    pub position: u64,

    /// Wall-clock commit timestamp.
    pub creation_date: DateTime<Utc>,

    /// Event type discriminant used for reducer dispatch.
    pub event_type: EventType,

    /// Structured payload, opaque to the engine.
    ///
    /// Reducers decode it with [`Event::payload_as`]; `None` for events that
    /// carry no body (e.g. removals).
    pub payload: Option<serde_json::Value>,
}

impl Event {
    /// Deserialize the payload into the shape a reducer expects.
    ///
    /// # Errors
    ///
    /// [`PayloadError::Missing`] when the event has no payload,
    /// [`PayloadError::Decode`] when it does not match `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, PayloadError> {
        let payload = self.payload.as_ref().ok_or_else(|| PayloadError::Missing {
            event_type: self.event_type.clone(),
        })?;
        serde_json::from_value(payload.clone()).map_err(|source| PayloadError::Decode {
            event_type: self.event_type.clone(),
            source,
        })
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\t{}\t{}\t{}\tseq={}\tpos={}",
            self.instance_id,
            self.aggregate_type,
            self.aggregate_id,
            self.event_type,
            self.sequence,
            self.position,
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
