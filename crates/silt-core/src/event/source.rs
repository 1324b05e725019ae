//! Pull interface to the event log.
//!
//! The engine never talks to a concrete log. It pulls batches through
//! [`EventSource`]: committed events only, global commit order, resumable
//! strictly after any previously returned position. Filters narrow, never
//! reorder.

use super::{AggregateType, Event, EventType};

/// Narrowing filter for one aggregate type.
///
/// An empty `event_types` list means every event of that aggregate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFilter {
    pub aggregate_type: AggregateType,
    pub event_types: Vec<EventType>,
}

impl EventFilter {
    #[must_use]
    pub fn new(aggregate_type: impl Into<AggregateType>, event_types: Vec<EventType>) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            event_types,
        }
    }

    /// Whether `event` passes this filter.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        event.aggregate_type == self.aggregate_type
            && (self.event_types.is_empty() || self.event_types.contains(&event.event_type))
    }
}

/// One fetch of the next batch for a projection.
#[derive(Debug, Clone)]
pub struct FetchRequest<'a> {
    /// Projection name, for log/diagnostic attribution only.
    pub projection: &'a str,
    /// Resume strictly after this global position (0 = from the start).
    pub after_position: u64,
    /// Union of per-aggregate filters; an event matching any filter is
    /// returned. An empty slice matches nothing.
    pub filters: &'a [EventFilter],
    /// Upper bound on returned events.
    pub limit: usize,
}

/// Errors from the log adapter.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// Appending an event whose per-aggregate sequence does not advance.
    #[error(
        "sequence {sequence} does not advance aggregate {aggregate_type} {aggregate_id} (last seen {last})"
    )]
    SequenceRegression {
        aggregate_type: AggregateType,
        aggregate_id: String,
        sequence: u64,
        last: u64,
    },

    /// The log cannot be reached; retryable, position unaffected.
    #[error("event source unavailable: {reason}")]
    Unavailable { reason: String },
}

/// An ordered, resumable view of the committed event stream.
///
/// Implementations must return events in strictly increasing global position
/// with no dirty reads of in-flight appends. `Send + Sync` because one source
/// is shared read-only across projection workers.
pub trait EventSource: Send + Sync {
    /// Fetch up to `req.limit` matching events strictly after
    /// `req.after_position`, in global commit order.
    ///
    /// # Errors
    ///
    /// [`SourceError::Unavailable`] when the log cannot be reached.
    fn fetch(&self, req: &FetchRequest<'_>) -> Result<Vec<Event>, SourceError>;

    /// Current head position of the log (0 when empty). Used for lag.
    ///
    /// # Errors
    ///
    /// [`SourceError::Unavailable`] when the log cannot be reached.
    fn head(&self) -> Result<u64, SourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(aggregate_type: &str, event_type: &str) -> Event {
        Event {
            instance_id: "i1".into(),
            aggregate_type: aggregate_type.into(),
            aggregate_id: "a1".into(),
            resource_owner: "o1".into(),
            sequence: 1,
            position: 1,
            creation_date: Utc::now(),
            event_type: event_type.into(),
            payload: None,
        }
    }

    #[test]
    fn filter_matches_aggregate_and_type() {
        let filter = EventFilter::new("action", vec!["action.added".into()]);
        assert!(filter.matches(&event("action", "action.added")));
        assert!(!filter.matches(&event("action", "action.removed")));
        assert!(!filter.matches(&event("org", "action.added")));
    }

    #[test]
    fn empty_event_type_list_matches_all_of_aggregate() {
        let filter = EventFilter::new("org", vec![]);
        assert!(filter.matches(&event("org", "org.added")));
        assert!(filter.matches(&event("org", "org.removed")));
        assert!(!filter.matches(&event("action", "org.removed")));
    }
}
