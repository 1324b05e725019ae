//! Reducer registry: the immutable dispatch table from (aggregate type,
//! event type) to reduction functions.
//!
//! The table is built once at projection construction time and injected into
//! the engine; nothing mutates it during the run loop. Dispatch is a nested
//! map lookup. The registry also derives the fetch filters handed to the
//! event source, so a projection only ever sees events it registered for —
//! which makes a missed lookup a wiring defect, not a data condition.

use crate::event::{AggregateType, Event, EventFilter, EventType, PayloadError};
use crate::statement::Statement;
use std::collections::HashMap;

/// Errors out of reducing one event. Every variant is fatal for the batch:
/// these signal mis-wiring or malformed data, and skipping would mean a
/// permanently missing mutation.
#[derive(Debug, thiserror::Error)]
pub enum ReduceError {
    #[error(
        "reducer for aggregate {aggregate} expects one of [{}], got {actual}",
        .expected.iter().map(EventType::as_str).collect::<Vec<_>>().join(", ")
    )]
    WrongEventType {
        aggregate: AggregateType,
        expected: Vec<EventType>,
        actual: EventType,
    },

    #[error("no reducer registered for {aggregate} {event_type}")]
    MissingReducer {
        aggregate: AggregateType,
        event_type: EventType,
    },

    #[error(transparent)]
    MalformedPayload(#[from] PayloadError),
}

/// A pure reduction function: one event in, one statement out.
///
/// Blanket-implemented for closures, so most reducers are plain functions.
pub trait Reduce: Send + Sync {
    /// # Errors
    ///
    /// Any [`ReduceError`]; the engine treats them all as fatal.
    fn reduce(&self, event: &Event) -> Result<Statement, ReduceError>;
}

impl<F> Reduce for F
where
    F: Fn(&Event) -> Result<Statement, ReduceError> + Send + Sync,
{
    fn reduce(&self, event: &Event) -> Result<Statement, ReduceError> {
        self(event)
    }
}

/// Defensive type guard for reducer bodies.
///
/// The registry only routes declared event types to a reducer, but a
/// mis-wired table must fail loudly instead of producing a garbage write.
///
/// # Errors
///
/// [`ReduceError::WrongEventType`] carrying the expected types for
/// diagnostics.
pub fn expect_event_type(event: &Event, expected: &[&str]) -> Result<(), ReduceError> {
    if expected.iter().any(|t| event.event_type.as_str() == *t) {
        Ok(())
    } else {
        Err(ReduceError::WrongEventType {
            aggregate: event.aggregate_type.clone(),
            expected: expected.iter().map(|t| EventType::from(*t)).collect(),
            actual: event.event_type.clone(),
        })
    }
}

type ReducerMap = HashMap<AggregateType, HashMap<EventType, Box<dyn Reduce>>>;

/// Immutable dispatch table plus the fetch filters derived from it.
pub struct ReducerRegistry {
    reducers: ReducerMap,
    filters: Vec<EventFilter>,
}

impl std::fmt::Debug for ReducerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReducerRegistry")
            .field("filters", &self.filters)
            .finish_non_exhaustive()
    }
}

impl ReducerRegistry {
    #[must_use]
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder {
            reducers: HashMap::new(),
        }
    }

    /// Route `event` to its reducer and run it.
    ///
    /// # Errors
    ///
    /// [`ReduceError::MissingReducer`] when no entry matches; otherwise
    /// whatever the reducer returns.
    pub fn dispatch(&self, event: &Event) -> Result<Statement, ReduceError> {
        self.reducers
            .get(&event.aggregate_type)
            .and_then(|by_type| by_type.get(&event.event_type))
            .ok_or_else(|| ReduceError::MissingReducer {
                aggregate: event.aggregate_type.clone(),
                event_type: event.event_type.clone(),
            })?
            .reduce(event)
    }

    /// Fetch filters covering exactly the registered (aggregate, event type)
    /// pairs, in deterministic order.
    #[must_use]
    pub fn filters(&self) -> &[EventFilter] {
        &self.filters
    }

    /// Number of registered (aggregate, event type) entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.reducers.values().map(HashMap::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.reducers.is_empty()
    }
}

/// Collects reducer registrations, then freezes them into a registry.
pub struct RegistryBuilder {
    reducers: ReducerMap,
}

impl RegistryBuilder {
    /// Register `reducer` for one (aggregate, event type) pair. A second
    /// registration for the same pair replaces the first.
    #[must_use]
    pub fn on(
        mut self,
        aggregate: impl Into<AggregateType>,
        event_type: impl Into<EventType>,
        reducer: impl Reduce + 'static,
    ) -> Self {
        self.reducers
            .entry(aggregate.into())
            .or_default()
            .insert(event_type.into(), Box::new(reducer));
        self
    }

    #[must_use]
    pub fn build(self) -> ReducerRegistry {
        let mut filters: Vec<EventFilter> = self
            .reducers
            .iter()
            .map(|(aggregate, by_type)| {
                let mut event_types: Vec<EventType> = by_type.keys().cloned().collect();
                event_types.sort();
                EventFilter::new(aggregate.clone(), event_types)
            })
            .collect();
        filters.sort_by(|a, b| a.aggregate_type.cmp(&b.aggregate_type));

        ReducerRegistry {
            reducers: self.reducers,
            filters,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statement::{Column, Statement};
    use chrono::Utc;

    fn make_event(aggregate_type: &str, event_type: &str) -> Event {
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

    fn name_reducer(name: &'static str) -> impl Reduce {
        move |event: &Event| -> Result<Statement, ReduceError> {
            Ok(Statement::create(event, vec![Column::new("name", name)]))
        }
    }

    #[test]
    fn dispatch_routes_by_aggregate_and_event_type() {
        let registry = ReducerRegistry::builder()
            .on("action", "action.added", name_reducer("added"))
            .on("action", "action.removed", name_reducer("removed"))
            .on("org", "org.removed", name_reducer("org-gone"))
            .build();

        let stmt = registry.dispatch(&make_event("action", "action.removed")).unwrap();
        assert_eq!(stmt.ops().len(), 1);
        let stmt = registry.dispatch(&make_event("org", "org.removed")).unwrap();
        assert!(!stmt.is_no_op());
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn dispatch_without_entry_is_a_wiring_error() {
        let registry = ReducerRegistry::builder()
            .on("action", "action.added", name_reducer("added"))
            .build();

        let err = registry
            .dispatch(&make_event("action", "action.changed"))
            .unwrap_err();
        assert!(matches!(err, ReduceError::MissingReducer { .. }));
        assert!(err.to_string().contains("action.changed"));
    }

    #[test]
    fn filters_cover_registered_pairs_in_order() {
        let registry = ReducerRegistry::builder()
            .on("org", "org.removed", name_reducer("x"))
            .on("action", "action.removed", name_reducer("x"))
            .on("action", "action.added", name_reducer("x"))
            .build();

        let filters = registry.filters();
        assert_eq!(filters.len(), 2);
        assert_eq!(filters[0].aggregate_type.as_str(), "action");
        assert_eq!(
            filters[0]
                .event_types
                .iter()
                .map(EventType::as_str)
                .collect::<Vec<_>>(),
            vec!["action.added", "action.removed"]
        );
        assert_eq!(filters[1].aggregate_type.as_str(), "org");
    }

    #[test]
    fn expect_event_type_accepts_declared_types() {
        let event = make_event("action", "action.added");
        assert!(expect_event_type(&event, &["action.added", "action.changed"]).is_ok());
    }

    #[test]
    fn expect_event_type_rejects_everything_else() {
        let event = make_event("action", "user.added");
        let err = expect_event_type(&event, &["action.added", "action.changed"]).unwrap_err();
        match &err {
            ReduceError::WrongEventType { expected, actual, .. } => {
                assert_eq!(expected.len(), 2);
                assert_eq!(actual.as_str(), "user.added");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let msg = err.to_string();
        assert!(msg.contains("action.added, action.changed"));
        assert!(msg.contains("user.added"));
    }

    #[test]
    fn reducer_errors_pass_through_dispatch() {
        fn mis_wired(event: &Event) -> Result<Statement, ReduceError> {
            expect_event_type(event, &["action.changed"])?;
            Ok(Statement::no_op(event))
        }

        let registry = ReducerRegistry::builder()
            .on("action", "action.added", mis_wired)
            .build();

        let err = registry
            .dispatch(&make_event("action", "action.added"))
            .unwrap_err();
        assert!(matches!(err, ReduceError::WrongEventType { .. }));
    }

    #[test]
    fn later_registration_replaces_earlier() {
        fn first(event: &Event) -> Result<Statement, ReduceError> {
            Ok(Statement::no_op(event))
        }

        let registry = ReducerRegistry::builder()
            .on("action", "action.added", first)
            .on("action", "action.added", name_reducer("second"))
            .build();

        let stmt = registry.dispatch(&make_event("action", "action.added")).unwrap();
        assert!(!stmt.is_no_op());
        assert_eq!(registry.len(), 1);
    }
}
