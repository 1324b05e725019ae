//! In-memory event source.
//!
//! A small, thread-safe log used by tests and by embedders that do not have
//! (or do not want) an external event store. `append` assigns global
//! positions and enforces per-aggregate sequence monotonicity; `fetch`
//! filters without reordering, exactly as the [`EventSource`] contract
//! requires.

use super::Event;
use super::source::{EventFilter, EventSource, FetchRequest, SourceError};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Default)]
struct Log {
    /// Events in append (= global position) order.
    events: Vec<Event>,
    /// Last sequence seen per (instance_id, aggregate_id).
    last_sequences: HashMap<(String, String), u64>,
    /// Position of the most recent append; positions start at 1.
    head: u64,
}

/// Append-only, position-assigning in-memory log.
#[derive(Debug, Default)]
pub struct MemoryEventSource {
    inner: Mutex<Log>,
}

impl MemoryEventSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one event, assigning the next global position.
    ///
    /// The `position` field of `event` is ignored and overwritten. Returns
    /// the assigned position.
    ///
    /// # Errors
    ///
    /// [`SourceError::SequenceRegression`] when `event.sequence` does not
    /// strictly advance its `(instance_id, aggregate_id)` stream.
    pub fn append(&self, mut event: Event) -> Result<u64, SourceError> {
        let mut log = self.lock();

        let key = (event.instance_id.clone(), event.aggregate_id.clone());
        if let Some(&last) = log.last_sequences.get(&key) {
            if event.sequence <= last {
                return Err(SourceError::SequenceRegression {
                    aggregate_type: event.aggregate_type.clone(),
                    aggregate_id: event.aggregate_id.clone(),
                    sequence: event.sequence,
                    last,
                });
            }
        }

        log.head += 1;
        event.position = log.head;
        log.last_sequences.insert(key, event.sequence);
        log.events.push(event);
        Ok(log.head)
    }

    /// Append events in order, stopping at the first rejection.
    ///
    /// # Errors
    ///
    /// First [`SourceError::SequenceRegression`] encountered; earlier events
    /// stay appended.
    pub fn append_all(&self, events: impl IntoIterator<Item = Event>) -> Result<(), SourceError> {
        for event in events {
            self.append(event)?;
        }
        Ok(())
    }

    /// Number of events in the log.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().events.is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Log> {
        // A poisoned lock only means another test thread panicked mid-append;
        // the log itself is still ordered, so recover the guard.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn matches_any(filters: &[EventFilter], event: &Event) -> bool {
    filters.iter().any(|f| f.matches(event))
}

impl EventSource for MemoryEventSource {
    fn fetch(&self, req: &FetchRequest<'_>) -> Result<Vec<Event>, SourceError> {
        let log = self.lock();
        Ok(log
            .events
            .iter()
            .filter(|e| e.position > req.after_position && matches_any(req.filters, e))
            .take(req.limit)
            .cloned()
            .collect())
    }

    fn head(&self) -> Result<u64, SourceError> {
        Ok(self.lock().head)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
