use std::fmt;

/// Machine-readable error codes for operator and agent-facing diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    SchemaBootstrapFailed,
    SchemaMismatch,
    WrongEventType,
    MissingReducer,
    MalformedPayload,
    EmptyStatement,
    MissingCondition,
    UnknownSubTable,
    BadConflictKey,
    OutOfOrderBatch,
    PositionConflict,
    StoreBusy,
    RetriesExhausted,
    SourceUnavailable,
    InternalUnexpected,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::SchemaBootstrapFailed => "E1001",
            Self::SchemaMismatch => "E1002",
            Self::WrongEventType => "E2001",
            Self::MissingReducer => "E2002",
            Self::MalformedPayload => "E2003",
            Self::EmptyStatement => "E3001",
            Self::MissingCondition => "E3002",
            Self::UnknownSubTable => "E3003",
            Self::BadConflictKey => "E3004",
            Self::OutOfOrderBatch => "E4001",
            Self::PositionConflict => "E4002",
            Self::StoreBusy => "E5001",
            Self::RetriesExhausted => "E5002",
            Self::SourceUnavailable => "E5003",
            Self::InternalUnexpected => "E9001",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::SchemaBootstrapFailed => "Projection schema bootstrap failed",
            Self::SchemaMismatch => "Projection table shape mismatch",
            Self::WrongEventType => "Reducer received wrong event type",
            Self::MissingReducer => "No reducer registered for event",
            Self::MalformedPayload => "Event payload failed to deserialize",
            Self::EmptyStatement => "Statement carries no writable columns",
            Self::MissingCondition => "Statement carries no conditions",
            Self::UnknownSubTable => "Statement targets an undeclared sub-table",
            Self::BadConflictKey => "Upsert conflict key missing from insert columns",
            Self::OutOfOrderBatch => "Event batch violates ordering",
            Self::PositionConflict => "Another worker advanced the position",
            Self::StoreBusy => "Projection store busy",
            Self::RetriesExhausted => "Transient retries exhausted",
            Self::SourceUnavailable => "Event source unavailable",
            Self::InternalUnexpected => "Internal unexpected error",
        }
    }

    /// Optional remediation hint that can be surfaced to operators and agents.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::SchemaBootstrapFailed => {
                Some("Check store permissions and DDL; the worker will not start until this passes.")
            }
            Self::SchemaMismatch => {
                Some("Bump the projection's SchemaVersion instead of editing tables in place.")
            }
            Self::WrongEventType => {
                Some("Fix the registry wiring: the reducer's expected event types are in the error.")
            }
            Self::MissingReducer => {
                Some("Register a reducer for this (aggregate, event type) pair or drop it from the filters.")
            }
            Self::MalformedPayload => {
                Some("Inspect the offending event; payloads are never coerced into partial writes.")
            }
            Self::EmptyStatement => Some("Return a no-op statement when no relevant fields are set."),
            Self::MissingCondition => {
                Some("Updates and deletes must be scoped; include at least the instance condition.")
            }
            Self::UnknownSubTable => Some("Declare the sub-table suffix on the projection schema."),
            Self::BadConflictKey => {
                Some("Every conflict-key column must also appear in the upsert's insert columns.")
            }
            Self::OutOfOrderBatch => None,
            Self::PositionConflict => {
                Some("Harmless during rolling deploys; statements the other worker covered are skipped.")
            }
            Self::StoreBusy => Some("Retry after the competing writer commits or the busy timeout grows."),
            Self::RetriesExhausted => {
                Some("Worker is stalled with its position intact; watch lag and clear the store fault.")
            }
            Self::SourceUnavailable => Some("Check event log connectivity; the position is unaffected."),
            Self::InternalUnexpected => Some("Retry once. If persistent, report a bug with logs."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}
