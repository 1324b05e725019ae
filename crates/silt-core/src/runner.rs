//! Per-projection execution engine.
//!
//! One runner owns one projection: its schema, its reducer registry, its
//! store connection, and its cached position. A cycle is fetch → reduce →
//! validate → apply → advance:
//!
//! - fetch pulls committed events strictly after the position, in global
//!   commit order, narrowed to the registry's filters;
//! - reduce dispatches each event in order, failing the whole batch on the
//!   first reducer error;
//! - validate rejects batches whose global positions or per-aggregate
//!   sequences do not strictly advance;
//! - apply runs every rendered mutation inside a single `BEGIN IMMEDIATE`
//!   transaction. The stored position is re-read inside the transaction:
//!   statements at or below it were committed by another worker instance
//!   and are skipped, which is what makes retries and rolling deploys
//!   idempotent;
//! - advance upserts the position row in the same transaction, then commits.
//!
//! Transient store errors retry the same batch from the same unadvanced
//! position with bounded backoff; everything else aborts the cycle with the
//! position untouched.

use crate::config::RunnerConfig;
use crate::error::ErrorCode;
use crate::event::{Event, EventSource, FetchRequest, SourceError};
use crate::position;
use crate::registry::{ReduceError, ReducerRegistry};
use crate::schema::{ProjectionSchema, SchemaError};
use crate::statement::{Statement, StatementError};
use rusqlite::{Connection, ErrorCode as SqliteCode, TransactionBehavior};
use std::collections::HashMap;
use std::sync::Arc;

/// Errors out of a runner cycle.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Reduce(#[from] ReduceError),

    #[error(transparent)]
    Statement(#[from] StatementError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("event at position {position} does not advance the batch (last {last})")]
    OutOfOrderPosition { position: u64, last: u64 },

    #[error("sequence {sequence} of aggregate {aggregate_id} regresses within the batch (last {last})")]
    OutOfOrderSequence {
        aggregate_id: String,
        sequence: u64,
        last: u64,
    },

    #[error("retries exhausted after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<RunnerError>,
    },
}

impl RunnerError {
    /// Whether retrying the same batch from the same position can succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(e) => is_busy(e),
            Self::Source(SourceError::Unavailable { .. }) => true,
            _ => false,
        }
    }

    /// Stable machine-readable code for this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Schema(SchemaError::TableMissing { .. } | SchemaError::ColumnMissing { .. }) => {
                ErrorCode::SchemaMismatch
            }
            Self::Schema(_) => ErrorCode::SchemaBootstrapFailed,
            Self::Reduce(ReduceError::WrongEventType { .. }) => ErrorCode::WrongEventType,
            Self::Reduce(ReduceError::MissingReducer { .. }) => ErrorCode::MissingReducer,
            Self::Reduce(ReduceError::MalformedPayload(_)) => ErrorCode::MalformedPayload,
            Self::Statement(StatementError::NoValues { .. }) => ErrorCode::EmptyStatement,
            Self::Statement(StatementError::NoConditions { .. }) => ErrorCode::MissingCondition,
            Self::Statement(StatementError::UnknownSuffix { .. }) => ErrorCode::UnknownSubTable,
            Self::Statement(StatementError::BadConflictKey { .. }) => ErrorCode::BadConflictKey,
            Self::Source(_) => ErrorCode::SourceUnavailable,
            Self::Store(e) if is_busy(e) => ErrorCode::StoreBusy,
            Self::Store(_) => ErrorCode::InternalUnexpected,
            Self::OutOfOrderPosition { .. } | Self::OutOfOrderSequence { .. } => {
                ErrorCode::OutOfOrderBatch
            }
            Self::RetriesExhausted { .. } => ErrorCode::RetriesExhausted,
        }
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(SqliteCode::DatabaseBusy | SqliteCode::DatabaseLocked)
    )
}

/// Summary of one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CycleReport {
    /// Events returned by the fetch.
    pub fetched: usize,
    /// Statements whose mutations reached the store.
    pub applied: usize,
    /// Statements skipped because another worker had already committed them.
    pub skipped: usize,
    /// Explicit no-op statements (consumed, nothing written).
    pub no_ops: usize,
    /// Position after the cycle.
    pub position: u64,
}

impl CycleReport {
    /// True when the fetch returned nothing and the projection is caught up.
    #[must_use]
    pub const fn caught_up(&self) -> bool {
        self.fetched == 0
    }
}

struct ApplyStats {
    applied: usize,
    skipped: usize,
    no_ops: usize,
    position: u64,
}

/// The per-projection state machine.
pub struct ProjectionRunner {
    schema: ProjectionSchema,
    registry: ReducerRegistry,
    source: Arc<dyn EventSource>,
    conn: Connection,
    config: RunnerConfig,
    /// Position row key: the versioned physical table name, so a schema
    /// version bump starts from zero and replays into the fresh tables.
    position_key: String,
    position: u64,
}

impl std::fmt::Debug for ProjectionRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionRunner")
            .field("projection", &self.schema.name())
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}

impl ProjectionRunner {
    /// Bootstrap the projection and load its stored position.
    ///
    /// # Errors
    ///
    /// Schema bootstrap/verification failures and store errors. All fatal:
    /// a runner that cannot verify its tables never consumes events.
    pub fn new(
        schema: ProjectionSchema,
        registry: ReducerRegistry,
        source: Arc<dyn EventSource>,
        mut conn: Connection,
        config: RunnerConfig,
    ) -> Result<Self, RunnerError> {
        schema.bootstrap(&mut conn)?;
        position::ensure_table(&conn)?;
        let position_key = schema.base_name();
        let position = position::read(&conn, &position_key)?;

        tracing::info!(
            projection = schema.name(),
            version = %schema.version(),
            position,
            reducers = registry.len(),
            "projection runner ready"
        );

        Ok(Self {
            schema,
            registry,
            source,
            conn,
            config,
            position_key,
            position,
        })
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.schema.name()
    }

    /// Position of the last durably applied event.
    #[must_use]
    pub const fn position(&self) -> u64 {
        self.position
    }

    #[must_use]
    pub const fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// The worker's store connection, for querying the derived tables.
    #[must_use]
    pub const fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Events between the log head and this projection's position.
    ///
    /// # Errors
    ///
    /// Source errors from the head query.
    pub fn lag(&self) -> Result<u64, RunnerError> {
        let head = self.source.head()?;
        Ok(head.saturating_sub(self.position))
    }

    /// Run one fetch → reduce → validate → apply → advance cycle.
    ///
    /// # Errors
    ///
    /// Any [`RunnerError`]; on error the position is unchanged and the next
    /// cycle re-fetches the same batch.
    pub fn run_cycle(&mut self) -> Result<CycleReport, RunnerError> {
        let events = self.source.fetch(&FetchRequest {
            projection: self.schema.name(),
            after_position: self.position,
            filters: self.registry.filters(),
            limit: self.config.batch_limit,
        })?;

        if events.is_empty() {
            return Ok(CycleReport {
                position: self.position,
                ..CycleReport::default()
            });
        }

        validate_batch(self.position, &events)?;

        let statements = events
            .iter()
            .map(|event| self.registry.dispatch(event))
            .collect::<Result<Vec<_>, _>>()?;

        let stats = self.apply_with_retry(&statements)?;
        self.position = stats.position;

        tracing::info!(
            projection = self.schema.name(),
            fetched = events.len(),
            applied = stats.applied,
            skipped = stats.skipped,
            no_ops = stats.no_ops,
            position = stats.position,
            "cycle complete"
        );

        Ok(CycleReport {
            fetched: events.len(),
            applied: stats.applied,
            skipped: stats.skipped,
            no_ops: stats.no_ops,
            position: stats.position,
        })
    }

    fn apply_with_retry(&mut self, statements: &[Statement]) -> Result<ApplyStats, RunnerError> {
        let mut attempt: u32 = 0;
        loop {
            match self.apply_batch(statements) {
                Ok(stats) => return Ok(stats),
                Err(err) if err.is_transient() => {
                    attempt += 1;
                    if attempt >= self.config.retry.max_attempts {
                        return Err(RunnerError::RetriesExhausted {
                            attempts: attempt,
                            source: Box::new(err),
                        });
                    }
                    let delay = self.config.retry.delay_for(attempt - 1);
                    tracing::warn!(
                        projection = self.schema.name(),
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "transient store error, retrying batch"
                    );
                    std::thread::sleep(delay);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Apply a reduced batch in one transaction, advancing the position row.
    ///
    /// `BEGIN IMMEDIATE` takes the write lock up front, so the in-transaction
    /// position read is stable until commit. Statements at or below that
    /// position were already committed by a previous incarnation or a
    /// concurrent worker and are skipped.
    fn apply_batch(&mut self, statements: &[Statement]) -> Result<ApplyStats, RunnerError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let stored = position::read(&tx, &self.position_key)?;
        if stored != self.position {
            tracing::warn!(
                projection = self.schema.name(),
                code = %ErrorCode::PositionConflict,
                cached = self.position,
                stored,
                "another worker advanced the position; covered statements will be skipped"
            );
        }

        let mut current = stored;
        let mut stats = ApplyStats {
            applied: 0,
            skipped: 0,
            no_ops: 0,
            position: stored,
        };

        for statement in statements {
            let meta = statement.meta();
            if meta.position <= current {
                stats.skipped += 1;
                continue;
            }

            if statement.is_no_op() {
                stats.no_ops += 1;
            } else {
                for query in statement.render(&self.schema)? {
                    let changed = tx.execute(
                        &query.sql,
                        rusqlite::params_from_iter(query.params.iter()),
                    )?;
                    tracing::debug!(
                        projection = self.schema.name(),
                        position = meta.position,
                        sequence = meta.sequence,
                        aggregate = %meta.aggregate_type,
                        rows = changed,
                        "statement applied"
                    );
                }
                stats.applied += 1;
            }
            current = meta.position;
        }

        if current > stored {
            position::write(&tx, &self.position_key, current)?;
        }
        tx.commit()?;

        stats.position = current;
        Ok(stats)
    }
}

/// Reject batches that violate the ordering contract: global positions must
/// strictly advance past `after`, and no aggregate's sequence may regress.
fn validate_batch(after: u64, events: &[Event]) -> Result<(), RunnerError> {
    let mut last_position = after;
    let mut last_sequences: HashMap<(&str, &str), u64> = HashMap::new();

    for event in events {
        if event.position <= last_position {
            return Err(RunnerError::OutOfOrderPosition {
                position: event.position,
                last: last_position,
            });
        }
        last_position = event.position;

        let key = (event.instance_id.as_str(), event.aggregate_id.as_str());
        if let Some(&last) = last_sequences.get(&key) {
            if event.sequence <= last {
                return Err(RunnerError::OutOfOrderSequence {
                    aggregate_id: event.aggregate_id.clone(),
                    sequence: event.sequence,
                    last,
                });
            }
        }
        last_sequences.insert(key, event.sequence);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
