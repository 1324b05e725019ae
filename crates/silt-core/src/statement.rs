//! Statement building: the pure layer between reducers and the store.
//!
//! A reducer turns one event into a [`Statement`]: zero or more table
//! operations plus a back-reference to the originating event. Statements are
//! plain data; [`Statement::render`] turns them into `(sql, params)` pairs
//! for the execution engine, so the whole layer is testable without a store.
//!
//! Contract rules enforced here rather than trusted per reducer:
//!
//! - an empty SET clause is never emitted (`NoValues`),
//! - updates and deletes are always scoped (`NoConditions`),
//! - ops only target tables the projection declares (`UnknownSuffix`),
//! - upserts merge instead of blindly overwriting: conflict-key columns and
//!   insert-only columns stay out of the conflict-update set.

use crate::event::{AggregateType, Event};
use crate::schema::{ProjectionSchema, TableRef};
use chrono::{DateTime, Utc};
use rusqlite::ToSql;
use rusqlite::types::{ToSqlOutput, Value, ValueRef};

/// Conventional tenant-scoping column present on every projection table.
pub const INSTANCE_ID_COL: &str = "instance_id";

/// Conventional owner column targeted by ownership-removal cascades.
pub const RESOURCE_OWNER_COL: &str = "resource_owner";

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// A value bound into a rendered statement.
///
/// Timestamps bind as epoch microseconds, booleans as 0/1, matching the
/// column types the schema layer declares.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Self::Null => ToSqlOutput::Owned(Value::Null),
            Self::Integer(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            Self::Real(r) => ToSqlOutput::Owned(Value::Real(*r)),
            Self::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Self::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<u32> for SqlValue {
    fn from(v: u32) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<u64> for SqlValue {
    fn from(v: u64) -> Self {
        Self::Integer(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        Self::Real(v)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Blob(v)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(v: DateTime<Utc>) -> Self {
        Self::Integer(v.timestamp_micros())
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

// ---------------------------------------------------------------------------
// Columns and conditions
// ---------------------------------------------------------------------------

/// One (column, value) pair of a write.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: &'static str,
    pub value: SqlValue,
    insert_only: bool,
}

impl Column {
    #[must_use]
    pub fn new(name: &'static str, value: impl Into<SqlValue>) -> Self {
        Self {
            name,
            value: value.into(),
            insert_only: false,
        }
    }

    /// A column written on insert but excluded from an upsert's
    /// conflict-update set. This is how `creation_date` keeps its first
    /// value across replays while `change_date`/`sequence` track the latest.
    #[must_use]
    pub fn insert_only(name: &'static str, value: impl Into<SqlValue>) -> Self {
        Self {
            name,
            value: value.into(),
            insert_only: true,
        }
    }
}

/// One equality condition of an update/delete WHERE clause.
#[derive(Debug, Clone, PartialEq)]
pub struct Cond {
    pub name: &'static str,
    pub value: SqlValue,
}

impl Cond {
    #[must_use]
    pub fn eq(name: &'static str, value: impl Into<SqlValue>) -> Self {
        Self {
            name,
            value: value.into(),
        }
    }

    /// Scope of an ownership-removal cascade: rows whose `resource_owner` is
    /// the removed owner's aggregate ID, inside the event's instance.
    #[must_use]
    pub fn owner_scope(event: &Event) -> Vec<Self> {
        vec![
            Self::eq(INSTANCE_ID_COL, event.instance_id.as_str()),
            Self::eq(RESOURCE_OWNER_COL, event.aggregate_id.as_str()),
        ]
    }

    /// Scope of an instance-removal cascade: every row of the removed
    /// instance, whose ID is the removal event's aggregate ID.
    #[must_use]
    pub fn instance_scope(event: &Event) -> Vec<Self> {
        vec![Self::eq(INSTANCE_ID_COL, event.aggregate_id.as_str())]
    }
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum OpKind {
    Create {
        cols: Vec<Column>,
    },
    Update {
        cols: Vec<Column>,
        conds: Vec<Cond>,
    },
    Delete {
        conds: Vec<Cond>,
    },
    Upsert {
        conflict: Vec<&'static str>,
        cols: Vec<Column>,
    },
}

/// One table mutation inside a statement.
#[derive(Debug, Clone, PartialEq)]
pub struct TableOp {
    table: TableRef,
    kind: OpKind,
}

impl TableOp {
    #[must_use]
    pub fn create(cols: Vec<Column>) -> Self {
        Self {
            table: TableRef::Primary,
            kind: OpKind::Create { cols },
        }
    }

    #[must_use]
    pub fn create_in(suffix: &'static str, cols: Vec<Column>) -> Self {
        Self {
            table: TableRef::Suffix(suffix),
            kind: OpKind::Create { cols },
        }
    }

    #[must_use]
    pub fn update(cols: Vec<Column>, conds: Vec<Cond>) -> Self {
        Self {
            table: TableRef::Primary,
            kind: OpKind::Update { cols, conds },
        }
    }

    #[must_use]
    pub fn update_in(suffix: &'static str, cols: Vec<Column>, conds: Vec<Cond>) -> Self {
        Self {
            table: TableRef::Suffix(suffix),
            kind: OpKind::Update { cols, conds },
        }
    }

    #[must_use]
    pub fn delete(conds: Vec<Cond>) -> Self {
        Self {
            table: TableRef::Primary,
            kind: OpKind::Delete { conds },
        }
    }

    #[must_use]
    pub fn delete_in(suffix: &'static str, conds: Vec<Cond>) -> Self {
        Self {
            table: TableRef::Suffix(suffix),
            kind: OpKind::Delete { conds },
        }
    }

    #[must_use]
    pub fn upsert(conflict: &[&'static str], cols: Vec<Column>) -> Self {
        Self {
            table: TableRef::Primary,
            kind: OpKind::Upsert {
                conflict: conflict.to_vec(),
                cols,
            },
        }
    }

    #[must_use]
    pub fn upsert_in(suffix: &'static str, conflict: &[&'static str], cols: Vec<Column>) -> Self {
        Self {
            table: TableRef::Suffix(suffix),
            kind: OpKind::Upsert {
                conflict: conflict.to_vec(),
                cols,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Statements
// ---------------------------------------------------------------------------

/// Back-reference from a statement to its originating event, for position
/// bookkeeping and ordering checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventMeta {
    pub instance_id: String,
    pub aggregate_type: AggregateType,
    pub aggregate_id: String,
    pub resource_owner: String,
    pub sequence: u64,
    pub position: u64,
    pub creation_date: DateTime<Utc>,
}

impl From<&Event> for EventMeta {
    fn from(event: &Event) -> Self {
        Self {
            instance_id: event.instance_id.clone(),
            aggregate_type: event.aggregate_type.clone(),
            aggregate_id: event.aggregate_id.clone(),
            resource_owner: event.resource_owner.clone(),
            sequence: event.sequence,
            position: event.position,
            creation_date: event.creation_date,
        }
    }
}

/// Contract violations caught at render time. All are programming errors in
/// a reducer or projection declaration, fatal for the batch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StatementError {
    #[error("statement for table {table} has no writable columns")]
    NoValues { table: String },

    #[error("statement for table {table} has no conditions")]
    NoConditions { table: String },

    #[error("projection {projection} declares no sub-table with suffix {suffix}")]
    UnknownSuffix {
        projection: &'static str,
        suffix: &'static str,
    },

    #[error("upsert on table {table} lists conflict column {column} outside its insert columns")]
    BadConflictKey {
        table: String,
        column: &'static str,
    },
}

/// One rendered mutation ready for execution.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlQuery {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

/// The reduction of one event: zero or more ordered table operations.
///
/// Zero operations is the explicit no-op; more than one is the
/// multi-statement, applied in order and atomically with its siblings.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    meta: EventMeta,
    ops: Vec<TableOp>,
}

impl Statement {
    /// Insert one row into the primary table.
    #[must_use]
    pub fn create(event: &Event, cols: Vec<Column>) -> Self {
        Self::multi(event, vec![TableOp::create(cols)])
    }

    /// Update primary-table rows matching `conds`.
    #[must_use]
    pub fn update(event: &Event, cols: Vec<Column>, conds: Vec<Cond>) -> Self {
        Self::multi(event, vec![TableOp::update(cols, conds)])
    }

    /// Delete primary-table rows matching `conds`. A delete matching zero
    /// rows is an idempotent no-op at execution time, not an error.
    #[must_use]
    pub fn delete(event: &Event, conds: Vec<Cond>) -> Self {
        Self::multi(event, vec![TableOp::delete(conds)])
    }

    /// Insert-or-merge one primary-table row keyed by `conflict`.
    #[must_use]
    pub fn upsert(event: &Event, conflict: &[&'static str], cols: Vec<Column>) -> Self {
        Self::multi(event, vec![TableOp::upsert(conflict, cols)])
    }

    /// The explicit skip: the event is consumed and the position advances,
    /// but nothing reaches the store.
    #[must_use]
    pub fn no_op(event: &Event) -> Self {
        Self::multi(event, Vec::new())
    }

    /// Ordered operations derived from one event, applied as a unit.
    #[must_use]
    pub fn multi(event: &Event, ops: Vec<TableOp>) -> Self {
        Self {
            meta: EventMeta::from(event),
            ops,
        }
    }

    /// Hard ownership-removal cascade: delete every row of the removed owner.
    #[must_use]
    pub fn delete_by_owner(event: &Event) -> Self {
        Self::delete(event, Cond::owner_scope(event))
    }

    /// Soft ownership-removal cascade: flag rows of the removed owner
    /// (callers pass the flag plus bookkeeping columns).
    #[must_use]
    pub fn update_by_owner(event: &Event, cols: Vec<Column>) -> Self {
        Self::update(event, cols, Cond::owner_scope(event))
    }

    /// Instance-removal cascade: drop every row of the removed instance.
    #[must_use]
    pub fn delete_by_instance(event: &Event) -> Self {
        Self::delete(event, Cond::instance_scope(event))
    }

    #[must_use]
    pub const fn meta(&self) -> &EventMeta {
        &self.meta
    }

    #[must_use]
    pub fn ops(&self) -> &[TableOp] {
        &self.ops
    }

    #[must_use]
    pub fn is_no_op(&self) -> bool {
        self.ops.is_empty()
    }

    /// Render every operation against `schema`, in order.
    ///
    /// A no-op renders to an empty list.
    ///
    /// # Errors
    ///
    /// Any [`StatementError`] contract violation; nothing is partially
    /// rendered.
    pub fn render(&self, schema: &ProjectionSchema) -> Result<Vec<SqlQuery>, StatementError> {
        self.ops.iter().map(|op| render_op(op, schema)).collect()
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn render_op(op: &TableOp, schema: &ProjectionSchema) -> Result<SqlQuery, StatementError> {
    let table = match op.table {
        TableRef::Primary => schema.base_name(),
        TableRef::Suffix(suffix) => {
            schema
                .table_name(op.table)
                .ok_or(StatementError::UnknownSuffix {
                    projection: schema.name(),
                    suffix,
                })?
        }
    };

    match &op.kind {
        OpKind::Create { cols } => render_create(&table, cols),
        OpKind::Update { cols, conds } => render_update(&table, cols, conds),
        OpKind::Delete { conds } => render_delete(&table, conds),
        OpKind::Upsert { conflict, cols } => render_upsert(&table, conflict, cols),
    }
}

fn render_create(table: &str, cols: &[Column]) -> Result<SqlQuery, StatementError> {
    if cols.is_empty() {
        return Err(StatementError::NoValues {
            table: table.to_string(),
        });
    }
    let names: Vec<&str> = cols.iter().map(|c| c.name).collect();
    let placeholders: Vec<String> = (1..=cols.len()).map(|i| format!("?{i}")).collect();
    Ok(SqlQuery {
        sql: format!(
            "INSERT INTO {table} ({}) VALUES ({})",
            names.join(", "),
            placeholders.join(", ")
        ),
        params: cols.iter().map(|c| c.value.clone()).collect(),
    })
}

fn render_update(table: &str, cols: &[Column], conds: &[Cond]) -> Result<SqlQuery, StatementError> {
    if cols.is_empty() {
        return Err(StatementError::NoValues {
            table: table.to_string(),
        });
    }
    if conds.is_empty() {
        return Err(StatementError::NoConditions {
            table: table.to_string(),
        });
    }

    let set = if cols.len() == 1 {
        format!("{} = ?1", cols[0].name)
    } else {
        let names: Vec<&str> = cols.iter().map(|c| c.name).collect();
        let placeholders: Vec<String> = (1..=cols.len()).map(|i| format!("?{i}")).collect();
        format!("({}) = ({})", names.join(", "), placeholders.join(", "))
    };
    let where_clause = render_where(conds, cols.len() + 1);

    let mut params: Vec<SqlValue> = cols.iter().map(|c| c.value.clone()).collect();
    params.extend(conds.iter().map(|c| c.value.clone()));

    Ok(SqlQuery {
        sql: format!("UPDATE {table} SET {set} WHERE {where_clause}"),
        params,
    })
}

fn render_delete(table: &str, conds: &[Cond]) -> Result<SqlQuery, StatementError> {
    if conds.is_empty() {
        return Err(StatementError::NoConditions {
            table: table.to_string(),
        });
    }
    Ok(SqlQuery {
        sql: format!("DELETE FROM {table} WHERE {}", render_where(conds, 1)),
        params: conds.iter().map(|c| c.value.clone()).collect(),
    })
}

fn render_upsert(
    table: &str,
    conflict: &[&'static str],
    cols: &[Column],
) -> Result<SqlQuery, StatementError> {
    if cols.is_empty() {
        return Err(StatementError::NoValues {
            table: table.to_string(),
        });
    }
    if conflict.is_empty() {
        return Err(StatementError::NoConditions {
            table: table.to_string(),
        });
    }
    for key in conflict {
        if !cols.iter().any(|c| c.name == *key) {
            return Err(StatementError::BadConflictKey {
                table: table.to_string(),
                column: key,
            });
        }
    }

    // The merge policy: conflict-key and insert-only columns keep their
    // original values; everything else takes the incoming row's.
    let update_cols: Vec<&str> = cols
        .iter()
        .filter(|c| !c.insert_only && !conflict.contains(&c.name))
        .map(|c| c.name)
        .collect();
    if update_cols.is_empty() {
        return Err(StatementError::NoValues {
            table: table.to_string(),
        });
    }

    let names: Vec<&str> = cols.iter().map(|c| c.name).collect();
    let placeholders: Vec<String> = (1..=cols.len()).map(|i| format!("?{i}")).collect();
    let set = if update_cols.len() == 1 {
        format!("{0} = excluded.{0}", update_cols[0])
    } else {
        let sources: Vec<String> = update_cols.iter().map(|c| format!("excluded.{c}")).collect();
        format!("({}) = ({})", update_cols.join(", "), sources.join(", "))
    };

    Ok(SqlQuery {
        sql: format!(
            "INSERT INTO {table} ({}) VALUES ({}) ON CONFLICT ({}) DO UPDATE SET {set}",
            names.join(", "),
            placeholders.join(", "),
            conflict.join(", ")
        ),
        params: cols.iter().map(|c| c.value.clone()).collect(),
    })
}

fn render_where(conds: &[Cond], first_param: usize) -> String {
    conds
        .iter()
        .enumerate()
        .map(|(i, c)| format!("({} = ?{})", c.name, first_param + i))
        .collect::<Vec<_>>()
        .join(" AND ")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
