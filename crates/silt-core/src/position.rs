//! Durable processing positions.
//!
//! One row per projection records how far it has folded the event log. The
//! row is written in the same transaction as the batch it covers, so a
//! position can never point past state that is not durably applied. Reading
//! it back inside the apply transaction is the at-most-one-committer guard:
//! a mismatch against the position the batch was fetched from means another
//! worker instance got there first.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};

const CREATE_SQL: &str = r"
CREATE TABLE IF NOT EXISTS projection_positions (
    projection_name TEXT PRIMARY KEY,
    position        INTEGER NOT NULL DEFAULT 0,
    updated_at_us   INTEGER NOT NULL DEFAULT 0
);
";

/// Create the positions table if missing. Idempotent.
///
/// # Errors
///
/// Store errors from the DDL.
pub fn ensure_table(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(CREATE_SQL)
}

/// Read a projection's stored position; 0 when it has never committed.
///
/// # Errors
///
/// Store errors from the lookup.
pub fn read(conn: &Connection, projection: &str) -> Result<u64, rusqlite::Error> {
    let stored: Option<i64> = conn
        .query_row(
            "SELECT position FROM projection_positions WHERE projection_name = ?1",
            [projection],
            |row| row.get(0),
        )
        .optional()?;
    Ok(stored.map_or(0, |p| u64::try_from(p).unwrap_or_default()))
}

/// Upsert a projection's position. Callers run this inside the same
/// transaction as the batch the position covers.
///
/// # Errors
///
/// Store errors from the upsert.
pub fn write(conn: &Connection, projection: &str, position: u64) -> Result<(), rusqlite::Error> {
    let now_us = Utc::now().timestamp_micros();
    conn.execute(
        "INSERT INTO projection_positions (projection_name, position, updated_at_us) \
         VALUES (?1, ?2, ?3) \
         ON CONFLICT (projection_name) DO UPDATE SET \
         (position, updated_at_us) = (excluded.position, excluded.updated_at_us)",
        params![
            projection,
            i64::try_from(position).unwrap_or(i64::MAX),
            now_us
        ],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
