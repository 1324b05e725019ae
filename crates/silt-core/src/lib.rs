//! silt-core library.
//!
//! An event-sourced projection runtime: committed events fold into SQLite
//! read models, one projection at a time, exactly once.
//!
//! - [`event`]: the event shape, source adapter trait, and an in-memory log
//! - [`registry`]: reducer registration and per-event dispatch
//! - [`statement`]: typed mutations rendered to parameterized SQL
//! - [`schema`]: versioned table declarations, bootstrap, and verification
//! - [`position`]: the durable per-projection checkpoint row
//! - [`runner`]: the fetch → reduce → validate → apply → advance cycle
//! - [`runtime`]: one supervised worker thread per projection
//!
//! # Conventions
//!
//! - **Errors**: typed `thiserror` enums per module; `anyhow::Result` only at
//!   the embedding boundary.
//! - **Logging**: `tracing` macros (`info!`, `warn!`, `error!`, `debug!`)
//!   with structured fields.

pub mod config;
pub mod db;
pub mod error;
pub mod event;
pub mod position;
pub mod registry;
pub mod runner;
pub mod runtime;
pub mod schema;
pub mod statement;

pub use config::{EngineConfig, RetryConfig, RunnerConfig, load_config};
pub use db::open_store;
pub use error::ErrorCode;
pub use event::{
    AggregateType, Event, EventFilter, EventSource, EventType, FetchRequest, MemoryEventSource,
    SourceError,
};
pub use registry::{Reduce, ReduceError, ReducerRegistry, RegistryBuilder, expect_event_type};
pub use runner::{CycleReport, ProjectionRunner, RunnerError};
pub use runtime::{ProjectionRuntime, RuntimeError, WorkerStatus};
pub use schema::{
    ColumnDef, ColumnType, IndexDef, ProjectionSchema, SchemaError, SchemaVersion, TableDef,
    TableRef,
};
pub use statement::{
    Column, Cond, EventMeta, SqlQuery, SqlValue, Statement, StatementError, TableOp,
};
