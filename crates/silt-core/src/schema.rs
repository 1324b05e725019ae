//! Projection table management.
//!
//! A projection owns one primary table and zero or more suffixed sub-tables.
//! Physical names are resolved in exactly one place, from the projection name
//! and its [`SchemaVersion`]: `projections_{name}{version}` for the primary
//! table and `projections_{name}{version}_{suffix}` for sub-tables. Evolving
//! a projection's shape means bumping the version; the new tables start empty
//! and refill from position 0 while the old ones are left behind untouched.
//!
//! Bootstrap is idempotent (`CREATE TABLE IF NOT EXISTS`) and runs in one
//! transaction, followed by a shape check via `pragma_table_info`: every
//! declared column must exist. Failing either is fatal for the projection —
//! the engine refuses to consume events against an unverified table.

use rusqlite::Connection;
use std::fmt;

/// Explicit schema version of a projection, rendered into physical names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SchemaVersion(pub u32);

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reference to one of a projection's physical tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableRef {
    /// The projection's primary table.
    Primary,
    /// A declared sub-table, by suffix.
    Suffix(&'static str),
}

/// Column types supported at creation time.
///
/// `Timestamp` and `Boolean` are stored as INTEGER (epoch microseconds and
/// 0/1 respectively); the distinction exists for schema readability only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Integer,
    Real,
    Blob,
    Timestamp,
    Boolean,
}

impl ColumnType {
    #[must_use]
    const fn sql(self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Integer | Self::Timestamp | Self::Boolean => "INTEGER",
            Self::Real => "REAL",
            Self::Blob => "BLOB",
        }
    }
}

/// One column declaration. Columns are NOT NULL unless marked nullable.
#[derive(Debug, Clone)]
pub struct ColumnDef {
    name: &'static str,
    ty: ColumnType,
    nullable: bool,
    default: Option<&'static str>,
}

impl ColumnDef {
    #[must_use]
    pub const fn new(name: &'static str, ty: ColumnType) -> Self {
        Self {
            name,
            ty,
            nullable: false,
            default: None,
        }
    }

    #[must_use]
    pub const fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Default value as a SQL literal (e.g. `"0"`, `"''"`), applied at
    /// creation time only.
    #[must_use]
    pub const fn with_default(mut self, literal: &'static str) -> Self {
        self.default = Some(literal);
        self
    }

    fn render(&self, out: &mut String) {
        out.push_str("    ");
        out.push_str(self.name);
        out.push(' ');
        out.push_str(self.ty.sql());
        if !self.nullable {
            out.push_str(" NOT NULL");
        }
        if let Some(default) = self.default {
            out.push_str(" DEFAULT ");
            out.push_str(default);
        }
    }
}

/// Secondary (non-unique) index; the physical name is prefixed with the
/// resolved table name, so version bumps get fresh indexes for free.
#[derive(Debug, Clone)]
pub struct IndexDef {
    name: &'static str,
    columns: Vec<&'static str>,
}

impl IndexDef {
    #[must_use]
    pub fn new(name: &'static str, columns: &[&'static str]) -> Self {
        Self {
            name,
            columns: columns.to_vec(),
        }
    }
}

/// Sub-table foreign key into the primary table, `ON DELETE CASCADE`.
#[derive(Debug, Clone)]
struct ForeignKey {
    columns: Vec<&'static str>,
    parent_columns: Vec<&'static str>,
}

/// Declaration of one physical table of a projection.
#[derive(Debug, Clone)]
pub struct TableDef {
    suffix: Option<&'static str>,
    columns: Vec<ColumnDef>,
    primary_key: Vec<&'static str>,
    indexes: Vec<IndexDef>,
    foreign_key: Option<ForeignKey>,
}

impl TableDef {
    /// Declare the projection's primary table.
    #[must_use]
    pub const fn primary() -> Self {
        Self {
            suffix: None,
            columns: Vec::new(),
            primary_key: Vec::new(),
            indexes: Vec::new(),
            foreign_key: None,
        }
    }

    /// Declare a sub-table with the given suffix.
    #[must_use]
    pub const fn sub(suffix: &'static str) -> Self {
        Self {
            suffix: Some(suffix),
            columns: Vec::new(),
            primary_key: Vec::new(),
            indexes: Vec::new(),
            foreign_key: None,
        }
    }

    #[must_use]
    pub fn column(mut self, def: ColumnDef) -> Self {
        self.columns.push(def);
        self
    }

    #[must_use]
    pub fn primary_key(mut self, columns: &[&'static str]) -> Self {
        self.primary_key = columns.to_vec();
        self
    }

    #[must_use]
    pub fn index(mut self, def: IndexDef) -> Self {
        self.indexes.push(def);
        self
    }

    /// Reference the primary table's `parent_columns` from this sub-table's
    /// `columns`, cascading deletes.
    #[must_use]
    pub fn foreign_key(
        mut self,
        columns: &[&'static str],
        parent_columns: &[&'static str],
    ) -> Self {
        self.foreign_key = Some(ForeignKey {
            columns: columns.to_vec(),
            parent_columns: parent_columns.to_vec(),
        });
        self
    }
}

/// Errors from schema validation and bootstrap. All fatal: a projection
/// never consumes events against an unverified table shape.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("projection {projection} declares no primary table")]
    NoPrimaryTable { projection: &'static str },

    #[error("table {table} missing from store after bootstrap")]
    TableMissing { table: String },

    #[error("table {table} exists without expected column {column}")]
    ColumnMissing { table: String, column: &'static str },

    #[error("schema bootstrap store error: {0}")]
    Store(#[from] rusqlite::Error),
}

/// A named, versioned projection: its tables, keys, and indexes.
#[derive(Debug, Clone)]
pub struct ProjectionSchema {
    name: &'static str,
    version: SchemaVersion,
    tables: Vec<TableDef>,
}

impl ProjectionSchema {
    #[must_use]
    pub const fn new(name: &'static str, version: SchemaVersion) -> Self {
        Self {
            name,
            version,
            tables: Vec::new(),
        }
    }

    #[must_use]
    pub fn table(mut self, def: TableDef) -> Self {
        self.tables.push(def);
        self
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub const fn version(&self) -> SchemaVersion {
        self.version
    }

    /// Physical name of the primary table: `projections_{name}{version}`.
    #[must_use]
    pub fn base_name(&self) -> String {
        format!("projections_{}{}", self.name, self.version)
    }

    /// Resolve a [`TableRef`] to its physical name.
    ///
    /// Returns `None` for a suffix the projection never declared; callers
    /// surface that as a statement-contract error.
    #[must_use]
    pub fn table_name(&self, table: TableRef) -> Option<String> {
        match table {
            TableRef::Primary => Some(self.base_name()),
            TableRef::Suffix(suffix) => self
                .tables
                .iter()
                .any(|t| t.suffix == Some(suffix))
                .then(|| format!("{}_{suffix}", self.base_name())),
        }
    }

    /// Create missing tables and indexes, then verify the shape.
    ///
    /// All DDL runs in one transaction with IF NOT EXISTS semantics, so
    /// re-running against an already-bootstrapped store is a no-op.
    ///
    /// # Errors
    ///
    /// [`SchemaError::NoPrimaryTable`] for a table-less declaration;
    /// [`SchemaError::TableMissing`] / [`SchemaError::ColumnMissing`] when an
    /// existing table does not match the declared shape; store errors from
    /// the DDL itself.
    pub fn bootstrap(&self, conn: &mut Connection) -> Result<(), SchemaError> {
        if !self.tables.iter().any(|t| t.suffix.is_none()) {
            return Err(SchemaError::NoPrimaryTable {
                projection: self.name,
            });
        }

        let mut ddl = String::new();
        for table in &self.tables {
            self.render_table(table, &mut ddl);
        }

        let tx = conn.transaction()?;
        tx.execute_batch(&ddl)?;
        tx.commit()?;

        self.verify(conn)
    }

    /// Physical name for a table declaration.
    fn physical_name(&self, table: &TableDef) -> String {
        table.suffix.map_or_else(
            || self.base_name(),
            |suffix| format!("{}_{suffix}", self.base_name()),
        )
    }

    fn render_table(&self, table: &TableDef, out: &mut String) {
        let physical = self.physical_name(table);

        out.push_str("CREATE TABLE IF NOT EXISTS ");
        out.push_str(&physical);
        out.push_str(" (\n");
        for (i, column) in table.columns.iter().enumerate() {
            if i > 0 {
                out.push_str(",\n");
            }
            column.render(out);
        }
        if !table.primary_key.is_empty() {
            out.push_str(",\n    PRIMARY KEY (");
            out.push_str(&table.primary_key.join(", "));
            out.push(')');
        }
        if let Some(fk) = &table.foreign_key {
            out.push_str(",\n    FOREIGN KEY (");
            out.push_str(&fk.columns.join(", "));
            out.push_str(") REFERENCES ");
            out.push_str(&self.base_name());
            out.push_str(" (");
            out.push_str(&fk.parent_columns.join(", "));
            out.push_str(") ON DELETE CASCADE");
        }
        out.push_str("\n);\n");

        for index in &table.indexes {
            out.push_str("CREATE INDEX IF NOT EXISTS idx_");
            out.push_str(&physical);
            out.push('_');
            out.push_str(index.name);
            out.push_str(" ON ");
            out.push_str(&physical);
            out.push_str(" (");
            out.push_str(&index.columns.join(", "));
            out.push_str(");\n");
        }
    }

    /// Every declared column must exist in the store. Extra columns from
    /// older deployments are tolerated.
    fn verify(&self, conn: &Connection) -> Result<(), SchemaError> {
        for table in &self.tables {
            let physical = self.physical_name(table);
            let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1) ORDER BY cid")?;
            let existing: Vec<String> = stmt
                .query_map([&physical], |row| row.get(0))?
                .collect::<Result<_, _>>()?;

            if existing.is_empty() {
                return Err(SchemaError::TableMissing { table: physical });
            }
            for column in &table.columns {
                if !existing.iter().any(|c| c == column.name) {
                    return Err(SchemaError::ColumnMissing {
                        table: physical,
                        column: column.name,
                    });
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
