//! # Schema Declarations and Store Initialization
//!
//! Every table in the store comes from a static [`Schema`]: the user models
//! registered in a [`Catalog`], plus the two built-in tables.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           Store Layout                                  │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  <Model>... (one per registered schema)   Label                         │
//! │  ┌─────────────────┐                      ┌─────────────────┐           │
//! │  │ pk fields (PK)  │◄─ parent (pk text) ──│ kind     (PK)   │           │
//! │  │ fields...       │                      │ parent   (PK)   │           │
//! │  │ fk ─────────────┼─► other model        │ name     (PK)   │           │
//! │  └─────────────────┘                      │ value           │           │
//! │                                           └─────────────────┘           │
//! │  EventHistory                   ctrlkit_metadata                        │
//! │  ┌─────────────────┐            ┌─────────────────┐                     │
//! │  │ id (PK)         │            │ key (PK)        │                     │
//! │  │ kind            │            │ value           │                     │
//! │  │ model   (JSON)  │            └─────────────────┘                     │
//! │  │ action          │                                                    │
//! │  │ updated (JSON)  │                                                    │
//! │  └─────────────────┘                                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Field Types
//!
//! | `FieldType` | Column  | JSON            |
//! |-------------|---------|-----------------|
//! | `Integer`   | INTEGER | number (i64)    |
//! | `Real`      | REAL    | number (f64)    |
//! | `Text`      | TEXT    | string          |
//! | `Bool`      | INTEGER | bool, as 0/1    |
//! | `Json`      | TEXT    | any, serialized |
//!
//! Primary key fields must be `Integer` or `Text` so the key has one textual
//! form, used both by [`Model::pk`](super::Model::pk) and by label lookups.

use std::time::Duration;

use rusqlite::Connection;
use tracing::debug;

use super::journal::EventHistory;
use super::label::Label;
use super::Model;
use crate::{Error, Result};

// =============================================================================
// Schema Version
// =============================================================================

/// Layout version of the built-in tables.
///
/// A store written with a different version is refused at open.
pub const SCHEMA_VERSION: i32 = 1;

const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS ctrlkit_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

/// Table names owned by the store itself.
const RESERVED: [&str; 3] = ["Label", "EventHistory", "ctrlkit_metadata"];

// =============================================================================
// Declarations
// =============================================================================

/// Column type of a declared field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// 64-bit signed integer.
    Integer,
    /// 64-bit float.
    Real,
    /// UTF-8 text.
    Text,
    /// Boolean stored as 0/1.
    Bool,
    /// Nested JSON value stored as text.
    Json,
}

impl FieldType {
    pub(crate) fn sql(self) -> &'static str {
        match self {
            FieldType::Integer | FieldType::Bool => "INTEGER",
            FieldType::Real => "REAL",
            FieldType::Text | FieldType::Json => "TEXT",
        }
    }
}

/// A foreign key reference to another table's field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForeignKey {
    /// Referenced table.
    pub table: &'static str,
    /// Referenced field.
    pub field: &'static str,
}

/// One declared field of a model.
///
/// Built with const builders so schemas can live in statics:
///
/// ```rust
/// use ctrlkit::model::{Field, FieldType};
///
/// const OWNER: Field = Field::new("owner", FieldType::Integer)
///     .nullable()
///     .references("Person", "id");
/// assert!(OWNER.nullable);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    /// Column name, equal to the serialized field name.
    pub name: &'static str,
    /// Column type.
    pub ty: FieldType,
    /// Part of the primary key.
    pub pk: bool,
    /// Accepts NULL.
    pub nullable: bool,
    /// Optional foreign key.
    pub fk: Option<ForeignKey>,
}

impl Field {
    /// A required, non-key field.
    pub const fn new(name: &'static str, ty: FieldType) -> Self {
        Self {
            name,
            ty,
            pk: false,
            nullable: false,
            fk: None,
        }
    }

    /// Marks the field as part of the primary key.
    pub const fn pk(mut self) -> Self {
        self.pk = true;
        self
    }

    /// Allows NULL.
    pub const fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Adds a foreign key with `ON DELETE CASCADE`.
    pub const fn references(mut self, table: &'static str, field: &'static str) -> Self {
        self.fk = Some(ForeignKey { table, field });
        self
    }
}

/// The static declaration of one table.
#[derive(Debug, PartialEq, Eq)]
pub struct Schema {
    /// Table name, also the model kind recorded in the journal.
    pub name: &'static str,
    /// Declared fields, in column order.
    pub fields: &'static [Field],
}

impl Schema {
    /// Declares a schema.
    pub const fn new(name: &'static str, fields: &'static [Field]) -> Self {
        Self { name, fields }
    }

    /// Looks up a field by name.
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Looks up a field, failing with `Error::Schema` when it is not declared.
    pub(crate) fn require(&self, name: &str) -> Result<&Field> {
        self.field(name).ok_or_else(|| {
            Error::Schema(format!("'{}' has no field '{}'", self.name, name))
        })
    }

    /// Primary key fields in declaration order.
    pub fn pk_fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter().filter(|f| f.pk)
    }

    /// Checks the declaration on its own. Foreign key targets are checked by
    /// [`Catalog::register`], which knows the other tables.
    pub fn validate(&self) -> Result<()> {
        if !is_identifier(self.name) {
            return Err(Error::Schema(format!(
                "invalid table name '{}'",
                self.name
            )));
        }
        if self.fields.is_empty() {
            return Err(Error::Schema(format!("'{}' declares no fields", self.name)));
        }
        for (i, field) in self.fields.iter().enumerate() {
            if !is_identifier(field.name) {
                return Err(Error::Schema(format!(
                    "'{}' has invalid field name '{}'",
                    self.name, field.name
                )));
            }
            if self.fields[..i].iter().any(|f| f.name == field.name) {
                return Err(Error::Schema(format!(
                    "'{}' declares field '{}' twice",
                    self.name, field.name
                )));
            }
            if field.pk {
                if field.nullable {
                    return Err(Error::Schema(format!(
                        "'{}.{}' is a primary key and cannot be nullable",
                        self.name, field.name
                    )));
                }
                if !matches!(field.ty, FieldType::Integer | FieldType::Text) {
                    return Err(Error::Schema(format!(
                        "'{}.{}' is a primary key and must be Integer or Text",
                        self.name, field.name
                    )));
                }
            }
            if let Some(fk) = field.fk {
                if !is_identifier(fk.table) || !is_identifier(fk.field) {
                    return Err(Error::Schema(format!(
                        "'{}.{}' references invalid target '{}.{}'",
                        self.name, field.name, fk.table, fk.field
                    )));
                }
            }
        }
        if self.pk_fields().next().is_none() {
            return Err(Error::Schema(format!(
                "'{}' declares no primary key",
                self.name
            )));
        }
        Ok(())
    }

    /// Builds the DDL statements for this table and its foreign key indexes.
    pub fn ddl(&self) -> Vec<String> {
        let mut columns: Vec<String> = self
            .fields
            .iter()
            .map(|f| {
                let mut col = format!("{} {}", quote(f.name), f.ty.sql());
                if !f.nullable {
                    col.push_str(" NOT NULL");
                }
                col
            })
            .collect();
        let pk: Vec<String> = self.pk_fields().map(|f| quote(f.name)).collect();
        columns.push(format!("PRIMARY KEY ({})", pk.join(", ")));
        for f in self.fields {
            if let Some(fk) = f.fk {
                columns.push(format!(
                    "FOREIGN KEY ({}) REFERENCES {}({}) ON DELETE CASCADE",
                    quote(f.name),
                    quote(fk.table),
                    quote(fk.field)
                ));
            }
        }

        let mut statements = vec![format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
            quote(self.name),
            columns.join(",\n    ")
        )];
        for f in self.fields.iter().filter(|f| f.fk.is_some()) {
            statements.push(format!(
                "CREATE INDEX IF NOT EXISTS {} ON {}({})",
                quote(&format!("{}_{}_fk", self.name, f.name)),
                quote(self.name),
                quote(f.name)
            ));
        }
        statements
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`
fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Quotes an identifier. Only called with validated names.
pub(crate) fn quote(name: &str) -> String {
    format!("\"{name}\"")
}

// =============================================================================
// Catalog
// =============================================================================

/// The fixed set of model schemas a [`Client`](super::Client) serves.
///
/// Registration order is DDL order, so a referenced table must be registered
/// before the tables pointing at it.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    schemas: Vec<&'static Schema>,
}

impl Catalog {
    /// An empty catalog. The built-in tables are always present.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a model, validating its schema.
    ///
    /// Only the declaration is checked here. Whether `M` serializes to the
    /// declared column types needs a value, so a mismatch is reported as
    /// `Error::Schema` by the first write of `M`, which then changes nothing.
    ///
    /// # Errors
    ///
    /// `Error::Schema` when the schema is malformed, already registered, uses
    /// a reserved name, or references an unknown table or field.
    pub fn register<M: Model>(mut self) -> Result<Self> {
        let schema = M::schema();
        schema.validate()?;
        if RESERVED.contains(&schema.name) {
            return Err(Error::Schema(format!(
                "'{}' is a reserved table name",
                schema.name
            )));
        }
        if self.get(schema.name).is_some() {
            return Err(Error::Schema(format!(
                "'{}' is already registered",
                schema.name
            )));
        }
        for field in schema.fields {
            let Some(fk) = field.fk else { continue };
            let target = if fk.table == schema.name {
                Some(schema)
            } else {
                self.get(fk.table)
            };
            let Some(target) = target else {
                return Err(Error::Schema(format!(
                    "'{}.{}' references unregistered table '{}'",
                    schema.name, field.name, fk.table
                )));
            };
            if target.field(fk.field).is_none() {
                return Err(Error::Schema(format!(
                    "'{}.{}' references unknown field '{}.{}'",
                    schema.name, field.name, fk.table, fk.field
                )));
            }
        }
        self.schemas.push(schema);
        Ok(self)
    }

    /// Finds a registered schema by table name.
    pub fn get(&self, name: &str) -> Option<&'static Schema> {
        self.schemas.iter().copied().find(|s| s.name == name)
    }

    /// Returns true when the table is registered or built in.
    pub fn contains(&self, name: &str) -> bool {
        name == Label::schema().name
            || name == EventHistory::schema().name
            || self.get(name).is_some()
    }

    /// Registered schemas in registration order.
    pub fn schemas(&self) -> &[&'static Schema] {
        &self.schemas
    }
}

// =============================================================================
// Initialization
// =============================================================================

/// Applies connection pragmas, creates every table and checks the layout
/// version.
pub(crate) fn initialize(conn: &Connection, catalog: &Catalog, busy_timeout: Duration) -> Result<()> {
    // WAL lets watch threads and readers see committed data while the
    // writer is busy.
    conn.execute_batch("PRAGMA journal_mode = WAL")?;
    conn.execute_batch("PRAGMA synchronous = NORMAL")?;
    conn.execute_batch("PRAGMA foreign_keys = ON")?;
    conn.busy_timeout(busy_timeout)?;

    conn.execute_batch(CREATE_METADATA)?;
    let builtins = [Label::schema(), EventHistory::schema()];
    for schema in builtins.into_iter().chain(catalog.schemas().iter().copied()) {
        for ddl in schema.ddl() {
            conn.execute_batch(&ddl)?;
        }
        debug!(table = schema.name, "table ready");
    }

    verify_or_set_version(conn)
}

fn verify_or_set_version(conn: &Connection) -> Result<()> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT value FROM ctrlkit_metadata WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .ok();

    match existing {
        None => {
            conn.execute(
                "INSERT INTO ctrlkit_metadata (key, value) VALUES ('schema_version', ?)",
                [SCHEMA_VERSION.to_string()],
            )?;
        }
        Some(v) if v == SCHEMA_VERSION.to_string() => {}
        Some(v) => {
            return Err(Error::Schema(format!(
                "store layout version {v} does not match supported version {SCHEMA_VERSION}"
            )));
        }
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
