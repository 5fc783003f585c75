//! Catalog metadata types: tables, columns, encrypted columns and key columns.
//!
//! All of these are snapshots taken from the catalog. They are never
//! updated in place; if the underlying schema changes, fetch them again.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DecryptError, Result};

/// Schema assumed when a table name carries no schema part.
pub const DEFAULT_SCHEMA: &str = "dbo";

/// Identifies a relation by schema and name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Table {
    /// Schema name.
    pub schema: String,

    /// Table name.
    pub name: String,
}

impl Table {
    /// Create a table identifier from its parts.
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Parse `schema.name`, or a bare `name` in the default schema.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        let (schema, name) = match trimmed.split_once('.') {
            Some((schema, name)) => (schema.trim(), name.trim()),
            None => (DEFAULT_SCHEMA, trimmed),
        };

        if schema.is_empty() || name.is_empty() || name.contains('.') {
            return Err(DecryptError::Config(format!(
                "invalid table name '{}': expected 'schema.table' or 'table'",
                input
            )));
        }

        Ok(Self::new(schema, name))
    }

    /// Get the fully qualified table name.
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

impl FromStr for Table {
    type Err = DecryptError;

    fn from_str(s: &str) -> Result<Self> {
        Table::parse(s)
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// Column metadata with the type facets needed to re-declare it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    /// Schema of the owning table.
    pub schema: String,

    /// Owning table name.
    pub table: String,

    /// Column name.
    pub name: String,

    /// Data type name as reported by `sys.types` (e.g. "nvarchar").
    pub data_type: String,

    /// Maximum length in bytes; -1 means MAX for variable-length types.
    pub max_length: i32,

    /// Numeric precision.
    pub precision: i32,

    /// Numeric or fractional-seconds scale.
    pub scale: i32,

    /// Whether the column allows NULL.
    pub is_nullable: bool,

    /// Collation for character columns.
    pub collation: Option<String>,
}

impl Column {
    /// Create a nullable column with no length, precision or scale.
    pub fn new(table: &Table, name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            schema: table.schema.clone(),
            table: table.name.clone(),
            name: name.into(),
            data_type: data_type.into(),
            max_length: 0,
            precision: 0,
            scale: 0,
            is_nullable: true,
            collation: None,
        }
    }

    /// Set the byte length.
    pub fn with_length(mut self, max_length: i32) -> Self {
        self.max_length = max_length;
        self
    }

    /// Set precision and scale.
    pub fn with_precision(mut self, precision: i32, scale: i32) -> Self {
        self.precision = precision;
        self.scale = scale;
        self
    }

    /// Set nullability.
    pub fn with_nullable(mut self, is_nullable: bool) -> Self {
        self.is_nullable = is_nullable;
        self
    }

    /// The table this column belongs to.
    pub fn owner(&self) -> Table {
        Table::new(&self.schema, &self.table)
    }

    /// `schema.table`.
    pub fn full_table_name(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }

    /// `schema.table.column`.
    pub fn full_column_name(&self) -> String {
        format!("{}.{}.{}", self.schema, self.table, self.name)
    }
}

/// A column protected by column encryption, slated for migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedColumn {
    /// The column itself.
    pub column: Column,

    /// Name of the column encryption key.
    pub column_key_name: String,

    /// Encryption type (DETERMINISTIC or RANDOMIZED).
    pub encryption_type: String,

    /// Encryption algorithm name.
    pub encryption_algorithm: String,
}

impl EncryptedColumn {
    /// Column name.
    pub fn name(&self) -> &str {
        &self.column.name
    }

    /// The table this column belongs to.
    pub fn owner(&self) -> Table {
        self.column.owner()
    }
}

/// One column of a table's primary key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryKeyColumn {
    /// The key column with its type facets.
    pub column: Column,

    /// 1-based position within the key.
    pub key_ordinal: i32,
}

impl PrimaryKeyColumn {
    /// Column name.
    pub fn name(&self) -> &str {
        &self.column.name
    }
}

impl AsRef<Column> for EncryptedColumn {
    fn as_ref(&self) -> &Column {
        &self.column
    }
}

impl AsRef<Column> for PrimaryKeyColumn {
    fn as_ref(&self) -> &Column {
        &self.column
    }
}

impl AsRef<Column> for Column {
    fn as_ref(&self) -> &Column {
        self
    }
}
