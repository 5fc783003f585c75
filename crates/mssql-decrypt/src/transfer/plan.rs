//! Per-table transfer plan, derived once before the table is touched.

use serde::Serialize;

use crate::core::identifier::{
    encrypted_alias, is_encrypted_alias, staging_table_name, STATUS_COLUMN,
};
use crate::core::schema::{Column, EncryptedColumn, PrimaryKeyColumn, Table};
use crate::error::{DecryptError, Result};
use crate::typemap;
use crate::validation;

/// An encrypted column together with the names and declarations it takes.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedColumn {
    /// The encrypted column as discovered (original name and type facets).
    pub column: Column,

    /// Name the encrypted column is renamed to.
    pub alias: String,

    /// Full declaration of the column, with its source nullability.
    pub declaration: String,

    /// Declaration used when the plain column is added.
    pub plain_declaration: String,
}

impl PlannedColumn {
    fn new(encrypted: &EncryptedColumn) -> Result<Self> {
        let column = encrypted.column.clone();
        Ok(Self {
            alias: encrypted_alias(&column.name),
            declaration: typemap::declare_type(&column)?,
            plain_declaration: typemap::declare_nullable(&column)?,
            column,
        })
    }

    /// Original (and final) column name.
    pub fn name(&self) -> &str {
        &self.column.name
    }
}

/// Everything the transfer needs to know about one table.
///
/// Rows move in a fixed layout: the encrypted columns in plan order, then
/// the primary key columns in key order. Reads, staging and merge all use
/// this layout, so no per-row name lookup happens.
#[derive(Debug, Clone, Serialize)]
pub struct TransferPlan {
    pub table: Table,
    pub columns: Vec<PlannedColumn>,
    pub key_columns: Vec<Column>,
    pub staging_table: String,
}

impl TransferPlan {
    /// Build the plan, rejecting tables that cannot be migrated.
    ///
    /// Fails without side effects when the key is missing, when a key column
    /// is itself encrypted, when an encrypted column is already named like an
    /// alias (an earlier run renamed it), or when any planned column has an
    /// unsupported type.
    pub fn build(
        table: &Table,
        encrypted: &[EncryptedColumn],
        primary_key: &[PrimaryKeyColumn],
    ) -> Result<Self> {
        validation::validate(table, primary_key)?;

        let renamed: Vec<&str> = encrypted
            .iter()
            .map(|c| c.name())
            .filter(|name| is_encrypted_alias(name))
            .collect();
        if !renamed.is_empty() {
            return Err(DecryptError::PartiallyPrepared {
                table: table.full_name(),
                detail: format!("encrypted column(s) {} already renamed", renamed.join(", ")),
            });
        }

        let mut key: Vec<&PrimaryKeyColumn> = primary_key.iter().collect();
        key.sort_by_key(|k| k.key_ordinal);

        if let Some(column) = key
            .iter()
            .find(|k| encrypted.iter().any(|e| e.name() == k.name()))
        {
            return Err(DecryptError::EncryptedKeyColumn {
                table: table.full_name(),
                column: column.name().to_string(),
            });
        }

        // Key values are staged too, so their types must be declarable.
        for k in &key {
            typemap::declare_base_type(&k.column)?;
        }

        let columns = encrypted
            .iter()
            .map(PlannedColumn::new)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            table: table.clone(),
            columns,
            key_columns: key.into_iter().map(|k| k.column.clone()).collect(),
            staging_table: staging_table_name(table),
        })
    }

    /// Number of values in every row.
    pub fn row_width(&self) -> usize {
        self.columns.len() + self.key_columns.len()
    }

    /// Column type facets in row layout order.
    pub fn layout(&self) -> Vec<&Column> {
        self.columns
            .iter()
            .map(|c| &c.column)
            .chain(self.key_columns.iter())
            .collect()
    }

    /// Names read from the destination table, in row layout order.
    pub fn source_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .map(|c| c.alias.as_str())
            .chain(self.key_columns.iter().map(|k| k.name.as_str()))
            .collect()
    }

    /// Names of the staging table columns, in row layout order.
    pub fn staging_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .map(|c| c.name())
            .chain(self.key_columns.iter().map(|k| k.name.as_str()))
            .collect()
    }

    /// Source to staging column mapping used by the bulk load.
    pub fn column_mapping(&self) -> Vec<(&str, &str)> {
        self.source_columns()
            .into_iter()
            .zip(self.staging_columns())
            .collect()
    }

    /// Key column names in key order.
    pub fn key_names(&self) -> Vec<&str> {
        self.key_columns.iter().map(|k| k.name.as_str()).collect()
    }

    /// Names that must not already exist before preparation.
    pub fn reserved_names(&self) -> Vec<&str> {
        std::iter::once(STATUS_COLUMN)
            .chain(self.columns.iter().map(|c| c.alias.as_str()))
            .collect()
    }

    /// Columns dropped by cleanup: the status column, then every alias.
    pub fn cleanup_columns(&self) -> Vec<String> {
        self.reserved_names().into_iter().map(String::from).collect()
    }
}
