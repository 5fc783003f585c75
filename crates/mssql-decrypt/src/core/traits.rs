//! Core traits for the decryption migration.
//!
//! - [`CatalogReader`]: discovers encrypted columns and primary keys
//! - [`TableStore`]: applies schema changes to a table
//! - [`TransferSession`]: moves one table's data page by page
//!
//! The orchestrator only talks to these traits. The SQL Server driver
//! implements all three; tests plug in an in-memory database.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::transfer::plan::TransferPlan;

use super::schema::{EncryptedColumn, PrimaryKeyColumn, Table};
use super::value::Batch;

/// Read-only access to catalog metadata.
#[async_trait]
pub trait CatalogReader: Send + Sync {
    /// List every encrypted column, optionally restricted to an allow-list.
    ///
    /// Results are ordered by schema, table and column position. An empty
    /// result is not an error.
    async fn list_encrypted_columns(
        &self,
        filter: Option<&BTreeSet<Table>>,
    ) -> Result<Vec<EncryptedColumn>>;

    /// Primary key columns of a table, ordered by key ordinal.
    ///
    /// A table without a primary key yields an empty list.
    async fn list_primary_key_columns(&self, table: &Table) -> Result<Vec<PrimaryKeyColumn>>;

    /// Names of every column currently on the table.
    async fn list_column_names(&self, table: &Table) -> Result<Vec<String>>;
}

/// Options for the per-table bulk load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkLoadOptions {
    /// Rows per page.
    pub batch_size: usize,

    /// Upper bound on a single bulk load.
    pub timeout: Duration,
}

/// One page of a table in primary key order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    /// 1-based page number.
    pub batch_number: u64,

    /// Rows per page.
    pub batch_size: usize,
}

impl Page {
    /// Create a page descriptor.
    pub fn new(batch_number: u64, batch_size: usize) -> Self {
        Self {
            batch_number,
            batch_size,
        }
    }

    /// Rows to skip before this page starts.
    pub fn offset(&self) -> u64 {
        self.batch_number.saturating_sub(1) * self.batch_size as u64
    }
}

/// Schema changes and data access for migrated tables.
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Rename a column in place.
    async fn rename_column(&self, table: &Table, column: &str, new_name: &str) -> Result<()>;

    /// Add a column with the given type declaration.
    async fn add_column(&self, table: &Table, name: &str, declaration: &str) -> Result<()>;

    /// Drop columns in a single statement.
    async fn drop_columns(&self, table: &Table, columns: &[String]) -> Result<()>;

    /// Open a transfer session for one table.
    ///
    /// The session holds a dedicated connection so its staging table stays
    /// visible across pages.
    async fn open_session(
        &self,
        plan: &TransferPlan,
        options: BulkLoadOptions,
    ) -> Result<Box<dyn TransferSession>>;

    /// Test connectivity.
    async fn ping(&self) -> Result<()>;
}

/// Page-by-page data movement for one table.
#[async_trait]
pub trait TransferSession: Send {
    /// Read one page of `(encrypted values..., key values...)` rows.
    ///
    /// An empty batch means the table is exhausted.
    async fn read_page(&mut self, page: Page) -> Result<Batch>;

    /// Replace the staging table contents with the batch.
    ///
    /// Opens the batch transaction. Returns the number of rows staged.
    async fn stage(&mut self, batch: &Batch) -> Result<u64>;

    /// Copy staged values into the plain columns, mark the rows migrated and
    /// commit the batch transaction.
    ///
    /// On failure the batch transaction is rolled back.
    async fn merge(&mut self) -> Result<u64>;

    /// Release the session's connection and staging table.
    async fn close(self: Box<Self>) -> Result<()>;
}
