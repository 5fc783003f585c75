//! # mssql-decrypt
//!
//! Migrates SQL Server columns protected by column encryption into plain
//! columns, table by table, in bounded batches.
//!
//! For every table holding encrypted columns the library:
//!
//! - **Validates** the primary key used to address rows
//! - **Prepares** the schema: each encrypted column is renamed to
//!   `<name>_Encrypted`, a plain column takes its name, and an
//!   `IsDataDecrypted` status column is added
//! - **Transfers** values in pages ordered by primary key, staging each page
//!   in a temp table and merging it with one set-based update
//! - **Cleans up** the status column and the `_Encrypted` columns
//!
//! Tables run concurrently; a failing table leaves its siblings untouched.
//!
//! ## Example
//!
//! ```rust,no_run
//! use mssql_decrypt::{Config, Orchestrator};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> mssql_decrypt::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let filter = config.migration.table_filter()?;
//!     let orchestrator = Orchestrator::connect(&config).await?;
//!     let result = orchestrator
//!         .run_all(filter.as_ref(), CancellationToken::new())
//!         .await?;
//!     println!("Migrated {} rows", result.rows_migrated);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod drivers;
pub mod error;
pub mod orchestrator;
pub mod transfer;
pub mod typemap;
pub mod validation;

// Re-exports for convenient access
pub use config::{Config, MigrationConfig, SourceConfig};
pub use self::core::{
    Batch, BulkLoadOptions, CatalogReader, Column, EncryptedColumn, Page, PrimaryKeyColumn,
    SqlValue, Table, TableStore, TransferSession,
};
pub use drivers::{MssqlCatalog, MssqlPool, MssqlStore};
pub use error::{DecryptError, Result};
pub use orchestrator::{
    MigrationResult, Orchestrator, OrchestratorConfig, PlanReport, TableOutcome, TableStage,
    TableStatus,
};
pub use transfer::{TransferConfig, TransferEngine, TransferPlan, TransferStats};
