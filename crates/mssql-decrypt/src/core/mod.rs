//! Core abstractions for the decryption migration.
//!
//! - [`schema`]: table, column and key metadata
//! - [`identifier`]: quoting and the column naming protocol
//! - [`value`]: SQL values and row batches
//! - [`traits`]: catalog, schema-change and transfer seams

pub mod identifier;
pub mod schema;
pub mod traits;
pub mod value;

pub use schema::{Column, EncryptedColumn, PrimaryKeyColumn, Table};
pub use traits::{BulkLoadOptions, CatalogReader, Page, TableStore, TransferSession};
pub use value::{Batch, SqlNullType, SqlValue};
