//! Microsoft SQL Server driver.
//!
//! - [`MssqlCatalog`]: encrypted column and primary key discovery
//! - [`MssqlStore`]: schema changes and per-table transfer sessions
//! - [`MssqlDialect`]: SQL text for both
//! - [`OdbcConnector`]: client-side decryption of encrypted columns

mod catalog;
mod convert;
mod dialect;
mod odbc;
mod pool;
mod store;

pub use catalog::MssqlCatalog;
pub use dialect::MssqlDialect;
pub use odbc::{OdbcConnector, OdbcSession};
pub use pool::{MssqlPool, TiberiusConnectionManager};
pub use store::{MssqlSession, MssqlStore};
