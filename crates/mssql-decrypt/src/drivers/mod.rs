//! Database driver implementations.

pub mod mssql;

pub use mssql::{MssqlCatalog, MssqlPool, MssqlStore, OdbcConnector};
