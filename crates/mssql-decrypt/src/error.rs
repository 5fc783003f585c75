//! Error types for the decryption migration library.

use thiserror::Error;

/// Process exit code for configuration errors.
pub const EXIT_CONFIG_ERROR: u8 = 1;

/// Process exit code when the catalog or a connection is unavailable.
pub const EXIT_CONNECTION_ERROR: u8 = 2;

/// Process exit code when one or more tables failed to migrate.
pub const EXIT_TABLE_FAILURE: u8 = 3;

/// Process exit code when the run was cancelled.
pub const EXIT_CANCELLED: u8 = 4;

/// Process exit code for file system errors.
pub const EXIT_IO_ERROR: u8 = 7;

/// Main error type for decryption migration operations.
#[derive(Error, Debug)]
pub enum DecryptError {
    /// Configuration error (invalid YAML, missing fields, bad table names).
    #[error("Configuration error: {0}")]
    Config(String),

    /// Catalog metadata could not be read. Nothing proceeds without it.
    #[error("Catalog unavailable: {0}")]
    CatalogUnavailable(String),

    /// A table holding encrypted columns has no primary key.
    #[error("Table {table} has no primary key - rows cannot be addressed for migration")]
    MissingPrimaryKey { table: String },

    /// A column uses a type the declaration builder does not know.
    #[error("Decryption of column {column} is not supported: unknown data type '{type_name}'")]
    UnsupportedType { column: String, type_name: String },

    /// A primary key column is itself encrypted.
    #[error("Table {table}: primary key column {column} is encrypted and cannot be used to address rows")]
    EncryptedKeyColumn { table: String, column: String },

    /// A table carries leftovers of an earlier, interrupted run.
    #[error("Table {table} is partially prepared ({detail}) - inspect it manually before re-running")]
    PartiallyPrepared { table: String, detail: String },

    /// A rename, add-column or drop-column statement failed.
    #[error("Schema change failed for table {table}: {message}")]
    SchemaMutation { table: String, message: String },

    /// A page read, bulk load or merge failed mid-loop.
    #[error("Batch {batch} failed for table {table}: {message}")]
    BatchTransfer {
        table: String,
        batch: u64,
        message: String,
    },

    /// Connection pool error with context.
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// Database driver error.
    #[error("Database error: {0}")]
    Database(#[from] tiberius::error::Error),

    /// ODBC driver error with the step that raised it.
    #[error("ODBC error while {context}: {source}")]
    Odbc {
        context: String,
        #[source]
        source: odbc_api::Error,
    },

    /// A statement did not finish within its timeout.
    #[error("Timed out after {seconds}s: {operation}")]
    Timeout { operation: String, seconds: u64 },

    /// IO error (file operations).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The run was cancelled (SIGINT, SIGTERM).
    #[error("Migration cancelled")]
    Cancelled,
}

impl DecryptError {
    /// Create a Pool error with context about where it occurred.
    pub fn pool(message: impl ToString, context: impl Into<String>) -> Self {
        DecryptError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a SchemaMutation error for a table.
    pub fn schema_mutation(table: impl Into<String>, message: impl ToString) -> Self {
        DecryptError::SchemaMutation {
            table: table.into(),
            message: message.to_string(),
        }
    }

    /// Create a BatchTransfer error for a table and batch number.
    pub fn batch_transfer(table: impl Into<String>, batch: u64, message: impl ToString) -> Self {
        DecryptError::BatchTransfer {
            table: table.into(),
            batch,
            message: message.to_string(),
        }
    }

    /// Wrap an ODBC error with the step that raised it, for `map_err`.
    pub fn odbc(context: impl Into<String>) -> impl FnOnce(odbc_api::Error) -> Self {
        let context = context.into();
        move |source| DecryptError::Odbc { context, source }
    }

    /// Create a CatalogUnavailable error from any displayable cause.
    pub fn catalog(message: impl ToString) -> Self {
        DecryptError::CatalogUnavailable(message.to_string())
    }

    /// Whether the failure is confined to a single table.
    ///
    /// Every failure inside a table's run is recorded on that table and its
    /// siblings keep going. Failures that are not table-scoped (pool,
    /// timeout, driver) point at the shared connection, so the orchestrator
    /// also logs a warning that other tables may fail the same way.
    pub fn is_table_scoped(&self) -> bool {
        matches!(
            self,
            DecryptError::MissingPrimaryKey { .. }
                | DecryptError::UnsupportedType { .. }
                | DecryptError::EncryptedKeyColumn { .. }
                | DecryptError::PartiallyPrepared { .. }
                | DecryptError::SchemaMutation { .. }
                | DecryptError::BatchTransfer { .. }
        )
    }

    /// Whether a statement was abandoned by its timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, DecryptError::Timeout { .. })
    }

    /// Map the error onto a process exit code.
    pub fn exit_code(&self) -> u8 {
        match self {
            DecryptError::Config(_) | DecryptError::Yaml(_) => EXIT_CONFIG_ERROR,
            DecryptError::Io(_) => EXIT_IO_ERROR,
            DecryptError::Cancelled => EXIT_CANCELLED,
            DecryptError::CatalogUnavailable(_)
            | DecryptError::Pool { .. }
            | DecryptError::Database(_)
            | DecryptError::Odbc { .. }
            | DecryptError::Timeout { .. } => EXIT_CONNECTION_ERROR,
            _ => EXIT_TABLE_FAILURE,
        }
    }

    /// Format error with full details including error chain.
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for decryption migration operations.
pub type Result<T> = std::result::Result<T, DecryptError>;
