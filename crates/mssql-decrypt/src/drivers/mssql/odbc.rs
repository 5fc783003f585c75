//! ODBC data path for column-encrypted tables.
//!
//! tiberius speaks plain TDS, so encrypted columns reach it as ciphertext.
//! The Microsoft ODBC Driver for SQL Server decrypts them on the client when
//! the connection string carries `ColumnEncryption=Enabled`, which makes it
//! the only way this crate can read plain values.
//!
//! **Requirements:**
//! - Microsoft ODBC Driver 18 for SQL Server:
//!   - Linux: `apt install msodbcsql18` or `yum install msodbcsql18`
//!   - macOS: `brew install msodbcsql18`
//! - Access to the column master keys (certificate store or key vault) from
//!   the machine running the migration
//!
//! ODBC has no TDS bulk insert, so a staged page is written with literal
//! multi-row `INSERT` statements. Every merge runs on its own connection:
//! the staging table, the inserts and the update share that connection and
//! one transaction, and the connection is closed afterwards, so a failed or
//! timed-out batch never leaves state behind for the next one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use odbc_api::buffers::TextRowSet;
use odbc_api::{Connection, ConnectionOptions, Cursor, Environment, ResultSetMetadata};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::dialect::MssqlDialect;
use crate::config::SourceConfig;
use crate::core::schema::Column;
use crate::core::traits::{BulkLoadOptions, Page, TransferSession};
use crate::core::value::{Batch, SqlNullType, SqlValue};
use crate::error::{DecryptError, Result};
use crate::transfer::TransferPlan;

/// Driver name used in the connection string.
const ODBC_DRIVER: &str = "ODBC Driver 18 for SQL Server";

/// Maximum rows per INSERT VALUES clause (MSSQL limit is 1000).
const MAX_ROWS_PER_INSERT: usize = 1000;

/// Number of INSERT statements sent in one execute call.
const STATEMENTS_PER_EXECUTE: usize = 10;

/// Rows fetched per round-trip while reading a page.
const FETCH_ROWS: usize = 256;

/// Largest text value read without a truncation error (binary arrives as
/// hex, so half of this for varbinary).
const MAX_TEXT_BYTES: usize = 256 * 1024;

const PING_TIMEOUT: Duration = Duration::from_secs(30);

/// Session settings for every data connection. XACT_ABORT rolls the batch
/// back on any error; NOCOUNT keeps multi-statement batches to one result.
const SESSION_SETUP_SQL: &str = "SET NOCOUNT ON; SET XACT_ABORT ON";

/// Build the ODBC connection string for a source.
pub fn connection_string(config: &SourceConfig) -> String {
    format!(
        "Driver={{{}}};\
         Server={},{};\
         Database={};\
         UID={};\
         PWD={};\
         Encrypt={};\
         TrustServerCertificate={};\
         ColumnEncryption={};",
        ODBC_DRIVER,
        config.host,
        config.port,
        braced(&config.database),
        braced(&config.user),
        braced(&config.password),
        if config.encrypt { "yes" } else { "no" },
        if config.trust_server_cert { "yes" } else { "no" },
        if config.column_encryption {
            "Enabled"
        } else {
            "Disabled"
        },
    )
}

/// Brace a connection string value so `;` and `=` inside it stay literal.
fn braced(value: &str) -> String {
    format!("{{{}}}", value.replace('}', "}}"))
}

/// Run blocking ODBC work off the async workers.
async fn blocking<T, F>(context: &str, work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| DecryptError::pool(e, context))?
}

fn timeout_secs(limit: Duration) -> usize {
    limit.as_secs().max(1) as usize
}

/// Opens ODBC connections to the source database.
pub struct OdbcConnector {
    env: Environment,
    connection_string: String,
}

impl OdbcConnector {
    /// Create the ODBC environment and verify that a connection can be made.
    pub async fn connect(config: &SourceConfig) -> Result<Arc<Self>> {
        let connection_string = connection_string(config);
        debug!(
            "ODBC connection string (credentials hidden): Driver={{{}}};Server={},{};Database={};ColumnEncryption={};...",
            ODBC_DRIVER, config.host, config.port, config.database, config.column_encryption
        );

        let connector = blocking("creating ODBC environment", move || {
            let env = Environment::new().map_err(|e| {
                DecryptError::pool(
                    format!(
                        "Failed to create ODBC environment: {}.\n\n\
                         Reading column-encrypted values requires the Microsoft ODBC Driver for SQL Server.\n\
                         Please install it:\n\
                         - Linux: apt install msodbcsql18 (or yum install msodbcsql18)\n\
                         - macOS: brew tap microsoft/mssql-release https://github.com/Microsoft/homebrew-mssql-release && \
                                  brew install msodbcsql18",
                        e
                    ),
                    "ODBC connection",
                )
            })?;
            let connector = Self {
                env,
                connection_string,
            };
            connector.ping_sync()?;
            Ok(connector)
        })
        .await?;

        info!(
            "Connected to MSSQL via ODBC: {}:{}/{} (column encryption {})",
            config.host,
            config.port,
            config.database,
            if config.column_encryption {
                "enabled"
            } else {
                "disabled"
            }
        );
        Ok(Arc::new(connector))
    }

    fn connection(&self) -> Result<Connection<'_>> {
        self.env
            .connect_with_connection_string(&self.connection_string, ConnectionOptions::default())
            .map_err(|e| {
                DecryptError::pool(
                    format!("ODBC connection failed: {}", e),
                    "getting ODBC connection",
                )
            })
    }

    fn ping_sync(&self) -> Result<()> {
        let conn = self.connection()?;
        execute(&conn, "SELECT 1", PING_TIMEOUT, "testing ODBC connection")
    }

    /// Open and close a connection.
    pub async fn ping(self: &Arc<Self>) -> Result<()> {
        let this = self.clone();
        blocking("testing ODBC connection", move || this.ping_sync()).await
    }

    /// Run a query and return every row as text, `None` for NULL.
    ///
    /// Values longer than the fetch buffer fail instead of being truncated.
    fn query_text(&self, sql: &str, limit: Duration) -> Result<Vec<Vec<Option<String>>>> {
        let conn = self.connection()?;
        query_text(&conn, sql, limit)
    }

    /// Stage rows and merge them, all in one transaction on one connection.
    fn stage_and_merge(&self, job: &MergeJob) -> Result<u64> {
        let conn = self.connection()?;
        execute(&conn, SESSION_SETUP_SQL, job.statement_timeout, "configuring session")?;
        execute(&conn, &job.create_sql, job.statement_timeout, "creating staging table")?;
        execute(&conn, "BEGIN TRANSACTION", job.statement_timeout, "starting transaction")?;

        match job.run(&conn) {
            Ok(merged) => Ok(merged),
            Err(e) => {
                if let Err(rollback) = execute(
                    &conn,
                    "IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION",
                    job.statement_timeout,
                    "rolling back",
                ) {
                    warn!("Rollback failed: {}", rollback);
                }
                Err(e)
            }
        }
    }
}

/// Execute statements that return no rows.
fn execute(conn: &Connection<'_>, sql: &str, limit: Duration, context: &str) -> Result<()> {
    let mut statement = conn.preallocate().map_err(DecryptError::odbc(context))?;
    statement
        .set_query_timeout_sec(timeout_secs(limit))
        .map_err(DecryptError::odbc(context))?;
    statement
        .execute(sql, ())
        .map_err(DecryptError::odbc(context))?;
    Ok(())
}

fn query_text(
    conn: &Connection<'_>,
    sql: &str,
    limit: Duration,
) -> Result<Vec<Vec<Option<String>>>> {
    let mut statement = conn
        .preallocate()
        .map_err(DecryptError::odbc("preparing query"))?;
    statement
        .set_query_timeout_sec(timeout_secs(limit))
        .map_err(DecryptError::odbc("preparing query"))?;

    let mut rows = Vec::new();
    if let Some(mut cursor) = statement
        .execute(sql, ())
        .map_err(DecryptError::odbc("running query"))?
    {
        let width = cursor
            .num_result_cols()
            .map_err(DecryptError::odbc("reading column count"))? as usize;
        let mut buffers = TextRowSet::for_cursor(FETCH_ROWS, &mut cursor, Some(MAX_TEXT_BYTES))
            .map_err(DecryptError::odbc("allocating fetch buffers"))?;
        let mut row_cursor = cursor
            .bind_buffer(&mut buffers)
            .map_err(DecryptError::odbc("binding fetch buffers"))?;

        while let Some(batch) = row_cursor
            .fetch_with_truncation_check(true)
            .map_err(DecryptError::odbc("fetching rows"))?
        {
            for row in 0..batch.num_rows() {
                rows.push(
                    (0..width)
                        .map(|col| {
                            batch
                                .at(col, row)
                                .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                        })
                        .collect(),
                );
            }
        }
    }
    Ok(rows)
}

/// One staged page waiting to be merged.
struct MergeJob {
    create_sql: String,
    inserts: Vec<String>,
    merge_sql: String,
    statement_timeout: Duration,
    bulk_load_timeout: Duration,
}

impl MergeJob {
    fn run(&self, conn: &Connection<'_>) -> Result<u64> {
        for (chunk_index, chunk) in self.inserts.chunks(STATEMENTS_PER_EXECUTE).enumerate() {
            execute(
                conn,
                &chunk.join(";\n"),
                self.bulk_load_timeout,
                &format!("staging insert {}", chunk_index + 1),
            )?;
        }

        let counted = format!("{}; SELECT CAST(@@ROWCOUNT AS BIGINT)", self.merge_sql);
        let rows = query_text(conn, &counted, self.statement_timeout)?;
        let merged = rows
            .first()
            .and_then(|row| row.first())
            .and_then(|value| value.as_deref())
            .ok_or_else(|| DecryptError::pool("merge returned no row count", "merge"))?
            .parse::<u64>()
            .map_err(|e| DecryptError::pool(e, "reading merge row count"))?;

        execute(conn, "COMMIT TRANSACTION", self.statement_timeout, "committing")?;
        Ok(merged)
    }
}

/// One table's transfer over ODBC.
///
/// Pages are read on a fresh connection each; staging only renders the
/// insert statements, and the merge applies them together with the update.
pub struct OdbcSession {
    connector: Arc<OdbcConnector>,
    table: String,
    plan: TransferPlan,
    dialect: MssqlDialect,
    create_sql: String,
    insert_sql: String,
    merge_sql: String,
    layout: Vec<Column>,
    options: BulkLoadOptions,
    statement_timeout: Duration,
    staged: Vec<String>,
}

impl OdbcSession {
    pub fn new(
        connector: Arc<OdbcConnector>,
        plan: &TransferPlan,
        options: BulkLoadOptions,
        statement_timeout: Duration,
    ) -> Result<Self> {
        let dialect = MssqlDialect::new();
        Ok(Self {
            connector,
            table: plan.table.full_name(),
            create_sql: dialect.create_staging(plan)?,
            insert_sql: dialect.insert_staging(plan)?,
            merge_sql: dialect.merge(plan)?,
            layout: plan.layout().into_iter().cloned().collect(),
            plan: plan.clone(),
            dialect,
            options,
            statement_timeout,
            staged: Vec::new(),
        })
    }
}

#[async_trait]
impl TransferSession for OdbcSession {
    async fn read_page(&mut self, page: Page) -> Result<Batch> {
        let sql = self.dialect.select_page_literal(&self.plan, page)?;
        let connector = self.connector.clone();
        let limit = self.statement_timeout;
        let texts = blocking("reading page via ODBC", move || {
            connector.query_text(&sql, limit)
        })
        .await?;

        let rows = texts
            .into_iter()
            .map(|row| {
                if row.len() != self.layout.len() {
                    return Err(DecryptError::pool(
                        format!("page row has {} values, expected {}", row.len(), self.layout.len()),
                        "reading page via ODBC",
                    ));
                }
                row.into_iter()
                    .zip(&self.layout)
                    .map(|(text, column)| decode_text(text.as_deref(), column))
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Batch::new(page.batch_number, rows))
    }

    async fn stage(&mut self, batch: &Batch) -> Result<u64> {
        self.staged = render_inserts(&self.insert_sql, &batch.rows, &self.layout)?;
        debug!(
            "{}: batch {} rendered as {} insert statements",
            self.table,
            batch.batch_number,
            self.staged.len()
        );
        Ok(batch.len() as u64)
    }

    async fn merge(&mut self) -> Result<u64> {
        let job = MergeJob {
            create_sql: self.create_sql.clone(),
            inserts: std::mem::take(&mut self.staged),
            merge_sql: self.merge_sql.clone(),
            statement_timeout: self.statement_timeout,
            bulk_load_timeout: self.options.timeout,
        };
        let connector = self.connector.clone();
        blocking("merging via ODBC", move || connector.stage_and_merge(&job)).await
    }

    async fn close(self: Box<Self>) -> Result<()> {
        // Staging tables live and die with each merge connection.
        debug!("{}: ODBC transfer session closed", self.table);
        Ok(())
    }
}

/// Render rows as multi-row INSERT statements of at most
/// [`MAX_ROWS_PER_INSERT`] rows each.
fn render_inserts(prefix: &str, rows: &[Vec<SqlValue>], layout: &[Column]) -> Result<Vec<String>> {
    rows.chunks(MAX_ROWS_PER_INSERT)
        .map(|chunk| {
            let groups = chunk
                .iter()
                .map(|row| {
                    let values = row
                        .iter()
                        .zip(layout)
                        .map(|(value, column)| sql_literal(value, column))
                        .collect::<Result<Vec<_>>>()?;
                    Ok(format!("({})", values.join(", ")))
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(format!("{}{}", prefix, groups.join(", ")))
        })
        .collect()
}

/// SQL literal for a value. Dates use ISO 8601 so no session setting
/// changes their meaning.
fn sql_literal(value: &SqlValue, column: &Column) -> Result<String> {
    Ok(match value {
        SqlValue::Null(_) => "NULL".to_string(),
        SqlValue::Bool(b) => u8::from(*b).to_string(),
        SqlValue::I16(n) => n.to_string(),
        SqlValue::I32(n) => n.to_string(),
        SqlValue::I64(n) => n.to_string(),
        SqlValue::F32(f) if f.is_finite() => format!("{:e}", f),
        SqlValue::F64(f) if f.is_finite() => format!("{:e}", f),
        SqlValue::F32(_) | SqlValue::F64(_) => {
            return Err(DecryptError::pool(
                format!("{} holds a non-finite float", column.full_column_name()),
                "staging insert",
            ))
        }
        SqlValue::Text(s) => format!("N'{}'", s.replace('\'', "''")),
        SqlValue::Bytes(b) => format!("0x{}", hex::encode_upper(b)),
        SqlValue::Uuid(u) => format!("'{}'", u),
        SqlValue::Decimal(d) => d.to_string(),
        SqlValue::DateTime(dt) => format!("'{}'", dt.format("%Y-%m-%dT%H:%M:%S%.f")),
        SqlValue::DateTimeOffset(dto) => {
            format!("'{}'", dto.format("%Y-%m-%dT%H:%M:%S%.f%:z"))
        }
        SqlValue::Date(d) => format!("'{}'", d.format("%Y-%m-%d")),
        SqlValue::Time(t) => format!("'{}'", t.format("%H:%M:%S%.f")),
    })
}

/// Parse a value the driver returned as text, by the column's declared type.
///
/// Unparseable text is an error; it never becomes NULL.
fn decode_text(text: Option<&str>, column: &Column) -> Result<SqlValue> {
    let data_type = column.data_type.as_str();
    let Some(s) = text else {
        return Ok(SqlValue::Null(SqlNullType::for_data_type(data_type)));
    };

    let invalid = |detail: String| {
        DecryptError::pool(
            format!(
                "cannot read {} value for {}: {}",
                data_type,
                column.full_column_name(),
                detail
            ),
            "decoding ODBC text",
        )
    };

    let value = match data_type {
        "bit" => match s {
            "1" => SqlValue::Bool(true),
            "0" => SqlValue::Bool(false),
            other => return Err(invalid(format!("{:?}", other))),
        },
        "tinyint" => SqlValue::I16(s.parse::<u8>().map_err(|e| invalid(e.to_string()))? as i16),
        "smallint" => SqlValue::I16(s.parse().map_err(|e| invalid(format!("{}", e)))?),
        "int" => SqlValue::I32(s.parse().map_err(|e| invalid(format!("{}", e)))?),
        "bigint" => SqlValue::I64(s.parse().map_err(|e| invalid(format!("{}", e)))?),
        "real" => SqlValue::F32(s.parse().map_err(|e| invalid(format!("{}", e)))?),
        "float" => SqlValue::F64(s.parse().map_err(|e| invalid(format!("{}", e)))?),
        "decimal" | "numeric" | "money" | "smallmoney" => {
            // The driver drops the leading zero of fractions: ".5000".
            let normalized = if let Some(rest) = s.strip_prefix("-.") {
                format!("-0.{}", rest)
            } else if let Some(rest) = s.strip_prefix('.') {
                format!("0.{}", rest)
            } else {
                s.to_string()
            };
            SqlValue::Decimal(
                Decimal::from_str_exact(&normalized).map_err(|e| invalid(e.to_string()))?,
            )
        }
        "uniqueidentifier" => {
            SqlValue::Uuid(Uuid::parse_str(s).map_err(|e| invalid(e.to_string()))?)
        }
        "datetime" | "datetime2" | "smalldatetime" => SqlValue::DateTime(
            NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
                .map_err(|e| invalid(e.to_string()))?,
        ),
        "datetimeoffset" => SqlValue::DateTimeOffset(
            DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f %:z")
                .map_err(|e| invalid(e.to_string()))?,
        ),
        "date" => SqlValue::Date(
            NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| invalid(e.to_string()))?,
        ),
        "time" => SqlValue::Time(
            NaiveTime::parse_from_str(s, "%H:%M:%S%.f").map_err(|e| invalid(e.to_string()))?,
        ),
        "binary" | "varbinary" => {
            let digits = s
                .strip_prefix("0x")
                .or_else(|| s.strip_prefix("0X"))
                .unwrap_or(s);
            SqlValue::Bytes(hex::decode(digits).map_err(|e| invalid(e.to_string()))?)
        }
        _ => SqlValue::Text(s.to_string()),
    };
    Ok(value)
}
