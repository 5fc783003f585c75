//! Schema changes and batch transfer against SQL Server.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tiberius::Query;
use tracing::{debug, warn};

use super::convert::{decode_row, encode_row};
use super::dialect::{MssqlDialect, RENAME_COLUMN_SQL};
use super::odbc::{OdbcConnector, OdbcSession};
use super::pool::{MssqlConnection, MssqlPool};
use crate::core::identifier::quote;
use crate::core::schema::{Column, Table};
use crate::core::traits::{BulkLoadOptions, Page, TableStore, TransferSession};
use crate::core::value::Batch;
use crate::error::{DecryptError, Result};
use crate::transfer::TransferPlan;

/// Bound a database round-trip by a timeout.
async fn with_timeout<T, F>(limit: Duration, operation: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(DecryptError::Timeout {
            operation: operation.to_string(),
            seconds: limit.as_secs(),
        }),
    }
}

/// A timed-out round-trip leaves unread tokens on the stream, so the
/// connection must not carry another statement.
fn leaves_stream_desynced<T>(result: &Result<T>) -> bool {
    matches!(result, Err(e) if e.is_timeout())
}

fn retire_on_timeout<T>(conn: &mut MssqlConnection, result: &Result<T>) {
    if leaves_stream_desynced(result) {
        conn.mark_broken();
    }
}

/// DDL and data access for tables being migrated.
///
/// Schema changes always go over TDS. Pages go over ODBC when a connector
/// is attached, since only the ODBC driver decrypts encrypted columns.
pub struct MssqlStore {
    pool: MssqlPool,
    odbc: Option<Arc<OdbcConnector>>,
    dialect: MssqlDialect,
    statement_timeout: Duration,
}

impl MssqlStore {
    pub fn new(pool: MssqlPool, statement_timeout: Duration) -> Self {
        Self {
            pool,
            odbc: None,
            dialect: MssqlDialect::new(),
            statement_timeout,
        }
    }

    /// Move page reads and merges onto an ODBC connector.
    pub fn with_odbc(mut self, connector: Arc<OdbcConnector>) -> Self {
        self.odbc = Some(connector);
        self
    }

    async fn execute_ddl(&self, table: &Table, sql: String, operation: &str) -> Result<()> {
        debug!("{}: {}", table.full_name(), sql);
        let mut conn = self.pool.get(operation).await?;
        let result = with_timeout(self.statement_timeout, operation, async {
            conn.simple_query(sql).await?.into_results().await?;
            Ok::<_, DecryptError>(())
        })
        .await;
        retire_on_timeout(&mut conn, &result);
        result.map_err(|e| {
            DecryptError::schema_mutation(table.full_name(), format!("{}: {}", operation, e))
        })
    }
}

#[async_trait]
impl TableStore for MssqlStore {
    async fn rename_column(&self, table: &Table, column: &str, new_name: &str) -> Result<()> {
        let object_name = self.dialect.column_object_name(table, column)?;
        let operation = format!("rename {} to {}", column, new_name);
        debug!("{}: {}", table.full_name(), operation);

        let mut conn = self.pool.get("renaming column").await?;
        let result = with_timeout(self.statement_timeout, &operation, async {
            conn.execute(RENAME_COLUMN_SQL, &[&object_name, &new_name])
                .await?;
            Ok::<_, DecryptError>(())
        })
        .await;
        retire_on_timeout(&mut conn, &result);
        result.map_err(|e| {
            DecryptError::schema_mutation(table.full_name(), format!("{}: {}", operation, e))
        })
    }

    async fn add_column(&self, table: &Table, name: &str, declaration: &str) -> Result<()> {
        let sql = self.dialect.add_column(table, name, declaration)?;
        self.execute_ddl(table, sql, &format!("add column {}", name))
            .await
    }

    async fn drop_columns(&self, table: &Table, columns: &[String]) -> Result<()> {
        let sql = self.dialect.drop_columns(table, columns)?;
        self.execute_ddl(table, sql, &format!("drop columns {}", columns.join(", ")))
            .await
    }

    async fn open_session(
        &self,
        plan: &TransferPlan,
        options: BulkLoadOptions,
    ) -> Result<Box<dyn TransferSession>> {
        if let Some(connector) = &self.odbc {
            return Ok(Box::new(OdbcSession::new(
                connector.clone(),
                plan,
                options,
                self.statement_timeout,
            )?));
        }

        let mut conn = self.pool.get("opening transfer session").await?;

        let create = self.dialect.create_staging(plan)?;
        debug!("{}: {}", plan.table.full_name(), create);
        let result = with_timeout(self.statement_timeout, "create staging table", async {
            conn.simple_query(create).await?.into_results().await?;
            Ok::<_, DecryptError>(())
        })
        .await;
        retire_on_timeout(&mut conn, &result);
        result?;

        Ok(Box::new(MssqlSession {
            select_sql: self.dialect.select_page(plan)?,
            merge_sql: self.dialect.merge(plan)?,
            truncate_sql: self.dialect.truncate_staging(plan)?,
            drop_sql: self.dialect.drop_staging(plan)?,
            staging_target: quote(&plan.staging_table)?,
            layout: plan.layout().into_iter().cloned().collect(),
            conn,
            options,
            statement_timeout: self.statement_timeout,
            in_transaction: false,
        }))
    }

    async fn ping(&self) -> Result<()> {
        self.pool.ping().await?;
        if let Some(connector) = &self.odbc {
            connector.ping().await?;
        }
        Ok(())
    }
}

/// One table's transfer, pinned to a single connection.
///
/// The staging table is session-scoped, so every page must go through the
/// same connection. Statements are prepared once from the plan. After a
/// timeout the connection is retired: nothing more is sent on it and the
/// pool discards it, which also ends the open transaction server-side.
pub struct MssqlSession {
    conn: MssqlConnection,
    select_sql: String,
    merge_sql: String,
    truncate_sql: String,
    drop_sql: String,
    staging_target: String,
    layout: Vec<Column>,
    options: BulkLoadOptions,
    statement_timeout: Duration,
    in_transaction: bool,
}

impl MssqlSession {
    /// Retire the connection if `result` is a timeout.
    fn check<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if leaves_stream_desynced(&result) && !self.conn.is_broken() {
                warn!("Retiring MSSQL connection after timeout: {}", e);
                self.conn.mark_broken();
                self.in_transaction = false;
            }
        }
        result
    }

    async fn batch_statement(&mut self, sql: &str) -> Result<()> {
        if self.conn.is_broken() {
            return Err(DecryptError::pool(
                "connection retired after a timeout",
                "transfer session",
            ));
        }
        let conn = self.conn.client();
        let result = with_timeout(self.statement_timeout, sql, async move {
            conn.simple_query(sql).await?.into_results().await?;
            Ok::<_, DecryptError>(())
        })
        .await;
        self.check(result)
    }

    async fn rollback(&mut self) {
        if !self.in_transaction || self.conn.is_broken() {
            return;
        }
        self.in_transaction = false;
        if let Err(e) = self.batch_statement("IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION").await {
            warn!("Rollback failed: {}", e);
        }
    }

    async fn load(&mut self, batch: &Batch) -> Result<u64> {
        self.batch_statement(&self.truncate_sql.clone()).await?;

        let layout: Vec<&Column> = self.layout.iter().collect();
        let timeout = self.options.timeout;
        let target = self.staging_target.clone();
        let conn = self.conn.client();

        let result = with_timeout(timeout, "bulk load", async move {
            let mut bulk = conn.bulk_insert(&target).await?;
            for row in &batch.rows {
                bulk.send(encode_row(row, &layout)?).await?;
            }
            let result = bulk.finalize().await?;
            Ok::<_, DecryptError>(result.total())
        })
        .await;
        self.check(result)
    }
}

#[async_trait]
impl TransferSession for MssqlSession {
    async fn read_page(&mut self, page: Page) -> Result<Batch> {
        let mut query = Query::new(self.select_sql.as_str());
        query.bind(page.offset() as i64);
        query.bind(page.batch_size as i64);

        let conn = self.conn.client();
        let rows = with_timeout(self.statement_timeout, "read page", async move {
            let stream = query.query(conn).await?;
            Ok::<_, DecryptError>(stream.into_first_result().await?)
        })
        .await;
        let rows = self.check(rows)?;

        let layout: Vec<&Column> = self.layout.iter().collect();
        let rows = rows
            .iter()
            .map(|row| decode_row(row, &layout))
            .collect::<Result<Vec<_>>>()?;
        Ok(Batch::new(page.batch_number, rows))
    }

    async fn stage(&mut self, batch: &Batch) -> Result<u64> {
        self.batch_statement("BEGIN TRANSACTION").await?;
        self.in_transaction = true;

        match self.load(batch).await {
            Ok(staged) => Ok(staged),
            Err(e) => {
                self.rollback().await;
                Err(e)
            }
        }
    }

    async fn merge(&mut self) -> Result<u64> {
        let sql = self.merge_sql.clone();
        let conn = self.conn.client();
        let merged = with_timeout(self.statement_timeout, "merge", async move {
            Ok::<_, DecryptError>(conn.execute(sql, &[]).await?.total())
        })
        .await;

        match self.check(merged) {
            Ok(rows) => {
                self.batch_statement("COMMIT TRANSACTION").await?;
                self.in_transaction = false;
                Ok(rows)
            }
            Err(e) => {
                self.rollback().await;
                Err(e)
            }
        }
    }

    async fn close(mut self: Box<Self>) -> Result<()> {
        if self.conn.is_broken() {
            // The temp table goes away with the connection.
            return Ok(());
        }
        self.rollback().await;
        let drop_sql = self.drop_sql.clone();
        self.batch_statement(&drop_sql).await
    }
}
