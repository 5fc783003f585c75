//! Catalog reader over the SQL Server system views.

use std::collections::BTreeSet;

use async_trait::async_trait;
use tiberius::{Query, Row};
use tracing::debug;

use super::dialect::{MssqlDialect, COLUMN_NAMES_SQL, PRIMARY_KEY_SQL};
use super::pool::MssqlPool;
use crate::core::identifier::qualify;
use crate::core::schema::{Column, EncryptedColumn, PrimaryKeyColumn, Table};
use crate::core::traits::CatalogReader;
use crate::error::{DecryptError, Result};

/// Reads encryption and key metadata from `sys.*` views.
pub struct MssqlCatalog {
    pool: MssqlPool,
    dialect: MssqlDialect,
}

impl MssqlCatalog {
    pub fn new(pool: MssqlPool) -> Self {
        Self {
            pool,
            dialect: MssqlDialect::new(),
        }
    }

    async fn query_rows(&self, query: Query<'_>, context: &str) -> Result<Vec<Row>> {
        let mut conn = self.pool.get(context).await.map_err(DecryptError::catalog)?;
        let stream = query
            .query(conn.client())
            .await
            .map_err(|e| DecryptError::catalog(format!("{}: {}", context, e)))?;
        stream
            .into_first_result()
            .await
            .map_err(|e| DecryptError::catalog(format!("{}: {}", context, e)))
    }
}

/// Read the shared type facet columns starting at `offset`:
/// type, max_length, precision, scale, is_nullable, collation.
fn read_column(row: &Row, offset: usize, table: &Table, name: &str) -> Result<Column> {
    let data_type: &str = row.try_get(offset)?.unwrap_or_default();
    let mut column = Column::new(table, name, data_type)
        .with_length(row.try_get(offset + 1)?.unwrap_or(0))
        .with_precision(
            row.try_get(offset + 2)?.unwrap_or(0),
            row.try_get(offset + 3)?.unwrap_or(0),
        )
        .with_nullable(row.try_get(offset + 4)?.unwrap_or(true));
    column.collation = row
        .try_get::<&str, _>(offset + 5)?
        .map(str::to_string);
    Ok(column)
}

fn read_string(row: &Row, idx: usize) -> Result<String> {
    Ok(row
        .try_get::<&str, _>(idx)?
        .unwrap_or_default()
        .to_string())
}

#[async_trait]
impl CatalogReader for MssqlCatalog {
    async fn list_encrypted_columns(
        &self,
        filter: Option<&BTreeSet<Table>>,
    ) -> Result<Vec<EncryptedColumn>> {
        let tables: Vec<&Table> = filter.map(|f| f.iter().collect()).unwrap_or_default();
        let sql = self.dialect.encrypted_columns_query(tables.len());

        let mut query = Query::new(sql);
        for table in &tables {
            query.bind(table.schema.as_str());
            query.bind(table.name.as_str());
        }

        let rows = self
            .query_rows(query, "listing encrypted columns")
            .await?;

        let mut columns = Vec::with_capacity(rows.len());
        for row in &rows {
            let table = Table::new(read_string(row, 0)?, read_string(row, 1)?);
            let name = read_string(row, 2)?;
            columns.push(EncryptedColumn {
                column: read_column(row, 3, &table, &name)?,
                column_key_name: read_string(row, 9)?,
                encryption_type: read_string(row, 10)?,
                encryption_algorithm: read_string(row, 11)?,
            });
        }

        debug!("Found {} encrypted columns", columns.len());
        Ok(columns)
    }

    async fn list_primary_key_columns(&self, table: &Table) -> Result<Vec<PrimaryKeyColumn>> {
        let mut query = Query::new(PRIMARY_KEY_SQL);
        query.bind(qualify(table)?);

        let rows = self.query_rows(query, "loading primary key").await?;

        let mut key = Vec::with_capacity(rows.len());
        for row in &rows {
            let name = read_string(row, 0)?;
            key.push(PrimaryKeyColumn {
                column: read_column(row, 1, table, &name)?,
                key_ordinal: row.try_get(7)?.unwrap_or(0),
            });
        }

        debug!(
            "Primary key for {}: {:?}",
            table.full_name(),
            key.iter().map(|k| k.name()).collect::<Vec<_>>()
        );
        Ok(key)
    }

    async fn list_column_names(&self, table: &Table) -> Result<Vec<String>> {
        let mut query = Query::new(COLUMN_NAMES_SQL);
        query.bind(qualify(table)?);

        let rows = self.query_rows(query, "listing columns").await?;
        rows.iter().map(|row| read_string(row, 0)).collect()
    }
}
