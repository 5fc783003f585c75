//! In-memory database used by the integration tests.
//!
//! Implements the catalog, schema-change and transfer seams over plain Rust
//! collections and records every mutation in an operation log.

#![allow(dead_code)]

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use mssql_decrypt::core::identifier::STATUS_COLUMN;
use mssql_decrypt::{
    Batch, BulkLoadOptions, CatalogReader, Column, DecryptError, EncryptedColumn, Page,
    PrimaryKeyColumn, Result, SqlValue, Table, TableStore, TransferPlan, TransferSession,
};

type Row = BTreeMap<String, SqlValue>;

#[derive(Default)]
struct MemTable {
    columns: Vec<String>,
    rows: Vec<Row>,
}

#[derive(Default)]
struct State {
    tables: BTreeMap<Table, MemTable>,
    encrypted: Vec<EncryptedColumn>,
    keys: BTreeMap<Table, Vec<PrimaryKeyColumn>>,
    ops: Vec<String>,
    pages: BTreeMap<Table, Vec<usize>>,
    fail_merge: BTreeMap<Table, u64>,
    fail_stage: BTreeMap<Table, u64>,
    fail_key_lookup: BTreeSet<Table>,
    cancel_after_merge: Option<(u64, CancellationToken)>,
    merges: u64,
}

/// Shared handle to the in-memory database.
#[derive(Clone, Default)]
pub struct MemoryDb {
    state: Arc<Mutex<State>>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn create_table(&self, table: &Table, columns: &[&str]) {
        self.lock().tables.insert(
            table.clone(),
            MemTable {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                rows: Vec::new(),
            },
        );
    }

    pub fn set_primary_key(&self, table: &Table, key: Vec<PrimaryKeyColumn>) {
        self.lock().keys.insert(table.clone(), key);
    }

    pub fn mark_encrypted(&self, column: EncryptedColumn) {
        self.lock().encrypted.push(column);
    }

    pub fn insert(&self, table: &Table, values: Vec<(&str, SqlValue)>) {
        let mut state = self.lock();
        let mem = state.tables.get_mut(table).unwrap();
        mem.rows.push(
            values
                .into_iter()
                .map(|(name, value)| (name.to_string(), value))
                .collect(),
        );
    }

    /// Fail the merge of the given batch for a table.
    pub fn fail_merge_at(&self, table: &Table, batch: u64) {
        self.lock().fail_merge.insert(table.clone(), batch);
    }

    /// Fail the bulk load of the given batch for a table.
    pub fn fail_stage_at(&self, table: &Table, batch: u64) {
        self.lock().fail_stage.insert(table.clone(), batch);
    }

    /// Time out the primary key lookup for a table.
    pub fn fail_key_lookup(&self, table: &Table) {
        self.lock().fail_key_lookup.insert(table.clone());
    }

    /// Cancel the token once this many merges have committed.
    pub fn cancel_after_merges(&self, merges: u64, token: CancellationToken) {
        self.lock().cancel_after_merge = Some((merges, token));
    }

    pub fn columns(&self, table: &Table) -> Vec<String> {
        self.lock().tables[table].columns.clone()
    }

    /// Values of one column for every row, ordered by the given key column.
    pub fn column_values(&self, table: &Table, column: &str, order_by: &str) -> Vec<SqlValue> {
        let state = self.lock();
        let mut rows: Vec<&Row> = state.tables[table].rows.iter().collect();
        rows.sort_by(|a, b| compare(&a[order_by], &b[order_by]));
        rows.iter()
            .map(|r| r.get(column).cloned().unwrap_or(SqlValue::Null(
                mssql_decrypt::core::SqlNullType::String,
            )))
            .collect()
    }

    pub fn ops(&self) -> Vec<String> {
        self.lock().ops.clone()
    }

    /// Row counts returned by each page read, in read order.
    pub fn page_sizes(&self, table: &Table) -> Vec<usize> {
        self.lock().pages.get(table).cloned().unwrap_or_default()
    }

    /// Whether any schema change touched the table.
    pub fn mutated(&self, table: &Table) -> bool {
        let prefix = format!(" {}", table.full_name());
        self.ops().iter().any(|op| {
            (op.starts_with("rename") || op.starts_with("add") || op.starts_with("drop"))
                && op.contains(&prefix)
        })
    }
}

fn compare(a: &SqlValue, b: &SqlValue) -> Ordering {
    match (a, b) {
        (SqlValue::I32(a), SqlValue::I32(b)) => a.cmp(b),
        (SqlValue::I64(a), SqlValue::I64(b)) => a.cmp(b),
        (SqlValue::Text(a), SqlValue::Text(b)) => a.cmp(b),
        _ => Ordering::Equal,
    }
}

fn compare_keys(a: &Row, b: &Row, key: &[String]) -> Ordering {
    for name in key {
        let ord = compare(&a[name], &b[name]);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn missing(table: &Table) -> DecryptError {
    DecryptError::catalog(format!("table {} does not exist", table))
}

#[async_trait]
impl CatalogReader for MemoryDb {
    async fn list_encrypted_columns(
        &self,
        filter: Option<&BTreeSet<Table>>,
    ) -> Result<Vec<EncryptedColumn>> {
        let state = self.lock();
        Ok(state
            .encrypted
            .iter()
            .filter(|c| filter.map_or(true, |f| f.contains(&c.owner())))
            .cloned()
            .collect())
    }

    async fn list_primary_key_columns(&self, table: &Table) -> Result<Vec<PrimaryKeyColumn>> {
        if self.lock().fail_key_lookup.contains(table) {
            return Err(DecryptError::Timeout {
                operation: format!("primary key lookup for {}", table),
                seconds: 30,
            });
        }
        Ok(self.lock().keys.get(table).cloned().unwrap_or_default())
    }

    async fn list_column_names(&self, table: &Table) -> Result<Vec<String>> {
        let state = self.lock();
        let mem = state.tables.get(table).ok_or_else(|| missing(table))?;
        Ok(mem.columns.clone())
    }
}

#[async_trait]
impl TableStore for MemoryDb {
    async fn rename_column(&self, table: &Table, column: &str, new_name: &str) -> Result<()> {
        let mut state = self.lock();
        state
            .ops
            .push(format!("rename {}.{} -> {}", table, column, new_name));
        let mem = state.tables.get_mut(table).ok_or_else(|| missing(table))?;
        let slot = mem
            .columns
            .iter_mut()
            .find(|c| c.as_str() == column)
            .ok_or_else(|| DecryptError::schema_mutation(table.full_name(), "no such column"))?;
        *slot = new_name.to_string();
        for row in &mut mem.rows {
            if let Some(value) = row.remove(column) {
                row.insert(new_name.to_string(), value);
            }
        }
        Ok(())
    }

    async fn add_column(&self, table: &Table, name: &str, declaration: &str) -> Result<()> {
        let mut state = self.lock();
        state
            .ops
            .push(format!("add {}.{} {}", table, name, declaration));
        let mem = state.tables.get_mut(table).ok_or_else(|| missing(table))?;
        if mem.columns.iter().any(|c| c == name) {
            return Err(DecryptError::schema_mutation(
                table.full_name(),
                format!("column {} already exists", name),
            ));
        }
        mem.columns.push(name.to_string());
        Ok(())
    }

    async fn drop_columns(&self, table: &Table, columns: &[String]) -> Result<()> {
        let mut state = self.lock();
        state
            .ops
            .push(format!("drop {} {}", table, columns.join(", ")));
        let mem = state.tables.get_mut(table).ok_or_else(|| missing(table))?;
        mem.columns.retain(|c| !columns.contains(c));
        for row in &mut mem.rows {
            row.retain(|name, _| !columns.contains(name));
        }
        Ok(())
    }

    async fn open_session(
        &self,
        plan: &TransferPlan,
        options: BulkLoadOptions,
    ) -> Result<Box<dyn TransferSession>> {
        self.lock().ops.push(format!(
            "open {} batch_size={}",
            plan.table, options.batch_size
        ));
        Ok(Box::new(MemorySession {
            db: self.clone(),
            plan: plan.clone(),
            staged: None,
        }))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

struct MemorySession {
    db: MemoryDb,
    plan: TransferPlan,
    staged: Option<Batch>,
}

#[async_trait]
impl TransferSession for MemorySession {
    async fn read_page(&mut self, page: Page) -> Result<Batch> {
        let mut state = self.db.lock();
        let table = &self.plan.table;
        let key: Vec<String> = self.plan.key_names().iter().map(|k| k.to_string()).collect();
        let source: Vec<&str> = self.plan.source_columns();

        let mem = state.tables.get(table).ok_or_else(|| missing(table))?;
        let mut ordered: Vec<&Row> = mem.rows.iter().collect();
        ordered.sort_by(|a, b| compare_keys(a, b, &key));

        let rows = ordered
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.batch_size)
            .map(|row| {
                source
                    .iter()
                    .map(|name| {
                        row.get(*name).cloned().ok_or_else(|| {
                            DecryptError::catalog(format!("invalid column name {}", name))
                        })
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;

        state
            .pages
            .entry(table.clone())
            .or_default()
            .push(rows.len());
        Ok(Batch::new(page.batch_number, rows))
    }

    async fn stage(&mut self, batch: &Batch) -> Result<u64> {
        let mut state = self.db.lock();
        let table = &self.plan.table;
        if state.fail_stage.get(table) == Some(&batch.batch_number) {
            state
                .ops
                .push(format!("rollback {} {}", table, batch.batch_number));
            return Err(DecryptError::Timeout {
                operation: "bulk insert finalize".to_string(),
                seconds: 60,
            });
        }
        let rows = batch.len() as u64;
        self.staged = Some(batch.clone());
        Ok(rows)
    }

    async fn merge(&mut self) -> Result<u64> {
        let batch = self.staged.take().unwrap_or_default();
        let mut state = self.db.lock();
        let table = self.plan.table.clone();

        if state.fail_merge.get(&table) == Some(&batch.batch_number) {
            state
                .ops
                .push(format!("rollback {} {}", table, batch.batch_number));
            return Err(DecryptError::catalog("deadlock victim"));
        }

        let plain: Vec<String> = self.plan.columns.iter().map(|c| c.name().to_string()).collect();
        let key: Vec<String> = self.plan.key_names().iter().map(|k| k.to_string()).collect();

        let mem = state.tables.get_mut(&table).ok_or_else(|| missing(&table))?;
        let mut merged = 0;
        for staged in &batch.rows {
            let (values, key_values) = staged.split_at(plain.len());
            let target = mem.rows.iter_mut().find(|row| {
                key.iter()
                    .zip(key_values)
                    .all(|(name, value)| row.get(name) == Some(value))
            });
            if let Some(row) = target {
                for (name, value) in plain.iter().zip(values) {
                    row.insert(name.clone(), value.clone());
                }
                row.insert(STATUS_COLUMN.to_string(), SqlValue::Bool(true));
                merged += 1;
            }
        }

        state
            .ops
            .push(format!("merge {} {} -> {}", table, batch.batch_number, merged));
        state.merges += 1;
        if let Some((after, token)) = &state.cancel_after_merge {
            if state.merges >= *after {
                token.cancel();
            }
        }
        Ok(merged)
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.db.lock().ops.push(format!("close {}", self.plan.table));
        Ok(())
    }
}

/// An encrypted column of the given type.
pub fn encrypted(table: &Table, name: &str, data_type: &str, length: i32) -> EncryptedColumn {
    EncryptedColumn {
        column: Column::new(table, name, data_type)
            .with_length(length)
            .with_nullable(false),
        column_key_name: "CEK_Auto1".into(),
        encryption_type: "DETERMINISTIC".into(),
        encryption_algorithm: "AEAD_AES_256_CBC_HMAC_SHA_256".into(),
    }
}

/// An int primary key column.
pub fn key(table: &Table, name: &str, ordinal: i32) -> PrimaryKeyColumn {
    PrimaryKeyColumn {
        column: Column::new(table, name, "int").with_nullable(false),
        key_ordinal: ordinal,
    }
}

pub fn ssn(id: i32) -> SqlValue {
    SqlValue::Text(format!("{:03}-{:02}-{:04}", id % 1000, id % 100, id % 10_000))
}

/// `dbo.Customer(CustomerId int PK, Ssn char(11) encrypted)` with `rows` rows.
pub fn customer_db(db: &MemoryDb, rows: i32) -> Table {
    let table = Table::new("dbo", "Customer");
    db.create_table(&table, &["CustomerId", "Ssn"]);
    db.set_primary_key(&table, vec![key(&table, "CustomerId", 1)]);
    db.mark_encrypted(encrypted(&table, "Ssn", "char", 11));
    for id in 1..=rows {
        db.insert(
            &table,
            vec![("CustomerId", SqlValue::I32(id)), ("Ssn", ssn(id))],
        );
    }
    table
}
