//! Migration orchestrator - per-table workflow and cross-table concurrency.
//!
//! Each table moves through [`TableStage`]s: key validation, schema
//! preparation, batch transfer, cleanup. Tables run concurrently and fail
//! independently; a table that fails keeps whatever stage it last reached.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::core::identifier::STATUS_COLUMN;
use crate::core::schema::{EncryptedColumn, Table};
use crate::core::traits::{CatalogReader, TableStore};
use crate::drivers::mssql::{MssqlCatalog, MssqlPool, MssqlStore, OdbcConnector};
use crate::error::{DecryptError, Result};
use crate::transfer::{TransferConfig, TransferEngine, TransferPlan, TransferStats};
use crate::typemap::STATUS_COLUMN_DECLARATION;

/// Last stage a table reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStage {
    Discovered,
    KeyValidated,
    SchemaPrepared,
    DataTransferred,
    CleanedUp,
}

/// How a table's run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    Completed,
    Failed,
    Cancelled,
}

/// Outcome of migrating one table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableOutcome {
    /// Fully qualified table name.
    pub table: String,

    /// Final status.
    pub status: TableStatus,

    /// Last stage reached.
    pub stage: TableStage,

    /// Encrypted columns migrated (or planned to be).
    pub columns: Vec<String>,

    /// Rows merged into plain columns.
    pub rows: u64,

    /// Non-empty batches merged.
    pub batches: u64,

    /// Time spent on this table in seconds.
    pub duration_seconds: f64,

    /// Failure description, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TableOutcome {
    fn new(table: &Table, columns: &[EncryptedColumn]) -> Self {
        Self {
            table: table.full_name(),
            status: TableStatus::Failed,
            stage: TableStage::Discovered,
            columns: columns.iter().map(|c| c.name().to_string()).collect(),
            rows: 0,
            batches: 0,
            duration_seconds: 0.0,
            error: None,
        }
    }
}

/// Result of a migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationResult {
    /// Unique run identifier.
    pub run_id: String,

    /// Final status: completed, failed or cancelled.
    pub status: String,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    /// When the migration started.
    pub started_at: DateTime<Utc>,

    /// When the migration completed.
    pub completed_at: DateTime<Utc>,

    /// Tables with encrypted columns that were processed.
    pub tables_total: usize,

    /// Tables fully migrated.
    pub tables_success: usize,

    /// Tables that failed.
    pub tables_failed: usize,

    /// Tables stopped by cancellation.
    pub tables_cancelled: usize,

    /// Total rows migrated.
    pub rows_migrated: u64,

    /// List of failed table names.
    pub failed_tables: Vec<String>,

    /// Per-table outcomes, ordered by table name.
    pub tables: Vec<TableOutcome>,
}

impl MigrationResult {
    /// Whether any table failed.
    pub fn has_failures(&self) -> bool {
        self.tables_failed > 0
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Planned changes for one table, without touching it.
#[derive(Debug, Clone, Serialize)]
pub struct TablePlanReport {
    /// Fully qualified table name.
    pub table: String,

    /// The plan, when the table can be migrated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<TransferPlan>,

    /// Human-readable steps the run would take.
    pub steps: Vec<String>,

    /// Why the table cannot be migrated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Dry-run report for every discovered table.
#[derive(Debug, Clone, Serialize)]
pub struct PlanReport {
    pub batch_size: usize,
    pub tables: Vec<TablePlanReport>,
}

impl PlanReport {
    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Tables migrated at the same time.
    pub workers: usize,

    /// Transfer engine settings shared by all tables.
    pub transfer: TransferConfig,
}

impl OrchestratorConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            workers: config.migration.get_workers().max(1),
            transfer: TransferConfig {
                batch_size: config.migration.batch_size,
                bulk_load_timeout: config.migration.bulk_load_timeout(),
            },
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            transfer: TransferConfig::default(),
        }
    }
}

/// Migration orchestrator.
#[derive(Clone)]
pub struct Orchestrator {
    catalog: Arc<dyn CatalogReader>,
    store: Arc<dyn TableStore>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    /// Wire an orchestrator from its collaborators.
    pub fn new(
        catalog: Arc<dyn CatalogReader>,
        store: Arc<dyn TableStore>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            catalog,
            store,
            config,
        }
    }

    /// Connect to SQL Server and wire the MSSQL catalog and store.
    ///
    /// With `source.column_encryption` on, pages are read and merged over
    /// ODBC so the driver can decrypt them.
    pub async fn connect(config: &Config) -> Result<Self> {
        let pool =
            MssqlPool::connect(&config.source, config.migration.get_max_connections() as u32)
                .await?;

        let catalog = Arc::new(MssqlCatalog::new(pool.clone()));
        let mut store = MssqlStore::new(pool, config.migration.statement_timeout());
        if config.source.column_encryption {
            store = store.with_odbc(OdbcConnector::connect(&config.source).await?);
        } else {
            warn!("Column encryption is disabled; encrypted columns will be read as ciphertext");
        }
        let store = Arc::new(store);

        Ok(Self::new(
            catalog,
            store,
            OrchestratorConfig::from_config(config),
        ))
    }

    /// Test connectivity.
    pub async fn health_check(&self) -> Result<()> {
        self.store.ping().await
    }

    /// Discover encrypted columns grouped by table.
    pub async fn discover(
        &self,
        filter: Option<&BTreeSet<Table>>,
    ) -> Result<BTreeMap<Table, Vec<EncryptedColumn>>> {
        let columns = self
            .catalog
            .list_encrypted_columns(filter)
            .await
            .map_err(|e| match e {
                DecryptError::CatalogUnavailable(_) => e,
                other => DecryptError::catalog(other),
            })?;

        let mut grouped: BTreeMap<Table, Vec<EncryptedColumn>> = BTreeMap::new();
        for column in columns {
            grouped.entry(column.owner()).or_default().push(column);
        }

        info!(
            "Discovered {} encrypted columns in {} tables",
            grouped.values().map(Vec::len).sum::<usize>(),
            grouped.len()
        );
        Ok(grouped)
    }

    /// Fetch the key and build the transfer plan for a table.
    ///
    /// Read-only; fails when the table cannot be migrated.
    pub async fn plan_table(
        &self,
        table: &Table,
        columns: &[EncryptedColumn],
    ) -> Result<TransferPlan> {
        let key = self.catalog.list_primary_key_columns(table).await?;
        TransferPlan::build(table, columns, &key)
    }

    /// Prepare a table: rename encrypted columns aside, add plain columns and
    /// the status column.
    ///
    /// Refuses tables that already carry the status column or an alias, so
    /// leftovers of an interrupted run are never built upon.
    pub async fn prepare(&self, plan: &TransferPlan) -> Result<()> {
        let table = &plan.table;
        let existing: BTreeSet<String> = self
            .catalog
            .list_column_names(table)
            .await?
            .into_iter()
            .map(|c| c.to_lowercase())
            .collect();

        let leftovers: Vec<&str> = plan
            .reserved_names()
            .into_iter()
            .filter(|name| existing.contains(&name.to_lowercase()))
            .collect();
        if !leftovers.is_empty() {
            return Err(DecryptError::PartiallyPrepared {
                table: table.full_name(),
                detail: format!("found existing column(s) {}", leftovers.join(", ")),
            });
        }

        for column in &plan.columns {
            self.store
                .rename_column(table, column.name(), &column.alias)
                .await?;
        }
        debug!("{}: renamed {} columns", table, plan.columns.len());

        for column in &plan.columns {
            self.store
                .add_column(table, column.name(), &column.plain_declaration)
                .await?;
        }

        self.store
            .add_column(table, STATUS_COLUMN, STATUS_COLUMN_DECLARATION)
            .await?;

        info!("{}: schema prepared", table);
        Ok(())
    }

    /// Move every row's values into the plain columns.
    pub async fn transfer(
        &self,
        plan: &TransferPlan,
        cancel: &CancellationToken,
    ) -> Result<TransferStats> {
        self.engine().execute(plan, cancel).await
    }

    fn engine(&self) -> TransferEngine {
        TransferEngine::new(self.store.clone(), self.config.transfer.clone())
    }

    /// Drop the status column and every `_Encrypted` column.
    pub async fn cleanup(&self, plan: &TransferPlan) -> Result<()> {
        self.store
            .drop_columns(&plan.table, &plan.cleanup_columns())
            .await?;
        info!("{}: cleaned up", plan.table);
        Ok(())
    }

    /// Run the full sequence for one table. Never fails; the outcome carries
    /// the error and the stage reached.
    pub async fn migrate_table(
        &self,
        table: &Table,
        columns: &[EncryptedColumn],
        cancel: &CancellationToken,
    ) -> TableOutcome {
        let start = Instant::now();
        let mut outcome = TableOutcome::new(table, columns);

        let result = self.run_stages(table, columns, cancel, &mut outcome).await;
        outcome.duration_seconds = start.elapsed().as_secs_f64();

        match result {
            Ok(()) => {
                outcome.status = TableStatus::Completed;
                info!(
                    "{}: migrated {} rows in {} batches ({:.1}s)",
                    outcome.table, outcome.rows, outcome.batches, outcome.duration_seconds
                );
            }
            Err(DecryptError::Cancelled) => {
                outcome.status = TableStatus::Cancelled;
                warn!(
                    "{}: cancelled at stage {:?} after {} rows",
                    outcome.table, outcome.stage, outcome.rows
                );
            }
            Err(e) => {
                outcome.status = TableStatus::Failed;
                error!(
                    "{}: failed at stage {:?} after {} rows: {}",
                    outcome.table, outcome.stage, outcome.rows, e
                );
                if !e.is_table_scoped() {
                    warn!("{}: connection-level failure, other tables may be affected", outcome.table);
                }
                outcome.error = Some(e.to_string());
            }
        }

        outcome
    }

    async fn run_stages(
        &self,
        table: &Table,
        columns: &[EncryptedColumn],
        cancel: &CancellationToken,
        outcome: &mut TableOutcome,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(DecryptError::Cancelled);
        }

        let plan = self.plan_table(table, columns).await?;
        outcome.stage = TableStage::KeyValidated;

        if cancel.is_cancelled() {
            return Err(DecryptError::Cancelled);
        }

        self.prepare(&plan).await?;
        outcome.stage = TableStage::SchemaPrepared;

        let engine = self.engine();
        let stats = engine.execute(&plan, cancel).await;
        outcome.rows = engine.rows_transferred();
        outcome.batches = stats?.batches;
        outcome.stage = TableStage::DataTransferred;

        self.cleanup(&plan).await?;
        outcome.stage = TableStage::CleanedUp;
        Ok(())
    }

    /// Discover and migrate every table, concurrently.
    ///
    /// Only a discovery failure fails the run; table failures are reported
    /// in the result.
    pub async fn run_all(
        &self,
        filter: Option<&BTreeSet<Table>>,
        cancel: CancellationToken,
    ) -> Result<MigrationResult> {
        let started_at = Utc::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        info!("Starting migration run: {}", run_id);

        let grouped = self.discover(filter).await?;
        if grouped.is_empty() {
            info!("No encrypted columns found");
        }

        let workers = self.config.workers;
        let semaphore = Arc::new(Semaphore::new(workers));
        info!(
            "Migrating {} tables with {} workers",
            grouped.len(),
            workers
        );

        let mut handles = Vec::with_capacity(grouped.len());
        for (table, columns) in grouped {
            let this = self.clone();
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            let name = table.full_name();
            let column_names: Vec<String> = columns.iter().map(|c| c.name().to_string()).collect();

            let handle = tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        let mut outcome = TableOutcome::new(&table, &columns);
                        outcome.status = TableStatus::Cancelled;
                        return outcome;
                    }
                };
                this.migrate_table(&table, &columns, &cancel).await
            });
            handles.push((name, column_names, handle));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (name, columns, handle) in handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    error!("{}: worker task failed: {}", name, e);
                    outcomes.push(TableOutcome {
                        table: name,
                        status: TableStatus::Failed,
                        stage: TableStage::Discovered,
                        columns,
                        rows: 0,
                        batches: 0,
                        duration_seconds: 0.0,
                        error: Some(format!("worker task failed: {}", e)),
                    });
                }
            }
        }

        let completed_at = Utc::now();
        let result = summarize(run_id, started_at, completed_at, outcomes);

        info!(
            "Migration {}: {} tables ({} succeeded, {} failed, {} cancelled), {} rows in {:.1}s",
            result.status,
            result.tables_total,
            result.tables_success,
            result.tables_failed,
            result.tables_cancelled,
            result.rows_migrated,
            result.duration_seconds
        );
        if result.has_failures() {
            warn!("Failed tables: {}", result.failed_tables.join(", "));
        }

        Ok(result)
    }

    /// Dry run: discover, validate and plan every table without changing it.
    pub async fn plan(&self, filter: Option<&BTreeSet<Table>>) -> Result<PlanReport> {
        let grouped = self.discover(filter).await?;
        let batch_size = self.config.transfer.batch_size;

        let mut tables = Vec::with_capacity(grouped.len());
        for (table, columns) in &grouped {
            let report = match self.plan_table(table, columns).await {
                Ok(plan) => TablePlanReport {
                    table: table.full_name(),
                    steps: plan_steps(&plan, batch_size),
                    plan: Some(plan),
                    error: None,
                },
                Err(e) => TablePlanReport {
                    table: table.full_name(),
                    plan: None,
                    steps: Vec::new(),
                    error: Some(e.to_string()),
                },
            };
            tables.push(report);
        }

        Ok(PlanReport { batch_size, tables })
    }
}

fn plan_steps(plan: &TransferPlan, batch_size: usize) -> Vec<String> {
    let mut steps = Vec::new();
    for column in &plan.columns {
        steps.push(format!("rename {} to {}", column.name(), column.alias));
    }
    for column in &plan.columns {
        steps.push(format!(
            "add column {} {}",
            column.name(),
            column.plain_declaration
        ));
    }
    steps.push(format!(
        "add column {} {}",
        STATUS_COLUMN, STATUS_COLUMN_DECLARATION
    ));
    steps.push(format!(
        "copy values in batches of {} ordered by {} via {}",
        batch_size,
        plan.key_names().join(", "),
        plan.staging_table
    ));
    steps.push(format!("drop columns {}", plan.cleanup_columns().join(", ")));
    steps
}

fn summarize(
    run_id: String,
    started_at: DateTime<Utc>,
    completed_at: DateTime<Utc>,
    mut tables: Vec<TableOutcome>,
) -> MigrationResult {
    tables.sort_by(|a, b| a.table.cmp(&b.table));

    let count = |status: TableStatus| tables.iter().filter(|t| t.status == status).count();
    let tables_success = count(TableStatus::Completed);
    let tables_failed = count(TableStatus::Failed);
    let tables_cancelled = count(TableStatus::Cancelled);

    let status = if tables_failed > 0 {
        "failed"
    } else if tables_cancelled > 0 {
        "cancelled"
    } else {
        "completed"
    };

    MigrationResult {
        run_id,
        status: status.to_string(),
        duration_seconds: (completed_at - started_at).num_milliseconds() as f64 / 1000.0,
        started_at,
        completed_at,
        tables_total: tables.len(),
        tables_success,
        tables_failed,
        tables_cancelled,
        rows_migrated: tables.iter().map(|t| t.rows).sum(),
        failed_tables: tables
            .iter()
            .filter(|t| t.status == TableStatus::Failed)
            .map(|t| t.table.clone())
            .collect(),
        tables,
    }
}
