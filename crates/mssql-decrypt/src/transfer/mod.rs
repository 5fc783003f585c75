//! Batch transfer engine.
//!
//! Moves one table's encrypted values into its plain columns, one page at a
//! time: read a page in primary key order, stage it, merge it with a single
//! set-based update, repeat until a page comes back empty. Pages are strictly
//! sequential within a table because each page's offset is derived from its
//! batch number alone.

pub mod plan;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::traits::{BulkLoadOptions, Page, TableStore, TransferSession};
use crate::error::{DecryptError, Result};

pub use plan::{PlannedColumn, TransferPlan};

/// Rows per page unless configured otherwise.
pub const DEFAULT_BATCH_SIZE: usize = 10_000;

/// Bulk load timeout unless configured otherwise.
pub const DEFAULT_BULK_LOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// Transfer engine configuration.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Number of rows per page.
    pub batch_size: usize,

    /// Upper bound on a single page's bulk load.
    pub bulk_load_timeout: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            bulk_load_timeout: DEFAULT_BULK_LOAD_TIMEOUT,
        }
    }
}

/// Statistics from transferring one table.
#[derive(Debug, Clone, Default)]
pub struct TransferStats {
    /// Non-empty pages merged.
    pub batches: u64,

    /// Pages read, including the final empty one.
    pub pages_read: u64,

    /// Rows merged into the plain columns.
    pub rows: u64,

    /// Time spent reading pages.
    pub read_time: Duration,

    /// Time spent bulk loading the staging table.
    pub stage_time: Duration,

    /// Time spent in merge statements.
    pub merge_time: Duration,

    /// Whether an empty page was reached.
    pub completed: bool,
}

/// Runs the page loop for one table at a time.
pub struct TransferEngine {
    store: Arc<dyn TableStore>,
    config: TransferConfig,
    rows_transferred: AtomicU64,
}

impl TransferEngine {
    /// Create a new transfer engine.
    pub fn new(store: Arc<dyn TableStore>, config: TransferConfig) -> Self {
        Self {
            store,
            config,
            rows_transferred: AtomicU64::new(0),
        }
    }

    /// Rows merged so far, including pages merged before a failure.
    pub fn rows_transferred(&self) -> u64 {
        self.rows_transferred.load(Ordering::Relaxed)
    }

    /// Transfer every row of the planned table.
    ///
    /// Stops at the first failing page; pages merged before it stay merged.
    /// Cancellation is honored between pages.
    pub async fn execute(
        &self,
        plan: &TransferPlan,
        cancel: &CancellationToken,
    ) -> Result<TransferStats> {
        let table_name = plan.table.full_name();
        info!(
            "Starting transfer for {} ({} encrypted columns, batch size {})",
            table_name,
            plan.columns.len(),
            self.config.batch_size
        );

        let options = BulkLoadOptions {
            batch_size: self.config.batch_size,
            timeout: self.config.bulk_load_timeout,
        };
        let mut session = self
            .store
            .open_session(plan, options)
            .await
            .map_err(|e| DecryptError::batch_transfer(&table_name, 1, format!("open session: {}", e)))?;

        let start = Instant::now();
        let mut stats = TransferStats::default();
        let result = self
            .run_pages(session.as_mut(), plan, cancel, &mut stats)
            .await;

        // Release the connection whatever happened to the loop.
        if let Err(e) = session.close().await {
            warn!("{}: failed to close transfer session: {}", table_name, e);
        }
        result?;

        stats.completed = true;
        let elapsed = start.elapsed();
        let rows_per_sec = if elapsed.as_secs_f64() > 0.0 {
            (stats.rows as f64 / elapsed.as_secs_f64()) as u64
        } else {
            0
        };

        info!(
            "{}: transferred {} rows in {} batches in {:?} ({} rows/sec, read: {:?}, stage: {:?}, merge: {:?})",
            table_name,
            stats.rows,
            stats.batches,
            elapsed,
            rows_per_sec,
            stats.read_time,
            stats.stage_time,
            stats.merge_time
        );

        Ok(stats)
    }

    async fn run_pages(
        &self,
        session: &mut dyn TransferSession,
        plan: &TransferPlan,
        cancel: &CancellationToken,
        stats: &mut TransferStats,
    ) -> Result<()> {
        let table_name = plan.table.full_name();
        let mut batch_number: u64 = 1;

        loop {
            if cancel.is_cancelled() {
                info!(
                    "{}: cancelled before batch {} ({} rows merged)",
                    table_name, batch_number, stats.rows
                );
                return Err(DecryptError::Cancelled);
            }

            let page = Page::new(batch_number, self.config.batch_size);

            let read_start = Instant::now();
            let batch = session.read_page(page).await.map_err(|e| {
                DecryptError::batch_transfer(&table_name, batch_number, format!("read page: {}", e))
            })?;
            stats.read_time += read_start.elapsed();
            stats.pages_read += 1;

            if batch.is_empty() {
                debug!("{}: batch {} is empty, table exhausted", table_name, batch_number);
                return Ok(());
            }

            if let Some(row) = batch.rows.iter().find(|r| r.len() != plan.row_width()) {
                return Err(DecryptError::batch_transfer(
                    &table_name,
                    batch_number,
                    format!(
                        "row has {} values, expected {}",
                        row.len(),
                        plan.row_width()
                    ),
                ));
            }

            let stage_start = Instant::now();
            let staged = session.stage(&batch).await.map_err(|e| {
                DecryptError::batch_transfer(&table_name, batch_number, format!("bulk load: {}", e))
            })?;
            stats.stage_time += stage_start.elapsed();

            let merge_start = Instant::now();
            let merged = session.merge().await.map_err(|e| {
                DecryptError::batch_transfer(&table_name, batch_number, format!("merge: {}", e))
            })?;
            stats.merge_time += merge_start.elapsed();

            if merged != staged {
                warn!(
                    "{}: batch {} staged {} rows but merged {}",
                    table_name, batch_number, staged, merged
                );
            }

            stats.batches += 1;
            stats.rows += merged;
            self.rows_transferred.fetch_add(merged, Ordering::Relaxed);

            debug!(
                "{}: batch {} merged {} rows (total {})",
                table_name, batch_number, merged, stats.rows
            );

            batch_number += 1;
        }
    }
}
