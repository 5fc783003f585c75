//! Configuration type definitions with auto-tuning based on system resources.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::info;

/// System resource information for auto-tuning.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total RAM in GB.
    pub total_memory_gb: f64,
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    pub fn detect() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_cpu();

        Self {
            total_memory_gb: sys.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0),
            cpu_cores: sys.cpus().len().max(1),
        }
    }

    /// Log detected system resources.
    pub fn log(&self) {
        info!(
            "System resources: {:.1} GB RAM, {} CPU cores",
            self.total_memory_gb, self.cpu_cores
        );
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Database holding the encrypted columns.
    pub source: SourceConfig,

    /// Migration behavior configuration.
    #[serde(default)]
    pub migration: MigrationConfig,
}

impl Config {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that weren't explicitly set in the config file.
    pub fn with_auto_tuning(mut self) -> Self {
        let resources = SystemResources::detect();
        resources.log();
        self.migration = self.migration.with_auto_tuning(&resources);
        self
    }
}

/// SQL Server connection configuration.
///
/// Encrypted values are decrypted by the client driver, so the machine
/// running the migration needs access to the column master keys.
#[derive(Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 1433).
    #[serde(default = "default_mssql_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// Encrypt connection (default: true).
    #[serde(default = "default_true")]
    pub encrypt: bool,

    /// Trust server certificate (default: false).
    #[serde(default)]
    pub trust_server_cert: bool,

    /// Let the ODBC driver decrypt column-encrypted values (default: true).
    ///
    /// When disabled, pages are read and bulk-loaded over TDS, which only
    /// works for values the server already returns in the clear.
    #[serde(default = "default_true")]
    pub column_encryption: bool,
}

impl fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("encrypt", &self.encrypt)
            .field("trust_server_cert", &self.trust_server_cert)
            .field("column_encryption", &self.column_encryption)
            .finish()
    }
}

/// Migration behavior configuration.
/// Tuning fields use Option<T> to distinguish between "not set" (use
/// auto-tuned default) and "explicitly set" (use provided value).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Rows per page (default: 10000).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Seconds allowed for one page's bulk load (default: 60).
    #[serde(default = "default_bulk_load_timeout")]
    pub bulk_load_timeout_secs: u64,

    /// Seconds allowed for DDL and merge statements (default: 30).
    #[serde(default = "default_statement_timeout")]
    pub statement_timeout_secs: u64,

    /// Tables migrated at the same time. Auto-tuned based on CPU cores if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    /// Maximum pooled connections. Auto-tuned based on workers if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,

    /// Tables to migrate as `schema.table` or `table`. Empty means all.
    #[serde(default)]
    pub tables: Vec<String>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            bulk_load_timeout_secs: default_bulk_load_timeout(),
            statement_timeout_secs: default_statement_timeout(),
            workers: None,
            max_connections: None,
            tables: Vec::new(),
        }
    }
}

impl MigrationConfig {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that are None (not explicitly set).
    pub fn with_auto_tuning(mut self, resources: &SystemResources) -> Self {
        let cores = resources.cpu_cores;

        // Each table holds one connection for its whole transfer and the
        // server does the heavy lifting, so stay well under the core count.
        let explicit_max = self.max_connections;
        let workers = *self.workers.get_or_insert_with(|| {
            let tuned = (cores / 2).clamp(2, 16);
            match explicit_max {
                Some(max) => tuned.min(max.saturating_sub(1)).max(1),
                None => tuned,
            }
        });

        // One session per table plus headroom for DDL and catalog queries.
        let max_connections = *self
            .max_connections
            .get_or_insert_with(|| (workers * 2).clamp(4, 64).max(workers + 1));

        info!(
            "Auto-tuned config: workers={}, max_connections={}, batch_size={}",
            workers, max_connections, self.batch_size
        );

        self
    }

    pub fn get_workers(&self) -> usize {
        self.workers.unwrap_or(4)
    }

    pub fn get_max_connections(&self) -> usize {
        self.max_connections
            .unwrap_or_else(|| (self.get_workers() * 2).max(4))
    }

    pub fn bulk_load_timeout(&self) -> Duration {
        Duration::from_secs(self.bulk_load_timeout_secs)
    }

    pub fn statement_timeout(&self) -> Duration {
        Duration::from_secs(self.statement_timeout_secs)
    }
}

// Default value functions for serde
fn default_mssql_port() -> u16 {
    1433
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> usize {
    10_000
}

fn default_bulk_load_timeout() -> u64 {
    60
}

fn default_statement_timeout() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_tuning_fills_unset_values() {
        let resources = SystemResources {
            total_memory_gb: 16.0,
            cpu_cores: 8,
        };
        let tuned = MigrationConfig::default().with_auto_tuning(&resources);
        assert_eq!(tuned.workers, Some(4));
        assert_eq!(tuned.max_connections, Some(8));
    }

    #[test]
    fn test_auto_tuning_keeps_explicit_values() {
        let resources = SystemResources {
            total_memory_gb: 64.0,
            cpu_cores: 64,
        };
        let config = MigrationConfig {
            workers: Some(3),
            max_connections: Some(5),
            ..Default::default()
        };
        let tuned = config.with_auto_tuning(&resources);
        assert_eq!(tuned.workers, Some(3));
        assert_eq!(tuned.max_connections, Some(5));
    }

    #[test]
    fn test_auto_tuning_follows_overridden_workers() {
        let resources = SystemResources {
            total_memory_gb: 16.0,
            cpu_cores: 8,
        };
        let config = MigrationConfig {
            workers: Some(16),
            ..Default::default()
        };
        let tuned = config.with_auto_tuning(&resources);
        assert_eq!(tuned.workers, Some(16));
        assert_eq!(tuned.max_connections, Some(32));

        let config = MigrationConfig {
            workers: Some(100),
            ..Default::default()
        };
        assert_eq!(
            config.with_auto_tuning(&resources).max_connections,
            Some(101)
        );
    }

    #[test]
    fn test_auto_tuning_fits_workers_under_explicit_connections() {
        let resources = SystemResources {
            total_memory_gb: 64.0,
            cpu_cores: 32,
        };
        let config = MigrationConfig {
            max_connections: Some(4),
            ..Default::default()
        };
        let tuned = config.with_auto_tuning(&resources);
        assert_eq!(tuned.workers, Some(3));
        assert_eq!(tuned.max_connections, Some(4));
    }

    #[test]
    fn test_auto_tuning_bounds() {
        let small = SystemResources {
            total_memory_gb: 2.0,
            cpu_cores: 1,
        };
        assert_eq!(
            MigrationConfig::default().with_auto_tuning(&small).workers,
            Some(2)
        );
        let large = SystemResources {
            total_memory_gb: 512.0,
            cpu_cores: 128,
        };
        assert_eq!(
            MigrationConfig::default().with_auto_tuning(&large).workers,
            Some(16)
        );
    }

    #[test]
    fn test_defaults() {
        let config = MigrationConfig::default();
        assert_eq!(config.batch_size, 10_000);
        assert_eq!(config.bulk_load_timeout(), Duration::from_secs(60));
        assert_eq!(config.statement_timeout(), Duration::from_secs(30));
        assert_eq!(config.get_workers(), 4);
        assert_eq!(config.get_max_connections(), 8);
    }
}
