//! Configuration validation.

use super::Config;
use crate::core::schema::Table;
use crate::error::{DecryptError, Result};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    if config.source.host.is_empty() {
        return Err(DecryptError::Config("source.host is required".into()));
    }
    if config.source.database.is_empty() {
        return Err(DecryptError::Config("source.database is required".into()));
    }
    if config.source.user.is_empty() {
        return Err(DecryptError::Config("source.user is required".into()));
    }

    let migration = &config.migration;
    if migration.batch_size == 0 {
        return Err(DecryptError::Config(
            "migration.batch_size must be at least 1".into(),
        ));
    }
    if migration.bulk_load_timeout_secs == 0 {
        return Err(DecryptError::Config(
            "migration.bulk_load_timeout_secs must be at least 1".into(),
        ));
    }
    if migration.statement_timeout_secs == 0 {
        return Err(DecryptError::Config(
            "migration.statement_timeout_secs must be at least 1".into(),
        ));
    }

    // Only check tuning values if explicitly set
    if let Some(0) = migration.workers {
        return Err(DecryptError::Config(
            "migration.workers must be at least 1".into(),
        ));
    }
    if let Some(max) = migration.max_connections {
        if max < 2 {
            return Err(DecryptError::Config(
                "migration.max_connections must be at least 2".into(),
            ));
        }
    }

    // Every running table pins a connection for its whole transfer; schema
    // changes and catalog reads need one more.
    if let (Some(workers), Some(max)) = (migration.workers, migration.max_connections) {
        if max <= workers {
            return Err(DecryptError::Config(format!(
                "migration.max_connections ({}) must be greater than migration.workers ({})",
                max, workers
            )));
        }
    }

    for entry in &migration.tables {
        Table::parse(entry)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MigrationConfig, SourceConfig};

    fn valid_config() -> Config {
        Config {
            source: SourceConfig {
                host: "localhost".to_string(),
                port: 1433,
                database: "Clinic".to_string(),
                user: "sa".to_string(),
                password: "password".to_string(),
                encrypt: false,
                trust_server_cert: true,
                column_encryption: true,
            },
            migration: MigrationConfig::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        let config = valid_config();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_missing_source_host() {
        let mut config = valid_config();
        config.source.host = "".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_zero_batch_size() {
        let mut config = valid_config();
        config.migration.batch_size = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_zero_workers() {
        let mut config = valid_config();
        config.migration.workers = Some(0);
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_connections_must_exceed_workers() {
        let mut config = valid_config();
        config.migration.workers = Some(8);
        config.migration.max_connections = Some(8);
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("max_connections (8)"));

        config.migration.max_connections = Some(9);
        assert!(validate(&config).is_ok());

        config.migration.workers = None;
        config.migration.max_connections = Some(1);
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_bad_table_entry() {
        let mut config = valid_config();
        config.migration.tables = vec!["dbo.Customer".into(), "a.b.c".into()];
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("a.b.c"));
    }

    #[test]
    fn test_source_config_debug_redacts_password() {
        let mut config = valid_config();
        config.source.password = "super_secret_password_123".to_string();
        let debug_output = format!("{:?}", config.source);
        assert!(
            debug_output.contains("[REDACTED]"),
            "Debug output should contain [REDACTED]"
        );
        assert!(
            !debug_output.contains("super_secret_password_123"),
            "Debug output should not contain actual password value"
        );
    }
}
