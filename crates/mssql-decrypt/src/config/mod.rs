//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use std::collections::BTreeSet;
use std::path::Path;

use crate::core::schema::Table;
use crate::error::Result;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }
}

impl MigrationConfig {
    /// Parsed table allow-list; `None` means every encrypted table.
    pub fn table_filter(&self) -> Result<Option<BTreeSet<Table>>> {
        if self.tables.is_empty() {
            return Ok(None);
        }
        let tables = self
            .tables
            .iter()
            .map(|t| Table::parse(t))
            .collect::<Result<BTreeSet<_>>>()?;
        Ok(Some(tables))
    }
}
