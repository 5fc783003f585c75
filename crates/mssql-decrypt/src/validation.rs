//! Primary key gate run before any table is touched.

use crate::core::schema::{Column, Table};
use crate::error::{DecryptError, Result};

/// Require a non-empty primary key for a table.
///
/// Rows are addressed by their key during paging and merging, so a table
/// without one cannot be migrated. Must run before the first schema change.
pub fn validate<C: AsRef<Column>>(table: &Table, primary_key: &[C]) -> Result<()> {
    if primary_key.is_empty() {
        return Err(DecryptError::MissingPrimaryKey {
            table: table.full_name(),
        });
    }
    Ok(())
}
