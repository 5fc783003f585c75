//! Identifier quoting and the column naming protocol used during migration.
//!
//! SQL identifiers cannot be bound as parameters, so every table and column
//! name that reaches a statement goes through [`quote`] or [`qualify`].
//!
//! The naming protocol is centralized here: the encrypted column is moved
//! aside to [`encrypted_alias`], the plain column takes over the original
//! name, [`STATUS_COLUMN`] marks migrated rows, and each table stages its
//! pages in [`staging_table_name`].

use crate::error::{DecryptError, Result};

use super::schema::Table;

/// SQL Server identifier limit (sysname).
const MAX_IDENTIFIER_LENGTH: usize = 128;

/// Suffix appended to an encrypted column while its plain twin is populated.
pub const ENCRYPTED_SUFFIX: &str = "_Encrypted";

/// Per-table marker column set for every row a merge has touched.
pub const STATUS_COLUMN: &str = "IsDataDecrypted";

/// Validate an identifier before it is quoted into a statement.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(DecryptError::Config("Identifier cannot be empty".to_string()));
    }

    if name.contains('\0') {
        return Err(DecryptError::Config(format!(
            "Identifier contains null byte: {:?}",
            name
        )));
    }

    if name.chars().count() > MAX_IDENTIFIER_LENGTH {
        return Err(DecryptError::Config(format!(
            "Identifier exceeds {} characters: {:?}",
            MAX_IDENTIFIER_LENGTH, name
        )));
    }

    Ok(())
}

/// Quote a SQL Server identifier using brackets.
pub fn quote(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("[{}]", name.replace(']', "]]")))
}

/// Quote a table as `[schema].[name]`.
pub fn qualify(table: &Table) -> Result<String> {
    Ok(format!("{}.{}", quote(&table.schema)?, quote(&table.name)?))
}

/// Name an encrypted column carries while the migration runs.
pub fn encrypted_alias(column_name: &str) -> String {
    format!("{}{}", column_name, ENCRYPTED_SUFFIX)
}

/// Whether a column name already carries the alias suffix (case-insensitive,
/// matching SQL Server's default collation).
pub fn is_encrypted_alias(column_name: &str) -> bool {
    let suffix = ENCRYPTED_SUFFIX.len();
    column_name.len() > suffix
        && column_name.is_char_boundary(column_name.len() - suffix)
        && column_name[column_name.len() - suffix..].eq_ignore_ascii_case(ENCRYPTED_SUFFIX)
}

/// Session-scoped staging table for one destination table.
///
/// Derived from the destination identity so concurrent workers never share
/// a staging table.
pub fn staging_table_name(table: &Table) -> String {
    format!("#Stage_{}_{}", table.schema, table.name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote() {
        assert_eq!(quote("Customer").unwrap(), "[Customer]");
        assert_eq!(quote("odd]name").unwrap(), "[odd]]name]");
        assert!(quote("").is_err());
        assert!(quote("bad\0name").is_err());
        assert!(quote(&"x".repeat(129)).is_err());
    }

    #[test]
    fn test_qualify() {
        let table = Table::new("dbo", "Customer");
        assert_eq!(qualify(&table).unwrap(), "[dbo].[Customer]");
    }

    #[test]
    fn test_naming_protocol() {
        assert_eq!(encrypted_alias("Ssn"), "Ssn_Encrypted");
        assert_eq!(
            staging_table_name(&Table::new("sales", "Order")),
            "#Stage_sales_Order"
        );
        assert_ne!(
            staging_table_name(&Table::new("dbo", "Customer")),
            staging_table_name(&Table::new("crm", "Customer"))
        );
    }

    #[test]
    fn test_is_encrypted_alias() {
        assert!(is_encrypted_alias("Ssn_Encrypted"));
        assert!(is_encrypted_alias("ssn_encrypted"));
        assert!(!is_encrypted_alias("Ssn"));
        assert!(!is_encrypted_alias("_Encrypted"));
        assert!(!is_encrypted_alias("Encrypted"));
        assert!(!is_encrypted_alias("Données_Chiffrées"));
    }
}
