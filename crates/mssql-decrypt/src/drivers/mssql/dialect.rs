//! SQL text for every statement the SQL Server driver issues.
//!
//! Identifiers go through bracket quoting; values are always bound as
//! `@Pn` parameters. Nothing here touches a connection.

use crate::core::identifier::{qualify, quote, STATUS_COLUMN};
use crate::core::schema::{Column, Table};
use crate::core::traits::Page;
use crate::error::{DecryptError, Result};
use crate::transfer::TransferPlan;
use crate::typemap;

/// Rename a column; bound with the quoted object name and the new name.
pub const RENAME_COLUMN_SQL: &str =
    "EXEC sp_rename @objname = @P1, @newname = @P2, @objtype = 'COLUMN'";

/// Encrypted columns across the database, with their encryption key.
const ENCRYPTED_COLUMNS_SQL: &str = r#"
    SELECT
        SCHEMA_NAME(t.schema_id),
        t.name,
        c.name,
        TYPE_NAME(c.user_type_id),
        CAST(c.max_length AS INT),
        CAST(c.precision AS INT),
        CAST(c.scale AS INT),
        c.is_nullable,
        c.collation_name,
        k.name,
        c.encryption_type_desc,
        c.encryption_algorithm_name
    FROM sys.columns c
    JOIN sys.tables t ON c.object_id = t.object_id
    JOIN sys.column_encryption_keys k
        ON c.column_encryption_key_id = k.column_encryption_key_id
    WHERE c.encryption_type IS NOT NULL"#;

/// Primary key columns of one table in key order; bound with the quoted table.
pub const PRIMARY_KEY_SQL: &str = r#"
    SELECT
        c.name,
        TYPE_NAME(c.user_type_id),
        CAST(c.max_length AS INT),
        CAST(c.precision AS INT),
        CAST(c.scale AS INT),
        c.is_nullable,
        c.collation_name,
        CAST(ic.key_ordinal AS INT)
    FROM sys.indexes i
    JOIN sys.index_columns ic
        ON i.object_id = ic.object_id AND i.index_id = ic.index_id
    JOIN sys.columns c
        ON ic.object_id = c.object_id AND ic.column_id = c.column_id
    WHERE i.is_primary_key = 1
      AND i.object_id = OBJECT_ID(@P1)
    ORDER BY ic.key_ordinal"#;

/// Current column names of one table; bound with the quoted table.
pub const COLUMN_NAMES_SQL: &str = r#"
    SELECT c.name
    FROM sys.columns c
    WHERE c.object_id = OBJECT_ID(@P1)
    ORDER BY c.column_id"#;

/// SQL Server dialect.
#[derive(Debug, Clone, Copy, Default)]
pub struct MssqlDialect;

impl MssqlDialect {
    /// Create a new MSSQL dialect instance.
    pub fn new() -> Self {
        Self
    }

    /// Encrypted column query, restricted to `table_count` bound
    /// `(schema, name)` pairs when non-zero.
    pub fn encrypted_columns_query(&self, table_count: usize) -> String {
        let mut sql = ENCRYPTED_COLUMNS_SQL.to_string();
        if table_count > 0 {
            let pairs = (0..table_count)
                .map(|i| {
                    format!(
                        "(SCHEMA_NAME(t.schema_id) = @P{} AND t.name = @P{})",
                        i * 2 + 1,
                        i * 2 + 2
                    )
                })
                .collect::<Vec<_>>()
                .join(" OR ");
            sql.push_str(&format!("\n      AND ({})", pairs));
        }
        sql.push_str("\n    ORDER BY SCHEMA_NAME(t.schema_id), t.name, c.column_id");
        sql
    }

    /// `[schema].[table].[column]`, the object name `sp_rename` expects.
    pub fn column_object_name(&self, table: &Table, column: &str) -> Result<String> {
        Ok(format!("{}.{}", qualify(table)?, quote(column)?))
    }

    pub fn add_column(&self, table: &Table, name: &str, declaration: &str) -> Result<String> {
        Ok(format!(
            "ALTER TABLE {} ADD {} {}",
            qualify(table)?,
            quote(name)?,
            declaration
        ))
    }

    pub fn drop_columns(&self, table: &Table, columns: &[String]) -> Result<String> {
        if columns.is_empty() {
            return Err(DecryptError::schema_mutation(
                table.full_name(),
                "no columns to drop",
            ));
        }
        let names = columns
            .iter()
            .map(|c| quote(c))
            .collect::<Result<Vec<_>>>()?;
        Ok(format!(
            "ALTER TABLE {} DROP COLUMN {}",
            qualify(table)?,
            names.join(", ")
        ))
    }

    /// Staging column type for a column.
    ///
    /// Bulk insert sends a fixed wire type per value, so a few types are
    /// widened to the type their values travel as. Character columns keep
    /// their collation so key joins compare the same way the table does.
    pub fn staging_type(&self, column: &Column) -> Result<String> {
        let base = match column.data_type.as_str() {
            "tinyint" => "smallint".to_string(),
            "datetime" | "smalldatetime" => "datetime2(7)".to_string(),
            "money" => "decimal(19, 4)".to_string(),
            "smallmoney" => "decimal(10, 4)".to_string(),
            _ => typemap::declare_base_type(column)?,
        };

        match &column.collation {
            Some(collation) => {
                validate_collation(collation)?;
                Ok(format!("{} COLLATE {}", base, collation))
            }
            None => Ok(base),
        }
    }

    pub fn create_staging(&self, plan: &TransferPlan) -> Result<String> {
        let defs = plan
            .layout()
            .into_iter()
            .zip(plan.staging_columns())
            .map(|(column, name)| {
                Ok(format!(
                    "{} {} NULL",
                    quote(name)?,
                    self.staging_type(column)?
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(format!(
            "CREATE TABLE {} ({})",
            quote(&plan.staging_table)?,
            defs.join(", ")
        ))
    }

    pub fn truncate_staging(&self, plan: &TransferPlan) -> Result<String> {
        Ok(format!("TRUNCATE TABLE {}", quote(&plan.staging_table)?))
    }

    pub fn drop_staging(&self, plan: &TransferPlan) -> Result<String> {
        Ok(format!("DROP TABLE IF EXISTS {}", quote(&plan.staging_table)?))
    }

    /// One page in key order; bound with the row offset and the page size.
    ///
    /// Money travels as a float over TDS, so it is read back as an exact
    /// decimal of the same scale.
    pub fn select_page(&self, plan: &TransferPlan) -> Result<String> {
        Ok(format!(
            "{} OFFSET @P1 ROWS FETCH NEXT @P2 ROWS ONLY",
            self.ordered_select(plan, true)?
        ))
    }

    /// One page in key order with the offset written into the text.
    ///
    /// Column-encrypted values can only be converted after the driver has
    /// decrypted them, so nothing is cast server-side.
    pub fn select_page_literal(&self, plan: &TransferPlan, page: Page) -> Result<String> {
        Ok(format!(
            "{} OFFSET {} ROWS FETCH NEXT {} ROWS ONLY",
            self.ordered_select(plan, false)?,
            page.offset(),
            page.batch_size
        ))
    }

    fn ordered_select(&self, plan: &TransferPlan, cast_money: bool) -> Result<String> {
        let columns = plan
            .layout()
            .into_iter()
            .zip(plan.source_columns())
            .map(|(column, name)| {
                let name = quote(name)?;
                Ok(match column.data_type.as_str() {
                    "money" if cast_money => {
                        format!("CAST({} AS decimal(19, 4)) AS {}", name, name)
                    }
                    "smallmoney" if cast_money => {
                        format!("CAST({} AS decimal(10, 4)) AS {}", name, name)
                    }
                    _ => name,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let order = plan
            .key_names()
            .into_iter()
            .map(quote)
            .collect::<Result<Vec<_>>>()?;
        Ok(format!(
            "SELECT {} FROM {} ORDER BY {}",
            columns.join(", "),
            qualify(&plan.table)?,
            order.join(", ")
        ))
    }

    /// `INSERT INTO` prefix for staging rows as literal `VALUES` groups.
    pub fn insert_staging(&self, plan: &TransferPlan) -> Result<String> {
        let columns = plan
            .staging_columns()
            .into_iter()
            .map(quote)
            .collect::<Result<Vec<_>>>()?;
        Ok(format!(
            "INSERT INTO {} ({}) VALUES ",
            quote(&plan.staging_table)?,
            columns.join(", ")
        ))
    }

    /// Copy staged values into the plain columns and mark the rows migrated.
    pub fn merge(&self, plan: &TransferPlan) -> Result<String> {
        let mut assignments = plan
            .columns
            .iter()
            .map(|c| {
                let name = quote(c.name())?;
                Ok(format!("o.{} = s.{}", name, name))
            })
            .collect::<Result<Vec<_>>>()?;
        assignments.push(format!("o.{} = 1", quote(STATUS_COLUMN)?));

        let join = plan
            .key_names()
            .into_iter()
            .map(|k| {
                let name = quote(k)?;
                Ok(format!("o.{} = s.{}", name, name))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(format!(
            "UPDATE o SET {} FROM {} o INNER JOIN {} s ON {}",
            assignments.join(", "),
            qualify(&plan.table)?,
            quote(&plan.staging_table)?,
            join.join(" AND ")
        ))
    }
}

/// Collation names are emitted unquoted, so only accept their character set.
fn validate_collation(collation: &str) -> Result<()> {
    if !collation.is_empty()
        && collation
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        Ok(())
    } else {
        Err(DecryptError::Config(format!(
            "unexpected collation name: {:?}",
            collation
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::{EncryptedColumn, PrimaryKeyColumn};

    fn customer_plan() -> TransferPlan {
        let table = Table::new("dbo", "Customer");
        let ssn = EncryptedColumn {
            column: Column::new(&table, "Ssn", "char")
                .with_length(11)
                .with_nullable(false),
            column_key_name: "CEK_Auto1".into(),
            encryption_type: "DETERMINISTIC".into(),
            encryption_algorithm: "AEAD_AES_256_CBC_HMAC_SHA_256".into(),
        };
        let key = PrimaryKeyColumn {
            column: Column::new(&table, "CustomerId", "int").with_nullable(false),
            key_ordinal: 1,
        };
        TransferPlan::build(&table, &[ssn], &[key]).unwrap()
    }

    #[test]
    fn test_select_page() {
        let sql = MssqlDialect::new().select_page(&customer_plan()).unwrap();
        assert_eq!(
            sql,
            "SELECT [Ssn_Encrypted], [CustomerId] FROM [dbo].[Customer] \
             ORDER BY [CustomerId] OFFSET @P1 ROWS FETCH NEXT @P2 ROWS ONLY"
        );
    }

    #[test]
    fn test_select_page_reads_money_as_decimal() {
        let table = Table::new("dbo", "Invoice");
        let amount = EncryptedColumn {
            column: Column::new(&table, "Amount", "money"),
            column_key_name: "CEK_Auto1".into(),
            encryption_type: "DETERMINISTIC".into(),
            encryption_algorithm: "AEAD_AES_256_CBC_HMAC_SHA_256".into(),
        };
        let key = PrimaryKeyColumn {
            column: Column::new(&table, "Fee", "smallmoney").with_nullable(false),
            key_ordinal: 1,
        };
        let plan = TransferPlan::build(&table, &[amount], &[key]).unwrap();
        let sql = MssqlDialect::new().select_page(&plan).unwrap();
        assert_eq!(
            sql,
            "SELECT CAST([Amount_Encrypted] AS decimal(19, 4)) AS [Amount_Encrypted], \
             CAST([Fee] AS decimal(10, 4)) AS [Fee] FROM [dbo].[Invoice] \
             ORDER BY [Fee] OFFSET @P1 ROWS FETCH NEXT @P2 ROWS ONLY"
        );
    }

    #[test]
    fn test_catalog_queries_keep_alias_type_names() {
        // Alias types must surface under their own name so the type
        // allow-list rejects them.
        let encrypted = MssqlDialect::new().encrypted_columns_query(0);
        assert!(encrypted.contains("TYPE_NAME(c.user_type_id)"));
        assert!(!encrypted.contains("system_type_id"));
        assert!(PRIMARY_KEY_SQL.contains("TYPE_NAME(c.user_type_id)"));
        assert!(!PRIMARY_KEY_SQL.contains("system_type_id"));
    }

    #[test]
    fn test_select_page_literal() {
        let dialect = MssqlDialect::new();
        let plan = customer_plan();
        assert_eq!(
            dialect.select_page_literal(&plan, Page::new(3, 500)).unwrap(),
            "SELECT [Ssn_Encrypted], [CustomerId] FROM [dbo].[Customer] \
             ORDER BY [CustomerId] OFFSET 1000 ROWS FETCH NEXT 500 ROWS ONLY"
        );
        assert_eq!(
            dialect.insert_staging(&plan).unwrap(),
            "INSERT INTO [#Stage_dbo_Customer] ([Ssn], [CustomerId]) VALUES "
        );
    }

    #[test]
    fn test_merge() {
        let sql = MssqlDialect::new().merge(&customer_plan()).unwrap();
        assert_eq!(
            sql,
            "UPDATE o SET o.[Ssn] = s.[Ssn], o.[IsDataDecrypted] = 1 \
             FROM [dbo].[Customer] o INNER JOIN [#Stage_dbo_Customer] s \
             ON o.[CustomerId] = s.[CustomerId]"
        );
    }

    #[test]
    fn test_staging_table() {
        let dialect = MssqlDialect::new();
        let plan = customer_plan();
        assert_eq!(
            dialect.create_staging(&plan).unwrap(),
            "CREATE TABLE [#Stage_dbo_Customer] ([Ssn] char(11) NULL, [CustomerId] int NULL)"
        );
        assert_eq!(
            dialect.truncate_staging(&plan).unwrap(),
            "TRUNCATE TABLE [#Stage_dbo_Customer]"
        );
        assert_eq!(
            dialect.drop_staging(&plan).unwrap(),
            "DROP TABLE IF EXISTS [#Stage_dbo_Customer]"
        );
    }

    #[test]
    fn test_staging_types() {
        let dialect = MssqlDialect::new();
        let table = Table::new("dbo", "T");
        assert_eq!(
            dialect.staging_type(&Column::new(&table, "a", "tinyint")).unwrap(),
            "smallint"
        );
        assert_eq!(
            dialect.staging_type(&Column::new(&table, "a", "datetime")).unwrap(),
            "datetime2(7)"
        );
        assert_eq!(
            dialect.staging_type(&Column::new(&table, "a", "money")).unwrap(),
            "decimal(19, 4)"
        );
        let mut code = Column::new(&table, "Code", "varchar").with_length(20);
        code.collation = Some("Latin1_General_BIN2".into());
        assert_eq!(
            dialect.staging_type(&code).unwrap(),
            "varchar(20) COLLATE Latin1_General_BIN2"
        );
        code.collation = Some("x; DROP TABLE y".into());
        assert!(dialect.staging_type(&code).is_err());
    }

    #[test]
    fn test_schema_statements() {
        let dialect = MssqlDialect::new();
        let table = Table::new("dbo", "Customer");
        assert_eq!(
            dialect.add_column(&table, "Ssn", "char(11) NULL").unwrap(),
            "ALTER TABLE [dbo].[Customer] ADD [Ssn] char(11) NULL"
        );
        assert_eq!(
            dialect
                .drop_columns(&table, &["IsDataDecrypted".into(), "Ssn_Encrypted".into()])
                .unwrap(),
            "ALTER TABLE [dbo].[Customer] DROP COLUMN [IsDataDecrypted], [Ssn_Encrypted]"
        );
        assert!(dialect.drop_columns(&table, &[]).is_err());
        assert_eq!(
            dialect.column_object_name(&table, "Ssn").unwrap(),
            "[dbo].[Customer].[Ssn]"
        );
    }

    #[test]
    fn test_encrypted_columns_filter() {
        let dialect = MssqlDialect::new();
        let all = dialect.encrypted_columns_query(0);
        assert!(!all.contains("@P1"));
        assert!(all.ends_with("ORDER BY SCHEMA_NAME(t.schema_id), t.name, c.column_id"));

        let two = dialect.encrypted_columns_query(2);
        assert!(two.contains(
            "AND ((SCHEMA_NAME(t.schema_id) = @P1 AND t.name = @P2) \
             OR (SCHEMA_NAME(t.schema_id) = @P3 AND t.name = @P4))"
        ));
    }
}
