//! Typed values and row batches moved between the read and merge steps.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use uuid::Uuid;

/// Type hint for NULL values so the bulk loader can encode them correctly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlNullType {
    Bool,
    I16,
    I32,
    I64,
    F32,
    F64,
    String,
    Bytes,
    Uuid,
    Decimal,
    DateTime,
    DateTimeOffset,
    Date,
    Time,
}

impl SqlNullType {
    /// NULL hint for a SQL Server type name.
    pub fn for_data_type(data_type: &str) -> Self {
        match data_type {
            "bit" => SqlNullType::Bool,
            "tinyint" | "smallint" => SqlNullType::I16,
            "int" => SqlNullType::I32,
            "bigint" => SqlNullType::I64,
            "real" => SqlNullType::F32,
            "float" => SqlNullType::F64,
            "decimal" | "numeric" | "money" | "smallmoney" => SqlNullType::Decimal,
            "binary" | "varbinary" => SqlNullType::Bytes,
            "uniqueidentifier" => SqlNullType::Uuid,
            "datetime" | "datetime2" | "smalldatetime" => SqlNullType::DateTime,
            "datetimeoffset" => SqlNullType::DateTimeOffset,
            "date" => SqlNullType::Date,
            "time" => SqlNullType::Time,
            _ => SqlNullType::String,
        }
    }
}

/// A single column value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// NULL with type hint.
    Null(SqlNullType),

    /// bit.
    Bool(bool),

    /// tinyint and smallint.
    I16(i16),

    /// int.
    I32(i32),

    /// bigint.
    I64(i64),

    /// real.
    F32(f32),

    /// float.
    F64(f64),

    /// Character data of any width.
    Text(String),

    /// binary and varbinary.
    Bytes(Vec<u8>),

    /// uniqueidentifier.
    Uuid(Uuid),

    /// decimal, numeric and the money types.
    Decimal(Decimal),

    /// datetime, smalldatetime and datetime2.
    DateTime(NaiveDateTime),

    /// datetimeoffset.
    DateTimeOffset(DateTime<FixedOffset>),

    /// date.
    Date(NaiveDate),

    /// time.
    Time(NaiveTime),
}

impl SqlValue {
    /// Check if this value is NULL.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null(_))
    }

    /// Get the SqlNullType for this value.
    #[must_use]
    pub fn null_type(&self) -> SqlNullType {
        match self {
            SqlValue::Null(t) => *t,
            SqlValue::Bool(_) => SqlNullType::Bool,
            SqlValue::I16(_) => SqlNullType::I16,
            SqlValue::I32(_) => SqlNullType::I32,
            SqlValue::I64(_) => SqlNullType::I64,
            SqlValue::F32(_) => SqlNullType::F32,
            SqlValue::F64(_) => SqlNullType::F64,
            SqlValue::Text(_) => SqlNullType::String,
            SqlValue::Bytes(_) => SqlNullType::Bytes,
            SqlValue::Uuid(_) => SqlNullType::Uuid,
            SqlValue::Decimal(_) => SqlNullType::Decimal,
            SqlValue::DateTime(_) => SqlNullType::DateTime,
            SqlValue::DateTimeOffset(_) => SqlNullType::DateTimeOffset,
            SqlValue::Date(_) => SqlNullType::Date,
            SqlValue::Time(_) => SqlNullType::Time,
        }
    }
}

/// One page of rows read from a table.
///
/// Rows are laid out in transfer plan order: the encrypted columns first,
/// then the primary key columns.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    /// 1-based page number this batch was read as.
    pub batch_number: u64,

    /// Row values in plan order.
    pub rows: Vec<Vec<SqlValue>>,
}

impl Batch {
    /// Create a batch for a page.
    pub fn new(batch_number: u64, rows: Vec<Vec<SqlValue>>) -> Self {
        Self { batch_number, rows }
    }

    /// Get the number of rows in this batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// An empty page marks the end of the table.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
