//! Conversion between tiberius rows and [`SqlValue`].

use std::borrow::Cow;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use rust_decimal::Decimal;
use tiberius::numeric::Numeric;
use tiberius::time::{Date, DateTime2, DateTimeOffset, Time};
use tiberius::{ColumnData, Row, TokenRow};
use uuid::Uuid;

use crate::core::schema::Column;
use crate::core::value::{SqlNullType, SqlValue};
use crate::error::{DecryptError, Result};

/// Scale of the money types.
const MONEY_SCALE: u32 = 4;

/// Fractional-second scale used for widened datetime staging columns.
const DATETIME2_MAX_SCALE: u8 = 7;

/// Decode one row in plan layout.
pub fn decode_row(row: &Row, layout: &[&Column]) -> Result<Vec<SqlValue>> {
    layout
        .iter()
        .enumerate()
        .map(|(idx, column)| decode_value(row, idx, column))
        .collect()
}

/// Decode a value by the column's declared type.
pub fn decode_value(row: &Row, idx: usize, column: &Column) -> Result<SqlValue> {
    let value = match column.data_type.as_str() {
        "bit" => row.try_get::<bool, _>(idx)?.map(SqlValue::Bool),
        "tinyint" => row
            .try_get::<u8, _>(idx)?
            .map(|v| SqlValue::I16(v as i16)),
        "smallint" => row.try_get::<i16, _>(idx)?.map(SqlValue::I16),
        "int" => row.try_get::<i32, _>(idx)?.map(SqlValue::I32),
        "bigint" => row.try_get::<i64, _>(idx)?.map(SqlValue::I64),
        "real" => row.try_get::<f32, _>(idx)?.map(SqlValue::F32),
        "float" => row.try_get::<f64, _>(idx)?.map(SqlValue::F64),
        // Money is cast to decimal by the page query.
        "decimal" | "numeric" | "money" | "smallmoney" => {
            row.try_get::<Decimal, _>(idx)?.map(SqlValue::Decimal)
        }
        "uniqueidentifier" => row.try_get::<Uuid, _>(idx)?.map(SqlValue::Uuid),
        "datetime" | "datetime2" | "smalldatetime" => row
            .try_get::<NaiveDateTime, _>(idx)?
            .map(SqlValue::DateTime),
        "datetimeoffset" => row
            .try_get::<DateTime<FixedOffset>, _>(idx)?
            .map(SqlValue::DateTimeOffset),
        "date" => row.try_get::<NaiveDate, _>(idx)?.map(SqlValue::Date),
        "time" => row.try_get::<NaiveTime, _>(idx)?.map(SqlValue::Time),
        "binary" | "varbinary" => row
            .try_get::<&[u8], _>(idx)?
            .map(|v| SqlValue::Bytes(v.to_vec())),
        _ => row
            .try_get::<&str, _>(idx)?
            .map(|s| SqlValue::Text(s.to_string())),
    };

    Ok(value.unwrap_or_else(|| SqlValue::Null(SqlNullType::for_data_type(&column.data_type))))
}

/// Encode one row in plan layout for the staging bulk load.
pub fn encode_row(values: &[SqlValue], layout: &[&Column]) -> Result<TokenRow<'static>> {
    let mut row = TokenRow::new();
    for (value, column) in values.iter().zip(layout) {
        row.push(encode_value(value, column)?);
    }
    Ok(row)
}

/// Encode a value for the staging column of `column`.
pub fn encode_value(value: &SqlValue, column: &Column) -> Result<ColumnData<'static>> {
    let data = match value {
        SqlValue::Null(_) => null_for(column),
        SqlValue::Bool(b) => ColumnData::Bit(Some(*b)),
        SqlValue::I16(i) => ColumnData::I16(Some(*i)),
        SqlValue::I32(i) => ColumnData::I32(Some(*i)),
        SqlValue::I64(i) => ColumnData::I64(Some(*i)),
        SqlValue::F32(f) => {
            if f.is_nan() || f.is_infinite() {
                ColumnData::F32(None)
            } else {
                ColumnData::F32(Some(*f))
            }
        }
        SqlValue::F64(f) => {
            if f.is_nan() || f.is_infinite() {
                ColumnData::F64(None)
            } else {
                ColumnData::F64(Some(*f))
            }
        }
        SqlValue::Text(s) => ColumnData::String(Some(Cow::Owned(s.clone()))),
        SqlValue::Bytes(b) => ColumnData::Binary(Some(Cow::Owned(b.clone()))),
        SqlValue::Uuid(u) => ColumnData::Guid(Some(*u)),
        SqlValue::Decimal(d) => {
            let scale = decimal_scale(column);
            let mut d = *d;
            d.rescale(scale);
            ColumnData::Numeric(Some(Numeric::new_with_scale(d.mantissa(), scale as u8)))
        }
        SqlValue::DateTime(dt) => {
            ColumnData::DateTime2(Some(datetime2(dt, time_scale(column))?))
        }
        SqlValue::DateTimeOffset(dto) => {
            let utc = datetime2(&dto.naive_utc(), time_scale(column))?;
            let offset_minutes = (dto.offset().local_minus_utc() / 60) as i16;
            ColumnData::DateTimeOffset(Some(DateTimeOffset::new(utc, offset_minutes)))
        }
        SqlValue::Date(d) => ColumnData::Date(Some(date(d)?)),
        SqlValue::Time(t) => {
            let scale = time_scale(column);
            ColumnData::Time(Some(Time::new(time_increments(t, scale), scale)))
        }
    };
    Ok(data)
}

fn null_for(column: &Column) -> ColumnData<'static> {
    match SqlNullType::for_data_type(&column.data_type) {
        SqlNullType::Bool => ColumnData::Bit(None),
        SqlNullType::I16 => ColumnData::I16(None),
        SqlNullType::I32 => ColumnData::I32(None),
        SqlNullType::I64 => ColumnData::I64(None),
        SqlNullType::F32 => ColumnData::F32(None),
        SqlNullType::F64 => ColumnData::F64(None),
        SqlNullType::String => ColumnData::String(None),
        SqlNullType::Bytes => ColumnData::Binary(None),
        SqlNullType::Uuid => ColumnData::Guid(None),
        SqlNullType::Decimal => ColumnData::Numeric(None),
        SqlNullType::DateTime => ColumnData::DateTime2(None),
        SqlNullType::DateTimeOffset => ColumnData::DateTimeOffset(None),
        SqlNullType::Date => ColumnData::Date(None),
        SqlNullType::Time => ColumnData::Time(None),
    }
}

fn decimal_scale(column: &Column) -> u32 {
    match column.data_type.as_str() {
        "money" | "smallmoney" => MONEY_SCALE,
        _ => column.scale.max(0) as u32,
    }
}

/// Fractional-second scale of the staging column.
fn time_scale(column: &Column) -> u8 {
    match column.data_type.as_str() {
        "datetime2" | "datetimeoffset" | "time" => {
            column.scale.clamp(0, DATETIME2_MAX_SCALE as i32) as u8
        }
        _ => DATETIME2_MAX_SCALE,
    }
}

/// Time of day in units of 10^-scale seconds.
fn time_increments(t: &NaiveTime, scale: u8) -> u64 {
    let nanos = t.num_seconds_from_midnight() as u64 * 1_000_000_000 + t.nanosecond() as u64;
    nanos / 10u64.pow(9 - scale as u32)
}

fn date(d: &NaiveDate) -> Result<Date> {
    let epoch = NaiveDate::from_ymd_opt(1, 1, 1)
        .ok_or_else(|| conversion("date epoch out of range"))?;
    let days = (*d - epoch).num_days();
    u32::try_from(days)
        .map(Date::new)
        .map_err(|_| conversion(format!("date {} out of range", d)))
}

fn datetime2(dt: &NaiveDateTime, scale: u8) -> Result<DateTime2> {
    let date = date(&dt.date())?;
    let time = Time::new(time_increments(&dt.time(), scale), scale);
    Ok(DateTime2::new(date, time))
}

fn conversion(message: impl Into<String>) -> DecryptError {
    DecryptError::Database(tiberius::error::Error::Conversion(message.into().into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::Table;

    fn col(data_type: &str) -> Column {
        Column::new(&Table::new("dbo", "T"), "C", data_type)
    }

    #[test]
    fn test_time_increments() {
        let t = NaiveTime::from_hms_nano_opt(1, 0, 0, 123_456_700).unwrap();
        assert_eq!(time_increments(&t, 7), 36_001_234_567);
        assert_eq!(time_increments(&t, 3), 3_600_123);
        assert_eq!(time_increments(&t, 0), 3_600);
    }

    #[test]
    fn test_date_days() {
        let d = NaiveDate::from_ymd_opt(1, 1, 2).unwrap();
        assert_eq!(date(&d).unwrap().days(), 1);
    }

    #[test]
    fn test_time_scale() {
        assert_eq!(time_scale(&col("datetime2").with_precision(25, 3)), 3);
        assert_eq!(time_scale(&col("datetime")), 7);
        assert_eq!(time_scale(&col("time").with_precision(16, 7)), 7);
    }

    #[test]
    fn test_nulls_follow_column_type() {
        let value = SqlValue::Null(SqlNullType::String);
        assert!(matches!(
            encode_value(&value, &col("int")).unwrap(),
            ColumnData::I32(None)
        ));
        assert!(matches!(
            encode_value(&value, &col("date")).unwrap(),
            ColumnData::Date(None)
        ));
        assert!(matches!(
            encode_value(&value, &col("nvarchar")).unwrap(),
            ColumnData::String(None)
        ));
    }

    #[test]
    fn test_decimal_rescaled_to_column() {
        let amount = col("decimal").with_precision(18, 2);
        let value = SqlValue::Decimal(Decimal::new(125, 1)); // 12.5
        match encode_value(&value, &amount).unwrap() {
            ColumnData::Numeric(Some(n)) => {
                assert_eq!(n.scale(), 2);
                assert_eq!(n.value(), 1250);
            }
            other => panic!("unexpected encoding: {other:?}"),
        }

        let price = col("money");
        match encode_value(&SqlValue::Decimal(Decimal::new(3, 0)), &price).unwrap() {
            ColumnData::Numeric(Some(n)) => assert_eq!(n.scale(), 4),
            other => panic!("unexpected encoding: {other:?}"),
        }
    }

    #[test]
    fn test_encode_row_layout() {
        let table = Table::new("dbo", "Customer");
        let ssn = Column::new(&table, "Ssn", "char").with_length(11);
        let id = Column::new(&table, "CustomerId", "int");
        let row = encode_row(
            &[SqlValue::Text("123-45-6789".into()), SqlValue::I32(7)],
            &[&ssn, &id],
        )
        .unwrap();
        assert_eq!(row.len(), 2);
    }
}
