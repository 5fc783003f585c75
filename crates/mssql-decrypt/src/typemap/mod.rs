//! Type declarations for re-creating encrypted columns as plain columns.
//!
//! The facet table is an allow-list. Types that cannot be re-declared with a
//! plain `ALTER TABLE ... ADD` (large objects, rowversion, spatial and CLR
//! types) are absent and rejected with [`DecryptError::UnsupportedType`].

use crate::core::schema::Column;
use crate::error::{DecryptError, Result};

/// Declaration of the status column while a table is being migrated.
pub const STATUS_COLUMN_DECLARATION: &str = "bit NULL";

/// Token used for unbounded variable-length declarations.
const MAX_TOKEN: &str = "MAX";

/// Which parts a type takes in its declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataTypeFacet {
    pub uses_length: bool,
    pub uses_precision: bool,
    pub uses_scale: bool,
    /// A length of -1 is declared as `MAX`.
    pub allows_max: bool,
}

impl DataTypeFacet {
    const fn bare() -> Self {
        Self {
            uses_length: false,
            uses_precision: false,
            uses_scale: false,
            allows_max: false,
        }
    }

    const fn length(allows_max: bool) -> Self {
        Self {
            uses_length: true,
            uses_precision: false,
            uses_scale: false,
            allows_max,
        }
    }

    const fn scale() -> Self {
        Self {
            uses_length: false,
            uses_precision: false,
            uses_scale: true,
            allows_max: false,
        }
    }

    const fn precision_scale() -> Self {
        Self {
            uses_length: false,
            uses_precision: true,
            uses_scale: true,
            allows_max: false,
        }
    }

    /// Whether the declaration carries a parenthesized part.
    pub fn is_parameterized(&self) -> bool {
        self.uses_length || self.uses_precision || self.uses_scale
    }
}

const FACETS: &[(&str, DataTypeFacet)] = &[
    ("numeric", DataTypeFacet::precision_scale()),
    ("decimal", DataTypeFacet::precision_scale()),
    ("datetimeoffset", DataTypeFacet::scale()),
    ("datetime2", DataTypeFacet::scale()),
    ("time", DataTypeFacet::scale()),
    ("char", DataTypeFacet::length(false)),
    ("varchar", DataTypeFacet::length(true)),
    ("nchar", DataTypeFacet::length(false)),
    ("nvarchar", DataTypeFacet::length(true)),
    ("binary", DataTypeFacet::length(false)),
    ("varbinary", DataTypeFacet::length(true)),
    ("bigint", DataTypeFacet::bare()),
    ("bit", DataTypeFacet::bare()),
    ("smallint", DataTypeFacet::bare()),
    ("smallmoney", DataTypeFacet::bare()),
    ("int", DataTypeFacet::bare()),
    ("tinyint", DataTypeFacet::bare()),
    ("money", DataTypeFacet::bare()),
    // float/real precision is implied by the type name (24 or 53)
    ("float", DataTypeFacet::bare()),
    ("real", DataTypeFacet::bare()),
    ("date", DataTypeFacet::bare()),
    ("smalldatetime", DataTypeFacet::bare()),
    ("datetime", DataTypeFacet::bare()),
    ("uniqueidentifier", DataTypeFacet::bare()),
];

/// Unicode character types store two bytes per character.
const UNICODE_TYPES: &[&str] = &["nchar", "nvarchar"];

/// Look up the facets of a type name (exact, case-sensitive match).
pub fn facet(type_name: &str) -> Option<DataTypeFacet> {
    FACETS
        .iter()
        .find(|(name, _)| *name == type_name)
        .map(|(_, facet)| *facet)
}

/// Build the declaration for a column, e.g. `nvarchar(50) NOT NULL`.
///
/// Types without length, precision or scale are declared by their bare name
/// with no nullability clause; everything else is followed by `NULL` or
/// `NOT NULL` according to the column.
pub fn declare_type(column: &Column) -> Result<String> {
    let facet = lookup(column)?;
    let base = base_declaration(column, &facet);
    if !facet.is_parameterized() {
        return Ok(base);
    }
    let null_clause = if column.is_nullable { "NULL" } else { "NOT NULL" };
    Ok(format!("{} {}", base, null_clause))
}

/// Declaration without a nullability clause, e.g. `nvarchar(50)`.
pub fn declare_base_type(column: &Column) -> Result<String> {
    let facet = lookup(column)?;
    Ok(base_declaration(column, &facet))
}

/// Declaration for a column that must accept NULL, whatever the source allows.
///
/// Used for the plain column while it is being filled.
pub fn declare_nullable(column: &Column) -> Result<String> {
    Ok(format!("{} NULL", declare_base_type(column)?))
}

fn lookup(column: &Column) -> Result<DataTypeFacet> {
    facet(&column.data_type).ok_or_else(|| DecryptError::UnsupportedType {
        column: column.full_column_name(),
        type_name: column.data_type.clone(),
    })
}

fn base_declaration(column: &Column, facet: &DataTypeFacet) -> String {
    if !facet.is_parameterized() {
        return column.data_type.clone();
    }

    let mut parts = Vec::with_capacity(2);
    if facet.uses_length {
        parts.push(length_part(column, facet));
    }
    if facet.uses_precision {
        parts.push(column.precision.to_string());
    }
    if facet.uses_scale {
        parts.push(column.scale.to_string());
    }

    format!("{}({})", column.data_type, parts.join(", "))
}

fn length_part(column: &Column, facet: &DataTypeFacet) -> String {
    if column.max_length < 0 && facet.allows_max {
        return MAX_TOKEN.to_string();
    }
    if UNICODE_TYPES.contains(&column.data_type.as_str()) {
        (column.max_length / 2).to_string()
    } else {
        column.max_length.to_string()
    }
}
