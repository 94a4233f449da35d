//! Schema mapping from source column metadata to target column definitions.
//!
//! There is exactly one translation table, [`TYPE_MAP`]. Every table sync goes
//! through [`map_columns`], so two pipelines can never disagree on how a
//! source type lands in the warehouse.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Column metadata as introspected from the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceColumn {
    pub name: String,
    /// Declared type, possibly with a precision suffix (`NUMBER(38,2)`).
    pub data_type: String,
}

impl SourceColumn {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

/// Destination column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ColumnType {
    String,
    Numeric,
    Int64,
    Float64,
    Bool,
    Date,
    DateTime,
    Timestamp,
    Time,
    Json,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::String => "STRING",
            ColumnType::Numeric => "NUMERIC",
            ColumnType::Int64 => "INT64",
            ColumnType::Float64 => "FLOAT64",
            ColumnType::Bool => "BOOL",
            ColumnType::Date => "DATE",
            ColumnType::DateTime => "DATETIME",
            ColumnType::Timestamp => "TIMESTAMP",
            ColumnType::Time => "TIME",
            ColumnType::Json => "JSON",
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source base type to destination type. Lookups are on the upper-cased base type.
pub const TYPE_MAP: &[(&str, ColumnType)] = &[
    ("VARCHAR", ColumnType::String),
    ("CHAR", ColumnType::String),
    ("CHARACTER", ColumnType::String),
    ("TEXT", ColumnType::String),
    ("STRING", ColumnType::String),
    ("NUMBER", ColumnType::Numeric),
    ("DECIMAL", ColumnType::Numeric),
    ("NUMERIC", ColumnType::Numeric),
    ("INT", ColumnType::Int64),
    ("INTEGER", ColumnType::Int64),
    ("BIGINT", ColumnType::Int64),
    ("SMALLINT", ColumnType::Int64),
    ("TINYINT", ColumnType::Int64),
    ("FLOAT", ColumnType::Float64),
    ("DOUBLE", ColumnType::Float64),
    ("REAL", ColumnType::Float64),
    ("BOOLEAN", ColumnType::Bool),
    ("DATE", ColumnType::Date),
    ("DATETIME", ColumnType::DateTime),
    ("TIMESTAMP_NTZ", ColumnType::Timestamp),
    ("TIMESTAMP_LTZ", ColumnType::Timestamp),
    ("TIMESTAMP_TZ", ColumnType::Timestamp),
    ("TIMESTAMP", ColumnType::Timestamp),
    ("TIME", ColumnType::Time),
    ("VARIANT", ColumnType::Json),
    ("OBJECT", ColumnType::Json),
    ("ARRAY", ColumnType::Json),
];

/// Strip any `(precision, scale)` suffix and normalize case.
///
/// ```
/// use ferry::schema::base_type;
///
/// assert_eq!(base_type("number(38, 2)"), "NUMBER");
/// assert_eq!(base_type(" VARCHAR(16777216) "), "VARCHAR");
/// ```
pub fn base_type(declared: &str) -> String {
    declared
        .split('(')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_uppercase()
}

/// Map a declared source type. Unknown types map to `STRING`, never an error.
pub fn map_type(declared: &str) -> ColumnType {
    let base = base_type(declared);
    TYPE_MAP
        .iter()
        .find(|(name, _)| *name == base)
        .map_or(ColumnType::String, |(_, column_type)| *column_type)
}

/// A destination column definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
}

/// Ordered destination schema.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<ColumnDef>,
}

impl TableSchema {
    pub fn new(columns: Vec<ColumnDef>) -> Self {
        Self { columns }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Same columns with every column nullable, for staging tables.
    pub fn nullable_copy(&self) -> Self {
        Self {
            columns: self
                .columns
                .iter()
                .map(|c| ColumnDef {
                    nullable: true,
                    ..c.clone()
                })
                .collect(),
        }
    }
}

/// Produce the destination schema for a source table, preserving column order.
pub fn map_columns(columns: &[SourceColumn]) -> TableSchema {
    TableSchema::new(
        columns
            .iter()
            .map(|c| ColumnDef {
                name: c.name.clone(),
                column_type: map_type(&c.data_type),
                nullable: true,
            })
            .collect(),
    )
}
