//! Value and schema types for rowdock
//!
//! - [`Value`]: a single typed cell bound as a statement parameter
//! - [`Row`]: a result row from a catalog query
//! - [`LogicalType`], [`SourceSchema`]: the portable schema of incoming records
//! - [`ColumnDescriptor`], [`TableSchema`]: the schema of a live table
//! - [`TableId`]: a (catalog, schema, table) identifier
//! - [`RecordBatch`]: an ordered chunk of incoming rows

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// SQL value type that can hold any loadable database value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// SQL NULL
    Null,
    /// Boolean value
    Bool(bool),
    /// 8-bit signed integer (TINYINT)
    Int8(i8),
    /// 16-bit signed integer (SMALLINT)
    Int16(i16),
    /// 32-bit signed integer (INTEGER)
    Int32(i32),
    /// 64-bit signed integer (BIGINT)
    Int64(i64),
    /// 32-bit floating point (REAL)
    Float32(f32),
    /// 64-bit floating point (DOUBLE PRECISION)
    Float64(f64),
    /// Arbitrary precision decimal (NUMERIC, DECIMAL)
    Decimal(Decimal),
    /// Text string (VARCHAR, TEXT, CHAR)
    String(String),
    /// Binary data (BLOB, VARBINARY)
    Bytes(Vec<u8>),
    /// Date without time (DATE)
    Date(NaiveDate),
    /// Time without date (TIME)
    Time(NaiveTime),
    /// Timestamp without timezone (TIMESTAMP)
    DateTime(NaiveDateTime),
    /// Timestamp with timezone
    DateTimeTz(DateTime<Utc>),
    /// UUID
    Uuid(Uuid),
    /// JSON value
    Json(serde_json::Value),
}

impl Value {
    /// Check if value is NULL
    #[inline]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Try to convert to bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Int8(n) => Some(*n != 0),
            Self::Int16(n) => Some(*n != 0),
            Self::Int32(n) => Some(*n != 0),
            Self::Int64(n) => Some(*n != 0),
            Self::Decimal(d) => Some(!d.is_zero()),
            Self::String(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "yes" | "y" | "1" => Some(true),
                "false" | "f" | "no" | "n" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Try to convert to i64
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int8(n) => Some(i64::from(*n)),
            Self::Int16(n) => Some(i64::from(*n)),
            Self::Int32(n) => Some(i64::from(*n)),
            Self::Int64(n) => Some(*n),
            Self::Float64(n) if n.is_finite() => Some(*n as i64),
            Self::Decimal(d) => d.to_string().parse().ok(),
            Self::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Try to convert to f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int8(n) => Some(f64::from(*n)),
            Self::Int16(n) => Some(f64::from(*n)),
            Self::Int32(n) => Some(f64::from(*n)),
            Self::Int64(n) => Some(*n as f64),
            Self::Float32(n) => Some(f64::from(*n)),
            Self::Float64(n) => Some(*n),
            Self::Decimal(d) => d.to_string().parse().ok(),
            Self::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Try to borrow as string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Convert to owned string representation
    pub fn as_string(&self) -> Option<String> {
        match self {
            Self::String(s) => Some(s.clone()),
            Self::Int8(n) => Some(n.to_string()),
            Self::Int16(n) => Some(n.to_string()),
            Self::Int32(n) => Some(n.to_string()),
            Self::Int64(n) => Some(n.to_string()),
            Self::Float32(n) => Some(n.to_string()),
            Self::Float64(n) => Some(n.to_string()),
            Self::Decimal(d) => Some(d.to_string()),
            Self::Bool(b) => Some(b.to_string()),
            Self::Uuid(u) => Some(u.to_string()),
            Self::Bytes(b) => String::from_utf8(b.clone()).ok(),
            _ => None,
        }
    }

    /// Approximate number of bytes this value occupies on the wire
    /// when strings are encoded in `charset`
    pub fn estimated_size(&self, charset: Charset) -> usize {
        match self {
            Self::Null | Self::Bool(_) | Self::Int8(_) => 1,
            Self::Int16(_) => 2,
            Self::Int32(_) | Self::Float32(_) | Self::Date(_) => 4,
            Self::Int64(_) | Self::Float64(_) | Self::Time(_) => 8,
            Self::DateTime(_) | Self::DateTimeTz(_) => 8,
            Self::Decimal(_) | Self::Uuid(_) => 16,
            Self::String(s) => charset.encoded_len(s),
            Self::Bytes(b) => b.len(),
            Self::Json(j) => charset.encoded_len(&j.to_string()),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i8> for Value {
    fn from(v: i8) -> Self {
        Self::Int8(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Self::Int16(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Self::Float32(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float64(v)
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Self::Decimal(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Self::Date(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Self::DateTime(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Self::DateTimeTz(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Self::Uuid(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Self::Json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => Self::Null,
        }
    }
}

/// Database row as ordered column values
#[derive(Debug, Clone)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    /// Create a new row
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    /// Get column count
    #[inline]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Check if row is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Get column names
    #[inline]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Get all values
    #[inline]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Get value by column index
    #[inline]
    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    /// Get value by column name (case-insensitive)
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .and_then(|idx| self.values.get(idx))
    }
}

/// Server-side character set resolved for a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Charset {
    /// UTF-8 (the fallback for unmapped server encodings)
    #[default]
    Utf8,
    /// UTF-16
    Utf16,
    /// Shift_JIS
    ShiftJis,
    /// EUC-JP
    EucJp,
}

impl Charset {
    /// Standard charset name
    pub const fn name(self) -> &'static str {
        match self {
            Self::Utf8 => "UTF-8",
            Self::Utf16 => "UTF-16",
            Self::ShiftJis => "Shift_JIS",
            Self::EucJp => "EUC-JP",
        }
    }

    /// Approximate encoded length of `s` in this charset
    pub fn encoded_len(self, s: &str) -> usize {
        match self {
            Self::Utf8 => s.len(),
            Self::Utf16 => s.encode_utf16().count() * 2,
            Self::ShiftJis | Self::EucJp => s.chars().map(|c| if c.is_ascii() { 1 } else { 2 }).sum(),
        }
    }
}

impl fmt::Display for Charset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Portable column type of incoming records, translated per dialect
/// by `DialectAdapter::convert_type_name`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogicalType {
    /// Boolean
    Boolean,
    /// 8-bit integer
    TinyInt,
    /// 16-bit integer
    SmallInt,
    /// 32-bit integer
    Int,
    /// 64-bit integer
    BigInt,
    /// Single precision float
    Float,
    /// Double precision float
    Double,
    /// Exact numeric
    Decimal {
        /// Total digits
        precision: u32,
        /// Digits after the decimal point
        scale: u32,
    },
    /// Bounded or unbounded character string
    String {
        /// Maximum length in characters
        max_length: Option<u32>,
    },
    /// Large text
    Text,
    /// Binary data
    Bytes,
    /// Date
    Date,
    /// Time of day
    Time,
    /// Timestamp without timezone
    Timestamp,
    /// Timestamp with timezone
    TimestampTz,
    /// UUID
    Uuid,
    /// JSON document
    Json,
}

impl LogicalType {
    /// Whether a non-null `value` can be bound to a column of this type
    pub fn accepts(&self, value: &Value) -> bool {
        use Value as V;
        match (self, value) {
            (_, V::Null) => true,
            (Self::Boolean, V::Bool(_)) => true,
            (
                Self::TinyInt | Self::SmallInt | Self::Int | Self::BigInt,
                V::Int8(_) | V::Int16(_) | V::Int32(_) | V::Int64(_),
            ) => true,
            (
                Self::Float | Self::Double,
                V::Float32(_) | V::Float64(_) | V::Int8(_) | V::Int16(_) | V::Int32(_) | V::Int64(_),
            ) => true,
            (
                Self::Decimal { .. },
                V::Decimal(_) | V::Int8(_) | V::Int16(_) | V::Int32(_) | V::Int64(_),
            ) => true,
            (Self::String { .. } | Self::Text, V::String(_)) => true,
            (Self::Bytes, V::Bytes(_)) => true,
            (Self::Date, V::Date(_)) => true,
            (Self::Time, V::Time(_)) => true,
            (Self::Timestamp | Self::TimestampTz, V::DateTime(_) | V::DateTimeTz(_)) => true,
            (Self::Uuid, V::Uuid(_) | V::String(_)) => true,
            (Self::Json, V::Json(_) | V::String(_)) => true,
            _ => false,
        }
    }
}

/// One column of the incoming record schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceColumn {
    /// Column name
    pub name: String,
    /// Portable type
    pub logical_type: LogicalType,
    /// Whether NULL is allowed
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl SourceColumn {
    /// Nullable column
    pub fn new(name: impl Into<String>, logical_type: LogicalType) -> Self {
        Self {
            name: name.into(),
            logical_type,
            nullable: true,
        }
    }

    /// Mark as NOT NULL
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// Schema of the incoming record stream
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceSchema {
    /// Columns in record order
    pub columns: Vec<SourceColumn>,
}

impl SourceSchema {
    /// Create from columns
    pub fn new(columns: Vec<SourceColumn>) -> Self {
        Self { columns }
    }

    /// Number of columns
    #[inline]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Whether the schema has no columns
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Column names in record order
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

/// Column of a live table. Immutable once derived from the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    /// Column name
    pub name: String,
    /// Declared, dialect-specific type token
    pub type_name: String,
    /// Whether column is nullable
    pub nullable: bool,
    /// Physical declaration position (1-based)
    pub ordinal: u32,
}

impl ColumnDescriptor {
    /// Create a column descriptor
    pub fn new(
        name: impl Into<String>,
        type_name: impl Into<String>,
        nullable: bool,
        ordinal: u32,
    ) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            nullable,
            ordinal,
        }
    }
}

/// Ordered column schema of a table; order is the physical declaration order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableSchema {
    /// Columns in ordinal order
    pub columns: Vec<ColumnDescriptor>,
    /// Primary key columns declared when the table is created by rowdock
    pub primary_key: Vec<String>,
    /// Unique keys (primary key included) read from the catalog
    pub unique_keys: Vec<Vec<String>>,
}

impl TableSchema {
    /// Create a schema from columns
    pub fn new(columns: Vec<ColumnDescriptor>) -> Self {
        Self {
            columns,
            primary_key: Vec::new(),
            unique_keys: Vec::new(),
        }
    }

    /// Declare the primary key used at creation time
    pub fn with_primary_key(mut self, columns: Vec<String>) -> Self {
        self.primary_key = columns;
        self
    }

    /// Attach the unique keys found in the catalog
    pub fn with_unique_keys(mut self, keys: Vec<Vec<String>>) -> Self {
        self.unique_keys = keys;
        self
    }

    /// Whether some unique key consists of exactly `columns`, in any order
    pub fn has_unique_key(&self, columns: &[String]) -> bool {
        self.unique_keys
            .iter()
            .any(|key| same_column_set(key, columns))
    }

    /// Whether every unique key consists of exactly `columns`
    pub fn only_unique_key(&self, columns: &[String]) -> bool {
        !self.unique_keys.is_empty()
            && self
                .unique_keys
                .iter()
                .all(|key| same_column_set(key, columns))
    }

    /// Number of columns
    #[inline]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Whether the schema has no columns
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Column names in ordinal order
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Get column by name (case-insensitive)
    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Position of a column by name (case-insensitive)
    pub fn position(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }
}

fn same_column_set(a: &[String], b: &[String]) -> bool {
    a.len() == b.len()
        && a.iter().all(|x| b.iter().any(|y| y.eq_ignore_ascii_case(x)))
        && b.iter().all(|y| a.iter().any(|x| x.eq_ignore_ascii_case(y)))
}

/// Table identifier.
///
/// Derived equality compares components literally; identifiers should be
/// passed through `DialectAdapter::canonical_table_id` first so that two
/// identifiers naming the same physical table compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableId {
    /// Catalog / database
    pub catalog: Option<String>,
    /// Schema / namespace
    pub schema: Option<String>,
    /// Table name
    pub name: String,
}

impl TableId {
    /// Unqualified table identifier
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            catalog: None,
            schema: None,
            name: name.into(),
        }
    }

    /// Set the schema
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Set the catalog
    pub fn with_catalog(mut self, catalog: impl Into<String>) -> Self {
        self.catalog = Some(catalog.into());
        self
    }

    /// Same namespace, different table name
    pub fn sibling(&self, name: impl Into<String>) -> Self {
        Self {
            catalog: self.catalog.clone(),
            schema: self.schema.clone(),
            name: name.into(),
        }
    }

    /// Dotted name of all present components (unquoted)
    pub fn qualified_name(&self) -> String {
        let mut parts: Vec<&str> = Vec::with_capacity(3);
        if let Some(c) = &self.catalog {
            parts.push(c);
        }
        if let Some(s) = &self.schema {
            parts.push(s);
        }
        parts.push(&self.name);
        parts.join(".")
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.qualified_name())
    }
}

/// Ordered chunk of rows produced by the data pipeline
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordBatch {
    rows: Vec<Vec<Value>>,
}

impl RecordBatch {
    /// Create a batch
    pub fn new(rows: Vec<Vec<Value>>) -> Self {
        Self { rows }
    }

    /// Number of rows
    #[inline]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the batch has no rows
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Borrow rows
    #[inline]
    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    /// Consume into rows
    pub fn into_rows(self) -> Vec<Vec<Value>> {
        self.rows
    }
}

impl From<Vec<Vec<Value>>> for RecordBatch {
    fn from(rows: Vec<Vec<Value>>) -> Self {
        Self::new(rows)
    }
}
