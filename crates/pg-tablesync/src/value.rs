//! SQL value types for type-safe row handling.
//!
//! Values read from the source, staged through COPY and bound as statement
//! parameters all travel as [`SqlValue`]. Binding follows the string-plus-cast
//! scheme: every parameter is sent as text and the statement carries an
//! explicit SQL cast for its column type.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::schema::Column;

/// Type hint for NULL values to ensure correct encoding and cast selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlNullType {
    Bool,
    I16,
    I32,
    I64,
    F32,
    F64,
    Text,
    Bytes,
    Uuid,
    Decimal,
    DateTime,
    DateTimeOffset,
    Date,
    Time,
}

/// SQL value enum for type-safe row handling.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// NULL with type hint for correct cast selection.
    Null(SqlNullType),
    Bool(bool),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Text(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    Decimal(Decimal),
    /// Timestamp without timezone.
    DateTime(NaiveDateTime),
    /// Timestamp with timezone offset.
    DateTimeOffset(DateTime<FixedOffset>),
    Date(NaiveDate),
    Time(NaiveTime),
}

/// Coarse destination type category derived from a PostgreSQL udt name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Bool,
    I16,
    I32,
    I64,
    F32,
    F64,
    Text,
    Bytes,
    Uuid,
    Decimal,
    DateTime,
    DateTimeOffset,
    Date,
    Time,
}

impl TypeCategory {
    /// Classify a PostgreSQL udt name (as reported by information_schema).
    pub fn from_udt_name(udt: &str) -> Self {
        match udt.to_lowercase().as_str() {
            "bool" | "boolean" => TypeCategory::Bool,
            "int2" | "smallint" => TypeCategory::I16,
            "int4" | "integer" | "int" | "serial" => TypeCategory::I32,
            "int8" | "bigint" | "bigserial" => TypeCategory::I64,
            "float4" | "real" => TypeCategory::F32,
            "float8" | "double precision" => TypeCategory::F64,
            "numeric" | "decimal" | "money" => TypeCategory::Decimal,
            "bytea" => TypeCategory::Bytes,
            "uuid" => TypeCategory::Uuid,
            "timestamp" | "timestamp without time zone" => TypeCategory::DateTime,
            "timestamptz" | "timestamp with time zone" => TypeCategory::DateTimeOffset,
            "date" => TypeCategory::Date,
            "time" | "timetz" | "time without time zone" => TypeCategory::Time,
            _ => TypeCategory::Text,
        }
    }

    /// Null hint matching this category.
    pub fn null_hint(self) -> SqlNullType {
        match self {
            TypeCategory::Bool => SqlNullType::Bool,
            TypeCategory::I16 => SqlNullType::I16,
            TypeCategory::I32 => SqlNullType::I32,
            TypeCategory::I64 => SqlNullType::I64,
            TypeCategory::F32 => SqlNullType::F32,
            TypeCategory::F64 => SqlNullType::F64,
            TypeCategory::Text => SqlNullType::Text,
            TypeCategory::Bytes => SqlNullType::Bytes,
            TypeCategory::Uuid => SqlNullType::Uuid,
            TypeCategory::Decimal => SqlNullType::Decimal,
            TypeCategory::DateTime => SqlNullType::DateTime,
            TypeCategory::DateTimeOffset => SqlNullType::DateTimeOffset,
            TypeCategory::Date => SqlNullType::Date,
            TypeCategory::Time => SqlNullType::Time,
        }
    }
}

impl SqlValue {
    /// Check if this value is NULL.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null(_))
    }

    /// Get the SqlNullType for this value (for type-aware NULL handling).
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
            SqlValue::Text(_) => SqlNullType::Text,
            SqlValue::Bytes(_) => SqlNullType::Bytes,
            SqlValue::Uuid(_) => SqlNullType::Uuid,
            SqlValue::Decimal(_) => SqlNullType::Decimal,
            SqlValue::DateTime(_) => SqlNullType::DateTime,
            SqlValue::DateTimeOffset(_) => SqlNullType::DateTimeOffset,
            SqlValue::Date(_) => SqlNullType::Date,
            SqlValue::Time(_) => SqlNullType::Time,
        }
    }

    /// Render the canonical text form used for parameter binding, fan-in
    /// concatenation and duplicate keys. NULL renders as the empty string.
    #[must_use]
    pub fn render_text(&self) -> String {
        match self {
            SqlValue::Null(_) => String::new(),
            SqlValue::Bool(b) => if *b { "true" } else { "false" }.to_string(),
            SqlValue::I16(n) => n.to_string(),
            SqlValue::I32(n) => n.to_string(),
            SqlValue::I64(n) => n.to_string(),
            SqlValue::F32(n) => n.to_string(),
            SqlValue::F64(n) => n.to_string(),
            SqlValue::Text(s) => s.clone(),
            SqlValue::Bytes(b) => format!("\\x{}", hex::encode(b)),
            SqlValue::Uuid(u) => u.to_string(),
            SqlValue::Decimal(d) => d.to_string(),
            SqlValue::DateTime(dt) => dt.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
            SqlValue::DateTimeOffset(dt) => dt.to_rfc3339(),
            SqlValue::Date(d) => d.to_string(),
            SqlValue::Time(t) => t.to_string(),
        }
    }

    /// Parameter form: the text rendering, or None for SQL NULL.
    #[must_use]
    pub fn to_param(&self) -> Option<String> {
        if self.is_null() {
            None
        } else {
            Some(self.render_text())
        }
    }

    /// Get the SQL cast suffix matching this value's type.
    ///
    /// Parameters are bound as text and cast server-side, so every
    /// placeholder in generated SQL carries one of these suffixes.
    #[must_use]
    pub fn sql_cast(&self) -> &'static str {
        match self.null_type() {
            SqlNullType::Bool => "::boolean",
            SqlNullType::I16 => "::smallint",
            SqlNullType::I32 => "::integer",
            SqlNullType::I64 => "::bigint",
            SqlNullType::F32 => "::real",
            SqlNullType::F64 => "::double precision",
            SqlNullType::Text => "::text",
            SqlNullType::Bytes => "::bytea",
            SqlNullType::Uuid => "::uuid",
            SqlNullType::Decimal => "::numeric",
            SqlNullType::DateTime => "::timestamp",
            SqlNullType::DateTimeOffset => "::timestamptz",
            SqlNullType::Date => "::date",
            SqlNullType::Time => "::time",
        }
    }

    /// Key part for duplicate detection: text compares case-insensitively
    /// (mirroring the store's default collation), everything else exactly.
    #[must_use]
    pub fn dedup_key_part(&self) -> String {
        match self {
            SqlValue::Text(s) => s.to_uppercase(),
            other => other.render_text(),
        }
    }

    /// Coerce this value to the representation of a destination column.
    ///
    /// This is the conversion step of a column mapping: values that already
    /// match the category pass through, compatible values are widened or
    /// parsed, anything else is a mapping error naming the column.
    pub fn coerce_to(self, column: &Column) -> Result<SqlValue> {
        let cat = TypeCategory::from_udt_name(&column.data_type);
        self.coerce_to_category(cat)
            .map_err(|v| mismatch(&v, cat, column))
    }

    /// Coerce into a type category; returns the unconverted value on failure
    /// so the caller can build a descriptive error.
    fn coerce_to_category(self, cat: TypeCategory) -> std::result::Result<SqlValue, SqlValue> {
        if let SqlValue::Null(_) = self {
            return Ok(SqlValue::Null(cat.null_hint()));
        }
        match cat {
            TypeCategory::Text => Ok(SqlValue::Text(self.render_text())),
            TypeCategory::Bool => match &self {
                SqlValue::Bool(_) => Ok(self),
                SqlValue::I16(n) => Ok(SqlValue::Bool(*n != 0)),
                SqlValue::I32(n) => Ok(SqlValue::Bool(*n != 0)),
                SqlValue::I64(n) => Ok(SqlValue::Bool(*n != 0)),
                SqlValue::Text(s) => match s.trim().to_lowercase().as_str() {
                    "true" | "t" | "yes" | "1" => Ok(SqlValue::Bool(true)),
                    "false" | "f" | "no" | "0" => Ok(SqlValue::Bool(false)),
                    _ => Err(self),
                },
                _ => Err(self),
            },
            TypeCategory::I16 => self.to_i64().map(|n| SqlValue::I16(n as i16)),
            TypeCategory::I32 => self.to_i64().map(|n| SqlValue::I32(n as i32)),
            TypeCategory::I64 => self.to_i64().map(SqlValue::I64),
            TypeCategory::F32 => self.to_f64().map(|n| SqlValue::F32(n as f32)),
            TypeCategory::F64 => self.to_f64().map(SqlValue::F64),
            TypeCategory::Decimal => match &self {
                SqlValue::Decimal(_) => Ok(self),
                SqlValue::I16(n) => Ok(SqlValue::Decimal(Decimal::from(*n))),
                SqlValue::I32(n) => Ok(SqlValue::Decimal(Decimal::from(*n))),
                SqlValue::I64(n) => Ok(SqlValue::Decimal(Decimal::from(*n))),
                SqlValue::Text(s) => s
                    .trim()
                    .parse::<Decimal>()
                    .map(SqlValue::Decimal)
                    .map_err(|_| self),
                _ => Err(self),
            },
            TypeCategory::Uuid => match &self {
                SqlValue::Uuid(_) => Ok(self),
                SqlValue::Text(s) => Uuid::parse_str(s.trim()).map(SqlValue::Uuid).map_err(|_| self),
                _ => Err(self),
            },
            TypeCategory::Bytes => match self {
                SqlValue::Bytes(_) => Ok(self),
                other => Err(other),
            },
            TypeCategory::DateTime => match &self {
                SqlValue::DateTime(_) => Ok(self),
                SqlValue::Date(d) => Ok(SqlValue::DateTime(d.and_hms_opt(0, 0, 0).unwrap())),
                SqlValue::DateTimeOffset(dt) => Ok(SqlValue::DateTime(dt.naive_utc())),
                SqlValue::Text(s) => parse_datetime(s).map(SqlValue::DateTime).ok_or(self),
                _ => Err(self),
            },
            TypeCategory::DateTimeOffset => match &self {
                SqlValue::DateTimeOffset(_) => Ok(self),
                SqlValue::Text(s) => DateTime::parse_from_rfc3339(s.trim())
                    .map(SqlValue::DateTimeOffset)
                    .map_err(|_| self),
                _ => Err(self),
            },
            TypeCategory::Date => match &self {
                SqlValue::Date(_) => Ok(self),
                SqlValue::DateTime(dt) => Ok(SqlValue::Date(dt.date())),
                SqlValue::Text(s) => s
                    .trim()
                    .parse::<NaiveDate>()
                    .map(SqlValue::Date)
                    .map_err(|_| self),
                _ => Err(self),
            },
            TypeCategory::Time => match &self {
                SqlValue::Time(_) => Ok(self),
                SqlValue::Text(s) => s
                    .trim()
                    .parse::<NaiveTime>()
                    .map(SqlValue::Time)
                    .map_err(|_| self),
                _ => Err(self),
            },
        }
    }

    fn to_i64(self) -> std::result::Result<i64, SqlValue> {
        match &self {
            SqlValue::I16(n) => Ok(*n as i64),
            SqlValue::I32(n) => Ok(*n as i64),
            SqlValue::I64(n) => Ok(*n),
            SqlValue::Bool(b) => Ok(*b as i64),
            SqlValue::Text(s) => s.trim().parse::<i64>().map_err(|_| self),
            _ => Err(self),
        }
    }

    fn to_f64(self) -> std::result::Result<f64, SqlValue> {
        match &self {
            SqlValue::F32(n) => Ok(*n as f64),
            SqlValue::F64(n) => Ok(*n),
            SqlValue::I16(n) => Ok(*n as f64),
            SqlValue::I32(n) => Ok(*n as f64),
            SqlValue::I64(n) => Ok(*n as f64),
            SqlValue::Text(s) => s.trim().parse::<f64>().map_err(|_| self),
            _ => Err(self),
        }
    }
}

fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f"))
        .ok()
        .or_else(|| s.parse::<NaiveDate>().ok().and_then(|d| d.and_hms_opt(0, 0, 0)))
}

fn mismatch(value: &SqlValue, cat: TypeCategory, column: &Column) -> SyncError {
    SyncError::Mapping(format!(
        "Cannot convert value {:?} to {:?} for destination column {}",
        value, cat, column.name
    ))
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<i16> for SqlValue {
    fn from(v: i16) -> Self {
        SqlValue::I16(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::I32(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::I64(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<Uuid> for SqlValue {
    fn from(v: Uuid) -> Self {
        SqlValue::Uuid(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Column;

    fn col(name: &str, udt: &str) -> Column {
        Column {
            name: name.to_string(),
            data_type: udt.to_string(),
            is_nullable: true,
            is_identity: false,
            is_primary_key: false,
            ordinal_pos: 1,
        }
    }

    #[test]
    fn test_category_from_udt() {
        assert_eq!(TypeCategory::from_udt_name("int4"), TypeCategory::I32);
        assert_eq!(TypeCategory::from_udt_name("varchar"), TypeCategory::Text);
        assert_eq!(
            TypeCategory::from_udt_name("timestamptz"),
            TypeCategory::DateTimeOffset
        );
    }

    #[test]
    fn test_coerce_text_to_int() {
        let v = SqlValue::Text(" 42 ".to_string());
        assert_eq!(v.coerce_to(&col("n", "int4")).unwrap(), SqlValue::I32(42));
    }

    #[test]
    fn test_coerce_int_to_text() {
        let v = SqlValue::I64(7);
        assert_eq!(
            v.coerce_to(&col("s", "text")).unwrap(),
            SqlValue::Text("7".to_string())
        );
    }

    #[test]
    fn test_coerce_null_retypes() {
        let v = SqlValue::Null(SqlNullType::Text);
        let out = v.coerce_to(&col("n", "int8")).unwrap();
        assert_eq!(out, SqlValue::Null(SqlNullType::I64));
    }

    #[test]
    fn test_coerce_garbage_fails() {
        let v = SqlValue::Text("not a number".to_string());
        assert!(v.coerce_to(&col("n", "int4")).is_err());
    }

    #[test]
    fn test_dedup_key_case_insensitive_for_text() {
        assert_eq!(
            SqlValue::Text("Alice".into()).dedup_key_part(),
            SqlValue::Text("ALICE".into()).dedup_key_part()
        );
        assert_ne!(
            SqlValue::I32(1).dedup_key_part(),
            SqlValue::Text("1x".into()).dedup_key_part()
        );
    }

    #[test]
    fn test_param_null_is_none() {
        assert_eq!(SqlValue::Null(SqlNullType::I32).to_param(), None);
        assert_eq!(SqlValue::I32(5).to_param(), Some("5".to_string()));
    }

    #[test]
    fn test_sql_cast_follows_type() {
        assert_eq!(SqlValue::I64(1).sql_cast(), "::bigint");
        assert_eq!(SqlValue::Null(SqlNullType::Uuid).sql_cast(), "::uuid");
    }
}
