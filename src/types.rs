use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use clap::ValueEnum;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::SqlEngineError;

/// Values exchanged with a native driver, both as bind values and as raw
/// column values read back from a result set.
///
/// ```rust
/// use sql_engine::prelude::*;
///
/// let params = vec![
///     RowValues::Int(1),
///     RowValues::Text("alice".into()),
///     RowValues::Bool(true),
/// ];
/// # let _ = params;
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum RowValues {
    /// Integer value (64-bit)
    Int(i64),
    /// Floating point value (64-bit)
    Float(f64),
    /// Exact numeric value
    Decimal(Decimal),
    /// Text/string value
    Text(String),
    /// Boolean value
    Bool(bool),
    /// Calendar date
    Date(NaiveDate),
    /// Time of day
    Time(NaiveTime),
    /// Timestamp value
    Timestamp(NaiveDateTime),
    /// Time span
    Interval(TimeDelta),
    /// 128-bit identifier
    Guid(Uuid),
    /// NULL value
    Null,
    /// JSON value
    JSON(JsonValue),
    /// Binary data
    Blob(Vec<u8>),
}

impl RowValues {
    /// Check if this value is NULL
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_int(&self) -> Option<&i64> {
        if let RowValues::Int(value) = self {
            Some(value)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        if let RowValues::Text(value) = self {
            Some(value)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<&bool> {
        if let RowValues::Bool(value) = self {
            return Some(value);
        } else if let Some(i) = self.as_int() {
            if *i == 1 {
                return Some(&true);
            } else if *i == 0 {
                return Some(&false);
            }
        }
        None
    }

    #[must_use]
    pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
        if let RowValues::Timestamp(value) = self {
            return Some(*value);
        } else if let Some(s) = self.as_text() {
            return parse_timestamp(s);
        }
        None
    }

    #[must_use]
    pub fn as_float(&self) -> Option<f64> {
        if let RowValues::Float(value) = self {
            Some(*value)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_blob(&self) -> Option<&[u8]> {
        if let RowValues::Blob(bytes) = self {
            Some(bytes)
        } else {
            None
        }
    }

    /// Family of the value, `None` for NULL.
    #[must_use]
    pub fn family(&self) -> Option<ValueFamily> {
        Some(match self {
            RowValues::Int(_) => ValueFamily::Integer,
            RowValues::Float(_) => ValueFamily::Float,
            RowValues::Decimal(_) => ValueFamily::Decimal,
            RowValues::Text(_) => ValueFamily::Text,
            RowValues::Bool(_) => ValueFamily::Bool,
            RowValues::Date(_) => ValueFamily::Date,
            RowValues::Time(_) => ValueFamily::Time,
            RowValues::Timestamp(_) => ValueFamily::DateTime,
            RowValues::Interval(_) => ValueFamily::Interval,
            RowValues::Guid(_) => ValueFamily::Guid,
            RowValues::JSON(_) => ValueFamily::Json,
            RowValues::Blob(_) => ValueFamily::Binary,
            RowValues::Null => return None,
        })
    }

    /// Declared type a caller most likely meant when handing over this value.
    #[must_use]
    pub fn natural_type(&self) -> ValueType {
        match self {
            RowValues::Int(_) | RowValues::Null => ValueType::I64,
            RowValues::Float(_) => ValueType::F64,
            RowValues::Decimal(_) => ValueType::Decimal,
            RowValues::Text(_) => ValueType::Text,
            RowValues::Bool(_) => ValueType::Bool,
            RowValues::Date(_) => ValueType::Date,
            RowValues::Time(_) => ValueType::Time,
            RowValues::Timestamp(_) => ValueType::DateTime,
            RowValues::Interval(_) => ValueType::Interval,
            RowValues::Guid(_) => ValueType::Guid,
            RowValues::JSON(_) => ValueType::Json,
            RowValues::Blob(_) => ValueType::Bytes,
        }
    }

    pub(crate) fn type_label(&self) -> &'static str {
        match self {
            RowValues::Int(_) => "integer",
            RowValues::Float(_) => "float",
            RowValues::Decimal(_) => "decimal",
            RowValues::Text(_) => "text",
            RowValues::Bool(_) => "boolean",
            RowValues::Date(_) => "date",
            RowValues::Time(_) => "time",
            RowValues::Timestamp(_) => "timestamp",
            RowValues::Interval(_) => "interval",
            RowValues::Guid(_) => "guid",
            RowValues::Null => "null",
            RowValues::JSON(_) => "json",
            RowValues::Blob(_) => "blob",
        }
    }
}

impl fmt::Display for RowValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowValues::Int(v) => write!(f, "{v}"),
            RowValues::Float(v) => write!(f, "{v}"),
            RowValues::Decimal(v) => write!(f, "{v}"),
            RowValues::Text(v) => write!(f, "'{v}'"),
            RowValues::Bool(v) => write!(f, "{v}"),
            RowValues::Date(v) => write!(f, "{v}"),
            RowValues::Time(v) => write!(f, "{v}"),
            RowValues::Timestamp(v) => write!(f, "{}", v.format("%F %T%.f")),
            RowValues::Interval(v) => write!(f, "{v}"),
            RowValues::Guid(v) => write!(f, "{v}"),
            RowValues::Null => f.write_str("NULL"),
            RowValues::JSON(v) => write!(f, "{v}"),
            RowValues::Blob(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

pub(crate) fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    const FORMATS: [&str; 4] = [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
    ];
    FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

/// Declared application-side type of a parameter or target member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Decimal,
    Text,
    /// Text that may exceed a single native read; bound through a converter.
    LongText,
    Date,
    Time,
    DateTime,
    Interval,
    Guid,
    Bytes,
    Json,
    /// Output cursor handle (Oracle-style `REF CURSOR`).
    RefCursor,
}

/// Canonical value shape shared by several declared types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueFamily {
    Integer,
    Float,
    Decimal,
    Bool,
    Text,
    Date,
    Time,
    DateTime,
    Interval,
    Guid,
    Binary,
    Json,
    Cursor,
}

impl ValueType {
    #[must_use]
    pub fn family(self) -> ValueFamily {
        match self {
            ValueType::I8
            | ValueType::I16
            | ValueType::I32
            | ValueType::I64
            | ValueType::U8
            | ValueType::U16
            | ValueType::U32
            | ValueType::U64 => ValueFamily::Integer,
            ValueType::F32 | ValueType::F64 => ValueFamily::Float,
            ValueType::Decimal => ValueFamily::Decimal,
            ValueType::Bool => ValueFamily::Bool,
            ValueType::Text | ValueType::LongText => ValueFamily::Text,
            ValueType::Date => ValueFamily::Date,
            ValueType::Time => ValueFamily::Time,
            ValueType::DateTime => ValueFamily::DateTime,
            ValueType::Interval => ValueFamily::Interval,
            ValueType::Guid => ValueFamily::Guid,
            ValueType::Bytes => ValueFamily::Binary,
            ValueType::Json => ValueFamily::Json,
            ValueType::RefCursor => ValueFamily::Cursor,
        }
    }

    #[must_use]
    pub fn is_integer(self) -> bool {
        self.family() == ValueFamily::Integer
    }
}

/// The database type supported by this engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    /// SQL Server (T-SQL family)
    Mssql,
    /// `MySQL` / `MariaDB`
    Mysql,
    /// `PostgreSQL` database
    Postgres,
    /// Oracle database
    Oracle,
    /// `SQLite` database (embedded)
    Sqlite,
}

impl DatabaseType {
    pub const ALL: [DatabaseType; 5] = [
        DatabaseType::Mssql,
        DatabaseType::Mysql,
        DatabaseType::Postgres,
        DatabaseType::Oracle,
        DatabaseType::Sqlite,
    ];

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            DatabaseType::Mssql => "mssql",
            DatabaseType::Mysql => "mysql",
            DatabaseType::Postgres => "postgres",
            DatabaseType::Oracle => "oracle",
            DatabaseType::Sqlite => "sqlite",
        }
    }
}

impl fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DatabaseType {
    type Err = SqlEngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mssql" | "sqlserver" | "tsql" => Ok(DatabaseType::Mssql),
            "mysql" | "mariadb" => Ok(DatabaseType::Mysql),
            "postgres" | "postgresql" | "pg" => Ok(DatabaseType::Postgres),
            "oracle" => Ok(DatabaseType::Oracle),
            "sqlite" => Ok(DatabaseType::Sqlite),
            other => Err(SqlEngineError::ConfigError(format!(
                "unknown database type '{other}'"
            ))),
        }
    }
}
