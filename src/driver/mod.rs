//! Native driver seam.
//!
//! Every backend is reached through the same three async traits. A
//! [`NativeConnector`] opens [`NativeConnection`]s; a connection executes
//! [`NativeCommand`]s and hands back [`NativeReader`]s whose rows are read
//! through [`RowCursor`]. The engine never branches on the backend past this
//! point.
//!
//! - `buffered`: reader/row implementation shared by all adapters
//! - `sqlite`, `postgres`, `mssql`, `mysql`: adapters over the native crates

mod buffered;
#[cfg(feature = "mssql")]
pub mod mssql;
#[cfg(feature = "mysql")]
pub mod mysql;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::SqlEngineError;
use crate::provider::ProviderTypeCode;
use crate::types::{DatabaseType, RowValues, ValueType};

pub use buffered::{BufferedReader, BufferedRow, ResultBuffer};

/// Normalized native column type reported by a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Decimal,
    Text,
    /// Text column the driver flags as large (`CLOB`, `NTEXT`, `LONGTEXT`).
    LongText,
    Date,
    Time,
    DateTime,
    Interval,
    Guid,
    Binary,
    /// Binary column the driver flags as large (`BLOB`, `IMAGE`, `LONGBLOB`).
    LongBinary,
    Json,
    /// No declared type; the stored value decides (SQLite expressions).
    Dynamic,
}

impl ColumnType {
    /// The one native accessor used to read a column of this type.
    #[must_use]
    pub fn accessor(self) -> NativeAccessor {
        match self {
            ColumnType::Bool => NativeAccessor::Boolean,
            ColumnType::Int8 | ColumnType::Int16 => NativeAccessor::Int16,
            ColumnType::Int32 => NativeAccessor::Int32,
            ColumnType::Int64 => NativeAccessor::Int64,
            ColumnType::Float32 => NativeAccessor::Float,
            ColumnType::Float64 => NativeAccessor::Double,
            ColumnType::Decimal => NativeAccessor::Decimal,
            ColumnType::Text | ColumnType::LongText => NativeAccessor::String,
            ColumnType::Date => NativeAccessor::Date,
            ColumnType::Time => NativeAccessor::Time,
            ColumnType::DateTime => NativeAccessor::DateTime,
            ColumnType::Interval => NativeAccessor::TimeSpan,
            ColumnType::Guid => NativeAccessor::Guid,
            ColumnType::Binary | ColumnType::LongBinary => NativeAccessor::Bytes,
            ColumnType::Json => NativeAccessor::Json,
            ColumnType::Dynamic => NativeAccessor::Value,
        }
    }

    /// Declared type a value of this column naturally maps onto.
    #[must_use]
    pub fn natural_type(self) -> Option<ValueType> {
        Some(match self {
            ColumnType::Bool => ValueType::Bool,
            ColumnType::Int8 => ValueType::I8,
            ColumnType::Int16 => ValueType::I16,
            ColumnType::Int32 => ValueType::I32,
            ColumnType::Int64 => ValueType::I64,
            ColumnType::Float32 => ValueType::F32,
            ColumnType::Float64 => ValueType::F64,
            ColumnType::Decimal => ValueType::Decimal,
            ColumnType::Text => ValueType::Text,
            ColumnType::LongText => ValueType::LongText,
            ColumnType::Date => ValueType::Date,
            ColumnType::Time => ValueType::Time,
            ColumnType::DateTime => ValueType::DateTime,
            ColumnType::Interval => ValueType::Interval,
            ColumnType::Guid => ValueType::Guid,
            ColumnType::Binary | ColumnType::LongBinary => ValueType::Bytes,
            ColumnType::Json => ValueType::Json,
            ColumnType::Dynamic => return None,
        })
    }

    #[must_use]
    pub fn is_large_object(self) -> bool {
        matches!(self, ColumnType::LongText | ColumnType::LongBinary)
    }
}

/// Typed read call on a native row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeAccessor {
    Boolean,
    Int16,
    Int32,
    Int64,
    Float,
    Double,
    Decimal,
    String,
    Date,
    Time,
    DateTime,
    TimeSpan,
    Guid,
    Bytes,
    Json,
    /// Untyped read; returns whatever the driver stored.
    Value,
}

/// Column metadata as reported by the driver.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NativeColumn {
    pub name: String,
    pub column_type: ColumnType,
    pub allow_null: bool,
    pub size: Option<usize>,
}

impl NativeColumn {
    #[must_use]
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            allow_null: true,
            size: None,
        }
    }

    #[must_use]
    pub fn not_null(mut self) -> Self {
        self.allow_null = false;
        self
    }

    #[must_use]
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CommandType {
    #[default]
    Text,
    StoredProcedure,
    AnonymousBlock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ParameterDirection {
    #[default]
    Input,
    Output,
    InputOutput,
    ReturnValue,
}

impl ParameterDirection {
    #[must_use]
    pub fn is_output(self) -> bool {
        !matches!(self, ParameterDirection::Input)
    }

    #[must_use]
    pub fn is_input(self) -> bool {
        matches!(
            self,
            ParameterDirection::Input | ParameterDirection::InputOutput
        )
    }
}

/// Parameter attached to a native command.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeParameter {
    /// Logical parameter name, without marker prefix.
    pub name: String,
    /// Marker text in the transformed script (`$1`, `@P1`, `:name`, `?`).
    pub marker: String,
    pub value: RowValues,
    pub direction: ParameterDirection,
    pub value_type: ValueType,
    pub type_code: ProviderTypeCode,
    pub size: Option<u32>,
    pub precision: Option<u8>,
    pub scale: Option<u8>,
}

/// Fully bound command ready for a [`NativeConnection`].
#[derive(Debug, Clone, PartialEq)]
pub struct NativeCommand {
    pub script: Arc<str>,
    pub command_type: CommandType,
    pub parameters: Vec<NativeParameter>,
    /// Parameter indexes in marker order for drivers with anonymous markers.
    pub bind_order: Vec<usize>,
    pub timeout: Option<Duration>,
    pub prepared: bool,
}

impl NativeCommand {
    #[must_use]
    pub fn text(script: impl Into<Arc<str>>) -> Self {
        Self {
            script: script.into(),
            command_type: CommandType::Text,
            parameters: Vec::new(),
            bind_order: Vec::new(),
            timeout: None,
            prepared: false,
        }
    }

    #[must_use]
    pub fn parameter(&self, name: &str) -> Option<&NativeParameter> {
        self.parameters
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    pub fn parameter_mut(&mut self, name: &str) -> Option<&mut NativeParameter> {
        self.parameters
            .iter_mut()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    /// Values in the order the driver must bind them.
    #[must_use]
    pub fn positional_values(&self) -> Vec<&RowValues> {
        if self.bind_order.is_empty() {
            self.parameters.iter().map(|p| &p.value).collect()
        } else {
            self.bind_order
                .iter()
                .filter_map(|idx| self.parameters.get(*idx))
                .map(|p| &p.value)
                .collect()
        }
    }

    #[must_use]
    pub fn has_output_parameters(&self) -> bool {
        self.parameters.iter().any(|p| p.direction.is_output())
    }
}

/// One row of the current result set.
pub trait RowCursor: Send + Sync {
    fn column_count(&self) -> usize;

    fn is_null(&self, ordinal: usize) -> bool;

    /// Typed read selected by the column's source type.
    ///
    /// # Errors
    /// Returns `SqlEngineError::ExecutionError` when the stored value cannot be
    /// read through `accessor`.
    fn read(&self, ordinal: usize, accessor: NativeAccessor) -> Result<RowValues, SqlEngineError>;

    /// Copy up to `buf.len()` bytes of a binary column starting at `offset`.
    ///
    /// # Errors
    /// Returns `SqlEngineError::ExecutionError` when the column is not binary.
    fn read_bytes(
        &self,
        ordinal: usize,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<usize, SqlEngineError>;

    /// Append up to `max_chars` characters of a text column starting at
    /// character `offset`, returning how many were appended.
    ///
    /// # Errors
    /// Returns `SqlEngineError::ExecutionError` when the column is not text.
    fn read_chars(
        &self,
        ordinal: usize,
        offset: usize,
        buf: &mut String,
        max_chars: usize,
    ) -> Result<usize, SqlEngineError>;
}

#[async_trait]
pub trait NativeReader: Send {
    /// Columns of the current result set.
    fn columns(&self) -> &[NativeColumn];

    /// Advance to the next row of the current result set.
    async fn read(&mut self) -> Result<bool, SqlEngineError>;

    /// The row the last successful [`read`](Self::read) moved to.
    fn current(&self) -> Option<&dyn RowCursor>;

    /// Advance to the next result set.
    async fn next_result(&mut self) -> Result<bool, SqlEngineError>;

    fn records_affected(&self) -> u64;

    async fn close(&mut self) -> Result<(), SqlEngineError>;

    fn is_closed(&self) -> bool;
}

#[async_trait]
pub trait NativeConnection: Send {
    fn database_type(&self) -> DatabaseType;

    async fn begin(&mut self) -> Result<(), SqlEngineError>;

    async fn commit(&mut self) -> Result<(), SqlEngineError>;

    async fn rollback(&mut self) -> Result<(), SqlEngineError>;

    /// Native "prepare statement" step.
    async fn prepare(&mut self, command: &NativeCommand) -> Result<(), SqlEngineError>;

    async fn execute_non_query(&mut self, command: &mut NativeCommand) -> Result<u64, SqlEngineError>;

    async fn execute_reader(
        &mut self,
        command: &mut NativeCommand,
    ) -> Result<Box<dyn NativeReader>, SqlEngineError>;

    async fn close(&mut self) -> Result<(), SqlEngineError>;
}

/// Connection factory for one data source.
#[async_trait]
pub trait NativeConnector: Send + Sync + fmt::Debug {
    fn database_type(&self) -> DatabaseType;

    async fn connect(&self) -> Result<Box<dyn NativeConnection>, SqlEngineError>;
}

/// Build a connector for `provider` from a connection string.
///
/// SQLite takes a path (or `:memory:`), PostgreSQL a libpq-style string,
/// SQL Server an ADO.NET string and MySQL a `mysql://` URL.
///
/// # Errors
/// Returns `SqlEngineError::DriverNotAvailable` when no native driver for the
/// provider is compiled in, or `SqlEngineError::ConfigError` if the string is
/// malformed.
pub fn connector_from_url(
    provider: DatabaseType,
    url: &str,
) -> Result<Arc<dyn NativeConnector>, SqlEngineError> {
    match provider {
        #[cfg(feature = "sqlite")]
        DatabaseType::Sqlite => Ok(Arc::new(sqlite::SqliteConnector::new(
            sqlite::SqliteOptions::new(url.to_string()),
        ))),
        #[cfg(feature = "postgres")]
        DatabaseType::Postgres => {
            let config = url.parse::<tokio_postgres::Config>().map_err(|e| {
                SqlEngineError::ConfigError(format!("invalid postgres connection string: {e}"))
            })?;
            Ok(Arc::new(postgres::PostgresConnector::new(config)))
        }
        #[cfg(feature = "mssql")]
        DatabaseType::Mssql => Ok(Arc::new(mssql::MssqlConnector::from_ado_string(url)?)),
        #[cfg(feature = "mysql")]
        DatabaseType::Mysql => Ok(Arc::new(mysql::MysqlConnector::from_url(url)?)),
        #[allow(unreachable_patterns)]
        other => {
            let _ = url;
            Err(SqlEngineError::DriverNotAvailable(other))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_column_type_has_one_accessor() {
        assert_eq!(ColumnType::Int32.accessor(), NativeAccessor::Int32);
        assert_eq!(ColumnType::LongText.accessor(), NativeAccessor::String);
        assert_eq!(ColumnType::LongBinary.accessor(), NativeAccessor::Bytes);
        assert_eq!(ColumnType::Dynamic.accessor(), NativeAccessor::Value);
    }

    #[test]
    fn oracle_has_no_native_driver() {
        let err = connector_from_url(DatabaseType::Oracle, "user/pass@db").unwrap_err();
        assert!(matches!(
            err,
            SqlEngineError::DriverNotAvailable(DatabaseType::Oracle)
        ));
    }

    #[test]
    fn positional_values_follow_bind_order() {
        let mut cmd = NativeCommand::text("select ? , ?");
        for (name, value) in [("a", 1), ("b", 2)] {
            cmd.parameters.push(NativeParameter {
                name: name.into(),
                marker: "?".into(),
                value: RowValues::Int(value),
                direction: ParameterDirection::Input,
                value_type: ValueType::I64,
                type_code: 0,
                size: None,
                precision: None,
                scale: None,
            });
        }
        cmd.bind_order = vec![1, 0, 1];
        let values: Vec<_> = cmd.positional_values().into_iter().cloned().collect();
        assert_eq!(
            values,
            vec![RowValues::Int(2), RowValues::Int(1), RowValues::Int(2)]
        );
    }
}
