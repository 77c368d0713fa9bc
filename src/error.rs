use thiserror::Error;

#[cfg(feature = "sqlite")]
use rusqlite;
#[cfg(feature = "mssql")]
use tiberius;
#[cfg(feature = "postgres")]
use tokio_postgres;

use crate::driver::ColumnType;
use crate::types::{DatabaseType, ValueType};

#[derive(Debug, Error)]
pub enum SqlEngineError {
    #[cfg(feature = "postgres")]
    #[error(transparent)]
    PostgresError(#[from] tokio_postgres::Error),

    #[cfg(feature = "sqlite")]
    #[error(transparent)]
    SqliteError(#[from] rusqlite::Error),

    #[cfg(feature = "mssql")]
    #[error(transparent)]
    MssqlError(#[from] tiberius::error::Error),

    #[cfg(feature = "mysql")]
    #[error(transparent)]
    MysqlError(#[from] mysql_async::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Parameter error: {0}")]
    ParameterError(String),

    #[error("Provider {0} is not registered")]
    ProviderNotRegistered(DatabaseType),

    #[error("Provider {0} is already registered")]
    DuplicateProvider(DatabaseType),

    #[error("No native driver is available for provider {0}")]
    DriverNotAvailable(DatabaseType),

    #[error("Type {value_type:?} is not supported by provider {provider}")]
    UnsupportedType {
        provider: DatabaseType,
        value_type: ValueType,
    },

    #[error("Column '{column}' of type {column_type:?} cannot be mapped to {target:?}")]
    UnsupportedColumnType {
        column: String,
        column_type: ColumnType,
        target: ValueType,
    },

    #[error("Cannot convert {from} to {to:?}")]
    ConversionError { from: String, to: ValueType },

    #[error("Column '{0}' is null but the target member is not nullable")]
    NullValue(String),

    #[error("Type {0} has no constructor matching its declared members")]
    MissingConstructor(&'static str),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("SQL execution error: {0}")]
    ExecutionError(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("No active transaction")]
    NoActiveTransaction,

    #[error("Transaction has already been committed or rolled back")]
    TransactionCompleted,

    #[error("Other database error: {0}")]
    Other(String),
}

/// Coarse classification used by the propagation policy.
///
/// Configuration and schema errors always surface as `Err`, even from the
/// `try_*` call variants. Execution and cancellation errors are captured into
/// an [`Outcome`](crate::outcome::Outcome) by the `try_*` variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Execution,
    Cancellation,
    Schema,
}

impl SqlEngineError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            SqlEngineError::ConfigError(_)
            | SqlEngineError::ParameterError(_)
            | SqlEngineError::ProviderNotRegistered(_)
            | SqlEngineError::DuplicateProvider(_)
            | SqlEngineError::DriverNotAvailable(_)
            | SqlEngineError::UnsupportedType { .. }
            | SqlEngineError::NoActiveTransaction
            | SqlEngineError::TransactionCompleted => ErrorKind::Configuration,
            SqlEngineError::UnsupportedColumnType { .. }
            | SqlEngineError::ConversionError { .. }
            | SqlEngineError::NullValue(_)
            | SqlEngineError::MissingConstructor(_) => ErrorKind::Schema,
            SqlEngineError::Cancelled(_) => ErrorKind::Cancellation,
            _ => ErrorKind::Execution,
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SqlEngineError::Cancelled(_))
    }

    pub(crate) fn conversion(from: &crate::types::RowValues, to: ValueType) -> Self {
        SqlEngineError::ConversionError {
            from: from.type_label().to_string(),
            to,
        }
    }
}

#[cfg(feature = "sqlite")]
impl From<tokio::task::JoinError> for SqlEngineError {
    fn from(err: tokio::task::JoinError) -> Self {
        SqlEngineError::ExecutionError(format!("sqlite spawn_blocking join error: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_follows_the_propagation_policy() {
        assert_eq!(
            SqlEngineError::ConfigError("x".into()).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(SqlEngineError::NullValue("c".into()).kind(), ErrorKind::Schema);
        assert_eq!(
            SqlEngineError::ExecutionError("boom".into()).kind(),
            ErrorKind::Execution
        );
        assert_eq!(
            SqlEngineError::Cancelled("stop".into()).kind(),
            ErrorKind::Cancellation
        );
        assert_eq!(
            SqlEngineError::TransactionCompleted.kind(),
            ErrorKind::Configuration
        );
    }
}
