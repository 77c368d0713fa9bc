//! Helpers for exercising the engine without a live database server.
//!
//! [`MockConnector`] scripts result sets, output values, delays and failures
//! and records what the engine did with its connections.

use std::future::Future;
use std::sync::{Arc, LazyLock};

use tokio::runtime::Runtime;

use crate::config::EngineOptions;
use crate::context::EngineContext;
use crate::driver::{ColumnType, NativeColumn, NativeConnector, ResultBuffer};
use crate::executor::Database;
use crate::types::{DatabaseType, RowValues};

mod mock;

pub use mock::{MockConnector, MockStats};

/// Shared tokio runtime for tests that drive async code from sync contexts.
pub(crate) static SHARED_RUNTIME: LazyLock<Runtime> =
    LazyLock::new(|| Runtime::new().expect("Failed to create tokio runtime for test utilities"));

/// Run `future` to completion on the shared test runtime.
pub fn block_on<F: Future>(future: F) -> F::Output {
    SHARED_RUNTIME.block_on(future)
}

/// Result set with the given `(name, type)` columns and rows.
#[must_use]
pub fn result_set(columns: &[(&str, ColumnType)], rows: Vec<Vec<RowValues>>) -> ResultBuffer {
    ResultBuffer::new(
        columns
            .iter()
            .map(|(name, column_type)| NativeColumn::new(*name, *column_type))
            .collect(),
    )
    .with_rows(rows)
}

/// Single `Int64` column named `name` holding `values`.
#[must_use]
pub fn int_column(name: &str, values: impl IntoIterator<Item = i64>) -> ResultBuffer {
    result_set(
        &[(name, ColumnType::Int64)],
        values.into_iter().map(|v| vec![RowValues::Int(v)]).collect(),
    )
}

/// A mock connector and a [`Database`] over it with its own context, so
/// cache statistics are not shared between tests.
#[must_use]
pub fn mock_database(provider: DatabaseType) -> (Arc<MockConnector>, Database) {
    mock_database_with(provider, EngineOptions::default())
}

/// # Panics
/// Panics if `options` fail validation.
#[must_use]
pub fn mock_database_with(
    provider: DatabaseType,
    options: EngineOptions,
) -> (Arc<MockConnector>, Database) {
    let connector = Arc::new(MockConnector::new(provider));
    let ctx = Arc::new(EngineContext::new(options).expect("valid test options"));
    let native: Arc<dyn NativeConnector> = connector.clone();
    (connector, Database::with_context(native, ctx))
}
