use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

use crate::command::{PAGING_LIMIT, PAGING_OFFSET};
use crate::driver::{
    BufferedReader, ColumnType, NativeColumn, NativeCommand, NativeConnection, NativeConnector,
    NativeReader, ResultBuffer,
};
use crate::error::SqlEngineError;
use crate::types::{DatabaseType, RowValues};

/// What the engine did with a [`MockConnector`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockStats {
    pub connects: usize,
    pub closes: usize,
    pub begins: usize,
    pub commits: usize,
    pub rollbacks: usize,
    pub prepares: usize,
    pub readers_opened: usize,
    pub readers_closed: usize,
    /// Connections dropped without an explicit close.
    pub dropped_open: usize,
    /// Scripts in execution order.
    pub executed: Vec<String>,
}

#[derive(Debug, Default)]
struct Table {
    column: String,
    values: Vec<RowValues>,
}

#[derive(Debug, Default)]
struct Script {
    stats: MockStats,
    results: VecDeque<Vec<ResultBuffer>>,
    outputs: HashMap<String, RowValues>,
    failures: Vec<(String, String)>,
    connect_failure: Option<String>,
    begin_failure: Option<String>,
    delay: Option<Duration>,
    table: Option<Table>,
    affected: u64,
}

type Shared = Arc<Mutex<Script>>;

fn lock(shared: &Shared) -> std::sync::MutexGuard<'_, Script> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted stand-in for a native driver.
///
/// Each executed reader command consumes the next queued group of result
/// sets. With a table set, paged commands get the slice their offset and
/// limit parameters select instead.
#[derive(Debug, Clone)]
pub struct MockConnector {
    provider: DatabaseType,
    script: Shared,
}

impl MockConnector {
    #[must_use]
    pub fn new(provider: DatabaseType) -> Self {
        Self {
            provider,
            script: Arc::new(Mutex::new(Script {
                affected: 1,
                ..Script::default()
            })),
        }
    }

    /// Queue the result sets the next reader command returns.
    pub fn push_result(&self, sets: Vec<ResultBuffer>) {
        lock(&self.script).results.push_back(sets);
    }

    /// Value written to output parameter `name` on every execution.
    pub fn set_output(&self, name: &str, value: RowValues) {
        lock(&self.script).outputs.insert(name.to_ascii_lowercase(), value);
    }

    /// Fail any execution whose script contains `pattern`.
    pub fn fail_on(&self, pattern: &str, message: &str) {
        lock(&self.script)
            .failures
            .push((pattern.to_string(), message.to_string()));
    }

    pub fn fail_connect(&self, message: &str) {
        lock(&self.script).connect_failure = Some(message.to_string());
    }

    pub fn fail_begin(&self, message: &str) {
        lock(&self.script).begin_failure = Some(message.to_string());
    }

    /// Delay every connect and execution.
    pub fn set_delay(&self, delay: Duration) {
        lock(&self.script).delay = Some(delay);
    }

    /// Single `Int64` column served by paged commands.
    pub fn set_table(&self, column: &str, values: Vec<RowValues>) {
        lock(&self.script).table = Some(Table {
            column: column.to_string(),
            values,
        });
    }

    /// Row count reported by non-query executions.
    pub fn set_affected(&self, affected: u64) {
        lock(&self.script).affected = affected;
    }

    #[must_use]
    pub fn stats(&self) -> MockStats {
        lock(&self.script).stats.clone()
    }

    #[must_use]
    pub fn executed_scripts(&self) -> Vec<String> {
        lock(&self.script).stats.executed.clone()
    }

    fn delay(&self) -> Option<Duration> {
        lock(&self.script).delay
    }
}

#[async_trait]
impl NativeConnector for MockConnector {
    fn database_type(&self) -> DatabaseType {
        self.provider
    }

    async fn connect(&self) -> Result<Box<dyn NativeConnection>, SqlEngineError> {
        if let Some(delay) = self.delay() {
            tokio::time::sleep(delay).await;
        }
        let mut script = lock(&self.script);
        if let Some(message) = &script.connect_failure {
            return Err(SqlEngineError::ConnectionError(message.clone()));
        }
        script.stats.connects += 1;
        trace!(connects = script.stats.connects, "mock connect");
        Ok(Box::new(MockConnection {
            provider: self.provider,
            script: Arc::clone(&self.script),
            closed: false,
        }))
    }
}

struct MockConnection {
    provider: DatabaseType,
    script: Shared,
    closed: bool,
}

impl MockConnection {
    async fn run(&self, command: &mut NativeCommand) -> Result<Execution, SqlEngineError> {
        let delay = lock(&self.script).delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut script = lock(&self.script);
        script.stats.executed.push(command.script.to_string());
        if let Some((_, message)) = script
            .failures
            .iter()
            .find(|(pattern, _)| command.script.contains(pattern.as_str()))
        {
            return Err(SqlEngineError::ExecutionError(message.clone()));
        }
        for parameter in &mut command.parameters {
            if parameter.direction.is_output()
                && let Some(value) = script.outputs.get(&parameter.name.to_ascii_lowercase())
            {
                parameter.value = value.clone();
            }
        }
        let paged = match (
            command.parameter(PAGING_OFFSET).map(|p| &p.value),
            command.parameter(PAGING_LIMIT).map(|p| &p.value),
            &script.table,
        ) {
            (Some(RowValues::Int(offset)), Some(RowValues::Int(limit)), Some(table)) => {
                let start = usize::try_from(*offset).unwrap_or(0).min(table.values.len());
                let end = start
                    .saturating_add(usize::try_from(*limit).unwrap_or(0))
                    .min(table.values.len());
                Some(
                    ResultBuffer::new(vec![NativeColumn::new(table.column.clone(), ColumnType::Int64)])
                        .with_rows(table.values[start..end].iter().map(|v| vec![v.clone()]).collect()),
                )
            }
            _ => None,
        };
        let sets = match paged {
            Some(set) => vec![set],
            None => script.results.pop_front().unwrap_or_default(),
        };
        Ok(Execution {
            sets,
            affected: script.affected,
        })
    }
}

/// One execution's worth of scripted output.
struct Execution {
    sets: Vec<ResultBuffer>,
    affected: u64,
}

#[async_trait]
impl NativeConnection for MockConnection {
    fn database_type(&self) -> DatabaseType {
        self.provider
    }

    async fn begin(&mut self) -> Result<(), SqlEngineError> {
        let mut script = lock(&self.script);
        if let Some(message) = &script.begin_failure {
            return Err(SqlEngineError::ExecutionError(message.clone()));
        }
        script.stats.begins += 1;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), SqlEngineError> {
        lock(&self.script).stats.commits += 1;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), SqlEngineError> {
        lock(&self.script).stats.rollbacks += 1;
        Ok(())
    }

    async fn prepare(&mut self, _command: &NativeCommand) -> Result<(), SqlEngineError> {
        lock(&self.script).stats.prepares += 1;
        Ok(())
    }

    async fn execute_non_query(&mut self, command: &mut NativeCommand) -> Result<u64, SqlEngineError> {
        Ok(self.run(command).await?.affected)
    }

    async fn execute_reader(
        &mut self,
        command: &mut NativeCommand,
    ) -> Result<Box<dyn NativeReader>, SqlEngineError> {
        let output = self.run(command).await?;
        lock(&self.script).stats.readers_opened += 1;
        let script = Arc::clone(&self.script);
        let reader = BufferedReader::new(output.sets).on_close(move || {
            lock(&script).stats.readers_closed += 1;
        });
        Ok(Box::new(reader))
    }

    async fn close(&mut self) -> Result<(), SqlEngineError> {
        if !self.closed {
            self.closed = true;
            lock(&self.script).stats.closes += 1;
        }
        Ok(())
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            let mut script = lock(&self.script);
            script.stats.closes += 1;
            script.stats.dropped_open += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::int_column;

    #[tokio::test]
    async fn scripted_results_are_served_in_order() {
        let connector = MockConnector::new(DatabaseType::Sqlite);
        connector.push_result(vec![int_column("n", [1, 2])]);
        let mut connection = connector.connect().await.unwrap();
        let mut command = NativeCommand::text("select n from t");
        let mut reader = connection.execute_reader(&mut command).await.unwrap();
        assert!(reader.read().await.unwrap());
        drop(reader);
        let mut empty = connection.execute_reader(&mut command).await.unwrap();
        assert!(empty.columns().is_empty());
        empty.close().await.unwrap();
        drop(connection);

        let stats = connector.stats();
        assert_eq!(stats.readers_opened, 2);
        assert_eq!(stats.readers_closed, 2);
        assert_eq!(stats.closes, 1);
        assert_eq!(stats.executed.len(), 2);
    }

    #[tokio::test]
    async fn failures_match_on_script_text() {
        let connector = MockConnector::new(DatabaseType::Postgres);
        connector.fail_on("missing", "relation \"missing\" does not exist");
        let mut connection = connector.connect().await.unwrap();
        let mut command = NativeCommand::text("select * from missing");
        let err = connection.execute_non_query(&mut command).await.unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }
}
