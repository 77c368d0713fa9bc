//! SQLite adapter over rusqlite.
//!
//! rusqlite is synchronous, so every call runs on the blocking pool against a
//! connection guarded by an async mutex. Scripts may hold several statements;
//! each one is compiled in turn and bound by its `?N` marker names. Readers
//! pull rows from a blocking task a chunk at a time.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::fallible_iterator::FallibleIterator;
use rusqlite::types::{Value, ValueRef};
use tokio::sync::{Mutex, mpsc};
use tokio::task::{JoinHandle, spawn_blocking};
use tracing::{debug, trace};

use super::{
    BufferedRow, ColumnType, NativeColumn, NativeCommand, NativeConnection, NativeConnector,
    NativeReader, RowCursor,
};
use crate::error::SqlEngineError;
use crate::types::{DatabaseType, RowValues, ValueType};

type SharedConnection = Arc<Mutex<rusqlite::Connection>>;

/// Rows per message from the producing task.
const ROW_CHUNK: usize = 64;
/// Messages the producing task may run ahead of the reader.
const READ_AHEAD: usize = 2;

/// Options for opening `SQLite` connections.
#[derive(Debug, Clone)]
pub struct SqliteOptions {
    pub db_path: String,
    pub busy_timeout: Duration,
    pub wal: bool,
}

impl SqliteOptions {
    #[must_use]
    pub fn new(db_path: String) -> Self {
        Self {
            db_path,
            busy_timeout: Duration::from_secs(5),
            wal: false,
        }
    }

    #[must_use]
    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    /// Switch file databases to write-ahead logging on connect.
    #[must_use]
    pub fn with_wal(mut self, wal: bool) -> Self {
        self.wal = wal;
        self
    }
}

#[derive(Debug, Clone)]
pub struct SqliteConnector {
    options: SqliteOptions,
}

impl SqliteConnector {
    #[must_use]
    pub fn new(options: SqliteOptions) -> Self {
        Self { options }
    }

    #[must_use]
    pub fn options(&self) -> &SqliteOptions {
        &self.options
    }
}

#[async_trait]
impl NativeConnector for SqliteConnector {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Sqlite
    }

    async fn connect(&self) -> Result<Box<dyn NativeConnection>, SqlEngineError> {
        let options = self.options.clone();
        let conn = spawn_blocking(move || -> Result<rusqlite::Connection, SqlEngineError> {
            let conn = rusqlite::Connection::open(&options.db_path).map_err(|e| {
                SqlEngineError::ConnectionError(format!(
                    "failed to open sqlite database {}: {e}",
                    options.db_path
                ))
            })?;
            conn.busy_timeout(options.busy_timeout)?;
            if options.wal && options.db_path != ":memory:" {
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
            }
            Ok(conn)
        })
        .await
        .map_err(|e| SqlEngineError::ConnectionError(format!("sqlite spawn_blocking join error: {e}")))??;
        debug!(path = %self.options.db_path, "sqlite connection opened");
        Ok(Box::new(SqliteConnection {
            conn: Some(Arc::new(Mutex::new(conn))),
        }))
    }
}

pub struct SqliteConnection {
    conn: Option<SharedConnection>,
}

impl fmt::Debug for SqliteConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteConnection")
            .field("open", &self.conn.is_some())
            .finish()
    }
}

impl SqliteConnection {
    fn handle(&self) -> Result<SharedConnection, SqlEngineError> {
        self.conn
            .clone()
            .ok_or_else(|| SqlEngineError::ConnectionError("sqlite connection is closed".into()))
    }

    async fn batch(&self, sql: &'static str) -> Result<(), SqlEngineError> {
        run_blocking(self.handle()?, move |conn| {
            conn.execute_batch(sql)?;
            Ok(())
        })
        .await
    }
}

/// Run `func` on the blocking pool with the connection locked.
async fn run_blocking<F, R>(conn: SharedConnection, func: F) -> Result<R, SqlEngineError>
where
    F: FnOnce(&mut rusqlite::Connection) -> Result<R, SqlEngineError> + Send + 'static,
    R: Send + 'static,
{
    spawn_blocking(move || {
        let mut guard = conn.blocking_lock();
        func(&mut guard)
    })
    .await
    .map_err(|e| SqlEngineError::ExecutionError(format!("sqlite spawn_blocking join error: {e}")))?
}

#[async_trait]
impl NativeConnection for SqliteConnection {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Sqlite
    }

    async fn begin(&mut self) -> Result<(), SqlEngineError> {
        self.batch("BEGIN").await
    }

    async fn commit(&mut self) -> Result<(), SqlEngineError> {
        self.batch("COMMIT").await
    }

    async fn rollback(&mut self) -> Result<(), SqlEngineError> {
        self.batch("ROLLBACK").await
    }

    async fn prepare(&mut self, command: &NativeCommand) -> Result<(), SqlEngineError> {
        let script = Arc::clone(&command.script);
        run_blocking(self.handle()?, move |conn| {
            let mut batch = rusqlite::Batch::new(conn, &script);
            let mut statements = 0_usize;
            while batch.next()?.is_some() {
                statements += 1;
            }
            trace!(statements, "sqlite script compiled");
            Ok(())
        })
        .await
    }

    async fn execute_non_query(&mut self, command: &mut NativeCommand) -> Result<u64, SqlEngineError> {
        let command = command.clone();
        run_blocking(self.handle()?, move |conn| run_script(conn, &command)).await
    }

    async fn execute_reader(
        &mut self,
        command: &mut NativeCommand,
    ) -> Result<Box<dyn NativeReader>, SqlEngineError> {
        let reader = SqliteReader::open(self.handle()?, command.clone()).await?;
        Ok(Box::new(reader))
    }

    async fn close(&mut self) -> Result<(), SqlEngineError> {
        let Some(shared) = self.conn.take() else {
            return Ok(());
        };
        spawn_blocking(move || match Arc::try_unwrap(shared) {
            Ok(mutex) => mutex
                .into_inner()
                .close()
                .map_err(|(_, e)| SqlEngineError::SqliteError(e)),
            Err(_) => Ok(()),
        })
        .await
        .map_err(|e| SqlEngineError::ExecutionError(format!("sqlite spawn_blocking join error: {e}")))??;
        debug!("sqlite connection closed");
        Ok(())
    }
}

/// Execute every statement of `command`, stepping through and discarding
/// any rows. Returns the summed change count.
fn run_script(conn: &rusqlite::Connection, command: &NativeCommand) -> Result<u64, SqlEngineError> {
    let mut affected = 0_u64;
    let mut statements = 0_usize;
    let mut batch = rusqlite::Batch::new(conn, &command.script);
    while let Some(mut stmt) = batch.next()? {
        statements += 1;
        bind_statement(&mut stmt, command)?;
        if stmt.column_count() == 0 {
            affected += stmt.raw_execute()? as u64;
            continue;
        }
        let mut rows = stmt.raw_query();
        while rows.next()?.is_some() {}
    }
    trace!(statements, affected, "sqlite script executed");
    Ok(affected)
}

/// What the producing task hands a [`SqliteReader`].
#[derive(Debug)]
enum Fetched {
    Set(Vec<NativeColumn>),
    Rows(Vec<Vec<RowValues>>),
    SetEnd,
    Affected(u64),
}

type FetchSender = mpsc::Sender<Result<Fetched, SqlEngineError>>;

/// False once the reader has gone away.
fn deliver(tx: &FetchSender, fetched: Fetched) -> bool {
    tx.blocking_send(Ok(fetched)).is_ok()
}

/// Walk every statement of `command`, sending result sets a chunk of rows at
/// a time. Stops early when the reader is closed or dropped.
fn stream_script(
    conn: &rusqlite::Connection,
    command: &NativeCommand,
    tx: &FetchSender,
) -> Result<(), SqlEngineError> {
    let mut batch = rusqlite::Batch::new(conn, &command.script);
    while let Some(mut stmt) = batch.next()? {
        bind_statement(&mut stmt, command)?;
        if stmt.column_count() == 0 {
            let affected = stmt.raw_execute()? as u64;
            if !deliver(tx, Fetched::Affected(affected)) {
                return Ok(());
            }
            continue;
        }
        let columns: Vec<NativeColumn> = stmt
            .columns()
            .iter()
            .map(|c| NativeColumn::new(c.name(), column_type(c.decl_type())))
            .collect();
        let width = columns.len();
        if !deliver(tx, Fetched::Set(columns)) {
            return Ok(());
        }
        let mut chunk = Vec::with_capacity(ROW_CHUNK);
        let mut rows = stmt.raw_query();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(width);
            for idx in 0..width {
                values.push(from_value_ref(row.get_ref(idx)?));
            }
            chunk.push(values);
            if chunk.len() == ROW_CHUNK {
                let full = std::mem::replace(&mut chunk, Vec::with_capacity(ROW_CHUNK));
                if !deliver(tx, Fetched::Rows(full)) {
                    return Ok(());
                }
            }
        }
        if !chunk.is_empty() && !deliver(tx, Fetched::Rows(chunk)) {
            return Ok(());
        }
        if !deliver(tx, Fetched::SetEnd) {
            return Ok(());
        }
    }
    Ok(())
}

/// Reader fed by a blocking task that steps the script's statements. The
/// task holds the connection until the script ends or the reader closes,
/// and never runs more than a few chunks ahead of [`read`](NativeReader::read).
#[derive(Debug)]
pub struct SqliteReader {
    fetched: mpsc::Receiver<Result<Fetched, SqlEngineError>>,
    producer: Option<JoinHandle<()>>,
    columns: Vec<NativeColumn>,
    pending: VecDeque<BufferedRow>,
    row: Option<BufferedRow>,
    in_set: bool,
    affected: u64,
    closed: bool,
}

impl SqliteReader {
    /// Start the script and position on its first result set.
    async fn open(conn: SharedConnection, command: NativeCommand) -> Result<Self, SqlEngineError> {
        let (tx, fetched) = mpsc::channel(READ_AHEAD);
        let producer = spawn_blocking(move || {
            let guard = conn.blocking_lock();
            if let Err(error) = stream_script(&guard, &command, &tx)
                && tx.blocking_send(Err(error)).is_err()
            {
                trace!("sqlite reader closed before its error was delivered");
            }
        });
        let mut reader = Self {
            fetched,
            producer: Some(producer),
            columns: Vec::new(),
            pending: VecDeque::new(),
            row: None,
            in_set: false,
            affected: 0,
            closed: false,
        };
        reader.next_set().await?;
        Ok(reader)
    }

    async fn recv(&mut self) -> Result<Option<Fetched>, SqlEngineError> {
        match self.fetched.recv().await {
            Some(fetched) => fetched.map(Some),
            None => Ok(None),
        }
    }

    /// Move to the next set header, counting non-query statements on the way.
    async fn next_set(&mut self) -> Result<bool, SqlEngineError> {
        loop {
            match self.recv().await? {
                Some(Fetched::Set(columns)) => {
                    self.columns = columns;
                    self.in_set = true;
                    return Ok(true);
                }
                Some(Fetched::Affected(affected)) => self.affected += affected,
                Some(Fetched::Rows(_) | Fetched::SetEnd) => {}
                None => {
                    self.columns.clear();
                    return Ok(false);
                }
            }
        }
    }
}

#[async_trait]
impl NativeReader for SqliteReader {
    fn columns(&self) -> &[NativeColumn] {
        &self.columns
    }

    async fn read(&mut self) -> Result<bool, SqlEngineError> {
        if self.closed {
            return Ok(false);
        }
        loop {
            if let Some(row) = self.pending.pop_front() {
                self.row = Some(row);
                return Ok(true);
            }
            self.row = None;
            if !self.in_set {
                return Ok(false);
            }
            match self.recv().await? {
                Some(Fetched::Rows(rows)) => self.pending.extend(rows.into_iter().map(BufferedRow::new)),
                Some(Fetched::Affected(affected)) => self.affected += affected,
                Some(Fetched::SetEnd) | None => self.in_set = false,
                Some(Fetched::Set(_)) => {
                    return Err(SqlEngineError::ExecutionError(
                        "sqlite result set started before the previous one ended".into(),
                    ));
                }
            }
        }
    }

    fn current(&self) -> Option<&dyn RowCursor> {
        self.row.as_ref().map(|r| r as &dyn RowCursor)
    }

    async fn next_result(&mut self) -> Result<bool, SqlEngineError> {
        self.row = None;
        self.pending.clear();
        if self.closed {
            return Ok(false);
        }
        while self.in_set {
            match self.recv().await? {
                Some(Fetched::SetEnd) | None => self.in_set = false,
                Some(Fetched::Affected(affected)) => self.affected += affected,
                Some(Fetched::Rows(_) | Fetched::Set(_)) => {}
            }
        }
        self.next_set().await
    }

    fn records_affected(&self) -> u64 {
        self.affected
    }

    async fn close(&mut self) -> Result<(), SqlEngineError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.in_set = false;
        self.row = None;
        self.pending.clear();
        self.fetched.close();
        if let Some(producer) = self.producer.take() {
            producer
                .await
                .map_err(|e| SqlEngineError::ExecutionError(format!("sqlite reader task failed: {e}")))?;
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Bind each `?N` slot of `stmt` to the command parameter carrying that
/// marker. Slots no parameter claims stay `NULL`.
fn bind_statement(stmt: &mut rusqlite::Statement<'_>, command: &NativeCommand) -> Result<(), SqlEngineError> {
    for slot in 1..=stmt.parameter_count() {
        let parameter = match stmt.parameter_name(slot) {
            Some(marker) => command
                .parameters
                .iter()
                .find(|p| p.direction.is_input() && p.marker == marker),
            None => command.parameters.get(slot - 1),
        };
        if let Some(parameter) = parameter {
            stmt.raw_bind_parameter(slot, to_sqlite_value(&parameter.value)?)?;
        }
    }
    Ok(())
}

/// Storage form of a bound value.
fn to_sqlite_value(value: &RowValues) -> Result<Value, SqlEngineError> {
    Ok(match value {
        RowValues::Int(i) => Value::Integer(*i),
        RowValues::Float(f) => Value::Real(*f),
        RowValues::Decimal(d) => Value::Text(d.to_string()),
        RowValues::Text(s) => Value::Text(s.clone()),
        RowValues::Bool(b) => Value::Integer(i64::from(*b)),
        RowValues::Date(d) => Value::Text(d.format("%F").to_string()),
        RowValues::Time(t) => Value::Text(t.format("%T%.f").to_string()),
        RowValues::Timestamp(ts) => Value::Text(ts.format("%F %T%.f").to_string()),
        RowValues::Interval(span) => Value::Integer(span.num_microseconds().ok_or_else(|| {
            SqlEngineError::ConversionError {
                from: format!("interval {span}"),
                to: ValueType::Interval,
            }
        })?),
        RowValues::Guid(g) => Value::Text(g.hyphenated().to_string()),
        RowValues::Null => Value::Null,
        RowValues::JSON(j) => Value::Text(j.to_string()),
        RowValues::Blob(b) => Value::Blob(b.clone()),
    })
}

fn from_value_ref(value: ValueRef<'_>) -> RowValues {
    match value {
        ValueRef::Null => RowValues::Null,
        ValueRef::Integer(i) => RowValues::Int(i),
        ValueRef::Real(f) => RowValues::Float(f),
        ValueRef::Text(t) => RowValues::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => RowValues::Blob(b.to_vec()),
    }
}

/// Column type implied by a declared type, following SQLite's affinity
/// substrings plus the common date, boolean and identifier spellings.
fn column_type(decl: Option<&str>) -> ColumnType {
    let Some(decl) = decl else {
        return ColumnType::Dynamic;
    };
    let decl = decl.to_ascii_uppercase();
    let has = |needle: &str| decl.contains(needle);
    if has("BOOL") {
        ColumnType::Bool
    } else if has("DATETIME") || has("TIMESTAMP") {
        ColumnType::DateTime
    } else if has("DATE") {
        ColumnType::Date
    } else if has("TIME") {
        ColumnType::Time
    } else if has("INT") {
        ColumnType::Int64
    } else if has("UUID") || has("GUID") {
        ColumnType::Guid
    } else if has("JSON") {
        ColumnType::Json
    } else if has("CLOB") {
        ColumnType::LongText
    } else if has("CHAR") || has("TEXT") {
        ColumnType::Text
    } else if has("BLOB") {
        ColumnType::Binary
    } else if has("REAL") || has("FLOA") || has("DOUB") {
        ColumnType::Float64
    } else if has("DEC") || has("NUMERIC") {
        ColumnType::Decimal
    } else {
        ColumnType::Dynamic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{NativeAccessor, NativeParameter, ParameterDirection};

    fn memory() -> SqliteConnector {
        SqliteConnector::new(SqliteOptions::new(":memory:".into()))
    }

    fn param(name: &str, marker: &str, value: RowValues) -> NativeParameter {
        NativeParameter {
            name: name.into(),
            marker: marker.into(),
            value,
            direction: ParameterDirection::Input,
            value_type: ValueType::I64,
            type_code: 0,
            size: None,
            precision: None,
            scale: None,
        }
    }

    #[test]
    fn declared_types_map_by_affinity() {
        assert_eq!(column_type(Some("INTEGER")), ColumnType::Int64);
        assert_eq!(column_type(Some("varchar(20)")), ColumnType::Text);
        assert_eq!(column_type(Some("DATETIME")), ColumnType::DateTime);
        assert_eq!(column_type(Some("date")), ColumnType::Date);
        assert_eq!(column_type(Some("BOOLEAN")), ColumnType::Bool);
        assert_eq!(column_type(Some("NUMERIC(10,2)")), ColumnType::Decimal);
        assert_eq!(column_type(Some("CLOB")), ColumnType::LongText);
        assert_eq!(column_type(None), ColumnType::Dynamic);
    }

    #[tokio::test]
    async fn scripts_run_statement_by_statement() {
        let mut conn = memory().connect().await.unwrap();
        let mut ddl = NativeCommand::text(
            "create table t (id integer not null, label text); \
             insert into t values (1, 'a'); insert into t values (2, 'b');",
        );
        assert_eq!(conn.execute_non_query(&mut ddl).await.unwrap(), 2);

        let mut query = NativeCommand::text("select id, label from t where id >= ?1 order by id");
        query.parameters.push(param("min", "?1", RowValues::Int(2)));
        let mut reader = conn.execute_reader(&mut query).await.unwrap();
        assert_eq!(reader.columns()[0].column_type, ColumnType::Int64);
        assert!(reader.read().await.unwrap());
        let row = reader.current().unwrap();
        assert_eq!(row.read(1, NativeAccessor::String).unwrap(), RowValues::Text("b".into()));
        assert!(!reader.read().await.unwrap());
        reader.close().await.unwrap();
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn multiple_selects_become_multiple_result_sets() {
        let mut conn = memory().connect().await.unwrap();
        let mut command = NativeCommand::text("select 1 as a; select 'x' as b, ?2 as c;");
        command.parameters.push(param("p", "?1", RowValues::Int(7)));
        command.parameters.push(param("q", "?2", RowValues::Bool(true)));
        let mut reader = conn.execute_reader(&mut command).await.unwrap();
        assert_eq!(reader.columns()[0].name, "a");
        assert!(reader.next_result().await.unwrap());
        assert_eq!(reader.columns().len(), 2);
        assert!(reader.read().await.unwrap());
        let row = reader.current().unwrap();
        assert_eq!(row.read(1, NativeAccessor::Value).unwrap(), RowValues::Int(1));
    }

    #[tokio::test]
    async fn readers_pull_rows_lazily_and_free_the_connection() {
        let mut conn = memory().connect().await.unwrap();
        let mut series = NativeCommand::text(
            "with recursive s(n) as (select 1 union all select n + 1 from s where n < 1000000) select n from s",
        );
        let mut reader = conn.execute_reader(&mut series).await.unwrap();
        for expected in 1..=3 {
            assert!(reader.read().await.unwrap());
            assert_eq!(
                reader.current().unwrap().read(0, NativeAccessor::Int64).unwrap(),
                RowValues::Int(expected)
            );
        }
        reader.close().await.unwrap();
        assert!(!reader.read().await.unwrap());

        drop(conn.execute_reader(&mut series).await.unwrap());
        let mut answer = NativeCommand::text("select 42");
        let mut reader = conn.execute_reader(&mut answer).await.unwrap();
        assert!(reader.read().await.unwrap());
        assert_eq!(
            reader.current().unwrap().read(0, NativeAccessor::Int64).unwrap(),
            RowValues::Int(42)
        );
        reader.close().await.unwrap();
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn statements_ahead_of_a_set_count_as_affected() {
        let mut conn = memory().connect().await.unwrap();
        let mut command = NativeCommand::text(
            "create table t (n integer); insert into t values (1), (2); select n from t; select * from missing_table",
        );
        let mut reader = conn.execute_reader(&mut command).await.unwrap();
        assert_eq!(reader.records_affected(), 2);
        assert!(reader.read().await.unwrap());
        assert!(reader.read().await.unwrap());
        assert!(!reader.read().await.unwrap());
        assert!(matches!(
            reader.next_result().await,
            Err(SqlEngineError::SqliteError(_))
        ));
        reader.close().await.unwrap();
    }

    #[tokio::test]
    async fn rollback_discards_changes() {
        let mut conn = memory().connect().await.unwrap();
        let mut ddl = NativeCommand::text("create table t (n integer)");
        conn.execute_non_query(&mut ddl).await.unwrap();
        conn.begin().await.unwrap();
        let mut insert = NativeCommand::text("insert into t values (1)");
        conn.execute_non_query(&mut insert).await.unwrap();
        conn.rollback().await.unwrap();

        let mut count = NativeCommand::text("select count(*) from t");
        let mut reader = conn.execute_reader(&mut count).await.unwrap();
        assert!(reader.read().await.unwrap());
        assert_eq!(
            reader.current().unwrap().read(0, NativeAccessor::Int64).unwrap(),
            RowValues::Int(0)
        );
    }

    #[tokio::test]
    async fn prepare_reports_syntax_errors() {
        let mut conn = memory().connect().await.unwrap();
        let command = NativeCommand::text("selec nothing");
        assert!(matches!(
            conn.prepare(&command).await,
            Err(SqlEngineError::SqliteError(_))
        ));
    }
}
