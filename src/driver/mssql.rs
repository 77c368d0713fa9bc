//! SQL Server adapter over tiberius.
//!
//! Parameters bind positionally to `@P1..@Pn`. tiberius has no output
//! parameter support, so commands with output parameters run as a batch that
//! declares a local per output, executes the script against the locals and
//! selects them back as a trailing result set.

use std::borrow::Cow;
use std::fmt::Write as _;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures_util::TryStreamExt;
use regex::Regex;
use rust_decimal::Decimal;
use tiberius::{Client, ColumnData, Config, FromSql, Query, QueryItem};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, trace};

use super::{
    BufferedReader, ColumnType, NativeColumn, NativeCommand, NativeConnection, NativeConnector,
    NativeParameter, NativeReader, ParameterDirection, ResultBuffer,
};
use crate::error::SqlEngineError;
use crate::provider::{MssqlProfile, ProviderProfile};
use crate::types::{DatabaseType, RowValues};

type MssqlClient = Client<Compat<TcpStream>>;

const ROWS_COLUMN: &str = "__rows";

#[derive(Debug, Clone)]
pub struct MssqlConnector {
    config: Config,
}

impl MssqlConnector {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Connector from an ADO.NET connection string
    /// (`server=tcp:host,1433;user=sa;password=...;TrustServerCertificate=true`).
    ///
    /// # Errors
    /// Returns `SqlEngineError::ConfigError` if the string does not parse.
    pub fn from_ado_string(ado: &str) -> Result<Self, SqlEngineError> {
        let config = Config::from_ado_string(ado)
            .map_err(|e| SqlEngineError::ConfigError(format!("invalid sql server connection string: {e}")))?;
        Ok(Self::new(config))
    }
}

#[async_trait]
impl NativeConnector for MssqlConnector {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Mssql
    }

    async fn connect(&self) -> Result<Box<dyn NativeConnection>, SqlEngineError> {
        let addr = self.config.get_addr();
        let tcp = TcpStream::connect(&addr)
            .await
            .map_err(|e| SqlEngineError::ConnectionError(format!("sql server tcp connect to {addr} failed: {e}")))?;
        tcp.set_nodelay(true)
            .map_err(|e| SqlEngineError::ConnectionError(e.to_string()))?;
        let client = Client::connect(self.config.clone(), tcp.compat_write())
            .await
            .map_err(|e| SqlEngineError::ConnectionError(format!("sql server login failed: {e}")))?;
        debug!(%addr, "sql server connection opened");
        Ok(Box::new(MssqlConnection { client: Some(client) }))
    }
}

pub struct MssqlConnection {
    client: Option<MssqlClient>,
}

impl MssqlConnection {
    fn client(&mut self) -> Result<&mut MssqlClient, SqlEngineError> {
        self.client
            .as_mut()
            .ok_or_else(|| SqlEngineError::ConnectionError("sql server connection is closed".into()))
    }

    async fn simple(&mut self, sql: &str) -> Result<(), SqlEngineError> {
        self.client()?.execute(sql, &[]).await?;
        Ok(())
    }

    /// Run `command`, returning every result set it produced. Output values
    /// and the trailing row count are written back into the command.
    async fn run(&mut self, command: &mut NativeCommand) -> Result<(Vec<ResultBuffer>, Option<u64>), SqlEngineError> {
        let outputs = command.has_output_parameters();
        let script = if outputs {
            output_batch(command)?
        } else {
            command.script.to_string()
        };
        let mut query = Query::new(script);
        for parameter in ordered(&command.parameters) {
            bind(&mut query, parameter.map(|p| &p.value))?;
        }

        let client = self.client()?;
        let mut sets: Vec<ResultBuffer> = Vec::new();
        let mut stream = query.query(client).await?;
        while let Some(item) = stream.try_next().await? {
            match item {
                QueryItem::Metadata(meta) => sets.push(ResultBuffer::new(
                    meta.columns()
                        .iter()
                        .map(|c| NativeColumn::new(c.name(), column_type(c.column_type())))
                        .collect(),
                )),
                QueryItem::Row(row) => {
                    let values = row
                        .cells()
                        .map(|(_, data)| read_value(data))
                        .collect::<Result<Vec<_>, _>>()?;
                    if let Some(set) = sets.last_mut() {
                        set.push(values);
                    }
                }
            }
        }
        drop(stream);

        if !outputs {
            return Ok((sets, None));
        }
        let returned = sets.pop().ok_or_else(|| {
            SqlEngineError::ExecutionError("sql server returned no output parameter values".into())
        })?;
        let affected = apply_outputs(command, &returned);
        Ok((sets, affected))
    }
}

#[async_trait]
impl NativeConnection for MssqlConnection {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Mssql
    }

    async fn begin(&mut self) -> Result<(), SqlEngineError> {
        self.simple("BEGIN TRANSACTION").await
    }

    async fn commit(&mut self) -> Result<(), SqlEngineError> {
        self.simple("COMMIT TRANSACTION").await
    }

    async fn rollback(&mut self) -> Result<(), SqlEngineError> {
        self.simple("IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION").await
    }

    async fn prepare(&mut self, command: &NativeCommand) -> Result<(), SqlEngineError> {
        // sp_executesql plans are cached server-side.
        trace!(script = %command.script, "sql server prepare is implicit");
        Ok(())
    }

    async fn execute_non_query(&mut self, command: &mut NativeCommand) -> Result<u64, SqlEngineError> {
        if command.has_output_parameters() {
            let (_, affected) = self.run(command).await?;
            return Ok(affected.unwrap_or(0));
        }
        let mut query = Query::new(command.script.to_string());
        for parameter in ordered(&command.parameters) {
            bind(&mut query, parameter.map(|p| &p.value))?;
        }
        let result = query.execute(self.client()?).await?;
        Ok(result.total())
    }

    async fn execute_reader(
        &mut self,
        command: &mut NativeCommand,
    ) -> Result<Box<dyn NativeReader>, SqlEngineError> {
        let (sets, affected) = self.run(command).await?;
        Ok(Box::new(if sets.is_empty() {
            BufferedReader::affected_only(affected.unwrap_or(0))
        } else {
            BufferedReader::new(sets)
        }))
    }

    async fn close(&mut self) -> Result<(), SqlEngineError> {
        if let Some(client) = self.client.take() {
            client.close().await?;
            debug!("sql server connection closed");
        }
        Ok(())
    }
}

/// Zero-based slot of an `@PN` marker.
fn marker_slot(marker: &str) -> Option<usize> {
    marker.strip_prefix("@P")?.parse::<usize>().ok()?.checked_sub(1)
}

/// Parameters in `@PN` order; gaps are `None`.
fn ordered(parameters: &[NativeParameter]) -> Vec<Option<&NativeParameter>> {
    let mut slots: Vec<Option<&NativeParameter>> = Vec::with_capacity(parameters.len());
    for (idx, parameter) in parameters.iter().enumerate() {
        let slot = marker_slot(&parameter.marker).unwrap_or(idx);
        if slots.len() <= slot {
            slots.resize(slot + 1, None);
        }
        slots[slot] = Some(parameter);
    }
    slots
}

fn bind(query: &mut Query<'_>, value: Option<&RowValues>) -> Result<(), SqlEngineError> {
    match value.unwrap_or(&RowValues::Null) {
        RowValues::Null => query.bind(Option::<String>::None),
        RowValues::Int(i) => query.bind(*i),
        RowValues::Float(f) => query.bind(*f),
        RowValues::Decimal(d) => query.bind(*d),
        RowValues::Text(s) => query.bind(s.clone()),
        RowValues::Bool(b) => query.bind(*b),
        RowValues::Date(d) => query.bind(*d),
        RowValues::Time(t) => query.bind(*t),
        RowValues::Timestamp(ts) => query.bind(*ts),
        RowValues::Interval(span) => query.bind(span.num_microseconds().ok_or_else(|| {
            SqlEngineError::ParameterError(format!("interval {span} overflows bigint microseconds"))
        })?),
        RowValues::Guid(g) => query.bind(*g),
        RowValues::JSON(j) => query.bind(j.to_string()),
        RowValues::Blob(b) => query.bind(b.clone()),
    }
    Ok(())
}

/// Batch that routes every output marker through a declared local and
/// selects the locals, plus `@@ROWCOUNT`, as the last result set.
fn output_batch(command: &NativeCommand) -> Result<String, SqlEngineError> {
    let profile = MssqlProfile::new();
    let mut prologue = format!("DECLARE @{ROWS_COLUMN} int;\n");
    let mut body = command.script.to_string();
    let mut select = format!("SELECT @{ROWS_COLUMN} AS [{ROWS_COLUMN}]");
    for (idx, parameter) in command.parameters.iter().enumerate() {
        if !parameter.direction.is_output() {
            continue;
        }
        let local = format!("@__out{}", idx + 1);
        let type_name = profile.type_name(
            parameter.value_type,
            parameter.size,
            parameter.precision,
            parameter.scale,
        );
        let initial = if parameter.direction == ParameterDirection::InputOutput {
            format!(" = {}", parameter.marker)
        } else {
            String::new()
        };
        let _ = writeln!(prologue, "DECLARE {local} {type_name}{initial};");
        let pattern = Regex::new(&format!(r"{}\b", regex::escape(&parameter.marker)))
            .map_err(|e| SqlEngineError::ParameterError(e.to_string()))?;
        body = pattern.replace_all(&body, local.as_str()).into_owned();
        let _ = write!(select, ", {local} AS [{}]", parameter.name);
    }
    Ok(format!("{prologue}{body};\nSET @{ROWS_COLUMN} = @@ROWCOUNT;\n{select};"))
}

/// Copy the trailing output row into the command's output parameters and
/// return the captured row count.
fn apply_outputs(command: &mut NativeCommand, returned: &ResultBuffer) -> Option<u64> {
    let row = returned.rows.first()?;
    let values = row.values();
    for parameter in command.parameters.iter_mut().filter(|p| p.direction.is_output()) {
        if let Some(idx) = returned.column_index(&parameter.name)
            && let Some(value) = values.get(idx)
        {
            parameter.value = value.clone();
        }
    }
    match returned.column_index(ROWS_COLUMN).and_then(|idx| values.get(idx)) {
        Some(RowValues::Int(n)) => u64::try_from(*n).ok(),
        _ => None,
    }
}

fn column_type(ty: tiberius::ColumnType) -> ColumnType {
    use tiberius::ColumnType as T;
    match ty {
        T::Bit | T::Bitn => ColumnType::Bool,
        T::Int1 | T::Int2 => ColumnType::Int16,
        T::Int4 => ColumnType::Int32,
        T::Int8 | T::Intn => ColumnType::Int64,
        T::Float4 => ColumnType::Float32,
        T::Float8 | T::Floatn => ColumnType::Float64,
        T::Money | T::Money4 | T::Decimaln | T::Numericn => ColumnType::Decimal,
        T::Guid => ColumnType::Guid,
        T::BigVarChar | T::BigChar | T::NVarchar | T::NChar | T::Xml => ColumnType::Text,
        T::Text | T::NText => ColumnType::LongText,
        T::BigVarBin | T::BigBinary => ColumnType::Binary,
        T::Image => ColumnType::LongBinary,
        T::Daten => ColumnType::Date,
        T::Timen => ColumnType::Time,
        T::Datetime | T::Datetime4 | T::Datetimen | T::Datetime2 | T::DatetimeOffsetn => {
            ColumnType::DateTime
        }
        _ => ColumnType::Dynamic,
    }
}

fn read_value(data: &ColumnData<'static>) -> Result<RowValues, SqlEngineError> {
    let value = match data {
        ColumnData::U8(v) => v.map(|v| RowValues::Int(i64::from(v))),
        ColumnData::I16(v) => v.map(|v| RowValues::Int(i64::from(v))),
        ColumnData::I32(v) => v.map(|v| RowValues::Int(i64::from(v))),
        ColumnData::I64(v) => v.map(RowValues::Int),
        ColumnData::F32(v) => v.map(|v| RowValues::Float(f64::from(v))),
        ColumnData::F64(v) => v.map(RowValues::Float),
        ColumnData::Bit(v) => v.map(RowValues::Bool),
        ColumnData::String(v) => v.as_ref().map(|s: &Cow<'_, str>| RowValues::Text(s.to_string())),
        ColumnData::Guid(v) => v.map(RowValues::Guid),
        ColumnData::Binary(v) => v.as_ref().map(|b| RowValues::Blob(b.to_vec())),
        ColumnData::Numeric(_) => Decimal::from_sql(data)?.map(RowValues::Decimal),
        ColumnData::Date(_) => NaiveDate::from_sql(data)?.map(RowValues::Date),
        ColumnData::Time(_) => NaiveTime::from_sql(data)?.map(RowValues::Time),
        ColumnData::DateTimeOffset(_) => {
            DateTime::<Utc>::from_sql(data)?.map(|v| RowValues::Timestamp(v.naive_utc()))
        }
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            NaiveDateTime::from_sql(data)?.map(RowValues::Timestamp)
        }
        #[allow(unreachable_patterns)]
        _ => {
            return Err(SqlEngineError::ExecutionError(
                "sql server returned a value type this adapter does not read".into(),
            ));
        }
    };
    Ok(value.unwrap_or(RowValues::Null))
}
