//! PostgreSQL adapter over tokio-postgres.
//!
//! Parameterized commands go through the extended protocol with `$N`
//! markers, and their rows are pulled from the server's row stream as the
//! reader advances. Scripts without parameters that hold several statements
//! go through the simple protocol so every statement's rows come back as
//! their own result set.

use std::collections::HashMap;
use std::error::Error;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use tokio_postgres::types::{FromSql, IsNull, ToSql, Type, to_sql_checked};
use tokio_postgres::{Client, Config, NoTls, Row, RowStream, SimpleQueryMessage, Statement};
use tokio_util::bytes::{BufMut, BytesMut};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::{
    BufferedReader, BufferedRow, ColumnType, NativeColumn, NativeCommand, NativeConnection,
    NativeConnector, NativeReader, ResultBuffer, RowCursor,
};
use crate::error::SqlEngineError;
use crate::provider::ProviderTypeCode;
use crate::translation::scan_script;
use crate::types::{DatabaseType, RowValues};

static NULL: RowValues = RowValues::Null;

type BoxError = Box<dyn Error + Sync + Send>;

/// Prepared statements are typed, so one script prepared with different
/// parameter types is a different statement.
type StatementKey = (Arc<str>, Vec<ProviderTypeCode>);

fn statement_key(command: &NativeCommand) -> StatementKey {
    let codes = command
        .parameters
        .iter()
        .filter(|p| p.direction.is_input())
        .map(|p| p.type_code)
        .collect();
    (Arc::clone(&command.script), codes)
}

#[derive(Debug, Clone)]
pub struct PostgresConnector {
    config: Config,
}

impl PostgresConnector {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

#[async_trait]
impl NativeConnector for PostgresConnector {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Postgres
    }

    async fn connect(&self) -> Result<Box<dyn NativeConnection>, SqlEngineError> {
        debug!(
            hosts = ?self.config.get_hosts(),
            db = ?self.config.get_dbname(),
            user = ?self.config.get_user(),
            "postgres connect start"
        );
        let (client, connection) = self
            .config
            .connect(NoTls)
            .await
            .map_err(|e| SqlEngineError::ConnectionError(format!("postgres connect failed: {e}")))?;
        tokio::spawn(async move {
            if let Err(error) = connection.await {
                warn!(error = %error, "postgres connection task ended with an error");
            }
        });
        Ok(Box::new(PostgresConnection {
            client: Some(client),
            statements: HashMap::new(),
        }))
    }
}

pub struct PostgresConnection {
    client: Option<Client>,
    statements: HashMap<StatementKey, Statement>,
}

impl PostgresConnection {
    fn client(&self) -> Result<&Client, SqlEngineError> {
        self.client
            .as_ref()
            .ok_or_else(|| SqlEngineError::ConnectionError("postgres connection is closed".into()))
    }

    /// Cached statement for a prepared command, otherwise a fresh one typed
    /// from the declared parameter codes.
    async fn statement(&mut self, command: &NativeCommand) -> Result<Statement, SqlEngineError> {
        let key = statement_key(command);
        if let Some(statement) = self.statements.get(&key) {
            return Ok(statement.clone());
        }
        let client = self.client()?;
        let statement = match declared_types(command) {
            Some(types) => client.prepare_typed(&command.script, &types).await?,
            None => client.prepare(&command.script).await?,
        };
        if command.prepared {
            self.statements.insert(key, statement.clone());
        }
        Ok(statement)
    }

    async fn simple(&self, script: &str) -> Result<(Vec<ResultBuffer>, u64), SqlEngineError> {
        let messages = self.client()?.simple_query(script).await?;
        let mut sets = Vec::new();
        let mut current: Option<ResultBuffer> = None;
        let mut affected = 0_u64;
        for message in messages {
            match message {
                SimpleQueryMessage::RowDescription(columns) => {
                    current = Some(ResultBuffer::new(
                        columns
                            .iter()
                            .map(|c| NativeColumn::new(c.name(), ColumnType::Text))
                            .collect(),
                    ));
                }
                SimpleQueryMessage::Row(row) => {
                    let set = current.get_or_insert_with(|| {
                        ResultBuffer::new(
                            row.columns()
                                .iter()
                                .map(|c| NativeColumn::new(c.name(), ColumnType::Text))
                                .collect(),
                        )
                    });
                    let values = (0..row.len())
                        .map(|idx| {
                            row.get(idx)
                                .map_or(RowValues::Null, |text| RowValues::Text(text.to_string()))
                        })
                        .collect();
                    set.push(values);
                }
                SimpleQueryMessage::CommandComplete(count) => match current.take() {
                    Some(set) => sets.push(set),
                    None => affected += count,
                },
                _ => {}
            }
        }
        if let Some(set) = current {
            sets.push(set);
        }
        Ok((sets, affected))
    }
}

#[async_trait]
impl NativeConnection for PostgresConnection {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Postgres
    }

    async fn begin(&mut self) -> Result<(), SqlEngineError> {
        Ok(self.client()?.batch_execute("BEGIN").await?)
    }

    async fn commit(&mut self) -> Result<(), SqlEngineError> {
        Ok(self.client()?.batch_execute("COMMIT").await?)
    }

    async fn rollback(&mut self) -> Result<(), SqlEngineError> {
        Ok(self.client()?.batch_execute("ROLLBACK").await?)
    }

    async fn prepare(&mut self, command: &NativeCommand) -> Result<(), SqlEngineError> {
        if is_multi_statement(&command.script) {
            return Ok(());
        }
        let mut command = command.clone();
        command.prepared = true;
        self.statement(&command).await?;
        trace!(cached = self.statements.len(), "postgres statement prepared");
        Ok(())
    }

    async fn execute_non_query(&mut self, command: &mut NativeCommand) -> Result<u64, SqlEngineError> {
        if command.parameters.is_empty() && is_multi_statement(&command.script) {
            let (_, affected) = self.simple(&command.script).await?;
            return Ok(affected);
        }
        let statement = self.statement(command).await?;
        let values = ordered_values(command);
        let params: Vec<&(dyn ToSql + Sync)> = values.iter().map(|v| *v as &(dyn ToSql + Sync)).collect();
        Ok(self.client()?.execute(&statement, &params).await?)
    }

    async fn execute_reader(
        &mut self,
        command: &mut NativeCommand,
    ) -> Result<Box<dyn NativeReader>, SqlEngineError> {
        if command.parameters.is_empty() && is_multi_statement(&command.script) {
            let (sets, affected) = self.simple(&command.script).await?;
            return Ok(Box::new(if sets.is_empty() {
                BufferedReader::affected_only(affected)
            } else {
                BufferedReader::new(sets)
            }));
        }
        let statement = self.statement(command).await?;
        let values = ordered_values(command);
        if statement.columns().is_empty() {
            let params: Vec<&(dyn ToSql + Sync)> = values.iter().map(|v| *v as &(dyn ToSql + Sync)).collect();
            let affected = self.client()?.execute(&statement, &params).await?;
            return Ok(Box::new(BufferedReader::affected_only(affected)));
        }
        let columns = statement
            .columns()
            .iter()
            .map(|c| NativeColumn::new(c.name(), column_type(c.type_())))
            .collect();
        let rows = self.client()?.query_raw(&statement, values).await?;
        trace!("postgres row stream opened");
        Ok(Box::new(PostgresReader::new(columns, rows)))
    }

    async fn close(&mut self) -> Result<(), SqlEngineError> {
        self.statements.clear();
        if self.client.take().is_some() {
            debug!("postgres connection closed");
        }
        Ok(())
    }
}

/// More than one top-level statement. Terminators inside literals, quoted
/// identifiers, dollar-quoted bodies and comments do not count.
fn is_multi_statement(script: &str) -> bool {
    scan_script(script, &[]).is_multi_statement()
}

/// Single result set read from the server's row stream one row at a time.
pub struct PostgresReader {
    columns: Vec<NativeColumn>,
    rows: Option<Pin<Box<RowStream>>>,
    row: Option<BufferedRow>,
    affected: u64,
    closed: bool,
}

impl PostgresReader {
    fn new(columns: Vec<NativeColumn>, rows: RowStream) -> Self {
        Self {
            columns,
            rows: Some(Box::pin(rows)),
            row: None,
            affected: 0,
            closed: false,
        }
    }
}

impl std::fmt::Debug for PostgresReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresReader")
            .field("columns", &self.columns)
            .field("streaming", &self.rows.is_some())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl NativeReader for PostgresReader {
    fn columns(&self) -> &[NativeColumn] {
        &self.columns
    }

    async fn read(&mut self) -> Result<bool, SqlEngineError> {
        self.row = None;
        let Some(rows) = self.rows.as_mut() else {
            return Ok(false);
        };
        let next = rows.next().await;
        match next {
            Some(row) => {
                self.row = Some(BufferedRow::new(read_row(&row?)?));
                Ok(true)
            }
            None => {
                self.affected = rows.rows_affected().unwrap_or(0);
                self.rows = None;
                Ok(false)
            }
        }
    }

    fn current(&self) -> Option<&dyn RowCursor> {
        self.row.as_ref().map(|r| r as &dyn RowCursor)
    }

    async fn next_result(&mut self) -> Result<bool, SqlEngineError> {
        self.row = None;
        self.rows = None;
        self.columns.clear();
        Ok(false)
    }

    fn records_affected(&self) -> u64 {
        self.affected
    }

    async fn close(&mut self) -> Result<(), SqlEngineError> {
        self.closed = true;
        self.row = None;
        self.rows = None;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Parameter types taken from the declared type codes (OIDs), when every
/// parameter has one.
fn declared_types(command: &NativeCommand) -> Option<Vec<Type>> {
    let mut slots: Vec<Option<Type>> = Vec::new();
    for parameter in command.parameters.iter().filter(|p| p.direction.is_input()) {
        let slot = marker_slot(&parameter.marker)?;
        if slots.len() <= slot {
            slots.resize(slot + 1, None);
        }
        let oid = u32::try_from(parameter.type_code).ok()?;
        slots[slot] = Some(Type::from_oid(oid)?);
    }
    slots.into_iter().collect()
}

/// Zero-based slot of a `$N` marker.
fn marker_slot(marker: &str) -> Option<usize> {
    marker.strip_prefix('$')?.parse::<usize>().ok()?.checked_sub(1)
}

/// Values in `$N` order. Slots with no parameter bind `NULL`.
fn ordered_values(command: &NativeCommand) -> Vec<&RowValues> {
    let mut values: Vec<&RowValues> = Vec::with_capacity(command.parameters.len());
    for (idx, parameter) in command
        .parameters
        .iter()
        .enumerate()
        .filter(|(_, p)| p.direction.is_input())
    {
        let slot = marker_slot(&parameter.marker).unwrap_or(idx);
        if values.len() <= slot {
            values.resize(slot + 1, &NULL);
        }
        values[slot] = &parameter.value;
    }
    values
}

fn column_type(ty: &Type) -> ColumnType {
    match *ty {
        Type::BOOL => ColumnType::Bool,
        Type::INT2 => ColumnType::Int16,
        Type::INT4 => ColumnType::Int32,
        Type::INT8 => ColumnType::Int64,
        Type::FLOAT4 => ColumnType::Float32,
        Type::FLOAT8 => ColumnType::Float64,
        Type::NUMERIC => ColumnType::Decimal,
        Type::DATE => ColumnType::Date,
        Type::TIME => ColumnType::Time,
        Type::TIMESTAMP | Type::TIMESTAMPTZ => ColumnType::DateTime,
        Type::INTERVAL => ColumnType::Interval,
        Type::UUID => ColumnType::Guid,
        Type::BYTEA => ColumnType::Binary,
        Type::JSON | Type::JSONB => ColumnType::Json,
        _ => ColumnType::Text,
    }
}

fn read_row(row: &Row) -> Result<Vec<RowValues>, SqlEngineError> {
    (0..row.len()).map(|idx| read_value(row, idx)).collect()
}

fn read_value(row: &Row, idx: usize) -> Result<RowValues, SqlEngineError> {
    let ty = row.columns()[idx].type_().clone();
    let value = match ty {
        Type::BOOL => row.try_get::<_, Option<bool>>(idx)?.map(RowValues::Bool),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(idx)?
            .map(|v| RowValues::Int(i64::from(v))),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(idx)?
            .map(|v| RowValues::Int(i64::from(v))),
        Type::INT8 => row.try_get::<_, Option<i64>>(idx)?.map(RowValues::Int),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)?
            .map(|v| RowValues::Float(f64::from(v))),
        Type::FLOAT8 => row.try_get::<_, Option<f64>>(idx)?.map(RowValues::Float),
        Type::NUMERIC => row.try_get::<_, Option<Decimal>>(idx)?.map(RowValues::Decimal),
        Type::DATE => row.try_get::<_, Option<NaiveDate>>(idx)?.map(RowValues::Date),
        Type::TIME => row.try_get::<_, Option<NaiveTime>>(idx)?.map(RowValues::Time),
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(idx)?
            .map(RowValues::Timestamp),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)?
            .map(|v| RowValues::Timestamp(v.naive_utc())),
        Type::INTERVAL => row
            .try_get::<_, Option<PgInterval>>(idx)?
            .map(|v| RowValues::Interval(v.0)),
        Type::UUID => row.try_get::<_, Option<Uuid>>(idx)?.map(RowValues::Guid),
        Type::BYTEA => row.try_get::<_, Option<Vec<u8>>>(idx)?.map(RowValues::Blob),
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<serde_json::Value>>(idx)?
            .map(RowValues::JSON),
        _ => row
            .try_get::<_, Option<RawText>>(idx)?
            .map(|v| RowValues::Text(v.0)),
    };
    Ok(value.unwrap_or(RowValues::Null))
}

/// Binary `interval`: microseconds, days, months. Months count as 30 days.
struct PgInterval(TimeDelta);

impl<'a> FromSql<'a> for PgInterval {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        if raw.len() != 16 {
            return Err(format!("invalid interval length {}", raw.len()).into());
        }
        let micros = i64::from_be_bytes(raw[0..8].try_into()?);
        let days = i32::from_be_bytes(raw[8..12].try_into()?);
        let months = i32::from_be_bytes(raw[12..16].try_into()?);
        Ok(Self(
            TimeDelta::microseconds(micros) + TimeDelta::days(i64::from(days) + i64::from(months) * 30),
        ))
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::INTERVAL
    }
}

/// Text of any column whose binary form is its text (`refcursor`, enums,
/// domains over text).
struct RawText(String);

impl<'a> FromSql<'a> for RawText {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        Ok(Self(String::from_utf8_lossy(raw).into_owned()))
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

fn is_text(ty: &Type) -> bool {
    matches!(*ty, Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN)
}

impl ToSql for RowValues {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        match self {
            RowValues::Null => Ok(IsNull::Yes),
            RowValues::Int(i) => match *ty {
                Type::INT2 => i16::try_from(*i)?.to_sql_checked(ty, out),
                Type::INT4 => i32::try_from(*i)?.to_sql_checked(ty, out),
                #[allow(clippy::cast_precision_loss)]
                Type::FLOAT4 => (*i as f32).to_sql_checked(ty, out),
                #[allow(clippy::cast_precision_loss)]
                Type::FLOAT8 => (*i as f64).to_sql_checked(ty, out),
                Type::NUMERIC => Decimal::from(*i).to_sql_checked(ty, out),
                Type::BOOL => (*i != 0).to_sql_checked(ty, out),
                Type::INTERVAL => encode_interval(TimeDelta::microseconds(*i), out),
                ref t if is_text(t) => i.to_string().to_sql_checked(ty, out),
                _ => i.to_sql_checked(ty, out),
            },
            RowValues::Float(f) => match *ty {
                #[allow(clippy::cast_possible_truncation)]
                Type::FLOAT4 => (*f as f32).to_sql_checked(ty, out),
                Type::NUMERIC => Decimal::from_f64(*f)
                    .ok_or_else(|| format!("{f} does not fit numeric"))?
                    .to_sql_checked(ty, out),
                ref t if is_text(t) => f.to_string().to_sql_checked(ty, out),
                _ => f.to_sql_checked(ty, out),
            },
            RowValues::Decimal(d) => match *ty {
                Type::FLOAT8 => d
                    .to_f64()
                    .ok_or_else(|| format!("{d} does not fit float8"))?
                    .to_sql_checked(ty, out),
                Type::INT8 => d
                    .to_i64()
                    .ok_or_else(|| format!("{d} does not fit int8"))?
                    .to_sql_checked(ty, out),
                ref t if is_text(t) => d.to_string().to_sql_checked(ty, out),
                _ => d.to_sql_checked(ty, out),
            },
            RowValues::Text(s) => match *ty {
                Type::JSON | Type::JSONB => {
                    serde_json::from_str::<serde_json::Value>(s)?.to_sql_checked(ty, out)
                }
                Type::UUID => Uuid::parse_str(s)?.to_sql_checked(ty, out),
                _ => s.to_sql_checked(ty, out),
            },
            RowValues::Bool(b) => b.to_sql_checked(ty, out),
            RowValues::Date(d) => match *ty {
                Type::TIMESTAMP => d
                    .and_hms_opt(0, 0, 0)
                    .ok_or("invalid midnight")?
                    .to_sql_checked(ty, out),
                _ => d.to_sql_checked(ty, out),
            },
            RowValues::Time(t) => t.to_sql_checked(ty, out),
            RowValues::Timestamp(ts) => match *ty {
                Type::TIMESTAMPTZ => Utc.from_utc_datetime(ts).to_sql_checked(ty, out),
                Type::DATE => ts.date().to_sql_checked(ty, out),
                _ => ts.to_sql_checked(ty, out),
            },
            RowValues::Interval(span) => match *ty {
                Type::INT8 => span
                    .num_microseconds()
                    .ok_or("interval overflows microseconds")?
                    .to_sql_checked(ty, out),
                _ => encode_interval(*span, out),
            },
            RowValues::Guid(g) => match *ty {
                ref t if is_text(t) => g.hyphenated().to_string().to_sql_checked(ty, out),
                _ => g.to_sql_checked(ty, out),
            },
            RowValues::JSON(j) => match *ty {
                ref t if is_text(t) => j.to_string().to_sql_checked(ty, out),
                _ => j.to_sql_checked(ty, out),
            },
            RowValues::Blob(bytes) => bytes.to_sql_checked(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn encode_interval(span: TimeDelta, out: &mut BytesMut) -> Result<IsNull, BoxError> {
    let micros = span
        .num_microseconds()
        .ok_or("interval overflows microseconds")?;
    out.put_i64(micros);
    out.put_i32(0);
    out.put_i32(0);
    Ok(IsNull::No)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{NativeParameter, ParameterDirection};
    use crate::types::ValueType;

    fn param(marker: &str, value: RowValues, type_code: i32) -> NativeParameter {
        NativeParameter {
            name: marker.trim_start_matches('$').into(),
            marker: marker.into(),
            value,
            direction: ParameterDirection::Input,
            value_type: ValueType::I64,
            type_code,
            size: None,
            precision: None,
            scale: None,
        }
    }

    #[test]
    fn values_follow_marker_numbers() {
        let mut command = NativeCommand::text("select $2, $1, $4");
        command.parameters.push(param("$2", RowValues::Int(2), 20));
        command.parameters.push(param("$1", RowValues::Int(1), 20));
        command.parameters.push(param("$4", RowValues::Int(4), 20));
        let values: Vec<RowValues> = ordered_values(&command).into_iter().cloned().collect();
        assert_eq!(
            values,
            vec![RowValues::Int(1), RowValues::Int(2), RowValues::Null, RowValues::Int(4)]
        );
    }

    #[test]
    fn declared_types_need_every_slot() {
        let mut command = NativeCommand::text("select $1, $2");
        command.parameters.push(param("$1", RowValues::Int(1), 20));
        command.parameters.push(param("$2", RowValues::Text("a".into()), 25));
        assert_eq!(declared_types(&command), Some(vec![Type::INT8, Type::TEXT]));

        command.parameters[1].type_code = 0;
        assert_eq!(declared_types(&command), None);
    }

    #[test]
    fn multi_statement_detection_ignores_trailing_terminators() {
        assert!(!is_multi_statement("select 1;  "));
        assert!(is_multi_statement("select 1; select 2"));
    }

    #[test]
    fn terminators_inside_literals_and_comments_are_not_statements() {
        assert!(!is_multi_statement("select 'a;b' as s"));
        assert!(!is_multi_statement("select \"odd;name\" from t -- trailing; comment"));
        assert!(!is_multi_statement("select 1 /* one; two */"));
        assert!(!is_multi_statement("do $body$ begin perform 1; perform 2; end $body$"));
        assert!(is_multi_statement("select ';'; select 2"));
    }

    #[test]
    fn statement_keys_include_parameter_types() {
        let mut as_int = NativeCommand::text("select $1");
        as_int.parameters.push(param("$1", RowValues::Int(1), 20));
        let mut as_text = NativeCommand::text("select $1");
        as_text.parameters.push(param("$1", RowValues::Text("1".into()), 25));
        let mut again = NativeCommand::text("select $1");
        again.parameters.push(param("$1", RowValues::Int(9), 20));

        assert_ne!(statement_key(&as_int), statement_key(&as_text));
        assert_eq!(statement_key(&as_int), statement_key(&again));
    }

    #[test]
    fn integers_narrow_to_the_declared_column() {
        let mut out = BytesMut::new();
        RowValues::Int(7).to_sql(&Type::INT4, &mut out).unwrap();
        assert_eq!(out.as_ref(), &7_i32.to_be_bytes());

        let mut out = BytesMut::new();
        assert!(RowValues::Int(i64::from(i32::MAX) + 1).to_sql(&Type::INT4, &mut out).is_err());
    }

    #[test]
    fn intervals_encode_as_microseconds_days_months() {
        let mut out = BytesMut::new();
        RowValues::Interval(TimeDelta::seconds(2))
            .to_sql(&Type::INTERVAL, &mut out)
            .unwrap();
        let decoded = PgInterval::from_sql(&Type::INTERVAL, &out).unwrap();
        assert_eq!(decoded.0, TimeDelta::seconds(2));
    }

    #[test]
    fn column_types_follow_oids() {
        assert_eq!(column_type(&Type::INT4), ColumnType::Int32);
        assert_eq!(column_type(&Type::JSONB), ColumnType::Json);
        assert_eq!(column_type(&Type::REFCURSOR), ColumnType::Text);
    }
}
