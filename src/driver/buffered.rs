use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime, TimeDelta};
use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use uuid::Uuid;

use super::{NativeAccessor, NativeColumn, NativeReader, RowCursor};
use crate::error::SqlEngineError;
use crate::types::{RowValues, parse_timestamp};

/// One fully materialized result set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultBuffer {
    pub columns: Vec<NativeColumn>,
    pub rows: Vec<BufferedRow>,
    pub affected: u64,
}

impl ResultBuffer {
    #[must_use]
    pub fn new(columns: Vec<NativeColumn>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
            affected: 0,
        }
    }

    pub fn push(&mut self, values: Vec<RowValues>) {
        self.rows.push(BufferedRow::new(values));
    }

    #[must_use]
    pub fn with_rows(mut self, rows: Vec<Vec<RowValues>>) -> Self {
        self.rows = rows.into_iter().map(BufferedRow::new).collect();
        self
    }

    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }
}

/// Where the last `read_chars` call on a row stopped.
#[derive(Debug, Clone, Copy, Default)]
struct CharCursor {
    ordinal: usize,
    chars: usize,
    bytes: usize,
}

/// Row of raw values read ahead from a native driver.
#[derive(Debug)]
pub struct BufferedRow {
    values: Vec<RowValues>,
    cursor: Mutex<CharCursor>,
}

impl Clone for BufferedRow {
    fn clone(&self) -> Self {
        Self::new(self.values.clone())
    }
}

impl PartialEq for BufferedRow {
    fn eq(&self, other: &Self) -> bool {
        self.values == other.values
    }
}

impl BufferedRow {
    #[must_use]
    pub fn new(values: Vec<RowValues>) -> Self {
        Self {
            values,
            cursor: Mutex::new(CharCursor::default()),
        }
    }

    /// Character and byte position to resume a text read from. Sequential
    /// chunked reads of one column continue where the previous one ended.
    fn resume_from(&self, ordinal: usize, offset: usize) -> (usize, usize) {
        let cursor = *self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        if cursor.ordinal == ordinal && cursor.chars <= offset {
            (cursor.chars, cursor.bytes)
        } else {
            (0, 0)
        }
    }

    #[must_use]
    pub fn values(&self) -> &[RowValues] {
        &self.values
    }

    fn value(&self, ordinal: usize) -> Result<&RowValues, SqlEngineError> {
        self.values.get(ordinal).ok_or_else(|| {
            SqlEngineError::ExecutionError(format!(
                "column ordinal {ordinal} out of range ({} columns)",
                self.values.len()
            ))
        })
    }
}

fn unreadable(ordinal: usize, value: &RowValues, accessor: NativeAccessor) -> SqlEngineError {
    SqlEngineError::ExecutionError(format!(
        "column {ordinal} holds a {} value that cannot be read as {accessor:?}",
        value.type_label()
    ))
}

fn read_integer(value: &RowValues) -> Option<i64> {
    match value {
        RowValues::Int(v) => Some(*v),
        RowValues::Bool(b) => Some(i64::from(*b)),
        RowValues::Decimal(d) if d.fract().is_zero() => d.to_i64(),
        RowValues::Float(f) if f.fract() == 0.0 => f.to_i64(),
        RowValues::Text(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn narrow(value: i64, accessor: NativeAccessor) -> Option<i64> {
    let fits = match accessor {
        NativeAccessor::Int16 => i16::try_from(value).is_ok(),
        NativeAccessor::Int32 => i32::try_from(value).is_ok(),
        _ => true,
    };
    fits.then_some(value)
}

impl RowCursor for BufferedRow {
    fn column_count(&self) -> usize {
        self.values.len()
    }

    fn is_null(&self, ordinal: usize) -> bool {
        self.values.get(ordinal).is_none_or(RowValues::is_null)
    }

    fn read(&self, ordinal: usize, accessor: NativeAccessor) -> Result<RowValues, SqlEngineError> {
        let value = self.value(ordinal)?;
        if value.is_null() {
            return Ok(RowValues::Null);
        }
        let read = match accessor {
            NativeAccessor::Value => Some(value.clone()),
            NativeAccessor::Boolean => match value {
                RowValues::Bool(b) => Some(RowValues::Bool(*b)),
                RowValues::Int(i) => Some(RowValues::Bool(*i != 0)),
                RowValues::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "t" | "1" => Some(RowValues::Bool(true)),
                    "false" | "f" | "0" => Some(RowValues::Bool(false)),
                    _ => None,
                },
                _ => None,
            },
            NativeAccessor::Int16 | NativeAccessor::Int32 | NativeAccessor::Int64 => {
                read_integer(value)
                    .and_then(|v| narrow(v, accessor))
                    .map(RowValues::Int)
            }
            NativeAccessor::Float | NativeAccessor::Double => match value {
                RowValues::Float(f) => Some(RowValues::Float(*f)),
                #[allow(clippy::cast_precision_loss)]
                RowValues::Int(i) => Some(RowValues::Float(*i as f64)),
                RowValues::Decimal(d) => d.to_f64().map(RowValues::Float),
                RowValues::Text(s) => s.trim().parse().ok().map(RowValues::Float),
                _ => None,
            },
            NativeAccessor::Decimal => match value {
                RowValues::Decimal(d) => Some(RowValues::Decimal(*d)),
                RowValues::Int(i) => Some(RowValues::Decimal(Decimal::from(*i))),
                RowValues::Float(f) => Decimal::from_f64(*f).map(RowValues::Decimal),
                RowValues::Text(s) => Decimal::from_str(s.trim()).ok().map(RowValues::Decimal),
                _ => None,
            },
            NativeAccessor::String => match value {
                RowValues::Text(s) => Some(RowValues::Text(s.clone())),
                RowValues::Guid(g) => Some(RowValues::Text(g.to_string())),
                RowValues::JSON(j) => Some(RowValues::Text(j.to_string())),
                RowValues::Int(i) => Some(RowValues::Text(i.to_string())),
                RowValues::Float(f) => Some(RowValues::Text(f.to_string())),
                RowValues::Decimal(d) => Some(RowValues::Text(d.to_string())),
                _ => None,
            },
            NativeAccessor::Date => match value {
                RowValues::Date(d) => Some(RowValues::Date(*d)),
                RowValues::Timestamp(ts) => Some(RowValues::Date(ts.date())),
                RowValues::Text(s) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
                    .ok()
                    .or_else(|| parse_timestamp(s.trim()).map(|ts| ts.date()))
                    .map(RowValues::Date),
                _ => None,
            },
            NativeAccessor::Time => match value {
                RowValues::Time(t) => Some(RowValues::Time(*t)),
                RowValues::Timestamp(ts) => Some(RowValues::Time(ts.time())),
                RowValues::Text(s) => NaiveTime::parse_from_str(s.trim(), "%H:%M:%S%.f")
                    .ok()
                    .map(RowValues::Time),
                _ => None,
            },
            NativeAccessor::DateTime => match value {
                RowValues::Timestamp(ts) => Some(RowValues::Timestamp(*ts)),
                RowValues::Date(d) => d.and_hms_opt(0, 0, 0).map(RowValues::Timestamp),
                RowValues::Text(s) => parse_timestamp(s.trim()).map(RowValues::Timestamp),
                _ => None,
            },
            NativeAccessor::TimeSpan => match value {
                RowValues::Interval(d) => Some(RowValues::Interval(*d)),
                RowValues::Int(us) => Some(RowValues::Interval(TimeDelta::microseconds(*us))),
                RowValues::Time(t) => Some(RowValues::Interval(
                    *t - NaiveTime::MIN,
                )),
                _ => None,
            },
            NativeAccessor::Guid => match value {
                RowValues::Guid(g) => Some(RowValues::Guid(*g)),
                RowValues::Text(s) => Uuid::parse_str(s.trim()).ok().map(RowValues::Guid),
                RowValues::Blob(b) => Uuid::from_slice(b).ok().map(RowValues::Guid),
                _ => None,
            },
            NativeAccessor::Bytes => match value {
                RowValues::Blob(b) => Some(RowValues::Blob(b.clone())),
                RowValues::Text(s) => Some(RowValues::Blob(s.as_bytes().to_vec())),
                RowValues::Guid(g) => Some(RowValues::Blob(g.as_bytes().to_vec())),
                _ => None,
            },
            NativeAccessor::Json => match value {
                RowValues::JSON(j) => Some(RowValues::JSON(j.clone())),
                RowValues::Text(s) => serde_json::from_str(s).ok().map(RowValues::JSON),
                _ => None,
            },
        };
        read.ok_or_else(|| unreadable(ordinal, value, accessor))
    }

    fn read_bytes(
        &self,
        ordinal: usize,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<usize, SqlEngineError> {
        let value = self.value(ordinal)?;
        let bytes: &[u8] = match value {
            RowValues::Blob(b) => b,
            RowValues::Text(s) => s.as_bytes(),
            RowValues::Null => &[],
            other => return Err(unreadable(ordinal, other, NativeAccessor::Bytes)),
        };
        if offset >= bytes.len() {
            return Ok(0);
        }
        let n = buf.len().min(bytes.len() - offset);
        buf[..n].copy_from_slice(&bytes[offset..offset + n]);
        Ok(n)
    }

    fn read_chars(
        &self,
        ordinal: usize,
        offset: usize,
        buf: &mut String,
        max_chars: usize,
    ) -> Result<usize, SqlEngineError> {
        let value = self.value(ordinal)?;
        let text = match value {
            RowValues::Text(s) => s.as_str(),
            RowValues::Null => "",
            other => return Err(unreadable(ordinal, other, NativeAccessor::String)),
        };
        let (mut chars, mut bytes) = self.resume_from(ordinal, offset);
        let mut tail = text[bytes..].chars();
        for ch in tail.by_ref().take(offset - chars) {
            chars += 1;
            bytes += ch.len_utf8();
        }
        let mut appended = 0;
        for ch in tail.take(max_chars) {
            buf.push(ch);
            bytes += ch.len_utf8();
            appended += 1;
        }
        *self.cursor.lock().unwrap_or_else(PoisonError::into_inner) = CharCursor {
            ordinal,
            chars: chars + appended,
            bytes,
        };
        Ok(appended)
    }
}

type CloseHook = Box<dyn FnOnce() + Send>;

/// Reader over result sets that were fully read ahead from the driver.
pub struct BufferedReader {
    pending: VecDeque<ResultBuffer>,
    columns: Vec<NativeColumn>,
    rows: std::vec::IntoIter<BufferedRow>,
    row: Option<BufferedRow>,
    affected: u64,
    closed: bool,
    on_close: Option<CloseHook>,
}

impl BufferedReader {
    /// Position the reader on the first of `sets`.
    #[must_use]
    pub fn new(sets: Vec<ResultBuffer>) -> Self {
        let affected = sets.iter().map(|s| s.affected).sum();
        let mut pending: VecDeque<ResultBuffer> = sets.into();
        let first = pending.pop_front().unwrap_or_default();
        Self {
            pending,
            columns: first.columns,
            rows: first.rows.into_iter(),
            row: None,
            affected,
            closed: false,
            on_close: None,
        }
    }

    /// Reader with no result sets and a row count, for non-query statements.
    #[must_use]
    pub fn affected_only(affected: u64) -> Self {
        let mut reader = Self::new(Vec::new());
        reader.affected = affected;
        reader
    }

    /// Run `hook` once when the reader is closed or dropped.
    #[must_use]
    pub fn on_close(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_close = Some(Box::new(hook));
        self
    }

    fn finish(&mut self) {
        self.closed = true;
        self.row = None;
        self.pending.clear();
        if let Some(hook) = self.on_close.take() {
            hook();
        }
    }
}

impl std::fmt::Debug for BufferedReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedReader")
            .field("columns", &self.columns)
            .field("pending_sets", &self.pending.len())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl NativeReader for BufferedReader {
    fn columns(&self) -> &[NativeColumn] {
        &self.columns
    }

    async fn read(&mut self) -> Result<bool, SqlEngineError> {
        if self.closed {
            return Ok(false);
        }
        self.row = self.rows.next();
        Ok(self.row.is_some())
    }

    fn current(&self) -> Option<&dyn RowCursor> {
        self.row.as_ref().map(|r| r as &dyn RowCursor)
    }

    async fn next_result(&mut self) -> Result<bool, SqlEngineError> {
        self.row = None;
        if self.closed {
            return Ok(false);
        }
        match self.pending.pop_front() {
            Some(set) => {
                self.columns = set.columns;
                self.rows = set.rows.into_iter();
                Ok(true)
            }
            None => {
                self.columns.clear();
                self.rows = Vec::new().into_iter();
                Ok(false)
            }
        }
    }

    fn records_affected(&self) -> u64 {
        self.affected
    }

    async fn close(&mut self) -> Result<(), SqlEngineError> {
        if !self.closed {
            self.finish();
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for BufferedReader {
    fn drop(&mut self) {
        if !self.closed {
            self.finish();
        }
    }
}
