//! Fetch-by-name fallback for procedures that hand back cursors instead of
//! result sets (PostgreSQL `refcursor`).
//!
//! The call runs inside a transaction so the portals stay open, every cursor
//! name it returned is fetched in order, and the rows are buffered into one
//! multi-result reader. Cursors past `expected` are left to the commit to
//! close.

use tracing::{debug, warn};

use super::{Session, SessionState, bounded};
use crate::cancel;
use crate::driver::{BufferedReader, NativeCommand, NativeReader, ResultBuffer};
use crate::error::SqlEngineError;
use crate::types::RowValues;

impl Session {
    pub(super) async fn execute_cursor_fallback(&mut self, expected: u8) -> Result<(), SqlEngineError> {
        let implicit = !self.in_transaction;
        if implicit {
            self.begin_native().await.inspect_err(|e| self.fail(e))?;
        }
        let result = self.fetch_cursors(usize::from(expected)).await;
        match result {
            Ok(buffers) => {
                if implicit {
                    self.commit_native().await.inspect_err(|e| self.fail(e))?;
                }
                debug!(cursors = buffers.len(), "cursor results buffered");
                self.reader = Some(Box::new(BufferedReader::new(buffers)));
                self.result_index = 0;
                self.transition(SessionState::Reading(0));
                Ok(())
            }
            Err(error) => {
                if implicit && let Err(rollback) = self.rollback_native().await {
                    warn!(error = %rollback, "rollback after failed cursor fetch failed");
                }
                self.fail(&error);
                Err(error)
            }
        }
    }

    async fn fetch_cursors(&mut self, expected: usize) -> Result<Vec<ResultBuffer>, SqlEngineError> {
        let mut command = self.take_command()?;
        self.transition(SessionState::Executing);
        let timeout = self.timeout;
        let call = match self.connection_mut() {
            Ok(connection) => bounded(timeout, connection.execute_reader(&mut command)).await,
            Err(error) => Err(error),
        };
        self.command = Some(command);
        let mut reader = cancel::observe(call, self.token.as_ref(), self.profile.as_ref())?;
        let names = cursor_names(reader.as_mut(), expected).await;
        reader.close().await?;
        let names = names?;

        let mut buffers = Vec::with_capacity(names.len());
        for name in names {
            let mut fetch = NativeCommand::text(self.profile.cursor_fetch(&name));
            fetch.timeout = timeout;
            let connection = self.connection_mut()?;
            let opened = bounded(timeout, connection.execute_reader(&mut fetch)).await;
            let mut cursor = cancel::observe(opened, self.token.as_ref(), self.profile.as_ref())?;
            let buffered = buffer_result(cursor.as_mut()).await;
            cursor.close().await?;
            buffers.push(buffered?);
            cancel::check(self.token.as_ref())?;
        }
        Ok(buffers)
    }
}

/// Cursor names in the order the call returned them, at most `expected`.
async fn cursor_names(
    reader: &mut dyn NativeReader,
    expected: usize,
) -> Result<Vec<String>, SqlEngineError> {
    let mut names = Vec::with_capacity(expected);
    while names.len() < expected && reader.read().await? {
        let Some(row) = reader.current() else {
            break;
        };
        for (ordinal, column) in reader.columns().iter().enumerate() {
            if names.len() == expected {
                break;
            }
            match row.read(ordinal, column.column_type.accessor())? {
                RowValues::Text(name) => names.push(name),
                RowValues::Null => {}
                other => {
                    return Err(SqlEngineError::ExecutionError(format!(
                        "expected a cursor name, got {other}"
                    )));
                }
            }
        }
    }
    Ok(names)
}

async fn buffer_result(reader: &mut dyn NativeReader) -> Result<ResultBuffer, SqlEngineError> {
    let columns = reader.columns().to_vec();
    let mut buffer = ResultBuffer::new(columns.clone());
    while reader.read().await? {
        let Some(row) = reader.current() else {
            break;
        };
        let values = columns
            .iter()
            .enumerate()
            .map(|(ordinal, column)| row.read(ordinal, column.column_type.accessor()))
            .collect::<Result<Vec<_>, _>>()?;
        buffer.push(values);
    }
    Ok(buffer)
}
