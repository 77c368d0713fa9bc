use std::sync::Arc;

use tracing::trace;

use super::{Session, SessionState};
use crate::cancel;
use crate::command::{BindSource, CompiledCommand};
use crate::error::SqlEngineError;
use crate::parser::{CompiledParser, FromRecord};

impl Session {
    /// Parser for the current result set; `None` when it has no columns.
    fn current_parser<T: FromRecord>(
        &mut self,
    ) -> Result<Option<Arc<CompiledParser<T>>>, SqlEngineError> {
        let fingerprint = self
            .fingerprint
            .clone()
            .ok_or_else(|| SqlEngineError::ConfigError("no command has been prepared".into()))?;
        let (result_index, strict) = (self.result_index, self.strict);
        let reader = self.reader_mut()?;
        if reader.columns().is_empty() {
            return Ok(None);
        }
        let columns = reader.columns().to_vec();
        self.ctx
            .parser::<T>(&fingerprint, result_index, &columns, strict)
            .map(Some)
    }

    /// Read up to `max` rows of the current result set.
    ///
    /// # Errors
    /// Parse and driver errors; `Cancelled` if the token fires between rows.
    pub async fn read_batch<T: FromRecord>(&mut self, max: usize) -> Result<Vec<T>, SqlEngineError> {
        let Some(parser) = self.current_parser::<T>().inspect_err(|e| self.fail(e))? else {
            return Ok(Vec::new());
        };
        let mut rows = Vec::new();
        while rows.len() < max {
            let step = self.read_row(&parser).await;
            match step {
                Ok(Some(row)) => rows.push(row),
                Ok(None) => break,
                Err(error) => {
                    self.fail(&error);
                    return Err(error);
                }
            }
        }
        trace!(rows = rows.len(), result_index = self.result_index, "read batch");
        Ok(rows)
    }

    async fn read_row<T: FromRecord>(
        &mut self,
        parser: &CompiledParser<T>,
    ) -> Result<Option<T>, SqlEngineError> {
        let reader = self.reader_mut()?;
        let advanced = reader.read().await;
        let row = match advanced {
            Ok(true) => match reader.current() {
                Some(row) => parser.parse(row).map(Some),
                None => Ok(None),
            },
            Ok(false) => Ok(None),
            Err(error) => Err(error),
        };
        cancel::observe(row, self.token.as_ref(), self.profile.as_ref())
    }

    /// First row of the current result set, if any.
    ///
    /// # Errors
    /// See [`read_batch`](Self::read_batch).
    pub async fn read_single<T: FromRecord>(&mut self) -> Result<Option<T>, SqlEngineError> {
        Ok(self.read_batch::<T>(1).await?.into_iter().next())
    }

    /// Every remaining row of the current result set.
    ///
    /// # Errors
    /// See [`read_batch`](Self::read_batch).
    pub async fn read_list<T: FromRecord>(&mut self) -> Result<Vec<T>, SqlEngineError> {
        self.read_batch::<T>(usize::MAX).await
    }

    /// Advance to the next result set and read all of it. An exhausted
    /// reader yields an empty list.
    ///
    /// # Errors
    /// See [`read_batch`](Self::read_batch).
    pub async fn read_next<T: FromRecord>(&mut self) -> Result<Vec<T>, SqlEngineError> {
        if !self.next_result().await? {
            return Ok(Vec::new());
        }
        self.read_list::<T>().await
    }

    /// Move the reader to the next result set.
    ///
    /// # Errors
    /// Driver errors, or `Cancelled` if the token fired.
    pub async fn next_result(&mut self) -> Result<bool, SqlEngineError> {
        let reader = self.reader_mut()?;
        let moved = reader.next_result().await;
        let moved = cancel::observe(moved, self.token.as_ref(), self.profile.as_ref())
            .inspect_err(|e| self.fail(e))?;
        if moved {
            self.result_index += 1;
            self.transition(SessionState::Reading(self.result_index));
        }
        Ok(moved)
    }

    /// Copy output parameter values from the executed command onto `source`.
    /// Any open reader is closed first so drivers that deliver outputs after
    /// the last result set have done so.
    ///
    /// # Errors
    /// Conversion errors from the output loader.
    pub async fn set_output_values<S: BindSource>(
        &mut self,
        compiled: &CompiledCommand<S>,
        source: &mut S,
    ) -> Result<(), SqlEngineError> {
        self.close_reader().await?;
        let command = self
            .command
            .as_ref()
            .ok_or_else(|| SqlEngineError::ConfigError("no command has been prepared".into()))?;
        compiled.load_output(source, command)
    }
}
