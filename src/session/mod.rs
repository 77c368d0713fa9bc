//! Session & Cursor Engine.
//!
//! A [`Session`] owns at most one native connection, one bound command and
//! one open reader. Each logical operation walks
//! `Idle -> Preparing -> Executing -> Reading(n) -> Completed`, with
//! `Cancelled` and `Failed` reachable from the middle states.
//!
//! - `read`: row consumption through compiled parsers, output parameters
//! - `stream`: [`BatchStream`], consumer-driven batches over one reader
//! - `paged`: [`PagedStream`], one command re-executed per page
//! - `cursor`: the fetch-by-name fallback for cursor-returning procedures

mod cursor;
mod paged;
mod read;
mod stream;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cancel;
use crate::command::{BindSource, CompiledCommand};
use crate::context::EngineContext;
use crate::driver::{NativeCommand, NativeConnection, NativeConnector, NativeReader};
use crate::error::SqlEngineError;
use crate::fingerprint::{Behavior, OperationFingerprint};
use crate::provider::ProviderProfile;
use crate::types::{DatabaseType, RowValues};

pub use paged::PagedStream;
pub use stream::BatchStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Preparing,
    Executing,
    /// Reading the result set at this position.
    Reading(usize),
    Completed,
    Cancelled,
    Failed,
}

/// Run a native call under the session timeout.
pub(crate) async fn bounded<T>(
    timeout: Option<Duration>,
    call: impl Future<Output = Result<T, SqlEngineError>>,
) -> Result<T, SqlEngineError> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, call).await.map_err(|_| {
            SqlEngineError::ExecutionError(format!("command timed out after {limit:?}"))
        })?,
        None => call.await,
    }
}

/// One logical unit of work against one connection.
pub struct Session {
    ctx: Arc<EngineContext>,
    connector: Arc<dyn NativeConnector>,
    profile: Arc<dyn ProviderProfile>,
    connection: Option<Box<dyn NativeConnection>>,
    command: Option<NativeCommand>,
    reader: Option<Box<dyn NativeReader>>,
    fingerprint: Option<OperationFingerprint>,
    cursor_fallback: Option<u8>,
    result_index: usize,
    state: SessionState,
    in_transaction: bool,
    token: Option<CancellationToken>,
    timeout: Option<Duration>,
    strict: bool,
    released: bool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("provider", &self.profile.database_type())
            .field("state", &self.state)
            .field("connected", &self.connection.is_some())
            .field("reader_open", &self.reader.is_some())
            .field("in_transaction", &self.in_transaction)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// # Errors
    /// Returns `SqlEngineError::ProviderNotRegistered` when the connector's
    /// provider has no profile in `ctx`.
    pub fn new(
        ctx: Arc<EngineContext>,
        connector: Arc<dyn NativeConnector>,
    ) -> Result<Self, SqlEngineError> {
        let profile = ctx.profile(connector.database_type())?;
        let timeout = ctx.options().command_timeout();
        let strict = ctx.options().strict_mapping;
        Ok(Self {
            ctx,
            connector,
            profile,
            connection: None,
            command: None,
            reader: None,
            fingerprint: None,
            cursor_fallback: None,
            result_index: 0,
            state: SessionState::Idle,
            in_transaction: false,
            token: None,
            timeout,
            strict,
            released: false,
        })
    }

    #[must_use]
    pub fn with_cancellation(mut self, token: Option<CancellationToken>) -> Self {
        self.token = token;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        if timeout.is_some() {
            self.timeout = timeout;
        }
        self
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub fn provider(&self) -> DatabaseType {
        self.profile.database_type()
    }

    #[must_use]
    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    #[must_use]
    pub fn has_open_reader(&self) -> bool {
        self.reader.is_some()
    }

    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// The command bound by the last [`prepare`](Self::prepare).
    #[must_use]
    pub fn command(&self) -> Option<&NativeCommand> {
        self.command.as_ref()
    }

    pub(crate) fn command_mut(&mut self) -> Option<&mut NativeCommand> {
        self.command.as_mut()
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            debug!(provider = %self.profile.database_type(), from = ?self.state, to = ?next, "session state");
            self.state = next;
        }
    }

    fn fail(&mut self, error: &SqlEngineError) {
        let next = if error.is_cancelled() {
            SessionState::Cancelled
        } else {
            SessionState::Failed
        };
        self.transition(next);
    }

    fn ensure_live(&self) -> Result<(), SqlEngineError> {
        if self.released {
            return Err(SqlEngineError::ConnectionError(
                "session has already been released".into(),
            ));
        }
        Ok(())
    }

    /// Open the native connection if it is not open yet.
    ///
    /// # Errors
    /// Returns the driver's connect error, or `Cancelled` if the token fired
    /// while connecting.
    pub async fn open(&mut self) -> Result<(), SqlEngineError> {
        self.ensure_live()?;
        if self.connection.is_some() {
            return Ok(());
        }
        let result = bounded(self.timeout, self.connector.connect()).await;
        match cancel::observe(result, self.token.as_ref(), self.profile.as_ref()) {
            Ok(connection) => {
                debug!(provider = %self.profile.database_type(), "connection opened");
                self.connection = Some(connection);
                Ok(())
            }
            Err(error) => {
                self.fail(&error);
                Err(error)
            }
        }
    }

    fn connection_mut(&mut self) -> Result<&mut Box<dyn NativeConnection>, SqlEngineError> {
        self.connection
            .as_mut()
            .ok_or_else(|| SqlEngineError::ConnectionError("session has no open connection".into()))
    }

    /// Resolve or compile the command for `script`, bind `source` and run the
    /// native prepare step when the compiled behavior asks for it. An open
    /// reader is closed first.
    ///
    /// # Errors
    /// Configuration errors from compilation, or driver errors from opening
    /// the connection and preparing.
    pub async fn prepare<S: BindSource>(
        &mut self,
        script: &str,
        source: &S,
        behavior: Behavior,
    ) -> Result<Arc<CompiledCommand<S>>, SqlEngineError> {
        self.ensure_live()?;
        self.close_reader().await?;
        self.transition(SessionState::Preparing);
        let compiled = self
            .ctx
            .command(self.profile.database_type(), script, source, behavior)
            .inspect_err(|e| self.fail(e))?;
        self.open().await?;

        let mut command = compiled
            .bind(source, self.command.take(), self.timeout)
            .inspect_err(|e| self.fail(e))?;
        if compiled.behavior().prepare && !command.prepared {
            let timeout = self.timeout;
            let connection = self.connection_mut()?;
            let result = bounded(timeout, connection.prepare(&command)).await;
            if let Err(error) = cancel::observe(result, self.token.as_ref(), self.profile.as_ref()) {
                self.fail(&error);
                return Err(error);
            }
            command.prepared = true;
        }

        self.command = Some(command);
        self.fingerprint = Some(compiled.fingerprint().clone());
        let resolved = compiled.behavior();
        self.strict = resolved.strict;
        self.cursor_fallback = resolved.cursor_fallback.then_some(resolved.result_cursors);
        Ok(compiled)
    }

    fn take_command(&mut self) -> Result<NativeCommand, SqlEngineError> {
        self.command
            .take()
            .ok_or_else(|| SqlEngineError::ConfigError("no command has been prepared".into()))
    }

    /// Run the bound command as a non-query and return the affected row
    /// count.
    ///
    /// # Errors
    /// Driver errors, `Cancelled` when the token fired during the call.
    pub async fn execute_non_query(&mut self) -> Result<u64, SqlEngineError> {
        self.close_reader().await?;
        let mut command = self.take_command()?;
        self.transition(SessionState::Executing);
        let timeout = self.timeout;
        let result = match self.connection_mut() {
            Ok(connection) => bounded(timeout, connection.execute_non_query(&mut command)).await,
            Err(error) => Err(error),
        };
        self.command = Some(command);
        match cancel::observe(result, self.token.as_ref(), self.profile.as_ref()) {
            Ok(affected) => {
                self.transition(SessionState::Completed);
                Ok(affected)
            }
            Err(error) => {
                self.fail(&error);
                Err(error)
            }
        }
    }

    /// Run the bound command and open a reader on its first result set.
    ///
    /// # Errors
    /// Driver errors, `Cancelled` when the token fired during the call. A
    /// reader opened by a call that turned out cancelled is closed first.
    pub async fn execute_reader(&mut self) -> Result<(), SqlEngineError> {
        self.close_reader().await?;
        if let Some(cursors) = self.cursor_fallback {
            return self.execute_cursor_fallback(cursors).await;
        }
        let mut command = self.take_command()?;
        self.transition(SessionState::Executing);
        let timeout = self.timeout;
        let result = match self.connection_mut() {
            Ok(connection) => bounded(timeout, connection.execute_reader(&mut command)).await,
            Err(error) => Err(error),
        };
        self.command = Some(command);
        match result {
            Ok(mut reader) => {
                if let Err(error) = cancel::check(self.token.as_ref()) {
                    if let Err(close) = reader.close().await {
                        warn!(error = %close, "closing reader after cancellation failed");
                    }
                    self.fail(&error);
                    return Err(error);
                }
                self.reader = Some(reader);
                self.result_index = 0;
                self.transition(SessionState::Reading(0));
                Ok(())
            }
            Err(error) => {
                let error = cancel::classify(error, self.token.as_ref(), self.profile.as_ref());
                self.fail(&error);
                Err(error)
            }
        }
    }

    /// First column of the first row, or NULL for an empty result.
    ///
    /// # Errors
    /// Same as [`execute_reader`](Self::execute_reader), plus read errors.
    pub async fn execute_scalar(&mut self) -> Result<RowValues, SqlEngineError> {
        self.execute_reader().await?;
        let value = {
            let reader = self.reader_mut()?;
            let has_row = reader.read().await;
            match has_row {
                Ok(true) => {
                    let accessor = reader
                        .columns()
                        .first()
                        .map(|c| c.column_type.accessor());
                    match (reader.current(), accessor) {
                        (Some(row), Some(accessor)) => row.read(0, accessor),
                        _ => Ok(RowValues::Null),
                    }
                }
                Ok(false) => Ok(RowValues::Null),
                Err(error) => Err(error),
            }
        };
        let value = cancel::observe(value, self.token.as_ref(), self.profile.as_ref())
            .inspect_err(|e| self.fail(e));
        self.close_reader().await?;
        let value = value?;
        self.transition(SessionState::Completed);
        Ok(value)
    }

    pub(crate) fn reader_mut(&mut self) -> Result<&mut Box<dyn NativeReader>, SqlEngineError> {
        self.reader
            .as_mut()
            .ok_or_else(|| SqlEngineError::ConfigError("no reader is open on this session".into()))
    }

    /// Close the open reader, if any.
    ///
    /// # Errors
    /// Returns the driver's close error.
    pub async fn close_reader(&mut self) -> Result<(), SqlEngineError> {
        if let Some(mut reader) = self.reader.take() {
            reader.close().await?;
            if matches!(self.state, SessionState::Reading(_)) {
                self.transition(SessionState::Completed);
            }
        }
        Ok(())
    }

    pub(crate) async fn begin_native(&mut self) -> Result<(), SqlEngineError> {
        self.open().await?;
        let timeout = self.timeout;
        let connection = self.connection_mut()?;
        let result = bounded(timeout, connection.begin()).await;
        cancel::observe(result, self.token.as_ref(), self.profile.as_ref())?;
        self.in_transaction = true;
        debug!(provider = %self.profile.database_type(), "transaction started");
        Ok(())
    }

    pub(crate) async fn commit_native(&mut self) -> Result<(), SqlEngineError> {
        self.close_reader().await?;
        self.in_transaction = false;
        let timeout = self.timeout;
        let connection = self.connection_mut()?;
        bounded(timeout, connection.commit()).await
    }

    pub(crate) async fn rollback_native(&mut self) -> Result<(), SqlEngineError> {
        if let Some(mut reader) = self.reader.take()
            && let Err(error) = reader.close().await
        {
            warn!(error = %error, "closing reader before rollback failed");
        }
        self.in_transaction = false;
        let timeout = self.timeout;
        let connection = self.connection_mut()?;
        bounded(timeout, connection.rollback()).await
    }

    /// Release the reader, command and connection. Safe to call more than
    /// once; only the first call does anything.
    ///
    /// # Errors
    /// Returns the first close error; every resource is released regardless.
    pub async fn release(&mut self) -> Result<(), SqlEngineError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        let mut first_error = None;
        if let Some(mut reader) = self.reader.take()
            && let Err(error) = reader.close().await
        {
            first_error.get_or_insert(error);
        }
        self.command = None;
        if let Some(mut connection) = self.connection.take() {
            if self.in_transaction {
                warn!(provider = %self.profile.database_type(), "releasing a session with an open transaction");
            }
            if let Err(error) = connection.close().await {
                first_error.get_or_insert(error);
            }
        }
        if !matches!(self.state, SessionState::Failed | SessionState::Cancelled) {
            self.transition(SessionState::Completed);
        }
        debug!(provider = %self.profile.database_type(), "session released");
        match first_error {
            Some(error) => {
                warn!(error = %error, "session release reported an error");
                Err(error)
            }
            None => Ok(()),
        }
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.released || (self.connection.is_none() && self.reader.is_none()) {
            return;
        }
        self.released = true;
        let provider = self.profile.database_type();
        let reader = self.reader.take();
        let connection = self.connection.take();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(provider = %provider, "session dropped without release; closing in the background");
                handle.spawn(async move {
                    if let Some(mut reader) = reader
                        && let Err(error) = reader.close().await
                    {
                        debug!(error = %error, "reader close of dropped session failed");
                    }
                    if let Some(mut connection) = connection
                        && let Err(error) = connection.close().await
                    {
                        debug!(error = %error, "connection close of dropped session failed");
                    }
                });
            }
            Err(_) => {
                debug!(provider = %provider, "session dropped without release or runtime; native handles dropped");
            }
        }
    }
}
