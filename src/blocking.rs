//! Synchronous variants of the façade.
//!
//! [`BlockingDatabase`] drives the async engine on a current-thread runtime
//! it owns. It must not be used from inside another tokio runtime.

use tokio::runtime::{Builder, Runtime};
use tracing::warn;

use crate::command::BindSource;
use crate::conversion::SqlType;
use crate::error::SqlEngineError;
use crate::executor::{CallOptions, Database, MultiResult};
use crate::outcome::Outcome;
use crate::parser::FromRecord;
use crate::session::{BatchStream, PagedStream};
use crate::transaction::Transaction;
use crate::types::DatabaseType;

/// ```rust,no_run
/// use sql_engine::prelude::*;
///
/// # fn demo() -> Result<(), SqlEngineError> {
/// let db = BlockingDatabase::connect(DatabaseType::Sqlite, ":memory:")?;
/// let options = CallOptions::new();
/// db.execute("CREATE TABLE t (n INTEGER)", &(), &options)?;
/// let rows: Vec<i64> = db.fetch_list("SELECT n FROM t", &(), &options)?;
/// assert!(rows.is_empty());
/// # Ok(()) }
/// ```
#[derive(Debug)]
pub struct BlockingDatabase {
    inner: Database,
    runtime: Runtime,
}

impl BlockingDatabase {
    /// # Errors
    /// Returns `SqlEngineError::Other` if the runtime cannot be built.
    pub fn new(inner: Database) -> Result<Self, SqlEngineError> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| SqlEngineError::Other(format!("failed to build blocking runtime: {e}")))?;
        Ok(Self { inner, runtime })
    }

    /// # Errors
    /// See [`Database::connect`].
    pub fn connect(provider: DatabaseType, url: &str) -> Result<Self, SqlEngineError> {
        Self::new(Database::connect(provider, url)?)
    }

    #[must_use]
    pub fn database(&self) -> &Database {
        &self.inner
    }

    /// # Errors
    /// See [`Database::execute`].
    pub fn execute<S: BindSource>(&self, script: &str, params: &S, options: &CallOptions) -> Result<u64, SqlEngineError> {
        self.runtime.block_on(self.inner.execute(script, params, options))
    }

    /// # Errors
    /// See [`Database::execute_with_output`].
    pub fn execute_with_output<S: BindSource>(
        &self,
        script: &str,
        params: &mut S,
        options: &CallOptions,
    ) -> Result<u64, SqlEngineError> {
        self.runtime
            .block_on(self.inner.execute_with_output(script, params, options))
    }

    /// # Errors
    /// See [`Database::scalar`].
    pub fn scalar<V: SqlType, S: BindSource>(&self, script: &str, params: &S, options: &CallOptions) -> Result<V, SqlEngineError> {
        self.runtime.block_on(self.inner.scalar(script, params, options))
    }

    /// # Errors
    /// See [`Database::fetch_one`].
    pub fn fetch_one<T: FromRecord, S: BindSource>(
        &self,
        script: &str,
        params: &S,
        options: &CallOptions,
    ) -> Result<Option<T>, SqlEngineError> {
        self.runtime.block_on(self.inner.fetch_one(script, params, options))
    }

    /// # Errors
    /// See [`Database::fetch_list`].
    pub fn fetch_list<T: FromRecord, S: BindSource>(
        &self,
        script: &str,
        params: &S,
        options: &CallOptions,
    ) -> Result<Vec<T>, SqlEngineError> {
        self.runtime.block_on(self.inner.fetch_list(script, params, options))
    }

    /// # Errors
    /// See [`Database::fetch_multiple`].
    pub fn fetch_multiple<M: MultiResult, S: BindSource>(
        &self,
        script: &str,
        params: &S,
        options: &CallOptions,
    ) -> Result<M, SqlEngineError> {
        self.runtime
            .block_on(self.inner.fetch_multiple(script, params, options))
    }

    /// Batches as an iterator; the session is released when it is exhausted
    /// or dropped.
    ///
    /// # Errors
    /// See [`Database::stream`].
    pub fn stream<T: FromRecord, S: BindSource>(
        &self,
        script: &str,
        params: &S,
        batch_size: usize,
        options: &CallOptions,
    ) -> Result<BlockingBatches<'_, T>, SqlEngineError> {
        let inner = self
            .runtime
            .block_on(self.inner.stream(script, params, batch_size, options))?;
        Ok(BlockingBatches {
            runtime: &self.runtime,
            inner: Some(inner),
        })
    }

    /// Pages as an iterator.
    ///
    /// # Errors
    /// See [`Database::paged`].
    pub fn paged<T: FromRecord, S: BindSource>(
        &self,
        script: &str,
        params: &S,
        offset: u64,
        page_size: u64,
        options: &CallOptions,
    ) -> Result<BlockingPages<'_, T>, SqlEngineError> {
        let inner = self
            .runtime
            .block_on(self.inner.paged(script, params, offset, page_size, options))?;
        Ok(BlockingPages {
            runtime: &self.runtime,
            inner: Some(inner),
        })
    }

    /// # Errors
    /// See [`Database::begin`].
    pub fn begin(&self, options: &CallOptions) -> Result<BlockingTransaction<'_>, SqlEngineError> {
        let tx = self.runtime.block_on(self.inner.begin(options))?;
        Ok(BlockingTransaction {
            runtime: &self.runtime,
            tx,
        })
    }

    /// Run `work` in a transaction; commit on `Ok`, roll back on `Err`.
    ///
    /// # Errors
    /// The error `work` returned, or begin/commit errors.
    pub fn run_in_transaction<R>(
        &self,
        options: &CallOptions,
        work: impl FnOnce(&mut BlockingTransaction<'_>) -> Result<R, SqlEngineError>,
    ) -> Result<R, SqlEngineError> {
        let mut tx = self.begin(options)?;
        match work(&mut tx) {
            Ok(value) => {
                if !tx.is_completed() {
                    tx.commit()?;
                }
                Ok(value)
            }
            Err(error) => {
                if !tx.is_completed()
                    && let Err(rollback) = tx.rollback()
                {
                    warn!(error = %rollback, "rollback after failed transaction body failed");
                }
                Err(error)
            }
        }
    }

    /// # Errors
    /// Configuration and schema errors only.
    pub fn try_execute<S: BindSource>(
        &self,
        script: &str,
        params: &S,
        options: &CallOptions,
    ) -> Result<Outcome<u64>, SqlEngineError> {
        self.runtime.block_on(self.inner.try_execute(script, params, options))
    }

    /// # Errors
    /// Configuration and schema errors only.
    pub fn try_scalar<V: SqlType, S: BindSource>(
        &self,
        script: &str,
        params: &S,
        options: &CallOptions,
    ) -> Result<Outcome<V>, SqlEngineError> {
        self.runtime.block_on(self.inner.try_scalar(script, params, options))
    }

    /// # Errors
    /// Configuration and schema errors only.
    pub fn try_fetch_one<T: FromRecord, S: BindSource>(
        &self,
        script: &str,
        params: &S,
        options: &CallOptions,
    ) -> Result<Outcome<Option<T>>, SqlEngineError> {
        self.runtime
            .block_on(self.inner.try_fetch_one(script, params, options))
    }

    /// # Errors
    /// Configuration and schema errors only.
    pub fn try_fetch_list<T: FromRecord, S: BindSource>(
        &self,
        script: &str,
        params: &S,
        options: &CallOptions,
    ) -> Result<Outcome<Vec<T>>, SqlEngineError> {
        self.runtime
            .block_on(self.inner.try_fetch_list(script, params, options))
    }
}

/// Iterator over the batches of a [`BatchStream`].
#[derive(Debug)]
pub struct BlockingBatches<'a, T> {
    runtime: &'a Runtime,
    inner: Option<BatchStream<T>>,
}

impl<T: FromRecord> Iterator for BlockingBatches<'_, T> {
    type Item = Result<Vec<T>, SqlEngineError>;

    fn next(&mut self) -> Option<Self::Item> {
        let stream = self.inner.as_mut()?;
        match self.runtime.block_on(stream.next_batch()) {
            Ok(Some(batch)) => Some(Ok(batch)),
            Ok(None) => {
                self.inner = None;
                None
            }
            Err(error) => {
                self.inner = None;
                Some(Err(error))
            }
        }
    }
}

impl<T> Drop for BlockingBatches<'_, T> {
    fn drop(&mut self) {
        if let Some(stream) = self.inner.take()
            && !stream.is_finished()
        {
            self.runtime.block_on(stream.release_quietly());
        }
    }
}

/// Iterator over the pages of a [`PagedStream`].
#[derive(Debug)]
pub struct BlockingPages<'a, T> {
    runtime: &'a Runtime,
    inner: Option<PagedStream<T>>,
}

impl<T: FromRecord> Iterator for BlockingPages<'_, T> {
    type Item = Result<Vec<T>, SqlEngineError>;

    fn next(&mut self) -> Option<Self::Item> {
        let stream = self.inner.as_mut()?;
        match self.runtime.block_on(stream.next_page()) {
            Ok(Some(page)) => Some(Ok(page)),
            Ok(None) => {
                self.inner = None;
                None
            }
            Err(error) => {
                self.inner = None;
                Some(Err(error))
            }
        }
    }
}

impl<T> Drop for BlockingPages<'_, T> {
    fn drop(&mut self) {
        if let Some(stream) = self.inner.take() {
            self.runtime.block_on(stream.release_quietly());
        }
    }
}

/// Synchronous [`Transaction`]. Dropped while open, it rolls back before
/// returning.
#[derive(Debug)]
pub struct BlockingTransaction<'a> {
    runtime: &'a Runtime,
    tx: Transaction,
}

impl BlockingTransaction<'_> {
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.tx.is_completed()
    }

    /// # Errors
    /// See [`Transaction::execute`].
    pub fn execute<S: BindSource>(&mut self, script: &str, params: &S) -> Result<u64, SqlEngineError> {
        self.runtime.block_on(self.tx.execute(script, params))
    }

    /// # Errors
    /// See [`Transaction::execute_with_output`].
    pub fn execute_with_output<S: BindSource>(&mut self, script: &str, params: &mut S) -> Result<u64, SqlEngineError> {
        self.runtime.block_on(self.tx.execute_with_output(script, params))
    }

    /// # Errors
    /// See [`Transaction::scalar`].
    pub fn scalar<V: SqlType, S: BindSource>(&mut self, script: &str, params: &S) -> Result<V, SqlEngineError> {
        self.runtime.block_on(self.tx.scalar(script, params))
    }

    /// # Errors
    /// See [`Transaction::fetch_one`].
    pub fn fetch_one<T: FromRecord, S: BindSource>(&mut self, script: &str, params: &S) -> Result<Option<T>, SqlEngineError> {
        self.runtime.block_on(self.tx.fetch_one(script, params))
    }

    /// # Errors
    /// See [`Transaction::fetch_list`].
    pub fn fetch_list<T: FromRecord, S: BindSource>(&mut self, script: &str, params: &S) -> Result<Vec<T>, SqlEngineError> {
        self.runtime.block_on(self.tx.fetch_list(script, params))
    }

    /// # Errors
    /// See [`Transaction::fetch_multiple`].
    pub fn fetch_multiple<M: MultiResult, S: BindSource>(&mut self, script: &str, params: &S) -> Result<M, SqlEngineError> {
        self.runtime.block_on(self.tx.fetch_multiple(script, params))
    }

    /// # Errors
    /// See [`Transaction::commit`].
    pub fn commit(&mut self) -> Result<(), SqlEngineError> {
        self.runtime.block_on(self.tx.commit())
    }

    /// # Errors
    /// See [`Transaction::rollback`].
    pub fn rollback(&mut self) -> Result<(), SqlEngineError> {
        self.runtime.block_on(self.tx.rollback())
    }
}

impl Drop for BlockingTransaction<'_> {
    fn drop(&mut self) {
        if self.tx.is_open() {
            warn!("blocking transaction dropped while open; rolling back");
            if let Err(error) = self.runtime.block_on(self.tx.rollback()) {
                warn!(error = %error, "rollback of dropped transaction failed");
            }
        }
    }
}
