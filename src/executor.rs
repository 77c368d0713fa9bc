//! Façade operations.
//!
//! A [`Database`] is a connector plus the engine context it compiles into.
//! Every call opens one [`Session`], runs one operation and releases the
//! session before returning; streams and transactions keep theirs until they
//! finish.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::cancel;
use crate::command::BindSource;
use crate::config::EngineOptions;
use crate::context::EngineContext;
use crate::conversion::SqlType;
use crate::driver::{CommandType, NativeConnector, connector_from_url};
use crate::error::SqlEngineError;
use crate::fingerprint::{Behavior, CallPath};
use crate::outcome::{Outcome, capture};
use crate::parser::FromRecord;
use crate::session::{BatchStream, PagedStream, Session};
use crate::transaction::{self, Transaction};
use crate::types::{DatabaseType, RowValues};

/// Future returned by the closure given to
/// [`Database::run_in_transaction`].
pub type TxFuture<'t, R> = Pin<Box<dyn Future<Output = Result<R, SqlEngineError>> + Send + 't>>;

/// Per-call knobs. Unset fields fall back to the engine options.
///
/// ```rust
/// use std::time::Duration;
/// use sql_engine::prelude::*;
///
/// let options = CallOptions::procedure()
///     .with_result_cursors(2)
///     .with_timeout(Duration::from_secs(5));
/// assert_eq!(options.result_cursors, 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub command_type: CommandType,
    pub prepare: Option<bool>,
    pub strict: Option<bool>,
    pub result_cursors: u8,
    pub timeout: Option<Duration>,
    pub cancellation: Option<CancellationToken>,
}

impl CallOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Treat the script as a stored procedure name.
    #[must_use]
    pub fn procedure() -> Self {
        Self {
            command_type: CommandType::StoredProcedure,
            ..Self::default()
        }
    }

    /// Treat the script as an anonymous block (`BEGIN ... END`).
    #[must_use]
    pub fn anonymous_block() -> Self {
        Self {
            command_type: CommandType::AnonymousBlock,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_prepare(mut self, prepare: bool) -> Self {
        self.prepare = Some(prepare);
        self
    }

    #[must_use]
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = Some(strict);
        self
    }

    #[must_use]
    pub fn with_result_cursors(mut self, cursors: u8) -> Self {
        self.result_cursors = cursors;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub(crate) fn behavior(&self, call: CallPath, paging: bool, engine: &EngineOptions) -> Behavior {
        Behavior {
            command_type: self.command_type,
            call,
            paging,
            result_cursors: self.result_cursors,
            prepare: self.prepare.unwrap_or(engine.prepare_statements),
            strict: self.strict.unwrap_or(engine.strict_mapping),
        }
    }
}

/// Results of a multi-result-set read, one list per set in order.
#[async_trait]
pub trait MultiResult: Sized + Send {
    /// Read from a session whose reader is positioned on the first set.
    async fn read_from(session: &mut Session) -> Result<Self, SqlEngineError>;
}

macro_rules! multi_result {
    ($first:ident $(, $rest:ident)+) => {
        #[async_trait]
        impl<$first: FromRecord, $($rest: FromRecord),+> MultiResult for (Vec<$first>, $(Vec<$rest>),+) {
            async fn read_from(session: &mut Session) -> Result<Self, SqlEngineError> {
                Ok((
                    session.read_list::<$first>().await?,
                    $(session.read_next::<$rest>().await?,)+
                ))
            }
        }
    };
}

multi_result!(A, B);
multi_result!(A, B, C);
multi_result!(A, B, C, D);
multi_result!(A, B, C, D, E);
multi_result!(A, B, C, D, E, F);
multi_result!(A, B, C, D, E, F, G);

/// `name = value` pairs for a bind source, for detailed failure messages.
pub(crate) fn dump_parameters<S: BindSource>(source: &S) -> String {
    source
        .describe()
        .iter()
        .map(|member| format!("{} = {}", member.decl.name, (member.get)(source)))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Operation bodies shared by [`Database`] and [`Transaction`]. None of them
/// release the session.
impl Session {
    pub(crate) async fn run_execute<S: BindSource>(
        &mut self,
        script: &str,
        params: &S,
        behavior: Behavior,
    ) -> Result<u64, SqlEngineError> {
        self.prepare(script, params, behavior).await?;
        self.execute_non_query().await
    }

    pub(crate) async fn run_execute_with_output<S: BindSource>(
        &mut self,
        script: &str,
        params: &mut S,
        behavior: Behavior,
    ) -> Result<u64, SqlEngineError> {
        let compiled = self.prepare(script, &*params, behavior).await?;
        let affected = self.execute_non_query().await?;
        self.set_output_values(&compiled, params).await?;
        Ok(affected)
    }

    pub(crate) async fn run_scalar<V: SqlType, S: BindSource>(
        &mut self,
        script: &str,
        params: &S,
        behavior: Behavior,
    ) -> Result<V, SqlEngineError> {
        match self.run_fetch_one::<V, S>(script, params, behavior).await? {
            Some(value) => Ok(value),
            None => V::from_value(RowValues::Null),
        }
    }

    pub(crate) async fn run_fetch_one<T: FromRecord, S: BindSource>(
        &mut self,
        script: &str,
        params: &S,
        behavior: Behavior,
    ) -> Result<Option<T>, SqlEngineError> {
        self.prepare(script, params, behavior).await?;
        self.execute_reader().await?;
        let row = self.read_single::<T>().await;
        self.close_reader().await?;
        row
    }

    pub(crate) async fn run_fetch_list<T: FromRecord, S: BindSource>(
        &mut self,
        script: &str,
        params: &S,
        behavior: Behavior,
    ) -> Result<Vec<T>, SqlEngineError> {
        self.prepare(script, params, behavior).await?;
        self.execute_reader().await?;
        let rows = self.read_list::<T>().await;
        self.close_reader().await?;
        rows
    }

    pub(crate) async fn run_fetch_multiple<M: MultiResult, S: BindSource>(
        &mut self,
        script: &str,
        params: &S,
        behavior: Behavior,
    ) -> Result<M, SqlEngineError> {
        self.prepare(script, params, behavior).await?;
        self.execute_reader().await?;
        let sets = M::read_from(self).await;
        self.close_reader().await?;
        sets
    }
}

/// Release `session`, then hand back `result`. A release failure only
/// surfaces when the operation itself succeeded.
async fn finish<R>(mut session: Session, result: Result<R, SqlEngineError>) -> Result<R, SqlEngineError> {
    let released = session.release().await;
    let value = result?;
    released.map(|()| value)
}

/// Entry point for running SQL against one data source.
///
/// ```rust,no_run
/// use sql_engine::prelude::*;
///
/// # async fn demo() -> Result<(), SqlEngineError> {
/// let db = Database::connect(DatabaseType::Sqlite, ":memory:")?;
/// let options = CallOptions::new();
/// db.execute("CREATE TABLE t (id INTEGER, name TEXT)", &(), &options).await?;
///
/// let params = ParamList::new().add("id", 1_i64).add("name", "a".to_string());
/// db.execute("INSERT INTO t VALUES (@id, @name)", &params, &options).await?;
///
/// let count: i64 = db.scalar("SELECT COUNT(*) FROM t", &(), &options).await?;
/// assert_eq!(count, 1);
/// # Ok(()) }
/// ```
#[derive(Debug, Clone)]
pub struct Database {
    connector: Arc<dyn NativeConnector>,
    ctx: Arc<EngineContext>,
}

impl Database {
    /// Database over `connector` using the shared engine context.
    #[must_use]
    pub fn new(connector: Arc<dyn NativeConnector>) -> Self {
        Self::with_context(connector, EngineContext::shared())
    }

    #[must_use]
    pub fn with_context(connector: Arc<dyn NativeConnector>, ctx: Arc<EngineContext>) -> Self {
        Self { connector, ctx }
    }

    /// Build the native connector for `provider` from a connection string.
    ///
    /// # Errors
    /// See [`connector_from_url`].
    pub fn connect(provider: DatabaseType, url: &str) -> Result<Self, SqlEngineError> {
        Ok(Self::new(connector_from_url(provider, url)?))
    }

    #[must_use]
    pub fn provider(&self) -> DatabaseType {
        self.connector.database_type()
    }

    #[must_use]
    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    /// A new, unopened session with the call's cancellation and timeout.
    ///
    /// # Errors
    /// `Cancelled` if the token has already fired; registry errors otherwise.
    pub fn session(&self, options: &CallOptions) -> Result<Session, SqlEngineError> {
        cancel::check(options.cancellation.as_ref())?;
        Ok(
            Session::new(Arc::clone(&self.ctx), Arc::clone(&self.connector))?
                .with_cancellation(options.cancellation.clone())
                .with_timeout(options.timeout),
        )
    }

    fn behavior(&self, options: &CallOptions, call: CallPath, paging: bool) -> Behavior {
        options.behavior(call, paging, self.ctx.options())
    }

    /// Run a non-query and return the affected row count.
    ///
    /// # Errors
    /// Configuration, driver and cancellation errors.
    pub async fn execute<S: BindSource>(
        &self,
        script: &str,
        params: &S,
        options: &CallOptions,
    ) -> Result<u64, SqlEngineError> {
        let mut session = self.session(options)?;
        let behavior = self.behavior(options, CallPath::NonQuery, false);
        let result = session.run_execute(script, params, behavior).await;
        finish(session, result).await
    }

    /// Run a non-query and copy output, input-output and return values back
    /// onto `params`.
    ///
    /// # Errors
    /// As [`execute`](Self::execute), plus output conversion errors.
    pub async fn execute_with_output<S: BindSource>(
        &self,
        script: &str,
        params: &mut S,
        options: &CallOptions,
    ) -> Result<u64, SqlEngineError> {
        let mut session = self.session(options)?;
        let behavior = self.behavior(options, CallPath::NonQuery, false);
        let result = session.run_execute_with_output(script, params, behavior).await;
        finish(session, result).await
    }

    /// First column of the first row, converted to `V`. An empty result
    /// gives `V`'s null value.
    ///
    /// # Errors
    /// As [`execute`](Self::execute), plus schema and conversion errors.
    pub async fn scalar<V: SqlType, S: BindSource>(
        &self,
        script: &str,
        params: &S,
        options: &CallOptions,
    ) -> Result<V, SqlEngineError> {
        let mut session = self.session(options)?;
        let behavior = self.behavior(options, CallPath::Scalar, false);
        let result = session.run_scalar::<V, S>(script, params, behavior).await;
        finish(session, result).await
    }

    /// # Errors
    /// As [`scalar`](Self::scalar).
    pub async fn fetch_one<T: FromRecord, S: BindSource>(
        &self,
        script: &str,
        params: &S,
        options: &CallOptions,
    ) -> Result<Option<T>, SqlEngineError> {
        let mut session = self.session(options)?;
        let behavior = self.behavior(options, CallPath::Reader, false);
        let result = session.run_fetch_one::<T, S>(script, params, behavior).await;
        finish(session, result).await
    }

    /// # Errors
    /// As [`scalar`](Self::scalar).
    pub async fn fetch_list<T: FromRecord, S: BindSource>(
        &self,
        script: &str,
        params: &S,
        options: &CallOptions,
    ) -> Result<Vec<T>, SqlEngineError> {
        let mut session = self.session(options)?;
        let behavior = self.behavior(options, CallPath::Reader, false);
        let result = session.run_fetch_list::<T, S>(script, params, behavior).await;
        finish(session, result).await
    }

    /// Read two to seven result sets into a tuple of lists. Sets the
    /// script does not produce come back empty.
    ///
    /// # Errors
    /// As [`scalar`](Self::scalar).
    pub async fn fetch_multiple<M: MultiResult, S: BindSource>(
        &self,
        script: &str,
        params: &S,
        options: &CallOptions,
    ) -> Result<M, SqlEngineError> {
        let mut session = self.session(options)?;
        let behavior = self.behavior(options, CallPath::Reader, false);
        let result = session.run_fetch_multiple::<M, S>(script, params, behavior).await;
        finish(session, result).await
    }

    /// Open a reader and hand its rows out in batches of `batch_size`.
    ///
    /// # Errors
    /// Errors raised before the first batch; the session is released then.
    pub async fn stream<T: FromRecord, S: BindSource>(
        &self,
        script: &str,
        params: &S,
        batch_size: usize,
        options: &CallOptions,
    ) -> Result<BatchStream<T>, SqlEngineError> {
        let mut session = self.session(options)?;
        let behavior = self.behavior(options, CallPath::Reader, false);
        let opened = match session.prepare(script, params, behavior).await {
            Ok(_) => session.execute_reader().await,
            Err(error) => Err(error),
        };
        match opened {
            Ok(()) => Ok(BatchStream::new(session, batch_size)),
            Err(error) => finish(session, Err(error)).await,
        }
    }

    /// Page through `script` from `offset`, `page_size` rows per execution.
    ///
    /// # Errors
    /// Configuration errors (paging needs a text command) and errors raised
    /// while preparing; the session is released then.
    pub async fn paged<T: FromRecord, S: BindSource>(
        &self,
        script: &str,
        params: &S,
        offset: u64,
        page_size: u64,
        options: &CallOptions,
    ) -> Result<PagedStream<T>, SqlEngineError> {
        let mut session = self.session(options)?;
        let behavior = self.behavior(options, CallPath::Reader, true);
        match session.prepare(script, params, behavior).await {
            Ok(compiled) => Ok(PagedStream::new(session, compiled, offset, page_size)),
            Err(error) => finish(session, Err(error)).await,
        }
    }

    /// Open a session and start a transaction on it.
    ///
    /// # Errors
    /// Connection and driver errors from `BEGIN`.
    pub async fn begin(&self, options: &CallOptions) -> Result<Transaction, SqlEngineError> {
        let mut tx = Transaction::new(self.session(options)?, options.clone());
        tx.begin().await?;
        Ok(tx)
    }

    /// Run `work` inside a transaction; commit when it returns `Ok` and roll
    /// back when it returns `Err`, unless it already completed the
    /// transaction itself.
    ///
    /// ```rust,no_run
    /// use sql_engine::prelude::*;
    ///
    /// # async fn demo(db: Database) -> Result<(), SqlEngineError> {
    /// let moved = db
    ///     .run_in_transaction(&CallOptions::new(), |tx| {
    ///         Box::pin(async move {
    ///             let params = ParamList::new().add("id", 1_i64);
    ///             tx.execute("DELETE FROM queue WHERE id = @id", &params).await
    ///         })
    ///     })
    ///     .await?;
    /// # let _ = moved;
    /// # Ok(()) }
    /// ```
    ///
    /// # Errors
    /// The error `work` returned, or commit/begin errors.
    pub async fn run_in_transaction<R, F>(&self, options: &CallOptions, work: F) -> Result<R, SqlEngineError>
    where
        R: Send,
        F: for<'t> FnOnce(&'t mut Transaction) -> TxFuture<'t, R> + Send,
    {
        let tx = self.begin(options).await?;
        transaction::run_in_transaction(tx, work).await
    }

    /// [`execute`](Self::execute) with execution failures captured.
    ///
    /// # Errors
    /// Configuration and schema errors only.
    pub async fn try_execute<S: BindSource>(
        &self,
        script: &str,
        params: &S,
        options: &CallOptions,
    ) -> Result<Outcome<u64>, SqlEngineError> {
        let result = self.execute(script, params, options).await;
        capture(result, self.ctx.options(), script, || dump_parameters(params))
    }

    /// # Errors
    /// Configuration and schema errors only.
    pub async fn try_scalar<V: SqlType, S: BindSource>(
        &self,
        script: &str,
        params: &S,
        options: &CallOptions,
    ) -> Result<Outcome<V>, SqlEngineError> {
        let result = self.scalar::<V, S>(script, params, options).await;
        capture(result, self.ctx.options(), script, || dump_parameters(params))
    }

    /// # Errors
    /// Configuration and schema errors only.
    pub async fn try_fetch_one<T: FromRecord, S: BindSource>(
        &self,
        script: &str,
        params: &S,
        options: &CallOptions,
    ) -> Result<Outcome<Option<T>>, SqlEngineError> {
        let result = self.fetch_one::<T, S>(script, params, options).await;
        capture(result, self.ctx.options(), script, || dump_parameters(params))
    }

    /// # Errors
    /// Configuration and schema errors only.
    pub async fn try_fetch_list<T: FromRecord, S: BindSource>(
        &self,
        script: &str,
        params: &S,
        options: &CallOptions,
    ) -> Result<Outcome<Vec<T>>, SqlEngineError> {
        let result = self.fetch_list::<T, S>(script, params, options).await;
        capture(result, self.ctx.options(), script, || dump_parameters(params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ParamList;
    use crate::driver::ColumnType;
    use crate::outcome::OutcomeStatus;
    use crate::record;
    use crate::test_utils::{int_column, mock_database, result_set};
    use crate::types::ValueType;

    record! {
        #[derive(Debug, Default, Clone, PartialEq)]
        struct Order {
            id: i64,
            status: String,
        }
    }

    fn orders() -> crate::driver::ResultBuffer {
        result_set(
            &[("id", ColumnType::Int64), ("status", ColumnType::Text)],
            vec![
                vec![RowValues::Int(1), RowValues::Text("open".into())],
                vec![RowValues::Int(2), RowValues::Text("shipped".into())],
            ],
        )
    }

    #[tokio::test]
    async fn every_call_releases_its_session() {
        let (connector, db) = mock_database(DatabaseType::Postgres);
        connector.push_result(vec![orders()]);
        connector.push_result(vec![int_column("count", [2])]);
        let options = CallOptions::new();

        let list: Vec<Order> = db.fetch_list("select id, status from orders", &(), &options).await.unwrap();
        assert_eq!(list[1].status, "shipped");
        let count: i64 = db.scalar("select count(*) from orders", &(), &options).await.unwrap();
        assert_eq!(count, 2);
        let affected = db
            .execute("delete from orders where id = @id", &ParamList::new().add("id", 1_i64), &options)
            .await
            .unwrap();
        assert_eq!(affected, 1);

        let stats = connector.stats();
        assert_eq!(stats.connects, 3);
        assert_eq!(stats.closes, 3);
        assert_eq!(stats.readers_opened, stats.readers_closed);
    }

    #[tokio::test]
    async fn empty_scalars_fall_back_to_the_null_value() {
        let (connector, db) = mock_database(DatabaseType::Sqlite);
        connector.push_result(vec![int_column("n", [])]);
        let value: Option<i64> = db.scalar("select n from t", &(), &CallOptions::new()).await.unwrap();
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn multiple_result_sets_fill_a_tuple() {
        let (connector, db) = mock_database(DatabaseType::Mssql);
        connector.push_result(vec![orders(), int_column("total", [2])]);
        let (list, totals, missing): (Vec<Order>, Vec<i64>, Vec<String>) = db
            .fetch_multiple(
                "select id, status from orders; select count(*) total from orders",
                &(),
                &CallOptions::new(),
            )
            .await
            .unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(totals, vec![2]);
        assert!(missing.is_empty());
    }

    #[tokio::test]
    async fn output_parameters_are_copied_back() {
        let (connector, db) = mock_database(DatabaseType::Mssql);
        connector.set_output("total", RowValues::Int(9));
        let mut params = ParamList::new()
            .add("customer", 3_i64)
            .add_output("total", ValueType::I64);
        db.execute_with_output("order_total", &mut params, &CallOptions::procedure())
            .await
            .unwrap();
        assert_eq!(params.get::<i64>("total").unwrap(), 9);
        assert!(connector.executed_scripts()[0].starts_with("EXEC order_total"));
    }

    #[tokio::test]
    async fn try_variants_capture_execution_failures_only() {
        let (connector, db) = mock_database(DatabaseType::Sqlite);
        connector.fail_on("missing", "no such table: missing");
        let outcome = db
            .try_execute("delete from missing", &(), &CallOptions::new())
            .await
            .unwrap();
        assert_eq!(
            outcome.status,
            OutcomeStatus::Failed("SQL execution error: no such table: missing".into())
        );

        let config = db.try_execute("   ", &(), &CallOptions::new()).await;
        assert!(matches!(config, Err(SqlEngineError::ConfigError(_))));
        assert_eq!(connector.stats().connects, connector.stats().closes);
    }

    #[tokio::test]
    async fn cancelled_before_start_never_connects() {
        let (connector, db) = mock_database(DatabaseType::Sqlite);
        let token = CancellationToken::new();
        token.cancel();
        let options = CallOptions::new().with_cancellation(token);
        let outcome = db.try_fetch_list::<Order, _>("select * from orders", &(), &options).await.unwrap();
        assert!(outcome.is_cancelled());
        assert_eq!(connector.stats().connects, 0);
    }

    #[tokio::test]
    async fn streams_release_on_their_last_batch() {
        let (connector, db) = mock_database(DatabaseType::Sqlite);
        connector.push_result(vec![int_column("n", 0..5)]);
        let mut stream = db
            .stream::<i64, _>("select n from t", &(), 2, &CallOptions::new())
            .await
            .unwrap();
        let mut seen = Vec::new();
        while let Some(batch) = stream.next_batch().await.unwrap() {
            assert_eq!(connector.stats().closes, 0);
            seen.extend(batch);
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert_eq!(connector.stats().closes, 1);
    }

    #[tokio::test]
    async fn paging_needs_a_text_command() {
        let (connector, db) = mock_database(DatabaseType::Sqlite);
        let err = db
            .paged::<i64, _>("list_items", &(), 0, 10, &CallOptions::procedure())
            .await
            .unwrap_err();
        assert!(matches!(err, SqlEngineError::ConfigError(_)));
        assert_eq!(connector.stats().connects, 0);
    }
}
