//! Transaction coordinator.
//!
//! A [`Transaction`] owns exactly one [`Session`]. It is marked completed
//! before the native commit or rollback is issued, so a failing commit is
//! never followed by a second completion attempt. A transaction dropped
//! while still open is rolled back once on the current runtime.

use tracing::{debug, warn};

use crate::command::BindSource;
use crate::conversion::SqlType;
use crate::error::SqlEngineError;
use crate::executor::{CallOptions, MultiResult, TxFuture};
use crate::fingerprint::CallPath;
use crate::parser::FromRecord;
use crate::session::Session;

#[derive(Debug)]
pub struct Transaction {
    session: Option<Session>,
    options: CallOptions,
    opened: bool,
    completed: bool,
}

impl Transaction {
    /// Transaction over `session`, not yet begun.
    #[must_use]
    pub fn new(session: Session, options: CallOptions) -> Self {
        Self {
            session: Some(session),
            options,
            opened: false,
            completed: false,
        }
    }

    /// Issue the native `BEGIN`.
    ///
    /// # Errors
    /// `TransactionCompleted` if this transaction already finished; driver
    /// errors otherwise, after the session has been released.
    pub async fn begin(&mut self) -> Result<(), SqlEngineError> {
        if self.completed {
            return Err(SqlEngineError::TransactionCompleted);
        }
        if self.opened {
            return Ok(());
        }
        let session = self.session_mut()?;
        if let Err(error) = session.begin_native().await {
            self.completed = true;
            if let Some(mut session) = self.session.take()
                && let Err(release) = session.release().await
            {
                debug!(error = %release, "release after failed begin failed");
            }
            return Err(error);
        }
        self.opened = true;
        Ok(())
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.opened && !self.completed
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    fn session_mut(&mut self) -> Result<&mut Session, SqlEngineError> {
        self.session
            .as_mut()
            .ok_or(SqlEngineError::TransactionCompleted)
    }

    /// The session, if the transaction is open.
    fn active(&mut self) -> Result<&mut Session, SqlEngineError> {
        if !self.opened {
            return Err(SqlEngineError::NoActiveTransaction);
        }
        if self.completed {
            return Err(SqlEngineError::TransactionCompleted);
        }
        self.session_mut()
    }

    /// # Errors
    /// `NoActiveTransaction`/`TransactionCompleted`, then as
    /// [`Database::execute`](crate::executor::Database::execute).
    pub async fn execute<S: BindSource>(&mut self, script: &str, params: &S) -> Result<u64, SqlEngineError> {
        let options = self.options.clone();
        let session = self.active()?;
        let behavior = options.behavior(CallPath::NonQuery, false, session.context().options());
        session.run_execute(script, params, behavior).await
    }

    /// # Errors
    /// As [`execute`](Self::execute), plus output conversion errors.
    pub async fn execute_with_output<S: BindSource>(
        &mut self,
        script: &str,
        params: &mut S,
    ) -> Result<u64, SqlEngineError> {
        let options = self.options.clone();
        let session = self.active()?;
        let behavior = options.behavior(CallPath::NonQuery, false, session.context().options());
        session.run_execute_with_output(script, params, behavior).await
    }

    /// # Errors
    /// As [`execute`](Self::execute), plus schema errors.
    pub async fn scalar<V: SqlType, S: BindSource>(&mut self, script: &str, params: &S) -> Result<V, SqlEngineError> {
        let options = self.options.clone();
        let session = self.active()?;
        let behavior = options.behavior(CallPath::Scalar, false, session.context().options());
        session.run_scalar::<V, S>(script, params, behavior).await
    }

    /// # Errors
    /// As [`scalar`](Self::scalar).
    pub async fn fetch_one<T: FromRecord, S: BindSource>(
        &mut self,
        script: &str,
        params: &S,
    ) -> Result<Option<T>, SqlEngineError> {
        let options = self.options.clone();
        let session = self.active()?;
        let behavior = options.behavior(CallPath::Reader, false, session.context().options());
        session.run_fetch_one::<T, S>(script, params, behavior).await
    }

    /// # Errors
    /// As [`scalar`](Self::scalar).
    pub async fn fetch_list<T: FromRecord, S: BindSource>(
        &mut self,
        script: &str,
        params: &S,
    ) -> Result<Vec<T>, SqlEngineError> {
        let options = self.options.clone();
        let session = self.active()?;
        let behavior = options.behavior(CallPath::Reader, false, session.context().options());
        session.run_fetch_list::<T, S>(script, params, behavior).await
    }

    /// # Errors
    /// As [`scalar`](Self::scalar).
    pub async fn fetch_multiple<M: MultiResult, S: BindSource>(
        &mut self,
        script: &str,
        params: &S,
    ) -> Result<M, SqlEngineError> {
        let options = self.options.clone();
        let session = self.active()?;
        let behavior = options.behavior(CallPath::Reader, false, session.context().options());
        session.run_fetch_multiple::<M, S>(script, params, behavior).await
    }

    /// Commit and release the session.
    ///
    /// # Errors
    /// `NoActiveTransaction` before [`begin`](Self::begin),
    /// `TransactionCompleted` after a commit or rollback, driver errors
    /// otherwise.
    pub async fn commit(&mut self) -> Result<(), SqlEngineError> {
        self.active()?;
        self.completed = true;
        let mut session = self.session.take().ok_or(SqlEngineError::TransactionCompleted)?;
        let committed = session.commit_native().await;
        let released = session.release().await;
        debug!(ok = committed.is_ok(), "transaction committed");
        committed?;
        released
    }

    /// Roll back and release the session.
    ///
    /// # Errors
    /// As [`commit`](Self::commit).
    pub async fn rollback(&mut self) -> Result<(), SqlEngineError> {
        self.active()?;
        self.completed = true;
        let mut session = self.session.take().ok_or(SqlEngineError::TransactionCompleted)?;
        let rolled_back = session.rollback_native().await;
        let released = session.release().await;
        debug!(ok = rolled_back.is_ok(), "transaction rolled back");
        rolled_back?;
        released
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.opened || self.completed {
            return;
        }
        self.completed = true;
        let Some(mut session) = self.session.take() else {
            return;
        };
        warn!(provider = %session.provider(), "transaction dropped while open; rolling back");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(error) = session.rollback_native().await {
                        warn!(error = %error, "rollback of dropped transaction failed");
                    }
                    if let Err(error) = session.release().await {
                        debug!(error = %error, "release of dropped transaction failed");
                    }
                });
            }
            Err(_) => {
                debug!("no runtime available; connection closes without an explicit rollback");
            }
        }
    }
}

/// Run `work` on `tx`, committing on `Ok` and rolling back on `Err` unless
/// `work` already completed the transaction.
///
/// # Errors
/// The error `work` returned, or the commit error.
pub async fn run_in_transaction<R, F>(mut tx: Transaction, work: F) -> Result<R, SqlEngineError>
where
    R: Send,
    F: for<'t> FnOnce(&'t mut Transaction) -> TxFuture<'t, R> + Send,
{
    let result = work(&mut tx).await;
    match result {
        Ok(value) => {
            if !tx.is_completed() {
                tx.commit().await?;
            }
            Ok(value)
        }
        Err(error) => {
            if !tx.is_completed()
                && let Err(rollback) = tx.rollback().await
            {
                warn!(error = %rollback, "rollback after failed transaction body failed");
            }
            Err(error)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::command::ParamList;
    use crate::context::EngineContext;
    use crate::driver::NativeConnector;
    use crate::test_utils::{MockConnector, int_column, mock_database};
    use crate::types::DatabaseType;

    fn unopened(connector: &Arc<MockConnector>) -> Transaction {
        let native: Arc<dyn NativeConnector> = connector.clone();
        let session = Session::new(Arc::new(EngineContext::default()), native).unwrap();
        Transaction::new(session, CallOptions::new())
    }

    #[tokio::test]
    async fn completion_is_checked_before_the_native_call() {
        let connector = Arc::new(MockConnector::new(DatabaseType::Postgres));
        let mut tx = unopened(&connector);
        assert!(matches!(tx.commit().await, Err(SqlEngineError::NoActiveTransaction)));
        assert!(matches!(tx.rollback().await, Err(SqlEngineError::NoActiveTransaction)));

        tx.begin().await.unwrap();
        tx.execute("update t set n = 1", &()).await.unwrap();
        tx.commit().await.unwrap();
        assert!(matches!(tx.commit().await, Err(SqlEngineError::TransactionCompleted)));
        assert!(matches!(tx.rollback().await, Err(SqlEngineError::TransactionCompleted)));
        assert!(matches!(
            tx.execute("update t set n = 2", &()).await,
            Err(SqlEngineError::TransactionCompleted)
        ));

        let stats = connector.stats();
        assert_eq!((stats.begins, stats.commits, stats.rollbacks), (1, 1, 0));
        assert_eq!(stats.closes, 1);
    }

    #[tokio::test]
    async fn dropping_an_open_transaction_rolls_back_once() {
        let connector = Arc::new(MockConnector::new(DatabaseType::Sqlite));
        {
            let mut tx = unopened(&connector);
            tx.begin().await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        let stats = connector.stats();
        assert_eq!(stats.rollbacks, 1);
        assert_eq!(stats.closes, 1);
    }

    #[tokio::test]
    async fn run_in_transaction_commits_or_rolls_back() {
        let (connector, db) = mock_database(DatabaseType::Postgres);
        connector.push_result(vec![int_column("n", [5])]);
        let value: i64 = db
            .run_in_transaction(&CallOptions::new(), |tx| {
                Box::pin(async move {
                    tx.execute("insert into t values (@n)", &ParamList::new().add("n", 5_i64))
                        .await?;
                    tx.scalar::<i64, _>("select n from t", &()).await
                })
            })
            .await
            .unwrap();
        assert_eq!(value, 5);

        connector.fail_on("boom", "constraint violated");
        let failed: Result<u64, _> = db
            .run_in_transaction(&CallOptions::new(), |tx| {
                Box::pin(async move { tx.execute("insert into boom values (1)", &()).await })
            })
            .await;
        assert!(failed.is_err());

        let stats = connector.stats();
        assert_eq!((stats.begins, stats.commits, stats.rollbacks), (2, 1, 1));
        assert_eq!(stats.connects, stats.closes);
    }

    #[tokio::test]
    async fn work_that_completes_the_transaction_itself_is_left_alone() {
        let (connector, db) = mock_database(DatabaseType::Mysql);
        db.run_in_transaction(&CallOptions::new(), |tx| {
            Box::pin(async move { tx.rollback().await })
        })
        .await
        .unwrap();
        let stats = connector.stats();
        assert_eq!((stats.commits, stats.rollbacks), (0, 1));
    }
}
