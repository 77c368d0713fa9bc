use std::marker::PhantomData;
use std::sync::Arc;

use tracing::{debug, trace};

use super::Session;
use crate::command::{BindSource, CompiledCommand};
use crate::driver::NativeCommand;
use crate::error::SqlEngineError;
use crate::parser::FromRecord;

type Repage = Box<dyn Fn(&mut NativeCommand, u64, u64) -> Result<(), SqlEngineError> + Send + Sync>;

/// Pages of a paging-compiled command. The bound command is kept and only
/// its offset and limit values change between executions; a page shorter
/// than `page_size` ends the stream.
pub struct PagedStream<T> {
    session: Session,
    repage: Repage,
    offset: u64,
    page_size: u64,
    pages: usize,
    finished: bool,
    _rows: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for PagedStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagedStream")
            .field("offset", &self.offset)
            .field("page_size", &self.page_size)
            .field("pages", &self.pages)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl<T> PagedStream<T> {
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Release without reporting errors, for drop paths.
    pub(crate) async fn release_quietly(mut self) {
        self.finished = true;
        if let Err(error) = self.session.release().await {
            debug!(error = %error, "paged stream release failed");
        }
    }
}

impl<T: FromRecord> PagedStream<T> {
    /// Wrap a session whose command was prepared from `compiled`.
    pub(crate) fn new<S: BindSource>(
        session: Session,
        compiled: Arc<CompiledCommand<S>>,
        offset: u64,
        page_size: u64,
    ) -> Self {
        Self {
            session,
            repage: Box::new(move |command: &mut NativeCommand, offset: u64, limit: u64| {
                compiled.set_paging(command, offset, limit)
            }),
            offset,
            page_size: page_size.max(1),
            pages: 0,
            finished: false,
            _rows: PhantomData,
        }
    }

    /// Execute the next page, or `None` once a short page has been seen.
    ///
    /// # Errors
    /// Driver, parse and cancellation errors; the session is released first.
    pub async fn next_page(&mut self) -> Result<Option<Vec<T>>, SqlEngineError> {
        if self.finished {
            return Ok(None);
        }
        let rows = match self.fetch_page().await {
            Ok(rows) => rows,
            Err(error) => {
                self.finish().await;
                return Err(error);
            }
        };
        trace!(offset = self.offset, rows = rows.len(), "page read");
        self.offset += self.page_size;
        if (rows.len() as u64) < self.page_size {
            self.finish().await;
        }
        if rows.is_empty() {
            return Ok(None);
        }
        self.pages += 1;
        Ok(Some(rows))
    }

    async fn fetch_page(&mut self) -> Result<Vec<T>, SqlEngineError> {
        let command = self
            .session
            .command_mut()
            .ok_or_else(|| SqlEngineError::ConfigError("paged stream has no bound command".into()))?;
        (self.repage)(command, self.offset, self.page_size)?;
        self.session.execute_reader().await?;
        let limit = usize::try_from(self.page_size).unwrap_or(usize::MAX);
        let rows = self.session.read_batch::<T>(limit).await?;
        self.session.close_reader().await?;
        Ok(rows)
    }

    /// Drain every remaining page into one list.
    ///
    /// # Errors
    /// See [`next_page`](Self::next_page).
    pub async fn collect_all(mut self) -> Result<Vec<T>, SqlEngineError> {
        let mut rows = Vec::new();
        while let Some(page) = self.next_page().await? {
            rows.extend(page);
        }
        Ok(rows)
    }

    /// Stop early and release the session.
    ///
    /// # Errors
    /// Returns the session's release error.
    pub async fn release(mut self) -> Result<(), SqlEngineError> {
        self.finished = true;
        self.session.release().await
    }

    #[must_use]
    pub fn pages_read(&self) -> usize {
        self.pages
    }

    /// Offset the next page will be read from.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    async fn finish(&mut self) {
        self.finished = true;
        debug!(pages = self.pages, "paged stream finished");
        if let Err(error) = self.session.release().await {
            debug!(error = %error, "paged stream release failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ParamList;
    use crate::context::EngineContext;
    use crate::driver::NativeConnector;
    use crate::fingerprint::Behavior;
    use crate::test_utils::MockConnector;
    use crate::types::DatabaseType;

    #[tokio::test]
    async fn pages_until_a_short_page_and_reuses_the_command() {
        let connector = Arc::new(MockConnector::new(DatabaseType::Sqlite));
        connector.set_table("n", (0..7).map(crate::types::RowValues::Int).collect());
        let native: Arc<dyn NativeConnector> = connector.clone();
        let mut session = Session::new(Arc::new(EngineContext::default()), native).unwrap();
        let params = ParamList::new().add("min", 0_i64);
        let compiled = session
            .prepare(
                "select n from t where n >= @min order by n",
                &params,
                Behavior::reader().with_paging(true),
            )
            .await
            .unwrap();
        let mut stream = PagedStream::<i64>::new(session, compiled, 0, 3);
        let mut pages = Vec::new();
        while let Some(page) = stream.next_page().await.unwrap() {
            pages.push(page);
        }
        assert_eq!(pages, vec![vec![0, 1, 2], vec![3, 4, 5], vec![6]]);
        assert_eq!(stream.offset(), 9);

        let stats = connector.stats();
        assert_eq!(stats.connects, 1);
        assert_eq!(stats.closes, 1);
        assert_eq!(stats.executed.len(), 3);
    }

    #[tokio::test]
    async fn an_exact_multiple_ends_on_an_empty_page() {
        let connector = Arc::new(MockConnector::new(DatabaseType::Postgres));
        connector.set_table("n", (0..6).map(crate::types::RowValues::Int).collect());
        let native: Arc<dyn NativeConnector> = connector.clone();
        let mut session = Session::new(Arc::new(EngineContext::default()), native).unwrap();
        let compiled = session
            .prepare("select n from t order by n", &(), Behavior::reader().with_paging(true))
            .await
            .unwrap();
        let mut stream = PagedStream::<i64>::new(session, compiled, 0, 3);

        assert_eq!(stream.next_page().await.unwrap(), Some(vec![0, 1, 2]));
        assert_eq!(stream.next_page().await.unwrap(), Some(vec![3, 4, 5]));
        assert!(!stream.is_finished());
        assert_eq!(stream.next_page().await.unwrap(), None);
        assert!(stream.is_finished());
        assert_eq!(stream.next_page().await.unwrap(), None);
        assert_eq!(stream.pages_read(), 2);

        let stats = connector.stats();
        assert_eq!(stats.executed.len(), 3);
        assert_eq!(stats.connects, stats.closes);
        assert_eq!(stats.readers_opened, stats.readers_closed);
    }
}
