use std::marker::PhantomData;

use tracing::debug;

use super::Session;
use crate::error::SqlEngineError;
use crate::parser::FromRecord;

/// Rows of one open reader, handed out in batches as the consumer asks.
///
/// The session is released when the last (short or empty) batch is read,
/// when [`release`](Self::release) is called, or on drop, where the close
/// runs as a task on the current runtime.
#[derive(Debug)]
pub struct BatchStream<T> {
    session: Session,
    batch_size: usize,
    batches: usize,
    finished: bool,
    _rows: PhantomData<fn() -> T>,
}

impl<T> BatchStream<T> {
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Release without reporting errors, for drop paths.
    pub(crate) async fn release_quietly(mut self) {
        self.finished = true;
        if let Err(error) = self.session.release().await {
            debug!(error = %error, "batch stream release failed");
        }
    }
}

impl<T: FromRecord> BatchStream<T> {
    /// Wrap a session whose reader is already open.
    pub(crate) fn new(session: Session, batch_size: usize) -> Self {
        Self {
            session,
            batch_size: batch_size.max(1),
            batches: 0,
            finished: false,
            _rows: PhantomData,
        }
    }

    /// Next batch, or `None` once the result set is exhausted.
    ///
    /// # Errors
    /// Parse, driver and cancellation errors. The session is released before
    /// the error is returned.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<T>>, SqlEngineError> {
        if self.finished {
            return Ok(None);
        }
        let rows = match self.session.read_batch::<T>(self.batch_size).await {
            Ok(rows) => rows,
            Err(error) => {
                self.finish().await;
                return Err(error);
            }
        };
        if rows.len() < self.batch_size {
            self.finish().await;
        }
        if rows.is_empty() {
            return Ok(None);
        }
        self.batches += 1;
        Ok(Some(rows))
    }

    /// Drain every remaining batch into one list.
    ///
    /// # Errors
    /// See [`next_batch`](Self::next_batch).
    pub async fn collect_all(mut self) -> Result<Vec<T>, SqlEngineError> {
        let mut rows = Vec::new();
        while let Some(batch) = self.next_batch().await? {
            rows.extend(batch);
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
    pub fn batches_read(&self) -> usize {
        self.batches
    }

    async fn finish(&mut self) {
        self.finished = true;
        debug!(batches = self.batches, "batch stream finished");
        if let Err(error) = self.session.release().await {
            debug!(error = %error, "batch stream release failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::context::EngineContext;
    use crate::driver::{ColumnType, NativeColumn, NativeConnector, ResultBuffer};
    use crate::fingerprint::Behavior;
    use crate::test_utils::MockConnector;
    use crate::types::{DatabaseType, RowValues};

    async fn stream_of(rows: i64, batch: usize) -> (Arc<MockConnector>, BatchStream<i64>) {
        let connector = Arc::new(MockConnector::new(DatabaseType::Sqlite));
        connector.push_result(vec![
            ResultBuffer::new(vec![NativeColumn::new("n", ColumnType::Int64)])
                .with_rows((0..rows).map(|n| vec![RowValues::Int(n)]).collect()),
        ]);
        let native: Arc<dyn NativeConnector> = connector.clone();
        let mut session = Session::new(Arc::new(EngineContext::default()), native).unwrap();
        session.prepare("select n from t", &(), Behavior::reader()).await.unwrap();
        session.execute_reader().await.unwrap();
        (connector, BatchStream::new(session, batch))
    }

    #[tokio::test]
    async fn yields_ceiling_batches_and_releases_once() {
        let (connector, mut stream) = stream_of(7, 3).await;
        let mut sizes = Vec::new();
        while let Some(batch) = stream.next_batch().await.unwrap() {
            sizes.push(batch.len());
        }
        assert_eq!(sizes, vec![3, 3, 1]);
        assert!(stream.next_batch().await.unwrap().is_none());
        assert_eq!(connector.stats().closes, 1);
    }

    #[tokio::test]
    async fn exact_multiples_end_without_an_empty_batch() {
        let (connector, stream) = stream_of(6, 3).await;
        let all = stream.collect_all().await.unwrap();
        assert_eq!(all, (0..6).collect::<Vec<_>>());
        assert_eq!(connector.stats().closes, 1);
    }

    #[tokio::test]
    async fn early_release_closes_reader_and_connection() {
        let (connector, mut stream) = stream_of(10, 2).await;
        assert_eq!(stream.next_batch().await.unwrap().map(|b| b.len()), Some(2));
        stream.release().await.unwrap();
        let stats = connector.stats();
        assert_eq!(stats.closes, 1);
        assert_eq!(stats.readers_opened, stats.readers_closed);
    }

    #[tokio::test]
    async fn dropping_mid_stream_closes_in_the_background() {
        let (connector, mut stream) = stream_of(10, 2).await;
        assert!(stream.next_batch().await.unwrap().is_some());
        drop(stream);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let stats = connector.stats();
        assert_eq!(stats.closes, 1);
        assert_eq!(stats.dropped_open, 0);
        assert_eq!(stats.readers_opened, stats.readers_closed);
    }
}
