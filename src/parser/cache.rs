use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, trace};

use super::compile::{CompiledParser, compile_with};
use super::{FromRecord, TypeConfig};
use super::schema::SchemaKey;
use crate::command::CacheStats;
use crate::driver::NativeColumn;
use crate::error::SqlEngineError;
use crate::fingerprint::OperationFingerprint;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ParserKey {
    fingerprint: OperationFingerprint,
    result_index: usize,
    target: TypeId,
    schema: SchemaKey,
}

type Entry = Arc<dyn Any + Send + Sync>;

/// Parsers keyed by fingerprint, result position, target type and the
/// schema the driver reported.
#[derive(Default)]
pub struct ParserCache {
    entries: RwLock<HashMap<ParserKey, Entry>>,
    compilations: AtomicU64,
    hits: AtomicU64,
}

impl std::fmt::Debug for ParserCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParserCache")
            .field("stats", &self.stats())
            .finish()
    }
}

impl ParserCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Published parser for the given result, compiling it on a miss.
    ///
    /// `config` only matters on a miss; callers that change a type's
    /// configuration clear the cache.
    ///
    /// # Errors
    /// Propagates schema errors from compilation; nothing is cached then.
    pub fn get_or_compile<T: FromRecord>(
        &self,
        fingerprint: &OperationFingerprint,
        result_index: usize,
        columns: &[NativeColumn],
        strict: bool,
        chunk_size: usize,
        config: Option<&TypeConfig>,
    ) -> Result<Arc<CompiledParser<T>>, SqlEngineError> {
        let key = ParserKey {
            fingerprint: fingerprint.clone(),
            result_index,
            target: TypeId::of::<T>(),
            schema: SchemaKey::of(columns),
        };
        let cached = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned();
        if let Some(found) = cached.and_then(|e| e.downcast::<CompiledParser<T>>().ok()) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            trace!(digest = fingerprint.digest(), result_index, "parser cache hit");
            return Ok(found);
        }

        debug!(digest = fingerprint.digest(), result_index, "parser cache miss");
        let compiled: Entry = Arc::new(compile_with::<T>(
            fingerprint.provider(),
            columns,
            strict,
            chunk_size,
            config,
        )?);
        self.compilations.fetch_add(1, Ordering::Relaxed);

        let published = {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(entries.entry(key).or_insert(compiled))
        };
        published
            .downcast::<CompiledParser<T>>()
            .map_err(|_| SqlEngineError::Other("parser cache entry has an unexpected type".into()))
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.compilations.store(0, Ordering::Relaxed);
        self.hits.store(0, Ordering::Relaxed);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            compilations: self.compilations.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::thread;

    use super::*;
    use crate::driver::ColumnType;
    use crate::fingerprint::{Behavior, ShapeId};
    use crate::types::DatabaseType;

    fn fingerprint() -> OperationFingerprint {
        OperationFingerprint::new(
            DatabaseType::Mysql,
            "SELECT id, name FROM t WHERE id = @id",
            ShapeId::Empty,
            Behavior::reader(),
        )
    }

    #[test]
    fn concurrent_compiles_publish_once() {
        const THREADS: usize = 6;
        let cache = ParserCache::new();
        let fp = fingerprint();
        let columns = vec![NativeColumn::new("id", ColumnType::Int64)];
        let barrier = Barrier::new(THREADS);
        let (cache_ref, fp_ref, columns_ref, barrier_ref) = (&cache, &fp, &columns, &barrier);

        let parsers: Vec<Arc<CompiledParser<i64>>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    scope.spawn(move || {
                        barrier_ref.wait();
                        cache_ref
                            .get_or_compile::<i64>(fp_ref, 0, columns_ref, false, 64, None)
                            .unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(cache.len(), 1);
        assert!(cache.stats().compilations <= THREADS as u64);
        assert!(parsers.iter().all(|p| Arc::ptr_eq(p, &parsers[0])));
    }

    #[test]
    fn result_position_type_and_schema_are_part_of_the_key() {
        let cache = ParserCache::new();
        let fp = fingerprint();
        let ints = vec![NativeColumn::new("id", ColumnType::Int64)];
        let texts = vec![NativeColumn::new("id", ColumnType::Text)];

        cache.get_or_compile::<i64>(&fp, 0, &ints, false, 64, None).unwrap();
        cache.get_or_compile::<i64>(&fp, 0, &ints, false, 64, None).unwrap();
        assert_eq!(cache.stats().hits, 1);

        cache.get_or_compile::<i64>(&fp, 1, &ints, false, 64, None).unwrap();
        cache.get_or_compile::<String>(&fp, 0, &ints, false, 64, None).unwrap();
        cache.get_or_compile::<i64>(&fp, 0, &texts, false, 64, None).unwrap();
        assert_eq!(cache.len(), 4);

        let upper = vec![NativeColumn::new("ID", ColumnType::Int64)];
        cache.get_or_compile::<i64>(&fp, 0, &upper, false, 64, None).unwrap();
        assert_eq!(cache.len(), 4);
        let mut nullable = ints.clone();
        nullable[0].allow_null = true;
        cache.get_or_compile::<i64>(&fp, 0, &nullable, false, 64, None).unwrap();
        assert_eq!(cache.len(), 5);

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn schema_errors_are_not_cached() {
        let cache = ParserCache::new();
        let blobs = vec![NativeColumn::new("id", ColumnType::Binary)];
        for _ in 0..2 {
            assert!(
                cache
                    .get_or_compile::<chrono::NaiveDate>(&fingerprint(), 0, &blobs, false, 64, None)
                    .is_err()
            );
        }
        assert!(cache.is_empty());
    }
}
