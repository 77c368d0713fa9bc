use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, trace};

use super::BindSource;
use super::compile::{CompiledCommand, compile};
use crate::config::EngineOptions;
use crate::error::SqlEngineError;
use crate::fingerprint::OperationFingerprint;
use crate::provider::ProviderProfile;

type Entry = Arc<dyn Any + Send + Sync>;

/// Counters for a compiled cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub compilations: u64,
    pub hits: u64,
}

/// Fingerprint-keyed map of compiled bind routines.
///
/// Lookups take the read lock only. Compilation runs outside any lock and the
/// first insert for a key wins; a thread that loses the race drops its own
/// result and returns the published one.
#[derive(Default)]
pub struct CommandCache {
    entries: RwLock<HashMap<(OperationFingerprint, TypeId), Entry>>,
    compilations: AtomicU64,
    hits: AtomicU64,
}

impl std::fmt::Debug for CommandCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandCache")
            .field("stats", &self.stats())
            .finish()
    }
}

impl CommandCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Published entry for `fingerprint`, compiling it from `source` on a miss.
    ///
    /// # Errors
    /// Propagates validation and compilation errors; nothing is cached then.
    pub fn get_or_compile<S: BindSource>(
        &self,
        fingerprint: &OperationFingerprint,
        profile: &Arc<dyn ProviderProfile>,
        source: &S,
        options: &EngineOptions,
    ) -> Result<Arc<CompiledCommand<S>>, SqlEngineError> {
        let key = (fingerprint.clone(), TypeId::of::<S>());
        if let Some(found) = self.lookup::<S>(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            trace!(digest = fingerprint.digest(), "command cache hit");
            return Ok(found);
        }

        debug!(digest = fingerprint.digest(), "command cache miss");
        let compiled: Entry = Arc::new(compile(fingerprint, Arc::clone(profile), source, options)?);
        self.compilations.fetch_add(1, Ordering::Relaxed);

        let published = {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(entries.entry(key).or_insert(compiled))
        };
        published
            .downcast::<CompiledCommand<S>>()
            .map_err(|_| SqlEngineError::Other("command cache entry has an unexpected type".into()))
    }

    fn lookup<S: BindSource>(
        &self,
        key: &(OperationFingerprint, TypeId),
    ) -> Option<Arc<CompiledCommand<S>>> {
        let entry = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()?;
        entry.downcast::<CompiledCommand<S>>().ok()
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
    use crate::command::{BindSource, ParamList};
    use crate::fingerprint::Behavior;
    use crate::provider::{PostgresProfile, SqliteProfile};
    use crate::types::{DatabaseType, RowValues};

    #[test]
    fn concurrent_requests_publish_one_entry() {
        const THREADS: usize = 8;
        let cache = CommandCache::new();
        let profile: Arc<dyn ProviderProfile> = Arc::new(PostgresProfile::new());
        let options = EngineOptions::default();
        let params = ParamList::new().add("id", 7_i64);
        let fp = OperationFingerprint::new(
            DatabaseType::Postgres,
            "select * from t where id = @id",
            params.shape_id(),
            Behavior::reader(),
        );
        let barrier = Barrier::new(THREADS);
        let (cache_ref, fp_ref, barrier_ref) = (&cache, &fp, &barrier);
        let (profile_ref, params_ref, options_ref) = (&profile, &params, &options);

        let results: Vec<Arc<CompiledCommand<ParamList>>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    scope.spawn(move || {
                        barrier_ref.wait();
                        cache_ref
                            .get_or_compile(fp_ref, profile_ref, params_ref, options_ref)
                            .unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert!(stats.compilations >= 1 && stats.compilations <= THREADS as u64);
        for compiled in &results {
            assert_eq!(compiled.script(), "select * from t where id = $1");
            let cmd = compiled.bind(&params, None, None).unwrap();
            assert_eq!(cmd.parameters[0].value, RowValues::Int(7));
        }
    }

    #[test]
    fn hits_skip_compilation() {
        let cache = CommandCache::new();
        let profile: Arc<dyn ProviderProfile> = Arc::new(SqliteProfile::new());
        let options = EngineOptions::default();
        let fp = OperationFingerprint::new(
            DatabaseType::Sqlite,
            "select 1",
            crate::fingerprint::ShapeId::Empty,
            Behavior::scalar(),
        );
        let first = cache.get_or_compile(&fp, &profile, &(), &options).unwrap();
        let second = cache.get_or_compile(&fp, &profile, &(), &options).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.stats().compilations, 1);
        assert_eq!(cache.stats().hits, 1);

        // same fingerprint, different source type
        let list = cache
            .get_or_compile(&fp, &profile, &ParamList::new(), &options)
            .unwrap();
        assert_eq!(list.script(), "select 1");
        assert_eq!(cache.len(), 2);

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn validation_failures_are_not_cached() {
        let cache = CommandCache::new();
        let profile: Arc<dyn ProviderProfile> = Arc::new(SqliteProfile::new());
        let fp = OperationFingerprint::new(
            DatabaseType::Sqlite,
            "select * from t where id = @id",
            crate::fingerprint::ShapeId::Empty,
            Behavior::reader(),
        );
        for _ in 0..2 {
            assert!(
                cache
                    .get_or_compile(&fp, &profile, &(), &EngineOptions::default())
                    .is_err()
            );
        }
        assert!(cache.is_empty());
        assert_eq!(cache.stats().compilations, 0);
    }
}
