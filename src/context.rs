//! Process-wide engine state: provider registry, both compiled caches and
//! per-type column configuration.
//!
//! The session engine receives an `Arc<EngineContext>` rather than reaching
//! for globals, so tests can run against an isolated context.
//! [`EngineContext::shared`] is the default instance used by
//! [`Database`](crate::executor::Database) handles that were not given one.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use lazy_static::lazy_static;
use tracing::debug;

use crate::command::{BindSource, CommandCache, CompiledCommand};
use crate::config::EngineOptions;
use crate::error::SqlEngineError;
use crate::fingerprint::{Behavior, OperationFingerprint};
use crate::parser::{CompiledParser, FromRecord, ParserCache, TypeConfig};
use crate::provider::{ProviderProfile, ProviderRegistry};
use crate::types::DatabaseType;

lazy_static! {
    static ref SHARED: Arc<EngineContext> = Arc::new(EngineContext::default());
}

#[derive(Debug)]
pub struct EngineContext {
    registry: ProviderRegistry,
    commands: CommandCache,
    parsers: ParserCache,
    type_configs: RwLock<HashMap<TypeId, Arc<TypeConfig>>>,
    options: EngineOptions,
}

impl Default for EngineContext {
    fn default() -> Self {
        Self::assemble(ProviderRegistry::with_builtin(), EngineOptions::default())
    }
}

impl EngineContext {
    /// Context with every built-in provider registered.
    ///
    /// # Errors
    /// Returns `SqlEngineError::ConfigError` if `options` are invalid.
    pub fn new(options: EngineOptions) -> Result<Self, SqlEngineError> {
        Self::with_registry(ProviderRegistry::with_builtin(), options)
    }

    /// Context over a caller-built registry.
    ///
    /// # Errors
    /// Returns `SqlEngineError::ConfigError` if `options` are invalid.
    pub fn with_registry(
        registry: ProviderRegistry,
        options: EngineOptions,
    ) -> Result<Self, SqlEngineError> {
        options.validate()?;
        Ok(Self::assemble(registry, options))
    }

    fn assemble(registry: ProviderRegistry, options: EngineOptions) -> Self {
        Self {
            registry,
            commands: CommandCache::new(),
            parsers: ParserCache::new(),
            type_configs: RwLock::new(HashMap::new()),
            options,
        }
    }

    /// The process-wide default context.
    #[must_use]
    pub fn shared() -> Arc<EngineContext> {
        Arc::clone(&SHARED)
    }

    #[must_use]
    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    #[must_use]
    pub fn commands(&self) -> &CommandCache {
        &self.commands
    }

    #[must_use]
    pub fn parsers(&self) -> &ParserCache {
        &self.parsers
    }

    #[must_use]
    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// # Errors
    /// Returns `SqlEngineError::ProviderNotRegistered` for an unknown provider.
    pub fn profile(&self, provider: DatabaseType) -> Result<Arc<dyn ProviderProfile>, SqlEngineError> {
        self.registry.resolve(provider)
    }

    /// Register column configuration for `T`. Parsers compiled earlier are
    /// dropped so the next read picks it up.
    pub fn configure_type<T: FromRecord>(&self, config: TypeConfig) {
        self.type_configs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(TypeId::of::<T>(), Arc::new(config));
        self.parsers.clear();
    }

    #[must_use]
    pub fn type_config<T: FromRecord>(&self) -> Option<Arc<TypeConfig>> {
        self.type_configs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&TypeId::of::<T>())
            .cloned()
    }

    /// Compiled command for `script` run with `source` under `behavior`.
    ///
    /// # Errors
    /// Propagates registry, validation and compilation errors.
    pub fn command<S: BindSource>(
        &self,
        provider: DatabaseType,
        script: &str,
        source: &S,
        behavior: Behavior,
    ) -> Result<Arc<CompiledCommand<S>>, SqlEngineError> {
        let profile = self.profile(provider)?;
        let fingerprint = OperationFingerprint::new(provider, script, source.shape_id(), behavior);
        self.commands
            .get_or_compile(&fingerprint, &profile, source, &self.options)
    }

    /// Compiled parser for result set `result_index` of `fingerprint`.
    ///
    /// # Errors
    /// Propagates schema errors from compilation.
    pub fn parser<T: FromRecord>(
        &self,
        fingerprint: &OperationFingerprint,
        result_index: usize,
        columns: &[crate::driver::NativeColumn],
        strict: bool,
    ) -> Result<Arc<CompiledParser<T>>, SqlEngineError> {
        let config = self.type_config::<T>();
        self.parsers.get_or_compile::<T>(
            fingerprint,
            result_index,
            columns,
            strict,
            self.options.lob_chunk_size,
            config.as_deref(),
        )
    }

    /// Drop both compiled caches and all type configuration. Meant for test
    /// isolation.
    pub fn clear(&self) {
        self.commands.clear();
        self.parsers.clear();
        self.type_configs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        debug!("engine context cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ParamList;
    use crate::driver::{ColumnType, NativeColumn};

    #[test]
    fn identical_operations_share_one_compiled_command() {
        let ctx = EngineContext::default();
        let a = ParamList::new().add("id", 1_i64);
        let b = ParamList::new().add("id", 2_i64);
        let script = "select * from t where id = @id";
        let first = ctx
            .command(DatabaseType::Sqlite, script, &a, Behavior::reader())
            .unwrap();
        let second = ctx
            .command(DatabaseType::Sqlite, script, &b, Behavior::reader())
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(ctx.commands().stats().compilations, 1);
    }

    #[test]
    fn clear_drops_caches_and_type_configuration() {
        let ctx = EngineContext::default();
        let fp = OperationFingerprint::new(
            DatabaseType::Postgres,
            "select 1",
            crate::fingerprint::ShapeId::Empty,
            Behavior::scalar(),
        );
        let columns = [NativeColumn::new("one", ColumnType::Int32)];
        ctx.parser::<i64>(&fp, 0, &columns, false).unwrap();
        ctx.command(DatabaseType::Postgres, "select 1", &(), Behavior::scalar())
            .unwrap();
        ctx.configure_type::<i64>(TypeConfig::new());
        assert!(ctx.parsers().is_empty());
        assert!(ctx.type_config::<i64>().is_some());

        ctx.parser::<i64>(&fp, 0, &columns, false).unwrap();
        ctx.clear();
        assert!(ctx.commands().is_empty());
        assert!(ctx.parsers().is_empty());
        assert!(ctx.type_config::<i64>().is_none());
    }

    #[test]
    fn invalid_options_are_rejected() {
        let options = EngineOptions::default().with_lob_chunk_size(0);
        assert!(matches!(
            EngineContext::new(options),
            Err(SqlEngineError::ConfigError(_))
        ));
    }

    #[test]
    fn unregistered_providers_fail_resolution() {
        let ctx = EngineContext::with_registry(ProviderRegistry::new(), EngineOptions::default())
            .unwrap();
        assert!(matches!(
            ctx.command(DatabaseType::Mysql, "select 1", &(), Behavior::scalar()),
            Err(SqlEngineError::ProviderNotRegistered(DatabaseType::Mysql))
        ));
    }
}
