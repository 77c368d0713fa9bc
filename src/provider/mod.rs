//! Provider Profile Registry.
//!
//! One [`ProviderProfile`] per dialect carries everything that differs
//! between backends: bind codes, marker styles, paging and procedure-call
//! text, cursor style and cancellation messages. Profiles are selected once
//! when a command is compiled and never branched on again afterwards.

mod profiles;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use crate::command::ParameterSpec;
use crate::conversion::{InputConverter, try_input_converter};
use crate::driver::{CommandType, NativeCommand, NativeParameter};
use crate::error::SqlEngineError;
use crate::types::{DatabaseType, RowValues, ValueType};

pub use profiles::{MssqlProfile, MysqlProfile, OracleProfile, PostgresProfile, SqliteProfile};

/// Provider-specific bind type code (`SqlDbType`, OID, `OracleDbType`, ...).
pub type ProviderTypeCode = i32;

/// Marker syntax the native driver consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarkerStyle {
    /// `@P1`, `@P2` (tiberius)
    AtPNumbered,
    /// `?` bound strictly by position (mysql)
    Anonymous,
    /// `$1`, `$2` (postgres)
    DollarNumbered,
    /// `?1`, `?2` (sqlite)
    QuestionNumbered,
    /// `:name` (oracle)
    ColonNamed,
}

impl MarkerStyle {
    /// Native marker text for the parameter at 1-based `position`.
    #[must_use]
    pub fn render(self, name: &str, position: usize) -> String {
        match self {
            MarkerStyle::AtPNumbered => format!("@P{position}"),
            MarkerStyle::Anonymous => "?".to_string(),
            MarkerStyle::DollarNumbered => format!("${position}"),
            MarkerStyle::QuestionNumbered => format!("?{position}"),
            MarkerStyle::ColonNamed => format!(":{name}"),
        }
    }

    /// Whether every occurrence of a marker needs its own bind slot.
    #[must_use]
    pub fn binds_by_occurrence(self) -> bool {
        matches!(self, MarkerStyle::Anonymous)
    }
}

/// How a dialect hands back several result sets from one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CursorStyle {
    /// Result sets arrive inline, one after the other.
    MultipleResultSets,
    /// A function returns cursor names that must be fetched inside a transaction.
    RefCursorFetch,
    /// Each cursor is an explicit output parameter of the procedure.
    OutputRefCursor,
}

/// Byte layout of a 16-byte identifier stored as raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuidByteOrder {
    BigEndian,
    /// First three groups little-endian (`RAW(16)` written from a .NET-style guid).
    MixedEndian,
}

impl GuidByteOrder {
    #[must_use]
    pub fn for_provider(provider: DatabaseType) -> Self {
        match provider {
            DatabaseType::Oracle => GuidByteOrder::MixedEndian,
            _ => GuidByteOrder::BigEndian,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingStyle {
    LimitOffset,
    OffsetFetch,
}

/// Static capability flags of one provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    pub supports_prepare: bool,
    /// Prefix characters callers may use for named markers.
    pub marker_prefixes: &'static [char],
    pub native_marker: MarkerStyle,
    pub cursor_style: CursorStyle,
    pub paging_style: PagingStyle,
    /// Whether bind parameters are accepted on multi-statement anonymous blocks.
    pub params_in_anonymous_block: bool,
    pub supports_output_params: bool,
    pub supports_stored_procedures: bool,
    pub guid_byte_order: GuidByteOrder,
}

/// Per-dialect facts consumed by the compiled caches and the session engine.
pub trait ProviderProfile: Send + Sync + fmt::Debug {
    fn database_type(&self) -> DatabaseType;

    fn capabilities(&self) -> &Capabilities;

    /// Native bind code for `value_type`; `None` means the provider cannot
    /// bind the type at all.
    fn type_code(&self, value_type: ValueType) -> Option<ProviderTypeCode>;

    /// Column type name used when the engine has to declare a variable.
    fn type_name(
        &self,
        value_type: ValueType,
        size: Option<u32>,
        precision: Option<u8>,
        scale: Option<u8>,
    ) -> String;

    /// Clause appended to a query when paging was requested. Markers are in
    /// caller style and are rewritten with the rest of the script.
    fn paging_clause(&self, offset_marker: &str, limit_marker: &str) -> String {
        match self.capabilities().paging_style {
            PagingStyle::LimitOffset => format!(" LIMIT {limit_marker} OFFSET {offset_marker}"),
            PagingStyle::OffsetFetch => {
                format!(" OFFSET {offset_marker} ROWS FETCH NEXT {limit_marker} ROWS ONLY")
            }
        }
    }

    /// Call text for a stored procedure, using caller-style markers.
    fn procedure_call(&self, name: &str, specs: &[ParameterSpec]) -> String;

    /// Statement that reads every row of an open named cursor.
    fn cursor_fetch(&self, cursor: &str) -> String {
        format!("FETCH ALL FROM \"{}\"", cursor.replace('"', "\"\""))
    }

    /// Substrings of driver messages that mean "cancelled by request".
    fn cancellation_markers(&self) -> &'static [&'static str];

    /// Caller-style marker for a named parameter.
    fn marker(&self, name: &str) -> String {
        let prefix = self
            .capabilities()
            .marker_prefixes
            .first()
            .copied()
            .unwrap_or('@');
        format!("{prefix}{name}")
    }

    fn input_converter(&self, value_type: ValueType) -> Option<InputConverter> {
        try_input_converter(self.database_type(), value_type)
    }

    fn new_command(&self, script: Arc<str>, command_type: CommandType) -> NativeCommand {
        let mut command = NativeCommand::text(script);
        command.command_type = command_type;
        command
    }

    /// Native parameter for `spec` at 1-based `position`.
    fn new_parameter(&self, spec: &ParameterSpec, value: RowValues, position: usize) -> NativeParameter {
        NativeParameter {
            name: spec.name.clone(),
            marker: self
                .capabilities()
                .native_marker
                .render(spec.bind_name(), position),
            value,
            direction: spec.direction,
            value_type: spec.value_type,
            type_code: spec.type_code,
            size: spec.size,
            precision: spec.precision,
            scale: spec.scale,
        }
    }

    /// Whether a driver message describes a cancelled operation.
    fn is_cancellation_message(&self, message: &str) -> bool {
        self.cancellation_markers()
            .iter()
            .any(|marker| message.contains(marker))
    }
}

/// Built-in profile for `provider`.
#[must_use]
pub fn builtin_profile(provider: DatabaseType) -> Arc<dyn ProviderProfile> {
    match provider {
        DatabaseType::Mssql => Arc::new(MssqlProfile::new()),
        DatabaseType::Mysql => Arc::new(MysqlProfile::new()),
        DatabaseType::Postgres => Arc::new(PostgresProfile::new()),
        DatabaseType::Oracle => Arc::new(OracleProfile::new()),
        DatabaseType::Sqlite => Arc::new(SqliteProfile::new()),
    }
}

/// Process-wide table of registered profiles.
#[derive(Default)]
pub struct ProviderRegistry {
    profiles: RwLock<HashMap<DatabaseType, Arc<dyn ProviderProfile>>>,
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let profiles = self.profiles.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("ProviderRegistry")
            .field("registered", &profiles.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ProviderRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in profile registered.
    #[must_use]
    pub fn with_builtin() -> Self {
        let registry = Self::new();
        {
            let mut profiles = registry
                .profiles
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            for provider in DatabaseType::ALL {
                profiles.insert(provider, builtin_profile(provider));
            }
        }
        registry
    }

    /// Register the built-in profile for `provider`, returning the profile
    /// already registered if there is one.
    #[must_use]
    pub fn register(&self, provider: DatabaseType) -> Arc<dyn ProviderProfile> {
        let mut profiles = self.profiles.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(profiles.entry(provider).or_insert_with(|| {
            tracing::debug!(provider = %provider, "registered built-in provider profile");
            builtin_profile(provider)
        }))
    }

    /// Register a custom profile.
    ///
    /// # Errors
    /// Returns `SqlEngineError::DuplicateProvider` when a profile for the same
    /// provider is already registered.
    pub fn register_profile(
        &self,
        profile: Arc<dyn ProviderProfile>,
    ) -> Result<Arc<dyn ProviderProfile>, SqlEngineError> {
        let provider = profile.database_type();
        let mut profiles = self.profiles.write().unwrap_or_else(PoisonError::into_inner);
        if profiles.contains_key(&provider) {
            return Err(SqlEngineError::DuplicateProvider(provider));
        }
        profiles.insert(provider, Arc::clone(&profile));
        tracing::debug!(provider = %provider, "registered custom provider profile");
        Ok(profile)
    }

    /// # Errors
    /// Returns `SqlEngineError::ProviderNotRegistered` if nothing was
    /// registered for `provider`.
    pub fn resolve(&self, provider: DatabaseType) -> Result<Arc<dyn ProviderProfile>, SqlEngineError> {
        self.profiles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&provider)
            .cloned()
            .ok_or(SqlEngineError::ProviderNotRegistered(provider))
    }

    #[must_use]
    pub fn is_registered(&self, provider: DatabaseType) -> bool {
        self.profiles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&provider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_requires_registration() {
        let registry = ProviderRegistry::new();
        assert!(matches!(
            registry.resolve(DatabaseType::Mysql),
            Err(SqlEngineError::ProviderNotRegistered(DatabaseType::Mysql))
        ));
        let _ = registry.register(DatabaseType::Mysql);
        assert_eq!(
            registry.resolve(DatabaseType::Mysql).unwrap().database_type(),
            DatabaseType::Mysql
        );
    }

    #[test]
    fn builtin_registration_is_idempotent() {
        let registry = ProviderRegistry::new();
        let first = registry.register(DatabaseType::Postgres);
        let second = registry.register(DatabaseType::Postgres);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn custom_profile_over_existing_is_a_duplicate() {
        let registry = ProviderRegistry::with_builtin();
        let err = registry
            .register_profile(Arc::new(SqliteProfile::new()))
            .unwrap_err();
        assert!(matches!(err, SqlEngineError::DuplicateProvider(DatabaseType::Sqlite)));

        let empty = ProviderRegistry::new();
        assert!(empty.register_profile(Arc::new(SqliteProfile::new())).is_ok());
        assert!(empty.is_registered(DatabaseType::Sqlite));
    }

    #[test]
    fn markers_render_in_native_style() {
        assert_eq!(MarkerStyle::AtPNumbered.render("id", 2), "@P2");
        assert_eq!(MarkerStyle::DollarNumbered.render("id", 1), "$1");
        assert_eq!(MarkerStyle::QuestionNumbered.render("id", 3), "?3");
        assert_eq!(MarkerStyle::ColonNamed.render("id", 3), ":id");
        assert_eq!(MarkerStyle::Anonymous.render("id", 3), "?");
    }
}
